//! Relay client abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use url::Url;

use crate::event::{Event, Filter};
use crate::Result;

/// Events matching a subscription.
///
/// The stream ends when the connection is lost. Dropping it closes the
/// subscription.
pub type EventStream = BoxStream<'static, Event>;

/// A connection to one or more relays.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Connect if not already connected.
    async fn connect(&self) -> Result<()>;

    /// Subscribe to stored and future events matching any of `filters`.
    async fn subscribe(&self, filters: Vec<Filter>) -> Result<EventStream>;

    /// Publish a signed event.
    async fn publish(&self, event: &Event) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Opens relay clients for a list of relays.
///
/// Senders open a fresh client per request, on the relays named by the
/// receiver's endpoint.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, relays: &[Url]) -> Result<Arc<dyn RelayClient>>;
}
