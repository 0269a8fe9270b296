//! In-process relay.
//!
//! Stores every published event, replays stored events to new
//! subscriptions and fans new events out to matching live subscriptions.
//! Clones share the same relay.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::client::{EventStream, RelayClient, RelayConnector};
use crate::event::{Event, Filter};
use crate::{RelayError, Result};

struct Subscription {
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<Event>,
}

impl Subscription {
    fn wants(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    subscriptions: Vec<Subscription>,
    subscribe_calls: usize,
    last_filters: Vec<Filter>,
    failing_connects: usize,
    connected: bool,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<State>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event, in publish order.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().expect("lock poisoned").events.clone()
    }

    /// Stored events matching `filter`.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        self.state
            .lock()
            .expect("lock poisoned")
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Number of subscriptions whose stream is still alive.
    pub fn subscription_count(&self) -> usize {
        let mut state = self.state.lock().expect("lock poisoned");
        state.subscriptions.retain(|s| !s.sender.is_closed());
        state.subscriptions.len()
    }

    /// Total number of `subscribe` calls.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().expect("lock poisoned").subscribe_calls
    }

    /// Filters of the most recent subscription.
    pub fn last_filters(&self) -> Vec<Filter> {
        self.state.lock().expect("lock poisoned").last_filters.clone()
    }

    /// End every live subscription, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        self.state.lock().expect("lock poisoned").subscriptions.clear();
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: usize) {
        self.state.lock().expect("lock poisoned").failing_connects = count;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("lock poisoned").connected
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RelayError::Connection("memory relay refused connection".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<EventStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("lock poisoned");
        for event in state.events.iter().filter(|e| filters.iter().any(|f| f.matches(e))) {
            let _ = sender.send(event.clone());
        }
        state.subscribe_calls += 1;
        state.last_filters = filters.clone();
        state.subscriptions.push(Subscription { filters, sender });

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
        .boxed())
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        event.verify()?;
        let mut state = self.state.lock().expect("lock poisoned");
        if state.events.iter().any(|e| e.id == event.id) {
            debug!(event_id = %event.id, "duplicate event");
            return Ok(());
        }
        state.events.push(event.clone());
        state
            .subscriptions
            .retain(|s| !s.wants(event) || s.sender.send(event.clone()).is_ok());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().expect("lock poisoned").connected = false;
        Ok(())
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn open(&self, _relays: &[Url]) -> Result<Arc<dyn RelayClient>> {
        Ok(Arc::new(self.clone()))
    }
}
