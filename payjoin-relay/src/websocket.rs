//! WebSocket relay client.
//!
//! Speaks the NIP-01 client protocol (`REQ`, `EVENT`, `CLOSE` out; `EVENT`,
//! `EOSE`, `OK`, `NOTICE`, `CLOSED` in) over one connection per relay.
//! Subscriptions are sent to every connected relay and their events merged
//! into one stream, which ends once every connection is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::client::{EventStream, RelayClient, RelayConnector};
use crate::event::{Event, Filter};
use crate::{RelayError, Result};

type Subscriptions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>>;

/// A message from a relay.
#[derive(Debug, PartialEq)]
pub enum RelayMessage {
    Event { subscription: String, event: Event },
    EndOfStoredEvents(String),
    Ok { event_id: String, accepted: bool, message: String },
    Notice(String),
    Closed { subscription: String, message: String },
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Vec<Value> = serde_json::from_str(text)?;
        let str_at = |i: usize| -> Result<String> {
            value
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RelayError::Protocol(format!("malformed relay message: {}", text)))
        };
        match str_at(0)?.as_str() {
            "EVENT" => {
                let event = value
                    .get(2)
                    .cloned()
                    .ok_or_else(|| RelayError::Protocol("EVENT without event".into()))?;
                Ok(Self::Event {
                    subscription: str_at(1)?,
                    event: serde_json::from_value(event)?,
                })
            }
            "EOSE" => Ok(Self::EndOfStoredEvents(str_at(1)?)),
            "OK" => Ok(Self::Ok {
                event_id: str_at(1)?,
                accepted: value.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(3).unwrap_or_default(),
            }),
            "NOTICE" => Ok(Self::Notice(str_at(1)?)),
            "CLOSED" => Ok(Self::Closed {
                subscription: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            other => Err(RelayError::Protocol(format!("unknown relay message {}", other))),
        }
    }
}

fn req_message(subscription: &str, filters: &[Filter]) -> Result<String> {
    let mut message = vec![Value::from("REQ"), Value::from(subscription)];
    for filter in filters {
        message.push(serde_json::to_value(filter)?);
    }
    Ok(Value::Array(message).to_string())
}

fn close_message(subscription: &str) -> String {
    serde_json::json!(["CLOSE", subscription]).to_string()
}

fn event_message(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(&("EVENT", event))?)
}

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Ends every subscription stream once the last reader stops, aborted or not.
struct ReaderGuard {
    live: Arc<AtomicUsize>,
    subscriptions: Subscriptions,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.subscriptions.lock().expect("lock poisoned").clear();
        }
    }
}

/// Closes its subscription on every relay when the stream is dropped.
struct SubscriptionGuard {
    id: String,
    outbound: Vec<mpsc::UnboundedSender<String>>,
    subscriptions: Subscriptions,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.subscriptions
            .lock()
            .expect("lock poisoned")
            .remove(&self.id);
        let close = close_message(&self.id);
        for outbound in &self.outbound {
            let _ = outbound.send(close.clone());
        }
    }
}

pub struct WebSocketRelayClient {
    relays: Vec<Url>,
    connections: tokio::sync::Mutex<Vec<Connection>>,
    subscriptions: Subscriptions,
    live: Arc<AtomicUsize>,
    next_subscription: AtomicU64,
}

impl WebSocketRelayClient {
    pub fn new(relays: Vec<Url>) -> Self {
        Self {
            relays,
            connections: tokio::sync::Mutex::new(Vec::new()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            live: Arc::new(AtomicUsize::new(0)),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn relays(&self) -> &[Url] {
        &self.relays
    }

    fn spawn(&self, relay: Url, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Connection {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = queue.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let subscriptions = self.subscriptions.clone();
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = ReaderGuard {
            live: self.live.clone(),
            subscriptions: subscriptions.clone(),
        };
        let reader = tokio::spawn(async move {
            let _guard = guard;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch(&relay, &text, &subscriptions),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%relay, error = %e, "relay connection lost");
                        break;
                    }
                }
            }
            debug!(%relay, "relay reader stopped");
        });

        Connection {
            outbound,
            reader,
            writer,
        }
    }

    async fn outbound(&self) -> Vec<mpsc::UnboundedSender<String>> {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|c| !c.reader.is_finished())
            .map(|c| c.outbound.clone())
            .collect()
    }
}

fn dispatch(relay: &Url, text: &str, subscriptions: &Subscriptions) {
    match RelayMessage::parse(text) {
        Ok(RelayMessage::Event {
            subscription,
            event,
        }) => {
            let mut subscriptions = subscriptions.lock().expect("lock poisoned");
            if let Some(sender) = subscriptions.get(&subscription) {
                if sender.send(event).is_err() {
                    subscriptions.remove(&subscription);
                }
            }
        }
        Ok(RelayMessage::Ok {
            event_id,
            accepted,
            message,
        }) => {
            if accepted {
                debug!(%relay, %event_id, "event accepted");
            } else {
                warn!(%relay, %event_id, %message, "event rejected");
            }
        }
        Ok(RelayMessage::Notice(notice)) => warn!(%relay, %notice, "relay notice"),
        Ok(RelayMessage::EndOfStoredEvents(subscription)) => {
            debug!(%relay, %subscription, "end of stored events")
        }
        Ok(RelayMessage::Closed {
            subscription,
            message,
        }) => debug!(%relay, %subscription, %message, "subscription closed by relay"),
        Err(e) => debug!(%relay, error = %e, "ignoring relay message"),
    }
}

#[async_trait]
impl RelayClient for WebSocketRelayClient {
    async fn connect(&self) -> Result<()> {
        let mut connections = self.connections.lock().await;
        connections.retain(|c| !c.reader.is_finished());
        if !connections.is_empty() {
            return Ok(());
        }

        let mut last_error = None;
        for relay in &self.relays {
            match connect_async(relay.as_str()).await {
                Ok((socket, _)) => {
                    debug!(%relay, "relay connected");
                    connections.push(self.spawn(relay.clone(), socket));
                }
                Err(e) => {
                    warn!(%relay, error = %e, "relay connection failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        if connections.is_empty() {
            return Err(RelayError::Connection(
                last_error.unwrap_or_else(|| "no relays configured".to_string()),
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<EventStream> {
        let outbound = self.outbound().await;
        if outbound.is_empty() {
            return Err(RelayError::Connection("not connected".into()));
        }

        let id = format!(
            "payjoin-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        let request = req_message(&id, &filters)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .expect("lock poisoned")
            .insert(id.clone(), sender);
        for relay in &outbound {
            let _ = relay.send(request.clone());
        }

        let guard = SubscriptionGuard {
            id,
            outbound,
            subscriptions: self.subscriptions.clone(),
        };
        Ok(futures::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            receiver.recv().await.map(|event| (event, (receiver, guard)))
        })
        .boxed())
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        let outbound = self.outbound().await;
        if outbound.is_empty() {
            return Err(RelayError::Connection("not connected".into()));
        }
        let message = event_message(event)?;
        let sent = outbound
            .iter()
            .filter(|relay| relay.send(message.clone()).is_ok())
            .count();
        if sent == 0 {
            return Err(RelayError::Connection("every relay connection is closed".into()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut connections = self.connections.lock().await;
        for connection in connections.drain(..) {
            drop(connection.outbound);
            connection.reader.abort();
        }
        self.subscriptions.lock().expect("lock poisoned").clear();
        Ok(())
    }
}

impl Drop for WebSocketRelayClient {
    fn drop(&mut self) {
        for connection in self.connections.get_mut().iter() {
            connection.abort();
        }
    }
}

/// Opens a [`WebSocketRelayClient`] per request.
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn open(&self, relays: &[Url]) -> Result<Arc<dyn RelayClient>> {
        if relays.is_empty() {
            return Err(RelayError::InvalidEndpoint(
                "no relays known for this endpoint".into(),
            ));
        }
        Ok(Arc::new(WebSocketRelayClient::new(relays.to_vec())))
    }
}
