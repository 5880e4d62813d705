//! Named-channel publish/subscribe coordination for the sentinel services.
//!
//! The observer, proposer, and repair agent never call each other directly;
//! they communicate only through this bus and the shared connection
//! registry. The bus owns an in-process transport (an unbounded tokio mpsc
//! queue) and at most one background listener task that dispatches each
//! message to the handler registered for its channel.
//!
//! Lifecycle: `disconnected → connected → listening → disconnected`.
//! `connect` is idempotent so every subscriber can call it defensively, and
//! `start_listening` spawns the listener exactly once. A handler error is
//! logged and never crashes the listener or blocks the next message.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Channel carrying [`crate::models::DriftEvent`] payloads.
pub const DRIFT_DETECTED: &str = "drift_detected";
/// Channel carrying [`crate::models::RepairProposal`] payloads.
pub const REPAIR_PROPOSED: &str = "repair_proposed";
/// Channel carrying [`crate::models::StatusUpdate`] payloads.
pub const STATUS_UPDATE: &str = "status_update";

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Disconnected,
    Connected,
    Listening,
}

struct Envelope {
    channel: String,
    payload: String,
}

pub struct EventBus {
    state: Mutex<BusState>,
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    /// Receiver half, held between `connect` and `start_listening`.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::Disconnected),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Open the transport. Calling this while already connected is a no-op.
    pub fn connect(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != BusState::Disconnected {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);
        *self.rx.lock().unwrap() = Some(rx);
        *state = BusState::Connected;
    }

    /// Register the handler for a channel. At most one handler exists per
    /// channel; a later registration replaces an earlier one. May be called
    /// before or after `connect`/`start_listening`.
    pub fn subscribe<F, Fut>(&self, channel: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |value| Box::pin(handler(value)) as HandlerFuture);
        self.handlers
            .write()
            .unwrap()
            .insert(channel.to_string(), wrapped);
    }

    /// Serialize `message` and enqueue it on `channel`. Does not wait for
    /// any handler to run.
    pub fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                if tx
                    .send(Envelope {
                        channel: channel.to_string(),
                        payload,
                    })
                    .is_err()
                {
                    bail!("Event bus transport is closed");
                }
                Ok(())
            }
            None => bail!("Event bus is not connected"),
        }
    }

    /// Spawn the listener task. Exactly one listener runs per bus instance;
    /// calling this again is a no-op. Connects first if needed.
    pub fn start_listening(&self) {
        self.connect();

        let mut state = self.state.lock().unwrap();
        if *state == BusState::Listening {
            return;
        }

        let rx = self.rx.lock().unwrap().take();
        let Some(mut rx) = rx else {
            // Listener already consumed the receiver in a previous lifecycle.
            return;
        };

        let handlers = Arc::clone(&self.handlers);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let handler = handlers.read().unwrap().get(&envelope.channel).cloned();
                let Some(handler) = handler else {
                    tracing::debug!(channel = %envelope.channel, "no handler subscribed, dropping message");
                    continue;
                };
                let value: Value = match serde_json::from_str(&envelope.payload) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(channel = %envelope.channel, error = %e, "undecodable message dropped");
                        continue;
                    }
                };
                if let Err(e) = handler(value).await {
                    tracing::error!(channel = %envelope.channel, error = %e, "message handler failed");
                }
            }
        });

        *self.listener.lock().unwrap() = Some(handle);
        *state = BusState::Listening;
    }

    /// Cancel the listener, await its termination, and release the
    /// transport. Safe to call even if the bus was never connected.
    pub async fn disconnect(&self) {
        let handle = self.listener.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!(error = %e, "bus listener terminated abnormally"),
            }
        }
        *self.tx.lock().unwrap() = None;
        *self.rx.lock().unwrap() = None;
        *self.state.lock().unwrap() = BusState::Disconnected;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_with_timeout(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("probe channel closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();

        bus.subscribe("greetings", move |value| {
            let probe_tx = probe_tx.clone();
            async move {
                probe_tx.send(value).unwrap();
                Ok(())
            }
        });
        bus.start_listening();

        bus.publish("greetings", &serde_json::json!({"hello": "world"}))
            .unwrap();

        let received = recv_with_timeout(&mut probe_rx).await;
        assert_eq!(received["hello"], "world");
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let bus = EventBus::new();
        bus.connect();
        bus.connect();
        bus.connect();
        assert!(bus.publish("any", &serde_json::json!(1)).is_ok());
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let bus = EventBus::new();
        assert!(bus.publish("any", &serde_json::json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_handler_error_does_not_block_next_message() {
        let bus = EventBus::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();

        bus.subscribe("flaky", move |value| {
            let probe_tx = probe_tx.clone();
            async move {
                if value["n"] == 1 {
                    anyhow::bail!("boom on first message");
                }
                probe_tx.send(value).unwrap();
                Ok(())
            }
        });
        bus.start_listening();

        bus.publish("flaky", &serde_json::json!({"n": 1})).unwrap();
        bus.publish("flaky", &serde_json::json!({"n": 2})).unwrap();

        let received = recv_with_timeout(&mut probe_rx).await;
        assert_eq!(received["n"], 2);
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_block_other_channel() {
        let bus = EventBus::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();

        bus.subscribe("bad", |_value| async { anyhow::bail!("always fails") });
        bus.subscribe("good", move |value| {
            let probe_tx = probe_tx.clone();
            async move {
                probe_tx.send(value).unwrap();
                Ok(())
            }
        });
        bus.start_listening();

        bus.publish("bad", &serde_json::json!({})).unwrap();
        bus.publish("good", &serde_json::json!({"ok": true})).unwrap();

        let received = recv_with_timeout(&mut probe_rx).await;
        assert_eq!(received["ok"], true);
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_last_subscription_wins() {
        let bus = EventBus::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        bus.subscribe("chan", move |value| {
            let first_tx = first_tx.clone();
            async move {
                first_tx.send(value).unwrap();
                Ok(())
            }
        });
        bus.subscribe("chan", move |value| {
            let second_tx = second_tx.clone();
            async move {
                second_tx.send(value).unwrap();
                Ok(())
            }
        });
        bus.start_listening();

        bus.publish("chan", &serde_json::json!({"n": 1})).unwrap();

        let received = recv_with_timeout(&mut second_rx).await;
        assert_eq!(received["n"], 1);
        assert!(first_rx.try_recv().is_err());
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_after_listening_takes_effect() {
        let bus = EventBus::new();
        bus.start_listening();

        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        bus.subscribe("late", move |value| {
            let probe_tx = probe_tx.clone();
            async move {
                probe_tx.send(value).unwrap();
                Ok(())
            }
        });

        bus.publish("late", &serde_json::json!({"n": 7})).unwrap();
        let received = recv_with_timeout(&mut probe_rx).await;
        assert_eq!(received["n"], 7);
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_safe() {
        let bus = EventBus::new();
        bus.disconnect().await;
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_start_listening_twice_spawns_once() {
        let bus = EventBus::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();

        bus.subscribe("once", move |value| {
            let probe_tx = probe_tx.clone();
            async move {
                probe_tx.send(value).unwrap();
                Ok(())
            }
        });
        bus.start_listening();
        bus.start_listening();

        bus.publish("once", &serde_json::json!({"n": 1})).unwrap();
        let received = recv_with_timeout(&mut probe_rx).await;
        assert_eq!(received["n"], 1);
        // A second listener would deliver nothing extra; the queue is drained once.
        assert!(probe_rx.try_recv().is_err());
        bus.disconnect().await;
    }
}
