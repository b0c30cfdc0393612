//! In-process publish/subscribe message bus.
//!
//! The broker supports exactly two delivery patterns, which is all the control plane
//! needs: fanout topics, where every queue bound to the topic receives a copy of each
//! published payload, and point-to-point sends addressed to a queue by name, used for
//! RPC replies. Queues are ephemeral and exclusive: they are owned by the declaring
//! role and deregistered from the broker when dropped.
//!
//! Ordering is FIFO per producer. Delivery is in-process channel delivery, so a message
//! is either enqueued or the broker itself is gone; there is no ack or redelivery layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::utils;

/// Handle to the broker itself.
///
/// Cloning is cheap and every clone addresses the same broker state. Roles interact
/// with the broker through a [`BusConn`] obtained from `connect`, never directly.
#[derive(Clone, Default)]
pub struct Bus {
    state: Arc<BusState>,
}

/// Broker state shared by all connections.
#[derive(Default)]
struct BusState {
    /// All declared queues, keyed by queue name.
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>,
    /// Names of the queues bound to each fanout topic.
    bindings: Mutex<HashMap<String, Vec<String>>>,
}

impl Bus {
    /// Create a new broker with no declared queues or topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> BusConn {
        BusConn { state: self.state.clone() }
    }
}

/// One role's connection to the broker.
#[derive(Clone)]
pub struct BusConn {
    state: Arc<BusState>,
}

impl BusConn {
    /// Declare an ephemeral exclusive queue with an auto-generated name.
    pub fn declare_queue(&self) -> BusQueue {
        loop {
            let name = format!("gen-{}", Uuid::new_v4());
            if let Ok(queue) = self.declare_queue_named(&name) {
                return queue;
            }
        }
    }

    /// Declare an ephemeral exclusive queue with the given name.
    ///
    /// Errors if a queue with the same name is already declared on the broker.
    pub fn declare_queue_named(&self, name: &str) -> Result<BusQueue, AppError> {
        let mut queues = utils::lock(&self.state.queues);
        if queues.contains_key(name) {
            return Err(AppError::InvalidInput(format!("queue '{}' is already declared", name)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(name.to_string(), tx);
        Ok(BusQueue {
            name: name.to_string(),
            rx,
            state: self.state.clone(),
        })
    }

    /// Bind the given queue to a fanout topic, creating the topic on first reference.
    ///
    /// Binding the same queue to the same topic twice is a no-op.
    pub fn bind(&self, queue: &BusQueue, topic: &str) {
        let mut bindings = utils::lock(&self.state.bindings);
        let bound = bindings.entry(topic.to_string()).or_default();
        if !bound.iter().any(|name| name == &queue.name) {
            bound.push(queue.name.clone());
        }
    }

    /// Publish a payload to every queue currently bound to the given topic.
    ///
    /// A topic with no bindings is not an error, the payload is simply dropped.
    pub fn publish(&self, topic: &str, payload: Bytes) {
        let bound = utils::lock(&self.state.bindings).get(topic).cloned().unwrap_or_default();
        if bound.is_empty() {
            tracing::trace!(topic, "publish on topic with no bound queues");
            return;
        }
        let queues = utils::lock(&self.state.queues);
        for name in bound {
            if let Some(tx) = queues.get(&name) {
                let _ = tx.send(payload.clone());
            }
        }
    }

    /// Send a payload directly to the queue with the given name.
    pub fn send_to_queue(&self, name: &str, payload: Bytes) -> Result<(), AppError> {
        let queues = utils::lock(&self.state.queues);
        match queues.get(name) {
            Some(tx) => {
                let _ = tx.send(payload);
                Ok(())
            }
            None => Err(AppError::UnknownQueue(name.to_string())),
        }
    }
}

/// An ephemeral exclusive queue, deregistered from the broker on drop.
pub struct BusQueue {
    /// The broker-visible name of this queue.
    name: String,
    /// The consumer side of the queue.
    rx: mpsc::UnboundedReceiver<Bytes>,
    /// Broker state, needed for deregistration on drop.
    state: Arc<BusState>,
}

impl BusQueue {
    /// The queue's broker-visible name, embedded in reply-expecting request bodies.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next message on this queue, waiting until one arrives.
    ///
    /// Returns `None` only once the broker state holding the producer side has been
    /// torn down.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive the next message on this queue, giving up after the given duration.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }
}

impl Drop for BusQueue {
    fn drop(&mut self) {
        utils::lock(&self.state.queues).remove(&self.name);
        let mut bindings = utils::lock(&self.state.bindings);
        for bound in bindings.values_mut() {
            bound.retain(|name| name != &self.name);
        }
    }
}
