//! Request/reply conventions layered over the bus.
//!
//! A requester owns one ephemeral reply queue for its whole lifetime and embeds the
//! queue's name in every reply-expecting request body. Responders send their reply
//! point-to-point to that queue, bypassing topics. Correlation is by expected reply
//! shape: the caller takes the first queued message that decodes as the expected reply
//! type and skips anything else, such as a stale reply to an earlier timed-out request.
//! The absence of a reply within the deadline is a normal outcome surfaced as `None`,
//! never an error.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::bus::{BusConn, BusQueue};
use crate::utils;

/// The canonical heartbeat acknowledgment, sent as raw bytes rather than JSON.
pub const OK_REPLY: &[u8] = b"ok";

/// Liveness of a single control-plane module as observed by a heartbeat probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// The module acknowledged its heartbeat.
    Up,
    /// The module did not answer in time, or answered with something other than `ok`.
    Down,
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "OK"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

/// A requester-side RPC handle owning one reply queue on the given connection.
pub struct RpcClient {
    /// The connection used for publishing requests.
    conn: BusConn,
    /// This requester's reply queue.
    queue: BusQueue,
}

impl RpcClient {
    /// Create a new RPC client with its own ephemeral reply queue.
    pub fn new(conn: BusConn) -> Self {
        let queue = conn.declare_queue();
        Self { conn, queue }
    }

    /// The name of this client's reply queue, to embed in request bodies.
    pub fn reply_queue(&self) -> &str {
        self.queue.name()
    }

    /// Publish a reply-expecting command and await the first reply decoding as `T`.
    pub async fn call<C, T>(&mut self, topic: &str, cmd: &C, timeout: Duration) -> Result<Option<T>>
    where
        C: Serialize,
        T: DeserializeOwned,
    {
        let payload = utils::encode_msg(cmd)?;
        self.conn.publish(topic, payload);
        Ok(self.wait_for_reply::<T>(timeout).await)
    }

    /// Await the next message on the reply queue, returning `None` on deadline.
    pub async fn wait_for_message(&mut self, timeout: Duration) -> Option<Bytes> {
        self.queue.recv_timeout(timeout).await
    }

    /// Await the first reply decoding as `T`, skipping uncorrelated messages.
    pub async fn wait_for_reply<T: DeserializeOwned>(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = self.queue.recv_timeout(remaining).await?;
            match serde_json::from_slice::<T>(&msg) {
                Ok(reply) => return Some(reply),
                Err(_) => tracing::debug!("skipping uncorrelated message on reply queue"),
            }
        }
    }

    /// Probe the module behind the given topic for liveness.
    ///
    /// Any outcome other than a literal `ok` within the deadline reports the module as
    /// down.
    pub async fn heartbeat(&mut self, topic: &str, timeout: Duration) -> ModuleStatus {
        let probe = HeartbeatCmd {
            action: "heartbeat",
            rqueue: self.queue.name().to_string(),
        };
        let payload = match utils::encode_msg(&probe) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = ?err, "error encoding heartbeat probe");
                return ModuleStatus::Down;
            }
        };
        self.conn.publish(topic, payload);
        match self.wait_for_message(timeout).await {
            Some(body) if body.as_ref() == OK_REPLY => ModuleStatus::Up,
            _ => ModuleStatus::Down,
        }
    }
}

/// The heartbeat probe body, identical for every role's topic.
#[derive(Serialize)]
struct HeartbeatCmd {
    action: &'static str,
    rqueue: String,
}
