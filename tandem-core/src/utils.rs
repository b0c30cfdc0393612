//! Shared utilities.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode the given model as a JSON payload ready to be published on the bus.
pub fn encode_msg<M: Serialize>(model: &M) -> Result<Bytes> {
    let buf = serde_json::to_vec(model).context("error serializing message")?;
    Ok(Bytes::from(buf))
}

/// Decode a message of the given type from the given payload.
pub fn decode_msg<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding message payload")
}

/// Acquire the given lock, disregarding poisoning.
///
/// All state behind these locks is mutated in single-step inserts and removals, so a
/// panic can not leave it torn.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
