//! Operator-facing client API.
//!
//! The library form of the operator console surface: chain creation, deletion and
//! listing, plus a per-module liveness report. Used by the daemon's bootstrap step, by
//! embedders and by tests; everything here is plain RPC-over-bus, so a console front
//! end is a thin loop around this type.

use std::time::Duration;

use anyhow::Result;

use crate::bus::BusConn;
use crate::error::AppError;
use crate::msg::{ChainCatalog, NfvoCmd};
use crate::rpc::{ModuleStatus, RpcClient};
use crate::utils;
use crate::{TOPIC_GATEWAY, TOPIC_NFVO, TOPIC_VIM, TOPIC_VNFM};

/// Chain sizes accepted by the control plane.
pub const CHAIN_SIZE_RANGE: std::ops::RangeInclusive<usize> = 1..=8;

/// The probed control-plane modules and their topics, in reporting order.
pub const MODULES: [(&str, &str); 4] = [
    ("NFVO", TOPIC_NFVO),
    ("VNFM", TOPIC_VNFM),
    ("VIM", TOPIC_VIM),
    ("GATEWAY", TOPIC_GATEWAY),
];

/// An operator handle for driving the control plane.
pub struct OperatorClient {
    /// The connection used for publishing commands.
    conn: BusConn,
    /// RPC handle for the reply-expecting operations.
    rpc: RpcClient,
    /// Deadline applied to catalog listing.
    rpc_timeout: Duration,
    /// Deadline applied to each per-module liveness probe.
    heartbeat_timeout: Duration,
}

impl OperatorClient {
    /// Create a new client on the given connection.
    pub fn new(conn: BusConn, rpc_timeout: Duration, heartbeat_timeout: Duration) -> Self {
        let rpc = RpcClient::new(conn.clone());
        Self {
            conn,
            rpc,
            rpc_timeout,
            heartbeat_timeout,
        }
    }

    /// Request creation of a chain with the given ID and member count.
    ///
    /// The size is validated locally before anything is published; the orchestrator
    /// revalidates on receipt.
    pub fn create_sfc(&self, sfc_id: &str, sfc_size: usize) -> Result<()> {
        if !CHAIN_SIZE_RANGE.contains(&sfc_size) {
            return Err(AppError::InvalidInput(format!("chain size must be in [1,8], got {}", sfc_size)).into());
        }
        let cmd = NfvoCmd::CreateSfc {
            sfc_id: sfc_id.to_string(),
            sfc_size,
        };
        self.conn.publish(TOPIC_NFVO, utils::encode_msg(&cmd)?);
        Ok(())
    }

    /// Request deletion of the chain with the given ID.
    pub fn delete_sfc(&self, sfc_id: &str) -> Result<()> {
        let cmd = NfvoCmd::DeleteSfc { sfc_id: sfc_id.to_string() };
        self.conn.publish(TOPIC_NFVO, utils::encode_msg(&cmd)?);
        Ok(())
    }

    /// Fetch the chain catalog, `None` if the orchestrator does not answer in time.
    pub async fn list_sfc(&mut self) -> Result<Option<ChainCatalog>> {
        let cmd = NfvoCmd::ListSfc {
            return_queue: self.rpc.reply_queue().to_string(),
        };
        self.rpc.call(TOPIC_NFVO, &cmd, self.rpc_timeout).await
    }

    /// Probe every control-plane module, reporting each as up or down.
    pub async fn status(&mut self) -> Vec<(&'static str, ModuleStatus)> {
        let mut report = Vec::with_capacity(MODULES.len());
        for (module, topic) in MODULES {
            let status = self.rpc.heartbeat(topic, self.heartbeat_timeout).await;
            report.push((module, status));
        }
        report
    }
}
