//! Core protocol types and bus transport for the Tandem SFC orchestrator.
//!
//! Everything a control-plane role needs in order to participate in the system lives
//! here: the pub/sub bus transport, the reply-queue RPC convention layered on top of it,
//! the typed wire messages exchanged between roles, and the service chain model itself.
//! The roles themselves live in the `tandemd` binary.

pub mod bus;
pub mod chain;
pub mod client;
pub mod error;
pub mod msg;
pub mod rpc;
pub mod utils;

pub use error::AppError;

/// Fanout topic consumed by the orchestrator (NFVO).
pub const TOPIC_NFVO: &str = "nfvo-exchange";
/// Fanout topic consumed by the VNF lifecycle manager (VNFM).
pub const TOPIC_VNFM: &str = "vnfm-exchange";
/// Fanout topic consumed by the infrastructure manager (VIM).
pub const TOPIC_VIM: &str = "vim-exchange";
/// Fanout topic consumed by the gateway data plane.
pub const TOPIC_GATEWAY: &str = "nfv-gateway-exchange";
/// Fanout topic consumed by external traffic forwarders, used only for deletion pruning.
pub const TOPIC_FORWARDER: &str = "fwd-exchange";
/// Fanout topic carrying per-member control messages to VNF workloads.
pub const TOPIC_VNF_CONTROL: &str = "vnf-control";
