//! Gateway (data plane) controller.
//!
//! Terminates client TCP sessions, mirrors every ingress unit to the monitoring sink
//! best-effort, decides which chain handles the unit, forwards it to that chain's
//! first member, and maintains live upstream connections despite chain churn. The
//! gateway learns about chains exclusively from `sfc-creation`/`sfc-delete`
//! announcements on its topic.
//!
//! Concurrency: one task per accepted client connection, one task per outbound member
//! connection attempt, the monitor link's maintain task, and the bus dispatch loop.
//! Shared maps use one lock each, held only for the map operation; sending on an
//! upstream socket is serialized per destination since multiple client handlers may
//! route to the same chain concurrently.


use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::StreamExt;
use rand::seq::IteratorRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::net::{Link, LinkSender};
use tandem_core::bus::{BusConn, BusQueue};
use tandem_core::msg::{GatewayCmd, SfcMember};
use tandem_core::rpc::OK_REPLY;
use tandem_core::{utils, TOPIC_GATEWAY};

/// Read buffer size for client connections; one read is one forwardable unit.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Counter metric: units routed into a chain.
const METRIC_PACKETS_ROUTED: &str = "tandem_gateway_packets_routed";
/// Counter metric: units dropped because no chain was live.
const METRIC_PACKETS_UNROUTED: &str = "tandem_gateway_packets_unrouted";
/// Counter metric: units mirrored to the monitoring sink.
const METRIC_PACKETS_MIRRORED: &str = "tandem_gateway_packets_mirrored";
/// Counter metric: units the monitor link failed to deliver.
const METRIC_MIRROR_FAILURES: &str = "tandem_gateway_mirror_failures";

/// Routing policy deciding which live chain serves a unit of traffic.
pub trait ChainSelector: Send + Sync + 'static {
    /// Pick one of the currently live chains; `None` when none qualify.
    fn select(&self, live: &[String]) -> Option<String>;
}

/// The default routing policy: uniformly pick any live chain.
pub struct UniformRandom;

impl ChainSelector for UniformRandom {
    fn select(&self, live: &[String]) -> Option<String> {
        live.iter().choose(&mut rand::thread_rng()).cloned()
    }
}

/// The connection record of one chain's first member.
#[derive(Default)]
struct ConnectionRecord {
    /// The live upstream socket, `None` while connecting or after a disconnect.
    stream: Option<Arc<tokio::sync::Mutex<TcpStream>>>,
    /// Connect attempts made towards this member so far.
    attempts: u32,
}

/// The local chain catalog: chain ID to its first member's VNF ID.
type ChainMap = Arc<Mutex<HashMap<String, String>>>;
/// Upstream connection records, keyed by member VNF ID.
type ConnMap = Arc<Mutex<HashMap<String, ConnectionRecord>>>;
/// The set of currently connected client peers.
type ClientSet = Arc<Mutex<HashSet<SocketAddr>>>;

/// Shared context handed to every client handler for routing decisions.
#[derive(Clone)]
struct RouteCtx {
    chains: ChainMap,
    connections: ConnMap,
    selector: Arc<dyn ChainSelector>,
    monitor: LinkSender,
}

/// The gateway controller.
pub struct GatewayCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// This controller's bus connection.
    conn: BusConn,
    /// This controller's command queue, bound to the gateway topic.
    queue: BusQueue,
    /// The client-facing listener socket.
    listener: TcpListener,
    /// The monitoring sink link.
    monitor: Link,
    /// Shared routing context.
    ctx: RouteCtx,
    /// The set of currently connected client peers.
    clients: ClientSet,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl GatewayCtl {
    /// Create a new instance, binding the client-facing listener.
    pub async fn new(config: Arc<Config>, conn: BusConn, selector: Arc<dyn ChainSelector>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let queue = conn.declare_queue();
        conn.bind(&queue, TOPIC_GATEWAY);
        let listener = TcpListener::bind(&config.gateway_addr).await.context("error binding gateway listener")?;
        let monitor = Link::spawn(config.monitor_addr.clone(), config.connect_backoff(), METRIC_MIRROR_FAILURES, shutdown_tx.subscribe());
        metrics::register_counter!(METRIC_PACKETS_ROUTED, metrics::Unit::Count, "units routed into a chain");
        metrics::register_counter!(METRIC_PACKETS_UNROUTED, metrics::Unit::Count, "units dropped with no live chain");
        metrics::register_counter!(METRIC_PACKETS_MIRRORED, metrics::Unit::Count, "units mirrored to the monitoring sink");
        metrics::register_counter!(METRIC_MIRROR_FAILURES, metrics::Unit::Count, "units the monitor link failed to deliver");
        let ctx = RouteCtx {
            chains: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            selector,
            monitor: monitor.sender(),
        };
        Ok(Self {
            config,
            conn,
            queue,
            listener,
            monitor,
            ctx,
            clients: Arc::new(Mutex::new(HashSet::new())),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        })
    }

    /// The listener's bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error resolving gateway listener address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("gateway controller has started");

        loop {
            tokio::select! {
                msg_opt = self.queue.recv() => self.handle_bus_msg(msg_opt),
                res = self.listener.accept() => self.handle_accept(res),
                _ = self.shutdown_rx.next() => break,
            }
        }

        self.monitor.shutdown().await;
        tracing::info!("gateway controller has shutdown");
        Ok(())
    }

    /// Handle an inbound message from the gateway topic.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    fn handle_bus_msg(&mut self, msg_opt: Option<Bytes>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _res = self.shutdown_tx.send(());
                return;
            }
        };
        let cmd: GatewayCmd = match utils::decode_msg(&msg) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(error = ?err, "dropping malformed message on gateway topic");
                return;
            }
        };
        match cmd {
            GatewayCmd::SfcCreation { sfc_id, members } => self.handle_sfc_creation(sfc_id, members),
            GatewayCmd::SfcDelete { sfc_id } => self.handle_sfc_delete(sfc_id),
            GatewayCmd::Heartbeat { rqueue } => {
                if let Err(err) = self.conn.send_to_queue(&rqueue, Bytes::from_static(OK_REPLY)) {
                    tracing::warn!(error = ?err, "error replying to heartbeat");
                }
            }
        }
    }

    /// Register a newly announced chain and begin connecting to its first member.
    fn handle_sfc_creation(&mut self, sfc_id: String, members: Vec<SfcMember>) {
        let first = match members.first() {
            Some(first) => first.clone(),
            None => {
                tracing::warn!(sfc_id = %sfc_id, "chain announcement with no members, ignoring");
                return;
            }
        };
        tracing::info!(sfc_id = %sfc_id, first_member = %first.vnf_id, address = %first.address, "chain announced, connecting to first member");
        utils::lock(&self.ctx.chains).insert(sfc_id, first.vnf_id.clone());
        utils::lock(&self.ctx.connections).insert(first.vnf_id.clone(), ConnectionRecord::default());
        tokio::spawn(connect_to_member(
            self.ctx.connections.clone(),
            first.vnf_id,
            first.address,
            self.config.connect_max_attempts,
            self.config.connect_backoff(),
            self.shutdown_tx.subscribe(),
        ));
    }

    /// Drop a deleted chain from the local catalog.
    ///
    /// The member socket is not force-closed: in-flight writers hold the record's
    /// handle and finish; the socket closes when the last handle drops.
    fn handle_sfc_delete(&mut self, sfc_id: String) {
        let member = utils::lock(&self.ctx.chains).remove(&sfc_id);
        match member {
            Some(member) => {
                utils::lock(&self.ctx.connections).remove(&member);
                tracing::info!(sfc_id = %sfc_id, member = %member, "chain pruned from gateway catalog");
            }
            None => tracing::info!(sfc_id = %sfc_id, "delete for unknown chain, ignoring"),
        }
    }

    /// Spawn a handler for a newly accepted client connection.
    fn handle_accept(&mut self, res: std::io::Result<(TcpStream, SocketAddr)>) {
        match res {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "client connected");
                tokio::spawn(serve_client(stream, peer, self.ctx.clone(), self.clients.clone(), self.shutdown_tx.subscribe()));
            }
            Err(err) => tracing::debug!(error = ?err, "error accepting client connection"),
        }
    }
}

/// Connect to a chain member with a bounded number of attempts and a fixed backoff.
///
/// On success the record's handle is installed, unless the chain was deleted while
/// connecting, in which case the fresh socket is discarded rather than resurrected.
/// On exhaustion the record is removed with a logged give-up; the chain stays
/// registered but unreachable and routing to it fails per-unit.
async fn connect_to_member(connections: ConnMap, member_id: String, address: String, max_attempts: u32, backoff: std::time::Duration, mut shutdown: broadcast::Receiver<()>) {
    for attempt in 1..=max_attempts {
        match utils::lock(&connections).get_mut(&member_id) {
            Some(record) => record.attempts = attempt,
            None => {
                tracing::debug!(member = %member_id, "chain deleted while connecting, abandoning");
                return;
            }
        }
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                let mut conns = utils::lock(&connections);
                match conns.get_mut(&member_id) {
                    Some(record) => {
                        record.stream = Some(Arc::new(tokio::sync::Mutex::new(stream)));
                        tracing::info!(member = %member_id, address = %address, attempt, "connected to chain member");
                    }
                    None => tracing::debug!(member = %member_id, "chain deleted while connecting, discarding socket"),
                }
                return;
            }
            Err(err) => tracing::debug!(error = ?err, member = %member_id, address = %address, attempt, "connect attempt failed"),
        }
        if attempt == max_attempts {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => (),
            _ = shutdown.recv() => return,
        }
    }
    tracing::warn!(member = %member_id, address = %address, max_attempts, "exhausted connect attempts, giving up on member");
    utils::lock(&connections).remove(&member_id);
}

/// Serve one client connection until it closes or shutdown is signalled.
async fn serve_client(mut stream: TcpStream, peer: SocketAddr, ctx: RouteCtx, clients: ClientSet, mut shutdown: broadcast::Receiver<()>) {
    utils::lock(&clients).insert(peer);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            res = stream.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => route_unit(Bytes::copy_from_slice(&buf[..n]), &ctx).await,
                Err(err) => {
                    tracing::debug!(error = ?err, %peer, "error reading from client");
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
    utils::lock(&clients).remove(&peer);
    tracing::debug!(%peer, "client disconnected");
}

/// Route one unit of client traffic: mirror it, pick a live chain, forward it.
///
/// The mirror sees every ingress unit, routed or not; the monitoring sink audits raw
/// traffic, not routing outcomes.
async fn route_unit(unit: Bytes, ctx: &RouteCtx) {
    ctx.monitor.send(unit.clone());
    metrics::increment_counter!(METRIC_PACKETS_MIRRORED);

    // Snapshot the live chains without holding any lock across I/O.
    let live: Vec<(String, String, Arc<tokio::sync::Mutex<TcpStream>>)> = {
        let chains = utils::lock(&ctx.chains);
        let conns = utils::lock(&ctx.connections);
        chains
            .iter()
            .filter_map(|(sfc_id, member)| {
                conns
                    .get(member)
                    .and_then(|record| record.stream.clone())
                    .map(|stream| (sfc_id.clone(), member.clone(), stream))
            })
            .collect()
    };
    let ids: Vec<String> = live.iter().map(|(sfc_id, _, _)| sfc_id.clone()).collect();
    let pick = match ctx.selector.select(&ids) {
        Some(pick) => pick,
        None => {
            tracing::debug!("no live chain available, dropping unrouted unit");
            metrics::increment_counter!(METRIC_PACKETS_UNROUTED);
            return;
        }
    };

    let (member, stream) = match live.into_iter().find(|(sfc_id, _, _)| sfc_id == &pick) {
        Some((_, member, stream)) => (member, stream),
        None => {
            tracing::warn!(sfc_id = %pick, "selector picked a chain which is not live, dropping unit");
            metrics::increment_counter!(METRIC_PACKETS_UNROUTED);
            return;
        }
    };
    let res = stream.lock().await.write_all(&unit).await;
    match res {
        Ok(()) => {
            tracing::trace!(sfc_id = %pick, len = unit.len(), "unit routed");
            metrics::increment_counter!(METRIC_PACKETS_ROUTED);
        }
        Err(err) => {
            tracing::warn!(error = ?err, sfc_id = %pick, member = %member, "error forwarding unit, marking member connection dead");
            if let Some(record) = utils::lock(&ctx.connections).get_mut(&member) {
                record.stream = None;
            }
        }
    }
}
