use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::gateway::{GatewayCtl, UniformRandom};
use crate::nfvo::NfvoCtl;
use crate::prom::spawn_prom_server;
use crate::vim::VimCtl;
use crate::vnfm::VnfmCtl;
use tandem_core::bus::Bus;
use tandem_core::client::OperatorClient;

/// The application object for when Tandem is running as a daemon.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The in-process message bus shared by every role.
    _bus: Bus,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the infrastructure manager controller.
    vim_handle: JoinHandle<Result<()>>,
    /// The join handle of the VNF lifecycle manager controller.
    vnfm_handle: JoinHandle<Result<()>>,
    /// The join handle of the orchestrator controller.
    nfvo_handle: JoinHandle<Result<()>>,
    /// The join handle of the gateway controller.
    gateway_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(100);
        let bus = Bus::new();

        // Spawn the control-plane roles, each on its own bus connection.
        let vim_handle = VimCtl::new(config.clone(), bus.connect(), shutdown_tx.clone()).spawn();
        let vnfm_handle = VnfmCtl::new(config.clone(), bus.connect(), shutdown_tx.clone()).spawn();
        let nfvo_handle = NfvoCtl::new(bus.connect(), shutdown_tx.clone()).spawn();
        let gateway = GatewayCtl::new(config.clone(), bus.connect(), Arc::new(UniformRandom), shutdown_tx.clone())
            .await
            .context("error setting up gateway controller")?;
        let gateway_handle = gateway.spawn();

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        // Create any chains requested at startup.
        let operator = OperatorClient::new(bus.connect(), config.rpc_timeout(), config.heartbeat_timeout());
        for (sfc_id, sfc_size) in config.bootstrap() {
            if let Err(err) = operator.create_sfc(&sfc_id, sfc_size) {
                tracing::error!(error = ?err, sfc_id = %sfc_id, sfc_size, "error requesting bootstrap chain");
            }
        }

        Ok(Self {
            _config: config,
            _bus: bus,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            vim_handle,
            vnfm_handle,
            nfvo_handle,
            gateway_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Tandem is shutting down");
        if let Err(err) = self.nfvo_handle.await.context("error joining NFVO controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down NFVO controller");
        }
        if let Err(err) = self.vnfm_handle.await.context("error joining VNFM controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down VNFM controller");
        }
        if let Err(err) = self.vim_handle.await.context("error joining VIM controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down VIM controller");
        }
        if let Err(err) = self.gateway_handle.await.context("error joining gateway controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down gateway controller");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("Tandem shutdown complete");
        Ok(())
    }
}
