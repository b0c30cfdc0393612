//! End-to-end flow over a fully assembled control plane and data plane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::fixtures;
use crate::gateway::{GatewayCtl, UniformRandom};
use crate::nfvo::NfvoCtl;
use crate::vim::VimCtl;
use crate::vnfm::VnfmCtl;
use tandem_core::bus::Bus;
use tandem_core::client::OperatorClient;
use tandem_core::rpc::ModuleStatus;

/// TCP reads may coalesce units, so a captured chunk is valid when it is one or more
/// back-to-back copies of the probe payload.
fn is_ping_run(chunk: &Bytes) -> bool {
    !chunk.is_empty() && chunk.len() % 4 == 0 && chunk.chunks(4).all(|unit| unit == b"ping")
}

#[tokio::test]
async fn chain_lifecycle_routes_traffic_end_to_end() -> Result<()> {
    let (sink_addr, mut sink_rx) = fixtures::capture_listener().await?;
    let (monitor_addr, mut monitor_rx) = fixtures::capture_listener().await?;
    let mut config = Config::new_test();
    config.sink_addr = sink_addr.to_string();
    config.monitor_addr = monitor_addr.to_string();
    let config = Arc::new(config);

    let bus = Bus::new();
    let (shutdown_tx, _) = broadcast::channel(100);
    let _vim_handle = VimCtl::new(config.clone(), bus.connect(), shutdown_tx.clone()).spawn();
    let _vnfm_handle = VnfmCtl::new(config.clone(), bus.connect(), shutdown_tx.clone()).spawn();
    let _nfvo_handle = NfvoCtl::new(bus.connect(), shutdown_tx.clone()).spawn();
    let gateway = GatewayCtl::new(config.clone(), bus.connect(), Arc::new(UniformRandom), shutdown_tx.clone()).await?;
    let gateway_addr = gateway.local_addr()?;
    let _gateway_handle = gateway.spawn();

    let mut operator = OperatorClient::new(bus.connect(), config.rpc_timeout(), config.heartbeat_timeout());
    operator.create_sfc("sfc-1", 2)?;

    // The chain appears in the orchestrator's catalog with both members.
    let mut cataloged = false;
    for _ in 0..50 {
        if let Some(catalog) = operator.list_sfc().await? {
            if catalog.sfcs.get("sfc-1").map(|members| members.len()) == Some(2) {
                cataloged = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cataloged, "expected sfc-1 with 2 members in the catalog");

    // Drive traffic until the full path has established; units are dropped while the
    // gateway and workload links are still dialing.
    let mut client = TcpStream::connect(gateway_addr).await?;
    let mut delivered = None;
    for _ in 0..100 {
        client.write_all(b"ping").await?;
        if let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_millis(50), sink_rx.recv()).await {
            delivered = Some(chunk);
            break;
        }
    }
    let delivered = delivered.ok_or_else(|| anyhow!("no traffic reached the terminal sink"))?;
    assert!(is_ping_run(&delivered), "expected ping traffic at the terminal sink, got {:?}", delivered);

    // Every ingress unit is also mirrored to the monitoring sink.
    let mirrored = fixtures::next_chunk(&mut monitor_rx, Duration::from_secs(1)).await?;
    assert!(is_ping_run(&mirrored), "expected ping traffic at the monitoring sink, got {:?}", mirrored);

    // Every module answers its liveness probe.
    for (module, status) in operator.status().await {
        assert!(status == ModuleStatus::Up, "expected module {} to be up, got {}", module, status);
    }

    // Deleting the chain cascades down and empties the catalog.
    operator.delete_sfc("sfc-1")?;
    let mut emptied = false;
    for _ in 0..50 {
        if let Some(catalog) = operator.list_sfc().await? {
            if catalog.sfcs.is_empty() {
                emptied = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(emptied, "expected an empty catalog after chain deletion");
    Ok(())
}
