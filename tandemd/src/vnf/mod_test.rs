use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::*;
use crate::fixtures;
use tandem_core::bus::Bus;

/// A transform which errors on `bad`, filters `drop` to an empty unit, and passes
/// everything else through.
struct Picky;

impl NetworkFunction for Picky {
    fn apply(&self, unit: Bytes) -> Result<Option<Bytes>> {
        match unit.as_ref() {
            b"bad" => Err(anyhow!("scripted transform failure")),
            b"drop" => Ok(Some(Bytes::new())),
            _ => Ok(Some(unit)),
        }
    }
}

struct TestWorkload {
    addr: String,
    cmd_tx: mpsc::UnboundedSender<WorkloadCmd>,
    handle: JoinHandle<Result<()>>,
    // Held so the workload's shutdown channel stays open for the test's duration.
    _shutdown_tx: broadcast::Sender<()>,
}

async fn spawn_tcp_workload(bus: &Bus, transform: Box<dyn NetworkFunction>) -> Result<TestWorkload> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let (workload, cmd_tx) = VnfWorkload::new_tcp("vnf-test".into(), listener, transform, bus.connect(), Duration::from_millis(10), shutdown_tx.subscribe())?;
    let handle = workload.spawn();
    Ok(TestWorkload {
        addr,
        cmd_tx,
        handle,
        _shutdown_tx: shutdown_tx,
    })
}

#[tokio::test]
async fn transform_failures_skip_the_unit_without_stopping_the_loop() -> Result<()> {
    let bus = Bus::new();
    let (out_addr, mut captured) = fixtures::capture_listener().await?;
    let wl = spawn_tcp_workload(&bus, Box::new(Picky)).await?;
    wl.cmd_tx.send(WorkloadCmd::Run { outbound: out_addr.to_string() }).map_err(|_| anyhow!("workload command channel closed"))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut upstream = TcpStream::connect(&wl.addr).await?;
    upstream.write_all(b"bad").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    upstream.write_all(b"good").await?;

    // Only the unit surviving the transform comes out the far side.
    let chunk = fixtures::next_chunk(&mut captured, Duration::from_secs(1)).await?;
    assert!(chunk.as_ref() == b"good", "expected the failing unit to be skipped, got {:?}", chunk);
    Ok(())
}

#[tokio::test]
async fn empty_transform_results_are_not_forwarded() -> Result<()> {
    let bus = Bus::new();
    let (out_addr, mut captured) = fixtures::capture_listener().await?;
    let wl = spawn_tcp_workload(&bus, Box::new(Picky)).await?;
    wl.cmd_tx.send(WorkloadCmd::Run { outbound: out_addr.to_string() }).map_err(|_| anyhow!("workload command channel closed"))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut upstream = TcpStream::connect(&wl.addr).await?;
    upstream.write_all(b"drop").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    upstream.write_all(b"keep").await?;

    let chunk = fixtures::next_chunk(&mut captured, Duration::from_secs(1)).await?;
    assert!(chunk.as_ref() == b"keep", "expected the empty result to be dropped, got {:?}", chunk);
    Ok(())
}

#[tokio::test]
async fn bus_addressed_workload_forwards_between_queues() -> Result<()> {
    let bus = Bus::new();
    let conn = bus.connect();
    let mut out_queue = conn.declare_queue_named("wl-out")?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let (workload, _cmd_tx) =
        VnfWorkload::new_bus("vnf-bus".into(), "wl-in", "wl-out".into(), Box::new(Passthrough), bus.connect(), Duration::from_millis(10), shutdown_tx.subscribe())?;
    let _handle = workload.spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.send_to_queue("wl-in", Bytes::from_static(b"unit"))?;
    let msg = out_queue.recv_timeout(Duration::from_secs(1)).await.expect("expected forwarded unit on outbound queue");
    assert!(msg.as_ref() == b"unit", "expected unit to pass through unchanged, got {:?}", msg);
    Ok(())
}

#[tokio::test]
async fn stop_terminates_the_workload() -> Result<()> {
    let bus = Bus::new();
    let wl = spawn_tcp_workload(&bus, Box::new(Passthrough)).await?;

    wl.cmd_tx.send(WorkloadCmd::Stop).map_err(|_| anyhow!("workload command channel closed"))?;
    let res = tokio::time::timeout(Duration::from_secs(1), wl.handle).await;
    match res {
        Ok(join) => {
            join.expect("workload task panicked").expect("workload returned an error");
        }
        Err(_) => panic!("workload did not shut down within the deadline"),
    }
    Ok(())
}
