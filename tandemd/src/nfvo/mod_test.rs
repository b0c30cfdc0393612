use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use super::*;
use crate::fixtures;
use tandem_core::bus::Bus;
use tandem_core::msg::{ChainCatalog, GatewayCmd, VnfmCmd};

const TIMEOUT: Duration = Duration::from_millis(100);

fn setup() -> (Bus, NfvoCtl) {
    let bus = Bus::new();
    let (shutdown_tx, _) = broadcast::channel(10);
    let ctl = NfvoCtl::new(bus.connect(), shutdown_tx);
    (bus, ctl)
}

#[tokio::test]
async fn create_chain_emits_one_command_per_member() -> Result<()> {
    let (bus, mut ctl) = setup();
    let mut vnfm_tap = fixtures::tap(&bus.connect(), TOPIC_VNFM);

    let mut all_ids = HashSet::new();
    for size in 1..=8usize {
        let sfc_id = format!("sfc-{}", size);
        ctl.handle_create_sfc(sfc_id.clone(), size);
        for num in 1..=size {
            let cmd: VnfmCmd = fixtures::next_msg(&mut vnfm_tap, TIMEOUT).await?;
            match cmd {
                VnfmCmd::CreateVnf { vnf_id, sfc_id: got_sfc, vnf_num, sfc_size } => {
                    assert!(got_sfc == sfc_id, "expected chain {} in creation command, got {}", sfc_id, got_sfc);
                    assert!(vnf_num == num, "expected ordinal {}, got {}", num, vnf_num);
                    assert!(sfc_size == size, "expected chain size {}, got {}", size, sfc_size);
                    assert!(all_ids.insert(vnf_id.clone()), "VNF ID {} was issued twice", vnf_id);
                }
                other => panic!("expected create_vnf command, got {:?}", other),
            }
        }
    }
    // No further commands beyond one per member.
    assert!(vnfm_tap.recv_timeout(TIMEOUT).await.is_none(), "expected no further commands on VNFM topic");
    Ok(())
}

#[tokio::test]
async fn create_chain_rejects_invalid_size() -> Result<()> {
    let (bus, mut ctl) = setup();
    let mut vnfm_tap = fixtures::tap(&bus.connect(), TOPIC_VNFM);

    ctl.handle_create_sfc("too-small".into(), 0);
    ctl.handle_create_sfc("too-large".into(), 9);

    assert!(vnfm_tap.recv_timeout(TIMEOUT).await.is_none(), "expected no create_vnf commands for rejected sizes");
    assert!(ctl.catalog.is_empty(), "expected empty catalog after rejected creations, got {} entries", ctl.catalog.len());
    Ok(())
}

#[tokio::test]
async fn create_chain_rejects_duplicate_chain_id() -> Result<()> {
    let (bus, mut ctl) = setup();
    let mut vnfm_tap = fixtures::tap(&bus.connect(), TOPIC_VNFM);

    ctl.handle_create_sfc("sfc-1".into(), 1);
    let _cmd: VnfmCmd = fixtures::next_msg(&mut vnfm_tap, TIMEOUT).await?;
    ctl.handle_create_sfc("sfc-1".into(), 2);

    assert!(vnfm_tap.recv_timeout(TIMEOUT).await.is_none(), "expected no commands for duplicate chain ID");
    assert!(ctl.catalog.len() == 1, "expected 1 cataloged chain, got {}", ctl.catalog.len());
    assert!(ctl.catalog["sfc-1"].members.len() == 1, "expected original chain to be untouched");
    Ok(())
}

#[tokio::test]
async fn delete_chain_cascades_and_prunes() -> Result<()> {
    let (bus, mut ctl) = setup();
    let conn = bus.connect();
    let mut vnfm_tap = fixtures::tap(&conn, TOPIC_VNFM);
    let mut gateway_tap = fixtures::tap(&conn, TOPIC_GATEWAY);
    let mut fwd_tap = fixtures::tap(&conn, TOPIC_FORWARDER);
    let mut control_tap = fixtures::tap(&conn, tandem_core::TOPIC_VNF_CONTROL);

    ctl.handle_create_sfc("sfc-1".into(), 2);
    for _ in 0..2 {
        let _cmd: VnfmCmd = fixtures::next_msg(&mut vnfm_tap, TIMEOUT).await?;
    }

    ctl.handle_delete_sfc("sfc-1".into());

    let cmd: VnfmCmd = fixtures::next_msg(&mut vnfm_tap, TIMEOUT).await?;
    assert!(
        cmd == VnfmCmd::DeleteVnf { sfc_id: "sfc-1".into() },
        "expected chain-scoped delete_vnf command, got {:?}",
        cmd
    );
    let announce: GatewayCmd = fixtures::next_msg(&mut gateway_tap, TIMEOUT).await?;
    assert!(announce == GatewayCmd::SfcDelete { sfc_id: "sfc-1".into() }, "expected sfc-delete on gateway topic, got {:?}", announce);
    let fwd: GatewayCmd = fixtures::next_msg(&mut fwd_tap, TIMEOUT).await?;
    assert!(fwd == GatewayCmd::SfcDelete { sfc_id: "sfc-1".into() }, "expected sfc-delete on forwarding topic, got {:?}", fwd);
    let marker = control_tap.recv_timeout(TIMEOUT).await.expect("expected deletion marker on member control topic");
    assert!(marker.as_ref() == b"delete_sfc,sfc-1", "unexpected deletion marker, got {:?}", marker);
    assert!(ctl.catalog.is_empty(), "expected empty catalog after deletion");
    Ok(())
}

#[tokio::test]
async fn delete_unknown_chain_is_noop() -> Result<()> {
    let (bus, mut ctl) = setup();
    let conn = bus.connect();
    let mut vnfm_tap = fixtures::tap(&conn, TOPIC_VNFM);
    let mut gateway_tap = fixtures::tap(&conn, TOPIC_GATEWAY);

    ctl.handle_delete_sfc("no-such-chain".into());

    assert!(vnfm_tap.recv_timeout(TIMEOUT).await.is_none(), "expected no delete_vnf for unknown chain");
    assert!(gateway_tap.recv_timeout(TIMEOUT).await.is_none(), "expected no sfc-delete for unknown chain");
    Ok(())
}

#[tokio::test]
async fn list_chains_replies_with_catalog() -> Result<()> {
    let (bus, mut ctl) = setup();
    let conn = bus.connect();
    let mut reply_queue = conn.declare_queue();

    ctl.handle_create_sfc("sfc-a".into(), 2);
    ctl.handle_create_sfc("sfc-b".into(), 1);
    ctl.handle_list_sfc(reply_queue.name().to_string());

    let catalog: ChainCatalog = fixtures::next_msg(&mut reply_queue, TIMEOUT).await?;
    assert!(catalog.sfcs.len() == 2, "expected 2 cataloged chains, got {}", catalog.sfcs.len());
    assert!(catalog.sfcs["sfc-a"].len() == 2, "expected 2 members for sfc-a, got {}", catalog.sfcs["sfc-a"].len());
    assert!(catalog.sfcs["sfc-b"].len() == 1, "expected 1 member for sfc-b, got {}", catalog.sfcs["sfc-b"].len());
    Ok(())
}

#[tokio::test]
async fn heartbeat_replies_ok() -> Result<()> {
    let (bus, mut ctl) = setup();
    let conn = bus.connect();
    let mut reply_queue = conn.declare_queue();

    let probe = NfvoCmd::Heartbeat { rqueue: reply_queue.name().to_string() };
    ctl.handle_msg(Some(utils::encode_msg(&probe)?));

    let reply = reply_queue.recv_timeout(TIMEOUT).await.expect("expected heartbeat reply");
    assert!(reply.as_ref() == OK_REPLY, "expected literal ok heartbeat reply, got {:?}", reply);
    Ok(())
}

#[tokio::test]
async fn malformed_message_is_dropped() -> Result<()> {
    let (_bus, mut ctl) = setup();
    ctl.handle_msg(Some(Bytes::from_static(b"{not json")));
    ctl.handle_msg(Some(Bytes::from_static(b"{\"action\":\"bogus\"}")));
    assert!(ctl.catalog.is_empty(), "expected catalog to be untouched by malformed messages");
    Ok(())
}

#[test]
fn id_generation_fails_cleanly_when_exhausted() -> Result<()> {
    let mut registry = IdRegistry::default();
    let first = registry.generate_with(|| "vnf-AAAAAA".to_string())?;
    assert!(first == "vnf-AAAAAA", "expected fixed candidate to be issued, got {}", first);

    // Every further attempt collides with the issued ID.
    let res = registry.generate_with(|| "vnf-AAAAAA".to_string());
    match res {
        Err(AppError::IdExhausted(attempts)) => {
            assert!(attempts == MAX_ID_ATTEMPTS, "expected {} attempts, got {}", MAX_ID_ATTEMPTS, attempts)
        }
        other => panic!("expected ID exhaustion error, got {:?}", other),
    }
    assert!(registry.issued.len() == 1, "expected no half-formed registration, got {} issued IDs", registry.issued.len());
    Ok(())
}

#[test]
fn generated_ids_match_format() {
    let id = random_vnf_id();
    assert!(id.starts_with(ID_PREFIX), "expected prefix {}, got {}", ID_PREFIX, id);
    assert!(id.len() == ID_PREFIX.len() + ID_SUFFIX_LEN, "unexpected ID length for {}", id);
    assert!(id[ID_PREFIX.len()..].bytes().all(|b| b.is_ascii_alphabetic()), "expected ASCII-letter suffix, got {}", id);
}
