//! End-to-end tests of the data uplink pipeline through the dispatcher.


use lorans_rs::adr::AdrReason;
use lorans_rs::dedup::DedupResult;
use lorans_rs::downlink::AppDisposition;
use lorans_rs::lorawan::{parse_phy_payload, DataFrame, FCtrl, MType, PhyPayload};
use lorans_rs::processing::DownstreamSkip;
use lorans_rs::{
    ApplicationDownlink, DeduplicationStrategy, DevAddr, DevEui, FailedReason, FrameCounterMode,
    InMemoryCounterCoordinator, InMemorySessionStore, ServerConfig,
};
use mock_support::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn downlink_frame(payload: &[u8]) -> DataFrame {
    match parse_phy_payload(payload).unwrap() {
        PhyPayload::Data(frame) => frame,
        other => panic!("expected a data frame, got {other:?}"),
    }
}

fn config(strategy: DeduplicationStrategy) -> ServerConfig {
    ServerConfig {
        deduplication_strategy: strategy,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_counter_advances_and_rejects_stale_uplinks() {
    let server = TestServer::new(ServerConfig::default());
    let session = server.provision(abp_device()).await;

    let summary = server.uplink(STATION_A, abp_uplink(10).encode()).await.unwrap();
    assert_eq!(summary.fcnt_up, Some(10));
    assert_eq!(session.fcnt_up(), 10);

    tokio_test::assert_ok!(server.uplink(STATION_A, abp_uplink(11).encode()).await);
    assert_eq!(session.fcnt_up(), 11);

    let stale = server.uplink(STATION_A, abp_uplink(5).encode()).await;
    assert_eq!(stale, Err(FailedReason::InvalidFrameCounter));
    assert_eq!(session.fcnt_up(), 11);

    let fcnts: Vec<u32> = server.upstream.delivered().iter().map(|t| t.fcnt).collect();
    assert_eq!(fcnts, vec![10, 11]);
}

#[tokio::test]
async fn test_counter_gap_limit() {
    let server = TestServer::new(ServerConfig::default());
    let session = server.provision(abp_device()).await;

    server.uplink(STATION_A, abp_uplink(1).encode()).await.unwrap();
    let jump = server.uplink(STATION_A, abp_uplink(1 + 20_000).encode()).await;
    assert_eq!(jump, Err(FailedReason::InvalidFrameCounter));
    assert_eq!(session.fcnt_up(), 1);
}

#[tokio::test]
async fn test_counter_rollover_is_inferred() {
    let server = TestServer::new(ServerConfig::default());
    let session = server.provision(abp_device()).await;

    server.uplink(STATION_A, abp_uplink(0xFFFE).encode()).await.unwrap();
    let summary = server.uplink(STATION_A, abp_uplink(0x1_0003).encode()).await.unwrap();
    assert_eq!(summary.fcnt_up, Some(0x1_0003));
    assert_eq!(session.fcnt_up(), 0x1_0003);
}

#[tokio::test]
async fn test_uplinks_of_one_device_are_processed_in_order() {
    let server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;

    let handles: Vec<_> = (1..=5)
        .map(|fcnt| {
            server
                .dispatcher
                .dispatch(uplink_request(STATION_A, abp_uplink(fcnt).encode()))
        })
        .collect();
    for handle in handles {
        assert!(handle.outcome().await.is_ok());
    }

    let fcnts: Vec<u32> = server.upstream.delivered().iter().map(|t| t.fcnt).collect();
    assert_eq!(fcnts, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_confirmed_uplink_is_acknowledged() {
    let mut server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;

    let summary = server
        .uplink(STATION_A, abp_uplink(3).confirmed().encode())
        .await
        .unwrap();
    let downlink = summary.downlink.expect("ACK downlink");
    assert_eq!(downlink.fcnt_down, Some(1));

    let sent = server.sent_downlinks();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].station, STATION_A);
    let frame = downlink_frame(&sent[0].payload);
    assert_eq!(frame.mtype, MType::UnconfirmedDataDown);
    assert!(frame.fctrl.contains(FCtrl::ACK));
    assert_eq!(frame.fcnt, 1);
}

#[tokio::test]
async fn test_confirmed_resubmits_are_limited() {
    let mut server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;
    let frame = abp_uplink(7).confirmed().encode();

    server.uplink(STATION_A, frame.clone()).await.unwrap();
    for _ in 0..3 {
        let resubmit = server.uplink(STATION_A, frame.clone()).await.unwrap();
        assert_eq!(resubmit.dedup, DedupResult::DuplicateDueToResubmission);
        assert!(!resubmit.delivered_upstream);
        assert!(resubmit.downlink.is_some());
    }
    let exceeded = server.uplink(STATION_A, frame).await;
    assert_eq!(exceeded, Err(FailedReason::ConfirmationResubmitThresholdExceeded));

    assert_eq!(server.upstream.delivered().len(), 1);
    assert_eq!(server.sent_downlinks().len(), 4);
}

#[tokio::test]
async fn test_dedup_drop_answers_once() {
    let mut server = TestServer::new(config(DeduplicationStrategy::Drop));
    server.provision(abp_device()).await;
    let frame = abp_uplink(4).confirmed().encode();

    server.uplink(STATION_A, frame.clone()).await.unwrap();
    let second = server.uplink(STATION_B, frame).await;
    assert_eq!(second, Err(FailedReason::DeduplicationDrop));

    assert_eq!(server.upstream.delivered().len(), 1);
    assert_eq!(server.sent_downlinks().len(), 1);
}

#[tokio::test]
async fn test_dedup_mark_delivers_both_and_answers_once() {
    let mut server = TestServer::new(config(DeduplicationStrategy::Mark));
    let session = server.provision(abp_device()).await;
    let frame = abp_uplink(4).confirmed().encode();

    let first = server.uplink(STATION_A, frame.clone()).await.unwrap();
    assert_eq!(first.dedup, DedupResult::NotDuplicate);
    let second = server.uplink(STATION_B, frame).await.unwrap();
    assert_eq!(second.dedup, DedupResult::SoftDuplicate);
    assert_eq!(second.downstream_skipped, Some(DownstreamSkip::SoftDuplicate));
    assert_eq!(session.fcnt_up(), 4);

    let delivered = server.upstream.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].dup_msg, None);
    assert_eq!(delivered[1].dup_msg, Some(true));
    assert_eq!(server.sent_downlinks().len(), 1);
}

#[tokio::test]
async fn test_dedup_none_delivers_unmarked_and_answers_once() {
    let mut server = TestServer::new(config(DeduplicationStrategy::None));
    server.provision(abp_device()).await;
    let frame = abp_uplink(6).confirmed().encode();

    server.uplink(STATION_A, frame.clone()).await.unwrap();
    let second = server.uplink(STATION_B, frame).await.unwrap();
    assert_eq!(second.dedup, DedupResult::SoftDuplicate);
    assert_eq!(second.downstream_skipped, Some(DownstreamSkip::SoftDuplicate));
    assert!(second.delivered_upstream);

    let delivered = server.upstream.delivered();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|t| t.dup_msg.is_none()));
    assert_eq!(server.sent_downlinks().len(), 1);
}

fn gateway_pair(strategy: DeduplicationStrategy) -> (TestServer, TestServer) {
    let config = ServerConfig {
        deduplication_strategy: strategy,
        frame_counter_mode: FrameCounterMode::MultiGateway,
        ..ServerConfig::default()
    };
    let coordinator = Arc::new(InMemoryCounterCoordinator::new());
    let store = Arc::new(InMemorySessionStore::new());
    let a = TestServer::with_store(config.clone(), store.clone(), Some(coordinator.clone()));
    let b = TestServer::with_store(config, store, Some(coordinator));
    (a, b)
}

#[tokio::test]
async fn test_lost_reservation_drops_uplink_under_drop_policy() {
    let (mut a, mut b) = gateway_pair(DeduplicationStrategy::Drop);
    a.provision(abp_device()).await;
    b.provision(abp_device()).await;
    let frame = abp_uplink(12).confirmed().encode();

    a.uplink(STATION_A, frame.clone()).await.unwrap();
    let other = b.uplink(STATION_B, frame).await;
    assert_eq!(other, Err(FailedReason::HandledByAnotherGateway));
    assert!(b.upstream.delivered().is_empty());
    assert_eq!(a.sent_downlinks().len() + b.sent_downlinks().len(), 1);
}

#[tokio::test]
async fn test_lost_reservation_skips_downstream_under_mark_policy() {
    let (mut a, mut b) = gateway_pair(DeduplicationStrategy::Mark);
    a.provision(abp_device()).await;
    let session_b = b.provision(abp_device()).await;
    let frame = abp_uplink(12).confirmed().encode();

    let first = a.uplink(STATION_A, frame.clone()).await.unwrap();
    assert!(first.downlink.is_some());

    let second = b.uplink(STATION_B, frame).await.unwrap();
    assert_eq!(second.downstream_skipped, Some(DownstreamSkip::ReservationLost));
    assert!(second.delivered_upstream);
    assert!(second.downlink.is_none());
    assert_eq!(session_b.fcnt_up(), 12);

    assert_eq!(a.sent_downlinks().len(), 1);
    assert!(b.sent_downlinks().is_empty());
}

#[tokio::test]
async fn test_late_uplink_succeeds_without_downlink() {
    let mut server = TestServer::new(ServerConfig::default());
    let session = server.provision(abp_device()).await;

    let mut request = uplink_request(STATION_A, abp_uplink(8).confirmed().encode());
    request.received_at = Instant::now()
        .checked_sub(Duration::from_secs(3))
        .expect("monotonic clock past 3 s");
    let summary = server.dispatcher.dispatch(request).outcome().await.unwrap();

    assert_eq!(summary.downstream_skipped, Some(DownstreamSkip::WindowMissed));
    assert!(summary.downlink.is_none());
    assert!(summary.delivered_upstream);
    assert_eq!(session.fcnt_up(), 8);
    assert!(server.sent_downlinks().is_empty());
}

#[tokio::test]
async fn test_link_check_is_answered_in_fopts() {
    let mut server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;

    let summary = server
        .uplink(STATION_A, abp_uplink(2).fopts(&[0x02]).encode())
        .await
        .unwrap();
    assert_eq!(summary.downlink.map(|d| d.mac_commands), Some(1));

    let sent = server.sent_downlinks();
    let frame = downlink_frame(&sent[0].payload);
    // SNR 7.5 dB against the DR5 floor of -7.5 dB
    assert_eq!(frame.fopts, vec![0x02, 15, 1]);
    assert_eq!(frame.fport, None);
}

#[tokio::test]
async fn test_mac_answers_from_device_need_no_reply() {
    let mut server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;

    // LinkADRAns refusing the channel mask, then DevStatusAns
    let fopts = [0x03, 0x06, 0x06, 0xFE, 0x05];
    let summary = server
        .uplink(STATION_A, abp_uplink(2).fopts(&fopts).encode())
        .await
        .unwrap();
    assert_eq!(summary.fcnt_up, Some(2));
    assert!(summary.downlink.is_none());
    assert!(server.sent_downlinks().is_empty());
}

#[tokio::test]
async fn test_adr_needs_full_history_before_confirming() {
    let server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;

    let mut last = None;
    for fcnt in 1..=3 {
        let frame = abp_uplink(fcnt).fctrl(FCtrl::ADR | FCtrl::ADR_ACK_REQ).encode();
        last = server.uplink(STATION_A, frame).await.unwrap().adr;
    }

    let adr = last.expect("ADR outcome");
    assert!(!adr.can_confirm);
    assert_eq!(adr.sample_count, 3);
    assert_eq!(adr.reserved_fcnt_down, 0);
}

#[tokio::test]
async fn test_adr_is_not_computed_when_downlinks_are_disabled() {
    let mut server = TestServer::new(ServerConfig::default());
    let mut device = abp_device();
    device["downlink_enabled"] = serde_json::json!(false);
    let session = server.provision(device).await;

    for fcnt in 1..=20 {
        server.uplink(STATION_A, abp_uplink(fcnt).fctrl(FCtrl::ADR).encode()).await.unwrap();
    }
    let frame = abp_uplink(21).fctrl(FCtrl::ADR | FCtrl::ADR_ACK_REQ).encode();
    let summary = server.uplink(STATION_A, frame).await.unwrap();

    let adr = summary.adr.expect("ADR outcome");
    assert!(!adr.can_confirm);
    assert_eq!(adr.reserved_fcnt_down, 0);
    assert_eq!(adr.reason, AdrReason::Recorded);
    assert_eq!(summary.downstream_skipped, Some(DownstreamSkip::DownlinkDisabled));
    assert_eq!(session.adr_settings(), None);
    assert_eq!(session.fcnt_down(), 0);
    assert!(server.sent_downlinks().is_empty());
}

#[tokio::test]
async fn test_application_downlink_is_sent_and_completed() {
    let mut server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;
    let dev_eui = DevEui::from_hex(ABP_DEV_EUI).unwrap();
    server.source.push(
        dev_eui,
        ApplicationDownlink {
            id: "cmd-1".to_string(),
            fport: 10,
            payload: vec![0x01, 0x02],
            confirmed: false,
        },
    );

    let summary = server.uplink(STATION_A, abp_uplink(1).encode()).await.unwrap();
    assert_eq!(
        summary.downlink.and_then(|d| d.application),
        Some(AppDisposition::Included)
    );
    assert_eq!(server.source.completed(dev_eui), vec!["cmd-1".to_string()]);
    assert_eq!(server.source.pending_len(dev_eui), 0);

    let sent = server.sent_downlinks();
    let frame = downlink_frame(&sent[0].payload);
    assert_eq!(frame.fport, Some(10));
    assert_eq!(frame.dev_addr, DevAddr(ABP_DEV_ADDR));
}

#[tokio::test]
async fn test_application_downlink_on_reserved_port_is_rejected() {
    let server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;
    let dev_eui = DevEui::from_hex(ABP_DEV_EUI).unwrap();
    server.source.push(
        dev_eui,
        ApplicationDownlink {
            id: "bad".to_string(),
            fport: 230,
            payload: vec![0xFF],
            confirmed: false,
        },
    );

    server.uplink(STATION_A, abp_uplink(1).encode()).await.unwrap();
    assert_eq!(server.source.rejected(dev_eui), vec!["bad".to_string()]);
    assert!(server.source.completed(dev_eui).is_empty());
}

#[tokio::test]
async fn test_upstream_failure_keeps_counter() {
    let server = TestServer::new(ServerConfig::default());
    let session = server.provision(abp_device()).await;

    tokio_test::assert_ok!(server.uplink(STATION_A, abp_uplink(1).encode()).await);
    server.upstream.set_unavailable(true);
    let failed = server.uplink(STATION_A, abp_uplink(2).encode()).await;
    assert_eq!(failed, Err(FailedReason::UpstreamDeliveryProblem));
    assert_eq!(session.fcnt_up(), 1);
}

#[tokio::test]
async fn test_resolution_failures() {
    let server = TestServer::new(ServerConfig::default());
    server.provision(abp_device()).await;

    let garbage = server.uplink(STATION_A, vec![0x40, 0x01]).await;
    assert_eq!(garbage, Err(FailedReason::InvalidFrame));

    let keys = abp_keys();
    let stranger = UplinkFrame::new(DevAddr(0x0102_0304), &keys, 1).encode();
    assert_eq!(server.uplink(STATION_A, stranger).await, Err(FailedReason::UnknownDevice));

    let mut tampered = abp_uplink(1).encode();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xFF;
    assert_eq!(server.uplink(STATION_A, tampered).await, Err(FailedReason::InvalidMic));
}

#[tokio::test]
async fn test_relaxed_abp_device_restart() {
    let server = TestServer::new(ServerConfig::default());
    let mut device = abp_device();
    device["relaxed_fcnt"] = serde_json::json!(true);
    let session = server.provision(device).await;

    server.uplink(STATION_A, abp_uplink(40).encode()).await.unwrap();
    assert_eq!(session.fcnt_up(), 40);

    let restarted = server.uplink(STATION_A, abp_uplink(0).encode()).await.unwrap();
    assert_eq!(restarted.fcnt_up, Some(0));
    assert_eq!(session.fcnt_up(), 0);

    server.uplink(STATION_A, abp_uplink(1).encode()).await.unwrap();
    assert_eq!(session.fcnt_up(), 1);
}

#[tokio::test]
async fn test_relaxed_abp_device_crosses_rollover() {
    let server = TestServer::new(ServerConfig::default());
    let mut device = abp_device();
    device["relaxed_fcnt"] = serde_json::json!(true);
    let session = server.provision(device).await;

    for fcnt in [0xFFFE, 0xFFFF, 0x1_0000, 0x1_0001] {
        let summary = server.uplink(STATION_A, abp_uplink(fcnt).encode()).await.unwrap();
        assert_eq!(summary.fcnt_up, Some(fcnt));
    }
    assert_eq!(session.fcnt_up(), 0x1_0001);

    // A real restart after the rollover is still recognised
    let restarted = server.uplink(STATION_A, abp_uplink(0).encode()).await.unwrap();
    assert_eq!(restarted.fcnt_up, Some(0));
    assert_eq!(session.fcnt_up(), 0);
}

#[tokio::test]
async fn test_relaxed_abp_restart_clears_adr_history() {
    let server = TestServer::new(ServerConfig::default());
    let mut device = abp_device();
    device["relaxed_fcnt"] = serde_json::json!(true);
    server.provision(device).await;
    let dev_eui = DevEui::from_hex(ABP_DEV_EUI).unwrap();

    for fcnt in 100..120 {
        server.uplink(STATION_A, abp_uplink(fcnt).fctrl(FCtrl::ADR).encode()).await.unwrap();
    }
    assert_eq!(server.services().adr.sample_count(dev_eui).await, 20);

    let frame = abp_uplink(0).fctrl(FCtrl::ADR | FCtrl::ADR_ACK_REQ).encode();
    let summary = server.uplink(STATION_A, frame).await.unwrap();
    assert_eq!(summary.fcnt_up, Some(0));

    let adr = summary.adr.expect("ADR outcome");
    assert!(!adr.can_confirm);
    assert_eq!(adr.sample_count, 1);
    assert_eq!(adr.reason, AdrReason::InsufficientHistory);
    assert_eq!(server.services().adr.sample_count(dev_eui).await, 1);
}

#[tokio::test]
async fn test_downlink_disabled_device_gets_no_answer() {
    let mut server = TestServer::new(ServerConfig::default());
    let mut device = abp_device();
    device["downlink_enabled"] = serde_json::json!(false);
    server.provision(device).await;

    let summary = server
        .uplink(STATION_A, abp_uplink(1).confirmed().encode())
        .await
        .unwrap();
    assert_eq!(summary.downstream_skipped, Some(DownstreamSkip::DownlinkDisabled));
    assert!(server.sent_downlinks().is_empty());
}
