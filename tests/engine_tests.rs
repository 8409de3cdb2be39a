//! Per-slot pipeline scenarios against scripted sources and loopback
//! listeners.

mod common;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use common::*;
use ndi_aes67_bridge::{EngineTuning, SlotConfig, SlotEngine, SlotState};

fn loopback_cfg(port: u16) -> SlotConfig {
    SlotConfig {
        slot_id: 1,
        ndi_source_name: Some("SYNTH".into()),
        aes67_stream_name: "Studio A".into(),
        mcast_ip: Ipv4Addr::LOCALHOST,
        mcast_port: port,
        ssrc: 0x00C0_FFEE,
    }
}

fn fast_tuning() -> EngineTuning {
    EngineTuning {
        source_open: Duration::from_millis(100),
        frame_read: Duration::from_millis(100),
        start_watchdog: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
        max_consecutive_send_errors: 100,
    }
}

fn wait_for_state(engine: &SlotEngine, state: SlotState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if engine.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn single_slot_happy_path_emits_both_flows() {
    let (aes67, monitor, port) = bind_flow_pair();
    let cfg = loopback_cfg(port);

    // 9600 stereo frames (200 ms at 48 kHz) in ten 960-frame chunks.
    let system = ScriptedSystem::new();
    system.add("SYNTH", ScriptedSource::new(tone_frames(10, 960), Tail::Silent));

    let mut engine = SlotEngine::start(&cfg, &system, None, &fast_tuning());
    assert!(wait_for_state(&engine, SlotState::Live, Duration::from_secs(2)));

    let aes67_packets = drain_packets(&aes67);
    let monitor_packets = drain_packets(&monitor);

    assert_eq!(aes67_packets.len(), 200);
    assert_eq!(monitor_packets.len(), 200);
    assert!(aes67_packets.iter().all(|p| p.len() == 300));
    assert!(monitor_packets.iter().all(|p| p.len() == 204));
    assert!(aes67_packets.iter().all(|p| rtp_payload_type(p) == 98));
    assert!(monitor_packets.iter().all(|p| rtp_payload_type(p) == 11));
    assert!(aes67_packets.iter().all(|p| rtp_ssrc(p) == 0x00C0_FFEE));

    // Strictly monotonic sequence numbers, timestamps advancing by 48.
    for flow in [&aes67_packets, &monitor_packets] {
        for pair in flow.windows(2) {
            assert_eq!(rtp_seq(&pair[1]), rtp_seq(&pair[0]).wrapping_add(1));
            assert_eq!(
                rtp_timestamp(&pair[1]),
                rtp_timestamp(&pair[0]).wrapping_add(48)
            );
        }
    }

    let status = engine.status();
    assert_eq!(status.state, SlotState::Live);
    assert!(status.message.is_empty());
    assert_eq!(status.frames_received, 10);
    assert_eq!(status.packets_sent, 400);
    assert_eq!(status.bytes_sent, 200 * 300 + 200 * 204);
    assert!(status.last_send_unix_ns > 0);

    engine.stop();
    assert_eq!(engine.state(), SlotState::Idle);
}

#[test]
fn wrong_sample_rate_is_refused_before_any_packet() {
    let (aes67, _monitor, port) = bind_flow_pair();
    let cfg = loopback_cfg(port);

    let system = ScriptedSystem::new();
    let bad = ndi_aes67_bridge::SourceFrame::interleaved(44_100, 2, vec![0.0; 960 * 2]);
    system.add("SYNTH", ScriptedSource::new(vec![bad], Tail::Silent));

    let engine = SlotEngine::start(&cfg, &system, None, &fast_tuning());
    assert!(wait_for_state(&engine, SlotState::Failed, Duration::from_secs(2)));

    let status = engine.status();
    assert_eq!(status.message, "unsupported format: 44100Hz/2ch");
    assert_eq!(status.param_mismatch_count, 1);
    assert_eq!(status.packets_sent, 0);
    assert!(drain_packets(&aes67).is_empty());
}

#[test]
fn start_watchdog_fails_a_mute_receiver_within_six_seconds() {
    let (_aes67, _monitor, port) = bind_flow_pair();
    let cfg = loopback_cfg(port);

    let system = ScriptedSystem::new();
    system.add("SYNTH", ScriptedSource::never());

    let started = Instant::now();
    let tuning = EngineTuning {
        frame_read: Duration::from_secs(1),
        ..fast_tuning()
    };
    let engine = SlotEngine::start(&cfg, &system, None, &tuning);
    assert!(wait_for_state(&engine, SlotState::Failed, Duration::from_secs(7)));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "failed too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(6), "failed too late: {elapsed:?}");
    assert_eq!(engine.status().message, "receiver did not connect");
}

#[test]
fn source_loss_mid_stream_fails_the_slot() {
    let (_aes67, _monitor, port) = bind_flow_pair();
    let cfg = loopback_cfg(port);

    let system = ScriptedSystem::new();
    system.add("SYNTH", ScriptedSource::new(tone_frames(2, 960), Tail::Disconnect));

    let engine = SlotEngine::start(&cfg, &system, None, &fast_tuning());
    assert!(wait_for_state(&engine, SlotState::Failed, Duration::from_secs(2)));

    let status = engine.status();
    assert_eq!(status.message, "source disconnected");
    // It was live before the source vanished.
    assert!(status.packets_sent > 0);
}

#[test]
fn clean_stop_cuts_the_flow() {
    let (aes67, _monitor, port) = bind_flow_pair();
    let cfg = loopback_cfg(port);

    let system = ScriptedSystem::new();
    system.add(
        "SYNTH",
        ScriptedSource::new(Vec::new(), Tail::Repeat(tone_frame(48, 0.1))),
    );

    let mut engine = SlotEngine::start(&cfg, &system, None, &fast_tuning());
    assert!(wait_for_state(&engine, SlotState::Live, Duration::from_secs(2)));

    engine.stop();
    assert_eq!(engine.state(), SlotState::Idle);

    // Flush anything sent before the stop completed, then the wire must
    // stay quiet.
    let _ = drain_packets(&aes67);
    std::thread::sleep(Duration::from_millis(100));
    aes67
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 2048];
    assert!(aes67.recv_from(&mut buf).is_err());

    // stop() is idempotent.
    engine.stop();
    assert_eq!(engine.state(), SlotState::Idle);
}

#[test]
fn persistent_send_errors_fail_the_slot() {
    // Broadcast without SO_BROADCAST is denied on every send, which is the
    // cheapest reliable way to make send_to fail repeatedly.
    let cfg = SlotConfig {
        mcast_ip: Ipv4Addr::new(255, 255, 255, 255),
        ..loopback_cfg(40_000)
    };

    let system = ScriptedSystem::new();
    system.add(
        "SYNTH",
        ScriptedSource::new(Vec::new(), Tail::Repeat(tone_frame(48, 0.1))),
    );

    let tuning = EngineTuning {
        max_consecutive_send_errors: 5,
        ..fast_tuning()
    };
    let engine = SlotEngine::start(&cfg, &system, None, &tuning);
    assert!(wait_for_state(&engine, SlotState::Failed, Duration::from_secs(3)));

    let status = engine.status();
    assert_eq!(status.message, "excessive send errors");
    assert!(status.send_errors > 5);
}

#[test]
fn unknown_source_fails_at_start() {
    let (_aes67, _monitor, port) = bind_flow_pair();
    let mut cfg = loopback_cfg(port);
    cfg.ndi_source_name = Some("NOT THERE".into());

    let system = ScriptedSystem::new();
    let engine = SlotEngine::start(&cfg, &system, None, &fast_tuning());

    assert_eq!(engine.state(), SlotState::Failed);
    assert_eq!(engine.status().message, "source not found: NOT THERE");
}
