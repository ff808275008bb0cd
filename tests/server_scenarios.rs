//! Client-facing behavior of the server: framing, dispatch and session limits

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use fixture_rs::config::{MAX_CONNECTIONS, SESSION_BUFFER_SIZE};
use fixture_rs::protocol::{
    CommandResult, DataKind, OutputId, Request, Response, RgbcwColor, Version, WriteOutput,
};
use fixture_rs::state_machine::ConnectionState;
use fixture_rs::FixtureError;

fn write_request(output_id: OutputId) -> Request {
    Request::WriteOutput(WriteOutput {
        output_id,
        color: RgbcwColor::new(10, 20, 30, 40, 50),
        brightness: 200,
        on: true,
    })
}

#[test]
fn zero_length_frame_clears_input_without_reply() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    assert_eq!(subsystem.on_receive(session, Some(&[0x00, 0x02, 0x01, 0x02])), 4);
    run(&subsystem, at(10), 3);

    assert_eq!(subsystem.receive_capacity(session), SESSION_BUFFER_SIZE);
    assert!(replies(&subsystem, 1).is_empty());
    assert_eq!(subsystem.active_sessions(), 1);
}

#[test]
fn system_info_reports_device_identity() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    send_request(&subsystem, session, &Request::GetData(DataKind::SystemInfo));
    run(&subsystem, at(10), 2);

    let replies = replies(&subsystem, 1);
    assert_eq!(replies.len(), 1);
    let Response::SystemInfo(info) = &replies[0] else {
        panic!("expected system info, got {:?}", replies[0]);
    };
    assert_eq!(info.hardware_id.as_str(), "0123456789ABCDEF");
    assert_eq!(info.model.as_str(), fixture_rs::config::MODEL);
    assert_eq!(info.manufacturer.as_str(), fixture_rs::config::MANUFACTURER);
    assert_eq!(
        info.firmware_version,
        Version::from(fixture_rs::config::FIRMWARE_VERSION)
    );
    assert_eq!(
        info.hardware_version,
        Version::from(fixture_rs::config::HARDWARE_VERSION)
    );
}

#[test]
fn write_without_handler_is_acknowledged() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    send_request(&subsystem, session, &write_request(OutputId::A));
    run(&subsystem, at(10), 2);

    assert_eq!(
        replies(&subsystem, 1),
        vec![Response::CommandResult(CommandResult::Ok)]
    );
}

#[test]
fn write_handler_result_is_returned() {
    let subsystem = serving_subsystem();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    subsystem.set_write_request_callback(move |write| {
        recorder.lock().unwrap().push(*write);
        if write.output_id == OutputId::B {
            CommandResult::Error
        } else {
            CommandResult::Ok
        }
    });

    let session = connect(&subsystem, 1);
    send_request(&subsystem, session, &write_request(OutputId::B));
    run(&subsystem, at(10), 2);

    assert_eq!(
        replies(&subsystem, 1),
        vec![Response::CommandResult(CommandResult::Error)]
    );
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].color, RgbcwColor::new(10, 20, 30, 40, 50));
    assert_eq!(seen[0].brightness, 200);
}

#[test]
fn system_state_reply_reflects_snapshot_updates() {
    let subsystem = serving_subsystem();
    subsystem.update_output_state(OutputId::A, |output| {
        output.brightness = 128;
        output.current = 1500;
    });
    subsystem.update_state(|state| {
        state.fan.rpm = 1200;
        state.temperatures.driver = 4150;
        state.temperatures.outputs[1] = Some(3875);
    });

    let session = connect(&subsystem, 1);
    send_request(&subsystem, session, &Request::GetData(DataKind::SystemState));
    run(&subsystem, at(10), 2);

    let expected = subsystem.state_data();
    assert_eq!(expected.output(OutputId::A).current, 1500);
    assert_eq!(replies(&subsystem, 1), vec![Response::SystemState(expected)]);
}

#[test]
fn unsupported_request_gets_no_reply() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    // Unknown kind tag, then an unknown read selector
    assert_eq!(subsystem.on_receive(session, Some(&[1, 0x7F, 2, 0x01, 0x09])), 5);
    run(&subsystem, at(10), 6);

    assert!(replies(&subsystem, 1).is_empty());
    assert_eq!(subsystem.receive_capacity(session), SESSION_BUFFER_SIZE);
    assert_eq!(subsystem.active_sessions(), 1);
}

#[test]
fn invalid_frame_discards_everything_buffered() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    // Truncated write request followed by a valid read request
    let mut bytes = vec![2, 0x02, 0x01];
    bytes.extend_from_slice(&[2, 0x01, 0x02]);
    subsystem.on_receive(session, Some(&bytes));
    run(&subsystem, at(10), 6);

    assert!(replies(&subsystem, 1).is_empty());
    assert_eq!(subsystem.receive_capacity(session), SESSION_BUFFER_SIZE);
    assert_eq!(subsystem.active_sessions(), 1);
}

#[test]
fn frame_split_across_deliveries_is_handled_once_complete() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);
    let frame = fixture_rs::protocol::encode_request_frame(&write_request(OutputId::A)).unwrap();

    let (head, tail) = frame.split_at(4);
    subsystem.on_receive(session, Some(head));
    run(&subsystem, at(10), 4);
    assert!(replies(&subsystem, 1).is_empty());

    subsystem.on_receive(session, Some(tail));
    run(&subsystem, at(10), 2);
    assert_eq!(
        replies(&subsystem, 1),
        vec![Response::CommandResult(CommandResult::Ok)]
    );
}

#[test]
fn coalesced_frames_are_served_one_per_pass() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    let mut bytes = Vec::new();
    for _ in 0..2 {
        let frame =
            fixture_rs::protocol::encode_request_frame(&Request::GetData(DataKind::SystemState))
                .unwrap();
        bytes.extend_from_slice(&frame);
    }
    subsystem.on_receive(session, Some(&bytes));

    run(&subsystem, at(10), 1);
    assert_eq!(replies(&subsystem, 1).len(), 1);

    run(&subsystem, at(10), 2);
    assert_eq!(replies(&subsystem, 1).len(), 2);
}

#[test]
fn replies_drain_through_a_small_send_window() {
    let subsystem = serving_subsystem();
    subsystem.with_transport(|transport| transport.send_window = 3);
    let session = connect(&subsystem, 1);

    send_request(&subsystem, session, &Request::GetData(DataKind::SystemInfo));
    run(&subsystem, at(10), 2);
    let partial = subsystem.with_transport(|transport| transport.sent[&1].len());
    assert_eq!(partial, 3);

    run(&subsystem, at(10), 200);
    let replies = replies(&subsystem, 1);
    assert_eq!(replies.len(), 1);
    assert!(matches!(replies[0], Response::SystemInfo(_)));
    assert_eq!(subsystem.current_state(), ConnectionState::Idle);
}

#[test]
fn oversized_delivery_is_bounded_by_buffer_space() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);

    let data = vec![0u8; SESSION_BUFFER_SIZE + 100];
    assert_eq!(subsystem.on_receive(session, Some(&data)), SESSION_BUFFER_SIZE);
    assert_eq!(subsystem.receive_capacity(session), 0);
    assert_eq!(subsystem.on_receive(session, Some(&[1, 2, 3])), 0);

    let acknowledged = subsystem.with_transport(|transport| transport.acknowledged[&1]);
    assert_eq!(acknowledged, SESSION_BUFFER_SIZE);
}

#[test]
fn ninth_connection_is_refused_and_others_keep_working() {
    let subsystem = serving_subsystem();

    let sessions: Vec<_> = (1..=MAX_CONNECTIONS as u32)
        .map(|handle| (handle, connect(&subsystem, handle)))
        .collect();
    let refused = MAX_CONNECTIONS as u32 + 1;
    assert_eq!(
        subsystem.on_accept(refused, None),
        Err(FixtureError::SessionError)
    );

    subsystem.with_transport(|transport| {
        assert_eq!(transport.closed, vec![refused]);
        assert!(!transport.bound.contains_key(&refused));
        assert_eq!(transport.bound.len(), MAX_CONNECTIONS);
    });
    assert_eq!(subsystem.active_sessions(), MAX_CONNECTIONS);

    for (_, session) in &sessions {
        send_request(&subsystem, *session, &Request::GetData(DataKind::SystemState));
    }
    run(&subsystem, at(10), 2);
    for (handle, _) in &sessions {
        assert_eq!(replies(&subsystem, *handle).len(), 1, "handle {handle}");
    }
}

#[test]
fn closed_slot_is_reused_by_next_connection() {
    let subsystem = serving_subsystem();
    for handle in 1..=MAX_CONNECTIONS as u32 {
        connect(&subsystem, handle);
    }
    let first = subsystem.on_receive(
        fixture_rs::session::SessionId::from_index(0).unwrap(),
        None,
    );
    assert_eq!(first, 0);
    assert_eq!(subsystem.active_sessions(), MAX_CONNECTIONS - 1);

    let session = connect(&subsystem, 42);
    assert_eq!(session.index(), 0);
}

#[test]
fn peer_close_releases_session() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 7);
    subsystem.on_receive(session, Some(&[2, 0x01]));

    assert_eq!(subsystem.on_receive(session, None), 0);
    assert_eq!(subsystem.active_sessions(), 0);
    assert_eq!(subsystem.receive_capacity(session), 0);
    subsystem.with_transport(|transport| {
        assert_eq!(transport.closed, vec![7]);
        assert!(transport.bound.is_empty());
    });

    // Closing again is a no-op
    subsystem.on_error(session, fixture_rs::transport::TransportError::Closed);
    subsystem.with_transport(|transport| assert_eq!(transport.closed, vec![7]));
}

#[test]
fn failed_close_falls_back_to_abort() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 3);
    subsystem.with_transport(|transport| {
        transport.close_result = Err(fixture_rs::transport::TransportError::Busy)
    });

    subsystem.on_error(session, fixture_rs::transport::TransportError::Other(-13));
    assert_eq!(subsystem.active_sessions(), 0);
    subsystem.with_transport(|transport| {
        assert_eq!(transport.closed, vec![3]);
        assert_eq!(transport.aborted, vec![3]);
    });
}

#[test]
fn send_failure_closes_only_that_session() {
    let subsystem = serving_subsystem();
    let first = connect(&subsystem, 1);
    connect(&subsystem, 2);
    subsystem.with_transport(|transport| {
        transport.send_result = Err(fixture_rs::transport::TransportError::OutOfMemory)
    });

    send_request(&subsystem, first, &Request::GetData(DataKind::SystemState));
    run(&subsystem, at(10), 2);

    assert_eq!(subsystem.active_sessions(), 1);
    subsystem.with_transport(|transport| assert_eq!(transport.closed, vec![1]));
}

#[test]
fn accept_error_is_refused() {
    let subsystem = serving_subsystem();
    assert_eq!(
        subsystem.on_accept(5, Some(fixture_rs::transport::TransportError::OutOfMemory)),
        Err(FixtureError::SessionError)
    );
    assert_eq!(subsystem.active_sessions(), 0);
    subsystem.with_transport(|transport| assert_eq!(transport.closed, vec![5]));
}

#[test]
fn sent_bytes_are_counted_per_session() {
    let subsystem = serving_subsystem();
    let session = connect(&subsystem, 1);
    subsystem.on_sent(session, 12);
    subsystem.on_sent(session, 30);
    assert_eq!(subsystem.bytes_sent(session), 42);

    subsystem.on_receive(session, None);
    assert_eq!(subsystem.bytes_sent(session), 0);
}
