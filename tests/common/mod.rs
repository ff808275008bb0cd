#![allow(dead_code)]

use std::collections::HashMap;

use embassy_time::Instant;
use fixture_rs::credentials::Credentials;
use fixture_rs::mdns::ServiceRecord;
use fixture_rs::protocol::{Request, Response, encode_request_frame};
use fixture_rs::session::SessionId;
use fixture_rs::transport::{LinkStatus, Transport, TransportError};
use fixture_rs::wifi::WifiSubsystem;

pub const HARDWARE_ID: u64 = 0x0123_4567_89AB_CDEF;

pub type TestSubsystem = WifiSubsystem<MockTransport, Credentials>;

/// Transport provider that records every call and answers from its fields
#[derive(Debug)]
pub struct MockTransport {
    pub link: LinkStatus,
    pub rssi: Option<i32>,
    pub ip: Option<[u8; 4]>,
    pub join_result: Result<(), TransportError>,
    pub listen_result: Result<(), TransportError>,
    pub close_result: Result<(), TransportError>,
    pub send_result: Result<(), TransportError>,
    pub send_window: usize,

    pub joins: Vec<(String, String)>,
    pub listening: Option<u16>,
    pub listen_calls: usize,
    pub bound: HashMap<u32, SessionId>,
    pub sent: HashMap<u32, Vec<u8>>,
    pub acknowledged: HashMap<u32, usize>,
    pub closed: Vec<u32>,
    pub aborted: Vec<u32>,
    pub announced: Vec<ServiceRecord>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            link: LinkStatus::Up,
            rssi: Some(-52),
            ip: Some([192, 168, 1, 40]),
            join_result: Ok(()),
            listen_result: Ok(()),
            close_result: Ok(()),
            send_result: Ok(()),
            send_window: 4096,
            joins: Vec::new(),
            listening: None,
            listen_calls: 0,
            bound: HashMap::new(),
            sent: HashMap::new(),
            acknowledged: HashMap::new(),
            closed: Vec::new(),
            aborted: Vec::new(),
            announced: Vec::new(),
        }
    }
}

impl Transport for MockTransport {
    type Handle = u32;

    fn join(&mut self, ssid: &str, password: &str) -> Result<(), TransportError> {
        self.joins.push((ssid.to_owned(), password.to_owned()));
        self.join_result
    }

    fn link_status(&mut self) -> LinkStatus {
        self.link
    }

    fn rssi(&mut self) -> Option<i32> {
        self.rssi
    }

    fn ip_address(&mut self) -> Option<[u8; 4]> {
        self.ip
    }

    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        self.listen_calls += 1;
        self.listen_result?;
        self.listening = Some(port);
        Ok(())
    }

    fn close_listener(&mut self) {
        self.listening = None;
    }

    fn bind_session(&mut self, handle: u32, session: SessionId) {
        self.bound.insert(handle, session);
    }

    fn unbind_session(&mut self, handle: u32) {
        self.bound.remove(&handle);
    }

    fn send_window(&mut self, _handle: u32) -> usize {
        self.send_window
    }

    fn send(&mut self, handle: u32, data: &[u8]) -> Result<(), TransportError> {
        self.send_result?;
        assert!(data.len() <= self.send_window, "send exceeded the window");
        self.sent.entry(handle).or_default().extend_from_slice(data);
        Ok(())
    }

    fn acknowledge(&mut self, handle: u32, length: usize) {
        *self.acknowledged.entry(handle).or_default() += length;
    }

    fn close(&mut self, handle: u32) -> Result<(), TransportError> {
        self.closed.push(handle);
        self.close_result
    }

    fn abort(&mut self, handle: u32) {
        self.aborted.push(handle);
    }

    fn announce(&mut self, record: &ServiceRecord) {
        self.announced.push(record.clone());
    }
}

pub fn at(millis: u64) -> Instant {
    Instant::from_millis(millis)
}

pub fn new_subsystem(transport: MockTransport) -> TestSubsystem {
    let credentials = Credentials::new("fixture-net", "secret").unwrap();
    let subsystem = WifiSubsystem::new(transport, credentials, HARDWARE_ID);
    subsystem.set_up();
    subsystem
}

/// A subsystem that joined, opened its listener and went idle at t = 0
pub fn serving_subsystem() -> TestSubsystem {
    let subsystem = new_subsystem(MockTransport::default());
    run(&subsystem, at(0), 4);
    subsystem
}

pub fn run(subsystem: &TestSubsystem, now: Instant, passes: usize) {
    for _ in 0..passes {
        subsystem.work_at(now).unwrap();
    }
}

pub fn connect(subsystem: &TestSubsystem, handle: u32) -> SessionId {
    subsystem.on_accept(handle, None).unwrap()
}

pub fn send_request(subsystem: &TestSubsystem, session: SessionId, request: &Request) {
    let frame = encode_request_frame(request).unwrap();
    assert_eq!(subsystem.on_receive(session, Some(&frame)), frame.len());
}

/// Decode every complete frame the transport sent on `handle`
pub fn replies(subsystem: &TestSubsystem, handle: u32) -> Vec<Response> {
    let bytes = subsystem.with_transport(|transport| {
        transport.sent.get(&handle).cloned().unwrap_or_default()
    });

    let mut responses = Vec::new();
    let mut rest = bytes.as_slice();
    while let Some((&length, tail)) = rest.split_first() {
        let length = length as usize;
        if tail.len() < length {
            break;
        }
        responses.push(Response::decode(&tail[..length]).unwrap());
        rest = &tail[length..];
    }
    responses
}
