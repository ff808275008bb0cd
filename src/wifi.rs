//! WiFi subsystem
//!
//! Drives the connection lifecycle and serves the fixture protocol to a fixed
//! pool of client sessions. The scheduler calls [`WifiSubsystem::work`]
//! repeatedly; the transport provider calls the `on_*` methods whenever it has
//! news about a connection. Both sides take the same lock before touching
//! session buffers or the state snapshot, and never hold it across a wait.

use crate::config::{LISTEN_PORT, MAX_CONNECTIONS, WIFI_CONNECT_TIMEOUT_MS};
use crate::credentials::{CredentialStore, StaticCredentials};
use crate::mdns::{ServiceRecord, hardware_id_hex};
use crate::protocol::{
    CommandResult, DataKind, FrameStatus, OutputId, OutputState, Request, Response, SystemInfo,
    SystemState, WriteOutput, encode_reply, try_decode_frame,
};
use crate::session::{SessionId, SessionPool};
use crate::state_machine::{ConnectionState, ConnectionStateMachine, SystemEvent};
use crate::transport::{LinkStatus, Transport, TransportError};
use crate::{FixtureError, config, println};
use alloc::boxed::Box;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};

/// Handler for `WriteOutput` requests, registered by the output driver
pub type WriteRequestCallback = Box<dyn FnMut(&WriteOutput) -> CommandResult + Send>;

/// Network session and protocol engine
pub struct WifiSubsystem<T: Transport, C: CredentialStore = StaticCredentials> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<T, C>>>,
    state_data: Mutex<CriticalSectionRawMutex, RefCell<SystemState>>,
}

struct Inner<T: Transport, C> {
    machine: ConnectionStateMachine,
    transport: T,
    credentials: C,
    hardware_id: u64,
    record: Option<ServiceRecord>,
    sessions: SessionPool<T::Handle>,
    system_info: Option<SystemInfo>,
    join_started: Option<Instant>,
    write_request_callback: Option<WriteRequestCallback>,
}

impl<T: Transport, C: CredentialStore> WifiSubsystem<T, C> {
    pub fn new(transport: T, credentials: C, hardware_id: u64) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                machine: ConnectionStateMachine::new(),
                transport,
                credentials,
                hardware_id,
                record: None,
                sessions: SessionPool::new(),
                system_info: None,
                join_started: None,
                write_request_callback: None,
            })),
            state_data: Mutex::new(RefCell::new(SystemState::default())),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<T, C>) -> R) -> R {
        self.inner.lock(|inner| f(&mut inner.borrow_mut()))
    }

    /// Derive the discovery record and start the connection lifecycle
    pub fn set_up(&self) {
        self.with_inner(|inner| {
            let record = ServiceRecord::for_hardware_id(inner.hardware_id, LISTEN_PORT);
            println!("[WIFI] Hostname: {}", record.hostname);
            inner.record = Some(record);
            inner
                .machine
                .handle_event(SystemEvent::SystemStarted, Instant::now());
        });
    }

    /// Whether a `work()` pass now would do anything
    pub fn has_work(&self) -> bool {
        self.has_work_at(Instant::now())
    }

    pub fn has_work_at(&self, now: Instant) -> bool {
        self.with_inner(|inner| inner.machine.has_work(now))
    }

    /// Run one step of the subsystem
    pub fn work(&self) -> Result<(), FixtureError> {
        self.work_at(Instant::now())
    }

    /// Run one step as if the clock read `now`.
    ///
    /// An error means the subsystem hit an unrecoverable condition and is now
    /// halted; the caller is expected to stop the device.
    pub fn work_at(&self, now: Instant) -> Result<(), FixtureError> {
        self.with_inner(|inner| inner.work(now, &self.state_data))
    }

    pub fn current_state(&self) -> ConnectionState {
        self.with_inner(|inner| inner.machine.current_state())
    }

    /// Failed joins since the link was last up
    pub fn retry_count(&self) -> u32 {
        self.with_inner(|inner| inner.machine.retry_count())
    }

    pub fn active_sessions(&self) -> usize {
        self.with_inner(|inner| inner.sessions.in_use_count())
    }

    pub fn service_record(&self) -> Option<ServiceRecord> {
        self.with_inner(|inner| inner.record.clone())
    }

    /// Run `f` against the transport provider under the network lock
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.with_inner(|inner| f(&mut inner.transport))
    }

    /// Copy of the current state snapshot
    pub fn state_data(&self) -> SystemState {
        self.state_data.lock(|state| *state.borrow())
    }

    pub fn update_state(&self, f: impl FnOnce(&mut SystemState)) {
        self.state_data.lock(|state| f(&mut state.borrow_mut()));
    }

    pub fn update_output_state(&self, output_id: OutputId, f: impl FnOnce(&mut OutputState)) {
        self.update_state(|state| f(state.output_mut(output_id)));
    }

    /// Register the `WriteOutput` handler. Without one every write is answered `Ok`.
    ///
    /// The handler runs under the network lock: it may update the state
    /// snapshot but must not call any other method of this subsystem.
    pub fn set_write_request_callback(
        &self,
        callback: impl FnMut(&WriteOutput) -> CommandResult + Send + 'static,
    ) {
        self.with_inner(|inner| inner.write_request_callback = Some(Box::new(callback)));
    }

    /// A connection arrived on the listener, or accepting one failed
    pub fn on_accept(
        &self,
        handle: T::Handle,
        error: Option<TransportError>,
    ) -> Result<SessionId, FixtureError> {
        self.with_inner(|inner| inner.accept(handle, error))
    }

    /// Data arrived for `session`; `None` means the peer closed the stream.
    /// Returns how many bytes were buffered and acknowledged.
    pub fn on_receive(&self, session: SessionId, data: Option<&[u8]>) -> usize {
        self.with_inner(|inner| inner.receive(session, data))
    }

    pub fn on_sent(&self, session: SessionId, length: usize) {
        self.with_inner(|inner| {
            let session = inner.sessions.get_mut(session);
            if session.in_use {
                session.bytes_sent = session.bytes_sent.saturating_add(length);
            }
        });
    }

    /// Bytes confirmed sent on `session` since it was opened
    pub fn bytes_sent(&self, session: SessionId) -> usize {
        self.with_inner(|inner| inner.sessions.get(session).bytes_sent)
    }

    pub fn on_error(&self, session: SessionId, error: TransportError) {
        self.with_inner(|inner| {
            if inner.sessions.get(session).in_use {
                println!(
                    "[SERVER] warning: session {} transport error {:?}",
                    session.index(),
                    error
                );
                inner.close_session(session);
            }
        });
    }

    /// Free space in the session's read buffer
    pub fn receive_capacity(&self, session: SessionId) -> usize {
        self.with_inner(|inner| {
            let session = inner.sessions.get(session);
            if session.in_use {
                session.read_buffer.available_size()
            } else {
                0
            }
        })
    }
}

impl<T: Transport, C: CredentialStore> Inner<T, C> {
    fn work(
        &mut self,
        now: Instant,
        state_data: &Mutex<CriticalSectionRawMutex, RefCell<SystemState>>,
    ) -> Result<(), FixtureError> {
        self.machine.poll_timer(now);

        match self.machine.current_state() {
            ConnectionState::Disconnected => self.connect(now),
            ConnectionState::Connecting => {
                self.check_link(now);
                Ok(())
            }
            ConnectionState::Connected => self.start_server(now),
            ConnectionState::PreIdle => {
                self.pre_idle(now);
                Ok(())
            }
            ConnectionState::ProcessClientData => {
                self.process_clients(state_data);
                self.machine
                    .handle_event(SystemEvent::ClientDataProcessed, now);
                Ok(())
            }
            ConnectionState::VerifyConnected => {
                self.verify_connection(now);
                Ok(())
            }
            ConnectionState::Invalid
            | ConnectionState::Idle
            | ConnectionState::Waiting
            | ConnectionState::Halted => Ok(()),
        }
    }

    fn connect(&mut self, now: Instant) -> Result<(), FixtureError> {
        let credentials = self.credentials.credentials();
        println!("[WIFI] Joining network \"{}\"", credentials.ssid);

        match self
            .transport
            .join(&credentials.ssid, &credentials.password)
        {
            Ok(()) => {
                self.join_started = Some(now);
                self.machine.handle_event(SystemEvent::JoinIssued, now);
                Ok(())
            }
            Err(error) => {
                println!("[WIFI] error: could not issue join request: {:?}", error);
                self.machine.handle_event(SystemEvent::FatalError, now);
                Err(FixtureError::WiFiError)
            }
        }
    }

    fn check_link(&mut self, now: Instant) {
        let status = self.transport.link_status();

        if !self.machine.link_status_changed(status) {
            let timed_out = self.join_started.is_some_and(|started| {
                now.saturating_duration_since(started)
                    >= Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS)
            });
            if timed_out {
                println!(
                    "[WIFI] warning: no link after {} ms, giving up on this attempt",
                    WIFI_CONNECT_TIMEOUT_MS
                );
                self.join_failed(now);
            }
            return;
        }

        match status {
            LinkStatus::Down => println!("[WIFI] Link down"),
            LinkStatus::Joining => println!("[WIFI] Joining..."),
            LinkStatus::NoIp => match self.transport.rssi() {
                Some(rssi) => println!("[WIFI] Associated, waiting for an address (RSSI {} dBm)", rssi),
                None => println!("[WIFI] Associated, waiting for an address"),
            },
            LinkStatus::Up => {
                match self.transport.rssi() {
                    Some(rssi) => println!("[WIFI] Link up (RSSI {} dBm)", rssi),
                    None => println!("[WIFI] Link up"),
                }
                if let Some(record) = self.record.as_ref() {
                    self.transport.announce(record);
                }
                self.join_started = None;
                self.machine.handle_event(SystemEvent::LinkUp, now);
            }
            LinkStatus::Failed => {
                println!("[WIFI] error: join failed");
                self.join_failed(now);
            }
            LinkStatus::NoNetwork => {
                println!("[WIFI] error: network not found");
                self.join_failed(now);
            }
            LinkStatus::BadAuth => {
                println!("[WIFI] error: authentication rejected");
                self.join_failed(now);
            }
        }
    }

    fn join_failed(&mut self, now: Instant) {
        self.join_started = None;
        self.machine.handle_event(SystemEvent::JoinFailed, now);
        println!(
            "[WIFI] Retrying in {} ms (attempt {})",
            config::WIFI_CONNECT_RETRY_MS,
            self.machine.retry_count() + 1
        );
    }

    fn start_server(&mut self, now: Instant) -> Result<(), FixtureError> {
        if let Err(error) = self.transport.listen(LISTEN_PORT) {
            println!(
                "[SERVER] error: could not listen on port {}: {:?}",
                LISTEN_PORT, error
            );
            self.machine.handle_event(SystemEvent::FatalError, now);
            return Err(FixtureError::ListenError);
        }

        match self.transport.ip_address() {
            Some(ip) => println!(
                "[SERVER] Listening on {}.{}.{}.{}:{}",
                ip[0], ip[1], ip[2], ip[3], LISTEN_PORT
            ),
            None => println!("[SERVER] Listening on port {}", LISTEN_PORT),
        }
        self.machine.handle_event(SystemEvent::ServerListening, now);
        Ok(())
    }

    fn pre_idle(&mut self, now: Instant) {
        if self.sessions.has_client_work() {
            self.machine
                .handle_event(SystemEvent::ClientDataPending, now);
        } else if self.machine.verify_needed() {
            self.machine.handle_event(SystemEvent::VerifyDue, now);
        } else {
            self.machine.schedule_verify(now);
            self.machine.handle_event(SystemEvent::NothingPending, now);
        }
    }

    fn process_clients(&mut self, state_data: &Mutex<CriticalSectionRawMutex, RefCell<SystemState>>) {
        for id in self.sessions.ids() {
            if !self.sessions.get(id).in_use {
                continue;
            }
            if self.sessions.get(id).data_pending {
                self.process_session(id, state_data);
            }
            self.send_pending(id);
        }
    }

    /// Handle at most one frame from the session's read buffer
    fn process_session(
        &mut self,
        id: SessionId,
        state_data: &Mutex<CriticalSectionRawMutex, RefCell<SystemState>>,
    ) {
        let session = self.sessions.get_mut(id);
        session.data_pending = false;

        let request = match try_decode_frame(&mut session.read_buffer) {
            FrameStatus::Incomplete => return,
            FrameStatus::Resync => {
                session.read_buffer.clear();
                return;
            }
            FrameStatus::Invalid(error) => {
                println!(
                    "[SERVER] warning: session {} sent a malformed frame ({:?}), dropping buffered input",
                    id.index(),
                    error
                );
                session.read_buffer.clear();
                return;
            }
            FrameStatus::Request(request, _) => request,
        };

        let response = self.dispatch(request, state_data);

        let session = self.sessions.get_mut(id);
        if let Some(response) = response {
            if let Err(error) = encode_reply(&mut session.write_buffer, &response) {
                println!(
                    "[SERVER] warning: session {} reply dropped: {:?}",
                    id.index(),
                    error
                );
            }
        }
        // One frame per session per pass
        if !session.read_buffer.is_empty() {
            session.data_pending = true;
        }
    }

    fn dispatch(
        &mut self,
        request: Request,
        state_data: &Mutex<CriticalSectionRawMutex, RefCell<SystemState>>,
    ) -> Option<Response> {
        match request {
            Request::GetData(DataKind::SystemState) => Some(Response::SystemState(
                state_data.lock(|state| *state.borrow()),
            )),
            Request::GetData(DataKind::SystemInfo) => {
                let hardware_id = self.hardware_id;
                let info = self
                    .system_info
                    .get_or_insert_with(|| system_info(hardware_id));
                Some(Response::SystemInfo(info.clone()))
            }
            Request::WriteOutput(write) => {
                let result = match self.write_request_callback.as_mut() {
                    Some(callback) => callback(&write),
                    None => CommandResult::Ok,
                };
                Some(Response::CommandResult(result))
            }
            Request::Unsupported(tag) => {
                println!("[SERVER] warning: unsupported request kind 0x{:02X}, ignored", tag);
                None
            }
        }
    }

    /// Drain as much of the write buffer as the send window allows
    fn send_pending(&mut self, id: SessionId) {
        let session = self.sessions.get_mut(id);
        let Some(handle) = session.handle else {
            return;
        };
        if session.write_buffer.is_empty() {
            return;
        }

        let length = self
            .transport
            .send_window(handle)
            .min(session.write_buffer.len());
        if length == 0 {
            return;
        }

        let result = self
            .transport
            .send(handle, &session.write_buffer.data()[..length]);
        match result {
            Ok(()) => {
                let removed = self.sessions.get_mut(id).write_buffer.remove(length);
                debug_assert!(removed, "sent more than was queued");
            }
            Err(error) => {
                println!(
                    "[SERVER] warning: session {} send failed ({:?}), closing",
                    id.index(),
                    error
                );
                self.close_session(id);
            }
        }
    }

    fn verify_connection(&mut self, now: Instant) {
        let status = self.transport.link_status();
        if status == LinkStatus::Up {
            self.machine.handle_event(SystemEvent::LinkStillUp, now);
            return;
        }

        println!(
            "[WIFI] warning: link lost ({:?}), closing {} session(s)",
            status,
            self.sessions.in_use_count()
        );
        for id in self.sessions.ids() {
            self.close_session(id);
        }
        self.transport.close_listener();
        self.machine.handle_event(SystemEvent::LinkLost, now);
    }

    fn accept(
        &mut self,
        handle: T::Handle,
        error: Option<TransportError>,
    ) -> Result<SessionId, FixtureError> {
        if let Some(error) = error {
            println!("[SERVER] warning: accept failed: {:?}", error);
            self.refuse(handle);
            return Err(FixtureError::SessionError);
        }
        if !self.machine.is_serving() {
            println!("[SERVER] warning: connection arrived while not serving, refused");
            self.refuse(handle);
            return Err(FixtureError::SessionError);
        }

        let Some(id) = self.sessions.claim(handle) else {
            println!(
                "[SERVER] warning: all {} sessions in use, connection refused",
                MAX_CONNECTIONS
            );
            self.refuse(handle);
            return Err(FixtureError::SessionError);
        };

        self.transport.bind_session(handle, id);
        println!(
            "[SERVER] Session {} opened ({} of {} in use)",
            id.index(),
            self.sessions.in_use_count(),
            MAX_CONNECTIONS
        );
        self.wake();
        Ok(id)
    }

    fn refuse(&mut self, handle: T::Handle) {
        if self.transport.close(handle).is_err() {
            self.transport.abort(handle);
        }
    }

    fn receive(&mut self, id: SessionId, data: Option<&[u8]>) -> usize {
        if !self.sessions.get(id).in_use {
            return 0;
        }
        let Some(data) = data else {
            println!("[SERVER] Session {} closed by peer", id.index());
            self.close_session(id);
            return 0;
        };

        let session = self.sessions.get_mut(id);
        let length = data.len().min(session.read_buffer.available_size());
        if length < data.len() {
            println!(
                "[SERVER] warning: session {} read buffer full, dropped {} bytes",
                id.index(),
                data.len() - length
            );
        }
        if length == 0 || !session.read_buffer.write(&data[..length]) {
            return 0;
        }
        session.data_pending = true;

        if let Some(handle) = session.handle {
            self.transport.acknowledge(handle, length);
        }
        self.wake();
        length
    }

    /// Leave `Idle` so the next pass services the sessions
    fn wake(&mut self) {
        self.machine.wake();
    }

    /// Tear a session down. Does nothing if it is already closed.
    fn close_session(&mut self, id: SessionId) {
        let session = self.sessions.get_mut(id);
        if !session.in_use {
            return;
        }

        if let Some(handle) = session.handle {
            self.transport.unbind_session(handle);
            if let Err(error) = self.transport.close(handle) {
                println!(
                    "[SERVER] warning: session {} close failed ({:?}), aborting",
                    id.index(),
                    error
                );
                self.transport.abort(handle);
            }
        }
        self.sessions.get_mut(id).release();
        println!("[SERVER] Session {} closed", id.index());
    }
}

fn system_info(hardware_id: u64) -> SystemInfo {
    SystemInfo {
        hardware_id: hardware_id_hex(hardware_id),
        model: config::MODEL.try_into().unwrap_or_default(),
        manufacturer: config::MANUFACTURER.try_into().unwrap_or_default(),
        firmware_version: config::FIRMWARE_VERSION.into(),
        hardware_version: config::HARDWARE_VERSION.into(),
    }
}
