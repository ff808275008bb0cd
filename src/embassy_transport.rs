//! Transport provider on top of esp-wifi and embassy-net
//!
//! The engine runs synchronously under its lock, so it never touches the radio
//! or a socket directly. `controller_task` owns the WiFi controller and caches
//! the link state for the engine to read. Each TCP connection is owned by a
//! `socket_task` worker; the two sides meet in [`NetLinks`]: replies go out
//! through a per-socket pipe, close and abort requests through a signal, and
//! the discovery record through the announcement signal picked up by
//! `mdns_task`.

use crate::config::MAX_CONNECTIONS;
use crate::credentials::{Credentials, StaticCredentials};
use crate::mdns::{MAX_MDNS_PACKET_SIZE, MDNS_MULTICAST_ADDRESS, MDNS_PORT, ServiceRecord, answer};
use crate::session::SessionId;
use crate::transport::{LinkStatus, RadioState, Transport, TransportError};
use crate::wifi::WifiSubsystem;
use crate::println;
use core::cell::Cell;
use edge_mdns::MdnsRequest;
use embassy_futures::select::{Either, Either3, select, select3};
use embassy_net::tcp::TcpSocket;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pipe::Pipe;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use esp_wifi::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController, WifiEvent};

/// One worker more than the session pool, so a surplus client is accepted and refused
pub const SOCKET_SLOTS: usize = MAX_CONNECTIONS + 1;

const SOCKET_BUFFER_SIZE: usize = 1024;
const OUTBOUND_PIPE_SIZE: usize = 1024;
const CHUNK_SIZE: usize = 256;
const MDNS_REANNOUNCE_EVERY: Duration = Duration::from_secs(30);

pub type FixtureSubsystem = WifiSubsystem<EmbassyTransport, StaticCredentials>;

/// Identifies the worker that owns a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSlot(u8);

impl SocketSlot {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketCommand {
    Close,
    Abort,
}

struct SocketLink {
    session: Mutex<CriticalSectionRawMutex, Cell<Option<SessionId>>>,
    outbound: Pipe<CriticalSectionRawMutex, OUTBOUND_PIPE_SIZE>,
    command: Signal<CriticalSectionRawMutex, SocketCommand>,
}

impl SocketLink {
    const fn new() -> Self {
        Self {
            session: Mutex::new(Cell::new(None)),
            outbound: Pipe::new(),
            command: Signal::new(),
        }
    }

    /// Session callbacks are routed to, if the engine still wants them
    fn session(&self) -> Option<SessionId> {
        self.session.lock(Cell::get)
    }

    fn set_session(&self, session: Option<SessionId>) {
        self.session.lock(|cell| cell.set(session));
    }

    /// Forget everything left over from the previous connection
    fn reset(&self) {
        self.set_session(None);
        self.outbound.clear();
        self.command.reset();
    }
}

/// State shared between the engine's transport and the network tasks
pub struct NetLinks {
    sockets: [SocketLink; SOCKET_SLOTS],
    listen_port: Mutex<CriticalSectionRawMutex, Cell<Option<u16>>>,
    radio: Mutex<CriticalSectionRawMutex, Cell<RadioState>>,
    join_request: Signal<CriticalSectionRawMutex, Credentials>,
    announcement: Signal<CriticalSectionRawMutex, ServiceRecord>,
}

impl NetLinks {
    pub const fn new() -> Self {
        Self {
            sockets: [const { SocketLink::new() }; SOCKET_SLOTS],
            listen_port: Mutex::new(Cell::new(None)),
            radio: Mutex::new(Cell::new(RadioState::Down)),
            join_request: Signal::new(),
            announcement: Signal::new(),
        }
    }

    fn socket(&self, slot: SocketSlot) -> &SocketLink {
        &self.sockets[slot.index()]
    }

    fn listen_port(&self) -> Option<u16> {
        self.listen_port.lock(Cell::get)
    }

    fn radio(&self) -> RadioState {
        self.radio.lock(Cell::get)
    }

    fn set_radio(&self, state: RadioState) {
        self.radio.lock(|cell| cell.set(state));
    }

    async fn wait_listening(&self) -> u16 {
        loop {
            if let Some(port) = self.listen_port() {
                return port;
            }
            Timer::after(Duration::from_millis(100)).await;
        }
    }

    async fn wait_listener_closed(&self) {
        while self.listen_port().is_some() {
            Timer::after(Duration::from_millis(100)).await;
        }
    }
}

impl Default for NetLinks {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EmbassyTransport {
    stack: Stack<'static>,
    links: &'static NetLinks,
}

impl EmbassyTransport {
    pub fn new(stack: Stack<'static>, links: &'static NetLinks) -> Self {
        Self { stack, links }
    }
}

impl Transport for EmbassyTransport {
    type Handle = SocketSlot;

    fn join(&mut self, ssid: &str, password: &str) -> Result<(), TransportError> {
        let credentials = Credentials::new(ssid, password).ok_or(TransportError::Other(-1))?;
        // Mark the attempt before the controller task picks it up, so a stale
        // disconnect from the previous link is never read back as this one's
        self.links.set_radio(RadioState::Joining);
        self.links.join_request.signal(credentials);
        Ok(())
    }

    fn link_status(&mut self) -> LinkStatus {
        self.links
            .radio()
            .link_status(self.stack.config_v4().is_some())
    }

    fn rssi(&mut self) -> Option<i32> {
        self.links.radio().rssi()
    }

    fn ip_address(&mut self) -> Option<[u8; 4]> {
        self.stack
            .config_v4()
            .map(|config| config.address.address().octets())
    }

    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        self.links.listen_port.lock(|cell| cell.set(Some(port)));
        Ok(())
    }

    fn close_listener(&mut self) {
        self.links.listen_port.lock(|cell| cell.set(None));
    }

    fn bind_session(&mut self, handle: SocketSlot, session: SessionId) {
        self.links.socket(handle).set_session(Some(session));
    }

    fn unbind_session(&mut self, handle: SocketSlot) {
        self.links.socket(handle).set_session(None);
    }

    fn send_window(&mut self, handle: SocketSlot) -> usize {
        self.links.socket(handle).outbound.free_capacity()
    }

    fn send(&mut self, handle: SocketSlot, data: &[u8]) -> Result<(), TransportError> {
        let written = self
            .links
            .socket(handle)
            .outbound
            .try_write(data)
            .map_err(|_| TransportError::Busy)?;
        if written < data.len() {
            return Err(TransportError::Busy);
        }
        Ok(())
    }

    fn acknowledge(&mut self, _handle: SocketSlot, _length: usize) {
        // The worker only reads what the session can buffer, so the TCP
        // window already tracks what was consumed.
    }

    fn close(&mut self, handle: SocketSlot) -> Result<(), TransportError> {
        self.links.socket(handle).command.signal(SocketCommand::Close);
        Ok(())
    }

    fn abort(&mut self, handle: SocketSlot) {
        self.links.socket(handle).command.signal(SocketCommand::Abort);
    }

    fn announce(&mut self, record: &ServiceRecord) {
        self.links.announcement.signal(record.clone());
    }
}

/// Owns the WiFi controller and carries out join requests from the engine
#[embassy_executor::task]
pub async fn controller_task(mut controller: WifiController<'static>, links: &'static NetLinks) {
    let mut credentials = links.join_request.wait().await;
    loop {
        links.set_radio(RadioState::Joining);
        let Some(client_config) = client_configuration(&credentials) else {
            println!("[WIFI] error: credentials do not fit the driver configuration");
            links.set_radio(RadioState::Failed);
            credentials = links.join_request.wait().await;
            continue;
        };
        if let Err(error) = associate(&mut controller, client_config).await {
            println!("[WIFI] warning: association failed: {:?}", error);
            links.set_radio(RadioState::Failed);
            credentials = links.join_request.wait().await;
            continue;
        }
        links.set_radio(RadioState::Associated {
            rssi: controller.rssi().ok(),
        });

        match select(
            controller.wait_for_event(WifiEvent::StaDisconnected),
            links.join_request.wait(),
        )
        .await
        {
            Either::First(()) => {
                println!("[WIFI] Station disconnected");
                links.set_radio(RadioState::Down);
                credentials = links.join_request.wait().await;
            }
            Either::Second(next) => credentials = next,
        }
    }
}

fn client_configuration(credentials: &Credentials) -> Option<ClientConfiguration> {
    Some(ClientConfiguration {
        ssid: credentials.ssid.as_str().try_into().ok()?,
        password: credentials.password.as_str().try_into().ok()?,
        auth_method: AuthMethod::WPA2Personal,
        ..Default::default()
    })
}

async fn associate(
    controller: &mut WifiController<'static>,
    client_config: ClientConfiguration,
) -> Result<(), esp_wifi::wifi::WifiError> {
    if matches!(controller.is_started(), Ok(true)) {
        // Drop whatever the previous attempt left behind
        let _ = controller.disconnect_async().await;
    }
    controller.set_configuration(&Configuration::Client(client_config))?;
    if !matches!(controller.is_started(), Ok(true)) {
        controller.start_async().await?;
    }
    controller.connect_async().await
}

/// Owns one TCP connection at a time for the engine
#[embassy_executor::task(pool_size = SOCKET_SLOTS)]
pub async fn socket_task(
    stack: Stack<'static>,
    subsystem: &'static FixtureSubsystem,
    links: &'static NetLinks,
    slot: usize,
) {
    let mut rx_buffer = [0u8; SOCKET_BUFFER_SIZE];
    let mut tx_buffer = [0u8; SOCKET_BUFFER_SIZE];
    let handle = SocketSlot(slot as u8);
    let link = links.socket(handle);

    loop {
        let port = links.wait_listening().await;
        link.reset();

        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        match select(socket.accept(port), links.wait_listener_closed()).await {
            Either::First(Ok(())) => {}
            Either::First(Err(error)) => {
                println!("[SERVER] warning: socket {} accept error: {:?}", slot, error);
                let _ = subsystem.on_accept(handle, Some(TransportError::Other(-1)));
                Timer::after(Duration::from_millis(200)).await;
                continue;
            }
            Either::Second(()) => continue,
        }

        if subsystem.on_accept(handle, None).is_err() {
            socket.close();
            let _ = socket.flush().await;
            socket.abort();
            continue;
        }

        serve(&mut socket, subsystem, link).await;
    }
}

async fn serve(socket: &mut TcpSocket<'_>, subsystem: &FixtureSubsystem, link: &SocketLink) {
    let mut inbound = [0u8; CHUNK_SIZE];
    let mut outbound = [0u8; CHUNK_SIZE];

    loop {
        // Once unbound, only a close or abort request is of interest
        let session = link.session();
        let capacity = session
            .map_or(0, |session| subsystem.receive_capacity(session))
            .min(inbound.len());
        let read = async {
            if capacity == 0 {
                Timer::after(Duration::from_millis(10)).await;
                Ok(None)
            } else {
                socket.read(&mut inbound[..capacity]).await.map(Some)
            }
        };

        let next = select3(read, link.outbound.read(&mut outbound), link.command.wait()).await;
        match (next, session) {
            (Either3::First(Ok(Some(0))), Some(session)) => {
                subsystem.on_receive(session, None);
            }
            (Either3::First(Ok(Some(length))), Some(session)) => {
                subsystem.on_receive(session, Some(&inbound[..length]));
            }
            (Either3::First(Err(_)), Some(session)) => {
                subsystem.on_error(session, TransportError::Closed)
            }
            (Either3::First(_), _) => {}
            (Either3::Second(length), session) => {
                let written = write_all(socket, &outbound[..length]).await;
                match (written, session) {
                    (Ok(()), Some(session)) => subsystem.on_sent(session, length),
                    (Err(_), Some(session)) => subsystem.on_error(session, TransportError::Closed),
                    (_, None) => {}
                }
            }
            (Either3::Third(SocketCommand::Close), _) => {
                socket.close();
                let _ = socket.flush().await;
                return;
            }
            (Either3::Third(SocketCommand::Abort), _) => {
                socket.abort();
                return;
            }
        }
    }
}

async fn write_all(
    socket: &mut TcpSocket<'_>,
    mut data: &[u8],
) -> Result<(), embassy_net::tcp::Error> {
    while !data.is_empty() {
        let written = socket.write(data).await?;
        if written == 0 {
            return Err(embassy_net::tcp::Error::ConnectionReset);
        }
        data = &data[written..];
    }
    Ok(())
}

/// Multicasts the discovery record and answers mDNS queries
#[embassy_executor::task]
pub async fn mdns_task(stack: Stack<'static>, links: &'static NetLinks) {
    let mut rx_buffer = [0u8; 1500];
    let mut tx_buffer = [0u8; 1500];
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(error) = socket.bind(MDNS_PORT) {
        println!("[MDNS] error: could not bind port {}: {:?}", MDNS_PORT, error);
        return;
    }

    let [a, b, c, d] = MDNS_MULTICAST_ADDRESS;
    let group = IpAddress::v4(a, b, c, d);
    let multicast = IpEndpoint::new(group, MDNS_PORT);
    let mut query = [0u8; MAX_MDNS_PACKET_SIZE];
    let mut reply = [0u8; MAX_MDNS_PACKET_SIZE];

    // Published once per successful join
    let mut record = links.announcement.wait().await;
    loop {
        let Some(config) = stack.config_v4() else {
            record = links.announcement.wait().await;
            continue;
        };
        let ip = config.address.address().octets();
        if let Err(error) = stack.join_multicast_group(group) {
            println!("[MDNS] warning: could not join multicast group: {:?}", error);
        }

        println!("[MDNS] Announcing {}.local", record.hostname);
        let mut last_announcement = Instant::now();
        if let Ok(Some(packet)) = answer(&record, ip, MdnsRequest::None, &mut reply) {
            if let Err(error) = socket.send_to(packet, multicast).await {
                println!("[MDNS] warning: announcement failed: {:?}", error);
            }
        }

        loop {
            let received = select(
                links.announcement.wait(),
                with_timeout(Duration::from_secs(1), socket.recv_from(&mut query)),
            )
            .await;

            match received {
                Either::First(new_record) => {
                    record = new_record;
                    break;
                }
                Either::Second(Ok(Ok((length, meta)))) => {
                    // Queries from a port other than 5353 get a unicast reply
                    let legacy = meta.endpoint.port != MDNS_PORT;
                    let request = MdnsRequest::Request {
                        legacy,
                        multicast: !legacy,
                        data: &query[..length],
                    };
                    if let Ok(Some(packet)) = answer(&record, ip, request, &mut reply) {
                        let destination = if legacy { meta.endpoint } else { multicast };
                        if let Err(error) = socket.send_to(packet, destination).await {
                            println!("[MDNS] warning: query response failed: {:?}", error);
                        }
                    }
                }
                Either::Second(Ok(Err(error))) => {
                    println!("[MDNS] warning: receive error: {:?}", error);
                }
                Either::Second(Err(_)) => {}
            }

            if last_announcement.elapsed() >= MDNS_REANNOUNCE_EVERY {
                if let Ok(Some(packet)) = answer(&record, ip, MdnsRequest::None, &mut reply) {
                    if let Err(error) = socket.send_to(packet, multicast).await {
                        println!("[MDNS] warning: announcement failed: {:?}", error);
                    }
                }
                last_announcement = Instant::now();
            }
        }
    }
}
