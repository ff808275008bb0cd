//! mDNS service discovery module
//!
//! Describes how the fixture advertises itself. The DNS-SD answers (PTR, SRV,
//! TXT and A records) are produced by edge-mdns from the record and the
//! current address, both for unsolicited announcements and for query replies.

use crate::{FixtureError, config, println};
use core::fmt::Write as _;
use core::net::{Ipv4Addr, Ipv6Addr};
use edge_mdns::{
    HostAnswersMdnsHandler, MdnsHandler, MdnsRequest, MdnsResponse,
    domain::base::Ttl,
    host::{Host, Service, ServiceAnswers},
};
use heapless::String;

/// mDNS multicast group and port
pub const MDNS_MULTICAST_ADDRESS: [u8; 4] = [224, 0, 0, 251];
pub const MDNS_PORT: u16 = 5353;

/// Maximum mDNS packet size we send or accept
pub const MAX_MDNS_PACKET_SIZE: usize = 512;

/// Record time-to-live in seconds
const RECORD_TTL: u32 = 120;

const TXT_HARDWARE_ID_KEY: &str = "hwid";

/// The discovery record published for this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub hostname: String<32>,
    pub service: &'static str,
    pub protocol: &'static str,
    pub port: u16,
    /// Published as the single TXT item `hwid=<hardware id>`
    pub hardware_id: String<16>,
}

impl ServiceRecord {
    pub fn for_hardware_id(hardware_id: u64, port: u16) -> Self {
        let mut hostname = String::new();
        let _ = write!(hostname, "{}{:016X}", config::HOSTNAME_PREFIX, hardware_id);

        Self {
            hostname,
            service: config::MDNS_SERVICE,
            protocol: config::MDNS_PROTOCOL,
            port,
            hardware_id: hardware_id_hex(hardware_id),
        }
    }
}

/// Hardware id as the 16 upper-case hex digits used in names and `SystemInfo`
pub fn hardware_id_hex(hardware_id: u64) -> String<16> {
    let mut hex = String::new();
    let _ = write!(hex, "{:016X}", hardware_id);
    hex
}

/// Answer `request` for `record` reachable at `ip`, writing into `buffer`.
///
/// `MdnsRequest::None` yields the unsolicited announcement. Returns `None` when
/// the request does not concern this device.
pub fn answer<'a>(
    record: &ServiceRecord,
    ip: [u8; 4],
    request: MdnsRequest<'_>,
    buffer: &'a mut [u8],
) -> Result<Option<&'a [u8]>, FixtureError> {
    let txt_kvs = [(TXT_HARDWARE_ID_KEY, record.hardware_id.as_str())];
    let host = Host {
        hostname: record.hostname.as_str(),
        ipv4: Ipv4Addr::from(ip),
        ipv6: Ipv6Addr::UNSPECIFIED,
        ttl: Ttl::from_secs(RECORD_TTL),
    };
    let service = Service {
        name: record.hostname.as_str(),
        priority: 0,
        weight: 0,
        service: record.service,
        protocol: record.protocol,
        port: record.port,
        service_subtypes: &[],
        txt_kvs: &txt_kvs,
    };

    let mut handler = HostAnswersMdnsHandler::new(ServiceAnswers::new(&host, &service));
    match handler.handle(request, buffer) {
        Ok(MdnsResponse::Reply { data, .. }) => Ok(Some(data)),
        Ok(MdnsResponse::None) => Ok(None),
        Err(error) => {
            println!("[MDNS] warning: could not answer: {:?}", error);
            Err(FixtureError::MdnsError)
        }
    }
}
