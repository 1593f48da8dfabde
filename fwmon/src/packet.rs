use std::fmt;
use std::net::IpAddr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::Serialize;

use fwmon_common::Event;

use crate::error::PacketError;
use crate::identity::SynapseIdentity;

/// Final decision handed back to the kernel for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Drop,
}

/// Transport protocol carried by the IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(number: u8) -> Self {
        match number {
            1 | 58 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => f.write_str("icmp"),
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Other(n) => write!(f, "ip({})", n),
        }
    }
}

/// TCP header fields kept for policy decisions (connection tracking, SYN floods).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpDetails {
    pub seq: u32,
    pub ack: u32,
    /// Set flags as letters, in `FSRPAUEC` order.
    pub flags: String,
}

/// Normalized view of one intercepted packet.
///
/// Built once by the capture thread of `queue_num` and never reassigned to another queue.
/// Everything except the verdict slot is immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketRecord {
    pub queue_num: u16,
    pub received_at: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Protocol,
    /// Length of the raw capture in bytes.
    pub length: usize,
    pub tcp: Option<TcpDetails>,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub identity: Option<SynapseIdentity>,
    #[serde(skip)]
    verdict: OnceLock<Verdict>,
}

impl PacketRecord {
    /// Parse a raw capture starting at the IP header, as delivered by the kernel queue.
    ///
    /// Pure function of its inputs: the same bytes, queue and timestamp give equal records.
    pub fn from_capture(
        raw: &[u8],
        queue_num: u16,
        received_at: DateTime<Utc>,
    ) -> Result<Self, PacketError> {
        if raw.is_empty() {
            return Err(PacketError::Empty);
        }

        let sliced =
            SlicedPacket::from_ip(raw).map_err(|e| PacketError::Malformed(e.to_string()))?;

        let (src_ip, dst_ip, protocol) = match &sliced.net {
            Some(NetSlice::Ipv4(slice)) => {
                let header = slice.header();
                (
                    IpAddr::V4(header.source_addr()),
                    IpAddr::V4(header.destination_addr()),
                    Protocol::from(slice.payload().ip_number.0),
                )
            }
            Some(NetSlice::Ipv6(slice)) => {
                let header = slice.header();
                (
                    IpAddr::V6(header.source_addr()),
                    IpAddr::V6(header.destination_addr()),
                    Protocol::from(slice.payload().ip_number.0),
                )
            }
            _ => return Err(PacketError::UnsupportedNetwork),
        };

        let mut record = Self {
            queue_num,
            received_at,
            src_ip,
            dst_ip,
            src_port: None,
            dst_port: None,
            protocol,
            length: raw.len(),
            tcp: None,
            payload: Vec::new(),
            identity: None,
            verdict: OnceLock::new(),
        };

        match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                record.src_port = Some(tcp.source_port());
                record.dst_port = Some(tcp.destination_port());
                record.tcp = Some(TcpDetails {
                    seq: tcp.sequence_number(),
                    ack: tcp.acknowledgment_number(),
                    flags: tcp_flags(&[
                        tcp.fin(),
                        tcp.syn(),
                        tcp.rst(),
                        tcp.psh(),
                        tcp.ack(),
                        tcp.urg(),
                        tcp.ece(),
                        tcp.cwr(),
                    ]),
                });
                record.payload = tcp.payload().to_vec();
                record.identity = SynapseIdentity::from_payload(tcp.payload());
            }
            Some(TransportSlice::Udp(udp)) => {
                record.src_port = Some(udp.source_port());
                record.dst_port = Some(udp.destination_port());
                record.payload = udp.payload().to_vec();
            }
            _ => {}
        }

        Ok(record)
    }

    /// Key grouping packets of the same source towards the same service.
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.src_ip,
            self.dst_port.unwrap_or(0),
            self.protocol
        )
    }

    pub fn identity(&self) -> Option<&SynapseIdentity> {
        self.identity.as_ref()
    }

    /// Ask the kernel to let the packet through. The first decision wins.
    pub fn accept(&self) -> bool {
        self.verdict.set(Verdict::Accept).is_ok()
    }

    /// Ask the kernel to drop the packet. The first decision wins.
    pub fn drop_packet(&self) -> bool {
        self.verdict.set(Verdict::Drop).is_ok()
    }

    /// Decision taken by the callback, if any.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict.get().copied()
    }

    /// Build the log event describing this packet.
    pub fn to_event(&self, reason: impl Into<String>) -> Event {
        let event = Event::new(
            self.src_ip.to_string(),
            self.dst_port.unwrap_or(0),
            reason,
        );
        match self.identity.as_ref().and_then(SynapseIdentity::to_metadata) {
            Some(synapse) => event.with_synapse(synapse),
            None => event,
        }
    }
}

fn tcp_flags(bits: &[bool; 8]) -> String {
    const LABELS: [char; 8] = ['F', 'S', 'R', 'P', 'A', 'U', 'E', 'C'];
    LABELS
        .iter()
        .zip(bits)
        .filter(|(_, set)| **set)
        .map(|(label, _)| *label)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use etherparse::PacketBuilder;

    pub(crate) fn tcp_packet(src: [u8; 4], dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ipv4(src, dst, 64)
            .tcp(40000, dport, 1000, 64240)
            .psh()
            .ack(77);
        let mut buf = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut buf, payload).unwrap();
        buf
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_from_capture_tcp() {
        let raw = tcp_packet([10, 0, 0, 1], [192, 168, 1, 100], 8091, b"hello");
        let record = PacketRecord::from_capture(&raw, 3, at(1_700_000_000)).unwrap();

        assert_eq!(record.queue_num, 3);
        assert_eq!(record.src_ip.to_string(), "10.0.0.1");
        assert_eq!(record.dst_ip.to_string(), "192.168.1.100");
        assert_eq!(record.src_port, Some(40000));
        assert_eq!(record.dst_port, Some(8091));
        assert_eq!(record.protocol, Protocol::Tcp);
        assert_eq!(record.length, raw.len());
        assert_eq!(record.payload, b"hello");

        let tcp = record.tcp.as_ref().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.ack, 77);
        assert_eq!(tcp.flags, "PA");
        assert_eq!(record.id(), "10.0.0.1:8091:tcp");
    }

    #[test]
    fn test_from_capture_udp() {
        let builder = PacketBuilder::ipv4([172, 16, 0, 1], [8, 8, 8, 8], 64).udp(53000, 53);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"q").unwrap();

        let record = PacketRecord::from_capture(&raw, 1, at(0)).unwrap();
        assert_eq!(record.protocol, Protocol::Udp);
        assert_eq!(record.dst_port, Some(53));
        assert!(record.tcp.is_none());
        assert!(record.identity.is_none());
    }

    #[test]
    fn test_from_capture_is_deterministic() {
        let raw = tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 22, b"SSH-2.0-x\r\n");
        let a = PacketRecord::from_capture(&raw, 2, at(42)).unwrap();
        let b = PacketRecord::from_capture(&raw, 2, at(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_captures_are_rejected() {
        assert!(matches!(
            PacketRecord::from_capture(&[], 1, at(0)),
            Err(PacketError::Empty)
        ));
        assert!(PacketRecord::from_capture(&[0x45, 0x00, 0x00], 1, at(0)).is_err());
    }

    #[test]
    fn test_first_verdict_wins() {
        let raw = tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 22, b"");
        let record = PacketRecord::from_capture(&raw, 1, at(0)).unwrap();

        assert_eq!(record.verdict(), None);
        assert!(record.drop_packet());
        assert!(!record.accept());
        assert_eq!(record.verdict(), Some(Verdict::Drop));
    }

    #[test]
    fn test_to_event_carries_identity() {
        let payload = b"POST /Score HTTP/1.1\r\nname: Score\r\nbt_header_dendrite_hotkey: 5DkVM4\r\n\r\n";
        let raw = tcp_packet([10, 0, 0, 9], [10, 0, 0, 2], 8091, payload);
        let record = PacketRecord::from_capture(&raw, 1, at(0)).unwrap();

        let event = record.to_event("Deny ip");
        assert_eq!(event.ip, "10.0.0.9");
        assert_eq!(event.port, 8091);
        assert_eq!(event.reason, "Deny ip");
        assert_eq!(event.hotkey(), Some("5DkVM4"));
    }
}
