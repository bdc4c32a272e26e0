use packed_struct::prelude::*;
use std::fmt::Display;

use crate::enums::{OpCode, PacketType, Rcode, RecordClass, RecordType};
use crate::error::StubNsError;
use crate::resourcerecord::{DomainName, RrKey};

pub mod answer;
/// Command line handling
pub mod cli;
/// Configuration handling for the listener
pub mod config;
pub mod enums;
pub mod error;
/// A minimal single-upstream resolver used by the binary
pub mod forwarder;
pub mod logging;
pub mod packet;
pub mod reply;
pub mod resolver;
pub mod resourcerecord;
pub mod servers;
#[cfg(test)]
mod tests;
pub mod utils;

/// The size of a DNS message header
pub const HEADER_BYTES: usize = 12;

/// The dedicated loopback address the primary stub binds by default
pub const DNS_STUB_ADDRESS: std::net::Ipv4Addr = std::net::Ipv4Addr::new(127, 0, 0, 53);
/// Default port for the primary stub listener
pub const DNS_STUB_PORT: u16 = 53;
/// Interface index of the loopback device on Linux
pub const LOOPBACK_IFINDEX: u32 = 1;

/// Maximum datagram size advertised on the primary stub: the loopback MTU is
/// 64K, minus the IP and UDP header sizes
pub const ADVERTISE_DATAGRAM_SIZE_MAX: u16 = 65535 - 20 - 8;
/// A more conservative choice for the extra stubs, which may not be on loopback
pub const ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX: u16 = 4096;

/// Payload ceiling for clients that don't speak EDNS0, RFC 1035 section 2.3.4
pub const DNS_PACKET_UNICAST_SIZE_MAX: usize = 512;
/// Payload ceiling over TCP (and the largest size a client can advertise)
pub const DNS_PACKET_SIZE_MAX: usize = 65535;
/// Receive buffer size, big enough for anything we advertise
pub const UDP_BUFFER_SIZE: usize = 65536;

/// How many CNAME/DNAME redirects we'll follow before calling it a loop
pub const CNAME_REDIRECT_MAX: usize = 16;

/// The header of a DNS transmission, either a Query or Reply. Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    id: u16,
    // Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    qr: PacketType, // bit 16
    #[packed_field(bits = "17..=20", ty = "enum")]
    opcode: OpCode, // 17-20 actually 4 bits
    #[packed_field(bits = "21")]
    authoritative: bool, // 21
    #[packed_field(bits = "22")]
    truncated: bool, // 22
    // RD - Recursion Desired - this bit may be set in a query and is copied into the response. If RD is set, it directs the name server to pursue the query recursively.
    #[packed_field(bits = "23")]
    recursion_desired: bool, // 23
    #[packed_field(bits = "24")]
    recursion_available: bool, // 24
    /// reserved, must be 0
    #[packed_field(bits = "25")]
    z: bool, // 25
    #[packed_field(bits = "26")]
    ad: bool,
    #[packed_field(bits = "27")]
    cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    rcode: Rcode, // bits 28-31
    /// an unsigned 16 bit integer specifying the number of entries in the question section.
    #[packed_field(bits = "32..=47", endian = "msb")]
    qdcount: u16, // bits 32-47
    /// an unsigned 16 bit integer specifying the number of entries in the answer section.
    #[packed_field(bits = "48..=63", endian = "msb")]
    ancount: u16, // 48-63
    /// an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    #[packed_field(bits = "64..=79", endian = "msb")]
    nscount: u16, // 64-79
    /// an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    #[packed_field(bits = "80..=95", endian = "msb")]
    arcount: u16, // 80-95
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "id={} qr={:?} opcode={:?} rd={} rcode={:?} qdcount={} ancount={} nscount={} arcount={}",
            self.id,
            self.qr,
            self.opcode,
            self.recursion_desired,
            self.rcode,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A DNS Question section entry, from Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2 "Question section format".
pub struct Question {
    /// The name which is being queried
    qname: DomainName,
    /// The Record type that is being requested, eg A, NS, MX, TXT etc.
    qtype: RecordType,
    /// The class, (typically IN for "Internet")
    qclass: RecordClass,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={} QCLASS={}",
            self.qname, self.qtype, self.qclass,
        ))
    }
}

impl Question {
    pub fn new(qname: impl Into<DomainName>, qtype: RecordType, qclass: RecordClass) -> Self {
        Question {
            qname: qname.into(),
            qtype,
            qclass,
        }
    }

    /// Parse a question entry at `offset` into the message, returning the
    /// entry and the offset just past it.
    pub(crate) fn from_wire(buf: &[u8], offset: usize) -> Result<(Self, usize), StubNsError> {
        let (qname, next) = crate::utils::parse_name(buf, offset)?;
        if buf.len() < next + 4 {
            return Err(StubNsError::PacketParse(
                "question truncated after name".to_string(),
            ));
        }
        let qtype = RecordType::from(u16::from_be_bytes([buf[next], buf[next + 1]]));
        let qclass = RecordClass::from(u16::from_be_bytes([buf[next + 2], buf[next + 3]]));
        Ok((
            Question {
                qname: DomainName::from(qname),
                qtype,
                qclass,
            },
            next + 4,
        ))
    }

    /// turn a question into a vec of bytes to send back to the client
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, StubNsError> {
        let mut retval = crate::utils::name_as_bytes(self.qname.as_str(), None, None)?;
        retval.extend(self.qtype.value().to_be_bytes());
        retval.extend(self.qclass.value().to_be_bytes());
        Ok(retval)
    }

    pub fn qname(&self) -> &DomainName {
        &self.qname
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    pub fn qclass(&self) -> RecordClass {
        self.qclass
    }

    /// The lookup key this question asks for
    pub fn key(&self) -> RrKey {
        RrKey::new(self.qclass, self.qtype, self.qname.clone())
    }
}
