use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, PrimitiveEnum_u8, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    Query = 0,
    Answer = 1,
}

impl From<bool> for PacketType {
    fn from(input: bool) -> Self {
        match input {
            false => Self::Query,
            true => Self::Answer,
        }
    }
}

#[derive(Debug, Eq, PartialEq, PrimitiveEnum_u8, Copy, Clone)]
/// A four bit field that specifies kind of query in this message.
/// This value is set by the originator of a query and copied into the response.
pub enum OpCode {
    /// A standard query (QUERY)
    Query = 0,
    // IQuery = 1, an inverse query (IQUERY) - obsolete in https://www.rfc-editor.org/rfc/rfc3425
    /// Server status request (STATUS)
    Status = 2,
    /// 3-15            reserved for future use
    Reserved = 15,
}

impl From<u8> for OpCode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::Query,
            2 => Self::Status,
            _ => Self::Reserved,
        }
    }
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, Eq, PartialEq)]
/// The four-bit response code carried in the message header. Extended (12 bit)
/// response codes travel as a plain `u16` and get their upper bits stored in
/// the OPT record, see [Rcode::from_extended] and [Rcode::extended_high_bits].
pub enum Rcode {
    // No error condition
    NoError = 0,
    // Format error - The name server was unable to interpret the query.
    FormatError = 1,
    // Server failure - The name server was unable to process this query due to a problem with the name server.
    ServFail = 2,
    /// Name Error - this code signifies that the domain name referenced in the query does not exist.
    NameError = 3,
    /// Not Implemented - The name server does not support the requested kind of query.
    NotImplemented = 4,
    /// Refused - The name server refuses to perform the specified operation for policy reasons.
    Refused = 5,
    /// Name exists when it should not, RFC 2136
    YXDomain = 6,
    /// RR set exists when it should not, RFC 2136
    YXRRSet = 7,
    /// RR set that should exist does not, RFC 2136
    NXRRSet = 8,
    /// Server not authoritative for the zone, RFC 2136
    NotAuth = 9,
    /// Name not contained in zone, RFC 2136
    NotZone = 10,
    Reserved11 = 11,
    Reserved12 = 12,
    Reserved13 = 13,
    Reserved14 = 14,
    Reserved15 = 15,
}

/// Extended response codes passed around as plain integers, RFC 6891 section 6.1.3
pub const DNS_RCODE_FORMERR: u16 = 1;
pub const DNS_RCODE_SERVFAIL: u16 = 2;
pub const DNS_RCODE_NXDOMAIN: u16 = 3;
pub const DNS_RCODE_REFUSED: u16 = 5;
/// Bad OPT version; only representable with an OPT record in the reply
pub const DNS_RCODE_BADVERS: u16 = 16;

impl Rcode {
    /// The low four bits of an extended response code, which go in the header
    pub fn from_extended(rcode: u16) -> Rcode {
        Rcode::from_primitive((rcode & 0xF) as u8).unwrap_or(Rcode::ServFail)
    }

    /// The upper eight bits of an extended response code, which go in the OPT TTL field
    pub fn extended_high_bits(rcode: u16) -> u8 {
        (rcode >> 4) as u8
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// RRType, eg A, NS, MX, etc. Types this server has no special handling for
/// are carried through as [RecordType::Unknown] so they round-trip unharmed.
pub enum RecordType {
    /// A host address
    A,
    /// Authoritative name server
    NS,
    /// A mail destination (Obsolete - use MX)
    MD,
    /// A mail forwarder (Obsolete - use MX)
    MF,
    /// The canonical name for an alias
    CNAME,
    /// Marks the start of a zone of authority
    SOA,
    MB,
    MG,
    MR,
    NULL,
    /// A well known service description
    WKS,
    /// A domain name pointer
    PTR,
    /// Host information
    HINFO,
    MINFO,
    /// Mail exchange
    MX,
    /// Text strings
    TXT,
    /// IPv6 Records <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA,
    /// Physical location of a thing <https://www.rfc-editor.org/rfc/rfc1876>
    LOC,
    /// Service location, RFC 2782
    SRV,
    /// NAPTR <https://www.rfc-editor.org/rfc/rfc2915>
    NAPTR,
    /// Non-terminal name redirection, RFC 6672
    DNAME,
    /// The EDNS0 pseudo-RR, RFC 6891
    OPT,
    /// Delegation signer, RFC 4034
    DS,
    /// DNSSEC signature, RFC 4034
    RRSIG,
    /// Authenticated denial of existence, RFC 4034
    NSEC,
    /// DNSSEC public key, RFC 4034
    DNSKEY,
    /// Hashed denial of existence, RFC 5155
    NSEC3,
    NSEC3PARAM,
    /// Child copies of DS/DNSKEY, RFC 7344
    CDS,
    CDNSKEY,
    /// Incremental zone transfer, RFC 1995
    IXFR,
    /// A request for a transfer of an entire zone
    AXFR,
    /// A request for mailbox-related records (MB, MG or MR)
    MAILB,
    /// A request for mail agent RRs (Obsolete - see MX)
    MAILA,
    /// A request for all records (*)
    ANY,
    URI,
    /// Certification Authority Restriction - <https://www.rfc-editor.org/rfc/rfc6844.txt>
    CAA,
    /// Anything else, kept verbatim
    Unknown(u16),
}

impl RecordType {
    pub fn value(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::MD => 3,
            RecordType::MF => 4,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::MB => 7,
            RecordType::MG => 8,
            RecordType::MR => 9,
            RecordType::NULL => 10,
            RecordType::WKS => 11,
            RecordType::PTR => 12,
            RecordType::HINFO => 13,
            RecordType::MINFO => 14,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::LOC => 29,
            RecordType::SRV => 33,
            RecordType::NAPTR => 35,
            RecordType::DNAME => 39,
            RecordType::OPT => 41,
            RecordType::DS => 43,
            RecordType::RRSIG => 46,
            RecordType::NSEC => 47,
            RecordType::DNSKEY => 48,
            RecordType::NSEC3 => 50,
            RecordType::NSEC3PARAM => 51,
            RecordType::CDS => 59,
            RecordType::CDNSKEY => 60,
            RecordType::IXFR => 251,
            RecordType::AXFR => 252,
            RecordType::MAILB => 253,
            RecordType::MAILA => 254,
            RecordType::ANY => 255,
            RecordType::URI => 256,
            RecordType::CAA => 257,
            RecordType::Unknown(value) => value,
        }
    }
}

impl From<u16> for RecordType {
    fn from(input: u16) -> Self {
        match input {
            1 => Self::A,
            2 => Self::NS,
            3 => Self::MD,
            4 => Self::MF,
            5 => Self::CNAME,
            6 => Self::SOA,
            7 => Self::MB,
            8 => Self::MG,
            9 => Self::MR,
            10 => Self::NULL,
            11 => Self::WKS,
            12 => Self::PTR,
            13 => Self::HINFO,
            14 => Self::MINFO,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA,
            29 => Self::LOC,
            33 => Self::SRV,
            35 => Self::NAPTR,
            39 => Self::DNAME,
            41 => Self::OPT,
            43 => Self::DS,
            46 => Self::RRSIG,
            47 => Self::NSEC,
            48 => Self::DNSKEY,
            50 => Self::NSEC3,
            51 => Self::NSEC3PARAM,
            59 => Self::CDS,
            60 => Self::CDNSKEY,
            251 => Self::IXFR,
            252 => Self::AXFR,
            253 => Self::MAILB,
            254 => Self::MAILA,
            255 => Self::ANY,
            256 => Self::URI,
            257 => Self::CAA,
            other => Self::Unknown(other),
        }
    }
}

impl From<&str> for RecordType {
    fn from(input: &str) -> Self {
        match input {
            "A" => Self::A,
            "AAAA" => Self::AAAA,
            "ANY" => Self::ANY,
            "AXFR" => Self::AXFR,
            "CAA" => Self::CAA,
            "CNAME" => Self::CNAME,
            "DNAME" => Self::DNAME,
            "DNSKEY" => Self::DNSKEY,
            "DS" => Self::DS,
            "HINFO" => Self::HINFO,
            "IXFR" => Self::IXFR,
            "LOC" => Self::LOC,
            "MAILA" => Self::MAILA,
            "MAILB" => Self::MAILB,
            "MB" => Self::MB,
            "MD" => Self::MD,
            "MF" => Self::MF,
            "MG" => Self::MG,
            "MINFO" => Self::MINFO,
            "MR" => Self::MR,
            "MX" => Self::MX,
            "NAPTR" => Self::NAPTR,
            "NS" => Self::NS,
            "NSEC" => Self::NSEC,
            "NSEC3" => Self::NSEC3,
            "NSEC3PARAM" => Self::NSEC3PARAM,
            "NULL" => Self::NULL,
            "OPT" => Self::OPT,
            "PTR" => Self::PTR,
            "RRSIG" => Self::RRSIG,
            "SOA" => Self::SOA,
            "SRV" => Self::SRV,
            "TXT" => Self::TXT,
            "URI" => Self::URI,
            "WKS" => Self::WKS,
            _ => Self::Unknown(0),
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::MD => write!(f, "MD"),
            RecordType::MF => write!(f, "MF"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::MB => write!(f, "MB"),
            RecordType::MG => write!(f, "MG"),
            RecordType::MR => write!(f, "MR"),
            RecordType::NULL => write!(f, "NULL"),
            RecordType::WKS => write!(f, "WKS"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::HINFO => write!(f, "HINFO"),
            RecordType::MINFO => write!(f, "MINFO"),
            RecordType::MX => write!(f, "MX"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::LOC => write!(f, "LOC"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::NAPTR => write!(f, "NAPTR"),
            RecordType::DNAME => write!(f, "DNAME"),
            RecordType::OPT => write!(f, "OPT"),
            RecordType::DS => write!(f, "DS"),
            RecordType::RRSIG => write!(f, "RRSIG"),
            RecordType::NSEC => write!(f, "NSEC"),
            RecordType::DNSKEY => write!(f, "DNSKEY"),
            RecordType::NSEC3 => write!(f, "NSEC3"),
            RecordType::NSEC3PARAM => write!(f, "NSEC3PARAM"),
            RecordType::CDS => write!(f, "CDS"),
            RecordType::CDNSKEY => write!(f, "CDNSKEY"),
            RecordType::IXFR => write!(f, "IXFR"),
            RecordType::AXFR => write!(f, "AXFR"),
            RecordType::MAILB => write!(f, "MAILB"),
            RecordType::MAILA => write!(f, "MAILA"),
            RecordType::ANY => write!(f, "ANY"),
            RecordType::URI => write!(f, "URI"),
            RecordType::CAA => write!(f, "CAA"),
            // RFC 3597 presentation format
            RecordType::Unknown(value) => write!(f, "TYPE{value}"),
        }
    }
}

impl RecordType {
    /// DNSSEC RR types which only go out when the client asked for them with DO=1
    pub fn is_dnssec(self) -> bool {
        matches!(
            self,
            RecordType::DS
                | RecordType::RRSIG
                | RecordType::NSEC
                | RecordType::DNSKEY
                | RecordType::NSEC3
                | RecordType::NSEC3PARAM
                | RecordType::CDS
                | RecordType::CDNSKEY
        )
    }

    /// Obsolete types we refuse to forward upstream
    pub fn is_obsolete(self) -> bool {
        matches!(
            self,
            RecordType::MD | RecordType::MF | RecordType::MAILA | RecordType::MAILB
        )
    }

    /// Zone transfers, which make no sense against a stub
    pub fn is_zone_transfer(self) -> bool {
        matches!(self, RecordType::AXFR | RecordType::IXFR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// CLASS fields appear in resource records, most entries should be IN. Ref RFC1035 3.2.4.
pub enum RecordClass {
    /// IN - Internet
    Internet,
    /// CS - CSNET class (Obsolete - used only for examples in some obsolete RFCs)
    CsNet,
    /// CH - Chaos
    Chaos,
    /// Hesiod [Dyer 87]
    Hesiod,
    /// QCLASS * - any class
    Any,
    Unknown(u16),
}

impl RecordClass {
    pub fn value(self) -> u16 {
        match self {
            RecordClass::Internet => 1,
            RecordClass::CsNet => 2,
            RecordClass::Chaos => 3,
            RecordClass::Hesiod => 4,
            RecordClass::Any => 255,
            RecordClass::Unknown(value) => value,
        }
    }
}

impl From<u16> for RecordClass {
    fn from(input: u16) -> Self {
        match input {
            1 => Self::Internet,
            2 => Self::CsNet,
            3 => Self::Chaos,
            4 => Self::Hesiod,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }
}

impl Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordClass::Internet => write!(f, "IN"),
            RecordClass::CsNet => write!(f, "CS"),
            RecordClass::Chaos => write!(f, "CHAOS"),
            RecordClass::Hesiod => write!(f, "HESIOD"),
            RecordClass::Any => write!(f, "ANY"),
            RecordClass::Unknown(value) => write!(f, "CLASS{value}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Which DNS dialect a packet belongs to. Only classical unicast DNS is
/// bit-compatible with our replies; the others matter solely for refusing to
/// pass their packets through in bypass mode.
pub enum DnsProtocol {
    Dns,
    Llmnr,
    Mdns,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Udp,
    Tcp,
}

impl Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
/// Which transports a stub endpoint serves. Serialized as `no`/`udp`/`tcp`/`yes`,
/// where `yes` means both.
pub enum StubListenerMode {
    No,
    Udp,
    Tcp,
    #[default]
    Yes,
}

impl StubListenerMode {
    pub fn udp_enabled(self) -> bool {
        matches!(self, StubListenerMode::Udp | StubListenerMode::Yes)
    }

    pub fn tcp_enabled(self) -> bool {
        matches!(self, StubListenerMode::Tcp | StubListenerMode::Yes)
    }
}

impl Display for StubListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StubListenerMode::No => write!(f, "no"),
            StubListenerMode::Udp => write!(f, "udp"),
            StubListenerMode::Tcp => write!(f, "tcp"),
            StubListenerMode::Yes => write!(f, "yes"),
        }
    }
}

impl FromStr for StubListenerMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "no" => Ok(StubListenerMode::No),
            "udp" => Ok(StubListenerMode::Udp),
            "tcp" => Ok(StubListenerMode::Tcp),
            "yes" => Ok(StubListenerMode::Yes),
            _ => Err(format!(
                "Invalid listener mode {input:?}, wanted one of no/udp/tcp/yes"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Terminal (and, for completeness, in-flight) states a resolver transaction
/// can report. The in-flight ones never reach the stub's completion handling.
pub enum TransactionState {
    Null,
    Pending,
    Validating,
    /// Upstream answered with a non-success response code
    RcodeFailure,
    Success,
    NoServers,
    Timeout,
    AttemptsMaxReached,
    InvalidReply,
    Errno,
    Aborted,
    DnssecFailed,
    NoTrustAnchor,
    RrTypeUnsupported,
    NetworkDown,
    NotFound,
    NoSource,
    StubLoop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Outcome of DNSSEC validation, when the resolver performed any
pub enum DnssecResult {
    Secure,
    Insecure,
    Bogus,
    Indeterminate,
}
