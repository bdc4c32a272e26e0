use packed_struct::prelude::*;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::answer::{AnswerFlags, DnsAnswer};
use crate::enums::{
    DnsProtocol, IpProtocol, OpCode, PacketType, Rcode, RecordClass, RecordType,
};
use crate::error::StubNsError;
use crate::resourcerecord::{DomainName, ResourceRecord};
use crate::utils::{name_as_bytes, parse_name};
use crate::{
    DNS_PACKET_SIZE_MAX, DNS_PACKET_UNICAST_SIZE_MAX, HEADER_BYTES, Header, Question,
};

/// The only EDNS version there is, RFC 6891
pub const EDNS_VERSION_SUPPORTED: u8 = 0;
/// NSID option code, RFC 5001
const EDNS_OPTION_NSID: u16 = 3;
/// DO bit in the OPT TTL's lower half, RFC 4035
const EDNS_FLAG_DO: u16 = 0x8000;

/// What an OPT pseudo-RR in a received packet told us, RFC 6891 section 6.1
#[derive(Clone, Debug)]
pub struct OptInfo {
    /// The sender's maximum acceptable UDP payload (the OPT CLASS field)
    pub payload_size: u16,
    pub extended_rcode: u8,
    pub version: u8,
    pub dnssec_ok: bool,
    pub nsid_requested: bool,
    /// Byte offset of the OPT CLASS field, so the payload size can be patched
    class_offset: usize,
}

#[derive(Clone, Debug, Default)]
struct ExtractedPacket {
    questions: Vec<Question>,
    opt: Option<OptInfo>,
    /// Parsed RRs (OPT excluded) with the section they were found in
    records: Vec<(ResourceRecord, AnswerFlags)>,
    /// Byte offsets of each RR's TTL field (OPT excluded - its TTL is flags)
    ttl_offsets: Vec<usize>,
}

/// A DNS message as it arrived off a socket: the raw bytes, where they came
/// from, and (after [DnsPacket::extract]) the decoded question, OPT and RR
/// details the listener needs.
#[derive(Clone, Debug)]
pub struct DnsPacket {
    data: Vec<u8>,
    header: Header,
    pub protocol: DnsProtocol,
    pub ipproto: IpProtocol,
    pub sender: SocketAddr,
    pub destination: IpAddr,
    pub ifindex: u32,
    pub timestamp: Instant,
    extracted: Option<ExtractedPacket>,
}

/// The per-endpoint deduplication key: transport identity of the sender plus
/// the full DNS header bytes. Two packets with equal keys and equal full
/// bytes are retransmits of each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StubPacketKey {
    protocol: DnsProtocol,
    sender_ip: IpAddr,
    ipproto: IpProtocol,
    sender_port: u16,
    header: [u8; HEADER_BYTES],
}

impl DnsPacket {
    pub fn from_wire(
        data: Vec<u8>,
        protocol: DnsProtocol,
        ipproto: IpProtocol,
        sender: SocketAddr,
        destination: IpAddr,
        ifindex: u32,
    ) -> Result<Self, StubNsError> {
        if data.len() < HEADER_BYTES {
            return Err(StubNsError::PacketParse(format!(
                "{} bytes is shorter than a DNS header",
                data.len()
            )));
        }
        let mut split_header: [u8; HEADER_BYTES] = [0; HEADER_BYTES];
        split_header.copy_from_slice(&data[0..HEADER_BYTES]);
        let header = Header::unpack(&split_header)?;
        Ok(DnsPacket {
            data,
            header,
            protocol,
            ipproto,
            sender,
            destination,
            ifindex,
            timestamp: Instant::now(),
            extracted: None,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Is this something we'd even consider processing: an actual query, with
    /// a standard opcode and exactly one question entry.
    pub fn validate_query(&self) -> bool {
        self.header.qr == PacketType::Query
            && self.header.opcode == OpCode::Query
            && self.header.qdcount == 1
    }

    pub fn dedup_key(&self) -> StubPacketKey {
        let mut header: [u8; HEADER_BYTES] = [0; HEADER_BYTES];
        header.copy_from_slice(&self.data[0..HEADER_BYTES]);
        StubPacketKey {
            protocol: self.protocol,
            sender_ip: self.sender.ip(),
            ipproto: self.ipproto,
            sender_port: self.sender.port(),
            header,
        }
    }

    /// Decode the question section, the OPT record and all RRs. Must be
    /// called before any of the accessors below return anything useful.
    pub fn extract(&mut self) -> Result<(), StubNsError> {
        if self.extracted.is_some() {
            return Ok(());
        }

        let data = &self.data;
        let mut extracted = ExtractedPacket::default();
        let mut offset = HEADER_BYTES;

        for _ in 0..self.header.qdcount {
            let (question, next) = Question::from_wire(data, offset)?;
            extracted.questions.push(question);
            offset = next;
        }

        let sections = [
            (self.header.ancount, AnswerFlags::SECTION_ANSWER),
            (self.header.nscount, AnswerFlags::SECTION_AUTHORITY),
            (self.header.arcount, AnswerFlags::SECTION_ADDITIONAL),
        ];
        for (count, section) in sections {
            for _ in 0..count {
                let (name, next) = parse_name(data, offset)?;
                if data.len() < next + 10 {
                    return Err(StubNsError::PacketParse(
                        "record truncated after name".to_string(),
                    ));
                }
                let rrtype = u16::from_be_bytes([data[next], data[next + 1]]);
                let class = u16::from_be_bytes([data[next + 2], data[next + 3]]);
                let ttl = u32::from_be_bytes([
                    data[next + 4],
                    data[next + 5],
                    data[next + 6],
                    data[next + 7],
                ]);
                let rdlen = u16::from_be_bytes([data[next + 8], data[next + 9]]) as usize;
                let rdata_start = next + 10;
                if data.len() < rdata_start + rdlen {
                    return Err(StubNsError::PacketParse(
                        "record data ran off the end".to_string(),
                    ));
                }

                if RecordType::from(rrtype) == RecordType::OPT {
                    let opt = OptInfo {
                        payload_size: class,
                        extended_rcode: (ttl >> 24) as u8,
                        version: (ttl >> 16) as u8,
                        dnssec_ok: ttl as u16 & EDNS_FLAG_DO != 0,
                        nsid_requested: opt_requests_nsid(
                            &data[rdata_start..rdata_start + rdlen],
                        )?,
                        class_offset: next + 2,
                    };
                    // if the sender stuffed in more than one OPT, the first wins
                    extracted.opt.get_or_insert(opt);
                } else {
                    let rdata = normalize_rdata(
                        data,
                        rdata_start,
                        rdlen,
                        RecordType::from(rrtype),
                    )?;
                    extracted.records.push((
                        ResourceRecord {
                            name: DomainName::from(name),
                            rrtype: RecordType::from(rrtype),
                            class: RecordClass::from(class),
                            ttl,
                            rdata,
                        },
                        section,
                    ));
                    extracted.ttl_offsets.push(next + 4);
                }
                offset = rdata_start + rdlen;
            }
        }

        self.extracted = Some(extracted);
        Ok(())
    }

    pub fn question(&self) -> Option<&Question> {
        self.extracted.as_ref()?.questions.first()
    }

    pub fn opt(&self) -> Option<&OptInfo> {
        self.extracted.as_ref()?.opt.as_ref()
    }

    /// Parsed RRs with the section each was found in, OPT excluded
    pub fn section_records(&self) -> &[(ResourceRecord, AnswerFlags)] {
        match &self.extracted {
            Some(extracted) => &extracted.records,
            None => &[],
        }
    }

    /// Did the client set the EDNS0 DNSSEC-OK bit
    pub fn edns_do(&self) -> bool {
        self.opt().map(|opt| opt.dnssec_ok).unwrap_or(false)
    }

    pub fn nsid_requested(&self) -> bool {
        self.opt().map(|opt| opt.nsid_requested).unwrap_or(false)
    }

    /// True when there's no OPT at all, or it speaks EDNS version 0
    pub fn version_supported(&self) -> bool {
        self.opt()
            .map(|opt| opt.version == EDNS_VERSION_SUPPORTED)
            .unwrap_or(true)
    }

    /// How large a reply this client can take, RFC 6891 section 6.2.5
    pub fn payload_size_max(&self) -> usize {
        match self.ipproto {
            IpProtocol::Tcp => DNS_PACKET_SIZE_MAX,
            IpProtocol::Udp => match self.opt() {
                Some(opt) => (opt.payload_size as usize)
                    .clamp(DNS_PACKET_UNICAST_SIZE_MAX, DNS_PACKET_SIZE_MAX),
                None => DNS_PACKET_UNICAST_SIZE_MAX,
            },
        }
    }

    /// A clone with the extraction done, ready for the bypass patches
    pub fn duplicate(&self) -> Result<DnsPacket, StubNsError> {
        let mut copy = self.clone();
        copy.extract()?;
        Ok(copy)
    }

    pub fn patch_id(&mut self, id: u16) {
        self.data[0..2].copy_from_slice(&id.to_be_bytes());
        self.header.id = id;
    }

    /// Overwrite the advertised payload size in the OPT record, if there is one
    pub fn patch_max_udp_size(&mut self, size: u16) {
        let Some(offset) = self
            .extracted
            .as_ref()
            .and_then(|e| e.opt.as_ref())
            .map(|opt| opt.class_offset)
        else {
            return;
        };
        self.data[offset..offset + 2].copy_from_slice(&size.to_be_bytes());
        if let Some(opt) = self.extracted.as_mut().and_then(|e| e.opt.as_mut()) {
            opt.payload_size = size;
        }
    }

    /// Lower every RR TTL by the time that passed since the packet arrived,
    /// never below 1 second
    pub fn patch_ttls(&mut self, elapsed: Duration) {
        let passed = elapsed.as_secs().min(u64::from(u32::MAX)) as u32;
        let offsets = match &self.extracted {
            Some(extracted) => extracted.ttl_offsets.clone(),
            None => return,
        };
        for offset in offsets {
            let ttl = u32::from_be_bytes([
                self.data[offset],
                self.data[offset + 1],
                self.data[offset + 2],
                self.data[offset + 3],
            ]);
            let patched = ttl.saturating_sub(passed).max(1);
            self.data[offset..offset + 4].copy_from_slice(&patched.to_be_bytes());
        }
    }

    /// Chop the message down to `max` bytes and raise the TC flag. The
    /// section counts go stale, which is fine - TC tells the client to retry
    /// over TCP anyway.
    pub fn truncate_to(&mut self, max: usize) {
        self.data.truncate(max);
        self.data[2] |= 0x02;
        self.header.truncated = true;
    }
}

fn opt_requests_nsid(rdata: &[u8]) -> Result<bool, StubNsError> {
    let mut pos = 0;
    while pos < rdata.len() {
        if rdata.len() < pos + 4 {
            return Err(StubNsError::PacketParse(
                "OPT option header truncated".to_string(),
            ));
        }
        let code = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let olen = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
        if rdata.len() < pos + 4 + olen {
            return Err(StubNsError::PacketParse(
                "OPT option data truncated".to_string(),
            ));
        }
        if code == EDNS_OPTION_NSID {
            return Ok(true);
        }
        pos += 4 + olen;
    }
    Ok(false)
}

/// Re-encode RDATA so embedded names lose their compression pointers, which
/// only mean something inside the packet they came from. Types without names
/// in their RDATA are copied verbatim.
fn normalize_rdata(
    data: &[u8],
    rdata_start: usize,
    rdlen: usize,
    rrtype: RecordType,
) -> Result<Vec<u8>, StubNsError> {
    match rrtype {
        RecordType::CNAME
        | RecordType::DNAME
        | RecordType::NS
        | RecordType::PTR
        | RecordType::MB
        | RecordType::MG
        | RecordType::MR => {
            let (name, _) = parse_name(data, rdata_start)?;
            name_as_bytes(&name, None, None)
        }
        RecordType::MX => {
            if rdlen < 2 {
                return Err(StubNsError::PacketParse("MX rdata too short".to_string()));
            }
            let mut rdata = data[rdata_start..rdata_start + 2].to_vec();
            let (name, _) = parse_name(data, rdata_start + 2)?;
            rdata.extend(name_as_bytes(&name, None, None)?);
            Ok(rdata)
        }
        RecordType::SRV => {
            if rdlen < 6 {
                return Err(StubNsError::PacketParse("SRV rdata too short".to_string()));
            }
            let mut rdata = data[rdata_start..rdata_start + 6].to_vec();
            let (name, _) = parse_name(data, rdata_start + 6)?;
            rdata.extend(name_as_bytes(&name, None, None)?);
            Ok(rdata)
        }
        RecordType::SOA => {
            let (mname, next) = parse_name(data, rdata_start)?;
            let (rname, next) = parse_name(data, next)?;
            if data.len() < next + 20 || next + 20 > rdata_start + rdlen {
                return Err(StubNsError::PacketParse("SOA rdata too short".to_string()));
            }
            let mut rdata = name_as_bytes(&mname, None, None)?;
            rdata.extend(name_as_bytes(&rname, None, None)?);
            rdata.extend(&data[next..next + 20]);
            Ok(rdata)
        }
        _ => Ok(data[rdata_start..rdata_start + rdlen].to_vec()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketSection {
    Answer,
    Authority,
    Additional,
}

/// Builds a reply message under a size ceiling: header space up front, then
/// the question, the three RR sections, and finally the OPT. Counts are
/// tracked as sections are appended and packed into the header by
/// [PacketBuilder::finish].
pub struct PacketBuilder {
    buf: Vec<u8>,
    size_max: usize,
    question_name: Option<String>,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl PacketBuilder {
    pub fn new(size_max: usize) -> Self {
        PacketBuilder {
            buf: vec![0; HEADER_BYTES],
            size_max,
            question_name: None,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), StubNsError> {
        if self.buf.len() + bytes.len() > self.size_max {
            return Err(StubNsError::MessageTooLarge);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append_question(&mut self, question: &Question) -> Result<(), StubNsError> {
        let bytes = question.to_bytes()?;
        self.append_bytes(&bytes)?;
        self.question_name = Some(question.qname().as_str().to_string());
        self.qdcount += 1;
        Ok(())
    }

    fn append_rr(&mut self, rr: &ResourceRecord) -> Result<(), StubNsError> {
        let target = self.question_name.as_ref().map(|_| HEADER_BYTES as u16);
        let bytes = rr.as_bytes(target, self.question_name.as_deref())?;
        self.append_bytes(&bytes)
    }

    /// Append a whole reply section. `Ok(true)` means everything fitted,
    /// `Ok(false)` means the size ceiling cut it short (whatever fitted
    /// stays in, with the counts matching).
    pub fn append_section(
        &mut self,
        answer: &DnsAnswer,
        section: PacketSection,
    ) -> Result<bool, StubNsError> {
        for item in answer.iter() {
            match self.append_rr(&item.rr) {
                Ok(()) => {
                    match section {
                        PacketSection::Answer => self.ancount += 1,
                        PacketSection::Authority => self.nscount += 1,
                        PacketSection::Additional => self.arcount += 1,
                    };
                }
                Err(StubNsError::MessageTooLarge) => return Ok(false),
                Err(error) => return Err(error),
            }
        }
        Ok(true)
    }

    /// Append the OPT pseudo-RR, RFC 6891 section 6.1.2. The extended-rcode
    /// high bits ride in here; the low four bits stay in the header.
    pub fn append_opt(
        &mut self,
        max_udp_size: u16,
        edns0_do: bool,
        nsid: Option<&str>,
        rcode: u16,
    ) -> Result<(), StubNsError> {
        let mut bytes: Vec<u8> = vec![0]; // owner is the root name
        bytes.extend(RecordType::OPT.value().to_be_bytes());
        bytes.extend(max_udp_size.to_be_bytes());
        bytes.push(Rcode::extended_high_bits(rcode));
        bytes.push(EDNS_VERSION_SUPPORTED);
        let flags: u16 = if edns0_do { EDNS_FLAG_DO } else { 0 };
        bytes.extend(flags.to_be_bytes());

        let mut options: Vec<u8> = vec![];
        if let Some(nsid) = nsid {
            options.extend(EDNS_OPTION_NSID.to_be_bytes());
            options.extend((nsid.len() as u16).to_be_bytes());
            options.extend(nsid.as_bytes());
        }
        bytes.extend((options.len() as u16).to_be_bytes());
        bytes.extend(options);

        self.append_bytes(&bytes)?;
        self.arcount += 1;
        Ok(())
    }

    /// Pack the header and hand over the finished message
    pub fn finish(
        mut self,
        id: u16,
        rcode: u16,
        tc: bool,
        aa: bool,
        ad: bool,
        cd: bool,
    ) -> Result<Vec<u8>, StubNsError> {
        let header = Header {
            id,
            qr: PacketType::Answer,
            opcode: OpCode::Query,
            authoritative: aa,
            truncated: tc,
            recursion_desired: true,
            recursion_available: true,
            z: false,
            ad,
            cd,
            rcode: Rcode::from_extended(rcode),
            qdcount: self.qdcount,
            ancount: self.ancount,
            nscount: self.nscount,
            arcount: self.arcount,
        };
        let packed = header.pack()?;
        self.buf[0..HEADER_BYTES].copy_from_slice(&packed);
        Ok(self.buf)
    }
}
