use std::fmt::Display;

use crate::enums::{RecordClass, RecordType};
use crate::error::StubNsError;
use crate::utils::{name_as_bytes, parse_name};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainName {
    pub name: String,
}

impl DomainName {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Lowercased, no trailing dot - the form names are compared and keyed in
    pub fn canonical(&self) -> String {
        self.name.trim_end_matches('.').to_ascii_lowercase()
    }

    pub fn equals(&self, other: &DomainName) -> bool {
        self.canonical() == other.canonical()
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == "*" || self.name.starts_with("*.")
    }

    /// Strict subdomain test: `a.b.example.com` is below `example.com`, but
    /// `example.com` itself is not.
    pub fn is_subdomain_of(&self, parent: &DomainName) -> bool {
        let me = self.canonical();
        let parent = parent.canonical();
        if parent.is_empty() {
            return !me.is_empty();
        }
        me.len() > parent.len() + 1 && me.ends_with(&parent) && {
            let boundary = me.len() - parent.len() - 1;
            me.as_bytes()[boundary] == b'.'
        }
    }
}

impl From<&str> for DomainName {
    fn from(input: &str) -> Self {
        DomainName {
            name: String::from(input),
        }
    }
}

impl From<String> for DomainName {
    fn from(name: String) -> Self {
        DomainName { name }
    }
}

impl Display for DomainName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name.is_empty() {
            true => f.write_str("."),
            false => f.write_str(&self.name),
        }
    }
}

/// A resource record as it travels between the resolver engine and the
/// listener: owner name, type, class, TTL and the (uncompressed) RDATA.
#[derive(Clone, Debug)]
pub struct ResourceRecord {
    /// A domain name to which this resource record pertains.
    pub name: DomainName,
    /// Two octets containing one of the RR type codes. This field specifies the meaning of the data in the RDATA field.
    pub rrtype: RecordType,
    /// Two octets which specify the class of the data in the RDATA field.
    pub class: RecordClass,
    /// A 32 bit unsigned integer that specifies the time interval (in seconds) that the resource record may be cached before it should be discarded.
    pub ttl: u32,
    /// A variable length string of octets that describes the resource.
    pub rdata: Vec<u8>,
}

/// TTLs are deliberately not part of record identity, they drift as answers
/// age in caches.
impl PartialEq for ResourceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.rrtype == other.rrtype
            && self.class == other.class
            && self.name.equals(&other.name)
            && self.rdata == other.rdata
    }
}

impl Eq for ResourceRecord {}

impl Display for ResourceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{} {} {} ttl={} rdata={} bytes",
            self.name,
            self.class,
            self.rrtype,
            self.ttl,
            self.rdata.len()
        ))
    }
}

impl ResourceRecord {
    pub fn key(&self) -> RrKey {
        RrKey::new(self.class, self.rrtype, self.name.clone())
    }

    /// Wire-encode the record, compressing the owner name against
    /// `compress_reference` (normally the question name) when given.
    pub fn as_bytes(
        &self,
        compress_target: Option<u16>,
        compress_reference: Option<&str>,
    ) -> Result<Vec<u8>, StubNsError> {
        let mut retval = name_as_bytes(self.name.as_str(), compress_target, compress_reference)?;
        retval.extend(self.rrtype.value().to_be_bytes());
        retval.extend(self.class.value().to_be_bytes());
        retval.extend(self.ttl.to_be_bytes());
        retval.extend((self.rdata.len() as u16).to_be_bytes());
        retval.extend(&self.rdata);
        Ok(retval)
    }

    /// If this record redirects `key` somewhere else, where to. That's the
    /// CNAME value when we own the key's name, or the key's name rewritten
    /// under a DNAME when we own an ancestor.
    pub fn cname_target(&self, key: &RrKey) -> Option<DomainName> {
        if self.class != key.class && key.class != RecordClass::Any {
            return None;
        }

        match self.rrtype {
            RecordType::CNAME => {
                if self.name.canonical() != key.name {
                    return None;
                }
                let (target, _) = parse_name(&self.rdata, 0).ok()?;
                Some(DomainName::from(target))
            }
            RecordType::DNAME => {
                let owner = self.name.canonical();
                if owner.is_empty() {
                    return None;
                }
                let key_name = DomainName::from(key.name.clone());
                if !key_name.is_subdomain_of(&self.name) {
                    return None;
                }
                let (target, _) = parse_name(&self.rdata, 0).ok()?;
                let prefix = &key.name[..key.name.len() - owner.len() - 1];
                Some(DomainName::from(format!("{prefix}.{target}")))
            }
            _ => None,
        }
    }
}

/// The (owner, type, class) triple that identifies an RRset
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RrKey {
    /// Canonical (lowercased) owner name
    pub name: String,
    pub rrtype: RecordType,
    pub class: RecordClass,
}

impl RrKey {
    pub fn new(class: RecordClass, rrtype: RecordType, name: impl Into<DomainName>) -> Self {
        RrKey {
            name: name.into().canonical(),
            rrtype,
            class,
        }
    }

    /// Does `rr` answer this key? Wildcard owners match per RFC 4592.
    pub fn matches_rr(&self, rr: &ResourceRecord) -> bool {
        if self.class != rr.class && self.class != RecordClass::Any {
            return false;
        }
        if self.rrtype != rr.rrtype && self.rrtype != RecordType::ANY {
            return false;
        }
        if rr.name.is_wildcard() {
            // a wildcard owner covers names below it, not the owner itself
            let suffix = DomainName::from(rr.name.canonical().trim_start_matches("*.").to_string());
            let key_name = DomainName::from(self.name.clone());
            return key_name.is_subdomain_of(&suffix);
        }
        rr.name.canonical() == self.name
    }
}

impl Display for RrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} {} {}", self.name, self.class, self.rrtype))
    }
}
