use std::collections::HashSet;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::resourcerecord::{ResourceRecord, RrKey};

/// Flags carried by each answer item: whether the data is authenticated, and
/// which section of the upstream packet it came from (if any). Synthesized
/// answers have no section bits at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnswerFlags(u8);

impl AnswerFlags {
    pub const NONE: AnswerFlags = AnswerFlags(0);
    pub const AUTHENTICATED: AnswerFlags = AnswerFlags(1 << 0);
    pub const SECTION_ANSWER: AnswerFlags = AnswerFlags(1 << 1);
    pub const SECTION_AUTHORITY: AnswerFlags = AnswerFlags(1 << 2);
    pub const SECTION_ADDITIONAL: AnswerFlags = AnswerFlags(1 << 3);
    /// Mask of the bits that record which section an RR came from
    pub const SECTIONS: AnswerFlags = AnswerFlags(1 << 1 | 1 << 2 | 1 << 3);

    pub fn contains(self, other: AnswerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The section-origin bits alone
    pub fn section(self) -> AnswerFlags {
        self & Self::SECTIONS
    }

    /// With the section-origin bits cleared
    pub fn without_sections(self) -> AnswerFlags {
        AnswerFlags(self.0 & !Self::SECTIONS.0)
    }
}

impl BitOr for AnswerFlags {
    type Output = AnswerFlags;

    fn bitor(self, rhs: AnswerFlags) -> AnswerFlags {
        AnswerFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AnswerFlags {
    fn bitor_assign(&mut self, rhs: AnswerFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AnswerFlags {
    type Output = AnswerFlags;

    fn bitand(self, rhs: AnswerFlags) -> AnswerFlags {
        AnswerFlags(self.0 & rhs.0)
    }
}

/// One entry of an answer bag: the RR, the interface it was learned on, its
/// flags, and the RRSIG that covers it when the resolver validated one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnswerItem {
    pub rr: ResourceRecord,
    pub ifindex: u32,
    pub flags: AnswerFlags,
    pub rrsig: Option<ResourceRecord>,
}

/// An ordered, flat collection of RRs as handed over by the resolver engine,
/// and as accumulated into the three reply sections.
#[derive(Clone, Debug, Default)]
pub struct DnsAnswer {
    items: Vec<AnswerItem>,
}

impl DnsAnswer {
    pub fn new() -> Self {
        DnsAnswer::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnswerItem> {
        self.items.iter()
    }

    /// Add an item, merging with an existing equal RR instead of duplicating
    /// it. Merging ORs the flags together so an RR seen in two places keeps
    /// both origins on record.
    pub fn add(&mut self, item: AnswerItem) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.rr == item.rr) {
            existing.flags |= item.flags;
            if existing.rrsig.is_none() {
                existing.rrsig = item.rrsig;
            }
            return;
        }
        self.items.push(item);
    }

    /// Whether an equal RR (key and RDATA, TTL ignored) is already present
    pub fn contains(&self, rr: &ResourceRecord) -> bool {
        self.items.iter().any(|i| &i.rr == rr)
    }

    pub fn contains_key(&self, key: &RrKey) -> bool {
        self.items.iter().any(|i| i.rr.key() == *key)
    }

    /// Drop every item whose RR key also appears in `other`. This matches by
    /// key instead of full RR so RRsets move between sections atomically.
    pub fn remove_by_answer_keys(&mut self, other: &DnsAnswer) {
        let keys: HashSet<RrKey> = other.items.iter().map(|i| i.rr.key()).collect();
        self.items.retain(|i| !keys.contains(&i.rr.key()));
    }
}

impl From<Vec<AnswerItem>> for DnsAnswer {
    fn from(items: Vec<AnswerItem>) -> Self {
        let mut answer = DnsAnswer::new();
        for item in items {
            answer.add(item);
        }
        answer
    }
}
