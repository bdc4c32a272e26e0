use async_trait::async_trait;
use std::ops::BitOr;
use std::sync::Arc;

use crate::Question;
use crate::answer::DnsAnswer;
use crate::enums::{DnssecResult, TransactionState};
use crate::error::StubNsError;
use crate::packet::DnsPacket;

/// How a query should be resolved. These mirror the knobs the listener needs:
/// bypass queries turn almost everything off and demand the primary server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryFlags(u64);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    /// Resolve over every enabled protocol
    pub const ALL_PROTOCOLS: QueryFlags = QueryFlags(1 << 0);
    /// Don't follow CNAME/DNAME redirects
    pub const NO_CNAME: QueryFlags = QueryFlags(1 << 1);
    /// Don't apply search domains
    pub const NO_SEARCH: QueryFlags = QueryFlags(1 << 2);
    /// Skip DNSSEC validation
    pub const NO_VALIDATE: QueryFlags = QueryFlags(1 << 3);
    /// Only talk to the primary upstream server
    pub const REQUIRE_PRIMARY: QueryFlags = QueryFlags(1 << 4);
    /// Clamp cached TTLs when answering
    pub const CLAMP_TTL: QueryFlags = QueryFlags(1 << 5);

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

/// A unit of work handed to the resolver engine: either a plain question, or
/// (in bypass mode) the client's packet to be forwarded as-is.
#[derive(Clone, Debug)]
pub struct ResolverQuery {
    pub question: Option<Question>,
    pub bypass_packet: Option<Arc<DnsPacket>>,
    pub flags: QueryFlags,
}

impl ResolverQuery {
    pub fn from_question(question: Question, flags: QueryFlags) -> Self {
        ResolverQuery {
            question: Some(question),
            bypass_packet: None,
            flags,
        }
    }

    pub fn from_packet(packet: Arc<DnsPacket>, flags: QueryFlags) -> Self {
        ResolverQuery {
            question: None,
            bypass_packet: Some(packet),
            flags,
        }
    }
}

/// Everything a finished resolver transaction reports back. `question` is the
/// key the transaction ended up resolving - it moves along the chain as
/// [Resolver::process_cname] restarts the query.
#[derive(Clone, Debug)]
pub struct QueryCompletion {
    pub state: TransactionState,
    pub question: Question,
    pub answer: DnsAnswer,
    pub answer_rcode: u16,
    /// Present iff the resolver performed DNSSEC validation on this answer
    pub answer_dnssec_result: Option<DnssecResult>,
    /// The upstream's reply verbatim, for bypass propagation
    pub answer_full_packet: Option<DnsPacket>,
    pub fully_authenticated: bool,
    pub fully_synthetic: bool,
}

impl QueryCompletion {
    pub fn is_fully_authenticated(&self) -> bool {
        self.fully_authenticated
    }

    pub fn is_fully_synthetic(&self) -> bool {
        self.fully_synthetic
    }
}

/// What became of a CNAME-processing step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnameResult {
    /// Nothing left to chase, the completion stands as-is
    Ok,
    /// The query was restarted against the redirect target and the completion
    /// has been replaced with the next chain element's
    Restarted,
    /// The chain exceeded the redirect limit
    Loop,
}

/// The resolver engine the listener dispatches into. Implementations resolve
/// asynchronously and never block ingress; cancelling a query is dropping the
/// future.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Run a query to its terminal state
    async fn resolve(&self, query: ResolverQuery) -> Result<QueryCompletion, StubNsError>;

    /// If the completion's answer redirects its question, restart the query
    /// against the target and swap the new completion in
    async fn process_cname(
        &self,
        completion: &mut QueryCompletion,
    ) -> Result<CnameResult, StubNsError>;

    /// Loop detection: is this packet a reply to a transaction we originated
    fn is_own_transaction(&self, _packet: &DnsPacket) -> bool {
        false
    }
}
