use packed_struct::PackingError;

/// When things go awry
#[derive(Debug)]
pub enum StubNsError {
    BytePacking(String),
    InvalidName(String),
    /// The wire data didn't parse as a DNS message
    PacketParse(String),
    /// An append would have pushed the packet past its size ceiling
    MessageTooLarge,
    /// A CNAME/DNAME chain exceeded the redirect limit
    CnameLoop,
    Io(std::io::Error),
    /// Something failed in the start up of the listener
    Startup(String),
    Config(String),
    /// The resolver engine failed before delivering a completion
    Resolver(String),
    /// Failed to hand a reply back to the client
    Send(String),
}

impl std::fmt::Display for StubNsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StubNsError::BytePacking(msg) => write!(f, "byte packing failed: {msg}"),
            StubNsError::InvalidName(msg) => write!(f, "invalid domain name: {msg}"),
            StubNsError::PacketParse(msg) => write!(f, "packet parse failed: {msg}"),
            StubNsError::MessageTooLarge => write!(f, "message too large"),
            StubNsError::CnameLoop => write!(f, "CNAME redirect chain too long"),
            StubNsError::Io(err) => write!(f, "io error: {err}"),
            StubNsError::Startup(msg) => write!(f, "startup failed: {msg}"),
            StubNsError::Config(msg) => write!(f, "configuration error: {msg}"),
            StubNsError::Resolver(msg) => write!(f, "resolver failed: {msg}"),
            StubNsError::Send(msg) => write!(f, "send failed: {msg}"),
        }
    }
}

impl std::error::Error for StubNsError {}

impl From<std::io::Error> for StubNsError {
    fn from(error: std::io::Error) -> Self {
        StubNsError::Io(error)
    }
}

impl From<PackingError> for StubNsError {
    fn from(error: PackingError) -> Self {
        StubNsError::BytePacking(error.to_string())
    }
}

impl From<StubNsError> for std::io::Error {
    fn from(error: StubNsError) -> Self {
        match error {
            StubNsError::Io(err) => err,
            StubNsError::Startup(err) => std::io::Error::other(err),
            StubNsError::Config(err) => std::io::Error::other(err),
            _ => std::io::Error::other(format!("{error:?}")),
        }
    }
}
