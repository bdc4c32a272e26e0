use concread::cowcell::asynch::CowCellReadTxn;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigFile, ExtraListener};
use crate::enums::{
    DNS_RCODE_BADVERS, DNS_RCODE_FORMERR, DNS_RCODE_NXDOMAIN, DNS_RCODE_REFUSED,
    DNS_RCODE_SERVFAIL, DnsProtocol, IpProtocol, StubListenerMode, TransactionState,
};
use crate::error::StubNsError;
use crate::packet::{DnsPacket, StubPacketKey};
use crate::reply::{self, ReplySections};
use crate::resolver::{CnameResult, QueryFlags, Resolver, ResolverQuery};
use crate::{
    ADVERTISE_DATAGRAM_SIZE_MAX, ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX, DNS_STUB_PORT,
    LOOPBACK_IFINDEX, UDP_BUFFER_SIZE,
};

/// Not all libc versions carry these yet
const SO_BINDTOIFINDEX: libc::c_int = 62;
const IP_RECVFRAGSIZE: libc::c_int = 25;
const IPV6_RECVFRAGSIZE: libc::c_int = 77;
const IPV6_RECVHOPLIMIT: libc::c_int = 51;
const IPV6_MTU_DISCOVER: libc::c_int = 23;

static QUERY_ID: AtomicU64 = AtomicU64::new(0);

/// Everything a listener callback needs, passed around explicitly
#[derive(Clone)]
pub struct StubContext {
    pub resolver: Arc<dyn Resolver>,
}

#[derive(Debug)]
struct InFlightQuery {
    query_id: u64,
    packet: Arc<DnsPacket>,
}

/// One listen address: the implicit primary loopback stub, or an
/// operator-configured extra. Owns the UDP socket replies go out of and the
/// per-endpoint retransmit-suppression map.
#[derive(Debug)]
pub struct StubEndpoint {
    /// `None` on the primary stub
    extra: Option<ExtraListener>,
    udp: OnceLock<Arc<UdpSocket>>,
    queries_by_packet: Mutex<HashMap<StubPacketKey, InFlightQuery>>,
}

impl StubEndpoint {
    pub(crate) fn primary() -> Arc<Self> {
        Arc::new(StubEndpoint {
            extra: None,
            udp: OnceLock::new(),
            queries_by_packet: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn set_udp(&self, socket: Arc<UdpSocket>) {
        let _ = self.udp.set(socket);
    }

    pub(crate) fn extra(listener: ExtraListener) -> Arc<Self> {
        Arc::new(StubEndpoint {
            extra: Some(listener),
            udp: OnceLock::new(),
            queries_by_packet: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_primary(&self) -> bool {
        self.extra.is_none()
    }

    /// The datagram size this endpoint advertises in its OPT records
    fn advertise_size(&self) -> u16 {
        match self.is_primary() {
            true => ADVERTISE_DATAGRAM_SIZE_MAX,
            false => ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX,
        }
    }

    fn lock_queries(&self) -> std::sync::MutexGuard<'_, HashMap<StubPacketKey, InFlightQuery>> {
        self.queries_by_packet
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the dedup-map entry when its query ends, however it ends. The
/// query id check keeps a later query under the same key safe from us.
struct DedupGuard {
    endpoint: Arc<StubEndpoint>,
    key: StubPacketKey,
    query_id: u64,
}

impl Drop for DedupGuard {
    fn drop(&mut self) {
        let mut queries = self.endpoint.lock_queries();
        if queries.get(&self.key).map(|q| q.query_id) == Some(self.query_id) {
            queries.remove(&self.key);
        }
    }
}

/// An accepted TCP connection: the write half replies funnel through, and the
/// token that cancels all of the stream's in-flight queries when the client
/// goes away.
#[derive(Debug)]
pub struct DnsStream {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl DnsStream {
    /// Write one length-prefixed DNS message, RFC 7766 section 8
    async fn write_packet(&self, bytes: &[u8]) -> Result<(), StubNsError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(bytes.len() as u16).to_be_bytes())
            .await?;
        writer.write_all(bytes).await?;
        Ok(())
    }
}

/// Route a finished reply back the way the query came: through the TCP
/// stream when there is one, otherwise out the endpoint's UDP socket. The
/// UDP socket is bound to a concrete address, which pins the reply source so
/// the kernel can't substitute 127.0.0.1 for the stub address.
async fn dns_stub_send(
    endpoint: &StubEndpoint,
    stream: Option<&Arc<DnsStream>>,
    request: &DnsPacket,
    reply: Vec<u8>,
) {
    let result = match stream {
        Some(stream) => stream.write_packet(&reply).await,
        None => match endpoint.udp.get() {
            Some(socket) => socket
                .send_to(&reply, request.sender)
                .await
                .map(|_| ())
                .map_err(StubNsError::from),
            None => Err(StubNsError::Send(
                "endpoint has no UDP socket".to_string(),
            )),
        },
    };
    if let Err(error) = result {
        debug!("Failed to send reply packet: {error:?}");
    }
}

async fn send_failure(
    endpoint: &StubEndpoint,
    stream: Option<&Arc<DnsStream>>,
    request: &DnsPacket,
    rcode: u16,
    authenticated: bool,
) {
    match reply::build_failure(
        request,
        rcode,
        authenticated,
        endpoint.advertise_size(),
        endpoint.is_primary(),
    ) {
        Ok(bytes) => dns_stub_send(endpoint, stream, request, bytes).await,
        Err(error) => debug!("Failed to build failure packet: {error:?}"),
    }
}

async fn send_reply(
    endpoint: &StubEndpoint,
    stream: Option<&Arc<DnsStream>>,
    request: &DnsPacket,
    sections: &mut ReplySections,
    completion: &crate::resolver::QueryCompletion,
    rcode: u16,
) {
    match reply::build_reply(
        request,
        sections,
        completion,
        rcode,
        endpoint.advertise_size(),
        endpoint.is_primary(),
    ) {
        Ok(bytes) => dns_stub_send(endpoint, stream, request, bytes).await,
        Err(error) => debug!("Failed to build reply packet: {error:?}"),
    }
}

/// Admission control for one decoded query packet: policy checks first (each
/// answered with its response code), then retransmit suppression, then hand
/// off to the resolver as a spawned per-query task.
#[instrument(level = "debug", skip_all, fields(id = packet.id(), sender = %packet.sender))]
async fn process_query(
    ctx: &StubContext,
    endpoint: &Arc<StubEndpoint>,
    stream: Option<Arc<DnsStream>>,
    mut packet: DnsPacket,
) {
    if endpoint.is_primary()
        && (!packet.sender.ip().is_loopback() || !packet.destination.is_loopback())
    {
        warn!("Got packet on unexpected (i.e. non-localhost) IP range, ignoring.");
        return;
    }

    if ctx.resolver.is_own_transaction(&packet) {
        debug!("Got our own packet looped back, ignoring.");
        return;
    }

    // the duplicate check only needs the header bytes, so it runs before extraction
    let key = packet.dedup_key();
    {
        let queries = endpoint.lock_queries();
        if let Some(existing) = queries.get(&key) {
            if existing.packet.bytes() == packet.bytes() {
                debug!("Got repeat packet from client, ignoring.");
                return;
            }
        }
    }

    if let Err(error) = packet.extract() {
        debug!("Failed to extract resources from incoming packet, ignoring packet: {error:?}");
        send_failure(endpoint, stream.as_ref(), &packet, DNS_RCODE_FORMERR, false).await;
        return;
    }

    if !packet.version_supported() {
        debug!("Got EDNS OPT field with unsupported version number.");
        send_failure(endpoint, stream.as_ref(), &packet, DNS_RCODE_BADVERS, false).await;
        return;
    }

    let Some(question) = packet.question().cloned() else {
        // validate_query() already demanded exactly one question entry
        debug!("Extracted packet carries no question, ignoring.");
        return;
    };

    if question.qtype().is_obsolete() {
        debug!("Got message with obsolete key type, refusing.");
        send_failure(endpoint, stream.as_ref(), &packet, DNS_RCODE_REFUSED, false).await;
        return;
    }

    if question.qtype().is_zone_transfer() {
        debug!("Got request for zone transfer, refusing.");
        send_failure(endpoint, stream.as_ref(), &packet, DNS_RCODE_REFUSED, false).await;
        return;
    }

    if !packet.header().recursion_desired {
        // If recursion was not requested, refuse operation - all we can do is recurse
        debug!("Got request with recursion disabled, refusing.");
        send_failure(endpoint, stream.as_ref(), &packet, DNS_RCODE_REFUSED, false).await;
        return;
    }

    let bypass = packet.edns_do() && packet.header().cd;
    let packet = Arc::new(packet);

    let query = if bypass {
        debug!("Got request with DNSSEC checking disabled, enabling bypass logic.");
        ResolverQuery::from_packet(
            packet.clone(),
            QueryFlags::ALL_PROTOCOLS
                | QueryFlags::NO_CNAME
                | QueryFlags::NO_SEARCH
                | QueryFlags::NO_VALIDATE
                | QueryFlags::REQUIRE_PRIMARY
                | QueryFlags::CLAMP_TTL,
        )
    } else {
        let mut flags = QueryFlags::ALL_PROTOCOLS | QueryFlags::NO_SEARCH | QueryFlags::CLAMP_TTL;
        if packet.edns_do() {
            flags = flags | QueryFlags::REQUIRE_PRIMARY;
        }
        ResolverQuery::from_question(question, flags)
    };

    // Register the query for retransmit suppression. This is best-effort: a
    // colliding key means we just won't recognize this client's duplicates.
    let query_id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
    let guard = {
        let mut queries = endpoint.lock_queries();
        match queries.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(InFlightQuery {
                    query_id,
                    packet: packet.clone(),
                });
                Some(DedupGuard {
                    endpoint: endpoint.clone(),
                    key,
                    query_id,
                })
            }
            Entry::Occupied(_) => None,
        }
    };

    debug!("Processing query...");
    let ctx = ctx.clone();
    let endpoint = endpoint.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let cancelled = stream.as_ref().map(|s| s.cancel.clone());
        match cancelled {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("TCP stream closed, dropping in-flight query.");
                    }
                    _ = run_query(&ctx, &endpoint, stream, packet, query, bypass) => {}
                }
            }
            None => run_query(&ctx, &endpoint, stream, packet, query, bypass).await,
        }
    });
}

/// Drive one query through the resolver and map its terminal state onto a
/// reply (or deliberate silence). CNAME restarts loop back here, accumulating
/// into the same sections.
async fn run_query(
    ctx: &StubContext,
    endpoint: &Arc<StubEndpoint>,
    stream: Option<Arc<DnsStream>>,
    packet: Arc<DnsPacket>,
    query: ResolverQuery,
    bypass: bool,
) {
    let mut completion = match ctx.resolver.resolve(query).await {
        Ok(completion) => completion,
        Err(error) => {
            error!("Failed to run query: {error}");
            send_failure(endpoint, stream.as_ref(), &packet, DNS_RCODE_SERVFAIL, false).await;
            return;
        }
    };

    let mut sections = ReplySections::default();

    loop {
        if bypass {
            // Propagate the upstream packet if we have it and it is regular
            // DNS. LLMNR or mDNS packets are not 100% bit-compatible.
            if let Some(full_packet) = &completion.answer_full_packet {
                if full_packet.protocol == DnsProtocol::Dns {
                    match reply::patch_bypass_reply(full_packet, &packet) {
                        Ok(bytes) => {
                            dns_stub_send(endpoint, stream.as_ref(), &packet, bytes).await;
                        }
                        Err(error) => {
                            debug!("Failed to patch bypass reply packet: {error:?}");
                        }
                    }
                    return;
                }
            }
        }

        // Take all data from the current reply and merge it into the three
        // sections we are building up. This happens before CNAME processing,
        // so the sections gradually collect every RR in the chain.
        let edns0_do = reply::reply_with_edns0_do(&packet, &completion);
        if let Err(error) =
            reply::assign_sections(&mut sections, &completion.answer, &completion.question, edns0_do)
        {
            debug!("Failed to assign sections: {error:?}");
            return;
        }

        match completion.state {
            TransactionState::Success => {
                match ctx.resolver.process_cname(&mut completion).await {
                    Ok(CnameResult::Restarted) => continue,
                    Ok(CnameResult::Ok) => {
                        let rcode = completion.answer_rcode;
                        send_reply(endpoint, stream.as_ref(), &packet, &mut sections, &completion, rcode)
                            .await;
                        return;
                    }
                    Ok(CnameResult::Loop) => {
                        debug!("Detected CNAME loop, returning what we already have.");
                        let rcode = completion.answer_rcode;
                        send_reply(endpoint, stream.as_ref(), &packet, &mut sections, &completion, rcode)
                            .await;
                        return;
                    }
                    Err(error) => {
                        debug!("Failed to process CNAME: {error}");
                        return;
                    }
                }
            }
            TransactionState::RcodeFailure => {
                let rcode = completion.answer_rcode;
                send_reply(endpoint, stream.as_ref(), &packet, &mut sections, &completion, rcode)
                    .await;
                return;
            }
            TransactionState::NotFound => {
                send_reply(
                    endpoint,
                    stream.as_ref(),
                    &packet,
                    &mut sections,
                    &completion,
                    DNS_RCODE_NXDOMAIN,
                )
                .await;
                return;
            }
            TransactionState::Timeout | TransactionState::AttemptsMaxReached => {
                // Propagate a timeout as no packet, i.e. the client also gets a timeout
                return;
            }
            TransactionState::NoServers
            | TransactionState::InvalidReply
            | TransactionState::Errno
            | TransactionState::Aborted
            | TransactionState::DnssecFailed
            | TransactionState::NoTrustAnchor
            | TransactionState::RrTypeUnsupported
            | TransactionState::NetworkDown
            | TransactionState::NoSource
            | TransactionState::StubLoop => {
                send_reply(
                    endpoint,
                    stream.as_ref(),
                    &packet,
                    &mut sections,
                    &completion,
                    DNS_RCODE_SERVFAIL,
                )
                .await;
                return;
            }
            TransactionState::Null
            | TransactionState::Pending
            | TransactionState::Validating => {
                unreachable!("resolver reported a non-terminal transaction state")
            }
        }
    }
}

pub async fn udp_server(
    ctx: StubContext,
    endpoint: Arc<StubEndpoint>,
    socket: Arc<UdpSocket>,
) -> std::io::Result<()> {
    let local_ip = socket.local_addr()?.ip();
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(value) => value,
            Err(error) => {
                error!("Error receiving DNS query via UDP: {error:?}");
                continue;
            }
        };
        debug!("{len} bytes received from {addr:?}");

        let packet = match DnsPacket::from_wire(
            buf[0..len].to_vec(),
            DnsProtocol::Dns,
            IpProtocol::Udp,
            addr,
            local_ip,
            0,
        ) {
            Ok(packet) => packet,
            Err(error) => {
                debug!("Invalid DNS stub UDP packet, ignoring: {error:?}");
                continue;
            }
        };

        if !packet.validate_query() {
            debug!("Invalid DNS stub UDP packet, ignoring.");
            continue;
        }

        debug!("Got DNS stub UDP query packet for id {}", packet.id());
        process_query(&ctx, &endpoint, None, packet).await;
    }
}

/// main handler for the TCP side of things
///
/// Ref <https://www.rfc-editor.org/rfc/rfc7766>
pub async fn tcp_server(
    ctx: StubContext,
    endpoint: Arc<StubEndpoint>,
    listener: TcpListener,
) -> std::io::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(value) => value,
            Err(error) => {
                error!("Couldn't accept TCP connection: {error:?}");
                continue;
            }
        };

        debug!("TCP connection from {addr:?}");
        let conn_ctx = ctx.clone();
        let conn_endpoint = endpoint.clone();
        tokio::spawn(async move {
            tcp_conn_handler(conn_ctx, conn_endpoint, stream, addr).await;
        });
    }
}

#[instrument(level = "debug", skip_all, fields(peer = %addr))]
async fn tcp_conn_handler(
    ctx: StubContext,
    endpoint: Arc<StubEndpoint>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let local_ip = match stream.local_addr() {
        Ok(value) => value.ip(),
        Err(error) => {
            debug!("Couldn't get local address of TCP stream: {error:?}");
            return;
        }
    };

    let (mut reader, writer) = stream.into_split();
    let stream = Arc::new(DnsStream {
        writer: tokio::sync::Mutex::new(writer),
        cancel: CancellationToken::new(),
    });

    loop {
        // every message rides behind a two-byte length prefix,
        // ref <https://www.rfc-editor.org/rfc/rfc7766#section-8>
        let msg_length = match reader.read_u16().await {
            Ok(value) => value as usize,
            Err(_) => break,
        };

        let mut buf = vec![0u8; msg_length];
        if let Err(error) = reader.read_exact(&mut buf).await {
            debug!("Failed to read from TCP stream: {error:?}");
            break;
        }

        let packet = match DnsPacket::from_wire(
            buf,
            DnsProtocol::Dns,
            IpProtocol::Tcp,
            addr,
            local_ip,
            0,
        ) {
            Ok(packet) => packet,
            Err(error) => {
                debug!("Invalid DNS stub TCP packet, ignoring: {error:?}");
                continue;
            }
        };

        if !packet.validate_query() {
            debug!("Invalid DNS stub TCP packet, ignoring.");
            continue;
        }

        debug!("Got DNS stub TCP query packet for id {}", packet.id());
        process_query(&ctx, &endpoint, Some(stream.clone()), packet).await;
    }

    debug!("DNS TCP connection terminated, destroying queries.");
    stream.cancel.cancel();
}

fn setsockopt_int(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    match result {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

fn set_stub_common_socket_options(socket: &Socket, v6: bool) -> std::io::Result<()> {
    socket.set_reuse_address(true)?;

    // knowing the TTL of incoming packets is useful, but not essential
    let (level, optname) = match v6 {
        true => (libc::IPPROTO_IPV6, IPV6_RECVHOPLIMIT),
        false => (libc::IPPROTO_IP, libc::IP_RECVTTL),
    };
    if let Err(error) = setsockopt_int(socket.as_raw_fd(), level, optname, 1) {
        debug!("Failed to enable receive-TTL, ignoring: {error:?}");
    }

    Ok(())
}

fn set_stub_tcp_socket_options(socket: &Socket) {
    // Everybody appears to pick qlen=5, let's do the same here
    if let Err(error) = setsockopt_int(socket.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_FASTOPEN, 5)
    {
        debug!("Failed to enable TCP_FASTOPEN on TCP listening socket, ignoring: {error:?}");
    }
    if let Err(error) = socket.set_nodelay(true) {
        debug!("Failed to enable TCP_NODELAY mode, ignoring: {error:?}");
    }
}

/// Build a primary stub socket: loopback-pinned, outgoing TTL forced to 1 so
/// replies can never travel off-link.
fn stub_socket(addr: SocketAddr, ipproto: IpProtocol) -> std::io::Result<Socket> {
    let (sock_type, protocol) = match ipproto {
        IpProtocol::Udp => (Type::DGRAM, Protocol::UDP),
        IpProtocol::Tcp => (Type::STREAM, Protocol::TCP),
    };
    let socket = Socket::new(Domain::for_address(addr), sock_type, Some(protocol))?;
    socket.set_nonblocking(true)?;
    set_stub_common_socket_options(&socket, addr.is_ipv6())?;
    if ipproto == IpProtocol::Tcp {
        set_stub_tcp_socket_options(&socket);
    }

    // Make sure no traffic from outside the local host can leak onto this socket
    if let Err(error) = setsockopt_int(
        socket.as_raw_fd(),
        libc::SOL_SOCKET,
        SO_BINDTOIFINDEX,
        LOOPBACK_IFINDEX as libc::c_int,
    ) {
        debug!("Failed to bind stub socket to the loopback interface, ignoring: {error:?}");
    }
    match addr.is_ipv6() {
        true => socket.set_unicast_hops_v6(1)?,
        false => socket.set_ttl(1)?,
    }

    socket.bind(&addr.into())?;
    if ipproto == IpProtocol::Tcp {
        socket.listen(libc::SOMAXCONN)?;
    }
    Ok(socket)
}

/// Build an extra stub socket. No TTL forcing here, as the address may not be
/// local and in that case people may want ttl > 1.
fn extra_stub_socket(listener: &ExtraListener, ipproto: IpProtocol) -> std::io::Result<Socket> {
    let port = match listener.port {
        0 => DNS_STUB_PORT,
        port => port,
    };
    let addr = SocketAddr::new(listener.address, port);
    let (sock_type, protocol) = match ipproto {
        IpProtocol::Udp => (Type::DGRAM, Protocol::UDP),
        IpProtocol::Tcp => (Type::STREAM, Protocol::TCP),
    };
    let socket = Socket::new(Domain::for_address(addr), sock_type, Some(protocol))?;
    socket.set_nonblocking(true)?;
    set_stub_common_socket_options(&socket, addr.is_ipv6())?;
    if ipproto == IpProtocol::Tcp {
        set_stub_tcp_socket_options(&socket);
    }

    // the configured address may not be assigned yet, bind anyway
    socket.set_freebind(true)?;

    if ipproto == IpProtocol::Udp {
        let (level, optname) = match addr.is_ipv6() {
            true => (libc::IPPROTO_IPV6, IPV6_MTU_DISCOVER),
            false => (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER),
        };
        if let Err(error) =
            setsockopt_int(socket.as_raw_fd(), level, optname, libc::IP_PMTUDISC_OMIT)
        {
            debug!("Failed to disable UDP PMTUD, ignoring: {error:?}");
        }

        let (level, optname) = match addr.is_ipv6() {
            true => (libc::IPPROTO_IPV6, IPV6_RECVFRAGSIZE),
            false => (libc::IPPROTO_IP, IP_RECVFRAGSIZE),
        };
        if let Err(error) = setsockopt_int(socket.as_raw_fd(), level, optname, 1) {
            debug!("Failed to enable fragment size reception, ignoring: {error:?}");
        }
    }

    socket.bind(&addr.into())?;
    if ipproto == IpProtocol::Tcp {
        socket.listen(libc::SOMAXCONN)?;
    }
    Ok(socket)
}

fn udp_socket_from(socket: Socket) -> std::io::Result<UdpSocket> {
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

fn tcp_listener_from(socket: Socket) -> std::io::Result<TcpListener> {
    TcpListener::from_std(std::net::TcpListener::from(socket))
}

/// The spawned listener tasks, for shutdown and liveness checks
#[derive(Debug, Default)]
pub struct Servers {
    pub udpservers: Vec<JoinHandle<std::io::Result<()>>>,
    pub tcpservers: Vec<JoinHandle<std::io::Result<()>>>,
}

impl Servers {
    pub fn stop(&self) {
        for server in self.udpservers.iter().chain(self.tcpservers.iter()) {
            server.abort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.udpservers.is_empty() && self.tcpservers.is_empty()
    }

    pub fn all_finished(&self) -> bool {
        self.udpservers
            .iter()
            .chain(self.tcpservers.iter())
            .all(|server| server.is_finished())
    }
}

fn log_extra_bind_failure(transport: &str, listener: &ExtraListener, error: &std::io::Error) {
    match error.kind() {
        ErrorKind::AddrInUse => warn!(
            "Another process is already listening on {transport} socket {listener}: {error}"
        ),
        _ => warn!("Failed to listen on {transport} socket {listener}: {error}"),
    }
}

/// Bring up the stub listener set from configuration. A primary bind failure
/// with "address in use" or "permission denied" disables the stub entirely
/// but is not fatal; any other primary failure is. Extra endpoints come up
/// best-effort, each failure logged and skipped.
pub async fn start_stub(
    config: CowCellReadTxn<ConfigFile>,
    resolver: Arc<dyn Resolver>,
) -> Result<Servers, StubNsError> {
    let ctx = StubContext { resolver };
    let mut servers = Servers::default();

    let mode = config.stub_listener;
    match mode {
        StubListenerMode::No => debug!("Not creating stub listener."),
        StubListenerMode::Udp => debug!("Creating stub listener using UDP."),
        StubListenerMode::Tcp => debug!("Creating stub listener using TCP."),
        StubListenerMode::Yes => debug!("Creating stub listener using UDP/TCP."),
    };

    let stub_addr = config.stub_listener_address()?;
    let primary = StubEndpoint::primary();
    let mut primary_result: std::io::Result<()> = Ok(());
    let mut transport = "UDP";

    if mode.udp_enabled() {
        match stub_socket(stub_addr, IpProtocol::Udp) {
            Ok(socket) => {
                let socket = Arc::new(udp_socket_from(socket)?);
                primary.set_udp(socket.clone());
                info!("Started UDP listener on {stub_addr}");
                servers
                    .udpservers
                    .push(tokio::spawn(udp_server(ctx.clone(), primary.clone(), socket)));
            }
            Err(error) => primary_result = Err(error),
        }
    }

    if primary_result.is_ok() && mode.tcp_enabled() {
        transport = "TCP";
        match stub_socket(stub_addr, IpProtocol::Tcp) {
            Ok(socket) => {
                let listener = tcp_listener_from(socket)?;
                info!("Started TCP listener on {stub_addr}");
                servers.tcpservers.push(tokio::spawn(tcp_server(
                    ctx.clone(),
                    primary.clone(),
                    listener,
                )));
            }
            Err(error) => primary_result = Err(error),
        }
    }

    if let Err(error) = primary_result {
        match error.kind() {
            ErrorKind::AddrInUse => {
                warn!(
                    "Another process is already listening on {transport} socket {stub_addr}. Turning off local DNS stub support."
                );
                servers.stop();
                servers = Servers::default();
            }
            ErrorKind::PermissionDenied => {
                warn!(
                    "Failed to listen on {transport} socket {stub_addr}: {error}. Turning off local DNS stub support."
                );
                servers.stop();
                servers = Servers::default();
            }
            _ => {
                servers.stop();
                return Err(StubNsError::Startup(format!(
                    "Failed to listen on {transport} socket {stub_addr}: {error}"
                )));
            }
        }
    }

    if !config.extra_listeners.is_empty() {
        debug!("Creating extra stub listeners.");

        for listener in &config.extra_listeners {
            let endpoint = StubEndpoint::extra(listener.clone());

            if listener.mode.udp_enabled() {
                match extra_stub_socket(listener, IpProtocol::Udp) {
                    Ok(socket) => match udp_socket_from(socket) {
                        Ok(socket) => {
                            let socket = Arc::new(socket);
                            endpoint.set_udp(socket.clone());
                            debug!("Listening on UDP socket {listener}.");
                            servers.udpservers.push(tokio::spawn(udp_server(
                                ctx.clone(),
                                endpoint.clone(),
                                socket,
                            )));
                        }
                        Err(error) => log_extra_bind_failure("UDP", listener, &error),
                    },
                    Err(error) => log_extra_bind_failure("UDP", listener, &error),
                }
            }

            if listener.mode.tcp_enabled() {
                match extra_stub_socket(listener, IpProtocol::Tcp) {
                    Ok(socket) => match tcp_listener_from(socket) {
                        Ok(tcp_listener) => {
                            debug!("Listening on TCP socket {listener}.");
                            servers.tcpservers.push(tokio::spawn(tcp_server(
                                ctx.clone(),
                                endpoint.clone(),
                                tcp_listener,
                            )));
                        }
                        Err(error) => log_extra_bind_failure("TCP", listener, &error),
                    },
                    Err(error) => log_extra_bind_failure("TCP", listener, &error),
                }
            }
        }
    }

    Ok(servers)
}
