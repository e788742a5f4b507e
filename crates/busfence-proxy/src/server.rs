//! Listener and per-connection driver.
//!
//! The [`Proxy`] binds one Unix socket, accepts clients, dials a fresh
//! upstream bus connection per client, and drives each pair of sockets
//! on its own task. A client therefore gets exactly the view the bus
//! gives a single connection; nothing is shared between clients except
//! the immutable policy table.
//!
//! # Connection lifecycle
//!
//! ```text
//! client ──▶ credential byte ──▶ SASL lines ──▶ BEGIN ──▶ messages
//!   bus  ◀── credential byte ◀── SASL lines ◀──────────◀─ messages
//! ```
//!
//! Authentication is relayed verbatim, not terminated: the proxy only
//! counts client commands and bus reply lines so it knows when each
//! direction switches from line mode to binary framing. The client side
//! switches after its `BEGIN`; the bus side switches once every
//! outstanding command has been answered *and* the `BEGIN` has been
//! seen, so late reply lines are not misparsed as message bytes.
//!
//! When either peer closes, pending output for the other side is
//! flushed and the connection ends; no half-open relaying.

use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use busfence_core::policy::{PolicyLevel, PolicyTable};
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::connection::ConnectionState;
use crate::error::{ProxyError, ProxyResult, DEFAULT_MAX_QUEUED_BYTES};
use crate::filter::{FilterEngine, Verdict};
use crate::pump::{split, Inbound, Phase, ReadPump, WritePump};

/// Maximum concurrently proxied connections.
const MAX_CONNECTIONS: usize = 128;

/// How long a failed connection may spend flushing queued output.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Proxy configuration.
///
/// Built once, then shared read-only by every connection task.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    bus_address: String,
    listen_path: PathBuf,
    policy: PolicyTable,
    filter: bool,
    log_messages: bool,
    max_queued_bytes: usize,
}

impl ProxyConfig {
    /// Creates a config proxying `bus_address` behind `listen_path`.
    ///
    /// Filtering starts enabled with an empty table, so every name is
    /// hidden until granted.
    #[must_use]
    pub fn new(bus_address: impl Into<String>, listen_path: impl Into<PathBuf>) -> Self {
        Self {
            bus_address: bus_address.into(),
            listen_path: listen_path.into(),
            policy: PolicyTable::new(),
            filter: true,
            log_messages: false,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
        }
    }

    /// Grants `level` to an exact name.
    pub fn add_policy(&mut self, name: impl Into<String>, level: PolicyLevel) -> &mut Self {
        self.policy.add_policy(name, level);
        self
    }

    /// Grants `level` to every direct child of `prefix`.
    pub fn add_wildcard_policy(
        &mut self,
        prefix: impl Into<String>,
        level: PolicyLevel,
    ) -> &mut Self {
        self.policy.add_wildcard_policy(prefix, level);
        self
    }

    /// Enables or disables filtering (enabled by default).
    pub fn set_filter(&mut self, filter: bool) -> &mut Self {
        self.filter = filter;
        self
    }

    /// Enables per-message debug logging.
    pub fn set_log_messages(&mut self, log: bool) -> &mut Self {
        self.log_messages = log;
        self
    }

    /// Overrides the per-side cap on queued outgoing bytes.
    pub fn set_max_queued_bytes(&mut self, max: usize) -> &mut Self {
        self.max_queued_bytes = max;
        self
    }

    /// The upstream bus address.
    #[must_use]
    pub fn bus_address(&self) -> &str {
        &self.bus_address
    }

    /// The path the proxy listens on.
    #[must_use]
    pub fn listen_path(&self) -> &Path {
        &self.listen_path
    }
}

/// Connects to a bus address.
///
/// Accepts `unix:path=`, `unix:abstract=` and bare filesystem paths.
/// A `;`-separated list is tried left to right; extra key/value pairs
/// after a `,` (such as `guid=`) are ignored.
///
/// # Errors
///
/// Returns [`ProxyError::UnsupportedAddress`] if no component of the
/// address names a transport this proxy speaks, or the I/O error from
/// the last failed connection attempt.
pub async fn dial_bus(address: &str) -> ProxyResult<UnixStream> {
    let mut last_err: Option<ProxyError> = None;
    for part in address.split(';').filter(|part| !part.is_empty()) {
        match dial_one(part).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(address = part, error = %err, "bus address candidate failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ProxyError::UnsupportedAddress {
        address: address.to_owned(),
    }))
}

async fn dial_one(address: &str) -> ProxyResult<UnixStream> {
    if let Some(rest) = address.strip_prefix("unix:") {
        for pair in rest.split(',') {
            if let Some(path) = pair.strip_prefix("path=") {
                return Ok(UnixStream::connect(path).await?);
            }
            if let Some(name) = pair.strip_prefix("abstract=") {
                return connect_abstract(name);
            }
        }
        return Err(ProxyError::UnsupportedAddress {
            address: address.to_owned(),
        });
    }
    if address.starts_with('/') {
        return Ok(UnixStream::connect(address).await?);
    }
    Err(ProxyError::UnsupportedAddress {
        address: address.to_owned(),
    })
}

/// Connects to an abstract-namespace socket (Linux only).
fn connect_abstract(name: &str) -> ProxyResult<UnixStream> {
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = StdUnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// The listening proxy.
pub struct Proxy {
    listener: UnixListener,
    config: Arc<ProxyConfig>,
    policy: Arc<PolicyTable>,
}

impl Proxy {
    /// Binds the listening socket.
    ///
    /// A stale socket file at the listen path is removed first; two
    /// proxies racing for the same path is a deployment error this does
    /// not try to detect.
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub fn bind(config: ProxyConfig) -> ProxyResult<Self> {
        match std::fs::remove_file(config.listen_path()) {
            Ok(()) => debug!(path = %config.listen_path().display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(config.listen_path())?;
        info!(
            path = %config.listen_path().display(),
            bus = config.bus_address(),
            filter = config.filter,
            "proxy listening"
        );
        let policy = Arc::new(config.policy.clone());
        Ok(Self {
            listener,
            config: Arc::new(config),
            policy,
        })
    }

    /// Accepts and proxies connections until the task is cancelled.
    ///
    /// Each accepted client gets its own upstream bus connection and
    /// its own task; a failed upstream dial rejects only that client.
    ///
    /// # Errors
    ///
    /// Returns only accept-loop failures; per-connection errors are
    /// logged and end that connection alone.
    pub async fn run(&self) -> ProxyResult<()> {
        let permits = Arc::new(Semaphore::new(MAX_CONNECTIONS));
        loop {
            let (client, _) = self.listener.accept().await?;
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                // The semaphore is never closed.
                continue;
            };
            let config = Arc::clone(&self.config);
            let policy = Arc::clone(&self.policy);
            tokio::spawn(async move {
                let _permit = permit;
                let bus = match dial_bus(config.bus_address()).await {
                    Ok(bus) => bus,
                    Err(err) => {
                        warn!(error = %err, "failed to reach bus; dropping client");
                        return;
                    }
                };
                match run_connection(client, bus, &config, policy).await {
                    Ok(()) => debug!("connection finished"),
                    Err(err) if err.is_protocol_violation() => {
                        warn!(error = %err, "closing connection on protocol violation");
                    }
                    Err(err) => debug!(error = %err, "connection ended with error"),
                }
            });
        }
    }
}

/// Tracks how far the relayed authentication handshake has progressed.
///
/// Every client command line except `BEGIN` is owed exactly one reply
/// line from the bus. The bus side leaves line mode only when both the
/// `BEGIN` has been seen and no reply is outstanding.
#[derive(Debug, Default)]
struct AuthProgress {
    begun: bool,
    outstanding: u32,
}

impl AuthProgress {
    fn bus_side_done(&self) -> bool {
        self.begun && self.outstanding == 0
    }
}

fn is_begin_line(line: &[u8]) -> bool {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    trimmed == b"BEGIN"
}

/// Drives one proxied connection to completion.
///
/// # Errors
///
/// Returns the first fatal error from either side. Output already
/// queued for either peer is flushed best-effort before the sockets
/// drop, so a message accepted before the failure is not lost.
pub async fn run_connection(
    client: UnixStream,
    bus: UnixStream,
    config: &ProxyConfig,
    policy: Arc<PolicyTable>,
) -> ProxyResult<()> {
    let (mut client_rx, mut client_tx) = split(
        client,
        "client",
        Phase::CredentialByte,
        config.max_queued_bytes,
    );
    let (mut bus_rx, mut bus_tx) = split(bus, "bus", Phase::Auth, config.max_queued_bytes);

    let engine = FilterEngine::new(config.filter, config.log_messages);
    let mut state = ConnectionState::new(policy);
    let mut auth = AuthProgress::default();

    let result = drive(
        &engine,
        &mut state,
        &mut auth,
        &mut client_rx,
        &mut client_tx,
        &mut bus_rx,
        &mut bus_tx,
    )
    .await;
    if result.is_err() {
        drain(&mut client_tx, &mut bus_tx).await;
    }
    result
}

/// Relays units between the two sides until EOF or a fatal error.
async fn drive(
    engine: &FilterEngine,
    state: &mut ConnectionState,
    auth: &mut AuthProgress,
    client_rx: &mut ReadPump,
    client_tx: &mut WritePump,
    bus_rx: &mut ReadPump,
    bus_tx: &mut WritePump,
) -> ProxyResult<()> {
    let mut closing = false;
    loop {
        if closing && !client_tx.has_pending() && !bus_tx.has_pending() {
            return Ok(());
        }
        select! {
            unit = client_rx.next_unit(), if !closing => {
                if !handle_client_unit(unit?, engine, state, auth, client_rx, bus_rx, bus_tx)? {
                    closing = true;
                }
            }
            unit = bus_rx.next_unit(), if !closing => {
                if !handle_bus_unit(unit?, engine, state, auth, bus_rx, client_tx)? {
                    closing = true;
                }
            }
            ready = bus_tx.writable(), if bus_tx.has_pending() => {
                ready?;
                bus_tx.write_pending()?;
            }
            ready = client_tx.writable(), if client_tx.has_pending() => {
                ready?;
                client_tx.write_pending()?;
            }
        }
    }
}

/// Flushes whatever both queues still hold, bounded in time.
///
/// Errors here are swallowed; the connection is already failing and the
/// peers may be gone.
async fn drain(client_tx: &mut WritePump, bus_tx: &mut WritePump) {
    let flush = async {
        while client_tx.has_pending() || bus_tx.has_pending() {
            select! {
                ready = bus_tx.writable(), if bus_tx.has_pending() => {
                    if ready.is_err() || bus_tx.write_pending().is_err() {
                        return;
                    }
                }
                ready = client_tx.writable(), if client_tx.has_pending() => {
                    if ready.is_err() || client_tx.write_pending().is_err() {
                        return;
                    }
                }
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, flush).await.is_err() {
        debug!("drain timed out with output still queued");
    }
}

/// Handles one unit from the client. Returns `false` on EOF.
fn handle_client_unit(
    unit: Inbound,
    engine: &FilterEngine,
    state: &mut ConnectionState,
    auth: &mut AuthProgress,
    client_rx: &mut ReadPump,
    bus_rx: &mut ReadPump,
    bus_tx: &mut WritePump,
) -> ProxyResult<bool> {
    match unit {
        Inbound::CredentialByte(byte) => {
            bus_tx.enqueue(Buffer::credential_byte(byte))?;
        }
        Inbound::AuthLine(line) => {
            if is_begin_line(&line) {
                auth.begun = true;
                client_rx.set_phase(Phase::Messages);
                if auth.bus_side_done() {
                    bus_rx.set_phase(Phase::Messages);
                }
            } else {
                auth.outstanding += 1;
            }
            bus_tx.enqueue(Buffer::from_bytes(line))?;
        }
        Inbound::Message(header, buffer) => {
            match engine.on_client_message(state, &header, buffer)? {
                Verdict::Forward(out) => bus_tx.enqueue(out)?,
                Verdict::Drop => {}
            }
        }
        Inbound::Closed => {
            debug!("client closed");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Handles one unit from the bus. Returns `false` on EOF.
fn handle_bus_unit(
    unit: Inbound,
    engine: &FilterEngine,
    state: &mut ConnectionState,
    auth: &mut AuthProgress,
    bus_rx: &mut ReadPump,
    client_tx: &mut WritePump,
) -> ProxyResult<bool> {
    match unit {
        Inbound::CredentialByte(_) => {
            // The bus side starts past the credential exchange; a byte
            // classified this way means the phase tracking went wrong.
            return Err(ProxyError::UnexpectedCredentialByte);
        }
        Inbound::AuthLine(line) => {
            auth.outstanding = auth.outstanding.saturating_sub(1);
            if auth.bus_side_done() {
                bus_rx.set_phase(Phase::Messages);
            }
            client_tx.enqueue(Buffer::from_bytes(line))?;
        }
        Inbound::Message(header, buffer) => {
            match engine.on_bus_message(state, &header, buffer)? {
                Verdict::Forward(out) => client_tx.enqueue(out)?,
                Verdict::Drop => {}
            }
        }
        Inbound::Closed => {
            debug!("bus closed");
            return Ok(false);
        }
    }
    Ok(true)
}
