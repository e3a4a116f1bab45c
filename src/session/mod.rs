//! A session owns exactly one physical connection to a MySQL server and the
//! protocol state that rides on it: the handshake/authentication sequence,
//! the packet sequence counter (inside the codec), optional TLS and
//! compression layers, a prepared-statement cache, and the cancellation
//! flag for the in-flight exchange.
//!
//! The wire protocol is strictly half-duplex per connection: one exchange
//! at a time, enforced by the active command id.

mod cancel;
mod state;
mod statements;
mod stream;

pub use cancel::{cancel, CancelFlag, CancelState, CancelTicket};
pub use state::SessionState;
pub use statements::{PreparedStatement, StatementCache};
pub use stream::MaybeTlsStream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::{Framed, FramedParts};
use tracing::debug;

use crate::balancer::HostEndpoint;
use crate::config::{ConnectOptions, TlsMode};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::protocol::packet::capabilities::*;
use crate::protocol::wire::PayloadReader;
use crate::protocol::{
    auth, is_auth_more_data, is_auth_switch, is_eof_packet, is_err_packet, is_ok_packet,
    AuthPlugin, AuthSwitchRequest, Command, ErrPacket, HandshakeResponse, InitialHandshake,
    PayloadCodec,
};

/// Process-wide session id source, for diagnostics and logging.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_CHARACTER_SET: u8 = 0x21; // utf8_general_ci
const MAX_PAYLOAD_HINT: u32 = 16 * 1024 * 1024;

pub struct Session {
    /// Monotonic client-side id, unrelated to the server connection id.
    id: u64,
    state: SessionState,
    framed: Framed<MaybeTlsStream, PayloadCodec>,
    /// Resolved remote address (used verbatim by the cancel side channel).
    addr: SocketAddr,
    /// Capabilities in effect after negotiation.
    capability_flags: u32,
    server_version: String,
    /// Server-assigned connection id, the target of KILL QUERY.
    connection_id: u32,
    created_at: Instant,
    returned_at: Instant,
    statements: StatementCache,
    cancel_flag: Arc<CancelFlag>,
    /// Id of the exchange currently owning the connection, if any.
    active_command: Option<u64>,
    next_command_id: u64,
    /// Pool bookkeeping; unset for non-pooled sessions.
    pub(crate) generation: u64,
    pub(crate) host: Option<Arc<HostEndpoint>>,
}

impl Session {
    /// Connect and authenticate against `host:port`, resolving the name and
    /// bounding the whole establishment by the configured connect timeout.
    pub async fn connect(options: &ConnectOptions, host: &str, port: u16) -> Result<Session> {
        let timeout = options.connect_timeout_duration();
        let fut = async {
            let addr = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| Error::Connect(format!("resolving {host}:{port}: {e}")))?
                .next()
                .ok_or_else(|| Error::Connect(format!("{host}:{port} resolved to no addresses")))?;

            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::Connect(format!("dialing {addr}: {e}")))?;

            Self::establish(stream, addr, host, options).await
        };

        time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))?
    }

    /// Connect to an already resolved address. Used by the cancellation
    /// side channel, which must reach the exact server the target session
    /// is on.
    pub async fn connect_addr(options: &ConnectOptions, addr: SocketAddr) -> Result<Session> {
        let timeout = options.connect_timeout_duration();
        let fut = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::Connect(format!("dialing {addr}: {e}")))?;
            // TLS SNI still wants a name; the IP string works for the
            // insecure mode the side channel typically runs under.
            Self::establish(stream, addr, &addr.ip().to_string(), options).await
        };

        time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))?
    }

    /// Run the handshake and authentication sequence over a fresh stream.
    async fn establish(
        stream: TcpStream,
        addr: SocketAddr,
        server_name: &str,
        options: &ConnectOptions,
    ) -> Result<Session> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let mut framed = Framed::new(MaybeTlsStream::Plain(stream), PayloadCodec::new());

        let greeting_payload = next_payload(&mut framed).await?;
        let greeting = InitialHandshake::parse(&greeting_payload)?;
        debug!(
            session_id = id,
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            "received server greeting"
        );

        let mut caps = DEFAULT_CAPABILITIES & greeting.capability_flags;
        if options.database.is_some() {
            caps |= CLIENT_CONNECT_WITH_DB & greeting.capability_flags;
        }
        if options.compress {
            if greeting.capability_flags & CLIENT_COMPRESS == 0 {
                return Err(Error::Protocol(
                    "compression requested but server does not support it".into(),
                ));
            }
            caps |= CLIENT_COMPRESS;
        }

        if options.tls != TlsMode::Disabled {
            if greeting.capability_flags & CLIENT_SSL == 0 {
                return Err(Error::Tls("server does not support TLS".into()));
            }
            caps |= CLIENT_SSL;

            framed
                .send(crate::protocol::handshake::ssl_request_payload(
                    caps,
                    MAX_PAYLOAD_HINT,
                    DEFAULT_CHARACTER_SET,
                ))
                .await?;

            // Upgrade the transport in place, keeping the codec (and with
            // it the packet sequence counter) intact.
            let parts = framed.into_parts();
            let tcp = match parts.io {
                MaybeTlsStream::Plain(tcp) => tcp,
                MaybeTlsStream::Tls(_) => unreachable!("handshake starts on plain TCP"),
            };
            let tls = stream::upgrade(tcp, server_name, options.tls).await?;

            let mut new_parts =
                FramedParts::new::<Bytes>(MaybeTlsStream::Tls(Box::new(tls)), parts.codec);
            new_parts.read_buf = parts.read_buf;
            new_parts.write_buf = parts.write_buf;
            framed = Framed::from_parts(new_parts);
        }

        let mut plugin = AuthPlugin::from_name(&greeting.auth_plugin_name)?;
        Self::check_plugin_transport(plugin, &framed)?;

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: MAX_PAYLOAD_HINT,
            character_set: DEFAULT_CHARACTER_SET,
            username: options.user.clone(),
            auth_response: plugin.respond(&options.password, &greeting.auth_plugin_data),
            database: options.database.clone(),
            auth_plugin_name: plugin.name().to_string(),
        };
        framed.send(response.to_payload()).await?;

        // Drive the remainder of the exchange: the server may accept, fail,
        // switch plugins, or ask for more data, all on the same packet
        // sequence.
        loop {
            let payload = next_payload(&mut framed).await?;

            if is_ok_packet(&payload) {
                break;
            }
            if is_err_packet(&payload) {
                let err = ErrPacket::parse(&payload, caps)?;
                return Err(Error::Auth(err.error_message));
            }
            if is_auth_switch(&payload) {
                let switch = AuthSwitchRequest::parse(&payload)?;
                plugin = AuthPlugin::from_name(&switch.plugin_name)?;
                Self::check_plugin_transport(plugin, &framed)?;
                let scramble = plugin.respond(&options.password, &switch.plugin_data);
                framed.send(Bytes::from(scramble)).await?;
                continue;
            }
            if is_auth_more_data(&payload) {
                match payload.get(1).copied() {
                    Some(auth::CACHING_SHA2_FAST_AUTH_OK) => continue,
                    Some(auth::CACHING_SHA2_FULL_AUTH) => {
                        if !framed.get_ref().is_tls() {
                            return Err(Error::Auth(
                                "caching_sha2_password full authentication requires TLS".into(),
                            ));
                        }
                        let mut cleartext = options.password.as_bytes().to_vec();
                        cleartext.push(0);
                        framed.send(Bytes::from(cleartext)).await?;
                        continue;
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected auth continuation status {other:?}"
                        )))
                    }
                }
            }
            return Err(Error::Protocol(format!(
                "unexpected payload during authentication (header {:#04x?})",
                payload.first()
            )));
        }

        if caps & CLIENT_COMPRESS != 0 {
            framed.codec_mut().enable_compression();
        }

        metrics().sessions_connected_total.inc();
        metrics().sessions_live.inc();

        debug!(session_id = id, addr = %addr, tls = framed.get_ref().is_tls(), "session connected");

        let now = Instant::now();
        Ok(Session {
            id,
            state: SessionState::Idle,
            framed,
            addr,
            capability_flags: caps,
            server_version: greeting.server_version,
            connection_id: greeting.connection_id,
            created_at: now,
            returned_at: now,
            statements: StatementCache::new(64),
            cancel_flag: Arc::new(CancelFlag::new()),
            active_command: None,
            next_command_id: 1,
            generation: 0,
            host: None,
        })
    }

    fn check_plugin_transport(
        plugin: AuthPlugin,
        framed: &Framed<MaybeTlsStream, PayloadCodec>,
    ) -> Result<()> {
        if plugin.requires_tls() && !framed.get_ref().is_tls() {
            return Err(Error::Auth(format!(
                "auth plugin {} requires an encrypted connection",
                plugin.name()
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state, with the Querying → Canceling side transition derived
    /// from the cancel flag (the blocked exchange never observes it).
    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Querying && self.cancel_flag.is_requested() {
            SessionState::Canceling
        } else {
            self.state
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn capability_flags(&self) -> u32 {
        self.capability_flags
    }

    /// Everything a canceller needs to kill the current (or next) exchange.
    pub fn cancel_ticket(&self) -> CancelTicket {
        CancelTicket {
            addr: self.addr,
            connection_id: self.connection_id,
            flag: Arc::clone(&self.cancel_flag),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.returned_at.elapsed()
    }

    pub(crate) fn mark_returned(&mut self) {
        self.returned_at = Instant::now();
    }

    /// Mark the session failed after a fatal error. Terminal.
    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
            self.active_command = None;
            self.cancel_flag.complete();
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::SessionUnusable);
        }
        Ok(())
    }

    /// Start an exchange: resets the packet sequence, arms the cancel flag,
    /// and sends the request payload.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.ensure_usable()?;
        if self.active_command.is_some() {
            return Err(Error::CommandInFlight);
        }

        let command_id = self.next_command_id;
        self.next_command_id += 1;
        self.active_command = Some(command_id);
        self.state = SessionState::Querying;
        self.cancel_flag.arm();

        self.framed.codec_mut().reset_sequence();
        if let Err(e) = self.framed.send(payload).await {
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    /// Read the reply payload of the exchange started by [`send`] and
    /// return the session to Idle. A server ERR payload is surfaced as
    /// [`Error::Server`] without failing the session.
    ///
    /// [`send`]: Session::send
    pub async fn receive_reply(&mut self) -> Result<Bytes> {
        if self.active_command.is_none() {
            return Err(Error::Protocol("no command in flight".into()));
        }

        let payload = self.read_payload().await?;
        self.finish_command();

        if is_err_packet(&payload) {
            return Err(ErrPacket::parse(&payload, self.capability_flags)?.into_error());
        }
        Ok(payload)
    }

    /// One full request/reply exchange.
    pub async fn exchange(&mut self, payload: Bytes) -> Result<Bytes> {
        self.send(payload).await?;
        self.receive_reply().await
    }

    /// Read one payload mid-exchange without completing the command.
    /// Fatal errors (I/O, protocol, disconnect) fail the session here, in
    /// one place.
    async fn read_payload(&mut self) -> Result<Bytes> {
        match self.framed.next().await {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(e)) => {
                self.fail();
                Err(e)
            }
            None => {
                self.fail();
                Err(Error::Disconnected)
            }
        }
    }

    fn finish_command(&mut self) {
        self.active_command = None;
        if self.state == SessionState::Querying {
            self.state = SessionState::Idle;
        }
        self.cancel_flag.complete();
    }

    /// Liveness probe. Never faults: any failure marks the session failed
    /// and reports `false` so the caller can discard and retry.
    pub async fn try_ping(&mut self) -> bool {
        let payload = command_payload(Command::Ping, &[]);
        match self.exchange(payload).await {
            Ok(reply) if is_ok_packet(&reply) => true,
            Ok(_) | Err(_) => {
                self.fail();
                false
            }
        }
    }

    /// Switch the default database with COM_INIT_DB. A server error (such
    /// as an unknown database) leaves the session usable on its previous
    /// default.
    pub async fn select_database(&mut self, database: &str) -> Result<()> {
        let reply = self
            .exchange(command_payload(Command::InitDb, database.as_bytes()))
            .await?;
        if !is_ok_packet(&reply) {
            self.fail();
            return Err(Error::Protocol(
                "unexpected reply to database switch".into(),
            ));
        }
        Ok(())
    }

    /// Reset server-side session state (user variables, temp tables,
    /// prepared statements) and flush the local statement cache to match.
    pub async fn reset(&mut self) -> Result<()> {
        let reply = self.exchange(command_payload(Command::ResetConnection, &[])).await?;
        if !is_ok_packet(&reply) {
            self.fail();
            return Err(Error::Protocol("unexpected reply to connection reset".into()));
        }
        self.statements.clear();
        Ok(())
    }

    /// Prepare `text`, served from the per-session cache when possible.
    /// Guarantees at most one prepare round-trip per distinct statement
    /// text per session.
    pub async fn prepare(&mut self, text: &str) -> Result<Arc<PreparedStatement>> {
        if let Some(cached) = self.statements.get(text) {
            return Ok(cached);
        }

        let mut payload = Vec::with_capacity(1 + text.len());
        payload.push(Command::StmtPrepare.as_byte());
        payload.extend_from_slice(text.as_bytes());
        self.send(Bytes::from(payload)).await?;

        let first = self.read_payload().await?;
        if is_err_packet(&first) {
            self.finish_command();
            return Err(ErrPacket::parse(&first, self.capability_flags)?.into_error());
        }

        let (statement_id, num_columns, num_params) = parse_prepare_ok(&first)?;

        // Parameter and column definition payloads carry metadata we do not
        // model; drain them to keep the exchange synchronized.
        self.drain_definitions(num_params).await?;
        self.drain_definitions(num_columns).await?;
        self.finish_command();

        let statement = PreparedStatement {
            statement_id,
            text: text.to_string(),
            num_params,
            num_columns,
        };
        let cached = Arc::new(statement.clone());

        if let Some(evicted_id) = self.statements.insert(statement) {
            self.close_statement(evicted_id).await?;
        }
        Ok(cached)
    }

    async fn drain_definitions(&mut self, count: u16) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        for _ in 0..count {
            let payload = self.read_payload().await?;
            if is_err_packet(&payload) {
                self.fail();
                return Err(Error::Protocol(
                    "server error in the middle of prepare metadata".into(),
                ));
            }
        }
        if self.capability_flags & CLIENT_DEPRECATE_EOF == 0 {
            let eof = self.read_payload().await?;
            if !is_eof_packet(&eof, self.capability_flags) {
                self.fail();
                return Err(Error::Protocol(
                    "expected EOF after prepare metadata".into(),
                ));
            }
        }
        Ok(())
    }

    /// COM_STMT_CLOSE is fire-and-forget: no reply follows.
    async fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        self.ensure_usable()?;
        let mut payload = Vec::with_capacity(5);
        payload.push(Command::StmtClose.as_byte());
        payload.extend_from_slice(&statement_id.to_le_bytes());

        self.framed.codec_mut().reset_sequence();
        if let Err(e) = self.framed.send(Bytes::from(payload)).await {
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    pub fn statement_cache_len(&self) -> usize {
        self.statements.len()
    }

    pub(crate) fn set_statement_cache_capacity(&mut self, capacity: usize) {
        self.statements.set_capacity(capacity);
    }

    /// Best-effort clean shutdown: COM_QUIT, then drop the stream.
    pub async fn quit(mut self) {
        if self.state.is_connected() && self.active_command.is_none() {
            self.framed.codec_mut().reset_sequence();
            let _ = self
                .framed
                .send(command_payload(Command::Quit, &[]))
                .await;
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(host) = &self.host {
            host.session_closed();
        }
        metrics().sessions_live.dec();
        if !self.state.is_terminal() {
            debug!(session_id = self.id, "session dropped without explicit close");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("addr", &self.addr)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Build a command payload: command byte followed by its argument bytes.
pub fn command_payload(command: Command, data: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(command.as_byte());
    payload.extend_from_slice(data);
    Bytes::from(payload)
}

/// COM_STMT_PREPARE OK: 0x00, statement id, column count, param count,
/// filler, warning count.
fn parse_prepare_ok(payload: &[u8]) -> Result<(u32, u16, u16)> {
    let mut r = PayloadReader::new(payload);
    let header = r.read_u8()?;
    if header != 0x00 {
        return Err(Error::Protocol(format!(
            "expected prepare OK, got header {header:#04x}"
        )));
    }
    let statement_id = r.read_u32_le()?;
    let num_columns = r.read_u16_le()?;
    let num_params = r.read_u16_le()?;
    Ok((statement_id, num_columns, num_params))
}

async fn next_payload(framed: &mut Framed<MaybeTlsStream, PayloadCodec>) -> Result<Bytes> {
    match framed.next().await {
        Some(Ok(payload)) => Ok(payload),
        Some(Err(e)) => Err(e),
        None => Err(Error::Disconnected),
    }
}
