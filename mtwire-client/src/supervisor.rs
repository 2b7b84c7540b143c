//! Connection lifecycle: connect, key exchange, the driver loop and
//! reconnection.
//!
//! One driver task owns the framed stream and the [`EncryptedSession`]. It
//! is the only reader and the only writer; callers reach it through the
//! bounded request queue.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use zeroize::{Zeroize, Zeroizing};

use mtwire_crypto::{AuthKey, rsa};
use mtwire_mtproto::authentication as auth;
use mtwire_mtproto::transport::TransportError;
use mtwire_mtproto::{EncryptedSession, Message, Session};
use mtwire_tl_types::{Deserializable, RemoteCall, Serializable, functions, types};

use crate::Config;
use crate::dispatcher::{Action, Dispatcher, Slot};
use crate::errors::InvocationError;
use crate::session::PersistedSession;
use crate::transport::{BoxedStream, Connector, FrameCodec, FrameError, TcpConnector};

/// Salts requested per `get_future_salts`.
const FUTURE_SALTS: i32 = 32;

/// Queued commands handled per driver wake-up before the socket is polled
/// again.
const MAX_COMMANDS_PER_WAKE: usize = 100;

/// Where a [`crate::Client`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or the first connection failed.
    Disconnected,
    /// Opening the byte stream.
    Connecting,
    /// Creating a new auth key.
    KeyExchange,
    /// Ready; calls flow.
    Authenticated,
    /// The link dropped; pending calls wait for the next connection.
    Reconnecting,
    /// Stopped for good.
    Closed,
}

/// Work sent from callers to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    /// Push the registered call with this request id.
    Send(u64),
    /// Ask the server to forget the answer to this msg_id.
    DropAnswer(i64),
}

/// The parts of the session that outlive a connection.
///
/// Every copy of the key is wiped when it is dropped.
#[derive(Clone, Default)]
struct Snapshot {
    auth_key:    Option<Zeroizing<[u8; 256]>>,
    salt:        i64,
    time_offset: i32,
    endpoint:    Option<String>,
}

/// State shared between the [`crate::Client`] handles and the driver.
pub(crate) struct Shared {
    pub(crate) config:     Config,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) shutdown:   CancellationToken,
    state:       watch::Sender<ConnectionState>,
    connector:   Arc<dyn Connector>,
    closed:      AtomicBool,
    flood_until: Mutex<Option<Instant>>,
    snapshot:    Mutex<Snapshot>,
}

impl Shared {
    /// Load the persisted session, if any.
    pub(crate) fn new(config: Config) -> Result<Self, InvocationError> {
        let snapshot = match config.session_backend.load()? {
            Some(s) => {
                tracing::info!(
                    "[mtwire] loaded session from {} backend (key id {:#x})",
                    config.session_backend.name(),
                    s.key_id()
                );
                Snapshot {
                    auth_key:    Some(s.auth_key),
                    salt:        s.salt,
                    time_offset: s.time_offset,
                    endpoint:    s.endpoint,
                }
            }
            None => {
                tracing::info!("[mtwire] no stored session, a new auth key will be created");
                Snapshot::default()
            }
        };

        let connector: Arc<dyn Connector> = match (&config.connector, &config.socks5) {
            (Some(c), _) => Arc::clone(c),
            (None, Some(proxy)) => Arc::new(proxy.clone()),
            (None, None) => Arc::new(TcpConnector),
        };

        Ok(Self {
            config,
            dispatcher: Dispatcher::new(),
            shutdown: CancellationToken::new(),
            state: watch::channel(ConnectionState::Disconnected).0,
            connector,
            closed: AtomicBool::new(false),
            flood_until: Mutex::new(None),
            snapshot: Mutex::new(snapshot),
        })
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!("[supervisor] state -> {next:?}");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Expiry of the flood gate while it is armed.
    pub(crate) fn flood_gate(&self) -> Option<Instant> {
        let mut gate = self.flood_until.lock().unwrap_or_else(PoisonError::into_inner);
        match *gate {
            Some(until) if until > Instant::now() => Some(until),
            Some(_) => {
                *gate = None;
                None
            }
            None => None,
        }
    }

    fn arm_flood_gate(&self, seconds: u32) {
        let until = Instant::now() + std::time::Duration::from_secs(u64::from(seconds));
        let mut gate = self.flood_until.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.is_none_or(|current| current < until) {
            *gate = Some(until);
        }
        tracing::warn!("[supervisor] FLOOD_WAIT_{seconds}: holding new requests");
    }

    /// Index of the endpoint the stored session last used.
    pub(crate) fn preferred_endpoint(&self) -> usize {
        let snapshot = self.snapshot();
        snapshot
            .endpoint
            .as_ref()
            .and_then(|e| self.config.endpoints.iter().position(|x| x == e))
            .unwrap_or(0)
    }

    /// Write the current snapshot through the session backend.
    ///
    /// Without an auth key the stored record is deleted instead.
    pub(crate) fn persist(&self) -> io::Result<()> {
        let snapshot = self.snapshot().clone();
        let backend = &self.config.session_backend;
        match snapshot.auth_key {
            Some(auth_key) => backend.save(&PersistedSession {
                auth_key,
                salt: snapshot.salt,
                time_offset: snapshot.time_offset,
                endpoint: snapshot.endpoint,
            }),
            None => backend.delete(),
        }
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(
                "[supervisor] could not save session to {} backend: {e}",
                self.config.session_backend.name()
            );
        }
    }

    fn forget_key(&self) {
        if let Some(mut stale) = self.snapshot().auth_key.take() {
            stale.zeroize();
        }
        self.persist_or_warn();
    }

    #[cfg(test)]
    fn has_key(&self) -> bool {
        self.snapshot().auth_key.is_some()
    }
}

// ─── Connecting ──────────────────────────────────────────────────────────────

type FramedStream = Framed<BoxedStream, FrameCodec>;

/// An authenticated connection.
pub(crate) struct Link {
    framed:       FramedStream,
    session:      EncryptedSession,
    endpoint_idx: usize,
}

/// Open a stream to endpoint `idx` and make sure an auth key exists.
async fn open(shared: &Shared, idx: usize) -> Result<Link, InvocationError> {
    let config = &shared.config;
    let endpoint = &config.endpoints[idx];
    shared.set_state(ConnectionState::Connecting);
    tracing::debug!("[supervisor] connecting to {endpoint}");

    let stream = tokio::time::timeout(config.connect_timeout, shared.connector.connect(endpoint))
        .await
        .map_err(|_| InvocationError::Timeout)??;
    let mut framed = Framed::new(stream, FrameCodec::for_kind(&config.transport, config.max_frame_len));

    let stored = shared.snapshot().clone();
    let (auth_key, salt, time_offset) = match stored.auth_key {
        Some(ref key) => (key.clone(), stored.salt, stored.time_offset),
        None => {
            shared.set_state(ConnectionState::KeyExchange);
            let mut done = tokio::time::timeout(
                config.connect_timeout,
                key_exchange(&mut framed, &config.server_keys),
            )
            .await
            .map_err(|_| InvocationError::KeyExchangeFailed("timed out".into()))??;
            tracing::info!(
                "[supervisor] auth key created with {endpoint}, time offset {}s",
                done.time_offset
            );
            let key = Zeroizing::new(done.auth_key);
            done.auth_key.zeroize();
            (key, done.first_salt, done.time_offset)
        }
    };

    {
        let mut snapshot = shared.snapshot();
        snapshot.auth_key = Some(auth_key.clone());
        snapshot.salt = salt;
        snapshot.time_offset = time_offset;
        snapshot.endpoint = Some(endpoint.clone());
    }
    shared.persist_or_warn();

    let session = EncryptedSession::new(AuthKey::from_bytes(*auth_key), salt, time_offset);
    Ok(Link { framed, session, endpoint_idx: idx })
}

/// [`open`], retrying failed key exchanges with fresh nonces.
async fn connect_endpoint(shared: &Shared, idx: usize) -> Result<Link, InvocationError> {
    let attempts = shared.config.key_exchange_attempts.max(1);
    let mut attempt = 1;
    loop {
        match open(shared, idx).await {
            Err(InvocationError::KeyExchangeFailed(reason)) if attempt < attempts => {
                tracing::warn!("[supervisor] key exchange attempt {attempt}/{attempts} failed: {reason}");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Try every endpoint once, starting at `first`.
pub(crate) async fn connect_any(shared: &Shared, first: usize) -> Result<Link, InvocationError> {
    let endpoints = &shared.config.endpoints;
    let mut last = None;
    for i in 0..endpoints.len() {
        let idx = (first + i) % endpoints.len();
        match connect_endpoint(shared, idx).await {
            Ok(link) => return Ok(link),
            Err(e) => {
                tracing::warn!("[supervisor] {} failed: {e}", endpoints[idx]);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        InvocationError::Io(io::Error::new(io::ErrorKind::InvalidInput, "no endpoints configured"))
    }))
}

async fn key_exchange(
    framed: &mut FramedStream,
    keys:   &[rsa::Key],
) -> Result<auth::Finished, InvocationError> {
    let mut plain = Session::new();
    let (req, step1) = auth::step1()?;
    let res_pq = plain_call(framed, &mut plain, &req).await?;
    let (req, step2) = auth::step2(step1, res_pq, keys)?;
    let dh_params = plain_call(framed, &mut plain, &req).await?;
    let (req, step3) = auth::step3(step2, dh_params)?;
    let answer = plain_call(framed, &mut plain, &req).await?;
    Ok(auth::finish(step3, answer)?)
}

async fn plain_call<R: RemoteCall>(
    framed: &mut FramedStream,
    plain:  &mut Session,
    req:    &R,
) -> Result<R::Return, InvocationError> {
    framed.send(plain.pack(req).to_plaintext_bytes()).await?;
    let frame = match framed.next().await {
        Some(frame) => frame?,
        None => return Err(InvocationError::TransportClosed),
    };
    let msg = Message::from_plaintext_bytes(&frame)
        .map_err(|e| InvocationError::KeyExchangeFailed(e.to_string()))?;
    R::Return::from_bytes_exact(&msg.body)
        .map_err(|e| InvocationError::KeyExchangeFailed(e.to_string()))
}

// ─── Driver ──────────────────────────────────────────────────────────────────

enum Exit {
    Shutdown,
    Reconnect { drop_key: bool },
}

/// The task that owns the connection.
pub(crate) struct Driver {
    shared:         Arc<Shared>,
    link:           Link,
    epoch:          u64,
    requests:       mpsc::Receiver<Command>,
    pending_acks:   Vec<i64>,
    /// Outstanding keep-alive: request id and pong deadline.
    ping:           Option<(u64, Instant)>,
    salts_request:  Option<u64>,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, link: Link, requests: mpsc::Receiver<Command>) -> Self {
        shared.set_state(ConnectionState::Authenticated);
        Self {
            shared,
            link,
            epoch: 1,
            requests,
            pending_acks: Vec::new(),
            ping: None,
            salts_request: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.drive().await {
                Exit::Shutdown => break,
                Exit::Reconnect { drop_key } => {
                    self.shared.set_state(ConnectionState::Reconnecting);
                    if let Err(e) = self.link.framed.close().await {
                        tracing::debug!("[supervisor] closing the old stream: {e}");
                    }
                    if drop_key {
                        self.shared.forget_key();
                    }
                    match self.reconnect().await {
                        Some(link) => self.install(link),
                        None => break,
                    }
                }
            }
        }
        self.close();
    }

    async fn drive(&mut self) -> Exit {
        let interval = self.shared.config.ping_interval;
        let grace = self.shared.config.ping_grace;
        let mut ping_timer = tokio::time::interval_at(Instant::now() + interval, interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shared.shutdown.clone();

        loop {
            if let Err(e) = self.flush().await {
                tracing::warn!("[supervisor] write failed: {e}");
                return Exit::Reconnect { drop_key: false };
            }
            let gate = self.shared.flood_gate();
            let pong_deadline = self.ping.map(|(_, deadline)| deadline);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Exit::Shutdown,
                frame = self.link.framed.next() => match frame {
                    Some(Ok(mut frame)) => self.on_frame(&mut frame),
                    Some(Err(FrameError::Transport(TransportError::ServerError(-404)))) => {
                        tracing::warn!("[supervisor] server does not know our auth key (-404)");
                        return Exit::Reconnect { drop_key: true };
                    }
                    Some(Err(e)) => {
                        tracing::warn!("[supervisor] read failed: {e}");
                        return Exit::Reconnect { drop_key: false };
                    }
                    None => {
                        tracing::warn!("[supervisor] transport closed by peer");
                        return Exit::Reconnect { drop_key: false };
                    }
                },
                Some(cmd) = self.requests.recv(), if gate.is_none() => {
                    self.on_command(cmd);
                    for _ in 1..MAX_COMMANDS_PER_WAKE {
                        match self.requests.try_recv() {
                            Ok(cmd) => self.on_command(cmd),
                            Err(_) => break,
                        }
                    }
                }
                _ = tokio::time::sleep_until(gate.unwrap_or_else(Instant::now)), if gate.is_some() => {
                    tracing::debug!("[supervisor] flood gate released");
                }
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    tracing::warn!("[supervisor] no pong within {grace:?}");
                    return Exit::Reconnect { drop_key: false };
                }
                _ = ping_timer.tick() => self.on_ping_tick(),
            }
        }
    }

    fn on_frame(&mut self, frame: &mut [u8]) {
        let msg = match self.link.session.unpack(frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("[dispatch] dropping frame: {e}");
                return;
            }
        };
        tracing::trace!("[dispatch] msg {} seq {} ({} bytes)", msg.msg_id, msg.seq_no, msg.body.len());

        for action in self.shared.dispatcher.handle_incoming(&mut self.link.session, msg) {
            match action {
                Action::Ack(msg_id) => self.pending_acks.push(msg_id),
                Action::Resend(request_id) => self.enqueue(request_id),
                Action::FloodWait(seconds) => self.shared.arm_flood_gate(seconds),
                Action::Completed(request_id) => {
                    if self.ping.is_some_and(|(id, _)| id == request_id) {
                        self.ping = None;
                    }
                    if self.salts_request == Some(request_id) {
                        self.salts_request = None;
                    }
                }
            }
        }

        let mut snapshot = self.shared.snapshot();
        snapshot.salt = self.link.session.current_salt(SystemTime::now());
        snapshot.time_offset = self.link.session.time_offset();
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send(request_id) => self.enqueue(request_id),
            Command::DropAnswer(req_msg_id) => {
                tracing::debug!("[dispatch] dropping answer to {req_msg_id}");
                self.link.session.push(functions::RpcDropAnswer { req_msg_id }.to_bytes(), true);
            }
        }
    }

    /// Push a registered call unless it is gone or already went out on this
    /// connection.
    fn enqueue(&mut self, request_id: u64) {
        let Some(body) = self.shared.dispatcher.body_to_send(request_id, self.epoch) else {
            return;
        };
        let msg_id = self.link.session.push(body, true);
        self.shared.dispatcher.mark_sent(request_id, self.epoch, msg_id);
        tracing::trace!("[dispatch] request {request_id} queued as msg {msg_id}");
    }

    fn on_ping_tick(&mut self) {
        let config = &self.shared.config;
        let grace = config.ping_grace;
        let disconnect_delay = (config.ping_interval + grace).as_secs().min(i32::MAX as u64) as i32;

        if self.ping.is_none() {
            let body = functions::PingDelayDisconnect { ping_id: random_i64(), disconnect_delay }
                .to_bytes();
            let id = self.shared.dispatcher.register(body, Slot::Ping, None);
            self.enqueue(id);
            self.ping = Some((id, Instant::now() + grace));
        }

        if self.salts_request.is_none() && self.link.session.needs_salt_refresh(SystemTime::now()) {
            let body = functions::GetFutureSalts { num: FUTURE_SALTS }.to_bytes();
            let id = self.shared.dispatcher.register(body, Slot::FutureSalts, None);
            self.enqueue(id);
            self.salts_request = Some(id);
        }
    }

    async fn flush(&mut self) -> Result<(), FrameError> {
        if !self.pending_acks.is_empty() {
            let msg_ids = std::mem::take(&mut self.pending_acks);
            self.link.session.push(types::MsgsAck { msg_ids }.to_bytes(), false);
        }
        let mut wrote = false;
        while let Some(packed) = self.link.session.finalize() {
            if let Some(container_id) = packed.container_id {
                self.shared.dispatcher.record_container(container_id, packed.msg_ids);
            }
            self.link.framed.feed(packed.wire).await?;
            wrote = true;
        }
        if wrote {
            self.link.framed.flush().await?;
        }
        Ok(())
    }

    /// Retry with capped exponential backoff until a link is up or the
    /// client shuts down. Attempt `n` goes to endpoint `last + n`.
    async fn reconnect(&mut self) -> Option<Link> {
        let shutdown = self.shared.shutdown.clone();
        let endpoints = self.shared.config.endpoints.len();
        let mut attempt: u32 = 0;
        loop {
            let delay = self.shared.config.reconnect_backoff.delay(attempt);
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            let idx = (self.link.endpoint_idx + attempt as usize) % endpoints;
            let result = tokio::select! {
                _ = shutdown.cancelled() => return None,
                r = connect_endpoint(&self.shared, idx) => r,
            };
            match result {
                Ok(link) => return Some(link),
                Err(e) => {
                    tracing::warn!("[supervisor] reconnect attempt {} failed: {e}", attempt + 1);
                    self.shared.set_state(ConnectionState::Reconnecting);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Switch to a fresh connection and replay every call that had been sent.
    fn install(&mut self, link: Link) {
        self.link = link;
        self.epoch += 1;
        self.pending_acks.clear();
        self.ping = None;
        self.salts_request = None;

        let replay = self.shared.dispatcher.prepare_replay();
        if !replay.is_empty() {
            tracing::info!("[supervisor] replaying {} pending calls", replay.len());
        }
        for request_id in replay {
            self.enqueue(request_id);
        }
        self.shared.set_state(ConnectionState::Authenticated);
    }

    fn close(mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.requests.close();
        while self.requests.try_recv().is_ok() {}
        self.shared.dispatcher.fail_all(|| InvocationError::ConnectionClosed);
        self.shared.dispatcher.clear_sinks();

        {
            let mut snapshot = self.shared.snapshot();
            if snapshot.auth_key.is_some() {
                snapshot.salt = self.link.session.current_salt(SystemTime::now());
                snapshot.time_offset = self.link.session.time_offset();
            }
        }
        self.shared.persist_or_warn();
        self.shared.set_state(ConnectionState::Closed);
    }
}

fn random_i64() -> i64 {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).expect("getrandom");
    i64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBackend, SessionBackend};

    fn stored(key: u8) -> PersistedSession {
        PersistedSession {
            auth_key:    Zeroizing::new([key; 256]),
            salt:        1,
            time_offset: 0,
            endpoint:    None,
        }
    }

    #[test]
    fn stale_key_is_dropped_from_snapshot_and_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.save(&stored(5)).unwrap();
        let shared = Shared::new(Config {
            session_backend: Arc::clone(&backend) as Arc<dyn SessionBackend>,
            ..Config::default()
        })
        .unwrap();
        assert!(shared.has_key());

        shared.forget_key();
        assert!(!shared.has_key());
        assert!(backend.load().unwrap().is_none());
    }

    #[test]
    fn key_copies_are_wiped_on_drop() {
        fn wiped_on_drop<T: zeroize::ZeroizeOnDrop>(_: &T) {}
        let record = stored(9);
        wiped_on_drop(&record.auth_key);
        let snapshot = Snapshot { auth_key: Some(record.auth_key.clone()), ..Snapshot::default() };
        if let Some(key) = &snapshot.auth_key {
            wiped_on_drop(key);
        }
    }
}
