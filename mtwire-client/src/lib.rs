//! # mtwire-client
//!
//! Async MTProto client core built on [`mtwire_mtproto`].
//!
//! ## Features
//! - One driver task per connection; any number of concurrent [`Client::invoke`]s
//! - Per-call deadlines, cancellation with `rpc_drop_answer`
//! - `FLOOD_WAIT` surfaced as a typed error plus a global flood gate
//! - Automatic acks, containers, `gzip_packed` inflation, salt refresh and keep-alive
//! - Reconnect with capped exponential backoff, replaying unresolved calls
//! - Stale-key recovery on transport error -404
//! - Pluggable connectors (TCP, SOCKS5, in-memory) and session backends
//!
//! ## Example
//! ```rust,no_run
//! use mtwire_client::{Client, Config};
//!
//! # async fn run() -> Result<(), mtwire_client::InvocationError> {
//! let client = Client::start(Config::default()).await?;
//! let pong = client.call(&mtwire_tl_types::functions::Ping { ping_id: 1 }).await?;
//! println!("{pong:?}");
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dispatcher;
mod errors;
pub mod retry;
pub mod session;
pub mod session_backend;
pub mod socks5;
mod supervisor;
pub mod transport;
pub mod update;

pub use errors::{InvocationError, RpcError};
pub use retry::{AutoSleep, Backoff, NoRetries, RetryContext, RetryPolicy};
pub use session::PersistedSession;
pub use session_backend::{BinaryFileBackend, InMemoryBackend, SessionBackend};
#[cfg(feature = "sqlite-session")]
pub use session_backend::SqliteBackend;
pub use socks5::Socks5Config;
pub use supervisor::ConnectionState;
pub use transport::{Connector, ObfuscatedInner, TcpConnector, TransportKind};
pub use update::{Update, UpdateSink, UpdateStream};

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use mtwire_crypto::rsa;
use mtwire_tl_types::{Deserializable, RemoteCall};

use dispatcher::Slot;
use supervisor::{Command, Driver, Shared};

// ─── Config ───────────────────────────────────────────────────────────────────

/// What to do with new calls while a `FLOOD_WAIT` holds the flood gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FloodPolicy {
    /// Keep them in the request queue until the gate opens.
    #[default]
    Queue,
    /// Fail them immediately with [`InvocationError::Backpressure`].
    Reject,
}

/// Configuration for [`Client::start`].
#[derive(Clone)]
pub struct Config {
    /// `host:port` endpoints, tried round-robin.
    pub endpoints:             Vec<String>,
    /// Which MTProto transport framing to use (default: Intermediate).
    pub transport:             TransportKind,
    /// Optional SOCKS5 proxy; every connection is tunnelled through it.
    pub socks5:                Option<Socks5Config>,
    /// Custom stream source; overrides `socks5` and plain TCP.
    pub connector:             Option<Arc<dyn Connector>>,
    /// Session persistence backend (default: binary file `"mtwire.session"`).
    pub session_backend:       Arc<dyn SessionBackend>,
    /// Server RSA keys accepted during key exchange.
    pub server_keys:           Vec<rsa::Key>,
    /// Deadline for calls made with [`Client::invoke`].
    pub request_timeout:       Duration,
    /// Bound on opening a stream and on the key exchange.
    pub connect_timeout:       Duration,
    /// How often a keep-alive ping is sent.
    pub ping_interval:         Duration,
    /// How long to wait for the pong before reconnecting.
    pub ping_grace:            Duration,
    /// Capacity of the request queue in front of the driver.
    pub max_queued_requests:   usize,
    /// Largest frame accepted from the server.
    pub max_frame_len:         usize,
    /// Behaviour of new calls while the flood gate is armed.
    pub flood_policy:          FloodPolicy,
    /// Retry policy applied by [`Client::invoke`].
    pub retry_policy:          Arc<dyn RetryPolicy>,
    /// Delay schedule between reconnect attempts.
    pub reconnect_backoff:     Backoff,
    /// Key exchanges attempted per endpoint before giving up on it.
    pub key_exchange_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints:             vec!["149.154.167.51:443".to_string()],
            transport:             TransportKind::default(),
            socks5:                None,
            connector:             None,
            session_backend:       Arc::new(BinaryFileBackend::new("mtwire.session")),
            server_keys:           mtwire_mtproto::authentication::known_keys(),
            request_timeout:       Duration::from_secs(30),
            connect_timeout:       Duration::from_secs(15),
            ping_interval:         Duration::from_secs(60),
            ping_grace:            Duration::from_secs(15),
            max_queued_requests:   1024,
            max_frame_len:         mtwire_mtproto::transport::DEFAULT_MAX_FRAME_LEN,
            flood_policy:          FloodPolicy::default(),
            retry_policy:          Arc::new(NoRetries),
            reconnect_backoff:     Backoff::default(),
            key_exchange_attempts: 5,
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    shared:   Arc<Shared>,
    requests: mpsc::Sender<Command>,
    driver:   Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// An MTProto client. Cheap to clone; internally Arc-wrapped.
///
/// The connection lives until [`Client::stop`] or until the last clone is
/// dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Removes a call from the table when its `invoke` future ends early.
struct CallGuard<'a> {
    shared:     &'a Shared,
    requests:   &'a mpsc::Sender<Command>,
    request_id: u64,
}

impl CallGuard<'_> {
    /// Take the call out of the table. Returns `false` when a result got
    /// there first.
    fn cancel(&self) -> bool {
        let Some(call) = self.shared.dispatcher.remove(self.request_id) else {
            return false;
        };
        if let Some((_, msg_id)) = call.sent_as {
            if self.requests.try_send(Command::DropAnswer(msg_id)).is_err() {
                tracing::debug!("[dispatch] could not queue rpc_drop_answer for {msg_id}");
            }
        }
        true
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Client {
    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Connect, create or load the auth key, and spawn the driver task.
    ///
    /// Every endpoint is tried once; the last error is returned if none
    /// comes up.
    pub async fn start(config: Config) -> Result<Self, InvocationError> {
        if config.endpoints.is_empty() {
            return Err(InvocationError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no endpoints configured",
            )));
        }
        let queue = config.max_queued_requests.max(1);
        let shared = Arc::new(Shared::new(config)?);

        let link = match supervisor::connect_any(&shared, shared.preferred_endpoint()).await {
            Ok(link) => link,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (requests, rx) = mpsc::channel(queue);
        let driver = Driver::new(Arc::clone(&shared), link, rx);
        let handle = tokio::spawn(driver.run());
        tracing::info!("[mtwire] client started");

        Ok(Self {
            inner: Arc::new(ClientInner { shared, requests, driver: Mutex::new(Some(handle)) }),
        })
    }

    /// Shut down: pending calls fail with [`InvocationError::ConnectionClosed`],
    /// the session is saved and the state becomes [`ConnectionState::Closed`].
    ///
    /// Idempotent; later calls on any clone fail with `ConnectionClosed`.
    pub async fn stop(&self) {
        self.inner.shared.shutdown.cancel();
        let handle = self.inner.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("[mtwire] driver task failed: {e}");
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.subscribe_state()
    }

    /// Persist the auth key, salt and time offset now.
    pub fn save_session(&self) -> Result<(), InvocationError> {
        self.inner.shared.persist()?;
        tracing::debug!("[mtwire] session saved");
        Ok(())
    }

    /// Calls registered and not yet resolved.
    pub fn pending_calls(&self) -> usize {
        self.inner.shared.dispatcher.len()
    }

    // ── Updates ────────────────────────────────────────────────────────────

    /// Deliver every future [`Update`] to `sink` as well.
    pub fn register_update_sink(&self, sink: Arc<dyn UpdateSink>) {
        self.inner.shared.dispatcher.add_sink(sink);
    }

    /// A stream of every future [`Update`].
    pub fn stream_updates(&self) -> UpdateStream {
        let (sink, stream) = UpdateStream::channel();
        self.inner.shared.dispatcher.add_sink(Arc::new(sink));
        stream
    }

    // ── Calls ──────────────────────────────────────────────────────────────

    /// Send a serialized request and wait for its serialized result, with
    /// the configured `request_timeout`.
    pub async fn invoke(&self, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        self.invoke_with_timeout(body, self.inner.shared.config.request_timeout).await
    }

    /// [`Client::invoke`] with an explicit deadline per attempt.
    pub async fn invoke_with_timeout(
        &self,
        body:    Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, InvocationError> {
        let policy = Arc::clone(&self.inner.shared.config.retry_policy);
        let mut fail_count = NonZeroU32::MIN;
        let mut slept_so_far = Duration::ZERO;
        loop {
            let error = match self.invoke_once(body.clone(), timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            let ctx = RetryContext { fail_count, slept_so_far, error };
            match policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    tokio::time::sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Err(ctx.error),
            }
        }
    }

    /// Typed call: serialize `request`, invoke it and decode the result.
    pub async fn call<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke(request.to_bytes()).await?;
        Ok(R::Return::from_bytes_exact(&body)?)
    }

    async fn invoke_once(
        &self,
        body:    Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, InvocationError> {
        let shared = &*self.inner.shared;
        if shared.is_closed() || shared.shutdown.is_cancelled() {
            return Err(InvocationError::ConnectionClosed);
        }
        if shared.config.flood_policy == FloodPolicy::Reject && shared.flood_gate().is_some() {
            return Err(InvocationError::Backpressure);
        }

        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        let request_id = shared.dispatcher.register(body, Slot::Caller(tx), Some(deadline));
        let guard = CallGuard { shared, requests: &self.inner.requests, request_id };

        if let Err(e) = self.inner.requests.try_send(Command::Send(request_id)) {
            guard.cancel();
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => InvocationError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => InvocationError::ConnectionClosed,
            });
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InvocationError::Dropped),
            Err(_elapsed) => {
                if guard.cancel() {
                    tracing::debug!("[dispatch] request {request_id} timed out after {timeout:?}");
                    Err(InvocationError::Timeout)
                } else {
                    rx.try_recv().unwrap_or(Err(InvocationError::Dropped))
                }
            }
        }
    }
}
