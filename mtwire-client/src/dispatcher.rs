//! Pending-call table and routing of decrypted server messages.
//!
//! The table is the only path to a caller's result slot: a reply, a
//! timeout, a cancellation and shutdown all go through
//! [`Dispatcher::remove`]/[`Dispatcher::resolve`], and whichever removes the
//! entry first wins.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::oneshot;
use tokio::time::Instant;

use mtwire_mtproto::{BadMsgAction, DecryptedMessage, EncryptedSession};
use mtwire_tl_types::enums::ServiceMessage;
use mtwire_tl_types::{self as tl, Identifiable, types};

use crate::errors::InvocationError;
use crate::update::{Update, UpdateSink};

/// Containers and gzip wrappers nested deeper than this are dropped.
const MAX_DEPTH: usize = 4;

/// Upper bound on an inflated `gzip_packed` body.
const MAX_INFLATED_LEN: u64 = 64 * 1024 * 1024;

/// Sent containers remembered for `bad_server_salt`/`bad_msg_notification`
/// expansion before stale ones are pruned.
const MAX_TRACKED_CONTAINERS: usize = 1024;

pub(crate) type CallResult = Result<Vec<u8>, InvocationError>;

/// Who is waiting for a call's result.
pub(crate) enum Slot {
    /// A caller suspended in `invoke`.
    Caller(oneshot::Sender<CallResult>),
    /// The driver's keep-alive `ping_delay_disconnect`.
    Ping,
    /// The driver's `get_future_salts`.
    FutureSalts,
}

/// One request awaiting its result.
pub struct PendingCall {
    /// Client-local id, stable across resends.
    pub request_id:  u64,
    /// Serialized request, kept for resends and replays.
    pub body:        Vec<u8>,
    pub(crate) slot: Slot,
    /// When the caller stops waiting; `None` for driver-internal calls.
    pub deadline:    Option<Instant>,
    /// Times the call was sent again after the first attempt.
    pub retry_count: u32,
    /// Connection epoch and msg_id of the latest send.
    pub sent_as:     Option<(u64, i64)>,
}

impl PendingCall {
    fn complete(self, result: CallResult) -> Option<Action> {
        match self.slot {
            Slot::Caller(tx) => {
                if tx.send(result).is_err() {
                    tracing::trace!("[dispatch] caller of request {} is gone", self.request_id);
                }
                None
            }
            Slot::Ping | Slot::FutureSalts => Some(Action::Completed(self.request_id)),
        }
    }

    /// True when this call belongs to a caller rather than to the driver.
    pub fn is_caller(&self) -> bool {
        matches!(self.slot, Slot::Caller(_))
    }
}

/// Follow-up work for the driver after routing one incoming message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    /// Acknowledge this server msg_id.
    Ack(i64),
    /// Send this request again under a new msg_id.
    Resend(u64),
    /// Arm the flood gate.
    FloodWait(u32),
    /// A driver-internal call finished.
    Completed(u64),
}

#[derive(Default)]
struct Table {
    calls:      HashMap<u64, PendingCall>,
    by_msg_id:  HashMap<i64, u64>,
    containers: HashMap<i64, Vec<i64>>,
}

impl Table {
    /// Unlink every call sent as `msg_id`, or as a member of container
    /// `msg_id`, and return their request ids.
    fn unlink(&mut self, msg_id: i64) -> Vec<u64> {
        let members = self.containers.remove(&msg_id).unwrap_or_else(|| vec![msg_id]);
        members.iter().filter_map(|m| self.by_msg_id.remove(m)).collect()
    }
}

/// Pending calls plus the registered update sinks.
pub struct Dispatcher {
    table:   Mutex<Table>,
    sinks:   RwLock<Vec<Arc<dyn UpdateSink>>>,
    next_id: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Empty table, no sinks.
    pub fn new() -> Self {
        Self {
            table:   Mutex::new(Table::default()),
            sinks:   RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of unresolved calls, driver-internal ones included.
    pub fn len(&self) -> usize {
        self.table().calls.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── table operations ────────────────────────────────────────────────────

    pub(crate) fn register(&self, body: Vec<u8>, slot: Slot, deadline: Option<Instant>) -> u64 {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = PendingCall { request_id, body, slot, deadline, retry_count: 0, sent_as: None };
        self.table().calls.insert(request_id, call);
        request_id
    }

    /// Take a call out of the table without resolving it.
    pub(crate) fn remove(&self, request_id: u64) -> Option<PendingCall> {
        let mut t = self.table();
        let call = t.calls.remove(&request_id)?;
        if let Some((_, msg_id)) = call.sent_as {
            t.by_msg_id.remove(&msg_id);
        }
        Some(call)
    }

    /// Body to push for `request_id`, unless it is gone or already went out
    /// on connection `epoch`.
    pub(crate) fn body_to_send(&self, request_id: u64, epoch: u64) -> Option<Vec<u8>> {
        let t = self.table();
        let call = t.calls.get(&request_id)?;
        match call.sent_as {
            Some((sent_epoch, _)) if sent_epoch == epoch => None,
            _ => Some(call.body.clone()),
        }
    }

    pub(crate) fn mark_sent(&self, request_id: u64, epoch: u64, msg_id: i64) {
        let mut t = self.table();
        let Some(call) = t.calls.get_mut(&request_id) else {
            tracing::trace!("[dispatch] request {request_id} resolved before it was sent");
            return;
        };
        let previous = call.sent_as.replace((epoch, msg_id));
        if let Some((_, old)) = previous {
            t.by_msg_id.remove(&old);
        }
        t.by_msg_id.insert(msg_id, request_id);
    }

    pub(crate) fn record_container(&self, container_id: i64, msg_ids: Vec<i64>) {
        let mut t = self.table();
        if t.containers.len() >= MAX_TRACKED_CONTAINERS {
            let Table { containers, by_msg_id, .. } = &mut *t;
            containers.retain(|_, members| members.iter().any(|m| by_msg_id.contains_key(m)));
        }
        t.containers.insert(container_id, msg_ids);
    }

    /// Unlink the calls sent as `msg_id` (or inside container `msg_id`) so
    /// they can be pushed again.
    pub(crate) fn take_for_resend(&self, msg_id: i64) -> Vec<u64> {
        let mut t = self.table();
        let ids = t.unlink(msg_id);
        ids.into_iter()
            .filter(|id| match t.calls.get_mut(id) {
                Some(call) => {
                    call.sent_as = None;
                    call.retry_count += 1;
                    true
                }
                None => false,
            })
            .collect()
    }

    /// Resolve the call sent as `msg_id`. Returns `false` if no call matched.
    pub(crate) fn resolve(&self, msg_id: i64, result: CallResult, actions: &mut Vec<Action>) -> bool {
        let call = {
            let mut t = self.table();
            let Some(id) = t.by_msg_id.remove(&msg_id) else { return false };
            t.calls.remove(&id)
        };
        match call {
            Some(call) => {
                actions.extend(call.complete(result));
                true
            }
            None => false,
        }
    }

    /// Fail every call sent as `msg_id` (or inside container `msg_id`).
    fn fail_sent(&self, msg_id: i64, make: impl Fn() -> InvocationError, actions: &mut Vec<Action>) {
        let calls: Vec<PendingCall> = {
            let mut t = self.table();
            let ids = t.unlink(msg_id);
            ids.iter().filter_map(|id| t.calls.remove(id)).collect()
        };
        for call in calls {
            actions.extend(call.complete(Err(make())));
        }
    }

    /// Prepare for a new connection: forget msg_ids, drop driver-internal
    /// calls and return the caller requests that had been sent, oldest first.
    pub(crate) fn prepare_replay(&self) -> Vec<u64> {
        self.table().calls.retain(|_, call| call.is_caller());
        self.take_all_for_resend()
    }

    /// Unlink every sent call so it can be pushed again under a new msg_id.
    /// Returns their request ids, oldest first.
    pub(crate) fn take_all_for_resend(&self) -> Vec<u64> {
        let mut t = self.table();
        t.by_msg_id.clear();
        t.containers.clear();
        let mut ids: Vec<u64> = t
            .calls
            .values_mut()
            .filter(|call| call.sent_as.is_some())
            .map(|call| {
                call.sent_as = None;
                call.retry_count += 1;
                call.request_id
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Resolve every pending call with `make()`.
    pub(crate) fn fail_all(&self, make: impl Fn() -> InvocationError) {
        let calls: Vec<PendingCall> = {
            let mut t = self.table();
            t.by_msg_id.clear();
            t.containers.clear();
            t.calls.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            let _ = call.complete(Err(make()));
        }
    }

    // ── update sinks ────────────────────────────────────────────────────────

    pub(crate) fn add_sink(&self, sink: Arc<dyn UpdateSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        sinks.retain(|s| !s.is_closed());
        sinks.push(sink);
    }

    #[cfg(test)]
    fn sink_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn clear_sinks(&self) {
        self.sinks.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn deliver(&self, update: Update) {
        let mut saw_closed = false;
        {
            let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
            if sinks.is_empty() {
                tracing::debug!(
                    "[dispatch] no update sink, dropping {:#010x} (msg {})",
                    update.constructor_id,
                    update.msg_id
                );
                return;
            }
            for sink in sinks.iter() {
                if sink.is_closed() {
                    saw_closed = true;
                    continue;
                }
                sink.deliver(update.clone());
            }
        }
        if saw_closed {
            let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
            let before = sinks.len();
            sinks.retain(|s| !s.is_closed());
            tracing::debug!("[dispatch] unregistered {} closed update sinks", before - sinks.len());
        }
    }

    // ── routing ─────────────────────────────────────────────────────────────

    /// Route one decrypted server message.
    pub(crate) fn handle_incoming(
        &self,
        session: &mut EncryptedSession,
        msg: DecryptedMessage,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if msg.is_content_related() {
            actions.push(Action::Ack(msg.msg_id));
        }
        self.route(session, msg.msg_id, msg.body, 0, &mut actions);
        actions
    }

    fn route(
        &self,
        session: &mut EncryptedSession,
        msg_id: i64,
        body: Vec<u8>,
        depth: usize,
        actions: &mut Vec<Action>,
    ) {
        if depth > MAX_DEPTH {
            tracing::warn!("[dispatch] message {msg_id} nested too deep, dropping");
            return;
        }
        let parsed = match ServiceMessage::parse(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("[dispatch] malformed message {msg_id}: {e}");
                return;
            }
        };

        match parsed {
            None => {
                let constructor_id = tl::peek_constructor(&body).unwrap_or_default();
                self.deliver(Update { msg_id, constructor_id, body });
            }
            Some(ServiceMessage::RpcResult(r)) => {
                let result = decode_result(r.result.0);
                if let Err(InvocationError::FloodWait { seconds }) = &result {
                    actions.push(Action::FloodWait(*seconds));
                }
                if !self.resolve(r.req_msg_id, result, actions) {
                    tracing::debug!("[dispatch] rpc_result for unknown msg {}", r.req_msg_id);
                }
            }
            Some(ServiceMessage::Container(c)) => {
                tracing::trace!("[dispatch] container {msg_id} with {} messages", c.messages.len());
                for inner in c.messages {
                    if inner.seqno & 1 == 1 {
                        actions.push(Action::Ack(inner.msg_id));
                    }
                    self.route(session, inner.msg_id, inner.body, depth + 1, actions);
                }
            }
            Some(ServiceMessage::Gzip(g)) => match inflate(&g.packed_data) {
                Ok(inner) => self.route(session, msg_id, inner, depth + 1, actions),
                Err(e) => tracing::warn!("[dispatch] gzip_packed {msg_id} did not inflate: {e}"),
            },
            Some(ServiceMessage::Pong(p)) => {
                if !self.resolve(p.msg_id, Ok(body), actions) {
                    tracing::trace!("[dispatch] unsolicited pong for {}", p.msg_id);
                }
            }
            Some(ServiceMessage::FutureSalts(f)) => {
                session.handle_future_salts(&f.salts.0);
                tracing::debug!("[dispatch] received {} future salts", f.salts.0.len());
                self.resolve(f.req_msg_id, Ok(body), actions);
            }
            Some(ServiceMessage::NewSessionCreated(n)) => {
                tracing::info!("[dispatch] new session created, first msg {}", n.first_msg_id);
                session.handle_new_session_created(n.server_salt);
            }
            Some(ServiceMessage::MsgsAck(a)) => {
                tracing::trace!("[dispatch] server acknowledged {:?}", a.msg_ids);
            }
            Some(ServiceMessage::BadServerSalt(b)) => {
                tracing::debug!("[dispatch] bad_server_salt for {}, switching salt", b.bad_msg_id);
                session.handle_bad_server_salt(b.new_server_salt);
                actions.extend(self.take_for_resend(b.bad_msg_id).into_iter().map(Action::Resend));
            }
            Some(ServiceMessage::BadMsgNotification(b)) => {
                match session.handle_bad_msg_notification(b.error_code, msg_id) {
                    BadMsgAction::Resend => {
                        tracing::debug!(
                            "[dispatch] bad_msg_notification {} for {}, resending",
                            b.error_code,
                            b.bad_msg_id
                        );
                        actions.extend(
                            self.take_for_resend(b.bad_msg_id).into_iter().map(Action::Resend),
                        );
                    }
                    BadMsgAction::NewSession => {
                        tracing::info!(
                            "[dispatch] bad_msg_notification {} renewed the session, resending all",
                            b.error_code
                        );
                        actions.extend(self.take_all_for_resend().into_iter().map(Action::Resend));
                    }
                    BadMsgAction::Fatal(code) => {
                        tracing::warn!("[dispatch] bad_msg_notification {code} for {}", b.bad_msg_id);
                        self.fail_sent(b.bad_msg_id, || InvocationError::BadMessage { code }, actions);
                    }
                }
            }
            Some(ServiceMessage::MsgDetailedInfo(i)) => {
                tracing::trace!("[dispatch] msg_detailed_info for {}", i.msg_id);
                actions.push(Action::Ack(i.answer_msg_id));
            }
            Some(ServiceMessage::MsgNewDetailedInfo(i)) => {
                tracing::trace!("[dispatch] msg_new_detailed_info {}", i.answer_msg_id);
                actions.push(Action::Ack(i.answer_msg_id));
            }
        }
    }
}

/// Unwrap `gzip_packed` and turn `rpc_error` into an error.
fn decode_result(mut body: Vec<u8>) -> CallResult {
    for _ in 0..=MAX_DEPTH {
        match tl::peek_constructor(&body) {
            Some(types::GzipPacked::CONSTRUCTOR_ID) => {
                let packed: types::GzipPacked = tl::decode(&body)?;
                body = inflate(&packed.packed_data)
                    .map_err(|e| InvocationError::MalformedData(format!("gzip: {e}")))?;
            }
            Some(types::RpcError::CONSTRUCTOR_ID) => {
                let e: types::RpcError = tl::decode(&body)?;
                return Err(InvocationError::from_rpc(e.error_code, &e.error_message));
            }
            _ => return Ok(body),
        }
    }
    Err(InvocationError::MalformedData("gzip_packed nested too deep".into()))
}

/// Gzip, falling back to a bare zlib stream.
fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let gz = flate2::read::GzDecoder::new(data).take(MAX_INFLATED_LEN).read_to_end(&mut out);
    if gz.is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data).take(MAX_INFLATED_LEN).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    use mtwire_crypto::AuthKey;
    use mtwire_tl_types::{Blob, RawVec, Serializable};

    use super::*;
    use crate::update::UpdateStream;

    fn session() -> EncryptedSession {
        EncryptedSession::with_session_id(AuthKey::from_bytes([3; 256]), 11, 0, 99)
    }

    fn incoming(msg_id: i64, seq_no: i32, body: Vec<u8>) -> DecryptedMessage {
        DecryptedMessage { salt: 11, session_id: 99, msg_id, seq_no, body }
    }

    fn caller(d: &Dispatcher, msg_id: i64) -> (u64, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let id = d.register(vec![1, 2, 3, 4], Slot::Caller(tx), None);
        d.mark_sent(id, 1, msg_id);
        (id, rx)
    }

    fn rpc_result(req_msg_id: i64, result: Vec<u8>) -> Vec<u8> {
        types::RpcResult { req_msg_id, result: Blob(result) }.to_bytes()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn rpc_result_resolves_only_the_matching_call() {
        let d = Dispatcher::new();
        let mut s = session();
        let (_, mut rx_a) = caller(&d, 400);
        let (_, mut rx_b) = caller(&d, 404);

        let actions = d.handle_incoming(&mut s, incoming(1001, 1, rpc_result(404, vec![9; 8])));
        assert_eq!(actions, vec![Action::Ack(1001)]);
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), vec![9; 8]);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(d.len(), 1);

        // A second answer for the same msg_id has nowhere to go.
        d.handle_incoming(&mut s, incoming(1005, 1, rpc_result(404, vec![1; 4])));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn container_members_are_routed_and_acked() {
        let d = Dispatcher::new();
        let mut s = session();
        let (_, mut rx) = caller(&d, 800);

        let container = types::MsgContainer {
            messages: vec![
                types::Message { msg_id: 2001, seqno: 1, body: rpc_result(800, vec![5; 4]) },
                types::Message {
                    msg_id: 2005,
                    seqno: 2,
                    body: types::MsgsAck { msg_ids: vec![800] }.to_bytes(),
                },
            ],
        };
        let actions = d.handle_incoming(&mut s, incoming(2009, 2, container.to_bytes()));
        assert_eq!(actions, vec![Action::Ack(2001)]);
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![5; 4]);
    }

    #[test]
    fn gzip_result_is_inflated() {
        let d = Dispatcher::new();
        let mut s = session();
        let (_, mut rx) = caller(&d, 900);
        let payload = vec![0x42; 64];
        let packed = types::GzipPacked { packed_data: gzip(&payload) }.to_bytes();

        d.handle_incoming(&mut s, incoming(3001, 1, rpc_result(900, packed)));
        assert_eq!(rx.try_recv().unwrap().unwrap(), payload);
    }

    #[test]
    fn flood_wait_arms_the_gate() {
        let d = Dispatcher::new();
        let mut s = session();
        let (_, mut rx) = caller(&d, 1200);
        let err = types::RpcError { error_code: 420, error_message: "FLOOD_WAIT_3".into() };

        let actions = d.handle_incoming(&mut s, incoming(4001, 1, rpc_result(1200, err.to_bytes())));
        assert!(actions.contains(&Action::FloodWait(3)));
        assert!(matches!(rx.try_recv().unwrap(), Err(InvocationError::FloodWait { seconds: 3 })));
    }

    #[test]
    fn rpc_error_reaches_only_its_caller() {
        let d = Dispatcher::new();
        let mut s = session();
        let (_, mut rx) = caller(&d, 1300);
        let err = types::RpcError { error_code: 400, error_message: "PEER_ID_INVALID".into() };

        d.handle_incoming(&mut s, incoming(4005, 1, rpc_result(1300, err.to_bytes())));
        match rx.try_recv().unwrap() {
            Err(InvocationError::Rpc(e)) => assert!(e.is("PEER_ID_INVALID")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_server_salt_expands_containers_for_resend() {
        let d = Dispatcher::new();
        let mut s = session();
        let (a, _rx_a) = caller(&d, 1600);
        let (b, _rx_b) = caller(&d, 1604);
        d.record_container(1608, vec![1600, 1604]);

        let bad = types::BadServerSalt {
            bad_msg_id: 1608,
            bad_msg_seqno: 4,
            error_code: 48,
            new_server_salt: 777,
        };
        let mut actions = d.handle_incoming(&mut s, incoming(5001, 2, bad.to_bytes()));
        actions.sort_by_key(|a| format!("{a:?}"));
        assert_eq!(actions, vec![Action::Resend(a), Action::Resend(b)]);
        assert_eq!(s.current_salt(std::time::SystemTime::now()), 777);
        assert_eq!(d.body_to_send(a, 1), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn backward_clock_correction_resends_every_sent_call() {
        let d = Dispatcher::new();
        let mut s = session();
        let issued = s.push(vec![0; 4], true);
        let (a, _rx_a) = caller(&d, issued);
        let (b, _rx_b) = caller(&d, issued + 4);
        let (tx, _rx_c) = oneshot::channel();
        let unsent = d.register(vec![], Slot::Caller(tx), None);

        let behind = (((issued >> 32) - 1000) << 32) | 1;
        let bad = types::BadMsgNotification { bad_msg_id: issued, bad_msg_seqno: 1, error_code: 17 };
        let actions = d.handle_incoming(&mut s, incoming(behind, 2, bad.to_bytes()));

        assert_eq!(actions, vec![Action::Resend(a), Action::Resend(b)]);
        assert!(!actions.contains(&Action::Resend(unsent)));
        assert_ne!(s.session_id(), 99);
        assert_eq!(s.queued(), 0);
        assert_eq!(d.body_to_send(a, 1), Some(vec![1, 2, 3, 4]));
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn fatal_bad_msg_fails_the_call() {
        let d = Dispatcher::new();
        let mut s = session();
        let (_, mut rx) = caller(&d, 1700);
        let bad = types::BadMsgNotification { bad_msg_id: 1700, bad_msg_seqno: 1, error_code: 64 };

        d.handle_incoming(&mut s, incoming(5005, 2, bad.to_bytes()));
        assert!(matches!(rx.try_recv().unwrap(), Err(InvocationError::BadMessage { code: 64 })));
        assert!(d.is_empty());
    }

    #[test]
    fn pong_and_future_salts_complete_internal_calls() {
        let d = Dispatcher::new();
        let mut s = session();
        let ping = d.register(vec![0; 4], Slot::Ping, None);
        d.mark_sent(ping, 1, 2400);
        let salts = d.register(vec![0; 4], Slot::FutureSalts, None);
        d.mark_sent(salts, 1, 2404);

        let pong = types::Pong { msg_id: 2400, ping_id: 5 };
        assert_eq!(
            d.handle_incoming(&mut s, incoming(6001, 2, pong.to_bytes())),
            vec![Action::Completed(ping)]
        );

        let future = types::FutureSalts {
            req_msg_id: 2404,
            now: 0,
            salts: RawVec(vec![types::FutureSalt { valid_since: 0, valid_until: i32::MAX, salt: 31 }]),
        };
        let actions = d.handle_incoming(&mut s, incoming(6005, 2, future.to_bytes()));
        assert_eq!(actions, vec![Action::Completed(salts)]);
        assert!(s.salts().salts().iter().any(|salt| salt.salt == 31));
    }

    #[test]
    fn unknown_objects_become_updates() {
        let d = Dispatcher::new();
        let mut s = session();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        d.add_sink(Arc::new(move |u: Update| sink_seen.lock().unwrap().push(u)));

        let body = [0x44u32.to_le_bytes(), 7u32.to_le_bytes()].concat();
        let actions = d.handle_incoming(&mut s, incoming(7001, 3, body.clone()));
        assert_eq!(actions, vec![Action::Ack(7001)]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Update { msg_id: 7001, constructor_id: 0x44, body }]
        );
    }

    #[test]
    fn dropped_update_streams_are_unregistered() {
        let d = Dispatcher::new();
        let mut s = session();
        let (gone_sink, gone) = UpdateStream::channel();
        let (kept_sink, kept) = UpdateStream::channel();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        d.add_sink(Arc::new(gone_sink));
        d.add_sink(Arc::new(kept_sink));
        d.add_sink(Arc::new(move |u: Update| sink_seen.lock().unwrap().push(u.msg_id)));
        drop(gone);

        let body = [0x55u32.to_le_bytes(), 1u32.to_le_bytes()].concat();
        d.handle_incoming(&mut s, incoming(7101, 1, body));
        assert_eq!(d.sink_count(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![7101]);

        drop(kept);
        let (next_sink, _next) = UpdateStream::channel();
        d.add_sink(Arc::new(next_sink));
        assert_eq!(d.sink_count(), 2, "registering prunes closed sinks");
    }

    #[test]
    fn replay_keeps_only_sent_caller_calls() {
        let d = Dispatcher::new();
        let (a, _rx_a) = caller(&d, 100);
        let (tx, _rx_b) = oneshot::channel();
        let unsent = d.register(vec![], Slot::Caller(tx), None);
        let ping = d.register(vec![], Slot::Ping, None);
        d.mark_sent(ping, 1, 104);

        assert_eq!(d.prepare_replay(), vec![a]);
        assert_eq!(d.len(), 2);
        assert!(d.body_to_send(unsent, 2).is_some());
        assert!(d.remove(ping).is_none());
    }

    #[test]
    fn remove_wins_over_a_late_reply() {
        let d = Dispatcher::new();
        let mut s = session();
        let (id, mut rx) = caller(&d, 100);
        assert!(d.remove(id).is_some());

        d.handle_incoming(&mut s, incoming(8001, 1, rpc_result(100, vec![1; 4])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fail_all_resolves_everything() {
        let d = Dispatcher::new();
        let (_, mut rx) = caller(&d, 100);
        d.fail_all(|| InvocationError::ConnectionClosed);
        assert!(matches!(rx.try_recv().unwrap(), Err(InvocationError::ConnectionClosed)));
        assert!(d.is_empty());
    }
}
