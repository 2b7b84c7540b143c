use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mtwire_crypto::{AuthKey, Envelope, Side, decrypt_data_v2_as, do_encrypt_data_v2};
use mtwire_mtproto::{
    BadMsgAction, DecryptError, EncryptedSession, Message, MessageId, MsgIdGenerator,
    PlaintextError, Session, WindowError,
};
use mtwire_tl_types::{Identifiable, Serializable, functions, types};

const NOW_SECS: u64 = 1_700_000_000;
const SESSION_ID: i64 = 0x1122_3344_5566_7788;
const SALT: i64 = 0x0a0b_0c0d;

fn now() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(NOW_SECS)
}

fn auth_key() -> AuthKey {
    AuthKey::from_bytes(core::array::from_fn(|i| (i * 13 % 251) as u8))
}

fn session() -> EncryptedSession {
    EncryptedSession::with_session_id(auth_key(), SALT, 0, SESSION_ID)
}

fn server_msg_id(secs: u64, low: i64) -> i64 {
    ((secs as i64) << 32) | low
}

/// Encrypt a frame the way the server would.
fn server_frame(session_id: i64, msg_id: i64, seq_no: i32, body: &[u8], declared: u32) -> Vec<u8> {
    let mut buf = Envelope::with_capacity(64 + body.len());
    buf.extend(SALT.to_le_bytes());
    buf.extend(session_id.to_le_bytes());
    buf.extend(msg_id.to_le_bytes());
    buf.extend(seq_no.to_le_bytes());
    buf.extend(declared.to_le_bytes());
    buf.extend(body.iter().copied());
    do_encrypt_data_v2(&mut buf, &auth_key(), &[7; 32], Side::Server);
    buf.into_wire()
}

fn pong_body() -> Vec<u8> {
    types::Pong { msg_id: 4, ping_id: 99 }.to_bytes()
}

/// Decrypt client output: (msg_id, seq_no, body).
fn open(wire: &[u8]) -> (i64, i32, Vec<u8>) {
    let mut wire = wire.to_vec();
    let plain = decrypt_data_v2_as(&mut wire, &auth_key(), Side::Client).unwrap();
    let msg_id = i64::from_le_bytes(plain[16..24].try_into().unwrap());
    let seq_no = i32::from_le_bytes(plain[24..28].try_into().unwrap());
    let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
    (msg_id, seq_no, plain[32..32 + len].to_vec())
}

// ── msg_id / seq_no ───────────────────────────────────────────────────────────

#[test]
fn msg_ids_are_strictly_increasing_and_divisible_by_four() {
    let mut ids = MsgIdGenerator::default();
    let mut last = 0;
    for _ in 0..1000 {
        let id = ids.next(now(), 0);
        assert_eq!(id % 4, 0);
        assert!(id > last);
        last = id;
    }
}

#[test]
fn msg_id_embeds_corrected_time() {
    let id = MessageId::from_time(now(), -30);
    assert_eq!(id.unix_secs(), NOW_SECS as i64 - 30);
}

#[test]
fn content_related_seq_nos_are_odd_and_service_seq_nos_even() {
    let mut s = session();
    s.push_at(vec![0; 4], true, now());
    s.push_at(vec![0; 8], true, now());
    s.push_at(vec![0; 4], false, now());
    assert_eq!(s.queued(), 3);

    let packed = s.finalize_at(now()).unwrap();
    assert_eq!(s.queued(), 0);
    assert_eq!(packed.msg_ids.len(), 3);

    let (outer_id, outer_seq, body) = open(&packed.wire);
    assert_eq!(packed.container_id, Some(outer_id));
    assert_eq!(outer_seq % 2, 0, "containers are not content-related");

    let container: types::MsgContainer = mtwire_tl_types::decode(&body).unwrap();
    let seqs: Vec<i32> = container.messages.iter().map(|m| m.seqno).collect();
    assert_eq!(seqs, vec![1, 3, 4]);
    let inner: Vec<i64> = container.messages.iter().map(|m| m.msg_id).collect();
    assert_eq!(inner, packed.msg_ids);
    assert!(inner.iter().all(|&id| id < outer_id));
}

#[test]
fn single_message_is_not_wrapped() {
    let mut s = session();
    let id = s.push_at(pong_body(), true, now());
    let packed = s.finalize_at(now()).unwrap();
    assert_eq!(packed.container_id, None);
    assert_eq!(packed.msg_ids, vec![id]);

    let (msg_id, seq_no, body) = open(&packed.wire);
    assert_eq!(msg_id, id);
    assert_eq!(seq_no, 1);
    assert_eq!(body, pong_body());
    assert!(s.finalize_at(now()).is_none());
}

#[test]
fn container_is_capped_at_maximum_length() {
    let mut s = session();
    for _ in 0..types::MsgContainer::MAXIMUM_LENGTH + 5 {
        s.push_at(vec![0; 4], false, now());
    }
    let first = s.finalize_at(now()).unwrap();
    assert_eq!(first.msg_ids.len(), types::MsgContainer::MAXIMUM_LENGTH);
    let rest = s.finalize_at(now()).unwrap();
    assert_eq!(rest.msg_ids.len(), 5);
}

// ── incoming ──────────────────────────────────────────────────────────────────

#[test]
fn unpacks_server_frame() {
    let mut s = session();
    let body = pong_body();
    let mut frame = server_frame(SESSION_ID, server_msg_id(NOW_SECS, 1), 3, &body, body.len() as u32);
    let msg = s.unpack_at(&mut frame, now()).unwrap();
    assert_eq!(msg.body, body);
    assert_eq!(msg.seq_no, 3);
    assert_eq!(msg.salt, SALT);
    assert!(msg.is_content_related());
}

#[test]
fn tampered_frame_is_an_integrity_failure() {
    let mut s = session();
    let body = pong_body();
    let mut frame = server_frame(SESSION_ID, server_msg_id(NOW_SECS, 1), 1, &body, body.len() as u32);
    frame[40] ^= 0x01;
    let err = s.unpack_at(&mut frame, now()).unwrap_err();
    assert!(err.is_integrity_failure(), "{err:?}");
}

#[test]
fn frame_for_another_key_is_rejected() {
    let mut s = EncryptedSession::with_session_id(
        AuthKey::from_bytes([3; 256]),
        SALT,
        0,
        SESSION_ID,
    );
    let body = pong_body();
    let mut frame = server_frame(SESSION_ID, server_msg_id(NOW_SECS, 1), 1, &body, body.len() as u32);
    assert_eq!(
        s.unpack_at(&mut frame, now()),
        Err(DecryptError::Crypto(mtwire_crypto::DecryptError::AuthKeyMismatch))
    );
}

#[test]
fn replayed_msg_id_is_rejected() {
    let mut s = session();
    let body = pong_body();
    let id = server_msg_id(NOW_SECS, 5);
    let mut first = server_frame(SESSION_ID, id, 1, &body, body.len() as u32);
    let mut again = first.clone();
    s.unpack_at(&mut first, now()).unwrap();
    assert_eq!(
        s.unpack_at(&mut again, now()),
        Err(DecryptError::MessageIdOutOfWindow(WindowError::Duplicate))
    );
}

#[test]
fn stale_and_even_msg_ids_are_rejected() {
    let mut s = session();
    let body = pong_body();
    let mut old = server_frame(SESSION_ID, server_msg_id(NOW_SECS - 400, 1), 1, &body, body.len() as u32);
    assert_eq!(
        s.unpack_at(&mut old, now()),
        Err(DecryptError::MessageIdOutOfWindow(WindowError::TooOld))
    );
    let mut even = server_frame(SESSION_ID, server_msg_id(NOW_SECS, 8), 1, &body, body.len() as u32);
    assert_eq!(
        s.unpack_at(&mut even, now()),
        Err(DecryptError::MessageIdOutOfWindow(WindowError::EvenId))
    );
}

#[test]
fn foreign_session_id_is_rejected() {
    let mut s = session();
    let body = pong_body();
    let mut frame = server_frame(SESSION_ID + 1, server_msg_id(NOW_SECS, 1), 1, &body, body.len() as u32);
    assert_eq!(s.unpack_at(&mut frame, now()), Err(DecryptError::SessionMismatch));
}

#[test]
fn inconsistent_inner_length_is_rejected() {
    let mut s = session();
    let body = vec![0u8; 64];
    let mut long = server_frame(SESSION_ID, server_msg_id(NOW_SECS, 1), 1, &body, 4096);
    assert!(matches!(s.unpack_at(&mut long, now()), Err(DecryptError::BadLength { .. })));

    let big = vec![0u8; 2048];
    let mut padded = server_frame(SESSION_ID, server_msg_id(NOW_SECS, 5), 1, &big, 0);
    assert!(matches!(s.unpack_at(&mut padded, now()), Err(DecryptError::BadLength { .. })));
}

// ── bad_msg_notification ──────────────────────────────────────────────────────

#[test]
fn clock_errors_resync_time_offset() {
    let mut s = session();
    let first = s.push_at(vec![0; 4], true, now());
    let action = s.handle_bad_msg_notification_at(16, server_msg_id(NOW_SECS + 100, 1), now());
    assert_eq!(action, BadMsgAction::Resend);
    assert_eq!(s.time_offset(), 100);

    let id = s.push_at(vec![0; 4], true, now());
    assert_eq!(id >> 32, NOW_SECS as i64 + 100);
    assert_eq!(id % 4, 0);
    assert!(id > first);
    assert_eq!(s.session_id(), SESSION_ID, "a forward correction keeps the session");
}

#[test]
fn backward_clock_correction_renews_the_session() {
    let mut s = session();
    let mut issued = Vec::new();
    for _ in 0..3 {
        issued.push((s.session_id(), s.push_at(vec![0; 4], true, now())));
    }
    s.finalize_at(now()).unwrap();

    let action = s.handle_bad_msg_notification_at(17, server_msg_id(NOW_SECS - 100, 1), now());
    assert_eq!(action, BadMsgAction::NewSession);
    assert_eq!(s.time_offset(), -100);
    assert_ne!(s.session_id(), SESSION_ID);

    for _ in 0..3 {
        issued.push((s.session_id(), s.push_at(vec![0; 4], true, now())));
    }
    for pair in issued.windows(2) {
        let ((sid_a, id_a), (sid_b, id_b)) = (pair[0], pair[1]);
        assert!(sid_a != sid_b || id_b > id_a, "msg_id went backwards within session {sid_a:#x}");
    }
    assert_eq!(issued[3].1 >> 32, NOW_SECS as i64 - 100);

    let packed = s.finalize_at(now()).unwrap();
    let (_, _, body) = open(&packed.wire);
    let container: types::MsgContainer = mtwire_tl_types::decode(&body).unwrap();
    let seqs: Vec<i32> = container.messages.iter().map(|m| m.seqno).collect();
    assert_eq!(seqs, vec![1, 3, 5], "seq_no restarts with the new session");

    let pong = pong_body();
    let mut stale = server_frame(SESSION_ID, server_msg_id(NOW_SECS - 100, 1), 1, &pong, pong.len() as u32);
    assert_eq!(s.unpack_at(&mut stale, now()), Err(DecryptError::SessionMismatch));
}

#[test]
fn backward_correction_discards_messages_queued_for_the_old_session() {
    let mut s = session();
    s.push_at(vec![0; 4], true, now());
    assert_eq!(s.queued(), 1);
    s.handle_bad_msg_notification_at(17, server_msg_id(NOW_SECS - 30, 1), now());
    assert_eq!(s.queued(), 0);
    assert!(s.finalize_at(now()).is_none());
}

#[test]
fn seq_no_errors_adjust_sequence() {
    let mut s = session();
    assert_eq!(s.handle_bad_msg_notification_at(32, 0, now()), BadMsgAction::Resend);
    s.push_at(vec![0; 4], true, now());
    let (_, seq_no, _) = open(&s.finalize_at(now()).unwrap().wire);
    assert_eq!(seq_no, 64 * 2 + 1);

    let mut s = session();
    assert_eq!(s.handle_bad_msg_notification_at(33, 0, now()), BadMsgAction::Resend);
    s.push_at(vec![0; 4], true, now());
    let (_, seq_no, _) = open(&s.finalize_at(now()).unwrap().wire);
    assert_eq!(seq_no, 1, "sequence never goes negative");
}

#[test]
fn unknown_bad_msg_codes_are_fatal() {
    let mut s = session();
    assert_eq!(s.handle_bad_msg_notification_at(20, 0, now()), BadMsgAction::Resend);
    assert_eq!(s.handle_bad_msg_notification_at(48, 0, now()), BadMsgAction::Resend);
    assert_eq!(s.handle_bad_msg_notification_at(64, 0, now()), BadMsgAction::Fatal(64));
}

#[test]
fn bad_server_salt_switches_salt() {
    let mut s = session();
    s.handle_bad_server_salt(77);
    assert_eq!(s.current_salt(SystemTime::now()), 77);
    s.push(vec![0; 4], true);
    let packed = s.finalize().unwrap();
    let mut wire = packed.wire;
    let plain = decrypt_data_v2_as(&mut wire, &auth_key(), Side::Client).unwrap();
    assert_eq!(i64::from_le_bytes(plain[..8].try_into().unwrap()), 77);
}

// ── plaintext ─────────────────────────────────────────────────────────────────

#[test]
fn plaintext_envelope_round_trip() {
    let mut s = Session::new();
    let msg = s.pack(&functions::ReqPqMulti { nonce: [5; 16] });
    assert_eq!(msg.id.0 % 4, 0);
    let wire = msg.to_plaintext_bytes();
    assert_eq!(&wire[..8], &[0u8; 8]);
    assert_eq!(u32::from_le_bytes(wire[16..20].try_into().unwrap()), 20);
    assert_eq!(
        mtwire_tl_types::peek_constructor(&wire[20..]),
        Some(functions::ReqPqMulti::CONSTRUCTOR_ID)
    );
    assert_eq!(Message::from_plaintext_bytes(&wire).unwrap(), msg);
}

#[test]
fn malformed_plaintext_is_rejected() {
    assert_eq!(
        Message::from_plaintext_bytes(&[0; 10]),
        Err(PlaintextError::TooShort { len: 10 })
    );

    let mut wire = Message::plaintext(MessageId(4), vec![1, 2, 3, 4]).to_plaintext_bytes();
    wire.push(0);
    assert_eq!(
        Message::from_plaintext_bytes(&wire),
        Err(PlaintextError::BadLength { declared: 4, actual: 5 })
    );

    wire[0] = 1;
    assert!(matches!(
        Message::from_plaintext_bytes(&wire),
        Err(PlaintextError::NotPlaintext { .. })
    ));
}
