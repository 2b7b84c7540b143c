use mtwire_tl_types::deserialize::Error;
use mtwire_tl_types::enums::{self, ServiceMessage};
use mtwire_tl_types::{Blob, Deserializable, RawVec, Serializable, decode, functions, types};

// ── Primitives ────────────────────────────────────────────────────────────────

#[test]
fn roundtrip_i32() {
    for v in [0i32, -1, i32::MAX, i32::MIN, 42] {
        let bytes = v.to_bytes();
        assert_eq!(i32::from_bytes(&bytes).unwrap(), v);
    }
}

#[test]
fn roundtrip_i64() {
    for v in [0i64, -1, i64::MAX, i64::MIN, 1_234_567_890] {
        let bytes = v.to_bytes();
        assert_eq!(i64::from_bytes(&bytes).unwrap(), v);
    }
}

#[test]
fn integers_are_little_endian() {
    assert_eq!(0x01020304i32.to_bytes(), [4, 3, 2, 1]);
}

#[test]
fn bool_constructors() {
    assert_eq!(true.to_bytes(), 0x997275b5u32.to_le_bytes());
    assert_eq!(false.to_bytes(), 0xbc799737u32.to_le_bytes());
    assert!(bool::from_bytes(&true.to_bytes()).unwrap());
    assert_eq!(
        bool::from_bytes(&7u32.to_bytes()),
        Err(Error::UnexpectedConstructor { id: 7 })
    );
}

// ── String / bytes ────────────────────────────────────────────────────────────

#[test]
fn short_string_is_padded() {
    let s = "hello world".to_owned();
    let bytes = s.to_bytes();
    assert_eq!(bytes.len(), 12);
    assert_eq!(bytes[0], 11);
    assert_eq!(String::from_bytes_exact(&bytes).unwrap(), s);
}

#[test]
fn long_string_uses_wide_header() {
    let s = "x".repeat(300);
    let bytes = s.to_bytes();
    assert_eq!(&bytes[..4], &[0xfe, 0x2c, 0x01, 0x00]);
    assert_eq!(bytes.len(), 304);
    assert_eq!(String::from_bytes_exact(&bytes).unwrap(), s);
}

#[test]
fn roundtrip_bytes_vec() {
    let v: Vec<u8> = (0u8..=255).collect();
    let bytes = v.to_bytes();
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(Vec::<u8>::from_bytes_exact(&bytes).unwrap(), v);
}

#[test]
fn invalid_utf8_is_rejected() {
    let bytes = vec![0xffu8, 0xfe].to_bytes();
    assert_eq!(String::from_bytes(&bytes), Err(Error::InvalidUtf8));
}

// ── Vectors ───────────────────────────────────────────────────────────────────

#[test]
fn boxed_vector_has_header() {
    let bytes = vec![1i32, 2, 3].to_bytes();
    assert_eq!(&bytes[..4], &mtwire_tl_types::VECTOR_ID.to_le_bytes());
    assert_eq!(&bytes[4..8], &3i32.to_le_bytes());
    assert_eq!(Vec::<i32>::from_bytes_exact(&bytes).unwrap(), vec![1, 2, 3]);
}

#[test]
fn bare_vector_has_only_count() {
    let bytes = RawVec(vec![7i64]).to_bytes();
    assert_eq!(bytes.len(), 12);
    assert_eq!(RawVec::<i64>::from_bytes_exact(&bytes).unwrap(), RawVec(vec![7]));
}

// ── Malformed input ───────────────────────────────────────────────────────────

#[test]
fn truncated_int_is_eof() {
    assert_eq!(i32::from_bytes(&[0x01, 0x02]), Err(Error::UnexpectedEof));
}

#[test]
fn bytes_length_past_end_overflows() {
    assert_eq!(
        Vec::<u8>::from_bytes(&[10, 1, 2]),
        Err(Error::LengthOverflow { declared: 10, remaining: 2 })
    );
}

#[test]
fn vector_count_past_end_overflows() {
    let mut bytes = mtwire_tl_types::VECTOR_ID.to_bytes();
    bytes.extend(1000i32.to_bytes());
    assert_eq!(
        Vec::<i64>::from_bytes(&bytes),
        Err(Error::LengthOverflow { declared: 1000, remaining: 0 })
    );
}

#[test]
fn negative_vector_count_overflows() {
    let mut bytes = mtwire_tl_types::VECTOR_ID.to_bytes();
    bytes.extend((-1i32).to_bytes());
    assert_eq!(
        Vec::<i64>::from_bytes(&bytes),
        Err(Error::LengthOverflow { declared: -1, remaining: 0 })
    );
}

#[test]
fn truncated_object_is_eof() {
    let bytes = functions::Ping { ping_id: 1 }.to_bytes();
    assert_eq!(decode::<functions::Ping>(&bytes[..10]), Err(Error::UnexpectedEof));
}

// ── Decode by schema id ───────────────────────────────────────────────────────

#[test]
fn decode_checks_constructor() {
    let bytes = functions::Ping { ping_id: 1 }.to_bytes();
    assert_eq!(
        decode::<types::Pong>(&bytes),
        Err(Error::UnexpectedConstructor { id: 0x7abe77ec })
    );
}

#[test]
fn decode_rejects_trailing_bytes() {
    let mut bytes = functions::Ping { ping_id: 1 }.to_bytes();
    bytes.extend([0u8; 4]);
    assert_eq!(decode::<functions::Ping>(&bytes), Err(Error::TrailingBytes { remaining: 4 }));
}

#[test]
fn boxed_enum_dispatches_on_id() {
    let retry = types::DhGenRetry {
        nonce: [1; 16],
        server_nonce: [2; 16],
        new_nonce_hash2: [3; 16],
    };
    let answer = enums::SetClientDhParamsAnswer::from_bytes_exact(&retry.to_bytes()).unwrap();
    assert_eq!(answer, enums::SetClientDhParamsAnswer::DhGenRetry(retry));
    assert_eq!(answer.constructor_id(), 0x46dc1fb9);
}

// ── Service messages ──────────────────────────────────────────────────────────

#[test]
fn container_roundtrip() {
    let container = types::MsgContainer {
        messages: vec![
            types::Message { msg_id: 4, seqno: 1, body: functions::Ping { ping_id: 9 }.to_bytes() },
            types::Message { msg_id: 8, seqno: 2, body: types::MsgsAck { msg_ids: vec![3] }.to_bytes() },
        ],
    };
    let bytes = container.to_bytes();
    assert_eq!(decode::<types::MsgContainer>(&bytes).unwrap(), container);
}

#[test]
fn container_with_oversized_inner_length_is_rejected() {
    let mut bytes = 0x73f1f8dcu32.to_bytes();
    bytes.extend(1i32.to_bytes());
    bytes.extend(4i64.to_bytes());
    bytes.extend(1i32.to_bytes());
    bytes.extend(64i32.to_bytes());
    bytes.extend([0u8; 8]);
    assert_eq!(
        decode::<types::MsgContainer>(&bytes),
        Err(Error::LengthOverflow { declared: 64, remaining: 8 })
    );
}

#[test]
fn rpc_result_keeps_body_opaque() {
    let result = types::RpcResult { req_msg_id: 7, result: Blob(vec![1, 2, 3, 4, 5, 6, 7, 8]) };
    let bytes = result.to_bytes();
    assert_eq!(decode::<types::RpcResult>(&bytes).unwrap(), result);
}

#[test]
fn future_salts_use_bare_vector() {
    let salts = types::FutureSalts {
        req_msg_id: 12,
        now: 1000,
        salts: RawVec(vec![
            types::FutureSalt { valid_since: 1000, valid_until: 2800, salt: 11 },
            types::FutureSalt { valid_since: 2800, valid_until: 4600, salt: 22 },
        ]),
    };
    let bytes = salts.to_bytes();
    assert_eq!(bytes.len(), 4 + 8 + 4 + 4 + 2 * 16);
    assert_eq!(decode::<types::FutureSalts>(&bytes).unwrap(), salts);
}

#[test]
fn service_message_parse_recognises_service_ids() {
    let pong = types::Pong { msg_id: 4, ping_id: 9 };
    assert_eq!(
        ServiceMessage::parse(&pong.to_bytes()).unwrap(),
        Some(ServiceMessage::Pong(pong))
    );
    let foreign = 0x12345678u32.to_bytes();
    assert_eq!(ServiceMessage::parse(&foreign).unwrap(), None);
    assert_eq!(ServiceMessage::parse(&[1, 2]), Err(Error::UnexpectedEof));
}
