//! An in-process MTProto server speaking the intermediate framing over
//! `tokio::io::duplex`, used to drive a real `Client` end to end.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use num_bigint::BigUint;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use zeroize::Zeroizing;

use mtwire_client::transport::BoxedStream;
use mtwire_client::{Backoff, Config, Connector, InMemoryBackend, PersistedSession};
use mtwire_crypto::{AuthKey, Envelope, Side, aes, rsa};
use mtwire_mtproto::authentication::{first_salt, key_from_gab};
use mtwire_mtproto::{Message, MessageId};
use mtwire_tl_types::{self as tl, Cursor, Deserializable, Identifiable, Serializable};
use mtwire_tl_types::{enums, functions, types};

pub const TEST_N: &str = "27136345745668139696665487111917219514623974142330465147705462937001146935077365616269308862244520866627024017521512945506105676125579995473262077252973390002548510349027400577169691202011564555747936418506711755293501105284404089261434635663871145160469438186576086776911573375953991646441653645772535420761721213849062228829450844136159612458779940956901119782059005821128160774509242846141229199996122199023529708929067299713257954632435829844672641636283990342236220053171454546348542755408349731592269703370840108938056193490368607275233355056811096371002885488650866672016241508456325599230958296110091083750601";
pub const TEST_D: &str = "14848243868954323352036626147570860609951870130521239608110195781327511620792442910102955823429337904958192795952232391257594176508892665786825428235830534896186727819645735762962984672843351159942032744368077323417686949898511232447549415366989933403336039998330995801151243133828373902397084085896564081183201672321002778645640334587427443886728229062867035457289952890788981836520722238762827599937939579193648211844878430436512677913234249560674674461996486206180136126249983227551855900413916395200642167298700038523854970849606877707156312919014355251823290633571431551754070491437452903363328007381610547999233";
pub const TEST_FINGERPRINT: i64 = -5393807889637695968;

const DH_PRIME: &str = "df6db2b616f0ae77da5cccae2bb72ea5f4e9612a2c5b4991a2e38c4f5ba32fbabd9885850dbcef8c5bd3d11f710836b79c63af8c9ead752784caed603bb9489a5186e14a7683f1d377ba2634a798ba710d3cf28f29574d71866e2164169363032c8210aa867d9234a9a328ac231d9424953e6fd3357589f757c846aa5b119d1e02d13361cf5ca1a2df8d8504bfdac4e35d09a0b11d26ef7f1d87eb707b8dd5504986d09f93f216f1252983f18abe24e0a8e40b1f6bde272080af381755c02ed105aa256c5f09a4233d3ea0fc657f8f7f90d497b431e17bdc7f12da6862de9643e4c2971ffc2627afe67b8f5641f4f510ef5d248af59b05be8b013f16da4a4ac7";
const PQ: u64 = 1724114033281923457;
const SERVER_NONCE: [u8; 16] = [0x5a; 16];

/// Auth key shared by tests that skip the handshake.
pub const KNOWN_KEY: [u8; 256] = {
    let mut key = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        key[i] = (i * 7 % 251) as u8;
        i += 1;
    }
    key
};

pub const KNOWN_SALT: i64 = 0x0102_0304_0506_0708;

/// Every wait in the harness gives up after this long.
const WAIT: Duration = Duration::from_secs(120);

pub fn test_key() -> rsa::Key {
    rsa::Key::new(TEST_N, "65537").unwrap()
}

/// A backend that already holds [`KNOWN_KEY`].
pub fn preloaded_backend() -> Arc<InMemoryBackend> {
    let backend = InMemoryBackend::new();
    mtwire_client::SessionBackend::save(
        &backend,
        &PersistedSession {
            auth_key:    Zeroizing::new(KNOWN_KEY),
            salt:        KNOWN_SALT,
            time_offset: 0,
            endpoint:    None,
        },
    )
    .unwrap();
    Arc::new(backend)
}

/// Client configuration pointed at the in-process server.
pub fn config(connector: Arc<DuplexConnector>, backend: Arc<InMemoryBackend>) -> Config {
    Config {
        endpoints: vec!["test-dc:443".to_string()],
        connector: Some(connector),
        session_backend: backend,
        server_keys: vec![test_key()],
        request_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(120),
        ping_interval: Duration::from_secs(3600),
        reconnect_backoff: Backoff {
            base:   Duration::from_millis(10),
            factor: 2,
            max:    Duration::from_millis(100),
        },
        ..Config::default()
    }
}

/// An 8-byte opaque request body tagged with `n`.
pub fn body(n: u32) -> Vec<u8> {
    let mut b = 0x1122_3344u32.to_le_bytes().to_vec();
    b.extend(n.to_le_bytes());
    b
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Hands the server half of every new duplex pipe to a [`Listener`].
pub struct DuplexConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

/// Server side of a [`DuplexConnector`].
pub struct Listener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, Listener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), Listener { rx })
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _endpoint: &str) -> io::Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(1 << 20);
        self.tx
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        Ok(Box::new(client))
    }
}

impl Listener {
    /// Next connection, before any key exists on it.
    pub async fn accept(&mut self) -> ServerConn {
        let stream = tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("no connection arrived")
            .expect("connector dropped");
        ServerConn {
            framed: Framed::new(stream, ServerCodec::default()),
            auth_key: None,
            salt: KNOWN_SALT,
            session_id: 0,
            last_msg_id: 0,
            seq: 0,
        }
    }

    /// Next connection, for a client that already holds `key`.
    pub async fn accept_with_key(&mut self, key: [u8; 256]) -> ServerConn {
        let mut conn = self.accept().await;
        conn.auth_key = Some(AuthKey::from_bytes(key));
        conn
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Intermediate framing as seen from the server: the `0xeeeeeeee` tag is
/// expected once on input and never written.
#[derive(Default)]
struct ServerCodec {
    seen_init: bool,
}

impl Decoder for ServerCodec {
    type Item = Vec<u8>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Vec<u8>>> {
        if !self.seen_init {
            if src.len() < 4 {
                return Ok(None);
            }
            assert_eq!(&src[..4], &[0xee; 4], "client did not open with the intermediate tag");
            src.advance(4);
            self.seen_init = true;
        }
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).to_vec()))
    }
}

impl Encoder<Vec<u8>> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> io::Result<()> {
        dst.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

// ─── Server connection ───────────────────────────────────────────────────────

/// One message received from the client, after container unwrapping.
#[derive(Clone, Debug)]
pub struct Incoming {
    pub salt:   i64,
    pub msg_id: i64,
    pub seq_no: i32,
    pub body:   Vec<u8>,
}

impl Incoming {
    pub fn constructor(&self) -> u32 {
        tl::peek_constructor(&self.body).unwrap_or_default()
    }
}

pub struct ServerConn {
    framed:      Framed<DuplexStream, ServerCodec>,
    auth_key:    Option<AuthKey>,
    pub salt:    i64,
    session_id:  i64,
    last_msg_id: i64,
    seq:         i32,
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

impl ServerConn {
    pub fn auth_key(&self) -> [u8; 256] {
        self.auth_key.as_ref().expect("no auth key yet").to_bytes()
    }

    fn next_msg_id(&mut self) -> i64 {
        let id = (unix_now() << 32) | 1;
        self.last_msg_id = if id > self.last_msg_id { id } else { self.last_msg_id + 4 };
        self.last_msg_id
    }

    async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        tokio::time::timeout(WAIT, self.framed.next())
            .await
            .expect("client went quiet")
            .map(|r| r.expect("bad frame from client"))
    }

    /// Wait until the client closes the stream.
    pub async fn closed(&mut self) {
        while self.recv_frame().await.is_some() {}
    }

    pub async fn send_raw(&mut self, payload: Vec<u8>) {
        self.framed.send(payload).await.unwrap();
    }

    // ── key exchange ──

    async fn recv_plain<T: Deserializable + Identifiable>(&mut self) -> T {
        let frame = self.recv_frame().await.expect("closed during key exchange");
        let msg = Message::from_plaintext_bytes(&frame).unwrap();
        tl::decode(&msg.body).unwrap()
    }

    async fn send_plain(&mut self, body: Vec<u8>) {
        let id = MessageId(self.next_msg_id());
        self.send_raw(Message::plaintext(id, body).to_plaintext_bytes()).await;
    }

    /// Play the server side of the DH handshake and return the new key.
    pub async fn handshake(&mut self) -> [u8; 256] {
        let req: functions::ReqPqMulti = self.recv_plain().await;
        let nonce = req.nonce;
        self.send_plain(
            enums::ResPq::ResPq(types::ResPq {
                nonce,
                server_nonce: SERVER_NONCE,
                pq: PQ.to_be_bytes().to_vec(),
                server_public_key_fingerprints: vec![TEST_FINGERPRINT],
            })
            .to_bytes(),
        )
        .await;

        let req: functions::ReqDhParams = self.recv_plain().await;
        assert_eq!(req.public_key_fingerprint, TEST_FINGERPRINT);
        let new_nonce = rsa_decrypt_new_nonce(&req.encrypted_data);

        let prime = BigUint::parse_bytes(DH_PRIME.as_bytes(), 16).unwrap();
        let a = BigUint::from_bytes_be(&Sha256::digest(new_nonce)) << 1800u32;
        let g_a = BigUint::from(3u32).modpow(&a, &prime);
        let inner = enums::ServerDhInnerData::ServerDhInnerData(types::ServerDhInnerData {
            nonce,
            server_nonce: SERVER_NONCE,
            g: 3,
            dh_prime: prime.to_bytes_be(),
            g_a: g_a.to_bytes_be(),
            server_time: unix_now() as i32,
        })
        .to_bytes();
        let mut answer = Sha1::digest(&inner).to_vec();
        answer.extend_from_slice(&inner);
        while answer.len() % 16 != 0 {
            answer.push(0);
        }
        let (key, iv) = mtwire_crypto::generate_key_data_from_nonce(&SERVER_NONCE, &new_nonce);
        aes::ige_encrypt(&mut answer, &key, &iv);
        self.send_plain(
            enums::ServerDhParams::Ok(types::ServerDhParamsOk {
                nonce,
                server_nonce: SERVER_NONCE,
                encrypted_answer: answer,
            })
            .to_bytes(),
        )
        .await;

        let mut req: functions::SetClientDhParams = self.recv_plain().await;
        aes::ige_decrypt(&mut req.encrypted_data, &key, &iv);
        let mut cursor = Cursor::from_slice(&req.encrypted_data[20..]);
        let enums::ClientDhInnerData::ClientDhInnerData(client) =
            enums::ClientDhInnerData::deserialize(&mut cursor).unwrap();
        let g_b = BigUint::from_bytes_be(&client.g_b);
        let auth_key = AuthKey::from_bytes(key_from_gab(&g_b.modpow(&a, &prime)));

        self.send_plain(
            enums::SetClientDhParamsAnswer::DhGenOk(types::DhGenOk {
                nonce,
                server_nonce: SERVER_NONCE,
                new_nonce_hash1: auth_key.calc_new_nonce_hash(&new_nonce, 1),
            })
            .to_bytes(),
        )
        .await;

        self.salt = first_salt(&new_nonce, &SERVER_NONCE);
        let bytes = auth_key.to_bytes();
        self.auth_key = Some(auth_key);
        bytes
    }

    // ── encrypted traffic ──

    /// Every message in the next encrypted frame, containers flattened.
    pub async fn recv(&mut self) -> Vec<Incoming> {
        let mut frame = self.recv_frame().await.expect("client closed the stream");
        let key = self.auth_key.as_ref().expect("no auth key");
        let plain = mtwire_crypto::decrypt_data_v2_as(&mut frame, key, Side::Client).unwrap();

        let read_i64 = |b: &[u8]| i64::from_le_bytes(b.try_into().unwrap());
        let salt = read_i64(&plain[..8]);
        self.session_id = read_i64(&plain[8..16]);
        let msg_id = read_i64(&plain[16..24]);
        let seq_no = i32::from_le_bytes(plain[24..28].try_into().unwrap());
        let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
        let body = plain[32..32 + len].to_vec();

        if tl::peek_constructor(&body) == Some(types::MsgContainer::CONSTRUCTOR_ID) {
            let container: types::MsgContainer = tl::decode(&body).unwrap();
            container
                .messages
                .into_iter()
                .map(|m| Incoming { salt, msg_id: m.msg_id, seq_no: m.seqno, body: m.body })
                .collect()
        } else {
            vec![Incoming { salt, msg_id, seq_no, body }]
        }
    }

    /// Next message whose constructor satisfies `pred`; others are skipped.
    pub async fn recv_where(&mut self, pred: impl Fn(u32) -> bool) -> Incoming {
        loop {
            if let Some(m) = self.recv().await.into_iter().find(|m| pred(m.constructor())) {
                return m;
            }
        }
    }

    /// Next message that is not an ack.
    pub async fn recv_request(&mut self) -> Incoming {
        self.recv_where(|id| id != types::MsgsAck::CONSTRUCTOR_ID).await
    }

    /// Collect `n` non-ack messages, possibly spread over several frames.
    pub async fn recv_requests(&mut self, n: usize) -> Vec<Incoming> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            out.extend(
                self.recv()
                    .await
                    .into_iter()
                    .filter(|m| m.constructor() != types::MsgsAck::CONSTRUCTOR_ID),
            );
        }
        out
    }

    /// Encrypt `body` as one server message.
    pub fn encrypt(&mut self, body: &[u8], content_related: bool) -> Vec<u8> {
        let msg_id = self.next_msg_id();
        let seq_no = if content_related {
            self.seq += 1;
            self.seq * 2 - 1
        } else {
            self.seq * 2
        };
        let mut buf = Envelope::with_capacity(32 + body.len());
        buf.extend(self.salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend(body.iter().copied());
        let key = self.auth_key.as_ref().expect("no auth key");
        mtwire_crypto::encrypt_data_v2_as(&mut buf, key, Side::Server);
        buf.into_wire()
    }

    /// Send `body` and return its msg_id.
    pub async fn send(&mut self, body: &[u8], content_related: bool) -> i64 {
        let frame = self.encrypt(body, content_related);
        let msg_id = self.last_msg_id;
        self.send_raw(frame).await;
        msg_id
    }

    pub async fn reply(&mut self, req_msg_id: i64, result: Vec<u8>) {
        let body = types::RpcResult { req_msg_id, result: result.into() }.to_bytes();
        self.send(&body, true).await;
    }

    pub async fn reply_error(&mut self, req_msg_id: i64, code: i32, message: &str) {
        let err = types::RpcError { error_code: code, error_message: message.to_string() };
        self.reply(req_msg_id, err.to_bytes()).await;
    }
}

/// Undo RSA-PAD with the private test key and pull out `new_nonce`.
fn rsa_decrypt_new_nonce(encrypted: &[u8]) -> [u8; 32] {
    let n = BigUint::parse_bytes(TEST_N.as_bytes(), 10).unwrap();
    let d = BigUint::parse_bytes(TEST_D.as_bytes(), 10).unwrap();
    let m = BigUint::from_bytes_be(encrypted).modpow(&d, &n).to_bytes_be();
    let mut block = vec![0u8; 256 - m.len()];
    block.extend_from_slice(&m);

    let (key_xor, aes_part) = block.split_at(32);
    let mut aes_part = aes_part.to_vec();
    let hash = Sha256::digest(&aes_part);
    let mut temp_key = [0u8; 32];
    for (i, byte) in temp_key.iter_mut().enumerate() {
        *byte = key_xor[i] ^ hash[i];
    }
    aes::ige_decrypt(&mut aes_part, &temp_key, &[0u8; 32]);

    let data: Vec<u8> = aes_part[..192].iter().rev().copied().collect();
    let mut cursor = Cursor::from_slice(&data);
    let enums::PQInnerData::PQInnerData(inner) = enums::PQInnerData::deserialize(&mut cursor).unwrap();
    assert_eq!(inner.pq, PQ.to_be_bytes().to_vec());
    inner.new_nonce
}
