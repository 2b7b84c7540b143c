//! RPC functions of the MTProto service schema.

use crate::{Deserializable, Identifiable, RemoteCall, Serializable, enums};
use crate::deserialize::{Buffer, Result};

/// `req_pq_multi#be7e8ef1 nonce:int128 = ResPQ`
#[derive(Clone, Debug, PartialEq)]
pub struct ReqPqMulti {
    pub nonce: [u8; 16],
}

impl Identifiable for ReqPqMulti {
    const CONSTRUCTOR_ID: u32 = 0xbe7e8ef1;
}

impl Serializable for ReqPqMulti {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
    }
}

impl Deserializable for ReqPqMulti {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self { nonce: <[u8; 16]>::deserialize(buf)? })
    }
}

impl RemoteCall for ReqPqMulti {
    type Return = enums::ResPq;
}

/// `req_DH_params#d712e4be`
#[derive(Clone, Debug, PartialEq)]
pub struct ReqDhParams {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub public_key_fingerprint: i64,
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for ReqDhParams {
    const CONSTRUCTOR_ID: u32 = 0xd712e4be;
}

impl Serializable for ReqDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.p.serialize(buf);
        self.q.serialize(buf);
        self.public_key_fingerprint.serialize(buf);
        self.encrypted_data.serialize(buf);
    }
}

impl Deserializable for ReqDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self {
            nonce: <[u8; 16]>::deserialize(buf)?,
            server_nonce: <[u8; 16]>::deserialize(buf)?,
            p: Vec::<u8>::deserialize(buf)?,
            q: Vec::<u8>::deserialize(buf)?,
            public_key_fingerprint: i64::deserialize(buf)?,
            encrypted_data: Vec::<u8>::deserialize(buf)?,
        })
    }
}

impl RemoteCall for ReqDhParams {
    type Return = enums::ServerDhParams;
}

/// `set_client_DH_params#f5045f1f`
#[derive(Clone, Debug, PartialEq)]
pub struct SetClientDhParams {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for SetClientDhParams {
    const CONSTRUCTOR_ID: u32 = 0xf5045f1f;
}

impl Serializable for SetClientDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.encrypted_data.serialize(buf);
    }
}

impl Deserializable for SetClientDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self {
            nonce: <[u8; 16]>::deserialize(buf)?,
            server_nonce: <[u8; 16]>::deserialize(buf)?,
            encrypted_data: Vec::<u8>::deserialize(buf)?,
        })
    }
}

impl RemoteCall for SetClientDhParams {
    type Return = enums::SetClientDhParamsAnswer;
}

/// `ping#7abe77ec ping_id:long = Pong`
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub ping_id: i64,
}

impl Identifiable for Ping {
    const CONSTRUCTOR_ID: u32 = 0x7abe77ec;
}

impl Serializable for Ping {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.ping_id.serialize(buf);
    }
}

impl Deserializable for Ping {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self { ping_id: i64::deserialize(buf)? })
    }
}

impl RemoteCall for Ping {
    type Return = enums::Pong;
}

/// `ping_delay_disconnect#f3427b8c ping_id:long disconnect_delay:int = Pong`
///
/// Asks the server to close the connection `disconnect_delay` seconds after
/// the last ping if no further ping arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct PingDelayDisconnect {
    pub ping_id: i64,
    pub disconnect_delay: i32,
}

impl Identifiable for PingDelayDisconnect {
    const CONSTRUCTOR_ID: u32 = 0xf3427b8c;
}

impl Serializable for PingDelayDisconnect {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.ping_id.serialize(buf);
        self.disconnect_delay.serialize(buf);
    }
}

impl Deserializable for PingDelayDisconnect {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self {
            ping_id: i64::deserialize(buf)?,
            disconnect_delay: i32::deserialize(buf)?,
        })
    }
}

impl RemoteCall for PingDelayDisconnect {
    type Return = enums::Pong;
}

/// `get_future_salts#b921bd04 num:int = FutureSalts`
#[derive(Clone, Debug, PartialEq)]
pub struct GetFutureSalts {
    pub num: i32,
}

impl Identifiable for GetFutureSalts {
    const CONSTRUCTOR_ID: u32 = 0xb921bd04;
}

impl Serializable for GetFutureSalts {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.num.serialize(buf);
    }
}

impl Deserializable for GetFutureSalts {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self { num: i32::deserialize(buf)? })
    }
}

impl RemoteCall for GetFutureSalts {
    type Return = enums::FutureSalts;
}

/// `rpc_drop_answer#58e4a740 req_msg_id:long = RpcDropAnswer`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcDropAnswer {
    pub req_msg_id: i64,
}

impl Identifiable for RpcDropAnswer {
    const CONSTRUCTOR_ID: u32 = 0x58e4a740;
}

impl Serializable for RpcDropAnswer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.req_msg_id.serialize(buf);
    }
}

impl Deserializable for RpcDropAnswer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(Self { req_msg_id: i64::deserialize(buf)? })
    }
}

impl RemoteCall for RpcDropAnswer {
    type Return = enums::RpcDropAnswer;
}
