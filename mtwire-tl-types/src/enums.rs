//! Boxed types of the MTProto service schema.
//!
//! Each enum reads the leading constructor ID and dispatches to the
//! matching [`crate::types`] struct.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Deserializable, Identifiable, Serializable, types};

macro_rules! boxed {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident($ty:ty)),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $($variant($ty),)+
        }

        impl Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                match self {
                    $(Self::$variant(x) => x.serialize(buf),)+
                }
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let id = u32::deserialize(buf)?;
                Ok(match id {
                    $(<$ty as Identifiable>::CONSTRUCTOR_ID => Self::$variant(<$ty>::deserialize(buf)?),)+
                    _ => return Err(Error::UnexpectedConstructor { id }),
                })
            }
        }

        impl $name {
            /// Constructor ID of the contained variant.
            pub fn constructor_id(&self) -> u32 {
                match self {
                    $(Self::$variant(_) => <$ty as Identifiable>::CONSTRUCTOR_ID,)+
                }
            }
        }
    };
}

boxed! {
    /// `ResPQ`
    ResPq { ResPq(types::ResPq) }
}

boxed! {
    /// `P_Q_inner_data`
    PQInnerData { PQInnerData(types::PQInnerData) }
}

boxed! {
    /// `Server_DH_Params`
    ServerDhParams {
        Fail(types::ServerDhParamsFail),
        Ok(types::ServerDhParamsOk),
    }
}

boxed! {
    /// `Server_DH_inner_data`
    ServerDhInnerData { ServerDhInnerData(types::ServerDhInnerData) }
}

boxed! {
    /// `Client_DH_Inner_Data`
    ClientDhInnerData { ClientDhInnerData(types::ClientDhInnerData) }
}

boxed! {
    /// `Set_client_DH_params_answer`
    SetClientDhParamsAnswer {
        DhGenOk(types::DhGenOk),
        DhGenRetry(types::DhGenRetry),
        DhGenFail(types::DhGenFail),
    }
}

boxed! {
    /// `RpcResult`
    RpcResult { RpcResult(types::RpcResult) }
}

boxed! {
    /// `RpcError`
    RpcError { RpcError(types::RpcError) }
}

boxed! {
    /// `RpcDropAnswer`
    RpcDropAnswer {
        RpcAnswerUnknown(types::RpcAnswerUnknown),
        RpcAnswerDroppedRunning(types::RpcAnswerDroppedRunning),
        RpcAnswerDropped(types::RpcAnswerDropped),
    }
}

boxed! {
    /// `FutureSalts`
    FutureSalts { FutureSalts(types::FutureSalts) }
}

boxed! {
    /// `Pong`
    Pong { Pong(types::Pong) }
}

boxed! {
    /// `NewSession`
    NewSession { NewSessionCreated(types::NewSessionCreated) }
}

boxed! {
    /// `MessageContainer`
    MessageContainer { MsgContainer(types::MsgContainer) }
}

boxed! {
    /// `MsgsAck`
    MsgsAck { MsgsAck(types::MsgsAck) }
}

boxed! {
    /// `BadMsgNotification`
    BadMsgNotification {
        BadMsgNotification(types::BadMsgNotification),
        BadServerSalt(types::BadServerSalt),
    }
}

boxed! {
    /// `MsgDetailedInfo`
    MsgDetailedInfo {
        MsgDetailedInfo(types::MsgDetailedInfo),
        MsgNewDetailedInfo(types::MsgNewDetailedInfo),
    }
}

boxed! {
    /// `Object` wrapped in `gzip_packed`.
    GzipPacked { GzipPacked(types::GzipPacked) }
}

/// Every service message a session may receive inside an encrypted envelope.
///
/// Anything else is an application-level object (an update) and is reported
/// as `None` by [`ServiceMessage::parse`].
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceMessage {
    RpcResult(types::RpcResult),
    Container(types::MsgContainer),
    Gzip(types::GzipPacked),
    Pong(types::Pong),
    FutureSalts(types::FutureSalts),
    NewSessionCreated(types::NewSessionCreated),
    MsgsAck(types::MsgsAck),
    BadMsgNotification(types::BadMsgNotification),
    BadServerSalt(types::BadServerSalt),
    MsgDetailedInfo(types::MsgDetailedInfo),
    MsgNewDetailedInfo(types::MsgNewDetailedInfo),
}

impl ServiceMessage {
    /// Parse `body` as a service message.
    ///
    /// Returns `Ok(None)` when the constructor is not a service constructor,
    /// and an error when it is one but the body is malformed.
    pub fn parse(body: &[u8]) -> Result<Option<Self>> {
        let Some(id) = crate::peek_constructor(body) else {
            return Err(Error::UnexpectedEof);
        };
        let msg = match id {
            types::RpcResult::CONSTRUCTOR_ID => Self::RpcResult(crate::decode(body)?),
            types::MsgContainer::CONSTRUCTOR_ID => Self::Container(crate::decode(body)?),
            types::GzipPacked::CONSTRUCTOR_ID => Self::Gzip(crate::decode(body)?),
            types::Pong::CONSTRUCTOR_ID => Self::Pong(crate::decode(body)?),
            types::FutureSalts::CONSTRUCTOR_ID => Self::FutureSalts(crate::decode(body)?),
            types::NewSessionCreated::CONSTRUCTOR_ID => {
                Self::NewSessionCreated(crate::decode(body)?)
            }
            types::MsgsAck::CONSTRUCTOR_ID => Self::MsgsAck(crate::decode(body)?),
            types::BadMsgNotification::CONSTRUCTOR_ID => {
                Self::BadMsgNotification(crate::decode(body)?)
            }
            types::BadServerSalt::CONSTRUCTOR_ID => Self::BadServerSalt(crate::decode(body)?),
            types::MsgDetailedInfo::CONSTRUCTOR_ID => Self::MsgDetailedInfo(crate::decode(body)?),
            types::MsgNewDetailedInfo::CONSTRUCTOR_ID => {
                Self::MsgNewDetailedInfo(crate::decode(body)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}
