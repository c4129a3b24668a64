//! Control Plane wire format (spec §3, §4.10): a length-prefixed message
//! exchanged over the Unix domain socket at `control_dir/api.sock`. Trust is
//! established by peer credentials (same-uid), not by a token — this socket
//! is not reachable off-host.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ErrorPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessageType {
    StatusRequest,
    StatusResponse,
    GitFollowRequest,
    GitFollowResponse,
    GitEventNotify,
    GitEventAck,
    Error,
}

impl ControlMessageType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::StatusRequest,
            0x02 => Self::StatusResponse,
            0x03 => Self::GitFollowRequest,
            0x04 => Self::GitFollowResponse,
            0x05 => Self::GitEventNotify,
            0x06 => Self::GitEventAck,
            0xff => Self::Error,
            _ => return None,
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::StatusRequest => 0x01,
            Self::StatusResponse => 0x02,
            Self::GitFollowRequest => 0x03,
            Self::GitFollowResponse => 0x04,
            Self::GitEventNotify => 0x05,
            Self::GitEventAck => 0x06,
            Self::Error => 0xff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponsePayload {
    pub version: String,
    pub session_count: usize,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitFollowRequestPayload {
    pub repo_path: String,
    pub branch: Option<String>,
    pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitFollowResponsePayload {
    pub follow_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitEventNotifyPayload {
    pub repo_path: String,
    pub branch: String,
}

/// One decoded control message: type byte plus its JSON payload, still
/// serialized at this layer so caller code maps `payload` with `serde_json`
/// after matching on `kind`.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub kind: ControlMessageType,
    pub payload: Vec<u8>,
}

impl ControlMessage {
    pub fn new<T: Serialize>(kind: ControlMessageType, payload: &T) -> Self {
        Self { kind, payload: serde_json::to_vec(payload).unwrap_or_default() }
    }

    pub fn error(err: &crate::error::CoreError) -> Self {
        let payload: ErrorPayload = err.into();
        Self::new(ControlMessageType::Error, &payload)
    }

    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> CoreResultAlias<T> {
        serde_json::from_slice(&self.payload).map_err(crate::error::CoreError::from)
    }
}

type CoreResultAlias<T> = Result<T, crate::error::CoreError>;

/// `tokio_util::codec` framing: 4-byte big-endian length (of type byte +
/// payload), 1 type byte, payload.
pub struct ControlCodec;

const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if len == 0 || len > MAX_MESSAGE_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "control message too large"));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let type_byte = src.get_u8();
        let Some(kind) = ControlMessageType::from_byte(type_byte) else {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown control message type"));
        };
        let payload = src.split_to(len - 1).to_vec();
        Ok(Some(ControlMessage { kind, payload }))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = 1 + item.payload.len();
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(item.kind.to_byte());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_a_status_response() {
        let mut buf = BytesMut::new();
        let mut codec = ControlCodec;
        let msg = ControlMessage::new(
            ControlMessageType::StatusResponse,
            &StatusResponsePayload { version: "0.1.0".into(), session_count: 2, port: 4020 },
        );
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, ControlMessageType::StatusResponse);
        let payload: StatusResponsePayload = decoded.decode_payload().unwrap();
        assert_eq!(payload.session_count, 2);
    }

    #[test]
    fn decode_on_partial_buffer_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u8(ControlMessageType::StatusRequest.to_byte());
        let mut codec = ControlCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        let mut codec = ControlCodec;
        assert!(codec.decode(&mut buf).is_err());
    }
}
