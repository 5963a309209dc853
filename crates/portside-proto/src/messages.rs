//! Frame catalog and transmissible error representation
//!
//! Frame type tags are fixed and append-only for wire compatibility: new
//! types go at the end, existing ones are never renumbered.

use crate::codec::{CodecError, Decoder, Encoder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire error codes carried by [`RemoteErr`] and response frame headers
pub mod codes {
    /// No error
    pub const OK: u8 = 0;
    /// Reserved: translates back to the end-of-stream sentinel, not a failure
    pub const EOF: u8 = 1;
    pub const SESSION_NOT_FOUND: u8 = 2;
    pub const ACCEPT_REFUSED: u8 = 3;
    pub const READ: u8 = 4;
    pub const WRITE: u8 = 5;
    pub const CLOSE: u8 = 6;
    pub const SIDING_MODE: u8 = 7;
    pub const INTERNAL: u8 = 8;
}

/// Error representation that crosses the wire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteErr {
    pub code: u8,
    pub message: String,
}

impl RemoteErr {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// End-of-stream sentinel
    pub fn eof() -> Self {
        Self::new(codes::EOF, "end of stream")
    }

    pub fn session_not_found(session: u64) -> Self {
        Self::new(codes::SESSION_NOT_FOUND, format!("no session {session}"))
    }

    pub fn is_eof(&self) -> bool {
        self.code == codes::EOF
    }

    /// `u64(0)` for "no error", else `u64(code) + str(message)`
    pub fn encode_option(err: Option<&RemoteErr>, enc: &mut Encoder) {
        match err {
            None => {
                enc.put_u64(codes::OK as u64);
            }
            Some(e) => {
                enc.put_u64(e.code as u64);
                enc.put_str(&e.message);
            }
        }
    }

    /// Decoding a zero code yields no error
    pub fn decode_option(dec: &mut Decoder) -> Option<RemoteErr> {
        let code = dec.get_u64();
        if code == codes::OK as u64 {
            return None;
        }
        let message = dec.get_str();
        match u8::try_from(code) {
            Ok(code) => Some(RemoteErr::new(code, message)),
            Err(_) => {
                // Codes are a single byte on the wire; anything wider is a
                // malformed frame, not an error that narrows to OK.
                dec.fail(CodecError::InvalidErrorCode(code));
                Some(RemoteErr::new(codes::INTERNAL, message))
            }
        }
    }
}

/// Capability pair authorizing delivery of one specific side connection
///
/// The JSON form is the `side` query parameter of the upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Key")]
    pub key: u64,
}

impl SessionKey {
    pub fn new(id: u64, key: u64) -> Self {
        Self { id, key }
    }

    pub fn to_query(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_query(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Frame type tags, append-only by contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Shutdown = 0,
    Hello = 1,
    Dial = 2,
    Write = 3,
    Read = 4,
    Status = 5,
    Close = 6,
    ShutdownHint = 7,
    DialSide = 8,
    DialSide2 = 9,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Shutdown),
            1 => Ok(FrameType::Hello),
            2 => Ok(FrameType::Dial),
            3 => Ok(FrameType::Write),
            4 => Ok(FrameType::Read),
            5 => Ok(FrameType::Status),
            6 => Ok(FrameType::Close),
            7 => Ok(FrameType::ShutdownHint),
            8 => Ok(FrameType::DialSide),
            9 => Ok(FrameType::DialSide2),
            other => Err(CodecError::InvalidFrameType(other)),
        }
    }
}

/// Request payloads, one variant per frame type
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Shutdown,
    Hello {
        data: Bytes,
    },
    Dial,
    Write {
        session: u64,
        data: Bytes,
    },
    Read {
        session: u64,
        max: u64,
    },
    Status {
        err: RemoteErr,
    },
    Close {
        session: u64,
    },
    ShutdownHint,
    DialSide {
        key: SessionKey,
        token: String,
        addr: String,
    },
    DialSide2 {
        key: SessionKey,
        token: String,
        addr: String,
        remote_addr: String,
    },
}

impl Message {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Message::Shutdown => FrameType::Shutdown,
            Message::Hello { .. } => FrameType::Hello,
            Message::Dial => FrameType::Dial,
            Message::Write { .. } => FrameType::Write,
            Message::Read { .. } => FrameType::Read,
            Message::Status { .. } => FrameType::Status,
            Message::Close { .. } => FrameType::Close,
            Message::ShutdownHint => FrameType::ShutdownHint,
            Message::DialSide { .. } => FrameType::DialSide,
            Message::DialSide2 { .. } => FrameType::DialSide2,
        }
    }

    /// Encode the type-specific payload (without the frame header)
    pub fn encode_payload(&self) -> Bytes {
        let mut enc = Encoder::new();
        self.encode_payload_into(&mut enc);
        enc.finish()
    }

    fn encode_payload_into(&self, enc: &mut Encoder) {
        match self {
            Message::Shutdown | Message::Dial | Message::ShutdownHint => {}
            Message::Hello { data } => {
                enc.put_bytes(data);
            }
            Message::Write { session, data } => {
                enc.put_u64(*session).put_bytes(data);
            }
            Message::Read { session, max } => {
                enc.put_u64(*session).put_u64(*max);
            }
            Message::Status { err } => {
                RemoteErr::encode_option(Some(err), enc);
            }
            Message::Close { session } => {
                enc.put_u64(*session);
            }
            Message::DialSide { key, token, addr } => {
                enc.put_u64(key.id)
                    .put_u64(key.key)
                    .put_str(token)
                    .put_str(addr);
            }
            Message::DialSide2 {
                key,
                token,
                addr,
                remote_addr,
            } => {
                enc.put_u64(key.id)
                    .put_u64(key.key)
                    .put_str(token)
                    .put_str(addr)
                    .put_str(remote_addr);
            }
        }
    }

    /// Decode one payload; trailing bytes after the frame are a protocol
    /// violation surfaced by the decoder's `end()`.
    pub fn decode_payload(frame_type: FrameType, payload: Bytes) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(payload);
        let msg = match frame_type {
            FrameType::Shutdown => Message::Shutdown,
            FrameType::Hello => Message::Hello {
                data: dec.get_bytes(),
            },
            FrameType::Dial => Message::Dial,
            FrameType::Write => Message::Write {
                session: dec.get_u64(),
                data: dec.get_bytes(),
            },
            FrameType::Read => Message::Read {
                session: dec.get_u64(),
                max: dec.get_u64(),
            },
            FrameType::Status => {
                let err = RemoteErr::decode_option(&mut dec)
                    .unwrap_or_else(|| RemoteErr::new(codes::OK, ""));
                Message::Status { err }
            }
            FrameType::Close => Message::Close {
                session: dec.get_u64(),
            },
            FrameType::ShutdownHint => Message::ShutdownHint,
            FrameType::DialSide => Message::DialSide {
                key: SessionKey::new(dec.get_u64(), dec.get_u64()),
                token: dec.get_str(),
                addr: dec.get_str(),
            },
            FrameType::DialSide2 => Message::DialSide2 {
                key: SessionKey::new(dec.get_u64(), dec.get_u64()),
                token: dec.get_str(),
                addr: dec.get_str(),
                remote_addr: dec.get_str(),
            },
        };
        dec.end()?;
        Ok(msg)
    }
}

/// Request frame: `u64 id | u8 type | payload`
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub id: u64,
    pub message: Message,
}

impl RequestFrame {
    pub fn new(id: u64, message: Message) -> Self {
        Self { id, message }
    }

    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.put_u64(self.id).put_u8(self.message.frame_type() as u8);
        self.message.encode_payload_into(&mut enc);
        enc.finish()
    }

    pub fn decode(buf: Bytes) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(buf);
        let id = dec.get_u64();
        let tag = dec.get_u8();
        if let Some(err) = dec.error() {
            return Err(err.clone());
        }
        let frame_type = FrameType::try_from(tag)?;
        let message = Message::decode_payload(frame_type, dec.take_rest())?;
        Ok(Self { id, message })
    }
}

/// Response frame: `u64 id | u8 type | u8 errcode | payload`
///
/// A non-zero errcode means the payload is the error message string.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: u64,
    pub frame_type: FrameType,
    pub errcode: u8,
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn ok(id: u64, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            id,
            frame_type,
            errcode: codes::OK,
            payload,
        }
    }

    pub fn err(id: u64, frame_type: FrameType, err: &RemoteErr) -> Self {
        let mut enc = Encoder::new();
        enc.put_str(&err.message);
        Self {
            id,
            frame_type,
            errcode: err.code,
            payload: enc.finish(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.put_u64(self.id)
            .put_u8(self.frame_type as u8)
            .put_u8(self.errcode);
        enc.put_raw(&self.payload);
        enc.finish()
    }

    pub fn decode(buf: Bytes) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(buf);
        let id = dec.get_u64();
        let tag = dec.get_u8();
        let errcode = dec.get_u8();
        if let Some(err) = dec.error() {
            return Err(err.clone());
        }
        let frame_type = FrameType::try_from(tag)?;
        let payload = dec.take_rest();
        Ok(Self {
            id,
            frame_type,
            errcode,
            payload,
        })
    }

    /// Split into the success payload or the carried remote error
    pub fn into_result(self) -> Result<Bytes, RemoteErr> {
        if self.errcode == codes::OK {
            return Ok(self.payload);
        }
        let mut dec = Decoder::new(self.payload);
        let message = dec.get_str();
        Err(RemoteErr::new(self.errcode, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let ty = msg.frame_type();
        let payload = msg.encode_payload();
        let decoded = Message::decode_payload(ty, payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_roundtrip_all_types() {
        roundtrip(Message::Shutdown);
        roundtrip(Message::Hello {
            data: Bytes::from_static(b"ping"),
        });
        roundtrip(Message::Hello { data: Bytes::new() });
        roundtrip(Message::Dial);
        roundtrip(Message::Write {
            session: u64::MAX,
            data: Bytes::from_static(b"payload"),
        });
        roundtrip(Message::Read {
            session: 1,
            max: 4096,
        });
        roundtrip(Message::Status {
            err: RemoteErr::new(codes::INTERNAL, "boom"),
        });
        roundtrip(Message::Close { session: 7 });
        roundtrip(Message::ShutdownHint);
        roundtrip(Message::DialSide {
            key: SessionKey::new(3, u64::MAX),
            token: "bearer-token".to_string(),
            addr: "wss://relay.example.com/side".to_string(),
        });
        roundtrip(Message::DialSide2 {
            key: SessionKey::new(3, 9),
            token: String::new(),
            addr: "ws://relay.local/side".to_string(),
            remote_addr: "203.0.113.9:41000".to_string(),
        });
    }

    #[test]
    fn test_trailing_payload_rejected() {
        let mut payload = Message::Close { session: 1 }.encode_payload().to_vec();
        payload.push(0x00);
        let err = Message::decode_payload(FrameType::Close, Bytes::from(payload)).unwrap_err();
        assert_eq!(err, CodecError::TrailingData(1));
    }

    #[test]
    fn test_invalid_frame_type() {
        let err = FrameType::try_from(42).unwrap_err();
        assert_eq!(err, CodecError::InvalidFrameType(42));
    }

    #[test]
    fn test_remote_err_zero_is_none() {
        let mut enc = Encoder::new();
        RemoteErr::encode_option(None, &mut enc);
        let mut dec = Decoder::new(enc.finish());
        assert_eq!(RemoteErr::decode_option(&mut dec), None);
        dec.end().unwrap();
    }

    #[test]
    fn test_remote_err_code_wider_than_a_byte_is_malformed() {
        let mut enc = Encoder::new();
        enc.put_u64(256).put_str("out of range");
        let mut dec = Decoder::new(enc.finish());
        // Never narrows silently to code 0 ("no error").
        let err = RemoteErr::decode_option(&mut dec).unwrap();
        assert_eq!(err.code, codes::INTERNAL);
        assert_eq!(dec.end(), Err(CodecError::InvalidErrorCode(256)));
    }

    #[test]
    fn test_remote_err_roundtrip() {
        let err = RemoteErr::new(codes::SESSION_NOT_FOUND, "no session 4");
        let mut enc = Encoder::new();
        RemoteErr::encode_option(Some(&err), &mut enc);
        let mut dec = Decoder::new(enc.finish());
        assert_eq!(RemoteErr::decode_option(&mut dec), Some(err));
        dec.end().unwrap();
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = RequestFrame::new(
            12,
            Message::Write {
                session: 3,
                data: Bytes::from_static(b"abc"),
            },
        );
        let decoded = RequestFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_response_frame_ok() {
        let frame = ResponseFrame::ok(5, FrameType::Read, Bytes::from_static(b"data"));
        let decoded = ResponseFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.into_result().unwrap(), Bytes::from_static(b"data"));
    }

    #[test]
    fn test_response_frame_err() {
        let remote = RemoteErr::eof();
        let frame = ResponseFrame::err(5, FrameType::Read, &remote);
        let decoded = ResponseFrame::decode(frame.encode()).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert!(err.is_eof());
        assert_eq!(err.message, "end of stream");
    }

    #[test]
    fn test_session_key_query() {
        let key = SessionKey::new(8, 123456789);
        let raw = key.to_query();
        assert!(raw.contains("\"ID\":8"));
        assert_eq!(SessionKey::from_query(&raw).unwrap(), key);
    }
}
