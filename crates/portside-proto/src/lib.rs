//! Relay Protocol Definitions
//!
//! This crate defines the binary wire codec, the frame catalog, and the
//! transmissible error representation shared by both ends of a relay
//! connection.

pub mod codec;
pub mod messages;
pub mod options;

pub use codec::{CodecError, Decoder, Encoder};
pub use messages::{
    codes, FrameType, Message, RemoteErr, RequestFrame, ResponseFrame, SessionKey,
};
pub use options::TunnelOptions;

/// Maximum payload carried by one side-connection binary frame
pub const SIDE_CHUNK_SIZE: usize = 4096;

/// Text-frame payload signalling graceful half-close on a side connection
pub const SIDE_EOF_MARK: &str = "EOF";
