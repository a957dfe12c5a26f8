//! Channel sub-protocols and frame codec
//!
//! The `channel.k8s.io` family multiplexes numbered byte channels over one
//! WebSocket:
//! - binary protocols send binary messages whose first byte is the channel
//!   index followed by the raw payload
//! - base64 protocols send text messages whose first character is
//!   `'0' + channel` followed by the standard base64 encoding of the payload
//!
//! The base64 prefix must stay a single ASCII character, which limits those
//! protocols to channels `0..=79`.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine};

/// Binary channel protocol (v1 exec)
pub const CHANNEL_PROTOCOL: &str = "channel.k8s.io";
/// Base64 channel protocol (v1 exec)
pub const BASE64_CHANNEL_PROTOCOL: &str = "base64.channel.k8s.io";
/// Binary channel protocol, v4 semantics
pub const V4_BINARY_PROTOCOL: &str = "v4.channel.k8s.io";
/// Base64 channel protocol, v4 semantics
pub const V4_BASE64_PROTOCOL: &str = "v4.base64.channel.k8s.io";

const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";

/// Highest channel whose base64 prefix `'0' + channel` is still ASCII
const MAX_BASE64_CHANNEL: u8 = 0x7f - b'0';

/// How frames are encoded on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    /// Binary messages, channel byte prefix
    Binary,
    /// Text messages, ASCII channel digit prefix, base64 payload
    Base64,
}

impl Codec {
    /// Number of channels the codec can address
    pub fn max_channels(self) -> usize {
        match self {
            Codec::Binary => usize::from(u8::MAX) + 1,
            Codec::Base64 => usize::from(MAX_BASE64_CHANNEL) + 1,
        }
    }
}

/// One acceptable sub-protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelProtocol {
    /// Protocol name; empty for a client that offered no protocol
    pub name: &'static str,
    /// Frame encoding
    pub codec: Codec,
}

impl ChannelProtocol {
    /// The no-protocol fallback used by clients that predate sub-protocols
    pub const LEGACY: ChannelProtocol = ChannelProtocol {
        name: "",
        codec: Codec::Binary,
    };

    /// Whether the peer negotiated a v4 protocol
    pub fn is_v4(&self) -> bool {
        self.name.starts_with("v4.")
    }
}

/// Direction of a channel from the server's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelType {
    /// Peer writes, server reads
    Read,
    /// Server writes, peer data is dropped
    Write,
    /// Both directions
    ReadWrite,
    /// Neither direction
    Ignore,
}

impl ChannelType {
    /// Whether frames from the peer are delivered
    pub fn readable(self) -> bool {
        matches!(self, ChannelType::Read | ChannelType::ReadWrite)
    }

    /// Whether the server may send on this channel
    pub fn writable(self) -> bool {
        matches!(self, ChannelType::Write | ChannelType::ReadWrite)
    }
}

/// Sub-protocol negotiation failure
#[derive(Debug, thiserror::Error)]
#[error("requested protocol(s) are not supported: {offered:?}; supports {supported:?}")]
pub struct NegotiationError {
    /// Protocols the client offered
    pub offered: Vec<String>,
    /// Protocols the server accepts
    pub supported: Vec<&'static str>,
}

/// Protocols offered in `Sec-WebSocket-Protocol` headers, in client order
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Pick the first offered protocol the server supports
///
/// A client that offers nothing gets the protocol named `""` when it is
/// supported.
pub fn negotiate(
    headers: &HeaderMap,
    supported: &[ChannelProtocol],
) -> Result<ChannelProtocol, NegotiationError> {
    let offered = offered_protocols(headers);
    let candidates: Vec<&str> = if offered.is_empty() {
        vec![""]
    } else {
        offered.iter().map(String::as_str).collect()
    };

    candidates
        .iter()
        .find_map(|candidate| supported.iter().find(|p| p.name == *candidate).copied())
        .ok_or_else(|| NegotiationError {
            offered,
            supported: supported.iter().map(|p| p.name).collect(),
        })
}

/// A frame payload ready to be sent as a WebSocket message
#[derive(Debug, PartialEq, Eq)]
pub enum EncodedFrame {
    /// Send as a binary message
    Binary(Vec<u8>),
    /// Send as a text message
    Text(String),
}

/// Encode a payload for a channel
///
/// Fails for base64 channels past the single-character prefix range.
pub fn encode_frame(codec: Codec, channel: u8, data: &[u8]) -> Result<EncodedFrame, FrameError> {
    match codec {
        Codec::Binary => {
            let mut frame = Vec::with_capacity(1 + data.len());
            frame.push(channel);
            frame.extend_from_slice(data);
            Ok(EncodedFrame::Binary(frame))
        }
        Codec::Base64 => {
            if channel > MAX_BASE64_CHANNEL {
                return Err(FrameError::ChannelOutOfRange(channel));
            }
            let mut frame = String::with_capacity(1 + data.len().div_ceil(3) * 4);
            frame.push(char::from(b'0' + channel));
            STANDARD.encode_string(data, &mut frame);
            Ok(EncodedFrame::Text(frame))
        }
    }
}

/// Frame encoding or decoding failure
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// Zero-length message
    #[error("empty frame")]
    Empty,
    /// Channel index has no single-character base64 prefix
    #[error("channel {0} cannot be encoded as a base64 frame")]
    ChannelOutOfRange(u8),
    /// Channel prefix outside the digit range of the base64 codec
    #[error("invalid channel prefix {0:#04x}")]
    InvalidChannel(u8),
    /// Payload is not valid base64
    #[error("invalid base64 payload: {0}")]
    Base64(String),
}

/// Split a received message into channel index and payload
pub fn decode_frame(codec: Codec, message: &[u8]) -> Result<(u8, Vec<u8>), FrameError> {
    let (&prefix, payload) = message.split_first().ok_or(FrameError::Empty)?;
    match codec {
        Codec::Binary => Ok((prefix, payload.to_vec())),
        Codec::Base64 => {
            let channel = prefix
                .checked_sub(b'0')
                .filter(|channel| *channel <= MAX_BASE64_CHANNEL)
                .ok_or(FrameError::InvalidChannel(prefix))?;
            let data = STANDARD
                .decode(payload)
                .map_err(|e| FrameError::Base64(e.to_string()))?;
            Ok((channel, data))
        }
    }
}
