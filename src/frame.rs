// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binary frame codec for the mux protocol.
//!
//! Five frame types are carried over the message transport, one frame per
//! transport message. Multi-byte integers are big-endian. The first 32-bit
//! word packs the frame type in the high 8 bits and, for stream-scoped
//! frames, the 24-bit stream id in the low bits:
//!
//! ```text
//! ┌────────────┬──────────────────────┬─────────────────────────────────┐
//! │ type (u8)  │ stream id (24 bits)  │ type-specific body              │
//! ├────────────┼──────────────────────┼─────────────────────────────────┤
//! │ 0 auth     │ 0                    │ version, key, nonce, sig, date  │
//! │ 1 goaway   │ 0                    │ lastStream, errorCode, len, msg │
//! │ 2 data     │ id                   │ raw payload bytes               │
//! │ 3 close    │ id                   │ (none)                          │
//! │ 4 reset    │ id                   │ errorCode, len, msg             │
//! └────────────┴──────────────────────┴─────────────────────────────────┘
//! ```
//!
//! # Decode Policy
//!
//! Unknown type tags decode to [`FrameError::UnrecognizedType`], which the
//! dispatcher discards silently. Truncated or malformed frames with a known
//! tag are protocol violations and fatal at the socket.
//!
//! # Encode Policy
//!
//! A stream id at or above 2^24 fails to encode ([`FrameError::StreamIdOverflow`]).
//! The socket never allocates such an id.

use thiserror::Error;

/// Largest encodable stream id (24-bit field).
pub const MAX_STREAM_ID: u32 = (1 << 24) - 1;

/// Length of the access key field in the auth frame.
pub const ACCESS_KEY_LEN: usize = 20;

/// Auth frame lengths for the 24- and 27-character ISO date forms.
const AUTH_LEN_SHORT: usize = 93;
const AUTH_LEN_LONG: usize = 96;

const TAG_AUTH: u8 = 0;
const TAG_GOAWAY: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_CLOSE: u8 = 3;
const TAG_RESET: u8 = 4;

/// Frame codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Type tag not assigned by the protocol. Discarded by the dispatcher.
    #[error("unrecognized frame type {0}")]
    UnrecognizedType(u8),

    /// Frame shorter than its fixed layout requires.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Stream id does not fit the 24-bit field.
    #[error("stream id {0} exceeds the 24-bit ceiling")]
    StreamIdOverflow(u32),

    /// A text field was not valid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    /// Auth frame field out of shape (date length, flag byte).
    #[error("invalid auth frame: {0}")]
    InvalidAuth(String),
}

/// Signed authentication record, first frame on every connection.
///
/// The signature covers the ASCII concatenation
/// `"auth" || accessKey || isoDate || base64(nonce)` with HMAC-SHA256.
/// Construction lives in [`crate::auth`]; this type is the wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFrame {
    /// Protocol version, currently 0.
    pub version: u8,
    /// Access key, exactly 20 ASCII bytes.
    pub access_key: [u8; ACCESS_KEY_LEN],
    /// Random nonce.
    pub nonce: [u8; 8],
    /// HMAC-SHA256 signature.
    pub signature: [u8; 32],
    /// ISO-8601 timestamp, 24 or 27 characters.
    pub date: String,
}

/// A decoded mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session authentication (client → server only).
    Auth(AuthFrame),
    /// Final frame before shutdown: the largest stream id the sender
    /// considers valid, plus an error code and message.
    Goaway {
        last_stream: u32,
        error_code: u32,
        msg: String,
    },
    /// Payload bytes for one logical stream.
    Data { stream: u32, payload: Vec<u8> },
    /// Send-side close for one logical stream.
    Close { stream: u32 },
    /// Abrupt reset for one logical stream.
    Reset {
        stream: u32,
        error_code: u32,
        msg: String,
    },
}

impl Frame {
    /// Frame type tag, as carried in the high byte of the header word.
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Auth(_) => TAG_AUTH,
            Frame::Goaway { .. } => TAG_GOAWAY,
            Frame::Data { .. } => TAG_DATA,
            Frame::Close { .. } => TAG_CLOSE,
            Frame::Reset { .. } => TAG_RESET,
        }
    }

    /// Short name for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth(_) => "auth",
            Frame::Goaway { .. } => "goaway",
            Frame::Data { .. } => "data",
            Frame::Close { .. } => "close",
            Frame::Reset { .. } => "reset",
        }
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Frame::Auth(auth) => encode_auth(auth),
            Frame::Goaway {
                last_stream,
                error_code,
                msg,
            } => {
                let msg_bytes = msg.as_bytes();
                let mut buf = Vec::with_capacity(16 + msg_bytes.len());
                buf.extend_from_slice(&header(TAG_GOAWAY, 0));
                buf.extend_from_slice(&last_stream.to_be_bytes());
                buf.extend_from_slice(&error_code.to_be_bytes());
                buf.extend_from_slice(&(msg_bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(msg_bytes);
                Ok(buf)
            }
            Frame::Data { stream, payload } => {
                check_stream_id(*stream)?;
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&header(TAG_DATA, *stream));
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            Frame::Close { stream } => {
                check_stream_id(*stream)?;
                Ok(header(TAG_CLOSE, *stream).to_vec())
            }
            Frame::Reset {
                stream,
                error_code,
                msg,
            } => {
                check_stream_id(*stream)?;
                let msg_bytes = msg.as_bytes();
                let mut buf = Vec::with_capacity(12 + msg_bytes.len());
                buf.extend_from_slice(&header(TAG_RESET, *stream));
                buf.extend_from_slice(&error_code.to_be_bytes());
                buf.extend_from_slice(&(msg_bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(msg_bytes);
                Ok(buf)
            }
        }
    }

    /// Decode from the wire representation.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < 4 {
            return Err(FrameError::Truncated {
                need: 4,
                have: bytes.len(),
            });
        }
        let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let tag = (word >> 24) as u8;
        let stream = word & MAX_STREAM_ID;

        match tag {
            TAG_AUTH => decode_auth(bytes),
            TAG_GOAWAY => {
                let (last_stream, rest) = read_u32(&bytes[4..], 16, bytes.len())?;
                let (error_code, rest) = read_u32(rest, 16, bytes.len())?;
                let msg = read_message(rest, "goaway message")?;
                Ok(Frame::Goaway {
                    last_stream,
                    error_code,
                    msg,
                })
            }
            TAG_DATA => Ok(Frame::Data {
                stream,
                payload: bytes[4..].to_vec(),
            }),
            TAG_CLOSE => Ok(Frame::Close { stream }),
            TAG_RESET => {
                let (error_code, rest) = read_u32(&bytes[4..], 12, bytes.len())?;
                let msg = read_message(rest, "reset message")?;
                Ok(Frame::Reset {
                    stream,
                    error_code,
                    msg,
                })
            }
            other => Err(FrameError::UnrecognizedType(other)),
        }
    }
}

/// Build the packed header word: type in the high byte, stream id below.
fn header(tag: u8, stream: u32) -> [u8; 4] {
    (((tag as u32) << 24) | (stream & MAX_STREAM_ID)).to_be_bytes()
}

fn check_stream_id(stream: u32) -> Result<(), FrameError> {
    if stream > MAX_STREAM_ID {
        return Err(FrameError::StreamIdOverflow(stream));
    }
    Ok(())
}

fn read_u32(bytes: &[u8], need: usize, have: usize) -> Result<(u32, &[u8]), FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::Truncated { need, have });
    }
    let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((value, &bytes[4..]))
}

/// Read a length-prefixed UTF-8 message.
fn read_message(bytes: &[u8], field: &'static str) -> Result<String, FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::Truncated {
            need: 4,
            have: bytes.len(),
        });
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let rest = &bytes[4..];
    if rest.len() < len {
        return Err(FrameError::Truncated {
            need: len,
            have: rest.len(),
        });
    }
    String::from_utf8(rest[..len].to_vec()).map_err(|_| FrameError::InvalidUtf8 { field })
}

/// Auth layout: version at 4, key at 8..28, nonce at 28..36, signature at
/// 36..68, long-date flag at 68, date from 69. Total 93 or 96 bytes.
fn encode_auth(auth: &AuthFrame) -> Result<Vec<u8>, FrameError> {
    let date_bytes = auth.date.as_bytes();
    let long = match date_bytes.len() {
        24 => false,
        27 => true,
        other => {
            return Err(FrameError::InvalidAuth(format!(
                "ISO date must be 24 or 27 characters, got {}",
                other
            )))
        }
    };

    let mut buf = vec![0u8; 69 + date_bytes.len()];
    buf[..4].copy_from_slice(&header(TAG_AUTH, 0));
    buf[4] = auth.version;
    buf[8..28].copy_from_slice(&auth.access_key);
    buf[28..36].copy_from_slice(&auth.nonce);
    buf[36..68].copy_from_slice(&auth.signature);
    buf[68] = long as u8;
    buf[69..].copy_from_slice(date_bytes);
    Ok(buf)
}

fn decode_auth(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < AUTH_LEN_SHORT {
        return Err(FrameError::Truncated {
            need: AUTH_LEN_SHORT,
            have: bytes.len(),
        });
    }
    let expected = match bytes[68] {
        0 => AUTH_LEN_SHORT,
        1 => AUTH_LEN_LONG,
        flag => {
            return Err(FrameError::InvalidAuth(format!(
                "bad date-length flag {}",
                flag
            )))
        }
    };
    if bytes.len() < expected {
        return Err(FrameError::Truncated {
            need: expected,
            have: bytes.len(),
        });
    }

    let mut access_key = [0u8; ACCESS_KEY_LEN];
    access_key.copy_from_slice(&bytes[8..28]);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&bytes[28..36]);
    let mut signature = [0u8; 32];
    signature.copy_from_slice(&bytes[36..68]);
    let date = String::from_utf8(bytes[69..expected].to_vec())
        .map_err(|_| FrameError::InvalidUtf8 { field: "auth date" })?;

    Ok(Frame::Auth(AuthFrame {
        version: bytes[4],
        access_key,
        nonce,
        signature,
        date,
    }))
}
