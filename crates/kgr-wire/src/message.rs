//! Wire protocol message types.
//!
//! Every frame is `[version: u8][length: u32 BE][JSON body]`. The body is a
//! [`NetFrame`]: a correlation id plus a request, response or notification.
//! Responses echo the id of the request they answer; notifications carry 0.

use crate::{WireError, WireResult};
use bytes::{Buf, BytesMut};
use kgr_types::{KgrError, KgrPath, KgrValue};
use serde::{Deserialize, Serialize};

/// Current frame header version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header length: version byte plus big-endian body length.
pub const HEADER_LEN: usize = 5;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetFrame {
    /// Correlation id. Zero for notifications.
    pub id: u64,
    #[serde(flatten)]
    pub kind: NetFrameKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NetFrameKind {
    #[serde(rename = "request")]
    Request(NetRequest),
    #[serde(rename = "response")]
    Response(NetResponse),
    #[serde(rename = "notification")]
    Notification(NetNotification),
}

/// Operations that expect a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum NetRequest {
    /// Open a logical pipe to a service on the master.
    #[serde(rename = "connect")]
    Connect { service: KgrPath },
    /// Expose one of the slave's services on the master's named server.
    #[serde(rename = "bind")]
    Bind { service: KgrPath },
    /// Whether a service is visible on the master.
    #[serde(rename = "bound")]
    Bound { service: KgrPath },
    /// Withdraw a service previously bound by this connection.
    #[serde(rename = "unbind")]
    Unbind { service: KgrPath },
    /// Master asks the slave to attach `pipe` to one of its bound services.
    #[serde(rename = "connect_back")]
    ConnectBack { pipe: u64, service: KgrPath },
    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping,
    /// Ask for a login challenge.
    #[serde(rename = "auth_request")]
    AuthRequest,
    /// Answer a login challenge.
    #[serde(rename = "auth_response")]
    AuthResponse { account: String, token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum NetResponse {
    #[serde(rename = "connected")]
    Connected { pipe: u64 },
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "registered")]
    Registered { registered: bool },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "challenge")]
    Challenge { nonce: String },
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

/// One-way messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum NetNotification {
    /// The slave has registered `pipe` and is ready for its data.
    #[serde(rename = "activate")]
    Activate { pipe: u64 },
    /// One application message on a logical pipe.
    #[serde(rename = "send")]
    Send { pipe: u64, data: KgrValue },
    /// The sender closed its end of `pipe`.
    #[serde(rename = "close")]
    Close { pipe: u64 },
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

impl NetFrame {
    pub fn request(id: u64, request: NetRequest) -> Self {
        Self {
            id,
            kind: NetFrameKind::Request(request),
        }
    }

    pub fn response(id: u64, response: NetResponse) -> Self {
        Self {
            id,
            kind: NetFrameKind::Response(response),
        }
    }

    pub fn notification(notification: NetNotification) -> Self {
        Self {
            id: 0,
            kind: NetFrameKind::Notification(notification),
        }
    }
}

impl NetResponse {
    /// An error response for `error`.
    pub fn error(error: &KgrError) -> Self {
        Self::Error {
            code: error_code(error),
            message: error_message(error),
        }
    }
}

/// Numeric code sent for each error category.
pub fn error_code(error: &KgrError) -> i32 {
    match error {
        KgrError::InvalidInput(_) | KgrError::Protocol(_) | KgrError::Config(_) => 400,
        KgrError::AuthenticationFailure(_) => 401,
        KgrError::AccessDenied(_) => 403,
        KgrError::NotFound(_) => 404,
        KgrError::Timeout(_) => 408,
        KgrError::AlreadyExists(_) => 409,
        KgrError::PipeClosed => 410,
        KgrError::Internal(_) => 500,
        KgrError::ConnectionFailed(_) => 502,
        KgrError::AttachFailed(_) => 503,
    }
}

/// The payload of an error, without the category prefix.
fn error_message(error: &KgrError) -> String {
    match error {
        KgrError::NotFound(m)
        | KgrError::AccessDenied(m)
        | KgrError::AlreadyExists(m)
        | KgrError::Timeout(m)
        | KgrError::Protocol(m)
        | KgrError::ConnectionFailed(m)
        | KgrError::AuthenticationFailure(m)
        | KgrError::AttachFailed(m)
        | KgrError::InvalidInput(m)
        | KgrError::Config(m)
        | KgrError::Internal(m) => m.clone(),
        KgrError::PipeClosed => String::new(),
    }
}

/// Rebuild the error a remote peer reported.
pub fn error_from_code(code: i32, message: String) -> KgrError {
    match code {
        401 => KgrError::AuthenticationFailure(message),
        403 => KgrError::AccessDenied(message),
        404 => KgrError::NotFound(message),
        408 => KgrError::Timeout(message),
        409 => KgrError::AlreadyExists(message),
        410 => KgrError::PipeClosed,
        502 => KgrError::ConnectionFailed(message),
        503 => KgrError::AttachFailed(message),
        400 => KgrError::InvalidInput(message),
        _ => KgrError::Internal(message),
    }
}

/// Encode a frame to bytes (header + JSON).
pub fn encode_frame(frame: &NetFrame) -> WireResult<Vec<u8>> {
    let json = serde_json::to_vec(frame)?;
    let len = u32::try_from(json.len()).map_err(|_| WireError::MessageTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
    bytes.push(PROTOCOL_VERSION);
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Oversized or wrongly
/// versioned frames are errors; the stream cannot be resynchronised after
/// them.
pub fn decode_frame(buf: &mut BytesMut, max_size: u32) -> WireResult<Option<NetFrame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: buf[0],
        });
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len > max_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }
    let total = HEADER_LEN + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let body = buf.split_to(len as usize);
    Ok(Some(serde_json::from_slice(&body)?))
}
