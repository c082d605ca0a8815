use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Monotonic protocol version. Client and relay must agree exactly.
pub const PROTOCOL_VERSION: u32 = 140;

/// Deadline for writing one framed message.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between relay heartbeat sweeps over pooled tunnel connections.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for reading one framed message. Slightly larger than the
/// heartbeat interval so a missed heartbeat is distinguishable from a
/// network stall.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(65);

/// Fixed width of the client identifier on the wire.
pub const CLIENT_ID_LEN: usize = 32;

// result(1) + version(4) + access_port(4) + client_id(32)
const MIN_BODY_LEN: usize = 1 + 4 + 4 + CLIENT_ID_LEN;

// The frame length prefix is a single byte.
const MAX_BODY_LEN: usize = u8::MAX as usize;

/// Outcome carried in the first body byte of every message.
///
/// `ReceiveFailure` is synthesized locally when reading fails; it never
/// travels on the wire. Unrecognized bytes are preserved so the client can
/// treat them as transient interruptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Success,
    Fail,
    HeartBeat,
    ReceiveFailure,
    AuthFailure,
    VersionMismatch,
    IllegalAccessPort,
    PortOccupied,
    Unknown(u8),
}

impl Code {
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => Code::Success,
            1 => Code::Fail,
            2 => Code::HeartBeat,
            3 => Code::ReceiveFailure,
            4 => Code::AuthFailure,
            5 => Code::VersionMismatch,
            6 => Code::IllegalAccessPort,
            7 => Code::PortOccupied,
            other => Code::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Code::Success => 0,
            Code::Fail => 1,
            Code::HeartBeat => 2,
            Code::ReceiveFailure => 3,
            Code::AuthFailure => 4,
            Code::VersionMismatch => 5,
            Code::IllegalAccessPort => 6,
            Code::PortOccupied => 7,
            Code::Unknown(other) => other,
        }
    }
}

/// Fixed 32-byte client identifier (hex of a persisted random seed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    pub fn parse(s: &str) -> Option<Self> {
        let b = s.trim().as_bytes();
        if b.len() != CLIENT_ID_LEN {
            return None;
        }
        let mut buf = [0u8; CLIENT_ID_LEN];
        buf.copy_from_slice(b);
        Some(ClientId(buf))
    }
}

impl From<[u8; CLIENT_ID_LEN]> for ClientId {
    fn from(raw: [u8; CLIENT_ID_LEN]) -> Self {
        ClientId(raw)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        ClientId([b'0'; CLIENT_ID_LEN])
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message body is {0} bytes, limit is {MAX_BODY_LEN}")]
    Oversize(usize),
    #[error("send timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One framed protocol message.
///
/// A response is derived from a request with [`Message::reply`]: same
/// identity and port, new outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: Code,
    pub version: u32,
    pub access_port: u32,
    pub client_id: ClientId,
    pub key: String,
}

impl Message {
    /// A fresh registration request for the current protocol version.
    pub fn request(access_port: u32, client_id: ClientId, key: impl Into<String>) -> Self {
        Message {
            code: Code::Success,
            version: PROTOCOL_VERSION,
            access_port,
            client_id,
            key: key.into(),
        }
    }

    pub fn reply(&self, code: Code) -> Self {
        Message {
            code,
            ..self.clone()
        }
    }

    /// Sentinel for a failed or timed-out read. Never sent on the wire.
    pub fn receive_failure() -> Self {
        Message {
            code: Code::ReceiveFailure,
            ..Message::fail()
        }
    }

    fn fail() -> Self {
        Message {
            code: Code::Fail,
            version: 0,
            access_port: 0,
            client_id: ClientId::default(),
            key: String::new(),
        }
    }

    pub fn is_same_client(&self, other: &Message) -> bool {
        self.client_id == other.client_id
    }

    /// Serialize the message body (without the length prefix).
    pub fn encode(&self) -> Result<BytesMut, SendError> {
        let len = MIN_BODY_LEN + self.key.len();
        if len > MAX_BODY_LEN {
            return Err(SendError::Oversize(len));
        }
        let mut body = BytesMut::with_capacity(len);
        body.put_u8(self.code.as_u8());
        body.put_u32(self.version);
        body.put_u32(self.access_port);
        body.put_slice(self.client_id.as_bytes());
        body.put_slice(self.key.as_bytes());
        Ok(body)
    }

    /// Parse a message body. Undersized bodies yield a `Fail` message
    /// rather than an error; callers branch on the result code.
    pub fn decode(body: &[u8]) -> Self {
        if body.len() < MIN_BODY_LEN {
            return Message::fail();
        }
        let mut buf = body;
        let code = Code::from_u8(buf.get_u8());
        let version = buf.get_u32();
        let access_port = buf.get_u32();
        let mut id = [0u8; CLIENT_ID_LEN];
        buf.copy_to_slice(&mut id);
        Message {
            code,
            version,
            access_port,
            client_id: ClientId::from(id),
            key: String::from_utf8_lossy(buf).into_owned(),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.code.as_u8(),
            self.version,
            self.access_port,
            self.client_id
        )
    }
}

/// Write one framed message with the protocol send deadline.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), SendError> {
    let body = msg.encode()?;
    let mut frame = BytesMut::with_capacity(1 + body.len());
    frame.put_u8(body.len() as u8);
    frame.extend_from_slice(&body);

    let io = async {
        w.write_all(&frame).await?;
        w.flush().await
    };
    match tokio::time::timeout(SEND_TIMEOUT, io).await {
        Ok(res) => res.map_err(SendError::from),
        Err(_) => Err(SendError::Timeout),
    }
}

/// Read one framed message with the protocol receive deadline.
///
/// Any I/O error, including deadline expiry, yields a `ReceiveFailure`
/// sentinel instead of an error.
pub async fn receive<R: AsyncRead + Unpin>(r: &mut R) -> Message {
    let io = async {
        let len = r.read_u8().await?;
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body).await?;
        Ok::<_, std::io::Error>(body)
    };
    match tokio::time::timeout(RECEIVE_TIMEOUT, io).await {
        Ok(Ok(body)) => Message::decode(&body),
        Ok(Err(_)) | Err(_) => Message::receive_failure(),
    }
}
