//! Bridge wire protocol: the framing used between the host-side Socket
//! Bridge and the in-container helper it `docker exec`s into.
//!
//! Frame layout: `length (u32 BE) | type (u8) | streamID (u32 BE) | payload`.
//! `length` counts the type byte, the streamID, and the payload — so the
//! minimum valid frame is 5 bytes (empty payload) and the payload itself is
//! `length - 5` bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{ClawkerError, Result};

/// Wire protocol version. Bumped if the frame layout ever changes.
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: u32 = 5;
const MAX_FRAME_LENGTH: u32 = 1024 * 1024;

/// Socket types the bridge knows how to dial on the host side.
pub const SOCKET_TYPE_GPG: &str = "gpg-agent";
pub const SOCKET_TYPE_SSH: &str = "ssh-agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 1,
    Open = 2,
    Close = 3,
    Pubkey = 4,
    Ready = 5,
    Error = 6,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Data),
            2 => Ok(Self::Open),
            3 => Ok(Self::Close),
            4 => Ok(Self::Pubkey),
            5 => Ok(Self::Ready),
            6 => Ok(Self::Error),
            other => Err(ClawkerError::framing(format!("unknown frame type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    pub fn open(stream_id: u32, socket_type: &str) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: socket_type.as_bytes().to_vec(),
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Vec::new(),
        }
    }

    /// PUBKEY always rides stream 0 — it precedes any stream handshake.
    pub fn pubkey(key: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Pubkey,
            stream_id: 0,
            payload: key,
        }
    }

    pub fn ready() -> Self {
        Self {
            frame_type: FrameType::Ready,
            stream_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            stream_id: 0,
            payload: message.into().into_bytes(),
        }
    }

    /// The socket type string of an OPEN frame's payload.
    pub fn socket_type(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| ClawkerError::framing("OPEN payload is not valid UTF-8"))
    }

    /// The diagnostic message of an ERROR frame's payload.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn encode(frame: &Frame) -> Vec<u8> {
    let length = HEADER_LEN + frame.payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + length as usize);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(frame.frame_type as u8);
    buf.extend_from_slice(&frame.stream_id.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}

/// Reads and decodes a single frame. A short read (EOF before a full
/// header/payload) surfaces as the underlying I/O error; an out-of-range
/// length is a framing error, fatal to the session per the codec rules.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf);
    if length < HEADER_LEN {
        return Err(ClawkerError::framing(format!(
            "frame length {length} is below the {HEADER_LEN}-byte header minimum"
        )));
    }
    if length > MAX_FRAME_LENGTH {
        return Err(ClawkerError::framing(format!(
            "frame length {length} exceeds the {MAX_FRAME_LENGTH}-byte maximum"
        )));
    }

    let mut rest = vec![0u8; length as usize];
    reader.read_exact(&mut rest).await?;
    let frame_type = FrameType::from_u8(rest[0])?;
    let stream_id = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
    let payload = rest[5..].to_vec();
    Ok(Frame {
        frame_type,
        stream_id,
        payload,
    })
}

/// Writer-mutex-guarded frame encoder: concurrent writers (the reader loop
/// forwarding OPEN/CLOSE replies, and per-stream readers forwarding DATA)
/// never interleave their header+payload writes.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let buf = encode(frame);
        let mut guard = self.inner.lock().await;
        guard.write_all(&buf).await?;
        guard.flush().await?;
        Ok(())
    }

    /// Shuts down the underlying writer, signalling EOF to the peer.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        let _ = guard.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_data_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::data(3, b"hello".to_vec());
        let writer = FrameWriter::new(&mut client);
        writer.write_frame(&frame).await.unwrap();
        drop(writer);

        let decoded = read_frame(&mut server).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn round_trips_every_frame_constructor() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frames = vec![
            Frame::open(1, SOCKET_TYPE_SSH),
            Frame::close(1),
            Frame::pubkey(b"key-bytes".to_vec()),
            Frame::ready(),
            Frame::error("boom"),
        ];
        let writer = FrameWriter::new(&mut client);
        for frame in &frames {
            writer.write_frame(frame).await.unwrap();
        }
        drop(writer);

        for expected in &frames {
            let decoded = read_frame(&mut server).await.unwrap();
            assert_eq!(&decoded, expected);
        }
    }

    #[tokio::test]
    async fn rejects_length_below_header_minimum() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ClawkerError::Framing(_)));
    }

    #[tokio::test]
    async fn rejects_length_above_one_mebibyte() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LENGTH + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ClawkerError::Framing(_)));
    }

    #[test]
    fn socket_type_roundtrips_through_open_frame() {
        let frame = Frame::open(9, SOCKET_TYPE_GPG);
        assert_eq!(frame.socket_type().unwrap(), SOCKET_TYPE_GPG);
    }
}
