//! Socket Bridge: the host-side session that multiplexes host SSH/GPG
//! UNIX-socket traffic over a framed protocol carried on `docker exec`
//! stdio.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{ClawkerError, Result};

use super::protocol::{self, Frame, FrameType, FrameWriter, SOCKET_TYPE_GPG, SOCKET_TYPE_SSH};

/// The in-container helper binary the host execs into via `docker exec -i`.
pub const HELPER_COMMAND: &str = "clawker-bridge-helper";

type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

struct StreamHandle {
    write_half: Mutex<tokio::net::unix::OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
}

/// Host-side half of one bridge session. `start`/`start_with_io` block the
/// caller until READY arrives (success) or the reader exits before READY
/// (failure).
pub struct SocketBridge {
    writer: Arc<FrameWriter<BoxedWrite>>,
    streams: Mutex<HashMap<u32, StreamHandle>>,
    done: Arc<Notify>,
    stopped: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl SocketBridge {
    /// Spawns `docker exec -i <container_id> <helper>` and starts the
    /// session over its stdio.
    pub async fn start(
        container_id: &str,
        gpg_enabled: bool,
        gpg_public_key: Option<Vec<u8>>,
    ) -> Result<Arc<Self>> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("exec")
            .arg("-i")
            .arg(container_id)
            .arg(HELPER_COMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| ClawkerError::dependency(format!("spawning docker exec: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClawkerError::Fatal("docker exec child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClawkerError::Fatal("docker exec child has no stdout".into()))?;

        Self::start_with_io(
            Box::new(stdin),
            Box::new(stdout),
            gpg_enabled,
            gpg_public_key,
            Some(child),
        )
        .await
    }

    /// Drives the handshake over an arbitrary duplex pair. Production code
    /// reaches this through `start`; tests supply an in-memory pair that
    /// stands in for the exec'd helper.
    pub async fn start_with_io(
        write: BoxedWrite,
        read: BoxedRead,
        gpg_enabled: bool,
        gpg_public_key: Option<Vec<u8>>,
        child: Option<Child>,
    ) -> Result<Arc<Self>> {
        let writer = Arc::new(FrameWriter::new(write));

        if gpg_enabled {
            let key = gpg_public_key.ok_or_else(|| {
                ClawkerError::dependency("gpg forwarding enabled but no public key supplied")
            })?;
            writer.write_frame(&Frame::pubkey(key)).await?;
        }

        let bridge = Arc::new(Self {
            writer,
            streams: Mutex::new(HashMap::new()),
            done: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
            reader_task: Mutex::new(None),
            child: Mutex::new(child),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let reader_bridge = Arc::clone(&bridge);
        let handle = tokio::spawn(async move {
            reader_bridge.reader_loop(read, ready_tx).await;
        });
        *bridge.reader_task.lock().await = Some(handle);

        match ready_rx.await {
            Ok(Ok(())) => Ok(bridge),
            Ok(Err(e)) => {
                bridge.stop().await;
                Err(e)
            }
            Err(_) => {
                bridge.stop().await;
                Err(ClawkerError::dependency("bridge exited before READY"))
            }
        }
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut read: BoxedRead,
        ready_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut ready_tx = Some(ready_tx);
        loop {
            let frame = match protocol::read_frame(&mut read).await {
                Ok(frame) => frame,
                Err(_) => break,
            };

            match frame.frame_type {
                FrameType::Ready => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                FrameType::Error => {
                    let message = frame.message();
                    log::warn!("bridge peer reported error: {message}");
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(ClawkerError::dependency(message)));
                    }
                }
                FrameType::Open => self.handle_open(frame).await,
                FrameType::Data => self.handle_data(frame).await,
                FrameType::Close => self.handle_close(frame.stream_id).await,
                FrameType::Pubkey => {
                    log::warn!("ignoring unexpected inbound PUBKEY frame");
                }
            }

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
        }

        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Err(ClawkerError::dependency("bridge exited before READY")));
        }
        self.done.notify_waiters();
    }

    async fn handle_open(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        let socket_type = match frame.socket_type() {
            Ok(s) => s.to_string(),
            Err(_) => {
                let _ = self.writer.write_frame(&Frame::close(stream_id)).await;
                return;
            }
        };

        let path = match resolve_socket_path(&socket_type).await {
            Ok(path) => path,
            Err(e) => {
                log::warn!("cannot resolve socket for OPEN({socket_type}): {e}");
                let _ = self.writer.write_frame(&Frame::close(stream_id)).await;
                return;
            }
        };

        let stream = match UnixStream::connect(&path).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("dialing {path:?} for stream {stream_id}: {e}");
                let _ = self.writer.write_frame(&Frame::close(stream_id)).await;
                return;
            }
        };

        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::clone(&self.writer);
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                use tokio::io::AsyncReadExt;
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = writer.write_frame(&Frame::close(stream_id)).await;
                        return;
                    }
                    Ok(n) => {
                        if writer
                            .write_frame(&Frame::data(stream_id, buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        self.streams.lock().await.insert(
            stream_id,
            StreamHandle {
                write_half: Mutex::new(write_half),
                reader_task,
            },
        );
    }

    async fn handle_data(&self, frame: Frame) {
        let streams = self.streams.lock().await;
        let Some(stream) = streams.get(&frame.stream_id) else {
            return;
        };
        let mut write_half = stream.write_half.lock().await;
        if write_half.write_all(&frame.payload).await.is_err() {
            let stream_id = frame.stream_id;
            drop(write_half);
            drop(streams);
            self.handle_close(stream_id).await;
            let _ = self.writer.write_frame(&Frame::close(stream_id)).await;
        }
    }

    async fn handle_close(&self, stream_id: u32) {
        if let Some(stream) = self.streams.lock().await.remove(&stream_id) {
            stream.reader_task.abort();
        }
    }

    /// Closes the done channel exactly once, tears down all open streams,
    /// closes stdin, waits for the reader loop, then kills and reaps the
    /// exec'd process. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut streams = self.streams.lock().await;
        for (_, stream) in streams.drain() {
            stream.reader_task.abort();
        }
        drop(streams);

        self.writer.close().await;

        if let Some(handle) = self.reader_task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

async fn resolve_socket_path(socket_type: &str) -> Result<PathBuf> {
    match socket_type {
        SOCKET_TYPE_SSH => std::env::var("SSH_AUTH_SOCK")
            .map(PathBuf::from)
            .map_err(|_| ClawkerError::dependency("SSH_AUTH_SOCK is not set")),
        SOCKET_TYPE_GPG => {
            let output = tokio::process::Command::new("gpgconf")
                .arg("--list-dir")
                .arg("agent-extra-socket")
                .output()
                .await
                .map_err(|e| ClawkerError::dependency(format!("running gpgconf: {e}")))?;
            if !output.status.success() {
                return Err(ClawkerError::dependency("gpgconf exited non-zero"));
            }
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if path.is_empty() {
                return Err(ClawkerError::dependency("gpgconf returned an empty path"));
            }
            Ok(PathBuf::from(path))
        }
        other => Err(ClawkerError::validation(format!(
            "unsupported socket type {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn duplex_pair() -> (
        (
            Box<dyn AsyncWrite + Unpin + Send>,
            Box<dyn AsyncRead + Unpin + Send>,
        ),
        tokio::io::DuplexStream,
    ) {
        let (bridge_end, peer_end) = tokio::io::duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_end);
        ((Box::new(bridge_write), Box::new(bridge_read)), peer_end)
    }

    #[tokio::test]
    async fn ready_frame_completes_handshake() {
        let ((bridge_write, bridge_read), peer_end) = duplex_pair().await;
        let peer_writer = Arc::new(FrameWriter::new(peer_end));
        let pw = Arc::clone(&peer_writer);
        tokio::spawn(async move {
            pw.write_frame(&Frame::ready()).await.unwrap();
        });

        let bridge = SocketBridge::start_with_io(bridge_write, bridge_read, false, None, None)
            .await
            .unwrap();
        bridge.stop().await;
    }

    #[tokio::test]
    async fn reader_exit_before_ready_is_an_error() {
        let (bridge_end, peer_end) = tokio::io::duplex(64 * 1024);
        drop(peer_end);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_end);

        let result = SocketBridge::start_with_io(
            Box::new(bridge_write),
            Box::new(bridge_read),
            false,
            None,
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gpg_enabled_sends_pubkey_before_ready() {
        let (bridge_end, peer_end) = tokio::io::duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_end);
        let (mut peer_read, peer_write) = tokio::io::split(peer_end);
        let peer_writer = Arc::new(FrameWriter::new(peer_write));

        let handshake = tokio::spawn(async move {
            let frame = protocol::read_frame(&mut peer_read).await.unwrap();
            assert_eq!(frame.frame_type, FrameType::Pubkey);
            assert_eq!(frame.payload, b"pubkey-bytes");
            peer_writer.write_frame(&Frame::ready()).await.unwrap();
        });

        let bridge = SocketBridge::start_with_io(
            Box::new(bridge_write),
            Box::new(bridge_read),
            true,
            Some(b"pubkey-bytes".to_vec()),
            None,
        )
        .await
        .unwrap();

        handshake.await.unwrap();
        bridge.stop().await;
    }

    #[tokio::test]
    async fn unknown_socket_type_gets_close_not_fatal() {
        let (bridge_end, peer_end) = tokio::io::duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_end);
        let (mut peer_read, peer_write) = tokio::io::split(peer_end);
        let peer_writer = Arc::new(FrameWriter::new(peer_write));

        let pw = Arc::clone(&peer_writer);
        tokio::spawn(async move {
            pw.write_frame(&Frame::ready()).await.unwrap();
        });

        let bridge = SocketBridge::start_with_io(
            Box::new(bridge_write),
            Box::new(bridge_read),
            false,
            None,
            None,
        )
        .await
        .unwrap();

        peer_writer
            .write_frame(&Frame::open(7, "telnet-agent"))
            .await
            .unwrap();
        let reply = protocol::read_frame(&mut peer_read).await.unwrap();
        assert_eq!(reply.frame_type, FrameType::Close);
        assert_eq!(reply.stream_id, 7);

        bridge.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let ((bridge_write, bridge_read), peer_end) = duplex_pair().await;
        let peer_writer = Arc::new(FrameWriter::new(peer_end));
        let pw = Arc::clone(&peer_writer);
        tokio::spawn(async move {
            pw.write_frame(&Frame::ready()).await.unwrap();
        });

        let bridge = SocketBridge::start_with_io(bridge_write, bridge_read, false, None, None)
            .await
            .unwrap();
        bridge.stop().await;
        bridge.stop().await;
    }
}
