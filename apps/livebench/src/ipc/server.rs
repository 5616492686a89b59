use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use livebench_wire::FrameDecoder;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::SocketErrorKind;

/// Pause after a failed accept so a persistent error cannot spin the loop.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Classifies a failed accept and waits out [`ACCEPT_BACKOFF`].
pub(crate) async fn accept_failed(err: &io::Error) -> SocketErrorKind {
    let kind = SocketErrorKind::classify(err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
    kind
}

/// One frame as seen by the receiving host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCall {
    pub peer: SocketAddr,
    pub method: String,
    pub payload: Bytes,
}

/// Accepts command connections and yields decoded frames in arrival order
/// per connection.
pub struct IpcServer {
    local_addr: SocketAddr,
    calls: mpsc::UnboundedReceiver<ReceivedCall>,
    accept_task: JoinHandle<()>,
}

impl IpcServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, calls) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, tx));
        debug!(target = "livebench::ipc", %local_addr, "command server listening");
        Ok(Self {
            local_addr,
            calls,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn recv(&mut self) -> Option<ReceivedCall> {
        self.calls.recv().await
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, calls: mpsc::UnboundedSender<ReceivedCall>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!(target = "livebench::ipc", %peer, "command connection accepted");
                tokio::spawn(serve_connection(stream, peer, calls.clone()));
            }
            Err(err) => {
                warn!(target = "livebench::ipc", error = %err, "accept failed");
                accept_failed(&err).await;
            }
        }
        if calls.is_closed() {
            break;
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    calls: mpsc::UnboundedSender<ReceivedCall>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        buf.clear();
        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                if decoder.buffered() > 0 {
                    debug!(
                        target = "livebench::ipc",
                        %peer,
                        leftover = decoder.buffered(),
                        "peer closed mid-frame"
                    );
                }
                return;
            }
            Ok(_) => decoder.push(&buf),
            Err(err) => {
                debug!(target = "livebench::ipc", %peer, error = %err, "command connection read failed");
                return;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    let call = ReceivedCall {
                        peer,
                        method: frame.method,
                        payload: frame.payload,
                    };
                    if calls.send(call).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(target = "livebench::ipc", %peer, error = %err, "closing connection after malformed frame");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livebench_wire::encode_frame;
    use tokio::io::AsyncWriteExt;

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn failed_accept_waits_before_retrying() {
        let started = tokio::time::Instant::now();
        let kind = accept_failed(&io::Error::from_raw_os_error(libc::EMFILE)).await;
        assert_eq!(kind, SocketErrorKind::ResourceExhausted);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[test_timeout::tokio_timeout_test]
    async fn decodes_frames_split_across_writes() {
        let mut server = IpcServer::bind("127.0.0.1:0").await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

        let mut bytes = encode_frame("activateDocument", b"/tmp/main.qml").unwrap();
        bytes.extend(encode_frame("ping", b"").unwrap());
        let (head, tail) = bytes.split_at(11);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::task::yield_now().await;
        stream.write_all(tail).await.unwrap();

        let first = server.recv().await.unwrap();
        assert_eq!(first.method, "activateDocument");
        assert_eq!(&first.payload[..], b"/tmp/main.qml");
        let second = server.recv().await.unwrap();
        assert_eq!(second.method, "ping");
        assert!(second.payload.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_frame_closes_only_that_connection() {
        let mut server = IpcServer::bind("127.0.0.1:0").await.unwrap();

        let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
        bad.write_all(b"Method:x\nContent-Length:abc\n\n").await.unwrap();
        let mut scratch = [0u8; 1];
        // Server hangs up on the bad peer.
        assert_eq!(bad.read(&mut scratch).await.unwrap_or(0), 0);

        let mut good = TcpStream::connect(server.local_addr()).await.unwrap();
        good.write_all(&encode_frame("ping", b"1").unwrap())
            .await
            .unwrap();
        let call = server.recv().await.unwrap();
        assert_eq!(call.method, "ping");
    }
}
