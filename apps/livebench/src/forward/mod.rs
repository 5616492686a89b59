//! Local channel a follower uses to hand its arguments to the master.
//!
//! The master listens on a unix domain socket in the runtime directory. A
//! follower connects, writes its argument vector in one go and waits until
//! the master hangs up, which the master does once the arguments were
//! applied.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::ipc::SocketErrorKind;
use livebench_wire::ArgumentsError;

#[cfg(unix)]
pub use unix::{ArgumentListener, forward_arguments};

/// How often a follower retries connecting while the master is still
/// setting up its socket.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to bind argument channel {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("argument channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Arguments(#[from] ArgumentsError),
    #[error("connection closed after {received} bytes, before the arguments were complete")]
    Incomplete { received: usize },
    #[error("no answer from the running instance within {0:?}")]
    Timeout(Duration),
    #[error("the session stopped accepting forwarded arguments")]
    SessionClosed,
    #[error("argument forwarding is not supported on this platform")]
    Unsupported,
}

impl ForwardError {
    /// Transport classification for I/O failures.
    pub fn socket_kind(&self) -> Option<SocketErrorKind> {
        match self {
            ForwardError::Bind { source, .. } | ForwardError::Io(source) => {
                Some(SocketErrorKind::classify(source))
            }
            ForwardError::Incomplete { .. } => Some(SocketErrorKind::Closed),
            ForwardError::Timeout(_) => Some(SocketErrorKind::Timeout),
            _ => None,
        }
    }
}

/// Arguments received from a follower.
///
/// The follower is released when [`complete`](Self::complete) is called or
/// the value is dropped.
#[derive(Debug)]
pub struct ForwardedArguments {
    pub arguments: Vec<String>,
    ack: oneshot::Sender<()>,
}

impl ForwardedArguments {
    pub fn new(arguments: Vec<String>, ack: oneshot::Sender<()>) -> Self {
        Self { arguments, ack }
    }

    pub fn complete(self) {
        let _ = self.ack.send(());
    }
}

pub type ForwardedSender = mpsc::UnboundedSender<ForwardedArguments>;

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    use bytes::BytesMut;
    use livebench_wire::args;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};
    use tracing::{debug, info, warn};

    use super::*;

    /// Master end of the channel. Dropping it stops accepting and removes
    /// the socket file.
    #[derive(Debug)]
    pub struct ArgumentListener {
        path: PathBuf,
        accept_task: JoinHandle<()>,
    }

    impl ArgumentListener {
        /// Binds `path` and starts accepting on the current runtime.
        ///
        /// Only the session lock holder may call this: an existing socket
        /// file is treated as left over from a dead master and replaced.
        pub fn bind(
            path: &Path,
            forwarded: ForwardedSender,
            read_timeout: Duration,
        ) -> Result<Self, ForwardError> {
            let bind_error = |source| ForwardError::Bind {
                path: path.to_path_buf(),
                source,
            };
            remove_stale_socket(path).map_err(bind_error)?;
            let listener = UnixListener::bind(path).map_err(bind_error)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(bind_error)?;
            info!(target = "livebench::forward", path = %path.display(), "listening for forwarded arguments");

            let accept_task = tokio::spawn(accept_loop(listener, forwarded, read_timeout));
            Ok(Self {
                path: path.to_path_buf(),
                accept_task,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for ArgumentListener {
        fn drop(&mut self) {
            self.accept_task.abort();
            if let Err(err) = fs::remove_file(&self.path)
                && err.kind() != io::ErrorKind::NotFound
            {
                debug!(target = "livebench::forward", error = %err, "failed to remove argument socket");
            }
        }
    }

    fn remove_stale_socket(path: &Path) -> io::Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                debug!(target = "livebench::forward", path = %path.display(), "removing stale argument socket");
                fs::remove_file(path)
            }
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path exists and is not a socket",
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn accept_loop(listener: UnixListener, forwarded: ForwardedSender, read_timeout: Duration) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let forwarded = forwarded.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_follower(stream, forwarded, read_timeout).await {
                            warn!(target = "livebench::forward", error = %err, "discarding forwarding connection");
                        }
                    });
                }
                Err(err) => {
                    warn!(target = "livebench::forward", error = %err, "accept on argument channel failed");
                    crate::ipc::server::accept_failed(&err).await;
                }
            }
            if forwarded.is_closed() {
                debug!(target = "livebench::forward", "session gone; argument listener stopping");
                break;
            }
        }
    }

    /// Owns `stream` for the whole exchange, so it closes on every path.
    async fn serve_follower(
        mut stream: UnixStream,
        forwarded: ForwardedSender,
        read_timeout: Duration,
    ) -> Result<(), ForwardError> {
        let arguments = timeout(read_timeout, read_arguments(&mut stream))
            .await
            .map_err(|_| ForwardError::Timeout(read_timeout))??;
        debug!(target = "livebench::forward", count = arguments.len(), "arguments received");

        let (ack, applied) = oneshot::channel();
        forwarded
            .send(ForwardedArguments::new(arguments, ack))
            .map_err(|_| ForwardError::SessionClosed)?;
        // Completed or dropped, the follower is released either way.
        let _ = applied.await;
        Ok(())
    }

    async fn read_arguments(stream: &mut UnixStream) -> Result<Vec<String>, ForwardError> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if let Some((arguments, _)) = args::decode(&buf)? {
                return Ok(arguments);
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(ForwardError::Incomplete {
                    received: buf.len(),
                });
            }
        }
    }

    /// Follower end: hands `arguments` to the master and waits until it
    /// has applied them.
    pub async fn forward_arguments<S: AsRef<str>>(
        path: &Path,
        arguments: &[S],
        limit: Duration,
    ) -> Result<(), ForwardError> {
        let payload = args::encode(arguments)?;
        timeout(limit, async {
            let mut stream = connect_with_retry(path).await?;
            stream.write_all(&payload).await?;
            stream.flush().await?;

            let mut scratch = [0u8; 64];
            while stream.read(&mut scratch).await? != 0 {}
            debug!(target = "livebench::forward", "master released the forwarding connection");
            Ok::<(), ForwardError>(())
        })
        .await
        .map_err(|_| ForwardError::Timeout(limit))?
    }

    async fn connect_with_retry(path: &Path) -> Result<UnixStream, ForwardError> {
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(err)
                    if matches!(
                        SocketErrorKind::classify(&err),
                        SocketErrorKind::NotFound | SocketErrorKind::Refused
                    ) =>
                {
                    debug!(target = "livebench::forward", error = %err, "master not listening yet");
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn forward_arguments<S: AsRef<str>>(
    _path: &Path,
    _arguments: &[S],
    _limit: Duration,
) -> Result<(), ForwardError> {
    Err(ForwardError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failures_carry_a_socket_classification() {
        let err = ForwardError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.socket_kind(), Some(SocketErrorKind::Refused));
        assert_eq!(
            ForwardError::Incomplete { received: 3 }.socket_kind(),
            Some(SocketErrorKind::Closed)
        );
        assert_eq!(ForwardError::SessionClosed.socket_kind(), None);
    }

    #[test]
    fn dropping_forwarded_arguments_releases_the_follower() {
        let (ack, mut applied) = oneshot::channel();
        let forwarded = ForwardedArguments::new(vec!["livebench".into()], ack);
        drop(forwarded);
        assert!(applied.try_recv().is_err());
        assert!(matches!(
            applied.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
