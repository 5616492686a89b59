use std::cell::Cell;
use std::collections::VecDeque;
use std::future::{Future, pending};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use livebench_wire::FrameDecoder;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, info, trace, warn};

use super::queue::{Command, CommandQueue, CommandStatus, FrameSink, QueueEvent, Schedule};
use super::{ClientEvent, ConnectionState, CorrelationId, Delivery, FailureReason, SocketErrorKind};
use crate::config::Config;
use crate::telemetry::logging::hexdump;

const EVENT_CAPACITY: usize = 256;
/// Finished outcomes kept so late waiters still get an answer.
const RECENT_OUTCOMES: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running client observers until dropped.
struct DispatchScope {
    previous: bool,
}

impl DispatchScope {
    fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(self.previous));
    }
}

fn in_dispatch() -> bool {
    DISPATCHING.with(Cell::get)
}

type Observer = Arc<dyn Fn(&ClientEvent) + Send + Sync>;
type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
        }
    }
}

enum Request {
    Connect { host: String, port: u16 },
    Disconnect,
    Send(Command),
    Outcome {
        id: CorrelationId,
        reply: oneshot::Sender<Option<Delivery>>,
    },
}

/// Handle to one remote connection and its command queue.
///
/// Clones share the connection. The driver task keeps running until every
/// handle is dropped, at which point still-queued commands fail as closed.
#[derive(Clone)]
pub struct IpcClient {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    observers: Arc<Mutex<Vec<Observer>>>,
}

impl IpcClient {
    /// Starts the connection driver on the current tokio runtime.
    pub fn spawn(config: ClientConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let observers = Arc::new(Mutex::new(Vec::new()));

        let driver = Driver::new(config, requests_rx, events.clone(), state_tx, observers.clone());
        tokio::spawn(driver.run());

        Self {
            requests: requests_tx,
            events,
            state: state_rx,
            observers,
        }
    }

    pub fn connect_to_server(&self, host: impl Into<String>, port: u16) {
        self.request(Request::Connect {
            host: host.into(),
            port,
        });
    }

    pub fn disconnect_from_server(&self) {
        self.request(Request::Disconnect);
    }

    /// Queues `payload` for delivery as `method`. The outcome arrives as
    /// [`ClientEvent::SentSuccessfully`] or [`ClientEvent::SendingError`].
    pub fn send(&self, method: impl Into<String>, payload: impl Into<Bytes>) -> CorrelationId {
        let id = CorrelationId::new();
        self.request(Request::Send(Command::new(id, method, payload)));
        id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Registers a callback run on the driver task for every event.
    ///
    /// Callbacks must not wait on this client; the `wait_for_*` helpers
    /// refuse to run from inside one.
    pub fn observe<F>(&self, observer: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    pub async fn wait_for_connected(&self, limit: Duration) -> bool {
        self.wait_for_state(limit, "connected", ConnectionState::is_connected)
            .await
    }

    pub async fn wait_for_disconnected(&self, limit: Duration) -> bool {
        self.wait_for_state(limit, "disconnected", |state| {
            matches!(state, ConnectionState::Idle | ConnectionState::Failed(_))
        })
        .await
    }

    pub async fn wait_for_sent(&self, id: CorrelationId, limit: Duration) -> Delivery {
        if in_dispatch() {
            warn!(
                target = "livebench::ipc",
                %id,
                "wait_for_sent called from a client observer; refusing to block"
            );
            return Delivery::TimedOut;
        }

        // Subscribe before asking so nothing published in between is missed.
        let mut events = self.events.subscribe();
        if let Some(outcome) = self.outcome(id).await {
            return outcome;
        }

        let deadline = Instant::now() + limit;
        loop {
            match timeout_at(deadline, events.recv()).await {
                Err(_) => return Delivery::TimedOut,
                Ok(Ok(ClientEvent::SentSuccessfully(done))) if done == id => {
                    return Delivery::Delivered;
                }
                Ok(Ok(ClientEvent::SendingError(failed, reason))) if failed == id => {
                    return Delivery::Failed(reason);
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if let Some(outcome) = self.outcome(id).await {
                        return outcome;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Delivery::Failed(FailureReason::Transport(SocketErrorKind::Closed));
                }
            }
        }
    }

    /// `None` while the command is still queued or in flight.
    async fn outcome(&self, id: CorrelationId) -> Option<Delivery> {
        let (reply, answer) = oneshot::channel();
        if self.requests.send(Request::Outcome { id, reply }).is_err() {
            return Some(Delivery::Failed(FailureReason::Transport(
                SocketErrorKind::Closed,
            )));
        }
        answer.await.unwrap_or(Some(Delivery::Failed(FailureReason::Transport(
            SocketErrorKind::Closed,
        ))))
    }

    async fn wait_for_state(
        &self,
        limit: Duration,
        what: &'static str,
        done: impl FnMut(&ConnectionState) -> bool,
    ) -> bool {
        if in_dispatch() {
            warn!(
                target = "livebench::ipc",
                what, "wait called from a client observer; refusing to block"
            );
            return false;
        }
        let mut state = self.state.clone();
        matches!(timeout(limit, state.wait_for(done)).await, Ok(Ok(_)))
    }

    fn request(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!(target = "livebench::ipc", "client driver is gone");
        }
    }
}

/// Bytes accepted from the queue but not yet written to the socket.
#[derive(Default)]
struct Outbound {
    buf: BytesMut,
    open: bool,
}

impl FrameSink for Outbound {
    fn write_frame(&mut self, frame: &[u8]) -> Option<usize> {
        if !self.open {
            return None;
        }
        trace!(target = "livebench::ipc", frame = %hexdump(frame), "frame queued for write");
        self.buf.extend_from_slice(frame);
        Some(frame.len())
    }
}

enum Step {
    Request(Option<Request>),
    Connect(io::Result<TcpStream>),
    RetryDue,
    Wrote(io::Result<usize>),
    Read(io::Result<usize>),
}

struct Driver {
    config: ClientConfig,
    requests: mpsc::UnboundedReceiver<Request>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    observers: Arc<Mutex<Vec<Observer>>>,
    queue: CommandQueue,
    outbound: Outbound,
    retry_at: Option<Instant>,
    connecting: Option<ConnectFuture>,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    recent: VecDeque<(CorrelationId, Delivery)>,
}

impl Driver {
    fn new(
        config: ClientConfig,
        requests: mpsc::UnboundedReceiver<Request>,
        events: broadcast::Sender<ClientEvent>,
        state: watch::Sender<ConnectionState>,
        observers: Arc<Mutex<Vec<Observer>>>,
    ) -> Self {
        Self {
            config,
            requests,
            events,
            state,
            observers,
            queue: CommandQueue::new(),
            outbound: Outbound::default(),
            retry_at: None,
            connecting: None,
            reader: None,
            writer: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: FrameDecoder::new(),
            recent: VecDeque::with_capacity(RECENT_OUTCOMES),
        }
    }

    async fn run(mut self) {
        loop {
            match self.next_step().await {
                Step::Request(Some(request)) => self.handle_request(request).await,
                Step::Request(None) => break,
                Step::Connect(result) => {
                    self.connecting = None;
                    self.handle_connect(result);
                }
                Step::RetryDue => self.pump(),
                Step::Wrote(result) => self.handle_write(result),
                Step::Read(result) => self.handle_read(result),
            }
        }

        debug!(target = "livebench::ipc", "all client handles dropped");
        self.queue.fail_all(SocketErrorKind::Closed);
        self.publish_queue_events();
        self.teardown();
    }

    async fn next_step(&mut self) -> Step {
        tokio::select! {
            request = self.requests.recv() => Step::Request(request),
            result = finish_connect(&mut self.connecting) => Step::Connect(result),
            _ = retry_due(self.retry_at) => Step::RetryDue,
            result = write_some(&mut self.writer, &self.outbound.buf) => Step::Wrote(result),
            result = read_some(&mut self.reader, &mut self.read_buf) => Step::Read(result),
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { host, port } => {
                if self.connecting.is_some() || self.writer.is_some() {
                    debug!(target = "livebench::ipc", "reconnect requested; dropping current connection");
                    self.close().await;
                }
                info!(target = "livebench::ipc", %host, port, "connecting");
                self.set_state(ConnectionState::Connecting);
                let limit = self.config.connect_timeout;
                self.connecting = Some(Box::pin(async move {
                    match timeout(limit, TcpStream::connect((host.as_str(), port))).await {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connect attempt timed out",
                        )),
                    }
                }));
            }
            Request::Disconnect => {
                if self.connecting.is_some() || self.writer.is_some() {
                    self.close().await;
                    self.pump();
                }
            }
            Request::Send(command) => {
                self.queue.enqueue(command);
                if self.retry_at.is_none() {
                    self.pump();
                }
            }
            Request::Outcome { id, reply } => {
                let _ = reply.send(self.outcome(id));
            }
        }
    }

    fn handle_connect(&mut self, result: io::Result<TcpStream>) {
        match result {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(target = "livebench::ipc", error = %err, "failed to set TCP_NODELAY");
                }
                let peer = stream.peer_addr().ok();
                let (reader, writer) = stream.into_split();
                self.reader = Some(reader);
                self.writer = Some(writer);
                self.outbound.open = true;
                self.decoder = FrameDecoder::new();
                info!(target = "livebench::ipc", ?peer, "connected");
                self.set_state(ConnectionState::Connected);
                self.publish(ClientEvent::Connected);
                self.pump();
            }
            Err(err) => {
                let kind = SocketErrorKind::classify(&err);
                warn!(target = "livebench::ipc", error = %err, %kind, "connect failed");
                self.set_state(ConnectionState::Failed(kind));
                self.publish(ClientEvent::ConnectionError(kind));
            }
        }
    }

    fn handle_write(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => self.connection_lost(SocketErrorKind::Closed),
            Ok(written) => {
                self.outbound.buf.advance(written);
                let schedule = self.queue.on_bytes_written(written);
                self.publish_queue_events();
                if schedule == Schedule::Immediately {
                    self.pump();
                }
            }
            Err(err) => {
                let kind = SocketErrorKind::classify(&err);
                debug!(target = "livebench::ipc", error = %err, %kind, "write failed");
                // The failed frame is gone from the socket's point of view.
                self.outbound.buf.clear();
                self.queue.on_transport_error(kind);
                self.publish_queue_events();
                let state = *self.state.borrow();
                if kind.is_connection_fatal(&state) {
                    self.connection_lost(kind);
                } else {
                    self.pump();
                }
            }
        }
    }

    fn handle_read(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => self.connection_lost(SocketErrorKind::Closed),
            Ok(_) => {
                let chunk = self.read_buf.split();
                self.decoder.push(&chunk);
                loop {
                    match self.decoder.next_frame() {
                        Ok(Some(frame)) => {
                            trace!(target = "livebench::ipc", method = %frame.method, "frame received");
                            self.publish(ClientEvent::Received(frame));
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(target = "livebench::ipc", error = %err, "discarding malformed inbound data");
                            self.decoder = FrameDecoder::new();
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                let kind = SocketErrorKind::classify(&err);
                debug!(target = "livebench::ipc", error = %err, %kind, "read failed");
                self.connection_lost(kind);
            }
        }
    }

    /// Runs the queue until it asks to wait.
    fn pump(&mut self) {
        self.retry_at = None;
        loop {
            let schedule = self.queue.pump(&mut self.outbound);
            self.publish_queue_events();
            match schedule {
                Schedule::Immediately => continue,
                Schedule::After(delay) => {
                    self.retry_at = Some(Instant::now() + delay);
                    break;
                }
                Schedule::Idle => break,
            }
        }
    }

    /// Remote side went away or the socket broke.
    fn connection_lost(&mut self, kind: SocketErrorKind) {
        warn!(target = "livebench::ipc", %kind, "connection lost");
        self.queue.on_transport_error(kind);
        self.publish_queue_events();
        self.teardown();
        self.set_state(ConnectionState::Failed(kind));
        self.publish(ClientEvent::ConnectionError(kind));
        self.publish(ClientEvent::Disconnected);
        self.pump();
    }

    /// Local disconnect. The in-flight command fails before the socket goes.
    async fn close(&mut self) {
        self.set_state(ConnectionState::Closing);
        self.queue.abort_in_flight();
        self.publish_queue_events();
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.shutdown().await;
        }
        let was_connected = self.writer.is_some();
        self.teardown();
        self.set_state(ConnectionState::Idle);
        if was_connected {
            self.publish(ClientEvent::Disconnected);
        }
        info!(target = "livebench::ipc", "disconnected");
    }

    fn teardown(&mut self) {
        self.connecting = None;
        self.reader = None;
        self.writer = None;
        self.outbound.open = false;
        self.outbound.buf.clear();
        self.read_buf.clear();
    }

    fn outcome(&self, id: CorrelationId) -> Option<Delivery> {
        if self.queue.status(id) != CommandStatus::Unknown {
            return None;
        }
        let recorded = self
            .recent
            .iter()
            .rev()
            .find(|(done, _)| *done == id)
            .map(|(_, delivery)| delivery.clone());
        Some(recorded.unwrap_or(Delivery::Failed(FailureReason::NotQueued)))
    }

    fn publish_queue_events(&mut self) {
        let events: Vec<_> = self.queue.drain_events().collect();
        for event in events {
            let (id, delivery, notification) = match event {
                QueueEvent::Delivered(id) => {
                    (id, Delivery::Delivered, ClientEvent::SentSuccessfully(id))
                }
                QueueEvent::Failed(id, reason) => (
                    id,
                    Delivery::Failed(reason.clone()),
                    ClientEvent::SendingError(id, reason),
                ),
            };
            if self.recent.len() == RECENT_OUTCOMES {
                self.recent.pop_front();
            }
            self.recent.push_back((id, delivery));
            self.publish(notification);
        }
    }

    fn publish(&self, event: ClientEvent) {
        let observers = self.observers.lock().clone();
        if !observers.is_empty() {
            let _scope = DispatchScope::enter();
            for observer in &observers {
                observer(&event);
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

async fn finish_connect(connecting: &mut Option<ConnectFuture>) -> io::Result<TcpStream> {
    match connecting {
        Some(future) => future.as_mut().await,
        None => pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn write_some(writer: &mut Option<OwnedWriteHalf>, buf: &[u8]) -> io::Result<usize> {
    match writer {
        Some(writer) if !buf.is_empty() => writer.write(buf).await,
        _ => pending().await,
    }
}

async fn read_some(reader: &mut Option<OwnedReadHalf>, buf: &mut BytesMut) -> io::Result<usize> {
    match reader {
        Some(reader) => {
            buf.reserve(READ_CHUNK);
            reader.read_buf(buf).await
        }
        None => pending().await,
    }
}
