//! Ordered command queue with at most one command in flight.
//!
//! The queue does no I/O. The connection driver hands it a [`FrameSink`]
//! whenever a pump opportunity arises and feeds back byte confirmations and
//! transport errors; the returned [`Schedule`] says when to pump next.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use livebench_wire::{FrameError, encode_frame};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::SocketErrorKind;

/// Attempts a command gets before it is abandoned.
pub const RETRY_CEILING: u32 = 5;
/// Delay before re-pumping after the transport refused a write.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: CorrelationId,
    pub method: String,
    pub payload: Bytes,
    attempts: u32,
    pending_bytes: usize,
    sequence: u64,
}

impl Command {
    pub fn new(id: CorrelationId, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            method: method.into(),
            payload: payload.into(),
            attempts: 0,
            pending_bytes: 0,
            sequence: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Position in enqueue order, assigned by the queue.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Where encoded frames go.
pub trait FrameSink {
    /// Hands a complete frame to the transport.
    ///
    /// Returns the number of bytes the transport now owes a write
    /// confirmation for (possibly zero), or `None` when it cannot take
    /// writes at all, e.g. while not connected.
    fn write_frame(&mut self, frame: &[u8]) -> Option<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    RetryExhausted { attempts: u32 },
    Transport(SocketErrorKind),
    Malformed(FrameError),
    /// The id was never queued on this connection, or its outcome aged out.
    NotQueued,
}

impl FailureReason {
    /// The classification reported alongside the failure.
    pub fn kind(&self) -> SocketErrorKind {
        match self {
            FailureReason::RetryExhausted { .. } => SocketErrorKind::Refused,
            FailureReason::Transport(kind) => *kind,
            FailureReason::Malformed(_) => SocketErrorKind::ProtocolOrSecurityFailure,
            FailureReason::NotQueued => SocketErrorKind::Unknown,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetryExhausted { attempts } => {
                write!(f, "gave up after {attempts} attempts: {}", self.kind())
            }
            FailureReason::Transport(kind) => kind.fmt(f),
            FailureReason::Malformed(err) => write!(f, "command cannot be framed: {err}"),
            FailureReason::NotQueued => f.write_str("no such command on this connection"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Delivered(CorrelationId),
    Failed(CorrelationId, FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Nothing to do until an external trigger.
    Idle,
    /// Pump again at the next opportunity.
    Immediately,
    /// Pump again once the delay elapsed.
    After(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending { attempts: u32 },
    InFlight,
    Unknown,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<Command>,
    in_flight: Option<Command>,
    confirmed: usize,
    next_sequence: u64,
    last_delivered: Option<CorrelationId>,
    events: VecDeque<QueueEvent>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail. Never fails and never writes; the caller pumps
    /// on its next turn.
    pub fn enqueue(&mut self, mut command: Command) -> CorrelationId {
        command.sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = command.id;
        debug!(
            target = "livebench::ipc",
            %id,
            method = %command.method,
            bytes = command.payload.len(),
            "command queued"
        );
        self.pending.push_back(command);
        id
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref()
    }

    pub fn last_delivered(&self) -> Option<CorrelationId> {
        self.last_delivered
    }

    pub fn status(&self, id: CorrelationId) -> CommandStatus {
        if self.in_flight.as_ref().is_some_and(|cmd| cmd.id == id) {
            return CommandStatus::InFlight;
        }
        self.pending
            .iter()
            .find(|cmd| cmd.id == id)
            .map(|cmd| CommandStatus::Pending {
                attempts: cmd.attempts,
            })
            .unwrap_or(CommandStatus::Unknown)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = QueueEvent> + '_ {
        self.events.drain(..)
    }

    pub fn pump(&mut self, sink: &mut dyn FrameSink) -> Schedule {
        if self.in_flight.is_some() {
            return Schedule::Idle;
        }
        let Some(head) = self.pending.front_mut() else {
            return Schedule::Idle;
        };

        head.attempts += 1;
        if head.attempts >= RETRY_CEILING {
            let attempts = head.attempts;
            if let Some(command) = self.pending.pop_front() {
                warn!(
                    target = "livebench::ipc",
                    id = %command.id,
                    method = %command.method,
                    attempts,
                    "giving up on command"
                );
                self.fail(command.id, FailureReason::RetryExhausted { attempts });
            }
            return Schedule::Immediately;
        }

        let frame = match encode_frame(&head.method, &head.payload) {
            Ok(frame) => frame,
            Err(err) => {
                if let Some(command) = self.pending.pop_front() {
                    warn!(
                        target = "livebench::ipc",
                        id = %command.id,
                        error = %err,
                        "dropping command that cannot be framed"
                    );
                    self.fail(command.id, FailureReason::Malformed(err));
                }
                return Schedule::Immediately;
            }
        };

        match sink.write_frame(&frame) {
            Some(bytes) => {
                if let Some(mut command) = self.pending.pop_front() {
                    trace!(
                        target = "livebench::ipc",
                        id = %command.id,
                        attempt = command.attempts,
                        bytes,
                        "command handed to transport"
                    );
                    command.pending_bytes = bytes;
                    self.in_flight = Some(command);
                }
                Schedule::Idle
            }
            None => {
                debug!(
                    target = "livebench::ipc",
                    id = %head.id,
                    attempt = head.attempts,
                    "transport not writable; retrying later"
                );
                Schedule::After(RETRY_BACKOFF)
            }
        }
    }

    /// Credits `written` confirmed bytes against the in-flight command.
    pub fn on_bytes_written(&mut self, written: usize) -> Schedule {
        let Some(current) = self.in_flight.as_ref() else {
            trace!(
                target = "livebench::ipc",
                written,
                "write confirmation without a command in flight"
            );
            return Schedule::Idle;
        };

        self.confirmed += written;
        if self.confirmed < current.pending_bytes {
            return Schedule::Idle;
        }
        self.confirmed -= current.pending_bytes;

        let Some(done) = self.in_flight.take() else {
            return Schedule::Idle;
        };
        debug!(target = "livebench::ipc", id = %done.id, "command delivered");
        self.last_delivered = Some(done.id);
        self.events.push_back(QueueEvent::Delivered(done.id));
        Schedule::Immediately
    }

    /// Fails the in-flight command, if any, with the classified error.
    pub fn on_transport_error(&mut self, kind: SocketErrorKind) -> Schedule {
        let Some(current) = self.in_flight.take() else {
            return Schedule::Idle;
        };
        self.confirmed = 0;
        self.fail(current.id, FailureReason::Transport(kind));
        Schedule::Immediately
    }

    /// Connection teardown: the in-flight command fails as `Closed`.
    pub fn abort_in_flight(&mut self) -> Schedule {
        self.on_transport_error(SocketErrorKind::Closed)
    }

    /// Fails everything still owned by the queue, in order.
    pub fn fail_all(&mut self, kind: SocketErrorKind) {
        self.on_transport_error(kind);
        while let Some(command) = self.pending.pop_front() {
            self.fail(command.id, FailureReason::Transport(kind));
        }
    }

    fn fail(&mut self, id: CorrelationId, reason: FailureReason) {
        self.events.push_back(QueueEvent::Failed(id, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts every write, or refuses all of them while `refuse` is set.
    #[derive(Default)]
    struct ScriptedSink {
        refuse: bool,
        writes: Vec<Vec<u8>>,
        refused: usize,
    }

    impl FrameSink for ScriptedSink {
        fn write_frame(&mut self, frame: &[u8]) -> Option<usize> {
            if self.refuse {
                self.refused += 1;
                return None;
            }
            self.writes.push(frame.to_vec());
            Some(frame.len())
        }
    }

    fn command(method: &str, payload: &'static [u8]) -> Command {
        Command::new(CorrelationId::new(), method, Bytes::from_static(payload))
    }

    /// Runs the pump the way the driver does: immediately while asked to,
    /// and through backoff by simply pumping again.
    fn pump_until_idle(queue: &mut CommandQueue, sink: &mut ScriptedSink) -> Schedule {
        loop {
            match queue.pump(sink) {
                Schedule::Immediately => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn delivers_in_enqueue_order_one_at_a_time() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink::default();
        let ids: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|m| queue.enqueue(command(m, b"xy")))
            .collect();

        let mut delivered = Vec::new();
        for _ in 0..ids.len() {
            assert_eq!(queue.pump(&mut sink), Schedule::Idle);
            // A second trigger while in flight must not write again.
            assert_eq!(queue.pump(&mut sink), Schedule::Idle);
            assert_eq!(sink.writes.len(), delivered.len() + 1);
            assert_eq!(queue.status(ids[delivered.len()]), CommandStatus::InFlight);

            let len = sink.writes.last().unwrap().len();
            assert_eq!(queue.on_bytes_written(len), Schedule::Immediately);
            delivered.extend(queue.drain_events());
        }

        let expected: Vec<_> = ids.iter().map(|id| QueueEvent::Delivered(*id)).collect();
        assert_eq!(delivered, expected);
        assert_eq!(queue.last_delivered(), Some(ids[2]));
        assert!(queue.is_empty());
        let methods: Vec<_> = sink
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(&w[..8]).into_owned())
            .collect();
        assert_eq!(methods, ["Method:a", "Method:b", "Method:c"]);
    }

    #[test]
    fn refused_command_gets_four_writes_and_fails_on_fifth_pump() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink {
            refuse: true,
            ..Default::default()
        };
        let id = queue.enqueue(command("activateDocument", b"main.qml"));
        let follower = queue.enqueue(command("ping", b""));

        for attempt in 1..RETRY_CEILING {
            assert_eq!(queue.pump(&mut sink), Schedule::After(RETRY_BACKOFF));
            assert_eq!(queue.status(id), CommandStatus::Pending { attempts: attempt });
            assert_eq!(queue.drain_events().count(), 0);
        }
        assert_eq!(sink.refused, 4);

        // Fifth pump abandons it and asks to move on right away.
        assert_eq!(queue.pump(&mut sink), Schedule::Immediately);
        assert_eq!(sink.refused, 4);
        let events: Vec<_> = queue.drain_events().collect();
        assert_eq!(
            events,
            vec![QueueEvent::Failed(
                id,
                FailureReason::RetryExhausted { attempts: RETRY_CEILING }
            )]
        );
        assert_eq!(queue.status(id), CommandStatus::Unknown);

        // The next pump belongs to the following command, not a sixth try.
        assert_eq!(queue.pump(&mut sink), Schedule::After(RETRY_BACKOFF));
        assert_eq!(queue.status(follower), CommandStatus::Pending { attempts: 1 });
    }

    #[test]
    fn partial_confirmations_complete_exactly_once() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink::default();
        // "Method:m\nContent-Length:3\n\n" is 27 bytes, plus the payload.
        let id = queue.enqueue(command("m", b"abc"));
        queue.pump(&mut sink);
        assert_eq!(sink.writes[0].len(), 30);

        assert_eq!(queue.on_bytes_written(10), Schedule::Idle);
        assert_eq!(queue.on_bytes_written(5), Schedule::Idle);
        assert_eq!(queue.drain_events().count(), 0);
        assert_eq!(queue.on_bytes_written(15), Schedule::Immediately);
        assert_eq!(
            queue.drain_events().collect::<Vec<_>>(),
            vec![QueueEvent::Delivered(id)]
        );

        // Late confirmations with nothing in flight are ignored.
        assert_eq!(queue.on_bytes_written(30), Schedule::Idle);
        assert_eq!(queue.drain_events().count(), 0);
    }

    #[test]
    fn transport_error_fails_in_flight_and_unblocks_next() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink::default();
        let first = queue.enqueue(command("first", b"1"));
        let second = queue.enqueue(command("second", b"2"));

        queue.pump(&mut sink);
        queue.on_bytes_written(3);
        assert_eq!(
            queue.on_transport_error(SocketErrorKind::Timeout),
            Schedule::Immediately
        );
        assert_eq!(
            queue.drain_events().collect::<Vec<_>>(),
            vec![QueueEvent::Failed(
                first,
                FailureReason::Transport(SocketErrorKind::Timeout)
            )]
        );

        // Confirmation credit from the failed write must not leak forward.
        queue.pump(&mut sink);
        let len = sink.writes[1].len();
        assert_eq!(queue.on_bytes_written(len - 1), Schedule::Idle);
        queue.on_bytes_written(1);
        assert_eq!(
            queue.drain_events().collect::<Vec<_>>(),
            vec![QueueEvent::Delivered(second)]
        );
    }

    #[test]
    fn error_without_in_flight_command_is_a_no_op() {
        let mut queue = CommandQueue::new();
        queue.enqueue(command("waiting", b""));
        assert_eq!(
            queue.on_transport_error(SocketErrorKind::Refused),
            Schedule::Idle
        );
        assert_eq!(queue.drain_events().count(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn abort_and_fail_all_report_every_id_in_order() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink::default();
        let a = queue.enqueue(command("a", b""));
        let b = queue.enqueue(command("b", b""));
        let c = queue.enqueue(command("c", b""));
        queue.pump(&mut sink);

        queue.abort_in_flight();
        queue.fail_all(SocketErrorKind::Closed);
        let closed = FailureReason::Transport(SocketErrorKind::Closed);
        assert_eq!(
            queue.drain_events().collect::<Vec<_>>(),
            vec![
                QueueEvent::Failed(a, closed.clone()),
                QueueEvent::Failed(b, closed.clone()),
                QueueEvent::Failed(c, closed),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn unframeable_command_fails_without_blocking_the_queue() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink::default();
        let bad = queue.enqueue(command("bad\nmethod", b""));
        let good = queue.enqueue(command("good", b""));

        assert_eq!(pump_until_idle(&mut queue, &mut sink), Schedule::Idle);
        assert!(matches!(
            queue.drain_events().next(),
            Some(QueueEvent::Failed(id, FailureReason::Malformed(_))) if id == bad
        ));
        assert_eq!(queue.status(good), CommandStatus::InFlight);
        assert_eq!(sink.writes.len(), 1);
    }

    #[test]
    fn sequences_follow_enqueue_order() {
        let mut queue = CommandQueue::new();
        let mut sink = ScriptedSink::default();
        queue.enqueue(command("a", b""));
        queue.enqueue(command("b", b""));
        queue.pump(&mut sink);
        assert_eq!(queue.in_flight().map(Command::sequence), Some(0));
        assert_eq!(queue.in_flight().map(Command::attempts), Some(1));
    }
}
