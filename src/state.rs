use crate::error::MqttError;
use crate::framer::StreamFramer;
use crate::handler::{InboundEvent, SharedWriter};
use crate::protocol::{ClientIdGenerator, ProtocolVersion};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of the connection driven by a [`crate::Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initiated,
    Connecting,
    Connected,
    Disconnected,
}

/// The acknowledgement a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    SubscribeAck,
    UnsubscribeAck,
    PublishAck,
    PublishReceived,
    PublishComplete,
}

pub(crate) type Responder = oneshot::Sender<Result<(), MqttError>>;

struct PendingOperation {
    kind: AckKind,
    responder: Option<Responder>,
}

// how many resolved (id, kind) pairs are remembered to recognise duplicates
const COMPLETED_HISTORY: usize = 32;

/// Outcome of matching an inbound acknowledgement against the table.
pub(crate) enum Correlation {
    Matched(Option<Responder>),
    /// The id is unknown and exactly one operation waits for this kind of
    /// acknowledgement; it was removed and must be failed.
    Mismatched {
        expected: u16,
        responder: Option<Responder>,
    },
    /// The same acknowledgement already resolved an operation.
    Duplicate,
    Unsolicited,
}

/// In-flight requests keyed by packet identifier.
#[derive(Default)]
pub(crate) struct PendingOperations {
    operations: HashMap<u16, PendingOperation>,
    completed: VecDeque<(u16, AckKind)>,
}

impl PendingOperations {
    pub fn insert(&mut self, packet_id: u16, kind: AckKind, responder: Option<Responder>) {
        self.completed.retain(|(id, _)| *id != packet_id);
        let previous = self
            .operations
            .insert(packet_id, PendingOperation { kind, responder });
        if let Some(previous) = previous {
            warn!("Packet id {} reused while still in flight", packet_id);
            if let Some(responder) = previous.responder {
                let _ = responder.send(Err(MqttError::CorrelationMismatch {
                    expected: packet_id,
                    received: packet_id,
                }));
            }
        }
    }

    pub fn remove(&mut self, packet_id: u16) {
        self.operations.remove(&packet_id);
    }

    /// Whether `packet_id` is currently waiting for `kind`.
    pub fn is_waiting(&self, packet_id: u16, kind: AckKind) -> bool {
        self.operations.get(&packet_id).map(|op| op.kind) == Some(kind)
    }

    /// Whether `packet_id` was recently resolved by `kind`.
    pub fn was_resolved(&self, packet_id: u16, kind: AckKind) -> bool {
        self.completed.contains(&(packet_id, kind))
    }

    pub fn take(&mut self, packet_id: u16, kind: AckKind) -> Correlation {
        if self.is_waiting(packet_id, kind) {
            if let Some(operation) = self.operations.remove(&packet_id) {
                self.completed.push_back((packet_id, kind));
                if self.completed.len() > COMPLETED_HISTORY {
                    self.completed.pop_front();
                }
                return Correlation::Matched(operation.responder);
            }
        }

        if self.was_resolved(packet_id, kind) {
            return Correlation::Duplicate;
        }

        // only a lone outstanding request can be blamed for an unknown id
        let mut candidates = self
            .operations
            .iter()
            .filter(|(_, op)| op.kind == kind)
            .map(|(id, _)| *id);
        let expected = match (candidates.next(), candidates.next()) {
            (Some(expected), None) => expected,
            _ => return Correlation::Unsolicited,
        };

        match self.operations.remove(&expected) {
            Some(operation) => Correlation::Mismatched {
                expected,
                responder: operation.responder,
            },
            None => Correlation::Unsolicited,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Fails every pending operation; used when the stream goes away.
    /// Returns how many were still outstanding.
    pub fn fail_all(&mut self) -> usize {
        let outstanding = self.operations.len();
        for (_, operation) in self.operations.drain() {
            if let Some(responder) = operation.responder {
                let _ = responder.send(Err(MqttError::ConnectionClosed));
            }
        }
        self.completed.clear();
        outstanding
    }
}

pub(crate) struct PendingConnect {
    pub responder: Responder,
    pub keep_alive: u16,
}

/// Everything owned by one client for the lifetime of a connection.
pub(crate) struct Session {
    pub version: ProtocolVersion,
    pub framer: StreamFramer,
    pub state: watch::Sender<ConnectionState>,
    pub writer: Option<SharedWriter>,
    /// Bumped on every connect so tasks from an older stream can tell they
    /// are stale.
    pub epoch: u64,
    pub pending_connect: Option<PendingConnect>,
    pub pending: PendingOperations,
    pub keep_alive: Option<JoinHandle<()>>,
    pub reader: Option<JoinHandle<()>>,
    pub events: Option<mpsc::Sender<InboundEvent>>,
    pub event_capacity: usize,
    pub await_publish_complete: bool,
}

impl Session {
    pub fn new(
        generator: Box<dyn ClientIdGenerator>,
        event_capacity: usize,
        await_publish_complete: bool,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Initiated);
        let session = Session {
            version: ProtocolVersion::new(generator),
            framer: StreamFramer::new(),
            state,
            writer: None,
            epoch: 0,
            pending_connect: None,
            pending: PendingOperations::default(),
            keep_alive: None,
            reader: None,
            events: None,
            event_capacity,
            await_publish_complete,
        };
        (session, state_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    /// Resets per-connection state for a freshly opened stream and returns
    /// the new epoch.
    pub fn start(&mut self, writer: SharedWriter) -> u64 {
        self.epoch += 1;
        self.framer.reset();
        self.version.reset();
        self.pending.fail_all();
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.abort();
        }
        self.writer = Some(writer);
        self.epoch
    }

    /// The writer of the live connection `epoch`, if it is usable for requests.
    pub fn connected_writer(&self, epoch: u64) -> Result<SharedWriter, MqttError> {
        match (&self.writer, self.state()) {
            (Some(writer), ConnectionState::Connected) if self.epoch == epoch => Ok(writer.clone()),
            _ => Err(MqttError::ConnectionUnavailable),
        }
    }

    /// Forwards an inbound event to the application, if it asked for them.
    pub fn emit(&mut self, event: InboundEvent) {
        let Some(events) = &self.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.events = None;
            }
        }
    }

    /// Leaves the connection: state becomes `Disconnected`, the keep-alive
    /// stops, pending operations fail and the transport is closed.
    pub async fn teardown(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.abort();
        }
        if let Some(connect) = self.pending_connect.take() {
            let _ = connect.responder.send(Err(MqttError::ConnectionClosed));
        }
        let stale = self.pending.fail_all();
        if stale > 0 {
            debug!("{} pending operations dropped at teardown", stale);
        }
        if let Some(writer) = self.writer.take() {
            let mut writer = writer.lock().await;
            if let Err(e) = writer.close().await {
                debug!("Error closing stream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_ack_resolves_its_own_operation() {
        let mut pending = PendingOperations::default();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(7, AckKind::SubscribeAck, Some(tx));

        match pending.take(7, AckKind::SubscribeAck) {
            Correlation::Matched(Some(responder)) => responder.send(Ok(())).unwrap(),
            _ => panic!("expected a match"),
        }
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unknown_id_fails_a_lone_operation_of_that_kind() {
        let mut pending = PendingOperations::default();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(1, AckKind::PublishAck, None);
        pending.insert(2, AckKind::SubscribeAck, Some(tx));

        match pending.take(9, AckKind::SubscribeAck) {
            Correlation::Mismatched { expected, responder } => {
                assert_eq!(expected, 2);
                responder.unwrap().send(Err(MqttError::ConnectionClosed)).unwrap();
            }
            _ => panic!("expected a mismatch"),
        }
        assert!(rx.try_recv().unwrap().is_err());
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending.take(5, AckKind::UnsubscribeAck), Correlation::Unsolicited));
    }

    #[test]
    fn unknown_id_is_dropped_while_several_are_in_flight() {
        let mut pending = PendingOperations::default();
        pending.insert(2, AckKind::SubscribeAck, None);
        pending.insert(3, AckKind::SubscribeAck, None);

        assert!(matches!(pending.take(9, AckKind::SubscribeAck), Correlation::Unsolicited));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn repeated_ack_is_a_duplicate() {
        let mut pending = PendingOperations::default();
        pending.insert(1, AckKind::PublishAck, None);
        pending.insert(2, AckKind::PublishAck, None);

        assert!(matches!(pending.take(1, AckKind::PublishAck), Correlation::Matched(_)));
        assert!(matches!(pending.take(1, AckKind::PublishAck), Correlation::Duplicate));
        assert!(pending.is_waiting(2, AckKind::PublishAck));
        assert!(matches!(pending.take(2, AckKind::PublishAck), Correlation::Matched(_)));
    }

    #[test]
    fn reusing_an_id_forgets_its_history() {
        let mut pending = PendingOperations::default();
        pending.insert(1, AckKind::PublishAck, None);
        assert!(matches!(pending.take(1, AckKind::PublishAck), Correlation::Matched(_)));
        pending.insert(1, AckKind::PublishAck, None);
        assert!(matches!(pending.take(1, AckKind::PublishAck), Correlation::Matched(_)));
    }

    #[test]
    fn completed_exchange_is_remembered() {
        let mut pending = PendingOperations::default();
        pending.insert(5, AckKind::PublishReceived, None);
        assert!(matches!(pending.take(5, AckKind::PublishReceived), Correlation::Matched(_)));
        pending.insert(5, AckKind::PublishComplete, None);
        assert!(matches!(pending.take(5, AckKind::PublishComplete), Correlation::Matched(_)));

        assert!(pending.was_resolved(5, AckKind::PublishComplete));
        assert!(!pending.was_resolved(5, AckKind::PublishReceived));
    }

    #[test]
    fn same_id_with_other_kind_does_not_match() {
        let mut pending = PendingOperations::default();
        pending.insert(4, AckKind::PublishReceived, None);
        assert!(matches!(pending.take(4, AckKind::PublishAck), Correlation::Unsolicited));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn fail_all_reports_connection_closed() {
        let mut pending = PendingOperations::default();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(1, AckKind::UnsubscribeAck, Some(tx));
        pending.insert(2, AckKind::PublishComplete, None);
        assert_eq!(pending.fail_all(), 2);
        assert!(matches!(rx.try_recv().unwrap(), Err(MqttError::ConnectionClosed)));
        assert_eq!(pending.len(), 0);
    }
}
