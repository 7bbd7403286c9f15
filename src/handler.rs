use crate::client::spawn_keep_alive;
use crate::control::{ConnectAck, ControlPacket, Publish, SubscribeAck};
use crate::error::MqttError;
use crate::protocol::QoS;
use crate::state::{AckKind, ConnectionState, Correlation, Responder, Session};
use bytes::{Bytes, BytesMut};
use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Outbound half of a transport (TCP or WebSocket).
#[async_trait::async_trait]
pub trait WriteStream: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), MqttError>;
    async fn flush(&mut self) -> Result<(), MqttError>;
    async fn close(&mut self) -> Result<(), MqttError>;
}

/// Inbound half of a transport. `None` means the peer closed the stream.
#[async_trait::async_trait]
pub trait ReadStream: Send {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, MqttError>;
}

pub(crate) type SharedWriter = Arc<Mutex<Box<dyn WriteStream>>>;

#[async_trait::async_trait]
impl<T> WriteStream for tokio::io::WriteHalf<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> Result<(), MqttError> {
        AsyncWriteExt::write_all(self, data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), MqttError> {
        AsyncWriteExt::flush(self).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T> ReadStream for tokio::io::ReadHalf<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, MqttError> {
        let mut buf = BytesMut::with_capacity(4096);
        let read = self.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

#[async_trait::async_trait]
impl<S> WriteStream for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> Result<(), MqttError> {
        SinkExt::send(self, Message::Binary(data.to_vec())).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), MqttError> {
        SinkExt::flush(self).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S> ReadStream for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, MqttError> {
        loop {
            match self.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => warn!("Received non-binary WebSocket message"),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Serializes `packet` and writes it to the stream.
pub(crate) async fn send_packet(writer: &SharedWriter, packet: &ControlPacket) -> Result<(), MqttError> {
    debug!(packet = ?packet.kind(), "Sending packet to stream");
    let bytes = packet.build_packet()?;
    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// A packet received from the server, as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck { packet_id: u16 },
    PublishReceived { packet_id: u16 },
    PublishRelease { packet_id: u16 },
    PublishComplete { packet_id: u16 },
    SubscribeAck(SubscribeAck),
    UnsubscribeAck { packet_id: u16 },
    PingResponse,
    /// Inbound bytes could not be decoded.
    Invalid(String),
}

impl InboundEvent {
    fn from_packet(packet: ControlPacket) -> Option<InboundEvent> {
        match packet {
            ControlPacket::ConnectAck(ack) => Some(InboundEvent::ConnectAck(ack)),
            ControlPacket::PublishAck { packet_id } => Some(InboundEvent::PublishAck { packet_id }),
            ControlPacket::PublishReceived { packet_id } => Some(InboundEvent::PublishReceived { packet_id }),
            ControlPacket::PublishRelease { packet_id } => Some(InboundEvent::PublishRelease { packet_id }),
            ControlPacket::PublishComplete { packet_id } => Some(InboundEvent::PublishComplete { packet_id }),
            ControlPacket::SubscribeAck(ack) => Some(InboundEvent::SubscribeAck(ack)),
            ControlPacket::UnsubscribeAck { packet_id } => Some(InboundEvent::UnsubscribeAck { packet_id }),
            ControlPacket::PingResponse => Some(InboundEvent::PingResponse),
            ControlPacket::Publish(_)
            | ControlPacket::Connect(_)
            | ControlPacket::Subscribe(_)
            | ControlPacket::Unsubscribe(_)
            | ControlPacket::PingRequest
            | ControlPacket::Disconnect => None,
        }
    }
}

/// Reacts to one decoded inbound packet, then forwards it as an event.
///
/// PUBLISH is the exception: it must already have been handed to the
/// application through [`deliver_publish`], since handling it acknowledges
/// it to the server.
pub(crate) async fn handle_packet(session: &mut Session, packet: ControlPacket) {
    debug!(packet = ?packet.kind(), "Received packet");
    match &packet {
        ControlPacket::ConnectAck(ack) => handle_connect_ack(session, *ack).await,
        ControlPacket::Publish(publish) => handle_publish(session, publish).await,
        ControlPacket::PublishAck { packet_id } => {
            resolve(session, *packet_id, AckKind::PublishAck, Ok(()));
        }
        ControlPacket::PublishReceived { packet_id } => handle_publish_received(session, *packet_id).await,
        ControlPacket::PublishRelease { packet_id } => {
            reply(session, ControlPacket::PublishComplete { packet_id: *packet_id }).await;
        }
        ControlPacket::PublishComplete { packet_id } => {
            resolve(session, *packet_id, AckKind::PublishComplete, Ok(()));
        }
        ControlPacket::SubscribeAck(ack) => {
            let outcome = if ack.return_code == SubscribeAck::FAILURE {
                Err(MqttError::SubscriptionRefused {
                    packet_id: ack.packet_id,
                })
            } else {
                debug!(packet_id = ack.packet_id, granted = ?ack.granted_qos(), "Subscription successful");
                Ok(())
            };
            resolve(session, ack.packet_id, AckKind::SubscribeAck, outcome);
        }
        ControlPacket::UnsubscribeAck { packet_id } => {
            debug!(packet_id, "Unsubscription successful");
            resolve(session, *packet_id, AckKind::UnsubscribeAck, Ok(()));
        }
        ControlPacket::PingResponse => {}
        other => warn!("Unexpected {:?} packet from server", other.kind()),
    }

    if let Some(event) = InboundEvent::from_packet(packet) {
        session.emit(event);
    }
}

/// Hands an inbound PUBLISH to the application, waiting while the event
/// channel is full. Returns `false` if the receiver has gone away.
pub(crate) async fn deliver_publish(events: &mpsc::Sender<InboundEvent>, publish: &Publish) -> bool {
    events.send(InboundEvent::Publish(publish.clone())).await.is_ok()
}

/// Reports bytes the framer could not decode.
pub(crate) fn handle_invalid(session: &mut Session, error: MqttError) {
    warn!("Invalid packet: {}", error);
    session.emit(InboundEvent::Invalid(error.to_string()));
}

async fn handle_connect_ack(session: &mut Session, ack: ConnectAck) {
    let Some(pending) = session.pending_connect.take() else {
        warn!("CONNACK received without a pending connect");
        return;
    };
    debug!(status_code = ack.status_code, "Received CONNACK");

    if !ack.connected() {
        session.teardown().await;
        let _ = pending.responder.send(Err(MqttError::ConnectionRejected {
            status: ack.status_code,
            reason: ack.reason().to_string(),
        }));
        return;
    }

    session.set_state(ConnectionState::Connected);
    if pending.keep_alive > 0 {
        if let Some(writer) = session.writer.clone() {
            session.keep_alive = Some(spawn_keep_alive(
                writer,
                session.state.subscribe(),
                pending.keep_alive,
            ));
        }
    }
    let _ = pending.responder.send(Ok(()));
}

async fn handle_publish(session: &mut Session, publish: &Publish) {
    let ack = match (publish.qos, publish.packet_id) {
        (QoS::AtLeastOnce, Some(packet_id)) => ControlPacket::PublishAck { packet_id },
        (QoS::ExactlyOnce, Some(packet_id)) => ControlPacket::PublishReceived { packet_id },
        _ => return,
    };
    reply(session, ack).await;
}

async fn handle_publish_received(session: &mut Session, packet_id: u16) {
    // a retransmitted PUBREC gets its PUBREL again
    if session.pending.is_waiting(packet_id, AckKind::PublishComplete) {
        debug!(packet_id, "Repeated PUBREC, releasing again");
        reply(session, ControlPacket::PublishRelease { packet_id }).await;
        return;
    }
    if session.pending.was_resolved(packet_id, AckKind::PublishComplete) {
        debug!(packet_id, "PUBREC after PUBCOMP ignored");
        return;
    }

    let responder = match session.pending.take(packet_id, AckKind::PublishReceived) {
        Correlation::Matched(responder) => responder,
        other => {
            report_mismatch(other, packet_id, AckKind::PublishReceived);
            return;
        }
    };
    debug!(packet_id, "QoS 2 publish received by server, releasing");

    let released = match session.writer.clone() {
        Some(writer) => send_packet(&writer, &ControlPacket::PublishRelease { packet_id }).await,
        None => Err(MqttError::ConnectionClosed),
    };
    match released {
        Ok(()) if session.await_publish_complete => {
            session.pending.insert(packet_id, AckKind::PublishComplete, responder);
        }
        Ok(()) => {
            if let Some(responder) = responder {
                let _ = responder.send(Ok(()));
            }
            session.pending.insert(packet_id, AckKind::PublishComplete, None);
        }
        Err(e) => {
            if let Some(responder) = responder {
                let _ = responder.send(Err(e));
            }
        }
    }
}

fn resolve(session: &mut Session, packet_id: u16, kind: AckKind, outcome: Result<(), MqttError>) {
    match session.pending.take(packet_id, kind) {
        Correlation::Matched(responder) => {
            debug!(packet_id, ?kind, in_flight = session.pending.len(), "Acknowledged");
            if let Some(responder) = responder {
                let _ = responder.send(outcome);
            }
        }
        other => report_mismatch(other, packet_id, kind),
    }
}

fn report_mismatch(correlation: Correlation, received: u16, kind: AckKind) {
    match correlation {
        Correlation::Mismatched { expected, responder } => {
            warn!("{:?} has wrong packetId: expected {}, received {}", kind, expected, received);
            fail(responder, MqttError::CorrelationMismatch { expected, received });
        }
        Correlation::Duplicate => debug!("Duplicate {:?} for packetId {} ignored", kind, received),
        Correlation::Unsolicited => warn!("Unsolicited {:?} for packetId {}", kind, received),
        Correlation::Matched(_) => {}
    }
}

fn fail(responder: Option<Responder>, error: MqttError) {
    if let Some(responder) = responder {
        let _ = responder.send(Err(error));
    }
}

async fn reply(session: &mut Session, packet: ControlPacket) {
    let Some(writer) = session.writer.clone() else {
        return;
    };
    if let Err(e) = send_packet(&writer, &packet).await {
        warn!("Error sending {:?}: {}", packet.kind(), e);
    }
}
