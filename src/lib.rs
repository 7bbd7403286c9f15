mod client;
pub mod control;
mod error;
pub mod framer;
mod handler;
mod options;
pub mod packet;
pub mod protocol;
mod state;

pub use control::{ConnectAck, ControlPacket, Publish, SubscribeAck};
pub use error::MqttError;
pub use handler::{InboundEvent, ReadStream, WriteStream};
pub use options::{ConnectionOptions, Will};
pub use protocol::{ClientIdGenerator, QoS, RandomClientIdGenerator, StrictClientIdGenerator};
pub use state::ConnectionState;

use bytes::Bytes;
use client::{open_transport, spawn_reader, split_stream, Transport};
use handler::{send_packet, SharedWriter};
use state::{AckKind, PendingConnect, Session};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info};

/// Configuration shared by every connection a [`Client`] makes.
pub struct ClientConfig {
    generator: Box<dyn ClientIdGenerator>,
    event_capacity: usize,
    await_publish_complete: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            generator: Box::new(StrictClientIdGenerator),
            event_capacity: 100,
            await_publish_complete: false,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the generator used when a connection has no client id.
    pub fn with_client_id_generator<G>(mut self, generator: G) -> Self
    where
        G: ClientIdGenerator + 'static,
    {
        self.generator = Box::new(generator);
        self
    }

    /// Sets the capacity of the channel returned by [`Client::events`].
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Makes QoS 2 publishes resolve on PUBCOMP instead of once PUBREL is
    /// written.
    pub fn with_await_publish_complete(mut self, await_publish_complete: bool) -> Self {
        self.await_publish_complete = await_publish_complete;
        self
    }
}

/// Handle to one established connection, returned by [`Client::connect`]
/// and handed back by every other operation.
#[derive(Debug, Clone)]
pub struct Connection {
    epoch: u64,
    peer: String,
}

impl Connection {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// An MQTT 3.1.1 client driving a single connection at a time.
#[derive(Clone)]
pub struct Client {
    session: Arc<Mutex<Session>>,
    state: watch::Receiver<ConnectionState>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let (session, state) = Session::new(
            config.generator,
            config.event_capacity,
            config.await_publish_complete,
        );
        Client {
            session: Arc::new(Mutex::new(session)),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver notified on every connection state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Starts forwarding inbound packets as [`InboundEvent`]s. Calling it
    /// again replaces the previous receiver.
    pub async fn events(&self) -> mpsc::Receiver<InboundEvent> {
        let mut session = self.session.lock().await;
        let (tx, rx) = mpsc::channel(session.event_capacity);
        session.events = Some(tx);
        rx
    }

    /// Opens the transport for `uri` and performs the CONNECT handshake.
    pub async fn connect(
        &self,
        uri: &str,
        options: Option<ConnectionOptions>,
    ) -> Result<Connection, MqttError> {
        self.begin_connect().await?;
        info!("Connecting to {}", uri);
        let transport = match open_transport(uri).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Connection error: {}", e);
                self.session.lock().await.set_state(ConnectionState::Disconnected);
                return Err(match e {
                    scheme @ MqttError::UnsupportedScheme(_) => scheme,
                    other => MqttError::ConnectionException(other.to_string()),
                });
            }
        };
        self.handshake(uri.to_string(), transport, options.unwrap_or_default())
            .await
    }

    /// Performs the CONNECT handshake over an already open byte stream.
    pub async fn connect_stream<S>(
        &self,
        stream: S,
        options: Option<ConnectionOptions>,
    ) -> Result<Connection, MqttError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connect().await?;
        self.handshake("stream".to_string(), split_stream(stream), options.unwrap_or_default())
            .await
    }

    async fn begin_connect(&self) -> Result<(), MqttError> {
        let session = self.session.lock().await;
        match session.state() {
            ConnectionState::Connecting | ConnectionState::Connected => Err(MqttError::AlreadyConnected),
            _ => {
                session.set_state(ConnectionState::Connecting);
                Ok(())
            }
        }
    }

    async fn handshake(
        &self,
        peer: String,
        (reader, writer): Transport,
        options: ConnectionOptions,
    ) -> Result<Connection, MqttError> {
        let (tx, rx) = oneshot::channel();
        let epoch = {
            let mut session = self.session.lock().await;
            let writer: SharedWriter = Arc::new(Mutex::new(writer));
            let epoch = session.start(writer.clone());
            if let Some(previous) = session.reader.take() {
                previous.abort();
            }

            let connect = session.version.connect(&options);
            session.pending_connect = Some(PendingConnect {
                responder: tx,
                keep_alive: options.keep_alive,
            });
            if let Err(e) = send_packet(&writer, &ControlPacket::Connect(connect)).await {
                error!("Connection error: {}", e);
                session.teardown().await;
                return Err(MqttError::ConnectionException(e.to_string()));
            }
            session.reader = Some(spawn_reader(self.session.clone(), epoch, reader));
            epoch
        };

        match rx.await {
            Ok(Ok(())) => {
                info!("Connected to {}", peer);
                Ok(Connection { epoch, peer })
            }
            Ok(Err(e)) => {
                error!("Connection to {} failed: {}", peer, e);
                Err(e)
            }
            Err(_) => Err(MqttError::ConnectionClosed),
        }
    }

    /// Subscribes to a single topic filter, resolving on the matching SUBACK.
    pub async fn subscribe(
        &self,
        connection: &Connection,
        topic: &str,
        qos: QoS,
    ) -> Result<Connection, MqttError> {
        let (writer, packet, response) = {
            let mut session = self.session.lock().await;
            let writer = session.connected_writer(connection.epoch)?;
            let subscribe = session.version.subscribe(topic, qos);
            let (tx, rx) = oneshot::channel();
            session
                .pending
                .insert(subscribe.packet_id, AckKind::SubscribeAck, Some(tx));
            (writer, ControlPacket::Subscribe(subscribe), rx)
        };
        self.request(writer, packet, response).await?;
        info!("Subscribed to {}", topic);
        Ok(connection.clone())
    }

    /// Unsubscribes from a single topic filter, resolving on the matching
    /// UNSUBACK.
    pub async fn unsubscribe(&self, connection: &Connection, topic: &str) -> Result<Connection, MqttError> {
        let (writer, packet, response) = {
            let mut session = self.session.lock().await;
            let writer = session.connected_writer(connection.epoch)?;
            let unsubscribe = session.version.unsubscribe(topic);
            let (tx, rx) = oneshot::channel();
            session
                .pending
                .insert(unsubscribe.packet_id, AckKind::UnsubscribeAck, Some(tx));
            (writer, ControlPacket::Unsubscribe(unsubscribe), rx)
        };
        self.request(writer, packet, response).await?;
        info!("Unsubscribed from {}", topic);
        Ok(connection.clone())
    }

    /// Publishes a message.
    ///
    /// QoS 0 resolves once written, QoS 1 on the matching PUBACK, and QoS 2
    /// once PUBREL has been sent in answer to the matching PUBREC (or on
    /// PUBCOMP, see [`ClientConfig::with_await_publish_complete`]).
    pub async fn publish(
        &self,
        connection: &Connection,
        topic: &str,
        message: impl Into<Bytes>,
        qos: QoS,
        dup: bool,
        retain: bool,
    ) -> Result<Connection, MqttError> {
        let (writer, packet, response) = {
            let mut session = self.session.lock().await;
            let writer = session.connected_writer(connection.epoch)?;
            let publish = session.version.publish(topic, message.into(), qos, dup, retain);
            let ack = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(AckKind::PublishAck),
                QoS::ExactlyOnce => Some(AckKind::PublishReceived),
            };
            let response = match (ack, publish.packet_id) {
                (Some(kind), Some(packet_id)) => {
                    let (tx, rx) = oneshot::channel();
                    session.pending.insert(packet_id, kind, Some(tx));
                    Some(rx)
                }
                _ => None,
            };
            (writer, ControlPacket::Publish(publish), response)
        };

        match response {
            Some(response) => self.request(writer, packet, response).await?,
            None => send_packet(&writer, &packet).await?,
        }
        Ok(connection.clone())
    }

    /// Sends DISCONNECT and closes the transport. Always resolves, also when
    /// the connection is already gone.
    pub async fn disconnect(&self, connection: &Connection) -> Connection {
        let mut session = self.session.lock().await;
        if session.epoch != connection.epoch {
            return connection.clone();
        }
        if let Some(writer) = session.writer.clone() {
            if let Err(e) = send_packet(&writer, &ControlPacket::Disconnect).await {
                debug!("Error sending DISCONNECT: {}", e);
            }
        }
        if let Some(reader) = session.reader.take() {
            reader.abort();
        }
        session.teardown().await;
        info!("Disconnected from {}", connection.peer);
        connection.clone()
    }

    /// Writes a correlated request and waits for its acknowledgement. The
    /// pending entry must already be registered under the packet's id.
    async fn request(
        &self,
        writer: SharedWriter,
        packet: ControlPacket,
        response: oneshot::Receiver<Result<(), MqttError>>,
    ) -> Result<(), MqttError> {
        if let Err(e) = send_packet(&writer, &packet).await {
            if let Some(packet_id) = packet.packet_id() {
                self.session.lock().await.pending.remove(packet_id);
            }
            return Err(e);
        }
        response.await.unwrap_or(Err(MqttError::ConnectionClosed))
    }
}
