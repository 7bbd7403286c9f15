use crate::control::ControlPacket;
use crate::error::MqttError;
use crate::handler::{
    deliver_publish, handle_invalid, handle_packet, send_packet, ReadStream, SharedWriter, WriteStream,
};
use crate::state::{ConnectionState, Session};
use futures_util::stream::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

pub(crate) type Transport = (Box<dyn ReadStream>, Box<dyn WriteStream>);

/// Opens the transport named by `uri`.
///
/// `tcp://`, `mqtt://` and a bare `host:port` connect over TCP, `ws://`
/// opens a WebSocket speaking the `mqtt` sub-protocol.
pub(crate) async fn open_transport(uri: &str) -> Result<Transport, MqttError> {
    match uri.split_once("://") {
        Some(("tcp" | "mqtt", address)) => open_tcp(address).await,
        Some(("ws", _)) => open_websocket(uri).await,
        Some((scheme, _)) => Err(MqttError::UnsupportedScheme(scheme.to_string())),
        None => open_tcp(uri).await,
    }
}

async fn open_tcp(address: &str) -> Result<Transport, MqttError> {
    let address = address.trim_end_matches('/');
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    debug!("TCP connection to {} established", address);
    Ok(split_stream(stream))
}

async fn open_websocket(uri: &str) -> Result<Transport, MqttError> {
    let mut request = uri.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
    let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
    debug!("WebSocket connection to {} established", uri);
    let (sink, stream) = ws_stream.split();
    let reader: Box<dyn ReadStream> = Box::new(stream);
    let writer: Box<dyn WriteStream> = Box::new(sink);
    Ok((reader, writer))
}

/// Splits any byte stream into boxed read and write halves.
pub(crate) fn split_stream<S>(stream: S) -> Transport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let reader: Box<dyn ReadStream> = Box::new(reader);
    let writer: Box<dyn WriteStream> = Box::new(writer);
    (reader, writer)
}

/// Reads the stream of connection `epoch` until it closes, feeding every
/// chunk through the framer and dispatching the decoded packets in order.
pub(crate) fn spawn_reader(
    session: Arc<Mutex<Session>>,
    epoch: u64,
    mut reader: Box<dyn ReadStream>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let chunk = reader.read_chunk().await;
            {
                let mut session = session.lock().await;
                if session.epoch != epoch {
                    debug!("Reader for stale connection {} exiting", epoch);
                    break;
                }
                match chunk {
                    Ok(Some(data)) => session.framer.push(&data),
                    Ok(None) => {
                        info!("Stream was closed");
                        session.reader.take();
                        session.teardown().await;
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading from stream: {}", e);
                        session.reader.take();
                        session.teardown().await;
                        break;
                    }
                }
            }
            if !dispatch(&session, epoch).await {
                break;
            }
        }
    })
}

/// Handles every complete packet buffered so far. Returns `false` once the
/// connection `epoch` is no longer live.
async fn dispatch(session: &Mutex<Session>, epoch: u64) -> bool {
    loop {
        let mut guard = session.lock().await;
        if guard.epoch != epoch {
            return false;
        }
        let next = guard.framer.drain().next();
        match next {
            Some(Ok(ControlPacket::Publish(publish))) => {
                // delivered before it is acknowledged, with the session unlocked
                if let Some(events) = guard.events.clone() {
                    drop(guard);
                    let delivered = deliver_publish(&events, &publish).await;
                    guard = session.lock().await;
                    if guard.epoch != epoch {
                        return false;
                    }
                    if !delivered && guard.events.as_ref().is_some_and(|e| e.same_channel(&events)) {
                        debug!("Event receiver dropped");
                        guard.events = None;
                    }
                }
                handle_packet(&mut guard, ControlPacket::Publish(publish)).await;
            }
            Some(Ok(packet)) => handle_packet(&mut guard, packet).await,
            Some(Err(e)) => {
                handle_invalid(&mut guard, e);
                return true;
            }
            None => return true,
        }
    }
}

/// Sends a PINGREQ every `seconds` while the connection stays `Connected`.
pub(crate) fn spawn_keep_alive(
    writer: SharedWriter,
    mut state: watch::Receiver<ConnectionState>,
    seconds: u16,
) -> JoinHandle<()> {
    let period = Duration::from_secs(u64::from(seconds));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let connected = *state.borrow() == ConnectionState::Connected;
                    if !connected {
                        break;
                    }
                    if let Err(e) = send_packet(&writer, &ControlPacket::PingRequest).await {
                        warn!("Keep-alive ping failed: {}", e);
                        break;
                    }
                }
                changed = state.changed() => {
                    let connected = *state.borrow() == ConnectionState::Connected;
                    if changed.is_err() || !connected {
                        break;
                    }
                }
            }
        }
        debug!("Keep-alive stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        match open_transport("ssl://localhost:8883").await {
            Err(MqttError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "ssl"),
            _ => panic!("expected an unsupported scheme"),
        }
    }

    #[tokio::test]
    async fn bare_address_connects_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            listener.accept().await.unwrap();
            listener.accept().await.unwrap();
        });
        assert!(open_transport(&address.to_string()).await.is_ok());
        assert!(open_transport(&format!("mqtt://{}/", address)).await.is_ok());
        accept.await.unwrap();
    }
}
