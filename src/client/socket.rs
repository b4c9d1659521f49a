//! WebSocket transport and the receive loop
//!
//! One socket, one receive loop. The loop is the only reader: it pulls the
//! 8-byte headers off the stream, re-reads them when the length was only
//! estimated, and routes each payload either to the pending command or to
//! the unsolicited state decoders. Everything it cannot classify is skipped
//! unread so the stream stays in sync.
//!
//! Frame boundaries on the wire do not line up with WebSocket message
//! boundaries; [`FrameReader`] buffers message bytes so headers and payloads
//! can be consumed exactly.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::command::{LxResponse, PendingCommand, PendingSlot};
use crate::client::message::{
    decode_text_states, decode_value_states, MessageHeader, MessageIdentifier, HEADER_LEN,
};
use crate::config::ConnectionConfig;
use crate::crypto::{CommandEncryption, Encryptor};
use crate::error::{LoxoneError, Result};
use crate::events::EventRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Invoked by the receive loop when it dies of a fault.
pub(crate) type FaultHandler = Arc<dyn Fn(LoxoneError) + Send + Sync>;

const WS_SUBPROTOCOL: &str = "remotecontrol";
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Buffers WebSocket message bytes into one readable stream.
///
/// Text and binary messages both contribute payload bytes; ping/pong frames
/// are transparent. A close frame or the end of the stream while bytes are
/// still owed is a transport error.
pub(crate) struct FrameReader<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> FrameReader<S>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        loop {
            match self.stream.next().await {
                None => return Err(LoxoneError::transport("socket closed mid-stream")),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Binary(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                    return Ok(());
                }
                Some(Ok(Message::Text(text))) => {
                    self.buffer.extend_from_slice(text.as_bytes());
                    return Ok(());
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(LoxoneError::transport("connection closed by the Miniserver"))
                }
                Some(Ok(_)) => continue, // ping/pong/raw frames carry no payload bytes
            }
        }
    }

    /// Read exactly `count` bytes, crossing message boundaries as needed.
    pub(crate) async fn read_exact(&mut self, count: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < count {
            self.fill().await?;
        }
        Ok(self.buffer.split_to(count).to_vec())
    }

    /// Discard exactly `count` bytes without materializing them.
    pub(crate) async fn skip(&mut self, count: usize) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            if self.buffer.is_empty() {
                self.fill().await?;
            }
            let take = remaining.min(self.buffer.len());
            self.buffer.advance(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Read the next frame header, following the two-stage length encoding:
    /// an estimated-length header is immediately followed by one carrying
    /// the authoritative length.
    pub(crate) async fn read_header(&mut self) -> Result<MessageHeader> {
        let bytes: [u8; HEADER_LEN] = self
            .read_exact(HEADER_LEN)
            .await?
            .try_into()
            .expect("read_exact returned the requested length");
        let header = MessageHeader::parse(&bytes)?;
        if !header.is_length_estimated() {
            return Ok(header);
        }

        let bytes: [u8; HEADER_LEN] = self
            .read_exact(HEADER_LEN)
            .await?
            .try_into()
            .expect("read_exact returned the requested length");
        MessageHeader::parse(&bytes)
    }
}

/// Owns the WebSocket and the single receive loop.
pub(crate) struct TransportSocket {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: PendingSlot,
    loop_token: CancellationToken,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
    keep_alive_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl TransportSocket {
    /// Connect the WebSocket and start the receive loop.
    ///
    /// The loop's cancellation token is a child of `connection_token`, so
    /// cancelling the connection scope unwinds the loop.
    pub(crate) async fn connect(
        config: &ConnectionConfig,
        router: Arc<EventRouter>,
        connection_token: &CancellationToken,
        on_fault: FaultHandler,
    ) -> Result<Arc<Self>> {
        let url = config.address.ws_url()?;
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_SUBPROTOCOL));

        let (ws, _response) = tokio::select! {
            biased;
            _ = connection_token.cancelled() => return Err(LoxoneError::Cancelled),
            connected = connect_async(request) => connected?,
        };
        debug!(%url, "websocket connected");

        let (sink, stream) = ws.split();
        let socket = Arc::new(Self {
            sink: Mutex::new(sink),
            pending: PendingSlot::default(),
            loop_token: connection_token.child_token(),
            loop_handle: StdMutex::new(None),
            keep_alive_handle: StdMutex::new(None),
        });

        let handle = tokio::spawn(receive_loop(
            FrameReader::new(stream),
            Arc::clone(&socket),
            router,
            on_fault,
        ));
        *socket.loop_handle.lock().expect("loop handle poisoned") = Some(handle);

        if !config.keep_alive.is_zero() {
            socket.spawn_keep_alive(config.keep_alive);
        }

        Ok(socket)
    }

    /// Send a command and await its parsed JSON response envelope.
    pub(crate) async fn request_command(
        &self,
        command: &str,
        encryptor: Option<Arc<Encryptor>>,
    ) -> Result<LxResponse> {
        let raw = self.request_raw(command, encryptor).await?;
        LxResponse::parse(&raw)
    }

    /// Send a command and await its raw text response (structure file).
    pub(crate) async fn request_string(&self, command: &str) -> Result<String> {
        self.request_raw(command, None).await
    }

    async fn request_raw(&self, command: &str, encryptor: Option<Arc<Encryptor>>) -> Result<String> {
        if self.loop_token.is_cancelled() {
            return Err(LoxoneError::Cancelled);
        }

        let decoder = encryptor
            .as_ref()
            .filter(|e| e.mode() == CommandEncryption::RequestAndResponse)
            .cloned();
        let (pending, response) = PendingCommand::new(decoder);

        // Claim the slot before touching the wire; a concurrent command must
        // fail before any bytes are sent.
        self.pending.enqueue(pending)?;

        let outgoing = match &encryptor {
            Some(encryptor) => match encryptor.encode_command(command) {
                Ok(encoded) => encoded,
                Err(e) => {
                    self.pending.clear();
                    return Err(e);
                }
            },
            None => command.to_string(),
        };

        if let Err(e) = self.send_text(&outgoing).await {
            self.pending.clear();
            return Err(e);
        }

        tokio::select! {
            biased;
            _ = self.loop_token.cancelled() => Err(LoxoneError::Cancelled),
            resolved = response => {
                resolved.map_err(|_| LoxoneError::connection("connection closed before the response arrived"))?
            }
        }
    }

    pub(crate) async fn send_text(&self, text: &str) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Cancel the receive loop and wait for it to drain.
    pub(crate) async fn shutdown(&self) {
        self.loop_token.cancel();

        let keep_alive = self
            .keep_alive_handle
            .lock()
            .expect("keep-alive handle poisoned")
            .take();
        if let Some(handle) = keep_alive {
            handle.abort();
        }

        let receive = self
            .loop_handle
            .lock()
            .expect("loop handle poisoned")
            .take();
        if let Some(handle) = receive {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("receive loop did not stop in time");
            }
        }
    }

    async fn close_handshake(&self) {
        let mut sink = self.sink.lock().await;
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "shutting down".into(),
        }));
        match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.send(close)).await {
            Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
            Err(_) => debug!("close handshake timed out"),
            Ok(Ok(())) => {}
        }
    }

    fn spawn_keep_alive(self: &Arc<Self>, interval: Duration) {
        let socket = Arc::clone(self);
        let token = self.loop_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = socket.send_text("keepalive").await {
                            warn!(%error, "keep-alive send failed");
                            break;
                        }
                        debug!("keep-alive sent");
                    }
                }
            }
        });
        *self
            .keep_alive_handle
            .lock()
            .expect("keep-alive handle poisoned") = Some(handle);
    }
}

/// The single receive loop: reads headers, dispatches payloads, and on exit
/// always fails the pending command and drives a best-effort close handshake.
async fn receive_loop<S>(
    mut reader: FrameReader<S>,
    socket: Arc<TransportSocket>,
    router: Arc<EventRouter>,
    on_fault: FaultHandler,
) where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let token = socket.loop_token.clone();
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(LoxoneError::Cancelled),
        result = drive(&mut reader, &socket, &router) => result,
    };

    if let Some(pending) = socket.pending.clear() {
        pending.resolve(Err(LoxoneError::connection(
            "connection closed before the response arrived",
        )));
    }

    socket.close_handshake().await;

    match outcome {
        Ok(()) => unreachable!("the receive loop only exits through an error"),
        Err(LoxoneError::Cancelled) => debug!("receive loop cancelled"),
        Err(error) => {
            warn!(%error, "receive loop terminated");
            on_fault(error);
        }
    }
}

async fn drive<S>(
    reader: &mut FrameReader<S>,
    socket: &TransportSocket,
    router: &EventRouter,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    loop {
        let header = reader.read_header().await?;
        dispatch(reader, header, socket, router).await?;
    }
}

async fn dispatch<S>(
    reader: &mut FrameReader<S>,
    header: MessageHeader,
    socket: &TransportSocket,
    router: &EventRouter,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    // A claimed command consumes the frame; unsolicited handling is skipped.
    if let Some(pending) = socket.pending.claim_for(header.identifier) {
        match reader.read_exact(header.length).await {
            Ok(payload) => {
                pending.resolve(String::from_utf8(payload).map_err(|_| {
                    LoxoneError::transport("command response is not valid UTF-8")
                }));
                Ok(())
            }
            Err(e) => {
                pending.resolve(Err(LoxoneError::connection(
                    "connection closed before the response arrived",
                )));
                Err(e)
            }
        }
    } else {
        match header.identifier {
            MessageIdentifier::ValueStates => {
                let payload = reader.read_exact(header.length).await?;
                let states = decode_value_states(&payload);
                debug!(count = states.len(), "value-state batch");
                if !states.is_empty() {
                    router.dispatch_value_states(&states);
                }
                Ok(())
            }
            MessageIdentifier::TextStates => {
                let payload = reader.read_exact(header.length).await?;
                let states = decode_text_states(&payload);
                debug!(count = states.len(), "text-state batch");
                if !states.is_empty() {
                    router.dispatch_text_states(&states);
                }
                Ok(())
            }
            identifier => {
                debug!(?identifier, length = header.length, "skipping frame");
                reader.skip(header.length).await
            }
        }
    }
}
