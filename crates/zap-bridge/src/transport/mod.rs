//! [`Transport`] over a WebSocket connection to the bridge.

#[cfg(test)]
mod tests;

use crate::protocol::{BridgeFrame, ClientFrame};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zap_core::{
    config::BridgeConfig,
    error::ZapError,
    message::{CloseReason, Credentials, TransportEvent},
    traits::{SendAck, Transport, TransportFactory, TransportHandle},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SendReply = oneshot::Sender<Result<String, ZapError>>;
/// Sends awaiting a `sent`/`send_failed` frame, by request id.
type Pending = Arc<Mutex<HashMap<String, SendReply>>>;

const EVENT_BUFFER: usize = 64;

/// Opens one WebSocket per connection attempt.
pub struct BridgeTransportFactory {
    url: String,
    send_timeout: Duration,
}

impl BridgeTransportFactory {
    pub fn new(url: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            send_timeout,
        }
    }

    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::new(cfg.url.clone(), Duration::from_secs(cfg.send_timeout_secs))
    }
}

#[async_trait]
impl TransportFactory for BridgeTransportFactory {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<TransportHandle, ZapError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ZapError::Transport(format!("bridge connect to {} failed: {e}", self.url)))?;
        let (mut sink, stream) = socket.split();

        let hello = ClientFrame::Hello {
            session_id: session_id.to_string(),
            credentials,
        };
        sink.send(Message::text(hello.to_json()?))
            .await
            .map_err(|e| ZapError::Transport(format!("bridge hello failed: {e}")))?;
        info!("session {session_id}: bridge connected at {}", self.url);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let open = Arc::new(AtomicBool::new(true));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_frames(
            session_id.to_string(),
            stream,
            events_tx,
            pending.clone(),
            open.clone(),
        ));

        Ok(TransportHandle {
            transport: Box::new(BridgeTransport {
                session_id: session_id.to_string(),
                sink,
                pending,
                open,
                reader,
                send_timeout: self.send_timeout,
            }),
            events: events_rx,
        })
    }
}

struct BridgeTransport {
    session_id: String,
    sink: SplitSink<Socket, Message>,
    pending: Pending,
    /// Cleared by the reader task when the socket ends.
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    send_timeout: Duration,
}

impl BridgeTransport {
    async fn write(&mut self, frame: &ClientFrame) -> Result<(), ZapError> {
        self.sink
            .send(Message::text(frame.to_json()?))
            .await
            .map_err(|e| ZapError::Transport(format!("bridge write failed: {e}")))
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send_text(&mut self, to: &str, text: &str) -> Result<SendAck, ZapError> {
        if !self.is_open() {
            return Err(ZapError::NotConnected(self.session_id.clone()));
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);

        let frame = ClientFrame::Send {
            request_id: request_id.clone(),
            to: to.to_string(),
            text: text.to_string(),
        };
        if let Err(e) = self.write(&frame).await {
            lock(&self.pending).remove(&request_id);
            return Err(e);
        }

        let pending = self.pending.clone();
        let send_timeout = self.send_timeout;
        Ok(Box::pin(async move {
            match tokio::time::timeout(send_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ZapError::Transport(
                    "bridge connection ended before the send was acknowledged".into(),
                )),
                Err(_) => {
                    lock(&pending).remove(&request_id);
                    Err(ZapError::Transport(format!(
                        "send not acknowledged within {}s",
                        send_timeout.as_secs()
                    )))
                }
            }
        }))
    }

    async fn ping(&mut self) -> Result<(), ZapError> {
        self.sink
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| ZapError::Transport(format!("bridge ping failed: {e}")))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn logout(&mut self) -> Result<(), ZapError> {
        self.write(&ClientFrame::Logout).await
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
        self.reader.abort();
        lock(&self.pending).clear();
        debug!("session {}: bridge socket closed", self.session_id);
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// What one inbound socket message amounts to.
enum Inbound {
    Event(TransportEvent),
    End(CloseReason),
    Skip,
}

/// Map incoming frames to events until the socket ends, then emit the
/// final `Closed`.
///
/// Events queue in `backlog` while the receiver is full, so the socket keeps
/// being read and send acknowledgements are resolved as they arrive.
async fn read_frames(
    session_id: String,
    mut stream: SplitStream<Socket>,
    events: mpsc::Sender<TransportEvent>,
    pending: Pending,
    open: Arc<AtomicBool>,
) {
    let mut backlog: VecDeque<TransportEvent> = VecDeque::new();

    let reason = loop {
        tokio::select! {
            permit = events.reserve(), if !backlog.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(event) = backlog.pop_front() {
                        permit.send(event);
                    }
                }
                Err(_) => {
                    debug!("session {session_id}: event receiver dropped, stopping reader");
                    open.store(false, Ordering::SeqCst);
                    lock(&pending).clear();
                    return;
                }
            },
            message = stream.next() => match inbound(&session_id, message, &pending) {
                Inbound::Event(event) => backlog.push_back(event),
                Inbound::End(reason) => break reason,
                Inbound::Skip => {}
            },
        }
    };

    open.store(false, Ordering::SeqCst);
    lock(&pending).clear();
    backlog.push_back(TransportEvent::Closed(reason));
    for event in backlog {
        if events.send(event).await.is_err() {
            break;
        }
    }
}

fn inbound(
    session_id: &str,
    message: Option<Result<Message, WsError>>,
    pending: &Pending,
) -> Inbound {
    let text = match message {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) => {
            return Inbound::End(CloseReason::Transient("bridge closed the socket".into()))
        }
        Some(Ok(_)) => return Inbound::Skip,
        Some(Err(e)) => {
            return Inbound::End(CloseReason::Transient(format!("bridge socket error: {e}")))
        }
        None => return Inbound::End(CloseReason::Transient("bridge socket ended".into())),
    };

    let frame = match BridgeFrame::parse(text.as_str()) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("session {session_id}: ignoring malformed bridge frame: {e}");
            return Inbound::Skip;
        }
    };

    match frame {
        BridgeFrame::Sent {
            request_id,
            message_id,
        } => {
            resolve(pending, &request_id, Ok(message_id));
            Inbound::Skip
        }
        BridgeFrame::SendFailed { request_id, error } => {
            resolve(pending, &request_id, Err(ZapError::Transport(error)));
            Inbound::Skip
        }
        frame => match frame.into_event() {
            Some(TransportEvent::Closed(reason)) => Inbound::End(reason),
            Some(event) => Inbound::Event(event),
            None => Inbound::Skip,
        },
    }
}

fn resolve(pending: &Pending, request_id: &str, result: Result<String, ZapError>) {
    match lock(pending).remove(request_id) {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => debug!("reply for unknown send request {request_id}"),
    }
}

/// Lock the pending map, recovering it if poisoned.
fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<String, SendReply>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}
