//! The supervisor task: state machine, reconnect backoff and liveness timers.

use super::{Command, ConnectionState, SessionHandle};
use crate::policy::SessionPolicy;
use crate::registry::RegistryInner;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zap_core::{
    error::ZapError,
    message::{normalize_recipient, CloseReason, Credentials, IncomingMessage, TransportEvent},
    traits::{
        CredentialStore, EventJournal, SendAck, Transport, TransportFactory, TransportHandle,
    },
};

type SendReply = oneshot::Sender<Result<String, ZapError>>;

/// Collaborators shared by every supervisor of one registry.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub factory: Arc<dyn TransportFactory>,
    pub store: Arc<dyn CredentialStore>,
    pub journal: Arc<dyn EventJournal>,
    pub policy: SessionPolicy,
}

/// What woke the intake loop.
enum Wake {
    Command(Option<Command>),
    Event(Option<TransportEvent>),
    RetryDue,
    ConnectTimeout,
    Keepalive,
    HealthCheck,
}

/// Whether the loop keeps running after a wake-up.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Supervisor {
    session_id: String,
    generation: Uuid,
    deps: Collaborators,
    registry: Weak<RegistryInner>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    transport: Option<Box<dyn Transport>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    /// Latest credentials seen, loaded at start and replaced on every
    /// `credentials-changed`. Reconnects reuse them even if persisting failed.
    credentials: Option<Credentials>,
    reconnect_attempts: u32,
    last_qr: String,
    messages: VecDeque<IncomingMessage>,
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    keepalive: Option<Interval>,
    health_check: Option<Interval>,
}

impl Supervisor {
    /// Build a supervisor in `Idle` and the handle that talks to it.
    pub(crate) fn new(
        session_id: &str,
        deps: Collaborators,
        registry: Weak<RegistryInner>,
    ) -> (SessionHandle, Self) {
        let generation = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let handle = SessionHandle::new(session_id.to_string(), generation, cmd_tx, state_rx);
        let supervisor = Self {
            session_id: session_id.to_string(),
            generation,
            deps,
            registry,
            commands: cmd_rx,
            state_tx,
            transport: None,
            events: None,
            credentials: None,
            reconnect_attempts: 0,
            last_qr: String::new(),
            messages: VecDeque::new(),
            retry_at: None,
            connect_deadline: None,
            keepalive: None,
            health_check: None,
        };
        (handle, supervisor)
    }

    /// Run until the session ends. `ready` receives the outcome of
    /// initialization (credential load + first transport).
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<(), ZapError>>) {
        if let Err(e) = self.start().await {
            warn!("session {} failed to initialize: {e}", self.session_id);
            self.set_state(ConnectionState::Failed);
            self.deregister().await;
            let _ = ready.send(Err(e));
            return;
        }
        let _ = ready.send(Ok(()));

        loop {
            let wake = tokio::select! {
                // Pending transport events are applied before commands.
                biased;
                event = next_event(&mut self.events) => Wake::Event(event),
                cmd = self.commands.recv() => Wake::Command(cmd),
                _ = sleep_until(self.connect_deadline) => Wake::ConnectTimeout,
                _ = sleep_until(self.retry_at) => Wake::RetryDue,
                _ = tick(&mut self.health_check) => Wake::HealthCheck,
                _ = tick(&mut self.keepalive) => Wake::Keepalive,
            };

            let flow = match wake {
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Command(None) => {
                    debug!("session {}: all handles dropped, stopping", self.session_id);
                    self.stop().await;
                    Flow::Exit
                }
                Wake::Event(Some(event)) => self.on_event(event).await,
                Wake::Event(None) => {
                    self.on_close(CloseReason::Transient("transport event stream ended".into()))
                        .await
                }
                Wake::ConnectTimeout => self.on_connect_timeout().await,
                Wake::RetryDue => self.on_retry_due().await,
                Wake::HealthCheck => self.on_health_check().await,
                Wake::Keepalive => {
                    self.on_keepalive().await;
                    Flow::Continue
                }
            };

            if flow == Flow::Exit {
                break;
            }
        }
        debug!("session {} supervisor exited", self.session_id);
    }

    /// `Idle -> Connecting`: load credentials and open the first transport.
    async fn start(&mut self) -> Result<(), ZapError> {
        self.credentials = self
            .deps
            .store
            .load(&self.session_id)
            .await
            .map_err(|e| ZapError::Initialization(format!("credential load failed: {e}")))?;

        if self.credentials.is_none() {
            info!(
                "no stored credentials for session {}, expecting a QR challenge",
                self.session_id
            );
        }

        self.set_state(ConnectionState::Connecting);
        let handle = match self.open_transport().await {
            Some(result) => result.map_err(|e| {
                ZapError::Initialization(format!("transport construction failed: {e}"))
            })?,
            None => {
                return Err(ZapError::Initialization(format!(
                    "transport not constructed within {}s",
                    self.deps.policy.connect_timeout.as_secs()
                )))
            }
        };
        self.attach(handle);
        Ok(())
    }

    // --- commands -----------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Send { to, text, reply } => {
                self.send_text(&to, text, reply).await;
                Flow::Continue
            }
            Command::Qr(reply) => {
                let _ = reply.send(self.last_qr.clone());
                Flow::Continue
            }
            Command::Messages(reply) => {
                let _ = reply.send(self.messages.iter().cloned().collect());
                Flow::Continue
            }
            Command::ReconnectAttempts(reply) => {
                let _ = reply.send(self.reconnect_attempts);
                Flow::Continue
            }
            Command::Logout(reply) => {
                self.logout().await;
                self.deregister().await;
                let _ = reply.send(());
                Flow::Exit
            }
            Command::Shutdown(reply) => {
                self.stop().await;
                let _ = reply.send(());
                Flow::Exit
            }
        }
    }

    /// Hand the message to the transport, then await its acknowledgement on
    /// a separate task so the intake loop keeps serving events.
    async fn send_text(&mut self, to: &str, text: String, reply: SendReply) {
        let (jid, ack) = match self.write_message(to, &text).await {
            Ok(sent) => sent,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let session_id = self.session_id.clone();
        let journal = self.deps.journal.clone();
        tokio::spawn(async move {
            let result = ack.await;
            match &result {
                Ok(message_id) => {
                    info!("session {session_id}: message sent to {jid}");
                    if let Err(e) = journal
                        .record_sent(&session_id, &jid, &text, message_id)
                        .await
                    {
                        warn!("session {session_id}: failed to journal sent message: {e}");
                    }
                }
                Err(e) => warn!("session {session_id}: send to {jid} failed: {e}"),
            }
            let _ = reply.send(result);
        });
    }

    async fn write_message(&mut self, to: &str, text: &str) -> Result<(String, SendAck), ZapError> {
        if self.state() != ConnectionState::Open {
            return Err(ZapError::NotConnected(self.session_id.clone()));
        }
        let jid = normalize_recipient(to).ok_or_else(|| {
            ZapError::InvalidRecipient(format!("'{to}' is not a phone number or JID"))
        })?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ZapError::NotConnected(self.session_id.clone()))?;

        match transport.send_text(&jid, text).await {
            Ok(ack) => Ok((jid, ack)),
            Err(e) => {
                warn!("session {}: send to {jid} failed: {e}", self.session_id);
                Err(e)
            }
        }
    }

    async fn logout(&mut self) {
        info!("session {}: logging out", self.session_id);
        self.retry_at = None;
        if let Some(transport) = self.transport.as_mut() {
            self.state_tx.send_replace(ConnectionState::Closing);
            if let Err(e) = transport.logout().await {
                warn!("session {}: transport logout failed: {e}", self.session_id);
            }
        }
        self.teardown().await;
        self.clear_credentials().await;
        if let Err(e) = self.deps.journal.record_logout(&self.session_id).await {
            warn!("session {}: failed to journal logout: {e}", self.session_id);
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Stop without logging out; credentials stay stored.
    async fn stop(&mut self) {
        self.retry_at = None;
        self.teardown().await;
        if self.state() != ConnectionState::Failed {
            self.set_state(ConnectionState::Closed);
        }
        self.deregister().await;
    }

    // --- transport events ---------------------------------------------------

    async fn on_event(&mut self, event: TransportEvent) -> Flow {
        debug!("session {}: event {} in {}", self.session_id, event.tag(), self.state());
        match event {
            TransportEvent::QrAvailable(code) => {
                self.on_qr(code).await;
                Flow::Continue
            }
            TransportEvent::Opened => {
                self.on_opened();
                Flow::Continue
            }
            TransportEvent::Closed(reason) => self.on_close(reason).await,
            TransportEvent::CredentialsChanged(credentials) => {
                self.on_credentials(credentials).await;
                Flow::Continue
            }
            TransportEvent::MessageReceived(message) => {
                self.on_message(message).await;
                Flow::Continue
            }
        }
    }

    async fn on_qr(&mut self, code: String) {
        if self.state() != ConnectionState::Connecting {
            debug!("session {}: ignoring QR code in state {}", self.session_id, self.state());
            return;
        }
        info!("session {}: QR code available (scan to pair)", self.session_id);
        if let Err(e) = self.deps.journal.record_qr(&self.session_id, &code).await {
            warn!("session {}: failed to journal QR code: {e}", self.session_id);
        }
        self.last_qr = code;
    }

    fn on_opened(&mut self) {
        if self.state() != ConnectionState::Connecting {
            debug!("session {}: ignoring open in state {}", self.session_id, self.state());
            return;
        }
        self.set_state(ConnectionState::Open);
        self.reconnect_attempts = 0;
        self.last_qr.clear();
        self.connect_deadline = None;
        self.keepalive = Some(periodic(self.deps.policy.keepalive_interval));
        self.health_check = Some(periodic(self.deps.policy.health_check_interval));
        info!("session {} connected", self.session_id);
    }

    /// `Open|Connecting -> Closing -> Closed`, then retry or end.
    async fn on_close(&mut self, reason: CloseReason) -> Flow {
        let state = self.state();
        if !matches!(state, ConnectionState::Open | ConnectionState::Connecting) {
            debug!("session {}: ignoring close ({reason}) in state {state}", self.session_id);
            return Flow::Continue;
        }

        warn!("session {} connection closed: {reason}", self.session_id);
        self.set_state(ConnectionState::Closing);
        self.teardown().await;
        self.set_state(ConnectionState::Closed);

        if reason.is_logged_out() {
            warn!(
                "session {} logged out remotely, not reconnecting; clearing credentials",
                self.session_id
            );
            self.clear_credentials().await;
            self.deregister().await;
            return Flow::Exit;
        }

        self.schedule_reconnect().await
    }

    async fn schedule_reconnect(&mut self) -> Flow {
        let max = self.deps.policy.max_attempts;
        if self.reconnect_attempts >= max {
            error!(
                "session {}: reconnect attempts exhausted ({max}/{max}), giving up",
                self.session_id
            );
            self.set_state(ConnectionState::Failed);
            if self.deps.policy.clear_credentials_on_failure {
                self.clear_credentials().await;
            }
            self.deregister().await;
            return Flow::Exit;
        }

        self.reconnect_attempts += 1;
        let delay = self.deps.policy.backoff_delay(self.reconnect_attempts);
        info!(
            "session {}: reconnect attempt {}/{max} in {:.1}s",
            self.session_id,
            self.reconnect_attempts,
            delay.as_secs_f64()
        );
        self.retry_at = Some(Instant::now() + delay);
        Flow::Continue
    }

    /// `Closed -> Connecting` with a fresh transport.
    async fn on_retry_due(&mut self) -> Flow {
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);
        match self.open_transport().await {
            Some(Ok(handle)) => {
                self.attach(handle);
                Flow::Continue
            }
            Some(Err(e)) => {
                self.on_close(CloseReason::Transient(format!("reconnect failed: {e}"))).await
            }
            None => self.on_close(CloseReason::Transient("connection timeout".into())).await,
        }
    }

    async fn on_connect_timeout(&mut self) -> Flow {
        self.connect_deadline = None;
        if self.state() != ConnectionState::Connecting {
            return Flow::Continue;
        }
        self.on_close(CloseReason::Transient("connection timeout".into())).await
    }

    async fn on_credentials(&mut self, credentials: Credentials) {
        if let Err(e) = self.deps.store.save(&self.session_id, &credentials).await {
            warn!(
                "session {}: failed to persist credentials, keeping them in memory: {e}",
                self.session_id
            );
        }
        self.credentials = Some(credentials);
    }

    async fn on_message(&mut self, message: IncomingMessage) {
        if self.state() != ConnectionState::Open {
            debug!(
                "session {}: dropping message {} received in state {}",
                self.session_id,
                message.id,
                self.state()
            );
            return;
        }
        if message.from_me {
            debug!("session {}: skipping own message {}", self.session_id, message.id);
            return;
        }

        info!("session {}: message from {}", self.session_id, message.from);
        if let Err(e) = self
            .deps
            .journal
            .record_received(&self.session_id, &message)
            .await
        {
            warn!("session {}: failed to journal message: {e}", self.session_id);
        }

        self.messages.push_back(message);
        if let Some(cap) = self.deps.policy.max_buffered_messages {
            while self.messages.len() > cap {
                self.messages.pop_front();
            }
        }
    }

    // --- timers ---------------------------------------------------------------

    async fn on_keepalive(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            match transport.ping().await {
                Ok(()) => debug!("session {}: keep-alive sent", self.session_id),
                Err(e) => warn!("session {}: keep-alive failed: {e}", self.session_id),
            }
        }
    }

    async fn on_health_check(&mut self) -> Flow {
        if self.state() != ConnectionState::Open {
            return Flow::Continue;
        }
        let open = self.transport.as_ref().is_some_and(|t| t.is_open());
        if open {
            return Flow::Continue;
        }
        warn!("session {}: unstable connection detected", self.session_id);
        self.on_close(CloseReason::Transient("health check: transport not open".into())).await
    }

    // --- helpers --------------------------------------------------------------

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!("session {}: {prev} -> {next}", self.session_id);
        }
    }

    /// Ask the factory for a transport. `None` if the connect deadline passed
    /// first. The same deadline then bounds the wait for `opened`.
    async fn open_transport(&mut self) -> Option<Result<TransportHandle, ZapError>> {
        let deadline = Instant::now() + self.deps.policy.connect_timeout;
        self.connect_deadline = Some(deadline);
        let connect = self
            .deps
            .factory
            .connect(&self.session_id, self.credentials.clone());
        tokio::time::timeout_at(deadline, connect).await.ok()
    }

    fn attach(&mut self, handle: TransportHandle) {
        self.transport = Some(handle.transport);
        self.events = Some(handle.events);
    }

    /// Drop the transport, its event stream and every connection-scoped timer.
    async fn teardown(&mut self) {
        self.keepalive = None;
        self.health_check = None;
        self.connect_deadline = None;
        self.events = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    async fn clear_credentials(&mut self) {
        self.credentials = None;
        if let Err(e) = self.deps.store.clear(&self.session_id).await {
            warn!("session {}: failed to clear credentials: {e}", self.session_id);
        }
    }

    async fn deregister(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.session_id, self.generation).await;
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Interval whose first tick is one full period from now.
fn periodic(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
