//! Scripted fakes: a transport factory whose connections the test drives by
//! hand, an in-memory credential store and a recording journal.

use crate::{Registry, SessionPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use zap_core::{
    error::ZapError,
    message::{Credentials, IncomingMessage, TransportEvent},
    traits::{
        CredentialStore, EventJournal, SendAck, Transport, TransportFactory, TransportHandle,
    },
};

/// Observable side of one fake transport.
#[derive(Default)]
pub(crate) struct Wire {
    pub open: AtomicBool,
    pub pings: AtomicUsize,
    pub logouts: AtomicUsize,
    pub closed: AtomicBool,
    pub fail_sends: AtomicBool,
    /// Keep acknowledgements back until [`Wire::release_acks`].
    pub hold_acks: AtomicBool,
    pub sent: Mutex<Vec<(String, String)>>,
    held: Mutex<Vec<(String, oneshot::Sender<Result<String, ZapError>>)>>,
}

impl Wire {
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Acknowledge every held send.
    pub fn release_acks(&self) {
        for (message_id, ack) in self.held.lock().unwrap().drain(..) {
            let _ = ack.send(Ok(message_id));
        }
    }
}

/// One successful `connect` call, as seen by the test.
#[derive(Clone)]
pub(crate) struct FakeConnection {
    /// Emits events into the supervisor.
    pub events: mpsc::Sender<TransportEvent>,
    pub credentials: Option<Credentials>,
    pub wire: Arc<Wire>,
}

impl FakeConnection {
    pub async fn emit(&self, event: TransportEvent) {
        self.events
            .send(event)
            .await
            .expect("supervisor dropped the event stream");
    }
}

struct FakeTransport {
    wire: Arc<Wire>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&mut self, to: &str, text: &str) -> Result<SendAck, ZapError> {
        if self.wire.fail_sends.load(Ordering::SeqCst) {
            return Err(ZapError::Transport("socket write failed".into()));
        }
        let message_id = {
            let mut sent = self.wire.sent.lock().unwrap();
            sent.push((to.to_string(), text.to_string()));
            format!("OUT{}", sent.len())
        };

        if !self.wire.hold_acks.load(Ordering::SeqCst) {
            return Ok(Box::pin(async move { Ok(message_id) }));
        }
        let (tx, rx) = oneshot::channel();
        self.wire.held.lock().unwrap().push((message_id, tx));
        Ok(Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(ZapError::Transport("ack dropped".into())))
        }))
    }

    async fn ping(&mut self) -> Result<(), ZapError> {
        self.wire.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.wire.open.load(Ordering::SeqCst)
    }

    async fn logout(&mut self) -> Result<(), ZapError> {
        self.wire.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.wire.open.store(false, Ordering::SeqCst);
        self.wire.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport factory that records every `connect` call.
pub(crate) struct FakeFactory {
    calls: Mutex<Vec<Instant>>,
    connections: Mutex<Vec<FakeConnection>>,
    call_count: watch::Sender<usize>,
    failures: AtomicUsize,
    hangs: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            call_count: watch::channel(0).0,
            failures: AtomicUsize::new(0),
            hangs: AtomicUsize::new(0),
        })
    }

    /// Number of `connect` calls, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Virtual time of every `connect` call.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last(&self) -> FakeConnection {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection made yet")
    }

    pub fn connection(&self, index: usize) -> FakeConnection {
        self.connections.lock().unwrap()[index].clone()
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connect calls never return.
    pub fn hang_next(&self, n: usize) {
        self.hangs.store(n, Ordering::SeqCst);
    }

    /// Wait (in virtual time) until at least `n` connect calls happened.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        rx.wait_for(|count| *count >= n).await.unwrap();
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(
        &self,
        _session_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<TransportHandle, ZapError> {
        self.calls.lock().unwrap().push(Instant::now());
        let count = self.calls();
        self.call_count.send_replace(count);

        if self.hangs.load(Ordering::SeqCst) > 0 {
            self.hangs.fetch_sub(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ZapError::Transport("connection refused".into()));
        }

        let (tx, rx) = mpsc::channel(16);
        let wire = Arc::new(Wire::default());
        wire.open.store(true, Ordering::SeqCst);
        self.connections.lock().unwrap().push(FakeConnection {
            events: tx,
            credentials,
            wire: wire.clone(),
        });

        Ok(TransportHandle {
            transport: Box::new(FakeTransport { wire }),
            events: rx,
        })
    }
}

/// Credential store backed by a `HashMap`.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<String, Credentials>>,
    pub fail_loads: AtomicBool,
    pub fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn get(&self, session_id: &str) -> Option<Credentials> {
        self.records.lock().unwrap().get(session_id).cloned()
    }

    pub fn put(&self, session_id: &str, credentials: Credentials) {
        self.records
            .lock()
            .unwrap()
            .insert(session_id.to_string(), credentials);
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, ZapError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(ZapError::Store("database unavailable".into()));
        }
        Ok(self.get(session_id))
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), ZapError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ZapError::Store("disk full".into()));
        }
        self.put(session_id, credentials.clone());
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<(), ZapError> {
        self.records.lock().unwrap().remove(session_id);
        Ok(())
    }
}

/// Journal that keeps one line per recorded event.
#[derive(Default)]
pub(crate) struct RecordingJournal {
    entries: Mutex<Vec<String>>,
}

impl RecordingJournal {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl EventJournal for RecordingJournal {
    async fn record_qr(&self, session_id: &str, code: &str) -> Result<(), ZapError> {
        self.push(format!("qr {session_id} {code}"));
        Ok(())
    }

    async fn record_received(
        &self,
        session_id: &str,
        message: &IncomingMessage,
    ) -> Result<(), ZapError> {
        self.push(format!("received {session_id} {}", message.id));
        Ok(())
    }

    async fn record_sent(
        &self,
        session_id: &str,
        to: &str,
        text: &str,
        _message_id: &str,
    ) -> Result<(), ZapError> {
        self.push(format!("sent {session_id} {to} {text}"));
        Ok(())
    }

    async fn record_logout(&self, session_id: &str) -> Result<(), ZapError> {
        self.push(format!("logout {session_id}"));
        Ok(())
    }
}

/// Registry wired to fresh fakes.
pub(crate) fn setup(
    policy: SessionPolicy,
) -> (Registry, Arc<FakeFactory>, Arc<MemoryStore>, Arc<RecordingJournal>) {
    let factory = FakeFactory::new();
    let store = Arc::new(MemoryStore::default());
    let journal = Arc::new(RecordingJournal::default());
    let registry = Registry::with_journal(factory.clone(), store.clone(), journal.clone(), policy);
    (registry, factory, store, journal)
}

pub(crate) fn incoming(id: &str, from_me: bool) -> IncomingMessage {
    IncomingMessage {
        id: id.to_string(),
        from: "5511999887766@s.whatsapp.net".to_string(),
        text: format!("text of {id}"),
        timestamp: chrono::Utc::now(),
        from_me,
    }
}

pub(crate) fn creds(value: serde_json::Value) -> Credentials {
    Credentials(value)
}
