//! Scripted protocol engine for tests.
//!
//! Every opened session records the calls made on it and hands its event
//! sender back to the test, which drives the lifecycle by emitting events.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::engine::{
    Document, EVENT_CHANNEL_CAPACITY, EngineConnection, EngineError, EngineEvent, EngineSession,
    MessageReceipt, OpenRequest, Presence, ProtocolEngine,
};

/// A call observed by the scripted engine, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    Open { instance: String },
    Presence { instance: String, peer: String, presence: Presence },
    Text { instance: String, peer: String, text: String },
    Image { instance: String, peer: String, bytes: usize, caption: String },
    Video { instance: String, peer: String, bytes: usize, caption: String },
    Document { instance: String, peer: String, file_name: String, mime_type: String },
    Logout { instance: String },
    Close { instance: String, session: usize },
}

impl EngineCall {
    pub fn instance(&self) -> &str {
        match self {
            Self::Open { instance }
            | Self::Presence { instance, .. }
            | Self::Text { instance, .. }
            | Self::Image { instance, .. }
            | Self::Video { instance, .. }
            | Self::Document { instance, .. }
            | Self::Logout { instance }
            | Self::Close { instance, .. } => instance.as_str(),
        }
    }
}

#[derive(Default)]
struct Script {
    calls: Vec<EngineCall>,
    sessions: Vec<Arc<ScriptedSession>>,
    opens: Vec<OpenRequest>,
    open_failures: VecDeque<EngineError>,
    version: Option<String>,
    next_message: u64,
}

#[derive(Clone, Default)]
struct Shared {
    script: Arc<Mutex<Script>>,
    fail_logout: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }

    fn receipt(&self) -> MessageReceipt {
        let mut script = self.lock();
        script.next_message += 1;
        MessageReceipt {
            id: format!("MSG{:06}", script.next_message),
        }
    }
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    shared: Shared,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `version` from `latest_version` instead of failing.
    pub fn set_version(&self, version: &str) {
        self.shared.lock().version = Some(version.to_string());
    }

    /// Fail the next `open` with `error`. Queued failures are consumed in order.
    pub fn fail_next_open(&self, error: EngineError) {
        self.shared.lock().open_failures.push_back(error);
    }

    pub fn fail_logout(&self, fail: bool) {
        self.shared.fail_logout.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Emit on the most recently opened session for `instance`.
    pub async fn emit(&self, instance: &str, event: EngineEvent) -> bool {
        let session = self
            .shared
            .lock()
            .sessions
            .iter()
            .rev()
            .find(|s| s.instance == instance)
            .cloned();
        match session {
            Some(session) => session.events.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Emit on a specific session, by open order (0-based), even after it
    /// was closed.
    pub async fn emit_to(&self, session: usize, event: EngineEvent) -> bool {
        let session = self.shared.lock().sessions.get(session).cloned();
        match session {
            Some(session) => session.events.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Sessions opened for `instance` so far.
    pub fn open_count(&self, instance: &str) -> usize {
        self.shared
            .lock()
            .opens
            .iter()
            .filter(|r| r.instance_id == instance)
            .count()
    }

    /// Sessions opened and not yet closed, across all instances.
    pub fn live_count(&self) -> usize {
        self.shared
            .lock()
            .sessions
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Open-order index of the latest session for `instance`.
    pub fn latest_session(&self, instance: &str) -> Option<usize> {
        self.shared
            .lock()
            .sessions
            .iter()
            .rposition(|s| s.instance == instance)
    }

    pub fn is_closed(&self, session: usize) -> bool {
        self.shared
            .lock()
            .sessions
            .get(session)
            .is_some_and(|s| s.is_closed())
    }

    pub fn last_open(&self, instance: &str) -> Option<OpenRequest> {
        self.shared
            .lock()
            .opens
            .iter()
            .rev()
            .find(|r| r.instance_id == instance)
            .cloned()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.shared.lock().calls.clone()
    }

    pub fn calls_for(&self, instance: &str) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.instance() == instance)
            .collect()
    }
}

#[async_trait]
impl ProtocolEngine for ScriptedEngine {
    async fn latest_version(&self) -> Result<String, EngineError> {
        self.shared
            .lock()
            .version
            .clone()
            .ok_or_else(|| EngineError::Transport("version endpoint unreachable".into()))
    }

    async fn open(&self, request: OpenRequest) -> Result<EngineConnection, EngineError> {
        let mut script = self.shared.lock();
        script.calls.push(EngineCall::Open {
            instance: request.instance_id.clone(),
        });
        script.opens.push(request.clone());
        if let Some(error) = script.open_failures.pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = Arc::new(ScriptedSession {
            instance: request.instance_id,
            index: script.sessions.len(),
            events: tx,
            closed: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        script.sessions.push(session.clone());

        Ok(EngineConnection {
            session,
            events: rx,
        })
    }
}

struct ScriptedSession {
    instance: String,
    index: usize,
    events: mpsc::Sender<EngineEvent>,
    closed: AtomicBool,
    shared: Shared,
}

impl ScriptedSession {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_send(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("send rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineSession for ScriptedSession {
    async fn send_text(&self, peer: &str, text: &str) -> Result<MessageReceipt, EngineError> {
        self.check_send()?;
        self.shared.record(EngineCall::Text {
            instance: self.instance.clone(),
            peer: peer.to_string(),
            text: text.to_string(),
        });
        Ok(self.shared.receipt())
    }

    async fn send_image(
        &self,
        peer: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<MessageReceipt, EngineError> {
        self.check_send()?;
        self.shared.record(EngineCall::Image {
            instance: self.instance.clone(),
            peer: peer.to_string(),
            bytes: data.len(),
            caption: caption.to_string(),
        });
        Ok(self.shared.receipt())
    }

    async fn send_video(
        &self,
        peer: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<MessageReceipt, EngineError> {
        self.check_send()?;
        self.shared.record(EngineCall::Video {
            instance: self.instance.clone(),
            peer: peer.to_string(),
            bytes: data.len(),
            caption: caption.to_string(),
        });
        Ok(self.shared.receipt())
    }

    async fn send_document(
        &self,
        peer: &str,
        document: Document,
    ) -> Result<MessageReceipt, EngineError> {
        self.check_send()?;
        self.shared.record(EngineCall::Document {
            instance: self.instance.clone(),
            peer: peer.to_string(),
            file_name: document.file_name,
            mime_type: document.mime_type,
        });
        Ok(self.shared.receipt())
    }

    async fn set_presence(&self, presence: Presence, peer: &str) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.shared.record(EngineCall::Presence {
            instance: self.instance.clone(),
            peer: peer.to_string(),
            presence,
        });
        Ok(())
    }

    async fn logout(&self) -> Result<(), EngineError> {
        self.shared.record(EngineCall::Logout {
            instance: self.instance.clone(),
        });
        if self.shared.fail_logout.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("unlink request timed out".into()));
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.record(EngineCall::Close {
                instance: self.instance.clone(),
                session: self.index,
            });
        }
    }
}
