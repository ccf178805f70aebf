use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{
    CredentialStore, InstanceMetadata, phone_from_account_id, validate_instance_id,
};
use crate::engine::{CloseReason, EngineEvent, OpenRequest, ProtocolEngine};
use crate::error::{Result, SessionError};
use crate::record::{PairingArtifact, SessionRecord, SessionSnapshot, SessionState, SocketHandle};
use crate::registry::Registry;

/// Tunables for the lifecycle controller and command surface.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Pairing codes issued per cycle before automatic reconnection stops.
    pub max_pairing_attempts: u32,
    /// Debounce before reconnecting after an unexpected drop.
    pub reconnect_delay: Duration,
    /// Pause between "composing" and the actual send.
    pub presence_delay: Duration,
    /// Pause between documents of a batch.
    pub batch_delay: Duration,
    /// Version tag announced when the engine cannot report the latest one.
    pub fallback_version: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_pairing_attempts: 3,
            reconnect_delay: Duration::from_secs(3),
            presence_delay: Duration::from_millis(500),
            batch_delay: Duration::from_millis(1500),
            fallback_version: "2.3000.1023223821".to_string(),
        }
    }
}

/// What the event pump should do after handling one event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Detach,
}

enum Begin {
    Existing(SessionSnapshot),
    Capped,
    Started(Option<SocketHandle>),
}

enum Dropped {
    Capped(Option<SocketHandle>),
    Retry(Option<SocketHandle>),
}

pub(crate) struct Inner {
    pub(crate) registry: Registry,
    pub(crate) store: CredentialStore,
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) config: ManagerConfig,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    /// Held across a generation check and the credential write it guards,
    /// and across purges.
    disk: Mutex<()>,
}

/// Manager for many independent chat sessions.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        store: CredentialStore,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                store,
                engine,
                config,
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                disk: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Start (or resume) an instance.
    ///
    /// Returns the existing record untouched while an initialization is in
    /// flight or the instance is connected. An instance parked at the
    /// pairing limit must be restarted instead.
    pub async fn initialize(&self, id: &str, name: Option<&str>) -> Result<SessionSnapshot> {
        validate_instance_id(id)?;
        self.initialize_with(id, name.map(str::to_string), None)
            .await
    }

    /// Discard the record and initialize from scratch. The only way out of
    /// `qr_limit_reached`.
    pub async fn restart(&self, id: &str, name: Option<&str>) -> Result<SessionSnapshot> {
        validate_instance_id(id)?;

        let previous = self.inner.registry.remove(id).await;
        let name = name
            .map(str::to_string)
            .or_else(|| previous.as_ref().map(|r| r.display_name.clone()));
        let created_at = previous.as_ref().map(|r| r.created_at);
        if let Some(socket) = previous.and_then(|r| r.socket) {
            socket.release();
        }

        info!(instance = %id, "restarting instance, pairing attempts reset");
        self.initialize_with(id, name, created_at).await
    }

    /// Unlink the account and forget the instance.
    ///
    /// The graceful unlink is best effort; credentials are purged and the
    /// record evicted regardless. Returns whether a record existed.
    pub async fn logout(&self, id: &str) -> bool {
        let Some(record) = self.inner.registry.remove(id).await else {
            return false;
        };

        if let Some(socket) = record.socket {
            socket.detach();
            let session = socket.session();
            if let Err(e) = session.logout().await {
                warn!(instance = %id, "graceful logout failed, cleaning up locally: {}", e);
            }
            socket.release();
        }

        let purged = {
            let _disk = self.inner.disk.lock().await;
            self.inner.store.purge(id).await
        };
        if let Err(e) = purged {
            warn!(instance = %id, "failed to purge credentials: {}", e);
        }

        info!(instance = %id, "instance logged out");
        true
    }

    /// Log out and remove every trace of the instance, including instances
    /// that only exist on disk.
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_instance_id(id)?;
        if self.logout(id).await {
            return Ok(());
        }
        let purged = {
            let _disk = self.inner.disk.lock().await;
            self.inner.store.purge(id).await?
        };
        if purged {
            info!(instance = %id, "stored instance deleted");
            Ok(())
        } else {
            Err(SessionError::NotFound(id.to_string()))
        }
    }

    /// Re-initialize every stored instance whose credentials are bound to
    /// an account. Never-paired instances are left for an explicit command.
    pub async fn resurrect(&self) -> Result<Vec<String>> {
        let ids = self
            .inner
            .store
            .list_ids()
            .await
            .map_err(|e| SessionError::io("*", e))?;

        let mut resumed = Vec::new();
        for id in ids {
            match self.inner.store.resolve_account_identifier(&id).await {
                Ok(Some(account)) => {
                    let metadata = self.inner.store.read_metadata(&id).await.unwrap_or_else(|e| {
                        warn!(instance = %id, "unreadable metadata: {}", e);
                        None
                    });
                    info!(
                        instance = %id,
                        phone = %phone_from_account_id(&account),
                        "resuming paired session"
                    );
                    let (name, created_at) = match metadata {
                        Some(m) => (Some(m.name), Some(m.created_at)),
                        None => (None, None),
                    };
                    match self.initialize_with(&id, name, created_at).await {
                        Ok(_) => resumed.push(id),
                        Err(e) => warn!(instance = %id, "failed to resume session: {}", e),
                    }
                }
                Ok(None) => {
                    info!(instance = %id, "stored session was never paired, waiting for an explicit start");
                }
                Err(e) => warn!(instance = %id, "skipping unreadable credentials: {}", e),
            }
        }
        Ok(resumed)
    }

    /// Close every live session without unlinking accounts and cancel
    /// pending reconnects.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        let records = self.inner.registry.drain().await;
        let count = records.len();
        for record in records {
            if let Some(socket) = record.socket {
                debug!(instance = %record.id, generation = socket.generation(), "closing session");
                socket.release();
            }
        }
        info!("closed {} instances", count);
        count
    }

    async fn initialize_with(
        &self,
        id: &str,
        name: Option<String>,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<SessionSnapshot> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);

        let begin = self
            .inner
            .registry
            .transact(|records| match records.get_mut(id) {
                Some(record)
                    if record.state.is_initializing()
                        || record.state == SessionState::Connected =>
                {
                    Begin::Existing(record.snapshot())
                }
                Some(record) if record.state == SessionState::QrLimitReached => Begin::Capped,
                Some(record) => {
                    let stale = record.socket.take();
                    record.state = SessionState::Initializing;
                    record.generation = generation;
                    record.pairing = None;
                    if let Some(name) = &name {
                        record.display_name = name.clone();
                    }
                    Begin::Started(stale)
                }
                None => {
                    records.insert(
                        id.to_string(),
                        SessionRecord::new(id, name.clone(), created_at, generation),
                    );
                    Begin::Started(None)
                }
            })
            .await;

        match begin {
            Begin::Existing(snapshot) => {
                debug!(instance = %id, state = %snapshot.state, "already initializing or connected");
                return Ok(snapshot);
            }
            Begin::Capped => return Err(SessionError::PairingCapExceeded(id.to_string())),
            Begin::Started(Some(stale)) => {
                debug!(instance = %id, generation = stale.generation(), "releasing stale session");
                stale.release();
            }
            Begin::Started(None) => {}
        }

        if let Err(e) = self.open_session(id, generation, name).await {
            warn!(instance = %id, "initialization failed: {}", e);
            self.inner
                .registry
                .update_current(id, generation, |r| r.state = SessionState::Disconnected)
                .await;
            return Err(e);
        }

        self.inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn open_session(&self, id: &str, generation: u64, name: Option<String>) -> Result<()> {
        let store = &self.inner.store;
        let (credentials, stored) = {
            let _disk = self.inner.disk.lock().await;
            let current = match self.inner.registry.get(id).await {
                Some(current) if current.generation == generation => current,
                _ => {
                    debug!(instance = %id, generation, "superseded before touching storage");
                    return Ok(());
                }
            };
            let credentials = store.load(id).await?;
            let stored = store
                .write_metadata_if_absent(
                    id,
                    &InstanceMetadata {
                        name: current.display_name.clone(),
                        created_at: current.created_at,
                    },
                )
                .await?;
            (credentials, stored)
        };
        let phone = credentials.account_id().map(phone_from_account_id);
        self.inner
            .registry
            .update_current(id, generation, |r| {
                if name.is_none() {
                    r.display_name = stored.name.clone();
                }
                r.created_at = stored.created_at;
                if phone.is_some() {
                    r.phone = phone.clone();
                }
            })
            .await;

        let version = match self.inner.engine.latest_version().await {
            Ok(version) => version,
            Err(e) => {
                debug!(instance = %id, "version lookup failed, using fallback: {}", e);
                self.inner.config.fallback_version.clone()
            }
        };

        let connection = match self
            .inner
            .engine
            .open(OpenRequest {
                instance_id: id.to_string(),
                credentials,
                version,
            })
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!(instance = %id, "failed to open session: {}", e);
                self.on_closed(id, generation, CloseReason::dropped(e.to_string()))
                    .await;
                return Ok(());
            }
        };

        let cancel = CancellationToken::new();
        let mut slot = Some(SocketHandle::new(
            connection.session,
            generation,
            cancel.clone(),
        ));
        let installed = self
            .inner
            .registry
            .update_current(id, generation, |r| r.socket = slot.take())
            .await
            .is_some();

        if !installed {
            // Superseded by a restart or logout while opening.
            if let Some(socket) = slot {
                socket.release();
            }
            debug!(instance = %id, generation, "discarded superseded session");
            return Ok(());
        }

        self.spawn_event_pump(id.to_string(), generation, connection.events, cancel);
        info!(instance = %id, generation, "session opened");
        Ok(())
    }

    /// One consumer per socket: events for an instance are handled strictly
    /// in emission order until the socket is detached.
    fn spawn_event_pump(
        &self,
        id: String,
        generation: u64,
        mut events: mpsc::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Some(event) => event,
                    None => EngineEvent::Closed(CloseReason::dropped("event stream ended")),
                };
                let ended = matches!(event, EngineEvent::Closed(_));
                if manager.handle_event(&id, generation, event).await == Flow::Detach || ended {
                    cancel.cancel();
                    break;
                }
            }
            debug!(instance = %id, generation, "event pump stopped");
        });
    }

    async fn handle_event(&self, id: &str, generation: u64, event: EngineEvent) -> Flow {
        match event {
            EngineEvent::Connecting => {
                self.inner
                    .registry
                    .update_current(id, generation, |r| {
                        if !r.state.is_initializing() {
                            r.state = SessionState::Connecting;
                        }
                    })
                    .await
                    .map_or(Flow::Detach, |_| Flow::Continue)
            }
            EngineEvent::PairingCode(code) => self.on_pairing_code(id, generation, code).await,
            EngineEvent::Open { account_id } => self.on_open(id, generation, &account_id).await,
            EngineEvent::Closed(reason) => {
                self.on_closed(id, generation, reason).await;
                Flow::Detach
            }
            EngineEvent::CredentialsUpdated(creds) => {
                let _disk = self.inner.disk.lock().await;
                if !self.inner.registry.is_current(id, generation).await {
                    return Flow::Detach;
                }
                if let Err(e) = self.inner.store.save(id, &creds).await {
                    warn!(instance = %id, "failed to persist rotated credentials: {}", e);
                }
                Flow::Continue
            }
        }
    }

    async fn on_pairing_code(&self, id: &str, generation: u64, code: String) -> Flow {
        let cap = self.inner.config.max_pairing_attempts;
        let outcome = self
            .inner
            .registry
            .update_current(id, generation, |r| {
                r.pairing_attempts += 1;
                r.pairing = Some(PairingArtifact {
                    code,
                    issued_at: Utc::now(),
                });
                r.state = SessionState::QrReady;
                if r.pairing_attempts >= cap {
                    r.limit_armed = true;
                }
                (r.pairing_attempts, r.limit_armed)
            })
            .await;

        let Some((attempt, armed)) = outcome else {
            return Flow::Detach;
        };
        info!(instance = %id, attempt, max = cap, "pairing code ready");
        if armed {
            warn!(instance = %id, "pairing attempt limit reached, automatic reconnection suspended");
        }
        Flow::Continue
    }

    async fn on_open(&self, id: &str, generation: u64, account_id: &str) -> Flow {
        let phone = phone_from_account_id(account_id);
        let updated = self
            .inner
            .registry
            .update_current(id, generation, |r| {
                r.state = SessionState::Connected;
                r.pairing = None;
                r.pairing_attempts = 0;
                r.limit_armed = false;
                r.phone = Some(phone.clone());
            })
            .await;

        match updated {
            Some(()) => {
                info!(instance = %id, phone = %phone, "connection established");
                Flow::Continue
            }
            None => Flow::Detach,
        }
    }

    async fn on_closed(&self, id: &str, generation: u64, reason: CloseReason) {
        let registry = &self.inner.registry;

        if reason.logged_out {
            let socket = registry
                .update_current(id, generation, |r| {
                    r.state = SessionState::LoggedOut;
                    r.pairing = None;
                    r.phone = None;
                    r.pairing_attempts = 0;
                    r.limit_armed = false;
                    r.socket.take()
                })
                .await;
            let Some(socket) = socket else {
                return;
            };
            if let Some(socket) = socket {
                socket.release();
            }
            info!(instance = %id, "account unlinked remotely, purging credentials");
            if let Err(e) = self.inner.store.purge(id).await {
                warn!(instance = %id, "failed to purge credentials: {}", e);
            }
            return;
        }

        let dropped = registry
            .update_current(id, generation, |r| {
                r.pairing = None;
                let socket = r.socket.take();
                if r.limit_armed {
                    r.state = SessionState::QrLimitReached;
                    Dropped::Capped(socket)
                } else {
                    r.state = SessionState::Connecting;
                    Dropped::Retry(socket)
                }
            })
            .await;

        match dropped {
            None => {}
            Some(Dropped::Capped(socket)) => {
                if let Some(socket) = socket {
                    socket.release();
                }
                warn!(instance = %id, reason = %reason.message, "connection closed at pairing limit, not reconnecting");
            }
            Some(Dropped::Retry(socket)) => {
                if let Some(socket) = socket {
                    socket.release();
                }
                info!(
                    instance = %id,
                    reason = %reason.message,
                    status = ?reason.status_code,
                    "connection closed, reconnecting in {:?}",
                    self.inner.config.reconnect_delay
                );
                self.schedule_reconnect(id.to_string(), generation);
            }
        }
    }

    fn schedule_reconnect(&self, id: String, generation: u64) {
        let manager = self.clone();
        let delay = self.inner.config.reconnect_delay;
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let waiting = manager.inner.registry.get(&id).await.is_some_and(|r| {
                r.generation == generation && r.state == SessionState::Connecting
            });
            if !waiting {
                debug!(instance = %id, "reconnect no longer needed");
                return;
            }

            if let Err(e) = manager.initialize_with(&id, None, None).await {
                warn!(instance = %id, "reconnect failed: {}", e);
            }
        });
    }
}
