#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use session_manager::testing::ScriptedEngine;
use session_manager::{CredentialStore, ManagerConfig, SessionManager, SessionState};

/// Manager wired to a scripted engine and a throwaway credential folder.
///
/// Hold on to `dir` for the whole test; dropping it deletes the folder.
pub struct Fixture {
    pub engine: Arc<ScriptedEngine>,
    pub manager: SessionManager,
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn auth_path(&self, id: &str) -> std::path::PathBuf {
        self.dir.path().join(id)
    }
}

pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        reconnect_delay: Duration::from_millis(20),
        presence_delay: Duration::from_millis(1),
        batch_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(fast_config())
}

pub fn fixture_with(config: ManagerConfig) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = ScriptedEngine::new();
    let manager = SessionManager::new(engine.clone(), CredentialStore::new(dir.path()), config);
    Fixture {
        engine,
        manager,
        dir,
    }
}

/// Poll until `id` reaches `state`, panicking after two seconds.
pub async fn wait_for_state(manager: &SessionManager, id: &str, state: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if manager
                .registry()
                .get(id)
                .await
                .is_some_and(|s| s.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if reached.is_err() {
        let current = manager.registry().get(id).await.map(|s| s.state);
        panic!("{id} never reached {state}, currently {current:?}");
    }
}

/// Poll until `check` holds, panicking after two seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}
