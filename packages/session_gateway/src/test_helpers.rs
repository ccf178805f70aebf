use std::sync::Arc;
use std::time::Duration;

use session_manager::testing::ScriptedEngine;
use session_manager::{CredentialStore, ManagerConfig, SessionManager, SessionState};

use crate::AppState;

/// Build an `AppState` backed by a scripted engine and a temporary
/// credential folder at `<tmp>/auth`.
///
/// Callers **must** hold the `TempDir` for the lifetime of the test.
pub fn test_app_state() -> (AppState, Arc<ScriptedEngine>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let engine = ScriptedEngine::new();
    let config = ManagerConfig {
        reconnect_delay: Duration::from_millis(20),
        presence_delay: Duration::from_millis(1),
        batch_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let manager = SessionManager::new(
        engine.clone(),
        CredentialStore::new(tmp.path().join("auth")),
        config,
    );
    (AppState::new(manager), engine, tmp)
}

pub async fn wait_for_state(state: &AppState, id: &str, expected: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(status) = state.manager.get_status(id).await {
                if status.state == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{id} never reached {expected}");
}
