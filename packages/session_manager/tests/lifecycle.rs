mod common;

use std::time::Duration;

use common::{fast_config, fixture, fixture_with, wait_for_state, wait_until};
use session_manager::testing::EngineCall;
use session_manager::{
    AccountIdentity, CloseReason, CredentialStore, Credentials, EngineError, EngineEvent,
    InstanceMetadata, ManagerConfig, SessionState,
};

const ACCOUNT: &str = "51999000111:7@s.whatsapp.net";

fn paired(account: &str) -> Credentials {
    Credentials {
        me: Some(AccountIdentity {
            id: account.to_string(),
            name: None,
        }),
        ..Default::default()
    }
}

fn pairing_code(n: u32) -> EngineEvent {
    EngineEvent::PairingCode(format!("2@code-{n}"))
}

fn opened() -> EngineEvent {
    EngineEvent::Open {
        account_id: ACCOUNT.to_string(),
    }
}

fn dropped() -> EngineEvent {
    EngineEvent::Closed(CloseReason::dropped("connection lost"))
}

// ── initialize ──

#[tokio::test]
async fn initialize_creates_record_and_credential_folder() {
    let f = fixture();

    let snapshot = f.manager.initialize("dev1", Some("Sales")).await.unwrap();
    assert_eq!(snapshot.id, "dev1");
    assert_eq!(snapshot.display_name, "Sales");
    assert_eq!(snapshot.state, SessionState::Initializing);
    assert_eq!(snapshot.pairing_attempts, 0);
    assert!(snapshot.live);

    assert_eq!(f.engine.open_count("dev1"), 1);
    assert!(f.auth_path("dev1").join("creds.json").exists());

    let raw = std::fs::read_to_string(f.auth_path("dev1").join("metadata.json")).unwrap();
    let metadata: InstanceMetadata = serde_json::from_str(&raw).unwrap();
    assert_eq!(metadata.name, "Sales");
}

#[tokio::test]
async fn initialize_defaults_name_to_id() {
    let f = fixture();
    let snapshot = f.manager.initialize("dev1", None).await.unwrap();
    assert_eq!(snapshot.display_name, "dev1");
}

#[tokio::test]
async fn initialize_rejects_path_like_ids() {
    let f = fixture();
    let err = f.manager.initialize("../escape", None).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_instance_id");
    assert!(f.manager.registry().is_empty().await);
    assert_eq!(f.engine.open_count("../escape"), 0);
}

#[tokio::test]
async fn initialize_uses_reported_version() {
    let f = fixture();
    f.engine.set_version("2.3000.5555");
    f.manager.initialize("dev1", None).await.unwrap();
    assert_eq!(f.engine.last_open("dev1").unwrap().version, "2.3000.5555");
}

#[tokio::test]
async fn initialize_falls_back_to_configured_version() {
    let f = fixture_with(ManagerConfig {
        fallback_version: "9.9.9".into(),
        ..fast_config()
    });
    f.manager.initialize("dev1", None).await.unwrap();
    assert_eq!(f.engine.last_open("dev1").unwrap().version, "9.9.9");
}

#[tokio::test]
async fn initialize_while_connected_returns_existing() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();
    f.engine.emit("dev1", opened()).await;
    wait_for_state(&f.manager, "dev1", SessionState::Connected).await;

    let snapshot = f.manager.initialize("dev1", Some("Renamed")).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert_eq!(snapshot.display_name, "dev1");
    assert_eq!(f.engine.open_count("dev1"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initialize_opens_one_session() {
    let f = fixture();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let manager = f.manager.clone();
        tasks.spawn(async move { manager.initialize("dev1", None).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let snapshot = joined.unwrap().unwrap();
        assert_eq!(snapshot.id, "dev1");
    }

    assert_eq!(f.engine.open_count("dev1"), 1);
    assert_eq!(f.engine.live_count(), 1);
    assert_eq!(f.manager.registry().len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_restart_and_initialize_keep_one_live_session() {
    let f = fixture();

    for round in 0..30 {
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let manager = f.manager.clone();
            tasks.spawn(async move {
                if i % 2 == 0 {
                    manager.restart("dev1", None).await
                } else {
                    manager.initialize("dev1", None).await
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            // A call overtaken by a restart may find the record mid-swap;
            // storage itself must never fail.
            if let Err(e) = joined.unwrap() {
                assert_ne!(e.error_code(), "credential_io", "round {round}: {e}");
                assert_ne!(e.error_code(), "credential_format", "round {round}: {e}");
            }
        }

        assert_eq!(f.engine.live_count(), 1, "round {round}");
        let status = f.manager.get_status("dev1").await.unwrap();
        assert_eq!(status.state, SessionState::Initializing, "round {round}");
    }

    let leftovers: Vec<_> = std::fs::read_dir(f.auth_path("dev1"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn logout_during_initialize_leaves_no_folder_behind() {
    let f = fixture();

    for i in 0..100 {
        let id = format!("dev{i}");
        let initializing = {
            let manager = f.manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.initialize(&id, None).await })
        };
        tokio::task::yield_now().await;
        let logged_out = f.manager.logout(&id).await;
        let _ = initializing.await.unwrap();

        if logged_out {
            assert!(!f.auth_path(&id).exists(), "{id} folder survived logout");
            assert!(f.manager.get_status(&id).await.is_err());
        }
    }
}

#[tokio::test]
async fn unreadable_credentials_leave_instance_disconnected() {
    let f = fixture();
    std::fs::create_dir_all(f.auth_path("dev1")).unwrap();
    std::fs::write(f.auth_path("dev1").join("creds.json"), "{broken").unwrap();

    let err = f.manager.initialize("dev1", None).await.unwrap_err();
    assert_eq!(err.error_code(), "credential_format");

    let status = f.manager.get_status("dev1").await.unwrap();
    assert_eq!(status.state, SessionState::Disconnected);
    assert_eq!(f.engine.open_count("dev1"), 0);
}

#[tokio::test]
async fn failed_open_is_retried() {
    let f = fixture();
    f.engine
        .fail_next_open(EngineError::Transport("handshake refused".into()));

    let snapshot = f.manager.initialize("dev1", None).await.unwrap();
    assert!(!snapshot.live);

    wait_until("reconnect", || f.engine.open_count("dev1") == 2).await;
    assert_eq!(f.engine.live_count(), 1);
}

// ── lifecycle events ──

#[tokio::test]
async fn pairing_code_is_published() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();

    f.engine.emit("dev1", pairing_code(1)).await;
    wait_for_state(&f.manager, "dev1", SessionState::QrReady).await;

    let status = f.manager.get_status("dev1").await.unwrap();
    assert_eq!(status.pairing_artifact.as_deref(), Some("2@code-1"));
    assert!(status.pairing_issued_at.is_some());
    assert_eq!(
        f.manager.registry().get("dev1").await.unwrap().pairing_attempts,
        1
    );
}

#[tokio::test]
async fn open_connects_and_resets_pairing() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();

    f.engine.emit("dev1", pairing_code(1)).await;
    f.engine.emit("dev1", pairing_code(2)).await;
    f.engine.emit("dev1", opened()).await;
    wait_for_state(&f.manager, "dev1", SessionState::Connected).await;

    let snapshot = f.manager.registry().get("dev1").await.unwrap();
    assert_eq!(snapshot.pairing_attempts, 0);
    assert_eq!(snapshot.phone.as_deref(), Some("51999000111"));

    let status = f.manager.get_status("dev1").await.unwrap();
    assert!(status.pairing_artifact.is_none());
    assert_eq!(status.phone_identifier.as_deref(), Some("51999000111"));
}

#[tokio::test]
async fn dropped_connection_reconnects_and_keeps_attempts() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();

    f.engine.emit("dev1", pairing_code(1)).await;
    f.engine.emit("dev1", pairing_code(2)).await;
    f.engine.emit("dev1", dropped()).await;

    wait_until("reconnect", || f.engine.open_count("dev1") == 2).await;
    assert!(f.engine.is_closed(0));

    let snapshot = f.manager.registry().get("dev1").await.unwrap();
    assert_eq!(snapshot.pairing_attempts, 2);
    assert!(snapshot.pairing.is_none());
    assert_eq!(snapshot.state.as_str(), "connecting");
}

#[tokio::test]
async fn pairing_cap_stops_reconnection() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();

    for n in 1..=4 {
        f.engine.emit("dev1", pairing_code(n)).await;
    }
    f.engine.emit("dev1", dropped()).await;
    wait_for_state(&f.manager, "dev1", SessionState::QrLimitReached).await;

    // Well past the reconnect delay
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.engine.open_count("dev1"), 1);
    assert_eq!(f.engine.live_count(), 0);

    let status = f.manager.get_status("dev1").await.unwrap();
    assert_eq!(status.state, SessionState::QrLimitReached);
    assert!(status.pairing_artifact.is_none());

    let err = f.manager.initialize("dev1", None).await.unwrap_err();
    assert_eq!(err.error_code(), "pairing_cap_exceeded");
    assert_eq!(f.engine.open_count("dev1"), 1);
}

#[tokio::test]
async fn pairing_cap_counts_across_reconnects() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();

    f.engine.emit("dev1", pairing_code(1)).await;
    f.engine.emit("dev1", pairing_code(2)).await;
    f.engine.emit("dev1", dropped()).await;
    wait_until("reconnect", || f.engine.open_count("dev1") == 2).await;

    f.engine.emit("dev1", pairing_code(3)).await;
    f.engine.emit("dev1", dropped()).await;
    wait_for_state(&f.manager, "dev1", SessionState::QrLimitReached).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.engine.open_count("dev1"), 2);
}

#[tokio::test]
async fn restart_clears_pairing_limit() {
    let f = fixture();
    f.manager.initialize("dev1", Some("Sales")).await.unwrap();
    for n in 1..=3 {
        f.engine.emit("dev1", pairing_code(n)).await;
    }
    f.engine.emit("dev1", dropped()).await;
    wait_for_state(&f.manager, "dev1", SessionState::QrLimitReached).await;

    let snapshot = f.manager.restart("dev1", None).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Initializing);
    assert_eq!(snapshot.pairing_attempts, 0);
    assert_eq!(snapshot.display_name, "Sales");
    assert_eq!(f.engine.open_count("dev1"), 2);

    f.engine.emit("dev1", pairing_code(4)).await;
    wait_for_state(&f.manager, "dev1", SessionState::QrReady).await;
    assert_eq!(
        f.manager.registry().get("dev1").await.unwrap().pairing_attempts,
        1
    );
}

#[tokio::test]
async fn restart_unknown_instance_initializes_it() {
    let f = fixture();
    let snapshot = f.manager.restart("dev1", Some("Fresh")).await.unwrap();
    assert_eq!(snapshot.display_name, "Fresh");
    assert_eq!(f.engine.open_count("dev1"), 1);
}

#[tokio::test]
async fn stale_socket_events_are_ignored() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();
    f.manager.restart("dev1", None).await.unwrap();
    assert!(f.engine.is_closed(0));
    assert_eq!(f.engine.latest_session("dev1"), Some(1));

    f.engine.emit_to(0, opened()).await;
    f.engine.emit_to(0, dropped()).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let snapshot = f.manager.registry().get("dev1").await.unwrap();
    assert_eq!(snapshot.state, SessionState::Initializing);
    assert!(snapshot.phone.is_none());
    assert_eq!(f.engine.open_count("dev1"), 2);

    f.engine.emit("dev1", pairing_code(1)).await;
    wait_for_state(&f.manager, "dev1", SessionState::QrReady).await;
}

#[tokio::test]
async fn remote_unlink_keeps_record_as_logged_out() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();
    f.engine.emit("dev1", opened()).await;
    wait_for_state(&f.manager, "dev1", SessionState::Connected).await;

    f.engine
        .emit(
            "dev1",
            EngineEvent::Closed(CloseReason::unlinked("device removed")),
        )
        .await;
    wait_for_state(&f.manager, "dev1", SessionState::LoggedOut).await;
    let folder = f.auth_path("dev1");
    wait_until("credential purge", || !folder.exists()).await;

    let listed = f.manager.list_all().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SessionState::LoggedOut);
    assert!(listed[0].phone_number.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.engine.open_count("dev1"), 1);

    // Re-initializing starts a fresh pairing flow
    f.manager.initialize("dev1", None).await.unwrap();
    assert_eq!(f.engine.open_count("dev1"), 2);
    assert!(
        f.engine
            .last_open("dev1")
            .unwrap()
            .credentials
            .account_id()
            .is_none()
    );
}

#[tokio::test]
async fn rotated_credentials_are_persisted() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();

    f.engine
        .emit("dev1", EngineEvent::CredentialsUpdated(paired(ACCOUNT)))
        .await;

    let creds = f.auth_path("dev1").join("creds.json");
    wait_until("credential save", || {
        std::fs::read_to_string(&creds).is_ok_and(|raw| raw.contains(ACCOUNT))
    })
    .await;

    let store = CredentialStore::new(f.dir.path());
    assert_eq!(
        store
            .resolve_account_identifier("dev1")
            .await
            .unwrap()
            .as_deref(),
        Some(ACCOUNT)
    );
}

// ── logout / delete ──

#[tokio::test]
async fn logout_survives_failed_unlink() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();
    f.engine.emit("dev1", opened()).await;
    wait_for_state(&f.manager, "dev1", SessionState::Connected).await;

    f.engine.fail_logout(true);
    assert!(f.manager.logout("dev1").await);

    let err = f.manager.get_status("dev1").await.unwrap_err();
    assert_eq!(err.error_code(), "not_found");
    assert!(!f.auth_path("dev1").exists());
    assert!(f.manager.list_all().await.is_empty());

    let calls = f.engine.calls_for("dev1");
    assert!(calls.contains(&EngineCall::Logout {
        instance: "dev1".into()
    }));
    assert!(f.engine.is_closed(0));
}

#[tokio::test]
async fn logout_unknown_instance() {
    let f = fixture();
    assert!(!f.manager.logout("ghost").await);
}

#[tokio::test]
async fn delete_removes_stored_only_instance() {
    let f = fixture();
    let store = CredentialStore::new(f.dir.path());
    store.save("old", &paired(ACCOUNT)).await.unwrap();

    f.manager.delete("old").await.unwrap();
    assert!(!f.auth_path("old").exists());

    let err = f.manager.delete("old").await.unwrap_err();
    assert_eq!(err.error_code(), "not_found");
}

#[tokio::test]
async fn delete_live_instance() {
    let f = fixture();
    f.manager.initialize("dev1", None).await.unwrap();
    f.manager.delete("dev1").await.unwrap();

    assert!(!f.manager.registry().contains("dev1").await);
    assert!(!f.auth_path("dev1").exists());
    assert_eq!(f.engine.live_count(), 0);
}

// ── resurrection ──

#[tokio::test]
async fn resurrect_resumes_only_paired_instances() {
    let f = fixture();
    let store = CredentialStore::new(f.dir.path());

    store.save("paired", &paired(ACCOUNT)).await.unwrap();
    let created_at = "2025-03-01T12:00:00Z".parse().unwrap();
    store
        .write_metadata_if_absent(
            "paired",
            &InstanceMetadata {
                name: "Front desk".into(),
                created_at,
            },
        )
        .await
        .unwrap();
    store.load("unpaired").await.unwrap();

    let resumed = f.manager.resurrect().await.unwrap();
    assert_eq!(resumed, vec!["paired".to_string()]);

    let snapshot = f.manager.registry().get("paired").await.unwrap();
    assert_eq!(snapshot.display_name, "Front desk");
    assert_eq!(snapshot.created_at, created_at);
    assert_eq!(snapshot.phone.as_deref(), Some("51999000111"));

    assert!(!f.manager.registry().contains("unpaired").await);
    assert_eq!(f.engine.open_count("unpaired"), 0);
    assert_eq!(
        f.engine
            .last_open("paired")
            .unwrap()
            .credentials
            .account_id(),
        Some(ACCOUNT)
    );
}

#[tokio::test]
async fn resurrect_with_empty_store() {
    let f = fixture();
    assert!(f.manager.resurrect().await.unwrap().is_empty());
}

// ── shutdown ──

#[tokio::test]
async fn shutdown_closes_sessions_and_keeps_credentials() {
    let f = fixture();
    f.manager.initialize("a", None).await.unwrap();
    f.manager.initialize("b", None).await.unwrap();

    assert_eq!(f.manager.shutdown().await, 2);
    assert_eq!(f.engine.live_count(), 0);
    assert!(f.manager.registry().is_empty().await);
    assert!(f.auth_path("a").join("creds.json").exists());
    assert!(
        !f.engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Logout { .. }))
    );
}

#[tokio::test]
async fn shutdown_cancels_pending_reconnect() {
    let f = fixture_with(ManagerConfig {
        reconnect_delay: Duration::from_millis(150),
        ..fast_config()
    });
    f.manager.initialize("dev1", None).await.unwrap();
    f.engine.emit("dev1", dropped()).await;
    wait_for_state(&f.manager, "dev1", SessionState::Connecting).await;

    f.manager.shutdown().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(f.engine.open_count("dev1"), 1);
}
