//! Durable per-instance credential storage.
//!
//! Layout: `<root>/<instance id>/creds.json` holds the protocol credentials,
//! `<root>/<instance id>/metadata.json` the display name and creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SessionError};

const CREDS_FILE: &str = "creds.json";
const METADATA_FILE: &str = "metadata.json";

/// Account the credentials are bound to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Protocol credentials. Only the bound account is interpreted here; the
/// engine's key material is kept verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<AccountIdentity>,
    #[serde(flatten)]
    pub material: serde_json::Map<String, serde_json::Value>,
}

impl Credentials {
    /// Bound account identifier, if pairing ever completed.
    pub fn account_id(&self) -> Option<&str> {
        self.me
            .as_ref()
            .map(|me| me.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Extract the phone number from an account id such as
/// `51999000111:7@s.whatsapp.net`.
pub fn phone_from_account_id(account_id: &str) -> String {
    account_id
        .split([':', '@'])
        .next()
        .unwrap_or(account_id)
        .to_string()
}

/// Instance ids become directory names, so they must stay a single plain
/// path component.
pub fn validate_instance_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidInstanceId(id.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, id: &str) -> Result<PathBuf> {
        validate_instance_id(id)?;
        Ok(self.root.join(id))
    }

    /// Load credentials for `id`, creating an empty set if none exist.
    pub async fn load(&self, id: &str) -> Result<Credentials> {
        let dir = self.instance_dir(id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::io(id, e))?;

        match read_json::<Credentials>(&dir.join(CREDS_FILE), id).await? {
            Some(creds) => Ok(creds),
            None => {
                debug!(instance = %id, "no stored credentials, starting fresh");
                let creds = Credentials::default();
                write_json(&dir.join(CREDS_FILE), &creds, id).await?;
                Ok(creds)
            }
        }
    }

    pub async fn save(&self, id: &str, creds: &Credentials) -> Result<()> {
        let dir = self.instance_dir(id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::io(id, e))?;
        write_json(&dir.join(CREDS_FILE), creds, id).await
    }

    pub async fn has(&self, id: &str) -> bool {
        match self.instance_dir(id) {
            Ok(dir) => tokio::fs::try_exists(dir.join(CREDS_FILE))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Bound account id from stored credentials. `None` means the instance
    /// was never paired (or has no credentials at all).
    pub async fn resolve_account_identifier(&self, id: &str) -> Result<Option<String>> {
        let dir = self.instance_dir(id)?;
        let creds = read_json::<Credentials>(&dir.join(CREDS_FILE), id).await?;
        Ok(creds.and_then(|c| c.account_id().map(str::to_string)))
    }

    /// Irreversibly delete everything stored for `id`. Returns whether
    /// anything was there.
    pub async fn purge(&self, id: &str) -> Result<bool> {
        let dir = self.instance_dir(id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(instance = %id, "credential folder removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionError::io(id, e)),
        }
    }

    pub async fn read_metadata(&self, id: &str) -> Result<Option<InstanceMetadata>> {
        let dir = self.instance_dir(id)?;
        read_json(&dir.join(METADATA_FILE), id).await
    }

    /// Write `metadata` unless some already exists; returns what is stored.
    pub async fn write_metadata_if_absent(
        &self,
        id: &str,
        metadata: &InstanceMetadata,
    ) -> Result<InstanceMetadata> {
        if let Some(existing) = self.read_metadata(id).await? {
            return Ok(existing);
        }
        let dir = self.instance_dir(id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::io(id, e))?;
        write_json(&dir.join(METADATA_FILE), metadata, id).await?;
        Ok(metadata.clone())
    }

    /// Ids of every stored instance folder, sorted.
    pub async fn list_ids(&self) -> std::io::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_instance_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path, id: &str) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SessionError::format(id, e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::io(id, e)),
    }
}

/// Write through a temporary file so a crash never leaves half a file behind.
/// Each write gets its own temp name; concurrent writers race only on the
/// final rename, where the last one wins.
async fn write_json<T: Serialize>(path: &Path, value: &T, id: &str) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| SessionError::format(id, e))?;
    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| SessionError::io(id, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SessionError::io(id, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired(account: &str) -> Credentials {
        Credentials {
            me: Some(AccountIdentity {
                id: account.to_string(),
                name: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn load_creates_empty_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());

        assert!(!store.has("dev1").await);
        let creds = store.load("dev1").await.unwrap();
        assert_eq!(creds, Credentials::default());
        assert!(store.has("dev1").await);

        // Idempotent
        let again = store.load("dev1").await.unwrap();
        assert_eq!(again, creds);
    }

    #[tokio::test]
    async fn save_keeps_engine_material() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());

        let mut creds = paired("51999000111:3@s.whatsapp.net");
        creds
            .material
            .insert("noiseKey".into(), serde_json::json!({"private": "abc"}));
        store.save("dev1", &creds).await.unwrap();

        let loaded = store.load("dev1").await.unwrap();
        assert_eq!(loaded, creds);
        assert_eq!(loaded.material["noiseKey"]["private"], "abc");
    }

    #[tokio::test]
    async fn resolve_account_identifier_distinguishes_paired() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());

        assert_eq!(store.resolve_account_identifier("none").await.unwrap(), None);

        store.load("fresh").await.unwrap();
        assert_eq!(store.resolve_account_identifier("fresh").await.unwrap(), None);

        store
            .save("paired", &paired("51999000111:3@s.whatsapp.net"))
            .await
            .unwrap();
        assert_eq!(
            store
                .resolve_account_identifier("paired")
                .await
                .unwrap()
                .as_deref(),
            Some("51999000111:3@s.whatsapp.net")
        );
    }

    #[tokio::test]
    async fn corrupt_credentials_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join("dev1")).unwrap();
        std::fs::write(tmp.path().join("dev1/creds.json"), "{not json").unwrap();

        let err = store.load("dev1").await.unwrap_err();
        assert_eq!(err.error_code(), "credential_format");
    }

    #[tokio::test]
    async fn purge_removes_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        store.load("dev1").await.unwrap();

        assert!(store.purge("dev1").await.unwrap());
        assert!(!tmp.path().join("dev1").exists());
        assert!(!store.purge("dev1").await.unwrap());
    }

    #[tokio::test]
    async fn metadata_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());

        let first = InstanceMetadata {
            name: "Sales".into(),
            created_at: "2025-01-01T00:00:00Z".parse().unwrap(),
        };
        let second = InstanceMetadata {
            name: "Renamed".into(),
            created_at: Utc::now(),
        };

        assert_eq!(
            store.write_metadata_if_absent("dev1", &first).await.unwrap(),
            first
        );
        assert_eq!(
            store
                .write_metadata_if_absent("dev1", &second)
                .await
                .unwrap(),
            first
        );

        let raw = std::fs::read_to_string(tmp.path().join("dev1/metadata.json")).unwrap();
        assert!(raw.contains("createdAt"), "camelCase expected: {raw}");
    }

    #[tokio::test]
    async fn list_ids_skips_files_and_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("auth"));
        assert!(store.list_ids().await.unwrap().is_empty());

        store.load("b-instance").await.unwrap();
        store.load("a-instance").await.unwrap();
        std::fs::write(tmp.path().join("auth/stray.txt"), "x").unwrap();

        assert_eq!(
            store.list_ids().await.unwrap(),
            vec!["a-instance".to_string(), "b-instance".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_to_one_instance_all_succeed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.load("dev1").await.map(|_| ())
                } else {
                    store.save("dev1", &paired("51999000111:1@s.whatsapp.net")).await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("dev1"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
        // Whichever rename landed last, the file is whole
        store.load("dev1").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        for bad in ["", "..", "a/b", "../escape", "with space"] {
            let err = store.load(bad).await.unwrap_err();
            assert_eq!(err.error_code(), "invalid_instance_id", "id {bad:?}");
        }
    }

    #[test]
    fn phone_from_account_id_strips_device_and_server() {
        assert_eq!(
            phone_from_account_id("51999000111:7@s.whatsapp.net"),
            "51999000111"
        );
        assert_eq!(phone_from_account_id("51999000111@s.whatsapp.net"), "51999000111");
        assert_eq!(phone_from_account_id("51999000111"), "51999000111");
    }
}
