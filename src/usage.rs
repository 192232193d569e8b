//! Used-for registry
//!
//! Records what each single-use item (nonce, batch slot) was used for.
//! A second use for the same value is an idempotent success; a use for a
//! different value is refused before any signing arithmetic happens.

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Purpose tag for DKG generated Schnorr nonces
pub const SCHNORR_NONCE: &str = "schnorr-nonce";
/// Purpose tag for FROST batch slots
pub const FROST_NONCE: &str = "frost-nonce";

/// Registry of `(purpose, item) -> value` bindings
#[async_trait]
pub trait UsageRegistry: Send + Sync {
    /// Bind `item` to `value`, or confirm it is already bound to the same value
    async fn mark(&self, purpose: &str, item: &str, value: &str) -> Result<()>;

    /// Value an item is bound to, if any
    async fn used_for(&self, purpose: &str, item: &str) -> Result<Option<String>>;
}

type UsageMap = BTreeMap<String, BTreeMap<String, String>>;

fn bind(map: &mut UsageMap, purpose: &str, item: &str, value: &str) -> Result<bool> {
    let items = map.entry(purpose.to_string()).or_default();
    match items.get(item) {
        Some(existing) if existing == value => Ok(false),
        Some(existing) => Err(NodeError::ReplayOrMisuse(format!(
            "{} {} already used for {}",
            purpose, item, existing
        ))),
        None => {
            items.insert(item.to_string(), value.to_string());
            Ok(true)
        }
    }
}

/// In-memory registry, lost on restart
#[derive(Default)]
pub struct MemoryUsageRegistry {
    entries: Mutex<UsageMap>,
}

impl MemoryUsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRegistry for MemoryUsageRegistry {
    async fn mark(&self, purpose: &str, item: &str, value: &str) -> Result<()> {
        bind(&mut *self.entries.lock().await, purpose, item, value).map(|_| ())
    }

    async fn used_for(&self, purpose: &str, item: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .await
            .get(purpose)
            .and_then(|items| items.get(item))
            .cloned())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageFile {
    version: u8,
    entries: UsageMap,
}

/// Registry persisted as a JSON file, rewritten on every new binding
pub struct FileUsageRegistry {
    path: PathBuf,
    entries: Mutex<UsageMap>,
}

impl FileUsageRegistry {
    /// Open the registry, starting empty when the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            let file: UsageFile = serde_json::from_str(&json)?;
            file.entries
        } else {
            UsageMap::new()
        };
        tracing::debug!(
            path = %path.display(),
            purposes = entries.len(),
            "Opened used-for registry"
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &UsageMap) -> Result<()> {
        let json = serde_json::to_string_pretty(&UsageFile {
            version: 1,
            entries: entries.clone(),
        })
        .map_err(|e| NodeError::invalid(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl UsageRegistry for FileUsageRegistry {
    async fn mark(&self, purpose: &str, item: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if bind(&mut entries, purpose, item, value)? {
            if let Err(e) = self.persist(&entries).await {
                // a binding that is not on disk must not be used
                if let Some(items) = entries.get_mut(purpose) {
                    items.remove(item);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn used_for(&self, purpose: &str, item: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .await
            .get(purpose)
            .and_then(|items| items.get(item))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_reuse_same_value_is_idempotent() {
        let registry = MemoryUsageRegistry::new();
        assert_ok!(registry.mark(FROST_NONCE, "b1:0", "aa").await);
        assert_ok!(registry.mark(FROST_NONCE, "b1:0", "aa").await);
        assert_eq!(
            registry.used_for(FROST_NONCE, "b1:0").await.unwrap(),
            Some("aa".to_string())
        );
    }

    #[tokio::test]
    async fn test_reuse_other_value_rejected() {
        let registry = MemoryUsageRegistry::new();
        registry.mark(SCHNORR_NONCE, "n1", "m1").await.unwrap();
        let err = assert_err!(registry.mark(SCHNORR_NONCE, "n1", "m2").await);
        assert!(matches!(err, NodeError::ReplayOrMisuse(_)));
        // same item under another purpose is independent
        registry.mark(FROST_NONCE, "n1", "m2").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_registry_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("used-for.json");

        let registry = FileUsageRegistry::open(&path).unwrap();
        registry.mark(FROST_NONCE, "b1:3", "h1").await.unwrap();
        drop(registry);

        let reopened = FileUsageRegistry::open(&path).unwrap();
        assert!(matches!(
            reopened.mark(FROST_NONCE, "b1:3", "h2").await,
            Err(NodeError::ReplayOrMisuse(_))
        ));
        reopened.mark(FROST_NONCE, "b1:3", "h1").await.unwrap();
    }
}
