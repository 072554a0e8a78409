use super::validate::validate_definition;
use super::CaseDefinition;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read-only source of case definitions.
#[async_trait]
pub trait DefinitionProvider: Send + Sync {
    async fn get(&self, key: &str, version: u32) -> Result<Option<Arc<CaseDefinition>>>;
    async fn latest(&self, key: &str) -> Result<Option<Arc<CaseDefinition>>>;
}

// ── MemoryDefinitionProvider ──

type DefinitionKey = (String, u32);

/// In-memory DefinitionProvider.
///
/// Deployed versions are immutable: deploying the same key/version twice is
/// rejected. Definitions are validated on deploy.
pub struct MemoryDefinitionProvider {
    inner: RwLock<HashMap<DefinitionKey, Arc<CaseDefinition>>>,
}

impl MemoryDefinitionProvider {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn deploy(&self, def: CaseDefinition) -> Result<Arc<CaseDefinition>> {
        let errors = validate_definition(&def);
        if let Some(first) = errors.first() {
            return Err(anyhow!(
                "Cannot deploy {}:v{} ({} errors, first: {})",
                def.key,
                def.version,
                errors.len(),
                first
            ));
        }

        let key = (def.key.clone(), def.version);
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if store.contains_key(&key) {
            return Err(anyhow!(
                "Definition {}:v{} is already deployed",
                def.key,
                def.version
            ));
        }
        let def = Arc::new(def);
        store.insert(key, def.clone());
        tracing::debug!(key = %def.key, version = def.version, "Case definition deployed");
        Ok(def)
    }
}

impl Default for MemoryDefinitionProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionProvider for MemoryDefinitionProvider {
    async fn get(&self, key: &str, version: u32) -> Result<Option<Arc<CaseDefinition>>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.get(&(key.to_string(), version)).cloned())
    }

    async fn latest(&self, key: &str) -> Result<Option<Arc<CaseDefinition>>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .iter()
            .filter(|((k, _), _)| k == key)
            .max_by_key(|((_, v), _)| *v)
            .map(|(_, def)| def.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::fixtures::*;

    #[tokio::test]
    async fn test_latest_picks_highest_version() {
        let provider = MemoryDefinitionProvider::new();
        provider
            .deploy(CaseDefinition::new("c", 1, stage("root", vec![])))
            .unwrap();
        provider
            .deploy(CaseDefinition::new("c", 3, stage("root", vec![])))
            .unwrap();
        provider
            .deploy(CaseDefinition::new("other", 7, stage("root", vec![])))
            .unwrap();

        let latest = provider.latest("c").await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert!(provider.get("c", 2).await.unwrap().is_none());
        assert!(provider.latest("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_redeploy_rejected() {
        let provider = MemoryDefinitionProvider::new();
        provider
            .deploy(CaseDefinition::new("c", 1, stage("root", vec![])))
            .unwrap();
        let err = provider
            .deploy(CaseDefinition::new("c", 1, stage("root", vec![])))
            .unwrap_err();
        assert!(err.to_string().contains("already deployed"));
    }
}
