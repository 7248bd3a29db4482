//! Contract capability resolution with a per-run memo.
//!
//! Whether a contract implements CIS-1/CIS-2 never changes once it is
//! deployed, so an answer, once obtained, is kept for the rest of the run.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cisindex_core::error::IndexerError;
use cisindex_core::node::{NodeClient, StandardIdentifier};
use cisindex_core::queue::Keyed;
use cisindex_core::store::{Collection, DocumentStore};
use cisindex_core::types::{ContractAddress, ContractInitialized};

/// Contract index → supports the capability set.
///
/// Owned by whoever drives a processing run and passed by `&mut` into every
/// decode call. Never persisted.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: HashMap<u64, bool>,
    hits: u64,
    misses: u64,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, contract_index: u64) -> Option<bool> {
        self.entries.get(&contract_index).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

// ─── Instance documents ──────────────────────────────────────────────────────

/// Stored description of a contract instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDocument {
    /// `<index,subindex>`
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v0: Option<InstanceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v1: Option<InstanceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Init function name, `init_<contract>`.
    pub name: String,
    pub source_module: String,
    pub amount: u64,
}

impl InstanceDocument {
    /// The instance record implied by a contract initialization.
    pub fn from_initialized(init: &ContractInitialized) -> Self {
        Self {
            id: init.address.to_string(),
            v0: None,
            v1: Some(InstanceInfo {
                name: init.init_name.clone(),
                source_module: init.origin_ref.clone(),
                amount: init.amount,
            }),
        }
    }
}

impl Keyed for InstanceDocument {
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// `init_cis2_nft` → `cis2_nft.supports`.
pub fn entrypoint_from_init_name(init_name: &str) -> String {
    let contract = init_name.strip_prefix("init_").unwrap_or(init_name);
    format!("{contract}.supports")
}

/// `cis2_nft.transfer` → `cis2_nft.supports`.
pub fn entrypoint_from_receive_name(receive_name: &str) -> String {
    let contract = receive_name.split('.').next().unwrap_or(receive_name);
    format!("{contract}.supports")
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Answers "does contract C support CIS-1 or CIS-2?".
#[derive(Clone)]
pub struct ContractCapabilityResolver {
    node: Arc<dyn NodeClient>,
    store: Arc<dyn DocumentStore>,
    standards: Vec<StandardIdentifier>,
}

impl ContractCapabilityResolver {
    pub fn new(node: Arc<dyn NodeClient>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            node,
            store,
            standards: vec![StandardIdentifier::Cis1, StandardIdentifier::Cis2],
        }
    }

    /// Cache-first capability check.
    ///
    /// A probe failure is returned to the caller and leaves the cache
    /// untouched, so a later call probes again.
    pub async fn supports(
        &self,
        address: ContractAddress,
        entrypoint: &str,
        cache: &mut CapabilityCache,
    ) -> Result<bool, IndexerError> {
        if let Some(known) = cache.get(address.index) {
            cache.hits += 1;
            return Ok(known);
        }
        cache.misses += 1;
        let supported = self
            .node
            .probe_standard_support(address, entrypoint, &self.standards)
            .await?;
        tracing::debug!(contract = %address, entrypoint, supported, "probed standard support");
        cache.entries.insert(address.index, supported);
        Ok(supported)
    }

    /// The `supports` entrypoint of a stored instance, derived from its v1
    /// init name. `None` when the instance is unknown or has no v1 record.
    pub async fn instance_entrypoint(
        &self,
        address: ContractAddress,
    ) -> Result<Option<String>, IndexerError> {
        let Some(doc) = self
            .store
            .find_one(Collection::Instances, &address.to_string())
            .await?
        else {
            return Ok(None);
        };
        let instance: InstanceDocument = doc.into_record()?;
        Ok(instance.v1.map(|v1| entrypoint_from_init_name(&v1.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cisindex_core::checkpoint::MemoryDocumentStore;
    use cisindex_core::node::MemoryNode;
    use cisindex_core::store::Document;

    fn resolver(node: Arc<MemoryNode>, store: Arc<MemoryDocumentStore>) -> ContractCapabilityResolver {
        ContractCapabilityResolver::new(node, store)
    }

    #[test]
    fn entrypoint_names() {
        assert_eq!(entrypoint_from_init_name("init_cis2_nft"), "cis2_nft.supports");
        assert_eq!(entrypoint_from_receive_name("cis2_nft.transfer"), "cis2_nft.supports");
        assert_eq!(entrypoint_from_receive_name("plain"), "plain.supports");
    }

    #[tokio::test]
    async fn cache_answers_after_first_probe() {
        let node = Arc::new(MemoryNode::new());
        node.set_support(5, true);
        let r = resolver(node.clone(), Arc::new(MemoryDocumentStore::new()));
        let mut cache = CapabilityCache::new();
        let addr = ContractAddress::new(5, 0);

        assert!(r.supports(addr, "a.supports", &mut cache).await.unwrap());
        node.set_support(5, false);
        assert!(r.supports(addr, "a.supports", &mut cache).await.unwrap());
        assert_eq!(node.probe_calls(), 1);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[tokio::test]
    async fn probe_failure_is_not_cached() {
        let node = Arc::new(MemoryNode::new());
        let r = resolver(node.clone(), Arc::new(MemoryDocumentStore::new()));
        let mut cache = CapabilityCache::new();
        let addr = ContractAddress::new(8, 0);

        assert!(r.supports(addr, "x.supports", &mut cache).await.is_err());
        assert!(cache.is_empty());

        node.set_support(8, true);
        assert!(r.supports(addr, "x.supports", &mut cache).await.unwrap());
        assert_eq!(node.probe_calls(), 2);
    }

    #[tokio::test]
    async fn instance_entrypoint_lookup() {
        let store = Arc::new(MemoryDocumentStore::new());
        let r = resolver(Arc::new(MemoryNode::new()), store.clone());
        let addr = ContractAddress::new(3, 0);
        assert_eq!(r.instance_entrypoint(addr).await.unwrap(), None);

        let v0_only = InstanceDocument {
            id: addr.to_string(),
            v0: Some(InstanceInfo {
                name: "init_old".into(),
                source_module: "m".into(),
                amount: 0,
            }),
            v1: None,
        };
        store
            .replace_one(Collection::Instances, Document::from_record(&v0_only).unwrap())
            .await
            .unwrap();
        assert_eq!(r.instance_entrypoint(addr).await.unwrap(), None);

        let v1 = InstanceDocument {
            v1: v0_only.v0.clone(),
            ..v0_only
        };
        store
            .replace_one(Collection::Instances, Document::from_record(&v1).unwrap())
            .await
            .unwrap();
        assert_eq!(r.instance_entrypoint(addr).await.unwrap().as_deref(), Some("old.supports"));
    }
}
