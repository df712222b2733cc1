//! Scene identity and the resources a scene holds on to.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    hash::ContentHash,
    storage::{ManagedResource, ResourceHashUsage},
};

/// Identifies a scene across client and renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneId(pub u64);

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene#{}", self.0)
    }
}

/// Resources a scene keeps alive on the producing side.
///
/// A scene either owns bytes (managed) or only refers to a hash that some file or
/// another producer will provide (hash usage). Both count as "used by the scene".
#[derive(Debug, Default)]
pub struct SceneResources {
    managed: BTreeMap<ContentHash, ManagedResource>,
    referenced: BTreeMap<ContentHash, ResourceHashUsage>,
}

impl SceneResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the scene already used this hash.
    pub fn add_resource(&mut self, resource: ManagedResource) -> bool {
        let hash = resource.hash();
        let fresh = !self.contains(hash);
        self.managed.insert(hash, resource);
        fresh
    }

    pub fn add_reference(&mut self, usage: ResourceHashUsage) -> bool {
        let hash = usage.hash();
        let fresh = !self.contains(hash);
        self.referenced.insert(hash, usage);
        fresh
    }

    /// Drops every claim the scene has on `hash`.
    pub fn remove(&mut self, hash: ContentHash) -> bool {
        let a = self.managed.remove(&hash).is_some();
        let b = self.referenced.remove(&hash).is_some();
        a || b
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.managed.contains_key(&hash) || self.referenced.contains_key(&hash)
    }

    /// All used hashes, sorted and unique.
    pub fn hashes(&self) -> Vec<ContentHash> {
        let mut out: Vec<ContentHash> = self
            .managed
            .keys()
            .chain(self.referenced.keys())
            .copied()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn managed_resources(&self) -> impl Iterator<Item = &ManagedResource> {
        self.managed.values()
    }

    pub fn len(&self) -> usize {
        self.hashes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managed.is_empty() && self.referenced.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        resource::{Resource, ResourceType},
        storage::ResourceStorage,
    };

    #[test]
    fn tracks_managed_and_referenced_hashes() {
        let storage = ResourceStorage::new();
        let res = storage.manage(
            Arc::new(Resource::new(ResourceType::VertexArray, vec![1u8; 12], bytes::Bytes::new(), 0, "v")),
            true,
        );
        let hash = res.hash();
        let pending = ContentHash::new(77, 1);

        let mut scene = SceneResources::new();
        assert!(scene.add_resource(res));
        assert!(scene.add_reference(storage.get_hash_usage(pending)));
        assert!(!scene.add_reference(storage.get_hash_usage(hash)));
        assert_eq!(scene.len(), 2);
        let mut expected = vec![hash, pending];
        expected.sort();
        assert_eq!(scene.hashes(), expected);

        assert!(scene.remove(hash));
        assert!(!storage.contains(hash));
        assert!(!scene.remove(hash));
        drop(scene);
        assert!(storage.is_empty());
    }
}
