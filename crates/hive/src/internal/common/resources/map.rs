use crate::internal::common::Map;
use crate::internal::common::error::DsError;
use crate::internal::common::resources::ResourceId;
use serde::{Deserialize, Serialize};

pub const CPU_RESOURCE_ID: ResourceId = ResourceId::new(0);

pub const CPU_RESOURCE_NAME: &str = "cpus";
pub const NVIDIA_GPU_RESOURCE_NAME: &str = "gpus/nvidia";
pub const AMD_GPU_RESOURCE_NAME: &str = "gpus/amd";
pub const MEM_RESOURCE_NAME: &str = "mem";

/// Translation of resource names into dense ids, owned by the server core.
///
/// A name gets an id either because it is one of the preregistered kinds,
/// or because a worker declared it. Requests may only refer to registered names.
#[derive(Debug)]
pub struct GlobalResourceMapping {
    resource_names: Map<String, ResourceId>,
}

impl Default for GlobalResourceMapping {
    fn default() -> Self {
        Self::new(&[
            MEM_RESOURCE_NAME,
            NVIDIA_GPU_RESOURCE_NAME,
            AMD_GPU_RESOURCE_NAME,
        ])
    }
}

impl GlobalResourceMapping {
    pub fn new(known_kinds: &[&str]) -> Self {
        let mut mapping = GlobalResourceMapping {
            resource_names: Map::default(),
        };
        // cpus always have id 0
        mapping.get_or_allocate_resource_id(CPU_RESOURCE_NAME);
        for name in known_kinds {
            mapping.get_or_allocate_resource_id(name);
        }
        mapping
    }

    pub fn get_or_allocate_resource_id(&mut self, name: &str) -> ResourceId {
        match self.resource_names.get(name) {
            Some(&id) => id,
            None => {
                let id = ResourceId::new(self.resource_names.len() as u32);
                log::debug!("New resource kind registered '{name}' as {id}");
                self.resource_names.insert(name.to_string(), id);
                id
            }
        }
    }

    pub fn get_resource_id(&self, name: &str) -> crate::Result<ResourceId> {
        self.resource_names.get(name).copied().ok_or_else(|| {
            DsError::validation(format!(
                "Resource request refers to an undeclared resource kind '{name}'"
            ))
        })
    }

    #[inline]
    pub fn n_resources(&self) -> usize {
        self.resource_names.len()
    }

    /// Create an immutable snapshot of the name map.
    pub fn create_resource_id_map(&self) -> ResourceIdMap {
        let mut resource_names: Vec<(&String, &ResourceId)> = self.resource_names.iter().collect();
        resource_names.sort_unstable_by_key(|(_, id)| **id);
        ResourceIdMap {
            resource_names: resource_names
                .into_iter()
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

/// Snapshot of id → name translation; sent to workers so they can name
/// allocated resources in the task environment.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceIdMap {
    resource_names: Vec<String>,
}

impl ResourceIdMap {
    #[inline]
    pub fn from_vec(resource_names: Vec<String>) -> Self {
        Self { resource_names }
    }

    #[inline]
    pub fn into_vec(self) -> Vec<String> {
        self.resource_names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.resource_names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resource_names.is_empty()
    }

    #[inline]
    pub fn get_index(&self, name: &str) -> Option<ResourceId> {
        self.resource_names
            .iter()
            .position(|n| n == name)
            .map(|id| ResourceId::new(id as u32))
    }

    #[inline]
    pub fn get_name(&self, index: ResourceId) -> Option<&str> {
        self.resource_names
            .get(index.as_num() as usize)
            .map(|s| s.as_str())
    }
}
