use crate::internal::common::Set;
use crate::internal::common::error::DsError;
use crate::internal::common::resources::map::CPU_RESOURCE_NAME;
use crate::internal::common::resources::{ResourceAmount, ResourceIndex};
use crate::internal::common::utils::format_comma_delimited;
use serde::{Deserialize, Serialize};

/// Shape of a single resource kind provided by a worker.
///
/// Indexed kinds (`List`, `Groups`, `Range`) are allocated by individual indices,
/// `Groups` additionally carries topology (e.g. cores of one socket form one group).
/// `Sum` kinds (e.g. memory) only track an amount.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ResourceDescriptorKind {
    List {
        values: Vec<ResourceIndex>,
    },
    Groups {
        groups: Vec<Vec<ResourceIndex>>,
    },
    Range {
        start: ResourceIndex,
        // inclusive
        end: ResourceIndex,
    },
    Sum {
        size: ResourceAmount,
    },
}

impl ResourceDescriptorKind {
    /// `n_sockets` groups of `socket_size` consecutive indices
    pub fn regular_sockets(n_sockets: u32, socket_size: u32) -> Self {
        assert!(n_sockets > 0);
        assert!(socket_size > 0);
        if n_sockets == 1 {
            return Self::simple_indices(socket_size);
        }
        let groups = (0..n_sockets)
            .map(|s| {
                (0..socket_size)
                    .map(|i| ResourceIndex::new(s * socket_size + i))
                    .collect()
            })
            .collect();
        ResourceDescriptorKind::Groups { groups }
    }

    pub fn simple_indices(size: u32) -> Self {
        assert!(size > 0);
        ResourceDescriptorKind::Range {
            start: ResourceIndex::new(0),
            end: ResourceIndex::new(size - 1),
        }
    }

    pub fn list(mut values: Vec<ResourceIndex>) -> crate::Result<Self> {
        let count = values.len();
        values.sort_unstable();
        values.dedup();
        if values.len() < count {
            return Err(DsError::validation(
                "Items in a list-based resource have to be unique",
            ));
        }
        Ok(ResourceDescriptorKind::List { values })
    }

    pub fn groups(mut groups: Vec<Vec<ResourceIndex>>) -> crate::Result<Self> {
        if groups.len() == 1 {
            return Self::list(groups.pop().unwrap_or_default());
        }
        let kind = ResourceDescriptorKind::Groups {
            groups: groups
                .into_iter()
                .map(|mut g| {
                    g.sort_unstable();
                    g
                })
                .collect(),
        };
        kind.validate()?;
        Ok(kind)
    }

    pub fn sum(size: u64) -> Self {
        ResourceDescriptorKind::Sum {
            size: ResourceAmount::new(size),
        }
    }

    pub fn n_groups(&self) -> usize {
        match self {
            ResourceDescriptorKind::Groups { groups } => groups.len(),
            _ => 1,
        }
    }

    pub fn size(&self) -> ResourceAmount {
        match self {
            ResourceDescriptorKind::List { values } => ResourceAmount::new(values.len() as u64),
            ResourceDescriptorKind::Range { start, end } if end >= start => {
                ResourceAmount::new((end.as_num() - start.as_num()) as u64 + 1)
            }
            ResourceDescriptorKind::Range { .. } => ResourceAmount::ZERO,
            ResourceDescriptorKind::Sum { size } => *size,
            ResourceDescriptorKind::Groups { groups } => {
                ResourceAmount::new(groups.iter().map(|g| g.len() as u64).sum())
            }
        }
    }

    /// Indices split into topology groups; a sum resource has no groups.
    pub fn as_groups(&self) -> Vec<Vec<ResourceIndex>> {
        match self {
            ResourceDescriptorKind::List { values } => vec![values.clone()],
            ResourceDescriptorKind::Groups { groups } => groups.clone(),
            ResourceDescriptorKind::Range { start, end } => {
                vec![
                    (start.as_num()..=end.as_num())
                        .map(ResourceIndex::new)
                        .collect(),
                ]
            }
            ResourceDescriptorKind::Sum { .. } => Vec::new(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self {
            ResourceDescriptorKind::List { values } => {
                let set: Set<_> = values.iter().collect();
                if set.len() != values.len() {
                    return Err(DsError::validation("Non unique indices"));
                }
            }
            ResourceDescriptorKind::Groups { groups } => {
                if groups.iter().any(|g| g.is_empty()) {
                    return Err(DsError::validation("Empty resource group"));
                }
                let set: Set<_> = groups.iter().flatten().collect();
                let size = groups.iter().map(|x| x.len()).sum::<usize>();
                if set.len() != size {
                    return Err(DsError::validation("Non unique indices"));
                }
            }
            ResourceDescriptorKind::Range { .. } | ResourceDescriptorKind::Sum { .. } => {}
        }
        Ok(())
    }
}

impl std::fmt::Display for ResourceDescriptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::List { values } => write!(f, "[{}]", format_comma_delimited(values)),
            Self::Groups { groups } => write!(
                f,
                "[{}]",
                format_comma_delimited(
                    groups
                        .iter()
                        .map(|g| format!("[{}]", format_comma_delimited(g)))
                )
            ),
            Self::Range { start, end } if start == end => write!(f, "[{start}]"),
            Self::Range { start, end } => write!(f, "range({start}-{end})"),
            Self::Sum { size } => write!(f, "sum({size})"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptorItem {
    pub name: String,
    pub kind: ResourceDescriptorKind,
}

impl ResourceDescriptorItem {
    pub fn range(name: &str, start: u32, end: u32) -> Self {
        ResourceDescriptorItem {
            name: name.to_string(),
            kind: ResourceDescriptorKind::Range {
                start: start.into(),
                end: end.into(),
            },
        }
    }

    pub fn sum(name: &str, size: u64) -> Self {
        ResourceDescriptorItem {
            name: name.to_string(),
            kind: ResourceDescriptorKind::sum(size),
        }
    }
}

/// Resources declared by a worker when it connects
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub resources: Vec<ResourceDescriptorItem>,
}

impl ResourceDescriptor {
    pub fn new(mut resources: Vec<ResourceDescriptorItem>) -> Self {
        resources.sort_by(|x, y| x.name.cmp(&y.name));
        ResourceDescriptor { resources }
    }

    pub fn simple_cpus(n_cpus: u32) -> Self {
        Self::sockets(1, n_cpus)
    }

    pub fn sockets(n_sockets: u32, n_cpus_per_socket: u32) -> Self {
        ResourceDescriptor::new(vec![ResourceDescriptorItem {
            name: CPU_RESOURCE_NAME.to_string(),
            kind: ResourceDescriptorKind::regular_sockets(n_sockets, n_cpus_per_socket),
        }])
    }

    pub fn with_item(mut self, item: ResourceDescriptorItem) -> Self {
        self.resources.push(item);
        self.resources.sort_by(|x, y| x.name.cmp(&y.name));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDescriptorKind> {
        self.resources
            .iter()
            .find(|item| item.name == name)
            .map(|item| &item.kind)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let mut has_cpus = false;
        for (i, item) in self.resources.iter().enumerate() {
            for item2 in &self.resources[i + 1..] {
                if item2.name == item.name {
                    return Err(DsError::validation(format!(
                        "Resource {} defined twice",
                        item.name
                    )));
                }
            }
            item.kind.validate().map_err(|e| {
                DsError::validation(format!(
                    "Invalid resource definition for {}: {e}",
                    item.name
                ))
            })?;
            if item.kind.size().is_zero() {
                return Err(DsError::validation(format!(
                    "Resource {} is empty",
                    item.name
                )));
            }
            if item.name == CPU_RESOURCE_NAME {
                has_cpus = true
            }
        }
        if !has_cpus {
            return Err(DsError::validation("Resource 'cpus' is missing"));
        }
        Ok(())
    }
}
