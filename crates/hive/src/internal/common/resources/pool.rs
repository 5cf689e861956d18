use crate::internal::common::Map;
use crate::internal::common::resources::allocation::{Allocation, ResourceAllocation};
use crate::internal::common::resources::descriptor::{ResourceDescriptor, ResourceDescriptorKind};
use crate::internal::common::resources::map::ResourceIdMap;
use crate::internal::common::resources::request::{AllocationRequest, ResourceRequest};
use crate::internal::common::resources::{ResourceAmount, ResourceId, ResourceIndex};
use smallvec::SmallVec;

#[derive(Debug)]
enum KindPool {
    Indices {
        // Free indices of each topology group, every group kept sorted
        free: Vec<Vec<ResourceIndex>>,
        group_of: Map<ResourceIndex, usize>,
        max_group_size: usize,
        n_free: usize,
        total: usize,
    },
    Sum {
        free: ResourceAmount,
        total: ResourceAmount,
    },
}

impl KindPool {
    fn new(kind: &ResourceDescriptorKind) -> Self {
        match kind {
            ResourceDescriptorKind::Sum { size } => KindPool::Sum {
                free: *size,
                total: *size,
            },
            _ => {
                let free = kind.as_groups();
                let group_of = free
                    .iter()
                    .enumerate()
                    .flat_map(|(g, indices)| indices.iter().map(move |idx| (*idx, g)))
                    .collect();
                let total = free.iter().map(|g| g.len()).sum();
                KindPool::Indices {
                    max_group_size: free.iter().map(|g| g.len()).max().unwrap_or(0),
                    free,
                    group_of,
                    n_free: total,
                    total,
                }
            }
        }
    }

    fn free_amount(&self) -> ResourceAmount {
        match self {
            KindPool::Indices { n_free, .. } => ResourceAmount::new(*n_free as u64),
            KindPool::Sum { free, .. } => *free,
        }
    }

    fn total_amount(&self) -> ResourceAmount {
        match self {
            KindPool::Indices { total, .. } => ResourceAmount::new(*total as u64),
            KindPool::Sum { total, .. } => *total,
        }
    }

    fn can_allocate(&self, request: &AllocationRequest) -> bool {
        match (self, request) {
            (KindPool::Indices { n_free, total, .. }, AllocationRequest::All) => n_free == total,
            (KindPool::Sum { free, total }, AllocationRequest::All) => free == total,
            (KindPool::Indices { free, .. }, AllocationRequest::ForceCompact(amount)) => {
                let amount = amount.as_u64() as usize;
                free.iter().any(|g| g.len() >= amount)
            }
            (
                KindPool::Indices { n_free, .. },
                AllocationRequest::Compact(amount) | AllocationRequest::Scatter(amount),
            ) => *n_free >= amount.as_u64() as usize,
            (
                KindPool::Sum { free, .. },
                AllocationRequest::Compact(amount)
                | AllocationRequest::ForceCompact(amount)
                | AllocationRequest::Scatter(amount),
            ) => free >= amount,
        }
    }

    fn is_capable(&self, request: &AllocationRequest) -> bool {
        match (self, request) {
            (_, AllocationRequest::All) => true,
            (KindPool::Indices { max_group_size, .. }, AllocationRequest::ForceCompact(amount)) => {
                *max_group_size >= amount.as_u64() as usize
            }
            (pool, request) => pool.total_amount() >= request.min_amount(),
        }
    }

    /// Caller has to check `can_allocate` first.
    fn allocate(&mut self, resource_id: ResourceId, request: &AllocationRequest) -> ResourceAllocation {
        match self {
            KindPool::Sum { free, total } => {
                let amount = request.amount(*total);
                assert!(*free >= amount);
                *free -= amount;
                ResourceAllocation {
                    resource_id,
                    amount,
                    indices: SmallVec::new(),
                }
            }
            KindPool::Indices { free, n_free, .. } => {
                let indices = match request {
                    AllocationRequest::All => {
                        let mut indices: SmallVec<_> = free.iter_mut().flat_map(std::mem::take).collect();
                        indices.sort_unstable();
                        indices
                    }
                    AllocationRequest::ForceCompact(amount) => {
                        let amount = amount.as_u64() as usize;
                        let group = best_fit_group(free, amount)
                            .expect("ForceCompact allocation without a fitting group");
                        free[group].drain(..amount).collect()
                    }
                    AllocationRequest::Compact(amount) => {
                        let amount = amount.as_u64() as usize;
                        if let Some(group) = best_fit_group(free, amount) {
                            free[group].drain(..amount).collect()
                        } else {
                            take_from_largest_groups(free, amount)
                        }
                    }
                    AllocationRequest::Scatter(amount) => {
                        take_round_robin(free, amount.as_u64() as usize)
                    }
                };
                assert!(*n_free >= indices.len());
                *n_free -= indices.len();
                ResourceAllocation {
                    resource_id,
                    amount: ResourceAmount::new(indices.len() as u64),
                    indices,
                }
            }
        }
    }

    fn release(&mut self, allocation: &ResourceAllocation) {
        match self {
            KindPool::Sum { free, total } => {
                *free += allocation.amount;
                assert!(*free <= *total, "Sum resource released more than once");
            }
            KindPool::Indices {
                free,
                group_of,
                n_free,
                total,
                ..
            } => {
                for idx in &allocation.indices {
                    let group = &mut free[group_of[idx]];
                    match group.binary_search(idx) {
                        Ok(_) => panic!("Resource index {idx} released more than once"),
                        Err(pos) => group.insert(pos, *idx),
                    }
                }
                *n_free += allocation.indices.len();
                assert!(*n_free <= *total);
            }
        }
    }

    fn can_claim(&self, allocation: &ResourceAllocation) -> bool {
        match self {
            KindPool::Sum { free, .. } => *free >= allocation.amount,
            KindPool::Indices { free, group_of, .. } => allocation.indices.iter().all(|idx| {
                group_of
                    .get(idx)
                    .is_some_and(|g| free[*g].binary_search(idx).is_ok())
            }),
        }
    }

    fn claim(&mut self, allocation: &ResourceAllocation) {
        match self {
            KindPool::Sum { free, .. } => *free -= allocation.amount,
            KindPool::Indices {
                free,
                group_of,
                n_free,
                ..
            } => {
                for idx in &allocation.indices {
                    let group = &mut free[group_of[idx]];
                    if let Ok(pos) = group.binary_search(idx) {
                        group.remove(pos);
                    }
                }
                *n_free -= allocation.indices.len();
            }
        }
    }
}

/// The smallest group that still has `amount` free indices; ties resolved by group order.
fn best_fit_group(free: &[Vec<ResourceIndex>], amount: usize) -> Option<usize> {
    free.iter()
        .enumerate()
        .filter(|(_, g)| g.len() >= amount)
        .min_by_key(|(i, g)| (g.len(), *i))
        .map(|(i, _)| i)
}

fn take_from_largest_groups(
    free: &mut [Vec<ResourceIndex>],
    mut amount: usize,
) -> SmallVec<[ResourceIndex; 4]> {
    let mut order: Vec<usize> = (0..free.len()).collect();
    order.sort_by_key(|i| (std::cmp::Reverse(free[*i].len()), *i));
    let mut result = SmallVec::new();
    for i in order {
        if amount == 0 {
            break;
        }
        let take = amount.min(free[i].len());
        result.extend(free[i].drain(..take));
        amount -= take;
    }
    result.sort_unstable();
    result
}

fn take_round_robin(
    free: &mut [Vec<ResourceIndex>],
    mut amount: usize,
) -> SmallVec<[ResourceIndex; 4]> {
    let mut result = SmallVec::new();
    while amount > 0 {
        let mut progress = false;
        for group in free.iter_mut() {
            if amount == 0 {
                break;
            }
            if !group.is_empty() {
                result.push(group.remove(0));
                amount -= 1;
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }
    result.sort_unstable();
    result
}

/// Free and committed resources of one worker.
///
/// The pool is the allocation ledger of a worker: every reservation goes through
/// [`ResourcePool::try_allocate`] (server) or [`ResourcePool::try_claim`] (worker agent)
/// and is returned by [`ResourcePool::release`]. Committed amounts can therefore never
/// exceed what the worker declared.
#[derive(Debug)]
pub struct ResourcePool {
    pools: Vec<Option<KindPool>>,
}

impl ResourcePool {
    pub fn new(descriptor: &ResourceDescriptor, resource_map: &ResourceIdMap) -> Self {
        let mut pools: Vec<Option<KindPool>> = Vec::new();
        for item in &descriptor.resources {
            let Some(id) = resource_map.get_index(&item.name) else {
                log::warn!("Resource '{}' is not known to the server", item.name);
                continue;
            };
            let idx = id.as_num() as usize;
            if pools.len() <= idx {
                pools.resize_with(idx + 1, || None);
            }
            pools[idx] = Some(KindPool::new(&item.kind));
        }
        ResourcePool { pools }
    }

    #[inline]
    fn get(&self, resource_id: ResourceId) -> Option<&KindPool> {
        self.pools
            .get(resource_id.as_num() as usize)
            .and_then(|p| p.as_ref())
    }

    #[inline]
    fn get_mut(&mut self, resource_id: ResourceId) -> Option<&mut KindPool> {
        self.pools
            .get_mut(resource_id.as_num() as usize)
            .and_then(|p| p.as_mut())
    }

    pub fn free_amount(&self, resource_id: ResourceId) -> ResourceAmount {
        self.get(resource_id)
            .map(|p| p.free_amount())
            .unwrap_or(ResourceAmount::ZERO)
    }

    pub fn total_amount(&self, resource_id: ResourceId) -> ResourceAmount {
        self.get(resource_id)
            .map(|p| p.total_amount())
            .unwrap_or(ResourceAmount::ZERO)
    }

    /// True when nothing is allocated from this pool
    pub fn is_fully_free(&self) -> bool {
        self.pools
            .iter()
            .flatten()
            .all(|p| p.free_amount() == p.total_amount())
    }

    /// Could the request be satisfied right now?
    pub fn can_allocate(&self, request: &ResourceRequest) -> bool {
        debug_assert!(!request.is_multi_node());
        request.entries().iter().all(|entry| {
            self.get(entry.resource_id)
                .is_some_and(|p| p.can_allocate(&entry.request))
        })
    }

    /// Could the request be satisfied by this worker if it were completely free?
    pub fn is_capable_to_run(&self, request: &ResourceRequest) -> bool {
        request.entries().iter().all(|entry| {
            self.get(entry.resource_id)
                .is_some_and(|p| p.is_capable(&entry.request))
        })
    }

    /// Reserves all requested kinds or nothing.
    pub fn try_allocate(&mut self, request: &ResourceRequest) -> Option<Allocation> {
        if !self.can_allocate(request) {
            return None;
        }
        let mut allocation = Allocation::new();
        for entry in request.entries() {
            let pool = self
                .get_mut(entry.resource_id)
                .expect("Pool disappeared during allocation");
            allocation.add_resource_allocation(pool.allocate(entry.resource_id, &entry.request));
        }
        Some(allocation)
    }

    pub fn release(&mut self, allocation: &Allocation) {
        for ra in &allocation.resources {
            let pool = self
                .get_mut(ra.resource_id)
                .unwrap_or_else(|| panic!("Releasing unknown resource {}", ra.resource_id));
            pool.release(ra);
        }
    }

    /// Takes exactly the given slice, used by a worker agent for a slice chosen by the server.
    /// Returns false (and takes nothing) when any part of the slice is not free.
    pub fn try_claim(&mut self, allocation: &Allocation) -> bool {
        let claimable = allocation.resources.iter().all(|ra| {
            self.get(ra.resource_id)
                .is_some_and(|pool| pool.can_claim(ra))
        });
        if !claimable {
            return false;
        }
        for ra in &allocation.resources {
            if let Some(pool) = self.get_mut(ra.resource_id) {
                pool.claim(ra);
            }
        }
        true
    }

    /// Free units of one kind, used as a packing score.
    pub fn free_units_of(&self, resource_id: ResourceId) -> u64 {
        self.free_amount(resource_id).as_u64()
    }

    /// Nothing of any kind is left
    pub fn is_exhausted(&self) -> bool {
        self.pools.iter().flatten().all(|p| p.free_amount().is_zero())
    }
}
