// Shmem
// Copyright (C) 2025 Shmem contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::fatal;
use crate::memory::resource::ManagedMemoryResource;

/// Identifier of a resource that does not exist. Offset pointers use it as
/// their null sentinel, so no real resource may register under it.
pub const NULL_RESOURCE_ID: u64 = 0;

/// Half-open address range `[start, end)` of a managed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionBounds {
    start: usize,
    end: usize,
}

impl MemoryRegionBounds {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Whether `[address, address + length)` lies fully inside the region.
    pub fn contains(&self, address: usize, length: usize) -> bool {
        address >= self.start && length <= self.end - self.start && address - self.start <= self.end - self.start - length
    }

    fn overlaps(&self, other: &MemoryRegionBounds) -> bool {
        self.start < other.end && other.start < self.end
    }
}

struct RegistryEntry {
    resource: Weak<dyn ManagedMemoryResource>,
    bounds: Option<MemoryRegionBounds>, // None for bounds-check bypassing resources
}

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<u64, RegistryEntry>,
    by_base: BTreeMap<usize, u64>, // region start -> id, non-bypassing only
}

/// Process-wide map from memory resource identifiers to live resources.
///
/// The registry holds weak references: registration does not keep a resource
/// alive, and a resource unregisters itself on drop. Proxies and offset
/// pointers read from shared memory carry only the `u64` identifier and use
/// this registry to reach the resource mapped into the current process.
pub struct MemoryResourceRegistry {
    inner: RwLock<RegistryState>,
}

impl MemoryResourceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryState::default()),
        }
    }

    /// The per-process singleton used by proxies and offset pointers.
    pub fn global() -> &'static MemoryResourceRegistry {
        static GLOBAL: OnceLock<MemoryResourceRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MemoryResourceRegistry::new)
    }

    /// Registers `resource` under `id`.
    ///
    /// Returns `false` without modifying the registry when `id` is already
    /// taken, or when the resource's region overlaps an already registered
    /// non-bypassing region. Fatal if `id` is the null identifier or the
    /// resource reports a null or empty region.
    pub fn insert(&self, id: u64, resource: &Arc<dyn ManagedMemoryResource>) -> bool {
        if id == NULL_RESOURCE_ID {
            fatal!("Cannot register a memory resource under the null identifier");
        }
        let start = resource.base_address().as_ptr() as usize;
        let end = resource.end_address().as_ptr() as usize;
        if end <= start {
            fatal!("Cannot register memory resource {id} with a null or empty region ({start:#x}..{end:#x})");
        }
        let bounds = MemoryRegionBounds::new(start, end);
        let bypassing = resource.is_bounds_check_bypassing_enabled();

        let mut state = self.inner.write();
        if state.by_id.contains_key(&id) {
            return false;
        }
        if !bypassing {
            let overlapping = state
                .by_id
                .values()
                .filter_map(|entry| entry.bounds.as_ref())
                .any(|existing| existing.overlaps(&bounds));
            if overlapping {
                return false;
            }
            state.by_base.insert(start, id);
        }
        state.by_id.insert(
            id,
            RegistryEntry {
                resource: Arc::downgrade(resource),
                bounds: (!bypassing).then_some(bounds),
            },
        );
        true
    }

    /// Looks up a live resource. Entries whose resource has been dropped
    /// behave as absent.
    pub fn find(&self, id: u64) -> Option<Arc<dyn ManagedMemoryResource>> {
        self.inner.read().by_id.get(&id).and_then(|entry| entry.resource.upgrade())
    }

    /// Region bounds registered for `id`. `None` for unknown identifiers and
    /// for bounds-check bypassing resources.
    pub fn bounds(&self, id: u64) -> Option<MemoryRegionBounds> {
        self.inner.read().by_id.get(&id).and_then(|entry| entry.bounds)
    }

    /// The registered region fully containing `[address, address + length)`,
    /// if any. Bypassing resources are never returned.
    pub fn region_containing(&self, address: usize, length: usize) -> Option<(u64, MemoryRegionBounds)> {
        let state = self.inner.read();
        let (_, id) = state.by_base.range(..=address).next_back()?;
        let bounds = state.by_id.get(id)?.bounds?;
        bounds.contains(address, length).then_some((*id, bounds))
    }

    pub fn remove(&self, id: u64) {
        let mut state = self.inner.write();
        if let Some(entry) = state.by_id.remove(&id) {
            if let Some(bounds) = entry.bounds {
                state.by_base.remove(&bounds.start());
            }
        } else {
            debug!(id, "Removal of unknown memory resource ignored");
        }
    }

    pub fn clear(&self) {
        let mut state = self.inner.write();
        state.by_id.clear();
        state.by_base.clear();
    }
}

impl Default for MemoryResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
