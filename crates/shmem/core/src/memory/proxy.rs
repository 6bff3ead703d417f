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

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::fatal;
use crate::memory::registry::MemoryResourceRegistry;

static BOUNDS_CHECKING: AtomicBool = AtomicBool::new(true);

/// Enables or disables result bounds checking process-wide.
///
/// Applies to proxy allocations and offset pointer resolution. Enabled by
/// default; disabling trades the check for speed on hot paths and is only
/// sound once the peers writing the region are trusted. Returns the previous
/// setting.
pub fn set_bounds_checking(enabled: bool) -> bool {
    BOUNDS_CHECKING.swap(enabled, Ordering::Relaxed)
}

pub(crate) fn bounds_checking_enabled() -> bool {
    BOUNDS_CHECKING.load(Ordering::Relaxed)
}

/// Shareable stand-in for a memory resource.
///
/// A resource itself holds process-local state and cannot live in shared
/// memory; the proxy carries only the resource's stable identifier and is
/// `#[repr(C)]`, so peers may embed it in a shared region and allocate
/// through whichever resource instance is mapped into their own process.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResourceProxy {
    memory_resource_id: u64,
}

impl MemoryResourceProxy {
    pub fn new(memory_resource_id: u64) -> Self {
        Self { memory_resource_id }
    }

    pub fn id(&self) -> u64 {
        self.memory_resource_id
    }

    /// Allocates from the identified resource.
    ///
    /// Fatal when no resource with this identifier is registered in the
    /// current process: an allocation request cannot be dropped silently
    /// without corrupting the caller's expectations. With bounds checking
    /// enabled, a result outside the resource's registered region is fatal
    /// as well.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8> {
        let registry = MemoryResourceRegistry::global();
        let Some(resource) = registry.find(self.memory_resource_id) else {
            fatal!("Allocation of {bytes} bytes through unknown memory resource {} requested", self.memory_resource_id);
        };
        let pointer = resource.allocate(bytes, alignment);
        if bounds_checking_enabled() && !resource.is_bounds_check_bypassing_enabled() {
            if let Some(bounds) = registry.bounds(self.memory_resource_id) {
                if !bounds.contains(pointer.as_ptr() as usize, bytes) {
                    fatal!(
                        "Memory resource {} returned {:#x} ({bytes} bytes) outside its region {:#x}..{:#x}",
                        self.memory_resource_id,
                        pointer.as_ptr() as usize,
                        bounds.start(),
                        bounds.end()
                    );
                }
            }
        }
        pointer
    }

    /// Returns memory to the identified resource.
    ///
    /// A missing resource is ignored: the owner may legitimately have torn
    /// the mapping down already while peers still drop their data structures.
    pub fn deallocate(&self, pointer: NonNull<u8>, bytes: usize, alignment: usize) {
        match MemoryResourceRegistry::global().find(self.memory_resource_id) {
            Some(resource) => resource.deallocate(pointer, bytes, alignment),
            None => debug!(id = self.memory_resource_id, "Deallocation for unknown memory resource ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::resource::ManagedMemoryResource;
    use crate::memory::testing::{FixedBufferResource, next_test_id};

    #[test]
    fn test_allocate_forwards_to_registered_resource() {
        let id = next_test_id();
        let resource = FixedBufferResource::new(id, 256);
        let proxy = MemoryResourceProxy::new(id);
        let pointer = proxy.allocate(32, 8);
        let address = pointer.as_ptr() as usize;
        assert!(address >= resource.usable_base_address().as_ptr() as usize);
        assert!(address + 32 <= resource.end_address().as_ptr() as usize);
        assert_eq!(resource.user_allocated_bytes(), 32);
        proxy.deallocate(pointer, 32, 8);
    }

    #[test]
    #[should_panic(expected = "unknown memory resource")]
    fn test_allocate_with_unknown_id_terminates() {
        let proxy = MemoryResourceProxy::new(next_test_id());
        let _ = proxy.allocate(16, 8);
    }

    #[test]
    fn test_deallocate_with_unknown_id_is_ignored() {
        let proxy = MemoryResourceProxy::new(next_test_id());
        let mut byte = 0u8;
        proxy.deallocate(NonNull::from(&mut byte).cast(), 1, 1);
    }

    #[test]
    fn test_proxies_compare_by_identifier() {
        let id = next_test_id();
        assert_eq!(MemoryResourceProxy::new(id), MemoryResourceProxy::new(id));
        assert_ne!(MemoryResourceProxy::new(id), MemoryResourceProxy::new(id + 1));
    }

    #[test]
    fn test_proxy_layout_is_shareable() {
        // One u64, nothing process-local.
        assert_eq!(std::mem::size_of::<MemoryResourceProxy>(), 8);
    }
}
