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

/// Test support: a bounded in-memory memory resource.
///
/// Behaves like the mmap-backed bump resource, but over a heap buffer, so
/// tests exercise registry, proxy, offset pointer and container behavior
/// without touching the filesystem. Not part of the supported API surface.
use std::any::Any;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::fatal;
use crate::memory::proxy::MemoryResourceProxy;
use crate::memory::registry::MemoryResourceRegistry;
use crate::memory::resource::{ManagedMemoryResource, MemoryResource};
use crate::memory::shared::bump_allocation;

/// Identifiers unique within the test process. The registry is global and
/// the test harness runs in parallel threads, so every test takes fresh ids.
pub fn next_test_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0x7e57_0000_0000_0001);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Fixed-capacity bump resource over an owned, worst-case-aligned buffer.
pub struct FixedBufferResource {
    storage: Option<Box<[UnsafeCell<u128>]>>, // None when aliasing another resource's region
    _parent: Option<Arc<FixedBufferResource>>,
    base: usize,
    end: usize,
    cursor: Mutex<usize>, // Bytes consumed from base, padding included
    proxy: MemoryResourceProxy,
    registered: bool,
}

// Allocations are carved out under the cursor lock and never overlap.
unsafe impl Send for FixedBufferResource {}
unsafe impl Sync for FixedBufferResource {}

impl FixedBufferResource {
    /// A resource of at least `size` bytes, registered in the global
    /// registry under `id`. Unregisters on drop.
    pub fn new(id: u64, size: usize) -> Arc<Self> {
        let resource = Self::build(id, size, true);
        let managed: Arc<dyn ManagedMemoryResource> = resource.clone();
        if !MemoryResourceRegistry::global().insert(id, &managed) {
            fatal!("Test resource id {id} is already in use; tests must take ids from next_test_id");
        }
        resource
    }

    /// Like [`new`](Self::new), without touching the global registry. For
    /// tests driving a registry instance of their own.
    pub fn unregistered(id: u64, size: usize) -> Arc<Self> {
        Self::build(id, size, false)
    }

    /// A resource reporting the same region bounds as `other`, for overlap
    /// scenarios. Never allocates.
    pub fn aliasing(id: u64, other: &Arc<FixedBufferResource>) -> Arc<Self> {
        Arc::new(Self {
            storage: None,
            _parent: Some(Arc::clone(other)),
            base: other.base,
            end: other.end,
            cursor: Mutex::new(0),
            proxy: MemoryResourceProxy::new(id),
            registered: false,
        })
    }

    fn build(id: u64, size: usize, registered: bool) -> Arc<Self> {
        let words = size.div_ceil(std::mem::size_of::<u128>()).max(1);
        let storage: Box<[UnsafeCell<u128>]> = (0..words).map(|_| UnsafeCell::new(0)).collect();
        let base = storage[0].get() as usize;
        Arc::new(Self {
            end: base + words * std::mem::size_of::<u128>(),
            storage: Some(storage),
            _parent: None,
            base,
            cursor: Mutex::new(0),
            proxy: MemoryResourceProxy::new(id),
            registered,
        })
    }
}

impl MemoryResource for FixedBufferResource {
    fn do_allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8> {
        let mut cursor = self.cursor.lock();
        match bump_allocation(self.base + *cursor, self.end, bytes, alignment) {
            Some((address, consumed)) => {
                *cursor += consumed;
                // Inside the owned buffer, hence non-null.
                unsafe { NonNull::new_unchecked(address as *mut u8) }
            }
            None => fatal!(
                "Test resource {} exhausted: requested {bytes} bytes aligned to {alignment}, {} of {} bytes free",
                self.proxy.id(),
                self.end - self.base - *cursor,
                self.end - self.base
            ),
        }
    }

    fn do_deallocate(&self, _pointer: NonNull<u8>, _bytes: usize, _alignment: usize) {}

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        other.as_any().downcast_ref::<Self>().is_some_and(|other| other.base == self.base)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ManagedMemoryResource for FixedBufferResource {
    fn proxy(&self) -> &MemoryResourceProxy {
        &self.proxy
    }

    fn base_address(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base as *mut u8) }
    }

    fn usable_base_address(&self) -> NonNull<u8> {
        self.base_address()
    }

    fn end_address(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.end as *mut u8) }
    }

    fn user_allocated_bytes(&self) -> usize {
        *self.cursor.lock()
    }
}

impl Drop for FixedBufferResource {
    fn drop(&mut self) {
        if self.registered {
            MemoryResourceRegistry::global().remove(self.proxy.id());
        }
    }
}
