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

use std::alloc::Layout;
use std::any::Any;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fatal;
use crate::memory::proxy::MemoryResourceProxy;
use crate::memory::registry::{MemoryResourceRegistry, NULL_RESOURCE_ID};
use crate::memory::resource::{ManagedMemoryResource, MemoryResource};
use crate::memory::shared::bump_allocation;

// Never dereferenced; keeps the fictitious region away from the null page.
const FICTITIOUS_BASE: usize = 4096;

struct HeapState {
    live: HashMap<usize, Layout>,
    mirrored_cursor: usize, // Padding-inclusive, as the bump resource would count
}

/// Heap-backed stand-in for a shared memory resource.
///
/// Used where data structures built for shared memory run purely
/// process-locally (tests, single-process deployments): allocations come from
/// the global heap, while the padding bookkeeping of the bump resource is
/// mirrored over a fictitious region, so `user_allocated_bytes` reports the
/// same value a real region would for the same allocation sequence.
///
/// The fictitious region spans page one to the end of the address space and
/// would overlap any real region, so the resource registers as bounds-check
/// bypassing; offset pointers into its allocations stay process-local
/// absolute addresses.
pub struct HeapDelegateMemoryResource {
    memory_identifier: u64,
    proxy: MemoryResourceProxy,
    state: Mutex<HeapState>,
}

impl HeapDelegateMemoryResource {
    /// Registers the resource under an explicit identifier. Fatal if the
    /// identifier is null or already taken: the caller wired it up to match a
    /// peer, so falling back silently would misroute allocations.
    pub fn new(memory_identifier: u64) -> Arc<Self> {
        if memory_identifier == NULL_RESOURCE_ID {
            fatal!("Heap delegate resource requires a non-null identifier");
        }
        let resource = Arc::new(Self {
            memory_identifier,
            proxy: MemoryResourceProxy::new(memory_identifier),
            state: Mutex::new(HeapState {
                live: HashMap::new(),
                mirrored_cursor: 0,
            }),
        });
        let managed: Arc<dyn ManagedMemoryResource> = resource.clone();
        if !MemoryResourceRegistry::global().insert(memory_identifier, &managed) {
            fatal!("Heap delegate resource cannot be registered: identifier {memory_identifier} is already in use in this process");
        }
        resource
    }

    pub fn memory_identifier(&self) -> u64 {
        self.memory_identifier
    }
}

impl MemoryResource for HeapDelegateMemoryResource {
    fn do_allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8> {
        // Zero-size layouts are not allocatable; a unique minimal allocation
        // keeps the returned pointers distinct, like the original operator.
        let layout = match Layout::from_size_align(bytes.max(1), alignment) {
            Ok(layout) => layout,
            Err(error) => fatal!("Invalid heap layout of {bytes} bytes aligned to {alignment}: {error}"),
        };
        let mut state = self.state.lock();
        let pointer = unsafe { std::alloc::alloc(layout) };
        let Some(pointer) = NonNull::new(pointer) else {
            fatal!("Heap delegate resource {}: global allocator failed for {bytes} bytes", self.memory_identifier);
        };
        state.live.insert(pointer.as_ptr() as usize, layout);
        // Mirror what a bump region would consume for this request. The
        // synthetic end always fits, only the padding result matters.
        let start = FICTITIOUS_BASE + state.mirrored_cursor;
        if let Some((_, consumed)) = bump_allocation(start, start + bytes + (alignment - 1), bytes, alignment) {
            state.mirrored_cursor += consumed;
        }
        pointer
    }

    fn do_deallocate(&self, pointer: NonNull<u8>, bytes: usize, _alignment: usize) {
        let mut state = self.state.lock();
        let Some(layout) = state.live.remove(&(pointer.as_ptr() as usize)) else {
            fatal!(
                "Heap delegate resource {}: deallocation of {bytes} bytes at {:#x} does not match a live allocation",
                self.memory_identifier,
                pointer.as_ptr() as usize
            );
        };
        unsafe { std::alloc::dealloc(pointer.as_ptr(), layout) };
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        other.as_any().downcast_ref::<Self>().is_some_and(|other| std::ptr::eq(other, self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ManagedMemoryResource for HeapDelegateMemoryResource {
    fn proxy(&self) -> &MemoryResourceProxy {
        &self.proxy
    }

    fn base_address(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(FICTITIOUS_BASE as *mut u8) }
    }

    fn usable_base_address(&self) -> NonNull<u8> {
        self.base_address()
    }

    fn end_address(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(usize::MAX as *mut u8) }
    }

    fn user_allocated_bytes(&self) -> usize {
        self.state.lock().mirrored_cursor
    }

    fn is_bounds_check_bypassing_enabled(&self) -> bool {
        true
    }
}

impl Drop for HeapDelegateMemoryResource {
    fn drop(&mut self) {
        MemoryResourceRegistry::global().remove(self.memory_identifier);
        let state = self.state.get_mut();
        for (address, layout) in state.live.drain() {
            unsafe { std::alloc::dealloc(address as *mut u8, layout) };
        }
    }
}
