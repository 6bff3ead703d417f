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
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use tracing::debug;

use crate::fatal;
use crate::memory::offset_ptr::OffsetPtr;
use crate::memory::proxy::MemoryResourceProxy;

/// Typed allocation seam for containers placed into shared memory.
///
/// Handles are [`OffsetPtr`]s rather than raw pointers, so a container
/// storing its handle inside a shared region stays valid for peers.
/// `construct` is a separate hook so implementations can observe (or count)
/// element initialization separately from raw allocation.
pub trait Allocator<T>: Clone {
    /// Space for `count` contiguous elements. Fatal when the byte size
    /// overflows or the underlying resource is exhausted.
    fn allocate(&self, count: usize) -> OffsetPtr<T>;

    /// Returns space from a matching `allocate`. A null handle is ignored.
    fn deallocate(&self, pointer: OffsetPtr<T>, count: usize);

    /// Moves `value` into `slot`.
    ///
    /// # Safety
    /// `slot` must be valid for writes of `T` and within an allocation from
    /// this allocator.
    unsafe fn construct(&self, slot: *mut T, value: T) {
        unsafe { slot.write(value) }
    }
}

/// Allocator dispatching through a [`MemoryResourceProxy`].
///
/// With a proxy, allocations go to whatever resource the proxy identifies in
/// the current process; the proxy location itself is held as an `OffsetPtr`,
/// so an allocator embedded next to shared data keeps working for peers.
/// Without a proxy (the default), allocations fall back to the global heap,
/// letting the same container types run untouched outside shared memory.
///
/// The proxy must outlive the allocator; the handle does not keep the
/// resource alive.
pub struct PolymorphicOffsetPtrAllocator<T> {
    proxy: OffsetPtr<MemoryResourceProxy>,
    _marker: PhantomData<fn(T)>,
}

impl<T> PolymorphicOffsetPtrAllocator<T> {
    pub fn new(proxy: &MemoryResourceProxy) -> Self {
        Self {
            proxy: OffsetPtr::new(proxy as *const MemoryResourceProxy as *mut MemoryResourceProxy),
            _marker: PhantomData,
        }
    }

    pub fn has_proxy(&self) -> bool {
        !self.proxy.is_null()
    }

    fn byte_size(count: usize) -> usize {
        match count.checked_mul(size_of::<T>()) {
            Some(bytes) => bytes,
            None => fatal!("Allocation of {count} elements of {} bytes overflows", size_of::<T>()),
        }
    }

    fn heap_layout(bytes: usize) -> Layout {
        match Layout::from_size_align(bytes, align_of::<T>()) {
            Ok(layout) => layout,
            Err(error) => fatal!("Invalid heap layout of {bytes} bytes: {error}"),
        }
    }
}

impl<T> Allocator<T> for PolymorphicOffsetPtrAllocator<T> {
    fn allocate(&self, count: usize) -> OffsetPtr<T> {
        let bytes = Self::byte_size(count);
        if self.proxy.is_null() {
            // Zero-size heap layouts are not allocatable; a dangling aligned
            // pointer is the conventional stand-in.
            if bytes == 0 {
                return OffsetPtr::new(NonNull::<T>::dangling().as_ptr());
            }
            let pointer = unsafe { std::alloc::alloc(Self::heap_layout(bytes)) };
            if pointer.is_null() {
                fatal!("Global allocator failed for {bytes} bytes");
            }
            OffsetPtr::new(pointer.cast::<T>())
        } else {
            let proxy = unsafe { &*self.proxy.as_ptr() };
            let pointer = proxy.allocate(bytes, align_of::<T>());
            OffsetPtr::new(pointer.as_ptr().cast::<T>())
        }
    }

    fn deallocate(&self, pointer: OffsetPtr<T>, count: usize) {
        if pointer.is_null() {
            return;
        }
        let bytes = Self::byte_size(count);
        if self.proxy.is_null() {
            if bytes == 0 {
                return; // Dangling stand-in, nothing was allocated
            }
            unsafe { std::alloc::dealloc(pointer.as_ptr().cast::<u8>(), Self::heap_layout(bytes)) };
        } else {
            // The region owner may already have torn the mapping down while
            // this handle was still live; there is nothing left to return.
            let (Some(proxy), Some(raw)) = (self.proxy.try_as_ptr_for(1), pointer.try_as_ptr_for(count)) else {
                debug!("Deallocation of {count} elements skipped, owning region is gone");
                return;
            };
            let Some(raw) = NonNull::new(raw.cast::<u8>()) else {
                fatal!("Non-null offset pointer resolved to the null address");
            };
            unsafe { &*proxy }.deallocate(raw, bytes, align_of::<T>());
        }
    }
}

impl<T> Default for PolymorphicOffsetPtrAllocator<T> {
    fn default() -> Self {
        Self {
            proxy: OffsetPtr::null(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for PolymorphicOffsetPtrAllocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PolymorphicOffsetPtrAllocator<T> {}

/// Allocators compare equal when memory from one may be returned through the
/// other: both on the heap path, or both reaching the same resource.
impl<T> PartialEq for PolymorphicOffsetPtrAllocator<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.proxy.is_null(), other.proxy.is_null()) {
            (true, true) => true,
            (false, false) => unsafe { *self.proxy.as_ptr() == *other.proxy.as_ptr() },
            _ => false,
        }
    }
}

impl<T> Eq for PolymorphicOffsetPtrAllocator<T> {}

impl<T> std::fmt::Debug for PolymorphicOffsetPtrAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymorphicOffsetPtrAllocator").field("proxy", &self.proxy).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::resource::ManagedMemoryResource;
    use crate::memory::testing::{FixedBufferResource, next_test_id};

    #[test]
    fn test_heap_path_round_trip() {
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::default();
        let pointer = allocator.allocate(4);
        assert!(!pointer.is_null());
        let raw = pointer.as_ptr();
        for i in 0..4 {
            unsafe { allocator.construct(raw.add(i), i as u64 * 3) };
        }
        assert_eq!(unsafe { *raw.add(3) }, 9);
        allocator.deallocate(pointer, 4);
    }

    #[test]
    fn test_heap_path_zero_count() {
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::default();
        let pointer = allocator.allocate(0);
        assert!(!pointer.is_null());
        allocator.deallocate(pointer, 0);
    }

    #[test]
    fn test_proxy_path_allocates_from_resource() {
        let id = next_test_id();
        let resource = FixedBufferResource::new(id, 512);
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::new(resource.proxy());
        assert!(allocator.has_proxy());
        let pointer = allocator.allocate(8);
        let address = pointer.as_ptr() as usize;
        assert!(address >= resource.base_address().as_ptr() as usize);
        assert!(address + 64 <= resource.end_address().as_ptr() as usize);
        assert_eq!(resource.user_allocated_bytes(), 64);
        allocator.deallocate(pointer, 8);
    }

    #[test]
    fn test_deallocate_after_region_teardown_is_ignored() {
        let resource = FixedBufferResource::new(next_test_id(), 256);
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::new(resource.proxy());
        let pointer = allocator.allocate(4);
        drop(resource);
        allocator.deallocate(pointer, 4);
    }

    #[test]
    fn test_deallocating_null_is_ignored() {
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::default();
        allocator.deallocate(OffsetPtr::null(), 16);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_oversized_count_terminates() {
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::default();
        let _ = allocator.allocate(usize::MAX / 2);
    }

    #[test]
    fn test_equality_rules() {
        let default_a = PolymorphicOffsetPtrAllocator::<u32>::default();
        let default_b = PolymorphicOffsetPtrAllocator::<u32>::default();
        assert_eq!(default_a, default_b);

        let resource = FixedBufferResource::new(next_test_id(), 256);
        let with_proxy_a = PolymorphicOffsetPtrAllocator::<u32>::new(resource.proxy());
        let with_proxy_b = PolymorphicOffsetPtrAllocator::<u32>::new(resource.proxy());
        assert_eq!(with_proxy_a, with_proxy_b);
        assert_ne!(default_a, with_proxy_a);

        let other = FixedBufferResource::new(next_test_id(), 256);
        let with_other = PolymorphicOffsetPtrAllocator::<u32>::new(other.proxy());
        assert_ne!(with_proxy_a, with_other);
    }
}
