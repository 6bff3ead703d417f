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

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use crate::fatal;
use crate::memory::proxy::bounds_checking_enabled;
use crate::memory::registry::{MemoryResourceRegistry, NULL_RESOURCE_ID};

/// Relocatable pointer, safe to store inside a shared memory region.
///
/// Raw pointers written into shared memory are meaningless to peers: every
/// process maps the region at its own base address. An `OffsetPtr` instead
/// stores the owning resource's identifier plus the byte offset from the
/// region base, and resolves to a raw pointer through the process-local
/// registry on access. Being plain data, it survives bitwise moves and
/// copies, inside and outside of shared memory.
///
/// Pointers to process-local memory outside any registered region are kept
/// as absolute addresses (identifier 0); they resolve without a registry
/// lookup but are only meaningful within the creating process.
#[repr(C)]
pub struct OffsetPtr<T> {
    memory_resource_id: u64,
    offset: usize, // From region base; the absolute address when the id is 0
    _marker: PhantomData<*mut T>,
}

// Carries no aliasing state of its own; thread transfer is governed by the
// pointee type, as with raw pointers wrapped in owning containers.
unsafe impl<T: Send> Send for OffsetPtr<T> {}
unsafe impl<T: Sync> Sync for OffsetPtr<T> {}

impl<T> OffsetPtr<T> {
    pub fn null() -> Self {
        Self {
            memory_resource_id: NULL_RESOURCE_ID,
            offset: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.memory_resource_id == NULL_RESOURCE_ID && self.offset == 0
    }

    /// Captures `pointer` relative to the registered region containing it,
    /// falling back to the absolute address for unregistered memory.
    pub fn new(pointer: *mut T) -> Self {
        if pointer.is_null() {
            return Self::null();
        }
        let address = pointer as usize;
        match MemoryResourceRegistry::global().region_containing(address, size_of::<T>()) {
            Some((id, bounds)) => Self {
                memory_resource_id: id,
                offset: address - bounds.start(),
                _marker: PhantomData,
            },
            None => Self {
                memory_resource_id: NULL_RESOURCE_ID,
                offset: address,
                _marker: PhantomData,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(memory_resource_id: u64, offset: usize) -> Self {
        Self {
            memory_resource_id,
            offset,
            _marker: PhantomData,
        }
    }

    /// Resolves to a raw pointer valid in the current process, or null.
    ///
    /// Fatal when the owning region is not mapped into this process: a
    /// dangling region identifier means the pointee is gone while a handle to
    /// it is still live. With bounds checking enabled, an offset that does
    /// not leave room for a `T` inside the region is fatal as well.
    pub fn as_ptr(&self) -> *mut T {
        self.as_ptr_for(1)
    }

    /// Like [`as_ptr`](Self::as_ptr), validating that `len` contiguous
    /// elements starting at this pointer fit the owning region. Used by
    /// containers to validate a whole span through its endpoints at once.
    pub fn as_ptr_for(&self, len: usize) -> *mut T {
        match self.try_as_ptr_for(len) {
            Some(pointer) => pointer,
            None => fatal!("Offset pointer refers to unknown memory resource {}", self.memory_resource_id),
        }
    }

    /// Resolution that reports a torn-down region as `None` instead of
    /// terminating. Deallocation paths use this: the region owner may
    /// legitimately unmap while peers still drop their handles. Bounds
    /// violations inside a live region remain fatal.
    pub fn try_as_ptr_for(&self, len: usize) -> Option<*mut T> {
        if self.is_null() {
            return Some(std::ptr::null_mut());
        }
        if self.memory_resource_id == NULL_RESOURCE_ID {
            return Some(self.offset as *mut T);
        }
        let bounds = MemoryResourceRegistry::global().bounds(self.memory_resource_id)?;
        if bounds_checking_enabled() {
            let bytes = match len.checked_mul(size_of::<T>()) {
                Some(bytes) => bytes,
                None => fatal!("Offset pointer span of {len} elements overflows"),
            };
            let in_bounds = self.offset.checked_add(bytes).map(|end| end <= bounds.size()).unwrap_or(false);
            if !in_bounds {
                fatal!(
                    "Offset pointer (resource {}, offset {}, {bytes} bytes) leaves its region of {} bytes",
                    self.memory_resource_id,
                    self.offset,
                    bounds.size()
                );
            }
        }
        Some((bounds.start() + self.offset) as *mut T)
    }

    pub fn get(&self) -> Option<NonNull<T>> {
        NonNull::new(self.as_ptr())
    }
}

impl<T> Clone for OffsetPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OffsetPtr<T> {}

impl<T> PartialEq for OffsetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.memory_resource_id == other.memory_resource_id && self.offset == other.offset
    }
}

impl<T> Eq for OffsetPtr<T> {}

impl<T> std::fmt::Debug for OffsetPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetPtr").field("memory_resource_id", &self.memory_resource_id).field("offset", &self.offset).finish()
    }
}
