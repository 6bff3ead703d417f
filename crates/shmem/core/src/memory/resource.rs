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

use std::any::Any;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::fatal;
use crate::memory::layout::{is_power_of_two, max_alignment};
use crate::memory::proxy::MemoryResourceProxy;

/// Polymorphic allocation seam.
///
/// Mirrors the split between the public checked entry points and the
/// `do_`-prefixed hooks implementers provide: `allocate` validates the
/// request before dispatching, so every concrete resource can rely on a
/// power-of-two alignment.
pub trait MemoryResource: Send + Sync + 'static {
    /// Allocates `bytes` with the given alignment. Fatal if `alignment` is
    /// not a power of two, exceeds the worst-case alignment, or if the
    /// resource cannot satisfy the request.
    fn allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8> {
        if !is_power_of_two(alignment) {
            fatal!("Allocation alignment {alignment} must be a non-zero power of two");
        }
        // Region bases are only guaranteed worst-case aligned; above that,
        // padding would depend on where a process happens to map the region
        // and peers replaying the same allocation sequence would disagree on
        // the cursor.
        if alignment > max_alignment() {
            fatal!("Allocation alignment {alignment} exceeds the worst-case alignment {}", max_alignment());
        }
        self.do_allocate(bytes, alignment)
    }

    /// Returns memory obtained from this resource. The pointer, size and
    /// alignment must match a previous `allocate` on the same resource.
    fn deallocate(&self, pointer: NonNull<u8>, bytes: usize, alignment: usize) {
        self.do_deallocate(pointer, bytes, alignment);
    }

    fn do_allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8>;

    fn do_deallocate(&self, pointer: NonNull<u8>, bytes: usize, alignment: usize);

    /// Whether memory allocated from `self` can be deallocated through
    /// `other` and vice versa.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// A memory resource managing one contiguous region with a stable identity.
///
/// The resource itself cannot live in shared memory (it holds process-local
/// state such as a mapping), so peers identify it through the
/// [`MemoryResourceProxy`] stored inside the region instead.
pub trait ManagedMemoryResource: MemoryResource {
    /// Proxy identifying this resource; placed so that it may be referred to
    /// from inside the managed region.
    fn proxy(&self) -> &MemoryResourceProxy;

    /// Start of the managed region (e.g. the mapping result).
    fn base_address(&self) -> NonNull<u8>;

    /// First byte after the resource's own management data, i.e. the start of
    /// the space available to users.
    fn usable_base_address(&self) -> NonNull<u8>;

    /// Past-the-end address of the managed region.
    fn end_address(&self) -> NonNull<u8>;

    /// Bytes handed out to users so far, including alignment padding inserted
    /// between user allocations but excluding management data.
    fn user_allocated_bytes(&self) -> usize;

    /// Bypassing resources cover a fictitious region (e.g. the whole heap)
    /// and are excluded from region-bounds tracking and bounds checks.
    fn is_bounds_check_bypassing_enabled(&self) -> bool {
        false
    }
}

/// Typed construct/destruct helpers on top of the byte-level resource API.
pub trait ManagedMemoryResourceExt: ManagedMemoryResource {
    /// Allocates space for a `T` inside the managed region and moves `value`
    /// into it.
    fn construct<T>(&self, value: T) -> NonNull<T> {
        let memory = self.allocate(size_of::<T>(), align_of::<T>()).cast::<T>();
        // The region outlives the value; the resource handed us exclusive,
        // correctly aligned space.
        unsafe { memory.as_ptr().write(value) };
        memory
    }

    /// Drops the value in place and returns its space to the resource.
    ///
    /// # Safety
    /// `pointer` must come from `construct` on this resource and must not be
    /// used afterwards.
    unsafe fn destruct<T>(&self, pointer: NonNull<T>) {
        unsafe { pointer.as_ptr().drop_in_place() };
        self.deallocate(pointer.cast::<u8>(), size_of::<T>(), align_of::<T>());
    }
}

impl<R: ManagedMemoryResource + ?Sized> ManagedMemoryResourceExt for R {}
