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

use std::mem::needs_drop;
use std::ops::{Index, IndexMut};

use bytemuck::Zeroable;

use shmem_core::fatal;
use shmem_core::memory::allocator::{Allocator, PolymorphicOffsetPtrAllocator};
use shmem_core::memory::offset_ptr::OffsetPtr;

/// Contiguous array whose size is fixed at construction.
///
/// Unlike a vector there is no growth and no spare capacity: one allocation
/// holds exactly `len` elements for the container's whole lifetime, which is
/// what a monotonic shared-memory resource can support. The element handle is
/// an [`OffsetPtr`], so an array headquartered inside a shared region remains
/// meaningful to peers mapping the region elsewhere.
///
/// An empty array holds a null handle and owns no allocation; this pairing is
/// an invariant at every observable point.
pub struct DynamicArray<T, A: Allocator<T> = PolymorphicOffsetPtrAllocator<T>> {
    data: OffsetPtr<T>,
    size: usize,
    allocator: A,
}

impl<T, A: Allocator<T>> DynamicArray<T, A> {
    /// `size` default-initialized elements from `allocator`.
    pub fn new_in(size: usize, allocator: A) -> Self
    where
        T: Default,
    {
        let data = Self::allocate_handle(&allocator, size);
        if size > 0 {
            let raw = data.as_ptr_for(size);
            for index in 0..size {
                unsafe { allocator.construct(raw.add(index), T::default()) };
            }
        }
        Self { data, size, allocator }
    }

    /// `size` zeroed elements from `allocator` with a single fill; no
    /// per-element construction takes place.
    pub fn zeroed_in(size: usize, allocator: A) -> Self
    where
        T: Zeroable,
    {
        let data = Self::allocate_handle(&allocator, size);
        if size > 0 {
            let raw = data.as_ptr_for(size);
            unsafe { raw.cast::<u8>().write_bytes(0, size * std::mem::size_of::<T>()) };
        }
        Self { data, size, allocator }
    }

    /// `size` clones of `value` from `allocator`.
    pub fn filled_in(size: usize, value: T, allocator: A) -> Self
    where
        T: Clone,
    {
        let data = Self::allocate_handle(&allocator, size);
        if size > 0 {
            let raw = data.as_ptr_for(size);
            for index in 0..size {
                unsafe { allocator.construct(raw.add(index), value.clone()) };
            }
        }
        Self { data, size, allocator }
    }

    fn allocate_handle(allocator: &A, size: usize) -> OffsetPtr<T> {
        if size == 0 { OffsetPtr::null() } else { allocator.allocate(size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Fatal on out-of-range access, including any index on an empty array.
    pub fn at(&self, index: usize) -> &T {
        if index >= self.size {
            fatal!("Index {index} out of range for array of {} elements", self.size);
        }
        unsafe { &*self.data.as_ptr_for(self.size).add(index) }
    }

    /// Fatal on out-of-range access, including any index on an empty array.
    pub fn at_mut(&mut self, index: usize) -> &mut T {
        if index >= self.size {
            fatal!("Index {index} out of range for array of {} elements", self.size);
        }
        unsafe { &mut *self.data.as_ptr_for(self.size).add(index) }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        (index < self.size).then(|| self.at(index))
    }

    /// First element address, or null for an empty array.
    pub fn as_ptr(&self) -> *const T {
        if self.size == 0 { std::ptr::null() } else { self.data.as_ptr_for(self.size) }
    }

    /// The whole array as a slice. The span is validated once through its
    /// endpoints; element access within the slice is unchecked raw pointer
    /// iteration.
    pub fn as_slice(&self) -> &[T] {
        if self.size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data.as_ptr_for(self.size), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.size == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr_for(self.size), self.size) }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.as_mut_slice().iter_mut()
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<T: Default, A: Allocator<T> + Default> DynamicArray<T, A> {
    /// `size` default-initialized elements from the default allocator.
    pub fn new(size: usize) -> Self {
        Self::new_in(size, A::default())
    }
}

impl<T: Zeroable, A: Allocator<T> + Default> DynamicArray<T, A> {
    /// `size` zeroed elements from the default allocator.
    pub fn zeroed(size: usize) -> Self {
        Self::zeroed_in(size, A::default())
    }
}

impl<T: Clone, A: Allocator<T> + Default> DynamicArray<T, A> {
    /// `size` clones of `value` from the default allocator.
    pub fn filled(size: usize, value: T) -> Self {
        Self::filled_in(size, value, A::default())
    }
}

impl<T, A: Allocator<T>> Index<usize> for DynamicArray<T, A> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.at(index)
    }
}

impl<T, A: Allocator<T>> IndexMut<usize> for DynamicArray<T, A> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.at_mut(index)
    }
}

impl<'a, T, A: Allocator<T>> IntoIterator for &'a DynamicArray<T, A> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, A: Allocator<T>> IntoIterator for &'a mut DynamicArray<T, A> {
    type Item = &'a mut T;
    type IntoIter = std::slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<T: Clone, A: Allocator<T>> Clone for DynamicArray<T, A> {
    fn clone(&self) -> Self {
        let allocator = self.allocator.clone();
        // An empty clone must not touch the allocator.
        if self.size == 0 {
            return Self {
                data: OffsetPtr::null(),
                size: 0,
                allocator,
            };
        }
        let data = allocator.allocate(self.size);
        let source = self.data.as_ptr_for(self.size);
        let target = data.as_ptr_for(self.size);
        for index in 0..self.size {
            unsafe { allocator.construct(target.add(index), (*source.add(index)).clone()) };
        }
        Self {
            data,
            size: self.size,
            allocator,
        }
    }
}

impl<T: std::fmt::Debug, A: Allocator<T>> std::fmt::Debug for DynamicArray<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: PartialEq, A: Allocator<T>> PartialEq for DynamicArray<T, A> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T, A: Allocator<T>> Drop for DynamicArray<T, A> {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        if needs_drop::<T>() {
            // Skip element drops when the owning region is already gone; the
            // elements went with it.
            if let Some(raw) = self.data.try_as_ptr_for(self.size) {
                for index in 0..self.size {
                    unsafe { raw.add(index).drop_in_place() };
                }
            }
        }
        self.allocator.deallocate(self.data, self.size);
    }
}
