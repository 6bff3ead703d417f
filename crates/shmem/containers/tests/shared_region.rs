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

//! End-to-end: arrays living inside an mmap-backed shared region.

use shmem_containers::DynamicArray;
use shmem_core::memory::allocator::PolymorphicOffsetPtrAllocator;
use shmem_core::memory::resource::ManagedMemoryResource;
use shmem_core::SharedMemoryResource;
use tempfile::TempDir;

#[test]
fn array_allocates_inside_the_region() {
    let dir = TempDir::new().unwrap();
    let resource = SharedMemoryResource::create(dir.path().join("region"), 4096).unwrap();
    let allocator = PolymorphicOffsetPtrAllocator::<u64>::new(resource.proxy());

    let mut array = DynamicArray::new_in(32, allocator);
    for (index, slot) in array.iter_mut().enumerate() {
        *slot = index as u64 * index as u64;
    }
    assert_eq!(array.iter().sum::<u64>(), (0..32u64).map(|i| i * i).sum());
    assert_eq!(resource.user_allocated_bytes(), 32 * 8);

    let address = array.as_ptr() as usize;
    assert!(address >= resource.usable_base_address().as_ptr() as usize);
    assert!(address + 32 * 8 <= resource.end_address().as_ptr() as usize);
}

#[test]
fn dropping_an_array_returns_nothing_to_the_region() {
    let dir = TempDir::new().unwrap();
    let resource = SharedMemoryResource::create(dir.path().join("region"), 4096).unwrap();
    let allocator = PolymorphicOffsetPtrAllocator::<u64>::new(resource.proxy());

    let first = DynamicArray::new_in(8, allocator);
    let first_address = first.as_ptr() as usize;
    drop(first);
    assert_eq!(resource.user_allocated_bytes(), 64);

    let second = DynamicArray::<u64, _>::new_in(8, PolymorphicOffsetPtrAllocator::new(resource.proxy()));
    assert!(second.as_ptr() as usize >= first_address + 64);
}

#[test]
fn array_data_survives_remapping() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("region");
    let element_offset;
    {
        let creator = SharedMemoryResource::create(&path, 4096).unwrap();
        let allocator = PolymorphicOffsetPtrAllocator::<u64>::new(creator.proxy());
        let mut array = DynamicArray::new_in(4, allocator);
        for (index, slot) in array.iter_mut().enumerate() {
            *slot = 0x1000 + index as u64;
        }
        element_offset = array.as_ptr() as usize - creator.base_address().as_ptr() as usize;
        // Array handle goes first; the monotonic region keeps the bytes.
    }
    let opened = SharedMemoryResource::open(&path).unwrap();
    let base = opened.base_address().as_ptr() as usize;
    for index in 0..4 {
        let value = unsafe { *((base + element_offset) as *const u64).add(index) };
        assert_eq!(value, 0x1000 + index as u64);
    }
    assert_eq!(opened.user_allocated_bytes(), 32);
}
