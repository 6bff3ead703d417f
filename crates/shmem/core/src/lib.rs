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

/// Core shared-memory allocation primitives
///
/// This crate provides the building blocks for placing data structures into
/// memory regions shared between processes:
/// - Checked pointer and size arithmetic
/// - Polymorphic memory resources (mmap-backed bump allocation, heap delegate)
/// - A process-wide registry mapping stable identifiers to live resources
/// - Proxy handles and relocatable offset pointers that stay valid across
///   different mapping base addresses
pub mod memory;

pub use memory::{
    Allocator, DataTypeSizeInfo, HeapDelegateMemoryResource, ManagedMemoryResource, ManagedMemoryResourceExt, MemoryError, MemoryRegionBounds, MemoryResource, MemoryResourceProxy,
    MemoryResourceRegistry, MemoryResult, OffsetPtr, PolymorphicOffsetPtrAllocator, SharedMemoryResource,
};
