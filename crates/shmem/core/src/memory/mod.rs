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

/// Shared-memory management module
///
/// This module provides the memory resource stack used to place data into
/// shared memory regions:
/// - Checked pointer/integer arithmetic and layout computation
/// - Memory resource traits and concrete resources (mmap-backed, heap delegate)
/// - A process-wide resource registry with region bounds tracking
/// - Proxy handles and offset pointers safe to store inside shared memory
/// - An allocator adapter for containers
pub mod allocator; // Polymorphic allocator over proxy handles
pub mod arith; // Checked pointer and integer arithmetic
pub mod error; // Error types and the fatal-path macro
pub mod heap; // Heap-delegating stand-in resource
pub mod layout; // Size and alignment computation
pub mod offset_ptr; // Relocatable pointers
pub mod proxy; // Shareable resource handles
pub mod registry; // Process-wide id-to-resource map
pub mod resource; // Memory resource traits
pub mod shared; // Mmap-backed bump resource

#[doc(hidden)]
pub mod testing; // In-memory bounded resource for tests

// Re-export main components for easier access
pub use allocator::{Allocator, PolymorphicOffsetPtrAllocator};
pub use error::{MemoryError, MemoryResult};
pub use heap::HeapDelegateMemoryResource;
pub use layout::{DataTypeSizeInfo, calculate_aligned_size, calculate_aligned_size_of_sequence, is_power_of_two, max_alignment};
pub use offset_ptr::OffsetPtr;
pub use proxy::{MemoryResourceProxy, set_bounds_checking};
pub use registry::{MemoryRegionBounds, MemoryResourceRegistry};
pub use resource::{ManagedMemoryResource, ManagedMemoryResourceExt, MemoryResource};
pub use shared::SharedMemoryResource;
