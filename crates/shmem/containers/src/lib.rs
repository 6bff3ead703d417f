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

/// Containers designed for placement into shared memory regions
///
/// Containers here keep their element handles as offset pointers and take
/// their memory through the `shmem-core` allocator seam, so the same type
/// works over a shared region, through a heap delegate, or on the plain
/// global heap.
pub mod dynamic_array;

pub use dynamic_array::DynamicArray;
