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

/// Size and alignment computation for data placed into shared regions.
use crate::fatal;

/// Checks if a number is a power of two
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Worst-case scalar alignment of the platform, used for management data
/// whose concrete layout peers must not depend on.
pub fn max_alignment() -> usize {
    std::mem::align_of::<libc::max_align_t>()
}

/// Rounds `size` up so a following object of the same alignment starts
/// aligned.
///
/// The policy is deliberately asymmetric around `alignment` and is part of
/// the wire contract; peers compute offsets with the same rule, so it must
/// not be changed:
/// - `size % alignment == 0` returns `size` unchanged (including `size == 0`)
/// - `size > alignment` rounds up to the next multiple of `alignment`
/// - otherwise returns `alignment`
///
/// The result is always `>= size` and a multiple of `alignment`. Fatal if
/// `alignment` is zero or the rounding overflows.
pub fn calculate_aligned_size(size: usize, alignment: usize) -> usize {
    if alignment == 0 {
        fatal!("Cannot align size {size} to an alignment of zero");
    }
    let remainder = size % alignment;
    if remainder == 0 {
        size
    } else if size > alignment {
        match size.checked_add(alignment - remainder) {
            Some(aligned) => aligned,
            None => fatal!("Aligning size {size} to alignment {alignment} overflows"),
        }
    } else {
        alignment
    }
}

/// Size and alignment of one element within a packed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeSizeInfo {
    pub size: usize,
    pub alignment: usize, // Must be a non-zero power of two
}

impl DataTypeSizeInfo {
    /// Fatal if `alignment` is zero or not a power of two.
    pub fn new(size: usize, alignment: usize) -> Self {
        if !is_power_of_two(alignment) {
            fatal!("Alignment {alignment} of a sequence element must be a non-zero power of two");
        }
        Self { size, alignment }
    }
}

/// Total span of elements laid out sequentially, each starting at the next
/// multiple of its own alignment.
///
/// No padding is added after the last element; a caller appending further
/// data is responsible for aligning its own start. Empty input spans zero
/// bytes.
pub fn calculate_aligned_size_of_sequence(infos: &[DataTypeSizeInfo]) -> usize {
    let mut cursor = 0usize;
    for info in infos {
        let start = calculate_aligned_size(cursor, info.alignment);
        cursor = match start.checked_add(info.size) {
            Some(end) => end,
            None => fatal!("Sequence layout overflows at element of size {} alignment {}", info.size, info.alignment),
        };
    }
    cursor
}
