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

/// Checked pointer and integer arithmetic
///
/// Offset computation between mapping base addresses and user data has to be
/// exact: a silently wrapped addition would produce an offset pointer into a
/// foreign region. Every function here is either total or fatal; none of them
/// return a recoverable error.
use crate::fatal;

/// Converts a pointer to its address. Value-preserving.
pub fn cast_pointer_to_integer<T>(pointer: *const T) -> usize {
    pointer as usize
}

/// Converts an address back into a typed pointer. Value-preserving inverse of
/// [`cast_pointer_to_integer`].
pub fn cast_integer_to_pointer<T>(address: usize) -> *mut T {
    address as *mut T
}

/// Magnitude of a signed value as an unsigned value.
///
/// Total over two's complement: `isize::MIN` maps to `isize::MAX + 1`, which
/// is representable in `usize`.
pub fn absolute_value(value: isize) -> usize {
    value.unsigned_abs()
}

/// Inverse of the defined signed-to-unsigned two's-complement cast.
///
/// For every `v: isize`, `undo_signed_to_unsigned_integer_cast(v as usize)`
/// restores `v`, including `isize::MIN`.
pub fn undo_signed_to_unsigned_integer_cast(value: usize) -> isize {
    value as isize
}

/// Adds an unsigned offset to a signed value. Fatal on overflow.
pub fn add_unsigned_to_signed(signed: isize, unsigned: usize) -> isize {
    match signed.checked_add_unsigned(unsigned) {
        Some(result) => result,
        None => fatal!("Adding unsigned integer {unsigned} to signed integer {signed} overflows"),
    }
}

/// Subtracts an unsigned offset from a signed value. Fatal on underflow.
pub fn subtract_unsigned_from_signed(signed: isize, unsigned: usize) -> isize {
    match signed.checked_sub_unsigned(unsigned) {
        Some(result) => result,
        None => fatal!("Subtracting unsigned integer {unsigned} from signed integer {signed} underflows"),
    }
}

/// Advances a pointer by `offset` bytes. Fatal when the resulting address
/// does not fit the address space.
pub fn add_offset_to_pointer<T>(pointer: *const T, offset: usize) -> *mut T {
    let address = cast_pointer_to_integer(pointer);
    match address.checked_add(offset) {
        Some(result) => cast_integer_to_pointer(result),
        None => fatal!("Adding offset {offset} to pointer {address:#x} overflows the address space"),
    }
}

/// Advances a pointer by a signed byte offset. Fatal on address-space
/// over- or underflow.
pub fn add_signed_offset_to_pointer<T>(pointer: *const T, offset: isize) -> *mut T {
    let address = cast_pointer_to_integer(pointer);
    let result = if offset >= 0 {
        address.checked_add(absolute_value(offset))
    } else {
        address.checked_sub(absolute_value(offset))
    };
    match result {
        Some(result) => cast_integer_to_pointer(result),
        None => fatal!("Adding signed offset {offset} to pointer {address:#x} leaves the address space"),
    }
}

/// Byte distance `first - second` between two pointers.
///
/// Fatal when the distance does not fit `isize`. The one distance of exactly
/// `isize::MIN` magnitude is representable and returned as `isize::MIN`.
pub fn subtract_pointers_bytes<T, U>(first: *const T, second: *const U) -> isize {
    let first = cast_pointer_to_integer(first);
    let second = cast_pointer_to_integer(second);
    if first >= second {
        let distance = first - second;
        if distance > isize::MAX as usize {
            fatal!("Pointer difference {distance} exceeds isize::MAX");
        }
        distance as isize
    } else {
        let distance = second - first;
        // isize::MIN has one more unit of magnitude than isize::MAX.
        if distance > absolute_value(isize::MIN) {
            fatal!("Negative pointer difference -{distance} is below isize::MIN");
        }
        undo_signed_to_unsigned_integer_cast(distance.wrapping_neg())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pointer_integer_round_trip() {
        let value = 42u64;
        let pointer = &value as *const u64;
        let address = cast_pointer_to_integer(pointer);
        assert_eq!(cast_integer_to_pointer::<u64>(address), pointer as *mut u64);
    }

    #[test]
    fn test_absolute_value_of_minimum() {
        assert_eq!(absolute_value(isize::MIN), isize::MAX as usize + 1);
        assert_eq!(absolute_value(-1), 1);
        assert_eq!(absolute_value(0), 0);
        assert_eq!(absolute_value(isize::MAX), isize::MAX as usize);
    }

    #[test]
    fn test_undo_cast_restores_minimum() {
        assert_eq!(undo_signed_to_unsigned_integer_cast(isize::MIN as usize), isize::MIN);
        assert_eq!(undo_signed_to_unsigned_integer_cast(usize::MAX), -1);
    }

    #[test]
    fn test_add_unsigned_to_signed() {
        assert_eq!(add_unsigned_to_signed(-5, 3), -2);
        assert_eq!(add_unsigned_to_signed(isize::MIN, usize::MAX), isize::MAX);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_add_unsigned_to_signed_overflow_terminates() {
        let _ = add_unsigned_to_signed(isize::MAX, 1);
    }

    #[test]
    fn test_subtract_unsigned_from_signed() {
        assert_eq!(subtract_unsigned_from_signed(5, 3), 2);
        assert_eq!(subtract_unsigned_from_signed(isize::MAX, usize::MAX), isize::MIN);
    }

    #[test]
    #[should_panic(expected = "underflows")]
    fn test_subtract_unsigned_from_signed_underflow_terminates() {
        let _ = subtract_unsigned_from_signed(isize::MIN, 1);
    }

    #[test]
    fn test_add_offset_to_pointer() {
        let buffer = [0u8; 16];
        let pointer = buffer.as_ptr();
        let advanced = add_offset_to_pointer(pointer, 8);
        assert_eq!(cast_pointer_to_integer(advanced), cast_pointer_to_integer(pointer) + 8);
    }

    #[test]
    #[should_panic(expected = "overflows the address space")]
    fn test_add_offset_to_pointer_overflow_terminates() {
        let pointer = cast_integer_to_pointer::<u8>(usize::MAX);
        let _ = add_offset_to_pointer(pointer, 1);
    }

    #[test]
    fn test_add_signed_offset_both_directions() {
        let buffer = [0u8; 16];
        let base = buffer.as_ptr();
        let forward = add_signed_offset_to_pointer(base, 8);
        let back = add_signed_offset_to_pointer(forward, -8);
        assert_eq!(back as *const u8, base);
    }

    #[test]
    #[should_panic(expected = "leaves the address space")]
    fn test_add_signed_offset_underflow_terminates() {
        let pointer = cast_integer_to_pointer::<u8>(1);
        let _ = add_signed_offset_to_pointer(pointer, -2);
    }

    #[test]
    fn test_subtract_pointers_bytes() {
        let buffer = [0u64; 4];
        let first = &buffer[3] as *const u64;
        let second = &buffer[0] as *const u64;
        assert_eq!(subtract_pointers_bytes(first, second), 24);
        assert_eq!(subtract_pointers_bytes(second, first), -24);
        assert_eq!(subtract_pointers_bytes(first, first), 0);
    }

    #[test]
    fn test_subtract_pointers_minimum_distance_is_representable() {
        let low = cast_integer_to_pointer::<u8>(0);
        let high = cast_integer_to_pointer::<u8>(absolute_value(isize::MIN));
        assert_eq!(subtract_pointers_bytes(low, high), isize::MIN);
    }

    #[test]
    #[should_panic(expected = "exceeds isize::MAX")]
    fn test_subtract_pointers_overflow_terminates() {
        let low = cast_integer_to_pointer::<u8>(0);
        let high = cast_integer_to_pointer::<u8>(usize::MAX);
        let _ = subtract_pointers_bytes(high, low);
    }

    proptest! {
        #[test]
        fn prop_cast_round_trip(address: usize) {
            let pointer = cast_integer_to_pointer::<u8>(address);
            prop_assert_eq!(cast_pointer_to_integer(pointer), address);
        }

        #[test]
        fn prop_signed_cast_round_trip(value: isize) {
            prop_assert_eq!(undo_signed_to_unsigned_integer_cast(value as usize), value);
        }

        #[test]
        fn prop_difference_is_antisymmetric(a in 0usize..=(isize::MAX as usize), b in 0usize..=(isize::MAX as usize)) {
            let pa = cast_integer_to_pointer::<u8>(a);
            let pb = cast_integer_to_pointer::<u8>(b);
            prop_assert_eq!(subtract_pointers_bytes(pa, pb), -subtract_pointers_bytes(pb, pa));
        }

        #[test]
        fn prop_add_then_subtract_round_trip(value: isize, offset in 0usize..1usize << 40) {
            if let Some(sum) = value.checked_add_unsigned(offset) {
                prop_assert_eq!(subtract_unsigned_from_signed(sum, offset), value);
            }
        }
    }
}
