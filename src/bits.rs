// Portable bit twiddling: power-of-two alignment, zero counts, log2.
//
// Everything here is `const fn` so it can size and check the layout constants in `lib.rs` at
// compile time. The `UnsignedBits` trait gives the same operations generically over every
// unsigned width, for code that doesn't need const evaluation.

/// True iff `v` is a non-zero power of two.
#[inline(always)]
pub const fn is_power_of_two(v: usize) -> bool {
    v > 0 && (v & (v - 1)) == 0
}

#[inline(always)]
pub const fn align_down(size: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment));
    size & !(alignment - 1)
}

#[inline(always)]
pub const fn align_up(size: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment));
    (size + alignment - 1) & !(alignment - 1)
}

#[inline(always)]
pub fn align_down_ptr(ptr: *mut u8, alignment: usize) -> *mut u8 {
    debug_assert!(is_power_of_two(alignment));
    ptr.map_addr(|a| align_down(a, alignment))
}

#[inline(always)]
pub fn align_up_ptr(ptr: *mut u8, alignment: usize) -> *mut u8 {
    debug_assert!(is_power_of_two(alignment));
    ptr.map_addr(|a| align_up(a, alignment))
}

// The builtin `leading_zeros` / `trailing_zeros` already return the bit width for 0, which is the
// convention we want (unlike the raw clz/ctz intrinsics, where 0 is undefined).
macro_rules! gen_zero_counts {
    ($ty:ty, $clz:ident, $ctz:ident, $leftmost:ident) => {
        #[inline(always)]
        pub const fn $clz(x: $ty) -> u32 {
            x.leading_zeros()
        }

        #[inline(always)]
        pub const fn $ctz(x: $ty) -> u32 {
            x.trailing_zeros()
        }

        /// A value with only the most significant bit set.
        #[inline(always)]
        pub const fn $leftmost() -> $ty {
            1 << (<$ty>::BITS - 1)
        }
    };
}

gen_zero_counts!(u8, count_leading_zero_bits_u8, count_trailing_zero_bits_u8, leftmost_bit_u8);
gen_zero_counts!(u16, count_leading_zero_bits_u16, count_trailing_zero_bits_u16, leftmost_bit_u16);
gen_zero_counts!(u32, count_leading_zero_bits_u32, count_trailing_zero_bits_u32, leftmost_bit_u32);
gen_zero_counts!(u64, count_leading_zero_bits_u64, count_trailing_zero_bits_u64, leftmost_bit_u64);
gen_zero_counts!(usize, count_leading_zero_bits, count_trailing_zero_bits, leftmost_bit);

/// Floor of log2(n). Only meaningful for n > 0: log2_floor(0) is -1.
#[inline(always)]
pub const fn log2_floor(n: u32) -> i32 {
    31 - count_leading_zero_bits_u32(n) as i32
}

/// Ceiling of log2(n), with log2_ceiling(0) == -1.
#[inline(always)]
pub const fn log2_ceiling(n: u32) -> i32 {
    // When n == 0, n - 1 wraps to all ones, so clz is 0 and the result is -1.
    (if n != 0 { 32 } else { -1 }) - count_leading_zero_bits_u32(n.wrapping_sub(1)) as i32
}

/// The same operations, generic over unsigned width.
pub trait UnsignedBits: Copy + Eq {
    const BITS: u32;

    fn is_power_of_two(self) -> bool;
    fn align_down(self, alignment: Self) -> Self;
    fn align_up(self, alignment: Self) -> Self;
    fn count_leading_zero_bits(self) -> u32;
    fn count_trailing_zero_bits(self) -> u32;
    fn leftmost_bit() -> Self;
}

macro_rules! impl_unsigned_bits {
    ($($ty:ty),*) => { $(
        impl UnsignedBits for $ty {
            const BITS: u32 = <$ty>::BITS;

            #[inline(always)]
            fn is_power_of_two(self) -> bool {
                self > 0 && (self & (self - 1)) == 0
            }

            #[inline(always)]
            fn align_down(self, alignment: Self) -> Self {
                debug_assert!(UnsignedBits::is_power_of_two(alignment));
                self & !(alignment - 1)
            }

            #[inline(always)]
            fn align_up(self, alignment: Self) -> Self {
                debug_assert!(UnsignedBits::is_power_of_two(alignment));
                (self + alignment - 1) & !(alignment - 1)
            }

            #[inline(always)]
            fn count_leading_zero_bits(self) -> u32 {
                self.leading_zeros()
            }

            #[inline(always)]
            fn count_trailing_zero_bits(self) -> u32 {
                self.trailing_zeros()
            }

            #[inline(always)]
            fn leftmost_bit() -> Self {
                1 << (<$ty>::BITS - 1)
            }
        }
    )* };
}

impl_unsigned_bits!(u8, u16, u32, u64, usize);
