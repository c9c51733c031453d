//! Bit helpers over `i64` values.
//!
//! Masks use two's complement with `-1` meaning "every bit", so a mask whose
//! top bit is set extends to infinity the way an unbounded integer would.

/// Mask of the low `len` bits.
pub fn bflmask(len: i32) -> i64 {
    if len <= 0 {
        0
    } else if len >= 64 {
        -1
    } else {
        ((1u64 << len) - 1) as i64
    }
}

/// Sign-extends `val` from bit position `bit` (the sign bit index).
pub fn sext(val: i64, bit: Option<i32>) -> i64 {
    match bit {
        None => val,
        Some(b) if b >= 63 => val,
        Some(b) if b < 0 => 0,
        Some(b) => {
            if val & (1i64 << b) != 0 {
                val | !bflmask(b)
            } else {
                val & bflmask(b)
            }
        }
    }
}

/// Shift left for positive amounts, arithmetic shift right for negative ones.
pub fn shl(val: i64, by: i32) -> i64 {
    if by >= 0 {
        if by >= 64 {
            0
        } else {
            val << by
        }
    } else {
        let by = -by;
        if by >= 64 {
            val >> 63
        } else {
            val >> by
        }
    }
}

/// Smallest all-low-ones mask covering `mask`.
pub fn lowmask(mask: i64) -> i64 {
    if mask < 0 {
        -1
    } else {
        bflmask(64 - mask.leading_zeros() as i32)
    }
}

/// All bits from the lowest set bit of `mask` upwards.
pub fn highmask(mask: i64) -> i64 {
    if mask == 0 {
        0
    } else {
        -1i64 << mask.trailing_zeros()
    }
}

/// Clamps a constant shift amount into the range the helpers above accept.
pub fn shift_amount(val: i64) -> i32 {
    val.clamp(-128, 128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn masks() {
        assert_eq!(bflmask(8), 0xff);
        assert_eq!(bflmask(64), -1);
        assert_eq!(bflmask(63), i64::MAX);
        assert_eq!(lowmask(1 << 62), i64::MAX);
        assert_eq!(lowmask(i64::MAX), i64::MAX);
        assert_eq!(lowmask(0x90), 0xff);
        assert_eq!(lowmask(-4), -1);
        assert_eq!(highmask(0x90), -16);
        assert_eq!(highmask(0), 0);
        assert_eq!(highmask(-4), -4);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sext(0x80, Some(7)), -128);
        assert_eq!(sext(0x17f, Some(7)), 0x7f);
        assert_eq!(sext(0x1234, None), 0x1234);
    }

    #[test]
    fn shifts() {
        assert_eq!(shl(1, 4), 16);
        assert_eq!(shl(-16, -4), -1);
        assert_eq!(shl(0x100, -4), 0x10);
        assert_eq!(shl(5, 100), 0);
    }
}
