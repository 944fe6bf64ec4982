//! Register codec: 32-bit values packed into pairs of 16-bit holding
//! registers, low word first. The devices expose everything as u16
//! registers, so durations (i32 seconds) and EC/pH setpoints (f32) are
//! split on write and rejoined on read.

/// Split an i32 into `[low16, high16]` register words.
pub fn pack_i32(v: i32) -> [u16; 2] {
    let u = v as u32;
    [(u & 0xffff) as u16, (u >> 16) as u16]
}

/// Inverse of [`pack_i32`].
pub fn unpack_i32(lo: u16, hi: u16) -> i32 {
    (((hi as u32) << 16) | lo as u32) as i32
}

/// Split an IEEE-754 single into `[low16, high16]` register words.
pub fn pack_f32(v: f32) -> [u16; 2] {
    let u = v.to_bits();
    [(u & 0xffff) as u16, (u >> 16) as u16]
}

/// Inverse of [`pack_f32`].
pub fn unpack_f32(lo: u16, hi: u16) -> f32 {
    f32::from_bits(((hi as u32) << 16) | lo as u32)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- i32 round-trips ----------------------------------------------------

    #[test]
    fn i32_round_trip_small_values() {
        for v in [0, 1, -1, 60, 600, 86400] {
            let [lo, hi] = pack_i32(v);
            assert_eq!(unpack_i32(lo, hi), v, "round-trip failed for {v}");
        }
    }

    #[test]
    fn i32_round_trip_extremes() {
        for v in [i32::MAX, i32::MIN, i32::MAX - 1, i32::MIN + 1] {
            let [lo, hi] = pack_i32(v);
            assert_eq!(unpack_i32(lo, hi), v);
        }
    }

    #[test]
    fn i32_word_order_is_low_first() {
        // 0x0001_0002 → low word 2, high word 1
        assert_eq!(pack_i32(0x0001_0002), [2, 1]);
    }

    #[test]
    fn i32_small_positive_fits_in_low_word() {
        // Durations under 65536s must land entirely in the first register.
        assert_eq!(pack_i32(600), [600, 0]);
        assert_eq!(pack_i32(65535), [65535, 0]);
        assert_eq!(pack_i32(65536), [0, 1]);
    }

    #[test]
    fn i32_negative_sets_high_word() {
        let [lo, hi] = pack_i32(-1);
        assert_eq!((lo, hi), (0xffff, 0xffff));
    }

    // -- f32 round-trips ----------------------------------------------------

    #[test]
    fn f32_round_trip_common_setpoints() {
        for v in [0.0_f32, 1.8, 6.2, 5.5, 100.25, -3.75] {
            let [lo, hi] = pack_f32(v);
            assert_eq!(unpack_f32(lo, hi).to_bits(), v.to_bits());
        }
    }

    #[test]
    fn f32_round_trip_specials() {
        for v in [f32::MAX, f32::MIN, f32::MIN_POSITIVE, f32::INFINITY, f32::NEG_INFINITY] {
            let [lo, hi] = pack_f32(v);
            assert_eq!(unpack_f32(lo, hi).to_bits(), v.to_bits());
        }
    }

    #[test]
    fn f32_negative_zero_preserved() {
        let [lo, hi] = pack_f32(-0.0);
        assert_eq!(unpack_f32(lo, hi).to_bits(), (-0.0_f32).to_bits());
    }

    #[test]
    fn f32_nan_stays_nan() {
        let [lo, hi] = pack_f32(f32::NAN);
        assert!(unpack_f32(lo, hi).is_nan());
    }
}
