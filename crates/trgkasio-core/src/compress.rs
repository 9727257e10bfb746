//! Soft-clip compression of the 24-bit-headroom mix.
//!
//! The mix working buffer holds samples scaled down to 24 bits (the host's
//! 32-bit samples shifted right by 8) so that additive mixing of auxiliary
//! sources cannot wrap. After mixing, [`compress_block`] squashes anything
//! beyond the knee back under full scale with a sigmoid, then shifts left by
//! 8 to restore the 32-bit representation pushed to the output sinks.

use libm::exp;

/// Keeps the sigmoid output strictly inside the 24-bit range.
const OVERFLOW_PREVENTER: i32 = 5;

/// Width of the compression knee.
pub const COMPRESS_PADDING: i32 = (1 << 19) - OVERFLOW_PREVENTER;

/// Samples with magnitude at or below this pass through untouched.
pub const COMPRESS_THRESHOLD: i32 = (1 << 23) - COMPRESS_PADDING - OVERFLOW_PREVENTER;

/// Soft-clip a single 24-bit-headroom sample and restore it to 32 bits.
///
/// Inside `±`[`COMPRESS_THRESHOLD`] this is exactly `sample << 8`. Beyond the
/// threshold the overshoot is mapped through
/// `padding · (2 / (1 + e^(−x/padding)) − 1)`, a tanh-like curve saturating
/// just below full scale, so the result stays monotonic and never wraps.
pub fn compress_sample(sample: i32) -> i32 {
    let out = if sample > COMPRESS_THRESHOLD {
        let overflow = f64::from(sample - COMPRESS_THRESHOLD);
        let padding = f64::from(COMPRESS_PADDING);
        COMPRESS_THRESHOLD
            + (padding * (2.0 / (1.0 + exp(-overflow / padding)) - 1.0)).round() as i32
    } else if sample < -COMPRESS_THRESHOLD {
        let overflow = f64::from(sample + COMPRESS_THRESHOLD);
        let padding = f64::from(COMPRESS_PADDING);
        -COMPRESS_THRESHOLD
            + (padding * (2.0 / (1.0 + exp(-overflow / padding)) - 1.0)).round() as i32
    } else {
        sample
    };
    out << 8
}

/// Soft-clip every channel of a planar 24-bit-headroom mix in place,
/// restoring the 32-bit representation.
pub fn compress_block(channels: &mut [Vec<i32>]) {
    for channel in channels.iter_mut() {
        for sample in channel.iter_mut() {
            *sample = compress_sample(*sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn passthrough_below_threshold() {
        for s in [
            0,
            1,
            -1,
            12345,
            -12345,
            COMPRESS_THRESHOLD,
            -COMPRESS_THRESHOLD,
        ] {
            assert_eq!(compress_sample(s), s << 8);
        }
    }

    #[test]
    fn compressed_region_stays_in_range() {
        for s in [
            COMPRESS_THRESHOLD + 1,
            COMPRESS_THRESHOLD + 100_000,
            1 << 23,
            (1 << 24) - 1,
            i32::MAX >> 4,
        ] {
            let out = compress_sample(s);
            assert!(out > COMPRESS_THRESHOLD << 8, "not above knee: {}", out);
            assert!(out < i32::MAX, "wrapped: {}", out);

            let neg = compress_sample(-s);
            assert_eq!(neg, -out, "asymmetric at {}", s);
        }
    }

    #[test]
    fn knee_is_continuous() {
        let below = compress_sample(COMPRESS_THRESHOLD);
        let above = compress_sample(COMPRESS_THRESHOLD + 1);
        assert!(above - below <= 2 << 8, "jump at knee: {} -> {}", below, above);
    }

    #[test]
    fn block_helper_matches_scalar() {
        let mut channels = vec![
            vec![0, 100, COMPRESS_THRESHOLD + 7],
            vec![-100, -(1 << 23), 42],
        ];
        let expected: Vec<Vec<i32>> = channels
            .iter()
            .map(|ch| ch.iter().map(|&s| compress_sample(s)).collect())
            .collect();
        compress_block(&mut channels);
        assert_eq!(channels, expected);
    }

    proptest! {
        #[test]
        fn monotonic_in_compression_region(
            a in COMPRESS_THRESHOLD..(1 << 26),
            b in COMPRESS_THRESHOLD..(1 << 26),
        ) {
            prop_assume!(a < b);
            let oa = compress_sample(a);
            let ob = compress_sample(b);
            prop_assert!(oa <= ob, "not monotone: f({})={} f({})={}", a, oa, b, ob);
        }

        #[test]
        fn never_exceeds_full_scale(s in -(1i32 << 27)..(1i32 << 27)) {
            let out = compress_sample(s);
            // The sigmoid saturates at threshold + padding < 2^23, so the
            // shifted result stays strictly inside 32-bit full scale.
            prop_assert!(i64::from(out).abs() < (1i64 << 31));
        }
    }
}
