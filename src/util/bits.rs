//! Word-level bit tricks shared by the page bitmaps and the page cache.

#[inline(always)]
const fn low_mask(n: usize) -> u64 {
    if n >= 64 {
        !0
    } else {
        (1u64 << n) - 1
    }
}

/// Sets `n` consecutive bits of `x` starting at bit `i`.
#[inline]
pub const fn set_consec_bits64(x: u64, i: usize, n: usize) -> u64 {
    if n == 0 {
        return x;
    }
    x | (low_mask(n) << i)
}

/// Clears `n` consecutive bits of `x` starting at bit `i`.
#[inline]
pub const fn clear_consec_bits64(x: u64, i: usize, n: usize) -> u64 {
    if n == 0 {
        return x;
    }
    x & !(low_mask(n) << i)
}

/// Returns the index of the lowest run of `n` consecutive 1 bits in `c`,
/// or 64 if there is none.
///
/// Runs are shrunk from the top: after removing the top `n - 1` ones of each
/// run the lowest surviving bit marks the start of a fitting run.
#[inline]
pub fn find_consec_n64(mut c: u64, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    if n > 64 {
        return 64;
    }
    let mut p = n - 1;
    let mut k = 1;
    while p > 0 {
        if p <= k {
            c &= c >> p;
            break;
        }
        c &= c >> k;
        if c == 0 {
            return 64;
        }
        p -= k;
        k *= 2;
    }
    c.trailing_zeros() as usize
}

/// Treats `x` as groups of `m` bits (m a power of two up to 64) and returns a
/// word where every group that was entirely zero stays zero and every other
/// group becomes all ones.
///
/// Used to find free runs that are aligned to the physical page size.
pub fn fill_aligned(x: u64, m: usize) -> u64 {
    #[inline(always)]
    fn apply(x: u64, c: u64) -> u64 {
        // High bit of each group ends up set iff any bit of the group was set,
        // then everything but the high bits is forced on and inverted.
        !((((x & c).wrapping_add(c)) | x) | c)
    }
    let x = match m {
        1 => return x,
        2 => apply(x, 0x5555_5555_5555_5555),
        4 => apply(x, 0x7777_7777_7777_7777),
        8 => apply(x, 0x7f7f_7f7f_7f7f_7f7f),
        16 => apply(x, 0x7fff_7fff_7fff_7fff),
        32 => apply(x, 0x7fff_ffff_7fff_ffff),
        64 => apply(x, 0x7fff_ffff_ffff_ffff),
        _ => fatal!("bad fill_aligned group size {}", m),
    };
    // Only the top bit of each all-zero group is set now; smear it down.
    !((x.wrapping_sub(x >> (m - 1))) | x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn find_consec_n64_slow(c: u64, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut run = 0;
        for i in 0..64 {
            if c & (1 << i) != 0 {
                run += 1;
                if run == n {
                    return i + 1 - n;
                }
            } else {
                run = 0;
            }
        }
        64
    }

    fn fill_aligned_slow(x: u64, m: usize) -> u64 {
        let mut out = 0u64;
        for g in 0..64 / m {
            let mask = if m == 64 { !0 } else { ((1u64 << m) - 1) << (g * m) };
            if x & mask != 0 {
                out |= mask;
            }
        }
        out
    }

    #[test]
    fn test_set_clear_consec_bits() {
        assert_eq!(set_consec_bits64(0, 0, 0), 0);
        assert_eq!(set_consec_bits64(0, 0, 64), !0);
        assert_eq!(set_consec_bits64(0, 63, 1), 1 << 63);
        assert_eq!(set_consec_bits64(0, 4, 4), 0xf0);
        assert_eq!(set_consec_bits64(0x1, 60, 4), 0xf000_0000_0000_0001);
        assert_eq!(clear_consec_bits64(!0, 0, 64), 0);
        assert_eq!(clear_consec_bits64(!0, 0, 0), !0);
        assert_eq!(clear_consec_bits64(!0, 63, 1), !0 >> 1);
        assert_eq!(clear_consec_bits64(0xff, 2, 4), 0xc3);
    }

    #[test]
    fn test_find_consec_n64_edges() {
        assert_eq!(find_consec_n64(0, 0), 0);
        assert_eq!(find_consec_n64(0, 1), 64);
        assert_eq!(find_consec_n64(!0, 64), 0);
        assert_eq!(find_consec_n64(!0 >> 1, 64), 64);
        assert_eq!(find_consec_n64(1 << 63, 1), 63);
        assert_eq!(find_consec_n64(0xf000_0000_0000_0000, 4), 60);
        assert_eq!(find_consec_n64(0xf000_0000_0000_0000, 5), 64);
        assert_eq!(find_consec_n64(0x0ff0_0f00, 8), 20);
        assert_eq!(find_consec_n64(0x0ff0_0f00, 4), 8);
    }

    #[test]
    fn test_find_consec_n64_random() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..2000 {
            // Sparse and dense patterns both matter here.
            let c: u64 = if rng.gen_bool(0.5) {
                rng.gen::<u64>() | rng.gen::<u64>()
            } else {
                rng.gen::<u64>() & rng.gen::<u64>()
            };
            for n in [1, 2, 3, 5, 8, 13, 31, 32, 33, 63, 64] {
                assert_eq!(
                    find_consec_n64(c, n),
                    find_consec_n64_slow(c, n),
                    "c = {:#x}, n = {}",
                    c,
                    n
                );
            }
        }
    }

    #[test]
    fn test_fill_aligned() {
        assert_eq!(fill_aligned(0x0100_a3, 1), 0x0100_a3);
        assert_eq!(fill_aligned(0x0100_a3, 2), 0x0300_f3);
        assert_eq!(fill_aligned(0x0100_a3, 8), 0xff00_ff);
        assert_eq!(fill_aligned(0x0100_a3, 16), 0xffff_ffff);
        assert_eq!(fill_aligned(0, 64), 0);
        assert_eq!(fill_aligned(1 << 63, 64), !0);

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let x = rng.gen::<u64>() & rng.gen::<u64>() & rng.gen::<u64>();
            for m in [1, 2, 4, 8, 16, 32, 64] {
                assert_eq!(fill_aligned(x, m), fill_aligned_slow(x, m), "x = {:#x}, m = {}", x, m);
            }
        }
    }
}
