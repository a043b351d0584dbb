//! Greatest common divisor and least common multiple.
//!
//! Both are `const fn` so that chunk-footprint and footer-size constants can
//! be folded at compile time; the same functions serve the runtime
//! derivation of a pool's partition size.

/// Greatest common divisor of two integers, by Euclid's algorithm.
///
/// For faster results, pass the larger value first.
///
/// # Panics
///
/// Divides by zero if `b == 0` (both inputs must be nonzero).
#[must_use]
pub const fn gcd(mut a: usize, mut b: usize) -> usize {
    loop {
        let tmp = b;
        b = a % b;
        a = tmp;
        if b == 0 {
            return a;
        }
    }
}

/// Least common multiple of two integers.
///
/// Computed as `a / gcd(a, b) * b`; dividing first keeps the intermediate
/// from overflowing whenever the result itself fits.
///
/// # Panics
///
/// Both inputs must be nonzero.
#[must_use]
pub const fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

// Constant-context sanity anchors.
const _: () = assert!(gcd(1, 1) == 1);
const _: () = assert!(lcm(3458, 6916) == 6916);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_identities() {
        for m in [1usize, 2, 7, 48, 3458, 6916, usize::MAX] {
            assert_eq!(gcd(1, m), 1);
            assert_eq!(gcd(m, 1), 1);
            assert_eq!(gcd(m, m), m);
        }
        assert_eq!(gcd(3458, 6916), 3458);
        assert_eq!(gcd(6916, 3458), 3458);
        assert_eq!(gcd(46340, 46341), 1);
    }

    #[test]
    fn lcm_identities() {
        for m in [1usize, 2, 7, 48, 3458, 6916, usize::MAX] {
            assert_eq!(lcm(1, m), m);
            assert_eq!(lcm(m, 1), m);
            assert_eq!(lcm(m, m), m);
        }
    }

    #[test]
    fn lcm_of_coprime_neighbours() {
        // 46340^2 is the largest square below 2^31; the pair is coprime, so
        // the lcm is the full product and exercises the divide-first form.
        assert_eq!(lcm(46340, 46341), 2_147_441_940);
        assert_eq!(lcm(46341, 46340), 2_147_441_940);
    }

    #[test]
    fn gcd_is_commutative() {
        for a in [2usize, 12, 90, 1501, 4096] {
            for b in [3usize, 8, 270, 6916] {
                assert_eq!(gcd(a, b), gcd(b, a));
                assert_eq!(lcm(a, b), lcm(b, a));
            }
        }
    }
}
