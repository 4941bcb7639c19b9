//! Permutation counting for candidate superpermutation strings.
//!
//! A string over the digits `1..=n` "visits" a permutation when some window
//! of `n` consecutive characters contains every digit exactly once. The
//! coordinator never trusts a client's claimed count: every submitted string
//! is re-analysed here.

use std::collections::HashSet;

/// `n!` for the alphabet sizes the search works with.
pub fn factorial(n: i64) -> i64 {
    (2..=n).product::<i64>().max(1)
}

/// Count the distinct permutations of `1..=n` appearing as length-`n` windows.
///
/// Returns `None` when the string contains anything other than the digits
/// `1..=n`, or when `n` is outside the supported range.
pub fn count_permutations(s: &str, n: i64) -> Option<i64> {
    if !(1..=9).contains(&n) {
        return None;
    }
    let n = n as usize;
    let digits: Vec<u8> = s
        .bytes()
        .map(|b| match b {
            b'1'..=b'9' if ((b - b'0') as usize) <= n => Some(b - b'0'),
            _ => None,
        })
        .collect::<Option<_>>()?;

    if digits.len() < n {
        return Some(0);
    }

    let mut seen = HashSet::new();
    for window in digits.windows(n) {
        let mut mask = 0u16;
        for &d in window {
            mask |= 1 << d;
        }
        if mask.count_ones() as usize == n {
            let key = window.iter().fold(0u64, |acc, &d| acc * 10 + d as u64);
            seen.insert(key);
        }
    }
    Some(seen.len() as i64)
}

/// Waste implied by a string of `len` characters visiting `perms` permutations.
pub fn implied_waste(len: usize, n: i64, perms: i64) -> i64 {
    len as i64 - n + 1 - perms
}

/// Canonical seed prefix `12..n`.
pub fn identity_prefix(n: i64) -> String {
    (1..=n).map(|d| char::from(b'0' + d as u8)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPERPERM_4: &str = "123412314231243121342132413214321";

    #[test]
    fn test_factorial() {
        assert_eq!(factorial(0), 1);
        assert_eq!(factorial(1), 1);
        assert_eq!(factorial(4), 24);
        assert_eq!(factorial(7), 5040);
    }

    #[test]
    fn test_single_window() {
        assert_eq!(count_permutations("1234", 4), Some(1));
        assert_eq!(count_permutations("123", 4), Some(0));
    }

    #[test]
    fn test_known_superpermutation() {
        assert_eq!(count_permutations(SUPERPERM_4, 4), Some(24));
        assert_eq!(implied_waste(SUPERPERM_4.len(), 4, 24), 6);
    }

    #[test]
    fn test_prefixes_of_superpermutation() {
        assert_eq!(count_permutations("12341231423124312", 4), Some(12));
        assert_eq!(implied_waste(17, 4, 12), 2);
        assert_eq!(count_permutations("1234123142312431213421324132", 4), Some(20));
        assert_eq!(implied_waste(28, 4, 20), 5);
    }

    #[test]
    fn test_repeated_windows_count_once() {
        // 1234 appears twice
        assert_eq!(count_permutations("12341234", 4), Some(4));
        assert_eq!(count_permutations("123412341", 4), Some(4));
    }

    #[test]
    fn test_rejects_foreign_characters() {
        assert_eq!(count_permutations("12354", 4), None);
        assert_eq!(count_permutations("1203", 3), None);
        assert_eq!(count_permutations("12a4", 4), None);
        assert_eq!(count_permutations("", 0), None);
    }

    #[test]
    fn test_identity_prefix() {
        assert_eq!(identity_prefix(4), "1234");
        assert_eq!(identity_prefix(7), "1234567");
    }
}
