//! Fractional positions for list ordering.
//!
//! A position is a non-empty ASCII string over the printable range
//! `' '..='~'` (95 usable digits). Comparing positions as plain strings
//! gives the list order, and for any two positions `lo < hi` there is
//! always a third strictly between them, so an insertion never has to
//! re-key its neighbors.
//!
//! Generated positions never end in the minimum digit, which keeps the
//! interval below any position non-empty.

const MIN_CHAR: u8 = b' '; // 0x20
const DIGIT_SPAN: u16 = 95; // ' ' ..= '~'

fn digits(pos: &str) -> Vec<u16> {
    pos.bytes().map(|b| (b - MIN_CHAR) as u16).collect()
}

fn from_digits(digits: Vec<u16>) -> String {
    digits
        .into_iter()
        .map(|d| (MIN_CHAR + d as u8) as char)
        .collect()
}

/// A position strictly between `lo` and `hi`.
///
/// `None` bounds are the open ends of the list. When both bounds are
/// given, `lo` must compare strictly less than `hi`.
pub fn between(lo: Option<&str>, hi: Option<&str>) -> String {
    // `lo < hi` is expected. Equal bounds can occur next to a pair of
    // concurrent same-position siblings; the result then extends past
    // both, which keeps the order total.
    let lo_digits = lo.map(digits).unwrap_or_default();
    let hi_digits = hi.map(digits);

    let mut out: Vec<u16> = Vec::new();
    // While `clamped`, the output still matches a prefix of `hi` and must
    // stay below its next digit; once a digit lands strictly below `hi`
    // the upper bound no longer constrains the tail.
    let mut clamped = hi_digits.is_some();
    let mut i = 0;
    loop {
        let l = lo_digits.get(i).copied().unwrap_or(0);
        let h = if clamped {
            match hi_digits.as_ref().and_then(|d| d.get(i)) {
                Some(&d) => d,
                // hi is a prefix of the output so far; with lo < hi this
                // cannot happen, fall open to make progress regardless
                None => DIGIT_SPAN,
            }
        } else {
            DIGIT_SPAN
        };

        if l + 1 < h {
            // open ends take the smallest step, so append/prepend chains
            // stay short; true gaps take the midpoint
            let digit = if h == DIGIT_SPAN {
                l + 1
            } else if l == 0 && i >= lo_digits.len() {
                h - 1
            } else {
                l + (h - l) / 2
            };
            out.push(digit);
            return from_digits(out);
        }
        if l < h {
            clamped = false;
        }
        out.push(l);
        i += 1;
    }
}

/// A position strictly after `lo` (append at the end).
pub fn after(lo: &str) -> String {
    between(Some(lo), None)
}

/// A position strictly before `hi` (prepend at the front).
pub fn before(hi: &str) -> String {
    between(None, Some(hi))
}

/// The position used for the first element of an empty list.
pub fn first() -> String {
    between(None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_between(lo: Option<&str>, hi: Option<&str>) -> String {
        let pos = between(lo, hi);
        assert!(!pos.is_empty());
        assert!(pos.bytes().all(|b| (b' '..=b'~').contains(&b)));
        if let Some(lo) = lo {
            assert!(lo < pos.as_str(), "{lo:?} !< {pos:?}");
        }
        if let Some(hi) = hi {
            assert!(pos.as_str() < hi, "{pos:?} !< {hi:?}");
        }
        pos
    }

    #[test]
    fn test_first_position() {
        check_between(None, None);
    }

    #[test]
    fn test_between_simple() {
        let a = first();
        let b = after(&a);
        assert!(a < b);
        check_between(Some(&a), Some(&b));
    }

    #[test]
    fn test_adjacent_digits_extend() {
        // "a" and "b" leave no room at depth 0, so the result must extend
        let pos = check_between(Some("a"), Some("b"));
        assert!(pos.len() > 1);
    }

    #[test]
    fn test_prefix_bounds() {
        check_between(Some("a"), Some("a!"));
        check_between(Some("O"), Some("O0"));
    }

    #[test]
    fn test_never_ends_in_min_digit() {
        let mut lo = first();
        for _ in 0..50 {
            let next = after(&lo);
            assert!(!next.ends_with(' '));
            lo = next;
        }
    }

    #[test]
    fn test_repeated_front_insertion() {
        let mut hi = first();
        for _ in 0..200 {
            hi = check_between(None, Some(&hi));
        }
    }

    #[test]
    fn test_repeated_back_insertion_stays_short() {
        let mut lo = first();
        for _ in 0..200 {
            lo = check_between(Some(&lo), None);
        }
        // appending should grow the key logarithmically, not linearly
        assert!(lo.len() < 16, "append positions ballooned: {lo:?}");
    }

    #[test]
    fn test_dense_middle_insertion() {
        let mut lo = first();
        let mut hi = after(&lo);
        for i in 0..200 {
            let mid = check_between(Some(&lo), Some(&hi));
            if i % 2 == 0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }

    #[test]
    fn test_insertion_order_is_total() {
        // interleave front/middle/back inserts and verify strict ordering
        let mut positions = vec![first()];
        for i in 0..120usize {
            let pos = match i % 3 {
                0 => before(positions.first().unwrap()),
                1 => after(positions.last().unwrap()),
                _ => {
                    let mid = positions.len() / 2;
                    between(
                        Some(&positions[mid - 1]),
                        Some(&positions[mid]),
                    )
                }
            };
            positions.push(pos);
            positions.sort();
        }
        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1], "duplicate or unordered: {pair:?}");
        }
    }
}
