//! Parsing and comparison of Kubernetes quantity strings ("500m", "2",
//! "10Gi"). Template bounds checks need a numeric ordering over quantities;
//! anything unparsable is treated by callers as "no override requested".

use std::cmp::Ordering;

/// Parse a quantity string into an absolute value.
///
/// Supports the decimal-SI suffixes (n, u, m, k, M, G, T, P, E) and the
/// binary-SI suffixes (Ki, Mi, Gi, Ti, Pi, Ei). Returns `None` for anything
/// that is not a quantity.
pub fn parse(input: &str) -> Option<f64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number.parse().ok()?;

    let scale: f64 = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        _ => return None,
    };

    Some(value * scale)
}

/// Compare two quantity strings numerically. `None` when either side does
/// not parse.
pub fn compare(left: &str, right: &str) -> Option<Ordering> {
    parse(left)?.partial_cmp(&parse(right)?)
}

/// `value < bound`, or `None` when either does not parse.
pub fn less_than(value: &str, bound: &str) -> Option<bool> {
    compare(value, bound).map(|o| o == Ordering::Less)
}

/// `value > bound`, or `None` when either does not parse.
pub fn greater_than(value: &str, bound: &str) -> Option<bool> {
    compare(value, bound).map(|o| o == Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_integers_and_millis() {
        assert_eq!(parse("2"), Some(2.0));
        assert_eq!(parse("500m"), Some(0.5));
        assert_eq!(parse("50m"), Some(0.05));
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse("1Ki"), Some(1024.0));
        assert_eq!(parse("2Gi"), Some(2.0 * 1024.0 * 1024.0 * 1024.0));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("lots"), None);
        assert_eq!(parse("10Zi"), None);
    }

    #[test]
    fn orders_across_suffixes() {
        assert_eq!(compare("500m", "1"), Some(Ordering::Less));
        assert_eq!(compare("5", "2"), Some(Ordering::Greater));
        assert_eq!(compare("1024Mi", "1Gi"), Some(Ordering::Equal));
        assert_eq!(greater_than("5", "2"), Some(true));
        assert_eq!(less_than("50m", "100m"), Some(true));
    }
}
