//! Small helpers shared between the expander, the parser functions, and the
//! name canonicalizers.

use std::borrow::Cow;

/// Collapses every run of whitespace to a single space and trims the ends.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            in_space = true;
        } else {
            if in_space {
                out.push(' ');
                in_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Compares two strings numerically when both parse as numbers, and textually
/// otherwise.
///
/// MediaWiki comparison functions treat `"01"` and `"1"` and `"1.0"` as
/// equal, so a plain string comparison is not enough.
pub fn fuzzy_eq(lhs: &str, rhs: &str) -> bool {
    if let (Ok(a), Ok(b)) = (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        a == b
    } else {
        lhs == rhs
    }
}

/// Formats a float the way PHP `strval` does.
///
/// Integral values print without a decimal point, which is what wikitext
/// arithmetic relies on (`{{#expr:1+2}}` must produce `3`, not `3.0`).
// Clippy: Values within ±2**53 are checked to be integral before truncating.
#[allow(clippy::cast_possible_truncation)]
pub fn strval(n: f64) -> String {
    if n == 0.0 {
        // Also collapses -0.0
        String::from("0")
    } else if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Formats a number with comma thousands separators in the integer part.
pub fn format_number(n: f64, no_separators: bool) -> String {
    let s = strval(n);
    if no_separators {
        return s;
    }

    let (sign, rest) = s.strip_prefix('-').map_or(("", s.as_str()), |r| ("-", r));
    let (int, frac) = rest.split_once('.').map_or((rest, None), |(i, f)| (i, Some(f)));
    if !int.bytes().all(|b| b.is_ascii_digit()) {
        // Exponents, infinities and other non-plain forms pass through
        return s;
    }

    let mut out = String::from(sign);
    let first = int.len() % 3;
    if first != 0 {
        out.push_str(&int[..first]);
    }
    for (i, chunk) in int.as_bytes()[first..].chunks(3).enumerate() {
        if i != 0 || first != 0 {
            out.push(',');
        }
        for &b in chunk {
            out.push(char::from(b));
        }
    }
    if let Some(frac) = frac {
        out.push('.');
        out.push_str(frac);
    }
    out
}

/// Percent-encodes a URL part.
#[inline]
pub fn url_encode(input: &str) -> Cow<'_, str> {
    percent_encoding::utf8_percent_encode(input, &ALPHABET).into()
}

/// The alphabet of characters to percent-encode when encoding URLs.
const ALPHABET: percent_encoding::AsciiSet = percent_encoding::CONTROLS
    .add(b'%')
    .add(b'#')
    .add(b'\'')
    .add(b'"')
    .add(b'&')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b']')
    .add(b' ')
    .add(b'+')
    .add(b'=')
    .add(b'?');

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(
            collapse_whitespace("  a \t b\n\nc "),
            "a b c",
            "runs of mixed whitespace should collapse"
        );
        assert_eq!(collapse_whitespace(""), "", "empty input should stay empty");
        assert_eq!(
            collapse_whitespace("plain"),
            "plain",
            "text without whitespace should pass through"
        );
    }

    #[test]
    fn test_fuzzy_eq() {
        assert!(fuzzy_eq("01", "1"), "numeric forms should compare equal");
        assert!(fuzzy_eq("1.0", "1"), "float and int forms should compare equal");
        assert!(!fuzzy_eq("a", "A"), "text comparison should be exact");
        assert!(fuzzy_eq("x", "x"), "equal text should compare equal");
    }

    #[test]
    fn test_strval() {
        assert_eq!(strval(3.0), "3", "integral floats should drop the point");
        assert_eq!(strval(-0.0), "0", "negative zero should print as zero");
        assert_eq!(strval(1.5), "1.5", "fractions should print as written");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1_234_567.0, false), "1,234,567");
        assert_eq!(format_number(1_234_567.0, true), "1234567");
        assert_eq!(format_number(-1234.5, false), "-1,234.5");
        assert_eq!(format_number(12.0, false), "12", "short numbers get no separator");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("a b"), "a%20b");
        assert_eq!(url_encode("x"), "x");
    }
}
