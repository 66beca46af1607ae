use std::cmp::Ordering;

use serde::Deserialize;

use crate::util::decode_varint;
use crate::{Result, Status};

/// Total orders over keys for the ordered engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum KeyComparator {
    /// Byte-wise order.
    #[default]
    Lexical,
    /// Byte-wise order ignoring ASCII case; ties fall back to byte order.
    LexicalCase,
    /// Order of the leading decimal integers; ties fall back to byte order.
    Decimal,
    /// Order of the leading hexadecimal integers; ties fall back to byte order.
    Hexadecimal,
    /// Order of the leading real numbers; ties fall back to byte order.
    RealNumber,
    /// Order of keys built by [`encode_pair`]: first part, then second part.
    PairLexical,
}

impl KeyComparator {
    /// Compares two keys.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyComparator::Lexical => a.cmp(b),
            KeyComparator::LexicalCase => a
                .iter()
                .map(u8::to_ascii_lowercase)
                .cmp(b.iter().map(u8::to_ascii_lowercase))
                .then_with(|| a.cmp(b)),
            KeyComparator::Decimal => parse_decimal(a).cmp(&parse_decimal(b)).then_with(|| a.cmp(b)),
            KeyComparator::Hexadecimal => parse_hex(a).cmp(&parse_hex(b)).then_with(|| a.cmp(b)),
            KeyComparator::RealNumber => parse_real(a)
                .total_cmp(&parse_real(b))
                .then_with(|| a.cmp(b)),
            KeyComparator::PairLexical => match (decode_pair(a), decode_pair(b)) {
                (Some((a_key, a_value)), Some((b_key, b_value))) => {
                    a_key.cmp(b_key).then_with(|| a_value.cmp(b_value))
                }
                _ => a.cmp(b),
            },
        }
    }

    /// Name stored in file metadata.
    pub fn name(self) -> &'static str {
        match self {
            KeyComparator::Lexical => "LexicalKeyComparator",
            KeyComparator::LexicalCase => "LexicalCaseKeyComparator",
            KeyComparator::Decimal => "DecimalKeyComparator",
            KeyComparator::Hexadecimal => "HexadecimalKeyComparator",
            KeyComparator::RealNumber => "RealNumberKeyComparator",
            KeyComparator::PairLexical => "PairLexicalKeyComparator",
        }
    }
}

impl TryFrom<String> for KeyComparator {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase().replace('_', "");
        let name = lowered.trim_end_matches("keycomparator");
        match name {
            "lexical" | "" => Ok(KeyComparator::Lexical),
            "lexicalcase" => Ok(KeyComparator::LexicalCase),
            "decimal" => Ok(KeyComparator::Decimal),
            "hexadecimal" | "hex" => Ok(KeyComparator::Hexadecimal),
            "realnumber" | "real" => Ok(KeyComparator::RealNumber),
            "pairlexical" => Ok(KeyComparator::PairLexical),
            _ => Err(Status::invalid_argument(format!("unknown comparator: {}", value))),
        }
    }
}

fn skip_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn split_sign(bytes: &[u8]) -> (bool, &[u8]) {
    match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        Some(b'+') => (false, &bytes[1..]),
        _ => (false, bytes),
    }
}

fn parse_decimal(bytes: &[u8]) -> i128 {
    let (negative, digits) = split_sign(skip_spaces(bytes));
    let mut value: i128 = 0;
    for byte in digits.iter().take_while(|byte| byte.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add((byte - b'0') as i128);
    }
    if negative { -value } else { value }
}

fn parse_hex(bytes: &[u8]) -> i128 {
    let (negative, mut digits) = split_sign(skip_spaces(bytes));
    if digits.len() >= 2 && digits[0] == b'0' && (digits[1] | 0x20) == b'x' {
        digits = &digits[2..];
    }
    let mut value: i128 = 0;
    for byte in digits {
        let nibble = match (*byte as char).to_digit(16) {
            Some(nibble) => nibble,
            None => break,
        };
        value = value.saturating_mul(16).saturating_add(nibble as i128);
    }
    if negative { -value } else { value }
}

fn parse_real(bytes: &[u8]) -> f64 {
    let trimmed = skip_spaces(bytes);
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < trimmed.len() {
        let byte = trimmed[end];
        let accept = match byte {
            b'0'..=b'9' => {
                seen_digit = true;
                true
            }
            b'+' | b'-' => end == 0 || matches!(trimmed[end - 1], b'e' | b'E'),
            b'.' if !seen_dot && !seen_exp => {
                seen_dot = true;
                true
            }
            b'e' | b'E' if seen_digit && !seen_exp => {
                seen_exp = true;
                true
            }
            _ => false,
        };
        if !accept {
            break;
        }
        end += 1;
    }
    // Shrink until the prefix parses, e.g. "1e" or "-".
    while end > 0 {
        if let Some(value) = std::str::from_utf8(&trimmed[..end])
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
        {
            return value;
        }
        end -= 1;
    }
    0.0
}

/// Builds a composite key ordering by `key` then `value`.
pub fn encode_pair(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + value.len() + 5);
    let _ = crate::util::encode_varint(key.len() as u64, &mut buf);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Splits a composite key built by [`encode_pair`].
pub fn decode_pair(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, read) = decode_varint(data).ok()?;
    let rest = &data[read..];
    let len = usize::try_from(len).ok()?;
    if len > rest.len() {
        return None;
    }
    Some(rest.split_at(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering::*;

    #[test]
    fn numeric_orders() {
        let cmp = KeyComparator::Decimal;
        assert_eq!(Less, cmp.compare(b"2", b"10"));
        assert_eq!(Greater, cmp.compare(b"-1", b"-20"));
        assert_eq!(Less, cmp.compare(b"010", b"10"));
        let cmp = KeyComparator::Hexadecimal;
        assert_eq!(Less, cmp.compare(b"f", b"10"));
        assert_eq!(Less, cmp.compare(b"0x0a", b"0xB"));
        let cmp = KeyComparator::RealNumber;
        assert_eq!(Less, cmp.compare(b"1.5", b"10"));
        assert_eq!(Less, cmp.compare(b"-2.5e1", b"-3"));
        assert_eq!(Greater, cmp.compare(b"1e", b"0.5"));
    }

    #[test]
    fn case_insensitive() {
        let cmp = KeyComparator::LexicalCase;
        assert_eq!(Less, cmp.compare(b"apple", b"BANANA"));
        assert_eq!(Less, cmp.compare(b"ABC", b"abc"));
        assert_eq!(Equal, cmp.compare(b"abc", b"abc"));
    }

    #[test]
    fn pairs() {
        let cmp = KeyComparator::PairLexical;
        let a = encode_pair(b"ab", b"zz");
        let b = encode_pair(b"abc", b"a");
        assert_eq!(Less, cmp.compare(&a, &b));
        assert_eq!(Some((&b"ab"[..], &b"zz"[..])), decode_pair(&a));
        assert_eq!(Less, cmp.compare(&encode_pair(b"k", b"1"), &encode_pair(b"k", b"2")));
    }

    #[test]
    fn names() {
        for cmp in [
            KeyComparator::Lexical,
            KeyComparator::LexicalCase,
            KeyComparator::Decimal,
            KeyComparator::Hexadecimal,
            KeyComparator::RealNumber,
            KeyComparator::PairLexical,
        ] {
            assert_eq!(cmp, KeyComparator::try_from(cmp.name().to_string()).unwrap());
        }
        assert!(KeyComparator::try_from("bogus".to_string()).is_err());
    }
}
