//! Codec primitives: notation strings and text to bytes.
//!
//! A field's `encoding` attribute selects one [`Codec`]:
//!
//! | name | bytes |
//! |---|---|
//! | `binary` | `"0110100011101011"` → `[0x68, 0xEB]` |
//! | `hexadecimal` | `"0F1B"` → `[0x0F, 0x1B]` |
//! | `decimal` | `"255"` → `[0xFF, 0x00]` (two's complement, little-endian) |
//! | `utf-8` | default, also used for unknown names |
//! | `utf-16`, `utf-16le`, `utf-16be` | UTF-16 without BOM |
//! | `shift-jis` | legacy double-byte code page |
//!
//! ## Examples
//!
//! ```rust
//! use binform::codec::{from_binary, from_decimal, from_hex};
//!
//! assert_eq!(from_binary("011").unwrap(), vec![0x03]);
//! assert_eq!(from_hex("C").unwrap(), vec![0x0C]);
//! assert_eq!(from_decimal("-1", 4).unwrap(), vec![0xFF; 4]);
//! assert!(from_hex("FG").is_err());
//! ```

use crate::error::{Error, Result};
use num_bigint::BigInt;
use std::borrow::Cow;
use tracing::warn;

/// Converts a string of `0`/`1` digits into bytes, MSB first.
///
/// Full groups of eight digits become one byte each; a trailing partial group
/// becomes the low bits of one more byte.
pub fn from_binary(digits: &str) -> Result<Vec<u8>> {
    let bits = digits.as_bytes();
    bits.chunks(8)
        .map(|group| {
            group.iter().try_fold(0u8, |acc, &bit| match bit {
                b'0' => Ok(acc << 1),
                b'1' => Ok((acc << 1) | 1),
                other => Err(Error::encoding(
                    format!("'{}' is not a binary digit in {:?}", other as char, digits),
                    None,
                )),
            })
        })
        .collect()
}

/// Converts a string of hex digits into bytes.
///
/// Pairs of digits become one byte each; a lone trailing digit becomes the
/// low nibble of one more byte.
pub fn from_hex(digits: &str) -> Result<Vec<u8>> {
    let nibbles = digits
        .chars()
        .map(|c| {
            c.to_digit(16).map(|d| d as u8).ok_or_else(|| {
                Error::encoding(format!("'{}' is not a hex digit in {:?}", c, digits), None)
            })
        })
        .collect::<Result<Vec<u8>>>()?;
    Ok(nibbles
        .chunks(2)
        .map(|pair| pair.iter().fold(0u8, |acc, n| (acc << 4) | n))
        .collect())
}

/// Converts a decimal integer of any size into two's-complement little-endian
/// bytes.
///
/// The result is the minimal representation, sign-extended with `0x00` or
/// `0xFF` up to `width`. A minimal representation longer than `width` is
/// returned whole; trimming to the field width is the caller's concern.
pub fn from_decimal(number: &str, width: usize) -> Result<Vec<u8>> {
    let value: BigInt = number
        .trim()
        .parse()
        .map_err(|e| Error::encoding(format!("{:?} is not a decimal integer: {}", number, e), None))?;
    let mut bytes = value.to_signed_bytes_le();
    if bytes.len() < width {
        let fill = if value.sign() == num_bigint::Sign::Minus {
            0xFF
        } else {
            0x00
        };
        bytes.resize(width, fill);
    }
    Ok(bytes)
}

/// Text encodings selectable by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    ShiftJis,
}

impl TextEncoding {
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            TextEncoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            TextEncoding::ShiftJis => {
                let (bytes, _, lossy) = encoding_rs::SHIFT_JIS.encode(text);
                if lossy {
                    warn!(text, "characters not representable in shift-jis were replaced");
                }
                bytes.into_owned()
            }
        }
    }
}

/// The byte conversion selected by a field's `encoding` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Binary,
    Hexadecimal,
    Decimal,
    Text(TextEncoding),
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Text(TextEncoding::Utf8)
    }
}

impl Codec {
    /// Selects a codec by attribute value. Absent or unknown names mean UTF-8.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("binary") => Codec::Binary,
            Some("hexadecimal") => Codec::Hexadecimal,
            Some("decimal") => Codec::Decimal,
            Some("utf-16") | Some("utf-16le") => Codec::Text(TextEncoding::Utf16Le),
            Some("utf-16be") => Codec::Text(TextEncoding::Utf16Be),
            Some("shift-jis") => Codec::Text(TextEncoding::ShiftJis),
            _ => Codec::default(),
        }
    }

    /// Encodes `value`; `width` only affects decimal sign extension.
    pub fn encode(self, value: &str, width: usize) -> Result<Vec<u8>> {
        match self {
            Codec::Binary => from_binary(value),
            Codec::Hexadecimal => from_hex(value),
            Codec::Decimal => from_decimal(value, width),
            Codec::Text(text) => Ok(text.encode(value)),
        }
    }
}

/// Decodes file contents to text, honouring a UTF-8 or UTF-16 byte order mark.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let (text, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if had_errors {
        warn!("input contained malformed sequences; replaced with U+FFFD");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_groups_from_the_left() {
        assert_eq!(from_binary("0110100011101011").unwrap(), vec![0x68, 0xEB]);
        assert_eq!(from_binary("011").unwrap(), vec![0x03]);
        assert_eq!(from_binary("11111111101").unwrap(), vec![0xFF, 0x05]);
        assert!(from_binary("").unwrap().is_empty());
        assert!(from_binary("0120").is_err());
    }

    #[test]
    fn test_hex_trailing_nibble() {
        assert_eq!(from_hex("0F1B").unwrap(), vec![0x0F, 0x1B]);
        assert_eq!(from_hex("C").unwrap(), vec![0x0C]);
        assert_eq!(from_hex("abc").unwrap(), vec![0xAB, 0x0C]);
        assert!(from_hex("").unwrap().is_empty());
        assert!(from_hex("FG").unwrap_err().is_encoding());
    }

    #[test]
    fn test_decimal_minimal_and_extended() {
        assert_eq!(from_decimal("255", 0).unwrap(), vec![0xFF, 0x00]);
        assert_eq!(from_decimal("0", 0).unwrap(), vec![0x00]);
        assert_eq!(from_decimal("255", 8).unwrap(), 255i64.to_le_bytes().to_vec());
        assert_eq!(from_decimal("-255", 8).unwrap(), (-255i64).to_le_bytes().to_vec());
        assert_eq!(from_decimal("65536", 1).unwrap(), vec![0x00, 0x00, 0x01]);
        assert!(from_decimal("12a", 4).is_err());
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(Codec::from_name(None), Codec::Text(TextEncoding::Utf8));
        assert_eq!(Codec::from_name(Some("latin-9")), Codec::Text(TextEncoding::Utf8));
        assert_eq!(Codec::from_name(Some("utf-16")), Codec::Text(TextEncoding::Utf16Le));
        assert_eq!(Codec::from_name(Some("decimal")), Codec::Decimal);
    }

    #[test]
    fn test_text_encodings() {
        assert_eq!(TextEncoding::Utf16Le.encode("A"), vec![0x41, 0x00]);
        assert_eq!(TextEncoding::Utf16Be.encode("A"), vec![0x00, 0x41]);
        assert_eq!(TextEncoding::ShiftJis.encode("あ"), vec![0x82, 0xA0]);
    }

    #[test]
    fn test_decode_text_strips_bom() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFabc"), "abc");
        assert_eq!(decode_text(b"\xFF\xFEa\x00"), "a");
    }
}
