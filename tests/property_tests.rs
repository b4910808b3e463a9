//! Property-based tests for field layout and codec guarantees.
//!
//! These complement the example-based tests by checking the width, padding
//! and truncation rules over generated values and widths.

use binform::codec::{from_binary, from_decimal, from_hex};
use binform::record::TableSource;
use binform::{to_bytes, Options};
use num_bigint::BigInt;
use proptest::prelude::*;

fn layout(attrs: &str, value: &str) -> Vec<u8> {
    let xml = format!("<format><item name='v' {}/></format>", attrs);
    let records = TableSource::new(["v"]).with_row([value]);
    to_bytes(&xml, Some(records), Options::new()).unwrap()
}

proptest! {
    #[test]
    fn prop_short_values_fill_width(value in "[a-z]{1,8}", extra in 0usize..8, pad in "[A-Z]{1,3}") {
        let width = value.len() + extra;
        let right = layout(&format!("bytes='{}' rpadding='{}'", width, pad), &value);
        let left = layout(&format!("bytes='{}' lpadding='{}'", width, pad), &value);

        prop_assert_eq!(right.len(), width);
        prop_assert_eq!(left.len(), width);
        prop_assert!(right.starts_with(value.as_bytes()));
        prop_assert!(left.ends_with(value.as_bytes()));

        let fill: Vec<u8> = pad.bytes().cycle().take(extra).collect();
        prop_assert_eq!(&right[value.len()..], &fill[..]);
        prop_assert_eq!(&left[..extra], &fill[..]);
    }

    #[test]
    fn prop_long_values_truncate(value in "[a-z]{2,16}", cut in 1usize..16) {
        let width = cut.min(value.len() - 1);
        let bytes = layout(&format!("bytes='{}' rpadding='.'", width), &value);
        prop_assert_eq!(bytes, value.as_bytes()[..width].to_vec());
    }

    #[test]
    fn prop_non_positive_width_writes_nothing(value in "[a-z]{0,8}", width in -5i32..=0) {
        let bytes = layout(&format!("bytes='{}'", width), &value);
        prop_assert!(bytes.is_empty());
    }

    #[test]
    fn prop_decimal_round_trips(n in any::<i64>(), width in 8usize..12) {
        let bytes = from_decimal(&n.to_string(), width).unwrap();
        prop_assert_eq!(bytes.len(), width);
        prop_assert_eq!(BigInt::from_signed_bytes_le(&bytes), BigInt::from(n));
    }

    #[test]
    fn prop_binary_matches_hex(byte_values in prop::collection::vec(any::<u8>(), 0..8)) {
        let bits: String = byte_values.iter().map(|b| format!("{:08b}", b)).collect();
        let hex: String = byte_values.iter().map(|b| format!("{:02X}", b)).collect();
        prop_assert_eq!(from_binary(&bits).unwrap(), byte_values.clone());
        prop_assert_eq!(from_hex(&hex).unwrap(), byte_values);
    }
}
