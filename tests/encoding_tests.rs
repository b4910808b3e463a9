use binform::codec::{from_binary, from_decimal, from_hex};
use binform::record::TableSource;
use binform::{to_bytes, Options};

fn compile(xml: &str) -> Vec<u8> {
    to_bytes(xml, None, Options::new()).unwrap()
}

fn field(attrs: &str, value: &str) -> Vec<u8> {
    compile(&format!(
        "<format><item {}><default-value>{}</default-value></item></format>",
        attrs, value
    ))
}

#[test]
fn test_codec_examples() {
    assert_eq!(from_binary("0110100011101011").unwrap(), vec![0x68, 0xEB]);
    assert!(from_hex("FG").is_err());
    assert_eq!(
        from_decimal("255", 8).unwrap(),
        vec![0xFF, 0, 0, 0, 0, 0, 0, 0]
    );
}

#[test]
fn test_field_encodings() {
    assert_eq!(field("encoding='binary'", "0110100011101011"), [0x68, 0xEB]);
    assert_eq!(field("encoding='hexadecimal'", "CAFE"), [0xCA, 0xFE]);
    assert_eq!(field("encoding='decimal' bytes='4'", "-2"), [0xFE, 0xFF, 0xFF, 0xFF]);
    assert_eq!(field("encoding='utf-16be'", "A"), [0x00, 0x41]);
    assert_eq!(field("encoding='no-such-encoding'", "A"), b"A");
}

#[test]
fn test_decimal_wider_than_field_keeps_low_bytes() {
    assert_eq!(field("encoding='decimal' bytes='1'", "258"), [0x02]);
}

#[test]
fn test_padding_and_truncation() {
    assert_eq!(field("bytes='5' rpadding='-'", "ab"), b"ab---");
    assert_eq!(field("bytes='5' lpadding='0'", "42"), b"00042");
    assert_eq!(field("bytes='6' padding='xy'", "a"), b"axyxyx");
    assert_eq!(field("bytes='3'", "a"), b"a\0\0");
    assert_eq!(field("bytes='2'", "abcdef"), b"ab");
    assert_eq!(field("bytes='0'", "abc"), b"");
    assert_eq!(field("bytes='-3'", "abc"), b"");
}

#[test]
fn test_empty_value_fills_width_with_padding() {
    assert_eq!(
        compile("<format><item bytes='3' rpadding='*'/></format>"),
        b"***"
    );
}

#[test]
fn test_offset_write_keeps_stream_end() {
    let bytes = compile(
        "<format>\
           <item><default-value>AAAAA</default-value></item>\
           <item offset='2'><default-value>B</default-value></item>\
           <item><default-value>AAAAA</default-value></item>\
         </format>",
    );
    assert_eq!(bytes, b"AABAAAAAAA");
}

#[test]
fn test_recorded_widths_feed_later_fields() {
    let records = TableSource::new(["name"]).with_row(["widget"]);
    let bytes = to_bytes(
        "<format>\
           <item name='name'/>\
           <item bytes='1' encoding='decimal'>\
             <default-value type='xpath'>../item[@name='name']/@result-bytes</default-value>\
           </item>\
           <item xbytes=\"../item[@name='name']/@result-bytes - 4\"><default-value>xyz</default-value></item>\
         </format>",
        Some(records),
        Options::new(),
    )
    .unwrap();
    assert_eq!(bytes, b"widget\x06xy");
}

#[test]
fn test_record_value_wins_over_default() {
    let records = TableSource::new(["a", "b"]).with_row(["rec", ""]);
    let bytes = to_bytes(
        "<format>\
           <item name='a'><default-value>dflt</default-value></item>\
           <item name='b'><default-value>dflt</default-value></item>\
         </format>",
        Some(records),
        Options::new(),
    )
    .unwrap();
    assert_eq!(bytes, b"recdflt");
}

#[test]
fn test_bad_width_and_offset_are_encoding_errors() {
    for xml in [
        "<format><item bytes='wide'><default-value>a</default-value></item></format>",
        "<format><item offset='-1'><default-value>a</default-value></item></format>",
        "<format><item encoding='decimal'><default-value>1.5</default-value></item></format>",
    ] {
        let err = to_bytes(xml, None, Options::new()).unwrap_err();
        assert!(err.is_encoding(), "{}", err);
        assert!(err.to_string().contains("/format/item"), "{}", err);
    }
}

#[test]
fn test_external_parameters() {
    let options = Options::new().with_externals([("region", "EU"), ("empty", "")]);
    let bytes = to_bytes(
        "<format>\
           <item><default-value type='external'>region</default-value></item>\
           <item bytes='2' rpadding='_'><default-value type='external'>missing</default-value></item>\
         </format>",
        None,
        options,
    )
    .unwrap();
    assert_eq!(bytes, b"EU__");
}
