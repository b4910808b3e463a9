//! CSV input for [`TableSource`].
//!
//! The first record is the header; its fields are the key paths items look
//! up. Quoting follows RFC 4180: quoted fields may hold commas, line breaks
//! and doubled quotes. Blank lines are skipped. Rows may be shorter or longer
//! than the header.
//!
//! ```rust
//! use binform::csv::read_csv;
//! use binform::record::RecordSource;
//!
//! let mut table = read_csv("id,note\n1,\"a, b\"\n").unwrap();
//! table.read_chunk().unwrap();
//! assert_eq!(table.field("note"), "a, b");
//! ```

use crate::codec::decode_text;
use crate::error::{Error, Result};
use crate::record::TableSource;
use std::path::Path;

/// One parsed record with the lines it spans.
#[derive(Clone, Debug, PartialEq)]
pub struct CsvRecord {
    pub fields: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

/// Splits CSV text into records.
pub fn parse_records(text: &str) -> Result<Vec<CsvRecord>> {
    let chars: Vec<char> = text.chars().collect();
    let mut records = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < chars.len() {
        let start_line = line;
        let record_start = i;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut state = State::FieldStart;
        let mut touched = false;

        let bad = |msg: &str, at: usize, line: usize| {
            let end = chars[at..]
                .iter()
                .position(|&c| c == '\n')
                .map_or(chars.len(), |n| at + n);
            let raw: String = chars[record_start..end].iter().collect();
            Error::bad_data(msg, records.len() + 1, line, &raw)
        };

        loop {
            let Some(&c) = chars.get(i) else {
                if state == State::Quoted {
                    return Err(bad("unterminated quoted field", record_start, line));
                }
                fields.push(std::mem::take(&mut field));
                break;
            };
            i += 1;
            let newline = c == '\n' || c == '\r';
            if c == '\r' && chars.get(i) == Some(&'\n') {
                i += 1;
            }

            match state {
                State::Quoted => {
                    if c == '"' {
                        state = State::QuoteInQuoted;
                    } else if newline {
                        line += 1;
                        field.push('\n');
                    } else {
                        field.push(c);
                    }
                    continue;
                }
                State::QuoteInQuoted if c == '"' => {
                    field.push('"');
                    state = State::Quoted;
                    continue;
                }
                State::QuoteInQuoted if c != ',' && !newline => {
                    return Err(bad("unexpected character after closing quote", i - 1, line));
                }
                State::Unquoted if c == '"' => {
                    return Err(bad("quote inside an unquoted field", i - 1, line));
                }
                State::FieldStart if c == '"' => {
                    touched = true;
                    state = State::Quoted;
                    continue;
                }
                _ => {}
            }

            if newline {
                line += 1;
                fields.push(std::mem::take(&mut field));
                break;
            }
            touched = true;
            if c == ',' {
                fields.push(std::mem::take(&mut field));
                state = State::FieldStart;
            } else {
                field.push(c);
                state = State::Unquoted;
            }
        }

        if touched {
            let end_line = if i > 0 && matches!(chars[i - 1], '\n' | '\r') {
                line - 1
            } else {
                line
            };
            records.push(CsvRecord {
                fields,
                start_line,
                end_line,
            });
        }
    }
    Ok(records)
}

/// Builds a table from CSV text; the first record is the header.
pub fn read_csv(text: &str) -> Result<TableSource> {
    let mut records = parse_records(text)?.into_iter();
    let mut table = match records.next() {
        Some(header) => TableSource::new(header.fields),
        None => TableSource::new(Vec::<String>::new()),
    };
    for record in records {
        table.push_row(record.fields, record.end_line);
    }
    Ok(table)
}

/// Reads a CSV file, honouring a byte order mark.
pub fn load_csv(path: impl AsRef<Path>) -> Result<TableSource> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        Error::input_data(format!("cannot read {}: {}", path.display(), e), None)
    })?;
    read_csv(&decode_text(&bytes))
}
