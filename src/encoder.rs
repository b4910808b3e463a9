//! The binary encoding engine.
//!
//! [`Encoder::write`] turns one `item` node into bytes:
//!
//! 1. **Value resolution** ([`Encoder::get_string`]): the item's `value`,
//!    `default-value` and `transform` children are applied in document order.
//!    A `default-value` only applies while the value is still empty, and a
//!    `transform` is skipped for an empty value.
//! 2. **Layout**: width comes from `bytes`, else from `xbytes` evaluated
//!    against the item, else the value's natural length. `lpadding` pads on
//!    the left; `padding`/`rpadding` pad on the right. Padding text is encoded
//!    with the item's `encoding` and repeated to fill the remainder. Widths
//!    above [`MAX_FIELD_WIDTH`] are an encoding error.
//! 3. **Emission**: an `offset` moves the write to an absolute position, and
//!    the sink always returns to end-of-stream afterwards, even when the
//!    write fails.
//!
//! Every byte of a field is computed before the sink is touched, so a field
//! that fails to encode leaves nothing behind.
//!
//! ## Value kinds
//!
//! | `type` | value |
//! |---|---|
//! | (none) | the node's text |
//! | `xpath` | the text evaluated as an expression against the item |
//! | `current-time` | the local time, formatted by the text |
//! | `counter` | next value of the named counter (default counter if empty) |
//! | `auto-increment` | the text, after which the text is incremented |
//! | `external` | the external parameter named by the text |
//!
//! ## Examples
//!
//! ```rust
//! use binform::{Encoder, Options, tree::Template};
//! use std::io::Cursor;
//!
//! let mut template =
//!     Template::parse("<item bytes='4' lpadding='0'><value>42</value></item>").unwrap();
//! let encoder = Encoder::new(Options::new());
//! let mut out = Cursor::new(Vec::new());
//! encoder.write(&mut out, &mut template.tree, template.root).unwrap();
//! assert_eq!(out.into_inner(), b"0042");
//! ```

use crate::codec::Codec;
use crate::counter::{Counter, MemoryCounter};
use crate::error::{Error, Result};
use crate::expr::{Evaluator, PathEvaluator};
use crate::options::Options;
use crate::transform::{TransformerCache, TransformerRegistry};
use crate::tree::{NodeId, Tree};
use chrono::format::{Item, StrftimeItems};
use chrono::{Local, NaiveDateTime};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::{Seek, SeekFrom, Write};
use std::rc::Rc;
use tracing::trace;

/// Widest field a template may declare, in bytes.
pub const MAX_FIELD_WIDTH: i32 = 1 << 24;

/// A random-access byte sink.
pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek + ?Sized> WriteSeek for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Bytes for one field and the length to record for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub bytes: Vec<u8>,
    pub recorded: Option<i64>,
}

/// Resolves item values and writes them under width, padding, offset and
/// encoding rules.
pub struct Encoder {
    options: Options,
    transformers: Rc<dyn TransformerRegistry>,
    counter: RefCell<Box<dyn Counter>>,
    evaluator: Rc<dyn Evaluator>,
}

impl Encoder {
    /// Creates an encoder with file-backed transformers, in-memory counters
    /// and the built-in expression evaluator.
    #[must_use]
    pub fn new(options: Options) -> Self {
        Encoder {
            transformers: Rc::new(TransformerCache::new(options.clone())),
            counter: RefCell::new(Box::new(MemoryCounter::new())),
            evaluator: Rc::new(PathEvaluator::new()),
            options,
        }
    }

    #[must_use]
    pub fn with_counter(mut self, counter: impl Counter + 'static) -> Self {
        self.counter = RefCell::new(Box::new(counter));
        self
    }

    #[must_use]
    pub fn with_transformers(mut self, transformers: impl TransformerRegistry + 'static) -> Self {
        self.transformers = Rc::new(transformers);
        self
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Rc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn evaluator(&self) -> Rc<dyn Evaluator> {
        Rc::clone(&self.evaluator)
    }

    /// Resolves the string value of `item` from its children.
    pub fn get_string(&self, tree: &mut Tree, item: NodeId) -> Result<String> {
        let mut value = String::new();
        for child in tree.children(item).to_vec() {
            let name = tree.name(child).to_string();
            match name.as_str() {
                "value" => value = self.evaluate(tree, child, item)?,
                "default-value" if value.is_empty() => value = self.evaluate(tree, child, item)?,
                "transform" if !value.is_empty() => {
                    let name = tree.string_value(child);
                    value = self.transformers.get(&name)?.transform(&value)?;
                }
                _ => {}
            }
        }
        Ok(value)
    }

    fn evaluate(&self, tree: &mut Tree, node: NodeId, item: NodeId) -> Result<String> {
        let text = tree.string_value(node);
        let kind = tree.attr(node, "type").map(str::to_string);
        match kind.as_deref() {
            Some("xpath") => self.evaluator.evaluate(tree, item.into(), &text),
            Some("current-time") => format_time(&Local::now().naive_local(), &text),
            Some("counter") => {
                let name = (!text.is_empty()).then_some(text.as_str());
                Ok(self.counter.borrow_mut().count(name)?.to_string())
            }
            Some("auto-increment") => auto_increment(tree, node, text),
            Some("external") => Ok(self.options.external(&text).to_string()),
            _ => Ok(text),
        }
    }

    /// Writes `item` at its declared `offset`, or at the current position.
    pub fn write(&self, sink: &mut dyn WriteSeek, tree: &mut Tree, item: NodeId) -> Result<()> {
        self.write_at(sink, tree, item, None)
    }

    /// Writes `item`, with `offset` overriding any declared one.
    pub fn write_at(
        &self,
        sink: &mut dyn WriteSeek,
        tree: &mut Tree,
        item: NodeId,
        offset: Option<u64>,
    ) -> Result<()> {
        let outcome = self.write_field(sink, tree, item, offset);
        outcome.map_err(|e| e.with_context(|| tree.describe(item)))
    }

    fn write_field(
        &self,
        sink: &mut dyn WriteSeek,
        tree: &mut Tree,
        item: NodeId,
        offset: Option<u64>,
    ) -> Result<()> {
        let value = self.get_string(tree, item)?;
        tree.state_mut(item).result = Some(value.clone());

        let offset = match offset {
            Some(offset) => Some(offset),
            None => declared_offset(tree, item)?,
        };
        let field = self.layout(tree, item, &value)?;

        let written = emit(sink, offset, &field.bytes);
        let restored = match offset {
            Some(_) => sink.seek(SeekFrom::End(0)).map(|_| ()),
            None => Ok(()),
        };
        written?;
        restored?;

        trace!(
            item = %tree.describe(item),
            value = %value,
            bytes = field.bytes.len(),
            offset = ?offset,
            "wrote field"
        );
        if let Some(length) = field.recorded {
            tree.state_mut(item).result_bytes = Some(length);
        }
        Ok(())
    }

    /// Computes the bytes for `value` under `item`'s layout attributes.
    pub fn layout(&self, tree: &Tree, item: NodeId, value: &str) -> Result<Field> {
        let codec = Codec::from_name(tree.attr(item, "encoding"));
        let width = match self.width(tree, item)? {
            Some(width) => width,
            None if value.is_empty() => {
                return Ok(Field {
                    bytes: Vec::new(),
                    recorded: None,
                })
            }
            None => {
                let bytes = codec.encode(value, 0)?;
                let recorded = Some(bytes.len() as i64);
                return Ok(Field { bytes, recorded });
            }
        };
        let recorded = Some(i64::from(width));
        if width <= 0 {
            return Ok(Field {
                bytes: Vec::new(),
                recorded,
            });
        }

        let width = width as usize;
        let (side, pad_text) = padding(tree, item);
        let mut pad = match pad_text {
            "" => Vec::new(),
            text => codec.encode(text, 0)?,
        };
        if pad.is_empty() {
            pad.push(0);
        }
        let fill = |length: usize| pad.iter().copied().cycle().take(length);

        if value.is_empty() {
            return Ok(Field {
                bytes: fill(width).collect(),
                recorded,
            });
        }
        let mut body = codec.encode(value, width)?;
        if body.len() >= width {
            body.truncate(width);
            return Ok(Field {
                bytes: body,
                recorded,
            });
        }
        let rest = width - body.len();
        let bytes = match side {
            Side::Right => body.into_iter().chain(fill(rest)).collect(),
            Side::Left => fill(rest).chain(body).collect(),
        };
        Ok(Field { bytes, recorded })
    }

    fn width(&self, tree: &Tree, item: NodeId) -> Result<Option<i32>> {
        let text = match (tree.attr(item, "bytes"), tree.attr(item, "xbytes")) {
            (Some(bytes), _) => bytes.to_string(),
            (None, Some(expr)) => self.evaluator.evaluate(tree, item.into(), expr)?,
            (None, None) => return Ok(None),
        };
        let width = text.trim().parse::<i32>().map_err(|e| {
            Error::encoding(format!("byte width {:?} is not an integer: {}", text, e), None)
        })?;
        if width > MAX_FIELD_WIDTH {
            return Err(Error::encoding(
                format!("byte width {} exceeds the limit of {}", width, MAX_FIELD_WIDTH),
                None,
            ));
        }
        Ok(Some(width))
    }
}

fn declared_offset(tree: &Tree, item: NodeId) -> Result<Option<u64>> {
    tree.attr(item, "offset")
        .map(|text| {
            text.trim().parse::<u64>().map_err(|_| {
                Error::encoding(
                    format!("offset {:?} is not a non-negative integer", text),
                    None,
                )
            })
        })
        .transpose()
}

fn padding(tree: &Tree, item: NodeId) -> (Side, &str) {
    if let Some(text) = tree.attr(item, "lpadding") {
        return (Side::Left, text);
    }
    let text = tree
        .attr(item, "padding")
        .or_else(|| tree.attr(item, "rpadding"))
        .unwrap_or("");
    (Side::Right, text)
}

fn emit(sink: &mut dyn WriteSeek, offset: Option<u64>, bytes: &[u8]) -> Result<()> {
    if let Some(offset) = offset {
        sink.seek(SeekFrom::Start(offset))?;
    }
    sink.write_all(bytes)?;
    Ok(())
}

/// Emits the node's stored integer and stores its successor; empty text
/// counts from 0.
fn auto_increment(tree: &mut Tree, node: NodeId, text: String) -> Result<String> {
    if text.is_empty() {
        tree.set_value(node, "1");
        return Ok("0".to_string());
    }
    let current: i64 = text.trim().parse().map_err(|_| {
        Error::encoding(format!("auto-increment value {:?} is not an integer", text), None)
    })?;
    let next = current
        .checked_add(1)
        .ok_or_else(|| Error::encoding("auto-increment overflow", None))?;
    tree.set_value(node, &next.to_string());
    Ok(text)
}

/// Formats `now` with a strftime pattern, or with a `yyyy-MM-dd HH:mm:ss`
/// style pattern when it contains no `%`.
pub fn format_time(now: &NaiveDateTime, pattern: &str) -> Result<String> {
    let pattern = if pattern.is_empty() {
        "%m/%d/%Y %H:%M:%S".to_string()
    } else if pattern.contains('%') {
        pattern.to_string()
    } else {
        translate_pattern(pattern)
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(&pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(Error::encoding(
            format!("invalid time format {:?}", pattern),
            None,
        ));
    }
    let mut out = String::new();
    write!(out, "{}", now.format_with_items(items.iter()))
        .map_err(|_| Error::encoding(format!("cannot format time with {:?}", pattern), None))?;
    Ok(out)
}

fn translate_pattern(pattern: &str) -> String {
    const TOKENS: [(&str, &str); 10] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("fff", "%3f"),
        ("tt", "%p"),
    ];
    let mut out = String::new();
    let mut rest = pattern;
    'scan: while let Some(c) = rest.chars().next() {
        for (token, item) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(item);
                rest = tail;
                continue 'scan;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}
