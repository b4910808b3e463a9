//! # binform
//!
//! A template-driven compiler from tabular records into binary layouts.
//!
//! An XML *template* describes a binary file: which fields appear, in what
//! order, how wide each one is, how it is encoded and padded, which parts
//! repeat, and which other templates are spliced in. Records (usually CSV
//! rows) supply the values. Walking the template against the records emits
//! the bytes to one or more sinks.
//!
//! ## Key Features
//!
//! - **Fixed-width fields**: text in several encodings, binary, hex and
//!   arbitrary-precision decimal numerals, padded left or right and truncated
//!   to width
//! - **Loops**: counted, record-fetching and combined-document repeats, with
//!   optional unrolling of the body in the template tree
//! - **Lazy fields**: a field can be written as a placeholder and rewritten in
//!   place once its loop body completes, so lengths and checksums can precede
//!   the data they describe
//! - **Imports**: static splicing, dynamic documents and combined documents,
//!   each editable through `map` rules before it is walked
//! - **Sink rotation**: a `writer` node closes the current output and opens a
//!   new one named by its body
//!
//! ## Quick Start
//!
//! ```rust
//! use binform::record::TableSource;
//! use binform::{to_bytes, Options};
//!
//! let template = r#"
//!     <format>
//!         <item name="kind" bytes="1"/>
//!         <item name="name" bytes="6" rpadding=" "/>
//!         <item name="size" bytes="2" encoding="decimal"/>
//!     </format>"#;
//! let records = TableSource::new(["kind", "name", "size"]).with_row(["A", "disk", "513"]);
//!
//! let bytes = to_bytes(template, Some(records), Options::new()).unwrap();
//! assert_eq!(bytes, b"Adisk  \x01\x02");
//! ```
//!
//! ## Walking a template
//!
//! [`to_bytes`] covers the single-sink case. For anything else, build a
//! [`Traverser`] and pull sinks from the [`Traversal`] it returns:
//!
//! ```rust
//! use binform::record::TableSource;
//! use binform::sink::MemoryWriterFactory;
//! use binform::{DataWriter, Encoder, Entry, Options, Template, Traverser};
//! use std::rc::Rc;
//!
//! let template = Template::parse(
//!     r#"<format>
//!          <writer type="memory"><item><default-value>a.bin</default-value></item></writer>
//!          <item name="x" bytes="1"/>
//!          <writer type="memory"><item><default-value>b.bin</default-value></item></writer>
//!          <item name="y" bytes="1"/>
//!        </format>"#,
//! )
//! .unwrap();
//! let records = TableSource::new(["x", "y"]).with_row(["1", "2"]);
//!
//! let factory = Rc::new(MemoryWriterFactory::new());
//! let traverser = Traverser::new(Rc::new(Encoder::new(Options::new())), factory.clone());
//! let mut walk = traverser.traverse(None, Entry::new(template).with_records(records), Vec::new());
//! assert_eq!(walk.next().unwrap().unwrap().name(), "a.bin");
//! assert_eq!(walk.next().unwrap().unwrap().name(), "b.bin");
//! assert!(walk.next().is_none());
//! assert_eq!(factory.bytes("a.bin").unwrap(), b"1");
//! assert_eq!(factory.bytes("b.bin").unwrap(), b"2");
//! ```
//!
//! ## Errors
//!
//! Every failure is fatal to the walk and surfaces as an [`Error`]; see the
//! [`error`] module for the categories.

pub mod codec;
pub mod combined;
pub mod counter;
pub mod csv;
pub mod encoder;
pub mod error;
pub mod expr;
pub mod import;
pub mod options;
pub mod record;
pub mod repeat;
pub mod sink;
pub mod transform;
pub mod traverse;
pub mod tree;

pub use codec::{Codec, TextEncoding};
pub use counter::{Counter, CounterStore, MemoryCounter};
pub use encoder::Encoder;
pub use error::{Error, Result};
pub use options::Options;
pub use record::{RecordSource, TableSource};
pub use sink::{BinaryWriter, DataWriter, WriterFactory};
pub use traverse::{Entry, Traversal, Traverser};
pub use tree::{NodeId, Template, Tree};

use sink::{MemoryBuffer, MemoryWriterFactory};
use std::rc::Rc;

/// Compiles `template` against `records` and returns the bytes of the
/// initial sink.
///
/// Output written after a `writer` node goes to in-memory sinks that are
/// discarded; use a [`Traverser`] to keep them.
///
/// # Examples
///
/// ```rust
/// use binform::{to_bytes, Options};
///
/// let template = r#"<format><item bytes="4" lpadding="0"><default-value>42</default-value></item></format>"#;
/// assert_eq!(to_bytes(template, None, Options::new()).unwrap(), b"0042");
/// ```
///
/// # Errors
///
/// Returns an error if the template is malformed or any field fails to
/// encode.
#[must_use = "this returns the result of the operation, errors must be handled"]
pub fn to_bytes(template: &str, records: Option<TableSource>, options: Options) -> Result<Vec<u8>> {
    let template = Template::parse(template)?;
    let encoder = Rc::new(Encoder::new(options));
    let buffer = MemoryBuffer::new();
    let writer = BinaryWriter::new(buffer.clone(), Rc::clone(&encoder));

    let mut entry = Entry::new(template);
    if let Some(records) = records {
        entry = entry.with_records(records);
    }
    Traverser::new(encoder, Rc::new(MemoryWriterFactory::new()))
        .traverse(Some(Box::new(writer)), entry, Vec::new())
        .try_for_each(|sink| sink.map(drop))?;
    Ok(buffer.bytes())
}
