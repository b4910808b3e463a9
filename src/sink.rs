//! Output sinks.
//!
//! A [`DataWriter`] receives fields from the walker. [`BinaryWriter`] writes
//! to any seekable stream and supports lazy fields: a field marked
//! `eval="lazy"` is written once immediately (as a placeholder) and written
//! again at the same position when the enclosing chunk completes, by which
//! time later fields have recorded the values it refers to.
//!
//! Lazy fields are queued per nesting level. [`DataWriter::push`] opens a
//! level, [`DataWriter::write_chunk`] replays the innermost level newest
//! first, and [`DataWriter::pop`] discards it.
//!
//! ```rust
//! use binform::sink::{BinaryWriter, DataWriter, MemoryBuffer};
//! use binform::{tree::Template, Encoder, Options};
//! use std::rc::Rc;
//!
//! let mut template = Template::parse(
//!     "<items><item eval='lazy' encoding='decimal' bytes='1'>\
//!        <value type='xpath'>../item[@name='s']/@result-bytes</value></item>\
//!      <item name='s'><value>abc</value></item></items>",
//! )
//! .unwrap();
//! let buffer = MemoryBuffer::new();
//! let mut writer = BinaryWriter::new(buffer.clone(), Rc::new(Encoder::new(Options::new())));
//! let items = template.tree.children(template.root).to_vec();
//!
//! writer.push();
//! for item in items {
//!     writer.set_data("", &mut template.tree, item).unwrap();
//! }
//! writer.write_chunk(&mut template.tree).unwrap();
//! writer.pop();
//! assert_eq!(buffer.bytes(), vec![3, b'a', b'b', b'c']);
//! ```

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::tree::{NodeId, Tree};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Seek, SeekFrom, Write};
use std::rc::Rc;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Sink collaborator driven by the walker.
pub trait DataWriter {
    /// Writes the field `item`, keyed by `key`.
    fn set_data(&mut self, key: &str, tree: &mut Tree, item: NodeId) -> Result<()>;

    /// Completes the innermost chunk, replaying its lazy fields.
    fn write_chunk(&mut self, tree: &mut Tree) -> Result<()>;

    /// Opens a nesting level.
    fn push(&mut self);

    /// Closes the innermost nesting level.
    fn pop(&mut self);

    /// Number of open nesting levels.
    fn depth(&self) -> usize;

    /// Flushes buffered output.
    fn finish(&mut self) -> Result<()>;

    /// Human-readable identity for logs.
    fn name(&self) -> &str {
        ""
    }
}

impl std::fmt::Debug for dyn DataWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWriter")
            .field("name", &self.name())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Writes fields to a seekable byte stream.
pub struct BinaryWriter<W: Write + Seek> {
    sink: W,
    encoder: Rc<Encoder>,
    lazy: Vec<Vec<(NodeId, Option<u64>)>>,
    name: String,
}

impl<W: Write + Seek> BinaryWriter<W> {
    pub fn new(sink: W, encoder: Rc<Encoder>) -> Self {
        BinaryWriter {
            sink,
            encoder,
            lazy: Vec::new(),
            name: String::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write + Seek> DataWriter for BinaryWriter<W> {
    fn set_data(&mut self, _key: &str, tree: &mut Tree, item: NodeId) -> Result<()> {
        let lazy = tree.attr(item, "eval") == Some("lazy");
        let position = self.sink.stream_position()?;
        self.encoder.write(&mut self.sink, tree, item)?;
        if lazy {
            let offset = match tree.attr(item, "offset") {
                Some(_) => None,
                None => Some(position),
            };
            let level = self.lazy.last_mut().ok_or_else(|| {
                Error::custom(format!(
                    "lazy field outside any chunk: {}",
                    tree.describe(item)
                ))
            })?;
            level.push((item, offset));
        }
        Ok(())
    }

    fn write_chunk(&mut self, tree: &mut Tree) -> Result<()> {
        let Some(level) = self.lazy.last_mut() else {
            return Ok(());
        };
        if !level.is_empty() {
            debug!(pending = level.len(), "replaying lazy fields");
        }
        while let Some((item, offset)) = level.pop() {
            self.encoder.write_at(&mut self.sink, tree, item, offset)?;
        }
        Ok(())
    }

    fn push(&mut self) {
        self.lazy.push(Vec::new());
    }

    fn pop(&mut self) {
        if let Some(level) = self.lazy.pop() {
            if !level.is_empty() {
                debug!(pending = level.len(), "dropping lazy fields of an unfinished chunk");
            }
        }
    }

    fn depth(&self) -> usize {
        self.lazy.len()
    }

    fn finish(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Collects fields as text, used for writer-node configuration.
///
/// Has no nesting levels and ignores laziness.
pub struct StringWriter {
    buffer: Mutex<Cursor<Vec<u8>>>,
    encoder: Rc<Encoder>,
}

impl StringWriter {
    pub fn new(encoder: Rc<Encoder>) -> Self {
        StringWriter {
            buffer: Mutex::new(Cursor::new(Vec::new())),
            encoder,
        }
    }

    pub fn contents(&self) -> Result<String> {
        let buffer = self
            .buffer
            .lock()
            .map_err(|_| Error::custom("string sink lock poisoned"))?;
        Ok(String::from_utf8_lossy(buffer.get_ref()).into_owned())
    }
}

impl DataWriter for StringWriter {
    fn set_data(&mut self, _key: &str, tree: &mut Tree, item: NodeId) -> Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| Error::custom("string sink lock poisoned"))?;
        self.encoder.write(&mut *buffer, tree, item)
    }

    fn write_chunk(&mut self, _tree: &mut Tree) -> Result<()> {
        Ok(())
    }

    fn push(&mut self) {}

    fn pop(&mut self) {}

    fn depth(&self) -> usize {
        0
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A shared in-memory byte stream.
#[derive(Clone, Debug, Default)]
pub struct MemoryBuffer(Rc<RefCell<Cursor<Vec<u8>>>>);

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().get_ref().clone()
    }
}

impl Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

/// Creates the sink a writer node asks for.
pub trait WriterFactory {
    fn create(&self, kind: &str, name: &str, encoder: Rc<Encoder>) -> Result<Box<dyn DataWriter>>;
}

/// Creates `binary-file` sinks on disk, relative to the base directory.
#[derive(Clone, Debug, Default)]
pub struct FileWriterFactory {
    options: Options,
}

impl FileWriterFactory {
    pub fn new(options: Options) -> Self {
        FileWriterFactory { options }
    }
}

impl WriterFactory for FileWriterFactory {
    fn create(&self, kind: &str, name: &str, encoder: Rc<Encoder>) -> Result<Box<dyn DataWriter>> {
        match kind {
            "binary-file" => {
                let path = self.options.resolve(name, None);
                let file = File::create(&path).map_err(|e| {
                    Error::input_data(format!("cannot create {}: {}", path.display(), e), None)
                })?;
                debug!(path = %path.display(), "opened output file");
                let writer = BinaryWriter::new(BufWriter::new(file), encoder)
                    .with_name(path.display().to_string());
                Ok(Box::new(writer))
            }
            other => Err(Error::input_data(
                format!("unknown writer type '{}'", other),
                None,
            )),
        }
    }
}

/// Creates in-memory sinks and keeps their buffers by name.
#[derive(Debug, Default)]
pub struct MemoryWriterFactory {
    buffers: RefCell<IndexMap<String, MemoryBuffer>>,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.buffers.borrow().keys().cloned().collect()
    }

    pub fn bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.buffers.borrow().get(name).map(MemoryBuffer::bytes)
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn create(&self, kind: &str, name: &str, encoder: Rc<Encoder>) -> Result<Box<dyn DataWriter>> {
        match kind {
            "binary-file" | "memory" => {
                let buffer = MemoryBuffer::new();
                let replaced = self
                    .buffers
                    .borrow_mut()
                    .insert(name.to_string(), buffer.clone());
                if replaced.is_some() {
                    warn!(name, "memory sink recreated; earlier contents discarded");
                }
                Ok(Box::new(BinaryWriter::new(buffer, encoder).with_name(name)))
            }
            other => Err(Error::input_data(
                format!("unknown writer type '{}'", other),
                None,
            )),
        }
    }
}
