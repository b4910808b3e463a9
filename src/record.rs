//! Record sources: where `item` nodes get their values.
//!
//! A [`RecordSource`] exposes one current record at a time. The walker
//! advances it with [`RecordSource::read_chunk`], and repeat loops that need
//! a private record context bracket their body with [`RecordSource::push`]
//! and [`RecordSource::pop`].
//!
//! [`TableSource`] is the in-memory implementation behind the CSV reader: a
//! header mapping column names (key paths) to indexes plus the parsed rows.
//!
//! ## Examples
//!
//! ```rust
//! use binform::record::{RecordSource, TableSource};
//!
//! let mut table = TableSource::new(["id", "name"]);
//! table.push_row(vec!["1".into(), "ann".into()], 2);
//! assert!(table.read_chunk().unwrap());
//! assert_eq!(table.field("name"), "ann");
//! assert!(!table.read_chunk().unwrap());
//! assert_eq!(table.field("name"), "ann");
//! ```

use crate::error::Result;
use crate::tree::{NodeId, Tree};
use indexmap::IndexMap;

/// Record-source collaborator.
pub trait RecordSource {
    /// Advances to the next record. Returns `false` at the end, leaving the
    /// current record in place.
    fn read_chunk(&mut self) -> Result<bool>;

    /// Whether the last `read_chunk` produced a record.
    fn valid(&self) -> bool;

    /// Identity of the current record, used for non-advancing loop detection.
    fn chunk_id(&self) -> i64;

    /// Saves the current record context and starts an empty one.
    fn push(&mut self);

    /// Restores the record context saved by the matching `push`.
    fn pop(&mut self);

    /// Value for `key` in the current record; unknown keys read as empty.
    fn get_data(&self, key: &str, tree: &Tree, node: NodeId) -> String;
}

pub type BoxedSource = Box<dyn RecordSource>;

#[derive(Clone, Debug)]
struct Row {
    fields: Vec<String>,
    line: usize,
}

/// Header-indexed rows consumed front to back.
#[derive(Clone, Debug, Default)]
pub struct TableSource {
    columns: IndexMap<String, usize>,
    rows: Vec<Row>,
    next: usize,
    valid: bool,
    chunk_id: i64,
    stack: Vec<Vec<String>>,
}

impl TableSource {
    /// Creates an empty table with the given header.
    pub fn new<I, S>(header: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns = IndexMap::new();
        for (index, name) in header.into_iter().enumerate() {
            columns.insert(name.into(), index);
        }
        TableSource {
            columns,
            stack: vec![Vec::new()],
            ..Default::default()
        }
    }

    /// Appends a row; `line` is the source line the row ends on.
    pub fn push_row(&mut self, fields: Vec<String>, line: usize) {
        self.rows.push(Row { fields, line });
    }

    #[must_use]
    pub fn with_row<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let line = self.rows.last().map_or(2, |row| row.line + 1);
        self.push_row(fields.into_iter().map(Into::into).collect(), line);
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the current record.
    pub fn field(&self, column: &str) -> &str {
        let index = match self.columns.get(column) {
            Some(&index) => index,
            None => return "",
        };
        self.stack
            .last()
            .and_then(|record| record.get(index))
            .map(String::as_str)
            .unwrap_or("")
    }
}

impl RecordSource for TableSource {
    fn read_chunk(&mut self) -> Result<bool> {
        self.valid = match self.rows.get(self.next) {
            Some(row) => {
                self.chunk_id = row.line as i64;
                let fields = row.fields.clone();
                match self.stack.last_mut() {
                    Some(top) => *top = fields,
                    None => self.stack.push(fields),
                }
                self.next += 1;
                true
            }
            None => false,
        };
        Ok(self.valid)
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn chunk_id(&self) -> i64 {
        self.chunk_id
    }

    fn push(&mut self) {
        self.stack.push(Vec::new());
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn get_data(&self, key: &str, _tree: &Tree, _node: NodeId) -> String {
        self.field(key).to_string()
    }
}
