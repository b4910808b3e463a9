//! The combined-source tracker.
//!
//! A traversal can be given an ordered list of secondary documents, each
//! with an optional record source. They are consumed one at a time by
//! `repeat type="combined-xml"` loops, and the document under the cursor is
//! what `import type="combined"` walks and what `item type="combined"` reads.
//!
//! The cursor starts before the first entry and only moves forward. Once it
//! steps past the last entry it stays there, and [`CombinedSources::current`]
//! reports nothing.

use crate::record::BoxedSource;
use crate::tree::{NodeId, Tree};
use std::path::PathBuf;

/// One secondary document in the arena and the records that go with it.
pub struct Combined {
    pub reader: Option<BoxedSource>,
    pub root: NodeId,
    pub path: Option<PathBuf>,
}

impl std::fmt::Debug for Combined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Combined")
            .field("reader", &self.reader.is_some())
            .field("root", &self.root)
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CombinedSources {
    entries: Vec<Combined>,
    cursor: Option<usize>,
}

impl CombinedSources {
    pub fn new(entries: Vec<Combined>) -> Self {
        CombinedSources {
            entries,
            cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cursor position; `None` until the first [`CombinedSources::next`].
    pub fn position(&self) -> Option<usize> {
        self.cursor
    }

    /// Moves to the next entry. Returns `false` once the list is exhausted.
    pub fn next(&mut self) -> bool {
        match self.cursor {
            None if !self.entries.is_empty() => self.cursor = Some(0),
            Some(index) if index < self.entries.len() => self.cursor = Some(index + 1),
            _ => {}
        }
        self.current_index().is_some()
    }

    /// Index of the entry under the cursor, if any.
    pub fn current_index(&self) -> Option<usize> {
        self.cursor.filter(|&index| index < self.entries.len())
    }

    pub fn current(&self) -> Option<&Combined> {
        self.current_index().map(|index| &self.entries[index])
    }

    pub fn current_mut(&mut self) -> Option<&mut Combined> {
        let index = self.current_index()?;
        self.entries.get_mut(index)
    }

    pub fn get(&self, index: usize) -> Option<&Combined> {
        self.entries.get(index)
    }

    pub fn reader_mut(&mut self, index: usize) -> Option<&mut BoxedSource> {
        self.entries.get_mut(index)?.reader.as_mut()
    }

    /// Value for `key` from the current entry's records, if there is a
    /// current entry.
    pub fn get_data(&self, key: &str, tree: &Tree, node: NodeId) -> Option<String> {
        let current = self.current()?;
        Some(
            current
                .reader
                .as_ref()
                .map(|reader| reader.get_data(key, tree, node))
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TableSource;

    fn entries(tree: &mut Tree, count: usize) -> Vec<Combined> {
        (0..count)
            .map(|i| Combined {
                reader: Some(Box::new(
                    TableSource::new(["k"]).with_row([format!("v{}", i)]),
                )),
                root: tree.add_element(None, "format"),
                path: None,
            })
            .collect()
    }

    #[test]
    fn test_cursor_moves_forward_only() {
        let mut tree = Tree::new();
        let mut sources = CombinedSources::new(entries(&mut tree, 2));
        assert_eq!(sources.position(), None);
        assert!(sources.current().is_none());

        assert!(sources.next());
        assert_eq!(sources.current_index(), Some(0));
        assert!(sources.next());
        assert_eq!(sources.current_index(), Some(1));
        assert!(!sources.next());
        assert_eq!(sources.position(), Some(2));
        assert!(sources.current().is_none());
        assert!(!sources.next());
        assert_eq!(sources.position(), Some(2));
    }

    #[test]
    fn test_empty_list_never_starts() {
        let mut sources = CombinedSources::default();
        assert!(!sources.next());
        assert_eq!(sources.position(), None);
    }

    #[test]
    fn test_get_data_reads_current_entry() {
        let mut tree = Tree::new();
        let node = tree.add_element(None, "item");
        let mut sources = CombinedSources::new(entries(&mut tree, 2));
        assert_eq!(sources.get_data("k", &tree, node), None);
        sources.next();
        sources.next();
        sources.reader_mut(1).unwrap().read_chunk().unwrap();
        assert_eq!(sources.get_data("k", &tree, node).as_deref(), Some("v1"));
        assert_eq!(sources.get_data("missing", &tree, node).as_deref(), Some(""));
    }
}
