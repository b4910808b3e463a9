//! Sequence counters for `counter` values.
//!
//! A run draws numbers from one unnamed default counter and any number of
//! named counters. [`CounterStore`] keeps them in a small XML file so that
//! numbering continues across process invocations:
//!
//! ```xml
//! <counter>
//!   <count>42</count>
//!   <count name="invoice">7</count>
//! </counter>
//! ```
//!
//! The file is created empty when absent and written back by
//! [`CounterStore::save`] or, failing an explicit save, when the store drops.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Counter collaborator.
pub trait Counter {
    /// Returns the current value of the named counter (the default counter
    /// for `None`) and advances it. Unknown named counters start at 0.
    fn count(&mut self, name: Option<&str>) -> Result<i64>;
}

impl<C: Counter + ?Sized> Counter for Rc<RefCell<C>> {
    fn count(&mut self, name: Option<&str>) -> Result<i64> {
        self.borrow_mut().count(name)
    }
}

/// Counters held in memory only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryCounter {
    pub default: i64,
    pub named: IndexMap<String, i64>,
}

impl MemoryCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default(mut self, value: i64) -> Self {
        self.default = value;
        self
    }

    #[must_use]
    pub fn with_named(mut self, name: impl Into<String>, value: i64) -> Self {
        self.named.insert(name.into(), value);
        self
    }
}

impl Counter for MemoryCounter {
    fn count(&mut self, name: Option<&str>) -> Result<i64> {
        let slot = match name {
            Some(name) => self.named.entry(name.to_string()).or_insert(0),
            None => &mut self.default,
        };
        let value = *slot;
        *slot = value
            .checked_add(1)
            .ok_or_else(|| Error::encoding("counter overflow", None))?;
        Ok(value)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "counter")]
struct CounterFile {
    #[serde(rename = "count", default)]
    counts: Vec<CountEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CountEntry {
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "$text")]
    value: i64,
}

/// Counters persisted to an XML file.
#[derive(Debug)]
pub struct CounterStore {
    path: PathBuf,
    counters: MemoryCounter,
    dirty: bool,
}

impl CounterStore {
    /// Opens the store at `path`, creating an empty file if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "creating empty counter file");
            let mut store = CounterStore {
                path,
                counters: MemoryCounter::new(),
                dirty: true,
            };
            store.save()?;
            return Ok(store);
        }

        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::input_data(format!("cannot read {}: {}", path.display(), e), None)
        })?;
        let counters = Self::parse(&text)
            .map_err(|e| e.with_context(|| path.display().to_string()))?;
        Ok(CounterStore {
            path,
            counters,
            dirty: false,
        })
    }

    fn parse(text: &str) -> Result<MemoryCounter> {
        let file: CounterFile = quick_xml::de::from_str(text)
            .map_err(|e| Error::input_data(format!("malformed counter file: {}", e), None))?;
        let mut counters = MemoryCounter::new();
        let mut seen_default = false;
        for entry in file.counts {
            match entry.name {
                Some(name) => {
                    if counters.named.contains_key(&name) {
                        return Err(Error::input_data(
                            format!("counter '{}' is defined more than once", name),
                            None,
                        ));
                    }
                    counters.named.insert(name, entry.value);
                }
                None => {
                    if seen_default {
                        return Err(Error::input_data(
                            "the unnamed counter is defined more than once",
                            None,
                        ));
                    }
                    counters.default = entry.value;
                    seen_default = true;
                }
            }
        }
        Ok(counters)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counters(&self) -> &MemoryCounter {
        &self.counters
    }

    /// Writes the current values back to the file.
    pub fn save(&mut self) -> Result<()> {
        let file = CounterFile {
            counts: std::iter::once(CountEntry {
                name: None,
                value: self.counters.default,
            })
            .chain(self.counters.named.iter().map(|(name, &value)| CountEntry {
                name: Some(name.clone()),
                value,
            }))
            .collect(),
        };
        let xml = quick_xml::se::to_string(&file)
            .map_err(|e| Error::custom(format!("cannot serialize counters: {}", e)))?;
        std::fs::write(&self.path, xml)?;
        self.dirty = false;
        Ok(())
    }
}

impl Counter for CounterStore {
    fn count(&mut self, name: Option<&str>) -> Result<i64> {
        self.dirty = true;
        self.counters.count(name)
    }
}

impl Drop for CounterStore {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(err) = self.save() {
                warn!(path = %self.path.display(), %err, "failed to persist counters");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_counter_sequences() {
        let mut counter = MemoryCounter::new().with_default(5).with_named("a", 10);
        assert_eq!(counter.count(None).unwrap(), 5);
        assert_eq!(counter.count(None).unwrap(), 6);
        assert_eq!(counter.count(Some("a")).unwrap(), 10);
        assert_eq!(counter.count(Some("new")).unwrap(), 0);
        assert_eq!(counter.count(Some("new")).unwrap(), 1);
        assert_eq!(counter.default, 7);
    }

    #[test]
    fn test_store_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter.xml");
        {
            let mut store = CounterStore::open(&path).unwrap();
            assert!(path.exists());
            assert_eq!(store.count(None).unwrap(), 0);
            assert_eq!(store.count(Some("inv")).unwrap(), 0);
            assert_eq!(store.count(Some("inv")).unwrap(), 1);
        }
        let mut store = CounterStore::open(&path).unwrap();
        assert_eq!(store.counters().default, 1);
        assert_eq!(store.count(Some("inv")).unwrap(), 2);
        store.save().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("name=\"inv\""));
    }

    #[test]
    fn test_store_reads_hand_written_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter.xml");
        std::fs::write(
            &path,
            "<counter><count>41</count><count name=\"x\">3</count></counter>",
        )
        .unwrap();
        let mut store = CounterStore::open(&path).unwrap();
        assert_eq!(store.count(None).unwrap(), 41);
        assert_eq!(store.count(Some("x")).unwrap(), 3);
    }

    #[test]
    fn test_duplicate_counters_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter.xml");
        std::fs::write(
            &path,
            "<counter><count name=\"x\">1</count><count name=\"x\">2</count></counter>",
        )
        .unwrap();
        assert!(CounterStore::open(&path).unwrap_err().is_input_data());

        std::fs::write(&path, "<counter><count>1</count><count>2</count></counter>").unwrap();
        assert!(CounterStore::open(&path).unwrap_err().is_input_data());
    }

    #[test]
    fn test_shared_counter() {
        let shared = Rc::new(RefCell::new(MemoryCounter::new()));
        let mut handle = Rc::clone(&shared);
        handle.count(None).unwrap();
        assert_eq!(shared.borrow().default, 1);
    }
}
