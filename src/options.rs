//! Run-wide configuration.
//!
//! [`Options`] carries the values every part of a run may consult:
//!
//! - **externals**: the `-g key value` parameter map read by `external`
//!   values and `external` edit rules
//! - **base_dir**: the directory relative paths resolve against when the
//!   referencing document has no location of its own
//!
//! ## Examples
//!
//! ```rust
//! use binform::Options;
//!
//! let options = Options::new()
//!     .with_external("version", "3")
//!     .with_base_dir("/srv/templates");
//! assert_eq!(options.external("version"), "3");
//! assert_eq!(options.external("missing"), "");
//! ```

use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Configuration shared by the encoder, the import resolver and the sinks.
#[derive(Clone, Debug)]
pub struct Options {
    pub externals: IndexMap<String, String>,
    pub base_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            externals: IndexMap::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Options {
    /// Creates options with no externals, resolving paths against `.`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one external parameter, replacing any previous value for `key`.
    #[must_use]
    pub fn with_external(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.externals.insert(key.into(), value.into());
        self
    }

    /// Adds every pair from `externals`.
    #[must_use]
    pub fn with_externals<I, K, V>(mut self, externals: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.externals
            .extend(externals.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the directory used to resolve relative paths.
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Looks up an external parameter. A missing key reads as the empty string.
    pub fn external(&self, key: &str) -> &str {
        self.externals.get(key).map(String::as_str).unwrap_or("")
    }

    /// Resolves `path` against `origin`'s directory, else the base directory.
    pub fn resolve(&self, path: &str, origin: Option<&Path>) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match origin.and_then(Path::parent) {
            Some(dir) => dir.join(path),
            None => self.base_dir.join(path),
        }
    }
}
