//! String transformers applied by `transform` children of an item.
//!
//! An item's `<transform>name</transform>` child names a transformer in a
//! [`TransformerRegistry`]. [`TransformerCache`] is the file-backed registry:
//! the name is a path to a transformer document, loaded once per run.
//!
//! The only document type is the character map (`type="chara-map"`):
//!
//! ```xml
//! <transform type="chara-map">
//!   <map from="ｱ" to="ア"/>
//!   <map from="ｶﾞ" to="ガ"/>
//!   <map from-regex="([0-9])" to="{1}"/>
//!   <map from="©" to-file="copyright.txt"/>
//! </transform>
//! ```
//!
//! At each input position the longest `from` literal wins; otherwise the
//! `from-regex` rules are tried in document order, anchored at that position.
//! `{n}` in `to` (or in a `to-file` path) is replaced by capture group `n`.
//! An input position no rule covers is a [`Error::Transform`].

use crate::codec::decode_text;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::tree::{NodeId, Template, Tree};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// Transformer collaborator.
pub trait Transformer {
    fn transform(&self, input: &str) -> Result<String>;
}

impl<F> Transformer for F
where
    F: Fn(&str) -> Result<String>,
{
    fn transform(&self, input: &str) -> Result<String> {
        self(input)
    }
}

/// Looks transformers up by the text of a `transform` node.
pub trait TransformerRegistry {
    fn get(&self, name: &str) -> Result<Rc<dyn Transformer>>;
}

impl TransformerRegistry for IndexMap<String, Rc<dyn Transformer>> {
    fn get(&self, name: &str) -> Result<Rc<dyn Transformer>> {
        IndexMap::get(self, name)
            .cloned()
            .ok_or_else(|| Error::input_data(format!("no transformer named '{}'", name), None))
    }
}

/// File-backed registry; each document is loaded once per path.
pub struct TransformerCache {
    options: Options,
    loaded: RefCell<IndexMap<PathBuf, Rc<dyn Transformer>>>,
}

impl TransformerCache {
    #[must_use]
    pub fn new(options: Options) -> Self {
        TransformerCache {
            options,
            loaded: RefCell::new(IndexMap::new()),
        }
    }

    fn load(&self, path: &Path) -> Result<Rc<dyn Transformer>> {
        let template = Template::load(path)?;
        let kind = template.tree.attr(template.root, "type").unwrap_or("");
        match kind {
            "chara-map" => {
                let base = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.options.base_dir.clone());
                let reader = move |file: &str| read_text(&base.join(file));
                let transformer =
                    CharaTransformer::new(&template.tree, template.root, Box::new(reader))?;
                Ok(Rc::new(transformer))
            }
            other => Err(Error::input_data(
                format!("no transformer of type '{}'", other),
                Some(path.display().to_string()),
            )),
        }
    }
}

impl TransformerRegistry for TransformerCache {
    fn get(&self, name: &str) -> Result<Rc<dyn Transformer>> {
        let path = self.options.resolve(name, None);
        if let Some(found) = self.loaded.borrow().get(&path) {
            return Ok(Rc::clone(found));
        }
        debug!(path = %path.display(), "loading transformer");
        let transformer = self.load(&path)?;
        self.loaded
            .borrow_mut()
            .insert(path, Rc::clone(&transformer));
        Ok(transformer)
    }
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::input_data(format!("cannot read {}: {}", path.display(), e), None)
    })?;
    Ok(decode_text(&bytes).into_owned())
}

#[derive(Clone, Debug)]
enum Target {
    Text(String),
    File(String),
}

/// Longest-match plus regex character mapper.
pub struct CharaTransformer {
    /// Literal rules grouped by `from` length in chars, longest first.
    literals: Vec<(usize, HashMap<String, Target>)>,
    patterns: Vec<(Regex, Target)>,
    read_file: Box<dyn Fn(&str) -> Result<String>>,
    files: RefCell<HashMap<String, String>>,
}

impl CharaTransformer {
    /// Builds a mapper from the `map` children of `root`.
    pub fn new(
        tree: &Tree,
        root: NodeId,
        read_file: Box<dyn Fn(&str) -> Result<String>>,
    ) -> Result<Self> {
        let mut by_length: IndexMap<usize, HashMap<String, Target>> = IndexMap::new();
        let mut patterns = Vec::new();

        for &map in tree.children(root) {
            if tree.name(map) != "map" {
                continue;
            }
            let context = || Some(tree.describe(map));
            let target = match (tree.attr(map, "to"), tree.attr(map, "to-file")) {
                (Some(to), _) => Target::Text(to.to_string()),
                (None, Some(file)) => Target::File(file.to_string()),
                (None, None) => {
                    return Err(Error::format("map needs a 'to' or 'to-file'", context()))
                }
            };
            match (tree.attr(map, "from"), tree.attr(map, "from-regex")) {
                (Some(from), _) => {
                    by_length
                        .entry(from.chars().count())
                        .or_default()
                        .insert(from.to_string(), target);
                }
                (None, Some(pattern)) => {
                    let regex = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
                        Error::format(format!("bad from-regex: {}", e), context())
                    })?;
                    patterns.push((regex, target));
                }
                (None, None) => {
                    return Err(Error::format(
                        "map needs a 'from' or 'from-regex'",
                        context(),
                    ))
                }
            }
        }

        let mut literals: Vec<_> = by_length.into_iter().collect();
        literals.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(CharaTransformer {
            literals,
            patterns,
            read_file,
            files: RefCell::new(HashMap::new()),
        })
    }

    fn resolve(&self, target: &Target, captures: Option<&Captures<'_>>) -> Result<String> {
        match target {
            Target::Text(text) => Ok(substitute(text, captures)),
            Target::File(path) => {
                let path = substitute(path, captures);
                if let Some(text) = self.files.borrow().get(&path) {
                    return Ok(text.clone());
                }
                let text = (self.read_file)(&path)?;
                self.files.borrow_mut().insert(path, text.clone());
                Ok(text)
            }
        }
    }

    fn step(&self, rest: &str) -> Result<Option<(usize, String)>> {
        for (length, rules) in &self.literals {
            let end = match rest.char_indices().nth(*length) {
                Some((end, _)) => end,
                None if rest.chars().count() == *length => rest.len(),
                None => continue,
            };
            if let Some(target) = rules.get(&rest[..end]) {
                return Ok(Some((end, self.resolve(target, None)?)));
            }
        }
        for (regex, target) in &self.patterns {
            if let Some(captures) = regex.captures(rest) {
                let matched = captures.get(0).map_or(0, |m| m.end());
                if matched > 0 {
                    return Ok(Some((matched, self.resolve(target, Some(&captures))?)));
                }
            }
        }
        Ok(None)
    }
}

impl Transformer for CharaTransformer {
    fn transform(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut pos = 0;
        while pos < input.len() {
            match self.step(&input[pos..])? {
                Some((consumed, piece)) => {
                    out.push_str(&piece);
                    pos += consumed;
                }
                None => {
                    let position = input[..pos].chars().count();
                    return Err(Error::transform("no rule matches", position, input));
                }
            }
        }
        Ok(out)
    }
}

/// Expands `{n}` with capture group `n`; `{{` and `}}` are literal braces.
fn substitute(template: &str, captures: Option<&Captures<'_>>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                if !digits.is_empty() && chars.peek() == Some(&'}') {
                    chars.next();
                    let group = digits
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| captures.and_then(|c| c.get(n)));
                    out.push_str(group.map_or("", |m| m.as_str()));
                } else {
                    out.push('{');
                    out.push_str(&digits);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chara(xml: &str) -> CharaTransformer {
        let template = Template::parse(xml).unwrap();
        let reader = |path: &str| -> Result<String> {
            Ok(path.trim_end_matches(".txt").to_string())
        };
        CharaTransformer::new(&template.tree, template.root, Box::new(reader)).unwrap()
    }

    #[test]
    fn test_literal_map() {
        let t = chara(
            r#"<transform type="chara-map">
                <map from="あ" to="か"/><map from="い" to="き"/><map from="う" to="く"/>
            </transform>"#,
        );
        assert_eq!(t.transform("あいう").unwrap(), "かきく");
        assert_eq!(t.transform("").unwrap(), "");
    }

    #[test]
    fn test_longest_match_wins() {
        let t = chara(
            r#"<transform>
                <map from="あああ" to="か"/><map from="あ" to="き"/><map from="ああ" to="く"/>
            </transform>"#,
        );
        assert_eq!(t.transform("あああああ").unwrap(), "かく");
    }

    #[test]
    fn test_regex_groups() {
        let t = chara(r#"<transform><map from-regex=".(.)" to="{1}"/></transform>"#);
        assert_eq!(t.transform("あかいきうくえけおこ").unwrap(), "かきくけこ");
    }

    #[test]
    fn test_files_are_read_once() {
        let template =
            Template::parse(r#"<transform><map from="a" to-file="x.txt"/></transform>"#).unwrap();
        let reads = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&reads);
        let reader = move |_: &str| -> Result<String> {
            *counter.borrow_mut() += 1;
            Ok("X".to_string())
        };
        let t = CharaTransformer::new(&template.tree, template.root, Box::new(reader)).unwrap();
        assert_eq!(t.transform("aaaaa").unwrap(), "XXXXX");
        assert_eq!(*reads.borrow(), 1);
    }

    #[test]
    fn test_regex_file_target() {
        let t = chara(r#"<transform><map from-regex=".(.)" to-file="{1}.txt"/></transform>"#);
        assert_eq!(t.transform("abcd").unwrap(), "bd");
    }

    #[test]
    fn test_unmatched_position() {
        let t = chara(r#"<transform><map from="a" to="b"/></transform>"#);
        match t.transform("aaxa") {
            Err(Error::Transform { position, .. }) => assert_eq!(position, 2),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_rules() {
        let template = Template::parse(r#"<transform><map from="a"/></transform>"#).unwrap();
        let reader = |_: &str| -> Result<String> { Ok(String::new()) };
        assert!(CharaTransformer::new(&template.tree, template.root, Box::new(reader)).is_err());
    }

    #[test]
    fn test_substitute_braces() {
        assert_eq!(substitute("{{0}}-{x}", None), "{0}-{x}");
    }

    #[test]
    fn test_closure_registry() {
        let mut registry: IndexMap<String, Rc<dyn Transformer>> = IndexMap::new();
        let upper = |s: &str| -> Result<String> { Ok(s.to_uppercase()) };
        registry.insert("upper".to_string(), Rc::new(upper));
        let found = TransformerRegistry::get(&registry, "upper").unwrap();
        assert_eq!(found.transform("ab").unwrap(), "AB");
        assert!(TransformerRegistry::get(&registry, "lower").is_err());
    }
}
