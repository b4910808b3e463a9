//! The import resolver.
//!
//! Before a document is walked, every `import type="xml"` in it is replaced
//! by the content of the document it names. Imported documents are resolved
//! the same way, depth first, and spliced child-first so that each import
//! receives an already complete subtree. The import node itself becomes an
//! `items` node that keeps only its `name`.
//!
//! The target comes from `target`, or from `xtarget` evaluated against the
//! import node. Relative targets resolve against the importing document's
//! directory, or the base directory when the importer has no path. Loaded
//! documents are cached by path and every splice gets a fresh copy.
//!
//! ## Edit rules
//!
//! `map` children rewrite the imported copy before it is spliced:
//!
//! ```xml
//! <import type="xml" target="header.xml" transform="values.xml">
//!   <map from="//item[@name='id']/value" type="text">42</map>
//!   <map from="//item[@name='who']/@bytes" type="external">width</map>
//!   <map from="//item[@name='ver']/value">/values/version</map>
//! </import>
//! ```
//!
//! `from` selects nodes in the imported document. The replacement is the
//! map text for `type="text"`, the external parameter it names for
//! `type="external"`, and otherwise the text evaluated against the document
//! named by the import's `transform` attribute.

use crate::error::{Error, Result};
use crate::expr::{Evaluator, NodeRef};
use crate::options::Options;
use crate::tree::{NodeId, Template, Tree};
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// Template-loading collaborator.
pub trait TemplateLoader {
    fn load(&self, path: &Path) -> Result<Template>;
}

impl<F> TemplateLoader for F
where
    F: Fn(&Path) -> Result<Template>,
{
    fn load(&self, path: &Path) -> Result<Template> {
        self(path)
    }
}

/// Loads templates from the file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileLoader;

impl TemplateLoader for FileLoader {
    fn load(&self, path: &Path) -> Result<Template> {
        Template::load(path)
    }
}

/// A document placed in the arena.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub root: NodeId,
    pub path: Option<PathBuf>,
}

pub struct Importer {
    loader: Rc<dyn TemplateLoader>,
    evaluator: Rc<dyn Evaluator>,
    options: Options,
    cache: IndexMap<PathBuf, Template>,
}

impl Importer {
    pub fn new(
        loader: Rc<dyn TemplateLoader>,
        evaluator: Rc<dyn Evaluator>,
        options: Options,
    ) -> Self {
        Importer {
            loader,
            evaluator,
            options,
            cache: IndexMap::new(),
        }
    }

    /// Number of distinct documents loaded so far.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn target(&self, tree: &Tree, node: NodeId) -> Result<String> {
        match (tree.attr(node, "target"), tree.attr(node, "xtarget")) {
            (Some(target), _) => Ok(target.to_string()),
            (None, Some(expr)) => self.evaluator.evaluate(tree, node.into(), expr),
            (None, None) => Err(Error::format(
                "import needs a target or xtarget attribute",
                Some(tree.describe(node)),
            )),
        }
    }

    /// Loads the document import `node` names and grafts a fresh copy of it
    /// into `tree` as a detached root.
    pub fn load(&mut self, tree: &mut Tree, node: NodeId, origin: Option<&Path>) -> Result<Document> {
        let target = self.target(tree, node)?;
        let path = self.options.resolve(&target, origin);
        let template = fetch(&mut self.cache, self.loader.as_ref(), &path)?;
        let root = tree.graft(&template.tree, template.root, None);
        Ok(Document {
            root,
            path: Some(path),
        })
    }

    /// Applies the `map` rules of import `node` to the document rooted at
    /// `target`.
    pub fn edit(
        &mut self,
        tree: &mut Tree,
        node: NodeId,
        target: NodeId,
        origin: Option<&Path>,
    ) -> Result<()> {
        let transform = tree.attr(node, "transform").map(str::to_string);
        for map in tree.children(node).to_vec() {
            if tree.name(map) != "map" {
                continue;
            }
            let context = || Some(tree.describe(map));
            let from = tree
                .attr(map, "from")
                .ok_or_else(|| Error::format("map needs a from attribute", context()))?
                .to_string();
            let text = tree.string_value(map);
            let replacement = match tree.attr(map, "type") {
                Some("text") => text,
                Some("external") => self.options.external(&text).to_string(),
                _ => {
                    let name = transform.as_deref().ok_or_else(|| {
                        Error::format(
                            "an expression map needs a transform attribute on its import",
                            context(),
                        )
                    })?;
                    let path = self.options.resolve(name, origin);
                    let values = fetch(&mut self.cache, self.loader.as_ref(), &path)?;
                    self.evaluator
                        .evaluate(&values.tree, NodeRef::Document(values.root), &text)?
                }
            };

            let selected = self
                .evaluator
                .select_nodes(tree, NodeRef::Document(target), &from)?;
            for selection in selected {
                match selection {
                    NodeRef::Element(id) => tree.set_value(id, &replacement),
                    NodeRef::Attribute(id, name) => tree.set_attr(id, &name, &replacement),
                    NodeRef::Text(id) => tree.set_text(id, &replacement),
                    NodeRef::Document(_) => {
                        return Err(Error::format(
                            format!("map from {:?} selects a document node", from),
                            Some(tree.describe(map)),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Inlines every `import type="xml"` in the document at `root`.
    pub fn resolve(&mut self, tree: &mut Tree, root: NodeId, path: Option<&Path>) -> Result<()> {
        let mut pending = vec![(root, path.map(Path::to_path_buf), Vec::<PathBuf>::new())];
        let mut splices = Vec::new();

        while let Some((doc, doc_path, chain)) = pending.pop() {
            let imports: Vec<NodeId> = std::iter::once(doc)
                .chain(tree.descendants(doc))
                .filter(|&n| tree.name(n) == "import" && tree.attr(n, "type") == Some("xml"))
                .collect();
            let mut chain = chain;
            chain.extend(doc_path.clone());
            for node in imports {
                let loaded = self.load(tree, node, doc_path.as_deref())?;
                if let Some(loaded_path) = &loaded.path {
                    if chain.contains(loaded_path) {
                        return Err(Error::format(
                            format!("circular import of {}", loaded_path.display()),
                            Some(tree.describe(node)),
                        ));
                    }
                }
                splices.push((node, loaded.root, doc_path.clone()));
                pending.push((loaded.root, loaded.path, chain.clone()));
            }
        }

        while let Some((node, loaded, origin)) = splices.pop() {
            self.edit(tree, node, loaded, origin.as_deref())?;
            splice(tree, node, loaded);
        }
        Ok(())
    }
}

fn fetch<'c>(
    cache: &'c mut IndexMap<PathBuf, Template>,
    loader: &dyn TemplateLoader,
    path: &Path,
) -> Result<&'c Template> {
    match cache.entry(path.to_path_buf()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            debug!(path = %path.display(), "loading template");
            Ok(entry.insert(loader.load(path)?))
        }
    }
}

/// Turns import `node` into an `items` node holding the children of `loaded`.
fn splice(tree: &mut Tree, node: NodeId, loaded: NodeId) {
    for rule in tree.children(node).to_vec() {
        tree.release(rule);
    }
    tree.set_text(node, "");
    tree.retain_attrs(node, &["name"]);
    for child in tree.children(loaded).to_vec() {
        tree.append_child(node, child);
    }
    tree.release(loaded);
    tree.rename(node, "items");
    debug!(import = %tree.describe(node), "spliced import");
}
