//! Arena-backed template trees.
//!
//! Template documents are parsed into a [`Tree`]: a flat arena of [`Node`]s
//! addressed by stable [`NodeId`]s. Detaching a node only unlinks it and keeps
//! its id valid. [`Tree::release`] hands a detached subtree's slots back to
//! the arena, and later clones and grafts reuse them, so a walk that keeps
//! loading or unrolling documents stays bounded by what is live.
//!
//! Values the engine computes while walking (`result`, `result-bytes`,
//! `seq`, `repeat-id`) live in a per-node [`NodeState`] side-table rather than
//! in the declared attributes. [`Tree::attribute`] reads both, computed first,
//! so expressions such as `../item[@name='body']/@result-bytes` see them.
//!
//! ## Examples
//!
//! ```rust
//! use binform::tree::{Tag, Template};
//!
//! let template = Template::parse("<format><item name='a' bytes='2'/></format>").unwrap();
//! let tree = &template.tree;
//! let item = tree.first_child(template.root).unwrap();
//! assert_eq!(Tag::of(tree, item).unwrap(), Tag::Item);
//! assert_eq!(tree.attr(item, "bytes"), Some("2"));
//! ```

use crate::codec::decode_text;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Stable index of a node within one [`Tree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Values computed for a node during a walk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeState {
    /// Resolved string value of the last write.
    pub result: Option<String>,
    /// Byte length recorded by the last write.
    pub result_bytes: Option<i64>,
    /// Iteration index of a repeat anchor or its clone.
    pub seq: Option<usize>,
    /// Groups every physical copy of one logical loop body.
    pub repeat_id: Option<usize>,
}

impl NodeState {
    fn get(&self, name: &str) -> Option<String> {
        match name {
            "result" => self.result.clone(),
            "result-bytes" => self.result_bytes.map(|n| n.to_string()),
            "seq" => self.seq.map(|n| n.to_string()),
            "repeat-id" => self.repeat_id.map(|n| n.to_string()),
            _ => None,
        }
    }

    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            ("result", self.result.is_some()),
            ("result-bytes", self.result_bytes.is_some()),
            ("seq", self.seq.is_some()),
            ("repeat-id", self.repeat_id.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
    }
}

/// One element of a template document.
#[derive(Clone, Debug, Default)]
pub struct Node {
    pub name: String,
    pub attrs: IndexMap<String, String>,
    pub text: String,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub state: NodeState,
}

/// The closed set of node kinds the walker understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Item,
    Items,
    Repeat,
    Import,
    Writer,
    Nop,
}

impl Tag {
    pub fn from_name(name: &str) -> Option<Tag> {
        match name {
            "item" => Some(Tag::Item),
            "items" => Some(Tag::Items),
            "repeat" => Some(Tag::Repeat),
            "import" => Some(Tag::Import),
            "writer" => Some(Tag::Writer),
            "nop" => Some(Tag::Nop),
            _ => None,
        }
    }

    /// Classifies `node`, failing with a format error for unknown tags.
    pub fn of(tree: &Tree, node: NodeId) -> Result<Tag> {
        let name = tree.name(node);
        Tag::from_name(name).ok_or_else(|| {
            Error::format(format!("unknown tag '{}'", name), Some(tree.describe(node)))
        })
    }
}

/// An arena holding one or more document trees.
#[derive(Clone, Debug, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

impl Tree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots in use; released slots are not counted.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever allocated, live or free.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Creates an element, appending it to `parent` if given.
    pub fn add_element(&mut self, parent: Option<NodeId>, name: &str) -> NodeId {
        let node = Node {
            name: name.to_string(),
            parent,
            ..Node::default()
        };
        self.push_node(node, parent)
    }

    /// Parses an XML document into the arena and returns its root element.
    pub fn parse(&mut self, xml: &str) -> Result<NodeId> {
        let mut reader = Reader::from_str(xml);
        let mut open: Vec<NodeId> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event().map_err(Error::xml)? {
                Event::Start(ref e) => {
                    let id = self.open_element(e, open.last().copied(), &mut root)?;
                    open.push(id);
                }
                Event::Empty(ref e) => {
                    self.open_element(e, open.last().copied(), &mut root)?;
                }
                Event::Text(ref e) => {
                    if let Some(&top) = open.last() {
                        let text = e.unescape().map_err(Error::xml)?;
                        self.nodes[top.0].text.push_str(&text);
                    }
                }
                Event::CData(e) => {
                    if let Some(&top) = open.last() {
                        let raw = e.into_inner();
                        self.nodes[top.0].text.push_str(&String::from_utf8_lossy(&raw));
                    }
                }
                Event::End(_) => {
                    if let Some(id) = open.pop() {
                        let node = &mut self.nodes[id.0];
                        if !node.children.is_empty() && node.text.trim().is_empty() {
                            node.text.clear();
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if let Some(&unclosed) = open.last() {
            return Err(Error::xml(format!(
                "element '{}' is never closed",
                self.name(unclosed)
            )));
        }

        root.ok_or_else(|| Error::xml("document has no root element"))
    }

    fn open_element(
        &mut self,
        e: &BytesStart<'_>,
        parent: Option<NodeId>,
        root: &mut Option<NodeId>,
    ) -> Result<NodeId> {
        if parent.is_none() && root.is_some() {
            return Err(Error::xml("document has more than one root element"));
        }
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let id = self.add_element(parent, &name);
        for attr in e.attributes() {
            let attr = attr.map_err(Error::xml)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            let value = attr.unescape_value().map_err(Error::xml)?;
            self.nodes[id.0].attrs.insert(key, value.into_owned());
        }
        if parent.is_none() {
            *root = Some(id);
        }
        Ok(id)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn rename(&mut self, id: NodeId, name: &str) {
        self.nodes[id.0].name = name.to_string();
    }

    pub fn text(&self, id: NodeId) -> &str {
        &self.nodes[id.0].text
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].children.first().copied()
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        !self.nodes[id.0].children.is_empty()
    }

    /// First child element named `name`.
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id).iter().copied().find(|&c| self.name(c) == name)
    }

    fn position(&self, id: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.parent(id)?;
        let index = self.children(parent).iter().position(|&c| c == id)?;
        Some((parent, index))
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let (parent, index) = self.position(id)?;
        self.children(parent).get(index + 1).copied()
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let (parent, index) = self.position(id)?;
        index
            .checked_sub(1)
            .and_then(|i| self.children(parent).get(i).copied())
    }

    /// Topmost ancestor of `id` (itself if detached).
    pub fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.parent(id) {
            id = parent;
        }
        id
    }

    /// Every element below `id` in document order, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev());
        }
        out
    }

    /// Declared attribute only.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id.0].attrs.get(name).map(String::as_str)
    }

    /// Computed attribute if set, else the declared one.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<Cow<'_, str>> {
        match self.nodes[id.0].state.get(name) {
            Some(computed) => Some(Cow::Owned(computed)),
            None => self.attr(id, name).map(Cow::Borrowed),
        }
    }

    /// Names of every attribute visible through [`Tree::attribute`].
    pub fn attribute_names(&self, id: NodeId) -> Vec<String> {
        let node = &self.nodes[id.0];
        let mut names: Vec<String> = node.state.names().map(str::to_string).collect();
        for key in node.attrs.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
        names
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        self.nodes[id.0]
            .attrs
            .insert(name.to_string(), value.to_string());
    }

    pub fn retain_attrs(&mut self, id: NodeId, keep: &[&str]) {
        self.nodes[id.0]
            .attrs
            .retain(|key, _| keep.contains(&key.as_str()));
    }

    pub fn state(&self, id: NodeId) -> &NodeState {
        &self.nodes[id.0].state
    }

    pub fn state_mut(&mut self, id: NodeId) -> &mut NodeState {
        &mut self.nodes[id.0].state
    }

    /// Sets only the node's own text.
    pub fn set_text(&mut self, id: NodeId, text: &str) {
        self.nodes[id.0].text = text.to_string();
    }

    /// Replaces the node's whole content with `text`, dropping child elements.
    pub fn set_value(&mut self, id: NodeId, text: &str) {
        for child in std::mem::take(&mut self.nodes[id.0].children) {
            self.nodes[child.0].parent = None;
        }
        self.set_text(id, text);
    }

    /// Concatenated text of `id` and its descendants.
    pub fn string_value(&self, id: NodeId) -> String {
        let mut out = self.text(id).to_string();
        for child in self.descendants(id) {
            out.push_str(self.text(child));
        }
        out
    }

    /// Unlinks `id` from its parent.
    pub fn detach(&mut self, id: NodeId) {
        if let Some((parent, index)) = self.position(id) {
            self.nodes[parent.0].children.remove(index);
        }
        self.nodes[id.0].parent = None;
    }

    /// Detaches `id` and frees it with all its descendants.
    ///
    /// Ids of released nodes must not be used again; their slots are handed
    /// out to the next nodes created in this arena.
    pub fn release(&mut self, id: NodeId) {
        self.detach(id);
        let mut released = self.descendants(id);
        released.push(id);
        for id in released {
            self.nodes[id.0] = Node::default();
            self.free.push(id);
        }
    }

    pub fn insert_after(&mut self, anchor: NodeId, node: NodeId) -> Result<()> {
        let (parent, index) = self
            .position(anchor)
            .ok_or_else(|| Error::custom("cannot insert a sibling next to a root node"))?;
        self.detach(node);
        self.nodes[parent.0].children.insert(index + 1, node);
        self.nodes[node.0].parent = Some(parent);
        Ok(())
    }

    pub fn append_child(&mut self, parent: NodeId, node: NodeId) {
        self.detach(node);
        self.nodes[parent.0].children.push(node);
        self.nodes[node.0].parent = Some(parent);
    }

    pub fn prepend_child(&mut self, parent: NodeId, node: NodeId) {
        self.detach(node);
        self.nodes[parent.0].children.insert(0, node);
        self.nodes[node.0].parent = Some(parent);
    }

    /// Detached deep copy of `id`, state included.
    pub fn deep_clone(&mut self, id: NodeId) -> NodeId {
        let copy = self.copy_node(id, None);
        let mut pending = vec![(id, copy)];
        while let Some((src, dst)) = pending.pop() {
            for child in self.children(src).to_vec() {
                let child_copy = self.copy_node(child, Some(dst));
                pending.push((child, child_copy));
            }
        }
        copy
    }

    fn copy_node(&mut self, src: NodeId, parent: Option<NodeId>) -> NodeId {
        let source = &self.nodes[src.0];
        let node = Node {
            name: source.name.clone(),
            attrs: source.attrs.clone(),
            text: source.text.clone(),
            children: Vec::new(),
            parent,
            state: source.state.clone(),
        };
        self.push_node(node, parent)
    }

    fn push_node(&mut self, node: Node, parent: Option<NodeId>) -> NodeId {
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        };
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    /// Deep-copies `src_node` of another arena into this one under `parent`.
    pub fn graft(&mut self, src: &Tree, src_node: NodeId, parent: Option<NodeId>) -> NodeId {
        let copy_from = |tree: &mut Tree, from: NodeId, parent: Option<NodeId>| {
            let source = src.node(from);
            let node = Node {
                name: source.name.clone(),
                attrs: source.attrs.clone(),
                text: source.text.clone(),
                children: Vec::new(),
                parent,
                state: source.state.clone(),
            };
            tree.push_node(node, parent)
        };
        let root = copy_from(self, src_node, parent);
        let mut pending = vec![(src_node, root)];
        while let Some((from, to)) = pending.pop() {
            for &child in src.children(from) {
                let copied = copy_from(self, child, Some(to));
                pending.push((child, copied));
            }
        }
        root
    }

    /// Extends a record key path with `id`'s `name`, if it has one.
    pub fn key_path(&self, key: &str, id: NodeId) -> String {
        match (key, self.attr(id, "name").unwrap_or("")) {
            (key, "") => key.to_string(),
            ("", name) => name.to_string(),
            (key, name) => format!("{}/{}", key, name),
        }
    }

    /// Abbreviated location of `id`, e.g. `/format/repeat[@name='rows']`.
    pub fn describe(&self, id: NodeId) -> String {
        let mut chain = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.parent(cursor) {
            chain.push(parent);
            cursor = parent;
        }
        let mut out = String::new();
        for &node in chain.iter().rev() {
            out.push('/');
            out.push_str(self.name(node));
            if let Some(name) = self.attr(node, "name") {
                let _ = write!(out, "[@name='{}']", name);
            }
        }
        out
    }
}

/// A parsed template document together with where it came from.
#[derive(Clone, Debug)]
pub struct Template {
    pub tree: Tree,
    pub root: NodeId,
    pub path: Option<PathBuf>,
}

impl Template {
    /// Parses a template from XML text.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut tree = Tree::new();
        let root = tree.parse(xml)?;
        Ok(Template {
            tree,
            root,
            path: None,
        })
    }

    /// Reads and parses a template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::input_data(format!("cannot read template {}: {}", path.display(), e), None)
        })?;
        let mut template = Template::parse(&decode_text(&bytes))
            .map_err(|e| Error::xml(format!("{}: {}", path.display(), e)))?;
        template.path = Some(path.to_path_buf());
        Ok(template)
    }
}
