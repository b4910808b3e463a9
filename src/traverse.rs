//! The traversal engine.
//!
//! [`Traverser::traverse`] returns a [`Traversal`]: a lazy, single-pass
//! iterator that walks a template depth first and yields every output sink
//! once it is complete. Pulling from the iterator drives all side effects
//! (record reads, counter increments, byte writes), and the walk suspends
//! only where a `writer` node rotates the sink.
//!
//! The walk uses explicit stacks instead of recursion. Each document being
//! walked is a frame with a scan stack of `(key path, node)` positions and a
//! stack of active [`Repeat`] controllers. Popping a position processes that
//! node and its following siblings until one of them schedules new work; the
//! abandoned siblings stay reachable because whatever was scheduled resumes
//! at them when it is done.
//!
//! | node | effect |
//! |---|---|
//! | `item` | stores the record value under its key path in the `value` child, then writes it |
//! | `items` | descends into its children, resuming at its next sibling (or an inserted `nop`) |
//! | `repeat` | starts a loop controller and descends into the body |
//! | `import` | walks a combined (`combined`) or freshly loaded (`dynamic`) document as a nested frame; `none` does nothing |
//! | `writer` | yields the current sink and opens the one its body names |
//! | `nop` | nothing; marks where a walk resumes |
//!
//! ```rust
//! use binform::record::TableSource;
//! use binform::sink::MemoryWriterFactory;
//! use binform::traverse::{Entry, Traverser};
//! use binform::tree::Template;
//! use binform::{Encoder, Options};
//! use std::rc::Rc;
//!
//! let template = Template::parse(
//!     "<format><writer type='memory'><item><default-value>out</default-value></item></writer>\
//!      <repeat name='row' fetch='true'><item name='id' bytes='2' lpadding='0'/></repeat></format>",
//! )
//! .unwrap();
//! let records = TableSource::new(["row/id"]).with_row(["7"]).with_row(["42"]);
//!
//! let factory = Rc::new(MemoryWriterFactory::new());
//! let traverser = Traverser::new(Rc::new(Encoder::new(Options::new())), factory.clone());
//! let sinks = traverser
//!     .traverse(None, Entry::new(template).with_records(records), Vec::new())
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(sinks.len(), 1);
//! assert_eq!(factory.bytes("out").unwrap(), b"0742");
//! ```

use crate::combined::{Combined, CombinedSources};
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::expr::Evaluator;
use crate::import::{FileLoader, Importer, TemplateLoader};
use crate::record::{BoxedSource, RecordSource};
use crate::repeat::{Feed, Repeat, Scan};
use crate::sink::{DataWriter, StringWriter, WriterFactory};
use crate::tree::{NodeId, Tag, Template, Tree};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

/// A template to walk together with its records.
pub struct Entry {
    template: Template,
    records: Option<BoxedSource>,
}

impl Entry {
    pub fn new(template: Template) -> Self {
        Entry {
            template,
            records: None,
        }
    }

    #[must_use]
    pub fn with_records(mut self, records: impl RecordSource + 'static) -> Self {
        self.records = Some(Box::new(records));
        self
    }

    #[must_use]
    pub fn with_boxed_records(mut self, records: BoxedSource) -> Self {
        self.records = Some(records);
        self
    }
}

/// Builds traversals that share one encoder, sink factory and loader.
pub struct Traverser {
    encoder: Rc<Encoder>,
    factory: Rc<dyn WriterFactory>,
    loader: Rc<dyn TemplateLoader>,
}

impl Traverser {
    pub fn new(encoder: Rc<Encoder>, factory: Rc<dyn WriterFactory>) -> Self {
        Traverser {
            encoder,
            factory,
            loader: Rc::new(FileLoader),
        }
    }

    #[must_use]
    pub fn with_loader(mut self, loader: impl TemplateLoader + 'static) -> Self {
        self.loader = Rc::new(loader);
        self
    }

    /// Starts a walk of `entry`, writing to `writer` until the first
    /// `writer` node, with `combined` as the combined sources.
    ///
    /// Nothing happens until the returned iterator is pulled.
    pub fn traverse(
        &self,
        writer: Option<Box<dyn DataWriter>>,
        entry: Entry,
        combined: Vec<Entry>,
    ) -> Traversal {
        let Template {
            mut tree,
            root,
            path,
        } = entry.template;
        let combined = combined
            .into_iter()
            .map(|entry| Combined {
                root: tree.graft(&entry.template.tree, entry.template.root, None),
                path: entry.template.path,
                reader: entry.records,
            })
            .collect();
        let evaluator = self.encoder.evaluator();
        Traversal {
            tree,
            importer: Importer::new(
                Rc::clone(&self.loader),
                Rc::clone(&evaluator),
                self.encoder.options().clone(),
            ),
            evaluator,
            encoder: Rc::clone(&self.encoder),
            factory: Rc::clone(&self.factory),
            main: entry.records,
            combined: CombinedSources::new(combined),
            no_combined: CombinedSources::default(),
            frames: Vec::new(),
            writer,
            rotation: None,
            depth: 0,
            next_repeat_id: 0,
            state: State::Start { root, path },
        }
    }
}

enum State {
    Start { root: NodeId, path: Option<PathBuf> },
    Running,
    Done,
}

/// Where a frame reads its records from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Entry,
    Combined(usize),
}

/// A position inside a sibling run.
struct Run {
    key: String,
    first: NodeId,
    next: Option<NodeId>,
    base: usize,
}

struct Frame {
    path: Option<PathBuf>,
    source: Source,
    sees_combined: bool,
    scan: Vec<Scan>,
    repeats: Vec<Repeat>,
    run: Option<Run>,
    /// Root of a per-visit document, released when the frame ends.
    owned: Option<NodeId>,
}

struct Nested {
    root: NodeId,
    path: Option<PathBuf>,
    source: Source,
    owned: bool,
}

enum Visit {
    Done,
    Yield(Box<dyn DataWriter>),
    Enter(Nested),
}

/// A walk in progress. See the [module documentation](self).
pub struct Traversal {
    tree: Tree,
    encoder: Rc<Encoder>,
    evaluator: Rc<dyn Evaluator>,
    factory: Rc<dyn WriterFactory>,
    importer: Importer,
    main: Option<BoxedSource>,
    combined: CombinedSources,
    no_combined: CombinedSources,
    frames: Vec<Frame>,
    writer: Option<Box<dyn DataWriter>>,
    rotation: Option<(usize, NodeId)>,
    depth: usize,
    next_repeat_id: usize,
    state: State,
}

impl Iterator for Traversal {
    type Item = Result<Box<dyn DataWriter>>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, State::Done) {
            return None;
        }
        match self.step() {
            Ok(Some(writer)) => Some(Ok(writer)),
            Ok(None) => {
                self.state = State::Done;
                None
            }
            Err(err) => {
                self.state = State::Done;
                Some(Err(err))
            }
        }
    }
}

impl Traversal {
    /// The working tree, with every node's computed results.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Current number of open sink nesting levels.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn step(&mut self) -> Result<Option<Box<dyn DataWriter>>> {
        if let State::Start { root, path } = std::mem::replace(&mut self.state, State::Running) {
            if let Some(reader) = self.main.as_mut() {
                reader.read_chunk()?;
            }
            self.enter(root, path, Source::Entry, true)?;
        }

        loop {
            if let Some((index, node)) = self.rotation.take() {
                self.open_writer(index, node)?;
            }
            let Some(index) = self.frames.len().checked_sub(1) else {
                return self.finish();
            };

            let frame = &mut self.frames[index];
            let run = match frame.run.take() {
                Some(run) => run,
                None => match frame.scan.pop() {
                    Some((key, node)) => Run {
                        key,
                        first: node,
                        next: Some(node),
                        base: frame.scan.len(),
                    },
                    None => {
                        self.leave()?;
                        continue;
                    }
                },
            };

            let Some(node) = run.next else {
                self.close_loops(index, run.first)?;
                continue;
            };

            let visit = self
                .dispatch(index, &run.key, node)
                .map_err(|e| e.with_context(|| self.tree.describe(node)))?;

            let frame = &mut self.frames[index];
            if frame.scan.len() == run.base {
                frame.run = Some(Run {
                    next: self.tree.next_sibling(node),
                    ..run
                });
            }

            match visit {
                Visit::Done => {}
                Visit::Yield(writer) => return Ok(Some(writer)),
                Visit::Enter(nested) => {
                    self.enter(nested.root, nested.path, nested.source, false)?;
                    if nested.owned {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.owned = Some(nested.root);
                        }
                    }
                }
            }
        }
    }

    /// Starts a frame walking the document at `root`.
    fn enter(
        &mut self,
        root: NodeId,
        path: Option<PathBuf>,
        source: Source,
        sees_combined: bool,
    ) -> Result<()> {
        self.importer
            .resolve(&mut self.tree, root, path.as_deref())?;
        for node in self.tree.descendants(root) {
            if self.tree.name(node) == "repeat" && self.tree.state(node).repeat_id.is_none() {
                self.tree.state_mut(node).repeat_id = Some(self.next_repeat_id);
                self.next_repeat_id += 1;
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.push();
        }
        self.depth += 1;

        let mut scan = Vec::new();
        if let Some(first) = self.tree.first_child(root) {
            scan.push((String::new(), first));
        }
        debug!(document = %self.tree.describe(root), depth = self.frames.len(), "entering document");
        self.frames.push(Frame {
            path,
            source,
            sees_combined,
            scan,
            repeats: Vec::new(),
            run: None,
            owned: None,
        });
        Ok(())
    }

    /// Ends the innermost frame.
    fn leave(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_chunk(&mut self.tree)?;
            writer.pop();
        }
        self.depth = self.depth.saturating_sub(1);
        if let Some(root) = self.frames.pop().and_then(|frame| frame.owned) {
            self.tree.release(root);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<Box<dyn DataWriter>>> {
        match self.writer.take() {
            Some(mut writer) => {
                writer.finish()?;
                debug!(sink = writer.name(), "walk complete");
                Ok(Some(writer))
            }
            None => Ok(None),
        }
    }

    fn dispatch(&mut self, index: usize, key: &str, node: NodeId) -> Result<Visit> {
        match Tag::of(&self.tree, node)? {
            Tag::Item => {
                let key = self.fill_item(index, key, node);
                if let Some(writer) = self.writer.as_mut() {
                    writer.set_data(&key, &mut self.tree, node)?;
                }
                Ok(Visit::Done)
            }
            Tag::Items => {
                descend(&mut self.tree, &mut self.frames[index].scan, key, node)?;
                Ok(Visit::Done)
            }
            Tag::Repeat => {
                self.start_repeat(index, key, node)?;
                Ok(Visit::Done)
            }
            Tag::Import => self.import(index, node),
            Tag::Writer => self.rotate(index, node),
            Tag::Nop => Ok(Visit::Done),
        }
    }

    fn reader(&self, source: Source) -> Option<&dyn RecordSource> {
        match source {
            Source::Entry => self.main.as_deref(),
            Source::Combined(index) => self.combined.get(index)?.reader.as_deref(),
        }
    }

    /// Stores the record value for `item` in its `value` child and returns
    /// the item's key path.
    fn fill_item(&mut self, index: usize, key: &str, item: NodeId) -> String {
        let frame = &self.frames[index];
        let key = self.tree.key_path(key, item);
        let combined = match self.tree.attr(item, "type") {
            Some("combined") if frame.sees_combined => {
                self.combined.get_data(&key, &self.tree, item)
            }
            _ => None,
        };
        let value = combined.unwrap_or_else(|| {
            self.reader(frame.source)
                .map(|reader| reader.get_data(&key, &self.tree, item))
                .unwrap_or_default()
        });
        match self.tree.child(item, "value") {
            Some(existing) => self.tree.set_value(existing, &value),
            None => {
                let created = self.tree.add_element(None, "value");
                self.tree.set_text(created, &value);
                self.tree.prepend_child(item, created);
            }
        }
        key
    }

    fn start_repeat(&mut self, index: usize, key: &str, node: NodeId) -> Result<()> {
        let frame = &mut self.frames[index];
        let visible = if frame.sees_combined {
            &self.combined
        } else {
            &self.no_combined
        };
        let mut repeat = Repeat::new(&mut self.tree, node, key, self.evaluator.as_ref(), visible)?;
        let feed = feed(
            &mut self.main,
            &mut self.combined,
            &mut self.no_combined,
            (frame.source, frame.sees_combined),
            repeat.feeds_on_combined(),
        );
        if repeat.next(&mut self.tree, &mut frame.scan, feed)? {
            frame.repeats.push(repeat);
        }
        Ok(())
    }

    /// Resolves loop ends after the sibling run starting at `first` completed.
    fn close_loops(&mut self, index: usize, first: NodeId) -> Result<()> {
        let mut target = first;
        while let Some(parent) = self.tree.parent(target) {
            if self.tree.name(parent) != "repeat" {
                break;
            }
            if self.tree.state(parent).seq == Some(0) {
                if let Some(writer) = self.writer.as_mut() {
                    writer.push();
                }
                self.depth += 1;
            } else if let Some(writer) = self.writer.as_mut() {
                writer.write_chunk(&mut self.tree)?;
            }

            let frame = &mut self.frames[index];
            let Some(repeat) = frame.repeats.last_mut() else {
                return Err(Error::custom(format!(
                    "loop body {} ended without an active repeat",
                    self.tree.describe(parent)
                )));
            };
            let feed = feed(
                &mut self.main,
                &mut self.combined,
                &mut self.no_combined,
                (frame.source, frame.sees_combined),
                repeat.feeds_on_combined(),
            );
            if repeat.next(&mut self.tree, &mut frame.scan, feed)? {
                break;
            }
            frame.repeats.pop();
            if let Some(writer) = self.writer.as_mut() {
                writer.pop();
            }
            self.depth = self.depth.saturating_sub(1);

            let cascade = !frame.repeats.is_empty()
                && self.tree.next_sibling(parent).is_none()
                && self
                    .tree
                    .parent(parent)
                    .is_some_and(|grandparent| self.tree.name(grandparent) == "repeat");
            if !cascade {
                break;
            }
            target = parent;
        }
        Ok(())
    }

    fn import(&mut self, index: usize, node: NodeId) -> Result<Visit> {
        let frame = &self.frames[index];
        let origin = frame.path.clone();
        let kind = self.tree.attr(node, "type").map(str::to_string);
        match kind.as_deref() {
            Some("combined") => {
                let current = match frame.sees_combined {
                    true => self.combined.current_index(),
                    false => None,
                };
                let (current, root, path) = match current.and_then(|i| Some((i, self.combined.get(i)?))) {
                    Some((i, combined)) => (i, combined.root, combined.path.clone()),
                    None => {
                        return Err(Error::format(
                            "combined import outside any combined document",
                            Some(self.tree.describe(node)),
                        ))
                    }
                };
                self.importer
                    .edit(&mut self.tree, node, root, origin.as_deref())?;
                Ok(Visit::Enter(Nested {
                    root,
                    path,
                    source: Source::Combined(current),
                    owned: false,
                }))
            }
            Some("dynamic") => {
                let source = frame.source;
                let document = self
                    .importer
                    .load(&mut self.tree, node, origin.as_deref())?;
                self.importer
                    .edit(&mut self.tree, node, document.root, origin.as_deref())?;
                Ok(Visit::Enter(Nested {
                    root: document.root,
                    path: document.path,
                    source,
                    owned: true,
                }))
            }
            Some("none") => Ok(Visit::Done),
            other => Err(Error::format(
                format!("unknown import type {:?}", other.unwrap_or("")),
                Some(self.tree.describe(node)),
            )),
        }
    }

    fn rotate(&mut self, index: usize, node: NodeId) -> Result<Visit> {
        match self.writer.take() {
            Some(mut previous) => {
                while previous.depth() > 0 {
                    previous.write_chunk(&mut self.tree)?;
                    previous.pop();
                }
                previous.finish()?;
                debug!(sink = previous.name(), "sink complete");
                self.rotation = Some((index, node));
                Ok(Visit::Yield(previous))
            }
            None => {
                self.open_writer(index, node)?;
                Ok(Visit::Done)
            }
        }
    }

    fn open_writer(&mut self, index: usize, node: NodeId) -> Result<()> {
        let kind = self.tree.attr(node, "type").unwrap_or("").to_string();
        let name = self.render(index, node)?;
        let mut writer = self
            .factory
            .create(&kind, &name, Rc::clone(&self.encoder))
            .map_err(|e| e.with_context(|| self.tree.describe(node)))?;
        for _ in 0..self.depth {
            writer.push();
        }
        debug!(kind = %kind, name = %name, depth = self.depth, "opened sink");
        self.writer = Some(writer);
        Ok(())
    }

    /// Walks the body of writer `node` into a string.
    fn render(&mut self, index: usize, node: NodeId) -> Result<String> {
        let mut sink = StringWriter::new(Rc::clone(&self.encoder));
        let mut scan: Vec<Scan> = Vec::new();
        if let Some(first) = self.tree.first_child(node) {
            let key = self.tree.attr(node, "key").unwrap_or("").to_string();
            scan.push((key, first));
        }
        while let Some((key, start)) = scan.pop() {
            let base = scan.len();
            let mut cursor = Some(start);
            while let Some(sibling) = cursor {
                match Tag::of(&self.tree, sibling)? {
                    Tag::Item => {
                        let key = self.fill_item(index, &key, sibling);
                        sink.set_data(&key, &mut self.tree, sibling)?;
                    }
                    Tag::Items => descend(&mut self.tree, &mut scan, &key, sibling)?,
                    Tag::Nop => {}
                    Tag::Repeat | Tag::Import | Tag::Writer => {
                        return Err(Error::format(
                            format!("'{}' is not allowed inside a writer", self.tree.name(sibling)),
                            Some(self.tree.describe(sibling)),
                        ))
                    }
                }
                if scan.len() != base {
                    break;
                }
                cursor = self.tree.next_sibling(sibling);
            }
        }
        sink.write_chunk(&mut self.tree)?;
        sink.contents()
    }
}

/// Schedules the children of `items`, with its next sibling (or a new `nop`
/// marker) as the resumption point.
fn descend(tree: &mut Tree, scan: &mut Vec<Scan>, key: &str, items: NodeId) -> Result<()> {
    let Some(first) = tree.first_child(items) else {
        return Ok(());
    };
    match tree.next_sibling(items) {
        Some(next) => scan.push((key.to_string(), next)),
        None if tree.parent(items).is_some() => {
            let nop = tree.add_element(None, "nop");
            tree.insert_after(items, nop)?;
            scan.push((key.to_string(), nop));
        }
        None => {}
    }
    scan.push((tree.key_path(key, items), first));
    Ok(())
}

fn feed<'a>(
    main: &'a mut Option<BoxedSource>,
    combined: &'a mut CombinedSources,
    no_combined: &'a mut CombinedSources,
    (source, sees_combined): (Source, bool),
    on_combined: bool,
) -> Feed<'a> {
    if on_combined {
        return Feed::Combined(match sees_combined {
            true => combined,
            false => no_combined,
        });
    }
    Feed::Records(match source {
        Source::Entry => main.as_mut(),
        Source::Combined(index) => combined.reader_mut(index),
    })
}
