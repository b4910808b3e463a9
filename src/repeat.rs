//! The repeat controller.
//!
//! One [`Repeat`] exists per active `repeat` node. It decides whether the
//! loop body runs again and schedules the walker's next position on the scan
//! stack: the body's first child while looping, the anchor's next sibling
//! once the loop is over.
//!
//! Three termination strategies share the loop-entry and loop-exit protocol:
//!
//! | `type` | strategy | `fetch` default |
//! |---|---|---|
//! | (none) | fixed count; needs `max`/`xmax` or `fetch="true"` | `false` |
//! | `combined-xml` | one iteration per combined document | `true` |
//! | `combined-record` | one iteration per record of the current combined document | `true` |
//!
//! With `unrolling="true"` every iteration after the first runs on a fresh
//! clone of the body inserted after the previous one, so each iteration keeps
//! its own computed results. Clones share the anchor's `repeat-id`; entering
//! the loop again removes the clones left over from an earlier walk.

use crate::combined::CombinedSources;
use crate::error::{Error, Result};
use crate::expr::Evaluator;
use crate::record::BoxedSource;
use crate::tree::{NodeId, Tree};
use tracing::debug;

/// A pending walk position: record key path and the node to resume at.
pub type Scan = (String, NodeId);

/// Strategy-specific state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatKind {
    /// Fixed count. `stacked` is set once the record context has been saved.
    Count { stacked: bool },
    /// Combined-document exhaustion; remembers the last cursor position.
    CombinedDocument { prev: Option<usize> },
    /// Combined-record exhaustion; remembers the last record identity.
    CombinedRecord { prev: Option<i64> },
}

/// What a controller advances on.
pub enum Feed<'a> {
    /// The record source of the walking document.
    Records(Option<&'a mut BoxedSource>),
    /// The combined sources visible to the walking document.
    Combined(&'a mut CombinedSources),
}

#[derive(Debug)]
pub struct Repeat {
    kind: RepeatKind,
    count: usize,
    max: Option<usize>,
    fetch: bool,
    unrolling: bool,
    key: String,
    body_key: String,
    anchor: NodeId,
}

impl Repeat {
    /// Sets up a controller for the `repeat` node `anchor`, reached under
    /// record key path `key`.
    pub fn new(
        tree: &mut Tree,
        anchor: NodeId,
        key: &str,
        evaluator: &dyn Evaluator,
        combined: &CombinedSources,
    ) -> Result<Self> {
        let context = |tree: &Tree| Some(tree.describe(anchor));
        let kind = match tree.attr(anchor, "type") {
            None | Some("") => RepeatKind::Count { stacked: false },
            Some("combined-xml") => RepeatKind::CombinedDocument {
                prev: combined.position(),
            },
            Some("combined-record") => RepeatKind::CombinedRecord { prev: None },
            Some(other) => {
                return Err(Error::format(
                    format!("unknown repeat type '{}'", other),
                    context(tree),
                ))
            }
        };
        let default_fetch = !matches!(kind, RepeatKind::Count { .. });
        let fetch = flag(tree, anchor, "fetch")?.unwrap_or(default_fetch);
        let unrolling = flag(tree, anchor, "unrolling")?.unwrap_or(false);

        let max_text = match (tree.attr(anchor, "max"), tree.attr(anchor, "xmax")) {
            (Some(max), _) => Some(max.to_string()),
            (None, Some(expr)) => Some(evaluator.evaluate(tree, anchor.into(), expr)?),
            (None, None) => None,
        };
        let max = match max_text {
            Some(text) => {
                let value: i64 = text.trim().parse().map_err(|_| {
                    Error::format(format!("repeat max {:?} is not an integer", text), context(tree))
                })?;
                let value = usize::try_from(value).map_err(|_| {
                    Error::input_data("repeat max cannot be negative", context(tree))
                })?;
                Some(value)
            }
            None => None,
        };

        if matches!(kind, RepeatKind::Count { .. }) && !fetch && max.is_none() {
            return Err(Error::infinite_loop(
                "a counted repeat needs max, xmax or fetch=\"true\"",
                context(tree),
            ));
        }

        remove_clones(tree, anchor);
        tree.state_mut(anchor).seq = Some(0);

        Ok(Repeat {
            kind,
            count: 0,
            max,
            fetch,
            unrolling,
            key: key.to_string(),
            body_key: tree.key_path(key, anchor),
            anchor,
        })
    }

    pub fn kind(&self) -> RepeatKind {
        self.kind
    }

    /// Whether [`Repeat::next`] must be fed the combined sources rather than
    /// a record source.
    pub fn feeds_on_combined(&self) -> bool {
        !matches!(self.kind, RepeatKind::Count { .. })
    }

    /// The node the current iteration runs on.
    pub fn anchor(&self) -> NodeId {
        self.anchor
    }

    /// Iterations started so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Starts the next iteration, or ends the loop and returns `false`.
    pub fn next(&mut self, tree: &mut Tree, scan: &mut Vec<Scan>, mut feed: Feed<'_>) -> Result<bool> {
        let context = || Some(tree.describe(self.anchor));
        let max_reached = self.max.is_some_and(|max| self.count >= max);
        let proceed = match (&mut self.kind, &mut feed) {
            (RepeatKind::Count { stacked }, Feed::Records(reader)) => {
                if self.count != 0 && self.fetch {
                    if self.count == 1 {
                        if let Some(reader) = reader {
                            reader.push();
                        }
                        *stacked = true;
                    }
                    !max_reached
                        && match reader {
                            Some(reader) => reader.read_chunk()?,
                            None => false,
                        }
                } else {
                    true
                }
            }
            (RepeatKind::CombinedDocument { prev }, Feed::Combined(sources)) => {
                let len = sources.len();
                if self.fetch {
                    let advanced = sources.next();
                    if advanced {
                        if let Some(reader) = sources.current_mut().and_then(|c| c.reader.as_mut()) {
                            reader.read_chunk()?;
                        }
                    }
                    advanced
                } else if *prev == Some(len) && sources.position() == Some(len) {
                    false
                } else {
                    if self.count != 0 && *prev == sources.position() {
                        return Err(Error::infinite_loop(
                            "combined-xml repeat does not advance between iterations",
                            context(),
                        ));
                    }
                    *prev = sources.position();
                    true
                }
            }
            (RepeatKind::CombinedRecord { prev }, Feed::Combined(sources)) => {
                let current = sources.current_mut().ok_or_else(|| {
                    Error::format(
                        "combined-record repeat outside any combined document",
                        context(),
                    )
                })?;
                let reader = current.reader.as_mut();
                if self.count != 0 && self.fetch {
                    !max_reached
                        && match reader {
                            Some(reader) => reader.read_chunk()?,
                            None => false,
                        }
                } else {
                    match reader {
                        Some(reader) if reader.valid() => {
                            let id = reader.chunk_id();
                            if self.count != 0 && *prev == Some(id) {
                                return Err(Error::infinite_loop(
                                    "combined-record repeat does not advance between iterations",
                                    context(),
                                ));
                            }
                            *prev = Some(id);
                            true
                        }
                        _ => false,
                    }
                }
            }
            _ => {
                return Err(Error::custom(format!(
                    "repeat at {} fed with the wrong kind of source",
                    tree.describe(self.anchor)
                )))
            }
        };

        if proceed {
            self.start(tree, scan, &mut feed)
        } else {
            self.finish(tree, scan, &mut feed);
            Ok(false)
        }
    }

    fn start(&mut self, tree: &mut Tree, scan: &mut Vec<Scan>, feed: &mut Feed<'_>) -> Result<bool> {
        self.count += 1;
        let first = match tree.first_child(self.anchor) {
            Some(first) if !self.max.is_some_and(|max| self.count > max) => first,
            _ => {
                self.finish(tree, scan, feed);
                return Ok(false);
            }
        };
        let first = if self.count > 1 {
            if self.unrolling {
                let copy = tree.deep_clone(self.anchor);
                tree.insert_after(self.anchor, copy)?;
                self.anchor = copy;
            }
            tree.state_mut(self.anchor).seq = Some(self.count - 1);
            tree.first_child(self.anchor).unwrap_or(first)
        } else {
            first
        };
        debug!(repeat = %tree.describe(self.anchor), iteration = self.count, "loop iteration");
        scan.push((self.body_key.clone(), first));
        Ok(true)
    }

    fn finish(&mut self, tree: &Tree, scan: &mut Vec<Scan>, feed: &mut Feed<'_>) {
        if let (RepeatKind::Count { stacked }, Feed::Records(reader)) = (&mut self.kind, feed) {
            if *stacked {
                if let Some(reader) = reader {
                    reader.pop();
                }
                *stacked = false;
            }
        }
        debug!(repeat = %tree.describe(self.anchor), iterations = self.count, "loop finished");
        if let Some(next) = tree.next_sibling(self.anchor) {
            scan.push((self.key.clone(), next));
        }
    }
}

fn flag(tree: &Tree, node: NodeId, name: &str) -> Result<Option<bool>> {
    tree.attr(node, name)
        .map(|text| match text.trim() {
            t if t.eq_ignore_ascii_case("true") => Ok(true),
            t if t.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(Error::format(
                format!("{} must be true or false, not {:?}", name, other),
                Some(tree.describe(node)),
            )),
        })
        .transpose()
}

/// Removes the unrolled copies following `anchor` that share its id.
fn remove_clones(tree: &mut Tree, anchor: NodeId) {
    let Some(id) = tree.state(anchor).repeat_id else {
        return;
    };
    while let Some(next) = tree.next_sibling(anchor) {
        if tree.name(next) != "repeat" || tree.state(next).repeat_id != Some(id) {
            break;
        }
        tree.release(next);
    }
}
