//! Lazy, nestable collections of file dependencies.
//!
//! A [`DepSet`] is a tree: each node holds concrete children (repo-relative
//! paths or other sets) and optionally a deferred generator whose children
//! are computed on first access and memoized. Sets are immutable once built
//! and cheap to clone, so they can be handed from rule to rule (and from
//! thread to thread) without materializing anything.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::ser::{Serialize, SerializeSeq, Serializer};

/// A generator of children for a deferred set.
pub type Generator = Box<dyn Fn() -> Vec<DepSetItem> + Send + Sync>;

/// One child of a [`DepSet`].
#[derive(Clone, Debug)]
pub enum DepSetItem {
  /// A repo-relative path (or `:name` rule reference).
  Path(String),
  /// A nested set.
  Set(DepSet),
}

impl From<&str> for DepSetItem {
  fn from(path: &str) -> Self {
    DepSetItem::Path(path.to_string())
  }
}

impl From<String> for DepSetItem {
  fn from(path: String) -> Self {
    DepSetItem::Path(path)
  }
}

impl From<DepSet> for DepSetItem {
  fn from(set: DepSet) -> Self {
    DepSetItem::Set(set)
  }
}

struct Deferred {
  generator: Generator,
  memo: OnceLock<Vec<DepSetItem>>,
}

struct Node {
  items: Vec<DepSetItem>,
  deferred: Option<Deferred>,
}

#[derive(Clone)]
pub struct DepSet {
  node: Arc<Node>,
}

impl DepSet {
  /// A set with concrete children.
  pub fn new(items: impl IntoIterator<Item = impl Into<DepSetItem>>) -> Self {
    Self {
      node: Arc::new(Node {
        items: items.into_iter().map(Into::into).collect(),
        deferred: None,
      }),
    }
  }

  pub fn empty() -> Self {
    Self::new(Vec::<DepSetItem>::new())
  }

  /// A set whose children are produced by `generator` on first access.
  pub fn deferred(generator: impl Fn() -> Vec<DepSetItem> + Send + Sync + 'static) -> Self {
    Self {
      node: Arc::new(Node {
        items: Vec::new(),
        deferred: Some(Deferred {
          generator: Box::new(generator),
          memo: OnceLock::new(),
        }),
      }),
    }
  }

  fn id(&self) -> usize {
    Arc::as_ptr(&self.node) as usize
  }

  fn children(&self) -> impl Iterator<Item = &DepSetItem> {
    let generated = self
      .node
      .deferred
      .as_ref()
      .map(|d| d.memo.get_or_init(|| (d.generator)()).as_slice())
      .unwrap_or(&[]);
    self.node.items.iter().chain(generated.iter())
  }

  fn forced_children(&self) -> impl Iterator<Item = &DepSetItem> {
    let generated = self
      .node
      .deferred
      .as_ref()
      .and_then(|d| d.memo.get())
      .map(Vec::as_slice)
      .unwrap_or(&[]);
    self.node.items.iter().chain(generated.iter())
  }

  /// Every path in the set, depth-first, each exactly once.
  ///
  /// Shared sub-sets are walked once; a set reachable from itself is not
  /// revisited.
  pub fn flatten(&self) -> Vec<String> {
    let mut explored = HashSet::new();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    self.walk(&mut explored, &mut seen, &mut out);
    out
  }

  fn walk(&self, explored: &mut HashSet<usize>, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    if !explored.insert(self.id()) {
      return;
    }
    for item in self.children() {
      match item {
        DepSetItem::Path(path) => {
          if seen.insert(path.clone()) {
            out.push(path.clone());
          }
        }
        DepSetItem::Set(set) => set.walk(explored, seen, out),
      }
    }
  }

  /// Whether the set has no paths at all.
  ///
  /// Concrete children (and generators that already ran) are inspected
  /// first; a deferred generator is only forced when nothing cheaper proves
  /// the set non-empty.
  pub fn is_empty(&self) -> bool {
    let mut explored = HashSet::new();
    if self.has_cheap_witness(&mut explored) {
      return false;
    }
    self.flatten().is_empty()
  }

  /// A short label that never runs a generator.
  pub fn describe(&self) -> String {
    let mut explored = HashSet::new();
    if self.has_cheap_witness(&mut explored) {
      "depset(some items)".to_string()
    } else {
      "depset(no known items)".to_string()
    }
  }

  fn has_cheap_witness(&self, explored: &mut HashSet<usize>) -> bool {
    if !explored.insert(self.id()) {
      return false;
    }
    self.forced_children().any(|item| match item {
      DepSetItem::Path(_) => true,
      DepSetItem::Set(set) => set.has_cheap_witness(explored),
    })
  }
}

impl Default for DepSet {
  fn default() -> Self {
    Self::empty()
  }
}

impl fmt::Debug for DepSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DepSet")
      .field("items", &self.node.items)
      .field("deferred", &self.node.deferred.is_some())
      .finish()
  }
}

impl Serialize for DepSet {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let paths = self.flatten();
    let mut seq = serializer.serialize_seq(Some(paths.len()))?;
    for path in &paths {
      seq.serialize_element(path)?;
    }
    seq.end()
  }
}
