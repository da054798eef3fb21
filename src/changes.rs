//! Per-revision change records
//!
//! A `ChangeSet` is the set of path-level edits recorded against one
//! revision number. The helpers in this module are pure functions over
//! change-sets; everything that needs the cache or the network lives in
//! `logwalker`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::transport::Revnum;

/// What happened to a path in one revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Added,
    Modified,
    Deleted,
    /// Deleted and re-added within the same revision
    Replaced,
}

impl ChangeAction {
    pub fn as_char(self) -> char {
        match self {
            ChangeAction::Added => 'A',
            ChangeAction::Modified => 'M',
            ChangeAction::Deleted => 'D',
            ChangeAction::Replaced => 'R',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(ChangeAction::Added),
            'M' => Some(ChangeAction::Modified),
            'D' => Some(ChangeAction::Deleted),
            'R' => Some(ChangeAction::Replaced),
            _ => None,
        }
    }

    /// Whether this action can introduce new content at the path
    pub fn is_add_or_replace(self) -> bool {
        matches!(self, ChangeAction::Added | ChangeAction::Replaced)
    }
}

/// One path's change within one revision
///
/// `copyfrom` is set iff the path was copied from another location; an
/// `Added` record without a copy source means the path originates fresh at
/// this revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub copyfrom: Option<(String, Revnum)>,
}

impl ChangeRecord {
    pub fn new(action: ChangeAction) -> Self {
        ChangeRecord { action, copyfrom: None }
    }

    pub fn copied(action: ChangeAction, from_path: impl Into<String>, from_rev: Revnum) -> Self {
        ChangeRecord {
            action,
            copyfrom: Some((from_path.into(), from_rev)),
        }
    }
}

/// All changes in one revision, keyed by slash-separated path without
/// leading or trailing slashes ("" is the repository root)
pub type ChangeSet = BTreeMap<String, ChangeRecord>;

/// The synthetic change-set for revision 0: the root is added
pub fn root_changeset() -> ChangeSet {
    let mut paths = ChangeSet::new();
    paths.insert(String::new(), ChangeRecord::new(ChangeAction::Added));
    paths
}

/// Check whether any of the changes applies to `path` or one of its
/// descendants.
///
/// With `include_parents`, a copy of an ancestor directory over `path`
/// also counts, since that moves the path's content.
pub fn changes_path(changes: &ChangeSet, path: &str, include_parents: bool) -> bool {
    for (p, record) in changes {
        if p == path || path.is_empty() || p.starts_with(&format!("{}/", path)) {
            return true;
        }
        if include_parents
            && path.starts_with(&format!("{}/", p))
            && record.action.is_add_or_replace()
            && record.copyfrom.is_some()
        {
            return true;
        }
    }
    false
}

/// Resolve where the content of `path` at `revnum` came from.
///
/// Returns the copy source if the path (or one of its ancestors) was
/// copied here, `(path, revnum - 1)` if the content simply carries over,
/// and `None` if the path was born fresh at this revision.
pub fn find_prev_location(changes: &ChangeSet, path: &str, revnum: Revnum) -> Option<(String, Revnum)> {
    if revnum == 0 {
        return None;
    }

    if let Some(record) = changes.get(path) {
        if record.action.is_add_or_replace() {
            return record
                .copyfrom
                .as_ref()
                .map(|(cp, cr)| (cp.clone(), *cr));
        }
        if record.action == ChangeAction::Deleted {
            return Some((path.to_string(), revnum - 1));
        }
    }

    // An ancestor directory may have been copied, dragging this path
    // along. Longer ancestor paths shadow shorter ones.
    for (p, record) in changes.iter().rev() {
        if record.action == ChangeAction::Modified {
            continue;
        }
        if let Some(rest) = path.strip_prefix(&format!("{}/", p)) {
            let (copy_path, copy_rev) = record.copyfrom.as_ref()?;
            return Some((format!("{}/{}", copy_path, rest), *copy_rev));
        }
    }

    Some((path.to_string(), revnum - 1))
}

/// Synthesize the changes creating a branch root from a copy source.
///
/// Every child of the copy source is rewritten under `branch_path` and
/// recorded as a fresh add, making the branch look like it started here.
pub fn full_paths(
    paths: &mut ChangeSet,
    branch_path: &str,
    from_path: &str,
    children: impl IntoIterator<Item = String>,
) {
    for child in children {
        let rewritten = match child.strip_prefix(from_path) {
            Some(rest) => format!("{}/{}", branch_path, rest.trim_start_matches('/')),
            None => continue,
        };
        paths.insert(rewritten, ChangeRecord::new(ChangeAction::Added));
    }
    paths.insert(branch_path.to_string(), ChangeRecord::new(ChangeAction::Added));
}
