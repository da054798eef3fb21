//! Interface to the remote repository access layer
//!
//! The network client itself lives outside this crate; everything here
//! talks to it through the `RaTransport` trait so the mapping core can be
//! exercised against an in-memory implementation in tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use crate::changes::ChangeSet;
use crate::errors::Result;
use crate::properties::PropertyMap;

/// Server-assigned monotonic revision number
pub type Revnum = u64;

/// What exists at a path in a given revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Absent,
    File,
    Dir,
}

/// One entry of the server's log stream
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Changed paths, if `discover_changed_paths` was requested. The
    /// server omits them for revision 0.
    pub changed_paths: Option<ChangeSet>,
    pub revnum: Revnum,
    /// Revision properties the server chose to send along
    pub revprops: PropertyMap,
}

/// Read access to the remote repository, as offered by the RA protocol.
///
/// All calls are synchronous; a call may block on a network round trip.
/// Implementations map protocol errors to `Error::Transport` and missing
/// revisions to `Error::NoSuchRevision`.
pub trait RaTransport {
    /// Repository identity, stable across connections
    fn get_uuid(&self) -> Result<String>;

    /// Youngest revision number the server knows
    fn get_latest_revnum(&self) -> Result<Revnum>;

    /// Stream log entries for `paths` (the whole tree if empty) walking
    /// from `from_revnum` towards `to_revnum`
    #[allow(clippy::too_many_arguments)]
    fn iter_log(
        &self,
        paths: Option<&[&str]>,
        from_revnum: Revnum,
        to_revnum: Revnum,
        limit: usize,
        discover_changed_paths: bool,
        strict_node_history: bool,
        revprops_of_interest: &[&str],
    ) -> Result<Box<dyn Iterator<Item = Result<LogEntry>> + '_>>;

    /// Node kind at `path` in `revnum`
    fn check_path(&self, path: &str, revnum: Revnum) -> Result<NodeKind>;

    /// Directory entries and directory properties at `path` in `revnum`
    fn get_dir(&self, path: &str, revnum: Revnum) -> Result<(BTreeMap<String, NodeKind>, PropertyMap)>;

    /// All revision properties of `revnum`
    fn revprop_list(&self, revnum: Revnum) -> Result<PropertyMap>;

    /// Change a revision property after the fact. Servers may have this
    /// disabled; implementations surface that as `Error::FeatureUnavailable`.
    fn change_rev_prop(&self, revnum: Revnum, name: &str, value: &str) -> Result<()>;
}

/// Cache of branch-root directory properties keyed by (path, revision).
///
/// Fetching directory properties costs a network round trip, and the same
/// branch root is consulted for several revisions during an ancestry walk.
pub struct BranchPropertyProvider {
    transport: Arc<dyn RaTransport>,
    cache: RefCell<HashMap<(String, Revnum), Rc<PropertyMap>>>,
}

impl BranchPropertyProvider {
    pub fn new(transport: Arc<dyn RaTransport>) -> Self {
        BranchPropertyProvider {
            transport,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Properties of the directory `path` as of `revnum`.
    ///
    /// A path that does not exist yields an empty map; callers treat
    /// "no previous location" as a normal base case.
    pub fn get_properties(&self, path: &str, revnum: Revnum) -> Result<Rc<PropertyMap>> {
        let key = (path.to_string(), revnum);
        if let Some(props) = self.cache.borrow().get(&key) {
            return Ok(props.clone());
        }
        let props = match self.transport.check_path(path, revnum)? {
            NodeKind::Dir => Rc::new(self.transport.get_dir(path, revnum)?.1),
            _ => Rc::new(PropertyMap::new()),
        };
        self.cache.borrow_mut().insert(key, props.clone());
        Ok(props)
    }
}
