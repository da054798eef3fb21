//! Cached traversal of the remote history log
//!
//! `LogWalker` answers change-set and property queries from the log cache,
//! fetching from the transport only for revisions beyond the cached
//! high-water mark. The mark only ever moves forward.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use rusqlite::Connection;

use crate::changes::{self, ChangeSet};
use crate::errors::{Error, Result};
use crate::logcache::LogCache;
use crate::properties::{LazyPropertyMap, PropertyMap};
use crate::transport::{NodeKind, RaTransport, Revnum};

/// Chunk size passed to the transport log request; 0 = no chunking
const LOG_CHUNK_LIMIT: usize = 0;

pub struct LogWalker {
    transport: Arc<dyn RaTransport>,
    cache: LogCache,
    saved_revnum: Cell<Revnum>,
    /// Whether the transport bulk-delivers revision properties with the
    /// log stream, making revprop checks free
    pub quick_revprops: bool,
    limit: usize,
}

impl LogWalker {
    pub fn new(transport: Arc<dyn RaTransport>, cache_conn: Rc<Connection>) -> Result<Self> {
        let cache = LogCache::new(cache_conn)?;
        let saved_revnum = Cell::new(cache.high_water_mark()?);
        Ok(LogWalker {
            transport,
            cache,
            saved_revnum,
            quick_revprops: false,
            limit: LOG_CHUNK_LIMIT,
        })
    }

    pub fn transport(&self) -> &Arc<dyn RaTransport> {
        &self.transport
    }

    /// Highest revision the cache is known to cover
    pub fn saved_revnum(&self) -> Revnum {
        self.saved_revnum.get()
    }

    /// Ensure the cache covers history up to `to_revnum`.
    ///
    /// A no-op when the mark is already past `to_revnum`; otherwise the
    /// whole uncached range up to the server's latest revision is pulled
    /// in one pass, so later queries stay local.
    pub fn fetch_revisions(&self, to_revnum: Revnum) -> Result<()> {
        if to_revnum <= self.saved_revnum.get() {
            return Ok(());
        }
        let latest = self.transport.get_latest_revnum()?;
        if to_revnum > latest {
            return Err(Error::NoSuchRevision(to_revnum));
        }
        let target = latest;

        tracing::debug!(from = self.saved_revnum.get(), to = target, "fetching revision info");
        while self.saved_revnum.get() < target {
            let entries = self.transport.iter_log(
                None,
                self.saved_revnum.get(),
                target,
                self.limit,
                true,
                true,
                &[],
            )?;
            for entry in entries {
                let entry = entry?;
                if let Some(paths) = &entry.changed_paths {
                    self.cache.record_changes(entry.revnum, paths)?;
                }
                if !entry.revprops.is_empty() {
                    self.cache.record_properties(entry.revnum, &entry.revprops)?;
                }
                self.saved_revnum.set(entry.revnum);
                if entry.revnum % 1000 == 0 {
                    tracing::debug!(revnum = entry.revnum, target, "fetch progress");
                }
            }
        }
        self.cache.flush()
    }

    /// All changes recorded against one revision.
    ///
    /// Revision 0 is always the synthetic "root added" change-set.
    pub fn get_revision_paths(&self, revnum: Revnum) -> Result<ChangeSet> {
        if revnum == 0 {
            return Ok(changes::root_changeset());
        }
        self.fetch_revisions(revnum)?;
        self.cache.get_changes(revnum)
    }

    /// Revision properties, cached after the first fetch
    pub fn revprop_list(&self, revnum: Revnum) -> Result<PropertyMap> {
        if let Some(props) = self.cache.get_properties(revnum)? {
            return Ok(props);
        }
        let props = self.transport.revprop_list(revnum)?;
        self.cache.record_properties(revnum, &props)?;
        Ok(props)
    }

    /// Latest revision at or below `revnum` that touched `path`, one of
    /// its descendants, or replaced it through an ancestor copy.
    ///
    /// The root always reports revision 0 as a lower bound; any other path
    /// that never existed yields `None`.
    pub fn find_latest_change(&self, path: &str, revnum: Revnum) -> Result<Option<Revnum>> {
        let path = path.trim_matches('/');
        self.fetch_revisions(revnum)?;
        tracing::trace!(path, revnum, "find latest change");
        let found = self.cache.find_latest_change(path, revnum)?;
        if found.is_none() && path.is_empty() {
            return Ok(Some(0));
        }
        Ok(found)
    }

    /// Where the content of `path` at `revnum` was derived from.
    ///
    /// `None` when the path was born fresh at this revision, or when the
    /// revision did not touch the path at all.
    pub fn get_previous(&self, path: &str, revnum: Revnum) -> Result<Option<(String, Revnum)>> {
        if revnum == 0 {
            return Ok(None);
        }
        self.fetch_revisions(revnum)?;
        tracing::trace!(path, revnum, "get previous location");
        let changes = self.cache.get_changes(revnum)?;
        let record = match changes.get(path) {
            Some(record) => record,
            None => return Ok(None),
        };
        if let Some((copy_path, copy_rev)) = &record.copyfrom {
            return Ok(Some((copy_path.clone(), *copy_rev)));
        }
        if record.action == crate::changes::ChangeAction::Added {
            return Ok(None);
        }
        Ok(Some((path.to_string(), revnum - 1)))
    }

    /// Iterate revisions between `from_revnum` and `to_revnum` that touch
    /// the tracked path or any of its descendants.
    ///
    /// Descending walks (`to_revnum <= from_revnum`) follow the tracked
    /// path's rename lineage through copy records and must track exactly
    /// one path; ascending walks cover the whole tree and are only valid
    /// for the root. `limit` of 0 means unlimited.
    pub fn iter_changes<'a>(
        &'a self,
        paths: Option<&[&str]>,
        from_revnum: Revnum,
        to_revnum: Revnum,
        limit: usize,
    ) -> Result<ChangeIter<'a>> {
        let path = match paths {
            None => String::new(),
            Some(list) => {
                assert_eq!(list.len(), 1, "history can only be tracked for a single path");
                list[0].trim_matches('/').to_string()
            }
        };
        let ascending = to_revnum > from_revnum;
        assert!(
            from_revnum >= to_revnum || path.is_empty(),
            "ascending walks only cover the whole tree"
        );
        tracing::debug!(from = from_revnum, to = to_revnum, path, "iter changes");
        Ok(ChangeIter {
            walker: self,
            path: Some(path),
            revnum: from_revnum,
            to_revnum,
            ascending,
            limit,
            yielded: 0,
            done: false,
        })
    }

    /// All descendant paths of `path` in `revnum`, files and directories.
    ///
    /// A plain recursive listing through the transport; files have no
    /// children, absent paths are an error.
    pub fn find_children(&self, path: &str, revnum: Revnum) -> Result<Vec<String>> {
        let path = path.trim_matches('/').to_string();
        match self.transport.check_path(&path, revnum)? {
            NodeKind::File => return Ok(vec![]),
            NodeKind::Absent => {
                return Err(Error::NotFound(format!("{}@{}", path, revnum)));
            }
            NodeKind::Dir => {}
        }
        let mut found = Vec::new();
        let mut pending = vec![path];
        while let Some(dir) = pending.pop() {
            let (entries, _props) = self.transport.get_dir(&dir, revnum)?;
            for (name, kind) in entries {
                let child = if dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir, name)
                };
                found.push(child.clone());
                if kind == NodeKind::Dir {
                    pending.push(child);
                }
            }
        }
        Ok(found)
    }
}

/// Lazy walk over the revisions touching one tracked path (or the whole
/// tree when ascending). Dropping the iterator cancels the walk.
pub struct ChangeIter<'a> {
    walker: &'a LogWalker,
    path: Option<String>,
    revnum: Revnum,
    to_revnum: Revnum,
    ascending: bool,
    limit: usize,
    yielded: usize,
    done: bool,
}

impl<'a> Iterator for ChangeIter<'a> {
    type Item = Result<(ChangeSet, Revnum, LazyPropertyMap)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let path = self.path.clone()?;
            let in_range = if self.ascending {
                self.revnum <= self.to_revnum
            } else {
                self.revnum >= self.to_revnum
            };
            if !in_range {
                self.done = true;
                return None;
            }

            let revpaths = match self.walker.get_revision_paths(self.revnum) {
                Ok(revpaths) => revpaths,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let next = if self.ascending {
                Some((path.clone(), self.revnum + 1))
            } else {
                changes::find_prev_location(&revpaths, &path, self.revnum)
            };

            let item = if changes::changes_path(&revpaths, &path, true) {
                let transport = self.walker.transport.clone();
                let revnum = self.revnum;
                let revprops = LazyPropertyMap::new(PropertyMap::new(), move || {
                    transport.revprop_list(revnum)
                });
                self.yielded += 1;
                if self.limit != 0 && self.yielded == self.limit {
                    self.done = true;
                }
                Some(Ok((revpaths, self.revnum, revprops)))
            } else {
                None
            };

            match next {
                Some((next_path, next_revnum)) => {
                    self.path = Some(next_path);
                    self.revnum = next_revnum;
                }
                None => {
                    self.path = None;
                    if item.is_none() {
                        self.done = true;
                        return None;
                    }
                }
            }

            if let Some(item) = item {
                return Some(item);
            }
        }
    }
}
