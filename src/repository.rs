//! Repository facade
//!
//! Ties the walker, layout policy, codec and metadata provider together
//! behind the surface the host tool talks to. One facade per open
//! repository session; several facades may share one log cache connection
//! when pointed at the same repository identity.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use rusqlite::Connection;

use crate::changes::ChangeSet;
use crate::config::{ConfigStore, RepositoryConfig};
use crate::errors::{Error, Result};
use crate::layout::{self, Layout, SCHEME_GUESS_SAMPLE_SIZE};
use crate::logwalker::LogWalker;
use crate::mapping::{self, Mapping};
use crate::properties::dvcs_props;
use crate::revmeta::{RevisionMetadata, RevisionMetadataProvider};
use crate::transport::{RaTransport, Revnum};

/// Do not remember history-based scheme guesses for repositories smaller
/// than this; the guess is too unreliable to be worth persisting
const GUESS_PERSIST_THRESHOLD: Revnum = 20;

pub struct Repository {
    transport: Arc<dyn RaTransport>,
    provider: RevisionMetadataProvider,
    config: ConfigStore,
    uuid: String,
    layout: RefCell<Option<Box<dyn Layout>>>,
    read_locks: Cell<u32>,
    write_locks: Cell<u32>,
    cached_latest: Cell<Option<Revnum>>,
}

impl Repository {
    pub fn open(
        transport: Arc<dyn RaTransport>,
        cache_conn: Rc<Connection>,
        config: ConfigStore,
    ) -> Result<Self> {
        let walker = Rc::new(LogWalker::new(transport.clone(), cache_conn)?);
        let provider = RevisionMetadataProvider::new(transport.clone(), walker)?;
        let uuid = provider.uuid().to_string();
        tracing::debug!(uuid, "opened repository session");
        Ok(Repository {
            transport,
            provider,
            config,
            uuid,
            layout: RefCell::new(None),
            read_locks: Cell::new(0),
            write_locks: Cell::new(0),
            cached_latest: Cell::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn metadata(&self) -> &RevisionMetadataProvider {
        &self.provider
    }

    fn walker(&self) -> &Rc<LogWalker> {
        self.provider.walker()
    }

    /// Take an advisory read lock. Reentrant; no cross-process exclusion
    /// beyond what the transport itself enforces.
    pub fn lock_read(&self) {
        self.read_locks.set(self.read_locks.get() + 1);
    }

    pub fn lock_write(&self) {
        self.write_locks.set(self.write_locks.get() + 1);
    }

    /// Release the innermost lock (write locks release before read locks).
    /// Closing the outermost scope drops the cached latest revision.
    pub fn unlock(&self) {
        if self.write_locks.get() > 0 {
            self.write_locks.set(self.write_locks.get() - 1);
        } else if self.read_locks.get() > 0 {
            self.read_locks.set(self.read_locks.get() - 1);
        }
        if self.read_locks.get() == 0 && self.write_locks.get() == 0 {
            self.cached_latest.set(None);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.read_locks.get() > 0 || self.write_locks.get() > 0
    }

    /// Youngest revision the server knows. Cached for the duration of a
    /// lock scope; unlocked calls always hit the transport.
    pub fn get_latest_revnum(&self) -> Result<Revnum> {
        if self.is_locked() {
            if let Some(latest) = self.cached_latest.get() {
                return Ok(latest);
            }
        }
        let latest = self.transport.get_latest_revnum()?;
        if self.is_locked() {
            self.cached_latest.set(Some(latest));
        }
        Ok(latest)
    }

    /// Branching scheme stored as a property on the repository root, if any
    pub fn property_scheme(&self) -> Result<Option<String>> {
        let latest = self.get_latest_revnum()?;
        let (_entries, props) = self.transport.get_dir("", latest)?;
        Ok(props.get(dvcs_props::BRANCHING_SCHEME).cloned())
    }

    /// The layout in force for this session.
    ///
    /// Selection order: mandatory configured scheme, then the scheme
    /// stored in the repository root's properties, then configured or
    /// previously guessed non-mandatory schemes, then a fresh guess from
    /// a sample of recent history.
    pub fn get_layout(&self) -> Result<Box<dyn Layout>> {
        if let Some(layout) = self.layout.borrow().as_ref() {
            return Ok(layout.clone());
        }
        let layout = self.select_layout()?;
        tracing::debug!(scheme = %layout.to_scheme_text(), "selected layout");
        *self.layout.borrow_mut() = Some(layout.clone());
        Ok(layout)
    }

    fn select_layout(&self) -> Result<Box<dyn Layout>> {
        let cfg = self.config.load()?;
        if cfg.branching_scheme_mandatory {
            if let Some(text) = &cfg.branching_scheme {
                return layout::parse_scheme_text(text);
            }
        }
        if let Some(text) = self.property_scheme()? {
            return layout::parse_scheme_text(&text);
        }
        if let Some(text) = &cfg.branching_scheme {
            return layout::parse_scheme_text(text);
        }
        if let Some(text) = &cfg.guessed_branching_scheme {
            return layout::parse_scheme_text(text);
        }
        self.guess_layout(cfg)
    }

    fn guess_layout(&self, mut cfg: RepositoryConfig) -> Result<Box<dyn Layout>> {
        let latest = self.get_latest_revnum()?;
        let window_floor = latest.saturating_sub(SCHEME_GUESS_SAMPLE_SIZE);
        let sample = self
            .walker()
            .iter_changes(None, latest, window_floor, 0)?
            .map(|item| item.map(|(paths, revnum, _revprops)| (paths, revnum)));
        let (guessed, to_use) = layout::guess_scheme_from_history(sample, latest, None)?;
        if latest > GUESS_PERSIST_THRESHOLD {
            cfg.guessed_branching_scheme = Some(guessed.to_scheme_text());
            self.config.save(&cfg)?;
        }
        Ok(to_use)
    }

    /// Override the layout for this session and remember it in the
    /// repository configuration
    pub fn set_layout(&self, layout: Box<dyn Layout>) -> Result<()> {
        let mut cfg = self.config.load()?;
        cfg.branching_scheme = Some(layout.to_scheme_text());
        self.config.save(&cfg)?;
        *self.layout.borrow_mut() = Some(layout);
        Ok(())
    }

    pub fn get_mapping(&self) -> Result<Mapping> {
        Ok(Mapping::default_for(self.get_layout()?))
    }

    /// Decode a revision identifier and verify it belongs to this
    /// repository and points at an existing revision
    pub fn lookup_revision_id(&self, revid: &str) -> Result<(String, Revnum, Mapping)> {
        let (uuid, path, revnum, mapping) = mapping::parse_revision_id(revid)?;
        if uuid != self.uuid {
            return Err(Error::NotFound(revid.to_string()));
        }
        if revnum > self.get_latest_revnum()? {
            return Err(Error::NoSuchRevision(revnum));
        }
        Ok((path, revnum, mapping))
    }

    fn get_revmeta(&self, revid: &str) -> Result<(Rc<RevisionMetadata>, Mapping)> {
        let (path, revnum, mapping) = self.lookup_revision_id(revid)?;
        let meta = self.provider.get_revision(&path, revnum, &mapping)?;
        Ok((meta, mapping))
    }

    /// Parent identifiers of a revision: left-hand parent first, then any
    /// merge parents. The first revision of a lineage has no parents.
    pub fn revision_parents(&self, revid: &str) -> Result<Vec<String>> {
        let (meta, mapping) = self.get_revmeta(revid)?;
        let mut parents = Vec::new();
        if let Some(lhs) = self.provider.get_lhs_parent(&meta, &mapping)? {
            parents.push(lhs);
        }
        parents.extend(meta.get_rhs_parents(&mapping)?);
        Ok(parents)
    }

    /// The left-hand ancestry of a revision, from the revision itself
    /// back to the first revision of its lineage
    pub fn revision_ancestry(&self, revid: &str) -> Result<Vec<String>> {
        let (path, revnum, mapping) = self.lookup_revision_id(revid)?;
        let mut ancestry = Vec::new();
        for item in self
            .provider
            .iter_reverse_branch_changes(&path, revnum, 0, &mapping)?
        {
            ancestry.push(item?.get_revision_id(&mapping)?);
        }
        Ok(ancestry)
    }

    /// Identifiers of every branch-or-tag revision in the repository,
    /// newest first
    pub fn all_revision_ids(&self) -> Result<Vec<String>> {
        let layout = self.get_layout()?;
        let mapping = Mapping::default_for(layout.clone());
        let latest = self.get_latest_revnum()?;
        let mut ids = Vec::new();
        for item in self.provider.iter_all_changes(layout.as_ref(), latest, 0)? {
            ids.push(item?.get_revision_id(&mapping)?);
        }
        Ok(ids)
    }

    /// Discover branch and tag roots that existed anywhere in a revision
    /// range.
    ///
    /// Returns `(path, last revision present, still exists at the end of
    /// the range)` tuples. Scans every change-set ascending and tracks
    /// creations and deletions; a newly copied directory that could
    /// contain branches is listed recursively, since a bulk copy creates
    /// branches without individual change records.
    pub fn find_branchpaths(
        &self,
        from_revnum: Revnum,
        to_revnum: Revnum,
    ) -> Result<Vec<(String, Revnum, bool)>> {
        let layout = self.get_layout()?;
        let mut created: std::collections::BTreeMap<String, Revnum> = Default::default();
        let mut found = Vec::new();

        for item in self.walker().iter_changes(None, from_revnum, to_revnum, 0)? {
            let (paths, revnum, _revprops) = item?;
            self.scan_branchpaths(layout.as_ref(), &paths, revnum, &mut created, &mut found)?;
        }
        for (path, created_rev) in created {
            let last = self
                .walker()
                .find_latest_change(&path, to_revnum)?
                .unwrap_or(created_rev);
            found.push((path, last, true));
        }
        Ok(found)
    }

    fn scan_branchpaths(
        &self,
        layout: &dyn Layout,
        paths: &ChangeSet,
        revnum: Revnum,
        created: &mut std::collections::BTreeMap<String, Revnum>,
        found: &mut Vec<(String, Revnum, bool)>,
    ) -> Result<()> {
        use crate::changes::ChangeAction;

        for (path, record) in paths {
            if layout.is_branch_or_tag(path) {
                let removes = matches!(record.action, ChangeAction::Deleted | ChangeAction::Replaced);
                if removes {
                    if let Some(created_rev) = created.remove(path) {
                        let last = self
                            .walker()
                            .find_latest_change(path, revnum - 1)?
                            .unwrap_or(created_rev);
                        found.push((path.clone(), last, false));
                    }
                }
                if record.action.is_add_or_replace() {
                    created.insert(path.clone(), revnum);
                }
            } else if layout.is_branch_or_tag_parent(path) {
                if matches!(record.action, ChangeAction::Deleted | ChangeAction::Replaced) {
                    let prefix = format!("{}/", path);
                    let doomed: Vec<String> = created
                        .keys()
                        .filter(|c| c.starts_with(&prefix))
                        .cloned()
                        .collect();
                    for child in doomed {
                        if let Some(created_rev) = created.remove(&child) {
                            let last = self
                                .walker()
                                .find_latest_change(&child, revnum - 1)?
                                .unwrap_or(created_rev);
                            found.push((child, last, false));
                        }
                    }
                }
                // A copied parent directory can bring whole branches with
                // it; only a listing reveals them.
                if record.action.is_add_or_replace() && record.copyfrom.is_some() {
                    let mut pending = vec![path.clone()];
                    while let Some(dir) = pending.pop() {
                        let entries = match self.transport.get_dir(&dir, revnum) {
                            Ok((entries, _props)) => entries,
                            Err(Error::NotFound(_)) => continue,
                            Err(e) => return Err(e),
                        };
                        for name in entries.keys() {
                            let child = format!("{}/{}", dir, name);
                            if layout.is_branch_or_tag(&child) {
                                created.insert(child, revnum);
                            } else if layout.is_branch_or_tag_parent(&child) {
                                pending.push(child);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Detached signature recorded against a revision, if any
    pub fn get_signature(&self, revid: &str) -> Result<Option<String>> {
        let (meta, _mapping) = self.get_revmeta(revid)?;
        meta.get_signature()
    }

    /// Attach a detached signature to a revision.
    ///
    /// Servers with revision-property editing disabled make this a no-op
    /// rather than an error; the signature is optional metadata.
    pub fn record_signature(&self, revid: &str, signature: &str) -> Result<()> {
        let (_path, revnum, _mapping) = self.lookup_revision_id(revid)?;
        match self
            .transport
            .change_rev_prop(revnum, dvcs_props::REVPROP_SIGNATURE, signature)
        {
            Ok(()) => Ok(()),
            Err(Error::FeatureUnavailable(what)) => {
                tracing::debug!(what, revnum, "signature not recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
