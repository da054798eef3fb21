//! Lazy per-revision metadata and branch lineage walks
//!
//! A `RevisionMetadata` node answers questions about one (branch path,
//! revision) coordinate: its change-set, its revision properties, the
//! branch-root property changes it introduced, its parentage and whether
//! it was produced by the host tool. Every field is computed at most once
//! and memoized; nothing touches the network until a field is demanded.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::changes::{self, ChangeSet};
use crate::errors::{Error, Result};
use crate::layout::Layout;
use crate::logwalker::{ChangeIter, LogWalker};
use crate::mapping::{self, Mapping};
use crate::properties::{self, dvcs_props, PropertyMap, SVK_MERGE};
use crate::transport::{BranchPropertyProvider, RaTransport, Revnum};

struct Shared {
    walker: Rc<LogWalker>,
    fileprops: BranchPropertyProvider,
    uuid: String,
}

/// Metadata of one revision as seen from one branch root
pub struct RevisionMetadata {
    shared: Rc<Shared>,
    pub branch_path: String,
    pub revnum: Revnum,
    paths: RefCell<Option<ChangeSet>>,
    revprops: RefCell<Option<PropertyMap>>,
    fileprops: RefCell<Option<Rc<PropertyMap>>>,
    changed_fileprops: RefCell<Option<PropertyMap>>,
    is_native: Cell<Option<bool>>,
    metabranch: RefCell<Option<Rc<RevisionMetadataBranch>>>,
}

impl RevisionMetadata {
    fn new(shared: Rc<Shared>, branch_path: String, revnum: Revnum, paths: Option<ChangeSet>) -> Self {
        RevisionMetadata {
            shared,
            branch_path,
            revnum,
            paths: RefCell::new(paths),
            revprops: RefCell::new(None),
            fileprops: RefCell::new(None),
            changed_fileprops: RefCell::new(None),
            is_native: Cell::new(None),
            metabranch: RefCell::new(None),
        }
    }

    /// The revision's full change-set
    pub fn get_paths(&self) -> Result<ChangeSet> {
        if let Some(paths) = self.paths.borrow().as_ref() {
            return Ok(paths.clone());
        }
        let paths = self.shared.walker.get_revision_paths(self.revnum)?;
        *self.paths.borrow_mut() = Some(paths.clone());
        Ok(paths)
    }

    pub fn get_revprops(&self) -> Result<PropertyMap> {
        if let Some(props) = self.revprops.borrow().as_ref() {
            return Ok(props.clone());
        }
        let props = self.shared.walker.revprop_list(self.revnum)?;
        *self.revprops.borrow_mut() = Some(props.clone());
        Ok(props)
    }

    /// Branch-root directory properties as of this revision
    pub fn get_fileprops(&self) -> Result<Rc<PropertyMap>> {
        if let Some(props) = self.fileprops.borrow().as_ref() {
            return Ok(props.clone());
        }
        let props = self
            .shared
            .fileprops
            .get_properties(&self.branch_path, self.revnum)?;
        *self.fileprops.borrow_mut() = Some(props.clone());
        Ok(props)
    }

    fn fileprops_if_loaded(&self) -> Option<Rc<PropertyMap>> {
        self.fileprops.borrow().clone()
    }

    /// Branch-root properties at the previous location of this branch;
    /// empty when the branch was born at this revision
    pub fn get_previous_fileprops(&self) -> Result<Rc<PropertyMap>> {
        let paths = self.get_paths()?;
        match changes::find_prev_location(&paths, &self.branch_path, self.revnum) {
            Some((prev_path, prev_revnum)) => {
                self.shared.fileprops.get_properties(&prev_path, prev_revnum)
            }
            None => Ok(Rc::new(PropertyMap::new())),
        }
    }

    /// Branch-root properties this revision changed.
    ///
    /// Empty without any fetch when the branch root itself was untouched;
    /// directory properties can only change together with their node.
    pub fn get_changed_fileprops(&self) -> Result<PropertyMap> {
        if let Some(changed) = self.changed_fileprops.borrow().as_ref() {
            return Ok(changed.clone());
        }
        let paths = self.get_paths()?;
        let changed = if paths.contains_key(&self.branch_path) {
            properties::diff(&*self.get_fileprops()?, &*self.get_previous_fileprops()?)
        } else {
            PropertyMap::new()
        };
        *self.changed_fileprops.borrow_mut() = Some(changed.clone());
        Ok(changed)
    }

    fn consider_native_fileprops(&self) -> bool {
        let branch = self.metabranch.borrow().clone();
        match branch {
            Some(branch) => branch.consider_native_fileprops(self),
            None => true,
        }
    }

    fn consider_svk_fileprops(&self) -> bool {
        let branch = self.metabranch.borrow().clone();
        match branch {
            Some(branch) => branch.consider_svk_fileprops(self),
            None => true,
        }
    }

    /// Whether this revision was committed by the host tool round-tripping
    /// through the server, as opposed to a plain server-side commit.
    ///
    /// Checked cheapest-first: bulk-delivered revision properties, then
    /// branch properties (one directory fetch, skippable through the
    /// lineage session), then an individual revision-property fetch.
    pub fn is_native(&self, mapping: &Mapping) -> Result<bool> {
        if let Some(memo) = self.is_native.get() {
            return Ok(memo);
        }
        let verdict = self.classify_native(mapping)?;
        self.is_native.set(Some(verdict));
        Ok(verdict)
    }

    fn classify_native(&self, _mapping: &Mapping) -> Result<bool> {
        if self.shared.walker.quick_revprops {
            if let Some(verdict) = mapping::is_native_revision_revprops(&self.get_revprops()?) {
                return Ok(verdict);
            }
        }
        if self.consider_native_fileprops() {
            if let Some(verdict) =
                mapping::is_native_revision_fileprops(&self.get_changed_fileprops()?)
            {
                return Ok(verdict);
            }
        }
        if !self.shared.walker.quick_revprops {
            if let Some(verdict) = mapping::is_native_revision_revprops(&self.get_revprops()?) {
                return Ok(verdict);
            }
        }
        Ok(false)
    }

    /// How many ancestors with host-tool markers this revision appears to
    /// have, judged from already-loaded branch properties only
    fn estimate_native_ancestors_if_loaded(&self) -> Option<usize> {
        self.fileprops_if_loaded()
            .map(|props| mapping::estimate_native_ancestors(&props))
    }

    fn estimate_svk_ancestors_if_loaded(&self) -> Option<usize> {
        self.fileprops_if_loaded()
            .map(|props| mapping::estimate_svk_ancestors(&props))
    }

    /// The stable identifier of this revision under `mapping`.
    ///
    /// Round-tripped commits recorded their own identifier in the
    /// per-mapping revision-id log; anything else gets the generated form.
    pub fn get_revision_id(&self, mapping: &Mapping) -> Result<String> {
        if self.is_native(mapping)? {
            let name = format!("{}{}", dvcs_props::REVISION_ID_PREFIX, mapping.name());
            if let Some(value) = self.get_changed_fileprops()?.get(&name) {
                if let Some(revid) = value
                    .lines()
                    .last()
                    .and_then(|line| line.split_whitespace().nth(1))
                {
                    return Ok(revid.to_string());
                }
            }
        }
        mapping.generate_revision_id(&self.shared.uuid, self.revnum, &self.branch_path)
    }

    /// Explicit left-hand parent recorded by a round-tripped commit
    pub fn get_lhs_parent_hint(&self, mapping: &Mapping) -> Result<Option<String>> {
        Ok(mapping::get_lhs_parent_hint(
            &mapping.name(),
            &self.get_revprops()?,
            &self.get_changed_fileprops()?,
        ))
    }

    /// Merge parents of this revision.
    ///
    /// Native revisions carry them explicitly; foreign revisions may still
    /// reveal merges through newly-appearing svk merge features. Features
    /// pointing outside branch territory are dropped, not errors.
    pub fn get_rhs_parents(&self, mapping: &Mapping) -> Result<Vec<String>> {
        if self.is_native(mapping)? {
            return Ok(mapping::get_rhs_parents(
                &mapping.name(),
                &self.get_revprops()?,
                &self.get_changed_fileprops()?,
            ));
        }
        if !self.consider_svk_fileprops() {
            return Ok(vec![]);
        }
        let changed = self.get_changed_fileprops()?;
        let current = match changed.get(SVK_MERGE) {
            Some(current) => current.clone(),
            None => return Ok(vec![]),
        };
        let previous = self
            .get_previous_fileprops()?
            .get(SVK_MERGE)
            .cloned()
            .unwrap_or_default();
        let mut parents = Vec::new();
        for feature in mapping::svk_features_merged_since(&current, &previous) {
            if let Some(revid) = mapping::svk_feature_to_revision_id(&feature, mapping)? {
                parents.push(revid);
            }
        }
        Ok(parents)
    }

    /// Detached signature recorded against this revision, if any
    pub fn get_signature(&self) -> Result<Option<String>> {
        Ok(self.get_revprops()?.get(dvcs_props::REVPROP_SIGNATURE).cloned())
    }
}

impl std::fmt::Debug for RevisionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionMetadata")
            .field("branch_path", &self.branch_path)
            .field("revnum", &self.revnum)
            .finish()
    }
}

/// One walked branch lineage, newest revision first.
///
/// Lets adjacent nodes answer relative questions cheaply: a node may skip
/// its own branch-property fetch when a strictly later revision in the
/// same lineage already proved zero host-tool ancestry. The skip never
/// changes the answer full inspection would give; marker properties only
/// accumulate along a lineage.
///
/// Every appended node holds a strong reference back to its lineage, so
/// the session outlives the iterator that built it; the lineage holds its
/// nodes weakly to keep the provider cache the only strong owner.
pub struct RevisionMetadataBranch {
    revs: RefCell<Vec<Weak<RevisionMetadata>>>,
}

impl RevisionMetadataBranch {
    pub fn new() -> Rc<Self> {
        Rc::new(RevisionMetadataBranch {
            revs: RefCell::new(Vec::new()),
        })
    }

    pub fn append(self: &Rc<Self>, meta: &Rc<RevisionMetadata>) {
        *meta.metabranch.borrow_mut() = Some(self.clone());
        self.revs.borrow_mut().push(Rc::downgrade(meta));
    }

    fn position(&self, meta: &RevisionMetadata) -> Option<usize> {
        self.revs
            .borrow()
            .iter()
            .position(|m| std::ptr::eq(m.as_ptr(), meta))
    }

    /// The next-older walked revision in this lineage, if already walked
    pub fn get_lhs_parent(&self, meta: &RevisionMetadata) -> Option<Rc<RevisionMetadata>> {
        let pos = self.position(meta)?;
        self.revs.borrow().get(pos + 1).and_then(Weak::upgrade)
    }

    fn consider(
        &self,
        meta: &RevisionMetadata,
        estimate: impl Fn(&RevisionMetadata) -> Option<usize>,
    ) -> bool {
        let revs = self.revs.borrow();
        let pos = match self.position(meta) {
            Some(pos) => pos,
            None => return true,
        };
        // Nearest later revision with already-loaded branch properties
        // decides; never force a fetch just to answer this.
        for later in revs[..pos].iter().rev() {
            let later = match later.upgrade() {
                Some(later) => later,
                None => continue,
            };
            if let Some(ancestors) = estimate(later.as_ref()) {
                return ancestors > 0;
            }
        }
        true
    }

    pub fn consider_native_fileprops(&self, meta: &RevisionMetadata) -> bool {
        self.consider(meta, RevisionMetadata::estimate_native_ancestors_if_loaded)
    }

    pub fn consider_svk_fileprops(&self, meta: &RevisionMetadata) -> bool {
        self.consider(meta, RevisionMetadata::estimate_svk_ancestors_if_loaded)
    }
}

/// One step of a branch history walk
#[derive(Debug)]
pub struct BranchChange {
    pub branch_path: String,
    pub paths: ChangeSet,
    pub revnum: Revnum,
}

/// Factory and cache for `RevisionMetadata` nodes.
///
/// Nodes are shared: asking twice for the same (branch path, revnum)
/// yields the same `Rc`, so memoized fields are computed once per session.
pub struct RevisionMetadataProvider {
    shared: Rc<Shared>,
    cache: RefCell<HashMap<(String, Revnum), Rc<RevisionMetadata>>>,
}

impl RevisionMetadataProvider {
    pub fn new(transport: Arc<dyn RaTransport>, walker: Rc<LogWalker>) -> Result<Self> {
        let uuid = transport.get_uuid()?;
        Ok(RevisionMetadataProvider {
            shared: Rc::new(Shared {
                walker,
                fileprops: BranchPropertyProvider::new(transport),
                uuid,
            }),
            cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn walker(&self) -> &Rc<LogWalker> {
        &self.shared.walker
    }

    pub fn uuid(&self) -> &str {
        &self.shared.uuid
    }

    fn lookup(
        &self,
        branch_path: &str,
        revnum: Revnum,
        paths: Option<ChangeSet>,
    ) -> Rc<RevisionMetadata> {
        let key = (branch_path.to_string(), revnum);
        if let Some(meta) = self.cache.borrow().get(&key) {
            return meta.clone();
        }
        let meta = Rc::new(RevisionMetadata::new(
            self.shared.clone(),
            branch_path.to_string(),
            revnum,
            paths,
        ));
        self.cache.borrow_mut().insert(key, meta.clone());
        meta
    }

    /// Metadata node for one coordinate. Callers must hold a path the
    /// mapping classifies as branch or tag.
    pub fn get_revision(
        &self,
        branch_path: &str,
        revnum: Revnum,
        mapping: &Mapping,
    ) -> Result<Rc<RevisionMetadata>> {
        let branch_path = branch_path.trim_matches('/');
        if !mapping.is_branch(branch_path) && !mapping.is_tag(branch_path) {
            return Err(Error::InvalidBranchPath(branch_path.to_string()));
        }
        Ok(self.lookup(branch_path, revnum, None))
    }

    /// Left-hand parent identifier of `meta`, or `None` for the first
    /// revision of a lineage.
    ///
    /// An explicit parent pointer from a round-tripped commit wins;
    /// otherwise the previous location is resolved structurally.
    pub fn get_lhs_parent(
        &self,
        meta: &Rc<RevisionMetadata>,
        mapping: &Mapping,
    ) -> Result<Option<String>> {
        if let Some(hint) = meta.get_lhs_parent_hint(mapping)? {
            return Ok(Some(hint));
        }
        let branch = meta.metabranch.borrow().clone();
        if let Some(branch) = branch {
            if let Some(parent) = branch.get_lhs_parent(meta) {
                return parent.get_revision_id(mapping).map(Some);
            }
        }
        let walk =
            self.iter_reverse_branch_changes(&meta.branch_path, meta.revnum, 0, mapping)?;
        for item in walk {
            let candidate = item?;
            if candidate.revnum < meta.revnum {
                return candidate.get_revision_id(mapping).map(Some);
            }
        }
        Ok(None)
    }

    /// Walk one branch's history backwards as raw change steps, following
    /// renames and stopping with a synthesized branch birth when the
    /// lineage leaves branch-classified territory.
    pub fn iter_changes<'a>(
        &'a self,
        branch_path: &str,
        from_revnum: Revnum,
        to_revnum: Revnum,
        mapping: &'a Mapping,
    ) -> Result<BranchChangeIter<'a>> {
        let branch_path = branch_path.trim_matches('/').to_string();
        let inner =
            self.shared
                .walker
                .iter_changes(Some(&[&branch_path]), from_revnum, to_revnum, 0)?;
        Ok(BranchChangeIter {
            inner,
            walker: &self.shared.walker,
            mapping,
            branch_path: Some(branch_path),
            done: false,
        })
    }

    /// Walk one branch's history backwards as shared metadata nodes,
    /// wired into a fresh lineage session
    pub fn iter_reverse_branch_changes<'a>(
        &'a self,
        branch_path: &str,
        from_revnum: Revnum,
        to_revnum: Revnum,
        mapping: &'a Mapping,
    ) -> Result<ReverseBranchIter<'a>> {
        Ok(ReverseBranchIter {
            inner: self.iter_changes(branch_path, from_revnum, to_revnum, mapping)?,
            provider: self,
            metabranch: RevisionMetadataBranch::new(),
        })
    }

    /// Every branch-or-tag coordinate touched anywhere in the tree,
    /// walking revision numbers downwards
    pub fn iter_all_changes<'a>(
        &'a self,
        layout: &'a dyn Layout,
        from_revnum: Revnum,
        to_revnum: Revnum,
    ) -> Result<AllChangesIter<'a>> {
        Ok(AllChangesIter {
            inner: self
                .shared
                .walker
                .iter_changes(None, from_revnum, to_revnum, 0)?,
            provider: self,
            layout,
            pending: VecDeque::new(),
        })
    }
}

pub struct BranchChangeIter<'a> {
    inner: ChangeIter<'a>,
    walker: &'a LogWalker,
    mapping: &'a Mapping,
    branch_path: Option<String>,
    done: bool,
}

impl<'a> Iterator for BranchChangeIter<'a> {
    type Item = Result<BranchChange>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (mut paths, revnum, _revprops) = match self.inner.next()? {
                Ok(step) => step,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let bp = self.branch_path.clone()?;
            let next_loc = changes::find_prev_location(&paths, &bp, revnum);

            if let Some((next_path, next_revnum)) = &next_loc {
                if !self.mapping.is_branch(next_path) && !self.mapping.is_tag(next_path) {
                    // The lineage dissolves into unclassified territory;
                    // rewrite this step so the branch looks born here.
                    let children = match self.walker.find_children(next_path, *next_revnum) {
                        Ok(children) => children,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    changes::full_paths(&mut paths, &bp, next_path, children);
                    self.done = true;
                    return Some(Ok(BranchChange {
                        branch_path: bp,
                        paths,
                        revnum,
                    }));
                }
            }

            let touches_branch = changes::changes_path(&paths, &bp, false);
            if let Some((next_path, _)) = next_loc {
                self.branch_path = Some(next_path);
            }
            if touches_branch {
                return Some(Ok(BranchChange {
                    branch_path: bp,
                    paths,
                    revnum,
                }));
            }
        }
        None
    }
}

pub struct ReverseBranchIter<'a> {
    inner: BranchChangeIter<'a>,
    provider: &'a RevisionMetadataProvider,
    metabranch: Rc<RevisionMetadataBranch>,
}

impl<'a> Iterator for ReverseBranchIter<'a> {
    type Item = Result<Rc<RevisionMetadata>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Err(e) => Some(Err(e)),
            Ok(change) => {
                let meta =
                    self.provider
                        .lookup(&change.branch_path, change.revnum, Some(change.paths));
                self.metabranch.append(&meta);
                Some(Ok(meta))
            }
        }
    }
}

pub struct AllChangesIter<'a> {
    inner: ChangeIter<'a>,
    provider: &'a RevisionMetadataProvider,
    layout: &'a dyn Layout,
    pending: VecDeque<Rc<RevisionMetadata>>,
}

impl<'a> Iterator for AllChangesIter<'a> {
    type Item = Result<Rc<RevisionMetadata>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(meta) = self.pending.pop_front() {
                return Some(Ok(meta));
            }
            let (paths, revnum, _revprops) = match self.inner.next()? {
                Ok(step) => step,
                Err(e) => return Some(Err(e)),
            };
            let mut roots = BTreeSet::new();
            for path in paths.keys() {
                if let Ok(class) = self.layout.parse(path) {
                    roots.insert(class.branch_path);
                }
            }
            // A deleted branch root has no revision on the branch; the
            // deletion only shows up in whatever copied from it earlier.
            roots.retain(|root| {
                paths
                    .get(root)
                    .map_or(true, |record| record.action != changes::ChangeAction::Deleted)
            });
            for root in roots {
                self.pending
                    .push_back(self.provider.lookup(&root, revnum, Some(paths.clone())));
            }
        }
    }
}
