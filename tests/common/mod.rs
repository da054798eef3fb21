//! In-memory transport for exercising the mapping core without a server
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use svndag::changes::{ChangeAction, ChangeRecord};
use svndag::errors::{Error, Result};
use svndag::{ChangeSet, LogEntry, NodeKind, PropertyMap, RaTransport, Revnum};

/// Scripted repository: revisions are appended up front, directory
/// listings and directory properties are registered per (path, revnum).
pub struct MockTransport {
    uuid: String,
    revisions: RefCell<Vec<(ChangeSet, PropertyMap)>>,
    dirs: RefCell<HashMap<(String, Revnum), BTreeMap<String, NodeKind>>>,
    dir_props: RefCell<HashMap<(String, Revnum), PropertyMap>>,
    allow_revprop_changes: bool,
    pub log_calls: Cell<u32>,
    pub dir_calls: Cell<u32>,
    pub latest_calls: Cell<u32>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_revprop_changes(true)
    }

    pub fn with_revprop_changes(allow: bool) -> Self {
        MockTransport {
            uuid: uuid::Uuid::new_v4().to_string(),
            revisions: RefCell::new(vec![(ChangeSet::new(), PropertyMap::new())]),
            dirs: RefCell::new(HashMap::new()),
            dir_props: RefCell::new(HashMap::new()),
            allow_revprop_changes: allow,
            log_calls: Cell::new(0),
            dir_calls: Cell::new(0),
            latest_calls: Cell::new(0),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn add_revision(&self, changes: ChangeSet, revprops: PropertyMap) -> Revnum {
        let mut revisions = self.revisions.borrow_mut();
        revisions.push((changes, revprops));
        (revisions.len() - 1) as Revnum
    }

    pub fn set_dir(&self, path: &str, revnum: Revnum, entries: &[(&str, NodeKind)]) {
        self.dirs.borrow_mut().insert(
            (path.to_string(), revnum),
            entries
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
        );
    }

    pub fn set_dir_props(&self, path: &str, revnum: Revnum, props: PropertyMap) {
        self.dir_props
            .borrow_mut()
            .insert((path.to_string(), revnum), props);
    }
}

impl RaTransport for MockTransport {
    fn get_uuid(&self) -> Result<String> {
        Ok(self.uuid.clone())
    }

    fn get_latest_revnum(&self) -> Result<Revnum> {
        self.latest_calls.set(self.latest_calls.get() + 1);
        Ok((self.revisions.borrow().len() - 1) as Revnum)
    }

    fn iter_log(
        &self,
        _paths: Option<&[&str]>,
        from_revnum: Revnum,
        to_revnum: Revnum,
        _limit: usize,
        discover_changed_paths: bool,
        _strict_node_history: bool,
        _revprops_of_interest: &[&str],
    ) -> Result<Box<dyn Iterator<Item = Result<LogEntry>> + '_>> {
        self.log_calls.set(self.log_calls.get() + 1);
        let revisions = self.revisions.borrow();
        let latest = (revisions.len() - 1) as Revnum;
        if from_revnum > latest || to_revnum > latest {
            return Err(Error::NoSuchRevision(from_revnum.max(to_revnum)));
        }
        let (low, high) = if from_revnum <= to_revnum {
            (from_revnum, to_revnum)
        } else {
            (to_revnum, from_revnum)
        };
        let mut entries: Vec<Result<LogEntry>> = (low..=high)
            .map(|revnum| {
                let (changes, revprops) = &revisions[revnum as usize];
                Ok(LogEntry {
                    changed_paths: if revnum == 0 || !discover_changed_paths {
                        None
                    } else {
                        Some(changes.clone())
                    },
                    revnum,
                    revprops: revprops.clone(),
                })
            })
            .collect();
        if from_revnum > to_revnum {
            entries.reverse();
        }
        Ok(Box::new(entries.into_iter()))
    }

    fn check_path(&self, path: &str, revnum: Revnum) -> Result<NodeKind> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(NodeKind::Dir);
        }
        if self
            .dirs
            .borrow()
            .contains_key(&(path.to_string(), revnum))
        {
            return Ok(NodeKind::Dir);
        }
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        if let Some(entries) = self.dirs.borrow().get(&(parent.to_string(), revnum)) {
            if let Some(kind) = entries.get(name) {
                return Ok(*kind);
            }
        }
        Ok(NodeKind::Absent)
    }

    fn get_dir(
        &self,
        path: &str,
        revnum: Revnum,
    ) -> Result<(BTreeMap<String, NodeKind>, PropertyMap)> {
        self.dir_calls.set(self.dir_calls.get() + 1);
        let path = path.trim_matches('/').to_string();
        let entries = self
            .dirs
            .borrow()
            .get(&(path.clone(), revnum))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}@{}", path, revnum)))?;
        let props = self
            .dir_props
            .borrow()
            .get(&(path, revnum))
            .cloned()
            .unwrap_or_default();
        Ok((entries, props))
    }

    fn revprop_list(&self, revnum: Revnum) -> Result<PropertyMap> {
        self.revisions
            .borrow()
            .get(revnum as usize)
            .map(|(_changes, revprops)| revprops.clone())
            .ok_or(Error::NoSuchRevision(revnum))
    }

    fn change_rev_prop(&self, revnum: Revnum, name: &str, value: &str) -> Result<()> {
        if !self.allow_revprop_changes {
            return Err(Error::FeatureUnavailable("revision property edits"));
        }
        let mut revisions = self.revisions.borrow_mut();
        let (_changes, revprops) = revisions
            .get_mut(revnum as usize)
            .ok_or(Error::NoSuchRevision(revnum))?;
        revprops.insert(name.to_string(), value.to_string());
        Ok(())
    }
}

pub fn props(entries: &[(&str, &str)]) -> PropertyMap {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

pub fn std_revprops(log: &str) -> PropertyMap {
    props(&[
        ("svn:log", log),
        ("svn:author", "committer"),
        ("svn:date", "2008-01-02T12:30:15.000000Z"),
    ])
}

pub fn changeset(entries: &[(&str, ChangeRecord)]) -> ChangeSet {
    entries
        .iter()
        .map(|(path, record)| (path.to_string(), record.clone()))
        .collect()
}

pub fn add(path: &str) -> (&str, ChangeRecord) {
    (path, ChangeRecord::new(ChangeAction::Added))
}

pub fn modify(path: &str) -> (&str, ChangeRecord) {
    (path, ChangeRecord::new(ChangeAction::Modified))
}

pub fn delete(path: &str) -> (&str, ChangeRecord) {
    (path, ChangeRecord::new(ChangeAction::Deleted))
}

pub fn copy<'a>(path: &'a str, from: &str, from_rev: Revnum) -> (&'a str, ChangeRecord) {
    (path, ChangeRecord::copied(ChangeAction::Added, from, from_rev))
}
