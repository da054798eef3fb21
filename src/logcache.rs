//! Persistent cache of the remote history log
//!
//! Append-only SQLite store of per-revision change-sets and revision
//! properties. Revisions are immutable once the server assigns them, so
//! the cache is only ever extended, never rewritten. Writes are batched
//! into explicit transactions; on a crash the fetch simply resumes from
//! the last durably committed revision.

use rusqlite::{params, Connection, OptionalExtension};
use std::cell::Cell;
use std::rc::Rc;

use crate::changes::{ChangeAction, ChangeRecord, ChangeSet};
use crate::errors::{Error, Result};
use crate::properties::PropertyMap;
use crate::transport::Revnum;

/// Bump when the table layout changes; a mismatch triggers a full rebuild
const CACHE_SCHEMA_VERSION: i32 = 1;

/// Commit the write transaction every this many recorded revisions
const COMMIT_INTERVAL: u64 = 1000;

/// Open a cache database connection with the pragmas this store expects
pub fn open_cache(path: &std::path::Path) -> Result<Rc<Connection>> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(Rc::new(conn))
}

/// SQLite-backed log cache
///
/// The connection handle is shared explicitly: several repository facades
/// pointed at the same repository identity may clone the same `Rc`.
pub struct LogCache {
    conn: Rc<Connection>,
    in_txn: Cell<bool>,
    pending: Cell<u64>,
}

impl LogCache {
    pub fn new(conn: Rc<Connection>) -> Result<Self> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version != 0 && version != CACHE_SCHEMA_VERSION {
            tracing::info!(
                found = version,
                expected = CACHE_SCHEMA_VERSION,
                "incompatible log cache schema, rebuilding"
            );
            conn.execute_batch(
                "DROP TABLE IF EXISTS changed_path;
                 DROP TABLE IF EXISTS revprop;",
            )?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS changed_path(
                rev INTEGER NOT NULL,
                path TEXT NOT NULL,
                action TEXT NOT NULL,
                copyfrom_path TEXT,
                copyfrom_rev INTEGER,
                PRIMARY KEY (rev, path)
             ) WITHOUT ROWID;
             CREATE TABLE IF NOT EXISTS revprop(
                rev INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (rev, name)
             ) WITHOUT ROWID;",
        )?;
        conn.pragma_update(None, "user_version", CACHE_SCHEMA_VERSION)?;
        Ok(LogCache {
            conn,
            in_txn: Cell::new(false),
            pending: Cell::new(0),
        })
    }

    /// Highest revision for which change data has been recorded
    pub fn high_water_mark(&self) -> Result<Revnum> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(rev) FROM changed_path", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0) as Revnum)
    }

    /// Record the change-set of one revision.
    ///
    /// Upsert semantics: re-recording an already-cached revision is
    /// harmless (last write wins, and foreign revisions never change).
    pub fn record_changes(&self, revnum: Revnum, changes: &ChangeSet) -> Result<()> {
        if !self.in_txn.get() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_txn.set(true);
        }
        let mut stmt = self.conn.prepare_cached(
            "REPLACE INTO changed_path (rev, path, action, copyfrom_path, copyfrom_rev)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (path, record) in changes {
            let (copyfrom_path, copyfrom_rev) = match &record.copyfrom {
                Some((p, r)) => (Some(p.as_str()), Some(*r as i64)),
                None => (None, None),
            };
            stmt.execute(params![
                revnum as i64,
                path,
                record.action.as_char().to_string(),
                copyfrom_path,
                copyfrom_rev,
            ])?;
        }
        let pending = self.pending.get() + 1;
        self.pending.set(pending);
        if pending % COMMIT_INTERVAL == 0 {
            self.flush()?;
        }
        Ok(())
    }

    /// Record revision properties alongside the change data
    pub fn record_properties(&self, revnum: Revnum, props: &PropertyMap) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("REPLACE INTO revprop (rev, name, value) VALUES (?1, ?2, ?3)")?;
        for (name, value) in props {
            stmt.execute(params![revnum as i64, name, value])?;
        }
        Ok(())
    }

    /// Commit any batched writes
    pub fn flush(&self) -> Result<()> {
        if self.in_txn.get() {
            self.conn.execute_batch("COMMIT")?;
            self.in_txn.set(false);
        }
        Ok(())
    }

    /// Change-set recorded for `revnum` (empty if the revision touched
    /// nothing, e.g. a property-only commit)
    pub fn get_changes(&self, revnum: Revnum) -> Result<ChangeSet> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT path, action, copyfrom_path, copyfrom_rev
             FROM changed_path WHERE rev = ?1",
        )?;
        let mut rows = stmt.query(params![revnum as i64])?;
        let mut changes = ChangeSet::new();
        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            let action_text: String = row.get(1)?;
            let copyfrom_path: Option<String> = row.get(2)?;
            let copyfrom_rev: Option<i64> = row.get(3)?;
            let action = action_text
                .chars()
                .next()
                .and_then(ChangeAction::from_char)
                .ok_or_else(|| Error::Transport(format!("corrupt cached action '{}'", action_text)))?;
            let copyfrom = match (copyfrom_path, copyfrom_rev) {
                (Some(p), Some(r)) => Some((p, r as Revnum)),
                _ => None,
            };
            changes.insert(path, ChangeRecord { action, copyfrom });
        }
        Ok(changes)
    }

    /// Cached revision properties, if any were recorded for `revnum`
    pub fn get_properties(&self, revnum: Revnum) -> Result<Option<PropertyMap>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, value FROM revprop WHERE rev = ?1")?;
        let mut rows = stmt.query(params![revnum as i64])?;
        let mut props = PropertyMap::new();
        while let Some(row) = rows.next()? {
            props.insert(row.get(0)?, row.get(1)?);
        }
        if props.is_empty() {
            // Indistinguishable from "never fetched"; real revisions
            // always carry at least svn:date, so a refetch is cheap and rare
            Ok(None)
        } else {
            Ok(Some(props))
        }
    }

    /// Latest cached revision at or below `revnum` touching `path`, a
    /// descendant of it, or replacing it via an ancestor copy
    pub fn find_latest_change(&self, path: &str, revnum: Revnum) -> Result<Option<Revnum>> {
        let row: Option<i64> = if path.is_empty() {
            self.conn
                .query_row(
                    "SELECT rev FROM changed_path WHERE rev <= ?1 ORDER BY rev DESC LIMIT 1",
                    params![revnum as i64],
                    |r| r.get(0),
                )
                .optional()?
        } else {
            // Paths are arbitrary text; the ancestor arm compares prefixes
            // with substr so stored '%'/'_' stay literal too.
            self.conn
                .query_row(
                    "SELECT rev FROM changed_path
                     WHERE (path = ?1
                            OR path LIKE ?2 ESCAPE '\\'
                            OR (substr(?1, 1, length(path) + 1) = path || '/'
                                AND action IN ('A', 'R')))
                       AND rev <= ?3
                     ORDER BY rev DESC LIMIT 1",
                    params![path, format!("{}/%", escape_like(path)), revnum as i64],
                    |r| r.get(0),
                )
                .optional()?
        };
        Ok(row.map(|r| r as Revnum))
    }
}

/// Quote LIKE metacharacters so a path matches itself and nothing else
fn escape_like(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::root_changeset;

    fn fresh() -> LogCache {
        LogCache::new(Rc::new(Connection::open_in_memory().unwrap())).unwrap()
    }

    fn changeset(entries: &[(&str, ChangeRecord)]) -> ChangeSet {
        entries
            .iter()
            .map(|(p, r)| (p.to_string(), r.clone()))
            .collect()
    }

    #[test]
    fn test_high_water_mark_starts_at_zero() {
        let cache = fresh();
        assert_eq!(cache.high_water_mark().unwrap(), 0);
    }

    #[test]
    fn test_record_and_read_changes() {
        let cache = fresh();
        let changes = changeset(&[
            ("trunk", ChangeRecord::new(ChangeAction::Modified)),
            (
                "branches/x",
                ChangeRecord::copied(ChangeAction::Added, "trunk", 4),
            ),
        ]);
        cache.record_changes(5, &changes).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.get_changes(5).unwrap(), changes);
        assert_eq!(cache.high_water_mark().unwrap(), 5);
    }

    #[test]
    fn test_rerecording_is_idempotent() {
        let cache = fresh();
        let changes = changeset(&[("trunk", ChangeRecord::new(ChangeAction::Modified))]);
        cache.record_changes(3, &changes).unwrap();
        cache.record_changes(3, &changes).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.get_changes(3).unwrap(), changes);
    }

    #[test]
    fn test_properties_roundtrip() {
        let cache = fresh();
        let mut props = PropertyMap::new();
        props.insert("svn:log".into(), "first".into());
        props.insert("svn:date".into(), "2008-01-02T12:30:15.000000Z".into());
        cache.record_properties(1, &props).unwrap();
        assert_eq!(cache.get_properties(1).unwrap(), Some(props));
        assert_eq!(cache.get_properties(2).unwrap(), None);
    }

    #[test]
    fn test_find_latest_change_matches_descendants_and_root() {
        let cache = fresh();
        cache.record_changes(0, &root_changeset()).unwrap();
        cache
            .record_changes(
                2,
                &changeset(&[("trunk/foo", ChangeRecord::new(ChangeAction::Added))]),
            )
            .unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.find_latest_change("trunk", 5).unwrap(), Some(2));
        assert_eq!(cache.find_latest_change("trunk/foo", 5).unwrap(), Some(2));
        assert_eq!(cache.find_latest_change("", 5).unwrap(), Some(2));
        assert_eq!(cache.find_latest_change("elsewhere", 5).unwrap(), None);
    }

    #[test]
    fn test_find_latest_change_sees_ancestor_copy() {
        let cache = fresh();
        cache
            .record_changes(
                5,
                &changeset(&[(
                    "branches/x",
                    ChangeRecord::copied(ChangeAction::Added, "trunk", 4),
                )]),
            )
            .unwrap();
        cache.flush().unwrap();
        // The file below the copied root was replaced by the copy
        assert_eq!(cache.find_latest_change("branches/x/foo", 6).unwrap(), Some(5));
    }

    #[test]
    fn test_find_latest_change_keeps_metacharacters_literal() {
        let cache = fresh();
        cache
            .record_changes(
                2,
                &changeset(&[("trunk/foo", ChangeRecord::new(ChangeAction::Added))]),
            )
            .unwrap();
        cache
            .record_changes(
                3,
                &changeset(&[("odd%name/file", ChangeRecord::new(ChangeAction::Added))]),
            )
            .unwrap();
        cache
            .record_changes(
                4,
                &changeset(&[(
                    "br_x",
                    ChangeRecord::copied(ChangeAction::Added, "trunk", 3),
                )]),
            )
            .unwrap();
        cache.flush().unwrap();
        // '_' and '%' in the queried path must not act as wildcards
        assert_eq!(cache.find_latest_change("tr_nk", 5).unwrap(), None);
        assert_eq!(cache.find_latest_change("%", 5).unwrap(), None);
        // A path that really contains one still matches itself
        assert_eq!(cache.find_latest_change("odd%name", 5).unwrap(), Some(3));
        // Stored '_' in the ancestor-copy arm stays literal as well
        assert_eq!(cache.find_latest_change("brax/foo", 5).unwrap(), None);
        assert_eq!(cache.find_latest_change("br_x/foo", 5).unwrap(), Some(4));
    }

    #[test]
    fn test_schema_rebuild_on_version_mismatch() {
        let conn = Rc::new(Connection::open_in_memory().unwrap());
        {
            let cache = LogCache::new(conn.clone()).unwrap();
            cache
                .record_changes(1, &changeset(&[("a", ChangeRecord::new(ChangeAction::Added))]))
                .unwrap();
            cache.flush().unwrap();
        }
        conn.pragma_update(None, "user_version", 99).unwrap();
        let cache = LogCache::new(conn).unwrap();
        assert_eq!(cache.high_water_mark().unwrap(), 0);
    }
}
