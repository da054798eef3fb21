//! Repository facade integration tests

mod common;

use std::sync::Arc;

use common::*;
use svndag::{
    ConfigStore, Error, Mapping, NodeKind, RaTransport, Repository, RepositoryConfig, TrunkLayout,
};
use tempfile::TempDir;

fn open_repo(t: &Arc<MockTransport>, dir: &TempDir, store: ConfigStore) -> Repository {
    let conn = svndag::open_cache(&dir.path().join("cache.db")).unwrap();
    Repository::open(t.clone() as Arc<dyn RaTransport>, conn, store).unwrap()
}

fn plain_store(dir: &TempDir) -> ConfigStore {
    ConfigStore::new(dir.path().join("config.json"))
}

fn mandatory_store(dir: &TempDir, scheme: &str) -> ConfigStore {
    let store = plain_store(dir);
    store
        .save(&RepositoryConfig {
            branching_scheme: Some(scheme.to_string()),
            guessed_branching_scheme: None,
            branching_scheme_mandatory: true,
            use_cache: true,
        })
        .unwrap();
    store
}

fn trunk_mapping() -> Mapping {
    Mapping::V3 {
        layout: Box::new(TrunkLayout::new(0)),
    }
}

/// trunk history plus a branch copied at r5 (latest revision 5)
fn branch_fixture() -> Arc<MockTransport> {
    let t = MockTransport::new();
    t.add_revision(
        changeset(&[add("trunk"), add("trunk/file")]),
        std_revprops("r1"),
    );
    t.add_revision(changeset(&[modify("trunk/file")]), std_revprops("r2"));
    t.add_revision(changeset(&[add("branches")]), std_revprops("r3"));
    t.add_revision(changeset(&[modify("trunk")]), std_revprops("r4"));
    t.add_revision(
        changeset(&[copy("branches/x", "trunk", 4)]),
        std_revprops("r5"),
    );
    t.set_dir("trunk", 4, &[]);
    t.set_dir("branches/x", 5, &[]);
    Arc::new(t)
}

#[test]
fn test_mandatory_config_scheme_wins() {
    let t = branch_fixture();
    let dir = TempDir::new().unwrap();
    // No root directory registered: reading the root property would fail,
    // proving the mandatory scheme short-circuits selection
    let repo = open_repo(&t, &dir, mandatory_store(&dir, "trunk1"));
    assert_eq!(repo.get_layout().unwrap().to_scheme_text(), "trunk1");
}

#[test]
fn test_scheme_from_root_property() {
    let t = branch_fixture();
    t.set_dir("", 5, &[]);
    t.set_dir_props("", 5, props(&[("dvcs:branching-scheme", "trunk0")]));
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, plain_store(&dir));
    assert_eq!(repo.get_layout().unwrap().to_scheme_text(), "trunk0");
}

#[test]
fn test_scheme_guessed_and_persisted_for_large_repo() {
    let t = MockTransport::new();
    for _ in 0..25 {
        t.add_revision(changeset(&[modify("trunk/file")]), std_revprops("work"));
    }
    t.set_dir("", 25, &[]);
    let t = Arc::new(t);
    let dir = TempDir::new().unwrap();
    let store = plain_store(&dir);
    let repo = open_repo(&t, &dir, store.clone());

    assert_eq!(repo.get_layout().unwrap().to_scheme_text(), "trunk0");
    let cfg = store.load().unwrap();
    assert_eq!(cfg.guessed_branching_scheme.as_deref(), Some("trunk0"));
}

#[test]
fn test_scheme_guess_not_persisted_for_tiny_repo() {
    let t = MockTransport::new();
    for _ in 0..3 {
        t.add_revision(changeset(&[modify("trunk/file")]), std_revprops("work"));
    }
    t.set_dir("", 3, &[]);
    let t = Arc::new(t);
    let dir = TempDir::new().unwrap();
    let store = plain_store(&dir);
    let repo = open_repo(&t, &dir, store.clone());

    assert_eq!(repo.get_layout().unwrap().to_scheme_text(), "trunk0");
    assert_eq!(store.load().unwrap().guessed_branching_scheme, None);
}

#[test]
fn test_set_layout_persists_to_config() {
    let t = branch_fixture();
    t.set_dir("", 5, &[]);
    let dir = TempDir::new().unwrap();
    let store = plain_store(&dir);
    {
        let repo = open_repo(&t, &dir, store.clone());
        repo.set_layout(Box::new(TrunkLayout::new(1))).unwrap();
        assert_eq!(repo.get_layout().unwrap().to_scheme_text(), "trunk1");
    }
    assert_eq!(
        store.load().unwrap().branching_scheme.as_deref(),
        Some("trunk1")
    );
    let dir2 = TempDir::new().unwrap();
    let conn = svndag::open_cache(&dir2.path().join("cache.db")).unwrap();
    let repo = Repository::open(t.clone() as Arc<dyn RaTransport>, conn, store).unwrap();
    assert_eq!(repo.get_layout().unwrap().to_scheme_text(), "trunk1");
}

#[test]
fn test_latest_revnum_cached_per_lock_scope() {
    let t = branch_fixture();
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, plain_store(&dir));

    // Unlocked calls always hit the transport
    repo.get_latest_revnum().unwrap();
    repo.get_latest_revnum().unwrap();
    let unlocked = t.latest_calls.get();
    assert_eq!(unlocked, 2);

    repo.lock_read();
    assert_eq!(repo.get_latest_revnum().unwrap(), 5);
    assert_eq!(t.latest_calls.get(), unlocked + 1);
    repo.get_latest_revnum().unwrap();
    assert_eq!(t.latest_calls.get(), unlocked + 1);

    // Nested locks keep the cache alive
    repo.lock_read();
    repo.unlock();
    repo.get_latest_revnum().unwrap();
    assert_eq!(t.latest_calls.get(), unlocked + 1);

    // Closing the outermost scope drops it
    repo.unlock();
    assert!(!repo.is_locked());
    repo.get_latest_revnum().unwrap();
    assert_eq!(t.latest_calls.get(), unlocked + 2);
}

#[test]
fn test_lookup_revision_id() {
    let t = branch_fixture();
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, plain_store(&dir));
    let mapping = trunk_mapping();

    let revid = mapping
        .generate_revision_id(t.uuid(), 5, "branches/x")
        .unwrap();
    let (path, revnum, decoded) = repo.lookup_revision_id(&revid).unwrap();
    assert_eq!(path, "branches/x");
    assert_eq!(revnum, 5);
    assert!(decoded.is_branch(&path));

    let foreign = mapping
        .generate_revision_id("99999999-0000-0000-0000-000000000000", 5, "trunk")
        .unwrap();
    assert!(matches!(
        repo.lookup_revision_id(&foreign),
        Err(Error::NotFound(_))
    ));

    let too_new = mapping.generate_revision_id(t.uuid(), 99, "trunk").unwrap();
    assert!(matches!(
        repo.lookup_revision_id(&too_new),
        Err(Error::NoSuchRevision(99))
    ));
}

#[test]
fn test_revision_parents() {
    let t = branch_fixture();
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, plain_store(&dir));
    let mapping = trunk_mapping();

    let branch_revid = mapping
        .generate_revision_id(t.uuid(), 5, "branches/x")
        .unwrap();
    let parents = repo.revision_parents(&branch_revid).unwrap();
    assert_eq!(
        parents,
        vec![mapping.generate_revision_id(t.uuid(), 4, "trunk").unwrap()]
    );

    // First revision of the lineage folds to empty ancestry
    let first = mapping.generate_revision_id(t.uuid(), 1, "trunk").unwrap();
    // Its branch-property diff needs the root of the branch at r1
    t.set_dir("trunk", 1, &[]);
    assert!(repo.revision_parents(&first).unwrap().is_empty());
}

#[test]
fn test_revision_ancestry_follows_copies() {
    let t = branch_fixture();
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, plain_store(&dir));
    let mapping = trunk_mapping();

    let revid = mapping
        .generate_revision_id(t.uuid(), 5, "branches/x")
        .unwrap();
    let ancestry = repo.revision_ancestry(&revid).unwrap();
    let expected: Vec<String> = [(5, "branches/x"), (4, "trunk"), (2, "trunk"), (1, "trunk")]
        .iter()
        .map(|(revnum, path)| {
            mapping
                .generate_revision_id(t.uuid(), *revnum, path)
                .unwrap()
        })
        .collect();
    assert_eq!(ancestry, expected);
}

#[test]
fn test_all_revision_ids() {
    let t = MockTransport::new();
    t.add_revision(changeset(&[add("trunk")]), std_revprops("r1"));
    t.set_dir("trunk", 1, &[]);
    let t = Arc::new(t);
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, mandatory_store(&dir, "trunk0"));

    let ids = repo.all_revision_ids().unwrap();
    let expected = trunk_mapping()
        .generate_revision_id(t.uuid(), 1, "trunk")
        .unwrap();
    assert_eq!(ids, vec![expected]);
}

#[test]
fn test_find_branchpaths_tracks_creation_and_deletion() {
    let t = MockTransport::new();
    t.add_revision(changeset(&[add("trunk")]), std_revprops("r1"));
    t.add_revision(changeset(&[add("oldstuff")]), std_revprops("r2"));
    // Bulk copy creates a whole branch container in one change record
    t.add_revision(
        changeset(&[copy("branches", "oldstuff", 2)]),
        std_revprops("r3"),
    );
    t.set_dir("branches", 3, &[("y", NodeKind::Dir)]);
    t.add_revision(
        changeset(&[copy("branches/x", "trunk", 3)]),
        std_revprops("r4"),
    );
    t.add_revision(changeset(&[delete("branches/x")]), std_revprops("r5"));
    let t = Arc::new(t);
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, mandatory_store(&dir, "trunk0"));

    let mut found = repo.find_branchpaths(0, 5).unwrap();
    found.sort();
    assert_eq!(
        found,
        vec![
            ("branches/x".to_string(), 4, false),
            ("branches/y".to_string(), 3, true),
            ("trunk".to_string(), 1, true),
        ]
    );
}

#[test]
fn test_signatures_roundtrip_and_downgrade() {
    let t = MockTransport::new();
    t.add_revision(changeset(&[add("trunk")]), std_revprops("r1"));
    t.set_dir("trunk", 1, &[]);
    let t = Arc::new(t);
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir, mandatory_store(&dir, "trunk0"));
    let revid = trunk_mapping()
        .generate_revision_id(t.uuid(), 1, "trunk")
        .unwrap();

    repo.record_signature(&revid, "-----BEGIN PGP SIGNATURE-----")
        .unwrap();
    assert_eq!(
        repo.get_signature(&revid).unwrap().as_deref(),
        Some("-----BEGIN PGP SIGNATURE-----")
    );

    // A server with revision property edits disabled skips silently
    let t = Arc::new(MockTransport::with_revprop_changes(false));
    t.add_revision(changeset(&[add("trunk")]), std_revprops("r1"));
    t.set_dir("trunk", 1, &[]);
    let dir2 = TempDir::new().unwrap();
    let repo = open_repo(&t, &dir2, mandatory_store(&dir2, "trunk0"));
    let revid = trunk_mapping()
        .generate_revision_id(t.uuid(), 1, "trunk")
        .unwrap();
    repo.record_signature(&revid, "sig").unwrap();
    assert_eq!(repo.get_signature(&revid).unwrap(), None);
}
