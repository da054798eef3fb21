//! Subversion-to-DAG metadata mapping core
//!
//! Maps a Subversion repository's linear, path-based history onto the
//! revision DAG of a distributed version control tool:
//! - Change-path model and per-revision change-sets
//! - Persistent SQLite log cache and cached log walker
//! - Branching-scheme layouts (trunk convention, wildcard patterns, root)
//! - Stable revision identifier codecs (v3 scheme-tagged, v4 scheme-free)
//! - Lazy per-revision metadata with DAG parentage recovery
//! - Repository facade with branch discovery and layout selection

pub mod changes;
pub mod config;
pub mod errors;
pub mod layout;
pub mod logcache;
pub mod logwalker;
pub mod mapping;
pub mod properties;
pub mod repository;
pub mod revmeta;
pub mod transport;

pub use changes::{ChangeAction, ChangeRecord, ChangeSet};
pub use config::{ConfigStore, RepositoryConfig};
pub use errors::{Error, Result};
pub use layout::{Layout, PathClass, PathKind, RootLayout, TrunkLayout, WildcardLayout};
pub use logcache::{open_cache, LogCache};
pub use logwalker::LogWalker;
pub use mapping::{parse_revision_id, Mapping};
pub use properties::{LazyPropertyMap, PropertyMap};
pub use repository::Repository;
pub use revmeta::{RevisionMetadata, RevisionMetadataBranch, RevisionMetadataProvider};
pub use transport::{BranchPropertyProvider, LogEntry, NodeKind, RaTransport, Revnum};
