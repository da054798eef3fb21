//! Property names and property-map utilities
//!
//! Three namespaces matter to the mapping layer: the server's own `svn:`
//! properties, the `dvcs:` markers written by round-tripped host-tool
//! commits, and the legacy `svk:merge` merge-tracking property.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{Error, Result};

/// Property name/value map for one revision or one directory
pub type PropertyMap = BTreeMap<String, String>;

/// Standard server-side properties
pub mod svn_props {
    pub const EXECUTABLE: &str = "svn:executable";
    pub const EXECUTABLE_VALUE: &str = "*";
    pub const EXTERNALS: &str = "svn:externals";
    pub const IGNORE: &str = "svn:ignore";
    pub const KEYWORDS: &str = "svn:keywords";
    pub const MIME_TYPE: &str = "svn:mime-type";
    pub const NEEDS_LOCK: &str = "svn:needs-lock";
    pub const SPECIAL: &str = "svn:special";
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    pub const REVISION_LOG: &str = "svn:log";
    pub const REVISION_AUTHOR: &str = "svn:author";
    pub const REVISION_DATE: &str = "svn:date";
}

/// Marker properties written by the host tool when its commits round-trip
/// through the server
pub mod dvcs_props {
    /// Namespace prefix for all host-tool branch properties
    pub const PREFIX: &str = "dvcs:";

    /// Branch property: the branching scheme stored at the repository root
    pub const BRANCHING_SCHEME: &str = "dvcs:branching-scheme";

    /// Branch property prefix: per-mapping revision-id log, one
    /// "<revno> <revid>" line per round-tripped revision
    pub const REVISION_ID_PREFIX: &str = "dvcs:revision-id:";

    /// Branch property prefix: per-mapping ancestry log, each line
    /// "<lhs-parent-id>[ <merged-id>...]"
    pub const ANCESTRY_PREFIX: &str = "dvcs:ancestry:";

    /// Revision property: mapping codec version used for the commit
    pub const REVPROP_MAPPING_VERSION: &str = "dvcs:mapping-version";

    /// Revision property: explicit left-hand parent identifier
    pub const REVPROP_BASE_REVISION: &str = "dvcs:base-revision";

    /// Revision property: newline-separated merged revision identifiers
    pub const REVPROP_MERGE: &str = "dvcs:merge";

    /// Revision property: revision was committed server-side on purpose,
    /// never treat it as a host-tool revision
    pub const REVPROP_SKIP: &str = "dvcs:skip";

    /// Revision property: detached revision signature
    pub const REVPROP_SIGNATURE: &str = "dvcs:gpg-signature";
}

/// Legacy svk merge-tracking property on branch roots
pub const SVK_MERGE: &str = "svk:merge";

/// Validate a property name the way the server does
pub fn is_valid_property_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == ':' || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '.' | '_'))
}

/// Compute the properties that changed between two property maps.
///
/// Returns the entries of `current` that are new or carry a different
/// value than in `previous`. Removed properties do not appear; callers
/// only ever look for newly-set marker values.
pub fn diff(current: &PropertyMap, previous: &PropertyMap) -> PropertyMap {
    current
        .iter()
        .filter(|(name, value)| previous.get(*name) != Some(value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Format a microsecond timestamp as an svn:date string
pub fn time_to_cstring(micros: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default();
    dt.format("%Y-%m-%dT%H:%M:%S.%6fZ").to_string()
}

/// Parse an svn:date string into microseconds since the epoch
pub fn time_from_cstring(text: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.fZ").map_err(|e| {
        Error::InvalidPropertyValue {
            name: svn_props::REVISION_DATE.to_string(),
            reason: format!("'{}': {}", text, e),
        }
    })?;
    Ok(naive.and_utc().timestamp_micros())
}

/// A property map with a pre-seeded portion and a deferred full fetch.
///
/// Lookups hit the seeded entries first; the full map is populated at most
/// once, only when a lookup misses or the whole map is demanded.
pub struct LazyPropertyMap {
    initial: PropertyMap,
    rest: RefCell<Option<PropertyMap>>,
    load: Box<dyn Fn() -> Result<PropertyMap>>,
}

impl LazyPropertyMap {
    pub fn new(initial: PropertyMap, load: impl Fn() -> Result<PropertyMap> + 'static) -> Self {
        LazyPropertyMap {
            initial,
            rest: RefCell::new(None),
            load: Box::new(load),
        }
    }

    /// Wrap an already-complete map; no deferred fetch will ever run
    pub fn complete(map: PropertyMap) -> Self {
        LazyPropertyMap {
            initial: map,
            rest: RefCell::new(Some(PropertyMap::new())),
            load: Box::new(|| Ok(PropertyMap::new())),
        }
    }

    /// Whether the deferred portion has been populated
    pub fn is_loaded(&self) -> bool {
        self.rest.borrow().is_some()
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.rest.borrow().is_none() {
            let loaded = (self.load)()?;
            *self.rest.borrow_mut() = Some(loaded);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<String>> {
        if let Some(value) = self.initial.get(name) {
            return Ok(Some(value.clone()));
        }
        self.ensure_loaded()?;
        Ok(self
            .rest
            .borrow()
            .as_ref()
            .and_then(|m| m.get(name).cloned()))
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_some())
    }

    /// Force the full map; seeded entries win over fetched ones
    pub fn all(&self) -> Result<PropertyMap> {
        self.ensure_loaded()?;
        let mut map = self.rest.borrow().clone().unwrap_or_default();
        for (name, value) in &self.initial {
            map.insert(name.clone(), value.clone());
        }
        Ok(map)
    }
}

impl fmt::Debug for LazyPropertyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyPropertyMap")
            .field("initial", &self.initial)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
