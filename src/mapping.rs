//! Revision identifier codecs
//!
//! Converts between the server's (uuid, branch path, revision number)
//! coordinates and stable opaque revision identifiers. Two encodings are
//! in circulation: v3 carries the branching-scheme tag in its prefix, v4
//! is scheme-free. Decoders stay supported forever; identifiers already
//! issued must keep resolving.

use sha1::{Digest, Sha1};

use crate::errors::{Error, Result};
use crate::layout::{guess_scheme_from_branch_path, parse_scheme_text, Layout};
use crate::properties::{dvcs_props, PropertyMap, SVK_MERGE};
use crate::transport::Revnum;

pub const MAPPING_V3_PREFIX: &str = "svn-v3-";
pub const MAPPING_V4_PREFIX: &str = "svn-v4:";

/// Escape a repository path so it cannot contain the identifier field
/// separator. Reversible via [`unescape_path`].
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub fn unescape_path(escaped: &str) -> Result<String> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut input = escaped.bytes();
    while let Some(b) = input.next() {
        if b == b'%' {
            let hi = input.next();
            let lo = input.next();
            let pair = match (hi, lo) {
                (Some(h), Some(l)) => [h, l],
                _ => {
                    return Err(Error::malformed_id(escaped, "truncated escape sequence"));
                }
            };
            let text = std::str::from_utf8(&pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            match text {
                Some(byte) => bytes.push(byte),
                None => return Err(Error::malformed_id(escaped, "invalid escape sequence")),
            }
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).map_err(|_| Error::malformed_id(escaped, "escaped path is not UTF-8"))
}

/// A revision identifier codec version
#[derive(Debug, Clone)]
pub enum Mapping {
    /// Scheme-tagged encoding from the branch-property era
    V3 { layout: Box<dyn Layout> },
    /// Scheme-free encoding relying on revision properties
    V4,
}

impl Mapping {
    pub fn default_for(layout: Box<dyn Layout>) -> Self {
        Mapping::V3 { layout }
    }

    /// Short name used to key per-mapping branch properties
    pub fn name(&self) -> String {
        match self {
            Mapping::V3 { layout } => format!("v3-{}", layout.to_scheme_text()),
            Mapping::V4 => "v4".to_string(),
        }
    }

    /// Whether this codec's layout accepts `path` as a branch root
    pub fn is_branch(&self, path: &str) -> bool {
        match self {
            Mapping::V3 { layout } => layout.is_branch(path),
            Mapping::V4 => true,
        }
    }

    /// Whether this codec's layout accepts `path` as a tag root
    pub fn is_tag(&self, path: &str) -> bool {
        match self {
            Mapping::V3 { layout } => layout.is_tag(path),
            Mapping::V4 => false,
        }
    }

    /// Encode a foreign revision coordinate as a stable identifier.
    ///
    /// Distinct (uuid, path, revnum, scheme) tuples never collide; only
    /// the root path is valid at revision 0.
    pub fn generate_revision_id(&self, uuid: &str, revnum: Revnum, path: &str) -> Result<String> {
        let path = path.trim_matches('/');
        if revnum == 0 && !path.is_empty() {
            return Err(Error::malformed_id(
                format!("{}@0", path),
                "only the repository root exists at revision 0",
            ));
        }
        Ok(match self {
            Mapping::V3 { layout } => format!(
                "{}{}:{}:{}:{}",
                MAPPING_V3_PREFIX,
                layout.to_scheme_text(),
                uuid,
                escape_path(path),
                revnum
            ),
            Mapping::V4 => format!("{}{}:{}:{}", MAPPING_V4_PREFIX, uuid, escape_path(path), revnum),
        })
    }
}

/// Decode a revision identifier into (uuid, branch path, revnum, codec).
///
/// Legacy v3 identifiers whose scheme tag is the literal `undefined` have
/// the scheme re-inferred from the branch path; that inference is a
/// documented best effort and may not reproduce the encoder's scheme.
pub fn parse_revision_id(revid: &str) -> Result<(String, String, Revnum, Mapping)> {
    if let Some(rest) = revid.strip_prefix(MAPPING_V3_PREFIX) {
        let fields: Vec<&str> = rest.split(':').collect();
        if fields.len() != 4 {
            return Err(Error::malformed_id(revid, "expected 4 colon-separated fields"));
        }
        let (scheme_tag, uuid, escaped_path, revnum_text) =
            (fields[0], fields[1], fields[2], fields[3]);
        let path = unescape_path(escaped_path)?;
        let revnum: Revnum = revnum_text
            .parse()
            .map_err(|_| Error::malformed_id(revid, "revision number is not an integer"))?;
        if revnum == 0 && !path.is_empty() {
            return Err(Error::malformed_id(revid, "non-root path at revision 0"));
        }
        let layout = if scheme_tag == "undefined" {
            guess_scheme_from_branch_path(&path)
        } else {
            parse_scheme_text(scheme_tag)
                .map_err(|_| Error::malformed_id(revid, format!("unknown scheme tag '{}'", scheme_tag)))?
        };
        return Ok((uuid.to_string(), path, revnum, Mapping::V3 { layout }));
    }
    if let Some(rest) = revid.strip_prefix(MAPPING_V4_PREFIX) {
        let fields: Vec<&str> = rest.split(':').collect();
        if fields.len() != 3 {
            return Err(Error::malformed_id(revid, "expected 3 colon-separated fields"));
        }
        let path = unescape_path(fields[1])?;
        let revnum: Revnum = fields[2]
            .parse()
            .map_err(|_| Error::malformed_id(revid, "revision number is not an integer"))?;
        if revnum == 0 && !path.is_empty() {
            return Err(Error::malformed_id(revid, "non-root path at revision 0"));
        }
        return Ok((fields[0].to_string(), path, revnum, Mapping::V4));
    }
    Err(Error::malformed_id(revid, "unknown identifier version prefix"))
}

/// Stable file id for a path inside a branch at a revision; overlong ids
/// fall back to a digest of the path
pub fn generate_file_id(uuid: &str, revnum: Revnum, branch: &str, inv_path: &str) -> String {
    let full = format!(
        "{}@{}:{}:{}",
        revnum,
        uuid,
        escape_path(branch),
        escape_path(inv_path)
    );
    if full.len() <= 150 {
        return full;
    }
    let digest = hex::encode(Sha1::digest(inv_path.as_bytes()));
    format!("{}@{}:{};{}", revnum, uuid, escape_path(branch), digest)
}

/// Marker check against revision properties: cheap when the server
/// already delivered them. `None` means the properties are inconclusive.
pub fn is_native_revision_revprops(revprops: &PropertyMap) -> Option<bool> {
    if revprops.contains_key(dvcs_props::REVPROP_MAPPING_VERSION) {
        return Some(true);
    }
    if revprops.contains_key(dvcs_props::REVPROP_SKIP) {
        return Some(false);
    }
    None
}

/// Marker check against changed branch properties
pub fn is_native_revision_fileprops(changed_fileprops: &PropertyMap) -> Option<bool> {
    if changed_fileprops
        .keys()
        .any(|name| name.starts_with(dvcs_props::PREFIX))
    {
        return Some(true);
    }
    None
}

/// Estimate how many ancestors with host-tool branch properties a
/// revision has, from the per-mapping revision-id logs
pub fn estimate_native_ancestors(fileprops: &PropertyMap) -> usize {
    fileprops
        .iter()
        .filter(|(name, _)| name.starts_with(dvcs_props::REVISION_ID_PREFIX))
        .map(|(_, value)| value.lines().count())
        .max()
        .unwrap_or(0)
}

/// Estimate how many svk-merged ancestors a revision has
pub fn estimate_svk_ancestors(fileprops: &PropertyMap) -> usize {
    fileprops
        .get(SVK_MERGE)
        .map(|value| value.lines().count())
        .unwrap_or(0)
}

/// Explicit left-hand parent recorded by a round-tripped commit, if any
pub fn get_lhs_parent_hint(
    mapping_name: &str,
    revprops: &PropertyMap,
    changed_fileprops: &PropertyMap,
) -> Option<String> {
    if let Some(base) = revprops.get(dvcs_props::REVPROP_BASE_REVISION) {
        return Some(base.clone());
    }
    let ancestry = changed_fileprops.get(&format!("{}{}", dvcs_props::ANCESTRY_PREFIX, mapping_name))?;
    let last = ancestry.lines().last()?;
    last.split_whitespace().next().map(str::to_string)
}

/// Merge parents recorded by a round-tripped commit
pub fn get_rhs_parents(
    mapping_name: &str,
    revprops: &PropertyMap,
    changed_fileprops: &PropertyMap,
) -> Vec<String> {
    if let Some(merged) = revprops.get(dvcs_props::REVPROP_MERGE) {
        return merged
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }
    let name = format!("{}{}", dvcs_props::ANCESTRY_PREFIX, mapping_name);
    match changed_fileprops.get(&name).and_then(|v| v.lines().last()) {
        Some(last) => last.split_whitespace().skip(1).map(str::to_string).collect(),
        None => vec![],
    }
}

/// Parse one svk merge feature: `<uuid>:/<path>:<revnum>`
pub fn parse_svk_feature(feature: &str) -> Result<(String, String, Revnum)> {
    let bad = |reason: &str| Error::InvalidPropertyValue {
        name: SVK_MERGE.to_string(),
        reason: format!("'{}': {}", feature, reason),
    };
    let (uuid, rest) = feature.split_once(':').ok_or_else(|| bad("missing path"))?;
    let (path, revnum_text) = rest.rsplit_once(':').ok_or_else(|| bad("missing revision"))?;
    if !path.starts_with('/') {
        return Err(bad("path must be absolute"));
    }
    let revnum: Revnum = revnum_text.parse().map_err(|_| bad("bad revision number"))?;
    Ok((uuid.to_string(), path.trim_matches('/').to_string(), revnum))
}

/// Features present in `current` but not in `previous`
pub fn svk_features_merged_since(current: &str, previous: &str) -> Vec<String> {
    let seen: std::collections::HashSet<&str> = previous.lines().collect();
    current
        .lines()
        .filter(|line| !line.is_empty() && !seen.contains(line))
        .map(str::to_string)
        .collect()
}

/// Map an svk merge feature to a revision identifier.
///
/// Features pointing at paths the mapping does not classify as a branch
/// or tag are dropped silently; unparseable features likewise.
pub fn svk_feature_to_revision_id(feature: &str, mapping: &Mapping) -> Result<Option<String>> {
    let (uuid, path, revnum) = match parse_svk_feature(feature) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(None),
    };
    if !mapping.is_branch(&path) && !mapping.is_tag(&path) {
        return Ok(None);
    }
    mapping.generate_revision_id(&uuid, revnum, &path).map(Some)
}
