//! Repository layouts: classifying paths as branches and tags
//!
//! A layout is a pure policy over repository paths. Three strategies are
//! provided: the whole-repository-is-one-branch layout, the
//! trunk/branches/tags convention at a fixed project depth, and an
//! explicit pattern list with wildcard segments. Layouts serialize to a
//! short text form so the chosen scheme can be stored in repository
//! configuration or in a repository-root property.

use std::collections::HashMap;
use std::fmt;

use crate::changes::ChangeSet;
use crate::errors::{Error, Result};
use crate::transport::{NodeKind, RaTransport, Revnum};

/// How many trailing revisions to sample when guessing a scheme
pub const SCHEME_GUESS_SAMPLE_SIZE: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Branch,
    Tag,
}

/// Result of classifying a repository path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathClass {
    pub kind: PathKind,
    /// Project prefix the branch belongs to ("" for single-project repos)
    pub project: String,
    /// The branch or tag root
    pub branch_path: String,
    /// Remainder of the path inside the branch
    pub inside: String,
}

/// Policy classifying repository paths into branch roots, tag roots and
/// everything else, and enumerating the roots that exist at a revision.
pub trait Layout: fmt::Debug {
    /// Classify a path. Fails with `InvalidBranchPath` when the path is
    /// not inside any branch or tag this layout recognizes.
    fn parse(&self, path: &str) -> Result<PathClass>;

    /// Short text form, parseable by [`parse_scheme_text`]
    fn to_scheme_text(&self) -> String;

    /// True if some descendant of `path` could be a branch root
    fn is_branch_parent(&self, path: &str) -> bool;

    /// True if some descendant of `path` could be a tag root
    fn is_tag_parent(&self, path: &str) -> bool;

    /// Branch roots existing at `revnum` as (project, branch path) pairs
    fn get_branches(
        &self,
        transport: &dyn RaTransport,
        revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>>;

    /// Tag roots existing at `revnum` as (project, tag path) pairs
    fn get_tags(
        &self,
        transport: &dyn RaTransport,
        revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>>;

    /// Path at which a branch with this name would live, if the layout
    /// prescribes one
    fn get_branch_path(&self, name: &str, project: &str) -> Option<String>;

    /// Path at which a tag with this name would live
    fn get_tag_path(&self, name: &str, project: &str) -> Option<String>;

    fn clone_box(&self) -> Box<dyn Layout>;

    fn is_branch(&self, path: &str) -> bool {
        matches!(self.parse(path),
                 Ok(c) if c.kind == PathKind::Branch && c.inside.is_empty())
    }

    fn is_tag(&self, path: &str) -> bool {
        matches!(self.parse(path),
                 Ok(c) if c.kind == PathKind::Tag && c.inside.is_empty())
    }

    fn is_branch_or_tag(&self, path: &str) -> bool {
        self.is_branch(path) || self.is_tag(path)
    }

    fn is_branch_or_tag_parent(&self, path: &str) -> bool {
        self.is_branch_parent(path) || self.is_tag_parent(path)
    }

    /// Tag name for a tag root path
    fn get_tag_name(&self, path: &str) -> Option<String> {
        path.rsplit('/').next().map(str::to_string)
    }
}

impl Clone for Box<dyn Layout> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// The whole repository is a single branch rooted at ""
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout;

impl Layout for RootLayout {
    fn parse(&self, path: &str) -> Result<PathClass> {
        Ok(PathClass {
            kind: PathKind::Branch,
            project: String::new(),
            branch_path: String::new(),
            inside: path.trim_matches('/').to_string(),
        })
    }

    fn to_scheme_text(&self) -> String {
        "root".to_string()
    }

    fn is_branch_parent(&self, _path: &str) -> bool {
        false
    }

    fn is_tag_parent(&self, _path: &str) -> bool {
        false
    }

    fn get_branches(
        &self,
        _transport: &dyn RaTransport,
        _revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        if matches!(project, Some(p) if !p.is_empty()) {
            return Ok(vec![]);
        }
        Ok(vec![(String::new(), String::new())])
    }

    fn get_tags(
        &self,
        _transport: &dyn RaTransport,
        _revnum: Revnum,
        _project: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        Ok(vec![])
    }

    fn get_branch_path(&self, _name: &str, _project: &str) -> Option<String> {
        Some(String::new())
    }

    fn get_tag_path(&self, _name: &str, _project: &str) -> Option<String> {
        None
    }

    fn clone_box(&self) -> Box<dyn Layout> {
        Box::new(self.clone())
    }
}

/// The trunk/branches/tags convention, with project directories nested
/// `level` segments deep (`level` 0: `trunk`, `branches/x`; level 1:
/// `project/trunk`, `project/branches/x`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkLayout {
    pub level: usize,
}

impl TrunkLayout {
    pub fn new(level: usize) -> Self {
        TrunkLayout { level }
    }

    fn branch_patterns(&self) -> Vec<String> {
        let prefix = "*/".repeat(self.level);
        vec![format!("{}trunk", prefix), format!("{}branches/*", prefix)]
    }

    fn tag_patterns(&self) -> Vec<String> {
        vec![format!("{}tags/*", "*/".repeat(self.level))]
    }
}

impl Layout for TrunkLayout {
    fn parse(&self, path: &str) -> Result<PathClass> {
        let path = path.trim_matches('/');
        let parts = split_path(path);
        if parts.len() > self.level && parts[self.level] == "trunk" {
            return Ok(PathClass {
                kind: PathKind::Branch,
                project: parts[..self.level].join("/"),
                branch_path: parts[..=self.level].join("/"),
                inside: parts[self.level + 1..].join("/"),
            });
        }
        if parts.len() > self.level + 1
            && (parts[self.level] == "branches" || parts[self.level] == "tags")
        {
            let kind = if parts[self.level] == "tags" {
                PathKind::Tag
            } else {
                PathKind::Branch
            };
            return Ok(PathClass {
                kind,
                project: parts[..self.level].join("/"),
                branch_path: parts[..=self.level + 1].join("/"),
                inside: parts[self.level + 2..].join("/"),
            });
        }
        Err(Error::InvalidBranchPath(path.to_string()))
    }

    fn to_scheme_text(&self) -> String {
        format!("trunk{}", self.level)
    }

    fn is_branch_parent(&self, path: &str) -> bool {
        let parts = split_path(path);
        parts.len() <= self.level
            || (parts.len() == self.level + 1 && parts[self.level] == "branches")
    }

    fn is_tag_parent(&self, path: &str) -> bool {
        let parts = split_path(path);
        parts.len() <= self.level
            || (parts.len() == self.level + 1 && parts[self.level] == "tags")
    }

    fn get_branches(
        &self,
        transport: &dyn RaTransport,
        revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        expand_root_paths(self, &self.branch_patterns(), transport, revnum, project, true)
    }

    fn get_tags(
        &self,
        transport: &dyn RaTransport,
        revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        expand_root_paths(self, &self.tag_patterns(), transport, revnum, project, false)
    }

    fn get_branch_path(&self, name: &str, project: &str) -> Option<String> {
        let joined = if name == "trunk" {
            join_path(project, "trunk")
        } else {
            join_path(&join_path(project, "branches"), name)
        };
        Some(joined)
    }

    fn get_tag_path(&self, name: &str, project: &str) -> Option<String> {
        Some(join_path(&join_path(project, "tags"), name))
    }

    fn clone_box(&self) -> Box<dyn Layout> {
        Box::new(self.clone())
    }
}

/// Explicit branch/tag root patterns, each a slash-separated template
/// where `*` matches exactly one path segment. A literal `trunk` pattern
/// serves as the conventional extra branch alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardLayout {
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

impl WildcardLayout {
    pub fn new(branches: Vec<String>, tags: Vec<String>) -> Self {
        WildcardLayout {
            branches: branches
                .into_iter()
                .map(|p| p.trim_matches('/').to_string())
                .collect(),
            tags: tags
                .into_iter()
                .map(|p| p.trim_matches('/').to_string())
                .collect(),
        }
    }

    /// Match the first `n` segments of `parts` against `pattern`,
    /// where `n` is the pattern's segment count
    fn match_prefix(pattern: &str, parts: &[&str]) -> Option<usize> {
        let pattern_parts = split_path(pattern);
        if parts.len() < pattern_parts.len() {
            return None;
        }
        for (pat, part) in pattern_parts.iter().zip(parts) {
            if *pat != "*" && pat != part {
                return None;
            }
        }
        Some(pattern_parts.len())
    }

    /// Project prefix for a matched root: everything before the
    /// branches/tags/trunk segment
    fn project_of(root_parts: &[&str]) -> String {
        for (i, part) in root_parts.iter().enumerate() {
            if matches!(*part, "branches" | "tags" | "trunk") {
                return root_parts[..i].join("/");
            }
        }
        String::new()
    }

    fn parse_with(&self, path: &str, patterns: &[String], kind: PathKind) -> Option<PathClass> {
        let parts = split_path(path);
        for pattern in patterns {
            if let Some(n) = Self::match_prefix(pattern, &parts) {
                return Some(PathClass {
                    kind,
                    project: Self::project_of(&parts[..n]),
                    branch_path: parts[..n].join("/"),
                    inside: parts[n..].join("/"),
                });
            }
        }
        None
    }

    fn is_parent_of(patterns: &[String], path: &str) -> bool {
        let parts = split_path(path);
        patterns.iter().any(|pattern| {
            let pattern_parts = split_path(pattern);
            parts.len() < pattern_parts.len()
                && parts
                    .iter()
                    .zip(&pattern_parts)
                    .all(|(part, pat)| *pat == "*" || pat == part)
        })
    }
}

impl Layout for WildcardLayout {
    fn parse(&self, path: &str) -> Result<PathClass> {
        let path = path.trim_matches('/');
        // Tag patterns shadow branch patterns
        self.parse_with(path, &self.tags, PathKind::Tag)
            .or_else(|| self.parse_with(path, &self.branches, PathKind::Branch))
            .ok_or_else(|| Error::InvalidBranchPath(path.to_string()))
    }

    fn to_scheme_text(&self) -> String {
        self.branches.join(";")
    }

    fn is_branch_parent(&self, path: &str) -> bool {
        Self::is_parent_of(&self.branches, path)
    }

    fn is_tag_parent(&self, path: &str) -> bool {
        Self::is_parent_of(&self.tags, path)
    }

    fn get_branches(
        &self,
        transport: &dyn RaTransport,
        revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        expand_root_paths(self, &self.branches, transport, revnum, project, true)
    }

    fn get_tags(
        &self,
        transport: &dyn RaTransport,
        revnum: Revnum,
        project: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        expand_root_paths(self, &self.tags, transport, revnum, project, false)
    }

    fn get_branch_path(&self, _name: &str, _project: &str) -> Option<String> {
        None
    }

    fn get_tag_path(&self, _name: &str, _project: &str) -> Option<String> {
        None
    }

    fn clone_box(&self) -> Box<dyn Layout> {
        Box::new(self.clone())
    }
}

fn join_path(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else {
        format!("{}/{}", a, b)
    }
}

/// Expand a set of root patterns into the concrete roots existing at
/// `revnum`, verifying each candidate against the layout
fn expand_root_paths(
    layout: &dyn Layout,
    patterns: &[String],
    transport: &dyn RaTransport,
    revnum: Revnum,
    project: Option<&str>,
    branches: bool,
) -> Result<Vec<(String, String)>> {
    let mut roots = Vec::new();
    for pattern in patterns {
        let todo: Vec<&str> = split_path(pattern);
        for root in expand_branch_pattern(&[], &todo, transport, revnum, project)? {
            let accepted = if branches {
                layout.is_branch(&root)
            } else {
                layout.is_tag(&root)
            };
            if accepted {
                let project = layout.parse(&root)?.project;
                roots.push((project, root));
            }
        }
    }
    Ok(roots)
}

/// Find the concrete paths matching a branch pattern by expanding each
/// wildcard segment from the directory listing at `revnum`
pub fn expand_branch_pattern(
    begin: &[String],
    todo: &[&str],
    transport: &dyn RaTransport,
    revnum: Revnum,
    project: Option<&str>,
) -> Result<Vec<String>> {
    let path = begin.join("/");
    tracing::trace!(%path, ?todo, "expand branch pattern");
    if let Some(project) = project {
        if !project.starts_with(&path) && !path.starts_with(project) {
            return Ok(vec![]);
        }
    }
    if todo.is_empty() {
        if transport.check_path(&path, revnum)? == NodeKind::Dir {
            return Ok(vec![path]);
        }
        return Ok(vec![]);
    }
    if todo[0] != "*" {
        let mut next = begin.to_vec();
        next.push(todo[0].to_string());
        return expand_branch_pattern(&next, &todo[1..], transport, revnum, project);
    }
    let entries = match transport.get_dir(&path, revnum) {
        Ok((entries, _)) => entries,
        Err(Error::NotFound(_)) => return Ok(vec![]),
        Err(e) => return Err(e),
    };
    let mut found = Vec::new();
    for (name, kind) in entries {
        if kind != NodeKind::Dir {
            continue;
        }
        let mut next = begin.to_vec();
        next.push(name);
        if todo.len() == 1 {
            found.push(next.join("/"));
        } else {
            found.extend(expand_branch_pattern(&next, &todo[1..], transport, revnum, project)?);
        }
    }
    Ok(found)
}

/// Parse the short scheme text form stored in configuration or in the
/// repository-root property. Branch patterns are separated by newlines or
/// semicolons; tag patterns are derived by swapping a `branches` segment
/// for `tags`.
pub fn parse_scheme_text(text: &str) -> Result<Box<dyn Layout>> {
    let text = text.trim();
    if text == "root" || text == "none" {
        return Ok(Box::new(RootLayout));
    }
    if let Some(rest) = text.strip_prefix("trunk") {
        if rest.is_empty() {
            return Ok(Box::new(TrunkLayout::new(0)));
        }
        if let Ok(level) = rest.parse::<usize>() {
            return Ok(Box::new(TrunkLayout::new(level)));
        }
    }
    let branches: Vec<String> = text
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.trim_matches('/').to_string())
        .collect();
    if branches.is_empty() {
        return Err(Error::InvalidPropertyValue {
            name: "branching scheme".to_string(),
            reason: format!("no branch patterns in '{}'", text),
        });
    }
    let tags: Vec<String> = branches
        .iter()
        .filter(|p| p.split('/').any(|seg| seg == "branches"))
        .map(|p| {
            p.split('/')
                .map(|seg| if seg == "branches" { "tags" } else { seg })
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    Ok(Box::new(WildcardLayout::new(branches, tags)))
}

/// Infer a layout from a single known branch path.
///
/// Best effort: the result classifies `branch_path` itself correctly but
/// is not guaranteed to match the scheme originally in force.
pub fn guess_scheme_from_branch_path(branch_path: &str) -> Box<dyn Layout> {
    let path = branch_path.trim_matches('/');
    let parts = split_path(path);
    for (i, part) in parts.iter().enumerate() {
        if *part == "trunk" && i == parts.len() - 1 {
            return Box::new(TrunkLayout::new(i));
        }
        if matches!(*part, "branches" | "tags") && i + 2 == parts.len() {
            return Box::new(TrunkLayout::new(i));
        }
    }
    if path.is_empty() {
        Box::new(RootLayout)
    } else {
        Box::new(WildcardLayout::new(vec![path.to_string()], vec![]))
    }
}

/// Guess the branching scheme from a sample of history.
///
/// Returns `(guessed, to_use)`: the scheme the history vote produced, and
/// the scheme to actually use, which additionally has to accept
/// `branch_path` when a hint is given.
pub fn guess_scheme_from_history<I>(
    history: I,
    last_revnum: Revnum,
    branch_path: Option<&str>,
) -> Result<(Box<dyn Layout>, Box<dyn Layout>)>
where
    I: IntoIterator<Item = Result<(ChangeSet, Revnum)>>,
{
    let mut votes: HashMap<usize, usize> = HashMap::new();
    for entry in history {
        let (changes, _revnum) = entry?;
        for path in changes.keys() {
            let parts = split_path(path);
            for (i, part) in parts.iter().enumerate() {
                if matches!(*part, "trunk" | "branches" | "tags") {
                    *votes.entry(i).or_insert(0) += 1;
                    break;
                }
            }
        }
    }
    let guessed: Box<dyn Layout> = match votes.iter().max_by_key(|(_, count)| **count) {
        Some((level, _)) => Box::new(TrunkLayout::new(*level)),
        None => Box::new(RootLayout),
    };
    tracing::debug!(scheme = %guessed.to_scheme_text(), last_revnum, "guessed branching scheme");

    let to_use = match branch_path {
        Some(bp) if !guessed.is_branch_or_tag(bp) => guess_scheme_from_branch_path(bp),
        _ => guessed.clone(),
    };
    Ok((guessed, to_use))
}
