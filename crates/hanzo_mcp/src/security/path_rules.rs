//! Ordered allow/deny path rules with bounded symlink resolution.
//!
//! # Matching model
//!
//! Rules are canonicalised absolute prefixes marked allow or deny. A
//! candidate path is normalised, its symlinks resolved to a bounded depth,
//! and then matched by longest prefix; on a length tie a deny entry wins.
//! No match means deny.
//!
//! `..` components in candidate paths are rejected outright, and a path
//! whose symlinks escape the allowlist is denied even when the literal
//! path matched.

use crate::error::{ToolError, ToolResult};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Symlink indirections tolerated while resolving one path.
pub const MAX_SYMLINK_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
}

/// One entry in the permission set.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub prefix: PathBuf,
    pub action: RuleAction,
}

impl PathRule {
    pub fn allow(prefix: PathBuf) -> Self {
        Self {
            prefix,
            action: RuleAction::Allow,
        }
    }

    pub fn deny(prefix: PathBuf) -> Self {
        Self {
            prefix,
            action: RuleAction::Deny,
        }
    }
}

/// The immutable permission set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<PathRule>,
}

impl RuleSet {
    /// Canonicalise every rule prefix at construction time. Prefixes that
    /// cannot be resolved are kept in lexically-normalised form so deny
    /// rules for not-yet-existing trees still apply.
    pub fn new(rules: Vec<PathRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let prefix = match resolve_bounded(&rule.prefix) {
                    Ok(canonical) => canonical,
                    Err(err) => {
                        warn!(prefix = %rule.prefix.display(), %err, "keeping rule prefix unresolved");
                        rule.prefix.clone()
                    }
                };
                PathRule {
                    prefix,
                    action: rule.action,
                }
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[PathRule] {
        &self.rules
    }

    /// Canonicalise `path` without authorizing it.
    pub fn resolve(&self, path: &Path) -> ToolResult<PathBuf> {
        resolve_bounded(path)
    }

    /// Canonicalise `path` and match it against the rule set.
    pub fn authorize(&self, path: &Path) -> ToolResult<PathBuf> {
        let canonical = resolve_bounded(path)?;
        match self.matches(&canonical) {
            Some(RuleAction::Allow) => Ok(canonical),
            _ => Err(ToolError::PermissionDenied(format!(
                "path not allowed: {}",
                canonical.display()
            ))),
        }
    }

    /// Longest-prefix match; deny wins length ties; default deny.
    fn matches(&self, canonical: &Path) -> Option<RuleAction> {
        let mut best: Option<(usize, RuleAction)> = None;
        for rule in &self.rules {
            if !canonical.starts_with(&rule.prefix) {
                continue;
            }
            let len = rule.prefix.components().count();
            best = match best {
                None => Some((len, rule.action)),
                Some((best_len, _)) if len > best_len => Some((len, rule.action)),
                Some((best_len, RuleAction::Allow))
                    if len == best_len && rule.action == RuleAction::Deny =>
                {
                    Some((len, RuleAction::Deny))
                }
                keep => keep,
            };
        }
        best.map(|(_, action)| action)
    }
}

/// Normalise `path` to absolute form and resolve symlinks component by
/// component, up to [`MAX_SYMLINK_DEPTH`] indirections. Components past the
/// first nonexistent one are appended lexically so paths that do not exist
/// yet (a file about to be written) still resolve to their final location.
///
/// The result is idempotent: resolving an already-resolved path returns it
/// unchanged.
pub fn resolve_bounded(path: &Path) -> ToolResult<PathBuf> {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::PermissionDenied(format!(
            "path traversal rejected: {}",
            path.display()
        )));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot resolve cwd: {}", e)))?
            .join(path)
    };

    let mut pending: VecDeque<OsString> = VecDeque::new();
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => resolved.push(p.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => unreachable!("rejected above"),
            Component::Normal(name) => pending.push_back(name.to_os_string()),
        }
    }
    if resolved.as_os_str().is_empty() {
        resolved.push(Component::RootDir.as_os_str());
    }

    let mut links = 0usize;
    let mut tail_is_lexical = false;

    while let Some(name) = pending.pop_front() {
        if tail_is_lexical {
            resolved.push(name);
            continue;
        }

        let candidate = resolved.join(&name);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                links += 1;
                if links > MAX_SYMLINK_DEPTH {
                    return Err(ToolError::PermissionDenied(format!(
                        "too many symbolic links: {}",
                        path.display()
                    )));
                }
                let target = std::fs::read_link(&candidate).map_err(|e| {
                    ToolError::ExecutionFailed(format!(
                        "cannot read link {}: {}",
                        candidate.display(),
                        e
                    ))
                })?;
                let mut replacement: VecDeque<OsString> = VecDeque::new();
                if target.is_absolute() {
                    resolved = PathBuf::from(Component::RootDir.as_os_str());
                }
                for component in target.components() {
                    match component {
                        Component::Prefix(p) => {
                            resolved = PathBuf::from(p.as_os_str());
                        }
                        Component::RootDir => {
                            // handled above for absolute targets
                        }
                        Component::CurDir => {}
                        Component::ParentDir => {
                            if replacement.pop_back().is_none() {
                                resolved.pop();
                            }
                        }
                        Component::Normal(n) => replacement.push_back(n.to_os_string()),
                    }
                }
                while let Some(part) = replacement.pop_back() {
                    pending.push_front(part);
                }
            }
            Ok(_) => resolved.push(name),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                resolved.push(name);
                tail_is_lexical = true;
            }
            Err(err) => {
                return Err(ToolError::ExecutionFailed(format!(
                    "cannot stat {}: {}",
                    candidate.display(),
                    err
                )))
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn valid_path_within_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("test.txt");
        std::fs::write(&file, "test").unwrap();

        let rules = RuleSet::new(vec![PathRule::allow(temp.path().to_path_buf())]);
        assert!(rules.authorize(&file).is_ok());
    }

    #[test]
    fn path_outside_root_is_denied() {
        let temp = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let file = other.path().join("test.txt");
        std::fs::write(&file, "test").unwrap();

        let rules = RuleSet::new(vec![PathRule::allow(temp.path().to_path_buf())]);
        assert!(matches!(
            rules.authorize(&file),
            Err(ToolError::PermissionDenied(_))
        ));
    }

    #[test]
    fn traversal_is_rejected() {
        let temp = TempDir::new().unwrap();
        let rules = RuleSet::new(vec![PathRule::allow(temp.path().to_path_buf())]);

        let sneaky = temp.path().join("sub").join("..").join("..").join("etc");
        let err = rules.authorize(&sneaky).unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn nonexistent_file_resolves_to_future_location() {
        let temp = TempDir::new().unwrap();
        let rules = RuleSet::new(vec![PathRule::allow(temp.path().to_path_buf())]);

        let future = temp.path().join("not_yet").join("file.txt");
        let canonical = rules.authorize(&future).unwrap();
        assert!(canonical.ends_with("not_yet/file.txt"));
    }

    #[test]
    fn deny_wins_length_tie() {
        let temp = TempDir::new().unwrap();
        let rules = RuleSet::new(vec![
            PathRule::allow(temp.path().to_path_buf()),
            PathRule::deny(temp.path().to_path_buf()),
        ]);
        assert!(rules.authorize(&temp.path().join("a")).is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let temp = TempDir::new().unwrap();
        let secret = temp.path().join("secret");
        std::fs::create_dir(&secret).unwrap();

        let rules = RuleSet::new(vec![
            PathRule::allow(temp.path().to_path_buf()),
            PathRule::deny(secret.clone()),
        ]);

        assert!(rules.authorize(&temp.path().join("open.txt")).is_ok());
        assert!(rules.authorize(&secret.join("hidden.txt")).is_err());
    }

    #[test]
    fn default_is_deny() {
        let rules = RuleSet::new(vec![]);
        assert!(rules.authorize(Path::new("/")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_denied() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("secret.txt");
        std::fs::write(&target, "secret").unwrap();

        let link = allowed.path().join("innocent.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let rules = RuleSet::new(vec![PathRule::allow(allowed.path().to_path_buf())]);
        let err = rules.authorize(&link).unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_hits_depth_bound() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();

        let rules = RuleSet::new(vec![PathRule::allow(temp.path().to_path_buf())]);
        let err = rules.authorize(&a).unwrap_err();
        assert!(err.to_string().contains("symbolic links"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        let once = resolve_bounded(&file).unwrap();
        let twice = resolve_bounded(&once).unwrap();
        assert_eq!(once, twice);
    }
}
