use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

/// The user's home directory, or the process directory when it cannot be found.
pub fn home_dir() -> PathBuf {
    let home = shellexpand::tilde("~");
    if home.as_ref() != "~" {
        return PathBuf::from(home.as_ref());
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn normalize_path(path: &Path, base: &Path) -> PathBuf {
    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut components = Vec::new();
    for component in absolute_path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
                // `..` above the root stays at the root
            }
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

/// Resolves the working directory for a new session.
///
/// Missing or blank input means the home directory. `~` is expanded, relative
/// paths are taken against the server's own directory, and paths that exist
/// are canonicalized.
pub fn resolve_working_dir(cwd: Option<&str>) -> PathBuf {
    let requested = match cwd.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => expand_tilde_path_buf(c),
        None => home_dir(),
    };
    let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let normalized = normalize_path(&requested, &base);

    // dunce keeps Windows paths free of the \\?\ prefix
    let resolved = match dunce::canonicalize(&normalized) {
        Ok(canonical_path) => canonical_path,
        Err(_) => normalized,
    };
    debug!(requested = ?cwd, resolved = %resolved.display(), "Resolved working directory");
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_home() {
        let resolved = resolve_working_dir(None);
        let home = dunce::canonicalize(home_dir()).unwrap_or_else(|_| home_dir());
        assert_eq!(resolved, home);
        assert_eq!(resolve_working_dir(Some("  ")), home);
    }

    #[test]
    fn existing_dir_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        let input = format!("{}/a/../a/.", dir.path().display());
        let resolved = resolve_working_dir(Some(&input));
        assert_eq!(resolved, dunce::canonicalize(&nested).unwrap());
    }

    #[test]
    fn missing_dir_is_kept_normalized() {
        let resolved = resolve_working_dir(Some("/definitely/not/here/../there"));
        assert_eq!(resolved, PathBuf::from("/definitely/not/there"));
    }

    #[test]
    fn tilde_is_expanded() {
        let resolved = resolve_working_dir(Some("~"));
        assert!(!resolved.to_string_lossy().contains('~'));
        assert!(expand_tilde_path_buf("~/projects").ends_with("projects"));
        assert_eq!(expand_tilde_path_buf("/tmp/x"), PathBuf::from("/tmp/x"));
    }
}
