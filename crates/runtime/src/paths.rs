use std::path::{Component, Path, PathBuf};

use burrow_common::{Error, Result};

/// Resolve `relative` strictly under `base`.
///
/// Rejects absolute paths and any path containing a parent component; the
/// returned path always has `base` as a prefix. Used for every in-container
/// write derived from user-supplied template or repository names.
pub fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(Error::validation(format!(
            "path '{relative}' must be relative"
        )));
    }

    let mut resolved = base.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {},
            _ => {
                return Err(Error::validation(format!(
                    "path '{relative}' escapes its base directory"
                )));
            },
        }
    }

    if !resolved.starts_with(base) {
        return Err(Error::validation(format!(
            "path '{relative}' escapes its base directory"
        )));
    }
    Ok(resolved)
}

/// A template or repo name safe to embed in a path: no separators, no dots.
pub fn validate_file_stem(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::validation("name must be 1-128 characters"));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c == '.')
    {
        return Err(Error::validation(format!(
            "name '{name}' contains path separators or dots"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_absolute() {
        let base = Path::new("/workspace/p");
        assert!(resolve_under(base, "../etc/passwd").is_err());
        assert!(resolve_under(base, "a/../../etc").is_err());
        assert!(resolve_under(base, "/etc/passwd").is_err());
    }

    #[test]
    fn accepts_nested_relative() {
        let base = Path::new("/workspace/p");
        let resolved = resolve_under(base, "src/main.go").unwrap();
        assert!(resolved.starts_with(base));
        assert_eq!(resolved, Path::new("/workspace/p/src/main.go"));

        // `.` components are harmless.
        assert_eq!(
            resolve_under(base, "./src/lib.rs").unwrap(),
            Path::new("/workspace/p/src/lib.rs")
        );
    }

    #[test]
    fn file_stem_rules() {
        assert!(validate_file_stem("my-skill").is_ok());
        assert!(validate_file_stem("").is_err());
        assert!(validate_file_stem("a/b").is_err());
        assert!(validate_file_stem("..").is_err());
    }
}
