use std::path::{Component, Path, PathBuf};

/// Why a client-supplied filename was refused. The two cases map to different
/// wire error codes, so the distinction is kept explicit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathRejection {
    /// the name does not denote a file at all, e.g. it is empty or normalizes
    /// to the root directory itself
    Unresolvable,
    /// the name resolves to a location outside the configured root directory
    OutsideRoot,
}

/// Resolves a client-supplied filename against the server's root directory.
///
/// Names are taken as relative to `root` regardless of leading separators, and
/// normalization is purely lexical: write requests name files that do not
/// exist yet, so nothing here may touch the filesystem. `root` is expected to
/// be canonical (the server canonicalizes it once at startup).
pub fn resolve(root: &Path, requested: &str) -> Result<PathBuf, PathRejection> {
    let relative = requested.trim_start_matches('/');

    let mut normalized = PathBuf::new();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(PathRejection::OutsideRoot);
                }
                normalized.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathRejection::OutsideRoot);
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(PathRejection::Unresolvable);
    }

    let resolved = root.join(normalized);

    // component-wise prefix check, independent of the normalization above
    if !resolved.starts_with(root) {
        return Err(PathRejection::OutsideRoot);
    }
    Ok(resolved)
}
