//! Multi-repo path arithmetic (§4.2.1, testable property #6): given where the
//! project source lives and a build path as written in the manifest, decides
//! whether the build context is inside the project or in a sibling repo.

use std::path::{Component, Path, PathBuf};

fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Returns `(repo, build_path)`: `repo` is `default_repo` when the build
/// context resolves inside `project_path`, else the sibling directory name
/// immediately after the common prefix; `build_path` is the remainder inside
/// that repo (`"."` if the remainder is empty).
pub fn compute_repo_and_build_path(
    project_path: &Path,
    manifest_path: &Path,
    build_path: &str,
    default_repo: &str,
) -> (String, String) {
    let project_path = clean(project_path);
    let manifest_dir = manifest_path.parent().unwrap_or(Path::new("."));
    let full_build_path = clean(&manifest_dir.join(build_path));

    let project_parts: Vec<_> = project_path.components().collect();
    let build_parts: Vec<_> = full_build_path.components().collect();

    let min_len = project_parts.len().min(build_parts.len());

    for i in 0..min_len {
        if project_parts[i] != build_parts[i] {
            let rest: PathBuf = build_parts[i + 1..].iter().collect();
            let rest = if rest.as_os_str().is_empty() {
                ".".to_string()
            } else {
                rest.to_string_lossy().to_string()
            };
            let repo = build_parts[i].as_os_str().to_string_lossy().to_string();
            return (repo, rest);
        }
    }

    // Identical up to `min_len` (tie-break): treat as inside the project.
    (default_repo.to_string(), build_path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn build_path_dot_is_inside_project() {
        let (repo, path) = compute_repo_and_build_path(
            Path::new("/p/myproject"),
            Path::new("/p/myproject/docker-compose.yml"),
            ".",
            "def",
        );
        assert_eq!((repo.as_str(), path.as_str()), ("def", "."));
    }

    #[test]
    fn build_path_parent_inside_ergomake_dir_is_inside_project() {
        let (repo, path) = compute_repo_and_build_path(
            Path::new("/p/myproject"),
            Path::new("/p/myproject/.ergomake/docker-compose.yml"),
            "..",
            "def",
        );
        assert_eq!((repo.as_str(), path.as_str()), ("def", ".."));
    }

    #[test]
    fn sibling_directory_is_other_repo() {
        let (repo, path) = compute_repo_and_build_path(
            Path::new("/p/myproject"),
            Path::new("/p/myproject/docker-compose.yml"),
            "../otherproj",
            "def",
        );
        assert_eq!((repo.as_str(), path.as_str()), ("otherproj", "."));
    }

    #[test]
    fn sibling_directory_with_subpath() {
        let (repo, path) = compute_repo_and_build_path(
            Path::new("/p/myproject"),
            Path::new("/p/myproject/.ergomake/docker-compose.yml"),
            "../../otherproj/build",
            "def",
        );
        assert_eq!((repo.as_str(), path.as_str()), ("otherproj", "build"));
    }
}
