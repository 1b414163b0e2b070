//! Working-directory helpers exposed as remote methods.
//!
//! These never fail: problems are reported in the returned text.

use std::io::ErrorKind;
use std::path::Path;

/// The current working directory.
pub fn pwd() -> String {
    match std::env::current_dir() {
        Ok(dir) => dir.display().to_string(),
        Err(err) => format!("pwd not possible: {err}"),
    }
}

/// Change the working directory and return the new one.
pub fn cd(target: &str) -> String {
    let path = Path::new(target);
    if target.is_empty() {
        return format!("cd not possible: invalid target directory '{target}'");
    }
    if path.is_file() {
        return format!("cd not possible: Maybe {target} is a file");
    }
    match std::env::set_current_dir(path) {
        Ok(()) => pwd(),
        Err(err) => match err.kind() {
            ErrorKind::NotFound => {
                format!("cd not possible: invalid target directory '{target}', path not found")
            }
            ErrorKind::PermissionDenied => {
                format!("cd not possible: no permissions for '{target}'")
            }
            _ => format!("cd not possible: invalid target directory '{target}'"),
        },
    }
}

/// Names of the entries in `dir` (`.` when empty), one per line, sorted.
pub fn ls(dir: &str) -> String {
    let dir = if dir.is_empty() { "." } else { dir };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            return match err.kind() {
                ErrorKind::NotFound => {
                    format!("ls not possible: invalid target directory '{dir}' not found")
                }
                ErrorKind::PermissionDenied => {
                    format!("ls not possible: no permissions for '{dir}'")
                }
                _ => format!("ls not possible: {err}"),
            }
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ls_lists_sorted_names() {
        let dir = std::env::temp_dir().join(format!("hidmux-ls-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("b.txt"), b"").unwrap();
        std::fs::write(dir.join("a.txt"), b"").unwrap();

        assert_eq!(ls(dir.to_str().unwrap()), "a.txt\nb.txt\nsub");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn failures_are_descriptive_text() {
        let missing = "/nonexistent/hidmux-dir";
        assert!(ls(missing).starts_with("ls not possible"));
        assert!(cd(missing).contains("path not found"));
        assert!(cd("").starts_with("cd not possible"));
    }

    #[test]
    fn cd_refuses_files() {
        let file = std::env::temp_dir().join(format!("hidmux-cd-{}", std::process::id()));
        std::fs::write(&file, b"").unwrap();
        let before = pwd();
        assert!(cd(file.to_str().unwrap()).contains("is a file"));
        assert_eq!(pwd(), before);
        let _ = std::fs::remove_file(file);
    }
}
