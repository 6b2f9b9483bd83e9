//! Environment handed to supervised binaries.
//!
//! The relay binaries are not installed system-wide; they live in a private
//! directory next to their shared libraries. Both the executable search path
//! and the dynamic-library search path of every child get that directory
//! appended, while the rest of the inherited environment is left alone.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

pub const PATH_VAR: &str = "PATH";

#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(windows)]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Environment overrides applied on top of the inherited environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    bin_dir: Option<PathBuf>,
    vars: Vec<(OsString, OsString)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `dir` to `PATH` and the library search path of the child.
    pub fn set_bin_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.bin_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Sets a plain variable. Replaces whatever the parent has.
    pub fn set_var(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.vars
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn bin_dir(&self) -> Option<&Path> {
        self.bin_dir.as_deref()
    }

    /// Resolves the variables to set on the child, reading current values
    /// through `lookup` (normally [`std::env::var_os`]).
    pub fn resolve<F>(&self, lookup: F) -> Vec<(OsString, OsString)>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut resolved: Vec<(OsString, OsString)> = Vec::new();

        for (key, value) in &self.vars {
            set_entry(&mut resolved, key.clone(), value.clone());
        }

        if let Some(dir) = &self.bin_dir {
            for var in search_path_vars() {
                let current = resolved
                    .iter()
                    .find(|(k, _)| k == OsStr::new(var))
                    .map(|(_, v)| v.clone())
                    .or_else(|| lookup(var));
                set_entry(&mut resolved, var.into(), append_search_path(current, dir));
            }
        }

        resolved
    }

    /// Where to launch `program` from: the private directory when it holds the
    /// binary, otherwise the bare name for a search-path lookup.
    pub fn resolve_program(&self, program: &str) -> PathBuf {
        if let Some(dir) = &self.bin_dir {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(program)
    }
}

fn search_path_vars() -> Vec<&'static str> {
    if PATH_VAR == LIBRARY_PATH_VAR {
        vec![PATH_VAR]
    } else {
        vec![PATH_VAR, LIBRARY_PATH_VAR]
    }
}

fn set_entry(entries: &mut Vec<(OsString, OsString)>, key: OsString, value: OsString) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

/// Appends `dir` to a search-path value. An unset or empty value yields `dir` alone.
pub fn append_search_path(current: Option<OsString>, dir: &Path) -> OsString {
    let mut paths: Vec<PathBuf> = current
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| std::env::split_paths(v).collect())
        .unwrap_or_default();

    if !paths.iter().any(|p| p == dir) {
        paths.push(dir.to_path_buf());
    }

    match std::env::join_paths(&paths) {
        Ok(joined) => joined,
        // A separator inside an inherited entry: keep the original value untouched
        // and append with the platform separator.
        Err(_) => {
            let mut value = current.unwrap_or_default();
            if !value.is_empty() {
                value.push(if cfg!(windows) { ";" } else { ":" });
            }
            value.push(dir);
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_append_to_existing_path() {
        let merged = append_search_path(Some("/usr/bin:/bin".into()), Path::new("/data/app/files"));
        assert_eq!(merged, OsString::from("/usr/bin:/bin:/data/app/files"));
    }

    #[test]
    fn test_append_to_unset_path() {
        let dir = Path::new("private-bin");
        assert_eq!(append_search_path(None, dir), OsString::from("private-bin"));
        assert_eq!(append_search_path(Some("".into()), dir), OsString::from("private-bin"));
    }

    #[test]
    #[cfg(unix)]
    fn test_append_is_idempotent() {
        let merged = append_search_path(Some("/bin:/data/app/files".into()), Path::new("/data/app/files"));
        assert_eq!(merged, OsString::from("/bin:/data/app/files"));
    }

    #[test]
    #[cfg(all(unix, not(target_os = "macos")))]
    fn test_resolve_appends_both_search_paths() {
        let env = Environment::new()
            .set_bin_dir("/data/app/files")
            .set_var("FFREPORT", "level=32");

        let resolved = env.resolve(|var| match var {
            "PATH" => Some("/system/bin".into()),
            _ => None,
        });

        let get = |key: &str| {
            resolved
                .iter()
                .find(|(k, _)| k == OsStr::new(key))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("PATH"), Some("/system/bin:/data/app/files".into()));
        assert_eq!(get("LD_LIBRARY_PATH"), Some("/data/app/files".into()));
        assert_eq!(get("FFREPORT"), Some("level=32".into()));
    }

    #[test]
    fn test_resolve_without_bin_dir_leaves_paths_alone() {
        let env = Environment::new().set_var("A", "1");
        let resolved = env.resolve(|_| Some("/bin".into()));
        assert_eq!(resolved, vec![(OsString::from("A"), OsString::from("1"))]);
    }

    #[test]
    fn test_resolve_program_falls_back_to_name() {
        let env = Environment::new().set_bin_dir("/definitely/not/here");
        assert_eq!(env.resolve_program("ffserver"), PathBuf::from("ffserver"));
    }
}
