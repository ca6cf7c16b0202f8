//! Package working directories.
//!
//! A package is one directory on disk plus two string maps (caller
//! parameters and step-written properties) persisted to `info.json`.

mod store;

pub use store::PackageStore;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::utils::fs::{ensure_dir_all_sync, io_error};
use crate::utils::glob::{GlobMatcher, is_glob_pattern};
use crate::{Error, Result};

/// Name of the metadata file kept in every package directory.
pub const INFO_FILE: &str = "info.json";

const PARAMETER_PREFIX: &str = "parameter-";
const ORIGINAL_FILE_KEY: &str = "_original_file";
const CREATED_KEY: &str = "_created";

/// A package working directory and its metadata.
#[derive(Debug)]
pub struct PackageData {
    id: String,
    directory: PathBuf,
    created: RwLock<DateTime<Utc>>,
    original: RwLock<Option<String>>,
    parameters: RwLock<BTreeMap<String, String>>,
    properties: RwLock<BTreeMap<String, String>>,
}

impl PackageData {
    pub(crate) fn new(id: String, directory: PathBuf, original: Option<String>) -> Self {
        Self {
            id,
            directory,
            created: RwLock::new(Utc::now()),
            original: RwLock::new(original),
            parameters: RwLock::new(BTreeMap::new()),
            properties: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn created(&self) -> DateTime<Utc> {
        *self.created.read()
    }

    /// File name of the original input, relative to the package directory.
    pub fn original_name(&self) -> Option<String> {
        self.original.read().clone()
    }

    /// Absolute path of the original input.
    pub fn original(&self) -> Option<PathBuf> {
        self.original.read().as_ref().map(|name| self.directory.join(name))
    }

    /// Size of the original input in bytes, or 0 if there is none.
    pub fn original_size(&self) -> u64 {
        self.original()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.write().insert(name.into(), value.into());
    }

    pub fn parameter(&self, name: &str) -> Option<String> {
        self.parameters.read().get(name).cloned()
    }

    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.parameters.read().clone()
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.read().get(name).cloned()
    }

    pub fn property_or(&self, name: &str, default: &str) -> String {
        self.property(name).unwrap_or_else(|| default.to_string())
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties.read().clone()
    }

    fn info_path(&self) -> PathBuf {
        self.directory.join(INFO_FILE)
    }

    /// Flush parameters, properties and the original file name to `info.json`.
    pub async fn persist(&self) -> Result<()> {
        let mut flat = BTreeMap::new();
        for (key, value) in self.properties.read().iter() {
            flat.insert(key.clone(), value.clone());
        }
        for (key, value) in self.parameters.read().iter() {
            flat.insert(format!("{PARAMETER_PREFIX}{key}"), value.clone());
        }
        if let Some(original) = self.original.read().as_ref() {
            flat.insert(ORIGINAL_FILE_KEY.to_string(), original.clone());
        }
        flat.insert(CREATED_KEY.to_string(), self.created().to_rfc3339());

        let json = serde_json::to_string_pretty(&flat)?;
        let path = self.info_path();
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_error("writing package info", &path, e))?;

        debug!(package_id = %self.id, "Package info persisted");
        Ok(())
    }

    /// Replace the in-memory maps with the contents of `info.json`.
    ///
    /// A missing file leaves both maps empty.
    pub async fn reload(&self) -> Result<()> {
        let path = self.info_path();
        let flat: BTreeMap<String, String> = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_error("reading package info", &path, e)),
        };

        let mut parameters = BTreeMap::new();
        let mut properties = BTreeMap::new();
        let mut original = None;
        let mut created = None;

        for (key, value) in flat {
            if let Some(name) = key.strip_prefix(PARAMETER_PREFIX) {
                parameters.insert(name.to_string(), value);
            } else if key == ORIGINAL_FILE_KEY {
                original = Some(value);
            } else if key == CREATED_KEY {
                created = DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            } else {
                properties.insert(key, value);
            }
        }

        *self.parameters.write() = parameters;
        *self.properties.write() = properties;
        if original.is_some() {
            *self.original.write() = original;
        }
        if let Some(created) = created {
            *self.created.write() = created;
        }
        Ok(())
    }

    /// Resolve a pattern to exactly one file, or `None` if it matches zero or several.
    pub fn resolve(&self, pattern: &str) -> Option<PathBuf> {
        let mut matches = self.resolve_all(pattern);
        if matches.len() == 1 { matches.pop() } else { None }
    }

    /// Resolve a pattern against the package directory.
    ///
    /// Lookup order: an existing relative path, then a comma separated list,
    /// then a glob matched recursively below the directory. Blank input,
    /// absolute paths and paths leaving the directory resolve to nothing.
    pub fn resolve_all(&self, pattern: &str) -> Vec<PathBuf> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Vec::new();
        }

        if let Some(path) = self.safe_join(pattern)
            && path.exists()
        {
            return vec![path];
        }

        if is_file_list(pattern) {
            let mut found = Vec::new();
            for item in pattern.split(',') {
                for path in self.resolve_all(item) {
                    if !found.contains(&path) {
                        found.push(path);
                    }
                }
            }
            return found;
        }

        if is_glob_pattern(pattern) && self.safe_join(pattern).is_some() {
            return self.glob(pattern);
        }

        Vec::new()
    }

    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        let matcher = match GlobMatcher::new(pattern) {
            Ok(m) => m,
            Err(e) => {
                debug!(package_id = %self.id, error = %e, "Ignoring invalid glob");
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        collect_files(&self.directory, &mut files);

        let info = self.info_path();
        let mut matched: Vec<PathBuf> = files
            .into_iter()
            .filter(|p| *p != info)
            .filter(|p| {
                self.relative_path(p)
                    .is_some_and(|rel| matcher.is_match(&rel))
            })
            .collect();
        matched.sort();
        matched
    }

    /// Join a relative path onto the package directory, refusing anything
    /// absolute or containing `..`.
    fn safe_join(&self, relative: &str) -> Option<PathBuf> {
        let path = Path::new(relative);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || relative.starts_with('/') || relative.starts_with('\\') {
            return None;
        }
        Some(self.directory.join(path))
    }

    /// Express an absolute path inside the package as a `/`-separated relative path.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.directory).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Top-level files with the given extension (case-insensitive), sorted.
    pub fn list_by_extension(&self, ext: &str) -> Vec<PathBuf> {
        let ext = ext.trim_start_matches('.');
        let Ok(entries) = std::fs::read_dir(&self.directory) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .and_then(|x| x.to_str())
                    .is_some_and(|x| x.eq_ignore_ascii_case(ext))
            })
            .collect();
        files.sort();
        files
    }

    /// First top-level file with the given extension.
    pub fn find_by_extension(&self, ext: &str) -> Option<PathBuf> {
        self.list_by_extension(ext).into_iter().next()
    }

    /// `<root>/<package id>`, created on demand.
    pub fn download_dir(&self, root: &Path) -> Result<PathBuf> {
        let dir = root.join(&self.id);
        ensure_dir_all_sync(&dir)?;
        Ok(dir)
    }

    pub(crate) fn check_directory(&self) -> Result<()> {
        if self.directory.is_dir() {
            Ok(())
        } else {
            Err(Error::not_found("Package", &self.id))
        }
    }
}

/// A comma separated list of plain file names, with no glob syntax.
fn is_file_list(pattern: &str) -> bool {
    pattern.contains(',')
        && pattern.split(',').all(|item| {
            let item = item.trim();
            !item.is_empty()
                && item.chars().all(|c| {
                    c.is_alphanumeric() || c.is_whitespace() || "_-./\\:".contains(c)
                })
        })
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => collect_files(&path, out),
            Ok(_) => out.push(path),
            Err(_) => {}
        }
    }
}
