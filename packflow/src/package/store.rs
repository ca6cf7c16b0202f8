use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::PackageData;
use crate::utils::fs::{ensure_dir_all_sync, io_error};
use crate::{Error, Result};

const MAX_ID_ATTEMPTS: usize = 16;

/// Creates and loads packages below a root directory.
#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    /// Open a store, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_dir_all_sync(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Create a package for `model_id`, copying `original` into it.
    pub async fn create(
        &self,
        model_id: &str,
        original: Option<&Path>,
    ) -> Result<Arc<PackageData>> {
        if let Some(src) = original
            && !src.is_file()
        {
            return Err(Error::not_found("Original file", src.display().to_string()));
        }

        let (id, dir) = self.allocate(model_id).await?;

        let original_name = match original {
            Some(src) => match copy_original(src, &dir).await {
                Ok(name) => Some(name),
                Err(e) => {
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                        warn!(
                            package_id = %id,
                            error = %cleanup,
                            "Failed to remove partial package"
                        );
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let package = PackageData::new(id, dir, original_name);
        package.persist().await?;

        info!(package_id = %package.id(), model = %model_id, "Package created");
        Ok(Arc::new(package))
    }

    /// Load an existing package from disk.
    pub async fn get(&self, id: &str) -> Result<Arc<PackageData>> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(Error::not_found("Package", id));
        }
        let package = PackageData::new(id.to_string(), self.package_dir(id), None);
        package.check_directory()?;
        package.reload().await?;
        Ok(Arc::new(package))
    }

    async fn allocate(&self, model_id: &str) -> Result<(String, PathBuf)> {
        let prefix = model_id.to_uppercase();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = format!("{}-{}", prefix, random_suffix());
            let dir = self.package_dir(&id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(package_id = %id, "Package id collision, retrying");
                }
                Err(e) => return Err(io_error("creating package directory", &dir, e)),
            }
        }
        Err(Error::Other(format!(
            "could not allocate a package id for model {model_id}"
        )))
    }
}

fn random_suffix() -> String {
    let simple = Uuid::new_v4().simple().to_string().to_uppercase();
    simple[..12].to_string()
}

async fn copy_original(src: &Path, dir: &Path) -> Result<String> {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::validation(format!("original has no file name: {}", src.display())))?;
    let dest = dir.join(&name);
    tokio::fs::copy(src, &dest)
        .await
        .map_err(|e| io_error("copying original into", &dest, e))?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_copies_original_and_persists() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input.xml");
        std::fs::write(&input, b"<doc/>").unwrap();

        let store = PackageStore::open(temp.path().join("packages")).unwrap();
        let pkg = store.create("demo", Some(&input)).await.unwrap();

        assert!(pkg.id().starts_with("DEMO-"));
        assert_eq!(pkg.id().len(), "DEMO-".len() + 12);
        assert!(pkg.directory().is_dir());
        assert_eq!(pkg.original(), Some(pkg.directory().join("input.xml")));
        assert_eq!(pkg.original_size(), 6);
        assert!(pkg.directory().join(super::super::INFO_FILE).is_file());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let temp = TempDir::new().unwrap();
        let store = PackageStore::open(temp.path()).unwrap();
        let a = store.create("m", None).await.unwrap();
        let b = store.create("m", None).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_get_round_trip_and_not_found() {
        let temp = TempDir::new().unwrap();
        let store = PackageStore::open(temp.path()).unwrap();
        let pkg = store.create("demo", None).await.unwrap();
        pkg.set_parameter("profile", "print");
        pkg.persist().await.unwrap();

        let loaded = store.get(pkg.id()).await.unwrap();
        assert_eq!(loaded.parameter("profile").as_deref(), Some("print"));

        assert!(store.get("DEMO-NOPE").await.unwrap_err().is_not_found());
        assert!(store.get("../etc").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_original_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = PackageStore::open(temp.path().join("p")).unwrap();
        let err = store
            .create("demo", Some(&temp.path().join("nope.xml")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(std::fs::read_dir(store.root()).unwrap().count(), 0);
    }
}
