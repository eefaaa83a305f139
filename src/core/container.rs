//! Home containers - Per-instance virtual home directories
//!
//! A container holds private copies of the directories an application writes
//! its state to, and symlinks back to the real home for locations the user
//! expects to stay shared. Removing a container removes only the links, never
//! the shared data behind them.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::app_type::AppType;
use super::isolation::PROFILE_SUBDIR;
use crate::error::{InstanceError, Result};

/// Directories that are private to each instance
pub const ISOLATED_DIRECTORIES: &[&str] = &[
    "Library/Application Support",
    "Library/Caches",
    "Library/Cookies",
    "Library/Saved Application State",
    "Library/Preferences",
    "Library/Logs",
    "Library/WebKit",
    "Library/HTTPStorages",
    ".config",
    ".cache",
    ".local/share",
    "tmp",
];

/// Real-home locations linked into every container
pub const SHARED_LOCATIONS: &[&str] = &[
    "Desktop",
    "Documents",
    "Downloads",
    "Movies",
    "Music",
    "Pictures",
    "Library/Keychains",
    "Library/Fonts",
    "Library/Preferences/com.apple.security.plist",
];

fn type_extras(app_type: AppType) -> &'static [&'static str] {
    match app_type {
        AppType::Firefox => &["Library/Application Support/Firefox", PROFILE_SUBDIR],
        AppType::Chromium => &["Library/Application Support/Google"],
        AppType::Electron | AppType::ToDesktop => &["Library/Application Support/Electron"],
        AppType::Generic | AppType::Sandboxed | AppType::System => &[],
    }
}

/// Read-only diagnostic for a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerValidation {
    pub missing_directories: Vec<PathBuf>,
    pub broken_symlinks: Vec<PathBuf>,
}

impl ContainerValidation {
    pub fn is_valid(&self) -> bool {
        self.missing_directories.is_empty() && self.broken_symlinks.is_empty()
    }
}

/// Builds, validates and removes home containers
pub struct ContainerBuilder {
    /// Home directory the shared locations link back to
    real_home: PathBuf,
    /// Serializes builds and removals
    lock: Mutex<()>,
}

impl ContainerBuilder {
    pub fn new(real_home: impl Into<PathBuf>) -> Self {
        Self {
            real_home: real_home.into(),
            lock: Mutex::new(()),
        }
    }

    /// Create the container. Existing directories and links are left alone,
    /// so this is safe to re-run after a partial failure.
    pub fn build(&self, container: &Path, app_type: AppType) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| InstanceError::Environment(format!("Container lock poisoned: {}", e)))?;

        create_dir(container)?;
        for rel in ISOLATED_DIRECTORIES.iter().chain(type_extras(app_type)) {
            create_dir(&container.join(rel))?;
        }

        let mut linked = 0;
        for rel in SHARED_LOCATIONS {
            if self.link_shared(container, rel)? {
                linked += 1;
            }
        }

        info!(
            "Container ready at {:?} ({} new shared links)",
            container, linked
        );
        Ok(())
    }

    /// Create one extra directory inside an existing container
    pub fn ensure_directory(&self, container: &Path, rel: &str) -> Result<PathBuf> {
        let path = container.join(rel);
        create_dir(&path)?;
        Ok(path)
    }

    /// Returns true when a new link was created.
    fn link_shared(&self, container: &Path, rel: &str) -> Result<bool> {
        let real = self.real_home.join(rel);
        let link = container.join(rel);

        if link.symlink_metadata().is_ok() {
            return Ok(false);
        }
        if !real.exists() {
            debug!("Skipping shared location {:?}, not present", real);
            return Ok(false);
        }
        if let Some(parent) = link.parent() {
            create_dir(parent)?;
        }

        symlink(&real, &link)?;
        debug!("Linked {:?} -> {:?}", link, real);
        Ok(true)
    }

    /// Report missing isolated directories and dangling shared links.
    pub fn validate(&self, container: &Path) -> ContainerValidation {
        let missing_directories = ISOLATED_DIRECTORIES
            .iter()
            .map(|rel| container.join(rel))
            .filter(|path| !path.is_dir())
            .collect();

        let broken_symlinks = SHARED_LOCATIONS
            .iter()
            .map(|rel| container.join(rel))
            .filter(|path| {
                path.symlink_metadata()
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                    && std::fs::metadata(path).is_err()
            })
            .collect();

        ContainerValidation {
            missing_directories,
            broken_symlinks,
        }
    }

    /// Delete the container. Shared entries are links, so the real data stays.
    pub fn remove(&self, container: &Path) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| InstanceError::Environment(format!("Container lock poisoned: {}", e)))?;

        if container.symlink_metadata().is_err() {
            return Ok(());
        }
        std::fs::remove_dir_all(container)
            .map_err(|e| InstanceError::environment("Failed to remove", container, e))?;
        info!("Removed container {:?}", container);
        Ok(())
    }

    /// Wipe and rebuild a container
    pub fn reset(&self, container: &Path, app_type: AppType) -> Result<()> {
        self.remove(container)?;
        self.build(container, app_type)
    }

    /// Rebuild whatever validation reports as missing. Dangling links are
    /// dropped and recreated if their target has come back.
    pub fn repair(&self, container: &Path, app_type: AppType) -> Result<ContainerValidation> {
        let report = self.validate(container);
        for link in &report.broken_symlinks {
            if let Err(e) = std::fs::remove_file(link) {
                warn!("Failed to remove dangling link {:?}: {}", link, e);
            }
        }
        self.build(container, app_type)?;
        Ok(self.validate(container))
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| InstanceError::environment("Failed to create directory", path, e))
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| InstanceError::environment("Failed to create symlink", link, e))
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(InstanceError::Environment(format!(
        "Symlinked containers are not supported on this platform: {}",
        link.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_home() -> TempDir {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join("Documents")).unwrap();
        std::fs::create_dir_all(home.path().join("Desktop")).unwrap();
        std::fs::create_dir_all(home.path().join("Library/Keychains")).unwrap();
        std::fs::write(home.path().join("Documents/notes.txt"), "keep me").unwrap();
        home
    }

    fn count_links(container: &Path) -> usize {
        SHARED_LOCATIONS
            .iter()
            .filter(|rel| {
                container
                    .join(rel)
                    .symlink_metadata()
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
            })
            .count()
    }

    #[test]
    fn test_build_creates_dirs_and_links() {
        let home = fake_home();
        let data = TempDir::new().unwrap();
        let container = data.path().join("instance");
        let builder = ContainerBuilder::new(home.path());

        builder.build(&container, AppType::Generic).unwrap();

        for rel in ISOLATED_DIRECTORIES {
            assert!(container.join(rel).is_dir(), "missing {}", rel);
        }
        assert_eq!(count_links(&container), 3);
        assert!(container.join("Documents/notes.txt").exists());
        assert!(container.join("Movies").symlink_metadata().is_err());
        assert!(builder.validate(&container).is_valid());
    }

    #[test]
    fn test_build_is_idempotent() {
        let home = fake_home();
        let data = TempDir::new().unwrap();
        let container = data.path().join("instance");
        let builder = ContainerBuilder::new(home.path());

        builder.build(&container, AppType::Chromium).unwrap();
        builder.build(&container, AppType::Chromium).unwrap();
        assert_eq!(count_links(&container), 3);
        assert!(container.join("Library/Application Support/Google").is_dir());
    }

    #[test]
    fn test_firefox_extras_include_profile() {
        let home = fake_home();
        let data = TempDir::new().unwrap();
        let container = data.path().join("fx");
        ContainerBuilder::new(home.path())
            .build(&container, AppType::Firefox)
            .unwrap();
        assert!(container.join(PROFILE_SUBDIR).is_dir());
    }

    #[test]
    fn test_validate_reports_problems() {
        let home = fake_home();
        let data = TempDir::new().unwrap();
        let container = data.path().join("instance");
        let builder = ContainerBuilder::new(home.path());
        builder.build(&container, AppType::Generic).unwrap();

        std::fs::remove_dir_all(container.join("Library/Caches")).unwrap();
        std::fs::remove_dir_all(home.path().join("Desktop")).unwrap();

        let report = builder.validate(&container);
        assert_eq!(report.missing_directories, vec![container.join("Library/Caches")]);
        assert_eq!(report.broken_symlinks, vec![container.join("Desktop")]);
        assert!(!report.is_valid());

        let repaired = builder.repair(&container, AppType::Generic).unwrap();
        assert!(repaired.is_valid());
    }

    #[test]
    fn test_remove_keeps_shared_data() {
        let home = fake_home();
        let data = TempDir::new().unwrap();
        let container = data.path().join("instance");
        let builder = ContainerBuilder::new(home.path());
        builder.build(&container, AppType::Generic).unwrap();
        std::fs::write(container.join("Library/Caches/blob"), "private").unwrap();

        builder.remove(&container).unwrap();

        assert!(!container.exists());
        assert_eq!(
            std::fs::read_to_string(home.path().join("Documents/notes.txt")).unwrap(),
            "keep me"
        );
        builder.remove(&container).unwrap();
    }

    #[test]
    fn test_reset_clears_private_data() {
        let home = fake_home();
        let data = TempDir::new().unwrap();
        let container = data.path().join("instance");
        let builder = ContainerBuilder::new(home.path());
        builder.build(&container, AppType::Generic).unwrap();
        std::fs::write(container.join("Library/Caches/blob"), "private").unwrap();

        builder.reset(&container, AppType::Generic).unwrap();
        assert!(!container.join("Library/Caches/blob").exists());
        assert!(builder.validate(&container).is_valid());
    }
}
