//! Device identity
//!
//! Every store is owned by one site. The site ID is minted on first run and
//! kept in `<data_dir>/site_id` so that records created on this device keep a
//! stable owner across restarts. Restoring a device means initializing it with
//! the site ID it had before.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Config;
use crate::id::SiteId;

/// Identity manager
pub struct Identity {
    config: Config,
}

/// Result of initialization
#[derive(Debug)]
pub struct InitResult {
    pub site_id: SiteId,
    /// Whether the ID was freshly generated (vs supplied by the user)
    pub is_new: bool,
}

impl Identity {
    /// Identity manager for the data directory in `config`
    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    /// Check if this device has a site ID
    pub fn is_initialized(&self) -> bool {
        self.config.site_id_path().exists()
    }

    /// Get the site ID if initialized
    pub fn site_id(&self) -> Result<Option<SiteId>> {
        let path = self.config.site_id_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read site ID from {:?}", path))?;
        let site_id = content
            .trim()
            .parse()
            .with_context(|| format!("Invalid site ID in {:?}", path))?;
        Ok(Some(site_id))
    }

    /// Get the site ID, creating a random one on first use
    pub fn load_or_create(&self) -> Result<SiteId> {
        match self.site_id()? {
            Some(site_id) => Ok(site_id),
            None => Ok(self.initialize_new()?.site_id),
        }
    }

    /// Initialize with a new random site ID
    ///
    /// Returns an error if already initialized.
    pub fn initialize_new(&self) -> Result<InitResult> {
        self.initialize(SiteId::new(), true)
    }

    /// Initialize with a known site ID, e.g. when restoring a device
    ///
    /// Returns an error if already initialized.
    pub fn initialize_with(&self, site_id: SiteId) -> Result<InitResult> {
        self.initialize(site_id, false)
    }

    fn initialize(&self, site_id: SiteId, is_new: bool) -> Result<InitResult> {
        if self.is_initialized() {
            anyhow::bail!("Already initialized. Use `tally status` to see your site ID.");
        }

        let path = self.config.site_id_path();
        atomic_write(&path, site_id.to_string().as_bytes())?;
        info!(site = %site_id, "Initialized site identity");

        Ok(InitResult { site_id, is_new })
    }

    /// Get the data directory path (for display purposes)
    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }
}

/// Write data to a file atomically
///
/// Writes to a temporary file next to `path`, syncs it, then renames it over
/// the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_not_initialized_initially() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        assert!(!identity.is_initialized());
        assert!(identity.site_id().unwrap().is_none());
    }

    #[test]
    fn test_initialize_new() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        let result = identity.initialize_new().unwrap();
        assert!(result.is_new);
        assert!(identity.is_initialized());
        assert_eq!(identity.site_id().unwrap(), Some(result.site_id));
    }

    #[test]
    fn test_initialize_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        identity.initialize_new().unwrap();
        let err = identity.initialize_with(SiteId::new()).unwrap_err();
        assert!(err.to_string().contains("Already initialized"));
    }

    #[test]
    fn test_initialize_with_known_site() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));
        let site = SiteId::new();

        let result = identity.initialize_with(site).unwrap();
        assert!(!result.is_new);
        assert_eq!(identity.load_or_create().unwrap(), site);
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let first = Identity::with_config(config.clone()).load_or_create().unwrap();
        let second = Identity::with_config(config).load_or_create().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_site_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        fs::write(config.site_id_path(), "not-a-uuid").unwrap();

        let identity = Identity::with_config(config);
        assert!(identity.site_id().is_err());
        assert!(identity.load_or_create().is_err());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b").join("site_id");

        atomic_write(&nested, b"test data").unwrap();
        assert_eq!(fs::read(&nested).unwrap(), b"test data");
        assert!(!nested.with_extension("tmp").exists());
    }
}
