//! Install-root configuration.
//!
//! On the console the destinations are fixed mount points (`ux0:`, the PSP
//! emulator partition); here they are configurable roots so the whole tree
//! can be pointed at a temp dir under test.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Roots and tunables for staging and installation.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// The `ux0:` equivalent; apps, patches, DLC, PSM and comp-packs all
    /// live under it.
    pub ux0: PathBuf,
    /// Default partition hosting `pspemu/`.
    pub psp_partition: PathBuf,
    /// Where packages are staged while downloading.
    pub staging_dir: PathBuf,
    /// HTTP connect timeout.
    pub timeout: Duration,
}

impl InstallConfig {
    pub fn new(ux0: impl Into<PathBuf>) -> Self {
        let ux0 = ux0.into();
        Self {
            psp_partition: ux0.clone(),
            staging_dir: ux0.join("pkgj"),
            ux0,
            timeout: Duration::from_secs(30),
        }
    }

    /// Use a different partition for PSP content.
    pub fn with_psp_partition(mut self, partition: impl Into<PathBuf>) -> Self {
        self.psp_partition = partition.into();
        self
    }

    /// Stage downloads somewhere other than `<ux0>/pkgj`.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Staging directory for one package.
    pub fn staged(&self, content_id: &str) -> PathBuf {
        self.staging_dir.join(content_id)
    }

    pub fn app_dir(&self) -> PathBuf {
        self.ux0.join("app")
    }

    pub fn patch_dir(&self) -> PathBuf {
        self.ux0.join("patch")
    }

    pub fn addcont_dir(&self) -> PathBuf {
        self.ux0.join("addcont")
    }

    pub fn psm_dir(&self) -> PathBuf {
        self.ux0.join("psm")
    }

    pub fn repatch_dir(&self) -> PathBuf {
        self.ux0.join("rePatch")
    }

    /// `<partition>/pspemu/PSP/GAME`.
    pub fn pspemu_game_dir(partition: &Path) -> PathBuf {
        partition.join("pspemu").join("PSP").join("GAME")
    }

    /// `<partition>/pspemu/ISO`.
    pub fn pspemu_iso_dir(partition: &Path) -> PathBuf {
        partition.join("pspemu").join("ISO")
    }
}
