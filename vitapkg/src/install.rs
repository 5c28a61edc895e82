//! Post-download installation dispatcher.
//!
//! A finished download sits in `<staging>/<content-id>` with the decrypted
//! tree plus `sce_sys/package/{head,tail,stat,work}.bin`. The dispatcher
//! promotes that directory into its platform destination, selected by
//! [`InstallTarget`]: native app bubbles go through the host promoter,
//! patches are renamed into `patch/` and the shell database row is
//! refreshed, PSM and PSP content is renamed under its emulator roots.
//! All moves are single-step renames on one filesystem.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::appdb::AppDatabase;
use crate::config::InstallConfig;
use crate::error::{InstallError, InstallResult};
use crate::io::Filesystem;
use crate::sfo;

/// Length of a PSN content id.
pub const CONTENT_ID_LEN: usize = 36;

/// A validated 36-character content id, `XXNNNN-AAAAAAAAA_YY-ZZZZZZZZZZZZZZZZ`.
///
/// Bytes 7..16 are the nine-character title id used as the directory name
/// on the target filesystem; bytes 20..36 are the entitlement label used
/// for add-on content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentId {
    raw: String,
}

impl ContentId {
    pub fn parse(raw: &str) -> InstallResult<Self> {
        let bytes = raw.as_bytes();
        let well_formed = bytes.len() == CONTENT_ID_LEN
            && raw.is_ascii()
            && bytes[6] == b'-'
            && bytes[16] == b'_'
            && bytes[19] == b'-';
        if !well_formed {
            return Err(InstallError::InvalidContentId(raw.into()));
        }
        Ok(Self { raw: raw.into() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Nine-character title id.
    pub fn title_id(&self) -> &str {
        &self.raw[7..16]
    }

    /// Sixteen-character entitlement label.
    pub fn entitlement(&self) -> &str {
        &self.raw[20..36]
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Host shell promotion call, an external collaborator.
pub trait Promoter: Send {
    /// Promote a fully staged package directory into the app library.
    ///
    /// A failure is reported as the host's error message; the dispatcher
    /// wraps it into [`InstallError::Promote`].
    fn promote(&self, staged: &Path) -> Result<(), String>;
}

/// Destination category for a staged package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallTarget {
    /// Native app bubble via the host promoter.
    App,
    /// Update for an installed title, renamed into `patch/`.
    Patch,
    /// PlayStation Mobile title.
    PsmGame,
    /// Handheld game under the emulator's `GAME` directory.
    PspGame,
    /// Handheld game whose `EBOOT.PBP` is really an ISO image.
    PspIso,
}

/// Collaborators some targets need.
pub struct InstallDeps<'a> {
    pub promoter: &'a dyn Promoter,
    pub appdb: &'a mut dyn AppDatabase,
    pub psp_partition: &'a Path,
}

/// Routes staged packages into their install destinations.
pub struct Installer {
    fs: Box<dyn Filesystem>,
    config: InstallConfig,
}

impl Installer {
    pub fn new(fs: Box<dyn Filesystem>, config: InstallConfig) -> Self {
        Self { fs, config }
    }

    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    fn staged(&self, content: &ContentId) -> PathBuf {
        self.config.staged(content.as_str())
    }

    fn rename(&self, from: &Path, to: &Path) -> InstallResult<()> {
        self.fs.rename(from, to).map_err(|e| InstallError::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        })
    }

    fn mkdirs(&self, path: &Path) -> InstallResult<()> {
        self.fs.create_dir_all(path).map_err(|e| InstallError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Route a staged package to its destination.
    pub fn install(
        &self,
        target: InstallTarget,
        content: &ContentId,
        deps: &mut InstallDeps<'_>,
    ) -> InstallResult<()> {
        match target {
            InstallTarget::App => self.install_app(deps.promoter, content),
            InstallTarget::Patch => self.install_patch(deps.appdb, content),
            InstallTarget::PsmGame => self.install_psm_game(content),
            InstallTarget::PspGame => self.install_psp_game(deps.psp_partition, content),
            InstallTarget::PspIso => self.install_psp_game_as_iso(deps.psp_partition, content),
        }
    }

    /// Titles currently present in the app library.
    pub fn installed_games(&self) -> InstallResult<Vec<String>> {
        match self.fs.list_dir(&self.config.app_dir()) {
            Ok(names) => Ok(names),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(InstallError::Io {
                path: self.config.app_dir(),
                source: e,
            }),
        }
    }

    fn package_version(&self, package_dir: &Path) -> InstallResult<String> {
        let sfo_path = package_dir.join("sce_sys").join("param.sfo");
        let data = self.fs.load(&sfo_path).map_err(|e| InstallError::Io {
            path: sfo_path,
            source: e,
        })?;
        Ok(sfo::get_string(&data, "APP_VER")?.unwrap_or_default())
    }

    /// Installed version of a title, preferring the patch over the base
    /// app. Empty when the title is not installed.
    pub fn game_version(&self, titleid: &str) -> InstallResult<String> {
        let patch_dir = self.config.patch_dir().join(titleid);
        if self.fs.exists(&patch_dir) {
            return self.package_version(&patch_dir);
        }
        let game_dir = self.config.app_dir().join(titleid);
        if self.fs.exists(&game_dir) {
            return self.package_version(&game_dir);
        }
        Ok(String::new())
    }

    pub fn dlc_is_installed(&self, content: &ContentId) -> bool {
        self.fs.exists(
            &self
                .config
                .addcont_dir()
                .join(content.title_id())
                .join(content.entitlement()),
        )
    }

    pub fn psm_is_installed(&self, titleid: &str) -> bool {
        self.fs.exists(&self.config.psm_dir().join(titleid))
    }

    pub fn psp_is_installed(&self, partition: &Path, content: &ContentId) -> bool {
        let titleid = content.title_id();
        self.fs.exists(
            &InstallConfig::pspemu_iso_dir(partition).join(format!("{titleid}.iso")),
        ) || self
            .fs
            .exists(&InstallConfig::pspemu_game_dir(partition).join(titleid))
    }

    pub fn psx_is_installed(&self, partition: &Path, content: &ContentId) -> bool {
        self.fs
            .exists(&InstallConfig::pspemu_game_dir(partition).join(content.title_id()))
    }

    /// Hand the staged directory to the host promoter.
    pub fn install_app(&self, promoter: &dyn Promoter, content: &ContentId) -> InstallResult<()> {
        let staged = self.staged(content);
        info!(content = %content, path = %staged.display(), "promoting package");
        promoter.promote(&staged).map_err(InstallError::Promote)
    }

    /// Install a game update and refresh the shell database row.
    pub fn install_patch(
        &self,
        appdb: &mut dyn AppDatabase,
        content: &ContentId,
    ) -> InstallResult<()> {
        let titleid = content.title_id();
        self.mkdirs(&self.config.patch_dir())?;

        let src = self.staged(content);
        let dest = self.config.patch_dir().join(titleid);

        if self.fs.exists(&dest) {
            debug!(path = %dest.display(), "deleting previous patch");
            self.fs.remove_dir_all(&dest).map_err(|e| InstallError::Io {
                path: dest.clone(),
                source: e,
            })?;
        }

        info!(from = %src.display(), to = %dest.display(), "installing update");
        self.rename(&src, &dest)?;

        let version = self.package_version(&dest)?;
        debug!(version = %version, "patch version");
        if version.len() != 5 {
            return Err(InstallError::BadVersion(version));
        }

        appdb.set_app_version(titleid, &version)
    }

    /// Install a PlayStation Mobile title.
    pub fn install_psm_game(&self, content: &ContentId) -> InstallResult<()> {
        self.mkdirs(&self.config.psm_dir())?;
        let src = self.staged(content);
        let dest = self.config.psm_dir().join(content.title_id());
        info!(from = %src.display(), to = %dest.display(), "installing psm game");
        self.rename(&src, &dest)
    }

    /// Install a handheld game as a directory under `pspemu/PSP/GAME`.
    pub fn install_psp_game(&self, partition: &Path, content: &ContentId) -> InstallResult<()> {
        let src = self.staged(content);
        let dest = InstallConfig::pspemu_game_dir(partition).join(content.title_id());
        self.mkdirs(&InstallConfig::pspemu_game_dir(partition))?;
        info!(from = %src.display(), to = %dest.display(), "installing psp game");
        self.rename(&src, &dest)
    }

    /// Install a handheld game whose staged `EBOOT.PBP` is a misnamed ISO.
    ///
    /// The image moves to `pspemu/ISO/<titleid>.iso`; `CONTENT.DAT` and
    /// `PSP-KEY.EDAT`, when present, land in the title's `GAME` directory.
    pub fn install_psp_game_as_iso(
        &self,
        partition: &Path,
        content: &ContentId,
    ) -> InstallResult<()> {
        let titleid = content.title_id();
        let staged = self.staged(content);
        let game_dest = InstallConfig::pspemu_game_dir(partition).join(titleid);
        let iso_dest = InstallConfig::pspemu_iso_dir(partition).join(format!("{titleid}.iso"));

        self.mkdirs(&InstallConfig::pspemu_iso_dir(partition))?;
        info!(from = %staged.display(), to = %iso_dest.display(), "installing psp game as iso");
        self.rename(&staged.join("EBOOT.PBP"), &iso_dest)?;

        let content_dat = staged.join("CONTENT.DAT");
        let psp_key = staged.join("PSP-KEY.EDAT");
        let content_exists = self.fs.exists(&content_dat);
        let psp_key_exists = self.fs.exists(&psp_key);

        if content_exists || psp_key_exists {
            self.mkdirs(&game_dest)?;
        }
        if content_exists {
            self.rename(&content_dat, &game_dest.join("CONTENT.DAT"))?;
        }
        if psp_key_exists {
            self.rename(&psp_key, &game_dest.join("PSP-KEY.EDAT"))?;
        }

        self.fs
            .remove_dir_all(&staged)
            .map_err(|e| InstallError::Io {
                path: staged,
                source: e,
            })
    }
}
