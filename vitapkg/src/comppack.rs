//! Compatibility-pack (`.ppk`) installation.
//!
//! Comp-packs are plain ZIP archives of patched game data, extracted under
//! `rePatch/<titleid>` next to (but independent of) the main PKG pipeline.
//! A small sidecar file records the declared pack version so the UI can
//! badge titles whose pack is out of date.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::config::InstallConfig;
use crate::error::{InstallError, InstallResult};
use crate::io::Filesystem;

/// Installed comp-pack state for one title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompPackVersion {
    /// Whether `rePatch/<titleid>` exists at all.
    pub present: bool,
    /// Declared base-pack version, empty when the sidecar is missing.
    pub base: String,
    /// Declared patch-pack version, empty when the sidecar is missing.
    pub patch: String,
}

/// Install a comp-pack archive for `titleid`.
///
/// A base pack replaces the whole `rePatch/<titleid>` directory; a patch
/// pack extracts on top of it. The version string is recorded in the
/// matching sidecar.
pub fn install_comppack(
    fs: &dyn Filesystem,
    config: &InstallConfig,
    titleid: &str,
    patch: bool,
    version: &str,
    archive: &Path,
) -> InstallResult<()> {
    let dest = config.repatch_dir().join(titleid);

    if !patch && fs.exists(&dest) {
        fs.remove_dir_all(&dest).map_err(|e| InstallError::Io {
            path: dest.clone(),
            source: e,
        })?;
    }
    fs.create_dir_all(&dest).map_err(|e| InstallError::Io {
        path: dest.clone(),
        source: e,
    })?;

    debug!(archive = %archive.display(), dest = %dest.display(), "installing comp pack");
    let entries = extract_zip(archive, &dest)?;
    debug!(entries, "comp pack extracted");

    let sidecar = dest.join(if patch {
        "patch_comppack_version"
    } else {
        "base_comppack_version"
    });
    fs.save(&sidecar, version.as_bytes())
        .map_err(|e| InstallError::Io {
            path: sidecar,
            source: e,
        })
}

/// Read back the installed comp-pack versions for `titleid`.
///
/// Missing sidecars read as empty strings; the title directory itself may
/// exist without either.
pub fn comppack_versions(
    fs: &dyn Filesystem,
    config: &InstallConfig,
    titleid: &str,
) -> CompPackVersion {
    let dir = config.repatch_dir().join(titleid);
    let read_sidecar = |name: &str| -> String {
        fs.load(&dir.join(name))
            .map(|data| String::from_utf8_lossy(&data).into_owned())
            .unwrap_or_default()
    };

    CompPackVersion {
        present: fs.exists(&dir),
        base: read_sidecar("base_comppack_version"),
        patch: read_sidecar("patch_comppack_version"),
    }
}

/// Inflate a ZIP archive into `dest`, returning the number of entries.
fn extract_zip(archive_path: &Path, dest: &Path) -> InstallResult<usize> {
    let archive_err = |reason: String| InstallError::Archive {
        path: archive_path.to_path_buf(),
        reason,
    };

    let file = File::open(archive_path).map_err(|e| archive_err(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| archive_err(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| archive_err(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            // Entry escapes the destination; a hostile archive, not ours.
            return Err(archive_err(format!("unsafe entry name {:?}", entry.name())));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| InstallError::Io {
                path: target.clone(),
                source: e,
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut out = File::create(&target).map_err(|e| InstallError::Io {
            path: target.clone(),
            source: e,
        })?;
        io::copy(&mut entry, &mut out).map_err(|e| InstallError::Io {
            path: target.clone(),
            source: e,
        })?;
    }

    Ok(archive.len())
}
