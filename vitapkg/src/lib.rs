//! **vitapkg** - streaming PKG download, decryption and install staging
//! for the PlayStation Vita family.
//!
//! The crate fetches an encrypted PKG over range-resumable HTTP, derives
//! the package key from the header, and interleaves download / AES-CTR
//! decryption / SHA-256 hashing / writing into a staging directory that
//! the platform then promotes into the installed library.
//!
//! # Modules
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | the streaming download session (the core) |
//! | [`format`]   | PKG container layouts |
//! | [`crypto`]   | key ladder + seekable AES-CTR |
//! | [`install`]  | post-download placement dispatcher |
//! | [`comppack`] | compatibility-pack install |
//! | [`http`], [`io`] | collaborator traits + real implementations |
//!
//! # Example
//!
//! ```ignore
//! use vitapkg::{Download, DownloadRequest, ReqwestSource, StdFilesystem};
//!
//! let mut download = Download::new(
//!     Box::new(ReqwestSource::new()?),
//!     Box::new(StdFilesystem::new()),
//!     "/data/pkgj",
//!     DownloadRequest {
//!         content_id: "EP0000-PCSE00000_00-0000000000000000".into(),
//!         url: "http://example.com/game.pkg".into(),
//!         rif: None,
//!         digest: None,
//!     },
//! )?;
//! download.run()?;
//! ```

pub mod appdb;
pub mod bytes;
pub mod comppack;
pub mod config;
pub mod crypto;
pub mod error;
pub mod format;
pub mod http;
pub mod install;
pub mod io;
pub mod pipeline;
pub mod progress;
pub mod sfo;

pub use config::InstallConfig;
pub use error::{DownloadError, DownloadResult, InstallError, InstallResult};
pub use format::ContentType;
pub use http::{HttpSource, ReqwestSource};
pub use install::{ContentId, InstallTarget, Installer};
pub use io::{Filesystem, StdFilesystem};
pub use pipeline::{Download, DownloadOutcome, DownloadRequest};
pub use progress::{CancelToken, ProgressSnapshot};
