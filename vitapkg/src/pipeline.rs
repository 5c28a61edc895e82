//! The streaming PKG pipeline.
//!
//! A [`Download`] session interleaves download, decryption, hashing and
//! writing on a single worker: every byte pulled from the HTTP stream goes
//! through [`Download::download_data`] exactly once, in arrival order, where
//! it is fed to the running SHA-256, optionally CTR-decrypted at the item's
//! stream offset, and optionally written to the currently open output file.
//!
//! Phases, in order:
//!
//! 1. **head** - buffer header + meta + file index + name region, verify
//!    magics and the zRIF content id, derive the package key.
//! 2. **files** - walk the file index, materialising the decrypted tree.
//! 3. **tail** - drain the remainder into `tail.bin`.
//! 4. **stat / integrity / rif** - write `stat.bin`, check the SHA-256
//!    digest, write `work.bin`.
//!
//! Cancellation is cooperative and is not an error: phases unwind returning
//! [`DownloadOutcome::Cancelled`], open files are closed, and the staged
//! directory is kept. Calling [`Download::run`] again resumes from the
//! retained byte offset.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::bytes::memequ;
use crate::crypto::{derive_key, PkgCipher};
use crate::error::{DownloadError, DownloadResult};
use crate::format::{
    parse_meta, ContentType, EntryKind, IndexEntry, PkgHeader, INDEX_ENTRY_SIZE, PKG_HEADER_EXT_SIZE,
    PKG_HEADER_SIZE,
};
use crate::http::HttpSource;
use crate::io::Filesystem;
use crate::progress::{CancelToken, ProgressCallback, ProgressState};

/// Read granularity of the HTTP stream.
const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on the buffered header + meta + index + name region.
///
/// The smallest power of two strictly above the region size of the largest
/// known first-party package. A package exceeding it is reported as
/// unsupported ("head too large"), never as an allocation failure, and the
/// bound keeps a hostile index count from forcing unbounded growth.
pub const HEAD_CAPACITY: usize = 4 * 1024 * 1024;

/// Size of a Vita RIF license blob (`work.bin`).
pub const RIF_SIZE: usize = 512;

/// Size of the zero-filled `stat.bin`.
const STAT_SIZE: usize = 768;

/// Longest accepted item name, including the terminator of the wire format.
const ITEM_NAME_MAX: usize = 256;

/// Minimum interval between progress callback invocations.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// How a completed `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    /// The cancel token was set; staged state is retained for resumption.
    Cancelled,
}

/// Inputs for one package download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// 36-character PSN content id; names the staging directory.
    pub content_id: String,
    /// Resumable HTTP(S) URL of the PKG.
    pub url: String,
    /// RIF license blob, written verbatim as `work.bin` and checked
    /// against the package's content id.
    pub rif: Option<Vec<u8>>,
    /// Expected SHA-256 of the whole package.
    pub digest: Option<[u8; 32]>,
}

/// One PKG download session.
///
/// The session owns its collaborators and all mutable state. After a
/// cancelled `run`, the byte counters, head buffer and hash state are
/// retained; reset the cancel token and call `run` again to resume from
/// `download_offset`.
pub struct Download {
    http: Box<dyn HttpSource>,
    fs: Box<dyn Filesystem>,
    progress: Arc<ProgressState>,
    cancel: CancelToken,
    on_progress: Option<ProgressCallback>,
    last_report: Instant,

    content_id: String,
    url: String,
    rif: Option<Vec<u8>>,
    digest: Option<[u8; 32]>,
    root: PathBuf,

    http_open: bool,
    /// True while re-running after a cancellation; enables the skip and
    /// rebase paths that are never legitimate on a first pass.
    resumed_session: bool,
    download_offset: u64,
    download_size: u64,

    head: Vec<u8>,
    scratch: Vec<u8>,
    sha: Sha256,
    cipher: PkgCipher,

    total_size: u64,
    enc_offset: u64,
    enc_size: u64,
    index_count: u32,
    content_type: Option<ContentType>,

    item_file: Option<Box<dyn Write + Send>>,
    item_path: PathBuf,
    item_name: String,
    encrypted_base: u64,
    encrypted_offset: u64,
    decrypted_size: u64,
}

impl Download {
    /// Create a session staging into `<staging_dir>/<content_id>`.
    pub fn new(
        http: Box<dyn HttpSource>,
        fs: Box<dyn Filesystem>,
        staging_dir: impl Into<PathBuf>,
        request: DownloadRequest,
    ) -> DownloadResult<Self> {
        if let Some(rif) = &request.rif {
            if rif.len() != RIF_SIZE {
                return Err(DownloadError::Format(format!(
                    "bad RIF size: {} bytes, expected {RIF_SIZE}",
                    rif.len()
                )));
            }
        }

        let root = staging_dir.into().join(&request.content_id);
        Ok(Self {
            http,
            fs,
            progress: ProgressState::new(),
            cancel: CancelToken::new(),
            on_progress: None,
            last_report: Instant::now(),
            content_id: request.content_id,
            url: request.url,
            rif: request.rif,
            digest: request.digest,
            root,
            http_open: false,
            resumed_session: false,
            download_offset: 0,
            download_size: 0,
            head: Vec::new(),
            scratch: vec![0u8; CHUNK_SIZE],
            sha: Sha256::new(),
            cipher: PkgCipher::new([0u8; 16], [0u8; 16]),
            total_size: 0,
            enc_offset: 0,
            enc_size: 0,
            index_count: 0,
            content_type: None,
            item_file: None,
            item_path: PathBuf::new(),
            item_name: String::new(),
            encrypted_base: 0,
            encrypted_offset: 0,
            decrypted_size: 0,
        })
    }

    /// Attach a throttled progress observer.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Shared counters for a UI thread.
    pub fn progress(&self) -> Arc<ProgressState> {
        Arc::clone(&self.progress)
    }

    /// Token observed at the top of every read. Reset it before resuming a
    /// cancelled session.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Bytes consumed from the wire so far.
    pub fn download_offset(&self) -> u64 {
        self.download_offset
    }

    /// Content class, known once the head phase has parsed the meta table.
    pub fn content_type(&self) -> Option<ContentType> {
        self.content_type
    }

    /// Staging directory of this session.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run the pipeline to completion or cancellation.
    pub fn run(&mut self) -> DownloadResult<DownloadOutcome> {
        info!(
            content = %self.content_id,
            root = %self.root.display(),
            offset = self.download_offset,
            "starting pkg download"
        );
        // The stream from a cancelled session is stale; reopen lazily at
        // the current offset.
        self.http_open = false;
        self.resumed_session = self.download_offset > 0;

        if !self.download_head()? {
            return Ok(DownloadOutcome::Cancelled);
        }
        if !self.download_files()? {
            return Ok(DownloadOutcome::Cancelled);
        }
        if !self.download_tail()? {
            return Ok(DownloadOutcome::Cancelled);
        }
        if !self.is_psp_disc() {
            self.create_stat()?;
        }
        self.check_integrity()?;
        if self.rif.is_some() {
            self.create_rif()?;
        }

        self.report_progress(true);
        info!("pkg download complete");
        Ok(DownloadOutcome::Completed)
    }

    fn is_psp_disc(&self) -> bool {
        self.content_type == Some(ContentType::PspGame)
    }

    /// The single funnel every wire byte passes through.
    ///
    /// Reads up to `size` bytes into the scratch buffer, feeds them to the
    /// hash, decrypts them in place at the current item's stream offset
    /// when `encrypted`, and appends the plaintext prefix capped by
    /// `decrypted_size` to the open item file when `save`. Returns 0 only
    /// on cancellation.
    fn download_data(&mut self, size: usize, encrypted: bool, save: bool) -> DownloadResult<usize> {
        if self.cancel.is_cancelled() {
            return Ok(0);
        }
        self.report_progress(false);

        if !self.http_open {
            debug!(url = %self.url, offset = self.download_offset, "requesting pkg stream");
            self.http.start(&self.url, self.download_offset)?;
            let length = self.http.length()?;
            self.download_size = length.saturating_add(self.download_offset);
            self.progress.set_total(self.download_size);
            self.progress.set_bytes(self.download_offset);
            debug!(length, total = self.download_size, "pkg stream open");
            self.http_open = true;
        }

        let size = size.min(CHUNK_SIZE);
        let read = self.http.read(&mut self.scratch[..size])?;
        if read == 0 {
            return Err(DownloadError::Transport("connection closed".into()));
        }
        self.download_offset += read as u64;
        self.progress.add_bytes(read as u64);

        self.sha.update(&self.scratch[..read]);

        if encrypted {
            self.cipher.apply(
                self.encrypted_base + self.encrypted_offset,
                &mut self.scratch[..read],
            );
            self.encrypted_offset += read as u64;
        }

        if save {
            let write = if encrypted {
                self.decrypted_size.min(read as u64) as usize
            } else {
                read
            };
            if write > 0 {
                match self.item_file.as_mut() {
                    Some(file) => {
                        file.write_all(&self.scratch[..write])
                            .map_err(|e| DownloadError::Io {
                                path: self.item_path.clone(),
                                source: e,
                            })?;
                    }
                    None => {
                        return Err(DownloadError::Io {
                            path: self.item_path.clone(),
                            source: io::Error::new(io::ErrorKind::NotFound, "no open item file"),
                        });
                    }
                }
            }
            if encrypted {
                self.decrypted_size -= write as u64;
            }
        }

        Ok(read)
    }

    fn report_progress(&mut self, force: bool) {
        if !force && self.last_report.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&self.progress.snapshot());
        }
        self.last_report = Instant::now();
    }

    fn set_item_name(&mut self, name: &str) {
        self.item_name.clear();
        self.item_name.push_str(name);
        self.progress.set_item_name(name);
    }

    /// Create `item_path` (and any missing parent directories) for writing.
    fn create_item_file(&mut self) -> DownloadResult<()> {
        if let Some(parent) = self.item_path.parent() {
            self.fs
                .create_dir_all(parent)
                .map_err(|e| DownloadError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        debug!(name = %self.item_name, path = %self.item_path.display(), "creating file");
        let file = self.fs.create(&self.item_path).map_err(|e| DownloadError::Io {
            path: self.item_path.clone(),
            source: e,
        })?;
        self.item_file = Some(file);
        Ok(())
    }

    /// Reopen `item_path` for appending when resuming mid-item.
    fn open_item_append(&mut self) -> DownloadResult<()> {
        debug!(name = %self.item_name, path = %self.item_path.display(), "reopening file for resume");
        let file = self.fs.append(&self.item_path).map_err(|e| DownloadError::Io {
            path: self.item_path.clone(),
            source: e,
        })?;
        self.item_file = Some(file);
        Ok(())
    }

    fn close_item_file(&mut self) {
        self.item_file = None;
    }

    /// Grow the head buffer (and `head.bin`) up to `target` bytes.
    fn fill_head(&mut self, target: u64) -> DownloadResult<bool> {
        if target > HEAD_CAPACITY as u64 {
            return Err(DownloadError::Format("head too large".into()));
        }
        while (self.head.len() as u64) < target {
            let want = (target - self.head.len() as u64).min(CHUNK_SIZE as u64) as usize;
            let read = self.download_data(want, false, true)?;
            if read == 0 {
                return Ok(false);
            }
            self.head.extend_from_slice(&self.scratch[..read]);
        }
        Ok(true)
    }

    fn download_head(&mut self) -> DownloadResult<bool> {
        let result = self.download_head_inner();
        self.close_item_file();
        result
    }

    fn download_head_inner(&mut self) -> DownloadResult<bool> {
        debug!("downloading pkg head");
        self.set_item_name("Preparing...");
        self.item_path = self.root.join("sce_sys").join("package").join("head.bin");
        self.create_item_file()?;

        if !self.head.is_empty() {
            // Resumed session: bytes buffered by earlier sessions will not
            // arrive from the wire again, rewrite them first.
            let head = std::mem::take(&mut self.head);
            let rewritten = match self.item_file.as_mut() {
                Some(file) => file.write_all(&head).map_err(|e| DownloadError::Io {
                    path: self.item_path.clone(),
                    source: e,
                }),
                None => Ok(()),
            };
            self.head = head;
            rewritten?;
        }

        if !self.fill_head((PKG_HEADER_SIZE + PKG_HEADER_EXT_SIZE) as u64)? {
            return Ok(false);
        }

        let header = PkgHeader::parse(&self.head)?;
        if let Some(rif) = &self.rif {
            if !memequ(&rif[0x10..0x40], &header.content_id) {
                return Err(DownloadError::Format(
                    "content-id mismatch between zRIF and pkg".into(),
                ));
            }
        }
        debug!(
            meta_offset = header.meta_offset,
            meta_count = header.meta_count,
            index_count = header.index_count,
            total_size = header.total_size,
            enc_offset = header.enc_offset,
            enc_size = header.enc_size,
            "parsed pkg header"
        );

        let key = derive_key(header.key_type, &header.iv)?;
        self.cipher = PkgCipher::new(key, header.iv);

        if !self.fill_head(header.enc_offset)? {
            return Ok(false);
        }

        let meta = parse_meta(&self.head, &header)?;
        self.content_type = Some(meta.content_type);

        let index_end = header
            .enc_offset
            .saturating_add(u64::from(header.index_count) * INDEX_ENTRY_SIZE as u64);
        if !self.fill_head(index_end)? {
            return Ok(false);
        }

        // The first index record tells where the name region ends, so the
        // whole region can be buffered before any file bytes arrive. A
        // zero-entry index leaves nothing buffered past `enc_offset`.
        let enc_start = header.enc_offset as usize;
        if enc_start + INDEX_ENTRY_SIZE > self.head.len() {
            return Err(DownloadError::Format("pkg too small or corrupt".into()));
        }
        let mut first = [0u8; INDEX_ENTRY_SIZE];
        first.copy_from_slice(&self.head[enc_start..enc_start + INDEX_ENTRY_SIZE]);
        self.cipher.apply(0, &mut first);
        let first_offset = IndexEntry::decode(&first).data_offset;

        if meta.index_size != 0 && first_offset != u64::from(meta.index_size) {
            return Err(DownloadError::Format(format!(
                "index size mismatch: declared {}, first item at {}",
                meta.index_size, first_offset
            )));
        }

        if !self.fill_head(header.enc_offset.saturating_add(first_offset))? {
            return Ok(false);
        }

        self.total_size = header.total_size;
        self.enc_offset = header.enc_offset;
        self.enc_size = header.enc_size;
        self.index_count = header.index_count;
        debug!("head.bin downloaded");
        Ok(true)
    }

    fn download_files(&mut self) -> DownloadResult<bool> {
        let result = self.download_files_inner();
        self.close_item_file();
        result
    }

    fn download_files_inner(&mut self) -> DownloadResult<bool> {
        debug!("downloading encrypted files");
        let psp_disc = self.is_psp_disc();

        for index in 0..self.index_count {
            let record_start = self.enc_offset as usize + INDEX_ENTRY_SIZE * index as usize;
            if record_start + INDEX_ENTRY_SIZE > self.head.len() {
                return Err(DownloadError::Format("pkg too small or corrupt".into()));
            }
            let mut record = [0u8; INDEX_ENTRY_SIZE];
            record.copy_from_slice(&self.head[record_start..record_start + INDEX_ENTRY_SIZE]);
            self.cipher
                .apply((INDEX_ENTRY_SIZE * index as usize) as u64, &mut record);
            let entry = IndexEntry::decode(&record);

            if entry.name_size as usize > ITEM_NAME_MAX - 1
                || self.enc_offset + u64::from(entry.name_offset) + u64::from(entry.name_size)
                    > self.total_size
            {
                return Err(DownloadError::Format("pkg too small or corrupt".into()));
            }

            let name_start = self.enc_offset as usize + entry.name_offset as usize;
            if name_start + entry.name_size as usize > self.head.len() {
                return Err(DownloadError::Format("pkg too small or corrupt".into()));
            }
            let mut name_bytes =
                self.head[name_start..name_start + entry.name_size as usize].to_vec();
            self.cipher
                .apply(u64::from(entry.name_offset), &mut name_bytes);
            let name = String::from_utf8_lossy(&name_bytes).into_owned();

            let encrypted_size = entry.encrypted_size();
            let region_start = self.enc_offset + entry.data_offset;
            let region_end = region_start + encrypted_size;

            // Fully streamed by an earlier session; its bytes will not
            // arrive again and its file is already closed on disk.
            if self.resumed_session && encrypted_size > 0 && self.download_offset >= region_end {
                continue;
            }

            self.decrypted_size = entry.data_size;
            self.encrypted_base = entry.data_offset;
            self.encrypted_offset = 0;
            let mut resumed_item = false;
            if self.resumed_session && self.download_offset > region_start {
                // Mid-item resume: rebuild the counters from the wire
                // position of the previous session.
                self.encrypted_offset = self.download_offset - region_start;
                self.decrypted_size = entry.data_size.saturating_sub(self.encrypted_offset);
                resumed_item = true;
            }

            self.set_item_name(&name);
            debug!(
                index = index + 1,
                count = self.index_count,
                name = %name,
                data_offset = entry.data_offset,
                data_size = entry.data_size,
                kind = ?entry.kind,
                "pkg item"
            );

            if psp_disc {
                // Handheld disc packages materialise exactly two names;
                // everything else is drained to keep the hash and the CTR
                // stream position aligned, but never written.
                match name.as_str() {
                    "USRDIR/CONTENT/DOCUMENT.DAT" => {
                        self.item_path = self.root.join("DOCUMENT.DAT");
                    }
                    "USRDIR/CONTENT/EBOOT.PBP" => {
                        self.item_path = self.root.join("EBOOT.PBP");
                    }
                    _ => {
                        while self.encrypted_offset < encrypted_size {
                            let want = (encrypted_size - self.encrypted_offset)
                                .min(CHUNK_SIZE as u64)
                                as usize;
                            if self.download_data(want, true, false)? == 0 {
                                return Ok(false);
                            }
                        }
                        continue;
                    }
                }
            } else {
                self.item_path = self.root.join(&name);
            }

            match entry.kind {
                EntryKind::Directory => {
                    self.fs
                        .create_dir_all(&self.item_path)
                        .map_err(|e| DownloadError::Io {
                            path: self.item_path.clone(),
                            source: e,
                        })?;
                    continue;
                }
                EntryKind::Skip => continue,
                EntryKind::File => {}
            }

            // Tripwire: the header's index must agree with the on-wire
            // layout before any output file is created.
            let expected = region_start + self.encrypted_offset;
            if expected != self.download_offset {
                return Err(DownloadError::Ordering {
                    expected,
                    actual: self.download_offset,
                });
            }
            if region_start + entry.data_size > self.total_size {
                return Err(DownloadError::Format("pkg too small or corrupt".into()));
            }

            if resumed_item {
                self.open_item_append()?;
            } else {
                self.create_item_file()?;
            }

            while self.encrypted_offset < encrypted_size {
                let want =
                    (encrypted_size - self.encrypted_offset).min(CHUNK_SIZE as u64) as usize;
                if self.download_data(want, true, true)? == 0 {
                    return Ok(false);
                }
            }

            self.close_item_file();
        }

        debug!("all files decrypted");
        Ok(true)
    }

    fn download_tail(&mut self) -> DownloadResult<bool> {
        let result = self.download_tail_inner();
        self.close_item_file();
        result
    }

    fn download_tail_inner(&mut self) -> DownloadResult<bool> {
        debug!("downloading tail.bin");
        self.set_item_name("Finishing...");
        self.item_path = self.root.join("sce_sys").join("package").join("tail.bin");

        let tail_start = self.enc_offset + self.enc_size;
        if self.download_offset > tail_start && self.fs.exists(&self.item_path) {
            self.open_item_append()?;
        } else {
            self.create_item_file()?;
        }

        // Remainder of the encrypted region past the last item: hashed,
        // never written.
        while self.download_offset < tail_start {
            let want = (tail_start - self.download_offset).min(CHUNK_SIZE as u64) as usize;
            if self.download_data(want, false, false)? == 0 {
                return Ok(false);
            }
        }

        let save_tail = !self.is_psp_disc();
        while self.download_offset < self.total_size {
            let want = (self.total_size - self.download_offset).min(CHUNK_SIZE as u64) as usize;
            if self.download_data(want, false, save_tail)? == 0 {
                return Ok(false);
            }
        }

        debug!("tail.bin downloaded");
        Ok(true)
    }

    fn check_integrity(&mut self) -> DownloadResult<()> {
        let Some(expected) = self.digest else {
            debug!("no digest provided, skipping integrity check");
            return Ok(());
        };

        let actual = std::mem::replace(&mut self.sha, Sha256::new()).finalize();
        if !memequ(&actual, &expected) {
            // Without head.bin a retry cannot pretend the package was
            // already verified; content files stay for byte-level resume.
            warn!("pkg integrity mismatch, removing head.bin");
            let head_bin = self.root.join("sce_sys").join("package").join("head.bin");
            self.fs.remove_file(&head_bin).ok();
            return Err(DownloadError::Integrity);
        }

        debug!("pkg integrity check succeeded");
        Ok(())
    }

    fn create_stat(&mut self) -> DownloadResult<()> {
        debug!("creating stat.bin");
        let path = self.root.join("sce_sys").join("package").join("stat.bin");
        self.fs
            .save(&path, &[0u8; STAT_SIZE])
            .map_err(|e| DownloadError::Io { path, source: e })
    }

    fn create_rif(&mut self) -> DownloadResult<()> {
        let Some(rif) = &self.rif else {
            return Ok(());
        };
        debug!("creating work.bin");
        let path = self.root.join("sce_sys").join("package").join("work.bin");
        self.fs
            .save(&path, rif)
            .map_err(|e| DownloadError::Io { path, source: e })
    }
}
