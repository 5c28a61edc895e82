//! End-to-end pipeline tests against synthesised packages.
//!
//! These tests build bit-exact PKG images in memory, serve them through a
//! scripted fake HTTP source, and drive the real pipeline against a temp
//! directory: header parsing, the key ladder, CTR decryption, SHA-256
//! integrity, content-type routing, cancellation and resume.
//!
//! Run with: `cargo test --test pipeline`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use vitapkg::crypto::{derive_key, PkgCipher};
use vitapkg::error::DownloadError;
use vitapkg::progress::CancelToken;
use vitapkg::{Download, DownloadOutcome, DownloadRequest, DownloadResult, HttpSource, StdFilesystem};

const CONTENT_ID: &str = "EP0000-PCSE00000_00-0000000000000001";

const KIND_FILE: u8 = 0;
const KIND_DIR: u8 = 4;
const KIND_SKIP: u8 = 18;

// ============================================================================
// PKG builder
// ============================================================================

struct PkgEntry {
    name: &'static str,
    kind: u8,
    data: Vec<u8>,
}

impl PkgEntry {
    fn file(name: &'static str, data: &[u8]) -> Self {
        Self {
            name,
            kind: KIND_FILE,
            data: data.to_vec(),
        }
    }

    fn dir(name: &'static str) -> Self {
        Self {
            name,
            kind: KIND_DIR,
            data: Vec::new(),
        }
    }

    fn skip(name: &'static str) -> Self {
        Self {
            name,
            kind: KIND_SKIP,
            data: Vec::new(),
        }
    }
}

struct PkgBuilder {
    content_type: u32,
    key_type: u8,
    iv: [u8; 16],
    entries: Vec<PkgEntry>,
    tail: Vec<u8>,
    /// Deltas added to declared item offsets, keyed by entry index.
    offset_fudge: Vec<(usize, i64)>,
    /// Overrides the declared index size from meta record 13.
    index_size_override: Option<u32>,
}

const META_OFFSET: usize = 256;
const ENC_OFFSET: usize = 320;

impl PkgBuilder {
    fn new(content_type: u32) -> Self {
        Self {
            content_type,
            key_type: 2,
            iv: [0u8; 16],
            entries: Vec::new(),
            tail: vec![0xAA; 64],
            offset_fudge: Vec::new(),
            index_size_override: None,
        }
    }

    fn entry(mut self, entry: PkgEntry) -> Self {
        self.entries.push(entry);
        self
    }

    fn fudge_offset(mut self, index: usize, delta: i64) -> Self {
        self.offset_fudge.push((index, delta));
        self
    }

    fn declare_index_size(mut self, size: u32) -> Self {
        self.index_size_override = Some(size);
        self
    }

    fn build(self) -> Vec<u8> {
        // Lay out the encrypted region: index records, then names, then
        // item data in whole AES blocks.
        let index_len = self.entries.len() * 32;
        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        for entry in &self.entries {
            name_offsets.push((index_len + names.len()) as u32);
            names.extend_from_slice(entry.name.as_bytes());
        }

        let data_start = (index_len + names.len()) as u64;
        let mut cursor = data_start;
        let mut data_offsets = Vec::new();
        for entry in &self.entries {
            data_offsets.push(cursor);
            cursor += (entry.data.len() as u64).div_ceil(16) * 16;
        }
        let enc_size = cursor;

        let mut plain = vec![0u8; enc_size as usize];
        for (i, entry) in self.entries.iter().enumerate() {
            let declared = self
                .offset_fudge
                .iter()
                .find(|(index, _)| *index == i)
                .map(|(_, delta)| data_offsets[i].wrapping_add_signed(*delta))
                .unwrap_or(data_offsets[i]);

            let record = &mut plain[i * 32..(i + 1) * 32];
            record[0..4].copy_from_slice(&name_offsets[i].to_be_bytes());
            record[4..8].copy_from_slice(&(entry.name.len() as u32).to_be_bytes());
            record[8..16].copy_from_slice(&declared.to_be_bytes());
            record[16..24].copy_from_slice(&(entry.data.len() as u64).to_be_bytes());
            record[27] = entry.kind;

            let name_at = name_offsets[i] as usize;
            plain[name_at..name_at + entry.name.len()].copy_from_slice(entry.name.as_bytes());
            let data_at = data_offsets[i] as usize;
            plain[data_at..data_at + entry.data.len()].copy_from_slice(&entry.data);
        }

        let key = derive_key(self.key_type, &self.iv).expect("builder key type");
        PkgCipher::new(key, self.iv).apply(0, &mut plain);

        let total_size = (ENC_OFFSET as u64) + enc_size + self.tail.len() as u64;

        let mut pkg = vec![0u8; ENC_OFFSET];
        pkg[0..4].copy_from_slice(&0x7F50_4B47u32.to_be_bytes());
        pkg[192..196].copy_from_slice(&0x7F65_7874u32.to_be_bytes());
        pkg[8..12].copy_from_slice(&(META_OFFSET as u32).to_be_bytes());
        pkg[12..16].copy_from_slice(&2u32.to_be_bytes());
        pkg[20..24].copy_from_slice(&(self.entries.len() as u32).to_be_bytes());
        pkg[24..32].copy_from_slice(&total_size.to_be_bytes());
        pkg[32..40].copy_from_slice(&(ENC_OFFSET as u64).to_be_bytes());
        pkg[40..48].copy_from_slice(&enc_size.to_be_bytes());
        pkg[0x30..0x30 + CONTENT_ID.len()].copy_from_slice(CONTENT_ID.as_bytes());
        pkg[0x70..0x80].copy_from_slice(&self.iv);
        pkg[0xE7] = self.key_type;

        // Meta record 2: content type. Meta record 13: index size.
        pkg[META_OFFSET..META_OFFSET + 4].copy_from_slice(&2u32.to_be_bytes());
        pkg[META_OFFSET + 4..META_OFFSET + 8].copy_from_slice(&4u32.to_be_bytes());
        pkg[META_OFFSET + 8..META_OFFSET + 12].copy_from_slice(&self.content_type.to_be_bytes());
        pkg[META_OFFSET + 12..META_OFFSET + 16].copy_from_slice(&13u32.to_be_bytes());
        pkg[META_OFFSET + 16..META_OFFSET + 20].copy_from_slice(&8u32.to_be_bytes());
        let declared_index_size = self.index_size_override.unwrap_or(data_start as u32);
        pkg[META_OFFSET + 24..META_OFFSET + 28].copy_from_slice(&declared_index_size.to_be_bytes());

        pkg.extend_from_slice(&plain);
        pkg.extend_from_slice(&self.tail);
        pkg
    }
}

// ============================================================================
// Fake HTTP source
// ============================================================================

/// Serves a byte image in small chunks, optionally tripping the session's
/// cancel token once a byte threshold is crossed.
struct FakeHttp {
    data: Vec<u8>,
    pos: usize,
    open_remaining: u64,
    chunk: usize,
    cancel_after: Option<u64>,
    token: Arc<Mutex<Option<CancelToken>>>,
}

impl FakeHttp {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            open_remaining: 0,
            chunk: 13,
            cancel_after: None,
            token: Arc::new(Mutex::new(None)),
        }
    }

    fn cancelling_at(data: Vec<u8>, threshold: u64) -> (Self, Arc<Mutex<Option<CancelToken>>>) {
        let mut http = Self::new(data);
        http.cancel_after = Some(threshold);
        let cell = Arc::clone(&http.token);
        (http, cell)
    }
}

impl HttpSource for FakeHttp {
    fn start(&mut self, _url: &str, offset: u64) -> DownloadResult<()> {
        self.pos = offset as usize;
        self.open_remaining = (self.data.len() - self.pos) as u64;
        Ok(())
    }

    fn length(&self) -> DownloadResult<u64> {
        Ok(self.open_remaining)
    }

    fn read(&mut self, buf: &mut [u8]) -> DownloadResult<usize> {
        if let Some(threshold) = self.cancel_after {
            if self.pos as u64 >= threshold {
                if let Some(token) = self.token.lock().unwrap().as_ref() {
                    token.cancel();
                }
                // Fire once; the resumed session runs to completion.
                self.cancel_after = None;
            }
        }

        let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn make_download(
    temp: &TempDir,
    http: FakeHttp,
    rif: Option<Vec<u8>>,
    digest: Option<[u8; 32]>,
) -> Download {
    Download::new(
        Box::new(http),
        Box::new(StdFilesystem::new()),
        temp.path(),
        DownloadRequest {
            content_id: CONTENT_ID.into(),
            url: "http://example.invalid/pkg".into(),
            rif,
            digest,
        },
    )
    .expect("valid request")
}

/// RIF blob whose embedded content id matches the built package.
fn matching_rif() -> Vec<u8> {
    let mut rif = vec![0u8; 512];
    rif[0x10..0x10 + CONTENT_ID.len()].copy_from_slice(CONTENT_ID.as_bytes());
    rif
}

/// Recursively collect `path -> contents` for a staged tree.
fn collect_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out
}

fn staged_root(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join(CONTENT_ID)
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn s1_minimal_app_pkg_stages_decrypted_tree() {
    let payload: Vec<u8> = (0u8..17).collect();
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", &payload))
        .build();
    let digest = sha256(&pkg);

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg.clone()), None, Some(digest));
    assert_eq!(download.run().unwrap(), DownloadOutcome::Completed);

    let root = staged_root(&temp);
    // 17-byte plaintext, the 15 bytes of block padding stripped.
    assert_eq!(std::fs::read(root.join("x.bin")).unwrap(), payload);

    // head.bin is the verbatim header + meta + index + names prefix.
    let head_bin = std::fs::read(root.join("sce_sys/package/head.bin")).unwrap();
    let head_size = ENC_OFFSET + 32 + "x.bin".len();
    assert_eq!(head_bin, pkg[..head_size]);

    // tail.bin is the verbatim region past the encrypted payload.
    let tail_bin = std::fs::read(root.join("sce_sys/package/tail.bin")).unwrap();
    assert_eq!(tail_bin, &pkg[pkg.len() - 64..]);

    let stat = std::fs::read(root.join("sce_sys/package/stat.bin")).unwrap();
    assert_eq!(stat, vec![0u8; 768]);

    // No RIF supplied, so no work.bin.
    assert!(!root.join("sce_sys/package/work.bin").exists());

    let progress = download.progress().snapshot();
    assert_eq!(progress.bytes_downloaded, pkg.len() as u64);
    assert_eq!(progress.total_bytes, pkg.len() as u64);
}

#[test]
fn s2_bad_magic_is_rejected() {
    let mut pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();
    pkg[0] = 0x00;

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("bad PKG header"), "{err}");
}

#[test]
fn s3_rif_content_id_mismatch_is_rejected() {
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();

    let mut rif = matching_rif();
    rif[0x10] ^= 0x01;

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), Some(rif), None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("content-id mismatch"), "{err}");
}

#[test]
fn s3b_matching_rif_is_accepted_and_written() {
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), Some(matching_rif()), None);
    assert_eq!(download.run().unwrap(), DownloadOutcome::Completed);

    let work = std::fs::read(staged_root(&temp).join("sce_sys/package/work.bin")).unwrap();
    assert_eq!(work, matching_rif());
}

#[test]
fn s4_digest_mismatch_drops_head_bin_keeps_content() {
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello world"))
        .build();
    let mut digest = sha256(&pkg);
    digest[0] ^= 0x01;

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, Some(digest));
    let err = download.run().unwrap_err();
    assert!(matches!(err, DownloadError::Integrity));

    let root = staged_root(&temp);
    // head.bin removed to force a clean re-verify on retry; the content
    // file stays so a retry remains byte-addressable.
    assert!(!root.join("sce_sys/package/head.bin").exists());
    assert!(root.join("x.bin").exists());
}

#[test]
fn s5_resume_after_cancellation_matches_one_shot_run() {
    let file_a: Vec<u8> = (0..=255u8).cycle().take(100).collect();
    let file_b: Vec<u8> = (0..=255u8).rev().cycle().take(57).collect();
    let build = || {
        PkgBuilder::new(21)
            .entry(PkgEntry::dir("sub"))
            .entry(PkgEntry::file("sub/a.bin", &file_a))
            .entry(PkgEntry::file("b.bin", &file_b))
            .entry(PkgEntry::skip("ignored.meta"))
            .build()
    };
    let pkg = build();
    let digest = sha256(&pkg);

    // One-shot reference run.
    let reference = TempDir::new().unwrap();
    let mut one_shot = make_download(&reference, FakeHttp::new(pkg.clone()), None, Some(digest));
    assert_eq!(one_shot.run().unwrap(), DownloadOutcome::Completed);

    // Cancel at 40% of the wire size, then resume the same session.
    let threshold = pkg.len() as u64 * 2 / 5;
    let (http, token_cell) = FakeHttp::cancelling_at(pkg.clone(), threshold);
    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, http, None, Some(digest));
    *token_cell.lock().unwrap() = Some(download.cancel_token());

    assert_eq!(download.run().unwrap(), DownloadOutcome::Cancelled);
    let paused_at = download.download_offset();
    assert!(paused_at >= threshold && paused_at < pkg.len() as u64);

    download.cancel_token().reset();
    assert_eq!(download.run().unwrap(), DownloadOutcome::Completed);
    assert_eq!(download.download_offset(), pkg.len() as u64);

    // Identical output trees, and the digest check passing proves the
    // resumed hash saw every wire byte exactly once.
    assert_eq!(
        collect_tree(&staged_root(&temp)),
        collect_tree(&staged_root(&reference))
    );
}

#[test]
fn s5b_resume_mid_item_appends_instead_of_truncating() {
    let file_a: Vec<u8> = (7u8..=255).cycle().take(300).collect();
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("a.bin", &file_a))
        .build();
    let digest = sha256(&pkg);

    // Land the cancellation inside a.bin's body.
    let data_start = (32 + "a.bin".len()) as u64;
    let threshold = ENC_OFFSET as u64 + data_start + 48;
    let (http, token_cell) = FakeHttp::cancelling_at(pkg.clone(), threshold);

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, http, None, Some(digest));
    *token_cell.lock().unwrap() = Some(download.cancel_token());

    assert_eq!(download.run().unwrap(), DownloadOutcome::Cancelled);
    download.cancel_token().reset();
    assert_eq!(download.run().unwrap(), DownloadOutcome::Completed);

    assert_eq!(
        std::fs::read(staged_root(&temp).join("a.bin")).unwrap(),
        file_a
    );
}

#[test]
fn s6_psp_disc_filter_materialises_only_two_names() {
    let eboot: Vec<u8> = (1u8..=255).cycle().take(200).collect();
    let document = b"doc-data".to_vec();
    let pkg = PkgBuilder::new(6)
        .entry(PkgEntry::dir("USRDIR"))
        .entry(PkgEntry::dir("USRDIR/CONTENT"))
        .entry(PkgEntry::file("USRDIR/CONTENT/EBOOT.PBP", &eboot))
        .entry(PkgEntry::file("USRDIR/CONTENT/DOCUMENT.DAT", &document))
        .entry(PkgEntry::file("USRDIR/CONTENT/JUNK.BIN", b"discarded"))
        .build();
    let digest = sha256(&pkg);

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, Some(digest));
    // Completion with a digest proves the discarded entries were still
    // drained through the hash.
    assert_eq!(download.run().unwrap(), DownloadOutcome::Completed);

    let root = staged_root(&temp);
    assert_eq!(std::fs::read(root.join("EBOOT.PBP")).unwrap(), eboot);
    assert_eq!(std::fs::read(root.join("DOCUMENT.DAT")).unwrap(), document);
    assert!(!root.join("USRDIR").exists());
    assert!(!root.join("JUNK.BIN").exists());

    // Handheld disc staging carries no stat.bin and an empty tail.bin.
    assert!(!root.join("sce_sys/package/stat.bin").exists());
    let tail = std::fs::read(root.join("sce_sys/package/tail.bin")).unwrap();
    assert!(tail.is_empty());
}

// ============================================================================
// Properties and failure modes
// ============================================================================

#[test]
fn multi_entry_pkg_passes_sha_completeness() {
    let pkg = PkgBuilder::new(22)
        .entry(PkgEntry::dir("data"))
        .entry(PkgEntry::file("data/one.bin", &[0x11; 33]))
        .entry(PkgEntry::skip("shadow"))
        .entry(PkgEntry::file("data/two.bin", &[0x22; 16]))
        .entry(PkgEntry::file("empty.bin", b""))
        .build();
    let digest = sha256(&pkg);

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, Some(digest));
    assert_eq!(download.run().unwrap(), DownloadOutcome::Completed);

    let root = staged_root(&temp);
    assert_eq!(std::fs::read(root.join("data/one.bin")).unwrap(), [0x11; 33]);
    assert_eq!(std::fs::read(root.join("data/two.bin")).unwrap(), [0x22; 16]);
    assert_eq!(std::fs::read(root.join("empty.bin")).unwrap(), b"");
    assert!(root.join("data").is_dir());
    assert!(!root.join("shadow").exists());
}

#[test]
fn order_tripwire_fires_before_creating_the_file() {
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("first.bin", &[1u8; 40]))
        .entry(PkgEntry::file("second.bin", &[2u8; 40]))
        .fudge_offset(1, 16)
        .build();

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(matches!(err, DownloadError::Ordering { .. }), "{err}");

    let root = staged_root(&temp);
    assert!(root.join("first.bin").exists());
    assert!(!root.join("second.bin").exists());
}

#[test]
fn declared_index_size_mismatch_is_rejected() {
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .declare_index_size(1000)
        .build();

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("index size mismatch"), "{err}");
}

#[test]
fn empty_file_index_is_rejected_not_a_panic() {
    let mut pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();
    // Declare a zero-entry index; nothing past enc_offset gets buffered.
    pkg[20..24].copy_from_slice(&0u32.to_be_bytes());

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("too small or corrupt"), "{err}");
}

#[test]
fn invalid_key_type_is_rejected() {
    let mut pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();
    pkg[0xE7] = 5;

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("invalid key type"), "{err}");
}

#[test]
fn unsupported_content_type_is_rejected() {
    let pkg = PkgBuilder::new(9)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("unsupported package type"), "{err}");
}

#[test]
fn oversized_head_region_is_unsupported_not_corrupt() {
    let mut pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", b"hello"))
        .build();
    // Declare an encrypted-region offset past the head-buffer bound.
    pkg[32..40].copy_from_slice(&(5u64 * 1024 * 1024).to_be_bytes());

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("head too large"), "{err}");
}

#[test]
fn truncated_stream_reports_connection_closed() {
    let pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", &[9u8; 400]))
        .build();
    let half = pkg.len() / 2;

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg[..half].to_vec()), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("connection closed"), "{err}");
}

#[test]
fn item_overrunning_total_size_is_rejected() {
    let mut pkg = PkgBuilder::new(21)
        .entry(PkgEntry::file("x.bin", &[3u8; 64]))
        .build();
    // Shrink the declared total below the item's end.
    pkg[24..32].copy_from_slice(&(ENC_OFFSET as u64 + 32 + 5 + 8).to_be_bytes());

    let temp = TempDir::new().unwrap();
    let mut download = make_download(&temp, FakeHttp::new(pkg), None, None);
    let err = download.run().unwrap_err();
    assert!(err.to_string().contains("too small or corrupt"), "{err}");
}
