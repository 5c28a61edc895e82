//! PKG container decoding.
//!
//! A PKG starts with a 192-byte header (`"\x7FPKG"`) followed by a 64-byte
//! extended header (`"\x7Fext"`). The header points at a meta table of
//! variable-sized records and at an encrypted region whose first
//! `index_count * 32` bytes are the file index. Index records and file
//! names are AES-CTR encrypted with the package key; decoding them is the
//! pipeline's job, this module only knows the layouts.

use crate::bytes::{get32be, get64be};
use crate::error::DownloadError;

/// Primary magic at offset 0: `"\x7FPKG"`.
pub const PKG_MAGIC: u32 = 0x7F50_4B47;
/// Extended-header magic at offset [`PKG_HEADER_SIZE`]: `"\x7Fext"`.
pub const PKG_EXT_MAGIC: u32 = 0x7F65_7874;

pub const PKG_HEADER_SIZE: usize = 192;
pub const PKG_HEADER_EXT_SIZE: usize = 64;

/// Size of one encrypted file-index record.
pub const INDEX_ENTRY_SIZE: usize = 32;

/// Package content class, from meta record type 2.
///
/// Anything outside these three is rejected as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// PSP/PSX disc game played under the handheld emulator.
    PspGame,
    /// Vita game or game update.
    VitaGame,
    /// Vita add-on content.
    VitaDlc,
}

impl ContentType {
    pub fn from_u32(value: u32) -> Result<Self, DownloadError> {
        match value {
            6 => Ok(Self::PspGame),
            21 => Ok(Self::VitaGame),
            22 => Ok(Self::VitaDlc),
            other => Err(DownloadError::Format(format!(
                "unsupported package type {other}"
            ))),
        }
    }
}

/// Fixed-layout fields of the combined header + extended header.
#[derive(Debug, Clone)]
pub struct PkgHeader {
    /// Offset of the meta table within the head region.
    pub meta_offset: u32,
    /// Number of meta records.
    pub meta_count: u32,
    /// Number of file-index records.
    pub index_count: u32,
    /// Total package size on the wire.
    pub total_size: u64,
    /// Offset of the encrypted region.
    pub enc_offset: u64,
    /// Size of the encrypted region.
    pub enc_size: u64,
    /// Content-id bytes at 0x30..0x60, compared against the RIF.
    pub content_id: [u8; 0x30],
    /// AES-CTR initial IV.
    pub iv: [u8; 16],
    /// Key-ladder selector, low three bits of byte 0xE7.
    pub key_type: u8,
}

impl PkgHeader {
    /// Parse the first `PKG_HEADER_SIZE + PKG_HEADER_EXT_SIZE` bytes.
    ///
    /// Verifies both magics; everything else is taken at face value and
    /// validated by the pipeline against the bytes that actually arrive.
    pub fn parse(head: &[u8]) -> Result<Self, DownloadError> {
        if head.len() < PKG_HEADER_SIZE + PKG_HEADER_EXT_SIZE {
            return Err(DownloadError::Format("pkg header truncated".into()));
        }
        if get32be(head) != PKG_MAGIC || get32be(&head[PKG_HEADER_SIZE..]) != PKG_EXT_MAGIC {
            return Err(DownloadError::Format("bad PKG header".into()));
        }

        let mut content_id = [0u8; 0x30];
        content_id.copy_from_slice(&head[0x30..0x60]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&head[0x70..0x80]);

        Ok(Self {
            meta_offset: get32be(&head[8..]),
            meta_count: get32be(&head[12..]),
            index_count: get32be(&head[20..]),
            total_size: get64be(&head[24..]),
            enc_offset: get64be(&head[32..]),
            enc_size: get64be(&head[40..]),
            content_id,
            iv,
            key_type: head[0xE7] & 7,
        })
    }
}

/// Values recovered from the meta table.
#[derive(Debug, Clone, Copy)]
pub struct PkgMeta {
    pub content_type: ContentType,
    /// Declared size of the index + name region, 0 when absent. When
    /// present it must equal the first index entry's data offset.
    pub index_size: u32,
}

/// Walk the meta table inside the head buffer.
///
/// Records are `type:u32, size:u32, payload[size]`. Type 2 carries the
/// content type in payload bytes 0..4; type 13 carries the index size in
/// payload bytes 4..8. Unknown types are skipped. Every record header must
/// lie below `enc_offset`.
pub fn parse_meta(head: &[u8], header: &PkgHeader) -> Result<PkgMeta, DownloadError> {
    let mut content_type = None;
    let mut index_size = 0u32;

    let mut offset = header.meta_offset as u64;
    for _ in 0..header.meta_count {
        if offset + 16 >= header.enc_offset || offset as usize + 8 > head.len() {
            return Err(DownloadError::Format("pkg too small or corrupt".into()));
        }
        let record_type = get32be(&head[offset as usize..]);
        let record_size = get32be(&head[offset as usize + 4..]);

        if record_type == 2 {
            content_type = Some(ContentType::from_u32(get32be(&head[offset as usize + 8..]))?);
        } else if record_type == 13 {
            index_size = get32be(&head[offset as usize + 12..]);
        }
        offset += 8 + u64::from(record_size);
    }

    let content_type = content_type
        .ok_or_else(|| DownloadError::Format("pkg meta has no content type".into()))?;
    Ok(PkgMeta {
        content_type,
        index_size,
    })
}

/// One decrypted 32-byte file-index record.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// Offset of the encrypted file name within the encrypted region.
    pub name_offset: u32,
    pub name_size: u32,
    /// Offset of the item data within the encrypted region.
    pub data_offset: u64,
    /// Plaintext size of the item; the on-wire size is this rounded up to
    /// a whole number of AES blocks.
    pub data_size: u64,
    pub kind: EntryKind,
}

/// Item disposition from the type byte at record offset 27.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    /// Metadata-only record, nothing materialised.
    Skip,
    File,
}

impl IndexEntry {
    /// Decode an already-decrypted index record.
    pub fn decode(record: &[u8; INDEX_ENTRY_SIZE]) -> Self {
        let kind = match record[27] {
            4 => EntryKind::Directory,
            18 => EntryKind::Skip,
            _ => EntryKind::File,
        };
        Self {
            name_offset: get32be(&record[0..]),
            name_size: get32be(&record[4..]),
            data_offset: get64be(&record[8..]),
            data_size: get64be(&record[16..]),
            kind,
        }
    }

    /// On-wire size of the item body: whole AES blocks.
    pub fn encrypted_size(&self) -> u64 {
        self.data_size.div_ceil(16) * 16
    }
}
