//! PKG key ladder and stream cipher.
//!
//! Every PKG carries a 16-byte IV in its header and a key-type tag in the
//! low three bits of byte `0xE7`. The per-package AES key is either a fixed
//! constant (PSP packages) or the AES-128-ECB encryption of the header IV
//! under one of three fixed Vita master keys. The package body is then
//! AES-128-CTR over that key and IV.
//!
//! The CTR primitive here is seekable: the file index is decrypted at
//! stream offsets `32 * i`, file names at their `name_offset`, and item
//! bodies at `item_offset + k`, all out of order relative to each other.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::Aes128;
use ctr::Ctr128BE;

use crate::error::DownloadError;

// Master keys, part of the external PKG format contract.
pub const PKG_PSP_KEY: [u8; 16] = [
    0x07, 0xf2, 0xc6, 0x82, 0x90, 0xb5, 0x0d, 0x2c, 0x33, 0x81, 0x8d, 0x70, 0x9b, 0x60, 0xe6, 0x2b,
];
pub const PKG_VITA_2: [u8; 16] = [
    0xe3, 0x1a, 0x70, 0xc9, 0xce, 0x1d, 0xd7, 0x2b, 0xf3, 0xc0, 0x62, 0x29, 0x63, 0xf2, 0xec, 0xcb,
];
pub const PKG_VITA_3: [u8; 16] = [
    0x42, 0x3a, 0xca, 0x3a, 0x2b, 0xd5, 0x64, 0x9f, 0x96, 0x86, 0xab, 0xad, 0x6f, 0xd8, 0x80, 0x1f,
];
pub const PKG_VITA_4: [u8; 16] = [
    0xaf, 0x07, 0xfd, 0x59, 0x65, 0x25, 0x27, 0xba, 0xf1, 0x33, 0x89, 0x66, 0x8b, 0x17, 0xd9, 0xea,
];

/// Derive the per-package AES key from the header key-type byte and IV.
///
/// Only the low three bits of `key_type` are significant. Types 2-4 run the
/// IV through AES-128-ECB under the matching Vita master key; type 1 is the
/// fixed PSP key. Anything else is rejected.
pub fn derive_key(key_type: u8, iv: &[u8; 16]) -> Result<[u8; 16], DownloadError> {
    match key_type & 7 {
        1 => Ok(PKG_PSP_KEY),
        2 => Ok(ecb_encrypt(&PKG_VITA_2, iv)),
        3 => Ok(ecb_encrypt(&PKG_VITA_3, iv)),
        4 => Ok(ecb_encrypt(&PKG_VITA_4, iv)),
        other => Err(DownloadError::Format(format!("invalid key type {other}"))),
    }
}

fn ecb_encrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut out = *aes::Block::from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Byte-offset-addressable AES-128-CTR keystream for one package.
///
/// `apply` may be called repeatedly at arbitrary, non-contiguous and
/// non-16-aligned stream offsets; each call positions the keystream at
/// `stream_offset` and XORs `buf` in place. Encrypt and decrypt are the
/// same operation.
pub struct PkgCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl PkgCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// XOR `buf` with the keystream starting at byte `stream_offset`.
    pub fn apply(&self, stream_offset: u64, buf: &mut [u8]) {
        let mut cipher = Ctr128BE::<Aes128>::new((&self.key).into(), (&self.iv).into());
        cipher.seek(stream_offset);
        cipher.apply_keystream(buf);
    }
}
