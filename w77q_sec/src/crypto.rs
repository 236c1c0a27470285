// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key derivation, signatures and the payload cipher.
//!
//! Every derivation is a single hash over a little endian byte string. The
//! host and the device run the same functions, so nothing here can fail;
//! a mismatch shows up one layer up when signatures are compared.

use byteorder::LittleEndian;
use sha2::{Digest, Sha256};
use zerocopy::{AsBytes, FromBytes, U32};

use crate::cmd::{Ctag, Kid};

pub type Key = [u8; 16];

/// 256 bit cipher key, applied word by word.
pub type CipherKey = [u32; 8];

/// Hash primitive. The device fixes which hash it expects through the hash
/// version field of HW_VER; a platform may plug in an accelerator here.
pub trait HashEngine {
    fn init(&mut self);
    fn update(&mut self, data: &[u8]);
    fn finish(&mut self) -> [u8; 32];

    fn hash(&mut self, parts: &[&[u8]]) -> [u8; 32] {
        self.init();
        for p in parts {
            self.update(p);
        }
        self.finish()
    }
}

#[derive(Clone, Default)]
pub struct Sha256Engine(Sha256);

impl HashEngine for Sha256Engine {
    fn init(&mut self) {
        Digest::reset(&mut self.0);
    }

    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finish(&mut self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.finalize_reset());
        out
    }
}

/// Which side of the exchange the cipher key protects.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Data written by the host, decrypted by the device.
    DecryptionOfInput = 0xA3,
    /// Data produced by the device, decrypted by the host.
    EncryptionOfOutput = 0x5C,
}

/// Hash input of one command: salted session key, CTAG, up to 256 bits of
/// data and a control word.
#[derive(Clone, Copy, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct HashBuf {
    key: [U32<LittleEndian>; 4],
    ctag: U32<LittleEndian>,
    data: [u8; 32],
    ctrl: U32<LittleEndian>,
}

impl HashBuf {
    pub const DATA_SIZE: usize = 32;

    /// A fresh buffer keyed with `session_key`, salted with the transaction
    /// counter the command will consume.
    pub fn new(session_key: &Key, tc: u32) -> HashBuf {
        let mut buf = HashBuf::default();
        buf.set_key(session_key, tc);
        buf
    }

    pub fn set_key(&mut self, session_key: &Key, tc: u32) {
        for (w, b) in self.key.iter_mut().zip(session_key.chunks_exact(4)) {
            w.set(u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        }
        let salted = self.key[3].get() ^ tc;
        self.key[3].set(salted);
    }

    pub fn set_ctag(&mut self, ctag: Ctag) {
        self.ctag.set(ctag.0);
    }

    /// Copies at most 32 bytes and zero pads the rest.
    pub fn set_data(&mut self, data: &[u8]) {
        let n = data.len().min(Self::DATA_SIZE);
        self.data = [0; 32];
        self.data[..n].copy_from_slice(&data[..n]);
    }

    pub fn with(mut self, ctag: Ctag, data: &[u8]) -> HashBuf {
        self.set_ctag(ctag);
        self.set_data(data);
        self
    }

    fn key_and_ctag(&self) -> &[u8] {
        &self.as_bytes()[..20]
    }
}

/// Derive the cipher key for one command. The CTAG slot is overwritten, so
/// the buffer is consumed.
pub fn build_cipher_key<H: HashEngine + ?Sized>(
    h: &mut H,
    mut buf: HashBuf,
    kid: Kid,
    dir: Direction,
) -> CipherKey {
    buf.ctag.set(dir as u32 | (u32::from(kid.0) << 8));
    let d = h.hash(&[buf.key_and_ctag()]);
    let mut key = [0u32; 8];
    for (k, c) in key.iter_mut().zip(d.chunks_exact(4)) {
        *k = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
    }
    key
}

/// Word-wise XOR. Encryption and decryption are the same operation.
pub fn encrypt_data(buf: &mut [u8], key: &CipherKey) {
    for (chunk, k) in buf.chunks_mut(4).zip(key.iter().cycle()) {
        for (b, kb) in chunk.iter_mut().zip(k.to_le_bytes()) {
            *b ^= kb;
        }
    }
}

/// 64 bit MAC over key, CTAG, data and the key id.
pub fn calc_auth_signature<H: HashEngine + ?Sized>(h: &mut H, mut buf: HashBuf, kid: Kid) -> u64 {
    buf.ctrl.set(u32::from(kid.0));
    let d = h.hash(&[buf.as_bytes()]);
    u64::from_le_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
}

/// Key used only to open a provisioning session. The mode byte records
/// whether WID binding and SCR validity checks apply.
pub fn get_provision_key<H: HashEngine + ?Sized>(
    h: &mut H,
    device_key: &Key,
    kid: Kid,
    include_wid: bool,
    ignore_scr_validity: bool,
) -> Key {
    let mode = crate::cmd::mode::session_open(include_wid, ignore_scr_validity);
    let d = h.hash(&[device_key, &[kid.0, mode, 0, 0]]);
    let mut k = [0u8; 16];
    k.copy_from_slice(&d[..16]);
    k
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    pub session_key: Key,
    pub signature: u64,
    pub seed: u64,
}

/// The session establishment KDF.
pub fn session_key_and_signature<H: HashEngine + ?Sized>(
    h: &mut H,
    key: &Key,
    ctag: Ctag,
    mc: [u32; 2],
    nonce: u64,
    wid: Option<u64>,
) -> SessionKeys {
    h.init();
    h.update(key);
    h.update(&ctag.bytes());
    h.update(&mc[0].to_le_bytes());
    h.update(&mc[1].to_le_bytes());
    h.update(&nonce.to_le_bytes());
    if let Some(wid) = wid {
        h.update(&wid.to_le_bytes());
    }
    let d = h.finish();

    let mut session_key = [0u8; 16];
    session_key.copy_from_slice(&d[..16]);
    let mut sig = [0u8; 8];
    sig.copy_from_slice(&d[16..24]);
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&d[24..32]);
    SessionKeys {
        session_key,
        signature: u64::from_le_bytes(sig),
        seed: u64::from_le_bytes(seed),
    }
}

/// The 24 bit mask used to hide an address inside a CTAG.
pub fn address_key(cipher: &CipherKey) -> u32 {
    (cipher[0] ^ cipher[1] ^ cipher[2] ^ cipher[3]) & 0xff_ffff
}

pub fn encrypt_address(addr: u32, cipher: &CipherKey) -> u32 {
    crate::cmd::swap24((addr ^ address_key(cipher)) & 0xff_ffff)
}

pub fn decrypt_address(enc: u32, cipher: &CipherKey) -> u32 {
    (crate::cmd::swap24(enc & 0xff_ffff) ^ address_key(cipher)) & 0xff_ffff
}
