// SPDX-License-Identifier: MIT
//
// Pit Boss LAN Controller
// https://github.com/pitboss-lan/pitboss-lan

//! Byte-evolving cipher and key derivation for the grill's RPC auth scheme
//!
//! The grill speaks a symmetric scheme keyed off its own uptime: both sides
//! derive a session key from a shared 8-byte base and a coarse time bucket,
//! then run a stream-like XOR whose key material evolves with every byte.
//! The `rpc_mode` flag selects whether evolution feeds on the XORed output
//! or on the input byte; encrypt and decrypt must land on the same evolved
//! stream, so a payload encrypted without padding in one mode is decrypted
//! in the opposite mode, while padded payloads always evolve on ciphertext
//! and decrypt with `rpc_mode = false`.

use rand::Rng;

/// Key used to decrypt the password pulled from `/extconfig.json`.
pub const FILE_DECODE_KEY: [u8; 8] = [0xC1, 0x8A, 0x3F, 0x6E, 0xDA, 0x52, 0x73, 0x0D];

/// Base key from which per-time-bucket RPC auth keys are derived.
pub const RPC_AUTH_KEY_BASE: [u8; 8] = [0x2F, 0xB6, 0x61, 0xE8, 0x95, 0x4C, 0xD3, 0x78];

/// Marker byte separating random padding from the payload.
const PADDING_MARKER: u8 = 0xff;

/// Run the byte-evolving cipher over `data`.
///
/// With `padding_len > 0` the payload is prefixed with that many random
/// bytes (0xff remapped to 0xfe so the marker stays unique) and a single
/// 0xff marker, and key evolution feeds on the XORed output. With
/// `padding_len == 0` the output is scanned for the first 0xff and
/// everything up to and including it is stripped, which undoes the padding
/// when decrypting.
pub fn codec(data: &[u8], key: &[u8], padding_len: usize, rpc_mode: bool) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    let mut key = key.to_vec();
    let klen = key.len();
    let padded = padding_len > 0;

    let input = if padded {
        let mut rng = rand::thread_rng();
        let mut buf = Vec::with_capacity(padding_len + 1 + data.len());
        for _ in 0..padding_len {
            let b: u8 = rng.gen();
            buf.push(if b == PADDING_MARKER { 0xfe } else { b });
        }
        buf.push(PADDING_MARKER);
        buf.extend_from_slice(data);
        buf
    } else {
        data.to_vec()
    };

    let mut out = Vec::with_capacity(input.len());
    for (i, &b) in input.iter().enumerate() {
        let m = b ^ key[i % klen];
        out.push(m);
        let src = if padded || rpc_mode { m } else { b };
        let slot = (i + 1) % klen;
        key[slot] ^= ((src as usize + i) % 256) as u8;
    }

    if !padded {
        if let Some(pos) = out.iter().position(|&b| b == PADDING_MARKER) {
            out.drain(..=pos);
        }
    }
    out
}

/// Derive a session key from `base` for time bucket `t`.
///
/// Repeatedly pulls an element out of a working copy of the base key at a
/// position driven by the running seed, folding each removed byte into the
/// output until a single element remains.
pub fn derive_key(base: &[u8], t: u64) -> Vec<u8> {
    let mut pool = base.to_vec();
    let mut out = Vec::with_capacity(pool.len());
    let mut l = t;
    while pool.len() > 1 {
        let idx = (l % pool.len() as u64) as usize;
        let removed = pool.remove(idx);
        out.push(((removed as u64 ^ l) % 256) as u8);
        l = (l * removed as u64 + removed as u64) % 256;
    }
    out.push(pool[0]);
    out
}

/// Coarse time bucket for auth-key derivation.
///
/// The grill reports uptime in seconds; both sides subtract a small skew
/// allowance and bucket to 10 s so tokens stay valid across minor drift.
pub fn time_bucket(uptime_seconds: u64) -> u64 {
    let mut safe = uptime_seconds.saturating_sub(5);
    if safe > i32::MAX as u64 {
        safe %= 86_400;
    }
    safe / 10
}

/// Encode bytes as a lowercase hex string.
pub fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string, reading any non-hex nibble as zero.
///
/// The grill occasionally pads status blobs with junk characters; decoding
/// must stay total, so unrecognised nibbles contribute 0 instead of failing.
pub fn decode_hex(s: &str) -> Vec<u8> {
    fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => 0,
        }
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2 + 1);
    let mut i = 0;
    while i < bytes.len() {
        if i + 1 < bytes.len() {
            out.push((nibble(bytes[i]) << 4) | nibble(bytes[i + 1]));
            i += 2;
        } else {
            // Lone trailing nibble reads as its own value.
            out.push(nibble(bytes[i]));
            i += 1;
        }
    }
    out
}
