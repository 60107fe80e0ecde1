//! BLAKE2b (RFC 7693), keyless.
//!
//! The Equihash engine needs two things no general-purpose digest API gives
//! us at once: a personalized parameter block carrying the `(N, K)` pair,
//! and a cheaply cloneable midstate (the solver clones the absorbed header
//! state once per generator, thirty-odd million times per solve). So the
//! state machine lives here, in full.
//!
//! Finalization consumes the state by value; a finalized state cannot be
//! touched again.

use crate::codec;

pub const BLOCK_BYTES: usize = 128;
pub const OUT_BYTES: usize = 64;

const IV: [u64; 8] = [
    0x6A09E667F3BCC908,
    0xBB67AE8584CAA73B,
    0x3C6EF372FE94F82B,
    0xA54FF53A5F1D36F1,
    0x510E527FADE682D1,
    0x9B05688C2B3E6C1F,
    0x1F83D9ABFB41BD6B,
    0x5BE0CD19137E2179,
];

const SIGMA: [[usize; 16]; 12] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
    [11, 8, 12, 0, 5, 2, 15, 13, 10, 14, 3, 6, 7, 1, 9, 4],
    [7, 9, 3, 1, 13, 12, 11, 14, 2, 6, 5, 10, 4, 0, 15, 8],
    [9, 0, 5, 7, 2, 4, 10, 15, 14, 1, 11, 12, 6, 8, 3, 13],
    [2, 12, 6, 10, 0, 11, 8, 3, 4, 13, 7, 5, 15, 14, 1, 9],
    [12, 5, 1, 15, 14, 13, 4, 10, 0, 7, 6, 3, 9, 2, 8, 11],
    [13, 11, 7, 14, 12, 1, 3, 9, 5, 0, 15, 4, 8, 6, 2, 10],
    [6, 15, 14, 9, 11, 3, 0, 8, 12, 2, 13, 7, 1, 4, 10, 5],
    [10, 2, 8, 4, 7, 6, 1, 5, 15, 11, 9, 14, 3, 12, 13, 0],
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
];

/// An in-flight BLAKE2b computation.
#[derive(Clone)]
pub struct Blake2b {
    h: [u64; 8],
    t: [u64; 2],
    f: [u64; 2],
    buf: [u8; BLOCK_BYTES],
    buflen: usize,
    outlen: usize,
}

impl Blake2b {
    /// Plain keyless init with a caller-chosen digest length (1..=64).
    pub fn new(outlen: usize) -> Self {
        assert!(outlen >= 1 && outlen <= OUT_BYTES);

        let mut params = [0u8; 64];
        params[0] = outlen as u8; // digest_length
        params[2] = 1; // fanout
        params[3] = 1; // depth
        Self::from_params(&params, outlen)
    }

    /// Equihash init: digest length derived from `n` (as many whole
    /// `ceil(n/8)`-byte sub-hashes as fit in 64 bytes), and a personal field
    /// carrying `personal || LE32(n) || LE32(k)`.
    pub fn new_equihash(personal: &[u8; 8], n: u32, k: u32) -> Self {
        let hash_bytes = (n as usize + 7) / 8;
        let outlen = (OUT_BYTES / hash_bytes) * hash_bytes;
        assert!(outlen >= 1 && outlen <= OUT_BYTES);

        let mut params = [0u8; 64];
        params[0] = outlen as u8;
        params[2] = 1;
        params[3] = 1;
        params[48..56].copy_from_slice(personal);
        codec::encode_u32_le(&mut params[56..], n);
        codec::encode_u32_le(&mut params[60..], k);
        Self::from_params(&params, outlen)
    }

    fn from_params(params: &[u8; 64], outlen: usize) -> Self {
        let mut h = IV;
        for (i, word) in h.iter_mut().enumerate() {
            *word ^= codec::decode_u64_le(&params[i * 8..]);
        }
        Blake2b {
            h,
            t: [0; 2],
            f: [0; 2],
            buf: [0; BLOCK_BYTES],
            buflen: 0,
            outlen,
        }
    }

    pub fn outlen(&self) -> usize {
        self.outlen
    }

    /// Absorb input. A trailing full block stays buffered so that the final
    /// compression always carries data with the last-block flag set, as
    /// RFC 7693 requires.
    pub fn update(&mut self, input: &[u8]) {
        if input.is_empty() {
            return;
        }

        let mut input = input;
        let left = self.buflen;
        let fill = BLOCK_BYTES - left;
        if input.len() > fill {
            self.buf[left..].copy_from_slice(&input[..fill]);
            self.buflen = 0;
            self.increment_counter(BLOCK_BYTES as u64);
            let block = self.buf;
            self.compress(&block);
            input = &input[fill..];

            while input.len() > BLOCK_BYTES {
                self.increment_counter(BLOCK_BYTES as u64);
                self.compress(input[..BLOCK_BYTES].try_into().unwrap());
                input = &input[BLOCK_BYTES..];
            }
        }
        self.buf[self.buflen..self.buflen + input.len()].copy_from_slice(input);
        self.buflen += input.len();
    }

    /// Finish the computation, writing exactly `outlen` bytes into `out`.
    /// Takes the state by value: a finalized state is gone.
    pub fn finalize(mut self, out: &mut [u8]) {
        assert_eq!(out.len(), self.outlen);

        self.increment_counter(self.buflen as u64);
        self.f[0] = u64::MAX;
        self.buf[self.buflen..].fill(0);
        let block = self.buf;
        self.compress(&block);

        let mut full = [0u8; OUT_BYTES];
        for (i, word) in self.h.iter().enumerate() {
            codec::encode_u64_le(&mut full[i * 8..], *word);
        }
        out.copy_from_slice(&full[..self.outlen]);
    }

    fn increment_counter(&mut self, inc: u64) {
        self.t[0] = self.t[0].wrapping_add(inc);
        if self.t[0] < inc {
            self.t[1] = self.t[1].wrapping_add(1);
        }
    }

    fn compress(&mut self, block: &[u8; BLOCK_BYTES]) {
        let mut m = [0u64; 16];
        for (i, word) in m.iter_mut().enumerate() {
            *word = codec::decode_u64_le(&block[i * 8..]);
        }

        let mut v = [0u64; 16];
        v[..8].copy_from_slice(&self.h);
        v[8..].copy_from_slice(&IV);
        v[12] ^= self.t[0];
        v[13] ^= self.t[1];
        v[14] ^= self.f[0];
        v[15] ^= self.f[1];

        for s in &SIGMA {
            g(&mut v, 0, 4, 8, 12, m[s[0]], m[s[1]]);
            g(&mut v, 1, 5, 9, 13, m[s[2]], m[s[3]]);
            g(&mut v, 2, 6, 10, 14, m[s[4]], m[s[5]]);
            g(&mut v, 3, 7, 11, 15, m[s[6]], m[s[7]]);
            g(&mut v, 0, 5, 10, 15, m[s[8]], m[s[9]]);
            g(&mut v, 1, 6, 11, 12, m[s[10]], m[s[11]]);
            g(&mut v, 2, 7, 8, 13, m[s[12]], m[s[13]]);
            g(&mut v, 3, 4, 9, 14, m[s[14]], m[s[15]]);
        }

        for i in 0..8 {
            self.h[i] ^= v[i] ^ v[i + 8];
        }
    }
}

#[inline]
fn g(v: &mut [u64; 16], a: usize, b: usize, c: usize, d: usize, x: u64, y: u64) {
    v[a] = v[a].wrapping_add(v[b]).wrapping_add(x);
    v[d] = (v[d] ^ v[a]).rotate_right(32);
    v[c] = v[c].wrapping_add(v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(24);
    v[a] = v[a].wrapping_add(v[b]).wrapping_add(y);
    v[d] = (v[d] ^ v[a]).rotate_right(16);
    v[c] = v[c].wrapping_add(v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(63);
}
