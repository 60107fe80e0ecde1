//! Block header assembly and the proof-of-work check.
//!
//! A BitcoinZ header comes in two lengths: the 140-byte pre-solution header
//! (what the Equihash base state absorbs) and the 241-byte full header (the
//! 140 bytes, a one-byte compact-size `0x64`, and the 100-byte packed
//! solution) whose double SHA-256 is compared against the target.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::{self, compact_to_u256, U256};
use crate::crypto;
use crate::crypto::blake2b::Blake2b;
use crate::equihash::{self, Solution};

/// Header bytes ahead of the nonce; this is what the per-job base state
/// absorbs once, with the nonce appended per attempt.
pub const PREFIX_BYTES: usize = 108;

/// Pre-solution header length.
pub const EH_HEADER_BYTES: usize = 140;

/// Full header length.
pub const FULL_HEADER_BYTES: usize = 241;

/// Compact-size prefix of the solution; always 100 for 144,5.
const SOLUTION_LENGTH_PREFIX: u8 = 0x64;

/// One unit of work as assembled from the pool's subscribe/notify/target
/// messages.
#[derive(Debug, Clone)]
pub struct MiningParams {
    pub job_id: String,
    pub version: u32,
    pub prev_hash: U256,
    pub merkle_root: U256,
    pub final_sapling_root: U256,
    pub time: u32,
    pub bits: u32,
    /// Pool-assigned leading nonce bytes.
    pub nonce1: U256,
    /// How many leading bytes of the nonce belong to the pool.
    pub nonce1_bytes: usize,
    /// Share target (usually looser than the network target from `bits`).
    pub target: U256,
}

/// A complete block header, as a verifier observing a candidate sees it.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: U256,
    pub merkle_root: U256,
    pub final_sapling_root: U256,
    pub time: u32,
    pub bits: u32,
    pub nonce: U256,
    pub solution: Solution,
}

fn write_prefix(
    buf: &mut [u8],
    version: u32,
    prev_hash: &U256,
    merkle_root: &U256,
    final_sapling_root: &U256,
    time: u32,
    bits: u32,
) {
    codec::encode_u32_le(&mut buf[0x00..], version);
    buf[0x04..0x24].copy_from_slice(&prev_hash.0);
    buf[0x24..0x44].copy_from_slice(&merkle_root.0);
    buf[0x44..0x64].copy_from_slice(&final_sapling_root.0);
    codec::encode_u32_le(&mut buf[0x64..], time);
    codec::encode_u32_le(&mut buf[0x68..], bits);
}

impl BlockHeader {
    pub fn serialize_eh(&self) -> [u8; EH_HEADER_BYTES] {
        let mut buf = [0u8; EH_HEADER_BYTES];
        write_prefix(
            &mut buf,
            self.version,
            &self.prev_hash,
            &self.merkle_root,
            &self.final_sapling_root,
            self.time,
            self.bits,
        );
        buf[0x6C..0x8C].copy_from_slice(&self.nonce.0);
        buf
    }

    pub fn serialize_full(&self) -> [u8; FULL_HEADER_BYTES] {
        let mut buf = [0u8; FULL_HEADER_BYTES];
        buf[..EH_HEADER_BYTES].copy_from_slice(&self.serialize_eh());
        buf[0x8C] = SOLUTION_LENGTH_PREFIX;
        buf[0x8D..].copy_from_slice(&self.solution.0);
        buf
    }
}

/// Build the per-job Equihash base state: personalized BLAKE2b over the
/// 108-byte header prefix. Clones of this state absorb the nonce.
pub fn base_state(params: &MiningParams) -> Blake2b {
    let mut buf = [0u8; PREFIX_BYTES];
    write_prefix(
        &mut buf,
        params.version,
        &params.prev_hash,
        &params.merkle_root,
        &params.final_sapling_root,
        params.time,
        params.bits,
    );

    let mut state = Blake2b::new_equihash(equihash::PERSONAL, equihash::EH_N, equihash::EH_K);
    state.update(&buf);
    state
}

/// Append a nonce to a clone of the per-job base state, yielding the state
/// the solver and verifier consume.
pub fn state_with_nonce(base: &Blake2b, nonce: &U256) -> Blake2b {
    let mut state = base.clone();
    state.update(&nonce.0);
    state
}

/// Assemble the full 241-byte header for one `(nonce, solution)` candidate.
pub fn serialize_full_header(
    params: &MiningParams,
    nonce: &U256,
    solution: &Solution,
) -> [u8; FULL_HEADER_BYTES] {
    let mut buf = [0u8; FULL_HEADER_BYTES];
    write_prefix(
        &mut buf,
        params.version,
        &params.prev_hash,
        &params.merkle_root,
        &params.final_sapling_root,
        params.time,
        params.bits,
    );
    buf[0x6C..0x8C].copy_from_slice(&nonce.0);
    buf[0x8C] = SOLUTION_LENGTH_PREFIX;
    buf[0x8D..].copy_from_slice(&solution.0);
    buf
}

/// Does this candidate meet the pool's share target?
pub fn check_pow_target(params: &MiningParams, nonce: &U256, solution: &Solution) -> bool {
    let header = serialize_full_header(params, nonce, solution);
    crypto::wsha256(&header) <= params.target
}

/// Why a block header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    Equihash(equihash::InvalidSolution),
    InsufficientPow,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::Equihash(e) => write!(f, "invalid equihash solution: {}", e),
            BlockError::InsufficientPow => write!(f, "pow hash above target"),
        }
    }
}

impl std::error::Error for BlockError {}

/// Full block-validity check, the way a node observing a candidate performs
/// it: the Equihash solution must verify against the 140-byte header, and
/// the double SHA-256 of the 241-byte header must not exceed the target
/// encoded in `bits`.
pub fn check_block(header: &BlockHeader) -> Result<(), BlockError> {
    let mut state = Blake2b::new_equihash(equihash::PERSONAL, equihash::EH_N, equihash::EH_K);
    state.update(&header.serialize_eh());
    equihash::check_solution(&state, &header.solution).map_err(BlockError::Equihash)?;

    let pow = crypto::wsha256(&header.serialize_full());
    if pow > compact_to_u256(header.bits) {
        return Err(BlockError::InsufficientPow);
    }
    Ok(())
}

/// First nonce of a job: the pool's `nonce1` bytes up front, the remaining
/// bytes drawn from a generator seeded with the job time, so a given job
/// always starts from the same point.
pub fn nonce_init(params: &MiningParams) -> U256 {
    let mut nonce = params.nonce1;
    let mut rng = StdRng::seed_from_u64(u64::from(params.time));
    for byte in nonce.0[params.nonce1_bytes..].iter_mut() {
        *byte = rng.gen();
    }
    nonce
}

/// Little-endian increment confined to the miner-owned byte range. The
/// nonce space is far larger than a job ever lives, so wraparound is
/// academic.
pub fn nonce_increase(params: &MiningParams, nonce: &mut U256) {
    for byte in nonce.0[params.nonce1_bytes..].iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equihash::test_data;

    fn header_818128() -> BlockHeader {
        BlockHeader {
            version: test_data::VERSION,
            prev_hash: U256::from_hex_be(test_data::PREV_HASH).unwrap(),
            merkle_root: U256::from_hex_be(test_data::MERKLE_ROOT).unwrap(),
            final_sapling_root: U256::from_hex_be(test_data::FINAL_SAPLING_ROOT).unwrap(),
            time: test_data::TIME,
            bits: test_data::BITS,
            nonce: U256::from_hex_be(test_data::NONCE).unwrap(),
            solution: Solution::from_hex(test_data::SOLUTION).unwrap(),
        }
    }

    fn params_818128() -> MiningParams {
        MiningParams {
            job_id: "1".into(),
            version: test_data::VERSION,
            prev_hash: U256::from_hex_be(test_data::PREV_HASH).unwrap(),
            merkle_root: U256::from_hex_be(test_data::MERKLE_ROOT).unwrap(),
            final_sapling_root: U256::from_hex_be(test_data::FINAL_SAPLING_ROOT).unwrap(),
            time: test_data::TIME,
            bits: test_data::BITS,
            nonce1: U256::from_hex_le("81b601c2").unwrap(),
            nonce1_bytes: 4,
            target: compact_to_u256(test_data::BITS),
        }
    }

    #[test]
    fn test_header_layout() {
        let header = header_818128();
        let full = header.serialize_full();

        assert_eq!(codec::decode_u32_le(&full[0x00..]), 4);
        assert_eq!(&full[0x04..0x24], &header.prev_hash.0);
        assert_eq!(&full[0x24..0x44], &header.merkle_root.0);
        assert_eq!(&full[0x44..0x64], &header.final_sapling_root.0);
        assert_eq!(codec::decode_u32_le(&full[0x64..]), test_data::TIME);
        assert_eq!(codec::decode_u32_le(&full[0x68..]), test_data::BITS);
        assert_eq!(&full[0x6C..0x8C], &header.nonce.0);
        assert_eq!(full[0x8C], 0x64);
        assert_eq!(&full[0x8D..], &header.solution.0);

        assert_eq!(&header.serialize_eh(), &full[..EH_HEADER_BYTES]);
        assert_eq!(header.serialize_eh(), test_data::eh_header_818128());
    }

    #[test]
    fn test_check_block_accepts_818128() {
        assert_eq!(check_block(&header_818128()), Ok(()));
    }

    #[test]
    fn test_check_block_rejects_mutated_solution() {
        let mut header = header_818128();
        header.solution.0[0] = 0x03;
        assert!(matches!(
            check_block(&header),
            Err(BlockError::Equihash(_))
        ));
    }

    #[test]
    fn test_pow_hash_meets_compact_target() {
        let header = header_818128();
        let pow = crypto::wsha256(&header.serialize_full());
        assert!(pow <= compact_to_u256(test_data::BITS));
    }

    #[test]
    fn test_check_pow_target_roundtrip() {
        let params = params_818128();
        let nonce = U256::from_hex_be(test_data::NONCE).unwrap();
        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        assert!(check_pow_target(&params, &nonce, &solution));

        // an all-zero target rejects everything but a zero hash
        let mut strict = params;
        strict.target = U256::ZERO;
        assert!(!check_pow_target(&strict, &nonce, &solution));
    }

    #[test]
    fn test_base_state_matches_manual_absorption() {
        let params = params_818128();
        let nonce = U256::from_hex_be(test_data::NONCE).unwrap();
        let state = state_with_nonce(&base_state(&params), &nonce);

        // identical to absorbing the whole 140-byte header at once
        let reference = test_data::base_state_818128();
        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        assert_eq!(equihash::check_solution(&state, &solution), Ok(()));
        assert_eq!(equihash::check_solution(&reference, &solution), Ok(()));
    }

    #[test]
    fn test_nonce_init_is_deterministic_per_time() {
        let params = params_818128();
        let a = nonce_init(&params);
        let b = nonce_init(&params);
        assert_eq!(a, b);
        assert_eq!(&a.0[..4], &[0x81, 0xB6, 0x01, 0xC2]);

        let mut other_time = params.clone();
        other_time.time += 1;
        let c = nonce_init(&other_time);
        assert_eq!(&c.0[..4], &[0x81, 0xB6, 0x01, 0xC2]);
        assert_ne!(a.0[4..], c.0[4..]);
    }

    #[test]
    fn test_nonce_increase_carries_within_tail() {
        let mut params = params_818128();
        params.nonce1_bytes = 4;

        let mut nonce = params.nonce1;
        nonce.0[4] = 0xFF;
        nonce.0[5] = 0xFF;
        nonce_increase(&params, &mut nonce);
        assert_eq!(nonce.0[4], 0x00);
        assert_eq!(nonce.0[5], 0x00);
        assert_eq!(nonce.0[6], 0x01);
        // pool-owned bytes are never touched
        assert_eq!(&nonce.0[..4], &[0x81, 0xB6, 0x01, 0xC2]);

        let mut plain = params.nonce1;
        nonce_increase(&params, &mut plain);
        assert_eq!(plain.0[4], 0x01);
    }
}
