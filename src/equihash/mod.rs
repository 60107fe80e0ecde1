//! Equihash, the BitcoinZ flavor: N = 144, K = 5.
//!
//! Equihash is a memory-hard proof of work built on the generalized
//! birthday problem. A solution is a set of 32 distinct indices into a
//! 2^25-element domain of BLAKE2b-derived hashes whose XOR is zero, subject
//! to structural ordering constraints that make solutions canonical and
//! cheap to verify.
//!
//! Each leaf hash is carved into six 24-bit *digits*. The solver
//! ([`solver::Solver`]) runs Wagner's algorithm: it eliminates one digit
//! per round by pairing elements that agree on their leading remaining
//! digit and XOR-combining them. The verifier here replays the same tree
//! bottom-up from the 32 indices of a candidate solution.
//!
//! Solving is expensive (gigabytes of bucket arenas, seconds of work);
//! verification touches 32 hashes and a few kilobytes of stack.

use std::fmt;

use crate::codec;
use crate::crypto::blake2b::Blake2b;

pub mod solver;

pub use solver::{Solver, SolveOutput};

pub const EH_N: u32 = 144;
pub const EH_K: u32 = 5;

/// Personalization string for the BLAKE2b parameter block. BitcoinZ forked
/// away from Zcash's "ZcashPoW" when it moved to 144,5.
pub const PERSONAL: &[u8; 8] = b"BitcoinZ";

/// Bytes per leaf hash: ceil(N / 8).
pub const HASH_BYTES: usize = (EH_N as usize + 7) / 8; // 18

/// Whole leaf hashes that fit in one 64-byte BLAKE2b output.
pub const HASHES_PER_BLAKE: usize = 64 / HASH_BYTES; // 3

/// BLAKE2b digest length used by the Equihash init.
pub const BLAKE_OUTLEN: usize = HASHES_PER_BLAKE * HASH_BYTES; // 54

/// Digits per leaf hash.
pub const HASH_DIGITS: usize = (EH_K + 1) as usize; // 6

/// Bits per digit: N / (K + 1).
pub const DIGIT_BITS: u32 = EH_N / (EH_K + 1); // 24

/// Bits per solution index: one more than a digit.
pub const INDEX_BITS: u32 = DIGIT_BITS + 1; // 25

/// Indices per solution: 2^K.
pub const SOLUTION_INDICES: usize = 1 << EH_K; // 32

/// Packed solution length: 32 indices of 25 bits.
pub const PACKED_SOLUTION_BYTES: usize = INDEX_BITS as usize * SOLUTION_INDICES / 8; // 100

/// Size of the index domain.
pub const RANGE: u32 = 1 << INDEX_BITS; // 2^25

/// A packed Equihash solution: the big-endian bit stream of 32 25-bit
/// indices. This byte sequence goes to the wire (and into submit hex)
/// unchanged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Solution(pub [u8; PACKED_SOLUTION_BYTES]);

impl Solution {
    pub fn from_indices(indices: &[u32; SOLUTION_INDICES]) -> Solution {
        let mut packed = [0u8; PACKED_SOLUTION_BYTES];
        codec::pack_uints(INDEX_BITS, indices, &mut packed);
        Solution(packed)
    }

    pub fn to_indices(self) -> [u32; SOLUTION_INDICES] {
        let mut indices = [0u32; SOLUTION_INDICES];
        codec::unpack_uints(INDEX_BITS, &self.0, &mut indices);
        indices
    }

    pub fn from_hex(s: &str) -> Result<Solution, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let packed: [u8; PACKED_SOLUTION_BYTES] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Solution(packed))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Solution({})", self.to_hex())
    }
}

/// Produce the BLAKE2b output of one generator: clone the absorbed header
/// state, append the generator as a little-endian u32, finalize. The output
/// carries [`HASHES_PER_BLAKE`] consecutive leaf hashes; leaf `i` lives in
/// generator `i / HASHES_PER_BLAKE`, sub-hash `i % HASHES_PER_BLAKE`.
pub fn generate_hash(base_state: &Blake2b, generator: u32) -> [u8; BLAKE_OUTLEN] {
    let mut state = base_state.clone();
    state.update(&generator.to_le_bytes());
    let mut out = [0u8; BLAKE_OUTLEN];
    state.finalize(&mut out);
    out
}

/// Recompute the six digits of one leaf.
pub fn leaf_digits(base_state: &Blake2b, index: u32) -> [u32; HASH_DIGITS] {
    let blake = generate_hash(base_state, index / HASHES_PER_BLAKE as u32);
    let sub = (index % HASHES_PER_BLAKE as u32) as usize;
    let mut digits = [0u32; HASH_DIGITS];
    codec::unpack_uints(
        DIGIT_BITS,
        &blake[sub * HASH_BYTES..(sub + 1) * HASH_BYTES],
        &mut digits,
    );
    digits
}

// ─── Verifier ───────────────────────────────────────────────────────

/// Why a candidate solution was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSolution {
    /// Two of the 32 indices coincide.
    DuplicateIndex,
    /// A pair at the given tree level does not cancel its leading digit.
    CollisionMismatch { round: usize },
    /// The smaller-min-leaf-first ordering is violated at the given level.
    IndexOrder { round: usize },
    /// The two top-level halves disagree on the final two digits.
    FinalDigitMismatch,
}

impl fmt::Display for InvalidSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidSolution::DuplicateIndex => write!(f, "duplicate leaf index"),
            InvalidSolution::CollisionMismatch { round } => {
                write!(f, "digit {} does not cancel", round)
            }
            InvalidSolution::IndexOrder { round } => {
                write!(f, "index order violated at level {}", round)
            }
            InvalidSolution::FinalDigitMismatch => {
                write!(f, "final two digits do not cancel")
            }
        }
    }
}

impl std::error::Error for InvalidSolution {}

/// Check a packed solution against a base state (the Equihash-initialized
/// BLAKE2b state that has absorbed the 140-byte header).
///
/// Walks a perfect binary tree over the 32 leaves: at level `r` (stride
/// `2^r`) adjacent pairs must cancel their leading remaining digit and the
/// left minimum leaf must be strictly smaller than the right; at the top the
/// two remaining digits of both halves must agree so their XOR vanishes.
pub fn check_solution(
    base_state: &Blake2b,
    solution: &Solution,
) -> Result<(), InvalidSolution> {
    let indices = solution.to_indices();

    for i in 0..SOLUTION_INDICES {
        for j in (i + 1)..SOLUTION_INDICES {
            if indices[i] == indices[j] {
                return Err(InvalidSolution::DuplicateIndex);
            }
        }
    }

    let mut digits = [[0u32; HASH_DIGITS]; SOLUTION_INDICES];
    for (row, &index) in digits.iter_mut().zip(indices.iter()) {
        *row = leaf_digits(base_state, index);
    }

    // XOR accumulates in place: after level r, digits[i] holds the XOR of
    // the 2^(r+1) leaves of the subtree rooted at i, and digits 0..=r of
    // every checked subtree are zero.
    let last_round = (EH_K - 1) as usize;
    for round in 0..last_round {
        let step = 1 << round;
        let mut i = 0;
        while i < SOLUTION_INDICES {
            for d in 0..HASH_DIGITS {
                digits[i][d] ^= digits[i + step][d];
            }
            if digits[i][round] != 0 {
                return Err(InvalidSolution::CollisionMismatch { round });
            }
            if indices[i] >= indices[i + step] {
                return Err(InvalidSolution::IndexOrder { round });
            }
            i += 2 * step;
        }
    }

    let half = SOLUTION_INDICES / 2;
    if digits[0][last_round] != digits[half][last_round]
        || digits[0][last_round + 1] != digits[half][last_round + 1]
    {
        return Err(InvalidSolution::FinalDigitMismatch);
    }
    if indices[0] >= indices[half] {
        return Err(InvalidSolution::IndexOrder { round: last_round });
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_data {
    use super::*;
    use crate::codec::{self, U256};

    // BTCZ mainnet block 818128
    pub const VERSION: u32 = 4;
    pub const PREV_HASH: &str =
        "0000007b753e415f80614ba8130aa4668ca4731b0539d9919c2074b43a46b9e8";
    pub const MERKLE_ROOT: &str =
        "6b2198b49e2055535c403830a3c124a8c235004b4662901010bc0927c43979ec";
    pub const FINAL_SAPLING_ROOT: &str =
        "189df3ceb26643f3b90ec7059316c7ccb26aeaf1e96559c63b8c6d52f04e79b5";
    pub const TIME: u32 = 1632007626;
    pub const BITS: u32 = 0x1E009CB8;
    pub const NONCE: &str =
        "81b601c200000000000000006dcdf558dd65a0dd9e68012952b8df1003cefade";
    pub const SOLUTION: &str = "02969d2baea1d4f46df3ddfc40b270b99edba12611cdc547990c8225d18f09ab96da59fd028558e4ab5f6e6e7e1469c2723a089789e121944d2ee7a89f0f92187d821ddd9694eff1579ec92d52e3fd4ee4d0bb522f560c7378bbef28efa9fd39ff112128";

    pub fn eh_header_818128() -> [u8; 140] {
        let mut buf = [0u8; 140];
        codec::encode_u32_le(&mut buf[0x00..], VERSION);
        buf[0x04..0x24].copy_from_slice(&U256::from_hex_be(PREV_HASH).unwrap().0);
        buf[0x24..0x44].copy_from_slice(&U256::from_hex_be(MERKLE_ROOT).unwrap().0);
        buf[0x44..0x64]
            .copy_from_slice(&U256::from_hex_be(FINAL_SAPLING_ROOT).unwrap().0);
        codec::encode_u32_le(&mut buf[0x64..], TIME);
        codec::encode_u32_le(&mut buf[0x68..], BITS);
        buf[0x6C..0x8C].copy_from_slice(&U256::from_hex_be(NONCE).unwrap().0);
        buf
    }

    pub fn base_state_818128() -> Blake2b {
        let mut state = Blake2b::new_equihash(PERSONAL, EH_N, EH_K);
        state.update(&eh_header_818128());
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solution_pack_roundtrip() {
        let mut indices = [0u32; SOLUTION_INDICES];
        for (i, v) in indices.iter_mut().enumerate() {
            *v = (i as u32) * 1_000_003 % RANGE;
        }
        let solution = Solution::from_indices(&indices);
        assert_eq!(solution.to_indices(), indices);

        let hex = solution.to_hex();
        assert_eq!(hex.len(), 2 * PACKED_SOLUTION_BYTES);
        assert_eq!(Solution::from_hex(&hex).unwrap(), solution);
        assert!(Solution::from_hex("0011").is_err());
    }

    #[test]
    fn test_generate_hash_splits_into_leaves() {
        let state = test_data::base_state_818128();
        let blake = generate_hash(&state, 0);

        // leaves 0..3 come from generator 0, at consecutive 18-byte offsets
        for sub in 0..HASHES_PER_BLAKE {
            let digits = leaf_digits(&state, sub as u32);
            let mut expected = [0u32; HASH_DIGITS];
            codec::unpack_uints(
                DIGIT_BITS,
                &blake[sub * HASH_BYTES..(sub + 1) * HASH_BYTES],
                &mut expected,
            );
            assert_eq!(digits, expected);
        }

        // leaf 3 starts generator 1
        let next = generate_hash(&state, 1);
        let mut expected = [0u32; HASH_DIGITS];
        codec::unpack_uints(DIGIT_BITS, &next[..HASH_BYTES], &mut expected);
        assert_eq!(leaf_digits(&state, 3), expected);
    }

    #[test]
    fn test_verifier_accepts_canonical_block() {
        let state = test_data::base_state_818128();
        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        assert_eq!(check_solution(&state, &solution), Ok(()));
    }

    #[test]
    fn test_verifier_rejects_mutated_byte() {
        let state = test_data::base_state_818128();
        let mut solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        assert_eq!(solution.0[0], 0x02);
        solution.0[0] = 0x03;
        assert!(check_solution(&state, &solution).is_err());
    }

    #[test]
    fn test_verifier_rejects_any_altered_index() {
        let state = test_data::base_state_818128();
        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        let indices = solution.to_indices();

        for victim in [0, 1, 15, 16, 31] {
            let mut mutated = indices;
            mutated[victim] ^= 1;
            let mutated = Solution::from_indices(&mutated);
            assert!(
                check_solution(&state, &mutated).is_err(),
                "index {} mutation accepted",
                victim
            );
        }
    }

    #[test]
    fn test_verifier_rejects_swapped_halves() {
        let state = test_data::base_state_818128();
        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();

        // 16 indices x 25 bits = 50 bytes: the halves split on a byte
        // boundary. Swapping them preserves every XOR but breaks the
        // top-level smaller-min-first ordering.
        let mut swapped = [0u8; PACKED_SOLUTION_BYTES];
        swapped[..50].copy_from_slice(&solution.0[50..]);
        swapped[50..].copy_from_slice(&solution.0[..50]);
        let swapped = Solution(swapped);

        assert!(matches!(
            check_solution(&state, &swapped),
            Err(InvalidSolution::IndexOrder { round: 4 })
        ));
    }

    #[test]
    fn test_verifier_rejects_perturbed_header() {
        // recompute with a mutated prefix: every leaf hash changes
        let mut header = test_data::eh_header_818128();
        header[0x64] ^= 1; // time
        let mut state = Blake2b::new_equihash(PERSONAL, EH_N, EH_K);
        state.update(&header);

        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        assert!(check_solution(&state, &solution).is_err());
    }

    #[test]
    fn test_verifier_rejects_duplicate_index() {
        let state = test_data::base_state_818128();
        let solution = Solution::from_hex(test_data::SOLUTION).unwrap();
        let mut indices = solution.to_indices();
        indices[3] = indices[20];
        let mutated = Solution::from_indices(&indices);
        assert_eq!(
            check_solution(&state, &mutated),
            Err(InvalidSolution::DuplicateIndex)
        );
    }
}
