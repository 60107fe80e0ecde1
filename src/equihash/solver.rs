//! Multi-threaded bucket-sorted Equihash solver.
//!
//! Wagner's algorithm over six 24-bit digits, arranged as a seed phase,
//! four pairing rounds, and a final pair-off:
//!
//!   seed     derive all 2^25 leaf hashes and drop each into the bucket
//!            keyed by the low 14 bits of its first digit
//!   round r  inside every bucket, pair slots whose leading digit matches
//!            on the remaining 10 bits, XOR away that digit, and push the
//!            result into the output bucket of its new leading digit
//!   final    require the last two digits to cancel, reconstruct the 32
//!            leaf indices through the back-reference trail, and emit
//!
//! A slot is seven u32 words. At the start of round `r` the first `6 - r`
//! words are live digits; behind them sits the back reference the previous
//! round wrote, and behind that, untouched, the references of still earlier
//! rounds (each round writes only its leading `7 - r` words into the output
//! cell, so the deeper trail words written by the round before last survive
//! in place):
//!
//!   seed    [d0 d1 d2 d3 d4 d5 leaf]
//!   round 0 [d1 d2 d3 d4 d5 ref0_lo ref0_hi]
//!   round 1 [d2 d3 d4 d5 ref1_lo ref1_hi  ·]
//!   round 2 [d3 d4 d5 ref2_lo ref2_hi  ·  ·]
//!   round 3 [d4 d5 ref3_lo ref3_hi  ·  ·  ·]
//!
//! A back reference names `(bucket, slot, slot)` in the round's *input*
//! buffer. Two buffers alternate as input and output; reconstruction at the
//! end zig-zags between them, reading the buffers of rounds 3, 2, 1, 0 in
//! turn, down to the seed leaves.
//!
//! Buckets are fixed-capacity: 4096 slots against an expected load of 2048
//! (extra_room = 2.0). A push into a full bucket is dropped and counted;
//! dropped pushes can cost solutions but never corrupt one.
//!
//! Threading: a pool of workers created once, the calling thread acting as
//! worker 0, with a barrier at every phase boundary. Generators and buckets
//! are striped across workers by `id % threads`. Slot claims are counter
//! fetch-adds; at each round transition the consuming worker reads a bucket
//! count with an exchange-to-zero, which together with the barrier orders
//! every slot write of the previous phase before any read of this one.
//! With a single worker and no dropped pushes the solution set is exactly
//! deterministic; drops can only shrink it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use super::{
    generate_hash, Solution, DIGIT_BITS, EH_K, HASHES_PER_BLAKE, HASH_BYTES,
    HASH_DIGITS, PACKED_SOLUTION_BYTES, RANGE, SOLUTION_INDICES,
};
use crate::codec;
use crate::crypto::blake2b::Blake2b;

/// Low bits of the leading digit that select the bucket (~60% of it).
const BUCKET_BITS: u32 = DIGIT_BITS * 3 / 5; // 14
const BUCKET_MASK: u32 = (1 << BUCKET_BITS) - 1;
const NUM_BUCKETS: usize = 1 << BUCKET_BITS;

/// Digit bits left to compare inside a bucket.
const OTHER_BITS: u32 = DIGIT_BITS - BUCKET_BITS; // 10

/// Slot capacity per bucket: expected load 2^(OTHER_BITS + 1), doubled.
const SLOT_BITS: u32 = OTHER_BITS + 2; // 12
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const SLOTS_PER_BUCKET: usize = 1 << SLOT_BITS; // 4096

const LAST_ROUND: usize = (EH_K - 1) as usize; // 4
const SLOT_WORDS: usize = HASH_DIGITS + 1; // 7

// ─── Bucket arenas ──────────────────────────────────────────────────

/// One of the two double-buffered slot arenas with its per-bucket fill
/// counters. Slot words are relaxed atomics: the phase barrier plus the
/// exchange-to-zero counter consume provide the cross-thread ordering, so
/// no slot is ever read in the phase that writes it.
struct BucketBuffer {
    slots: Box<[AtomicU32]>,
    taken: Box<[AtomicU32]>,
}

impl BucketBuffer {
    fn new() -> Self {
        let total_words = NUM_BUCKETS * SLOTS_PER_BUCKET * SLOT_WORDS;
        BucketBuffer {
            slots: (0..total_words).map(|_| AtomicU32::new(0)).collect(),
            taken: (0..NUM_BUCKETS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[inline]
    fn slot_base(bucket: usize, slot: usize) -> usize {
        (bucket * SLOTS_PER_BUCKET + slot) * SLOT_WORDS
    }

    /// Claim the next free slot of `bucket`. `None` means the bucket is
    /// full and this push is dropped.
    #[inline]
    fn push_slot(&self, bucket: usize) -> Option<usize> {
        let slot = self.taken[bucket].fetch_add(1, Ordering::Relaxed) as usize;
        if slot < SLOTS_PER_BUCKET {
            Some(slot)
        } else {
            None
        }
    }

    /// Read a bucket's fill count and reset it to zero, clamped to
    /// capacity. Each bucket is consumed by exactly one worker per round.
    #[inline]
    fn consume_taken(&self, bucket: usize) -> usize {
        let taken = self.taken[bucket].swap(0, Ordering::AcqRel) as usize;
        taken.min(SLOTS_PER_BUCKET)
    }

    #[inline]
    fn read_slot(&self, bucket: usize, slot: usize) -> SlotData {
        let base = Self::slot_base(bucket, slot);
        let mut words = [0u32; SLOT_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.slots[base + i].load(Ordering::Relaxed);
        }
        SlotData { words }
    }

    /// Write the leading `words.len()` words of a cell, leaving the deeper
    /// trail words of earlier rounds untouched.
    #[inline]
    fn write_slot(&self, bucket: usize, slot: usize, words: &[u32]) {
        let base = Self::slot_base(bucket, slot);
        for (i, word) in words.iter().enumerate() {
            self.slots[base + i].store(*word, Ordering::Relaxed);
        }
    }

    fn clear_counters(&self) {
        for counter in self.taken.iter() {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Clone, Copy)]
struct SlotData {
    words: [u32; SLOT_WORDS],
}

impl SlotData {
    /// Back reference of a slot as read at the start of `round`; at round 0
    /// this is the seed leaf index itself.
    #[inline]
    fn ancestor(&self, round: usize) -> u64 {
        let i = SLOT_WORDS - round - 1;
        if round == 0 {
            u64::from(self.words[i])
        } else {
            u64::from(self.words[i]) | (u64::from(self.words[i + 1]) << 32)
        }
    }

    #[inline]
    fn same_ancestor(&self, other: &SlotData, round: usize) -> bool {
        self.ancestor(round) == other.ancestor(round)
    }
}

// ─── Back references ────────────────────────────────────────────────

// bucket and two slot ids fit in 14 + 2 * 12 = 38 bits

#[inline]
fn make_ref(bucket: usize, s0: usize, s1: usize) -> u64 {
    debug_assert!(bucket < NUM_BUCKETS);
    debug_assert!(s0 < SLOTS_PER_BUCKET && s1 < SLOTS_PER_BUCKET);
    (bucket as u64) << (2 * SLOT_BITS) | (s0 as u64) << SLOT_BITS | s1 as u64
}

#[inline]
fn ref_bucket(reference: u64) -> usize {
    ((reference >> (2 * SLOT_BITS)) as u32 & BUCKET_MASK) as usize
}

#[inline]
fn ref_s0(reference: u64) -> usize {
    ((reference >> SLOT_BITS) as u32 & SLOT_MASK) as usize
}

#[inline]
fn ref_s1(reference: u64) -> usize {
    (reference as u32 & SLOT_MASK) as usize
}

/// XOR away the leading digit of a colliding pair and append the back
/// reference. Returns the output words and how many of them are live
/// (digits plus the two reference words).
#[inline]
fn join(
    round: usize,
    a: &SlotData,
    b: &SlotData,
    bucket: usize,
    s0: usize,
    s1: usize,
) -> ([u32; SLOT_WORDS], usize) {
    let digits = SLOT_WORDS - round - 2;
    let mut words = [0u32; SLOT_WORDS];
    for i in 0..digits {
        words[i] = a.words[i + 1] ^ b.words[i + 1];
    }
    let reference = make_ref(bucket, s0, s1);
    words[digits] = reference as u32;
    words[digits + 1] = (reference >> 32) as u32;
    (words, digits + 2)
}

// ─── In-bucket collision finding ────────────────────────────────────

/// Chained hash over the in-bucket OTHER bits of the leading digit. Heads
/// are indexed by the OTHER bits, `next` by slot id; walking the chain of a
/// slot's class before linking it yields every colliding pair exactly once,
/// with no sort.
struct CollisionChains {
    head: Box<[i32]>,
    next: Box<[i32]>,
}

impl CollisionChains {
    fn new() -> Self {
        CollisionChains {
            head: vec![-1; 1 << OTHER_BITS].into_boxed_slice(),
            next: vec![-1; SLOTS_PER_BUCKET].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.head.fill(-1);
        self.next.fill(-1);
    }

    /// Link `slot` at the head of its class; returns the previous head.
    #[inline]
    fn insert(&mut self, slot: usize, other_bits: u32) -> i32 {
        let head = self.head[other_bits as usize];
        self.next[slot] = head;
        self.head[other_bits as usize] = slot as i32;
        head
    }

    #[inline]
    fn next_slot(&self, slot: usize) -> i32 {
        self.next[slot]
    }
}

// ─── Solver ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct SolveJob {
    state: Blake2b,
    max_sols: usize,
}

struct SolverShared {
    num_threads: usize,
    barrier: Barrier,
    buffers: [BucketBuffer; 2],
    /// `None` tells parked workers to shut down.
    job: Mutex<Option<SolveJob>>,
    solutions: Mutex<Vec<Solution>>,
    discarded_hashes: AtomicU32,
    discarded_collisions: AtomicU32,
    discarded_solutions: AtomicU32,
}

/// Result of one solve.
#[derive(Debug, Clone)]
pub struct SolveOutput {
    pub solutions: Vec<Solution>,
    /// Seed hashes dropped on full buckets.
    pub discarded_hashes: u32,
    /// Joined pairs dropped on full buckets.
    pub discarded_collisions: u32,
    /// Solutions beyond `max_sols`.
    pub discarded_solutions: u32,
}

/// A reusable Equihash solver: two ~1.9 GB bucket arenas and a worker pool,
/// allocated once and driven through as many solves as the miner needs.
pub struct Solver {
    shared: Arc<SolverShared>,
    workers: Vec<thread::JoinHandle<()>>,
    scratch: CollisionChains,
}

impl Solver {
    /// Allocate the arenas and spawn `num_threads - 1` workers; the thread
    /// calling [`solve`](Self::solve) acts as worker 0.
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads >= 1);

        let shared = Arc::new(SolverShared {
            num_threads,
            barrier: Barrier::new(num_threads),
            buffers: [BucketBuffer::new(), BucketBuffer::new()],
            job: Mutex::new(None),
            solutions: Mutex::new(Vec::new()),
            discarded_hashes: AtomicU32::new(0),
            discarded_collisions: AtomicU32::new(0),
            discarded_solutions: AtomicU32::new(0),
        });

        let workers = (1..num_threads)
            .map(|thread_id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("eh-worker-{}", thread_id))
                    .spawn(move || {
                        let mut scratch = CollisionChains::new();
                        while run_cycle(&shared, thread_id, &mut scratch) {}
                    })
                    .expect("failed to spawn equihash worker")
            })
            .collect();

        Solver {
            shared,
            workers,
            scratch: CollisionChains::new(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.shared.num_threads
    }

    /// Run one full solve against `base_state` (header prefix and nonce
    /// already absorbed), keeping at most `max_sols` solutions.
    pub fn solve(&mut self, base_state: &Blake2b, max_sols: usize) -> SolveOutput {
        let shared = &self.shared;

        // workers are parked at the start barrier, so resetting the
        // per-solve state here is single-threaded
        shared.buffers[0].clear_counters();
        shared.buffers[1].clear_counters();
        shared.solutions.lock().unwrap().clear();
        shared.discarded_hashes.store(0, Ordering::Relaxed);
        shared.discarded_collisions.store(0, Ordering::Relaxed);
        shared.discarded_solutions.store(0, Ordering::Relaxed);
        *shared.job.lock().unwrap() = Some(SolveJob {
            state: base_state.clone(),
            max_sols,
        });

        run_cycle(shared, 0, &mut self.scratch);

        let output = SolveOutput {
            solutions: std::mem::take(&mut *shared.solutions.lock().unwrap()),
            discarded_hashes: shared.discarded_hashes.load(Ordering::Relaxed),
            discarded_collisions: shared.discarded_collisions.load(Ordering::Relaxed),
            discarded_solutions: shared.discarded_solutions.load(Ordering::Relaxed),
        };
        tracing::debug!(
            solutions = output.solutions.len(),
            discarded_hashes = output.discarded_hashes,
            discarded_collisions = output.discarded_collisions,
            discarded_solutions = output.discarded_solutions,
            "equihash solve finished"
        );
        output
    }
}

impl Drop for Solver {
    fn drop(&mut self) {
        *self.shared.job.lock().unwrap() = None;
        self.shared.barrier.wait();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One job cycle as seen by every worker, the driving thread included.
/// Returns false on shutdown.
fn run_cycle(shared: &SolverShared, thread_id: usize, scratch: &mut CollisionChains) -> bool {
    shared.barrier.wait();
    let job = match &*shared.job.lock().unwrap() {
        Some(job) => job.clone(),
        None => return false,
    };

    seed_hashes(shared, &job.state, thread_id);
    shared.barrier.wait();

    for round in 0..LAST_ROUND {
        collide_round(shared, round, thread_id, scratch);
        shared.barrier.wait();
    }

    collide_last(shared, thread_id, scratch, job.max_sols);
    shared.barrier.wait();
    true
}

/// Seed phase: derive every leaf's digits and bucket it by the low bits of
/// its first digit. Generators are striped across workers.
fn seed_hashes(shared: &SolverShared, base_state: &Blake2b, thread_id: usize) {
    let output = &shared.buffers[0];
    let num_blakes = (RANGE as usize + HASHES_PER_BLAKE - 1) / HASHES_PER_BLAKE;

    let mut generator = thread_id;
    while generator < num_blakes {
        let blake = generate_hash(base_state, generator as u32);
        for sub in 0..HASHES_PER_BLAKE {
            let index = (generator * HASHES_PER_BLAKE + sub) as u32;
            if index >= RANGE {
                // the last generator spills one leaf past the 2^25 domain
                break;
            }
            let mut digits = [0u32; HASH_DIGITS];
            codec::unpack_uints(
                DIGIT_BITS,
                &blake[sub * HASH_BYTES..(sub + 1) * HASH_BYTES],
                &mut digits,
            );

            let bucket = (digits[0] & BUCKET_MASK) as usize;
            match output.push_slot(bucket) {
                Some(slot) => {
                    let mut words = [0u32; SLOT_WORDS];
                    words[..HASH_DIGITS].copy_from_slice(&digits);
                    words[HASH_DIGITS] = index;
                    output.write_slot(bucket, slot, &words);
                }
                None => {
                    shared.discarded_hashes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        generator += shared.num_threads;
    }
}

/// One pairing round: buckets are striped across workers; every worker
/// reads whole input buckets and writes joins into arbitrary output
/// buckets.
fn collide_round(
    shared: &SolverShared,
    round: usize,
    thread_id: usize,
    chains: &mut CollisionChains,
) {
    let input = &shared.buffers[round % 2];
    let output = &shared.buffers[(round + 1) % 2];

    let mut bucket = thread_id;
    while bucket < NUM_BUCKETS {
        let taken = input.consume_taken(bucket);
        chains.reset();
        for s0 in 0..taken {
            let slot0 = input.read_slot(bucket, s0);
            let mut s1 = chains.insert(s0, slot0.words[0] >> BUCKET_BITS);
            while s1 >= 0 {
                let slot1 = input.read_slot(bucket, s1 as usize);
                if !slot0.same_ancestor(&slot1, round) {
                    let (words, live) =
                        join(round, &slot0, &slot1, bucket, s0, s1 as usize);
                    let out_bucket = (words[0] & BUCKET_MASK) as usize;
                    match output.push_slot(out_bucket) {
                        Some(slot) => output.write_slot(out_bucket, slot, &words[..live]),
                        None => {
                            shared
                                .discarded_collisions
                                .fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                s1 = chains.next_slot(s1 as usize);
            }
        }
        bucket += shared.num_threads;
    }
}

/// Final round: the chain already matches the whole leading digit, the
/// second one is checked by hand; each surviving pair is a candidate
/// solution.
fn collide_last(
    shared: &SolverShared,
    thread_id: usize,
    chains: &mut CollisionChains,
    max_sols: usize,
) {
    let input = &shared.buffers[LAST_ROUND % 2];

    let mut bucket = thread_id;
    while bucket < NUM_BUCKETS {
        let taken = input.consume_taken(bucket);
        chains.reset();
        for s0 in 0..taken {
            let slot0 = input.read_slot(bucket, s0);
            let mut s1 = chains.insert(s0, slot0.words[0] >> BUCKET_BITS);
            while s1 >= 0 {
                let slot1 = input.read_slot(bucket, s1 as usize);
                if slot0.words[1] == slot1.words[1]
                    && !slot0.same_ancestor(&slot1, LAST_ROUND)
                {
                    let mut indices = [0u32; SOLUTION_INDICES];
                    if distinct_indices(shared, &slot0, &slot1, &mut indices) {
                        push_solution(shared, &indices, max_sols);
                    }
                }
                s1 = chains.next_slot(s1 as usize);
            }
        }
        bucket += shared.num_threads;
    }
}

fn push_solution(shared: &SolverShared, indices: &[u32; SOLUTION_INDICES], max_sols: usize) {
    let mut packed = [0u8; PACKED_SOLUTION_BYTES];
    codec::pack_uints(super::INDEX_BITS, indices, &mut packed);

    let mut solutions = shared.solutions.lock().unwrap();
    if solutions.len() < max_sols {
        solutions.push(Solution(packed));
    } else {
        shared.discarded_solutions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Materialize the 32 leaf indices under a final pair and check they are
/// pairwise distinct.
fn distinct_indices(
    shared: &SolverShared,
    a: &SlotData,
    b: &SlotData,
    out: &mut [u32; SOLUTION_INDICES],
) -> bool {
    let step = SOLUTION_INDICES / 2;
    walk_indices(shared, LAST_ROUND - 1, a.ancestor(LAST_ROUND), &mut out[..step]);
    walk_indices(shared, LAST_ROUND - 1, b.ancestor(LAST_ROUND), &mut out[step..]);
    if out[0] > out[step] {
        let (lo, hi) = out.split_at_mut(step);
        lo.swap_with_slice(hi);
    }

    for i in 0..SOLUTION_INDICES {
        for j in (i + 1)..SOLUTION_INDICES {
            if out[i] == out[j] {
                return false;
            }
        }
    }
    true
}

/// Recursively expand a back reference into the leaf indices below it,
/// placing the subtree with the smaller minimum leaf in the lower half at
/// every level (the canonical Wagner ordering).
fn walk_indices(shared: &SolverShared, round: usize, reference: u64, out: &mut [u32]) {
    let buffer = &shared.buffers[round % 2];
    let bucket = ref_bucket(reference);
    let s0 = ref_s0(reference);
    let s1 = ref_s1(reference);
    let step = 1usize << round;
    debug_assert_eq!(out.len(), 2 * step);

    if round == 0 {
        out[0] = buffer.read_slot(bucket, s0).ancestor(0) as u32;
        out[1] = buffer.read_slot(bucket, s1).ancestor(0) as u32;
    } else {
        let next = buffer.read_slot(bucket, s0).ancestor(round);
        walk_indices(shared, round - 1, next, &mut out[..step]);
        let next = buffer.read_slot(bucket, s1).ancestor(round);
        walk_indices(shared, round - 1, next, &mut out[step..]);
    }

    if out[0] > out[step] {
        let (lo, hi) = out.split_at_mut(step);
        lo.swap_with_slice(hi);
    }
}
