// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Seeded PRNG (Mulberry32)
//!
//! Arena and judge scoring must be reproducible from the run seed alone, across
//! processes and across implementations. The generator keeps a single `u32` of
//! state and every step uses wrapping 32-bit arithmetic; floats only appear in
//! the final normalisation.

/// Offset applied to the run seed for the judge stream so it never shares a
/// sequence with the arena stream.
pub const JUDGE_SEED_OFFSET: u64 = 1000;

const INCREMENT: u32 = 0x6D2B_79F5;
const NORMALISER: f64 = 4_294_967_296.0;

/// Deterministic float generator producing values in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u32,
}

impl SeededRng {
    /// Create a generator from a run seed. Only the low 32 bits are used.
    pub fn new(seed: u64) -> Self {
        Self { state: seed as u32 }
    }

    /// Generator for the ARENA stage.
    pub fn for_arena(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Generator for the JUDGE stage, offset from the arena stream.
    pub fn for_judge(seed: u64) -> Self {
        Self::new(seed.wrapping_add(JUDGE_SEED_OFFSET))
    }

    /// Next raw 32-bit output.
    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(INCREMENT);
        let s = self.state;
        let mut t = (s ^ (s >> 15)).wrapping_mul(1 | s);
        t = t.wrapping_add((t ^ (t >> 7)).wrapping_mul(61 | t)) ^ t;
        t ^ (t >> 14)
    }

    /// Next float in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / NORMALISER
    }

    /// Next float in `[low, low + span)`.
    pub fn next_in(&mut self, low: f64, span: f64) -> f64 {
        self.next_f64() * span + low
    }
}
