// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: the run aggregate, its stages, result payloads and the
//! contracts for everything the pipeline depends on.

pub mod collaborators;
pub mod config;
pub mod events;
pub mod node_pool;
pub mod repository;
pub mod results;
pub mod rng;
pub mod run;
pub mod stage;
