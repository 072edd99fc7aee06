//! # xpm scheduler
//!
//! A dependency-driven scheduler for experiment jobs.
//!
//! Resources (data, jobs and token pools) form a dependency graph. Each
//! resource carries a small state machine; a job becomes ready once every
//! dependency is satisfied and starts once every dependency lock is granted.
//!
//! ## Core Problem Solved
//!
//! Experiment pipelines chain long-running jobs over shared data:
//!
//! - **Ordering**: a job must wait for the data it reads to be produced
//! - **Exclusion**: writers of a resource must not overlap with its readers
//! - **Bounded capacity**: at most `n` jobs may hold a GPU or licence token
//! - **Restarts**: state, locks and running processes must survive a scheduler restart
//!
//! ## Key Features
//!
//! - **Dependency protocol**: exclusive, read/write and token dependencies
//! - **All-or-nothing locking**: a job holds every lock it needs or none of them
//! - **Background loops**: job runner, change notifier, delayed messenger and a
//!   periodic running-job checker, each on its own thread
//! - **Durable collaborators**: JSONL store, file lock registry and exit markers
//!   under a state directory, or in-memory ones for tests
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xpm_scheduler::builders::build_scheduler;
//! use xpm_scheduler::config::SchedulerConfig;
//! use xpm_scheduler::core::{Dependency, Resource, ResourceState};
//! use xpm_scheduler::infra::InMemoryLauncher;
//!
//! let scheduler = build_scheduler(SchedulerConfig::from_env()?, Arc::new(InMemoryLauncher::new()))?;
//! let handle = scheduler.handle();
//!
//! let data = Resource::data("/exp/dataset", ResourceState::Waiting);
//! let data_id = handle.submit(&data)?;
//!
//! let train = Resource::job("/exp/train", 0);
//! train.declare(Dependency::read(data_id))?;
//! handle.submit(&train)?;
//!
//! // The job starts once the dataset is done.
//! handle.set_state(data_id, ResourceState::Done)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Resources, dependencies, locks and the scheduler loops.
pub mod core;
/// Configuration models.
pub mod config;
/// Builders to assemble a scheduler from configuration.
pub mod builders;
/// Collaborator implementations: stores, lock registries, markers and launchers.
pub mod infra;
/// Listener adapters and query surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
