#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! `rbx-core`: the deterministic, cache-backed, sandboxed build-and-grade
//! engine underneath the `rbx` competitive-programming toolkit.
//!
//! The eight components of the design (A-H) are each their own module:
//!
//! | Component | Module | Responsibility |
//! |---|---|---|
//! | A | [`digest`] | Content-addressable hashing of files, trees and invocations. |
//! | B | [`cache`] | Fingerprint-keyed artifact store with integrity checks and singleflight. |
//! | C | [`sandbox`] | Bounded-resource single-process execution. |
//! | D | [`interactive`] | Solution/interactor pair over OS pipes, with verdict reconciliation. |
//! | E | [`compiler`] | Source + language descriptor -> cached executable. |
//! | F | [`generator`] | Testcase generation with deterministic seeding and validation. |
//! | G | [`eval`] | Per-(solution, testcase) run -> check orchestration. |
//! | H | [`scheduler`] | Parallel evaluation fan-out with cancellation and streaming. |
//!
//! [`descriptor`] holds the typed boundary records (package, language,
//! sandbox profile, testcase, verdict); [`context`] holds the explicit
//! `EngineContext` every operation above takes instead of touching any
//! ambient global; [`error`] holds the crate-wide error taxonomy.

pub mod error;

pub mod digest;

pub mod cache;

pub mod sandbox;

pub mod interactive;

pub mod descriptor;

pub mod context;

pub mod compiler;

pub mod generator;

pub mod eval;

pub mod scheduler;

pub use cache::{ArtifactCache, IntegrityMode};
pub use compiler::{compile, Executable};
pub use context::EngineContext;
pub use descriptor::{EvaluationRecord, Package, Testcase, Verdict};
pub use digest::{digest_file, digest_tree, Digest, Fingerprint};
pub use error::{RbxError, Result};
pub use eval::{evaluate, evaluate_testcase, EvaluationRequest, RunMode};
pub use generator::{build_testset, generate, GeneratorCall, TestSpec};
pub use scheduler::{cartesian_jobs, default_concurrency, run_all, CancellationToken, Job, RunOutcome};
