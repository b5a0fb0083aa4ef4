//! Build execution core for `gantry`.
//!
//! This library contains the parts of the build system that decide which
//! targets must be (re)built, arrange their inputs, run their commands,
//! capture and hash their outputs, and mediate the artifact cache. The
//! build-file parser, target scheduler and CLI front-end are external
//! collaborators; they drive this crate through [`graph::Graph`] and
//! [`build::Builder`].

use derive_more::Display;

pub mod audit;
pub mod build;
pub mod cache;
pub mod config;
pub mod exec;
pub mod fetch;
pub mod filegroup;
pub mod fingerprint;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod hasher;
pub mod incremental;
pub mod label;
pub mod metadata;
pub mod progress;
pub mod subst;
pub mod target;

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
pub struct Locked;
