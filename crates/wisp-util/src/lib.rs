//! wisp-util - Shared utilities for the wisp toolchain.
//!
//! This crate holds the pieces every other wisp crate needs:
//!
//! - [`pos`] - source positions (file id, line, character)
//! - [`error`] - error types shared across the compiler and loader
//! - [`hash`] - MurmurHash3_x64_128 and the 64-bit command-name hash
//!
//! Hot-path hash maps throughout the workspace use
//! [`rustc_hash::FxHashMap`], re-exported here so downstream crates agree
//! on one hasher.

pub mod error;
pub mod hash;
pub mod pos;

pub use error::{CompileError, CompileResult, ValidateError, ValidateResult};
pub use hash::{hash128, hash64, hash_words};
pub use pos::{FileId, Pos};

pub use rustc_hash::{FxHashMap, FxHashSet};
