//! wisp-vm - The wisp virtual machine.
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! A byte-at-a-time interpreter over the shared opcode set in `wisp-prog`.
//! Execution state lives in a [`Context`]:
//!
//! - registers in 256-slot frames, one chain of frames per lexical depth;
//! - a call stack of return pc / result slot pairs;
//! - a list arena with stable handles and mark-sweep reclamation;
//! - the deterministic PRNG, timeout budget, and latched status.
//!
//! The VM is cooperative: `say`/`warn`/`ask` and native commands suspend
//! it with a pending [`Effect`] the host fulfills through
//! [`Context::resume`]. There is no threading anywhere in this crate.

pub mod context;
pub mod pickle;
pub mod rand;
pub mod stdlib;
pub mod value;

pub use context::{Context, CtxStatus, Effect, RunResult};
pub use rand::Rand;
pub use value::{ListArena, ListRef, UserData, Value};

#[cfg(test)]
mod tests;
