//! wisp - An embeddable scripting language for build-time metaprogramming.
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! wisp is a small, dynamically typed, expression-oriented language with a
//! bytecode compiler and a cooperative virtual machine. This crate is the
//! embedding surface; the phases live in their own crates:
//!
//! ```text
//! source bytes
//!      │
//!      ▼
//! [wisp-lex]  ──▶ tokens
//!      │
//!      ▼
//! [wisp-par]  ──▶ statements (incremental)
//!      │
//!      ▼
//! [wisp-gen]  ──▶ bytecode into a wisp-prog Program
//!      │               │ dump/load + validate
//!      ▼               ▼
//! [wisp-vm]   ◀── serialized program
//! ```
//!
//! # Embedding
//!
//! ```no_run
//! use wisp::{Collector, RunResult, Script};
//!
//! let mut script = Script::new(false);
//! script.write(b"say 1 + 2\n").unwrap();
//! script.close().unwrap();
//!
//! let mut ctx = script.context();
//! let mut host = Collector::default();
//! assert_eq!(wisp::run_with(&mut ctx, &mut host), RunResult::Pass);
//! assert_eq!(host.said, vec![b"3".to_vec()]);
//! ```
//!
//! The host supplies three optional async callbacks (`say`, `warn`, `ask`)
//! and any number of native commands, addressed by the 64-bit hash of
//! their qualified name so registration order never matters. Compile-time
//! file access (`include`, `embed`) goes through an [`IncludeResolver`].

pub mod host;
pub mod script;

pub use host::{run_with, Collector, FsType, Host, HostReply, IncludeResolver, NoIncludes};
pub use script::Script;

pub use wisp_prog::{Loader, Program};
pub use wisp_util::{hash64, CompileError, Pos};
pub use wisp_vm::{Context, CtxStatus, Effect, ListRef, RunResult, Value};
