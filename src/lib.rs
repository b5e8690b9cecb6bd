//! nest-vm - the execution core of the Nest scripting language
//!
//! Nest values are heap objects addressed by [`ObjRef`] handles. Memory is
//! managed with reference counting, and container objects (maps, sequences,
//! functions, iterators, coroutines) are additionally tracked by a
//! generational collector that reclaims reference cycles.
//!
//! # Features
//! - Reference-counted object arena with per-type free-lists
//! - Four-generation cycle collector
//! - Stack-based bytecode interpreter with catch frames and tracebacks
//! - Cooperative coroutines and generators
//! - A textual bytecode listing format for running programs
//!
//! # Example
//! ```ignore
//! use nestvm::{Config, Context, asm};
//!
//! let mut ctx = Context::new(Config::default()).unwrap();
//! let main = asm::assemble(&mut ctx, "func main()\n PUSH_VAL 42\n RETURN_VAL\nend\n", "demo.nsa").unwrap();
//! let result = ctx.run_program(main).unwrap();
//! assert_eq!(ctx.heap().as_int(result), Some(42));
//! ```

// Core modules
pub mod config;
pub mod context;
pub mod error;
pub mod value;

// Memory management
pub mod gc;

// Object types and operations
pub mod runtime;

// Virtual machine
pub mod vm;

// Native libraries
pub mod native;

// Bytecode listings
pub mod asm;

// Re-export main types
pub use config::Config;
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use value::ObjRef;
