//! Virtual machine module
//!
//! The VM executes Nest bytecode using a stack-based architecture. The
//! interpreter itself is a set of `impl Context` methods; this module holds
//! the instruction set, the runtime stacks, variable tables and coroutines.

pub mod coroutine;
pub mod interpreter;
pub mod opcode;
pub mod stack;
pub mod var_table;

pub use coroutine::{CoState, CoroutineObj};
pub use opcode::{OpCode, OpFormat};
pub use stack::{CallStack, CatchFrame, CatchStack, Frame, MAX_CALL_DEPTH, ValueStack};
pub use var_table::VarTable;
