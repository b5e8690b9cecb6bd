//! Runtime object types
//!
//! - Object payloads, type objects and scalar helpers
//! - Maps (insertion ordered, open addressing)
//! - Arrays and vectors
//! - Bytecode and native functions
//! - Iterators
//! - Operators and casts

pub mod function;
pub mod iter;
pub mod map;
pub mod object;
pub mod ops;
pub mod sequence;

pub use function::{Bytecode, FuncBody, FuncObj, Instruction, NativeFn, Operand};
pub use iter::{IterObj, IterParts};
pub use map::MapObj;
pub use object::{Consts, Destructor, Object, Trace, TypeObj, Types};
pub use ops::{BinaryOp, UnaryOp};
pub use sequence::{SeqKind, SeqObj};
