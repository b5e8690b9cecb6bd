//! Function objects
//!
//! A function is either a bytecode body with named parameters or a native
//! Rust callable with a fixed arity. Bytecode bodies are immutable once built
//! and shared through `Rc` so the interpreter can keep them borrowed while it
//! mutates the heap.

use std::rc::Rc;

use crate::context::Context;
use crate::error::{Error, Result, Span};
use crate::gc::Heap;
use crate::runtime::object::{Object, Trace};
use crate::value::ObjRef;
use crate::vm::opcode::OpCode;

/// Native function signature; arguments are borrowed, the result is owned
pub type NativeFn = fn(&mut Context, &[ObjRef]) -> Result<ObjRef>;

/// Instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Jump target, count or operator id
    Int(i64),
    /// Owned constant (value, name or type)
    Obj(ObjRef),
}

/// A single instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: OpCode,
    pub operand: Operand,
    pub span: Span,
}

impl Instruction {
    pub fn new(op: OpCode, operand: Operand, span: Span) -> Self {
        Instruction { op, operand, span }
    }

    #[inline]
    pub fn int(&self) -> i64 {
        match self.operand {
            Operand::Int(i) => i,
            _ => 0,
        }
    }

    #[inline]
    pub fn obj(&self) -> Option<ObjRef> {
        match self.operand {
            Operand::Obj(r) => Some(r),
            _ => None,
        }
    }
}

/// Instruction array of a bytecode function
#[derive(Debug, Default)]
pub struct Bytecode {
    pub instructions: Vec<Instruction>,
}

impl Bytecode {
    pub fn new() -> Self {
        Bytecode::default()
    }

    pub fn push(&mut self, op: OpCode, operand: Operand, span: Span) {
        self.instructions.push(Instruction::new(op, operand, span));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum FuncBody {
    Bytecode(Rc<Bytecode>),
    Native(NativeFn),
}

#[derive(Debug)]
pub struct FuncObj {
    pub name: String,
    pub body: FuncBody,
    /// Parameter names (`Str`), empty for natives
    pub params: Vec<ObjRef>,
    pub arity: usize,
    /// Globals of the module the function was defined in
    pub mod_globals: Option<ObjRef>,
}

impl FuncObj {
    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self.body, FuncBody::Native(_))
    }
}

impl Trace for FuncObj {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef)) {
        for &p in &self.params {
            visit(p);
        }
        if let FuncBody::Bytecode(code) = &self.body {
            for inst in &code.instructions {
                if let Operand::Obj(r) = inst.operand {
                    visit(r);
                }
            }
        }
        if let Some(globals) = self.mod_globals {
            visit(globals);
        }
    }
}

impl Heap {
    /// Create a bytecode function; `params` and the bytecode's object
    /// operands are transferred to it
    pub fn new_func(&mut self, name: &str, code: Bytecode, params: Vec<ObjRef>) -> Result<ObjRef> {
        let ty = self.types().func;
        let arity = params.len();
        self.alloc(
            ty,
            Object::Func(FuncObj {
                name: name.to_owned(),
                body: FuncBody::Bytecode(Rc::new(code)),
                params,
                arity,
                mod_globals: None,
            }),
        )
    }

    pub fn new_native(&mut self, name: &str, func: NativeFn, arity: usize) -> Result<ObjRef> {
        let ty = self.types().func;
        self.alloc(
            ty,
            Object::Func(FuncObj {
                name: name.to_owned(),
                body: FuncBody::Native(func),
                params: Vec::new(),
                arity,
                mod_globals: None,
            }),
        )
    }

    /// Replace the body of a bytecode function; the new bytecode's operands
    /// are transferred to it. Lets a listing's functions refer to each other
    /// (and to themselves) before their bodies exist. A body still shared by
    /// a running frame cannot be replaced.
    pub fn set_bytecode(&mut self, func: ObjRef, code: Bytecode) -> Result<()> {
        let refusal = match &self.expect_func(func)?.body {
            FuncBody::Native(_) => Some("cannot replace the body of a native function"),
            FuncBody::Bytecode(old) if Rc::strong_count(old) > 1 => {
                Some("cannot replace the body of a running function")
            }
            FuncBody::Bytecode(_) => None,
        };
        if let Some(message) = refusal {
            release_operands(self, code);
            return Err(Error::value_error(message));
        }
        let old = match self.get_mut(func) {
            Some(Object::Func(f)) => Some(std::mem::replace(
                &mut f.body,
                FuncBody::Bytecode(Rc::new(code)),
            )),
            _ => None,
        };
        if let Some(FuncBody::Bytecode(old)) = old {
            // the body was not shared, so this always succeeds
            if let Ok(old) = Rc::try_unwrap(old) {
                release_operands(self, old);
            }
        }
        Ok(())
    }

    /// Bind a module's global map to a function; the map is borrowed
    pub fn set_mod_globals(&mut self, func: ObjRef, globals: ObjRef) -> Result<()> {
        self.expect_func(func)?;
        self.inc_ref(globals);
        let old = match self.get_mut(func) {
            Some(Object::Func(f)) => f.mod_globals.replace(globals),
            _ => None,
        };
        self.dec_opt(old);
        Ok(())
    }
}

/// Drop the object operands of a bytecode that was never attached to a
/// function
pub fn release_operands(heap: &mut Heap, code: Bytecode) {
    for inst in code.instructions {
        if let Operand::Obj(r) = inst.operand {
            heap.dec_ref(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn make_bytecode(heap: &mut Heap) -> Bytecode {
        let mut code = Bytecode::new();
        let value = heap.new_int(7).unwrap();
        code.push(OpCode::PushVal, Operand::Obj(value), Span::none());
        code.push(OpCode::ReturnVal, Operand::None, Span::none());
        code
    }

    #[test]
    fn test_func_owns_operands() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let code = make_bytecode(&mut heap);
        let value = code.instructions[0].obj().unwrap();
        let param = heap.new_str("x").unwrap();
        let func = heap.new_func("f", code, vec![param]).unwrap();
        assert_eq!(heap.expect_func(func).unwrap().arity, 1);

        heap.inc_ref(value);
        heap.dec_ref(func);
        assert_eq!(heap.ref_count(value), 1);
        assert!(heap.get(param).is_none());
    }

    #[test]
    fn test_mod_globals() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let code = make_bytecode(&mut heap);
        let func = heap.new_func("f", code, Vec::new()).unwrap();
        let globals = heap.new_map().unwrap();
        heap.set_mod_globals(func, globals).unwrap();
        assert_eq!(heap.ref_count(globals), 2);
        assert_eq!(heap.expect_func(func).unwrap().mod_globals, Some(globals));
    }

    #[test]
    fn test_set_bytecode_releases_old_body() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let code = make_bytecode(&mut heap);
        let old_value = code.instructions[0].obj().unwrap();
        heap.inc_ref(old_value);
        let func = heap.new_func("f", code, Vec::new()).unwrap();

        let replacement = make_bytecode(&mut heap);
        heap.set_bytecode(func, replacement).unwrap();
        assert_eq!(heap.ref_count(old_value), 1);
        heap.dec_ref(func);
    }

    #[test]
    fn test_set_bytecode_refuses_shared_body() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let code = make_bytecode(&mut heap);
        let func = heap.new_func("f", code, Vec::new()).unwrap();
        let running = match &heap.expect_func(func).unwrap().body {
            FuncBody::Bytecode(code) => Rc::clone(code),
            FuncBody::Native(_) => unreachable!(),
        };

        let replacement = make_bytecode(&mut heap);
        let new_value = replacement.instructions[0].obj().unwrap();
        heap.inc_ref(new_value);
        let err = heap.set_bytecode(func, replacement).unwrap_err();
        assert_eq!(err.message, "cannot replace the body of a running function");
        // the rejected bytecode's operands were released
        assert_eq!(heap.ref_count(new_value), 1);

        drop(running);
        heap.dec_ref(func);
        heap.dec_ref(new_value);
    }
}
