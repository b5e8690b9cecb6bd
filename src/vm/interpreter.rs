//! Bytecode interpreter
//!
//! The dispatch loop runs the instruction array of the function on top of
//! the call stack until the stack drops back to the depth it was entered
//! at. Every call made from bytecode pushes a [`Frame`] and continues in the
//! same loop; native code re-enters the interpreter through
//! [`Context::call_function`], which runs a nested loop.
//!
//! When an instruction fails the loop unwinds: frames are popped down to the
//! innermost catch frame (or to the depth of the current invocation), each
//! popped frame dropping its values and adding its call site to the
//! traceback. A catch frame registered inside the current invocation resumes
//! execution; otherwise the error is returned to the native caller.

use std::borrow::Cow;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use tracing::debug;
#[cfg(feature = "dump")]
use tracing::trace;

use crate::context::Context;
use crate::error::{Error, ErrorKind, ErrorScope, Result, Span};
use crate::runtime::function::{Bytecode, FuncBody, Instruction, NativeFn};
use crate::runtime::iter::new_range_iter;
use crate::runtime::object::Object;
use crate::runtime::ops::{BinaryOp, UnaryOp, cast};
use crate::value::{HASH_UNSET, ObjRef};
use crate::vm::opcode::OpCode;
use crate::vm::stack::{CatchFrame, Frame};
use crate::vm::var_table::VarTable;

fn stack_underflow() -> Error {
    Error::value_error("the value stack is empty")
}

fn missing_operand(op: OpCode) -> Error {
    Error::value_error(format!("'{}' is missing its operand", op.name()))
}

impl Context {
    /// Run the program entry `main` in the top-level variable table. The
    /// result is owned; on failure the traceback stays available through
    /// [`traceback`](Context::traceback).
    pub fn run_program(&mut self, main: ObjRef) -> Result<ObjRef> {
        self.state.traceback.clear();
        let base = self.state.calls.len();
        if let Err(e) = self.enter_function(main, &[], Span::none(), false) {
            self.state.traceback.raise(e.clone(), ErrorScope::Global);
            return Err(e);
        }
        self.run_until(base)?;
        Ok(self.pop_result())
    }

    /// Call a function from native code. Arguments are borrowed, the
    /// result is owned.
    pub fn call_function(&mut self, func: ObjRef, args: &[ObjRef]) -> Result<ObjRef> {
        let (arity, native) = self.func_signature(func)?;
        if args.len() > arity {
            return Err(Error::wrong_arg_num(arity, args.len()));
        }
        if let Some(native) = native {
            let args = self.pad_args(args, arity);
            return native(self, &args);
        }

        let base = self.state.calls.len();
        self.enter_function(func, args, Span::none(), true)?;
        self.run_until(base)?;
        Ok(self.pop_result())
    }

    /// Continue a bytecode function at `idx` with the given local and global
    /// maps (borrowed). The caller prepares the value stack, including the
    /// call sentinel.
    pub fn run_func_context(
        &mut self,
        func: ObjRef,
        idx: usize,
        vars: ObjRef,
        globals: Option<ObjRef>,
    ) -> Result<ObjRef> {
        let vars = self.heap.inc_ref(vars);
        if let Some(g) = globals {
            self.heap.inc_ref(g);
        }
        let table = VarTable::from_parts(vars, globals);
        self.run_in_table(func, idx, table, Vec::new())
    }

    /// [`run_func_context`](Self::run_func_context) with an owned table and
    /// catch frames to register inside the call
    pub(crate) fn run_in_table(
        &mut self,
        func: ObjRef,
        idx: usize,
        table: VarTable,
        catches: Vec<CatchFrame>,
    ) -> Result<ObjRef> {
        let valid = self.heap.expect_func(func).map(|f| !f.is_native());
        if let Err(e) = valid.and_then(|ok| {
            if ok {
                self.state.calls.check_depth()
            } else {
                Err(Error::type_error("expected a bytecode function"))
            }
        }) {
            table.destroy(&mut self.heap);
            self.state.values.drain_frame(&mut self.heap);
            return Err(e);
        }

        let base = self.state.calls.len();
        let caller_vt = std::mem::replace(&mut self.state.vt, table);
        let frame = Frame {
            func,
            span: Span::none(),
            cwd: self.state.cwd.clone(),
            caller_vt: Some(caller_vt),
            resume: self.state.idx,
            catch_len: self.state.catches.len(),
        };
        self.state.calls.push(&mut self.heap, frame);
        self.state.catches.extend(catches);
        self.state.idx = idx;

        self.run_until(base)?;
        Ok(self.pop_result())
    }

    fn pop_result(&mut self) -> ObjRef {
        match self.state.values.pop() {
            Some(r) => r,
            None => self.heap.null(),
        }
    }

    /// Arity and native body of a function
    fn func_signature(
        &self,
        func: ObjRef,
    ) -> Result<(usize, Option<NativeFn>)> {
        let f = self.heap.expect_func(func)?;
        let native = match f.body {
            FuncBody::Native(native) => Some(native),
            FuncBody::Bytecode(_) => None,
        };
        Ok((f.arity, native))
    }

    /// Borrowed arguments padded with null up to `arity`
    fn pad_args<'a>(&self, args: &'a [ObjRef], arity: usize) -> Cow<'a, [ObjRef]> {
        if args.len() >= arity {
            return Cow::Borrowed(args);
        }
        let mut padded = args.to_vec();
        padded.resize(arity, self.heap.consts().null);
        Cow::Owned(padded)
    }

    /// Push a frame and a fresh variable table for a bytecode function,
    /// bind its parameters and push the call sentinel. With `new_table`
    /// unset the function runs in the current table.
    pub(crate) fn enter_function(
        &mut self,
        func: ObjRef,
        args: &[ObjRef],
        span: Span,
        new_table: bool,
    ) -> Result<()> {
        let (params, globals) = match self.heap.get(func) {
            Some(Object::Func(f)) if !f.is_native() => (f.params.clone(), f.mod_globals),
            _ => return Err(self.heap.type_mismatch(self.heap.types().func, func)),
        };
        if args.len() > params.len() {
            return Err(Error::wrong_arg_num(params.len(), args.len()));
        }
        self.state.calls.check_depth()?;

        let caller_vt = if new_table {
            let globals = globals.unwrap_or_else(|| self.state.vt.effective_globals());
            let table = VarTable::for_call(&mut self.heap, globals)?;
            let null = self.heap.consts().null;
            for (i, &param) in params.iter().enumerate() {
                let value = args.get(i).copied().unwrap_or(null);
                if let Err(e) = table.set(&mut self.heap, param, value) {
                    table.destroy(&mut self.heap);
                    return Err(e);
                }
            }
            Some(std::mem::replace(&mut self.state.vt, table))
        } else {
            None
        };

        let frame = Frame {
            func,
            span,
            cwd: self.state.cwd.clone(),
            caller_vt,
            resume: self.state.idx,
            catch_len: self.state.catches.len(),
        };
        self.state.calls.push(&mut self.heap, frame);
        self.state.values.push_sentinel();
        self.state.idx = 0;
        Ok(())
    }

    /// Pop the top frame and return to its caller
    pub(crate) fn finish_call(&mut self) {
        if let Some(frame) = self.state.calls.pop() {
            self.restore_caller(frame);
        }
    }

    fn restore_caller(&mut self, frame: Frame) {
        self.state.catches.truncate(frame.catch_len);
        if let Some(vt) = frame.caller_vt {
            let callee_vt = std::mem::replace(&mut self.state.vt, vt);
            callee_vt.destroy(&mut self.heap);
        }
        self.state.idx = frame.resume;
        self.state.cwd = frame.cwd;
        self.heap.dec_ref(frame.func);
    }

    fn frame_code(&self) -> Result<Rc<Bytecode>> {
        let func = self
            .state
            .calls
            .top_func()
            .ok_or_else(|| Error::call_error("no function is running"))?;
        match &self.heap.expect_func(func)?.body {
            FuncBody::Bytecode(code) => Ok(Rc::clone(code)),
            FuncBody::Native(_) => Err(Error::type_error("expected a bytecode function")),
        }
    }

    /// Dispatch instructions until the call stack is back to `base` frames
    pub(crate) fn run_until(&mut self, base: usize) -> Result<()> {
        if self.state.calls.len() <= base {
            return Ok(());
        }
        let mut code = self.frame_code()?;
        let mut frame_key = (self.state.calls.len(), self.state.calls.top_func());

        while self.state.calls.len() > base {
            let idx = self.state.idx;
            if idx >= code.len() {
                // Falling off the end returns null
                self.state.values.drain_frame(&mut self.heap);
                let null = self.heap.null();
                self.state.values.push_owned(null);
                self.finish_call();
            } else {
                let inst = &code.instructions[idx];
                self.state.idx = idx + 1;

                #[cfg(feature = "dump")]
                trace!(
                    idx,
                    op = inst.op.name(),
                    depth = self.state.calls.len(),
                    stack = self.state.values.len(),
                    "dispatch"
                );

                let result = if self.interrupt.swap(false, Ordering::Relaxed) {
                    Err(Error::new(ErrorKind::Interrupt, "execution interrupted"))
                } else {
                    self.exec(inst)
                };
                if let Err(e) = result {
                    self.unwind(e, &inst.span, base)?;
                }
            }

            let key = (self.state.calls.len(), self.state.calls.top_func());
            if key != frame_key && key.0 > base {
                code = self.frame_code()?;
            }
            frame_key = key;
        }
        Ok(())
    }

    /// Unwind after a failed instruction. Returns `Ok` when a catch frame of
    /// this invocation takes over, otherwise the error.
    fn unwind(&mut self, err: Error, span: &Span, base: usize) -> Result<()> {
        self.state.traceback.propagate(&err, span);
        let catch = self.state.catches.peek();
        let handled = catch.resume.is_some() && catch.f_len > base;
        let end = if handled { catch.f_len } else { base };

        while self.state.calls.len() > end {
            let Some(frame) = self.state.calls.pop() else {
                break;
            };
            self.state.values.drain_frame(&mut self.heap);
            self.state.traceback.add_position(frame.span.clone());
            self.restore_caller(frame);
        }

        match catch.resume {
            Some(resume) if handled => {
                debug!(error = %err, resume, "error caught");
                self.state.values.truncate(&mut self.heap, catch.v_len);
                self.state.idx = resume;
                Ok(())
            }
            _ => {
                debug!(error = %err, depth = self.state.calls.len(), "error propagated");
                Err(err)
            }
        }
    }

    #[inline]
    fn pop(&mut self) -> Result<ObjRef> {
        // never pop a frame sentinel
        self.peek()?;
        self.state.values.pop().ok_or_else(stack_underflow)
    }

    #[inline]
    fn peek(&self) -> Result<ObjRef> {
        self.state.values.peek().ok_or_else(stack_underflow)
    }

    /// Pop two values; the first one returned was below the second
    fn pop2(&mut self) -> Result<(ObjRef, ObjRef)> {
        let b = self.pop()?;
        match self.pop() {
            Ok(a) => Ok((a, b)),
            Err(e) => {
                self.heap.dec_ref(b);
                Err(e)
            }
        }
    }

    /// Pop `n` values in stack order (deepest first)
    fn pop_n(&mut self, n: usize) -> Result<Vec<ObjRef>> {
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pop() {
                Ok(r) => items.push(r),
                Err(e) => {
                    self.release(items);
                    return Err(e);
                }
            }
        }
        items.reverse();
        Ok(items)
    }

    fn release(&mut self, items: Vec<ObjRef>) {
        for r in items {
            self.heap.dec_ref(r);
        }
    }

    /// Call `func` with borrowed arguments from bytecode. Native results are
    /// pushed right away; bytecode functions push theirs when they return.
    fn call_value(&mut self, func: ObjRef, args: &[ObjRef], span: &Span) -> Result<()> {
        let (arity, native) = self.func_signature(func)?;
        if args.len() > arity {
            return Err(Error::wrong_arg_num(arity, args.len()));
        }
        match native {
            Some(native) => {
                let args = self.pad_args(args, arity);
                let result = native(self, &args)?;
                self.state.values.push_owned(result);
                Ok(())
            }
            None => self.enter_function(func, args, span.clone(), true),
        }
    }

    fn exec(&mut self, inst: &Instruction) -> Result<()> {
        match inst.op {
            OpCode::NoOp => Ok(()),
            OpCode::PopVal => {
                let r = self.pop()?;
                self.heap.dec_ref(r);
                Ok(())
            }
            OpCode::ForStart | OpCode::ForIsDone | OpCode::ForGetVal => self.exec_for(inst),
            OpCode::ReturnVal => {
                let result = self.pop()?;
                self.state.values.drain_frame(&mut self.heap);
                self.state.values.push_owned(result);
                self.finish_call();
                Ok(())
            }
            OpCode::ReturnVars => {
                self.state.values.drain_frame(&mut self.heap);
                let vars = self.state.vt.vars();
                self.state.values.push(&mut self.heap, vars);
                self.finish_call();
                Ok(())
            }
            OpCode::SetValLoc => {
                let name = inst.obj().ok_or_else(|| missing_operand(inst.op))?;
                let value = self.pop()?;
                let result = self.state.vt.set(&mut self.heap, name, value);
                self.heap.dec_ref(value);
                result
            }
            OpCode::SetContVal => self.exec_set_cont(),
            OpCode::SetContLoc => {
                self.exec_set_cont()?;
                let value = self.pop()?;
                self.heap.dec_ref(value);
                Ok(())
            }
            OpCode::Jump => {
                self.state.idx = inst.int() as usize;
                Ok(())
            }
            OpCode::JumpifT | OpCode::JumpifF => {
                let value = self.pop()?;
                let truthy = self.heap.truthy(value);
                self.heap.dec_ref(value);
                if truthy == (inst.op == OpCode::JumpifT) {
                    self.state.idx = inst.int() as usize;
                }
                Ok(())
            }
            OpCode::JumpifZero => {
                let top = self.peek()?;
                if self.heap.expect_int(top)? == 0 {
                    self.state.idx = inst.int() as usize;
                }
                Ok(())
            }
            OpCode::TypeCheck => {
                let expected = inst.obj().ok_or_else(|| missing_operand(inst.op))?;
                let top = self.peek()?;
                if self.heap.type_of(top) != expected {
                    return Err(self.heap.type_mismatch(expected, top));
                }
                Ok(())
            }
            OpCode::HashCheck => {
                let top = self.peek()?;
                if self.heap.hash_obj(top).is_none() {
                    return Err(Error::type_error(format!(
                        "type '{}' is not hashable",
                        self.heap.type_name(top)
                    )));
                }
                Ok(())
            }
            OpCode::ThrowErr => {
                let (name, message) = self.pop2()?;
                let error = match (self.heap.as_str(name), self.heap.as_str(message)) {
                    (Some(n), Some(m)) => Error::custom(n.to_owned(), m.to_owned()),
                    (None, _) => self.heap.type_mismatch(self.heap.types().str, name),
                    (_, None) => self.heap.type_mismatch(self.heap.types().str, message),
                };
                self.heap.dec_ref(name);
                self.heap.dec_ref(message);
                Err(error)
            }
            OpCode::PushCatch => {
                self.state.catches.push(CatchFrame {
                    v_len: self.state.values.len(),
                    f_len: self.state.calls.len(),
                    resume: Some(inst.int() as usize),
                });
                Ok(())
            }
            OpCode::PopCatch => {
                self.state.catches.pop();
                Ok(())
            }
            OpCode::SetVal => {
                let name = inst.obj().ok_or_else(|| missing_operand(inst.op))?;
                let value = self.peek()?;
                self.state.vt.set(&mut self.heap, name, value)
            }
            OpCode::GetVal => {
                let name = inst.obj().ok_or_else(|| missing_operand(inst.op))?;
                let value = self.state.vt.get(&mut self.heap, name)?;
                self.state.values.push(&mut self.heap, value);
                Ok(())
            }
            OpCode::PushVal => {
                let value = inst.obj().ok_or_else(|| missing_operand(inst.op))?;
                self.state.values.push(&mut self.heap, value);
                Ok(())
            }
            OpCode::OpCall => self.exec_call(inst),
            OpCode::OpCast => {
                let (ty, value) = self.pop2()?;
                let result = if matches!(self.heap.get(ty), Some(Object::Type(_))) {
                    cast(self, value, ty)
                } else {
                    Err(self.heap.type_mismatch(self.heap.types().ty, ty))
                };
                self.heap.dec_ref(ty);
                self.heap.dec_ref(value);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::OpRange => self.exec_range(inst),
            OpCode::StackOp => {
                let op = BinaryOp::from_id(inst.int()).ok_or_else(|| missing_operand(inst.op))?;
                let (a, b) = self.pop2()?;
                let result = self.heap.binary_op(op, a, b);
                self.heap.dec_ref(a);
                self.heap.dec_ref(b);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::LocalOp => {
                let op = UnaryOp::from_id(inst.int()).ok_or_else(|| missing_operand(inst.op))?;
                let a = self.pop()?;
                let result = self.heap.unary_op(op, a);
                self.heap.dec_ref(a);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::OpImport => {
                let name = self.pop()?;
                let result = match self.heap.expect_str(name) {
                    Ok(s) => {
                        let s = s.to_owned();
                        self.import(&s)
                    }
                    Err(e) => Err(e),
                };
                self.heap.dec_ref(name);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::OpExtract => {
                let (cont, idx) = self.pop2()?;
                let result = self.extract(cont, idx);
                self.heap.dec_ref(cont);
                self.heap.dec_ref(idx);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::DecInt => {
                let top = self.peek()?;
                let value = self.heap.expect_int(top)?;
                if let Some(Object::Int(i)) = self.heap.get_mut(top) {
                    *i = value.wrapping_sub(1);
                }
                self.heap.header_mut(top).hash = HASH_UNSET;
                Ok(())
            }
            OpCode::NewInt => {
                let top = self.peek()?;
                let value = self.heap.expect_int(top)?;
                let copy = self.heap.new_int(value)?;
                self.state.values.push_owned(copy);
                Ok(())
            }
            OpCode::Dup => self
                .state
                .values
                .dup(&mut self.heap)
                .ok_or_else(stack_underflow),
            OpCode::Rot => self
                .state
                .values
                .rot(inst.int().max(0) as usize)
                .ok_or_else(stack_underflow),
            OpCode::MakeArr | OpCode::MakeVec => {
                let items = self.pop_n(inst.int().max(0) as usize)?;
                let seq = if inst.op == OpCode::MakeArr {
                    self.heap.new_array(items)?
                } else {
                    self.heap.new_vector(items)?
                };
                self.state.values.push_owned(seq);
                Ok(())
            }
            OpCode::MakeArrRep | OpCode::MakeVecRep => {
                let (value, size) = self.pop2()?;
                let result = self.make_rep(inst.op, value, size);
                self.heap.dec_ref(value);
                self.heap.dec_ref(size);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::MakeMap => {
                let items = self.pop_n(inst.int().max(0) as usize)?;
                let result = self.make_map(&items);
                self.release(items);
                self.state.values.push_owned(result?);
                Ok(())
            }
            OpCode::SaveError => {
                let saved = self.save_error()?;
                self.state.values.push_owned(saved);
                Ok(())
            }
            OpCode::UnpackSeq => self.exec_unpack(inst.int()),
        }
    }

    fn exec_for(&mut self, inst: &Instruction) -> Result<()> {
        let iter = self.peek()?;
        let parts = self.heap.iter_parts(iter)?;
        let func = match inst.op {
            OpCode::ForStart => parts.start,
            OpCode::ForIsDone => parts.is_done,
            _ => parts.get_val,
        };
        self.call_value(func, &[parts.value], &inst.span)
    }

    fn exec_call(&mut self, inst: &Instruction) -> Result<()> {
        let func = self.pop()?;
        let n = inst.int();
        let args = if n < 0 {
            let seq = match self.pop() {
                Ok(seq) => seq,
                Err(e) => {
                    self.heap.dec_ref(func);
                    return Err(e);
                }
            };
            let items = match self.heap.seq_items(seq) {
                Ok(items) => items.into_iter().map(|r| self.heap.inc_ref(r)).collect(),
                Err(e) => {
                    self.heap.dec_ref(seq);
                    self.heap.dec_ref(func);
                    return Err(e);
                }
            };
            self.heap.dec_ref(seq);
            items
        } else {
            match self.pop_n(n as usize) {
                Ok(args) => args,
                Err(e) => {
                    self.heap.dec_ref(func);
                    return Err(e);
                }
            }
        };

        let result = self.call_value(func, &args, &inst.span);
        self.release(args);
        self.heap.dec_ref(func);
        result
    }

    fn exec_set_cont(&mut self) -> Result<()> {
        let (cont, idx) = self.pop2()?;
        let result = self.peek().and_then(|value| self.set_cont(cont, idx, value));
        self.heap.dec_ref(cont);
        self.heap.dec_ref(idx);
        result
    }

    fn set_cont(&mut self, cont: ObjRef, idx: ObjRef, value: ObjRef) -> Result<()> {
        match self.heap.get(cont) {
            Some(Object::Seq(_)) => {
                let i = self.heap.expect_int(idx)?;
                self.heap.seq_set(cont, i, value)
            }
            Some(Object::Map(_)) => self.heap.map_set(cont, idx, value),
            _ => Err(Error::type_error(format!(
                "expected type 'Array', 'Vector', or 'Map', got type '{}' instead",
                self.heap.type_name(cont)
            ))),
        }
    }

    fn extract(&mut self, cont: ObjRef, idx: ObjRef) -> Result<ObjRef> {
        match self.heap.get(cont) {
            Some(Object::Seq(_)) => {
                let i = self.heap.expect_int(idx)?;
                let item = self.heap.seq_get(cont, i)?;
                Ok(self.heap.inc_ref(item))
            }
            Some(Object::Map(_)) => match self.heap.map_get(cont, idx)? {
                Some(value) => Ok(self.heap.inc_ref(value)),
                None => Ok(self.heap.null()),
            },
            Some(Object::Str(s)) => {
                let i = self.heap.expect_int(idx)?;
                let len = s.chars().count() as i64;
                let pos = if i < 0 { i + len } else { i };
                let ch = if (0..len).contains(&pos) {
                    s.chars().nth(pos as usize)
                } else {
                    None
                };
                match ch {
                    Some(ch) => self.heap.new_str(ch.to_string()),
                    None => Err(Error::value_error(format!(
                        "index {} out of bounds for 'Str' of size {}",
                        i, len
                    ))),
                }
            }
            _ => Err(Error::type_error(format!(
                "expected type 'Array', 'Vector', 'Map' or 'Str', got type '{}' instead",
                self.heap.type_name(cont)
            ))),
        }
    }

    fn exec_range(&mut self, inst: &Instruction) -> Result<()> {
        let count = if inst.int() == 3 { 3 } else { 2 };
        let mut popped = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pop() {
                Ok(r) => popped.push(r),
                Err(e) => {
                    self.release(popped);
                    return Err(e);
                }
            }
        }
        // popped = [stop, start, step?]
        let ints: Result<Vec<i64>> = popped.iter().map(|&r| self.heap.expect_int(r)).collect();
        self.release(popped);
        let ints = ints?;
        let (stop, start) = (ints[0], ints[1]);
        let step = match ints.get(2) {
            Some(&step) => step,
            None if start <= stop => 1,
            None => -1,
        };
        let iter = new_range_iter(self, start, stop, step)?;
        self.state.values.push_owned(iter);
        Ok(())
    }

    fn make_rep(&mut self, op: OpCode, value: ObjRef, size: ObjRef) -> Result<ObjRef> {
        let size = self.heap.expect_int(size)?;
        if size < 0 {
            return Err(Error::value_error(
                "the length of the sequence cannot be negative",
            ));
        }
        if op == OpCode::MakeArrRep {
            self.heap.new_array_filled(size as usize, value)
        } else {
            self.heap.new_vector_filled(size as usize, value)
        }
    }

    fn make_map(&mut self, items: &[ObjRef]) -> Result<ObjRef> {
        let map = self.heap.new_map()?;
        for pair in items.chunks_exact(2) {
            if let Err(e) = self.heap.map_set(map, pair[0], pair[1]) {
                self.heap.dec_ref(map);
                return Err(e);
            }
        }
        Ok(map)
    }

    /// The pending error as `{'name': .., 'message': ..}`
    fn save_error(&mut self) -> Result<ObjRef> {
        let Some(error) = self.state.traceback.take() else {
            return Ok(self.heap.null());
        };
        let map = self.heap.new_map()?;
        for (key, text) in [("name", error.name), ("message", error.message)] {
            let value = match self.heap.new_str(text.into_owned()) {
                Ok(v) => v,
                Err(e) => {
                    self.heap.dec_ref(map);
                    return Err(e);
                }
            };
            let result = self.heap.map_set_str(map, key, value);
            self.heap.dec_ref(value);
            if let Err(e) = result {
                self.heap.dec_ref(map);
                return Err(e);
            }
        }
        Ok(map)
    }

    fn exec_unpack(&mut self, expected: i64) -> Result<()> {
        let seq = self.pop()?;
        let items = self.heap.seq_items(seq);
        self.heap.dec_ref(seq);
        let items = items?;
        if items.len() as i64 != expected {
            return Err(Error::value_error(format!(
                "expected {} items to unpack but the sequence only contains {}",
                expected,
                items.len()
            )));
        }
        for &item in items.iter().rev() {
            self.state.values.push(&mut self.heap, item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::asm::{assemble, assemble_all};
    use crate::config::Config;
    use crate::context::Context;
    use crate::error::{ErrorKind, Span};

    fn function(ctx: &mut Context, src: &str, name: &str) -> crate::ObjRef {
        let funcs = assemble_all(ctx, src, "test.nsa").unwrap();
        let mut found = None;
        for (n, f) in funcs {
            if n == name {
                found = Some(f);
            } else {
                ctx.heap_mut().dec_ref(f);
            }
        }
        found.unwrap()
    }

    fn run(src: &str) -> (Context, crate::Result<crate::ObjRef>) {
        let mut ctx = Context::new(Config::default()).unwrap();
        let main = assemble(&mut ctx, src, "test.nsa").unwrap();
        let result = ctx.run_program(main);
        ctx.heap_mut().dec_ref(main);
        (ctx, result)
    }

    fn run_int(src: &str) -> i64 {
        let (ctx, result) = run(src);
        let r = result.unwrap();
        ctx.heap().as_int(r).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let src = "
func main()
    PUSH_VAL 6
    PUSH_VAL 7
    STACK_OP *
    RETURN_VAL
end
";
        assert_eq!(run_int(src), 42);
    }

    #[test]
    fn test_call_leaves_one_value() {
        let src = "
func add(a, b)
    GET_VAL a
    GET_VAL b
    STACK_OP +
    RETURN_VAL
end

func main()
    PUSH_VAL 1
    PUSH_VAL 2
    PUSH_VAL &add
    OP_CALL 2
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let main = assemble(&mut ctx, src, "test.nsa").unwrap();
        let before = ctx.value_stack_len();
        let result = ctx.run_program(main).unwrap();
        assert_eq!(ctx.value_stack_len(), before);
        assert_eq!(ctx.heap().as_int(result), Some(3));
        assert_eq!(ctx.call_depth(), 0);
    }

    #[test]
    fn test_value_stack_grows_by_one_per_call() {
        let src = "
func five()
    PUSH_VAL 1
    PUSH_VAL 2
    POP_VAL
    PUSH_VAL 5
    RETURN_VAL
end

func main()
    PUSH_VAL null
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let five = function(&mut ctx, src, "five");

        let before = ctx.value_stack_len();
        ctx.enter_function(five, &[], Span::none(), true).unwrap();
        ctx.run_until(0).unwrap();
        assert_eq!(ctx.value_stack_len(), before + 1);
        let top = ctx.state.values.pop().unwrap();
        assert_eq!(ctx.heap().as_int(top), Some(5));
        ctx.heap_mut().dec_ref(top);
        ctx.heap_mut().dec_ref(five);
    }

    #[test]
    fn test_too_many_arguments() {
        let src = "
func one(a)
    GET_VAL a
    RETURN_VAL
end

func main()
    PUSH_VAL 1
    PUSH_VAL 2
    PUSH_VAL &one
    OP_CALL 2
    RETURN_VAL
end
";
        let (ctx, result) = run(src);
        let err = result.unwrap_err();
        assert!(err.is(ErrorKind::Call));
        assert_eq!(
            err.message,
            "the function expected at most 1 argument but 2 were passed"
        );
        assert_eq!(ctx.call_depth(), 0);
        assert_eq!(ctx.value_stack_len(), 0);
    }

    #[test]
    fn test_missing_args_are_null() {
        let src = "
func f(a, b)
    GET_VAL b
    RETURN_VAL
end

func main()
    PUSH_VAL 1
    PUSH_VAL &f
    OP_CALL 1
    RETURN_VAL
end
";
        let (ctx, result) = run(src);
        assert!(ctx.heap().is_null(result.unwrap()));
    }

    #[test]
    fn test_catch_and_save_error() {
        let src = "
func fail()
    PUSH_VAL 1
    PUSH_VAL 0
    STACK_OP /
    RETURN_VAL
end

func main()
    PUSH_VAL 99
    PUSH_CATCH @handler
    PUSH_VAL &fail
    OP_CALL 0
    POP_CATCH
    RETURN_VAL
handler:
    POP_CATCH
    SAVE_ERROR
    PUSH_VAL \"message\"
    OP_EXTRACT
    RETURN_VAL
end
";
        let (ctx, result) = run(src);
        let r = result.unwrap();
        assert_eq!(ctx.heap().as_str(r), Some("division by zero"));
        assert!(!ctx.traceback().occurred());
        assert_eq!(ctx.call_depth(), 0);
        assert_eq!(ctx.value_stack_len(), 0);
    }

    #[test]
    fn test_uncaught_error_traceback() {
        let src = "
func inner()
    PUSH_VAL 1
    PUSH_VAL 0
    STACK_OP %
    RETURN_VAL
end

func main()
    PUSH_VAL &inner
    OP_CALL 0
    RETURN_VAL
end
";
        let (ctx, result) = run(src);
        let err = result.unwrap_err();
        assert!(err.is(ErrorKind::Math));
        let positions: Vec<_> = ctx
            .traceback()
            .positions()
            .iter()
            .filter(|span| span.source.is_some())
            .collect();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].start.line, 4);
        assert_eq!(positions[1].start.line, 10);
        let text = ctx.traceback().render(false);
        assert!(text.ends_with("Math Error - modulo by zero\n"));
    }

    #[test]
    fn test_throw_custom_error() {
        let src = "
func main()
    PUSH_VAL \"Custom\"
    PUSH_VAL \"went wrong\"
    THROW_ERR
end
";
        let (_, result) = run(src);
        let err = result.unwrap_err();
        assert_eq!(err.name, "Custom");
        assert_eq!(err.message, "went wrong");
    }

    #[test]
    fn test_loop_with_range() {
        // sum of 0..5
        let src = "
func main()
    PUSH_VAL 0
    SET_VAL_LOC total
    PUSH_VAL 0
    PUSH_VAL 5
    OP_RANGE 2
    FOR_START
    POP_VAL
loop:
    FOR_IS_DONE
    JUMPIF_T @done
    FOR_GET_VAL
    GET_VAL total
    STACK_OP +
    SET_VAL_LOC total
    JUMP @loop
done:
    POP_VAL
    GET_VAL total
    RETURN_VAL
end
";
        assert_eq!(run_int(src), 10);
    }

    #[test]
    fn test_recursion_limit() {
        let src = "
func down()
    PUSH_VAL &down
    OP_CALL 0
    RETURN_VAL
end

func main()
    PUSH_VAL &down
    OP_CALL 0
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default().with_max_recursion(50)).unwrap();
        let main = assemble(&mut ctx, src, "test.nsa").unwrap();
        let err = ctx.run_program(main).unwrap_err();
        assert_eq!(
            err.message,
            "the maximum call stack size (50 calls) was exceeded"
        );
        assert_eq!(ctx.call_depth(), 0);
        assert_eq!(ctx.value_stack_len(), 0);
        let text = ctx.traceback().render(false);
        assert!(text.contains("-- Previous position repeated"));
    }

    #[test]
    fn test_containers() {
        let src = "
func main()
    PUSH_VAL \"a\"
    PUSH_VAL 1
    PUSH_VAL \"b\"
    PUSH_VAL 2
    MAKE_MAP 4
    SET_VAL_LOC m
    PUSH_VAL 10
    GET_VAL m
    PUSH_VAL \"c\"
    SET_CONT_LOC
    PUSH_VAL 7
    PUSH_VAL 8
    PUSH_VAL 9
    MAKE_VEC 3
    UNPACK_SEQ 3
    STACK_OP -
    GET_VAL m
    PUSH_VAL \"c\"
    OP_EXTRACT
    STACK_OP +
    RETURN_VAL
end
";
        // unpacking leaves 7 on top of 8, then 8 - 7 + 10
        assert_eq!(run_int(src), 11);
    }

    #[test]
    fn test_interrupt() {
        let src = "
func main()
loop:
    JUMP @loop
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let main = assemble(&mut ctx, src, "test.nsa").unwrap();
        ctx.interrupt_handle()
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let err = ctx.run_program(main).unwrap_err();
        assert!(err.is(ErrorKind::Interrupt));
    }

    #[test]
    fn test_divmod_results_are_recycled() {
        // floored divmod by repeated subtraction
        let src = "
func divmod(x, y)
    PUSH_VAL 0
    SET_VAL_LOC q
    GET_VAL x
    SET_VAL_LOC r
neg:
    GET_VAL r
    PUSH_VAL 0
    STACK_OP <
    JUMPIF_F @pos
    GET_VAL r
    GET_VAL y
    STACK_OP +
    SET_VAL_LOC r
    GET_VAL q
    PUSH_VAL 1
    STACK_OP -
    SET_VAL_LOC q
    JUMP @neg
pos:
    GET_VAL r
    GET_VAL y
    STACK_OP >=
    JUMPIF_F @done
    GET_VAL r
    GET_VAL y
    STACK_OP -
    SET_VAL_LOC r
    GET_VAL q
    PUSH_VAL 1
    STACK_OP +
    SET_VAL_LOC q
    JUMP @pos
done:
    GET_VAL q
    GET_VAL r
    MAKE_ARR 2
    RETURN_VAL
end

func main()
    PUSH_VAL -7
    PUSH_VAL 3
    PUSH_VAL &divmod
    OP_CALL 2
    RETURN_VAL
end
";
        let mut ctx = Context::new(Config::default()).unwrap();
        let main = assemble(&mut ctx, src, "test.nsa").unwrap();
        let int = ctx.heap().types().int;
        let live = ctx.heap_stats().live;

        let r = ctx.run_program(main).unwrap();
        let items = ctx.heap().seq_items(r).unwrap();
        assert_eq!(ctx.heap().as_int(items[0]), Some(-3));
        assert_eq!(ctx.heap().as_int(items[1]), Some(2));

        ctx.heap_mut().dec_ref(r);
        assert_eq!(ctx.heap_stats().live, live);
        assert!(ctx.heap().pool_len(int) >= 2);

        let recycled = ctx.heap_stats().recycled;
        let r = ctx.run_program(main).unwrap();
        assert!(ctx.heap_stats().recycled > recycled);
        ctx.heap_mut().dec_ref(r);
        ctx.heap_mut().dec_ref(main);
    }

    #[test]
    fn test_underflow_keeps_caller_values() {
        // both callees fail on a short frame; main's 5 must survive the catch
        for body in ["SET_CONT_LOC", "PUSH_VAL 1\n    ROT 3"] {
            let src = format!(
                "
func bad()
    {}
    PUSH_VAL null
    RETURN_VAL
end

func main()
    PUSH_VAL 5
    PUSH_CATCH @handler
    PUSH_VAL &bad
    OP_CALL 0
    POP_VAL
    POP_CATCH
handler:
    POP_CATCH
    SAVE_ERROR
    PUSH_VAL \"message\"
    OP_EXTRACT
    SET_VAL_LOC msg
    RETURN_VAL
end
",
                body
            );
            let (ctx, result) = run(&src);
            let r = result.unwrap();
            assert_eq!(ctx.heap().as_int(r), Some(5));
            let msg = ctx.get_global("msg").unwrap();
            assert_eq!(ctx.heap().as_str(msg), Some("the value stack is empty"));
            assert_eq!(ctx.value_stack_len(), 0);
            assert_eq!(ctx.call_depth(), 0);
        }
    }
}
