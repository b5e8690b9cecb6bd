//! Operators and casts
//!
//! `STACK_OP` applies a [`BinaryOp`] to the two topmost values, `LOCAL_OP` a
//! [`UnaryOp`] to the top value and `OP_CAST` converts a value to a type.
//! Every operation borrows its operands and returns an owned result.

use std::cmp::Ordering;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::iter::{new_map_iter, new_seq_iter, new_str_iter};
use crate::runtime::object::Object;
use crate::runtime::sequence::SeqKind;
use crate::value::ObjRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Concat,
    And,
    Or,
    Xor,
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 21] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Pow,
        BinaryOp::Mod,
        BinaryOp::BitAnd,
        BinaryOp::BitOr,
        BinaryOp::BitXor,
        BinaryOp::Shl,
        BinaryOp::Shr,
        BinaryOp::Concat,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Gt,
        BinaryOp::Lt,
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Ge,
        BinaryOp::Le,
    ];

    pub const fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Concat => "><",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Xor => "&|",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.symbol() == s)
    }

    /// Operand encoding in an instruction
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id).ok().and_then(|i| Self::ALL.get(i).copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Len,
    Neg,
    BitNot,
    Not,
    TypeOf,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 5] = [
        UnaryOp::Len,
        UnaryOp::Neg,
        UnaryOp::BitNot,
        UnaryOp::Not,
        UnaryOp::TypeOf,
    ];

    /// Name used in listings
    pub const fn name(self) -> &'static str {
        match self {
            UnaryOp::Len => "len",
            UnaryOp::Neg => "neg",
            UnaryOp::BitNot => "bwnot",
            UnaryOp::Not => "not",
            UnaryOp::TypeOf => "typeof",
        }
    }

    /// Operator as written in Nest source
    pub const fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Len => "$",
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
            UnaryOp::Not => "!",
            UnaryOp::TypeOf => "?::",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == s)
    }

    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id).ok().and_then(|i| Self::ALL.get(i).copied())
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Real(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Real(f) => f,
        }
    }
}

impl Heap {
    fn num(&self, r: ObjRef) -> Option<Num> {
        match self.get(r) {
            Some(Object::Int(i)) => Some(Num::Int(*i)),
            Some(Object::Real(f)) => Some(Num::Real(*f)),
            _ => None,
        }
    }

    fn binary_type_error(&self, op: BinaryOp, a: ObjRef, b: ObjRef) -> Error {
        Error::type_error(format!(
            "invalid types '{}' and '{}' for '{}'",
            self.type_name(a),
            self.type_name(b),
            op.symbol()
        ))
    }

    fn compare(&self, op: BinaryOp, a: ObjRef, b: ObjRef) -> Result<Ordering> {
        if let (Some(x), Some(y)) = (self.num(a), self.num(b)) {
            let ord = match (x, y) {
                (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
                (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
            };
            // comparisons with NaN are always false
            return ord.ok_or_else(|| Error::math_error("cannot compare NaN"));
        }
        match (self.as_str(a), self.as_str(b)) {
            (Some(x), Some(y)) => Ok(x.cmp(y)),
            _ => Err(self.binary_type_error(op, a, b)),
        }
    }

    /// Apply a binary operator
    pub fn binary_op(&mut self, op: BinaryOp, a: ObjRef, b: ObjRef) -> Result<ObjRef> {
        match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Pow
            | BinaryOp::Mod => self.arith(op, a, b),
            BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::Shl
            | BinaryOp::Shr => {
                let (Some(x), Some(y)) = (self.as_int(a), self.as_int(b)) else {
                    return Err(self.binary_type_error(op, a, b));
                };
                let value = match op {
                    BinaryOp::BitAnd => x & y,
                    BinaryOp::BitOr => x | y,
                    BinaryOp::BitXor => x ^ y,
                    BinaryOp::Shl => x.wrapping_shl(y as u32),
                    _ => x.wrapping_shr(y as u32),
                };
                self.new_int(value)
            }
            BinaryOp::Concat => {
                let mut s = self.display(a);
                s.push_str(&self.display(b));
                self.new_str(s)
            }
            BinaryOp::And => {
                let pick = if self.truthy(a) { b } else { a };
                Ok(self.inc_ref(pick))
            }
            BinaryOp::Or => {
                let pick = if self.truthy(a) { a } else { b };
                Ok(self.inc_ref(pick))
            }
            BinaryOp::Xor => {
                let value = self.truthy(a) != self.truthy(b);
                Ok(self.bool_obj(value))
            }
            BinaryOp::Eq => {
                let value = self.obj_eq(a, b);
                Ok(self.bool_obj(value))
            }
            BinaryOp::Ne => {
                let value = !self.obj_eq(a, b);
                Ok(self.bool_obj(value))
            }
            BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le => {
                let value = match self.compare(op, a, b) {
                    Ok(ord) => match op {
                        BinaryOp::Gt => ord == Ordering::Greater,
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::Ge => ord != Ordering::Less,
                        _ => ord != Ordering::Greater,
                    },
                    Err(e) if e.is(crate::ErrorKind::Math) => false,
                    Err(e) => return Err(e),
                };
                Ok(self.bool_obj(value))
            }
        }
    }

    fn arith(&mut self, op: BinaryOp, a: ObjRef, b: ObjRef) -> Result<ObjRef> {
        if op == BinaryOp::Add && matches!(self.get(a), Some(Object::Seq(s)) if s.kind == SeqKind::Vector) {
            self.vector_push(a, b)?;
            return Ok(self.inc_ref(a));
        }
        let (Some(x), Some(y)) = (self.num(a), self.num(b)) else {
            return Err(self.binary_type_error(op, a, b));
        };
        match (x, y) {
            (Num::Int(x), Num::Int(y)) => {
                let value = match op {
                    BinaryOp::Add => x.wrapping_add(y),
                    BinaryOp::Sub => x.wrapping_sub(y),
                    BinaryOp::Mul => x.wrapping_mul(y),
                    BinaryOp::Div => {
                        if y == 0 {
                            return Err(Error::math_error("division by zero"));
                        }
                        x.wrapping_div(y)
                    }
                    BinaryOp::Mod => {
                        if y == 0 {
                            return Err(Error::math_error("modulo by zero"));
                        }
                        x.wrapping_rem(y)
                    }
                    _ => int_pow(x, y),
                };
                self.new_int(value)
            }
            (x, y) => {
                let (x, y) = (x.as_f64(), y.as_f64());
                let value = match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                    BinaryOp::Div => {
                        if y == 0.0 {
                            return Err(Error::math_error("division by zero"));
                        }
                        x / y
                    }
                    BinaryOp::Mod => {
                        if y == 0.0 {
                            return Err(Error::math_error("modulo by zero"));
                        }
                        x % y
                    }
                    _ => {
                        if x < 0.0 && y.floor() != y {
                            return Err(Error::math_error("fractional power of a negative number"));
                        }
                        x.powf(y)
                    }
                };
                self.new_real(value)
            }
        }
    }

    fn unary_type_error(&self, op: UnaryOp, a: ObjRef) -> Error {
        Error::type_error(format!(
            "invalid type '{}' for '{}'",
            self.type_name(a),
            op.symbol()
        ))
    }

    /// Apply a unary operator
    pub fn unary_op(&mut self, op: UnaryOp, a: ObjRef) -> Result<ObjRef> {
        match op {
            UnaryOp::Len => {
                let len = match self.get(a) {
                    Some(Object::Str(s)) => s.chars().count(),
                    Some(Object::Seq(s)) => s.len(),
                    Some(Object::Map(m)) => m.len(),
                    Some(Object::Func(f)) => f.arity,
                    _ => return Err(self.unary_type_error(op, a)),
                };
                self.new_int(len as i64)
            }
            UnaryOp::Neg => match self.num(a) {
                Some(Num::Int(i)) => self.new_int(i.wrapping_neg()),
                Some(Num::Real(f)) => self.new_real(-f),
                None => Err(self.unary_type_error(op, a)),
            },
            UnaryOp::BitNot => match self.as_int(a) {
                Some(i) => self.new_int(!i),
                None => Err(self.unary_type_error(op, a)),
            },
            UnaryOp::Not => {
                let value = !self.truthy(a);
                Ok(self.bool_obj(value))
            }
            UnaryOp::TypeOf => {
                let ty = self.type_of(a);
                Ok(self.inc_ref(ty))
            }
        }
    }
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return 0;
    }
    let mut result: i64 = 1;
    let mut base = base;
    let mut exp = exp as u64;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}

fn cast_error(heap: &Heap, obj: ObjRef, ty: ObjRef) -> Error {
    Error::type_error(format!(
        "cannot cast an object of type '{}' to '{}'",
        heap.type_name(obj),
        heap.type_obj_name(ty)
    ))
}

fn real_to_int(f: f64) -> Result<i64> {
    if f.is_nan() {
        Err(Error::value_error("cannot cast a NaN to an Int"))
    } else if f.is_infinite() {
        Err(Error::value_error("cannot cast an infinity to an Int"))
    } else {
        Ok(f as i64)
    }
}

/// Convert `obj` to the type `ty`; the result is owned
pub fn cast(ctx: &mut Context, obj: ObjRef, ty: ObjRef) -> Result<ObjRef> {
    let heap = &mut ctx.heap;
    if heap.type_of(obj) == ty {
        return Ok(heap.inc_ref(obj));
    }
    let types = heap.types().clone();

    if ty == types.str {
        let s = heap.display(obj);
        return heap.new_str(s);
    }
    if ty == types.bool {
        let value = heap.truthy(obj);
        return Ok(heap.bool_obj(value));
    }
    if ty == types.int {
        let value = match heap.get(obj) {
            Some(Object::Real(f)) => real_to_int(*f)?,
            Some(Object::Bool(b)) => *b as i64,
            Some(Object::Str(s)) => s
                .trim()
                .replace('_', "")
                .parse::<i64>()
                .map_err(|_| Error::value_error(format!("'{}' is not a valid Int literal", s)))?,
            _ => return Err(cast_error(heap, obj, ty)),
        };
        return heap.new_int(value);
    }
    if ty == types.real {
        let value = match heap.get(obj) {
            Some(Object::Int(i)) => *i as f64,
            Some(Object::Bool(b)) => *b as i64 as f64,
            Some(Object::Str(s)) => s
                .trim()
                .replace('_', "")
                .parse::<f64>()
                .map_err(|_| Error::value_error(format!("'{}' is not a valid Real literal", s)))?,
            _ => return Err(cast_error(heap, obj, ty)),
        };
        return heap.new_real(value);
    }
    if ty == types.array || ty == types.vector {
        let items = collect_items(ctx, obj, ty)?;
        let heap = &mut ctx.heap;
        return if ty == types.array {
            heap.new_array(items)
        } else {
            heap.new_vector(items)
        };
    }
    if ty == types.iter {
        let is_seq = matches!(heap.get(obj), Some(Object::Seq(_)));
        let is_str = matches!(heap.get(obj), Some(Object::Str(_)));
        let is_map = matches!(heap.get(obj), Some(Object::Map(_)));
        return if is_seq {
            new_seq_iter(ctx, obj)
        } else if is_str {
            new_str_iter(ctx, obj)
        } else if is_map {
            new_map_iter(ctx, obj)
        } else {
            Err(cast_error(&ctx.heap, obj, ty))
        };
    }
    Err(cast_error(heap, obj, ty))
}

/// Owned items of a sequence-like object
fn collect_items(ctx: &mut Context, obj: ObjRef, ty: ObjRef) -> Result<Vec<ObjRef>> {
    let source = match ctx.heap.get(obj) {
        Some(Object::Seq(s)) => Some(s.items.clone()),
        Some(Object::Str(s)) => {
            let chars: Vec<String> = s.chars().map(String::from).collect();
            let mut items = Vec::with_capacity(chars.len());
            for ch in chars {
                match ctx.heap.new_str(ch) {
                    Ok(r) => items.push(r),
                    Err(e) => {
                        for r in items {
                            ctx.heap.dec_ref(r);
                        }
                        return Err(e);
                    }
                }
            }
            return Ok(items);
        }
        Some(Object::Map(_)) => None,
        Some(Object::Iter(_)) => return drain_iter(ctx, obj),
        _ => return Err(cast_error(&ctx.heap, obj, ty)),
    };
    match source {
        Some(items) => Ok(items.into_iter().map(|r| ctx.heap.inc_ref(r)).collect()),
        None => {
            let iter = new_map_iter(ctx, obj)?;
            let result = drain_iter(ctx, iter);
            ctx.heap.dec_ref(iter);
            result
        }
    }
}

/// Run an iterator to exhaustion, collecting owned items
fn drain_iter(ctx: &mut Context, iter: ObjRef) -> Result<Vec<ObjRef>> {
    let parts = ctx.heap.iter_parts(iter)?;
    let mut items = Vec::new();
    let result = (|| -> Result<()> {
        let r = ctx.call_function(parts.start, &[parts.value])?;
        ctx.heap.dec_ref(r);
        loop {
            let done = ctx.call_function(parts.is_done, &[parts.value])?;
            let finished = ctx.heap.truthy(done);
            ctx.heap.dec_ref(done);
            if finished {
                return Ok(());
            }
            items.push(ctx.call_function(parts.get_val, &[parts.value])?);
        }
    })();
    match result {
        Ok(()) => Ok(items),
        Err(e) => {
            for r in items {
                ctx.heap.dec_ref(r);
            }
            Err(e)
        }
    }
}
