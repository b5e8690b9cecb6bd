//! Object payloads and scalar helpers
//!
//! An [`Object`] is the payload stored in a heap slot. Scalars carry their
//! value inline; containers own references to other objects and implement
//! [`Trace`] so that the heap can release them and the collector can walk
//! them.

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::function::FuncObj;
use crate::runtime::iter::IterObj;
use crate::runtime::map::MapObj;
use crate::runtime::sequence::{SeqKind, SeqObj};
use crate::value::{HASH_UNSET, ObjRef};
use crate::vm::coroutine::CoroutineObj;

/// Called on an instance right before its references are released
pub type Destructor = fn(&mut Heap, ObjRef);

/// Payload of a heap slot
#[derive(Debug)]
pub enum Object {
    Type(TypeObj),
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Seq(SeqObj),
    Map(MapObj),
    Func(FuncObj),
    Iter(IterObj),
    Coroutine(CoroutineObj),
}

/// Enumerate the references an object owns
pub trait Trace {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef));
}

impl Trace for Object {
    fn trace(&self, visit: &mut dyn FnMut(ObjRef)) {
        match self {
            Object::Seq(seq) => seq.trace(visit),
            Object::Map(map) => map.trace(visit),
            Object::Func(func) => func.trace(visit),
            Object::Iter(iter) => iter.trace(visit),
            Object::Coroutine(co) => co.trace(visit),
            Object::Type(_)
            | Object::Null
            | Object::Bool(_)
            | Object::Int(_)
            | Object::Real(_)
            | Object::Str(_) => {}
        }
    }
}

/// A type object
#[derive(Debug)]
pub struct TypeObj {
    pub name: String,
    /// Instances can reference other objects and are tracked by the collector
    pub container: bool,
    pub destructor: Option<Destructor>,
    /// Recycled instance slots
    pub(crate) pool: Vec<u32>,
}

impl TypeObj {
    pub fn new(name: &str, container: bool, destructor: Option<Destructor>) -> Self {
        TypeObj {
            name: name.to_owned(),
            container,
            destructor,
            pool: Vec::new(),
        }
    }
}

/// Builtin type objects
#[derive(Debug, Clone)]
pub struct Types {
    pub ty: ObjRef,
    pub null: ObjRef,
    pub bool: ObjRef,
    pub int: ObjRef,
    pub real: ObjRef,
    pub str: ObjRef,
    pub array: ObjRef,
    pub vector: ObjRef,
    pub map: ObjRef,
    pub func: ObjRef,
    pub iter: ObjRef,
    pub coroutine: ObjRef,
}

impl Types {
    pub(crate) fn bootstrap(placeholder: ObjRef) -> Self {
        Types {
            ty: placeholder,
            null: placeholder,
            bool: placeholder,
            int: placeholder,
            real: placeholder,
            str: placeholder,
            array: placeholder,
            vector: placeholder,
            map: placeholder,
            func: placeholder,
            iter: placeholder,
            coroutine: placeholder,
        }
    }

    /// Builtin types with the names they are bound to
    pub fn named(&self) -> [(&'static str, ObjRef); 12] {
        [
            ("Type", self.ty),
            ("Null", self.null),
            ("Bool", self.bool),
            ("Int", self.int),
            ("Real", self.real),
            ("Str", self.str),
            ("Array", self.array),
            ("Vector", self.vector),
            ("Map", self.map),
            ("Func", self.func),
            ("Iter", self.iter),
            ("Coroutine", self.coroutine),
        ]
    }

    pub fn by_name(&self, name: &str) -> Option<ObjRef> {
        self.named()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, r)| r)
    }
}

/// Shared constant objects
#[derive(Debug, Clone)]
pub struct Consts {
    pub null: ObjRef,
    pub bool_true: ObjRef,
    pub bool_false: ObjRef,
}

impl Consts {
    pub(crate) fn bootstrap(placeholder: ObjRef) -> Self {
        Consts {
            null: placeholder,
            bool_true: placeholder,
            bool_false: placeholder,
        }
    }
}

fn fx_hash(bytes: &[u8]) -> i64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    hasher.finish() as i64
}

/// Hash of a `Str` with the given content
pub(crate) fn str_hash(s: &str) -> i64 {
    match fx_hash(s.as_bytes()) {
        HASH_UNSET => -2,
        h => h,
    }
}

impl Heap {
    /// Owned reference to `null`
    #[inline]
    pub fn null(&mut self) -> ObjRef {
        let null = self.consts().null;
        self.inc_ref(null)
    }

    /// Owned reference to `true` or `false`
    #[inline]
    pub fn bool_obj(&mut self, value: bool) -> ObjRef {
        let r = if value {
            self.consts().bool_true
        } else {
            self.consts().bool_false
        };
        self.inc_ref(r)
    }

    pub fn new_int(&mut self, value: i64) -> Result<ObjRef> {
        let ty = self.types().int;
        self.alloc(ty, Object::Int(value))
    }

    pub fn new_real(&mut self, value: f64) -> Result<ObjRef> {
        let ty = self.types().real;
        self.alloc(ty, Object::Real(value))
    }

    pub fn new_str(&mut self, value: impl Into<String>) -> Result<ObjRef> {
        let ty = self.types().str;
        self.alloc(ty, Object::Str(value.into()))
    }

    pub fn as_int(&self, r: ObjRef) -> Option<i64> {
        match self.get(r) {
            Some(Object::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self, r: ObjRef) -> Option<f64> {
        match self.get(r) {
            Some(Object::Real(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            Some(Object::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self, r: ObjRef) -> Option<bool> {
        match self.get(r) {
            Some(Object::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self, r: ObjRef) -> bool {
        matches!(self.get(r), Some(Object::Null))
    }

    /// Name of the type of `r`
    pub fn type_name(&self, r: ObjRef) -> &str {
        self.type_obj(self.type_of(r))
            .map_or("?", |t| t.name.as_str())
    }

    /// Name of a type object itself
    pub fn type_obj_name(&self, ty: ObjRef) -> &str {
        self.type_obj(ty).map_or("?", |t| t.name.as_str())
    }

    pub(crate) fn type_mismatch(&self, expected: ObjRef, got: ObjRef) -> Error {
        Error::type_error(format!(
            "expected type '{}', got type '{}' instead",
            self.type_obj_name(expected),
            self.type_name(got)
        ))
    }

    pub fn expect_int(&self, r: ObjRef) -> Result<i64> {
        self.as_int(r)
            .ok_or_else(|| self.type_mismatch(self.types().int, r))
    }

    pub fn expect_str(&self, r: ObjRef) -> Result<&str> {
        match self.get(r) {
            Some(Object::Str(s)) => Ok(s),
            _ => Err(self.type_mismatch(self.types().str, r)),
        }
    }

    pub fn expect_map(&self, r: ObjRef) -> Result<&MapObj> {
        match self.get(r) {
            Some(Object::Map(m)) => Ok(m),
            _ => Err(self.type_mismatch(self.types().map, r)),
        }
    }

    pub fn expect_func(&self, r: ObjRef) -> Result<&FuncObj> {
        match self.get(r) {
            Some(Object::Func(f)) => Ok(f),
            _ => Err(self.type_mismatch(self.types().func, r)),
        }
    }

    pub fn expect_seq(&self, r: ObjRef) -> Result<&SeqObj> {
        match self.get(r) {
            Some(Object::Seq(s)) => Ok(s),
            _ => Err(Error::type_error(format!(
                "expected type 'Array' or 'Vector', got type '{}' instead",
                self.type_name(r)
            ))),
        }
    }

    /// Hash of a hashable object, cached in the header
    ///
    /// Containers are unhashable and return `None`. Numbers that compare
    /// equal hash equal.
    pub fn hash_obj(&mut self, r: ObjRef) -> Option<i64> {
        let cached = self.header(r).hash;
        if cached != HASH_UNSET {
            return Some(cached);
        }
        let hash = match self.get(r)? {
            Object::Int(i) => *i,
            Object::Real(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    *f as i64
                } else {
                    fx_hash(&f.to_bits().to_le_bytes())
                }
            }
            Object::Bool(b) => *b as i64,
            Object::Str(s) => str_hash(s),
            Object::Null | Object::Type(_) => r.index() as i64,
            Object::Seq(_) | Object::Map(_) | Object::Func(_) | Object::Iter(_) => return None,
            Object::Coroutine(_) => return None,
        };
        let hash = if hash == HASH_UNSET { -2 } else { hash };
        self.header_mut(r).hash = hash;
        Some(hash)
    }

    /// Value equality: numbers across types, strings by content, the rest
    /// by identity
    pub fn obj_eq(&self, a: ObjRef, b: ObjRef) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Some(Object::Int(x)), Some(Object::Int(y))) => x == y,
            (Some(Object::Int(x)), Some(Object::Real(y))) => (*x as f64) == *y,
            (Some(Object::Real(x)), Some(Object::Int(y))) => *x == (*y as f64),
            (Some(Object::Real(x)), Some(Object::Real(y))) => x == y,
            (Some(Object::Str(x)), Some(Object::Str(y))) => x == y,
            (Some(Object::Bool(x)), Some(Object::Bool(y))) => x == y,
            (Some(Object::Null), Some(Object::Null)) => true,
            _ => false,
        }
    }

    pub fn truthy(&self, r: ObjRef) -> bool {
        match self.get(r) {
            Some(Object::Null) | None => false,
            Some(Object::Bool(b)) => *b,
            Some(Object::Int(i)) => *i != 0,
            Some(Object::Real(f)) => *f != 0.0,
            Some(Object::Str(s)) => !s.is_empty(),
            Some(Object::Seq(seq)) => !seq.items.is_empty(),
            Some(Object::Map(map)) => map.len() != 0,
            Some(_) => true,
        }
    }

    /// String form used by `Str` casts and the REPL
    pub fn display(&self, r: ObjRef) -> String {
        let mut out = String::new();
        let mut visiting = Vec::new();
        self.write_display(r, &mut out, &mut visiting, false);
        out
    }

    fn write_display(&self, r: ObjRef, out: &mut String, visiting: &mut Vec<ObjRef>, nested: bool) {
        match self.get(r) {
            None => out.push_str("<freed>"),
            Some(Object::Type(t)) => out.push_str(&t.name),
            Some(Object::Null) => out.push_str("null"),
            Some(Object::Bool(b)) => out.push_str(if *b { "true" } else { "false" }),
            Some(Object::Int(i)) => out.push_str(&i.to_string()),
            Some(Object::Real(f)) => out.push_str(&format!("{:?}", f)),
            Some(Object::Str(s)) => {
                if nested {
                    out.push('\'');
                    out.push_str(&s.replace('\'', "\\'"));
                    out.push('\'');
                } else {
                    out.push_str(s);
                }
            }
            Some(Object::Seq(seq)) => {
                let (open, close) = match seq.kind {
                    SeqKind::Array => ("{", "}"),
                    SeqKind::Vector => ("<{", "}>"),
                };
                if visiting.contains(&r) {
                    out.push_str(open);
                    out.push('.');
                    out.push_str(close);
                    return;
                }
                visiting.push(r);
                out.push_str(open);
                for (i, &item) in seq.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_display(item, out, visiting, true);
                }
                out.push_str(close);
                visiting.pop();
            }
            Some(Object::Map(map)) => {
                if visiting.contains(&r) {
                    out.push_str("{.}");
                    return;
                }
                visiting.push(r);
                out.push('{');
                for (i, (key, value)) in map.entries().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_display(key, out, visiting, true);
                    out.push_str(": ");
                    self.write_display(value, out, visiting, true);
                }
                out.push('}');
                visiting.pop();
            }
            Some(Object::Func(func)) => {
                out.push_str("<Func ");
                out.push_str(&func.name);
                out.push('>');
            }
            Some(Object::Iter(_)) => out.push_str("<Iter>"),
            Some(Object::Coroutine(_)) => out.push_str("<Coroutine>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HeapConfig;
    use crate::gc::Heap;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default()).unwrap()
    }

    #[test]
    fn test_numeric_hash_and_eq() {
        let mut heap = heap();
        let i = heap.new_int(42).unwrap();
        let f = heap.new_real(42.0).unwrap();
        let g = heap.new_real(0.5).unwrap();
        assert_eq!(heap.hash_obj(i), heap.hash_obj(f));
        assert!(heap.obj_eq(i, f));
        assert!(!heap.obj_eq(i, g));
        assert_ne!(heap.hash_obj(g), Some(-1));
    }

    #[test]
    fn test_hash_minus_one_remapped() {
        let mut heap = heap();
        let i = heap.new_int(-1).unwrap();
        assert_eq!(heap.hash_obj(i), Some(-2));
    }

    #[test]
    fn test_str_hash_by_content() {
        let mut heap = heap();
        let a = heap.new_str("key").unwrap();
        let b = heap.new_str("key").unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.hash_obj(a), heap.hash_obj(b));
        assert!(heap.obj_eq(a, b));
    }

    #[test]
    fn test_containers_unhashable() {
        let mut heap = heap();
        let map = heap.new_map().unwrap();
        assert_eq!(heap.hash_obj(map), None);
    }

    #[test]
    fn test_truthy() {
        let mut heap = heap();
        let zero = heap.new_int(0).unwrap();
        let empty = heap.new_str("").unwrap();
        let text = heap.new_str("x").unwrap();
        let null = heap.consts().null;
        assert!(!heap.truthy(zero));
        assert!(!heap.truthy(empty));
        assert!(heap.truthy(text));
        assert!(!heap.truthy(null));
    }

    #[test]
    fn test_expect_message() {
        let mut heap = heap();
        let s = heap.new_str("x").unwrap();
        let err = heap.expect_int(s).unwrap_err();
        assert_eq!(err.message, "expected type 'Int', got type 'Str' instead");
    }

    #[test]
    fn test_display_cycle() {
        let mut heap = heap();
        let v = heap.new_vector(Vec::new()).unwrap();
        let one = heap.new_int(1).unwrap();
        heap.vector_push(v, one).unwrap();
        heap.vector_push(v, v).unwrap();
        assert_eq!(heap.display(v), "<{1, <{.}>}>");

        let map = heap.new_map().unwrap();
        let word = heap.new_str("hi").unwrap();
        heap.map_set_str(map, "a", word).unwrap();
        assert_eq!(heap.display(map), "{'a': 'hi'}");
    }
}
