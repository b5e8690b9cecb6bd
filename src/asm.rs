//! Bytecode listings
//!
//! Programs are handed to the VM as textual listings:
//!
//! ```text
//! ; comments run to the end of the line
//! func add(a, b)
//!     GET_VAL a
//!     GET_VAL b
//!     STACK_OP +
//!     RETURN_VAL
//! end
//!
//! func main()
//!     PUSH_VAL 1
//!     PUSH_VAL 2
//!     PUSH_VAL &add
//!     OP_CALL 2
//! loop:
//!     JUMP @loop
//! end
//! ```
//!
//! Operands are integers, reals, `"strings"`, `null`, `true`, `false`,
//! `&func` references, `@label` targets, bare names, operator symbols for
//! `STACK_OP` and operator names for `LOCAL_OP`. Every instruction's span
//! covers its line of the listing, so tracebacks quote the listing.

use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::DEFAULT_OPT_LEVEL;
use crate::context::Context;
use crate::error::{Error, Pos, SourceText, Span};
use crate::gc::Heap;
use crate::runtime::function::{Bytecode, FuncBody, Operand, release_operands};
use crate::runtime::object::Object;
use crate::runtime::ops::{BinaryOp, UnaryOp};
use crate::value::ObjRef;
use crate::vm::opcode::{OpCode, OpFormat};

/// Name of the program entry
pub const MAIN_NAME: &str = "main";

/// Errors in a listing; line numbers are 1-based
#[derive(Debug, thiserror::Error)]
pub enum AsmError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown instruction '{name}'")]
    UnknownOp { line: usize, name: String },
    #[error("line {line}: undefined label '{label}'")]
    UndefinedLabel { line: usize, label: String },
    #[error("line {line}: undefined function '{name}'")]
    UndefinedFunction { line: usize, name: String },
    #[error("line {line}: '{name}' is defined twice")]
    Duplicate { line: usize, name: String },
    #[error("the listing has no '{MAIN_NAME}' function")]
    MissingMain,
    #[error(transparent)]
    Runtime(#[from] Error),
}

impl AsmError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        AsmError::Syntax {
            line: line + 1,
            message: message.into(),
        }
    }
}

static FUNC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^func\s+([A-Za-z_]\w*)\s*\(([^)]*)\)$").expect("valid regex")
});
static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_]\w*):$").expect("valid regex"));
static INST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z][A-Z_]*)(?:\s+(.+))?$").expect("valid regex"));
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]\w*$").expect("valid regex"));
static INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9][0-9_]*$").expect("valid regex"));
static REAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?[0-9][0-9_]*(\.[0-9_]+)?([eE][+-]?[0-9]+)?$").expect("valid regex")
});

/// A listing line after comments are stripped
#[derive(Debug)]
enum Item<'a> {
    Label(&'a str),
    Inst {
        op: OpCode,
        operand: Option<&'a str>,
        line: usize,
        start: usize,
        end: usize,
    },
}

#[derive(Debug)]
struct FuncSrc<'a> {
    name: &'a str,
    params: Vec<&'a str>,
    line: usize,
    items: Vec<Item<'a>>,
}

/// Cut a `;` comment, ignoring semicolons inside string literals
fn strip_comment(line: &str) -> &str {
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if in_str {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_str = false,
                _ => {}
            }
        } else if c == '"' {
            in_str = true;
        } else if c == ';' {
            return &line[..i];
        }
    }
    line
}

fn parse_listing(src: &str) -> Result<Vec<FuncSrc<'_>>, AsmError> {
    let mut funcs: Vec<FuncSrc<'_>> = Vec::new();
    let mut current: Option<FuncSrc<'_>> = None;

    for (n, raw) in src.lines().enumerate() {
        let code = strip_comment(raw);
        let text = code.trim();
        if text.is_empty() {
            continue;
        }
        let start = code.len() - code.trim_start().len();
        let end = start + text.chars().count().saturating_sub(1);

        if let Some(caps) = FUNC_RE.captures(text) {
            if let Some(open) = &current {
                return Err(AsmError::syntax(
                    n,
                    format!("'func' inside function '{}'", open.name),
                ));
            }
            let name = caps.get(1).map_or("", |m| m.as_str());
            if funcs.iter().any(|f| f.name == name) {
                return Err(AsmError::Duplicate {
                    line: n + 1,
                    name: name.to_owned(),
                });
            }
            let params_text = caps.get(2).map_or("", |m| m.as_str()).trim();
            let mut params = Vec::new();
            if !params_text.is_empty() {
                for p in params_text.split(',').map(str::trim) {
                    if !IDENT_RE.is_match(p) {
                        return Err(AsmError::syntax(n, format!("invalid parameter '{}'", p)));
                    }
                    params.push(p);
                }
            }
            current = Some(FuncSrc {
                name,
                params,
                line: n,
                items: Vec::new(),
            });
            continue;
        }

        let Some(func) = current.as_mut() else {
            return Err(AsmError::syntax(n, "instruction outside of a function"));
        };
        if text == "end" {
            if let Some(done) = current.take() {
                funcs.push(done);
            }
        } else if let Some(caps) = LABEL_RE.captures(text) {
            func.items.push(Item::Label(caps.get(1).map_or("", |m| m.as_str())));
        } else if let Some(caps) = INST_RE.captures(text) {
            let name = caps.get(1).map_or("", |m| m.as_str());
            let op = OpCode::from_name(name).ok_or_else(|| AsmError::UnknownOp {
                line: n + 1,
                name: name.to_owned(),
            })?;
            func.items.push(Item::Inst {
                op,
                operand: caps.get(2).map(|m| m.as_str().trim()),
                line: n,
                start,
                end,
            });
        } else {
            return Err(AsmError::syntax(n, format!("cannot parse '{}'", text)));
        }
    }

    if let Some(open) = current {
        return Err(AsmError::syntax(
            open.line,
            format!("function '{}' has no 'end'", open.name),
        ));
    }
    Ok(funcs)
}

fn unescape(body: &str, line: usize) -> Result<String, AsmError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                return Err(AsmError::syntax(line, format!("unknown escape '\\{}'", other)));
            }
            None => return Err(AsmError::syntax(line, "unterminated escape")),
        }
    }
    Ok(out)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Builds one function's bytecode
struct Assembler<'a, 'h> {
    heap: &'h mut Heap,
    funcs: &'a FxHashMap<&'a str, ObjRef>,
    source: &'a Rc<SourceText>,
    fold_names: bool,
}

impl Assembler<'_, '_> {
    fn build(&mut self, src: &FuncSrc<'_>) -> Result<Bytecode, AsmError> {
        let mut labels = FxHashMap::default();
        let mut idx = 0usize;
        for item in &src.items {
            match item {
                Item::Label(name) => {
                    if labels.insert(*name, idx).is_some() {
                        return Err(AsmError::Duplicate {
                            line: src.line + 1,
                            name: (*name).to_owned(),
                        });
                    }
                }
                Item::Inst { .. } => idx += 1,
            }
        }

        let mut code = Bytecode::new();
        for item in &src.items {
            let Item::Inst {
                op,
                operand,
                line,
                start,
                end,
            } = item
            else {
                continue;
            };
            let span = Span::new(
                Rc::clone(self.source),
                Pos::new(*line, *start),
                Pos::new(*line, *end),
            );
            match self.operand(*op, *operand, *line, &labels) {
                Ok((op, operand)) => code.push(op, operand, span),
                Err(e) => {
                    release_operands(self.heap, code);
                    return Err(e);
                }
            }
        }
        Ok(code)
    }

    fn operand(
        &mut self,
        op: OpCode,
        text: Option<&str>,
        line: usize,
        labels: &FxHashMap<&str, usize>,
    ) -> Result<(OpCode, Operand), AsmError> {
        let format = op.format();
        let Some(text) = text else {
            if format == OpFormat::None {
                return Ok((op, Operand::None));
            }
            return Err(AsmError::syntax(
                line,
                format!("'{}' needs an operand", op.name()),
            ));
        };

        match format {
            OpFormat::None => Err(AsmError::syntax(
                line,
                format!("'{}' takes no operand", op.name()),
            )),
            OpFormat::Int => text
                .replace('_', "")
                .parse::<i64>()
                .map(|i| (op, Operand::Int(i)))
                .map_err(|_| AsmError::syntax(line, format!("expected an integer, got '{}'", text))),
            OpFormat::Label => {
                let name = text.strip_prefix('@').unwrap_or(text);
                labels
                    .get(name)
                    .map(|&i| (op, Operand::Int(i as i64)))
                    .ok_or_else(|| AsmError::UndefinedLabel {
                        line: line + 1,
                        label: name.to_owned(),
                    })
            }
            OpFormat::BinaryOp => BinaryOp::from_symbol(text)
                .map(|b| (op, Operand::Int(b.id())))
                .ok_or_else(|| AsmError::syntax(line, format!("unknown operator '{}'", text))),
            OpFormat::UnaryOp => UnaryOp::from_name(text)
                .or_else(|| UnaryOp::ALL.into_iter().find(|u| u.symbol() == text))
                .map(|u| (op, Operand::Int(u.id())))
                .ok_or_else(|| AsmError::syntax(line, format!("unknown operator '{}'", text))),
            OpFormat::Type => {
                let ty = self.heap.types().by_name(text).ok_or_else(|| {
                    AsmError::syntax(line, format!("unknown type '{}'", text))
                })?;
                Ok((op, Operand::Obj(self.heap.inc_ref(ty))))
            }
            OpFormat::Name => {
                let name = match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
                    Some(quoted) => unescape(quoted, line)?,
                    None if IDENT_RE.is_match(text) => text.to_owned(),
                    None => {
                        return Err(AsmError::syntax(line, format!("invalid name '{}'", text)));
                    }
                };
                if op == OpCode::GetVal && self.fold_names {
                    if let Some(value) = self.folded(&name) {
                        return Ok((OpCode::PushVal, Operand::Obj(value)));
                    }
                }
                let obj = self.heap.new_str(name)?;
                Ok((op, Operand::Obj(obj)))
            }
            OpFormat::Value => Ok((op, Operand::Obj(self.value(text, line)?))),
        }
    }

    /// Builtin names resolved at assembly time (owned)
    fn folded(&mut self, name: &str) -> Option<ObjRef> {
        let consts = self.heap.consts();
        let value = match name {
            "null" => consts.null,
            "true" => consts.bool_true,
            "false" => consts.bool_false,
            _ => self.heap.types().by_name(name)?,
        };
        Some(self.heap.inc_ref(value))
    }

    fn value(&mut self, text: &str, line: usize) -> Result<ObjRef, AsmError> {
        if let Some(quoted) = text.strip_prefix('"') {
            let body = quoted
                .strip_suffix('"')
                .ok_or_else(|| AsmError::syntax(line, "unterminated string"))?;
            return Ok(self.heap.new_str(unescape(body, line)?)?);
        }
        if let Some(name) = text.strip_prefix('&') {
            let func = self.funcs.get(name).ok_or_else(|| AsmError::UndefinedFunction {
                line: line + 1,
                name: name.to_owned(),
            })?;
            return Ok(self.heap.inc_ref(*func));
        }
        match text {
            "null" => return Ok(self.heap.null()),
            "true" => return Ok(self.heap.bool_obj(true)),
            "false" => return Ok(self.heap.bool_obj(false)),
            _ => {}
        }
        let digits = text.replace('_', "");
        if INT_RE.is_match(text) {
            let value = digits
                .parse::<i64>()
                .map_err(|_| AsmError::syntax(line, format!("integer '{}' is out of range", text)))?;
            return Ok(self.heap.new_int(value)?);
        }
        if REAL_RE.is_match(text) || matches!(text, "inf" | "-inf" | "nan") {
            let value = digits
                .parse::<f64>()
                .map_err(|_| AsmError::syntax(line, format!("invalid real '{}'", text)))?;
            return Ok(self.heap.new_real(value)?);
        }
        if let Some(ty) = self.heap.types().by_name(text) {
            return Ok(self.heap.inc_ref(ty));
        }
        Err(AsmError::syntax(line, format!("invalid value '{}'", text)))
    }
}

/// Assemble every function of a listing. The functions are returned in
/// definition order and owned by the caller.
pub fn assemble_all(
    ctx: &mut Context,
    src: &str,
    path: &str,
) -> Result<Vec<(String, ObjRef)>, AsmError> {
    let parsed = parse_listing(src)?;
    let source = SourceText::new(path, src);
    let fold_names = ctx.config().opt_level >= DEFAULT_OPT_LEVEL && !ctx.config().no_default;
    let heap = ctx.heap_mut();

    // Create every function first so that bodies can reference any of them
    let mut made: Vec<(String, ObjRef)> = Vec::with_capacity(parsed.len());
    let mut by_name = FxHashMap::default();
    for f in &parsed {
        let created = declare(heap, f);
        match created {
            Ok(func) => {
                made.push((f.name.to_owned(), func));
                by_name.insert(f.name, func);
            }
            Err(e) => {
                release_all(heap, made);
                return Err(e);
            }
        }
    }

    for f in &parsed {
        let func = by_name[f.name];
        let mut asm = Assembler {
            heap: &mut *heap,
            funcs: &by_name,
            source: &source,
            fold_names,
        };
        let result = asm
            .build(f)
            .and_then(|code| heap.set_bytecode(func, code).map_err(AsmError::from));
        if let Err(e) = result {
            release_all(heap, made);
            return Err(e);
        }
    }

    debug!(path, functions = made.len(), "listing assembled");
    Ok(made)
}

fn declare(heap: &mut Heap, f: &FuncSrc<'_>) -> Result<ObjRef, AsmError> {
    let mut params = Vec::with_capacity(f.params.len());
    for p in &f.params {
        match heap.new_str(*p) {
            Ok(s) => params.push(s),
            Err(e) => {
                for s in params {
                    heap.dec_ref(s);
                }
                return Err(e.into());
            }
        }
    }
    Ok(heap.new_func(f.name, Bytecode::new(), params)?)
}

fn release_all(heap: &mut Heap, funcs: Vec<(String, ObjRef)>) {
    for (_, func) in funcs {
        heap.dec_ref(func);
    }
    // functions referencing each other form cycles
    heap.collect_all();
}

/// Assemble a listing and return its `main` function (owned)
pub fn assemble(ctx: &mut Context, src: &str, path: &str) -> Result<ObjRef, AsmError> {
    let funcs = assemble_all(ctx, src, path)?;
    let mut main = None;
    let mut rest = Vec::with_capacity(funcs.len());
    for (name, func) in funcs {
        if name == MAIN_NAME && main.is_none() {
            main = Some(func);
        } else {
            rest.push(func);
        }
    }
    for func in rest {
        ctx.heap_mut().dec_ref(func);
    }
    main.ok_or(AsmError::MissingMain)
}

/// Render a bytecode function as a listing
pub fn disassemble(heap: &Heap, func: ObjRef) -> Result<String, Error> {
    let f = heap.expect_func(func)?;
    let code = match &f.body {
        FuncBody::Bytecode(code) => Rc::clone(code),
        FuncBody::Native(_) => {
            return Ok(format!("; native function {}\n", f.name));
        }
    };

    let params: Vec<&str> = f.params.iter().filter_map(|&p| heap.as_str(p)).collect();
    let mut targets: Vec<usize> = code
        .instructions
        .iter()
        .filter(|inst| inst.op.is_jump())
        .map(|inst| inst.int().max(0) as usize)
        .collect();
    targets.sort_unstable();
    targets.dedup();

    let mut out = String::new();
    let _ = writeln!(out, "func {}({})", f.name, params.join(", "));
    for (i, inst) in code.instructions.iter().enumerate() {
        if targets.binary_search(&i).is_ok() {
            let _ = writeln!(out, "L{}:", i);
        }
        let _ = write!(out, "    {}", inst.op.name());
        if let Some(text) = render_operand(heap, inst.op, inst.operand) {
            let _ = write!(out, " {}", text);
        }
        out.push('\n');
    }
    if targets.binary_search(&code.len()).is_ok() {
        let _ = writeln!(out, "L{}:", code.len());
    }
    out.push_str("end\n");
    Ok(out)
}

fn render_operand(heap: &Heap, op: OpCode, operand: Operand) -> Option<String> {
    let text = match (op.format(), operand) {
        (_, Operand::None) => return None,
        (OpFormat::Label, Operand::Int(i)) => format!("@L{}", i),
        (OpFormat::BinaryOp, Operand::Int(i)) => BinaryOp::from_id(i)?.symbol().to_owned(),
        (OpFormat::UnaryOp, Operand::Int(i)) => UnaryOp::from_id(i)?.name().to_owned(),
        (_, Operand::Int(i)) => i.to_string(),
        (OpFormat::Name, Operand::Obj(r)) => match heap.as_str(r) {
            Some(s) if IDENT_RE.is_match(s) => s.to_owned(),
            Some(s) => escape(s),
            None => heap.display(r),
        },
        (_, Operand::Obj(r)) => match heap.get(r)? {
            Object::Str(s) => escape(s),
            Object::Real(f) => format!("{:?}", f),
            Object::Func(f) => format!("&{}", f.name),
            Object::Type(t) => t.name.clone(),
            _ => heap.display(r),
        },
    };
    Some(text)
}
