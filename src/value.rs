use crate::module::Module;
use crate::sym::Sym;
use crate::task::Task;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A native function installed as a binding value (builtins, hooks, test
/// bodies). Receives evaluated arguments; raises through the exception
/// machinery rather than returning a `Result`.
pub type NativeFn = fn(&[Value]) -> Value;

/// The dynamic value type the evaluator and task machinery traffic in.
/// Shared innards are `Arc`s so values may cross task and thread
/// boundaries.
#[derive(Clone)]
pub enum Value {
    Nothing,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Sym(Sym),
    Module(Arc<Module>),
    Func(NativeFn),
    Expr(Arc<Expr>),
    Code(Arc<CodeInfo>),
    /// Source location marker: line plus optional file symbol.
    LineNode(u32, Option<Sym>),
    /// A binding reference resolved to its home module.
    GlobalRef(Arc<Module>, Sym),
    /// Reference to the value of an earlier statement in a lowered body.
    Ssa(u32),
    /// Unconditional branch to a statement index (1-based, like the lowered
    /// form's labels).
    Goto(u32),
    /// Conditional branch: if the operand is false, jump to the label.
    GotoIfNot(Arc<Value>, u32),
    Quote(Arc<Value>),
    /// A runtime exception object.
    Err(Arc<RtError>),
    Task(Arc<Task>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn error(msg: impl Into<String>) -> Value {
        Value::Err(Arc::new(RtError::Error(msg.into())))
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    pub fn as_module(&self) -> Option<&Arc<Module>> {
        match self {
            Value::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sym(&self) -> Option<Sym> {
        match self {
            Value::Sym(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_expr(&self) -> Option<&Arc<Expr>> {
        match self {
            Value::Expr(e) => Some(e),
            _ => None,
        }
    }

    /// Truthiness used by `GotoIfNot`: only booleans branch; anything else
    /// is a type error raised by the interpreter.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A parsed (or lowered) expression: a head symbol plus arguments.
pub struct Expr {
    pub head: Sym,
    pub args: Vec<Value>,
}

impl Expr {
    pub fn new(head: Sym, args: Vec<Value>) -> Arc<Expr> {
        Arc::new(Expr { head, args })
    }

    pub fn value(head: Sym, args: Vec<Value>) -> Value {
        Value::Expr(Expr::new(head, args))
    }

    pub fn nargs(&self) -> usize {
        self.args.len()
    }
}

/// A lowered top-level code object, wrapped by a `thunk` form and awaiting
/// the compile-or-interpret decision. The statement list is mutable in
/// place: global resolution rewrites bare symbols into `GlobalRef`s.
pub struct CodeInfo {
    pub code: Mutex<Vec<Value>>,
}

impl CodeInfo {
    pub fn new(code: Vec<Value>) -> Arc<CodeInfo> {
        Arc::new(CodeInfo {
            code: Mutex::new(code),
        })
    }
}

/// Runtime exception objects the core itself raises. User code may throw
/// any `Value`; these are the ones with structure the runtime inspects.
#[derive(Clone)]
pub enum RtError {
    /// Generic error with a message (malformed syntax, undefined paths,
    /// illegal runtime states).
    Error(String),
    /// A value had the wrong type for a context.
    Type {
        context: String,
        expected: &'static str,
        got: String,
    },
    UndefVar(Sym),
    /// Memory or stack exhaustion.
    Memory,
    /// A module initializer threw; carries the module name and the inner
    /// exception.
    Init { module: Sym, inner: Value },
    /// A file include failed; carries location and the inner exception.
    Load {
        file: String,
        line: u32,
        inner: Value,
    },
}

impl RtError {
    pub fn type_error(context: &str, expected: &'static str, got: &Value) -> Value {
        Value::Err(Arc::new(RtError::Type {
            context: context.to_owned(),
            expected,
            got: format!("{}", got),
        }))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Nothing, Nothing) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Sym(a), Sym(b)) => a == b,
            (Module(a), Module(b)) => Arc::ptr_eq(a, b),
            (Func(a), Func(b)) => *a as usize == *b as usize,
            (Expr(a), Expr(b)) => Arc::ptr_eq(a, b),
            (Code(a), Code(b)) => Arc::ptr_eq(a, b),
            (LineNode(a, af), LineNode(b, bf)) => a == b && af == bf,
            (GlobalRef(am, asym), GlobalRef(bm, bsym)) => Arc::ptr_eq(am, bm) && asym == bsym,
            (Ssa(a), Ssa(b)) => a == b,
            (Goto(a), Goto(b)) => a == b,
            (GotoIfNot(ac, al), GotoIfNot(bc, bl)) => al == bl && **ac == **bc,
            (Quote(a), Quote(b)) => **a == **b,
            (Err(a), Err(b)) => Arc::ptr_eq(a, b),
            (Task(a), Task(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nothing => f.write_str("nothing"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Sym(s) => write!(f, "{}", s),
            Value::Module(m) => write!(f, "module {}", m.name()),
            Value::Func(_) => f.write_str("#<native function>"),
            Value::Expr(e) => write!(f, "Expr({})", e.head),
            Value::Code(_) => f.write_str("#<code>"),
            Value::LineNode(line, file) => match file {
                Some(file) => write!(f, "#line {} {}", line, file),
                None => write!(f, "#line {}", line),
            },
            Value::GlobalRef(m, s) => write!(f, "{}.{}", m.name(), s),
            Value::Ssa(i) => write!(f, "%{}", i),
            Value::Goto(l) => write!(f, "goto %{}", l),
            Value::GotoIfNot(c, l) => write!(f, "goto %{} if not {}", l, c),
            Value::Quote(v) => write!(f, "quote({})", v),
            Value::Err(e) => write!(f, "{}", e),
            Value::Task(_) => f.write_str("#<task>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::Error(msg) => write!(f, "ErrorException: {}", msg),
            RtError::Type {
                context,
                expected,
                got,
            } => write!(
                f,
                "TypeError: in {}, expected {}, got {}",
                context, expected, got
            ),
            RtError::UndefVar(s) => write!(f, "UndefVarError: `{}` not defined", s),
            RtError::Memory => f.write_str("OutOfMemoryError"),
            RtError::Init { module, inner } => write!(
                f,
                "InitError: during initialization of module {}: {}",
                module, inner
            ),
            RtError::Load { file, line, inner } => {
                write!(f, "LoadError: at {}:{}: {}", file, line, inner)
            }
        }
    }
}
