//! Top-level evaluation of parsed forms.
//!
//! `eval_flex` dispatches on the head of a parsed expression: namespace
//! forms (`module`, `using`, `import`, `export`, `public`, `global`,
//! `const`) are handled structurally, `toplevel` sequences recurse, and a
//! `thunk` wrapping a lowered code object goes through the
//! compile-or-interpret decision. The code generator, inferencer and
//! parser/lowerer are external collaborators behind registered hooks.

pub mod interp;
pub mod resolver;

use crate::exceptions::{self, try_catch};
use crate::flags::OPTIONS;
use crate::module::{self, Module};
use crate::sym::{syms, Sym};
use crate::task::{current_task, ptls};
use crate::value::{CodeInfo, Expr, RtError, Value};
use crate::world::{self, WorldAgeGuard};
use std::sync::{Arc, RwLock};

/// A compilable unit: a lowered top-level body with an empty signature,
/// owned by a module.
pub struct MethodInstance {
    pub code: Arc<CodeInfo>,
    pub module: Arc<Module>,
}

/// The code generator and type inferencer contract.
pub trait Compiler: Send + Sync {
    /// Infer the body at `world`; returns the inferred return type when
    /// available.
    fn infer(&self, _mi: &MethodInstance, _world: u64) -> Option<Value> {
        None
    }
    /// Execute the (compiled) body and return its value.
    fn invoke(&self, mi: &MethodInstance) -> Value;
}

/// The parser/lowerer contract.
pub trait Parser: Send + Sync {
    /// Parse whole-file text into a `toplevel` expression.
    fn parse_all(&self, text: &str, filename: &str) -> Value;
    /// Lower one statement; the default leaves it untouched.
    fn expand(&self, e: &Value, _m: &Arc<Module>, _filename: &str, _line: u32) -> Value {
        e.clone()
    }
}

/// Fallback code generator: runs bodies through the interpreter, so the
/// runtime works before any backend registers itself.
struct InterpretingCompiler;

impl Compiler for InterpretingCompiler {
    fn invoke(&self, mi: &MethodInstance) -> Value {
        interp::interpret_thunk(&mi.module, &mi.code)
    }
}

lazy_static! {
    static ref COMPILER: RwLock<Arc<dyn Compiler>> = RwLock::new(Arc::new(InterpretingCompiler));
    static ref PARSER: RwLock<Option<Arc<dyn Parser>>> = RwLock::new(None);
}

pub fn register_compiler(c: Arc<dyn Compiler>) {
    *COMPILER.write().unwrap() = c;
}

pub fn register_parser(p: Arc<dyn Parser>) {
    *PARSER.write().unwrap() = Some(p);
}

fn compiler() -> Arc<dyn Compiler> {
    COMPILER.read().unwrap().clone()
}

pub(crate) fn parser() -> Option<Arc<dyn Parser>> {
    PARSER.read().unwrap().clone()
}

/// Call a function value with evaluated arguments.
pub fn apply(f: &Value, args: &[Value]) -> Value {
    match f {
        Value::Func(f) => f(args),
        Value::Nothing => Value::Nothing,
        other => exceptions::throw(RtError::type_error("apply", "function", other)),
    }
}

/// Scoped save/restore of the per-thread source position.
pub(crate) struct LocGuard {
    lineno: u32,
    filename: String,
}

impl LocGuard {
    pub(crate) fn enter(filename: &str, lineno: u32) -> LocGuard {
        let p = unsafe { &mut *ptls() };
        let guard = LocGuard {
            lineno: p.lineno,
            filename: std::mem::replace(&mut p.filename, filename.to_owned()),
        };
        p.lineno = lineno;
        guard
    }
}

impl Drop for LocGuard {
    fn drop(&mut self) {
        let p = unsafe { &mut *ptls() };
        p.lineno = self.lineno;
        p.filename = std::mem::take(&mut self.filename);
    }
}

pub fn current_location() -> (String, u32) {
    let p = unsafe { &*ptls() };
    (p.filename.clone(), p.lineno)
}

fn set_location(line: u32, file: Option<Sym>) {
    let p = unsafe { &mut *ptls() };
    p.lineno = line;
    if let Some(file) = file {
        p.filename = file.name().to_owned();
    }
}

/// Resolve a global for reading or raise the undefined-variable error.
pub fn eval_global_var(m: &Arc<Module>, s: Sym) -> Value {
    match m.get_global(s) {
        Some(v) => v,
        None => exceptions::throw(Value::Err(Arc::new(RtError::UndefVar(s)))),
    }
}

fn builtin_throw(args: &[Value]) -> Value {
    let e = args.get(0).cloned().unwrap_or(Value::Nothing);
    exceptions::throw(e)
}

/// `eval(module, expr)`, installed as a module default definition.
pub fn builtin_eval(args: &[Value]) -> Value {
    match args {
        [Value::Module(m), e] => toplevel_eval_in(m, e),
        _ => exceptions::throw(Value::error("eval expects (module, expr)")),
    }
}

/// `include(module, path)`, installed as a module default definition.
pub fn builtin_include(args: &[Value]) -> Value {
    match args {
        [Value::Module(m), Value::Str(path)] => load_file(m, path),
        _ => exceptions::throw(Value::error("include expects (module, path)")),
    }
}

/// Raise `exc` *through the evaluator* (as a lowered throw-call) so the
/// user-level frame shows up in the backtrace.
pub fn eval_throw(m: &Arc<Module>, exc: Value) {
    let throw_ex = Expr::value(syms().call, vec![Value::Func(builtin_throw), exc]);
    eval_flex(m, &throw_ex, false, false);
}

pub fn eval_errorf(m: &Arc<Module>, msg: String) -> ! {
    eval_throw(m, Value::error(msg));
    unreachable!("eval_throw returned");
}

/// Heads that may only appear at top level.
fn is_toplevel_only_expr(v: &Value) -> bool {
    match v.as_expr() {
        Some(e) => {
            let s = syms();
            e.head == s.module
                || e.head == s.import
                || e.head == s.using
                || e.head == s.export
                || e.head == s.public
                || e.head == s.thunk
                || e.head == s.global
                || e.head == s.r#const
                || e.head == s.toplevel
                || e.head == s.error
                || e.head == s.incomplete
        }
        None => false,
    }
}

/// Whether the registered lowerer must see this form before dispatch.
pub fn needs_lowering(e: &Value) -> bool {
    let ex = match e.as_expr() {
        Some(ex) => ex,
        None => return false,
    };
    let s = syms();
    let head = ex.head;
    if head == s.module
        || head == s.import
        || head == s.using
        || head == s.export
        || head == s.public
        || head == s.thunk
        || head == s.toplevel
        || head == s.error
        || head == s.incomplete
        || head == s.method
    {
        return false;
    }
    if head == s.global || head == s.r#const {
        return ex
            .args
            .iter()
            .any(|a| !matches!(a, Value::Sym(_) | Value::GlobalRef(..)));
    }
    true
}

#[derive(Default)]
struct BodyAttrs {
    has_ccall: bool,
    has_defs: bool,
    has_loops: bool,
    has_opaque: bool,
    forced_compile: bool,
}

fn expr_attributes(v: &Value, attrs: &mut BodyAttrs) {
    let e = match v.as_expr() {
        Some(e) => e,
        None => return,
    };
    let s = syms();
    let head = e.head;
    if head == s.toplevel || head == s.thunk {
        return;
    } else if head == s.global {
        // Loops assigning to globals may still be worth optimizing, so a
        // bare declaration is not a definition here.
        return;
    } else if head == s.r#const || head == s.copyast {
        // `copyast` signals the presence of `quote`, and probably `eval`.
        attrs.has_defs = true;
        return;
    } else if head == s.method || is_toplevel_only_expr(v) {
        attrs.has_defs = true;
    } else if head == s.cfunction || head == s.foreigncall {
        attrs.has_ccall = true;
        return;
    } else if head == s.new_opaque_closure {
        attrs.has_opaque = true;
        return;
    } else if head == s.call {
        return;
    }
    for a in &e.args {
        if matches!(a, Value::Expr(_)) {
            expr_attributes(a, attrs);
        }
    }
}

fn body_attributes(code: &CodeInfo) -> BodyAttrs {
    let mut attrs = BodyAttrs::default();
    let stmts = code.code.lock().unwrap();
    for (i, stmt) in stmts.iter().enumerate() {
        if !attrs.has_loops {
            // Labels are 1-based statement indices; a target at or before
            // the current statement is a backward branch.
            match stmt {
                Value::Goto(l) if *l as usize <= i => attrs.has_loops = true,
                Value::GotoIfNot(_, l) if *l as usize <= i => attrs.has_loops = true,
                _ => {}
            }
        }
        expr_attributes(stmt, &mut attrs);
    }
    attrs.forced_compile = stmts.iter().any(|stmt| match stmt.as_expr() {
        Some(e) => e.head == syms().meta && e.args.contains(&Value::Sym(syms().force_compile)),
        None => false,
    });
    attrs
}

/// Whether a lowered body must (or should) go through the code generator,
/// given the caller's `fast` preference and the process and module compile
/// settings.
fn requires_compiler(m: &Arc<Module>, attrs: &BodyAttrs, fast: bool) -> bool {
    attrs.has_ccall
        || ((attrs.forced_compile || (!attrs.has_defs && fast && attrs.has_loops))
            && OPTIONS.compile_enabled().permits_compilation()
            && m.compile_setting().permits_compilation())
}

fn eval_dot_expr(m: &Arc<Module>, x: &Value, f: &Value, fast: bool) -> Value {
    let lhs = eval_flex(m, x, fast, false);
    let rhs = eval_flex(m, f, fast, false);
    if let Value::Module(target) = &lhs {
        let s = match rhs.as_sym() {
            Some(s) => s,
            None => exceptions::throw(RtError::type_error("getglobal", "Symbol", &rhs)),
        };
        return eval_global_var(target, s);
    }
    // Fall back to the user-level property protocol in the base namespace.
    let base = module::base_relative_to(m)
        .unwrap_or_else(|| exceptions::throw(Value::error("no base namespace for getproperty")));
    let getproperty = eval_global_var(&base, syms().getproperty);
    let ct = current_task().expect("evaluator requires an initialized runtime thread");
    let _age = WorldAgeGuard::enter_latest(&ct);
    apply(&getproperty, &[lhs, rhs])
}

/// Evaluate one parsed form against `m`.
///
/// `fast` enables the compile heuristics for loopy thunks; `expanded`
/// promises the form has already been through the lowerer.
pub fn eval_flex(m: &Arc<Module>, e: &Value, fast: bool, expanded: bool) -> Value {
    let ct = current_task().expect("evaluator requires an initialized runtime thread");

    let ex: Arc<Expr> = match e {
        Value::LineNode(line, file) => {
            set_location(*line, *file);
            return Value::Nothing;
        }
        Value::Sym(s) => {
            if s.is_all_underscore() {
                eval_errorf(
                    m,
                    "all-underscore identifiers are write-only and their values cannot be used in expressions"
                        .to_owned(),
                );
            }
            return eval_global_var(m, *s);
        }
        Value::Expr(ex) => ex.clone(),
        other => return interp::eval_value(m, other),
    };

    let s = syms();
    if ex.head == s.dot && ex.nargs() != 1 {
        if ex.nargs() != 2 {
            eval_errorf(m, "syntax: malformed \".\" expression".to_owned());
        }
        // Only `a.b` is handled here, so qualified names can be evaluated
        // in pure contexts.
        if let Value::Quote(q) = &ex.args[1] {
            if matches!(**q, Value::Sym(_)) {
                return eval_dot_expr(m, &ex.args[0], &ex.args[1], fast);
            }
        }
    }

    if unsafe { (*ptls()).in_pure_callback } {
        exceptions::throw(Value::error("eval cannot be used in a generated function"));
    }

    let ex = if !expanded && needs_lowering(e) {
        let lowered = match parser() {
            Some(p) => {
                let _age = WorldAgeGuard::enter_latest(&ct);
                let (filename, lineno) = current_location();
                p.expand(e, m, &filename, lineno)
            }
            None => e.clone(),
        };
        match lowered {
            Value::Expr(x) => x,
            other => return eval_flex(m, &other, fast, true),
        }
    } else {
        ex
    };

    let head = ex.head;
    if head == s.module {
        resolver::eval_module_expr(m, &ex)
    } else if head == s.using {
        resolver::eval_using(m, &ex);
        Value::Nothing
    } else if head == s.import {
        resolver::eval_import(m, &ex);
        Value::Nothing
    } else if head == s.export || head == s.public {
        let exported = head == s.export;
        for a in &ex.args {
            match a.as_sym() {
                Some(name) => m.set_public(name, exported),
                None => eval_errorf(
                    m,
                    format!(
                        "syntax: malformed \"{}\" statement",
                        if exported { "export" } else { "public" }
                    ),
                ),
            }
        }
        Value::Nothing
    } else if head == s.global {
        eval_global_decl(m, &ex, false);
        Value::Nothing
    } else if head == s.r#const {
        let (gm, gs) = global_target(m, &ex.args[0]);
        gm.declare_constant(gs);
        Value::Nothing
    } else if head == s.toplevel {
        let mut res = Value::Nothing;
        for a in &ex.args {
            res = eval_flex(m, a, fast, false);
        }
        res
    } else if head == s.error || head == s.incomplete {
        match ex.args.get(0) {
            None => eval_errorf(m, format!("malformed \"{}\" expression", head)),
            Some(Value::Str(msg)) => eval_errorf(m, format!("syntax: {}", msg)),
            Some(other) => {
                eval_throw(m, other.clone());
                unreachable!("eval_throw returned")
            }
        }
    } else if head == s.thunk {
        let code = match ex.args.get(0) {
            Some(Value::Code(c)) => c.clone(),
            _ => eval_errorf(m, "malformed \"thunk\" statement".to_owned()),
        };
        eval_thunk(m, &code, fast)
    } else {
        interp::eval_value(m, &Value::Expr(ex))
    }
}

/// Uninitialized mutable bindings for a `global` declaration;
/// `set_type` additionally pins the declared type to the any-type.
pub fn eval_global_decl(m: &Arc<Module>, ex: &Expr, set_type: bool) {
    for arg in &ex.args {
        let (gm, gs) = global_target(m, arg);
        if !gm.binding_resolved(gs) {
            let b = gm.get_binding_wr(gs);
            if set_type {
                b.declare_type_any();
            }
        }
    }
}

fn global_target(m: &Arc<Module>, arg: &Value) -> (Arc<Module>, Sym) {
    match arg {
        Value::GlobalRef(gm, gs) => (gm.clone(), *gs),
        Value::Sym(gs) => (m.clone(), *gs),
        other => exceptions::throw(RtError::type_error("global", "Symbol", other)),
    }
}

fn eval_thunk(m: &Arc<Module>, code: &Arc<CodeInfo>, fast: bool) -> Value {
    let ct = current_task().expect("evaluator requires an initialized runtime thread");
    let _timing = crate::task::TimingGuard::enter();
    let attrs = body_attributes(code);
    if requires_compiler(m, &attrs, fast) {
        let mi = MethodInstance {
            code: code.clone(),
            module: m.clone(),
        };
        interp::resolve_globals_in_ir(code, m);
        let world = world::world_counter();
        let _age = WorldAgeGuard::enter_at(&ct, world);
        // Bodies containing definitions are not inferred: it is expensive
        // and unsound while the definitions are still landing.
        if !attrs.has_defs && m.infer_setting() != 0 {
            let _ = compiler().infer(&mi, world);
        }
        compiler().invoke(&mi)
    } else {
        if attrs.has_opaque {
            interp::resolve_globals_in_ir(code, m);
        }
        interp::interpret_thunk(m, code)
    }
}

pub fn toplevel_eval(m: &Arc<Module>, v: &Value) -> Value {
    eval_flex(m, v, true, false)
}

/// Public eval entry: check the module is open, pin the location, and
/// restore it even when the evaluation throws.
pub fn toplevel_eval_in(m: &Arc<Module>, ex: &Value) -> Value {
    check_top_level_effect(m, "eval");
    let _loc = LocGuard::enter("none", 1);
    try_catch(
        || toplevel_eval(m, ex),
        |_e| exceptions::rethrow(),
    )
}

/// Reject eval/include into a module that is already closed while
/// incremental output is being generated; its side effects would not be
/// permanent.
pub fn check_top_level_effect(m: &Arc<Module>, what: &str) {
    if unsafe { (*ptls()).in_pure_callback } {
        exceptions::throw(Value::error(format!(
            "{} cannot be used in a generated function",
            what
        )));
    }
    if OPTIONS.incremental() && OPTIONS.generating_output() {
        let is_main = module::main_module()
            .map(|main| Arc::ptr_eq(&main, m))
            .unwrap_or(false);
        if !is_main {
            let open = resolver::module_in_progress(m) || resolver::in_init_order(m);
            if !open && !resolver::is_toplevel_sentinel(m) {
                let name = m.name();
                exceptions::throw(Value::error(format!(
                    "Evaluation into the closed module `{}` breaks incremental compilation \
                     because the side effects will not be permanent. This is likely due to \
                     some other module mutating `{}` with `{}` during precompilation - \
                     don't do this.",
                    name, name, what
                )));
            }
        }
    }
}

/// Resolve a lowered body's globals and ask the registered inferencer for
/// its return type; the any-type sentinel when inference is unavailable.
pub fn infer_thunk(code: &Arc<CodeInfo>, m: &Arc<Module>) -> Value {
    let mi = MethodInstance {
        code: code.clone(),
        module: m.clone(),
    };
    interp::resolve_globals_in_ir(code, m);
    let ct = current_task().expect("evaluator requires an initialized runtime thread");
    match compiler().infer(&mi, ct.world_age()) {
        Some(rettype) => rettype,
        None => Value::Sym(Sym::new("Any")),
    }
}

/// Parse `text` as a sequence of top-level forms and evaluate them in
/// order against `module`, tracking line nodes. A failure is re-raised
/// wrapped with the filename and the line being evaluated.
pub fn parse_eval_all(module: &Arc<Module>, text: &str, filename: &str) -> Value {
    check_top_level_effect(module, "include");
    let parser = match parser() {
        Some(p) => p,
        None => exceptions::throw(Value::error("no parser registered")),
    };
    let ast = parser.parse_all(text, filename);
    let forms = match ast.as_expr() {
        Some(e) if e.head == syms().toplevel => e.clone(),
        _ => exceptions::throw(Value::error(
            "parse_all must generate a top level expression",
        )),
    };

    let ct = current_task().expect("evaluator requires an initialized runtime thread");
    let _loc = LocGuard::enter(filename, 0);
    let _age = WorldAgeGuard::enter_at(&ct, ct.world_age());
    let file = filename.to_owned();
    try_catch(
        move || {
            let mut result = Value::Nothing;
            for form in &forms.args {
                if let Value::LineNode(line, _) = form {
                    unsafe { (*ptls()).lineno = *line };
                    continue;
                }
                let (filename, lineno) = current_location();
                let expanded = parser.expand(form, module, &filename, lineno);
                ct.set_world_age(world::world_counter());
                result = eval_flex(module, &expanded, true, true);
            }
            result
        },
        |e| {
            let line = unsafe { (*ptls()).lineno };
            exceptions::rethrow_other(Value::Err(Arc::new(RtError::Load {
                file: file.clone(),
                line,
                inner: e.clone(),
            })))
        },
    )
}

/// Read, parse and evaluate a source file into `module`.
pub fn load_file(module: &Arc<Module>, path: &str) -> Value {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => exceptions::throw(Value::error(format!("File \"{}\" not found", path))),
    };
    parse_eval_all(module, &text, path)
}
