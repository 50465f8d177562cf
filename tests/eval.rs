//! Top-level evaluation: dispatch, module definition and replacement,
//! imports, the thunk compile-or-interpret decision, and include.

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use weft::eval::{self, Compiler, MethodInstance, Parser};
use weft::flags::{CompileMode, OPTIONS};
use weft::module::{self, Module};
use weft::sym::{syms, Sym};
use weft::value::{CodeInfo, RtError};
use weft::world::{self, REQUIRE_WORLD};
use weft::{init_runtime_thread, toplevel_eval, toplevel_eval_in, try_catch, Expr, Value};

fn setup() -> Arc<Module> {
    init_runtime_thread();
    module::init_main_module()
}

fn sym(s: &str) -> Sym {
    Sym::new(s)
}

fn catch_message(f: impl FnOnce() -> Value) -> String {
    try_catch(|| format!("no error, got {}", f()), |e| format!("{}", e))
}

#[test]
fn symbols_resolve_to_globals() {
    let main = setup();
    main.set_global(sym("the_answer"), Value::Int(42)).unwrap();
    assert_eq!(
        toplevel_eval(&main, &Value::Sym(sym("the_answer"))),
        Value::Int(42)
    );

    let msg = catch_message(|| toplevel_eval(&main, &Value::Sym(sym("___"))));
    assert!(msg.contains("write-only"), "got: {}", msg);

    let msg = catch_message(|| toplevel_eval(&main, &Value::Sym(sym("missing_global"))));
    assert!(msg.contains("not defined"), "got: {}", msg);
}

#[test]
fn dot_expressions_read_module_globals() {
    let main = setup();
    let lib = Module::new(sym("DotLib"), None);
    lib.set_const(sym("x"), Value::Int(5));
    main.set_const(sym("DotLib"), Value::Module(lib));

    let e = Expr::value(
        syms().dot,
        vec![
            Value::Sym(sym("DotLib")),
            Value::Quote(Arc::new(Value::Sym(sym("x")))),
        ],
    );
    assert_eq!(toplevel_eval(&main, &e), Value::Int(5));
}

#[test]
fn global_const_export_and_toplevel_forms() {
    let main = setup();
    let m = Module::new(sym("FormsMod"), None);

    toplevel_eval(&m, &Expr::value(syms().global, vec![Value::Sym(sym("g1"))]));
    assert!(m.get_own_binding(sym("g1")).is_some());
    assert_eq!(m.get_global(sym("g1")), None);

    toplevel_eval(&m, &Expr::value(syms().r#const, vec![Value::Sym(sym("c1"))]));
    m.set_global(sym("c1"), Value::Int(1)).unwrap();
    assert!(m.set_global(sym("c1"), Value::Int(2)).is_err());

    toplevel_eval(&m, &Expr::value(syms().export, vec![Value::Sym(sym("c1"))]));
    let other = Module::new(sym("FormsUser"), None);
    other.using(&m);
    assert_eq!(other.get_global(sym("c1")), Some(Value::Int(1)));

    let seq = Expr::value(
        syms().toplevel,
        vec![Value::Int(1), Value::Int(2), Value::Int(3)],
    );
    assert_eq!(toplevel_eval(&main, &seq), Value::Int(3));
}

struct RecordingCompiler {
    invoked: AtomicUsize,
    inferred: AtomicUsize,
}

impl Compiler for RecordingCompiler {
    fn infer(&self, _mi: &MethodInstance, _world: u64) -> Option<Value> {
        self.inferred.fetch_add(1, Ordering::SeqCst);
        None
    }

    fn invoke(&self, _mi: &MethodInstance) -> Value {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        Value::Int(123)
    }
}

fn thunk_of(stmts: Vec<Value>) -> Value {
    Expr::value(syms().thunk, vec![Value::Code(CodeInfo::new(stmts))])
}

fn noop(_args: &[Value]) -> Value {
    Value::Nothing
}

#[test]
fn thunk_compile_or_interpret_decision() {
    let main = setup();
    let _options = option_guard();
    let recorder = Arc::new(RecordingCompiler {
        invoked: AtomicUsize::new(0),
        inferred: AtomicUsize::new(0),
    });
    eval::register_compiler(recorder.clone());

    // A straight-line body interprets.
    let straight = thunk_of(vec![
        Expr::value(syms().call, vec![Value::Func(noop)]),
        Expr::value(syms().r#return, vec![Value::Int(7)]),
    ]);
    assert_eq!(toplevel_eval(&main, &straight), Value::Int(7));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 0);

    // A backward branch plus the fast path selects the code generator.
    let loopy = thunk_of(vec![
        Expr::value(syms().call, vec![Value::Func(noop)]),
        Value::Goto(1),
    ]);
    assert_eq!(toplevel_eval(&main, &loopy), Value::Int(123));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.inferred.load(Ordering::SeqCst), 1);

    // The explicit meta flag forces compilation even without loops.
    let forced = thunk_of(vec![
        Expr::value(syms().meta, vec![Value::Sym(syms().force_compile)]),
        Expr::value(syms().r#return, vec![Value::Int(9)]),
    ]);
    assert_eq!(toplevel_eval(&main, &forced), Value::Int(123));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 2);

    // A disabled code generator turns the forced body back into the
    // interpreter's.
    OPTIONS.set_compile_enabled(CompileMode::Off);
    assert_eq!(toplevel_eval(&main, &forced), Value::Int(9));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 2);

    // Foreign calls override even a disabled code generator.
    let ccall = thunk_of(vec![
        Expr::value(syms().foreigncall, vec![Value::Sym(sym("getpid"))]),
        Expr::value(syms().r#return, vec![Value::Int(0)]),
    ]);
    assert_eq!(toplevel_eval(&main, &ccall), Value::Int(123));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 3);
    OPTIONS.set_compile_enabled(CompileMode::On);

    // A module-local override vetoes compilation the same way.
    let quiet = Module::new(sym("NoCompileMod"), None);
    quiet.set_compile_setting(0);
    assert_eq!(toplevel_eval(&quiet, &forced), Value::Int(9));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 3);

    // Definitions suppress inference but not compilation.
    let defs = thunk_of(vec![
        Expr::value(syms().r#const, vec![Value::Sym(sym("zz"))]),
        Expr::value(syms().foreigncall, vec![Value::Sym(sym("getpid"))]),
    ]);
    let inferred_before = recorder.inferred.load(Ordering::SeqCst);
    assert_eq!(toplevel_eval(&main, &defs), Value::Int(123));
    assert_eq!(recorder.inferred.load(Ordering::SeqCst), inferred_before);
}

#[test]
fn world_age_is_restored_after_a_thunk() {
    let main = setup();
    let ct = weft::current_task().unwrap();
    let age_before = ct.world_age();
    world::bump_world_counter();
    let straight = thunk_of(vec![Expr::value(syms().r#return, vec![Value::Int(1)])]);
    toplevel_eval(&main, &straight);
    assert_eq!(ct.world_age(), age_before);
}

fn module_expr(name: &str, body: Vec<Value>) -> Value {
    Expr::value(
        syms().module,
        vec![
            Value::Bool(false),
            Value::Sym(sym(name)),
            Expr::value(syms().block, body),
        ],
    )
}

lazy_static! {
    static ref INIT_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    // Serializes tests that flip the process-wide evaluator options.
    static ref OPTION_LOCK: Mutex<()> = Mutex::new(());
}

fn option_guard() -> std::sync::MutexGuard<'static, ()> {
    OPTION_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn outer_init(_args: &[Value]) -> Value {
    INIT_ORDER.lock().unwrap().push("outer");
    Value::Nothing
}

fn inner_init(_args: &[Value]) -> Value {
    INIT_ORDER.lock().unwrap().push("inner");
    Value::Nothing
}

fn throwing_init(_args: &[Value]) -> Value {
    weft::throw(Value::str("kaboom"))
}

fn assign(name: &str, v: Value) -> Value {
    Expr::value(syms().assign, vec![Value::Sym(sym(name)), v])
}

#[test]
fn module_lifecycle() {
    let main = setup();
    let _options = option_guard();

    // Definition binds the module as a constant in its parent.
    let parent = Module::new(sym("LifecycleParent"), None);
    toplevel_eval(&parent, &module_expr("Foo", vec![]));
    let first = parent.get_global(sym("Foo")).unwrap();
    assert!(matches!(first, Value::Module(_)));

    // Redefinition outside precompile mode replaces with a warning.
    toplevel_eval(&parent, &module_expr("Foo", vec![]));
    let second = parent.get_global(sym("Foo")).unwrap();
    assert_ne!(first, second);

    // In output-generation mode the same replacement is a hard error.
    OPTIONS.set_generating_output(true);
    let msg = catch_message(|| toplevel_eval(&parent, &module_expr("Foo", vec![])));
    assert!(msg.contains("cannot replace module"), "got: {}", msg);
    OPTIONS.set_generating_output(false);

    // Initializers run in definition-finished order, children first.
    INIT_ORDER.lock().unwrap().clear();
    let nested = module_expr(
        "InitOuter",
        vec![
            assign("__init__", Value::Func(outer_init)),
            module_expr("InitInner", vec![assign("__init__", Value::Func(inner_init))]),
        ],
    );
    toplevel_eval(&parent, &nested);
    assert_eq!(*INIT_ORDER.lock().unwrap(), vec!["inner", "outer"]);

    // A throwing initializer is wrapped once the base namespace exists.
    let base = Module::new(syms().base, None);
    module::set_base_module(&base);
    let failing = module_expr(
        "InitFails",
        vec![assign("__init__", Value::Func(throwing_init))],
    );
    let wrapped = try_catch(|| {
        toplevel_eval(&parent, &failing);
        None
    }, |e| Some(e.clone()));
    match wrapped {
        Some(Value::Err(err)) => match &*err {
            RtError::Init { module, inner } => {
                assert_eq!(*module, sym("InitFails"));
                assert_eq!(*inner, Value::str("kaboom"));
            }
            other => panic!("expected InitError, got {}", other),
        },
        other => panic!("expected InitError, got {:?}", other),
    }

    // Evaluation into a module that is already closed is rejected while
    // incremental output is generated.
    OPTIONS.set_incremental(true);
    OPTIONS.set_generating_output(true);
    let closed = parent.get_global(sym("Foo")).unwrap();
    let closed = closed.as_module().unwrap();
    let msg = catch_message(|| toplevel_eval_in(closed, &Value::Int(1)));
    assert!(msg.contains("closed module"), "got: {}", msg);
    // The main namespace is grandfathered in.
    assert_eq!(toplevel_eval_in(&main, &Value::Int(1)), Value::Int(1));
    OPTIONS.set_incremental(false);
    OPTIONS.set_generating_output(false);
}

fn dot_path(parts: &[&str]) -> Value {
    Expr::value(
        syms().dot,
        parts.iter().map(|p| Value::Sym(sym(p))).collect(),
    )
}

#[test]
fn import_alias_binds_only_the_alias() {
    setup();
    let lib = Module::new(sym("AliasLib"), None);
    module::register_root_module(&lib);
    lib.set_const(sym("b"), Value::Func(noop));
    let user = Module::new(sym("AliasUser"), None);

    // import AliasLib.b as c
    let imp = Expr::value(
        syms().import,
        vec![Expr::value(
            syms().r#as,
            vec![dot_path(&["AliasLib", "b"]), Value::Sym(sym("c"))],
        )],
    );
    toplevel_eval(&user, &imp);
    assert_eq!(user.get_global(sym("c")), Some(Value::Func(noop)));
    assert_eq!(user.get_global(sym("b")), None);
    assert!(user.get_own_binding(sym("c")).unwrap().is_const());

    // A macro may not be renamed to a non-macro.
    lib.set_const(sym("@m"), Value::Func(noop));
    let bad = Expr::value(
        syms().import,
        vec![Expr::value(
            syms().r#as,
            vec![dot_path(&["AliasLib", "@m"]), Value::Sym(sym("f"))],
        )],
    );
    let msg = catch_message(|| toplevel_eval(&user, &bad));
    assert!(msg.contains("cannot rename macro"), "got: {}", msg);
}

#[test]
fn selective_using_binds_single_names() {
    setup();
    let lib = Module::new(sym("SelectLib"), None);
    module::register_root_module(&lib);
    lib.set_const(sym("alpha"), Value::Int(1));
    lib.set_const(sym("beta"), Value::Int(2));
    let user = Module::new(sym("SelectUser"), None);

    // using SelectLib: alpha, beta as gamma
    let form = Expr::value(
        syms().using,
        vec![Expr::value(
            syms().colon,
            vec![
                dot_path(&["SelectLib"]),
                dot_path(&["alpha"]),
                Expr::value(
                    syms().r#as,
                    vec![dot_path(&["beta"]), Value::Sym(sym("gamma"))],
                ),
            ],
        )],
    );
    toplevel_eval(&user, &form);
    assert_eq!(user.get_global(sym("alpha")), Some(Value::Int(1)));
    assert_eq!(user.get_global(sym("gamma")), Some(Value::Int(2)));
    assert_eq!(user.get_global(sym("beta")), None);
}

#[test]
fn relative_import_paths_walk_parents() {
    setup();
    let root = Module::new(sym("RelRoot"), None);
    let childv = toplevel_eval(&root, &module_expr("RelChild", vec![]));
    let child = childv.as_module().unwrap().clone();
    root.set_const(sym("sibling_value"), Value::Int(77));

    // `import ..sibling_value` from inside the child: one leading dot is
    // the module itself, the second walks to the parent.
    let imp = Expr::value(
        syms().import,
        vec![Expr::value(
            syms().dot,
            vec![
                Value::Sym(syms().dot),
                Value::Sym(syms().dot),
                Value::Sym(sym("sibling_value")),
            ],
        )],
    );
    toplevel_eval(&child, &imp);
    assert_eq!(child.get_global(sym("sibling_value")), Some(Value::Int(77)));
}

struct LineParser;

impl Parser for LineParser {
    /// One form per non-empty line: `name=<int>` assigns a global, `boom`
    /// evaluates a throwing call. Each form is preceded by its line node.
    fn parse_all(&self, text: &str, _filename: &str) -> Value {
        let mut forms = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            forms.push(Value::LineNode(i as u32 + 1, None));
            if line == "boom" {
                forms.push(Expr::value(
                    syms().call,
                    vec![Value::Func(throw_boom)],
                ));
            } else {
                let mut split = line.splitn(2, '=');
                let name = split.next().unwrap().trim();
                let value: i64 = split.next().unwrap().trim().parse().unwrap();
                forms.push(Expr::value(
                    syms().assign,
                    vec![Value::Sym(Sym::new(name)), Value::Int(value)],
                ));
            }
        }
        Expr::value(syms().toplevel, forms)
    }
}

fn throw_boom(_args: &[Value]) -> Value {
    weft::throw(Value::str("boom"))
}

#[test]
fn include_evaluates_files_and_wraps_failures() {
    setup();
    eval::register_parser(Arc::new(LineParser));
    let m = Module::new(sym("IncludeMod"), None);

    let good = std::env::temp_dir().join("weft_include_good.txt");
    std::fs::write(&good, "a = 1\nb = 2\n").unwrap();
    let result = weft::load_file(&m, good.to_str().unwrap());
    assert_eq!(result, Value::Int(2));
    assert_eq!(m.get_global(sym("a")), Some(Value::Int(1)));
    assert_eq!(m.get_global(sym("b")), Some(Value::Int(2)));

    let bad = std::env::temp_dir().join("weft_include_bad.txt");
    std::fs::write(&bad, "a = 1\nboom\n").unwrap();
    let err = try_catch(
        || {
            weft::load_file(&m, bad.to_str().unwrap());
            None
        },
        |e| Some(e.clone()),
    );
    match err {
        Some(Value::Err(err)) => match &*err {
            RtError::Load { file, line, inner } => {
                assert!(file.ends_with("weft_include_bad.txt"));
                assert_eq!(*line, 2);
                assert_eq!(*inner, Value::str("boom"));
            }
            other => panic!("expected LoadError, got {}", other),
        },
        other => panic!("expected LoadError, got {:?}", other),
    }

    let missing = catch_message(|| weft::load_file(&m, "/nonexistent/nowhere.txt"));
    assert!(missing.contains("not found"), "got: {}", missing);
}

static REQUIRE_AGE: AtomicU64 = AtomicU64::new(0);

fn recording_require(args: &[Value]) -> Value {
    let ct = weft::current_task().unwrap();
    REQUIRE_AGE.store(ct.world_age(), Ordering::SeqCst);
    match args {
        [_, Value::Sym(name)] => match module::loaded_root_module(*name) {
            Some(m) => Value::Module(m),
            None => weft::throw(Value::error("unknown package")),
        },
        _ => weft::throw(Value::error("require expects (module, name)")),
    }
}

#[test]
fn require_uses_the_frozen_world_during_builds() {
    setup();
    let _options = option_guard();
    let base = match module::base_module() {
        Some(base) => base,
        None => {
            let base = Module::new(syms().base, None);
            module::set_base_module(&base);
            base
        }
    };
    base.set_const(syms().require, Value::Func(recording_require));

    let pkg = Module::new(sym("FrozenPkg"), None);
    module::register_root_module(&pkg);
    pkg.set_const(sym("thing"), Value::Int(5));

    world::bump_world_counter();
    world::bump_world_counter();
    let frozen = 1u64;
    REQUIRE_WORLD.store(frozen, Ordering::SeqCst);
    OPTIONS.set_incremental(true);
    OPTIONS.set_generating_output(true);

    let user = Module::new(sym("FrozenUser"), None);
    let imp = Expr::value(
        syms().import,
        vec![dot_path(&["FrozenPkg", "thing"])],
    );
    toplevel_eval(&user, &imp);
    assert_eq!(REQUIRE_AGE.load(Ordering::SeqCst), frozen);

    OPTIONS.set_incremental(false);
    OPTIONS.set_generating_output(false);
    REQUIRE_WORLD.store(u64::MAX, Ordering::SeqCst);
    assert_eq!(user.get_global(sym("thing")), Some(Value::Int(5)));
}
