//! Module expressions, import paths, and deferred initialization.
//!
//! `module` forms create a namespace, register it in the in-progress
//! table (so it stays reachable during its own definition), evaluate the
//! body, and queue the module for initialization; initializers run in
//! definition-finished order once the outermost enclosing definition
//! completes, and not at all while ahead-of-time output is generated.
//! Import paths walk dotted components, calling the pluggable `require`
//! loader for unknown roots.

use super::{apply, eval_errorf, eval_flex, eval_global_var, parser};
use crate::exceptions::{self, try_catch};
use crate::flags::OPTIONS;
use crate::log::LogLevel::LogWarn;
use crate::module::{self, BindingFlags, Module};
use crate::sym::{syms, Sym};
use crate::task::{current_task, ptls};
use crate::value::{Expr, RtError, Value};
use crate::world::{self, WorldAgeGuard, REQUIRE_WORLD};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

struct ResolverState {
    /// Modules currently being defined, with a refcount that keeps them
    /// registered across nested definitions.
    in_progress: Vec<(Arc<Module>, usize)>,
    /// Definition-finished order, pending initialization.
    init_order: Vec<Arc<Module>>,
}

lazy_static! {
    static ref STATE: Mutex<ResolverState> = Mutex::new(ResolverState {
        in_progress: Vec::new(),
        init_order: Vec::new(),
    });
}

/// Holds the modules mutex and records it in the per-thread lock vector,
/// which must be empty at every task switch.
struct ModulesLockGuard;

impl ModulesLockGuard {
    fn enter() -> ModulesLockGuard {
        unsafe { (*ptls()).locks.push("modules_mutex") };
        ModulesLockGuard
    }
}

impl Drop for ModulesLockGuard {
    fn drop(&mut self) {
        unsafe {
            let p = &mut *ptls();
            debug_assert_eq!(p.locks.last(), Some(&"modules_mutex"));
            p.locks.pop();
        }
    }
}

fn with_modules_lock<R>(f: impl FnOnce(&mut ResolverState) -> R) -> R {
    let _guard = ModulesLockGuard::enter();
    let mut state = STATE.lock().unwrap();
    f(&mut state)
}

pub(crate) fn module_in_progress(m: &Arc<Module>) -> bool {
    with_modules_lock(|state| state.in_progress.iter().any(|(e, _)| Arc::ptr_eq(e, m)))
}

pub(crate) fn in_init_order(m: &Arc<Module>) -> bool {
    with_modules_lock(|state| state.init_order.iter().any(|e| Arc::ptr_eq(e, m)))
}

/// The `__toplevel__` sentinel: a module whose children become top
/// modules. Either the module bound under that name in the base
/// namespace, or one carrying the sentinel name itself.
pub(crate) fn is_toplevel_sentinel(m: &Arc<Module>) -> bool {
    if m.name() == syms().toplevel_sentinel {
        return true;
    }
    match module::base_module() {
        Some(base) => base
            .get_global(syms().toplevel_sentinel)
            .map(|v| v == Value::Module(m.clone()))
            .unwrap_or(false),
        None => false,
    }
}

/// Run a module's `__init__`, wrapping a failure with the module name
/// once the error types are bootstrapped.
pub fn module_run_initializer(m: &Arc<Module>) {
    let f = match m.get_global(syms().init) {
        Some(f) => f,
        None => return,
    };
    let ct = current_task().expect("module initializer requires a runtime thread");
    let name = m.name();
    try_catch(
        || {
            let _age = WorldAgeGuard::enter_latest(&ct);
            apply(&f, &[]);
        },
        |e| {
            if module::base_module().is_none() {
                // Too early for the wrapper type.
                exceptions::rethrow()
            }
            exceptions::rethrow_other(Value::Err(Arc::new(RtError::Init {
                module: name,
                inner: e.clone(),
            })))
        },
    )
}

/// `using Base` for a module defined with std imports.
pub fn add_standard_imports(m: &Arc<Module>) {
    if let Some(base) = module::base_module() {
        m.using(&base);
    }
}

/// The module's default definitions: its own `eval` and `include`.
fn add_default_defs(m: &Arc<Module>) {
    m.set_const(Sym::new("eval"), Value::Func(super::builtin_eval));
    m.set_const(Sym::new("include"), Value::Func(super::builtin_include));
}

/// Evaluate a `module` form: `(module std_imports name block)`.
pub fn eval_module_expr(parent: &Arc<Module>, ex: &Expr) -> Value {
    let ct = current_task().expect("evaluator requires an initialized runtime thread");
    debug_assert_eq!(ex.head, syms().module);
    if ex.nargs() != 3 {
        eval_errorf(parent, "syntax: malformed module expression".to_owned());
    }
    let block = match ex.args[2].as_expr() {
        Some(b) if b.head == syms().block => b.clone(),
        _ => eval_errorf(
            parent,
            "syntax: module expression third argument must be a block".to_owned(),
        ),
    };
    let std_imports = ex.args[0] == Value::Bool(true);
    let name = match ex.args[1].as_sym() {
        Some(name) => name,
        None => exceptions::throw(RtError::type_error("module", "Symbol", &ex.args[1])),
    };

    let is_parent_toplevel = is_toplevel_sentinel(parent);
    let newm = Module::new(
        name,
        if is_parent_toplevel {
            None
        } else {
            Some(parent)
        },
    );
    newm.uuid
        .store(parent.uuid.load(Ordering::Relaxed), Ordering::Relaxed);
    // Root the module for the collector while it is being defined, and
    // keep it registered across nested definitions.
    let _root = crate::gc::push_roots(vec![Value::Module(newm.clone())]);
    with_modules_lock(|state| state.in_progress.push((newm.clone(), 1)));

    let old_precompile_top = module::precompile_toplevel_module();

    if is_parent_toplevel {
        newm.set_parent_self();
        module::register_root_module(&newm);
        if OPTIONS.incremental() {
            module::set_precompile_toplevel_module(Some(newm.clone()));
        }
    } else {
        let b = parent.get_binding_wr(name);
        b.add_flags(BindingFlags::CONST);
        if let Some(old) = b.load() {
            match &old {
                Value::Module(_) => {
                    if OPTIONS.generating_output() {
                        exceptions::throw(Value::error(format!(
                            "cannot replace module {} during compilation",
                            name
                        )));
                    }
                    log!(LogWarn, "replacing module {}.", name);
                }
                _ => exceptions::throw(Value::error(format!(
                    "invalid redefinition of constant {}",
                    name
                ))),
            }
        }
        b.store(Value::Module(newm.clone()));
        crate::gc::write_barrier(&Value::Module(parent.clone()), &Value::Module(newm.clone()));
    }

    if module::main_module()
        .map(|main| Arc::ptr_eq(&main, parent))
        .unwrap_or(false)
        && name == syms().base
    {
        // Pick up the base namespace during bootstrap.
        module::set_base_module(&newm);
    }

    // First line node of the body names the module's source position.
    if let Some(Value::LineNode(line, file)) = block.args.first() {
        let p = unsafe { &mut *ptls() };
        p.lineno = *line;
        if let Some(file) = file {
            p.filename = file.name().to_owned();
        }
    }

    if std_imports {
        add_standard_imports(&newm);
        add_default_defs(&newm);
    }

    {
        let _age = WorldAgeGuard::enter_at(&ct, ct.world_age());
        for form in &block.args {
            ct.set_world_age(world::world_counter());
            let expanded = match parser() {
                Some(p) => {
                    let (filename, lineno) = super::current_location();
                    p.expand(form, &newm, &filename, lineno)
                }
                None => form.clone(),
            };
            ct.set_world_age(world::world_counter());
            eval_flex(&newm, &expanded, true, true);
        }
    }

    let to_init = with_modules_lock(|state| {
        let idx = state
            .in_progress
            .iter()
            .position(|(e, _)| Arc::ptr_eq(e, &newm))
            .expect("module missing from the in-progress table");
        state.in_progress[idx].1 -= 1;
        if state.in_progress[idx].1 == 0 {
            state.in_progress.swap_remove(idx);
        }
        state.init_order.push(newm.clone());

        // Defer initialization of children until the enclosing definition
        // finishes; at build time, defer entirely (for runtime).
        if !OPTIONS.generating_output()
            && !state
                .in_progress
                .iter()
                .any(|(e, _)| Arc::ptr_eq(e, &newm.parent()))
        {
            let (ours, rest): (Vec<_>, Vec<_>) = state
                .init_order
                .drain(..)
                .partition(|m| m.is_submodule_of(&newm));
            state.init_order = rest;
            Some(ours)
        } else {
            None
        }
    });

    if let Some(mods) = to_init {
        for m in &mods {
            module_run_initializer(m);
        }
    }

    module::set_precompile_toplevel_module(old_precompile_top);
    Value::Module(newm)
}

/// Obtain the root module `var` through the user-level loader, under a
/// world age frozen during incremental builds.
fn call_require(where_m: &Arc<Module>, var: Sym) -> Arc<Module> {
    let build_mode = OPTIONS.incremental() && OPTIONS.generating_output();
    let require_fn = module::base_module().and_then(|b| b.get_global(syms().require));
    if let Some(f) = require_fn {
        let ct = current_task().expect("require needs a runtime thread");
        let mut age = world::world_counter();
        if build_mode {
            let frozen = REQUIRE_WORLD.load(Ordering::Acquire);
            if frozen < age {
                age = frozen;
            }
        }
        let _age = WorldAgeGuard::enter_at(&ct, age);
        let loaded = apply(&f, &[Value::Module(where_m.clone()), Value::Sym(var)]);
        if let Value::Module(m) = loaded {
            return m;
        }
    } else if let Some(m) = module::loaded_root_module(var) {
        return m;
    }
    exceptions::throw(Value::error(format!("failed to load module {}", var)))
}

/// Interpret a dotted import path. Returns the resolved module, plus the
/// trailing name when the path ends in a selectable binding.
pub fn eval_import_path(
    where_m: &Arc<Module>,
    from: Option<&Arc<Module>>,
    args: &[Value],
    keyword: &str,
) -> (Arc<Module>, Option<Sym>) {
    if args.is_empty() {
        exceptions::throw(Value::error(format!(
            "malformed \"{}\" statement",
            keyword
        )));
    }
    let sym_at = |v: &Value| -> Sym {
        match v.as_sym() {
            Some(s) => s,
            None => exceptions::throw(RtError::type_error(keyword, "Symbol", v)),
        }
    };
    let dot = syms().dot;
    let mut var = sym_at(&args[0]);
    let mut i = 1usize;
    let mut m: Arc<Module>;

    if let Some(from) = from {
        m = from.clone();
        i = 0;
    } else if var != dot {
        // `A.B`: the first component is a root in the current environment.
        m = if module::core_module().map(|c| c.name() == var).unwrap_or(false) {
            module::core_module().unwrap()
        } else if module::base_module().map(|b| b.name() == var).unwrap_or(false) {
            module::base_module().unwrap()
        } else {
            call_require(where_m, var)
        };
        if i == args.len() {
            return (m, None);
        }
    } else {
        // `.A.B.C`: strip leading dots by following parent links.
        m = where_m.clone();
        loop {
            if i >= args.len() {
                exceptions::throw(Value::error("invalid module path"));
            }
            var = sym_at(&args[i]);
            if var != dot {
                break;
            }
            i += 1;
            m = m.parent();
        }
    }

    loop {
        var = sym_at(&args[i]);
        if var == dot {
            exceptions::throw(Value::error(format!(
                "invalid {} path: \".\" in identifier path",
                keyword
            )));
        }
        if i == args.len() - 1 {
            break;
        }
        let next = eval_global_var(&m, var);
        m = match next.as_module() {
            Some(next) => next.clone(),
            None => exceptions::throw(Value::error(format!(
                "invalid {} path: \"{}\" does not name a module",
                keyword, var
            ))),
        };
        i += 1;
    }
    (m, Some(var))
}

/// In `import A.B: x, y`, evaluate the `A.B` part if present.
fn eval_import_from(m: &Arc<Module>, ex: &Expr, keyword: &str) -> Option<Arc<Module>> {
    if ex.nargs() != 1 {
        return None;
    }
    let fr = ex.args[0].as_expr()?;
    if fr.head != syms().colon {
        return None;
    }
    if let Some(path) = fr.args.first().and_then(Value::as_expr) {
        if path.head == syms().dot {
            let (from, name) = eval_import_path(m, None, &path.args, keyword);
            let from = match name {
                Some(name) => {
                    let v = eval_global_var(&from, name);
                    match v.as_module() {
                        Some(from) => from.clone(),
                        None => exceptions::throw(Value::error(format!(
                            "invalid {} path: \"{}\" does not name a module",
                            keyword, name
                        ))),
                    }
                }
                None => from,
            };
            return Some(from);
        }
    }
    exceptions::throw(Value::error(format!(
        "malformed \"{}:\" statement",
        keyword
    )))
}

/// An `@`-prefix may not appear on only one side of an `as` rename.
fn check_macro_rename(from: Sym, to: Sym, keyword: &str) {
    if from.is_macro() && !to.is_macro() {
        exceptions::throw(Value::error(format!(
            "cannot rename macro \"{}\" to non-macro \"{}\" in \"{}\"",
            from, to, keyword
        )));
    }
    if !from.is_macro() && to.is_macro() {
        exceptions::throw(Value::error(format!(
            "cannot rename non-macro \"{}\" to macro \"{}\" in \"{}\"",
            from, to, keyword
        )));
    }
}

/// Bind module `import` itself as a constant in `m`, optionally renamed.
fn import_module(m: &Arc<Module>, import: &Arc<Module>, asname: Option<Sym>) {
    let name = asname.unwrap_or_else(|| import.name());
    if let Some(b) = m.get_own_binding(name) {
        let owner = b.owner();
        if owner.is_const() && owner.load() == Some(Value::Module(import.clone())) {
            return;
        }
        if !Arc::ptr_eq(&owner, &b) || (b.is_const() && b.load().is_some()) {
            exceptions::throw(Value::error(format!(
                "importing {} into {} conflicts with an existing global",
                name,
                m.name()
            )));
        }
    }
    let b = m.get_binding_wr(name);
    b.add_flags(BindingFlags::CONST | BindingFlags::IMPORTED);
    b.store(Value::Module(import.clone()));
}

fn malformed(m: &Arc<Module>, keyword: &str) -> ! {
    eval_errorf(m, format!("syntax: malformed \"{}\" statement", keyword))
}

/// `(as (. path...) alias)` → (path expr, alias), if this is such a form.
fn as_clause(a: &Value) -> Option<(Arc<Expr>, Sym)> {
    let e = a.as_expr()?;
    if e.head != syms().r#as || e.nargs() != 2 {
        return None;
    }
    let path = e.args[0].as_expr()?;
    if path.head != syms().dot {
        return None;
    }
    let asname = e.args[1].as_sym()?;
    Some((path.clone(), asname))
}

/// Evaluate a `using` form, covering whole-module use, selective use, and
/// alias use.
pub fn eval_using(m: &Arc<Module>, ex: &Expr) {
    let from = eval_import_from(m, ex, "using");
    let inner;
    let args: &[Value] = if from.is_some() {
        inner = ex.args[0].as_expr().expect("validated by eval_import_from").clone();
        &inner.args[1..]
    } else {
        &ex.args
    };
    for a in args {
        if let Some(path) = a.as_expr().filter(|e| e.head == syms().dot) {
            let (import, name) = eval_import_path(m, from.as_ref(), &path.args, "using");
            if from.is_some() {
                // `using A: b` and `using A: b.c` syntax.
                let name = name.expect("selective use without a name");
                if let Err(e) = m.import_from(&import, name, name, false) {
                    exceptions::throw(e);
                }
            } else {
                let u = match name {
                    Some(name) => {
                        let v = eval_global_var(&import, name);
                        match v.as_module() {
                            Some(u) => u.clone(),
                            None => eval_errorf(
                                m,
                                format!(
                                    "invalid using path: \"{}\" does not name a module",
                                    name
                                ),
                            ),
                        }
                    }
                    None => import,
                };
                // `using A` and `using A.B` syntax.
                m.using(&u);
                let is_main = module::main_module()
                    .map(|main| Arc::ptr_eq(&main, m))
                    .unwrap_or(false);
                if is_main && name.is_none() {
                    // `using A` in the main namespace also creates an
                    // explicit binding for `A`.
                    import_module(m, &u, None);
                }
            }
            continue;
        }
        if from.is_some() {
            if let Some((path, asname)) = as_clause(a) {
                let (import, name) = eval_import_path(m, from.as_ref(), &path.args, "using");
                let name = name.expect("selective use without a name");
                check_macro_rename(name, asname, "using");
                // `using A: b as c` syntax.
                if let Err(e) = m.import_from(&import, name, asname, false) {
                    exceptions::throw(e);
                }
                continue;
            }
        }
        malformed(m, "using");
    }
}

/// Evaluate an `import` form, covering module binds, selective imports,
/// and `as` renames.
pub fn eval_import(m: &Arc<Module>, ex: &Expr) {
    let from = eval_import_from(m, ex, "import");
    let inner;
    let args: &[Value] = if from.is_some() {
        inner = ex.args[0].as_expr().expect("validated by eval_import_from").clone();
        &inner.args[1..]
    } else {
        &ex.args
    };
    for a in args {
        if let Some(path) = a.as_expr().filter(|e| e.head == syms().dot) {
            let (import, name) = eval_import_path(m, from.as_ref(), &path.args, "import");
            match name {
                // `import A` syntax.
                None => import_module(m, &import, None),
                // `import A.B` or `import A: b` syntax.
                Some(name) => {
                    if let Some(sub) = import.get_global(name).as_ref().and_then(Value::as_module) {
                        import_module(m, sub, Some(name));
                    } else if let Err(e) = m.import_from(&import, name, name, true) {
                        exceptions::throw(e);
                    }
                }
            }
            continue;
        }
        if let Some((path, asname)) = as_clause(a) {
            let (import, name) = eval_import_path(m, from.as_ref(), &path.args, "import");
            match name {
                // `import A as B` syntax.
                None => import_module(m, &import, Some(asname)),
                // `import A.B as C` or `import A: b as c` syntax.
                Some(name) => {
                    check_macro_rename(name, asname, "import");
                    if let Some(sub) = import.get_global(name).as_ref().and_then(Value::as_module) {
                        import_module(m, sub, Some(asname));
                    } else if let Err(e) = m.import_from(&import, name, asname, true) {
                        exceptions::throw(e);
                    }
                }
            }
            continue;
        }
        malformed(m, "import");
    }
}
