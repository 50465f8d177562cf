//! Modules and bindings.
//!
//! A module is a namespace: a map of symbol to binding plus the list of
//! modules it is `using`. A binding either owns its value or defers to the
//! binding it was imported from; the owner back-pointer is what gives a
//! name an identity across modules. Bindings hold weak owner references,
//! so module cycles (a module naming its parent, mutual imports) do not
//! keep each other alive.

use crate::sym::{syms, Sym};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

bitflags! {
    pub struct BindingFlags: u8 {
        const CONST    = 0b0001;
        const EXPORTED = 0b0010;
        const PUBLIC   = 0b0100;
        const IMPORTED = 0b1000;
    }
}

pub type BindingRef = Arc<Binding>;

pub struct Binding {
    pub name: Sym,
    value: Mutex<Option<Value>>,
    /// Declared type, when a `global` declaration set one.
    declared_ty: Mutex<Option<Value>>,
    flags: Mutex<BindingFlags>,
    /// The binding that owns the value; `None` means self-owned.
    owner: Mutex<Option<Weak<Binding>>>,
    weak_self: Mutex<Weak<Binding>>,
}

impl Binding {
    fn new(name: Sym) -> BindingRef {
        let b = Arc::new(Binding {
            name,
            value: Mutex::new(None),
            declared_ty: Mutex::new(None),
            flags: Mutex::new(BindingFlags::empty()),
            owner: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *b.weak_self.lock().unwrap() = Arc::downgrade(&b);
        b
    }

    /// The binding this one resolves through: the origin of an import, or
    /// itself.
    pub fn owner(&self) -> BindingRef {
        let owner = self.owner.lock().unwrap();
        match owner.as_ref().and_then(Weak::upgrade) {
            Some(origin) => origin,
            None => self
                .weak_self
                .lock()
                .unwrap()
                .upgrade()
                .expect("binding outlived its own Arc"),
        }
    }

    fn set_owner(&self, origin: &BindingRef) {
        *self.owner.lock().unwrap() = Some(Arc::downgrade(origin));
    }

    pub fn load(&self) -> Option<Value> {
        self.owner().value.lock().unwrap().clone()
    }

    pub fn store(&self, v: Value) {
        *self.value.lock().unwrap() = Some(v);
    }

    pub fn flags(&self) -> BindingFlags {
        *self.flags.lock().unwrap()
    }

    pub fn add_flags(&self, f: BindingFlags) {
        *self.flags.lock().unwrap() |= f;
    }

    pub fn is_const(&self) -> bool {
        self.flags().contains(BindingFlags::CONST)
    }

    pub fn declare_type_any(&self) {
        let mut ty = self.declared_ty.lock().unwrap();
        if ty.is_none() {
            *ty = Some(Value::Sym(Sym::new("Any")));
        }
    }

    pub fn declared_type(&self) -> Option<Value> {
        self.declared_ty.lock().unwrap().clone()
    }
}

static MODULE_SERIAL: AtomicU64 = AtomicU64::new(1);

pub struct Module {
    name: Sym,
    /// Parent module; a top module is its own parent.
    parent: RwLock<Weak<Module>>,
    pub uuid: AtomicU64,
    istopmod: AtomicBool,
    bindings: RwLock<HashMap<Sym, BindingRef>>,
    usings: RwLock<Vec<Arc<Module>>>,
    /// Module-local compile/infer overrides; -1 inherits the process-wide
    /// setting.
    compile: AtomicI8,
    infer: AtomicI8,
    weak_self: RwLock<Weak<Module>>,
}

impl Module {
    /// Create a module. With no parent the module is its own parent (a
    /// top module candidate).
    pub fn new(name: Sym, parent: Option<&Arc<Module>>) -> Arc<Module> {
        let uuid = match parent {
            Some(p) => p.uuid.load(Ordering::Relaxed),
            None => MODULE_SERIAL.fetch_add(1, Ordering::Relaxed),
        };
        let m = Arc::new(Module {
            name,
            parent: RwLock::new(Weak::new()),
            uuid: AtomicU64::new(uuid),
            istopmod: AtomicBool::new(false),
            bindings: RwLock::new(HashMap::new()),
            usings: RwLock::new(Vec::new()),
            compile: AtomicI8::new(-1),
            infer: AtomicI8::new(-1),
            weak_self: RwLock::new(Weak::new()),
        });
        let weak = Arc::downgrade(&m);
        *m.weak_self.write().unwrap() = weak.clone();
        *m.parent.write().unwrap() = match parent {
            Some(p) => Arc::downgrade(p),
            None => weak,
        };
        m
    }

    pub fn name(&self) -> Sym {
        self.name
    }

    pub fn self_ref(&self) -> Arc<Module> {
        self.weak_self
            .read()
            .unwrap()
            .upgrade()
            .expect("module outlived its own Arc")
    }

    pub fn parent(&self) -> Arc<Module> {
        self.parent
            .read()
            .unwrap()
            .upgrade()
            .expect("parent module dropped while child is alive")
    }

    pub(crate) fn set_parent_self(&self) {
        let weak = self.weak_self.read().unwrap().clone();
        *self.parent.write().unwrap() = weak;
    }

    pub fn is_own_parent(&self) -> bool {
        let this = self.self_ref();
        Arc::ptr_eq(&this, &this.parent())
    }

    pub fn istopmod(&self) -> bool {
        self.istopmod.load(Ordering::Acquire)
    }

    pub fn set_istopmod(&self) {
        self.istopmod.store(true, Ordering::Release);
    }

    pub fn compile_setting(&self) -> crate::flags::CompileMode {
        match self.compile.load(Ordering::Relaxed) {
            -1 => crate::flags::CompileMode::On,
            0 => crate::flags::CompileMode::Off,
            1 => crate::flags::CompileMode::Min,
            _ => crate::flags::CompileMode::On,
        }
    }

    pub fn set_compile_setting(&self, v: i8) {
        self.compile.store(v, Ordering::Relaxed);
    }

    /// Non-zero (the default) lets top-level thunks be inferred.
    pub fn infer_setting(&self) -> i8 {
        match self.infer.load(Ordering::Relaxed) {
            -1 => 1,
            v => v,
        }
    }

    pub fn set_infer_setting(&self, v: i8) {
        self.infer.store(v, Ordering::Relaxed);
    }

    /// The binding named `s` in this module's own table, if any.
    pub fn get_own_binding(&self, s: Sym) -> Option<BindingRef> {
        self.bindings.read().unwrap().get(&s).cloned()
    }

    /// Writable binding for `s`, created on demand.
    pub fn get_binding_wr(&self, s: Sym) -> BindingRef {
        if let Some(b) = self.get_own_binding(s) {
            return b;
        }
        let mut table = self.bindings.write().unwrap();
        table.entry(s).or_insert_with(|| Binding::new(s)).clone()
    }

    /// Resolve `s` for reading: the module's own binding, else an exported
    /// binding of a module it is `using`.
    pub fn resolve_binding(&self, s: Sym) -> Option<BindingRef> {
        if let Some(b) = self.get_own_binding(s) {
            if b.load().is_some() || b.flags().contains(BindingFlags::IMPORTED) {
                return Some(b);
            }
        }
        for used in self.usings.read().unwrap().iter() {
            if let Some(b) = used.get_own_binding(s) {
                if b.flags().contains(BindingFlags::EXPORTED) && b.load().is_some() {
                    return Some(b);
                }
            }
        }
        None
    }

    pub fn binding_resolved(&self, s: Sym) -> bool {
        self.resolve_binding(s).is_some()
    }

    pub fn get_global(&self, s: Sym) -> Option<Value> {
        self.resolve_binding(s).and_then(|b| b.load())
    }

    /// Assign a global, respecting constness.
    pub fn set_global(&self, s: Sym, v: Value) -> Result<(), Value> {
        let b = self.get_binding_wr(s);
        if b.is_const() && b.load().is_some() {
            return Err(Value::error(format!(
                "invalid redefinition of constant {}",
                s
            )));
        }
        b.store(v);
        Ok(())
    }

    /// Create (or overwrite) a constant binding.
    pub fn set_const(&self, s: Sym, v: Value) {
        let b = self.get_binding_wr(s);
        b.add_flags(BindingFlags::CONST);
        b.store(v);
    }

    pub fn declare_constant(&self, s: Sym) -> BindingRef {
        let b = self.get_binding_wr(s);
        b.add_flags(BindingFlags::CONST);
        b
    }

    /// `using other`: make the whole module's exports visible here.
    pub fn using(&self, other: &Arc<Module>) {
        let mut usings = self.usings.write().unwrap();
        if !usings.iter().any(|u| Arc::ptr_eq(u, other)) {
            usings.push(other.clone());
        }
    }

    /// Mark `s` exported or public.
    pub fn set_public(&self, s: Sym, exported: bool) {
        let b = self.get_binding_wr(s);
        b.add_flags(if exported {
            BindingFlags::EXPORTED
        } else {
            BindingFlags::PUBLIC
        });
    }

    /// Bind `name` from `from` into this module under `asname`.
    /// `constant` distinguishes `import` (constant) from `using A: x`.
    pub fn import_from(
        &self,
        from: &Arc<Module>,
        name: Sym,
        asname: Sym,
        constant: bool,
    ) -> Result<(), Value> {
        let origin = from.resolve_binding(name).ok_or_else(|| {
            Value::error(format!(
                "could not import {}.{}: it is not defined",
                from.name(),
                name
            ))
        })?;
        let origin = origin.owner();
        if let Some(existing) = self.get_own_binding(asname) {
            let existing_owner = existing.owner();
            if Arc::ptr_eq(&existing_owner, &origin) {
                return Ok(());
            }
            if existing.load().is_some() {
                return Err(Value::error(format!(
                    "importing {} into {} conflicts with an existing global",
                    asname,
                    self.name()
                )));
            }
            existing.set_owner(&origin);
            let mut flags = BindingFlags::IMPORTED;
            if constant {
                flags |= BindingFlags::CONST;
            }
            existing.add_flags(flags);
            return Ok(());
        }
        let b = self.get_binding_wr(asname);
        b.set_owner(&origin);
        let mut flags = BindingFlags::IMPORTED;
        if constant {
            flags |= BindingFlags::CONST;
        }
        b.add_flags(flags);
        Ok(())
    }

    /// Walk `self` and its parents looking for `of`.
    pub fn is_submodule_of(&self, of: &Arc<Module>) -> bool {
        let mut m = self.self_ref();
        loop {
            if Arc::ptr_eq(&m, of) {
                return true;
            }
            let parent = m.parent();
            if Arc::ptr_eq(&m, &parent) {
                return false;
            }
            m = parent;
        }
    }
}

/// Process-wide module globals, initialized once under a single lock.
struct ModuleGlobals {
    main: Option<Arc<Module>>,
    base: Option<Arc<Module>>,
    core: Option<Arc<Module>>,
    top: Option<Arc<Module>>,
    /// During incremental compilation, the top module being defined.
    precompile_toplevel: Option<Arc<Module>>,
    root_modules: HashMap<Sym, Arc<Module>>,
}

lazy_static! {
    static ref MODULE_GLOBALS: RwLock<ModuleGlobals> = RwLock::new(ModuleGlobals {
        main: None,
        base: None,
        core: None,
        top: None,
        precompile_toplevel: None,
        root_modules: HashMap::new(),
    });
}

pub fn main_module() -> Option<Arc<Module>> {
    MODULE_GLOBALS.read().unwrap().main.clone()
}

pub fn base_module() -> Option<Arc<Module>> {
    MODULE_GLOBALS.read().unwrap().base.clone()
}

pub fn core_module() -> Option<Arc<Module>> {
    MODULE_GLOBALS.read().unwrap().core.clone()
}

pub fn top_module() -> Option<Arc<Module>> {
    MODULE_GLOBALS.read().unwrap().top.clone()
}

pub fn set_base_module(m: &Arc<Module>) {
    let mut g = MODULE_GLOBALS.write().unwrap();
    m.set_istopmod();
    g.base = Some(m.clone());
    if g.top.is_none() {
        g.top = Some(m.clone());
    }
}

pub fn precompile_toplevel_module() -> Option<Arc<Module>> {
    MODULE_GLOBALS.read().unwrap().precompile_toplevel.clone()
}

pub fn set_precompile_toplevel_module(m: Option<Arc<Module>>) {
    MODULE_GLOBALS.write().unwrap().precompile_toplevel = m;
}

pub fn register_root_module(m: &Arc<Module>) {
    MODULE_GLOBALS
        .write()
        .unwrap()
        .root_modules
        .insert(m.name(), m.clone());
}

pub fn loaded_root_module(name: Sym) -> Option<Arc<Module>> {
    MODULE_GLOBALS.read().unwrap().root_modules.get(&name).cloned()
}

/// One-time creation of the `Core` and `Main` modules and their mutual
/// constants. Idempotent.
pub fn init_main_module() -> Arc<Module> {
    {
        let g = MODULE_GLOBALS.read().unwrap();
        if let Some(main) = &g.main {
            return main.clone();
        }
    }
    let mut g = MODULE_GLOBALS.write().unwrap();
    if let Some(main) = &g.main {
        return main.clone();
    }
    let core = Module::new(syms().core, None);
    core.set_istopmod();
    let main = Module::new(syms().main, None);
    main.set_const(syms().core, Value::Module(core.clone()));
    core.set_const(syms().main, Value::Module(main.clone()));
    g.core = Some(core.clone());
    g.top = Some(core.clone());
    g.main = Some(main.clone());
    g.root_modules.insert(core.name(), core);
    g.root_modules.insert(main.name(), main.clone());
    main
}

/// The module `(top ...)` references resolve against from within `m`:
/// the nearest parent flagged as a top module, else the process top.
pub fn base_relative_to(m: &Arc<Module>) -> Option<Arc<Module>> {
    let mut m = m.clone();
    loop {
        if m.istopmod() {
            return Some(m);
        }
        let parent = m.parent();
        if Arc::ptr_eq(&m, &parent) {
            break;
        }
        m = parent;
    }
    top_module()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_reject_redefinition() {
        let m = Module::new(Sym::new("ConstTestMod"), None);
        m.set_const(Sym::new("x"), Value::Int(1));
        assert!(m.set_global(Sym::new("x"), Value::Int(2)).is_err());
        assert_eq!(m.get_global(Sym::new("x")), Some(Value::Int(1)));
    }

    #[test]
    fn using_exposes_only_exported_names() {
        let lib = Module::new(Sym::new("UsingTestLib"), None);
        lib.set_const(Sym::new("visible"), Value::Int(7));
        lib.set_public(Sym::new("visible"), true);
        lib.set_const(Sym::new("hidden"), Value::Int(8));

        let user = Module::new(Sym::new("UsingTestUser"), None);
        user.using(&lib);
        assert_eq!(user.get_global(Sym::new("visible")), Some(Value::Int(7)));
        assert_eq!(user.get_global(Sym::new("hidden")), None);
    }

    #[test]
    fn imported_bindings_share_identity_with_their_origin() {
        let lib = Module::new(Sym::new("ImportTestLib"), None);
        lib.set_const(Sym::new("f"), Value::Int(3));
        let user = Module::new(Sym::new("ImportTestUser"), None);
        user.import_from(&lib, Sym::new("f"), Sym::new("g"), true)
            .unwrap();

        let origin = lib.get_own_binding(Sym::new("f")).unwrap().owner();
        let imported = user.get_own_binding(Sym::new("g")).unwrap().owner();
        assert!(Arc::ptr_eq(&origin, &imported));
        assert_eq!(user.get_global(Sym::new("g")), Some(Value::Int(3)));
        // The original name is not bound.
        assert_eq!(user.get_global(Sym::new("f")), None);
    }
}
