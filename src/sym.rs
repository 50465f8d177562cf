use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// An interned identifier. Symbols are process-global: two `Sym`s are equal
/// iff their names are equal, so they are cheap keys for binding tables and
/// head dispatch.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Sym(u32);

struct SymTab {
    by_name: HashMap<&'static str, Sym>,
    names: Vec<&'static str>,
}

lazy_static! {
    static ref SYMTAB: Mutex<SymTab> = Mutex::new(SymTab {
        by_name: HashMap::new(),
        names: Vec::new(),
    });
}

impl Sym {
    pub fn new(name: &str) -> Sym {
        let mut tab = SYMTAB.lock().unwrap();
        if let Some(&s) = tab.by_name.get(name) {
            return s;
        }
        // Interned names live for the process lifetime.
        let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let s = Sym(tab.names.len() as u32);
        tab.names.push(name);
        tab.by_name.insert(name, s);
        s
    }

    pub fn name(self) -> &'static str {
        SYMTAB.lock().unwrap().names[self.0 as usize]
    }

    /// A macro identifier (`@`-prefixed). Import renames may not cross the
    /// macro/non-macro boundary.
    pub fn is_macro(self) -> bool {
        self.name().starts_with('@')
    }

    /// Identifiers made only of underscores are write-only.
    pub fn is_all_underscore(self) -> bool {
        let n = self.name();
        !n.is_empty() && n.bytes().all(|b| b == b'_')
    }
}

impl fmt::Debug for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name())
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Heads and special names the evaluator dispatches on, interned once.
pub struct WellKnown {
    pub module: Sym,
    pub using: Sym,
    pub import: Sym,
    pub export: Sym,
    pub public: Sym,
    pub global: Sym,
    pub r#const: Sym,
    pub toplevel: Sym,
    pub error: Sym,
    pub incomplete: Sym,
    pub thunk: Sym,
    pub dot: Sym,
    pub colon: Sym,
    pub r#as: Sym,
    pub block: Sym,
    pub call: Sym,
    pub method: Sym,
    pub copyast: Sym,
    pub cfunction: Sym,
    pub foreigncall: Sym,
    pub new_opaque_closure: Sym,
    pub meta: Sym,
    pub force_compile: Sym,
    pub r#return: Sym,
    pub assign: Sym,
    pub core: Sym,
    pub base: Sym,
    pub main: Sym,
    pub init: Sym,
    pub require: Sym,
    pub task_done_hook: Sym,
    pub getproperty: Sym,
    pub toplevel_sentinel: Sym,
}

lazy_static! {
    static ref WELL_KNOWN: WellKnown = WellKnown {
        module: Sym::new("module"),
        using: Sym::new("using"),
        import: Sym::new("import"),
        export: Sym::new("export"),
        public: Sym::new("public"),
        global: Sym::new("global"),
        r#const: Sym::new("const"),
        toplevel: Sym::new("toplevel"),
        error: Sym::new("error"),
        incomplete: Sym::new("incomplete"),
        thunk: Sym::new("thunk"),
        dot: Sym::new("."),
        colon: Sym::new(":"),
        r#as: Sym::new("as"),
        block: Sym::new("block"),
        call: Sym::new("call"),
        method: Sym::new("method"),
        copyast: Sym::new("copyast"),
        cfunction: Sym::new("cfunction"),
        foreigncall: Sym::new("foreigncall"),
        new_opaque_closure: Sym::new("new_opaque_closure"),
        meta: Sym::new("meta"),
        force_compile: Sym::new("force_compile"),
        r#return: Sym::new("return"),
        assign: Sym::new("="),
        core: Sym::new("Core"),
        base: Sym::new("Base"),
        main: Sym::new("Main"),
        init: Sym::new("__init__"),
        require: Sym::new("require"),
        task_done_hook: Sym::new("task_done_hook"),
        getproperty: Sym::new("getproperty"),
        toplevel_sentinel: Sym::new("__toplevel__"),
    };
}

pub fn syms() -> &'static WellKnown {
    &*WELL_KNOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = Sym::new("some_identifier");
        let b = Sym::new("some_identifier");
        assert_eq!(a, b);
        assert_eq!(a.name(), "some_identifier");
        assert_ne!(a, Sym::new("some_other_identifier"));
    }

    #[test]
    fn underscore_and_macro_classification() {
        assert!(Sym::new("___").is_all_underscore());
        assert!(!Sym::new("_x").is_all_underscore());
        assert!(!Sym::new("").is_all_underscore());
        assert!(Sym::new("@show").is_macro());
        assert!(!Sym::new("show").is_macro());
    }
}
