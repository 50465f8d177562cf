use std::env;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Whether the code generator may be used for top-level thunks. `Off` and
/// `Min` both veto compilation; `All` additionally asks the embedder to
/// compile everything it can.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum CompileMode {
    Off = 0,
    Min = 1,
    On = 2,
    All = 3,
}

impl CompileMode {
    fn from_u8(v: u8) -> CompileMode {
        match v {
            0 => CompileMode::Off,
            1 => CompileMode::Min,
            3 => CompileMode::All,
            _ => CompileMode::On,
        }
    }

    pub fn permits_compilation(self) -> bool {
        self != CompileMode::Off && self != CompileMode::Min
    }
}

/// Process-wide, environment-derived configuration. Immutable after first
/// use.
#[derive(Clone)]
pub struct Flags {
    /// New tasks default to copy-stack mode instead of a dedicated stack.
    /// Set from `WEFT_COPY_STACKS`; `1`/`yes` enables, `0`/`no` disables,
    /// anything else is fatal at startup.
    pub always_copy_stacks: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

fn init_flags() -> Flags {
    let always_copy_stacks = match env::var("WEFT_COPY_STACKS").ok().as_deref() {
        Some("1") | Some("yes") => true,
        Some("0") | Some("no") | None => false,
        Some(other) => {
            fatal!("invalid WEFT_COPY_STACKS value: {}", other);
        }
    };
    Flags { always_copy_stacks }
}

/// Embedder-mutable evaluator options. Unlike `Flags` these may change at
/// runtime (the driver toggles output generation around a precompile run).
pub struct Options {
    compile_enabled: AtomicU8,
    /// Incremental (pre)compilation is in progress.
    incremental: AtomicBool,
    /// Ahead-of-time output is being generated; module initializers are
    /// deferred and module replacement is an error.
    generating_output: AtomicBool,
}

pub static OPTIONS: Options = Options {
    compile_enabled: AtomicU8::new(CompileMode::On as u8),
    incremental: AtomicBool::new(false),
    generating_output: AtomicBool::new(false),
};

impl Options {
    pub fn compile_enabled(&self) -> CompileMode {
        CompileMode::from_u8(self.compile_enabled.load(Ordering::Relaxed))
    }

    pub fn set_compile_enabled(&self, mode: CompileMode) {
        self.compile_enabled.store(mode as u8, Ordering::Relaxed);
    }

    pub fn incremental(&self) -> bool {
        self.incremental.load(Ordering::Relaxed)
    }

    pub fn set_incremental(&self, v: bool) {
        self.incremental.store(v, Ordering::Relaxed);
    }

    pub fn generating_output(&self) -> bool {
        self.generating_output.load(Ordering::Relaxed)
    }

    pub fn set_generating_output(&self, v: bool) {
        self.generating_output.store(v, Ordering::Relaxed);
    }
}
