use std::env;
use std::io::Write;
use std::sync::Mutex;

/// Global logging level, configured once from `WEFT_LOG` (fatal, error,
/// warn, info, debug). Defaults to warn.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal = 0,
    LogError = 1,
    LogWarn = 2,
    LogInfo = 3,
    LogDebug = 4,
}

pub struct LogGlobals {
    level: LogLevel,
    // Serializes multi-line messages from concurrently running threads.
    pub sink: Mutex<()>,
}

lazy_static! {
    pub static ref LOG_GLOBALS: LogGlobals = init_log_globals();
}

fn init_log_globals() -> LogGlobals {
    let level = match env::var("WEFT_LOG").ok().as_deref() {
        Some("fatal") => LogLevel::LogFatal,
        Some("error") => LogLevel::LogError,
        Some("warn") | None => LogLevel::LogWarn,
        Some("info") => LogLevel::LogInfo,
        Some("debug") => LogLevel::LogDebug,
        Some(other) => {
            eprintln!("[weft] unknown WEFT_LOG level `{}`, using warn", other);
            LogLevel::LogWarn
        }
    };
    LogGlobals {
        level,
        sink: Mutex::new(()),
    }
}

pub fn log_enabled(level: LogLevel) -> bool {
    level <= LOG_GLOBALS.level
}

pub fn write_log(level: LogLevel, module: &str, args: std::fmt::Arguments) {
    let tag = match level {
        LogLevel::LogFatal => "FATAL",
        LogLevel::LogError => "ERROR",
        LogLevel::LogWarn => "WARN",
        LogLevel::LogInfo => "INFO",
        LogLevel::LogDebug => "DEBUG",
    };
    let _guard = LOG_GLOBALS.sink.lock();
    let stderr = std::io::stderr();
    let mut err = stderr.lock();
    // Ignore write errors; there is nowhere left to report them.
    let _ = writeln!(err, "[{} {}] {}", tag, module, args);
}

macro_rules! log {
    ($lvl:expr, $($arg:tt)*) => {{
        let lvl: crate::log::LogLevel = $lvl;
        if crate::log::log_enabled(lvl) {
            crate::log::write_log(lvl, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Unrecoverable runtime state (§7 kind 8): write a short message to stderr
/// and abort without running user-level handlers.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        crate::log::write_log(
            crate::log::LogLevel::LogFatal,
            module_path!(),
            format_args!($($arg)*),
        );
        std::process::abort();
    }};
}
