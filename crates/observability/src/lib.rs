//! Tracing/logging setup shared by the sokrates binaries.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Human-readable logs on stderr, for interactive commands.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Pretty);
}

/// JSON logs on stdout, for the detached daemon (stdout is its log file).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init_json() {
    tracing::init(LogFormat::Json);
}
