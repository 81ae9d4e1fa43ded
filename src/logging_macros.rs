#![warn(clippy::all, rust_2018_idioms)]

/// Enhanced unified logging macros with file, function, and line context
/// This ensures consistency across the codebase and makes debugging much easier
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        log::trace!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
        tracing::trace!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        log::debug!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
        tracing::debug!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        log::info!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
        tracing::info!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        log::warn!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
        tracing::warn!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        log::error!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
        tracing::error!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

/// Enhanced tracing macros with context (for when you only want tracing, not log+tracing)
/// These provide the same context enhancement but only for the tracing system
#[macro_export]
macro_rules! trace_trace {
    ($($arg:tt)*) => {
        tracing::trace!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_debug {
    ($($arg:tt)*) => {
        tracing::debug!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_info {
    ($($arg:tt)*) => {
        tracing::info!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_warn {
    ($($arg:tt)*) => {
        tracing::warn!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_error {
    ($($arg:tt)*) => {
        tracing::error!("[{}:{}:{}] {}", file!(), module_path!(), line!(), format!($($arg)*));
    };
}

/*
Enhanced Logging System:

ENHANCED MACROS (with file:module:line context):
- log_trace!, log_debug!, log_info!, log_warn!, log_error! - Write to both log and tracing
- trace_trace!, trace_debug!, trace_info!, trace_warn!, trace_error! - Write only to tracing

All enhanced macros automatically include [file:module:line] context for easy debugging.

ANTI-FLOODING GUIDELINES:
- NEVER use trace/debug logging inside a worker's per-account hot loop or the
  retry governor's backoff loop
- Prefer higher log levels (warn/error) for operational messages that a
  human running the CLI actually needs to see

USAGE:
- Use log_* macros for important messages that should go to both systems
- Use trace_* macros for debugging information that only needs tracing

EXAMPLE:
```rust
// OLD (no context):
tracing::warn!("reducing concurrency after throttling");
// Output: reducing concurrency after throttling

// NEW (with context):
log_warn!("reducing concurrency after throttling");
// Output: [src/executor.rs:awsideman::executor:126] reducing concurrency after throttling
```

Log level guidelines for consistent usage across the codebase:

TRACE: Method-level implementation details, individual item processing
- Per-account request/response details
- Cache key derivation, backoff delay computation

DEBUG: Operation progress, state transitions, cache operations
- Cache hit/miss logs
- Snapshot rebuild steps
- Method entry/exit logs

INFO: Operation completions, important milestones
- Operation started/finished summaries
- Snapshot cache hits/rebuilds
- Concurrency adjustments

WARN: Recoverable issues, fallbacks, performance concerns
- Cache errors demoted to warnings
- Retry/backoff events
- State mismatches during rollback validation

ERROR: Unrecoverable errors, failed operations, data corruption
- Failed AWS API calls that affect functionality
- File I/O failures that prevent journal writes
- JSON parsing failures for critical data
*/
