//! Hand-rolled logging, matching the teacher's `log_info`/`log_debug` shape
//! (`src/main.rs`) rather than pulling in a tracing/log facade: a UTC
//! timestamp, an optional thread-local "current session" tag, and a
//! `RUST_LOG=debug` gate on the verbose macro.

use chrono::Utc;
use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::LazyLock;

thread_local! {
    static CURRENT_SESSION_ADDR: Cell<Option<SocketAddr>> = const { Cell::new(None) };
    static CURRENT_SESSION_ID: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Tags the current thread with a session for the duration of `f`, so any
/// `info!`/`debug!` call made inside carries `[session=.. addr=..]`.
pub fn with_session_tag<R>(session_id: u32, addr: SocketAddr, f: impl FnOnce() -> R) -> R {
    CURRENT_SESSION_ADDR.set(Some(addr));
    CURRENT_SESSION_ID.set(Some(session_id));
    let result = f();
    CURRENT_SESSION_ADDR.set(None);
    CURRENT_SESSION_ID.set(None);
    result
}

pub fn current_session_addr() -> Option<String> {
    CURRENT_SESSION_ADDR.get().map(|addr| addr.to_string())
}

pub fn current_session_id() -> Option<String> {
    CURRENT_SESSION_ID.get().map(|id| id.to_string())
}

pub fn log_info(message: &str) {
    let session = CURRENT_SESSION_ID.get().map(|id| format!(" [session={id}]")).unwrap_or_default();
    let addr = CURRENT_SESSION_ADDR.get().map(|addr| format!(" [addr={addr}]")).unwrap_or_default();
    println!("{}{session}{addr}\t{message}", Utc::now().to_rfc3339());
}

static DEBUG_ENABLED: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("RUST_LOG").map(|value| value.to_lowercase() == "debug").unwrap_or_default()
});

pub fn log_debug(message: &str) {
    if *DEBUG_ENABLED {
        log_info(message);
    }
}

#[macro_export]
macro_rules! info {
    () => {
        $crate::logging::log_info("");
    };
    ($($arg:tt)*) => {{
        $crate::logging::log_info(&format!($($arg)*))
    }};
}

#[macro_export]
macro_rules! debug {
    () => {
        $crate::logging::log_debug("");
    };
    ($($arg:tt)*) => {{
        $crate::logging::log_debug(&format!($($arg)*))
    }};
}
