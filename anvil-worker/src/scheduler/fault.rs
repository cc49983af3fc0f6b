//! Panic capture for the per-build fault boundary
//!
//! The panic hook runs on the panicking thread, so it is the only place the
//! real backtrace is available. It is parked here until the dispatcher picks
//! it up along with the panic payload.

use std::any::Any;
use std::backtrace::Backtrace;
use std::sync::{Mutex, OnceLock};
use tracing::error;

use crate::sync::lock;

static LAST_BACKTRACE: OnceLock<Mutex<Option<String>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<String>> {
    LAST_BACKTRACE.get_or_init(|| Mutex::new(None))
}

/// Installs a panic hook that logs the panic and keeps its backtrace
pub fn install_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture().to_string();
        error!("Panic: {}", info);
        *lock(slot()) = Some(backtrace);
    }));
}

/// Backtrace of the most recent panic, if the hook captured one
pub fn take_backtrace() -> String {
    lock(slot())
        .take()
        .unwrap_or_else(|| "no backtrace captured".to_string())
}

/// Human readable panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_from_payloads() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");

        let owned: Box<dyn Any + Send> = Box::new(String::from("index 3 out of range"));
        assert_eq!(panic_message(owned.as_ref()), "index 3 out of range");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
