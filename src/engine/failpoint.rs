//! SHALE - Failpoints
//! Named, thread-local fault injection points used by crash tests.
//! Points can also be switched on process-wide with `SHALE_FAILPOINTS=a,b`.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

/// Fails a commit after the pages are flushed and before the meta write.
pub const COMMIT_BEFORE_META: &str = "commit::before_meta";

/// Fails a commit before any page is written.
pub const COMMIT_BEFORE_PAGES: &str = "commit::before_pages";

/// Fails a commit after the meta page is written and before it is synced.
pub const COMMIT_AFTER_META: &str = "commit::after_meta";

/// Fails the rewrite of the committed meta after a failed commit.
pub const COMMIT_RESTORE_META: &str = "commit::restore_meta";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| set.borrow_mut().clear());
}

pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }
    std::env::var("SHALE_FAILPOINTS")
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

/// Return an I/O error when `name` is enabled.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable() {
        assert!(maybe_fail("test::point").is_ok());
        enable("test::point");
        assert!(maybe_fail("test::point").is_err());
        disable("test::point");
        assert!(!is_enabled("test::point"));

        enable("test::a");
        enable("test::b");
        clear();
        assert!(!is_enabled("test::a"));
        assert!(!is_enabled("test::b"));
    }
}
