/// Panics in debug builds; logs via `tracing::error!` and continues in
/// release builds. For loop-level failures that must not take down a
/// production replicator.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)+) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)+);
        } else {
            tracing::error!($($arg)+);
        }
    }};
}

/// Checks an invariant with a required message: panics in debug builds,
/// logs in release builds. The condition is always evaluated.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr, $($arg:tt)+) => {{
        if !$cond {
            if cfg!(debug_assertions) {
                panic!($($arg)+);
            } else {
                tracing::error!($($arg)+);
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn passing_assert_is_silent() {
        crate::safe_assert!(1 + 1 == 2, "arithmetic broke");
    }

    #[test]
    #[should_panic(expected = "identifier 9")]
    fn failing_assert_panics_in_debug() {
        crate::safe_assert!(false, "identifier {} out of place", 9);
    }
}
