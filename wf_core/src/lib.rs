//! ABOUTME: Core error taxonomy, time helpers, and tracing utilities
//! ABOUTME: Foundation crate used by all other weft components

pub mod error;
pub mod telemetry;
pub mod time;

pub use error::{Error, Result};
pub use time::{now_rfc3339, to_rfc3339};

#[cfg(test)]
mod tests {
    use test_support::test_namespace;

    #[test]
    fn test_cross_crate_usage() {
        let ns = test_namespace();
        assert_eq!(ns, "testspace");
    }
}
