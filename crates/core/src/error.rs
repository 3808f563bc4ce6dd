//! Error text constraints shared across the domain.
//!
//! Each crate carries its own `thiserror` enum; what is shared is the
//! contract for error text that ends up persisted on business records.

/// Maximum length of error strings persisted on business records.
///
/// Error columns are fixed-width; everything written through a status update
/// is capped to this many characters.
pub const ERROR_MAX_LEN: usize = 500;

/// Truncate an error message to [`ERROR_MAX_LEN`] characters.
///
/// Counts characters rather than bytes so multi-byte input can never be cut
/// mid-codepoint.
pub fn truncate_error(msg: &str) -> String {
    if msg.chars().count() <= ERROR_MAX_LEN {
        return msg.to_string();
    }
    msg.chars().take(ERROR_MAX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn long_messages_are_capped() {
        let long = "x".repeat(2 * ERROR_MAX_LEN);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), ERROR_MAX_LEN);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "语".repeat(ERROR_MAX_LEN + 10);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), ERROR_MAX_LEN);
        assert!(truncated.chars().all(|c| c == '语'));
    }
}
