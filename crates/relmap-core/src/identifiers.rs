//! SQL identifier validation.
//!
//! Schema definitions are validated once, at construction, so every table,
//! column and alias that reaches the query compiler is a plain identifier.
//! Rendering still quotes each one per dialect, which keeps reserved words
//! such as `user` usable as names.

use crate::Result;
use crate::error::{ConfigError, Error};
use regex::Regex;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> std::result::Result<&'static Regex, &'static regex::Error> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(IDENTIFIER_PATTERN)).as_ref()
}

/// Check whether `name` is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_ok_and(|re| re.is_match(name))
}

/// Validate an identifier, naming what it identifies in the error.
///
/// ```
/// use relmap_core::validate_identifier;
///
/// assert!(validate_identifier("table", "users").is_ok());
/// assert!(validate_identifier("column", "first name").is_err());
/// ```
#[allow(clippy::result_large_err)]
pub fn validate_identifier(what: &str, name: &str) -> Result<()> {
    let re = identifier_regex().map_err(|e| {
        Error::Config(ConfigError {
            message: format!("identifier pattern failed to compile: {e}"),
            source: None,
        })
    })?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::config(format!("invalid {what} identifier '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("post_tags2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("user name"));
        assert!(!is_valid_identifier("a;b"));
    }

    #[test]
    fn test_validation_error_names_the_identifier() {
        let err = validate_identifier("column", "bad-name").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid column identifier 'bad-name'"
        );
    }
}
