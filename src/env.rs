//! Environment variable substitution for configuration text
//!
//! `${VAR_NAME}` is replaced by the variable's value and
//! `${VAR_NAME:-fallback}` by the fallback when the variable is unset.
//! Substitution runs on the raw file before YAML parsing, so secrets such
//! as backend passwords can stay out of the file.

use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ConfigError;

/// `${NAME}` or `${NAME:-fallback}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Substitute references using the process environment.
///
/// Returns an error listing every missing variable that has no fallback.
///
/// # Examples
///
/// ```
/// use filehub::env::substitute_env_vars;
///
/// let result = substitute_env_vars("level: ${FILEHUB_DOC_UNSET_LEVEL:-info}").unwrap();
/// assert_eq!(result, "level: info");
/// ```
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    substitute_with(input, |name| env::var(name).ok())
}

/// Substitute references using a custom lookup
pub fn substitute_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();

    let output = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name).or_else(|| caps.get(2).map(|m| m.as_str().to_string())) {
            Some(value) => value,
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::MissingEnv(missing.join(", ")));
    }

    Ok(output.into_owned())
}
