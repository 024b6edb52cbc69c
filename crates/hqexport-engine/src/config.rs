//! Run configuration: output format selection and environment
//! variable substitution for query files.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ExportError;

/// Destination kind for emitted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Accumulate in memory and print one JSON document.
    Json,
    /// Land rows in a SQL database (SQLite file or `postgresql://`
    /// URL), with checkpointing in the same database.
    Sql,
}

impl FromStr for OutputFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sql" => Ok(Self::Sql),
            other => Err(ExportError::Config(format!(
                "unknown output format '{other}' (expected json or sql)"
            ))),
        }
    }
}

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable
/// values, so query files can reference credentials and hosts
/// without embedding them.
pub fn substitute_env_vars(input: &str) -> Result<String, ExportError> {
    let mut result = input.to_owned();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => missing.push(var_name.to_owned()),
        }
    }

    if missing.is_empty() {
        Ok(result)
    } else {
        Err(ExportError::Config(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_formats_parse() {
        assert_eq!(OutputFormat::from_str("json").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("SQL").unwrap(), OutputFormat::Sql);
        assert!(OutputFormat::from_str("xlsx").is_err());
    }

    #[test]
    fn env_vars_substitute() {
        std::env::set_var("HQ_TEST_PROJECT", "demo");
        let out = substitute_env_vars("{\"project\": \"${HQ_TEST_PROJECT}\"}").unwrap();
        assert_eq!(out, "{\"project\": \"demo\"}");
        std::env::remove_var("HQ_TEST_PROJECT");
    }

    #[test]
    fn plain_text_passes_through() {
        let input = "no substitution here";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn missing_env_vars_are_all_reported() {
        let err = substitute_env_vars("${HQ_MISSING_ONE} ${HQ_MISSING_TWO}").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("HQ_MISSING_ONE"));
        assert!(msg.contains("HQ_MISSING_TWO"));
    }
}
