//! Environment variable interpolation for job files.
//!
//! Supported forms:
//! - `$VAR` / `${VAR}`: value of VAR, error when unset
//! - `${VAR:-fallback}`: fallback when VAR is unset or empty
//! - `${VAR-fallback}`: fallback only when VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<fallback>[^}]*) )? \}
        | \$ (?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Expand placeholders in `input`.
///
/// Every problem is collected so a job file with several missing variables
/// reports all of them at once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut problems = Vec::new();

    let expanded = PLACEHOLDER.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        if whole == "$$" {
            return "$".to_string();
        }

        let name = caps
            .name("braced")
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let op = caps.name("op").map(|m| m.as_str());
        let fallback = caps.name("fallback").map(|m| m.as_str());

        match (env::var(name), fallback) {
            (Ok(value), _) if value.contains(['\n', '\r']) => {
                problems.push(format!("{name} contains a line break"));
                whole.to_string()
            }
            (Ok(value), Some(fallback)) if value.is_empty() && op == Some(":-") => {
                fallback.to_string()
            }
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => fallback.to_string(),
            (Err(_), None) => {
                problems.push(format!("{name} is not set"));
                whole.to_string()
            }
        }
    });

    if problems.is_empty() {
        Ok(expanded.into_owned())
    } else {
        Err(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let saved: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();
        // SAFETY: every test uses its own variable names
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        let out = f();
        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        out
    }

    #[test]
    fn test_bare_and_braced() {
        with_env(&[("SLUICE_T_HOST", Some("db.local"))], || {
            assert_eq!(
                interpolate("postgres://$SLUICE_T_HOST/${SLUICE_T_HOST}").unwrap(),
                "postgres://db.local/db.local"
            );
        });
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env(&[("SLUICE_T_A", None), ("SLUICE_T_B", None)], || {
            let problems = interpolate("$SLUICE_T_A and ${SLUICE_T_B}").unwrap_err();
            assert_eq!(problems.len(), 2);
            assert!(problems[0].contains("SLUICE_T_A"));
        });
    }

    #[test]
    fn test_fallbacks() {
        with_env(
            &[("SLUICE_T_UNSET", None), ("SLUICE_T_EMPTY", Some(""))],
            || {
                assert_eq!(interpolate("${SLUICE_T_UNSET:-x}").unwrap(), "x");
                assert_eq!(interpolate("${SLUICE_T_UNSET-y}").unwrap(), "y");
                assert_eq!(interpolate("${SLUICE_T_EMPTY:-x}").unwrap(), "x");
                assert_eq!(interpolate("[${SLUICE_T_EMPTY-y}]").unwrap(), "[]");
            },
        );
    }

    #[test]
    fn test_escape() {
        assert_eq!(interpolate("cost: $$5").unwrap(), "cost: $5");
    }

    #[test]
    fn test_line_break_rejected() {
        with_env(&[("SLUICE_T_NL", Some("a\nb"))], || {
            let problems = interpolate("$SLUICE_T_NL").unwrap_err();
            assert!(problems[0].contains("line break"));
        });
    }
}
