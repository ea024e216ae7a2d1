use crate::error::TransferError;

/// What the identifier will be used as. The accepted character set is the
/// same for every kind; the kind only feeds the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Table,
    Collection,
    File,
}

impl PathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathKind::Table => "table",
            PathKind::Collection => "collection",
            PathKind::File => "file",
        }
    }
}

const MAX_ECHOED_INPUT: usize = 32;

/// Validates an identifier destined for a generated shell command or SQL
/// statement. This is the single choke point between caller-supplied
/// table/collection/file names and the dump/restore tool invocations built
/// from them, so the rules are deliberately strict: trimmed input must be
/// non-empty and consist only of `[A-Za-z0-9_./-]`. Everything else,
/// shell metacharacters, SQL terminators, quotes, control characters, is
/// rejected. Pure function, no I/O.
pub fn validate_path(value: &str, kind: PathKind) -> Result<String, TransferError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TransferError::Validation {
            kind: kind.as_str(),
            reason: "empty identifier",
            input: String::new(),
        });
    }

    let safe = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if safe {
        Ok(trimmed.to_string())
    } else {
        Err(TransferError::Validation {
            kind: kind.as_str(),
            reason: "unsafe characters",
            input: redact(trimmed),
        })
    }
}

/// Truncated, escape-printed copy of the offending input for diagnostics.
fn redact(value: &str) -> String {
    let clipped: String = value.chars().take(MAX_ECHOED_INPUT).collect();
    let mut out: String = clipped.escape_debug().collect();
    if value.chars().count() > MAX_ECHOED_INPUT {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{validate_path, PathKind};
    use crate::error::TransferError;

    #[test]
    fn accepts_plain_identifiers_unchanged() {
        for name in ["users", "public.users", "app_logs-2024", "db/dump.sql", "A1"] {
            let validated = validate_path(name, PathKind::Table).expect(name);
            assert_eq!(validated, name);
        }
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(validate_path("  users  ", PathKind::Table).expect("trim"), "users");
    }

    #[test]
    fn rejects_every_shell_and_sql_metacharacter() {
        for payload in [
            "users;",
            "users|cat",
            "users&",
            "users>out",
            "users<in",
            "users`id`",
            "users$(id)",
            "users\nmore",
            "users' OR 1=1",
            "users\"",
            "users*",
            "users users",
            "users\t",
            "users\0",
        ] {
            let err = validate_path(payload, PathKind::Table).expect_err(payload);
            assert!(
                matches!(err, TransferError::Validation { reason: "unsafe characters", .. }),
                "payload {payload:?} gave {err}"
            );
        }
    }

    #[test]
    fn rejects_classic_injection_payload() {
        let err = validate_path("users; DROP TABLE users--", PathKind::Table).expect_err("inject");
        match err {
            TransferError::Validation { kind, input, .. } => {
                assert_eq!(kind, "table");
                assert!(input.len() <= 40, "echoed input is truncated: {input}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn rejects_empty_and_whitespace_only() {
        assert!(validate_path("", PathKind::Collection).is_err());
        assert!(validate_path("   ", PathKind::Collection).is_err());
    }

    #[test]
    fn long_input_is_truncated_in_error() {
        let long = format!("{};x", "a".repeat(200));
        match validate_path(&long, PathKind::File).expect_err("long") {
            TransferError::Validation { input, .. } => {
                assert!(input.ends_with("..."));
                assert!(input.len() < 64);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
