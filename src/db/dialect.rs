//! SQL dialect differences, owned in one place.
//!
//! Callers write neutral SQL with positional `?` placeholders. The few
//! constructions that cannot be made neutral (placeholder syntax,
//! identifier quoting, upsert, insert-id recovery) live here so call
//! sites branch on a method instead of scattering `if dialect == ...`.

use crate::{Error, Result};

/// A supported SQL backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
}

impl Dialect {
    /// Parse a dialect selector tag (env `DB_TYPE` or config file)
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }

    pub fn default_user(&self) -> &'static str {
        match self {
            Self::MySql => "root",
            Self::Postgres => "postgres",
        }
    }

    /// Quote an identifier for this backend, doubling embedded quotes
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Rewrite neutral `?` placeholders to the native syntax.
    ///
    /// The parameter count must equal the placeholder count; a mismatch
    /// is an error rather than a silently truncated bind list. `?`
    /// inside quoted literals is left alone.
    pub fn rewrite_placeholders(&self, sql: &str, param_count: usize) -> Result<String> {
        let found = placeholder_count(sql);
        if found != param_count {
            return Err(Error::PlaceholderMismatch {
                expected: found,
                given: param_count,
            });
        }

        match self {
            Self::MySql => Ok(sql.to_string()),
            Self::Postgres => {
                let mut out = String::with_capacity(sql.len() + found);
                let mut n = 0usize;
                let mut quote: Option<char> = None;
                for ch in sql.chars() {
                    match quote {
                        Some(q) => {
                            out.push(ch);
                            if ch == q {
                                quote = None;
                            }
                        }
                        None => match ch {
                            '\'' | '"' | '`' => {
                                quote = Some(ch);
                                out.push(ch);
                            }
                            '?' => {
                                n += 1;
                                out.push('$');
                                out.push_str(&n.to_string());
                            }
                            _ => out.push(ch),
                        },
                    }
                }
                Ok(out)
            }
        }
    }

    /// Clause appended to an INSERT to turn it into an upsert on `key`.
    pub fn upsert_clause(&self, key: &str, update_columns: &[&str]) -> String {
        match self {
            Self::MySql => {
                let sets: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("{q} = VALUES({q})", q = self.quote_ident(c)))
                    .collect();
                format!("ON DUPLICATE KEY UPDATE {}", sets.join(", "))
            }
            Self::Postgres => {
                let sets: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("{q} = EXCLUDED.{q}", q = self.quote_ident(c)))
                    .collect();
                format!(
                    "ON CONFLICT ({}) DO UPDATE SET {}",
                    self.quote_ident(key),
                    sets.join(", ")
                )
            }
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count neutral placeholders outside quoted literals
pub fn placeholder_count(sql: &str) -> usize {
    let mut count = 0usize;
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tag() {
        assert_eq!(Dialect::from_tag("MySQL"), Some(Dialect::MySql));
        assert_eq!(Dialect::from_tag("postgresql"), Some(Dialect::Postgres));
        assert_eq!(Dialect::from_tag("oracle"), None);
    }

    #[test]
    fn test_placeholder_count_skips_literals() {
        assert_eq!(placeholder_count("SELECT 1"), 0);
        assert_eq!(placeholder_count("SELECT * FROM citas WHERE idCitas = ?"), 1);
        assert_eq!(
            placeholder_count("UPDATE citas SET Observaciones = '?' WHERE idCitas = ?"),
            1
        );
    }

    #[test]
    fn test_mysql_passthrough_counts_params() {
        let sql = "INSERT INTO audit_log (a, b, c) VALUES (?, ?, ?)";
        assert_eq!(Dialect::MySql.rewrite_placeholders(sql, 3).unwrap(), sql);

        let err = Dialect::MySql.rewrite_placeholders(sql, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::PlaceholderMismatch { expected: 3, given: 2 }
        ));
    }

    #[test]
    fn test_postgres_rewrite_is_positional() {
        let sql = "SELECT * FROM citas WHERE Fecha = ? AND Hora = ? AND Confirmado <> ?";
        let native = Dialect::Postgres.rewrite_placeholders(sql, 3).unwrap();
        assert_eq!(
            native,
            "SELECT * FROM citas WHERE Fecha = $1 AND Hora = $2 AND Confirmado <> $3"
        );
        // Round-trip property: as many native markers as parameters.
        assert_eq!(native.matches('$').count(), 3);
    }

    #[test]
    fn test_postgres_rewrite_ignores_quoted_question_marks() {
        let sql = "SELECT '?' AS lit, Observaciones FROM citas WHERE idCitas = ?";
        let native = Dialect::Postgres.rewrite_placeholders(sql, 1).unwrap();
        assert_eq!(
            native,
            "SELECT '?' AS lit, Observaciones FROM citas WHERE idCitas = $1"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(Dialect::MySql.quote_ident("key"), "`key`");
        assert_eq!(Dialect::Postgres.quote_ident("key"), "\"key\"");
        assert_eq!(Dialect::Postgres.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_upsert_clause() {
        assert_eq!(
            Dialect::MySql.upsert_clause("key", &["value"]),
            "ON DUPLICATE KEY UPDATE `value` = VALUES(`value`)"
        );
        assert_eq!(
            Dialect::Postgres.upsert_clause("key", &["value"]),
            "ON CONFLICT (\"key\") DO UPDATE SET \"value\" = EXCLUDED.\"value\""
        );
    }
}
