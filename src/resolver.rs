//! Doctor identifier resolution.
//!
//! Appointment creation accepts a "professional" identifier that may be
//! a surrogate numeric id, a license (colegiado) code, an email, or a
//! free-text full name. The `citas` column it must match may itself be
//! numeric (foreign key to the doctors surrogate id) or textual (the
//! license code) depending on which schema variant is deployed, so the
//! resolver inspects the live schema instead of assuming one at compile
//! time. The introspection result cannot change at runtime and is
//! cached for the process lifetime.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::db::{DbAdapter, Dialect, Row, SqlValue};
use crate::{Error, Result};

const REFERENCED_TABLE: &str = "doctores";
const LICENSE_COLUMN: &str = "Colegiado";

/// Shape of the referencing column in `citas`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Foreign key to the doctors surrogate id
    Numeric,
    /// Stores the license code directly
    Textual,
}

/// Cached result of the two-level schema introspection
#[derive(Debug, Clone)]
pub struct TargetSchema {
    pub kind: TargetKind,
    /// Primary-key column of `doctores`; only consulted when the
    /// target is numeric
    pub referenced_pk: String,
}

/// The stored key a token resolved to
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedKey {
    Id(i64),
    Code(String),
}

impl ResolvedKey {
    pub fn into_value(self) -> SqlValue {
        match self {
            Self::Id(id) => SqlValue::Int(id),
            Self::Code(code) => SqlValue::Text(code),
        }
    }
}

impl std::fmt::Display for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Code(code) => f.write_str(code),
        }
    }
}

static TARGET_SCHEMA: OnceCell<TargetSchema> = OnceCell::const_new();

/// Tolerant WHERE clause built from one input token. Exact matches
/// come first so they win over the looser LIKE probes.
pub(crate) struct MatchSet {
    pub clauses: Vec<String>,
    pub params: Vec<SqlValue>,
}

impl MatchSet {
    pub fn where_sql(&self) -> String {
        self.clauses.join(" OR ")
    }
}

pub(crate) fn build_match_set(token: &str) -> MatchSet {
    let cleaned = clean_token(token);
    let no_space = remove_whitespace(&cleaned);
    let upper = token.to_uppercase();
    let like_raw = format!("%{token}%");
    let like_clean = format!("%{cleaned}%");
    let like_no_space = format!("%{no_space}%");

    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut push = |clause: &str, param: String| {
        clauses.push(clause.to_string());
        params.push(SqlValue::Text(param));
    };

    // exacts
    push("Colegiado = ?", token.to_string());
    push("Colegiado = ?", cleaned.clone());
    push("UPPER(Colegiado) = ?", upper);
    push("Correo = ?", token.to_string());
    // name equals
    push("CONCAT(Nombres,' ',Apellidos) = ?", token.to_string());
    // LIKE patterns
    push("Colegiado LIKE ?", like_raw.clone());
    push("Colegiado LIKE ?", like_clean.clone());
    push("Colegiado LIKE ?", like_no_space);
    push("CONCAT(Nombres,' ',Apellidos) LIKE ?", like_raw);
    push("CONCAT(Nombres,' ',Apellidos) LIKE ?", like_clean);

    MatchSet { clauses, params }
}

pub(crate) fn clean_token(token: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9 ]").expect("static pattern"));
    re.replace_all(token, "").trim().to_string()
}

pub(crate) fn remove_whitespace(token: &str) -> String {
    token.split_whitespace().collect()
}

/// First run of digits in the token, if any
pub(crate) fn digit_run(token: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+").expect("static pattern"));
    re.find(token).map(|m| m.as_str().to_string())
}

fn is_numeric_type(data_type: &str) -> bool {
    matches!(
        data_type,
        "int" | "integer" | "bigint" | "mediumint" | "smallint" | "tinyint"
    )
}

/// Maps a loosely-typed doctor identifier to the stored key
pub struct ProfessionalResolver<'a> {
    db: &'a DbAdapter,
}

impl<'a> ProfessionalResolver<'a> {
    pub fn new(db: &'a DbAdapter) -> Self {
        Self { db }
    }

    /// Resolve a token to the value the referencing column stores.
    ///
    /// Purely numeric tokens are returned unchanged without touching
    /// the database; the foreign-key constraint downstream is the
    /// backstop for a bogus id.
    pub async fn resolve(&self, token: &str) -> Result<ResolvedKey> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::DoctorNotFound {
                token: token.to_string(),
            });
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(id) = token.parse::<i64>() {
                return Ok(ResolvedKey::Id(id));
            }
        }

        let schema = self.target_schema().await;
        let select = match schema.kind {
            TargetKind::Numeric => schema.referenced_pk.clone(),
            TargetKind::Textual => LICENSE_COLUMN.to_string(),
        };

        let matches = build_match_set(token);
        let sql = format!(
            "SELECT {select} AS resolved FROM {REFERENCED_TABLE} WHERE ({}) LIMIT 1",
            matches.where_sql()
        );
        let rows = self.db.query(&sql, &matches.params).await?;
        if let Some(row) = rows.first() {
            return key_from_row(schema.kind, row, token);
        }

        // Last resort: a digit run inside the token probes the select
        // column directly.
        if let Some(digits) = digit_run(token) {
            let sql =
                format!("SELECT {select} AS resolved FROM {REFERENCED_TABLE} WHERE {select} = ? LIMIT 1");
            let param = match schema.kind {
                TargetKind::Numeric => digits
                    .parse::<i64>()
                    .map(SqlValue::Int)
                    .unwrap_or(SqlValue::Text(digits)),
                TargetKind::Textual => SqlValue::Text(digits),
            };
            let rows = self.db.query(&sql, &[param]).await?;
            if let Some(row) = rows.first() {
                return key_from_row(schema.kind, row, token);
            }
        }

        Err(Error::DoctorNotFound {
            token: token.to_string(),
        })
    }

    /// Introspected target shape, cached on first success. A failed
    /// introspection is not cached; that call falls back to the textual
    /// license column like the schema variants without a surrogate key.
    async fn target_schema(&self) -> TargetSchema {
        match TARGET_SCHEMA.get_or_try_init(|| self.introspect()).await {
            Ok(schema) => schema.clone(),
            Err(err) => {
                tracing::warn!(error = %err, "Schema introspection failed; assuming textual license column");
                TargetSchema {
                    kind: TargetKind::Textual,
                    referenced_pk: LICENSE_COLUMN.to_string(),
                }
            }
        }
    }

    async fn introspect(&self) -> Result<TargetSchema> {
        let database = self.db.resolved_config().database;
        let (type_sql, type_params): (&str, Vec<SqlValue>) = match self.db.dialect() {
            Dialect::MySql => (
                "SELECT DATA_TYPE AS data_type FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = 'citas' \
                 AND COLUMN_NAME = 'Profesional_Responsable' LIMIT 1",
                vec![SqlValue::Text(database)],
            ),
            // Unquoted identifiers fold to lowercase on Postgres, so
            // match table/column names case-insensitively there.
            Dialect::Postgres => (
                "SELECT data_type FROM information_schema.columns \
                 WHERE table_schema = 'public' AND lower(table_name) = 'citas' \
                 AND lower(column_name) = 'profesional_responsable' LIMIT 1",
                vec![],
            ),
        };

        let rows = self.db.query(type_sql, &type_params).await?;
        let data_type = rows
            .first()
            .and_then(|r| r.get("data_type"))
            .and_then(Value::as_str)
            .map(str::to_lowercase);

        let numeric = data_type.as_deref().is_some_and(is_numeric_type);
        if !numeric {
            return Ok(TargetSchema {
                kind: TargetKind::Textual,
                referenced_pk: LICENSE_COLUMN.to_string(),
            });
        }

        let (pk_sql, pk_params): (&str, Vec<SqlValue>) = match self.db.dialect() {
            Dialect::MySql => (
                "SELECT COLUMN_NAME AS column_name FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = 'doctores' \
                 AND COLUMN_KEY = 'PRI' LIMIT 1",
                vec![SqlValue::Text(self.db.resolved_config().database)],
            ),
            Dialect::Postgres => (
                "SELECT kcu.column_name FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                 ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema \
                 WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public' \
                 AND lower(tc.table_name) = 'doctores' LIMIT 1",
                vec![],
            ),
        };

        let rows = self.db.query(pk_sql, &pk_params).await?;
        let pk = rows
            .first()
            .and_then(|r| r.get("column_name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config(format!("could not determine the primary key of {REFERENCED_TABLE}"))
            })?;

        tracing::info!(pk = %pk, "Referencing column is numeric; resolving to the doctors primary key");
        Ok(TargetSchema {
            kind: TargetKind::Numeric,
            referenced_pk: pk,
        })
    }
}

fn key_from_row(kind: TargetKind, row: &Row, token: &str) -> Result<ResolvedKey> {
    let value = row.get("resolved").cloned().unwrap_or(Value::Null);
    match kind {
        TargetKind::Numeric => match value {
            Value::Number(n) => n.as_i64().map(ResolvedKey::Id).ok_or_else(|| not_found(token)),
            Value::String(s) => s.parse().map(ResolvedKey::Id).map_err(|_| not_found(token)),
            _ => Err(not_found(token)),
        },
        TargetKind::Textual => match value {
            Value::String(s) => Ok(ResolvedKey::Code(s)),
            Value::Number(n) => Ok(ResolvedKey::Code(n.to_string())),
            _ => Err(not_found(token)),
        },
    }
}

fn not_found(token: &str) -> Error {
    Error::DoctorNotFound {
        token: token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use serde_json::json;

    fn disconnected_adapter() -> DbAdapter {
        DbAdapter::new(DbConfig {
            dialect: Dialect::MySql,
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "dermatologico".to_string(),
            tls: false,
            max_attempts: 1,
        })
    }

    #[tokio::test]
    async fn test_numeric_token_short_circuits() {
        // The adapter is not connected: a returned key proves no
        // lookup query was issued.
        let db = disconnected_adapter();
        let resolver = ProfessionalResolver::new(&db);
        assert_eq!(resolver.resolve("12045").await.unwrap(), ResolvedKey::Id(12045));
        assert_eq!(resolver.resolve(" 7 ").await.unwrap(), ResolvedKey::Id(7));
    }

    #[tokio::test]
    async fn test_non_numeric_token_needs_transport() {
        let db = disconnected_adapter();
        let resolver = ProfessionalResolver::new(&db);
        let err = resolver.resolve("COL-4411").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_empty_token_is_not_found() {
        let db = disconnected_adapter();
        let resolver = ProfessionalResolver::new(&db);
        assert!(matches!(
            resolver.resolve("   ").await.unwrap_err(),
            Error::DoctorNotFound { .. }
        ));
    }

    #[test]
    fn test_match_set_exact_before_fuzzy() {
        let m = build_match_set("COL-4411");
        assert_eq!(m.clauses.len(), m.params.len());
        // Exact license/email/name probes precede every LIKE clause, so
        // an exact hit wins even when looser candidates also match.
        let first_like = m.clauses.iter().position(|c| c.contains("LIKE")).unwrap();
        assert!(m.clauses[..first_like]
            .iter()
            .all(|c| c.contains("= ?")));
        assert_eq!(m.clauses[0], "Colegiado = ?");
        assert_eq!(m.params[0], SqlValue::Text("COL-4411".to_string()));
        // Cleaned variant drops the punctuation.
        assert_eq!(m.params[1], SqlValue::Text("COL4411".to_string()));
    }

    #[test]
    fn test_token_cleaning() {
        assert_eq!(clean_token("Dr. Juan Pérez"), "Dr Juan Prez");
        assert_eq!(remove_whitespace("Juan  Pérez"), "JuanPérez");
        assert_eq!(digit_run("COL-4411/A"), Some("4411".to_string()));
        assert_eq!(digit_run("no digits"), None);
    }

    #[test]
    fn test_numeric_type_names() {
        for t in ["int", "bigint", "mediumint", "smallint", "tinyint", "integer"] {
            assert!(is_numeric_type(t));
        }
        assert!(!is_numeric_type("varchar"));
        assert!(!is_numeric_type("text"));
    }

    #[test]
    fn test_key_from_row_shapes() {
        let mut row = Row::new();
        row.insert("resolved".to_string(), json!(9));
        assert_eq!(
            key_from_row(TargetKind::Numeric, &row, "x").unwrap(),
            ResolvedKey::Id(9)
        );

        let mut row = Row::new();
        row.insert("resolved".to_string(), json!("COL-4411"));
        assert_eq!(
            key_from_row(TargetKind::Textual, &row, "x").unwrap(),
            ResolvedKey::Code("COL-4411".to_string())
        );

        let row = Row::new();
        assert!(matches!(
            key_from_row(TargetKind::Numeric, &row, "x").unwrap_err(),
            Error::DoctorNotFound { .. }
        ));
    }
}
