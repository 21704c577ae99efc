//! Audit trail schema definitions
//!
//! The trail is append-only: entries are inserted, never updated or
//! deleted, and the engine's auto-incrementing id gives it its total
//! order.

use crate::Result;

use super::{DbAdapter, Dialect};

/// SQL to create the audit_log table (MySQL). MySQL has no
/// `CREATE INDEX IF NOT EXISTS`, so the indexes ride in the table DDL.
pub const CREATE_AUDIT_LOG_MYSQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    event_type VARCHAR(100) NOT NULL,
    resource_type VARCHAR(100),
    resource_id VARCHAR(100),
    old_value TEXT,
    new_value TEXT,
    changed_by VARCHAR(255),
    ip VARCHAR(100),
    user_agent VARCHAR(512),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    KEY idx_audit_resource (resource_type, resource_id),
    KEY idx_audit_event (event_type)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

/// SQL to create the audit_log table (Postgres)
pub const CREATE_AUDIT_LOG_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id BIGSERIAL PRIMARY KEY,
    event_type VARCHAR(100) NOT NULL,
    resource_type VARCHAR(100),
    resource_id VARCHAR(100),
    old_value TEXT,
    new_value TEXT,
    changed_by VARCHAR(255),
    ip VARCHAR(100),
    user_agent VARCHAR(512),
    created_at TIMESTAMPTZ DEFAULT now()
)
"#;

/// Postgres index statements
pub const CREATE_AUDIT_INDEXES_POSTGRES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log(resource_type, resource_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_event ON audit_log(event_type)",
];

/// All schema creation statements for the given dialect
pub fn audit_schema_statements(dialect: Dialect) -> Vec<&'static str> {
    match dialect {
        Dialect::MySql => vec![CREATE_AUDIT_LOG_MYSQL],
        Dialect::Postgres => {
            let mut stmts = vec![CREATE_AUDIT_LOG_POSTGRES];
            stmts.extend(CREATE_AUDIT_INDEXES_POSTGRES.iter().copied());
            stmts
        }
    }
}

/// Ensure the audit trail exists. Run once at boot or via the CLI.
pub async fn ensure_audit_schema(db: &DbAdapter) -> Result<()> {
    for stmt in audit_schema_statements(db.dialect()) {
        db.execute(stmt, &[]).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_per_dialect() {
        let mysql = audit_schema_statements(Dialect::MySql);
        assert_eq!(mysql.len(), 1);
        assert!(mysql[0].contains("AUTO_INCREMENT"));
        assert!(mysql[0].contains("ENGINE=InnoDB"));
        assert!(mysql[0].contains("KEY idx_audit_resource"));

        let pg = audit_schema_statements(Dialect::Postgres);
        assert_eq!(pg.len(), 3);
        assert!(pg[0].contains("BIGSERIAL"));
        assert!(!pg[0].contains("ENGINE"));
        assert!(pg[1].contains("IF NOT EXISTS idx_audit_resource"));
    }

    #[test]
    fn test_statements_have_no_placeholders() {
        for dialect in [Dialect::MySql, Dialect::Postgres] {
            for stmt in audit_schema_statements(dialect) {
                assert_eq!(super::super::dialect::placeholder_count(stmt), 0);
            }
        }
    }
}
