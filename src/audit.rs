//! Audit trail writer and snapshot model.
//!
//! Every undo-capable mutation appends exactly one entry capturing the
//! resource state immediately before and after. The writer does not
//! interpret snapshot contents, but it does fix their *shape* at write
//! time: [`Snapshot`] is the tagged union the undo engine later
//! consumes, so shape sniffing happens in exactly one place
//! ([`Snapshot::from_stored`]) instead of at every undo.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::db::{DbAdapter, Dialect, Row, SqlValue};
use crate::{Error, Result};

/// Event type appended by the undo engine itself
pub const EVENT_UNDO: &str = "appointment_undo";

/// Resource state captured on one side of a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Nothing existed (creation old-side, deletion new-side)
    Empty,
    /// A single-field value, typically a confirmation status
    Scalar(String),
    /// A full row, keyed by column name
    Row(Map<String, Value>),
}

impl Snapshot {
    pub fn row(map: Map<String, Value>) -> Self {
        Self::Row(map)
    }

    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(value.into())
    }

    /// Serialized form for the nullable text column
    pub fn to_stored(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Scalar(s) => Some(s.clone()),
            Self::Row(map) => Some(Value::Object(map.clone()).to_string()),
        }
    }

    /// Re-derive the shape of a stored value.
    ///
    /// Only a top-level JSON object counts as a row snapshot; anything
    /// else is a scalar. Historical rows wrote the literal string
    /// "null" for absent values, so it maps to `Empty`.
    pub fn from_stored(stored: Option<&str>) -> Self {
        match stored {
            None => Self::Empty,
            Some("null") => Self::Empty,
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => Self::Row(map),
                _ => Self::Scalar(text.to_string()),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_row(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Row(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// Who performed the request, as far as we can tell
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub actor: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Deserialize)]
struct BearerClaims {
    email: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<Value>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Best-effort decode of an `Authorization: Bearer ...` header.
    ///
    /// Audit logging must never block the primary action on a soft
    /// failure, so a missing, malformed or expired token simply yields
    /// an anonymous context.
    pub fn from_bearer(
        authorization: Option<&str>,
        secret: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        let actor = authorization
            .and_then(|header| {
                let lower = header.to_lowercase();
                lower
                    .starts_with("bearer ")
                    .then(|| header[7..].trim().to_string())
            })
            .and_then(|token| {
                let key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());
                let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
                jsonwebtoken::decode::<BearerClaims>(&token, &key, &validation).ok()
            })
            .and_then(|data| {
                data.claims.email.or_else(|| {
                    data.claims.user_id.map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                })
            });

        Self { actor, ip, user_agent }
    }
}

/// One immutable record of a tracked mutation
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub old_value: Snapshot,
    pub new_value: Snapshot,
    pub changed_by: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: Option<String>,
}

impl AuditEntry {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id").and_then(Value::as_i64).unwrap_or(0),
            event_type: str_field(row, "event_type").unwrap_or_default(),
            resource_type: str_field(row, "resource_type"),
            resource_id: str_field(row, "resource_id"),
            old_value: Snapshot::from_stored(str_field(row, "old_value").as_deref()),
            new_value: Snapshot::from_stored(str_field(row, "new_value").as_deref()),
            changed_by: str_field(row, "changed_by"),
            ip: str_field(row, "ip"),
            user_agent: str_field(row, "user_agent"),
            created_at: str_field(row, "created_at"),
        }
    }
}

/// Stringify a row field whatever its decoded JSON type
fn str_field(row: &Row, name: &str) -> Option<String> {
    match row.get(name) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Appends immutable change records. Borrows the adapter per call and
/// never holds it across request boundaries.
pub struct AuditWriter<'a> {
    db: &'a DbAdapter,
}

impl<'a> AuditWriter<'a> {
    pub fn new(db: &'a DbAdapter) -> Self {
        Self { db }
    }

    /// Append one entry and return its id.
    ///
    /// A hard write failure surfaces as [`Error::AuditWrite`]: the
    /// caller's primary action already happened, so callers warn and
    /// carry on rather than unwinding it.
    pub async fn record(
        &self,
        event_type: &str,
        resource_type: &str,
        resource_id: Option<&str>,
        old_value: &Snapshot,
        new_value: &Snapshot,
        ctx: &RequestContext,
    ) -> Result<i64> {
        let params = [
            SqlValue::from(event_type),
            SqlValue::from(resource_type),
            SqlValue::from(resource_id.map(str::to_string)),
            SqlValue::from(old_value.to_stored()),
            SqlValue::from(new_value.to_stored()),
            SqlValue::from(ctx.actor.clone()),
            SqlValue::from(ctx.ip.clone()),
            SqlValue::from(ctx.user_agent.clone()),
        ];
        const INSERT: &str = "INSERT INTO audit_log \
            (event_type, resource_type, resource_id, old_value, new_value, changed_by, ip, user_agent) \
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

        match self.db.dialect() {
            Dialect::MySql => {
                let done = self
                    .db
                    .execute(INSERT, &params)
                    .await
                    .map_err(audit_err)?;
                Ok(done.last_insert_id.unwrap_or(0) as i64)
            }
            Dialect::Postgres => {
                let sql = format!("{INSERT} RETURNING id");
                let rows = self.db.query(&sql, &params).await.map_err(audit_err)?;
                Ok(rows
                    .first()
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0))
            }
        }
    }

    /// Fetch one entry by id
    pub async fn entry(&self, id: i64) -> Result<AuditEntry> {
        let rows = self
            .db
            .query("SELECT * FROM audit_log WHERE id = ?", &[SqlValue::Int(id)])
            .await?;
        rows.first()
            .map(AuditEntry::from_row)
            .ok_or(Error::AuditEntryNotFound(id))
    }

    /// Newest entries, optionally restricted to one resource id
    pub async fn recent(&self, resource_id: Option<&str>, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = match resource_id {
            Some(rid) => {
                self.db
                    .query(
                        "SELECT * FROM audit_log WHERE resource_id = ? ORDER BY id DESC LIMIT ?",
                        &[SqlValue::from(rid), SqlValue::Int(limit)],
                    )
                    .await?
            }
            None => {
                self.db
                    .query(
                        "SELECT * FROM audit_log ORDER BY id DESC LIMIT ?",
                        &[SqlValue::Int(limit)],
                    )
                    .await?
            }
        };
        Ok(rows.iter().map(AuditEntry::from_row).collect())
    }
}

fn audit_err(err: Error) -> Error {
    match err {
        Error::Query(e) => Error::AuditWrite(e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stored_roundtrip_shapes() {
        assert_eq!(Snapshot::Empty.to_stored(), None);
        assert_eq!(Snapshot::from_stored(None), Snapshot::Empty);
        assert_eq!(Snapshot::from_stored(Some("null")), Snapshot::Empty);

        let scalar = Snapshot::scalar("Pendiente");
        assert_eq!(scalar.to_stored().as_deref(), Some("Pendiente"));
        assert_eq!(Snapshot::from_stored(Some("Pendiente")), scalar);

        let mut map = Map::new();
        map.insert("Confirmado".to_string(), json!("Confirmada"));
        let row = Snapshot::row(map);
        let stored = row.to_stored().unwrap();
        assert_eq!(stored, "{\"Confirmado\":\"Confirmada\"}");
        assert_eq!(Snapshot::from_stored(Some(&stored)), row);
    }

    #[test]
    fn test_only_objects_count_as_rows() {
        // Valid JSON that is not an object stays a scalar; the undo
        // engine must never guess a row restore from it.
        assert_eq!(
            Snapshot::from_stored(Some("[1,2]")),
            Snapshot::scalar("[1,2]")
        );
        assert_eq!(Snapshot::from_stored(Some("42")), Snapshot::scalar("42"));
        assert_eq!(
            Snapshot::from_stored(Some("Confirmada")),
            Snapshot::scalar("Confirmada")
        );
    }

    #[test]
    fn test_bearer_decode_is_best_effort() {
        let ctx = RequestContext::from_bearer(Some("Bearer not-a-token"), "secreto", None, None);
        assert!(ctx.actor.is_none());

        let ctx = RequestContext::from_bearer(None, "secreto", Some("10.0.0.1".into()), None);
        assert!(ctx.actor.is_none());
        assert_eq!(ctx.ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_bearer_decode_extracts_email() {
        #[derive(serde::Serialize)]
        struct Claims {
            email: String,
            exp: i64,
        }
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &Claims {
                email: "doctor@clinic.example".to_string(),
                exp: chrono::Utc::now().timestamp() + 3600,
            },
            &jsonwebtoken::EncodingKey::from_secret(b"secreto"),
        )
        .unwrap();

        let ctx = RequestContext::from_bearer(
            Some(&format!("Bearer {token}")),
            "secreto",
            None,
            Some("test-agent".to_string()),
        );
        assert_eq!(ctx.actor.as_deref(), Some("doctor@clinic.example"));

        // Wrong secret: soft failure, anonymous context.
        let ctx = RequestContext::from_bearer(Some(&format!("Bearer {token}")), "other", None, None);
        assert!(ctx.actor.is_none());
    }

    #[test]
    fn test_entry_from_row_parses_snapshots() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(7));
        row.insert("event_type".to_string(), json!("appointment_confirm"));
        row.insert("resource_type".to_string(), json!("appointment"));
        row.insert("resource_id".to_string(), json!(31));
        row.insert("old_value".to_string(), json!("Pendiente"));
        row.insert("new_value".to_string(), json!("{\"Confirmado\":\"Confirmada\"}"));
        row.insert("changed_by".to_string(), Value::Null);

        let entry = AuditEntry::from_row(&row);
        assert_eq!(entry.id, 7);
        assert_eq!(entry.resource_id.as_deref(), Some("31"));
        assert_eq!(entry.old_value, Snapshot::scalar("Pendiente"));
        assert!(entry.new_value.as_row().is_some());
        assert!(entry.changed_by.is_none());
    }
}
