//! Staff and patient profile updates.
//!
//! The one multi-statement write path in the system: editing a person
//! must keep the per-role entity table and the shared `usuarios`
//! account table consistent, so both updates run inside a single
//! transaction and roll back together on any step failure.

use serde_json::{Map, Value};

use crate::audit::{AuditWriter, RequestContext, Snapshot};
use crate::db::{DbAdapter, DbTransaction, Row, SqlValue};
use crate::{Error, Result};

/// Audit event recorded for profile edits
pub const EVENT_USER_UPDATE: &str = "user_update";

/// The four per-role entity tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonKind {
    Patient,
    Doctor,
    Secretary,
    Administrator,
}

impl PersonKind {
    /// Parse the route segment used by the HTTP layer
    pub fn from_route(segment: &str) -> Option<Self> {
        match segment.to_lowercase().as_str() {
            "pacientes" => Some(Self::Patient),
            "doctores" => Some(Self::Doctor),
            "secretarias" => Some(Self::Secretary),
            "administradores" => Some(Self::Administrator),
            _ => None,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Patient => "pacientes",
            Self::Doctor => "doctores",
            Self::Secretary => "secretarias",
            Self::Administrator => "administradores",
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            Self::Patient => "DPI",
            Self::Doctor => "Colegiado",
            Self::Secretary => "idSecretarias",
            Self::Administrator => "idAdministradores",
        }
    }

    /// Accepted payload keys (lower-cased) and the columns they map to.
    /// Anything else in the payload is dropped, never interpolated.
    fn column_map(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Patient => &[
                ("dpi", "DPI"),
                ("nombres", "Nombres"),
                ("apellidos", "Apellidos"),
                ("telefono", "Telefono"),
                ("correo", "Correo"),
                ("activo", "Activo"),
            ],
            Self::Doctor => &[
                ("colegiado", "Colegiado"),
                ("nombres", "Nombres"),
                ("apellidos", "Apellidos"),
                ("telefono", "Telefono"),
                ("correo", "Correo"),
                ("activo", "Activo"),
                ("especialidad", "Especialidad"),
            ],
            Self::Secretary => &[
                ("idsecretarias", "idSecretarias"),
                ("nombres", "Nombres"),
                ("apellidos", "Apellidos"),
                ("telefono", "Telefono"),
                ("correo", "Correo"),
                ("activo", "Activo"),
            ],
            Self::Administrator => &[
                ("idadministradores", "idAdministradores"),
                ("nombres", "Nombres"),
                ("apellidos", "Apellidos"),
                ("correo", "Correo"),
                ("activo", "Activo"),
            ],
        }
    }
}

/// Normalize the yes/no flag columns to the stored `Si`/`No` spelling
pub(crate) fn normalize_flag(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::String(if *b { "Si" } else { "No" }.to_string()),
        Value::Number(n) => {
            Value::String(if n.as_i64() == Some(1) { "Si" } else { "No" }.to_string())
        }
        Value::String(s) => {
            let up = s.to_uppercase();
            let yes = matches!(up.as_str(), "SI" | "S" | "YES" | "Y" | "1");
            Value::String(if yes { "Si" } else { "No" }.to_string())
        }
        other => other.clone(),
    }
}

/// Payload keys mapped to columns, flag values normalized
pub(crate) fn build_assignments(kind: PersonKind, payload: &Map<String, Value>) -> Vec<(String, Value)> {
    let map = kind.column_map();
    let mut out = Vec::new();
    for (raw_key, raw_val) in payload {
        let low = raw_key.to_lowercase();
        let Some((_, column)) = map.iter().find(|(k, _)| *k == low) else {
            continue;
        };
        let value = if *column == "Activo" || *column == "Estado" {
            normalize_flag(raw_val)
        } else {
            raw_val.clone()
        };
        out.push((column.to_string(), value));
    }
    out
}

/// Update a person and keep the `usuarios` account row in sync.
///
/// Returns the updated entity row. Appends a `user_update` audit entry
/// with full before/after snapshots; the audit write is best-effort
/// relative to the committed update.
pub async fn update_person(
    db: &DbAdapter,
    kind: PersonKind,
    id: &str,
    payload: &Map<String, Value>,
    ctx: &RequestContext,
) -> Result<Row> {
    let table = kind.table();
    let id_column = kind.id_column();

    let rows = db
        .query(
            &format!("SELECT * FROM {table} WHERE {id_column} = ?"),
            &[SqlValue::from(id)],
        )
        .await?;
    let old_row = rows.into_iter().next().ok_or_else(|| Error::PersonNotFound {
        table: table.to_string(),
        id: id.to_string(),
    })?;

    let assignments = build_assignments(kind, payload);
    if assignments.is_empty() {
        return Err(Error::NoUpdatableFields);
    }

    let mut tx = db.begin().await?;
    match apply_update(&mut tx, kind, id, &old_row, &assignments).await {
        Ok(()) => tx.commit().await?,
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                tracing::error!(error = %rb, "Rollback failed after update error");
            }
            return Err(err);
        }
    }

    let new_row = db
        .query(
            &format!("SELECT * FROM {table} WHERE {id_column} = ?"),
            &[new_id_param(&assignments, id)],
        )
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();

    let writer = AuditWriter::new(db);
    if let Err(err) = writer
        .record(
            EVENT_USER_UPDATE,
            "user",
            Some(id),
            &Snapshot::Row(old_row),
            &Snapshot::Row(new_row.clone()),
            ctx,
        )
        .await
    {
        tracing::warn!(table, id, error = %err, "Audit insert failed for user update");
    }

    Ok(new_row)
}

async fn apply_update(
    tx: &mut DbTransaction,
    kind: PersonKind,
    id: &str,
    old_row: &Row,
    assignments: &[(String, Value)],
) -> Result<()> {
    let table = kind.table();
    let id_column = kind.id_column();

    let sets: Vec<String> = assignments.iter().map(|(c, _)| format!("{c} = ?")).collect();
    let mut params: Vec<SqlValue> = assignments
        .iter()
        .map(|(_, v)| SqlValue::from_json(v))
        .collect();
    params.push(SqlValue::from(id));
    tx.execute(
        &format!("UPDATE {table} SET {} WHERE {id_column} = ?", sets.join(", ")),
        &params,
    )
    .await?;

    // Mirror email/state changes into the shared account table, keyed
    // by the email the account had before this edit.
    let old_email = old_row
        .get("Correo")
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(old_email) = old_email else {
        return Ok(());
    };

    let mut account_sets = Vec::new();
    let mut account_params = Vec::new();
    for (column, value) in assignments {
        match column.as_str() {
            "Correo" => {
                account_sets.push("correo = ?".to_string());
                account_params.push(SqlValue::from_json(value));
            }
            "Activo" => {
                account_sets.push("Estado = ?".to_string());
                account_params.push(SqlValue::from_json(value));
            }
            _ => {}
        }
    }
    if account_sets.is_empty() {
        return Ok(());
    }

    let matching = tx
        .query(
            "SELECT correo FROM usuarios WHERE correo = ? LIMIT 1",
            &[SqlValue::from(old_email.as_str())],
        )
        .await?;
    if matching.is_empty() {
        return Ok(());
    }

    account_params.push(SqlValue::from(old_email.as_str()));
    tx.execute(
        &format!(
            "UPDATE usuarios SET {} WHERE correo = ?",
            account_sets.join(", ")
        ),
        &account_params,
    )
    .await?;
    Ok(())
}

/// The row id after the update: the payload may have changed the id
/// column itself (DPI / Colegiado edits).
fn new_id_param(assignments: &[(String, Value)], fallback: &str) -> SqlValue {
    assignments
        .iter()
        .find(|(c, _)| c == "DPI" || c == "Colegiado" || c.starts_with("id"))
        .map(|(_, v)| SqlValue::from_json(v))
        .unwrap_or_else(|| SqlValue::from(fallback))
}
