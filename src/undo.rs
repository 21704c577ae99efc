//! Audit-driven undo engine.
//!
//! The engine reads only the audit trail and the adapter; it keeps no
//! state of its own. Re-invoking it for the same audit id re-derives
//! the same restoration (the original entry is re-read every time),
//! and each invocation appends a new forward entry, so the trail only
//! ever grows and an undo is itself undoable.

use serde_json::{Map, Value};

use crate::audit::{AuditEntry, AuditWriter, RequestContext, Snapshot, EVENT_UNDO};
use crate::db::{DbAdapter, Row, SqlValue};
use crate::{Error, Result};

/// The only resource type the engine will touch; anything else is
/// rejected explicitly rather than silently mis-applied.
pub const APPOINTMENT_RESOURCE: &str = "appointment";

/// Mutable appointment columns a snapshot may restore. The primary key
/// is never part of a SET list; it is only replayed on re-insert.
pub const APPOINTMENT_COLUMNS: &[&str] = &[
    "idCitas",
    "Paciente",
    "Consulta_Especialidad",
    "Profesional_Responsable",
    "Fecha",
    "Hora",
    "Observaciones",
    "Id_Creador",
    "Tipo_Creador",
    "Confirmado",
];

const ID_COLUMN: &str = "idCitas";
const STATUS_COLUMN: &str = "Confirmado";

/// Status a scalar restore falls back to when the recorded old value
/// was itself absent
pub const BASELINE_STATUS: &str = "Pendiente";

/// The inverse mutation derived from an audit entry
#[derive(Debug, Clone, PartialEq)]
pub enum UndoPlan {
    /// Current row exists: column-by-column UPDATE from the snapshot
    RestoreRow { assignments: Vec<(String, Value)> },
    /// Row was deleted since: re-INSERT including the primary key
    Reinsert { columns: Vec<(String, Value)> },
    /// Original action was a creation: delete the row
    DeleteCreated,
    /// Single-field status transition
    RestoreStatus { value: String },
}

/// What the resource was restored to
#[derive(Debug, Clone)]
pub enum UndoOutcome {
    Restored(Map<String, Value>),
    Reinserted(Map<String, Value>),
    Deleted,
    StatusRestored(String),
}

impl UndoOutcome {
    /// JSON rendering of the restored state for callers and the CLI
    pub fn restored_to(&self) -> Value {
        match self {
            Self::Restored(map) | Self::Reinserted(map) => Value::Object(map.clone()),
            Self::Deleted => Value::Null,
            Self::StatusRestored(s) => Value::String(s.clone()),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Restored(_) => "appointment restored (update)",
            Self::Reinserted(_) => "appointment restored (re-inserted)",
            Self::Deleted => "appointment deleted (undo of create)",
            Self::StatusRestored(_) => "appointment status restored",
        }
    }
}

/// Gate: the entry must target an appointment and carry a resource id
fn appointment_resource_id(entry: &AuditEntry) -> Result<String> {
    if entry.resource_type.as_deref() != Some(APPOINTMENT_RESOURCE) {
        return Err(Error::UndoUnsupported(
            entry
                .resource_type
                .clone()
                .unwrap_or_else(|| "<none>".to_string()),
        ));
    }
    entry.resource_id.clone().ok_or_else(|| Error::Unrecoverable {
        id: entry.id,
        reason: "entry carries no resource id".to_string(),
    })
}

/// Derive the inverse mutation from the entry's snapshots and whether
/// the resource currently exists. Pure; evaluated in shape order.
pub fn plan_undo(entry: &AuditEntry, current_exists: bool) -> Result<UndoPlan> {
    match (&entry.old_value, &entry.new_value) {
        // Case 1: full old snapshot -> restore fields (or re-insert)
        (Snapshot::Row(old), _) => {
            let assignments: Vec<(String, Value)> = APPOINTMENT_COLUMNS
                .iter()
                .filter(|c| **c != ID_COLUMN)
                .filter_map(|c| old.get(*c).map(|v| (c.to_string(), v.clone())))
                .collect();
            if assignments.is_empty() {
                return Err(Error::Unrecoverable {
                    id: entry.id,
                    reason: "old snapshot has no recognizable appointment fields".to_string(),
                });
            }
            if current_exists {
                Ok(UndoPlan::RestoreRow { assignments })
            } else {
                let columns = APPOINTMENT_COLUMNS
                    .iter()
                    .filter_map(|c| old.get(*c).map(|v| (c.to_string(), v.clone())))
                    .collect();
                Ok(UndoPlan::Reinsert { columns })
            }
        }

        // Case 2: created from nothing -> undo is a delete
        (Snapshot::Empty, Snapshot::Row(_)) => {
            if current_exists {
                Ok(UndoPlan::DeleteCreated)
            } else {
                Err(Error::AppointmentMissing(
                    entry.resource_id.clone().unwrap_or_default(),
                ))
            }
        }

        // Case 3: scalar transition -> restore the recorded status
        (Snapshot::Scalar(old), _) => Ok(UndoPlan::RestoreStatus { value: old.clone() }),
        (Snapshot::Empty, Snapshot::Scalar(_)) => Ok(UndoPlan::RestoreStatus {
            value: BASELINE_STATUS.to_string(),
        }),

        // Nothing recognizable; never guess a destructive action.
        (Snapshot::Empty, Snapshot::Empty) => Err(Error::Unrecoverable {
            id: entry.id,
            reason: "neither snapshot holds a restorable shape".to_string(),
        }),
    }
}

/// Applies inverse mutations computed from the audit trail
pub struct UndoEngine<'a> {
    db: &'a DbAdapter,
}

impl<'a> UndoEngine<'a> {
    pub fn new(db: &'a DbAdapter) -> Self {
        Self { db }
    }

    /// Undo the mutation recorded by `audit_id`.
    ///
    /// Appends a forward entry whose old value is the pre-undo current
    /// row (or nothing) and whose new value is the restored state. The
    /// forward write is best-effort: a failure is logged, not fatal,
    /// since the restoration itself already happened.
    pub async fn undo(&self, audit_id: i64, ctx: &RequestContext) -> Result<UndoOutcome> {
        let writer = AuditWriter::new(self.db);
        let entry = writer.entry(audit_id).await?;
        let resource_id = appointment_resource_id(&entry)?;

        let current = self.current_row(&resource_id).await?;
        let current_snapshot = current
            .clone()
            .map(Snapshot::Row)
            .unwrap_or(Snapshot::Empty);

        let plan = plan_undo(&entry, current.is_some())?;
        tracing::debug!(audit_id, event = %entry.event_type, ?plan, "undo plan");

        let outcome = match plan {
            UndoPlan::RestoreRow { assignments } => {
                let sets: Vec<String> = assignments.iter().map(|(c, _)| format!("{c} = ?")).collect();
                let mut params: Vec<SqlValue> =
                    assignments.iter().map(|(_, v)| SqlValue::from_json(v)).collect();
                params.push(SqlValue::from(resource_id.as_str()));
                let sql = format!("UPDATE citas SET {} WHERE {ID_COLUMN} = ?", sets.join(", "));
                self.db.execute(&sql, &params).await?;
                UndoOutcome::Restored(assignments.into_iter().collect())
            }
            UndoPlan::Reinsert { columns } => {
                let names: Vec<String> = columns.iter().map(|(c, _)| c.clone()).collect();
                let marks: Vec<&str> = columns.iter().map(|_| "?").collect();
                let params: Vec<SqlValue> =
                    columns.iter().map(|(_, v)| SqlValue::from_json(v)).collect();
                let sql = format!(
                    "INSERT INTO citas ({}) VALUES ({})",
                    names.join(", "),
                    marks.join(", ")
                );
                self.db.execute(&sql, &params).await?;
                UndoOutcome::Reinserted(columns.into_iter().collect())
            }
            UndoPlan::DeleteCreated => {
                self.db
                    .execute(
                        "DELETE FROM citas WHERE idCitas = ?",
                        &[SqlValue::from(resource_id.as_str())],
                    )
                    .await?;
                UndoOutcome::Deleted
            }
            UndoPlan::RestoreStatus { value } => {
                let sql = format!("UPDATE citas SET {STATUS_COLUMN} = ? WHERE {ID_COLUMN} = ?");
                self.db
                    .execute(
                        &sql,
                        &[SqlValue::from(value.as_str()), SqlValue::from(resource_id.as_str())],
                    )
                    .await?;
                UndoOutcome::StatusRestored(value)
            }
        };

        let new_snapshot = match &outcome {
            UndoOutcome::Restored(map) | UndoOutcome::Reinserted(map) => Snapshot::Row(map.clone()),
            UndoOutcome::Deleted => Snapshot::Empty,
            UndoOutcome::StatusRestored(value) => Snapshot::scalar(value.clone()),
        };
        if let Err(err) = writer
            .record(
                EVENT_UNDO,
                APPOINTMENT_RESOURCE,
                Some(&resource_id),
                &current_snapshot,
                &new_snapshot,
                ctx,
            )
            .await
        {
            tracing::warn!(audit_id, error = %err, "Audit insert failed for appointment undo");
        }

        Ok(outcome)
    }

    async fn current_row(&self, resource_id: &str) -> Result<Option<Row>> {
        let rows = self
            .db
            .query(
                "SELECT * FROM citas WHERE idCitas = ?",
                &[SqlValue::from(resource_id)],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: i64, old: Snapshot, new: Snapshot) -> AuditEntry {
        AuditEntry {
            id,
            event_type: "appointment_update".to_string(),
            resource_type: Some(APPOINTMENT_RESOURCE.to_string()),
            resource_id: Some("31".to_string()),
            old_value: old,
            new_value: new,
            changed_by: None,
            ip: None,
            user_agent: None,
            created_at: None,
        }
    }

    fn full_row(status: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("idCitas".to_string(), json!(31));
        map.insert("Paciente".to_string(), json!("1234567890101"));
        map.insert("Fecha".to_string(), json!("2024-06-03"));
        map.insert("Hora".to_string(), json!("10:30:00"));
        map.insert("Confirmado".to_string(), json!(status));
        map
    }

    #[test]
    fn test_full_snapshot_updates_when_row_exists() {
        let e = entry(1, Snapshot::Row(full_row("Pendiente")), Snapshot::Empty);
        let plan = plan_undo(&e, true).unwrap();
        match plan {
            UndoPlan::RestoreRow { assignments } => {
                assert!(assignments.iter().all(|(c, _)| c != "idCitas"));
                assert!(assignments.iter().any(|(c, v)| c == "Confirmado" && v == "Pendiente"));
            }
            other => panic!("expected RestoreRow, got {other:?}"),
        }
    }

    #[test]
    fn test_full_snapshot_reinserts_when_row_deleted() {
        let e = entry(1, Snapshot::Row(full_row("Pendiente")), Snapshot::Empty);
        let plan = plan_undo(&e, false).unwrap();
        match plan {
            UndoPlan::Reinsert { columns } => {
                assert!(columns.iter().any(|(c, v)| c == "idCitas" && v == &json!(31)));
            }
            other => panic!("expected Reinsert, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_columns_are_dropped() {
        let mut map = full_row("Pendiente");
        map.insert("Sneaky".to_string(), json!("DROP TABLE citas"));
        let e = entry(1, Snapshot::Row(map), Snapshot::Empty);
        match plan_undo(&e, true).unwrap() {
            UndoPlan::RestoreRow { assignments } => {
                assert!(assignments.iter().all(|(c, _)| c != "Sneaky"));
            }
            other => panic!("expected RestoreRow, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_without_known_fields_is_unrecoverable() {
        let mut map = Map::new();
        map.insert("whatever".to_string(), json!(1));
        let e = entry(9, Snapshot::Row(map), Snapshot::Empty);
        assert!(matches!(
            plan_undo(&e, true).unwrap_err(),
            Error::Unrecoverable { id: 9, .. }
        ));
    }

    #[test]
    fn test_undo_of_create_deletes() {
        let e = entry(2, Snapshot::Empty, Snapshot::Row(full_row("Pendiente")));
        assert_eq!(plan_undo(&e, true).unwrap(), UndoPlan::DeleteCreated);

        // Second undo: the row is already gone -> NotFound, not a crash.
        assert!(matches!(
            plan_undo(&e, false).unwrap_err(),
            Error::AppointmentMissing(id) if id == "31"
        ));
    }

    #[test]
    fn test_scalar_restore_uses_recorded_value() {
        let e = entry(3, Snapshot::scalar("Pendiente"), Snapshot::scalar("Confirmada"));
        assert_eq!(
            plan_undo(&e, true).unwrap(),
            UndoPlan::RestoreStatus { value: "Pendiente".to_string() }
        );
    }

    #[test]
    fn test_scalar_restore_defaults_to_baseline() {
        // old_value was NULL (or literal "null"): fall back to Pendiente.
        let e = entry(4, Snapshot::Empty, Snapshot::scalar("Confirmada"));
        assert_eq!(
            plan_undo(&e, true).unwrap(),
            UndoPlan::RestoreStatus { value: BASELINE_STATUS.to_string() }
        );
    }

    #[test]
    fn test_empty_shapes_are_unrecoverable() {
        let e = entry(5, Snapshot::Empty, Snapshot::Empty);
        assert!(matches!(
            plan_undo(&e, true).unwrap_err(),
            Error::Unrecoverable { id: 5, .. }
        ));
    }

    #[test]
    fn test_resource_gate_rejects_other_types() {
        let mut e = entry(6, Snapshot::scalar("Pendiente"), Snapshot::Empty);
        e.resource_type = Some("user".to_string());
        assert!(matches!(
            appointment_resource_id(&e).unwrap_err(),
            Error::UndoUnsupported(t) if t == "user"
        ));

        let mut e = entry(7, Snapshot::scalar("Pendiente"), Snapshot::Empty);
        e.resource_id = None;
        assert!(matches!(
            appointment_resource_id(&e).unwrap_err(),
            Error::Unrecoverable { id: 7, .. }
        ));
    }

    #[test]
    fn test_double_undo_returns_to_intermediate_state() {
        // First entry: Confirmado went Pendiente -> Confirmada.
        let first = entry(
            10,
            Snapshot::from_stored(Some("{\"Confirmado\":\"Pendiente\"}")),
            Snapshot::from_stored(Some("{\"Confirmado\":\"Confirmada\"}")),
        );
        let plan = plan_undo(&first, true).unwrap();
        let restored = match plan {
            UndoPlan::RestoreRow { assignments } => assignments,
            other => panic!("expected RestoreRow, got {other:?}"),
        };
        assert_eq!(restored, vec![("Confirmado".to_string(), json!("Pendiente"))]);

        // The undo appended a forward entry: old = the pre-undo current
        // row, new = the restored snapshot. Undoing *that* entry puts
        // the row back to Confirmada.
        let current = full_row("Confirmada");
        let forward = entry(
            11,
            Snapshot::Row(current),
            Snapshot::Row(restored.into_iter().collect()),
        );
        match plan_undo(&forward, true).unwrap() {
            UndoPlan::RestoreRow { assignments } => {
                assert!(assignments
                    .iter()
                    .any(|(c, v)| c == "Confirmado" && v == "Confirmada"));
            }
            other => panic!("expected RestoreRow, got {other:?}"),
        }
    }
}
