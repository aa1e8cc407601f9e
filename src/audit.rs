//! Audit trail of profile changes: the append-only entries the backend produces and the
//! row rendering the admin view shows for them.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_AUDIT_LIMIT: usize = 50;

const UNKNOWN_USER: &str = "Desconocido";
const SYSTEM_ACTOR: &str = "Sistema";
const IGNORED_FIELDS: &[&str] = &["id", "created_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    pub fn label(self) -> &'static str {
        match self {
            AuditAction::Insert => "Creado",
            AuditAction::Update => "Actualizado",
            AuditAction::Delete => "Eliminado",
        }
    }

    pub fn badge_class(self) -> &'static str {
        match self {
            AuditAction::Insert => "badge-insert",
            AuditAction::Update => "badge-update",
            AuditAction::Delete => "badge-delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub action: AuditAction,
    pub table_name: String,
    #[serde(deserialize_with = "id_string")]
    pub record_id: String,
    #[serde(default)]
    pub old_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub new_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub changed_by: Option<String>,
    #[serde(default)]
    pub changed_by_name: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeSummary {
    Created { text: &'static str },
    Deleted { text: &'static str },
    Fields { changes: Vec<FieldChange> },
    None,
}

/// One rendered line of the audit table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditRow {
    pub id: String,
    pub date: String,
    pub action: &'static str,
    pub badge: &'static str,
    pub affected_user: String,
    pub changes: ChangeSummary,
    pub changed_by: String,
}

// bigint keys arrive as numbers, uuid keys as strings
fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected string or number id, got {}", other))),
    }
}

/// `dd/mm/yyyy, HH:MM:SS`.
pub fn format_date(at: &DateTime<Utc>) -> String {
    at.format("%d/%m/%Y, %H:%M:%S").to_string()
}

fn display_value(v: Option<&Value>) -> String {
    match v {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Fields of `new_data` whose value differs from `old_data`, skipping identity columns.
/// `None` unless both snapshots exist and at least one field differs.
pub fn changed_fields(old: Option<&Map<String, Value>>, new: Option<&Map<String, Value>>) -> Option<Vec<FieldChange>> {
    let (old, new) = (old?, new?);
    let changes: Vec<FieldChange> = new
        .iter()
        .filter(|(k, _)| !IGNORED_FIELDS.contains(&k.as_str()))
        .filter(|(k, v)| old.get(k.as_str()) != Some(*v))
        .map(|(k, v)| FieldChange {
            field: k.clone(),
            from: display_value(old.get(k.as_str())),
            to: display_value(Some(v)),
        })
        .collect();
    if changes.is_empty() { None } else { Some(changes) }
}

fn name_in(data: Option<&Map<String, Value>>) -> Option<String> {
    match data?.get("name")? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl AuditLogEntry {
    pub fn affected_user(&self) -> String {
        name_in(self.new_data.as_ref())
            .or_else(|| name_in(self.old_data.as_ref()))
            .unwrap_or_else(|| UNKNOWN_USER.to_string())
    }

    pub fn render(&self) -> AuditRow {
        let changes = match self.action {
            AuditAction::Insert => ChangeSummary::Created { text: "Nuevo usuario creado" },
            AuditAction::Delete => ChangeSummary::Deleted { text: "Usuario eliminado" },
            AuditAction::Update => match changed_fields(self.old_data.as_ref(), self.new_data.as_ref()) {
                Some(changes) => ChangeSummary::Fields { changes },
                None => ChangeSummary::None,
            },
        };
        AuditRow {
            id: self.id.clone(),
            date: format_date(&self.changed_at),
            action: self.action.label(),
            badge: self.action.badge_class(),
            affected_user: self.affected_user(),
            changes,
            changed_by: self
                .changed_by_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
        }
    }
}

/// Newest first, truncated to `limit`.
pub fn newest_first(mut entries: Vec<AuditLogEntry>, limit: usize) -> Vec<AuditLogEntry> {
    entries.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));
    entries.truncate(limit);
    entries
}
