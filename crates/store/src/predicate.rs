//! Declarative row-security predicates and query filters.

use crate::engine::Row;
use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Read access to the settings visible to the current statement.
pub trait SettingLookup {
    fn setting(&self, name: &str) -> Option<&str>;
}

impl SettingLookup for HashMap<String, String> {
    fn setting(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// Boolean expression over a row and the bound settings.
///
/// Renders (via `Display`) as the equivalent PostgreSQL expression, so the
/// same definition drives the in-process engine and SQL migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    ColumnEqualsSetting { column: String, setting: String },
    SettingEquals { setting: String, value: String },
    Any(Vec<Predicate>),
    All(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate left to right. An unset setting is an error, never `false`.
    pub fn evaluate(&self, row: &Row, settings: &dyn SettingLookup) -> StorageResult<bool> {
        match self {
            Predicate::ColumnEqualsSetting { column, setting } => {
                let bound = lookup(settings, setting)?;
                Ok(row.get_str(column) == Some(bound))
            }
            Predicate::SettingEquals { setting, value } => {
                Ok(lookup(settings, setting)? == value.as_str())
            }
            Predicate::Any(preds) => {
                for p in preds {
                    if p.evaluate(row, settings)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::All(preds) => {
                for p in preds {
                    if !p.evaluate(row, settings)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Every setting the predicate reads.
    pub fn settings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_settings(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_settings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::ColumnEqualsSetting { setting, .. }
            | Predicate::SettingEquals { setting, .. } => out.push(setting),
            Predicate::Any(preds) | Predicate::All(preds) => {
                for p in preds {
                    p.collect_settings(out);
                }
            }
        }
    }
}

fn lookup<'a>(settings: &'a dyn SettingLookup, name: &str) -> StorageResult<&'a str> {
    settings
        .setting(name)
        .ok_or_else(|| StorageError::UnsetSetting(name.to_string()))
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::ColumnEqualsSetting { column, setting } => write!(
                f,
                "{}::text = current_setting({})",
                quote_ident(column),
                quote_literal(setting)
            ),
            Predicate::SettingEquals { setting, value } => write!(
                f,
                "current_setting({}) = {}",
                quote_literal(setting),
                quote_literal(value)
            ),
            Predicate::Any(preds) => join(f, preds, " OR ", "false"),
            Predicate::All(preds) => join(f, preds, " AND ", "true"),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, preds: &[Predicate], sep: &str, empty: &str) -> fmt::Result {
    if preds.is_empty() {
        return f.write_str(empty);
    }
    f.write_str("(")?;
    for (i, p) in preds.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{p}")?;
    }
    f.write_str(")")
}

/// Double-quote an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A permissive row policy covering select, insert, update and delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowPolicy {
    pub name: String,
    /// Which existing rows are visible, updatable and deletable.
    pub using: Predicate,
    /// Which new or updated rows may be written.
    pub with_check: Predicate,
}

impl RowPolicy {
    pub fn new(name: impl Into<String>, using: Predicate, with_check: Predicate) -> Self {
        Self {
            name: name.into(),
            using,
            with_check,
        }
    }
}

/// Application-side filter applied after row security.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Id(Uuid),
    Eq(String, Value),
    /// Inclusive range over an integer column.
    Between { column: String, from: i64, to: i64 },
    All(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Id(id) => row.id == *id,
            Filter::Eq(column, value) => row.values.get(column) == Some(value),
            Filter::Between { column, from, to } => row
                .values
                .get(column)
                .and_then(Value::as_i64)
                .is_some_and(|v| v >= *from && v <= *to),
            Filter::All(filters) => filters.iter().all(|f| f.matches(row)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant_predicate() -> Predicate {
        Predicate::Any(vec![
            Predicate::ColumnEqualsSetting {
                column: "tenant_id".into(),
                setting: "app.tenant_id".into(),
            },
            Predicate::SettingEquals {
                setting: "app.role".into(),
                value: "platform_admin".into(),
            },
        ])
    }

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn row(tenant: &str) -> Row {
        Row::new(json!({ "tenant_id": tenant }).as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_tenant_match_and_admin_override() {
        let p = tenant_predicate();
        let acme = settings(&[("app.tenant_id", "acme"), ("app.role", "tenant_user")]);
        let admin = settings(&[("app.tenant_id", ""), ("app.role", "platform_admin")]);

        assert!(p.evaluate(&row("acme"), &acme).unwrap());
        assert!(!p.evaluate(&row("globex"), &acme).unwrap());
        assert!(p.evaluate(&row("globex"), &admin).unwrap());
    }

    #[test]
    fn test_unset_setting_is_an_error() {
        let p = tenant_predicate();
        let err = p.evaluate(&row("acme"), &HashMap::new()).unwrap_err();
        assert_eq!(err, StorageError::UnsetSetting("app.tenant_id".into()));
    }

    #[test]
    fn test_renders_postgres_expression() {
        assert_eq!(
            tenant_predicate().to_string(),
            "(\"tenant_id\"::text = current_setting('app.tenant_id') OR current_setting('app.role') = 'platform_admin')"
        );
        assert_eq!(Predicate::Any(vec![]).to_string(), "false");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_settings_are_collected_once() {
        assert_eq!(tenant_predicate().settings(), vec!["app.role", "app.tenant_id"]);
    }

    #[test]
    fn test_filters() {
        let r = Row::new(
            json!({ "kind": "order", "ts": 50 })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );
        assert!(Filter::eq("kind", "order").matches(&r));
        assert!(!Filter::eq("kind", "invoice").matches(&r));
        assert!(Filter::Between {
            column: "ts".into(),
            from: 10,
            to: 50
        }
        .matches(&r));
        assert!(!Filter::All(vec![Filter::eq("kind", "order"), Filter::Id(Uuid::new_v4())]).matches(&r));
    }
}
