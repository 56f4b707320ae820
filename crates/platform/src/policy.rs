//! Row security policies for tenant-scoped tables, and coverage checks.
//!
//! Every tenant-scoped table gets one permissive policy, enabled and forced:
//! a row is visible and writable only when its tenant column equals the bound
//! tenant, or the bound role is `platform_admin`.

use crate::binder::BindingSettings;
use practice_core::{IsolationError, IsolationResult, Role};
use practice_store::{Engine, Predicate, RowPolicy, StorageError, TableInfo, TableSchema};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the installed tenant isolation policy.
pub const TENANT_POLICY: &str = "tenant_isolation";

/// Default tenant column of tenant-scoped tables.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Result of installing the policy on one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed,
    AlreadyInstalled,
    /// A same-named policy with a different definition was replaced.
    Replaced,
}

/// Why a tenant-scoped table is not fully protected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyGap {
    MissingTable,
    RowSecurityDisabled,
    NoPolicy,
    /// Owner credentials bypass row security on this table.
    NotForced,
    DefinitionDrift { expected: String, actual: String },
    /// An extra permissive policy widens what the tenant policy admits.
    UnexpectedPolicy { policy: String },
}

/// Non-fatal warning: blocks deployment, never reaches end users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyGapWarning {
    pub table: String,
    pub gap: PolicyGap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    Covered,
    Gap,
    /// No tenant column; not subject to tenant isolation.
    Global,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCoverage {
    pub table: String,
    pub status: CoverageStatus,
    pub rls_enabled: bool,
    pub rls_forced: bool,
    pub policies: Vec<PolicyFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyFingerprint {
    pub name: String,
    pub sha256: String,
}

/// Policy coverage across the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub tables: Vec<TableCoverage>,
    pub gaps: Vec<PolicyGapWarning>,
}

impl CoverageReport {
    pub fn is_covered(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// SHA-256 over the rendered policy definition.
pub fn fingerprint(policy: &RowPolicy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy.name.as_bytes());
    hasher.update(b"\nUSING ");
    hasher.update(policy.using.to_string().as_bytes());
    hasher.update(b"\nWITH CHECK ");
    hasher.update(policy.with_check.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Installs and audits row security on the tenant-scoped tables.
pub struct RowSecurityPolicyEngine {
    engine: Arc<Engine>,
    settings: BindingSettings,
    tables: Vec<TableSchema>,
}

impl RowSecurityPolicyEngine {
    pub fn new(engine: Arc<Engine>, settings: BindingSettings) -> Self {
        Self {
            engine,
            settings,
            tables: Vec::new(),
        }
    }

    /// Declare a tenant-scoped table; it is created if missing.
    pub fn declare(&mut self, schema: TableSchema) -> IsolationResult<()> {
        if schema.tenant_column.is_none() {
            return Err(IsolationError::Validation(format!(
                "{} has no tenant column",
                schema.name
            )));
        }
        self.engine.create_table(schema.clone());
        if !self.tables.iter().any(|t| t.name == schema.name) {
            self.tables.push(schema);
        }
        Ok(())
    }

    pub fn declare_all<I, S>(&mut self, names: I) -> IsolationResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.declare(TableSchema::tenant_scoped(name, TENANT_COLUMN))?;
        }
        Ok(())
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn settings(&self) -> &BindingSettings {
        &self.settings
    }

    /// `tenant_column = bound tenant OR bound role = platform_admin`.
    pub fn tenant_predicate(&self, tenant_column: &str) -> Predicate {
        Predicate::Any(vec![
            Predicate::ColumnEqualsSetting {
                column: tenant_column.to_string(),
                setting: self.settings.tenant.clone(),
            },
            Predicate::SettingEquals {
                setting: self.settings.role.clone(),
                value: Role::PlatformAdmin.as_str().to_string(),
            },
        ])
    }

    /// The expected tenant policy for a table.
    pub fn policy_for(&self, tenant_column: &str) -> RowPolicy {
        let predicate = self.tenant_predicate(tenant_column);
        RowPolicy::new(TENANT_POLICY, predicate.clone(), predicate)
    }

    /// Install the tenant policy on one declared table. Idempotent.
    pub fn install(&self, table: &str) -> IsolationResult<InstallOutcome> {
        let schema = self.declared(table)?;
        let column = schema.tenant_column.as_deref().unwrap_or(TENANT_COLUMN);
        let expected = self.policy_for(column);
        let info = self.engine.table_info(table)?;

        let mut outcome = match info.policies.iter().find(|p| p.name == TENANT_POLICY) {
            Some(existing) if *existing == expected => InstallOutcome::AlreadyInstalled,
            Some(_) => {
                self.engine.drop_policy(table, TENANT_POLICY)?;
                self.create_policy(table, expected)?;
                InstallOutcome::Replaced
            }
            None => {
                self.create_policy(table, expected)?;
                InstallOutcome::Installed
            }
        };

        if !(info.rls_enabled && info.rls_forced) {
            self.engine.enable_row_security(table, true)?;
            if outcome == InstallOutcome::AlreadyInstalled {
                outcome = InstallOutcome::Installed;
            }
        }

        match outcome {
            InstallOutcome::AlreadyInstalled => {}
            _ => info!(table = %table, outcome = ?outcome, "Row security installed"),
        }
        Ok(outcome)
    }

    /// Install on every declared table, in declaration order.
    pub fn install_all(&self) -> IsolationResult<Vec<(String, InstallOutcome)>> {
        self.tables
            .iter()
            .map(|t| Ok((t.name.clone(), self.install(&t.name)?)))
            .collect()
    }

    fn create_policy(&self, table: &str, policy: RowPolicy) -> IsolationResult<()> {
        match self.engine.create_policy(table, policy) {
            // A concurrent installer won; the definition is checked by coverage.
            Ok(()) | Err(StorageError::PolicyExists { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn declared(&self, table: &str) -> IsolationResult<&TableSchema> {
        self.tables.iter().find(|t| t.name == table).ok_or_else(|| {
            IsolationError::Validation(format!("{table} is not a declared tenant table"))
        })
    }

    /// Every table in the catalog plus any declared table that is missing.
    ///
    /// A table is tenant-scoped if it is declared or has a tenant column.
    pub fn coverage_report(&self) -> CoverageReport {
        let catalog = self.engine.catalog();
        let mut tables = Vec::new();
        let mut gaps = Vec::new();

        for info in &catalog {
            let declared = self.tables.iter().find(|t| t.name == info.name);
            let column = declared
                .and_then(|t| t.tenant_column.as_deref())
                .or(info.tenant_column.as_deref());

            let status = match column {
                None => CoverageStatus::Global,
                Some(column) => {
                    let table_gaps = self.table_gaps(info, column);
                    let status = if table_gaps.is_empty() {
                        CoverageStatus::Covered
                    } else {
                        CoverageStatus::Gap
                    };
                    gaps.extend(table_gaps.into_iter().map(|gap| PolicyGapWarning {
                        table: info.name.clone(),
                        gap,
                    }));
                    status
                }
            };

            tables.push(TableCoverage {
                table: info.name.clone(),
                status,
                rls_enabled: info.rls_enabled,
                rls_forced: info.rls_forced,
                policies: info
                    .policies
                    .iter()
                    .map(|p| PolicyFingerprint {
                        name: p.name.clone(),
                        sha256: fingerprint(p),
                    })
                    .collect(),
            });
        }

        for schema in &self.tables {
            if !catalog.iter().any(|i| i.name == schema.name) {
                gaps.push(PolicyGapWarning {
                    table: schema.name.clone(),
                    gap: PolicyGap::MissingTable,
                });
            }
        }

        for warning in &gaps {
            warn!(table = %warning.table, gap = ?warning.gap, "Policy gap detected");
        }
        CoverageReport { tables, gaps }
    }

    fn table_gaps(&self, info: &TableInfo, column: &str) -> Vec<PolicyGap> {
        let mut gaps = Vec::new();
        if !info.rls_enabled {
            gaps.push(PolicyGap::RowSecurityDisabled);
        } else if !info.rls_forced {
            gaps.push(PolicyGap::NotForced);
        }

        let expected = self.policy_for(column);
        match info.policies.iter().find(|p| p.name == TENANT_POLICY) {
            None => gaps.push(PolicyGap::NoPolicy),
            Some(actual) if *actual != expected => gaps.push(PolicyGap::DefinitionDrift {
                expected: fingerprint(&expected),
                actual: fingerprint(actual),
            }),
            Some(_) => {}
        }
        for extra in info.policies.iter().filter(|p| p.name != TENANT_POLICY) {
            gaps.push(PolicyGap::UnexpectedPolicy {
                policy: extra.name.clone(),
            });
        }
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(tables: &[&str]) -> (Arc<Engine>, RowSecurityPolicyEngine) {
        let engine = Arc::new(Engine::new());
        let mut policies = RowSecurityPolicyEngine::new(engine.clone(), BindingSettings::default());
        policies.declare_all(tables.iter().copied()).unwrap();
        (engine, policies)
    }

    #[test]
    fn test_install_is_idempotent() {
        let (engine, policies) = engine_with(&["patients"]);
        assert_eq!(policies.install("patients").unwrap(), InstallOutcome::Installed);
        assert_eq!(
            policies.install("patients").unwrap(),
            InstallOutcome::AlreadyInstalled
        );
        assert_eq!(engine.policies("patients").unwrap().len(), 1);
        assert!(policies.coverage_report().is_covered());
    }

    #[test]
    fn test_drifted_policy_is_replaced() {
        let (engine, policies) = engine_with(&["orders"]);
        let loose = RowPolicy::new(TENANT_POLICY, Predicate::All(vec![]), Predicate::All(vec![]));
        engine.create_policy("orders", loose).unwrap();
        engine.enable_row_security("orders", true).unwrap();

        let report = policies.coverage_report();
        assert!(matches!(
            report.gaps[0].gap,
            PolicyGap::DefinitionDrift { .. }
        ));

        assert_eq!(policies.install("orders").unwrap(), InstallOutcome::Replaced);
        assert!(policies.coverage_report().is_covered());
    }

    #[test]
    fn test_coverage_reports_each_gap() {
        let (engine, policies) = engine_with(&["patients", "invoices"]);
        policies.install("patients").unwrap();
        engine.unforce_row_security("patients").unwrap();
        engine.create_table(TableSchema::global("feature_flags"));

        let report = policies.coverage_report();
        let gaps: Vec<_> = report
            .gaps
            .iter()
            .map(|g| (g.table.as_str(), g.gap.clone()))
            .collect();
        assert!(gaps.contains(&("patients", PolicyGap::NotForced)));
        assert!(gaps.contains(&("invoices", PolicyGap::RowSecurityDisabled)));
        assert!(gaps.contains(&("invoices", PolicyGap::NoPolicy)));

        let flags = report
            .tables
            .iter()
            .find(|t| t.table == "feature_flags")
            .unwrap();
        assert_eq!(flags.status, CoverageStatus::Global);
    }

    #[test]
    fn test_undeclared_tenant_table_is_a_gap() {
        let (engine, policies) = engine_with(&[]);
        engine.create_table(TableSchema::tenant_scoped("lab_results", "tenant_id"));
        let report = policies.coverage_report();
        assert!(!report.is_covered());
        assert_eq!(report.gaps[0].table, "lab_results");
    }

    #[test]
    fn test_extra_permissive_policy_flagged() {
        let (engine, policies) = engine_with(&["orders"]);
        policies.install("orders").unwrap();
        engine
            .create_policy(
                "orders",
                RowPolicy::new("open_all", Predicate::All(vec![]), Predicate::All(vec![])),
            )
            .unwrap();
        let report = policies.coverage_report();
        assert_eq!(
            report.gaps,
            vec![PolicyGapWarning {
                table: "orders".into(),
                gap: PolicyGap::UnexpectedPolicy {
                    policy: "open_all".into()
                },
            }]
        );
    }

    #[test]
    fn test_fingerprint_tracks_definition() {
        let (_, policies) = engine_with(&[]);
        let a = policies.policy_for("tenant_id");
        let b = policies.policy_for("org_id");
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_declare_requires_tenant_column() {
        let (_, mut policies) = engine_with(&[]);
        assert!(policies.declare(TableSchema::global("settings")).is_err());
    }
}
