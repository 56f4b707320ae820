//! PostgreSQL rendering of the installed row security.
//!
//! The output is an idempotent migration plus the statements the application
//! runs per transaction and for coverage checks.

use crate::policy::{RowSecurityPolicyEngine, TENANT_COLUMN, TENANT_POLICY};
use practice_store::predicate::{quote_ident, quote_literal};
use std::fmt::Write;

impl RowSecurityPolicyEngine {
    /// Full migration for every declared table.
    pub fn render_sql(&self) -> String {
        let mut sql = String::new();
        sql.push_str("-- Tenant isolation: row level security\n");
        sql.push_str("BEGIN;\n\n");
        for schema in self.tables() {
            let column = schema.tenant_column.as_deref().unwrap_or(TENANT_COLUMN);
            sql.push_str(&self.render_table(&schema.name, column));
            sql.push('\n');
        }
        sql.push_str("COMMIT;\n\n");

        sql.push_str("-- Per-transaction binding (run first in every transaction)\n");
        sql.push_str(&self.render_binding());
        sql.push_str("\n\n-- Policy coverage\n");
        sql.push_str(&self.render_coverage_query());
        sql.push('\n');
        sql
    }

    fn render_table(&self, table: &str, column: &str) -> String {
        let policy = self.policy_for(column);
        let ident = quote_ident(table);
        let mut out = String::new();
        let _ = writeln!(out, "ALTER TABLE {ident} ENABLE ROW LEVEL SECURITY;");
        let _ = writeln!(out, "ALTER TABLE {ident} FORCE ROW LEVEL SECURITY;");
        let _ = writeln!(out, "DO $$");
        let _ = writeln!(out, "BEGIN");
        let _ = writeln!(
            out,
            "  IF NOT EXISTS (SELECT 1 FROM pg_policies WHERE schemaname = current_schema() AND tablename = {} AND policyname = {}) THEN",
            quote_literal(table),
            quote_literal(TENANT_POLICY)
        );
        let _ = writeln!(
            out,
            "    CREATE POLICY {} ON {ident} FOR ALL\n      USING {}\n      WITH CHECK {};",
            quote_ident(&policy.name),
            policy.using,
            policy.with_check
        );
        let _ = writeln!(out, "  END IF;");
        let _ = writeln!(out, "END");
        let _ = writeln!(out, "$$;");
        out
    }

    /// Binds tenant and role as transaction-local settings (`is_local = true`).
    pub fn render_binding(&self) -> String {
        let settings = self.settings();
        format!(
            "SELECT set_config({}, $1, true), set_config({}, $2, true);",
            quote_literal(&settings.tenant),
            quote_literal(&settings.role)
        )
    }

    /// Catalog query listing enforcement state for the declared tables.
    pub fn render_coverage_query(&self) -> String {
        let names: Vec<String> = self.tables().iter().map(|t| quote_literal(&t.name)).collect();
        format!(
            "SELECT c.relname AS table_name,\n       c.relrowsecurity AS rls_enabled,\n       c.relforcerowsecurity AS rls_forced,\n       count(p.policyname) AS policies\n  FROM pg_class c\n  JOIN pg_namespace n ON n.oid = c.relnamespace\n  LEFT JOIN pg_policies p ON p.schemaname = n.nspname AND p.tablename = c.relname\n WHERE n.nspname = current_schema()\n   AND c.relname IN ({})\n GROUP BY 1, 2, 3\n ORDER BY 1;",
            if names.is_empty() {
                "NULL".to_string()
            } else {
                names.join(", ")
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::binder::BindingSettings;
    use crate::policy::RowSecurityPolicyEngine;
    use practice_store::Engine;
    use std::sync::Arc;

    fn policies() -> RowSecurityPolicyEngine {
        let mut engine = RowSecurityPolicyEngine::new(Arc::new(Engine::new()), BindingSettings::default());
        engine.declare_all(["patients", "orders"]).unwrap();
        engine
    }

    #[test]
    fn test_migration_enables_and_forces_each_table() {
        let sql = policies().render_sql();
        for table in ["patients", "orders"] {
            assert!(sql.contains(&format!("ALTER TABLE \"{table}\" ENABLE ROW LEVEL SECURITY;")));
            assert!(sql.contains(&format!("ALTER TABLE \"{table}\" FORCE ROW LEVEL SECURITY;")));
        }
        assert_eq!(sql.matches("CREATE POLICY \"tenant_isolation\"").count(), 2);
        assert!(sql.contains(
            "USING (\"tenant_id\"::text = current_setting('app.tenant_id') OR current_setting('app.role') = 'platform_admin')"
        ));
    }

    #[test]
    fn test_binding_is_transaction_local() {
        assert_eq!(
            policies().render_binding(),
            "SELECT set_config('app.tenant_id', $1, true), set_config('app.role', $2, true);"
        );
    }

    #[test]
    fn test_coverage_query_lists_tables() {
        let query = policies().render_coverage_query();
        assert!(query.contains("IN ('patients', 'orders')"));
    }
}
