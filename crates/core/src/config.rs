use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `PRACTICE_CLOUD__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Deployment environment. Development surfaces internal error detail
/// to callers; production keeps every internal failure opaque.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

/// Login role used by pooled connections.
///
/// `Owner` mirrors an application role that owns the tables: row security
/// only applies to it when the table forces row security.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Credential {
    #[default]
    Owner,
    Restricted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    /// Clear connection-persistent settings on every checkout.
    #[serde(default = "default_reset_on_checkout")]
    pub reset_on_checkout: bool,
    #[serde(default = "default_tenant_setting")]
    pub tenant_setting: String,
    #[serde(default = "default_role_setting")]
    pub role_setting: String,
    #[serde(default)]
    pub credential: Credential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IsolationConfig {
    /// Tables holding tenant-scoped resources. Each gets a row policy.
    #[serde(default = "default_tenant_tables")]
    pub tenant_tables: Vec<String>,
    /// Refuse to serve traffic while any tenant table has a policy gap.
    #[serde(default = "default_enforce_policy_coverage")]
    pub enforce_policy_coverage: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_pool_size() -> usize {
    16
}
fn default_checkout_timeout_ms() -> u64 {
    5000
}
fn default_reset_on_checkout() -> bool {
    true
}
fn default_tenant_setting() -> String {
    "app.tenant_id".to_string()
}
fn default_role_setting() -> String {
    "app.role".to_string()
}
fn default_tenant_tables() -> Vec<String> {
    vec![
        "patients".to_string(),
        "orders".to_string(),
        "prescriptions".to_string(),
        "invoices".to_string(),
    ]
}
fn default_enforce_policy_coverage() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            reset_on_checkout: default_reset_on_checkout(),
            tenant_setting: default_tenant_setting(),
            role_setting: default_role_setting(),
            credential: Credential::default(),
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            tenant_tables: default_tenant_tables(),
            enforce_policy_coverage: default_enforce_policy_coverage(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            environment: Environment::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            isolation: IsolationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PRACTICE_CLOUD")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("isolation.tenant_tables"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
