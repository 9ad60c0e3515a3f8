use serde_derive::Deserialize;

use crate::error::BigtableError;

pub const DEFAULT_DSN: &str = "grpc://bigtable.googleapis.com:443";

fn default_dsn() -> String {
    DEFAULT_DSN.to_owned()
}

/// Data-plane client settings.
///
/// The `dsn` string should be in the form of `grpc://{BigtableEndpoint}`,
/// where _BigTableEndpoint_ is the endpoint domain to use (the default is
/// `bigtable.googleapis.com`; the mTLS endpoint is
/// `bigtable.mtls.googleapis.com`).
///
/// _project_id_ and _instance_id_ are the Google project and instance
/// identifiers (see the Google developer console); tables are addressed as
/// `projects/{project_id}/instances/{instance_id}/tables/{table_id}`.
///
/// The `app_profile_id` selects server-side routing and policy; it is set on
/// every request body and carried in the request-params header.
#[derive(Clone, Debug, Deserialize)]
pub struct BigtableDbSettings {
    #[serde(default = "default_dsn")]
    pub dsn: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub app_profile_id: String,
    /// Max concurrent channels in the pool (default 4).
    #[serde(default)]
    pub database_pool_max_size: Option<u32>,
    /// Pool connection create timeout, in milliseconds.
    #[serde(default)]
    pub database_pool_connection_timeout: Option<u32>,
    /// Recycle connections older than this, in milliseconds.
    #[serde(default)]
    pub database_pool_connection_ttl: Option<u32>,
    /// Recycle connections idle longer than this, in milliseconds.
    #[serde(default)]
    pub database_pool_max_idle: Option<u32>,
    /// Per-RPC deadline, in milliseconds. Applies to every data RPC,
    /// including each attempt of a retried operation.
    #[serde(default)]
    pub operation_timeout: Option<u32>,
}

impl Default for BigtableDbSettings {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            project_id: String::default(),
            instance_id: String::default(),
            app_profile_id: String::default(),
            database_pool_max_size: None,
            database_pool_connection_timeout: None,
            database_pool_connection_ttl: None,
            database_pool_max_idle: None,
            operation_timeout: None,
        }
    }
}

impl BigtableDbSettings {
    pub fn instance_name(&self) -> String {
        format!(
            "projects/{}/instances/{}",
            self.project_id, self.instance_id
        )
    }

    /// Fully-qualified table name, the GRPC path to the data.
    pub fn table_name(&self, table_id: &str) -> String {
        format!("{}/tables/{}", self.instance_name(), table_id)
    }
}

impl TryFrom<&str> for BigtableDbSettings {
    type Error = BigtableError;

    fn try_from(setting_string: &str) -> Result<Self, Self::Error> {
        serde_json::from_str(setting_string)
            .map_err(|e| BigtableError::Validation(format!("Could not parse DbSettings: {e:?}")))
    }
}
