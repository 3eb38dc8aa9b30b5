//! Environment-driven configuration, read once at boot. Grounded on
//! `bpi-core/src/commands/config.rs`'s load/save shape, simplified to the
//! environment-variable-only surface this spec calls for, the way
//! `bin/domain_api_server.rs` reads `DATABASE_URL` / `JWT_SECRET` / `PORT`.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    #[serde(default = "default_base_data_dir")]
    pub base_data_dir: String,

    #[serde(default = "default_local_node_id")]
    pub local_node_id: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    #[serde(default = "default_control_port")]
    pub control_port: u16,

    #[serde(default)]
    pub sql_binary_path: Option<String>,

    #[serde(default)]
    pub cache_binary_path: Option<String>,

    #[serde(default)]
    pub gateway_binary_path: Option<String>,
}

fn default_database_url() -> String {
    "sqlite://namespace_provisioner.db".to_string()
}
fn default_base_domain() -> String {
    "devnet-orama.network".to_string()
}
fn default_base_data_dir() -> String {
    "/var/lib/namespace-provisioner".to_string()
}
fn default_local_node_id() -> String {
    "local".to_string()
}
fn default_server_port() -> u16 {
    8088
}
fn default_control_port() -> u16 {
    8089
}

impl ProvisionerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("database_url", default_database_url())?
            .set_default("base_domain", default_base_domain())?
            .set_default("base_data_dir", default_base_data_dir())?
            .set_default("local_node_id", default_local_node_id())?
            .set_default("server_port", default_server_port() as i64)?
            .set_default("control_port", default_control_port() as i64)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
