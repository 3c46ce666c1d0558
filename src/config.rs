use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub local_enabled: bool,
    pub remote_enabled: bool,
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub device_id: Option<String>,
    pub data_directory: String,
    pub bundle_directory: Option<String>,
    pub log_level: String,
}

impl SearchConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            .build()?;

        s.try_deserialize()
    }
}
