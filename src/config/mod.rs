use dotenv::dotenv;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub jwt_secret: String,
    pub jwt_expiry: i64,
    pub refresh_token_expiry: i64,
    pub migrations_dir: String,
    pub metrics_enabled: bool,
    // Auth-surface rate limiting: requests per caller per window.
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    // Logging is handled by an external collaborator; the options are
    // recognized here so one env surface configures the whole binary.
    pub log_mode: String,
    pub log_level: String,
    pub log_format: String,
    pub log_file: String,
    pub log_max_size: u64,
    pub log_max_age: u64,
    pub log_max_backups: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8080)?
            .set_default("db_path", "./data.db")?
            .set_default("jwt_expiry", 3600)?
            .set_default("refresh_token_expiry", 604_800)?
            .set_default("migrations_dir", "./migrations")?
            .set_default("metrics_enabled", false)?
            .set_default("rate_limit_max", 10)?
            .set_default("rate_limit_window_secs", 60)?
            .set_default("log_mode", "console")?
            .set_default("log_level", "info")?
            .set_default("log_format", "text")?
            .set_default("log_file", "./sblite.log")?
            .set_default("log_max_size", 100)?
            .set_default("log_max_age", 30)?
            .set_default("log_max_backups", 5)?
            .add_source(config::Environment::default());

        let config: Config = builder.build()?.try_deserialize()?;

        if config.jwt_secret.len() < 32 {
            return Err(config::ConfigError::Message(
                "JWT_SECRET must be at least 32 bytes".to_string(),
            ));
        }

        Ok(config)
    }
}

pub fn init() {
    dotenv().ok();
}
