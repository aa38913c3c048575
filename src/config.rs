use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;

/// Ride policy and tuning used by the partitions and the client.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub partition_count: usize,
    /// Inclusive minimum battery level to begin a ride.
    pub min_battery: u8,
    /// Inclusive maximum rider-to-vehicle distance to begin a ride.
    pub max_pickup_distance_meters: f64,
    pub nearest_limit: usize,
    pub vehicle_id_length: usize,
    pub create_max_attempts: u32,
    pub confirm_retries: u32,
    pub confirm_backoff_ms: u64,
    pub compensation_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            partition_count: 4,
            min_battery: 10,
            max_pickup_distance_meters: 25.0,
            nearest_limit: 50,
            vehicle_id_length: 4,
            create_max_attempts: 32,
            confirm_retries: 50,
            confirm_backoff_ms: 5,
            compensation_backoff_ms: 50,
        }
    }
}

impl DispatchConfig {
    pub fn confirm_backoff(&self) -> Duration {
        Duration::from_millis(self.confirm_backoff_ms)
    }

    pub fn compensation_backoff(&self) -> Duration {
        Duration::from_millis(self.compensation_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub dispatch: DispatchConfig,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub kafka_enabled: bool,
    pub kafka_bootstrap_servers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_auto_offset_reset: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_username: String,
    pub kafka_password: String,
    pub kafka_security_protocol: String,
    pub kafka_max_retries: u32,
    pub kafka_circuit_breaker_cooldown: u64,
    pub log_level: String,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            partition_count: parsed_or("PARTITION_COUNT", defaults.partition_count).max(1),
            min_battery: parsed_or("MIN_BATTERY", defaults.min_battery),
            max_pickup_distance_meters: parsed_or(
                "MAX_PICKUP_DISTANCE_METERS",
                defaults.max_pickup_distance_meters,
            ),
            nearest_limit: parsed_or("NEAREST_LIMIT", defaults.nearest_limit),
            vehicle_id_length: parsed_or("VEHICLE_ID_LENGTH", defaults.vehicle_id_length).max(1),
            create_max_attempts: parsed_or("CREATE_MAX_ATTEMPTS", defaults.create_max_attempts),
            confirm_retries: parsed_or("CONFIRM_RETRIES", defaults.confirm_retries),
            confirm_backoff_ms: parsed_or("CONFIRM_BACKOFF_MS", defaults.confirm_backoff_ms),
            compensation_backoff_ms: parsed_or(
                "COMPENSATION_BACKOFF_MS",
                defaults.compensation_backoff_ms,
            ),
        };

        let store_backend = match var_or("STORE_BACKEND", "memory").to_lowercase().as_str() {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => anyhow::bail!("unknown STORE_BACKEND '{}'", other),
        };

        let db_host = var_or("DB_HOST", "localhost");
        let db_port = var_or("DB_PORT", "5432");
        let db_name = var_or("DB_DATABASE", "ride_dispatch");
        let db_user = var_or("DB_USER", "ride_dispatch");
        let db_pwd = var_or("DB_PWD", "ride_dispatch");

        let database_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            db_user, db_pwd, db_host, db_port, db_name
        );

        Ok(Self {
            dispatch,
            store_backend,
            database_url,
            kafka_enabled: parsed_or("KAFKA_ENABLED", false),
            kafka_bootstrap_servers: var_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            kafka_topic: var_or("KAFKA_TOPIC", "ride-dispatch-intake"),
            kafka_group_id: var_or("KAFKA_GROUP_ID", "ride-dispatch-consumer"),
            kafka_auto_offset_reset: var_or("KAFKA_AUTO_OFFSET_RESET", "latest"),
            kafka_sasl_mechanism: var_or("KAFKA_SASL_MECHANISM", "SCRAM-SHA-256"),
            kafka_username: env::var("KAFKA_USERNAME").unwrap_or_default(),
            kafka_password: env::var("KAFKA_PASSWORD").unwrap_or_default(),
            kafka_security_protocol: var_or("KAFKA_SECURITY_PROTOCOL", "SASL_PLAINTEXT"),
            kafka_max_retries: parsed_or("KAFKA_MAX_RETRIES", 5),
            kafka_circuit_breaker_cooldown: parsed_or("KAFKA_CIRCUIT_BREAKER_COOLDOWN", 300),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }
}
