use serde::{Deserialize, Serialize};
use std::env;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub rooms: RoomConfig,
    pub queue: QueueConfig,
    pub cluster: ClusterConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub rest_api_url: String,
    /// Sliding-window event budget per user
    pub rate_limit_max_events: u32,
    pub rate_limit_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub max_users: usize,
    pub idle_threshold_ms: u64,
    pub sweep_interval_ms: u64,
    /// Optional salt used to hash room ids and prevent enumeration
    pub room_salt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub message_ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster store endpoint; adapter disabled when unset
    pub url: Option<String>,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub persist_queues: bool,
    pub persist_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_dir: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("LISTEN_PORT", 8001),
            },

            cors: CorsConfig {
                allowed_origins: env::var("FRONTEND_ORIGIN")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },

            auth: AuthConfig {
                jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
                rest_api_url: env::var("REST_API_URL")
                    .unwrap_or_else(|_| "http://localhost:8000".to_string()),
                rate_limit_max_events: env_parse("RATE_LIMIT_MAX_EVENTS", 100),
                rate_limit_window_ms: env_parse("RATE_LIMIT_WINDOW_MS", 60_000),
            },

            rooms: RoomConfig {
                max_users: env_parse("ROOM_MAX_USERS", 50),
                idle_threshold_ms: env_parse("ROOM_IDLE_THRESHOLD_MS", 30 * 60 * 1000),
                sweep_interval_ms: env_parse("ROOM_SWEEP_INTERVAL_MS", 30_000),
                room_salt: env::var("ROOM_SALT").ok().filter(|s| !s.is_empty()),
            },

            queue: QueueConfig {
                max_queue_size: env_parse("MAX_QUEUE_SIZE", 1_000),
                max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", 3),
                retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", 5_000),
                message_ttl_ms: env_parse("MESSAGE_TTL_MS", 7 * 24 * 60 * 60 * 1000),
            },

            cluster: ClusterConfig {
                url: env::var("CLUSTER_URL").ok().filter(|s| !s.is_empty()),
                max_reconnect_attempts: env_parse("CLUSTER_MAX_RECONNECT_ATTEMPTS", 10),
            },

            persistence: PersistenceConfig {
                persist_queues: env_parse("PERSIST_QUEUES", false),
                persist_dir: env::var("PERSIST_DIR")
                    .unwrap_or_else(|_| "./data/queues".to_string()),
            },

            logging: LoggingConfig {
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                log_dir: env::var("LOG_DIR").ok().filter(|s| !s.is_empty()),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8001,
            },
            cors: CorsConfig {
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            auth: AuthConfig {
                jwt_secret: "test-jwt-secret".to_string(),
                rest_api_url: "http://localhost:8000".to_string(),
                rate_limit_max_events: 100,
                rate_limit_window_ms: 60_000,
            },
            rooms: RoomConfig {
                max_users: 50,
                idle_threshold_ms: 30 * 60 * 1000,
                sweep_interval_ms: 30_000,
                room_salt: None,
            },
            queue: QueueConfig {
                max_queue_size: 1_000,
                max_retry_attempts: 3,
                retry_base_delay_ms: 5_000,
                message_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            },
            cluster: ClusterConfig {
                url: None,
                max_reconnect_attempts: 10,
            },
            persistence: PersistenceConfig {
                persist_queues: false,
                persist_dir: "./data/queues".to_string(),
            },
            logging: LoggingConfig {
                log_level: "info".to_string(),
                log_dir: None,
            },
        }
    }
}
