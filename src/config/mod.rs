use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub security: SecurityConfig,
    pub schema: SchemaConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
}

/// Upstream conversational AI provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Timeout for blocking chat calls. Streaming calls never time out.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

/// Where the entity-definition source text lives. The capability map is
/// built from every `.entity` file under `models_dir` (recursive), falling
/// back to `root_file` when the directory yields nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub models_dir: String,
    pub root_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub history_page_size: i64,
    pub messages_page_size: i64,
    pub max_page_size: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout_secs =
                v.parse().unwrap_or(self.database.connection_timeout_secs);
        }

        // Provider overrides
        if let Ok(v) = env::var("PROVIDER_BASE_URL") {
            self.provider.base_url = v;
        }
        if let Ok(v) = env::var("PROVIDER_API_KEY") {
            self.provider.api_key = v;
        }
        if let Ok(v) = env::var("PROVIDER_REQUEST_TIMEOUT_SECS") {
            self.provider.request_timeout_secs =
                v.parse().unwrap_or(self.provider.request_timeout_secs);
        }

        // Security overrides
        if let Ok(v) = env::var("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Schema overrides
        if let Ok(v) = env::var("SCHEMA_MODELS_DIR") {
            self.schema.models_dir = v;
        }
        if let Ok(v) = env::var("SCHEMA_ROOT_FILE") {
            self.schema.root_file = v;
        }

        // API overrides
        if let Ok(v) = env::var("API_HISTORY_PAGE_SIZE") {
            self.api.history_page_size = v.parse().unwrap_or(self.api.history_page_size);
        }
        if let Ok(v) = env::var("API_MESSAGES_PAGE_SIZE") {
            self.api.messages_page_size = v.parse().unwrap_or(self.api.messages_page_size);
        }
        if let Ok(v) = env::var("API_MAX_PAGE_SIZE") {
            self.api.max_page_size = v.parse().unwrap_or(self.api.max_page_size);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig { max_connections: 10, connection_timeout_secs: 30 },
            provider: ProviderConfig {
                base_url: "http://localhost:8080/v1".to_string(),
                api_key: String::new(),
                request_timeout_secs: 30,
            },
            security: SecurityConfig {
                jwt_secret: "dev-secret-change-me".to_string(),
                jwt_expiry_hours: 24 * 7,
                enable_cors: true,
                cors_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ],
            },
            schema: SchemaConfig {
                models_dir: "schema/models".to_string(),
                root_file: "schema/entities.entity".to_string(),
            },
            api: ApiConfig { history_page_size: 20, messages_page_size: 50, max_page_size: 200 },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig { max_connections: 20, connection_timeout_secs: 10 },
            provider: ProviderConfig {
                base_url: String::new(),
                api_key: String::new(),
                request_timeout_secs: 30,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
            },
            schema: SchemaConfig {
                models_dir: "schema/models".to_string(),
                root_file: "schema/entities.entity".to_string(),
            },
            api: ApiConfig { history_page_size: 20, messages_page_size: 50, max_page_size: 200 },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig { max_connections: 50, connection_timeout_secs: 5 },
            provider: ProviderConfig {
                base_url: String::new(),
                api_key: String::new(),
                request_timeout_secs: 30,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
            },
            schema: SchemaConfig {
                models_dir: "schema/models".to_string(),
                root_file: "schema/entities.entity".to_string(),
            },
            api: ApiConfig { history_page_size: 20, messages_page_size: 50, max_page_size: 100 },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_development_config() {
        let config = AppConfig::development();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.schema.models_dir, "schema/models");
        assert_eq!(config.api.history_page_size, 20);
    }

    #[test]
    fn test_default_production_config() {
        let config = AppConfig::production();
        assert_eq!(config.database.max_connections, 50);
        assert_eq!(config.security.jwt_expiry_hours, 4);
        assert!(config.security.jwt_secret.is_empty());
    }
}
