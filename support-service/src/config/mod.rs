use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct SupportConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub providers: ProviderConfig,
    pub relay: RelayConfig,
    pub chat: ChatConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// OpenAI-compatible embedding/completion endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: String,
    pub embedding_model: String,
    /// Width of the `vector` column created for each partition.
    pub embedding_dimensions: u32,
    pub completion_model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Polling,
    Webhook,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub mode: RelayMode,
    pub bot_token: String,
    pub operator_chat_id: String,
    pub webhook_secret: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub session_ttl_secs: u64,
    pub history_limit: usize,
    pub prompt_history_turns: usize,
    pub query_cache_ttl_secs: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub tenant_cache_ttl_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 1800,
            history_limit: 20,
            prompt_history_turns: 10,
            query_cache_ttl_secs: 3600,
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
            tenant_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

impl SupportConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let defaults = ChatConfig::default();

        let config = SupportConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("support-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: get_env_parsed("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            providers: ProviderConfig {
                api_base: get_env("AI_API_BASE", Some("https://api.openai.com/v1"), is_prod)?,
                api_key: get_env("AI_API_KEY", None, is_prod)?,
                embedding_model: get_env(
                    "AI_EMBEDDING_MODEL",
                    Some("text-embedding-3-small"),
                    is_prod,
                )?,
                embedding_dimensions: get_env_parsed("AI_EMBEDDING_DIMENSIONS", "1536", is_prod)?,
                completion_model: get_env("AI_COMPLETION_MODEL", Some("gpt-4o-mini"), is_prod)?,
                max_tokens: get_env_parsed("AI_MAX_TOKENS", "800", is_prod)?,
                timeout_secs: get_env_parsed("AI_TIMEOUT_SECS", "60", is_prod)?,
                max_retries: get_env_parsed("AI_MAX_RETRIES", "3", is_prod)?,
            },
            relay: RelayConfig {
                mode: get_env("RELAY_MODE", Some("disabled"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
                bot_token: get_env("TELEGRAM_BOT_TOKEN", Some(""), is_prod)?,
                operator_chat_id: get_env("TELEGRAM_OPERATOR_CHAT_ID", Some(""), is_prod)?,
                webhook_secret: env::var("TELEGRAM_WEBHOOK_SECRET")
                    .ok()
                    .filter(|s| !s.is_empty()),
                api_base: get_env(
                    "TELEGRAM_API_BASE",
                    Some("https://api.telegram.org"),
                    is_prod,
                )?,
            },
            chat: ChatConfig {
                session_ttl_secs: get_env_parsed(
                    "CHAT_SESSION_TTL_SECS",
                    &defaults.session_ttl_secs.to_string(),
                    is_prod,
                )?,
                history_limit: get_env_parsed(
                    "CHAT_HISTORY_LIMIT",
                    &defaults.history_limit.to_string(),
                    is_prod,
                )?,
                prompt_history_turns: get_env_parsed(
                    "CHAT_PROMPT_HISTORY_TURNS",
                    &defaults.prompt_history_turns.to_string(),
                    is_prod,
                )?,
                query_cache_ttl_secs: get_env_parsed(
                    "CHAT_QUERY_CACHE_TTL_SECS",
                    &defaults.query_cache_ttl_secs.to_string(),
                    is_prod,
                )?,
                rate_limit_requests: get_env_parsed(
                    "RATE_LIMIT_REQUESTS",
                    &defaults.rate_limit_requests.to_string(),
                    is_prod,
                )?,
                rate_limit_window_secs: get_env_parsed(
                    "RATE_LIMIT_WINDOW_SECS",
                    &defaults.rate_limit_window_secs.to_string(),
                    is_prod,
                )?,
                tenant_cache_ttl_secs: get_env_parsed(
                    "TENANT_CACHE_TTL_SECS",
                    &defaults.tenant_cache_ttl_secs.to_string(),
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.chat.rate_limit_window_secs == 0 || self.chat.session_ttl_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RATE_LIMIT_WINDOW_SECS and CHAT_SESSION_TTL_SECS must be positive"
            )));
        }

        if self.chat.history_limit == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CHAT_HISTORY_LIMIT must be positive"
            )));
        }

        if self.relay.mode != RelayMode::Disabled
            && (self.relay.bot_token.is_empty() || self.relay.operator_chat_id.is_empty())
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_OPERATOR_CHAT_ID are required when RELAY_MODE is enabled"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.relay.mode == RelayMode::Webhook && self.relay.webhook_secret.is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "TELEGRAM_WEBHOOK_SECRET is required for webhook mode in production"
                )));
            }
        }

        Ok(())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polling" => Ok(RelayMode::Polling),
            "webhook" => Ok(RelayMode::Webhook),
            "disabled" => Ok(RelayMode::Disabled),
            _ => Err(format!("Invalid relay mode: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_mode_parses_case_insensitively() {
        assert_eq!("Polling".parse::<RelayMode>().unwrap(), RelayMode::Polling);
        assert_eq!("WEBHOOK".parse::<RelayMode>().unwrap(), RelayMode::Webhook);
        assert!("carrier-pigeon".parse::<RelayMode>().is_err());
    }

    #[test]
    fn chat_defaults_match_documented_windows() {
        let chat = ChatConfig::default();
        assert_eq!(chat.tenant_cache_ttl_secs, 300);
        assert_eq!(chat.history_limit, 20);
        assert_eq!(chat.rate_limit_window_secs, 60);
    }
}
