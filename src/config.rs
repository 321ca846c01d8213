use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::models::Environment;

/// Per-environment connection details: each enabled environment has its
/// own database and storage base.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub database_url: String,
    pub storage_base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredProvider {
    Gemini,
    Claude,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub preferred: PreferredProvider,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub claude_api_key: Option<String>,
    pub claude_model: String,
    pub max_attempts: u32,
    pub extract_prompt_index: String,
    pub boost_prompt_index: String,
    pub extract_prompt_acte: String,
    pub boost_prompt_acte: String,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub min_index: usize,
    pub min_acte: usize,
    pub rebalance_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CapacityConfig {
    pub max_cpu: f64,
    pub max_ram_mb: f64,
    pub reserve_cpu_pct: f64,
    pub reserve_ram_pct: f64,
}

#[derive(Debug, Clone)]
pub struct RateConfig {
    pub rpm_safe_max: u64,
    pub tpm_safe_max: u64,
}

#[derive(Debug, Clone)]
pub struct StaleConfig {
    pub check_interval: Duration,
    pub threshold: Duration,
}

/// Immutable configuration built once at process start; no global mutable
/// state exists anywhere in this core.
#[derive(Debug, Clone)]
pub struct Config {
    pub environments: HashMap<Environment, EnvironmentConfig>,
    pub enabled_environments: Vec<Environment>,
    pub redis_url: String,
    pub pool: PoolConfig,
    pub capacity: CapacityConfig,
    pub rate: RateConfig,
    pub stale: StaleConfig,
    pub poll_interval: Duration,
    pub temp_dir: String,
    pub provider: ProviderConfig,
    pub sanitiser_enabled: bool,
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_var(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("{key}: invalid value '{v}', using default");
            default
        }),
        None => default,
    }
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded environment from {}", path.display()),
            Err(_) => tracing::info!("no .env file found, using process environment"),
        }

        let enabled_environments = env_var("OCR_ENABLED_ENVIRONMENTS")
            .unwrap_or_else(|| "prod".to_string())
            .split(',')
            .filter_map(|s| match s.trim() {
                "prod" => Some(Environment::Prod),
                "staging" => Some(Environment::Staging),
                "dev" => Some(Environment::Dev),
                "" => None,
                other => {
                    tracing::warn!("ignoring unknown environment '{other}' in OCR_ENABLED_ENVIRONMENTS");
                    None
                }
            })
            .collect::<Vec<_>>();

        if enabled_environments.is_empty() {
            return Err(anyhow!("OCR_ENABLED_ENVIRONMENTS must name at least one of prod, staging, dev"));
        }

        let mut environments = HashMap::new();
        for env_kind in &enabled_environments {
            let prefix = env_kind.as_str().to_uppercase();
            let database_url = env_var(&format!("{prefix}_DATABASE_URL"))
                .ok_or_else(|| anyhow!("{prefix}_DATABASE_URL is required for enabled environment '{}'", env_kind.as_str()))?;
            let storage_base_url = env_var(&format!("{prefix}_STORAGE_BASE_URL"))
                .ok_or_else(|| anyhow!("{prefix}_STORAGE_BASE_URL is required for enabled environment '{}'", env_kind.as_str()))?;
            environments.insert(*env_kind, EnvironmentConfig { database_url, storage_base_url });
        }

        let preferred = match env_var("OCR_PROVIDERS_PREFERRED").as_deref() {
            Some("claude") => PreferredProvider::Claude,
            _ => PreferredProvider::Gemini,
        };

        let gemini_api_key = env_var("GEMINI_API_KEY");
        let claude_api_key = env_var("CLAUDE_API_KEY");
        if gemini_api_key.is_none() && claude_api_key.is_none() {
            return Err(anyhow!("at least one of GEMINI_API_KEY or CLAUDE_API_KEY must be set"));
        }

        let provider = ProviderConfig {
            preferred,
            gemini_api_key,
            gemini_model: env_var("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-pro".to_string()),
            claude_api_key,
            claude_model: env_var("CLAUDE_MODEL").unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            max_attempts: env_parse("OCR_PROVIDER_MAX_ATTEMPTS", 3),
            extract_prompt_index: env_var("OCR_PROMPT_EXTRACT_INDEX").unwrap_or_default(),
            boost_prompt_index: env_var("OCR_PROMPT_BOOST_INDEX").unwrap_or_default(),
            extract_prompt_acte: env_var("OCR_PROMPT_EXTRACT_ACTE").unwrap_or_default(),
            boost_prompt_acte: env_var("OCR_PROMPT_BOOST_ACTE").unwrap_or_default(),
        };

        let pool_size: usize = env_parse("POOL_SIZE", 4);
        let min_index: usize = env_parse("POOL_MIN_INDEX", 1);
        let min_acte: usize = env_parse("POOL_MIN_ACTE", 1);
        if min_index + min_acte > pool_size {
            return Err(anyhow!(
                "POOL_MIN_INDEX ({min_index}) + POOL_MIN_ACTE ({min_acte}) exceeds POOL_SIZE ({pool_size})"
            ));
        }

        let config = Config {
            environments,
            enabled_environments,
            redis_url: env_var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            pool: PoolConfig {
                size: pool_size,
                min_index,
                min_acte,
                rebalance_interval: env_duration_ms("POOL_REBALANCE_INTERVAL_MS", 30_000),
            },
            capacity: CapacityConfig {
                max_cpu: env_parse("CAPACITY_MAX_CPU", 8.0),
                max_ram_mb: env_parse("CAPACITY_MAX_RAM_MB", 16_384.0),
                reserve_cpu_pct: env_parse("CAPACITY_RESERVE_CPU_PCT", 20.0),
                reserve_ram_pct: env_parse("CAPACITY_RESERVE_RAM_PCT", 20.0),
            },
            rate: RateConfig {
                rpm_safe_max: env_parse("RATE_RPM_SAFE_MAX", 800),
                tpm_safe_max: env_parse("RATE_TPM_SAFE_MAX", 800_000),
            },
            stale: StaleConfig {
                check_interval: env_duration_ms("STALE_CHECK_INTERVAL_MS", 60_000),
                threshold: env_duration_ms("STALE_THRESHOLD_MS", 600_000),
            },
            poll_interval: env_duration_ms("OCR_POLL_INTERVAL_MS", 7_000),
            temp_dir: env_var("OCR_TEMP_DIR").unwrap_or_else(|| std::env::temp_dir().to_string_lossy().to_string()),
            provider,
            sanitiser_enabled: env_parse("OCR_SANITISER_ENABLED", false),
        };

        tracing::info!(
            pool_size = config.pool.size,
            environments = ?config.enabled_environments,
            preferred_provider = ?config.provider.preferred,
            "configuration loaded"
        );

        Ok(config)
    }
}
