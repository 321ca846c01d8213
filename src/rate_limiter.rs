use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::CoreError;
use crate::provider::ProviderName;

/// Atomically checks the current 60s window's request/token counters
/// against the configured safe maxima and, if under budget, increments
/// them in the same round trip.
const CHECK_AND_RECORD_SCRIPT: &str = r#"
local rpm_key = KEYS[1]
local tpm_key = KEYS[2]
local rpm_max = tonumber(ARGV[1])
local tpm_max = tonumber(ARGV[2])
local tokens = tonumber(ARGV[3])

local current_rpm = tonumber(redis.call('GET', rpm_key) or '0')
local current_tpm = tonumber(redis.call('GET', tpm_key) or '0')

if current_rpm + 1 > rpm_max or current_tpm + tokens > tpm_max then
    return 0
end

redis.call('INCR', rpm_key)
redis.call('EXPIRE', rpm_key, 120)
redis.call('INCRBY', tpm_key, tokens)
redis.call('EXPIRE', tpm_key, 120)
return 1
"#;

pub struct RateLimiter {
    conn: ConnectionManager,
    rpm_safe_max: u64,
    tpm_safe_max: u64,
    script: Script,
}

impl RateLimiter {
    pub async fn connect(redis_url: &str, rpm_safe_max: u64, tpm_safe_max: u64) -> Result<Self, CoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| CoreError::RateLimiter(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::RateLimiter(e.to_string()))?;
        Ok(Self { conn, rpm_safe_max, tpm_safe_max, script: Script::new(CHECK_AND_RECORD_SCRIPT) })
    }

    fn window_key(provider: ProviderName, suffix: &str) -> String {
        let window = current_window_bucket();
        format!("ocr:ratelimit:{}:{}:{}", provider_slug(provider), window, suffix)
    }

    /// Returns `true` if the call is admitted under budget and the
    /// counters have been incremented; `false` if admitting it would
    /// exceed either the request or token budget for the current window.
    /// Fails open on store errors -- a degraded rate limiter must not
    /// stall the whole pipeline.
    pub async fn try_acquire(&mut self, provider: ProviderName, estimated_tokens: u64) -> bool {
        let rpm_key = Self::window_key(provider, "rpm");
        let tpm_key = Self::window_key(provider, "tpm");

        let result: redis::RedisResult<i32> = self
            .script
            .key(rpm_key)
            .key(tpm_key)
            .arg(self.rpm_safe_max)
            .arg(self.tpm_safe_max)
            .arg(estimated_tokens)
            .invoke_async(&mut self.conn)
            .await;

        match result {
            Ok(1) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "rate limiter store error, failing open");
                true
            }
        }
    }

    /// Records actual token usage after a call completes, correcting for
    /// any gap between the pre-call estimate and the real usage reported
    /// by the provider.
    pub async fn record_actual_tokens(&mut self, provider: ProviderName, actual_tokens: u64, estimated_tokens: u64) {
        if actual_tokens <= estimated_tokens {
            return;
        }
        let tpm_key = Self::window_key(provider, "tpm");
        let delta = actual_tokens - estimated_tokens;
        if let Err(e) = self.conn.incr::<_, _, i64>(&tpm_key, delta).await {
            tracing::warn!(error = %e, "failed to record actual token usage (ignored)");
        }
    }
}

fn provider_slug(provider: ProviderName) -> &'static str {
    match provider {
        ProviderName::GeminiVision => "gemini-vision",
        ProviderName::GeminiFile => "gemini-file",
        ProviderName::ClaudeVision => "claude-vision",
    }
}

/// 60-second fixed window used for RPM/TPM accounting.
fn current_window_bucket() -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now / 60
}
