//! Environment-backed configuration.
//!
//! Every binary calls [`bootstrap_env`] once (dev-time `.env.local` loading,
//! silent when the file is absent — production injects env vars directly) and
//! then builds a [`Settings`] snapshot. Nothing here reads the environment
//! after construction, so tests can build `Settings` by hand.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;

/// Load `.env.local` if present. Call once at process start.
pub fn bootstrap_env() {
    let _ = dotenvy::from_filename(".env.local");
}

/// Consultation puller mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EtlMode {
    #[default]
    Incremental,
    OpenUpdate,
}

impl FromStr for EtlMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incremental" => Ok(EtlMode::Incremental),
            "open_update" => Ok(EtlMode::OpenUpdate),
            other => Err(anyhow::anyhow!("unknown ETL_MODE: {other}")),
        }
    }
}

/// Immutable settings snapshot shared by all components.
#[derive(Debug, Clone)]
pub struct Settings {
    // OData
    pub odata_base_url: String,
    pub odata_user: String,
    pub odata_password: String,

    // Chat platform
    pub chat_api_url: String,
    pub chat_api_token: String,
    pub chat_account_id: String,
    /// Shared secret for webhook HMAC. Empty tolerates unsigned webhooks
    /// (development only).
    pub chat_webhook_secret: String,

    // Database
    pub database_url: String,

    // ETL tuning
    pub page_size: i64,
    pub initial_from_date: NaiveDate,
    pub incremental_buffer_days: i64,
    pub max_keys_per_request: usize,
    pub etl_mode: EtlMode,
    pub max_error_logs: usize,

    // Reference keys of the language catalog entries in ERP.
    pub lang_ru_key: String,
    pub lang_uz_key: String,

    // Behavior toggles
    pub send_queue_wait_time_message: bool,
    /// Working hours in the operator catalog are local to the business.
    pub business_tz: Tz,

    // Webhook daemon
    pub webhook_bind_addr: String,

    pub http_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let initial_from_raw = env_or("INITIAL_FROM_DATE", "2025-01-01");
        let initial_from_date = NaiveDate::parse_from_str(&initial_from_raw, "%Y-%m-%d")
            .with_context(|| format!("INITIAL_FROM_DATE is not YYYY-MM-DD: {initial_from_raw}"))?;

        let tz_raw = env_or("BUSINESS_TZ", "Asia/Tashkent");
        let business_tz: Tz = tz_raw
            .parse()
            .map_err(|e| anyhow::anyhow!("BUSINESS_TZ is not a known timezone ({tz_raw}): {e}"))?;

        Ok(Settings {
            odata_base_url: env_or("ODATA_BASE_URL", ""),
            odata_user: env_or("ODATA_USER", ""),
            odata_password: env_or("ODATA_PASSWORD", ""),

            chat_api_url: env_or("CHAT_API_URL", ""),
            chat_api_token: env_or("CHAT_API_TOKEN", ""),
            chat_account_id: env_or("CHAT_ACCOUNT_ID", "1"),
            chat_webhook_secret: env_or("CHAT_WEBHOOK_SECRET", ""),

            database_url: database_url_from_env(),

            page_size: env_parse("PAGE_SIZE", 1000)?,
            initial_from_date,
            incremental_buffer_days: env_parse("INCREMENTAL_BUFFER_DAYS", 7)?,
            max_keys_per_request: env_parse("MAX_KEYS_PER_REQUEST", 40)?,
            etl_mode: env_parse("ETL_MODE", EtlMode::Incremental)?,
            max_error_logs: env_parse("MAX_ERROR_LOGS", 10)?,

            lang_ru_key: env_or("LANG_RU_KEY", "15d38cda-1812-11ef-b824-c67597d01fa8"),
            lang_uz_key: env_or("LANG_UZ_KEY", "15d38cdb-1812-11ef-b824-c67597d01fa8"),

            send_queue_wait_time_message: env_parse("SEND_QUEUE_WAIT_TIME_MESSAGE", true)?,
            business_tz,

            webhook_bind_addr: env_or("WEBHOOK_BIND_ADDR", "127.0.0.1:8088"),

            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 120u64)?),
        })
    }

    /// Fail fast when the OData side is not configured.
    pub fn require_odata(&self) -> Result<()> {
        if self.odata_base_url.is_empty() || self.odata_user.is_empty() {
            anyhow::bail!("OData config missing: check ODATA_BASE_URL, ODATA_USER, ODATA_PASSWORD");
        }
        Ok(())
    }

    /// Fail fast when the chat side is not configured.
    pub fn require_chat(&self) -> Result<()> {
        if self.chat_api_url.is_empty() || self.chat_api_token.is_empty() {
            anyhow::bail!("chat config missing: check CHAT_API_URL, CHAT_API_TOKEN");
        }
        Ok(())
    }

    /// Unsigned webhooks are tolerated only while no secret is configured.
    pub fn webhook_signature_required(&self) -> bool {
        !self.chat_webhook_secret.is_empty()
    }
}

/// `DATABASE_URL` wins; otherwise the URL is assembled from the individual
/// `DB_*` variables.
fn database_url_from_env() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            return url;
        }
    }
    let user = env_or("DB_USER", "postgres");
    let pass = env_or("DB_PASS", "");
    let host = env_or("DB_HOST", "127.0.0.1");
    let port = env_or("DB_PORT", "5432");
    let name = env_or("DB_NAME", "cons");
    format!("postgres://{user}:{pass}@{host}:{port}/{name}")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_flag_or(&raw)
            .or_else(|| raw.parse::<T>().ok())
            .ok_or_else(|| anyhow::anyhow!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

/// Accept `1`/`0`/`yes`/`no` for boolean-typed settings on top of the plain
/// `FromStr` forms.
fn parse_flag_or<T: FromStr>(raw: &str) -> Option<T> {
    let normalized = match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" => "true",
        "0" | "no" => "false",
        _ => return None,
    };
    normalized.parse::<T>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etl_mode_parses() {
        assert_eq!("incremental".parse::<EtlMode>().unwrap(), EtlMode::Incremental);
        assert_eq!("open_update".parse::<EtlMode>().unwrap(), EtlMode::OpenUpdate);
        assert!("both".parse::<EtlMode>().is_err());
    }

    #[test]
    fn flag_forms_normalize() {
        assert_eq!(parse_flag_or::<bool>("1"), Some(true));
        assert_eq!(parse_flag_or::<bool>("no"), Some(false));
        assert_eq!(parse_flag_or::<bool>("true"), None); // plain FromStr path
    }
}
