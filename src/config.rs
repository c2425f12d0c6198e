use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::ledger::models::Gateway;
use crate::reconciliation::{ReconcilerSettings, ScheduleConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// Service configuration, read from the environment (and `.env`)
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_address: String,
    pub storage_backend: String,
    pub match_tolerance_secs: i64,
    pub run_lease_secs: i64,
    pub statement_fetch_timeout_secs: u64,
    pub statement_base_url: String,
    pub default_currency: String,
    pub default_refund_lookback_days: i32,
    pub scheduler_enabled: bool,
    pub scheduler_window_minutes: i64,
    pub scheduler_settle_delay_minutes: i64,
    /// Missed windows one gateway may catch up on per cycle
    pub scheduler_max_catch_up_windows: usize,
    /// Comma separated; empty means every gateway
    pub scheduler_gateways: String,
    /// `MTN_MOMO=https://...,ORANGE_MONEY=https://...`
    pub gateway_statement_urls: String,
    pub cors_origins: String,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::load(None)
    }

    /// Build from defaults plus environment; `overrides` replaces the process
    /// environment (used by tests)
    pub fn load(overrides: Option<HashMap<String, String>>) -> AppResult<Self> {
        let env = config::Environment::default()
            .try_parsing(true)
            .source(overrides);

        let settings = config::Config::builder()
            .set_default("database_url", "postgres://localhost/zitopay_recon")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("storage_backend", "postgres")?
            .set_default("match_tolerance_secs", 300)?
            .set_default("run_lease_secs", 300)?
            .set_default("statement_fetch_timeout_secs", 10)?
            .set_default("statement_base_url", "http://localhost:8080/api/v1")?
            .set_default("default_currency", "XAF")?
            .set_default("default_refund_lookback_days", 0)?
            .set_default("scheduler_enabled", false)?
            .set_default("scheduler_window_minutes", 60)?
            .set_default("scheduler_settle_delay_minutes", 10)?
            .set_default("scheduler_max_catch_up_windows", 24)?
            .set_default("scheduler_gateways", "")?
            .set_default("gateway_statement_urls", "")?
            .set_default("cors_origins", "*")?
            .set_default("rate_limit_per_minute", 600)?
            .set_default("request_timeout_secs", 30)?
            .add_source(env)
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        self.storage()?;
        self.scheduler_gateway_list()?;
        self.statement_urls()?;

        if self.match_tolerance_secs < 0 {
            return Err(AppError::Config("MATCH_TOLERANCE_SECS must be >= 0".to_string()));
        }
        if self.run_lease_secs <= 0 || self.statement_fetch_timeout_secs == 0 {
            return Err(AppError::Config(
                "RUN_LEASE_SECS and STATEMENT_FETCH_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if self.scheduler_window_minutes <= 0 || self.scheduler_settle_delay_minutes < 0 {
            return Err(AppError::Config("invalid scheduler window".to_string()));
        }
        if self.scheduler_max_catch_up_windows == 0 {
            return Err(AppError::Config(
                "SCHEDULER_MAX_CATCH_UP_WINDOWS must be positive".to_string(),
            ));
        }
        if self.default_refund_lookback_days < 0 {
            return Err(AppError::Config(
                "DEFAULT_REFUND_LOOKBACK_DAYS must be >= 0".to_string(),
            ));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(AppError::Config("RATE_LIMIT_PER_MINUTE must be positive".to_string()));
        }
        Ok(())
    }

    pub fn storage(&self) -> AppResult<StorageBackend> {
        match self.storage_backend.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(AppError::Config(format!("Unknown STORAGE_BACKEND: {}", other))),
        }
    }

    pub fn scheduler_gateway_list(&self) -> AppResult<Vec<Gateway>> {
        let raw = self.scheduler_gateways.trim();
        if raw.is_empty() {
            return Ok(Gateway::all());
        }
        raw.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| Gateway::from_str(s).map_err(|e| AppError::Config(e.to_string())))
            .collect()
    }

    pub fn statement_urls(&self) -> AppResult<HashMap<Gateway, String>> {
        let mut urls = HashMap::new();
        for pair in self
            .gateway_statement_urls
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let (gateway, url) = pair.split_once('=').ok_or_else(|| {
                AppError::Config(format!("GATEWAY_STATEMENT_URLS entry '{}' lacks '='", pair))
            })?;
            let gateway = Gateway::from_str(gateway).map_err(|e| AppError::Config(e.to_string()))?;
            urls.insert(gateway, url.trim().to_string());
        }
        Ok(urls)
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            match_tolerance: Duration::seconds(self.match_tolerance_secs),
            lease_ttl: Duration::seconds(self.run_lease_secs),
            fetch_timeout: std::time::Duration::from_secs(self.statement_fetch_timeout_secs),
        }
    }

    pub fn schedule_config(&self) -> AppResult<ScheduleConfig> {
        Ok(ScheduleConfig {
            window: Duration::minutes(self.scheduler_window_minutes),
            settle_delay: Duration::minutes(self.scheduler_settle_delay_minutes),
            gateways: self.scheduler_gateway_list()?,
            max_catch_up: self.scheduler_max_catch_up_windows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(pairs: &[(&str, &str)]) -> AppResult<AppConfig> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::load(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.storage().unwrap(), StorageBackend::Postgres);
        assert_eq!(config.match_tolerance_secs, 300);
        assert_eq!(config.default_currency, "XAF");
        assert!(!config.scheduler_enabled);
        assert_eq!(config.scheduler_gateway_list().unwrap(), Gateway::all());
        assert_eq!(config.reconciler_settings().match_tolerance, Duration::minutes(5));
        assert_eq!(config.schedule_config().unwrap().max_catch_up, 24);
    }

    #[test]
    fn test_environment_overrides() {
        let config = load(&[
            ("STORAGE_BACKEND", "memory"),
            ("MATCH_TOLERANCE_SECS", "120"),
            ("SCHEDULER_ENABLED", "true"),
            ("SCHEDULER_GATEWAYS", "MTN_MOMO, ORANGE_MONEY"),
            ("GATEWAY_STATEMENT_URLS", "MTN_MOMO=https://mtn.example/statements"),
            ("CORS_ORIGINS", "https://a.example, https://b.example"),
        ])
        .unwrap();

        assert_eq!(config.storage().unwrap(), StorageBackend::Memory);
        assert_eq!(config.match_tolerance_secs, 120);
        assert!(config.scheduler_enabled);
        assert_eq!(
            config.scheduler_gateway_list().unwrap(),
            vec![Gateway::MtnMomo, Gateway::OrangeMoney]
        );
        assert_eq!(
            config.statement_urls().unwrap().get(&Gateway::MtnMomo).map(String::as_str),
            Some("https://mtn.example/statements")
        );
        assert_eq!(config.cors_origin_list().len(), 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("STORAGE_BACKEND", "redis")]).is_err());
        assert!(load(&[("SCHEDULER_GATEWAYS", "MPESA")]).is_err());
        assert!(load(&[("GATEWAY_STATEMENT_URLS", "MTN_MOMO")]).is_err());
        assert!(load(&[("RUN_LEASE_SECS", "0")]).is_err());
        assert!(load(&[("SCHEDULER_MAX_CATCH_UP_WINDOWS", "0")]).is_err());
    }
}
