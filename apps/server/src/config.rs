use anyhow::{bail, Context};
use chrono::{FixedOffset, NaiveDateTime, Offset, Utc};

use crate::slots::DEFAULT_SLOT_DURATION_MIN;

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Empty disables Telegram notifications and error alerts.
    pub bot_token: String,
    pub owner_tg_id: i64,
    pub slot_duration_min: u32,
    pub utc_offset_hours: i32,
    pub webapp_url: Option<String>,
    pub past_slot_sweep_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let owner_tg_id = std::env::var("OWNER_TG_ID")
            .context("OWNER_TG_ID must be set")?
            .parse()
            .context("OWNER_TG_ID must be a number")?;

        let config = Self {
            database_url: env_or("DATABASE_URL", "sqlite:barbershop.db?mode=rwc"),
            host: env_or("HOST", "0.0.0.0"),
            port: parse_env("PORT", 3000)?,
            bot_token: env_or("BOT_TOKEN", ""),
            owner_tg_id,
            slot_duration_min: parse_env("SLOT_DURATION_MIN", DEFAULT_SLOT_DURATION_MIN)?,
            utc_offset_hours: parse_env("SHOP_UTC_OFFSET_HOURS", 0)?,
            webapp_url: std::env::var("WEBAPP_URL").ok().filter(|u| !u.is_empty()),
            past_slot_sweep_secs: parse_env("PAST_SLOT_SWEEP_SECS", 300)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.slot_duration_min == 0 {
            bail!("SLOT_DURATION_MIN must be greater than zero");
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            bail!("SHOP_UTC_OFFSET_HOURS must be between -12 and 14");
        }
        if self.past_slot_sweep_secs == 0 {
            bail!("PAST_SLOT_SWEEP_SECS must be greater than zero");
        }
        Ok(())
    }

    pub fn shop_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Wall-clock time at the shop.
    pub fn shop_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.shop_offset()).naive_local()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
pub const TEST_BOT_TOKEN: &str = "123456:test-token";

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        bot_token: TEST_BOT_TOKEN.into(),
        owner_tg_id: 1,
        slot_duration_min: DEFAULT_SLOT_DURATION_MIN,
        utc_offset_hours: 0,
        webapp_url: None,
        past_slot_sweep_secs: 300,
    }
}
