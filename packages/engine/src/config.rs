use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables (spec.md §6.3).
#[derive(Debug, Clone)]
pub struct Config {
    pub login: String,
    pub security_key: String,
    pub login_admin: String,
    pub security_key_admin: String,
    pub first_manager_id: i64,
    pub second_manager_id: i64,
    pub bot_id: i64,
    pub client_field_id: i64,
    pub database_path: String,
    pub max_workers: usize,
    pub lock_expiry_minutes: i64,
    pub scan_interval_secs: u64,
    pub limit_process_tasks: i64,
    pub port: u16,
    pub webhook_secret: String,
    pub reschedule_timezone: String,
}

impl Config {
    /// Loads configuration from the environment, reading a `.env` file if
    /// present (development convenience, mirrors the teacher's `Config::from_env`).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            login: env::var("LOGIN").context("LOGIN must be set")?,
            security_key: env::var("SECURITY_KEY").context("SECURITY_KEY must be set")?,
            login_admin: env::var("LOGIN_ADMIN").context("LOGIN_ADMIN must be set")?,
            security_key_admin: env::var("SECURITY_KEY_ADMIN")
                .context("SECURITY_KEY_ADMIN must be set")?,
            first_manager_id: env::var("FIRST_MANAGER_ID")
                .context("FIRST_MANAGER_ID must be set")?
                .parse()
                .context("FIRST_MANAGER_ID must be an integer")?,
            second_manager_id: env::var("SECOND_MANAGER_ID")
                .context("SECOND_MANAGER_ID must be set")?
                .parse()
                .context("SECOND_MANAGER_ID must be an integer")?,
            bot_id: env::var("BOT_ID")
                .context("BOT_ID must be set")?
                .parse()
                .context("BOT_ID must be an integer")?,
            client_field_id: env::var("CLIENT_FIELD_ID")
                .context("CLIENT_FIELD_ID must be set")?
                .parse()
                .context("CLIENT_FIELD_ID must be an integer")?,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "active_tasks.db".to_string()),
            max_workers: env::var("MAX_WORKERS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("MAX_WORKERS must be a valid number")?,
            lock_expiry_minutes: env::var("LOCK_EXPIRY_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("LOCK_EXPIRY_MINUTES must be a valid number")?,
            scan_interval_secs: env::var("SCAN_INTERVAL")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("SCAN_INTERVAL must be a valid number")?,
            limit_process_tasks: env::var("LIMIT_PROCESS_TASKS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("LIMIT_PROCESS_TASKS must be a valid number")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            webhook_secret: env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET must be set")?,
            reschedule_timezone: env::var("RESCHEDULE_TIMEZONE")
                .unwrap_or_else(|_| "Europe/Moscow".to_string()),
        })
    }
}
