use std::env;

use anyhow::{bail, Context};

use crate::rate_limit::LoginThrottleConfig;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";
const DEV_ADMIN_PASSWORD: &str = "1234";

/// Runtime settings read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub app_env: String,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub bcrypt_cost: u32,
    pub admin_seed_username: String,
    pub admin_seed_password: String,
    pub frontend_url: Option<String>,
    pub login_throttle: LoginThrottleConfig,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.parse::<T>().map_err(|e| anyhow::anyhow!("{name}={raw}: {e}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let app_env = var("APP_ENV").unwrap_or_else(|| "dev".to_string());
        let production = app_env.eq_ignore_ascii_case("production");

        let jwt_secret = match var("JWT_SECRET") {
            Some(s) => s,
            None if production => bail!("JWT_SECRET must be set when APP_ENV=production"),
            None => {
                tracing::warn!("JWT_SECRET not set, using the development secret");
                DEV_JWT_SECRET.to_string()
            }
        };
        if production && jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 characters long in production");
        }

        let admin_seed_password = match var("ADMIN_SEED_PASSWORD") {
            Some(p) => p,
            None if production => bail!("ADMIN_SEED_PASSWORD must be set when APP_ENV=production"),
            None => {
                tracing::warn!("ADMIN_SEED_PASSWORD not set, the seeded admin uses the development password");
                DEV_ADMIN_PASSWORD.to_string()
            }
        };

        let bcrypt_cost = parsed("BCRYPT_COST", bcrypt::DEFAULT_COST)?;
        if !(4..=31).contains(&bcrypt_cost) {
            bail!("BCRYPT_COST must be between 4 and 31");
        }

        Ok(Self {
            port: parsed("APP_PORT", 8080u16).context("APP_PORT")?,
            app_env,
            database_url: database_url(),
            jwt_secret,
            token_ttl_hours: parsed("TOKEN_TTL_HOURS", 8i64)?.max(1),
            bcrypt_cost,
            admin_seed_username: var("ADMIN_SEED_USERNAME").unwrap_or_else(|| "Admin".to_string()),
            admin_seed_password,
            frontend_url: var("FRONTEND_URL"),
            login_throttle: LoginThrottleConfig::from_env(),
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

/// `DATABASE_URL`, else assembled from the `DB_*` parts when `DB_HOST` is set.
fn database_url() -> Option<String> {
    if let Some(url) = var("DATABASE_URL") {
        return Some(url);
    }
    let host = var("DB_HOST")?;
    let port = var("DB_PORT").unwrap_or_else(|| "5432".to_string());
    let user = var("DB_USER").unwrap_or_else(|| "postgres".to_string());
    let password = var("DB_PASSWORD").unwrap_or_default();
    let name = var("DB_NAME").unwrap_or_else(|| "studentplusadmin".to_string());
    let sslmode = var("DB_SSLMODE").unwrap_or_else(|| "disable".to_string());
    let user = urlencoding::encode(&user);
    let auth = if password.is_empty() { user.into_owned() } else { format!("{user}:{}", urlencoding::encode(&password)) };
    Some(format!("postgres://{auth}@{host}:{port}/{name}?sslmode={sslmode}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "APP_ENV", "APP_PORT", "JWT_SECRET", "ADMIN_SEED_PASSWORD", "ADMIN_SEED_USERNAME", "BCRYPT_COST",
        "DATABASE_URL", "DB_HOST", "DB_PORT", "DB_USER", "DB_PASSWORD", "DB_NAME", "DB_SSLMODE", "TOKEN_TTL_HOURS",
    ];

    fn clear() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    #[serial]
    fn dev_defaults_apply() {
        clear();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.jwt_secret, DEV_JWT_SECRET);
        assert_eq!(cfg.admin_seed_username, "Admin");
        assert_eq!(cfg.token_ttl_hours, 8);
        assert!(cfg.database_url.is_none());
    }

    #[test]
    #[serial]
    fn production_refuses_fallbacks() {
        clear();
        env::set_var("APP_ENV", "production");
        assert!(Config::from_env().is_err());
        env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        assert!(Config::from_env().is_err());
        env::set_var("ADMIN_SEED_PASSWORD", "a-strong-seed-password");
        assert!(Config::from_env().unwrap().is_production());
        clear();
    }

    #[test]
    #[serial]
    fn database_url_is_assembled_from_parts() {
        clear();
        env::set_var("DB_HOST", "db");
        env::set_var("DB_USER", "school");
        env::set_var("DB_PASSWORD", "pw");
        let cfg = Config::from_env().unwrap();
        assert_eq!(
            cfg.database_url.as_deref(),
            Some("postgres://school:pw@db:5432/studentplusadmin?sslmode=disable")
        );
        env::set_var("DB_PASSWORD", "p@ss/w:rd");
        assert_eq!(
            Config::from_env().unwrap().database_url.as_deref(),
            Some("postgres://school:p%40ss%2Fw%3Ard@db:5432/studentplusadmin?sslmode=disable")
        );
        clear();
    }
}
