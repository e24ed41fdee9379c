use std::time::Duration;

/// Runtime configuration, collected from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub jwt_secret: String,
    /// Push webhook endpoint. Absent means push delivery is a no-op.
    pub push_url: Option<String>,
    /// Lifetime of an "actively viewing" presence record between heartbeats.
    pub presence_ttl: Duration,
    /// Upper bound of a single blocking queue read. Also bounds how long a
    /// closing session lingers, so keep it short.
    pub queue_block: Duration,
    pub reaper_interval: Duration,
    pub queue_idle: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_or("PARLEY_HOST", "0.0.0.0"),
            port: env_or("PARLEY_PORT", "3000").parse()?,
            db_path: env_or("PARLEY_DB_PATH", "parley.db"),
            jwt_secret: env_or("PARLEY_JWT_SECRET", "dev-secret-change-me"),
            push_url: std::env::var("PARLEY_PUSH_URL").ok().filter(|s| !s.is_empty()),
            presence_ttl: secs_env("PARLEY_PRESENCE_TTL_SECS", 300)?,
            queue_block: secs_env("PARLEY_QUEUE_BLOCK_SECS", 2)?,
            reaper_interval: secs_env("PARLEY_REAPER_INTERVAL_SECS", 60)?,
            queue_idle: secs_env("PARLEY_QUEUE_IDLE_SECS", 60)?,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn secs_env(name: &str, default: u64) -> anyhow::Result<Duration> {
    let secs = match std::env::var(name) {
        Ok(raw) => raw.parse()?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}
