use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Interval between server-initiated websocket pings.
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is considered dead and
    /// dropped, which drives its disconnect transition.
    pub client_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let heartbeat_secs: u64 = env::var("HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let timeout_secs: u64 = env::var("CLIENT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        if timeout_secs <= heartbeat_secs {
            return Err(crate::error::AppError::Config(format!(
                "CLIENT_TIMEOUT_SECS ({timeout_secs}) must exceed HEARTBEAT_INTERVAL_SECS ({heartbeat_secs})"
            )));
        }

        Ok(Self {
            port,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            client_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        // Scoped to variables this test does not set; the defaults must be
        // internally consistent.
        let cfg = Config::from_env().unwrap();
        assert!(cfg.client_timeout > cfg.heartbeat_interval);
    }
}
