use dotenv::dotenv;
use std::env;
use std::time::Duration;

const RABBIT_URL: &str = "RABBIT_URL";
const APP_ID: &str = "APP_ID";
const HEALTH_ADDR: &str = "HEALTH_ADDR";
const SHUTDOWN_TIMEOUT_SECS: &str = "SHUTDOWN_TIMEOUT_SECS";

#[derive(Clone)]
pub struct Config {
    pub rabbit_url: String,
    pub app_id: String,
    pub health_addr: String,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Config {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_env() -> Result<Config, String> {
        // Load .env file
        dotenv().ok();

        let rabbit_url = env::var(RABBIT_URL)
            .map_err(|_| format!("failed to load environment variable {}", RABBIT_URL))?;

        let app_id = env::var(APP_ID).unwrap_or_else(|_| "email-service".to_string());

        let health_addr = env::var(HEALTH_ADDR).unwrap_or_else(|_| "0.0.0.0:8085".to_string());

        let shutdown_timeout = match env::var(SHUTDOWN_TIMEOUT_SECS) {
            Ok(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    format!("failed to parse {} as seconds: {}", SHUTDOWN_TIMEOUT_SECS, raw)
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(30),
        };

        Ok(Config {
            rabbit_url,
            app_id,
            health_addr,
            shutdown_timeout,
        })
    }
}
