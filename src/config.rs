/// Application configuration
/// In debug builds: loads from .env file
/// In release builds: environment only
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the application server that issues upload credentials
    pub api_base_url: String,
}

impl Config {
    /// Load configuration based on build mode
    pub fn load() -> Self {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                tracing::info!("dev mode activated, loaded .env file");
            }
        }

        Self::from_env()
    }

    /// Load configuration from environment variables
    fn from_env() -> Self {
        let api_base_url = std::env::var("REELUP_API_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8000/api".to_string());

        tracing::debug!(api_base_url, "configuration loaded");

        Self { api_base_url }
    }
}
