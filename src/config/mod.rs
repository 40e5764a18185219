use std::env;
use std::path::PathBuf;

use rocket::figment::{
    providers::{Format, Toml},
    Figment, Profile,
};
use serde::{Deserialize, Serialize};

use crate::images::OutputFormat;

/// Development relaxes parameter validation to plain bounds checks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub address: String,
    /// Upstream fetch timeout in seconds
    pub timeout: u64,
    pub user_agent: String,
    /// Optional http(s) or socks5 proxy for upstream fetches
    pub upstream_proxy: Option<String>,
    pub cache_dir: PathBuf,
    pub mode: RunMode,
    /// Widths (and heights) accepted in production, besides 0
    pub image_sizes: Vec<u32>,
    /// Qualities accepted in production; any 1..=100 when unset
    pub qualities: Option<Vec<u8>>,
    /// Output formats in order of preference
    pub formats: Vec<OutputFormat>,
    /// Hosts allowed as image sources; `*.example.com` matches subdomains
    pub remote_hosts: Option<Vec<String>>,
    /// Origin used to resolve relative `url` parameters
    pub local_origin: Option<String>,
    /// Floor in seconds for upstream-provided max-age
    pub minimum_cache_ttl: u64,
    pub allow_svg: bool,
    pub max_source_bytes: u64,
    pub cache_max_bytes: Option<u64>,
    /// Seconds between cache pruning runs
    pub prune_interval: u64,
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.mode == RunMode::Development
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "127.0.0.1".to_string(),
            timeout: 10,
            user_agent: format!("imgopt/{}", env!("CARGO_PKG_VERSION")),
            upstream_proxy: None,
            cache_dir: PathBuf::from("./cache/images"),
            mode: RunMode::Production,
            image_sizes: vec![
                16, 32, 48, 64, 96, 128, 256, 384, 640, 750, 828, 1080, 1200, 1920, 2048, 3840,
            ],
            qualities: None,
            formats: vec![OutputFormat::Webp],
            remote_hosts: None,
            local_origin: None,
            minimum_cache_ttl: 60,
            allow_svg: false,
            max_source_bytes: 50 * 1024 * 1024,
            cache_max_bytes: None,
            prune_interval: 60 * 60,
        }
    }
}

/// Rocket defaults, then `App.toml`, then environment overrides.
pub fn figment() -> Figment {
    let mut figment = Figment::from(rocket::Config::default())
        .merge(Toml::file("App.toml").nested());

    if let Ok(dir) = env::var("IMAGE_CACHE_DIR") {
        figment = figment.merge(("cache_dir", dir));
    }

    if let Ok(mode) = env::var("IMAGE_MODE") {
        figment = figment.merge(("mode", mode.trim().to_lowercase()));
    }

    if let Ok(hosts) = env::var("IMAGE_REMOTE_HOSTS") {
        figment = figment.merge((
            "remote_hosts",
            hosts
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<String>>(),
        ));
    }

    figment.select(Profile::from_env_or("APP_PROFILE", "default"))
}
