#[macro_use]
extern crate rocket;

use dotenv::dotenv;
use env_logger::Env;
use log::{error, info};

use imgopt::build_rocket;
use imgopt::config::{self, AppConfig};
use imgopt::images::HttpFetcher;

#[launch]
fn rocket() -> _ {
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Load config
    let figment = config::figment();
    let config = match figment.extract::<AppConfig>() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded successfully");

    let fetcher = match HttpFetcher::new(&config) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!("Failed to create upstream client: {}", e);
            std::process::exit(1);
        }
    };

    info!("Mode: {:?}", config.mode);
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Upstream timeout: {}s", config.timeout);
    match &config.remote_hosts {
        Some(hosts) => info!("Allowed remote hosts: {}", hosts.join(", ")),
        None => info!("Any remote host allowed"),
    }

    info!(
        "Starting image optimizer on {}:{}",
        config.address, config.port
    );

    build_rocket(figment, config, Box::new(fetcher))
}
