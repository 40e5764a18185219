#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod cors;
pub mod images;

use std::time::Duration;

use rocket::figment::Figment;
use rocket::{Build, Rocket};

use cache::{pruner_fairing, DiskCache};
use config::AppConfig;
use cors::CORS;
use images::{ImageOptimizer, SourceFetcher};

/// Assemble the server around `fetcher`, which retrieves source images.
pub fn build_rocket(
    figment: Figment,
    config: AppConfig,
    fetcher: Box<dyn SourceFetcher>,
) -> Rocket<Build> {
    let image_cache = DiskCache::new(config.cache_dir.clone());
    let optimizer = ImageOptimizer::new(fetcher, &config);

    let mut rocket = rocket::custom(figment)
        .attach(CORS)
        .manage(image_cache)
        .manage(optimizer)
        .manage(config.clone())
        .mount("/_image", routes![api::image::optimize_image])
        .mount("/", routes![cors::preflight]);

    if let Some(max_bytes) = config.cache_max_bytes {
        rocket = rocket.attach(pruner_fairing(
            config.cache_dir.clone(),
            max_bytes,
            Duration::from_secs(config.prune_interval.max(1)),
        ));
    }

    rocket
}
