use thiserror::Error;

mod fetch;
mod optimizer;
mod params;
mod tools;

pub use fetch::{detect_image_type, parse_max_age, HttpFetcher, SourceFetcher, SourceImage};
pub use optimizer::{ImageOptimizer, TransformedImage};
pub use params::{
    negotiate_format, ImageFit, ImageRequest, OutputFormat, RawParams, TransformParams,
    ValidationError, DEFAULT_QUALITY, MAX_DIMENSION, MAX_OUTPUT_PIXELS,
};
pub use tools::{convert_image, is_animated_gif};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Upstream responded with status {0}")]
    Upstream(u16),

    #[error("Source image exceeds {0} bytes")]
    TooLarge(u64),

    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid transform: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Image conversion error: {0}")]
    Conversion(String),

    #[error("Transform task failed: {0}")]
    Task(String),
}
