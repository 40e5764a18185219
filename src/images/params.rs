use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::cache::CacheKeyParams;
use crate::config::AppConfig;

pub const MAX_DIMENSION: u32 = 8192;
pub const DEFAULT_QUALITY: u8 = 75;
/// Upper bound on the pixel count of any resized output, about 160 MB as RGBA.
pub const MAX_OUTPUT_PIXELS: u64 = 40_000_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("\"url\" parameter is required")]
    MissingUrl,

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Relative url requires a configured local origin")]
    RelativeUrl,

    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    #[error("Invalid {0} parameter: {1}")]
    InvalidDimension(&'static str, String),

    #[error("{0}={1} is not an allowed size")]
    DimensionNotAllowed(&'static str, u32),

    #[error("Invalid q parameter: {0}")]
    InvalidQuality(String),

    #[error("q={0} is not an allowed quality")]
    QualityNotAllowed(u8),

    #[error("Unsupported fit: {0}")]
    InvalidFit(String),

    #[error("Output of {0}x{1} exceeds the size limit")]
    OutputTooLarge(u32, u32),
}

/// How the requested box is reconciled with the source aspect ratio.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFit {
    /// Exact box, aspect ratio ignored
    #[default]
    Fill,
    /// Fill the box, crop the overflow around the centre
    Cover,
    /// Fit inside the box, pad the rest with transparency
    Contain,
    /// Fit inside the box without padding
    Inside,
    /// Smallest size covering the box, nothing cropped
    Outside,
}

impl ImageFit {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fill" => Some(ImageFit::Fill),
            "cover" => Some(ImageFit::Cover),
            "contain" => Some(ImageFit::Contain),
            "inside" => Some(ImageFit::Inside),
            "outside" => Some(ImageFit::Outside),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFit::Fill => "fill",
            ImageFit::Cover => "cover",
            ImageFit::Contain => "contain",
            ImageFit::Inside => "inside",
            ImageFit::Outside => "outside",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    #[serde(rename = "image/avif")]
    Avif,
    #[serde(rename = "image/webp")]
    Webp,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/gif")]
    Gif,
}

impl OutputFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Avif => "image/avif",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Gif => "image/gif",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/avif" => Some(OutputFormat::Avif),
            "image/webp" => Some(OutputFormat::Webp),
            "image/png" => Some(OutputFormat::Png),
            "image/jpeg" | "image/jpg" => Some(OutputFormat::Jpeg),
            "image/gif" => Some(OutputFormat::Gif),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformParams {
    /// 0 keeps the source width
    pub width: u32,
    /// 0 derives the height from the aspect ratio
    pub height: u32,
    pub quality: u8,
    pub fit: ImageFit,
    /// `None` keeps the source format
    pub format: Option<OutputFormat>,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            quality: DEFAULT_QUALITY,
            fit: ImageFit::Fill,
            format: None,
        }
    }
}

impl TransformParams {
    /// Bounds every transform must respect regardless of run mode.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.width > MAX_DIMENSION {
            return Err(ValidationError::InvalidDimension("w", self.width.to_string()));
        }
        if self.height > MAX_DIMENSION {
            return Err(ValidationError::InvalidDimension("h", self.height.to_string()));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(ValidationError::InvalidQuality(self.quality.to_string()));
        }
        Ok(())
    }
}

/// Query values exactly as the client sent them.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawParams<'a> {
    pub url: Option<&'a str>,
    pub w: Option<&'a str>,
    pub h: Option<&'a str>,
    pub q: Option<&'a str>,
    pub fit: Option<&'a str>,
}

/// A validated optimization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub href: String,
    pub transform: TransformParams,
}

impl ImageRequest {
    pub fn parse(
        raw: &RawParams<'_>,
        accept: Option<&str>,
        config: &AppConfig,
    ) -> Result<Self, ValidationError> {
        let url = raw.url.map(str::trim).unwrap_or_default();
        let href = resolve_href(url, config)?;

        let width = parse_dimension("w", raw.w, config)?;
        let height = parse_dimension("h", raw.h, config)?;
        let quality = parse_quality(raw.q, config)?;

        let fit = match raw.fit {
            Some(value) => ImageFit::parse(value.trim())
                .ok_or_else(|| ValidationError::InvalidFit(value.to_string()))?,
            None => ImageFit::default(),
        };

        let transform = TransformParams {
            width,
            height,
            quality,
            fit,
            format: negotiate_format(accept, &config.formats),
        };
        transform.validate()?;

        Ok(Self { href, transform })
    }

    pub fn cache_key_params(&self, method: &str) -> CacheKeyParams {
        CacheKeyParams {
            href: self.href.clone(),
            width: self.transform.width,
            height: self.transform.height,
            quality: self.transform.quality,
            mime_type: self
                .transform
                .format
                .map(|f| f.mime().to_string())
                .unwrap_or_default(),
            method: method.to_string(),
            fit: self.transform.fit,
        }
    }
}

fn resolve_href(url: &str, config: &AppConfig) -> Result<String, ValidationError> {
    if url.is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    if url.starts_with("//") {
        return Err(ValidationError::InvalidUrl(
            "protocol-relative urls are not supported".to_string(),
        ));
    }

    let relative = url.starts_with('/');
    let parsed = if relative {
        let origin = config
            .local_origin
            .as_deref()
            .ok_or(ValidationError::RelativeUrl)?;
        Url::parse(origin).and_then(|origin| origin.join(url))
    } else {
        Url::parse(url)
    }
    .map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }

    // Local paths are trusted, remote hosts must be listed
    if let (false, Some(hosts)) = (relative, &config.remote_hosts) {
        let host = parsed.host_str().unwrap_or_default();
        if !hosts.iter().any(|pattern| host_matches(pattern, host)) {
            return Err(ValidationError::HostNotAllowed(host.to_string()));
        }
    }

    Ok(parsed.to_string())
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(domain) => host
            .strip_suffix(domain)
            .map_or(false, |prefix| prefix.ends_with('.') && prefix.len() > 1),
        None => pattern.eq_ignore_ascii_case(host),
    }
}

fn parse_dimension(
    name: &'static str,
    value: Option<&str>,
    config: &AppConfig,
) -> Result<u32, ValidationError> {
    let Some(value) = value else {
        return Ok(0);
    };

    let size = value
        .trim()
        .parse::<u32>()
        .map_err(|_| ValidationError::InvalidDimension(name, value.to_string()))?;

    if size > MAX_DIMENSION {
        return Err(ValidationError::InvalidDimension(name, value.to_string()));
    }

    if !config.is_development() && size != 0 && !config.image_sizes.contains(&size) {
        return Err(ValidationError::DimensionNotAllowed(name, size));
    }

    Ok(size)
}

fn parse_quality(value: Option<&str>, config: &AppConfig) -> Result<u8, ValidationError> {
    let Some(value) = value else {
        return Ok(DEFAULT_QUALITY);
    };

    let quality = value
        .trim()
        .parse::<u8>()
        .map_err(|_| ValidationError::InvalidQuality(value.to_string()))?;

    if !(1..=100).contains(&quality) {
        return Err(ValidationError::InvalidQuality(value.to_string()));
    }

    if let (false, Some(allowed)) = (config.is_development(), &config.qualities) {
        if !allowed.contains(&quality) {
            return Err(ValidationError::QualityNotAllowed(quality));
        }
    }

    Ok(quality)
}

/// Pick the first configured format the client accepts.
///
/// Without an `Accept` header the first configured format wins. `None`
/// means the source format is kept.
pub fn negotiate_format(accept: Option<&str>, formats: &[OutputFormat]) -> Option<OutputFormat> {
    let Some(accept) = accept else {
        return formats.first().copied();
    };

    let ranges: Vec<&str> = accept
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let media = pieces.next()?.trim();
            let refused = pieces.any(|p| {
                p.trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .map_or(false, |q| q <= 0.0)
            });
            (!media.is_empty() && !refused).then_some(media)
        })
        .collect();

    formats.iter().copied().find(|format| {
        ranges.iter().any(|range| {
            *range == "*/*" || *range == "image/*" || range.eq_ignore_ascii_case(format.mime())
        })
    })
}
