use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::config::AppConfig;
use crate::images::ImageError;

lazy_static! {
    static ref MAX_AGE_RE: Regex = Regex::new(r"(?i)(?:^|[,\s])(s-maxage|max-age)\s*=\s*(\d+)").unwrap();
}

/// Source image bytes as retrieved from upstream.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    /// Freshness advertised by upstream `Cache-Control`
    pub max_age: Option<u64>,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, href: &str) -> Result<SourceImage, ImageError>;
}

/// Fetches source images over HTTP. No retries; one timeout per request.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &AppConfig) -> Result<Self, ImageError> {
        let client_builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(config.user_agent.clone());

        // Add proxy if configured
        let client_builder = match &config.upstream_proxy {
            Some(proxy) => match reqwest::Proxy::all(proxy) {
                Ok(proxy) => client_builder.proxy(proxy),
                Err(e) => {
                    return Err(ImageError::Proxy(format!("Failed to create proxy: {}", e)))
                }
            },
            None => client_builder,
        };

        let client = client_builder
            .build()
            .map_err(|e| ImageError::Proxy(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_source_bytes,
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, href: &str) -> Result<SourceImage, ImageError> {
        let mut response = self
            .client
            .get(href)
            .header("Accept", "image/*,*/*;q=0.8")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Upstream image request failed with status: {}", status);
            return Err(ImageError::Upstream(status.as_u16()));
        }

        if response.content_length().map_or(false, |len| len > self.max_bytes) {
            return Err(ImageError::TooLarge(self.max_bytes));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let max_age = response
            .headers()
            .get("cache-control")
            .and_then(|h| h.to_str().ok())
            .and_then(parse_max_age);

        // Content-Length can be absent or wrong, so count while reading
        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (data.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(ImageError::TooLarge(self.max_bytes));
            }
            data.extend_from_slice(&chunk);
        }

        log::debug!("Fetched {} bytes from {}", data.len(), href);

        Ok(SourceImage {
            data,
            content_type,
            max_age,
        })
    }
}

/// Extract the freshness lifetime from a `Cache-Control` value, preferring
/// `s-maxage` over `max-age`.
pub fn parse_max_age(cache_control: &str) -> Option<u64> {
    let mut max_age = None;

    for caps in MAX_AGE_RE.captures_iter(cache_control) {
        let value = caps[2].parse::<u64>().ok();
        if caps[1].eq_ignore_ascii_case("s-maxage") {
            return value;
        }
        max_age = max_age.or(value);
    }

    max_age
}

/// Detect the image type from its magic bytes.
pub fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    } else if data.starts_with(b"GIF8") {
        return Some("image/gif");
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        return Some("image/webp");
    } else if matches!(data.get(4..12), Some(b) if b == b"ftypavif" || b == b"ftypavis") {
        return Some("image/avif");
    } else if data.starts_with(b"BM") {
        return Some("image/bmp");
    } else if data.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || data.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        return Some("image/tiff");
    } else if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return Some("image/x-icon");
    }

    if is_svg(data) {
        return Some("image/svg+xml");
    }

    None
}

fn is_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    (text.starts_with("<?xml") || text.starts_with("<svg") || text.starts_with("<!DOCTYPE svg"))
        && text.contains("<svg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_formats() {
        assert_eq!(detect_image_type(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0]), Some("image/jpeg"));
        assert_eq!(
            detect_image_type(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0]),
            Some("image/png")
        );
        assert_eq!(detect_image_type(b"GIF89a......"), Some("image/gif"));
        assert_eq!(detect_image_type(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(detect_image_type(b"\0\0\0\x1cftypavif\0\0"), Some("image/avif"));
        assert_eq!(detect_image_type(b"BM\0\0\0\0\0\0"), Some("image/bmp"));
    }

    #[test]
    fn detects_svg() {
        assert_eq!(
            detect_image_type(br#"<?xml version="1.0"?><svg xmlns="http://www.w3.org/2000/svg"/>"#),
            Some("image/svg+xml")
        );
        assert_eq!(detect_image_type(b"  <svg width=\"1\"></svg>"), Some("image/svg+xml"));
    }

    #[test]
    fn rejects_non_images() {
        assert_eq!(detect_image_type(b"<html><body>nope</body></html>"), None);
        assert_eq!(detect_image_type(b""), None);
        assert_eq!(detect_image_type(b"<?xml version=\"1.0\"?><rss/>"), None);
    }

    #[test]
    fn parses_cache_control() {
        assert_eq!(parse_max_age("public, max-age=3600"), Some(3600));
        assert_eq!(parse_max_age("max-age=60, s-maxage=600"), Some(600));
        assert_eq!(parse_max_age("S-MAXAGE=10,max-age=5"), Some(10));
        assert_eq!(parse_max_age("no-cache"), None);
        assert_eq!(parse_max_age(""), None);
    }
}
