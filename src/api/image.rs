use std::convert::Infallible;
use std::io::Cursor;

use rocket::http::{ContentType, Header, Status};
use rocket::request::{self, FromRequest, Request};
use rocket::response::{self, Responder, Response};
use rocket::State;

use crate::api::ApiError;
use crate::cache::{CacheEntry, DiskCache};
use crate::config::AppConfig;
use crate::images::{ImageOptimizer, ImageRequest, RawParams};

/// One year, used when upstream gave no max-age.
pub const DEFAULT_MAX_AGE: u64 = 31_536_000;

// HEAD is served by the GET route and shares its entries
const CACHE_METHOD: &str = "GET";

const SVG_MIME: &str = "image/svg+xml";
// Upstream SVGs are served from our origin and must not run scripts there
const SVG_CONTENT_SECURITY_POLICY: &str = "script-src 'none'; frame-src 'none'; sandbox;";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

// Responder for image data
pub struct ImageResponse {
    pub data: Vec<u8>,
    pub content_type: String,
    pub max_age: u64,
    pub etag: Option<String>,
    pub cache_status: CacheStatus,
}

impl ImageResponse {
    fn from_entry(entry: CacheEntry, cache_status: CacheStatus) -> Self {
        Self {
            data: entry.buffer,
            content_type: entry.content_type,
            max_age: entry.max_age,
            etag: entry.etag,
            cache_status,
        }
    }
}

impl<'r> Responder<'r, 'static> for ImageResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let cache_control = format!("public, max-age={}, immutable", self.max_age);

        // Check If-None-Match header
        if let Some(etag) = &self.etag {
            let matched = req
                .headers()
                .get("If-None-Match")
                .any(|value| etag_matches(value, etag));

            if matched {
                return Response::build()
                    .status(Status::NotModified)
                    .header(Header::new("ETag", etag.clone()))
                    .header(Header::new("Cache-Control", cache_control))
                    .header(Header::new("Vary", "Accept"))
                    .header(Header::new("X-Cache", self.cache_status.as_str()))
                    .ok();
            }
        }

        let content_type =
            ContentType::parse_flexible(&self.content_type).unwrap_or(ContentType::Binary);

        let mut response = Response::build();
        response
            .header(content_type)
            .header(Header::new("Cache-Control", cache_control))
            .header(Header::new("Vary", "Accept"))
            .header(Header::new("X-Cache", self.cache_status.as_str()));
        if let Some(etag) = self.etag {
            response.header(Header::new("ETag", etag));
        }
        if self.content_type == SVG_MIME {
            response
                .header(Header::new("Content-Security-Policy", SVG_CONTENT_SECURITY_POLICY))
                .header(Header::new("Content-Disposition", "inline"));
        }
        response.sized_body(self.data.len(), Cursor::new(self.data));
        response.ok()
    }
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(|candidate| candidate.trim())
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

/// Raw `Accept` header, used for output format negotiation.
pub struct AcceptHeader<'r>(pub Option<&'r str>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AcceptHeader<'r> {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        request::Outcome::Success(AcceptHeader(req.headers().get_one("Accept")))
    }
}

// Every field is optional so malformed queries still reach the handler
// and get the placeholder instead of a routing error
#[derive(FromForm, Debug, Default)]
pub struct ImageQuery {
    pub url: Option<String>,
    pub w: Option<String>,
    pub h: Option<String>,
    pub q: Option<String>,
    pub fit: Option<String>,
}

impl ImageQuery {
    fn as_raw(&self) -> RawParams<'_> {
        RawParams {
            url: self.url.as_deref(),
            w: self.w.as_deref(),
            h: self.h.as_deref(),
            q: self.q.as_deref(),
            fit: self.fit.as_deref(),
        }
    }
}

#[get("/?<query..>")]
pub async fn optimize_image(
    query: ImageQuery,
    accept: AcceptHeader<'_>,
    config: &State<AppConfig>,
    cache: &State<DiskCache>,
    optimizer: &State<ImageOptimizer>,
) -> Result<ImageResponse, ApiError> {
    let request = ImageRequest::parse(&query.as_raw(), accept.0, config)?;
    let key_params = request.cache_key_params(CACHE_METHOD);

    // Check cache first; a broken cache never blocks serving
    match cache.get(&key_params).await {
        Ok(Some(entry)) => {
            log::debug!("Processed image found in cache: {} {:?}", request.href, request.transform);
            return Ok(ImageResponse::from_entry(entry, CacheStatus::Hit));
        }
        Ok(None) => {
            log::info!("Processed image not found in cache: {} {:?}", request.href, request.transform);
        }
        Err(e) => log::warn!("Cache read failed for {}: {}", request.href, e),
    }

    let transformed = optimizer.optimize(&request).await.map_err(|e| {
        log::error!("Failed to optimize image {}: {}", request.href, e);
        e
    })?;

    let entry = CacheEntry {
        etag: Some(format!("\"{:x}\"", md5::compute(&transformed.buffer))),
        max_age: transformed.max_age.unwrap_or(DEFAULT_MAX_AGE),
        content_type: transformed.content_type,
        buffer: transformed.buffer,
    };

    if let Err(e) = cache.set(&key_params, &entry).await {
        log::warn!("Cache write failed for {}: {}", request.href, e);
    }

    Ok(ImageResponse::from_entry(entry, CacheStatus::Miss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_matching() {
        assert!(etag_matches("\"abc\"", "\"abc\""));
        assert!(etag_matches("W/\"abc\"", "\"abc\""));
        assert!(etag_matches("\"x\", \"abc\"", "\"abc\""));
        assert!(etag_matches("*", "\"abc\""));
        assert!(!etag_matches("\"abd\"", "\"abc\""));
    }

    #[test]
    fn cache_status_labels() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
    }
}
