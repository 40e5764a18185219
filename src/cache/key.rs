use sha2::{Digest, Sha256};

use crate::images::ImageFit;

// Bump when the key encoding or the on-disk layout changes
const CACHE_VERSION: u32 = 1;

/// Every request parameter that affects the bytes we produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyParams {
    pub href: String,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    /// Negotiated output mime type, empty when the source format is kept
    pub mime_type: String,
    pub method: String,
    pub fit: ImageFit,
}

/// Derive the hex cache key for a set of parameters.
///
/// Each field is length-prefixed before hashing so that no two distinct
/// parameter sets share an encoding (`("ab", "c")` vs `("a", "bc")`).
pub fn cache_key(params: &CacheKeyParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CACHE_VERSION.to_be_bytes());

    let width = params.width.to_string();
    let height = params.height.to_string();
    let quality = params.quality.to_string();

    for field in [
        params.method.as_str(),
        params.href.as_str(),
        width.as_str(),
        height.as_str(),
        quality.as_str(),
        params.mime_type.as_str(),
        params.fit.as_str(),
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CacheKeyParams {
        CacheKeyParams {
            href: "https://example.com/a.png".to_string(),
            width: 200,
            height: 0,
            quality: 80,
            mime_type: "image/webp".to_string(),
            method: "GET".to_string(),
            fit: ImageFit::Cover,
        }
    }

    #[test]
    fn same_params_same_key() {
        assert_eq!(cache_key(&params()), cache_key(&params()));
        assert_eq!(cache_key(&params()).len(), 64);
    }

    #[test]
    fn every_field_changes_the_key() {
        let base = cache_key(&params());

        let mut p = params();
        p.width = 201;
        assert_ne!(cache_key(&p), base);

        let mut p = params();
        p.height = 10;
        assert_ne!(cache_key(&p), base);

        let mut p = params();
        p.quality = 81;
        assert_ne!(cache_key(&p), base);

        let mut p = params();
        p.mime_type = "image/avif".to_string();
        assert_ne!(cache_key(&p), base);

        let mut p = params();
        p.fit = ImageFit::Contain;
        assert_ne!(cache_key(&p), base);

        let mut p = params();
        p.href = "https://example.com/b.png".to_string();
        assert_ne!(cache_key(&p), base);

        let mut p = params();
        p.method = "POST".to_string();
        assert_ne!(cache_key(&p), base);
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let mut a = params();
        a.method = "GETh".to_string();
        a.href = "ttps://example.com/a.png".to_string();

        let b = params();

        assert_ne!(cache_key(&a), cache_key(&b));
    }
}
