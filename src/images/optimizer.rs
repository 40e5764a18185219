use log::debug;

use crate::config::AppConfig;
use crate::images::fetch::{detect_image_type, SourceFetcher};
use crate::images::tools::{convert_image, is_animated_gif};
use crate::images::{ImageError, ImageRequest};

const SVG_MIME: &str = "image/svg+xml";

/// Output of a successful optimization.
#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub buffer: Vec<u8>,
    pub content_type: String,
    /// `None` when upstream gave no freshness information
    pub max_age: Option<u64>,
}

/// Fetches a source image and produces its transformed variant.
pub struct ImageOptimizer {
    fetcher: Box<dyn SourceFetcher>,
    allow_svg: bool,
    minimum_cache_ttl: u64,
}

impl ImageOptimizer {
    pub fn new(fetcher: Box<dyn SourceFetcher>, config: &AppConfig) -> Self {
        Self {
            fetcher,
            allow_svg: config.allow_svg,
            minimum_cache_ttl: config.minimum_cache_ttl,
        }
    }

    pub async fn optimize(&self, request: &ImageRequest) -> Result<TransformedImage, ImageError> {
        request.transform.validate()?;

        let source = self.fetcher.fetch(&request.href).await?;
        let max_age = source.max_age.map(|age| age.max(self.minimum_cache_ttl));

        let detected = detect_image_type(&source.data).ok_or_else(|| {
            ImageError::UnsupportedFormat(
                source
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            )
        })?;

        // Vector and animated sources are served untouched
        if detected == SVG_MIME {
            if !self.allow_svg {
                return Err(ImageError::UnsupportedFormat(SVG_MIME.to_string()));
            }
            debug!("Passing SVG through unchanged: {}", request.href);
            return Ok(TransformedImage {
                buffer: source.data,
                content_type: SVG_MIME.to_string(),
                max_age,
            });
        }

        if detected == "image/gif" && is_animated_gif(&source.data) {
            debug!("Passing animated GIF through unchanged: {}", request.href);
            return Ok(TransformedImage {
                buffer: source.data,
                content_type: detected.to_string(),
                max_age,
            });
        }

        let transform = request.transform.clone();
        let data = source.data;
        let (buffer, content_type) =
            tokio::task::spawn_blocking(move || convert_image(&data, &transform, detected))
                .await
                .map_err(|e| ImageError::Task(e.to_string()))??;

        Ok(TransformedImage {
            buffer,
            content_type: content_type.to_string(),
            max_age,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{ImageFit, OutputFormat, SourceImage, TransformParams};
    use async_trait::async_trait;
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
    use std::io::Cursor;

    struct StaticFetcher {
        data: Vec<u8>,
        max_age: Option<u64>,
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(&self, _href: &str) -> Result<SourceImage, ImageError> {
            Ok(SourceImage {
                data: self.data.clone(),
                content_type: None,
                max_age: self.max_age,
            })
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl SourceFetcher for FailingFetcher {
        async fn fetch(&self, _href: &str) -> Result<SourceImage, ImageError> {
            Err(ImageError::Upstream(404))
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::new(width, height))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn request(width: u32) -> ImageRequest {
        ImageRequest {
            href: "https://example.com/a.png".to_string(),
            transform: TransformParams {
                width,
                height: 0,
                quality: 75,
                fit: ImageFit::Fill,
                format: Some(OutputFormat::Webp),
            },
        }
    }

    fn optimizer(fetcher: impl SourceFetcher + 'static, config: &AppConfig) -> ImageOptimizer {
        ImageOptimizer::new(Box::new(fetcher), config)
    }

    #[tokio::test]
    async fn transforms_raster_sources() {
        let opt = optimizer(
            StaticFetcher {
                data: png_bytes(64, 32),
                max_age: None,
            },
            &AppConfig::default(),
        );

        let out = opt.optimize(&request(16)).await.unwrap();

        assert_eq!(out.content_type, "image/webp");
        assert_eq!(out.max_age, None);
        let decoded = image::load_from_memory(&out.buffer).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[tokio::test]
    async fn upstream_max_age_is_floored() {
        let config = AppConfig {
            minimum_cache_ttl: 600,
            ..AppConfig::default()
        };

        let opt = optimizer(
            StaticFetcher {
                data: png_bytes(8, 8),
                max_age: Some(30),
            },
            &config,
        );
        assert_eq!(opt.optimize(&request(0)).await.unwrap().max_age, Some(600));

        let opt = optimizer(
            StaticFetcher {
                data: png_bytes(8, 8),
                max_age: Some(7200),
            },
            &config,
        );
        assert_eq!(opt.optimize(&request(0)).await.unwrap().max_age, Some(7200));
    }

    #[tokio::test]
    async fn svg_requires_opt_in() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1"/>"#.to_vec();

        let opt = optimizer(
            StaticFetcher {
                data: svg.clone(),
                max_age: None,
            },
            &AppConfig::default(),
        );
        assert!(matches!(
            opt.optimize(&request(0)).await,
            Err(ImageError::UnsupportedFormat(_))
        ));

        let config = AppConfig {
            allow_svg: true,
            ..AppConfig::default()
        };
        let opt = optimizer(
            StaticFetcher {
                data: svg.clone(),
                max_age: None,
            },
            &config,
        );
        let out = opt.optimize(&request(0)).await.unwrap();
        assert_eq!(out.content_type, "image/svg+xml");
        assert_eq!(out.buffer, svg);
    }

    #[tokio::test]
    async fn non_images_are_rejected() {
        let opt = optimizer(
            StaticFetcher {
                data: b"<html>not found</html>".to_vec(),
                max_age: None,
            },
            &AppConfig::default(),
        );
        assert!(matches!(
            opt.optimize(&request(0)).await,
            Err(ImageError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn fetch_failures_propagate() {
        let opt = optimizer(FailingFetcher, &AppConfig::default());
        assert!(matches!(
            opt.optimize(&request(0)).await,
            Err(ImageError::Upstream(404))
        ));
    }

    #[tokio::test]
    async fn invalid_transform_is_rejected_before_fetching() {
        let opt = optimizer(FailingFetcher, &AppConfig::default());
        let mut req = request(0);
        req.transform.width = 100_000;

        assert!(matches!(
            opt.optimize(&req).await,
            Err(ImageError::Invalid(_))
        ));
    }
}
