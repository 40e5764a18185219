use std::io::Cursor;

use rocket::http::{ContentType, Header, Status};
use rocket::{request::Request, response, response::Responder, Response};

use crate::images::{ImageError, ValidationError};

pub const BAD_IMAGE_STATUS: Status = Status::BadRequest;
pub const BAD_IMAGE_BODY: &str = "Bad image";

/// Every failure of the image endpoint. All variants render the same
/// placeholder so no internal detail reaches the client.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    ImageError(ImageError),
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        ApiError::Validation(error)
    }
}

impl From<ImageError> for ApiError {
    fn from(error: ImageError) -> Self {
        ApiError::ImageError(error)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        match &self {
            ApiError::Validation(error) => log::debug!("Bad image request: {}", error),
            ApiError::ImageError(error) => log::debug!("Bad image result: {}", error),
        }

        bad_image_response()
    }
}

/// The fixed fallback response.
pub fn bad_image_response() -> response::Result<'static> {
    Response::build()
        .status(BAD_IMAGE_STATUS)
        .header(ContentType::Plain)
        .header(Header::new("Cache-Control", "no-store"))
        .sized_body(BAD_IMAGE_BODY.len(), Cursor::new(BAD_IMAGE_BODY))
        .ok()
}
