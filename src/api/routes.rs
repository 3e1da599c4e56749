use std::io::Write as _;
use std::path::Path;

use axum::extract::{Extension, Multipart};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::AppState;
use crate::extract::{self, ExtractError};

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".into(),
        }),
    )
}

/// Accept a multipart upload in the `video` field and respond with the last
/// decodable frame as JPEG bytes.
#[axum::debug_handler]
pub async fn extract_frame(
    Extension(state): Extension<AppState>,
    mut multipart: Multipart,
) -> Response {
    // A part with no filename attribute is a form value, not a file upload,
    // so it cannot satisfy the `video` field.
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("video") && field.file_name().is_some() => {
                break field;
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return err_response(StatusCode::BAD_REQUEST, "No video file provided");
            }
            Err(error) => {
                warn!(%error, "Malformed multipart body");
                return err_response(error.status(), &error.body_text());
            }
        }
    };

    let filename = field.file_name().unwrap_or_default().to_string();
    if filename.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "No selected file");
    }

    let data = match field.bytes().await {
        Ok(data) => data,
        Err(error) => {
            warn!(%filename, %error, "Failed to read video field");
            return err_response(error.status(), &error.body_text());
        }
    };

    info!(%filename, size = data.len(), "Extracting last frame");

    // The whole open-seek-decode-encode sequence is blocking ffmpeg work;
    // keep it off the async workers.
    let temp_dir = state.temp_dir().to_path_buf();
    let jpeg_quality = state.jpeg_quality;
    let result =
        tokio::task::spawn_blocking(move || extract_from_bytes(&temp_dir, &data, jpeg_quality))
            .await;

    match result {
        Ok(Ok(jpeg)) => {
            info!(%filename, size = jpeg.len(), "Extraction finished");
            jpeg_response(jpeg)
        }
        Ok(Err(error)) => {
            error!(%filename, ?error, "Extraction failed");
            err_response(error_status(&error), &error.to_string())
        }
        Err(error) => {
            error!(%filename, %error, "Extraction task failed to run");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// Stage the upload to a scoped temp file and run the extraction. The staged
/// file is deleted on drop, whatever the outcome.
fn extract_from_bytes(
    temp_dir: &Path,
    data: &Bytes,
    jpeg_quality: u8,
) -> Result<Vec<u8>, ExtractError> {
    let mut staged = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".mp4")
        .tempfile_in(temp_dir)
        .map_err(ExtractError::StageUpload)?;
    staged.write_all(data).map_err(ExtractError::StageUpload)?;
    staged.flush().map_err(ExtractError::StageUpload)?;

    extract::last_frame_jpeg(staged.path(), jpeg_quality)
}

/// Status for each failure kind; only the empty-video case is the client's
/// fault.
fn error_status(error: &ExtractError) -> StatusCode {
    match error {
        ExtractError::EmptyVideo => StatusCode::BAD_REQUEST,
        ExtractError::OpenVideo(_)
        | ExtractError::FrameRead
        | ExtractError::EncodeImage(_)
        | ExtractError::StageUpload(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn jpeg_response(jpeg: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response()
}

fn err_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
