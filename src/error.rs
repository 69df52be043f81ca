use std::path::PathBuf;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Seconds a client is asked to wait when every download slot is busy.
const ADMISSION_RETRY_AFTER_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("could not read quota file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write quota file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("quota file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("downloader {0} pipe was not captured")]
    MissingPipe(&'static str),
    #[error("failed waiting for downloader exit: {0}")]
    Wait(std::io::Error),
}

impl SupervisorError {
    /// Message stored on the task when the downloader never ran.
    pub fn task_message(&self) -> String {
        match self {
            Self::Spawn { program, source } if source.kind() == std::io::ErrorKind::NotFound => {
                format!("Downloader executable {program:?} was not found. Install yt-dlp or set YT_DLP_PATH.")
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not list download directory {path:?}: {source}")]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not read artifact metadata for {path:?}: {source}")]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not record quota usage: {0}")]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("downloader executable {0:?} was not found")]
    NotInstalled(String),
    #[error("could not run downloader: {0}")]
    Spawn(std::io::Error),
    #[error("metadata lookup exceeded {0} seconds")]
    TimedOut(u64),
    #[error("{0}")]
    Upstream(String),
    #[error("unexpected metadata output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("daily download quota exceeded")]
    QuotaExceeded { retry_after_seconds: u64 },
    #[error("all download slots are busy")]
    AdmissionDenied,
    #[error("a file named {0:?} already exists or is being downloaded")]
    FilenameConflict(String),
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub details: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            details: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::InvalidInput(message) => Self::bad_request(message),
            SubmitError::QuotaExceeded {
                retry_after_seconds,
            } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "Daily download quota exceeded. Try again tomorrow.",
            )
            .with_code("QUOTA_EXCEEDED")
            .with_retry_after(retry_after_seconds),
            SubmitError::AdmissionDenied => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "The server is busy with other downloads. Try again shortly.",
            )
            .with_code("ADMISSION_DENIED")
            .with_retry_after(ADMISSION_RETRY_AFTER_SECONDS),
            conflict @ SubmitError::FilenameConflict(_) => {
                Self::new(StatusCode::CONFLICT, conflict.to_string()).with_code("FILENAME_CONFLICT")
            }
            SubmitError::Quota(error) => {
                Self::internal(format!("Could not read download quota: {error}"))
            }
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(error: MetadataError) -> Self {
        let mut api_error = Self::internal("Failed to fetch video info");
        api_error.details = Some(error.to_string());
        api_error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            details: self.details,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_maps_to_429_with_retry_after() {
        let response = ApiError::from(SubmitError::QuotaExceeded {
            retry_after_seconds: 120,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "120");
    }

    #[test]
    fn admission_denied_maps_to_429() {
        let error = ApiError::from(SubmitError::AdmissionDenied);
        assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.code, Some("ADMISSION_DENIED"));
    }

    #[test]
    fn missing_executable_gets_install_hint() {
        let error = SupervisorError::Spawn {
            program: "yt-dlp".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(error.task_message().contains("YT_DLP_PATH"));
    }
}
