use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;

use crate::repo::RepoError;
use crate::validation::{BulkIssue, FieldErrors};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<BulkIssue>>,
}

/// Every variant carries the machine-readable code sent as `error`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")] BadRequest(&'static str),
    #[error("VALIDATION_ERROR")] Validation(FieldErrors),
    #[error("BULK_VALIDATION_ERROR")] BulkValidation(Vec<BulkIssue>),
    #[error("{0}")] Unauthorized(&'static str),
    #[error("{0}")] Forbidden(&'static str),
    #[error("{0}")] NotFound(&'static str),
    #[error("{0}")] Conflict(&'static str),
    #[error("LOGIN_RATE_LIMITED")] RateLimited,
    #[error("{0}")] Internal(&'static str),
}

impl ApiError {
    pub const INVALID_PAYLOAD: ApiError = ApiError::BadRequest("INVALID_PAYLOAD");
    pub const INVALID_ID: ApiError = ApiError::BadRequest("INVALID_ID");
    pub const MISSING_FIELDS: ApiError = ApiError::BadRequest("MISSING_FIELDS");
    pub const FORBIDDEN: ApiError = ApiError::Forbidden("FORBIDDEN");
    pub const NOT_FOUND: ApiError = ApiError::NotFound("NOT_FOUND");

    /// Single-field validation failure.
    pub fn field(name: &str, message: &str) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(name.to_string(), message.to_string());
        ApiError::Validation(fields)
    }

    pub fn code(&self) -> String {
        self.to_string()
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NOT_FOUND,
            RepoError::Conflict(code) => ApiError::Conflict(code),
            RepoError::Internal(detail) => {
                log::error!("storage failure: {detail}");
                ApiError::Internal("DB_ERROR")
            }
        }
    }
}

impl RepoError {
    /// Renames the generic not-found into a resource-specific code.
    pub fn not_found_as(self, code: &'static str) -> ApiError {
        match self {
            RepoError::NotFound => ApiError::NotFound(code),
            other => other.into(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) | ApiError::BulkValidation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = ApiErrorBody {
            error: self.code(),
            fields: match self { ApiError::Validation(f) => Some(f.clone()), _ => None },
            issues: match self { ApiError::BulkValidation(i) => Some(i.clone()), _ => None },
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_code_family() {
        assert_eq!(ApiError::MISSING_FIELDS.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized("TOKEN_EXPIRED").status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Conflict("EXISTS").status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::field("phone", "required").status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn storage_detail_is_not_exposed() {
        let e: ApiError = RepoError::Internal("relation \"students\" does not exist".into()).into();
        assert_eq!(e.code(), "DB_ERROR");
        assert_eq!(RepoError::NotFound.not_found_as("STUDENT_NOT_FOUND").code(), "STUDENT_NOT_FOUND");
    }
}
