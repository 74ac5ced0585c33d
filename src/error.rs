// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::auth::AuthError;
use crate::database::DatabaseError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),
    ValidationError {
        message: String,
        field_errors: Option<HashMap<String, String>>,
    },

    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),
    TenantInactive(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict
    Conflict(String),

    // 500 Internal Server Error
    ProvisioningError(String),
    ConnectionError(String),
    InternalServerError(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::ValidationError { .. } => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::TenantInactive(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::ProvisioningError(_) => 500,
            ApiError::ConnectionError(_) => 500,
            ApiError::InternalServerError(_) => 500,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::ValidationError { message, .. } => message,
            ApiError::Unauthorized(msg) => msg,
            ApiError::Forbidden(msg) => msg,
            ApiError::TenantInactive(msg) => msg,
            ApiError::NotFound(msg) => msg,
            ApiError::Conflict(msg) => msg,
            ApiError::ProvisioningError(msg) => msg,
            ApiError::ConnectionError(msg) => msg,
            ApiError::InternalServerError(msg) => msg,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::ValidationError { .. } => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::TenantInactive(_) => "TENANT_INACTIVE",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::ProvisioningError(_) => "PROVISIONING_ERROR",
            ApiError::ConnectionError(_) => "CONNECTION_ERROR",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        let mut response = json!({
            "success": false,
            "error": true,
            "status": self.status_code(),
            "code": self.error_code(),
            "message": self.message(),
        });

        if let ApiError::ValidationError { field_errors: Some(field_errors), .. } = self {
            response["field_errors"] = json!(field_errors);
        }

        response
    }
}

// Static constructor methods
impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn validation_error(
        message: impl Into<String>,
        field_errors: Option<HashMap<String, String>>,
    ) -> Self {
        ApiError::ValidationError {
            message: message.into(),
            field_errors,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn tenant_inactive(message: impl Into<String>) -> Self {
        ApiError::TenantInactive(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn provisioning_error(message: impl Into<String>) -> Self {
        ApiError::ProvisioningError(message.into())
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        ApiError::ConnectionError(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }
}

// Convert other error types to ApiError
impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => ApiError::not_found(msg),
            DatabaseError::Conflict(msg) => ApiError::conflict(msg),
            DatabaseError::InvalidSchemaName(name) => {
                let mut field_errors = HashMap::new();
                field_errors.insert(
                    "schema_name".to_string(),
                    "Lowercase letters, digits and underscores, starting with a letter".to_string(),
                );
                ApiError::validation_error(format!("Invalid schema name '{}'", name), Some(field_errors))
            }
            DatabaseError::Provisioning(msg) => {
                tracing::error!("Tenant provisioning error: {}", msg);
                ApiError::provisioning_error(msg)
            }
            DatabaseError::Connection(msg) => {
                tracing::error!("Database connection error: {}", msg);
                ApiError::connection_error("Database temporarily unavailable")
            }
            DatabaseError::RegistryClosed => {
                ApiError::connection_error("Service is shutting down")
            }
            DatabaseError::Query(msg) => {
                // Don't expose internal SQL errors to clients
                tracing::error!("Database query error: {}", msg);
                ApiError::internal_server_error("An error occurred while processing your request")
            }
            DatabaseError::ConfigMissing(_) | DatabaseError::InvalidDatabaseUrl(_) => {
                tracing::error!("Database configuration error: {}", err);
                ApiError::internal_server_error("Database is not configured")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::unauthorized(err.to_string())
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_status_and_code() {
        let body = ApiError::tenant_inactive("Organization is inactive").to_json();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], true);
        assert_eq!(body["status"], 403);
        assert_eq!(body["code"], "TENANT_INACTIVE");
        assert_eq!(body["message"], "Organization is inactive");
    }

    #[test]
    fn maps_database_errors() {
        let cases = [
            (DatabaseError::NotFound("x".into()), 404, "NOT_FOUND"),
            (DatabaseError::Conflict("x".into()), 409, "CONFLICT"),
            (DatabaseError::InvalidSchemaName("Bad".into()), 400, "VALIDATION_ERROR"),
            (DatabaseError::Provisioning("x".into()), 500, "PROVISIONING_ERROR"),
            (DatabaseError::Connection("x".into()), 500, "CONNECTION_ERROR"),
            (DatabaseError::RegistryClosed, 500, "CONNECTION_ERROR"),
            (DatabaseError::Query("x".into()), 500, "INTERNAL_SERVER_ERROR"),
        ];
        for (err, status, code) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status_code(), status);
            assert_eq!(api.error_code(), code);
        }
    }

    #[test]
    fn sql_text_is_not_returned() {
        let api: ApiError = DatabaseError::Query("relation \"secret\" does not exist".into()).into();
        assert!(!api.message().contains("secret"));
    }
}
