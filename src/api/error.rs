use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for the HTTP handlers.
///
/// Each variant maps to an HTTP status code; the body keeps the
/// `{"status":"error","message":...}` envelope the front ends expect.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - No session or secondary code matches.
    InvalidCode,
    /// 404 - The code is not a primary session code.
    SessionNotFound,
    /// 403 - The code does not grant the leader role.
    Unauthorized,
    /// 404 - No connection with the target name exists.
    VehicleNotFound,
    /// 404 - No notice exists for the target name.
    NoticeNotFound,
    /// 400 - The status value is not one of the eight wire strings.
    InvalidStatus(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCode => StatusCode::NOT_FOUND,
            ApiError::SessionNotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::FORBIDDEN,
            ApiError::VehicleNotFound => StatusCode::NOT_FOUND,
            ApiError::NoticeNotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidStatus(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidCode => "Invalid code".to_string(),
            ApiError::SessionNotFound => "Leitstelle not found".to_string(),
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::VehicleNotFound => "Vehicle not found".to_string(),
            ApiError::NoticeNotFound => "Notice not found".to_string(),
            ApiError::InvalidStatus(value) => format!("Invalid status value: {value}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "message": self.message(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
