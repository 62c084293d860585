use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub message: String,
}

/// Body of a non-2xx answer produced by the bridge itself.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }
}
