use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures that end a verification request without a classification.
#[derive(Debug, Error)]
pub enum Error {
    #[error("identifier not found")]
    MissingIdentifier,
    #[error("deal not found")]
    DealNotFound(String),
    #[error("{0}")]
    Upstream(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn upstream(method: &str, err: impl std::fmt::Display) -> Self {
        Error::Upstream(format!("{}: {}", method, err))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingIdentifier => StatusCode::BAD_REQUEST,
            Error::DealNotFound(_) => StatusCode::NOT_FOUND,
            Error::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = match &self {
            Error::DealNotFound(deal_id) => json!({
                "error": self.to_string(),
                "dealId": deal_id,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_responses() {
        let response = Error::MissingIdentifier.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "identifier not found" })
        );

        let response = Error::DealNotFound("42".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "deal not found", "dealId": "42" })
        );

        let response = Error::upstream("crm.deal.get", "connection refused").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "crm.deal.get: connection refused" })
        );
    }
}
