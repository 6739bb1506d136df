use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostpool_broker::BrokerError;
use hostpool_query::QueryError;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn not_acceptable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_ACCEPTABLE, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidQuery(_) | QueryError::Validate(_) => {
                ApiError::bad_request(e.to_string())
            }
            QueryError::Config(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match &e {
            BrokerError::NoProvisioner | BrokerError::ProvisionNotAllowed => {
                ApiError::not_acceptable(e.to_string())
            }
            BrokerError::NoMachineMatched => ApiError::bad_request(e.to_string()),
            BrokerError::TaskConflict(_) => ApiError::conflict(e.to_string()),
            BrokerError::Query(q) => match q {
                QueryError::InvalidQuery(_) | QueryError::Validate(_) => {
                    ApiError::bad_request(e.to_string())
                }
                QueryError::Config(_) => ApiError::internal(e.to_string()),
            },
            BrokerError::Store(_) | BrokerError::Task(_) => ApiError::internal(e.to_string()),
        }
    }
}
