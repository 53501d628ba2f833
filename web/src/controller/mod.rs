use serde::Serialize;

pub(crate) mod connection_controller;
pub(crate) mod event_controller;
pub(crate) mod health_check_controller;

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(status_code: u16, data: T) -> Self {
        Self {
            status_code,
            data: Some(data),
        }
    }

    pub fn no_content(status_code: u16) -> ApiResponse<()> {
        ApiResponse {
            status_code,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[test]
    fn test_serialize_api_response_with_data() {
        let response = ApiResponse::new(StatusCode::OK.into(), json!({"count": 3}));
        let serialized: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(serialized, json!({"status_code": 200, "data": {"count": 3}}));
    }

    #[test]
    fn test_serialize_api_response_without_data() {
        let response = ApiResponse::<()>::no_content(StatusCode::ACCEPTED.into());
        let serialized = serde_json::to_string(&response).unwrap();
        assert_eq!(serialized, json!({"status_code": 202}).to_string());
    }
}
