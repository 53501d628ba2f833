use serde::Deserialize;
use serde_json::Value;

/// Body of `POST /events` and `POST /events/:client_id`.
#[derive(Debug, Deserialize)]
pub(crate) struct PublishParams {
    /// Written as the frame's `event:` line.
    pub(crate) event: String,
    /// Any JSON value; null object fields are dropped on the wire.
    #[serde(default)]
    pub(crate) data: Value,
    #[serde(default)]
    pub(crate) id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_and_id_are_optional() {
        let params: PublishParams = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(params.event, "ping");
        assert_eq!(params.data, Value::Null);
        assert_eq!(params.id, None);
    }
}
