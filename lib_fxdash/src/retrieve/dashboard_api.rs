//! # Dashboard Backend API
//!
//! The REST endpoints the dashboard views poll or call. Payload shapes belong
//! to the backend and change with it, so bodies stay `serde_json::Value`; the
//! `coerce_*` helpers read numbers the backend sometimes sends as strings.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;

use super::http::{ApiClient, ApiError};

/// Handle to the dashboard backend. Cheap to clone into queued tasks.
#[derive(Debug, Clone)]
pub struct DashboardApi {
    client: Arc<ApiClient>,
}

impl DashboardApi {
    /// Wraps an [`ApiClient`] pointed at the backend root.
    pub fn new(client: ApiClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// The underlying HTTP client.
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// `GET /api/positions`: open positions.
    pub async fn positions(&self) -> Result<Value, ApiError> {
        self.get("api/positions").await
    }

    /// `GET /api/trades`: trade history, newest first, optionally limited.
    pub async fn trades(&self, limit: Option<u32>) -> Result<Value, ApiError> {
        match limit {
            Some(limit) => self.get(&format!("api/trades?limit={limit}")).await,
            None => self.get("api/trades").await,
        }
    }

    /// `GET /api/stats`: account and performance summary.
    pub async fn stats(&self) -> Result<Value, ApiError> {
        self.get("api/stats").await
    }

    /// `GET /api/config`: the bot's current settings.
    pub async fn config(&self) -> Result<Value, ApiError> {
        self.get("api/config").await
    }

    /// `PUT /api/config`: replaces the bot's settings.
    pub async fn update_config(&self, config: &Value) -> Result<Value, ApiError> {
        self.client.json(Method::PUT, "api/config", Some(config)).await
    }

    /// `GET /api/bot/status`: whether the bot is running.
    pub async fn bot_status(&self) -> Result<Value, ApiError> {
        self.get("api/bot/status").await
    }

    /// `POST /api/bot/start`.
    pub async fn start_bot(&self) -> Result<Value, ApiError> {
        self.post_empty("api/bot/start").await
    }

    /// `POST /api/bot/stop`.
    pub async fn stop_bot(&self) -> Result<Value, ApiError> {
        self.post_empty("api/bot/stop").await
    }

    /// `PUT /api/trades/{id}`: edits a trade's annotations.
    pub async fn update_trade(&self, id: &str, changes: &Value) -> Result<Value, ApiError> {
        let path = format!("api/trades/{id}");
        self.client.json(Method::PUT, &path, Some(changes)).await
    }

    /// `DELETE /api/trades/{id}`.
    pub async fn delete_trade(&self, id: &str) -> Result<Value, ApiError> {
        let path = format!("api/trades/{id}");
        self.client.json::<Value, Value>(Method::DELETE, &path, None).await
    }

    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.client.json::<Value, Value>(Method::GET, path, None).await
    }

    async fn post_empty(&self, path: &str) -> Result<Value, ApiError> {
        self.client.json::<Value, Value>(Method::POST, path, None).await
    }
}

/// Reads a float that may arrive as a JSON number or a numeric string.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Reads an integer that may arrive as a JSON number or a numeric string.
/// Floats with a fractional part are rejected.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|v| v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64)
                .map(|v| v as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| coerce_i64(&Value::from(s.parse::<f64>().ok()?)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn floats_from_numbers_and_strings() {
        assert_eq!(coerce_f64(&json!(1.25)), Some(1.25));
        assert_eq!(coerce_f64(&json!(3)), Some(3.0));
        assert_eq!(coerce_f64(&json!(" 1.0845 ")), Some(1.0845));
        assert_eq!(coerce_f64(&json!("NaN")), None);
        assert_eq!(coerce_f64(&json!("n/a")), None);
        assert_eq!(coerce_f64(&Value::Null), None);
    }

    #[test]
    fn integers_from_numbers_and_strings() {
        assert_eq!(coerce_i64(&json!(42)), Some(42));
        assert_eq!(coerce_i64(&json!(-7)), Some(-7));
        assert_eq!(coerce_i64(&json!(100.0)), Some(100));
        assert_eq!(coerce_i64(&json!("15")), Some(15));
        assert_eq!(coerce_i64(&json!("15.0")), Some(15));
        assert_eq!(coerce_i64(&json!(2.5)), None);
        assert_eq!(coerce_i64(&json!("2.5")), None);
        assert_eq!(coerce_i64(&json!(true)), None);
    }
}
