// Platform API response envelope
//
// Every backend response is wrapped as `{ data, meta, error }`. Validation
// failures may instead carry an `errors` array.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ==================================================================================================
// Envelope
// ==================================================================================================

/// Top-level fields of a response body. Each field is taken independently, so
/// an unexpected shape in one does not hide the others.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub data: Value,
    pub meta: Value,
    error: Value,
    errors: Value,
}

impl Envelope {
    /// Parse a response body. An empty body yields an empty envelope; a body
    /// that is not JSON is an error.
    pub fn parse(body: &[u8]) -> serde_json::Result<Self> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_slice(body)?;
        Ok(Self::from_value(value))
    }

    fn from_value(mut value: Value) -> Self {
        let mut take = |key: &str| value.get_mut(key).map(Value::take).unwrap_or_default();
        Self {
            data: take("data"),
            meta: take("meta"),
            error: take("error"),
            errors: take("errors"),
        }
    }

    /// Human-readable failure message for a non-2xx response
    pub fn error_message(&self, status: u16) -> String {
        message_of(&self.error)
            .or_else(|| self.errors.get(0).and_then(message_of))
            .unwrap_or_else(|| format!("Request failed ({})", status))
    }

    /// Take the payload, `null` when absent
    pub fn into_data(self) -> Value {
        self.data
    }
}

/// `{"message": "..."}` or a bare string
fn message_of(error: &Value) -> Option<String> {
    let message = match error {
        Value::String(s) => s.as_str(),
        Value::Object(_) => error.get("message")?.as_str()?,
        _ => return None,
    };
    (!message.is_empty()).then(|| message.to_string())
}

// ==================================================================================================
// Refresh exchange
// ==================================================================================================

/// `POST /auth/refresh` request body
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// `data` of a successful refresh response
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub user: Option<RefreshedUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedUser {
    pub tenant_id: Option<String>,
}
