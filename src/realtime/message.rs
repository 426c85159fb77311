use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved type of the handshake frame.
pub const AUTH_TYPE: &str = "auth";

/// One wire frame: a JSON object with a mandatory `type` and any other fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// `{type: "auth", userId}`
    pub fn auth(user_id: impl Into<String>) -> Self {
        Self::new(AUTH_TYPE).with("userId", Value::String(user_id.into()))
    }

    /// Adds a field. `type` is ignored, it always comes from `kind`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.payload.insert(key, value.into());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_auth(&self) -> bool {
        self.kind == AUTH_TYPE
    }

    /// The `userId` of a handshake frame: a non-empty string or an integer.
    pub fn auth_user_id(&self) -> Option<String> {
        match self.get("userId")? {
            Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            _ => None,
        }
    }
}

impl TryFrom<Value> for Envelope {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}
