use crate::codec;
use serde_json::{Map, Value};
use shared::{Error, Result};

/// A value the cache can hold. These are the only shapes the codec accepts
/// from the wire and the only shapes it will produce on the way back.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl CacheValue {
    /// Raw representation used when memcached treats the item as opaque data
    /// (append, prepend, counters).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CacheValue::Bool(b) => b.to_string().into_bytes(),
            CacheValue::Int(i) => i.to_string().into_bytes(),
            CacheValue::Float(f) => f.to_string().into_bytes(),
            CacheValue::Text(s) => s.clone().into_bytes(),
            CacheValue::Bytes(b) => b.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CacheValue::Bool(_) => "boolean",
            CacheValue::Int(_) => "integer",
            CacheValue::Float(_) => "float",
            CacheValue::Text(_) => "string",
            CacheValue::Bytes(_) => "bytes",
        }
    }
}

/// A fetched value together with its check-and-set token.
#[derive(Clone, Debug, PartialEq)]
pub struct CasValue {
    pub value: CacheValue,
    pub cas: u64,
}

impl CasValue {
    pub fn new(value: CacheValue, cas: u64) -> Self {
        Self { value, cas }
    }
}

/// Read-only view over the JSON object carried by a bus message.
///
/// Field accessors validate on access, so a command only fails on the
/// fields it actually reads.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn from_body(body: &Value) -> Result<Self> {
        match body {
            Value::Object(fields) => Ok(Self::from_fields(fields.clone())),
            _ => Err(Error::MissingCommand),
        }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// The `command` field as sent, if it is a string at all.
    pub fn raw_command(&self) -> Option<&str> {
        self.fields.get("command").and_then(Value::as_str)
    }

    pub fn command(&self) -> Result<&str> {
        match self.raw_command() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(Error::MissingCommand),
        }
    }

    pub fn should_reply(&self) -> bool {
        self.fields
            .get("shouldReply")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn key(&self) -> Result<&str> {
        match self.fields.get("key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::MissingField("key")),
        }
    }

    pub fn value(&self) -> Result<CacheValue> {
        match self.fields.get("value") {
            None | Some(Value::Null) => Err(Error::MissingField("value")),
            Some(value) => codec::decode_value(value),
        }
    }

    /// Expiration in memcached terms: seconds, or an absolute unix time once
    /// past thirty days.
    pub fn exp(&self) -> Result<Option<i64>> {
        self.optional_i64("exp")
    }

    pub fn cas(&self) -> Result<Option<u64>> {
        self.optional_u64("cas")
    }

    pub fn by(&self) -> Result<Option<u64>> {
        self.optional_u64("by")
    }

    pub fn delay(&self) -> Result<Option<i64>> {
        self.optional_i64("delay")
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let list = match self.fields.get("keys") {
            None | Some(Value::Null) => return Err(Error::MissingField("keys")),
            Some(Value::Array(list)) if list.is_empty() => {
                return Err(Error::MissingField("keys"));
            }
            Some(Value::Array(list)) => list,
            Some(_) => {
                return Err(Error::InvalidField {
                    field: "keys",
                    expected: "an array of non-empty strings",
                });
            }
        };

        list.iter()
            .map(|key| {
                match key.as_str() {
                    Some(key) if !key.is_empty() => Ok(key.to_string()),
                    _ => Err(Error::InvalidField {
                        field: "keys",
                        expected: "an array of non-empty strings",
                    }),
                }
            })
            .collect()
    }

    fn optional_i64(&self, field: &'static str) -> Result<Option<i64>> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or(Error::InvalidField {
                field,
                expected: "an integer",
            }),
        }
    }

    fn optional_u64(&self, field: &'static str) -> Result<Option<u64>> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or(Error::InvalidField {
                field,
                expected: "a non-negative integer",
            }),
        }
    }
}

/// Turns an absent optional field into the matching validation error.
pub fn required<T>(field: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or(Error::MissingField(field))
}

pub mod response {
    use serde_json::{Map, Value, json};
    use shared::Error;

    /// The `response` object of a successful reply.
    #[derive(Clone, Debug, PartialEq)]
    pub struct ResponseBody {
        pub data: Map<String, Value>,
        pub success: bool,
        pub reason: Option<String>,
    }

    impl ResponseBody {
        pub fn success(data: Map<String, Value>) -> Self {
            Self {
                data,
                success: true,
                reason: None,
            }
        }

        pub fn failure(reason: impl Into<String>) -> Self {
            Self {
                data: Map::new(),
                success: false,
                reason: Some(reason.into()),
            }
        }

        pub fn to_json(&self) -> Value {
            let mut body = Map::new();
            body.insert("data".to_string(), Value::Object(self.data.clone()));
            body.insert("success".to_string(), Value::Bool(self.success));
            if let Some(reason) = &self.reason {
                body.insert("reason".to_string(), Value::String(reason.clone()));
            }
            Value::Object(body)
        }
    }

    pub fn ok_reply(command: Option<&str>, body: &ResponseBody) -> Value {
        let mut reply = json!({
            "status": "ok",
            "response": body.to_json(),
        });
        stamp_command(&mut reply, command);
        reply
    }

    pub fn error_reply(command: Option<&str>, error: &Error) -> Value {
        let mut reply = json!({
            "status": "error",
            "message": error.to_string(),
        });
        stamp_command(&mut reply, command);
        reply
    }

    fn stamp_command(reply: &mut Value, command: Option<&str>) {
        if let (Some(command), Some(fields)) = (command, reply.as_object_mut()) {
            fields.insert("command".to_string(), Value::String(command.to_string()));
        }
    }
}
