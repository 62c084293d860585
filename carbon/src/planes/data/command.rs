use crate::codec::encode_value;
use crate::domain::response::ResponseBody;
use crate::domain::{Envelope, required};
use crate::planes::control::QueryWorkers;
use crate::ports::{CacheConnection, OpHandle, OpResult, OpValue, Operation};
use serde_json::{Map, Value};
use shared::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The closed set of commands the proxy understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Set,
    Get,
    GetBulk,
    Status,
    Gat,
    Append,
    Prepend,
    Add,
    Replace,
    Touch,
    GetStats,
    Incr,
    Decr,
    Delete,
    Flush,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::Set,
        Command::Get,
        Command::GetBulk,
        Command::Status,
        Command::Gat,
        Command::Append,
        Command::Prepend,
        Command::Add,
        Command::Replace,
        Command::Touch,
        Command::GetStats,
        Command::Incr,
        Command::Decr,
        Command::Delete,
        Command::Flush,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Set => "set",
            Command::Get => "get",
            Command::GetBulk => "getbulk",
            Command::Status => "status",
            Command::Gat => "gat",
            Command::Append => "append",
            Command::Prepend => "prepend",
            Command::Add => "add",
            Command::Replace => "replace",
            Command::Touch => "touch",
            Command::GetStats => "getstats",
            Command::Incr => "incr",
            Command::Decr => "decr",
            Command::Delete => "delete",
            Command::Flush => "flush",
        }
    }

    /// Reads reply regardless of `shouldReply`.
    pub fn always_replies(self) -> bool {
        matches!(
            self,
            Command::Get | Command::GetBulk | Command::Gat | Command::Status | Command::GetStats
        )
    }

    /// Safe to resend when the outcome of an earlier attempt is unknown.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Command::Get | Command::GetBulk | Command::Status | Command::GetStats
        )
    }

    /// Starts the command and returns its in-flight handle. Never blocks:
    /// STATUS and GETSTATS are handed to the query workers, everything else
    /// goes to the connection.
    pub fn submit(
        self,
        connection: Arc<dyn CacheConnection>,
        envelope: &Envelope,
        workers: &QueryWorkers,
    ) -> Result<OpHandle> {
        match self {
            Command::Status => Ok(workers.submit(self.name(), move || OpValue::Servers {
                available: connection.available_servers(),
                unavailable: connection.unavailable_servers(),
            })),
            Command::GetStats => Ok(workers.submit(self.name(), move || {
                OpValue::Stats(connection.stats())
            })),
            _ => {
                let operation = self.operation(envelope)?;
                Ok(connection.submit(operation))
            }
        }
    }

    /// Validates the envelope and builds the backend operation for it.
    pub fn operation(self, envelope: &Envelope) -> Result<Operation> {
        let key = || envelope.key().map(str::to_string);

        let operation = match self {
            Command::Get => Operation::Get { key: key()? },
            Command::GetBulk => Operation::GetBulk {
                keys: envelope.keys()?,
            },
            Command::Gat => Operation::GetAndTouch {
                key: key()?,
                exp: required("exp", envelope.exp()?)?,
            },
            Command::Set => Operation::Set {
                key: key()?,
                exp: envelope.exp()?.unwrap_or(0),
                value: envelope.value()?,
            },
            Command::Add => Operation::Add {
                key: key()?,
                exp: envelope.exp()?.unwrap_or(0),
                value: envelope.value()?,
            },
            Command::Replace => Operation::Replace {
                key: key()?,
                exp: envelope.exp()?.unwrap_or(0),
                value: envelope.value()?,
            },
            Command::Append => Operation::Append {
                key: key()?,
                cas: required("cas", envelope.cas()?)?,
                value: envelope.value()?,
            },
            Command::Prepend => Operation::Prepend {
                key: key()?,
                cas: required("cas", envelope.cas()?)?,
                value: envelope.value()?,
            },
            Command::Touch => Operation::Touch {
                key: key()?,
                exp: required("exp", envelope.exp()?)?,
            },
            Command::Incr => Operation::Incr {
                key: key()?,
                by: required("by", envelope.by()?)?,
            },
            Command::Decr => Operation::Decr {
                key: key()?,
                by: required("by", envelope.by()?)?,
            },
            Command::Delete => Operation::Delete { key: key()? },
            Command::Flush => Operation::Flush {
                delay: envelope.delay()?.unwrap_or(0),
            },
            Command::Status | Command::GetStats => {
                return Err(Error::Internal(format!(
                    "'{}' has no backend operation",
                    self.name()
                )));
            }
        };
        Ok(operation)
    }

    /// Turns a finished operation into the reply body. `None` means the
    /// operation never finished in time.
    pub fn build_response(self, envelope: &Envelope, outcome: Option<OpResult>) -> Result<ResponseBody> {
        let value = outcome.ok_or_else(|| Error::Timeout(self.name().to_string()))??;
        let key = envelope.key().unwrap_or_default();

        match (self, value) {
            (Command::Get, OpValue::Fetched(Some(found))) => {
                let mut data = keyed(key);
                data.insert("value".to_string(), encode_value(&found)?);
                Ok(ResponseBody::success(data))
            }
            (Command::Gat, OpValue::CasFetched(Some(found))) => {
                let mut data = keyed(key);
                data.insert("value".to_string(), encode_value(&found.value)?);
                data.insert("cas".to_string(), Value::from(found.cas));
                Ok(ResponseBody::success(data))
            }
            (Command::Get, OpValue::Fetched(None))
            | (Command::Gat, OpValue::CasFetched(None))
            | (Command::Incr | Command::Decr, OpValue::Counter(None)) => {
                Ok(ResponseBody::failure(format!("failed to fetch key '{key}'")))
            }
            (Command::GetBulk, OpValue::Bulk(found)) => {
                let mut data = Map::new();
                for (key, value) in found {
                    data.insert(key, encode_value(&value)?);
                }
                Ok(ResponseBody::success(data))
            }
            (Command::Incr | Command::Decr, OpValue::Counter(Some(counter))) => {
                let mut data = Map::new();
                data.insert("new_value".to_string(), Value::from(counter));
                Ok(ResponseBody::success(data))
            }
            (
                Command::Status,
                OpValue::Servers {
                    available,
                    unavailable,
                },
            ) => {
                let mut data = Map::new();
                data.insert("available".to_string(), Value::from(available));
                data.insert("unavailable".to_string(), Value::from(unavailable));
                Ok(ResponseBody::success(data))
            }
            (Command::GetStats, OpValue::Stats(stats)) => {
                let data = stats
                    .into_iter()
                    .map(|(server, values)| {
                        let values = values
                            .into_iter()
                            .map(|(name, value)| (name, Value::String(value)))
                            .collect();
                        (server, Value::Object(values))
                    })
                    .collect();
                Ok(ResponseBody::success(data))
            }
            (command, OpValue::Stored(true)) if command.stores() => {
                Ok(ResponseBody::success(Map::new()))
            }
            (command, OpValue::Stored(false)) if command.stores() => {
                Ok(ResponseBody::failure(command.failure_reason(key)))
            }
            (command, other) => Err(Error::Internal(format!(
                "'{}' cannot answer with {:?}",
                command.name(),
                other
            ))),
        }
    }

    fn stores(self) -> bool {
        matches!(
            self,
            Command::Set
                | Command::Add
                | Command::Replace
                | Command::Append
                | Command::Prepend
                | Command::Touch
                | Command::Delete
                | Command::Flush
        )
    }

    fn failure_reason(self, key: &str) -> String {
        match self {
            Command::Set => format!("failed to store key '{key}'"),
            Command::Add => format!("failed to add key '{key}'"),
            Command::Replace => format!("failed to replace key '{key}'"),
            Command::Append => format!("failed to append to key '{key}'"),
            Command::Prepend => format!("failed to prepend to key '{key}'"),
            Command::Touch => format!("failed to touch key '{key}'"),
            Command::Delete => format!("failed to delete key '{key}'"),
            Command::Flush => "failed to flush".to_string(),
            other => format!("failed to {} key '{key}'", other.name()),
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Command::ALL
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::UnknownCommand(s.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn keyed(key: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("key".to_string(), Value::String(key.to_string()));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CacheValue, CasValue};
    use crate::testkit::{Behaviour, ScriptedConnection};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn envelope(body: Value) -> Envelope {
        Envelope::from_body(&body).unwrap()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!("GET".parse::<Command>(), Ok(Command::Get));
        assert_eq!("GetBulk".parse::<Command>(), Ok(Command::GetBulk));
        assert_eq!("getstats".parse::<Command>(), Ok(Command::GetStats));
        assert_eq!(
            "frob".parse::<Command>(),
            Err(Error::UnknownCommand("frob".to_string()))
        );
    }

    #[test]
    fn test_every_command_round_trips_through_its_name() {
        for command in Command::ALL {
            assert_eq!(command.name().parse::<Command>(), Ok(command));
        }
    }

    #[test]
    fn test_key_is_checked_before_anything_else() {
        for command in [
            Command::Get,
            Command::Gat,
            Command::Set,
            Command::Append,
            Command::Touch,
            Command::Incr,
            Command::Delete,
        ] {
            assert_eq!(
                command.operation(&envelope(json!({"key": ""}))),
                Err(Error::MissingField("key")),
                "{command}"
            );
        }
    }

    #[test]
    fn test_mandatory_fields() {
        let env = envelope(json!({"key": "k", "value": "v"}));
        assert_eq!(Command::Incr.operation(&env), Err(Error::MissingField("by")));
        assert_eq!(Command::Touch.operation(&env), Err(Error::MissingField("exp")));
        assert_eq!(Command::Append.operation(&env), Err(Error::MissingField("cas")));
        assert_eq!(
            Command::Set.operation(&envelope(json!({"key": "k"}))),
            Err(Error::MissingField("value"))
        );
        assert_eq!(
            Command::GetBulk.operation(&env),
            Err(Error::MissingField("keys"))
        );
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let env = envelope(json!({"key": "k", "value": 5}));
        assert_eq!(
            Command::Set.operation(&env),
            Ok(Operation::Set {
                key: "k".to_string(),
                exp: 0,
                value: CacheValue::Int(5)
            })
        );
        assert_eq!(
            Command::Flush.operation(&envelope(json!({}))),
            Ok(Operation::Flush { delay: 0 })
        );
    }

    #[test]
    fn test_unsupported_value_is_rejected() {
        let env = envelope(json!({"key": "k", "value": [1, 2]}));
        assert!(matches!(
            Command::Set.operation(&env),
            Err(Error::UnsupportedValueType(_))
        ));
    }

    #[test]
    fn test_get_response_shapes() {
        let env = envelope(json!({"key": "k"}));
        let hit = Command::Get
            .build_response(&env, Some(Ok(OpValue::Fetched(Some(CacheValue::Float(1.5))))))
            .unwrap();
        assert_eq!(Value::Object(hit.data), json!({"key": "k", "value": 1.5}));

        let miss = Command::Get
            .build_response(&env, Some(Ok(OpValue::Fetched(None))))
            .unwrap();
        assert!(!miss.success);
        assert_eq!(miss.reason.as_deref(), Some("failed to fetch key 'k'"));
    }

    #[test]
    fn test_gat_includes_cas() {
        let env = envelope(json!({"key": "k", "exp": 10}));
        let body = Command::Gat
            .build_response(
                &env,
                Some(Ok(OpValue::CasFetched(Some(CasValue::new(
                    CacheValue::Text("v".to_string()),
                    42,
                ))))),
            )
            .unwrap();
        assert_eq!(
            Value::Object(body.data),
            json!({"key": "k", "value": "v", "cas": 42})
        );
    }

    #[test]
    fn test_getbulk_contains_only_found_keys() {
        let env = envelope(json!({"keys": ["a", "b"]}));
        let found = BTreeMap::from([("a".to_string(), CacheValue::Bool(true))]);
        let body = Command::GetBulk
            .build_response(&env, Some(Ok(OpValue::Bulk(found))))
            .unwrap();
        assert_eq!(Value::Object(body.data), json!({"a": true}));
    }

    #[test]
    fn test_counter_responses() {
        let env = envelope(json!({"key": "n", "by": 2}));
        let body = Command::Incr
            .build_response(&env, Some(Ok(OpValue::Counter(Some(12)))))
            .unwrap();
        assert_eq!(Value::Object(body.data), json!({"new_value": 12}));

        let missing = Command::Decr
            .build_response(&env, Some(Ok(OpValue::Counter(None))))
            .unwrap();
        assert!(!missing.success);
    }

    #[test]
    fn test_storage_failure_names_the_key() {
        let env = envelope(json!({"key": "k"}));
        let body = Command::Add
            .build_response(&env, Some(Ok(OpValue::Stored(false))))
            .unwrap();
        assert_eq!(body.reason.as_deref(), Some("failed to add key 'k'"));
        assert_eq!(body.data, Map::new());
    }

    #[test]
    fn test_missing_outcome_is_a_timeout() {
        let env = envelope(json!({"key": "k"}));
        assert_eq!(
            Command::Delete.build_response(&env, None),
            Err(Error::Timeout("delete".to_string()))
        );
    }

    #[test]
    fn test_backend_failure_is_passed_through() {
        let env = envelope(json!({"key": "k"}));
        let failure = Error::Backend("connection reset".to_string());
        assert_eq!(
            Command::Set.build_response(&env, Some(Err(failure.clone()))),
            Err(failure)
        );
    }

    #[test]
    fn test_mismatched_result_is_internal() {
        let env = envelope(json!({"key": "k"}));
        assert!(matches!(
            Command::Get.build_response(&env, Some(Ok(OpValue::Stored(true)))),
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_status_is_answered_by_workers() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Park));
        let workers = QueryWorkers::new(1, Duration::from_millis(500));
        let env = envelope(json!({}));
        let handle = Command::Status
            .submit(connection.clone(), &env, &workers)
            .unwrap();

        let body = Command::Status
            .build_response(&env, Some(handle.wait().await))
            .unwrap();
        assert_eq!(
            Value::Object(body.data),
            json!({"available": ["10.0.0.1:11211"], "unavailable": ["10.0.0.2:11211"]})
        );
        assert!(connection.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_getstats_is_keyed_by_server() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Park));
        let workers = QueryWorkers::new(1, Duration::from_millis(500));
        let env = envelope(json!({}));
        let handle = Command::GetStats.submit(connection, &env, &workers).unwrap();

        let body = Command::GetStats
            .build_response(&env, Some(handle.wait().await))
            .unwrap();
        assert_eq!(
            Value::Object(body.data),
            json!({"10.0.0.1:11211": {"curr_items": "3"}})
        );
    }

    #[tokio::test]
    async fn test_slow_status_submit_returns_immediately() {
        let connection = Arc::new(
            ScriptedConnection::new(Behaviour::Immediate)
                .with_query_delay(Duration::from_millis(200)),
        );
        let workers = QueryWorkers::new(1, Duration::from_millis(500));
        let started = std::time::Instant::now();
        let mut handle = Command::Status
            .submit(connection, &envelope(json!({})), &workers)
            .unwrap();
        assert!(handle.try_take().is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_submit_hands_operation_to_connection() {
        let connection = Arc::new(ScriptedConnection::new(Behaviour::Immediate));
        let workers = QueryWorkers::new(1, Duration::from_millis(500));
        let mut handle = Command::Delete
            .submit(connection.clone(), &envelope(json!({"key": "gone"})), &workers)
            .unwrap();

        assert_eq!(handle.try_take(), Some(Ok(OpValue::Stored(true))));
        assert_eq!(
            connection.submitted(),
            vec![Operation::Delete {
                key: "gone".to_string()
            }]
        );
    }
}
