//! Wire protocol types for endpoint-to-endpoint calls.
//!
//! Two message shapes travel over a [`Channel`](super::transport::Channel):
//! - **call**: `{ "type": "call", "rpc": true, "id", "name", "args" }`
//! - **result**: `{ "type": "result", "rpc": true, "id", "error", "result" }`
//!
//! The `rpc: true` marker lets an endpoint share its channel with unrelated
//! traffic; values without it are never routed.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Correlates a result with the call that produced it.
///
/// Allocated by the calling endpoint and echoed back verbatim by the peer, so
/// uniqueness only matters among one endpoint's own outstanding calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `rpc: true` marker carried by every protocol message.
///
/// Serializes as `true` and refuses to deserialize from anything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcTag;

impl Serialize for RpcTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for RpcTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(RpcTag)
        } else {
            Err(de::Error::custom("expected `rpc: true`"))
        }
    }
}

impl RpcTag {
    /// Whether a raw channel value is tagged as protocol traffic.
    pub fn is_tagged(value: &Value) -> bool {
        value.get("rpc").and_then(Value::as_bool) == Some(true)
    }
}

/// Ordered argument list of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw argument at `index`, if present.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserialize the argument at `index`.
    ///
    /// Missing arguments deserialize from `null`, so `Option<T>` parameters
    /// behave like optional trailing arguments.
    pub fn get<T: serde::de::DeserializeOwned>(&self, index: usize) -> serde_json::Result<T> {
        match self.0.get(index) {
            Some(v) => T::deserialize(v),
            None => T::deserialize(&Value::Null),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// An array is the argument list; any other value is a single argument.
impl From<Value> for Args {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(values) => Self(values),
            other => Self(vec![other]),
        }
    }
}

impl<'a> IntoIterator for &'a Args {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Request to invoke `name` on the receiving endpoint.
    Call {
        rpc: RpcTag,
        id: CallId,
        name: String,
        #[serde(default)]
        args: Args,
    },

    /// Reply to the call with the same `id`.
    ///
    /// A non-null `error` means the call failed and `result` is ignored.
    Result {
        rpc: RpcTag,
        id: CallId,
        #[serde(default)]
        error: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

impl Message {
    pub fn call(id: CallId, name: impl Into<String>, args: Args) -> Self {
        Self::Call {
            rpc: RpcTag,
            id,
            name: name.into(),
            args,
        }
    }

    pub fn success(id: CallId, result: Value) -> Self {
        Self::Result {
            rpc: RpcTag,
            id,
            error: None,
            result: Some(result),
        }
    }

    /// `error` must already be encoded by the error codec.
    pub fn failure(id: CallId, error: Value) -> Self {
        Self::Result {
            rpc: RpcTag,
            id,
            error: Some(error),
            result: None,
        }
    }

    pub fn id(&self) -> CallId {
        match self {
            Self::Call { id, .. } | Self::Result { id, .. } => *id,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_serializes() {
        let msg = Message::call(CallId::new(7), "add", Args::from(json!([1, 2])));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "call",
          "rpc": true,
          "id": 7,
          "name": "add",
          "args": [
            1,
            2
          ]
        }
        "#);
    }

    #[test]
    fn success_serializes() {
        let msg = Message::success(CallId::new(7), json!(3));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "result",
          "rpc": true,
          "id": 7,
          "error": null,
          "result": 3
        }
        "#);
    }

    #[test]
    fn failure_omits_result() {
        let msg = Message::failure(CallId::new(7), json!({"message": "boom"}));
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "result",
          "rpc": true,
          "id": 7,
          "error": {
            "message": "boom"
          }
        }
        "#);
    }

    #[test]
    fn call_without_args_parses() {
        let msg = Message::from_value(json!({"rpc": true, "type": "call", "id": 1, "name": "ten"}))
            .unwrap();
        assert_eq!(msg, Message::call(CallId::new(1), "ten", Args::default()));
    }

    #[test]
    fn null_result_is_success() {
        let msg =
            Message::from_value(json!({"rpc": true, "type": "result", "id": 4, "error": null, "result": null}))
                .unwrap();
        match msg {
            Message::Result { id, error, .. } => {
                assert_eq!(id, CallId::new(4));
                assert!(error.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn untagged_value_rejected() {
        let value = json!({"rpc": false, "type": "call", "id": 1, "name": "ten"});
        assert!(!RpcTag::is_tagged(&value));
        assert!(Message::from_value(value).is_err());
        assert!(!RpcTag::is_tagged(&json!("hello")));
    }

    #[test]
    fn args_from_values() {
        assert!(Args::from(()).is_empty());
        assert_eq!(Args::from(json!("foo")).into_inner(), vec![json!("foo")]);
        assert_eq!(Args::from(json!([1, 2])).len(), 2);
        assert_eq!(Args::from(json!(null)).into_inner(), vec![Value::Null]);
    }

    #[test]
    fn args_get_typed() {
        let args = Args::from(json!([1, "two"]));
        assert_eq!(args.get::<i64>(0).unwrap(), 1);
        assert_eq!(args.get::<String>(1).unwrap(), "two");
        assert_eq!(args.get::<Option<i64>>(2).unwrap(), None);
        assert!(args.get::<i64>(1).is_err());
    }
}
