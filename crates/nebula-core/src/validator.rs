//! Inbound event validation.
//!
//! The [`SchemaRegistry`] maps event names to the positional argument shape
//! they must carry. Events without a registered schema are accepted as-is,
//! only known events are structurally checked. The registry is built at
//! startup and shared read-only by every connection.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::rooms::MAX_ROOM_NAME_LENGTH;

/// Maximum length of an event name relayed through `emit`.
pub const MAX_EVENT_NAME_LENGTH: usize = 128;

/// Validation failure with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    /// Why the payload was rejected.
    pub reason: String,
}

impl ValidationError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The expected type of a single argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    /// Any JSON value.
    Any,
    /// A string with a length range in bytes.
    String {
        /// Minimum length.
        min_len: usize,
        /// Maximum length.
        max_len: usize,
    },
    /// Any JSON number.
    Number,
    /// An integer in the given inclusive range.
    Integer {
        /// Minimum value.
        min: i64,
        /// Maximum value.
        max: i64,
    },
    /// A boolean.
    Bool,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
}

impl ArgKind {
    /// Non-empty string of at most `max_len` bytes.
    #[must_use]
    pub fn non_empty_string(max_len: usize) -> Self {
        ArgKind::String {
            min_len: 1,
            max_len,
        }
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        match (self, value) {
            (ArgKind::Any, _) => Ok(()),
            (ArgKind::String { min_len, max_len }, Value::String(s)) => {
                if s.len() < *min_len {
                    Err(format!("must be at least {min_len} bytes"))
                } else if s.len() > *max_len {
                    Err(format!("must be at most {max_len} bytes"))
                } else {
                    Ok(())
                }
            }
            (ArgKind::Number, Value::Number(_)) => Ok(()),
            (ArgKind::Integer { min, max }, Value::Number(n)) => match n.as_i64() {
                Some(i) if i < *min || i > *max => Err(format!("must be in {min}..={max}")),
                Some(_) => Ok(()),
                None => Err("expected integer".to_string()),
            },
            (ArgKind::Bool, Value::Bool(_)) => Ok(()),
            (ArgKind::Object, Value::Object(_)) => Ok(()),
            (ArgKind::Array, Value::Array(_)) => Ok(()),
            (expected, actual) => Err(format!("expected {expected}, got {}", type_name(actual))),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::Any => "any",
            ArgKind::String { .. } => "string",
            ArgKind::Number => "number",
            ArgKind::Integer { .. } => "integer",
            ArgKind::Bool => "boolean",
            ArgKind::Object => "object",
            ArgKind::Array => "array",
        };
        f.write_str(name)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A named positional argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    /// Argument name, used in error messages.
    pub name: &'static str,
    /// Expected type.
    pub kind: ArgKind,
    /// Whether the argument may be omitted.
    pub optional: bool,
}

/// The argument shape of one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSchema {
    args: Vec<ArgSpec>,
}

impl EventSchema {
    /// A schema that accepts only an empty argument list.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a required argument.
    #[must_use]
    pub fn arg(mut self, name: &'static str, kind: ArgKind) -> Self {
        self.args.push(ArgSpec {
            name,
            kind,
            optional: false,
        });
        self
    }

    /// Add an optional trailing argument.
    #[must_use]
    pub fn optional(mut self, name: &'static str, kind: ArgKind) -> Self {
        self.args.push(ArgSpec {
            name,
            kind,
            optional: true,
        });
        self
    }

    fn required_count(&self) -> usize {
        self.args.iter().take_while(|a| !a.optional).count()
    }

    /// Check `args` against this schema.
    ///
    /// # Errors
    ///
    /// Returns the first arity or type violation found.
    pub fn check(&self, args: &[Value]) -> Result<(), ValidationError> {
        let min = self.required_count();
        let max = self.args.len();

        if args.len() < min || args.len() > max {
            let expected = if min == max {
                format!("{max}")
            } else {
                format!("{min} to {max}")
            };
            return Err(ValidationError::new(format!(
                "expected {expected} argument(s), got {}",
                args.len()
            )));
        }

        for (index, (spec, value)) in self.args.iter().zip(args).enumerate() {
            spec.kind.check(value).map_err(|why| {
                ValidationError::new(format!("argument {index} ({}) {why}", spec.name))
            })?;
        }

        Ok(())
    }
}

/// Event name to schema mapping.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EventSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry (every event is accepted).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in gateway events.
    #[must_use]
    pub fn with_builtins() -> Self {
        let room = ArgKind::non_empty_string(MAX_ROOM_NAME_LENGTH);

        Self::new()
            .register("ping", EventSchema::empty())
            .register("join", EventSchema::empty().arg("room", room.clone()))
            .register("leave", EventSchema::empty().arg("room", room.clone()))
            .register(
                "emit",
                EventSchema::empty()
                    .arg("room", room)
                    .arg("event", ArgKind::non_empty_string(MAX_EVENT_NAME_LENGTH))
                    .optional("payload", ArgKind::Any),
            )
    }

    /// Register or replace a schema.
    #[must_use]
    pub fn register(mut self, event: impl Into<String>, schema: EventSchema) -> Self {
        self.schemas.insert(event.into(), schema);
        self
    }

    /// Validate an inbound event.
    ///
    /// Unknown events are always accepted.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if a known event has the wrong shape.
    pub fn validate(&self, event: &str, args: &[Value]) -> Result<(), ValidationError> {
        match self.schemas.get(event) {
            Some(schema) => schema.check(args),
            None => Ok(()),
        }
    }
}
