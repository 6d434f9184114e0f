use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PlatformError, Result};

// ---------------------------------------------------------------------------
// Action schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub schema_id: String,
    pub version: u32,
    pub topic: String,
    #[serde(default)]
    pub title: String,
    pub fields: Vec<FieldSpec>,
    /// Overrides the platform-wide confirmation phrase for this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub expected: String,
    pub found: String,
}

/// Result of checking a draft against an action's declared fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftCheck {
    pub missing: Vec<String>,
    pub invalid: Vec<FieldIssue>,
    pub hints: Vec<String>,
}

impl DraftCheck {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

impl ActionSpec {
    /// Check `payload` slots against the declared fields, in declaration order.
    pub fn check(&self, payload: &Value) -> DraftCheck {
        let mut report = DraftCheck::default();
        let Some(obj) = payload.as_object() else {
            report.invalid.push(FieldIssue {
                field: "$".into(),
                expected: "object".into(),
                found: kind_of(payload).into(),
            });
            report.hints.push("payload must be an object of named fields".into());
            return report;
        };
        for field in &self.fields {
            match obj.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        report.missing.push(field.name.clone());
                        report.hints.push(
                            field
                                .hint
                                .clone()
                                .unwrap_or_else(|| format!("provide required field `{}`", field.name)),
                        );
                    }
                }
                Some(v) if !field.kind.matches(v) => {
                    report.invalid.push(FieldIssue {
                        field: field.name.clone(),
                        expected: field.kind.as_str().into(),
                        found: kind_of(v).into(),
                    });
                    report.hints.push(format!(
                        "field `{}` must be {}",
                        field.name,
                        field.kind.as_str()
                    ));
                }
                Some(_) => {}
            }
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Versioned action lookup queried by the intent protocol.
pub trait SchemaRegistry: Send + Sync {
    fn resolve(&self, schema_id: &str, version: u32) -> Option<&ActionSpec>;
    fn list(&self) -> Vec<&ActionSpec>;

    /// Highest registered version of `schema_id`.
    fn latest(&self, schema_id: &str) -> Option<&ActionSpec> {
        self.list()
            .into_iter()
            .filter(|a| a.schema_id == schema_id)
            .max_by_key(|a| a.version)
    }
}

/// In-memory registry populated once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    actions: BTreeMap<(String, u32), ActionSpec>,
}

impl StaticRegistry {
    pub fn new(actions: Vec<ActionSpec>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for action in actions {
            if action.fields.is_empty() {
                return Err(PlatformError::InvalidConfig(format!(
                    "action {}:{} declares no fields",
                    action.schema_id, action.version
                )));
            }
            let key = (action.schema_id.clone(), action.version);
            if map.insert(key, action).is_some() {
                return Err(PlatformError::InvalidConfig(
                    "duplicate action schema id/version".into(),
                ));
            }
        }
        Ok(Self { actions: map })
    }
}

impl SchemaRegistry for StaticRegistry {
    fn resolve(&self, schema_id: &str, version: u32) -> Option<&ActionSpec> {
        self.actions.get(&(schema_id.to_string(), version))
    }

    fn list(&self) -> Vec<&ActionSpec> {
        self.actions.values().collect()
    }
}

fn field(name: &str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name: name.into(),
        kind,
        required: true,
        hint: None,
    }
}

/// Built-in actions shipped with a fresh configuration.
pub fn default_actions() -> Vec<ActionSpec> {
    vec![
        ActionSpec {
            schema_id: "science.run".into(),
            version: 1,
            topic: "science:commit".into(),
            title: "Run a seeded scientific workload".into(),
            fields: vec![
                field("seed", FieldKind::Integer),
                field("image", FieldKind::String),
                field("inputs", FieldKind::Array),
                field("params", FieldKind::Object),
            ],
            confirm_phrase: None,
            examples: vec![serde_json::json!({
                "seed": 42, "image": "sim:latest", "inputs": [], "params": {}
            })],
        },
        ActionSpec {
            schema_id: "vcx.batch_transcode".into(),
            version: 1,
            topic: "vcx:commit".into(),
            title: "Batch video transcode".into(),
            fields: vec![
                field("codec", FieldKind::String),
                field("width", FieldKind::Integer),
                field("height", FieldKind::Integer),
                field("bitrate", FieldKind::Integer),
            ],
            confirm_phrase: None,
            examples: vec![serde_json::json!({
                "codec": "av1", "width": 640, "height": 360, "bitrate": 600
            })],
        },
        ActionSpec {
            schema_id: "hdl.sim".into(),
            version: 1,
            topic: "hdl:commit".into(),
            title: "Hardware simulation run".into(),
            fields: vec![
                field("top", FieldKind::String),
                field("cycles", FieldKind::Integer),
                field("asserts", FieldKind::Array),
            ],
            confirm_phrase: None,
            examples: vec![],
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
