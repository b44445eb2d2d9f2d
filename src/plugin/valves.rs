//! Per-plugin configuration ("valves")
//!
//! Each plugin declares a [`ValvesSchema`]: a list of typed fields with
//! defaults. The live [`Valves`] instance always validates against that
//! schema. Overrides are persisted in a `valves.json` sidecar next to the
//! plugin source and merged over the defaults when the plugin loads.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValvesError {
    #[error("Valves must be a JSON object")]
    NotAnObject,

    #[error("Unknown valve '{key}'")]
    UnknownKey { key: String },

    #[error("Valve '{key}' expects {expected}, got {found}")]
    TypeMismatch {
        key: String,
        expected: ValveType,
        found: String,
    },

    #[error("Invalid valves schema: {reason}")]
    Schema { reason: String },

    #[error("Failed to access valves sidecar {}: {reason}", path.display())]
    Sidecar { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ValveType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ValveType::String => value.is_string(),
            ValveType::Integer => value.is_i64() || value.is_u64(),
            ValveType::Number => value.is_number(),
            ValveType::Boolean => value.is_boolean(),
            ValveType::Array => value.is_array(),
            ValveType::Object => value.is_object(),
            ValveType::Any => true,
        }
    }
}

impl fmt::Display for ValveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValveType::String => "string",
            ValveType::Integer => "integer",
            ValveType::Number => "number",
            ValveType::Boolean => "boolean",
            ValveType::Array => "array",
            ValveType::Object => "object",
            ValveType::Any => "any",
        };
        f.write_str(name)
    }
}

fn json_type_name(value: &Value) -> &'static str {
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

/// One declared valve
#[derive(Debug, Clone, PartialEq)]
pub struct ValveField {
    pub name: String,
    pub kind: ValveType,
    pub default: Value,
    pub nullable: bool,
    pub description: Option<String>,
}

impl ValveField {
    pub fn new(name: impl Into<String>, kind: ValveType, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: default.into(),
            nullable: false,
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn check(&self, value: &Value) -> Result<(), ValvesError> {
        if value.is_null() && self.nullable {
            return Ok(());
        }
        if self.kind.accepts(value) {
            Ok(())
        } else {
            Err(ValvesError::TypeMismatch {
                key: self.name.clone(),
                expected: self.kind,
                found: json_type_name(value).to_string(),
            })
        }
    }
}

/// The declared shape of a plugin's valves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValvesSchema {
    pub title: String,
    pub fields: Vec<ValveField>,
}

impl ValvesSchema {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: ValveField) -> Self {
        self.fields.retain(|existing| existing.name != field.name);
        self.fields.push(field);
        self
    }

    pub fn string(self, name: &str, default: &str) -> Self {
        self.field(ValveField::new(name, ValveType::String, default))
    }

    pub fn integer(self, name: &str, default: i64) -> Self {
        self.field(ValveField::new(name, ValveType::Integer, default))
    }

    pub fn boolean(self, name: &str, default: bool) -> Self {
        self.field(ValveField::new(name, ValveType::Boolean, default))
    }

    pub fn string_list(self, name: &str, default: &[&str]) -> Self {
        self.field(ValveField::new(name, ValveType::Array, json!(default)))
    }

    pub fn get(&self, name: &str) -> Option<&ValveField> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn defaults(&self) -> Valves {
        Valves(
            self.fields
                .iter()
                .map(|field| (field.name.clone(), field.default.clone()))
                .collect(),
        )
    }

    /// Build a valves instance from a full or partial record.
    ///
    /// Unknown keys and type mismatches are rejected; missing keys take the
    /// schema default.
    pub fn validate(&self, record: &Value) -> Result<Valves, ValvesError> {
        let record = match record {
            Value::Object(map) => map,
            Value::Null => return Ok(self.defaults()),
            _ => return Err(ValvesError::NotAnObject),
        };

        for key in record.keys() {
            if self.get(key).is_none() {
                return Err(ValvesError::UnknownKey { key: key.clone() });
            }
        }

        let mut values = Map::new();
        for field in &self.fields {
            let value = match record.get(&field.name) {
                Some(value) => {
                    field.check(value)?;
                    value.clone()
                }
                None => field.default.clone(),
            };
            values.insert(field.name.clone(), value);
        }
        Ok(Valves(values))
    }

    /// Keys whose value differs from the schema default
    pub fn overrides(&self, valves: &Valves) -> Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|field| {
                let value = valves.get(&field.name)?;
                (value != &field.default).then(|| (field.name.clone(), value.clone()))
            })
            .collect()
    }

    /// Render as a JSON-schema object for introspection and UI generation
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|field| {
                let mut property = Map::new();
                property.insert("type".into(), json!(field.kind));
                property.insert("default".into(), field.default.clone());
                property.insert("title".into(), json!(field.name));
                if field.nullable {
                    property.insert("nullable".into(), Value::Bool(true));
                }
                if let Some(description) = &field.description {
                    property.insert("description".into(), json!(description));
                }
                (field.name.clone(), Value::Object(property))
            })
            .collect();

        json!({
            "title": self.title,
            "type": "object",
            "properties": properties,
        })
    }

    /// Parse the JSON-schema form produced by [`ValvesSchema::to_json_schema`]
    /// (and by process plugins in their `describe` reply).
    pub fn from_json_schema(schema: &Value) -> Result<Self, ValvesError> {
        let invalid = |reason: String| ValvesError::Schema { reason };

        let title = schema
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Valves")
            .to_string();

        let properties = match schema.get("properties") {
            None | Some(Value::Null) => return Ok(Self::new(title)),
            Some(Value::Object(properties)) => properties,
            Some(_) => return Err(invalid("'properties' must be an object".into())),
        };

        let mut parsed = Self::new(title);
        for (name, property) in properties {
            let kind = match property.get("type") {
                Some(kind) => serde_json::from_value::<ValveType>(kind.clone())
                    .map_err(|e| invalid(format!("field '{name}': {e}")))?,
                None => ValveType::Any,
            };
            let mut field = ValveField::new(
                name.clone(),
                kind,
                property.get("default").cloned().unwrap_or(Value::Null),
            );
            field.nullable = property
                .get("nullable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            field.description = property
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            parsed = parsed.field(field);
        }
        Ok(parsed)
    }
}

/// A validated valves instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Valves(Map<String, Value>);

impl Valves {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// String entries of an array valve; non-string entries are skipped
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Live valves of one plugin module plus its persisted overrides
pub struct ValvesHandle {
    schema: ValvesSchema,
    live: ArcSwap<Valves>,
    sidecar: PathBuf,
}

impl ValvesHandle {
    /// Merge the sidecar's overrides onto the schema defaults.
    ///
    /// A missing or blank sidecar counts as "no overrides".
    pub fn load(schema: ValvesSchema, sidecar: PathBuf) -> Result<Self, ValvesError> {
        let overrides = read_sidecar(&sidecar)?;
        let valves = schema.validate(&overrides)?;
        Ok(Self {
            schema,
            live: ArcSwap::from_pointee(valves),
            sidecar,
        })
    }

    pub fn current(&self) -> Arc<Valves> {
        self.live.load_full()
    }

    pub fn schema(&self) -> &ValvesSchema {
        &self.schema
    }

    pub fn sidecar(&self) -> &Path {
        &self.sidecar
    }

    /// Validate, persist, then swap. Nothing is written and nothing changes
    /// if validation fails.
    pub fn update(&self, record: &Value) -> Result<Arc<Valves>, ValvesError> {
        let valves = self.schema.validate(record)?;
        write_sidecar(&self.sidecar, &self.schema.overrides(&valves))?;

        let valves = Arc::new(valves);
        self.live.store(valves.clone());
        tracing::info!(sidecar = %self.sidecar.display(), "Valves updated");
        Ok(valves)
    }
}

fn sidecar_error(path: &Path, reason: impl fmt::Display) -> ValvesError {
    ValvesError::Sidecar {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_sidecar(path: &Path) -> Result<Value, ValvesError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Null),
        Err(e) => return Err(sidecar_error(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&content).map_err(|e| sidecar_error(path, e))
}

/// Write through a temp file in the same folder so readers never see a
/// partially written sidecar.
fn write_sidecar(path: &Path, overrides: &Map<String, Value>) -> Result<(), ValvesError> {
    let content = serde_json::to_string_pretty(overrides).map_err(|e| sidecar_error(path, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| sidecar_error(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| sidecar_error(path, e))
}
