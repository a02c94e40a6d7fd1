use anyhow::Result;
use serde_json::{Map, Value};

/// Expected JSON type for a declared payload field. Null always passes since
/// fields are nullable on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
        }
    }
}

/// Declared shape of one entity kind. Declared fields are type checked on
/// ingest; undeclared fields pass through untouched so newer backends can add
/// fields without breaking older clients.
#[derive(Clone, Debug)]
pub struct KindSchema {
    pub kind: String,
    pub fields: Vec<FieldSpec>,
}

impl KindSchema {
    pub fn new(kind: &str, fields: Vec<FieldSpec>) -> Self {
        Self {
            kind: kind.to_string(),
            fields,
        }
    }

    pub fn validate(&self, payload: &Map<String, Value>) -> Result<()> {
        for field in &self.fields {
            match payload.get(&field.name) {
                Some(value) => {
                    if !field.field_type.matches(value) {
                        anyhow::bail!(
                            "field '{}' has wrong type for kind '{}'",
                            field.name,
                            self.kind
                        );
                    }
                }
                None => {
                    if field.required {
                        anyhow::bail!(
                            "missing required field '{}' for kind '{}'",
                            field.name,
                            self.kind
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn vehicle_schema() -> KindSchema {
    KindSchema::new(
        "vehicle",
        vec![
            FieldSpec::optional("status", FieldType::String),
            FieldSpec::optional("speed", FieldType::Number),
            FieldSpec::optional("heading", FieldType::Number),
            FieldSpec::optional("fuel_level", FieldType::Number),
            FieldSpec::optional("odometer", FieldType::Number),
            FieldSpec::optional("location", FieldType::Object),
            FieldSpec::optional("driver", FieldType::String),
        ],
    )
}

pub fn alert_schema() -> KindSchema {
    KindSchema::new(
        "alert",
        vec![
            FieldSpec::optional("severity", FieldType::String),
            FieldSpec::optional("status", FieldType::String),
            FieldSpec::optional("message", FieldType::String),
            FieldSpec::optional("vehicle_id", FieldType::String),
            FieldSpec::optional("raised_at", FieldType::Number),
        ],
    )
}

pub fn default_schemas() -> Vec<KindSchema> {
    vec![vehicle_schema(), alert_schema()]
}
