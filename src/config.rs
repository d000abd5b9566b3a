//! Configuration loading from environment variables (§6 "Config
//! surface"): a declared map from logical field name to
//! `{ type: "string" | "boolean" }`, each field sourced from an
//! environment variable named after its snake-case-to-upper-case form.

use std::collections::HashMap;
use std::env;

use crate::error::EngineError;

/// The declared shape of a single config field.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    String,
    Boolean,
}

/// Declares one logical config field: its name, type, and whether a
/// missing environment variable is a configuration error.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        FieldSpec {
            name,
            field_type,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, field_type: FieldType) -> Self {
        FieldSpec {
            name,
            field_type,
            required: false,
        }
    }

    /// `dependsOn` → `DEPENDS_ON`-style env var name: the field's own
    /// snake-case form, upper-cased.
    fn env_var_name(&self) -> String {
        self.name.to_uppercase()
    }
}

#[derive(Debug, Clone)]
pub enum ConfigValue {
    String(String),
    Boolean(bool),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            ConfigValue::Boolean(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(b) => Some(*b),
            ConfigValue::String(_) => None,
        }
    }
}

/// The validated config object handed to the engine (§6).
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    values: HashMap<String, ConfigValue>,
}

impl EngineConfig {
    /// Loads every field in `specs` from its environment variable.
    /// Missing required fields and boolean type mismatches are fatal
    /// configuration errors, reported before any step executes.
    pub fn load(specs: &[FieldSpec]) -> Result<Self, EngineError> {
        Self::load_from(specs, |name| env::var(name).ok())
    }

    /// Testable variant of `load` that reads from a provided lookup
    /// instead of the real process environment.
    pub fn load_from(
        specs: &[FieldSpec],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EngineError> {
        let mut values = HashMap::new();

        for spec in specs {
            let env_name = spec.env_var_name();
            match lookup(&env_name) {
                Some(raw) => {
                    let value = match spec.field_type {
                        FieldType::String => ConfigValue::String(raw),
                        FieldType::Boolean => match raw.to_lowercase().as_str() {
                            "true" => ConfigValue::Boolean(true),
                            "false" => ConfigValue::Boolean(false),
                            other => {
                                return Err(EngineError::Configuration(format!(
                                    "field '{}' ({env_name}) must be 'true' or 'false', got '{other}'",
                                    spec.name
                                )))
                            }
                        },
                    };
                    values.insert(spec.name.to_string(), value);
                }
                None if spec.required => {
                    return Err(EngineError::Configuration(format!(
                        "missing required config field '{}' ({env_name})",
                        spec.name
                    )))
                }
                None => {}
            }
        }

        Ok(EngineConfig { values })
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(ConfigValue::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(ConfigValue::as_bool)
    }
}
