//! Declared field sets per entity type.
//!
//! Every payload entering the engine (local writes and pulled server records)
//! is checked against the schema registered for its `type`. MERGE iterates
//! the declared fields rather than whatever keys happen to be present.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{EntityRecord, Operation, Payload, QueuedMutation};

/// JSON kind a field must hold. `null` is accepted for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Bool,
    Any,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::String, Value::String(_)) | (Self::Bool, Value::Bool(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(number)) => number.is_i64() || number.is_u64(),
            _ => false,
        }
    }
}

/// Schema for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    pub fields: BTreeMap<String, FieldKind>,
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Declare a field
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Declared field names, in stable order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Check that every key is declared and holds the declared kind
    pub fn validate_payload(&self, payload: &Payload) -> std::result::Result<(), String> {
        for (key, value) in payload {
            let Some(kind) = self.fields.get(key) else {
                return Err(format!(
                    "field '{key}' is not declared for type '{}'",
                    self.entity_type
                ));
            };
            if !kind.accepts(value) {
                return Err(format!(
                    "field '{key}' of type '{}' must be {kind:?}, got {value}",
                    self.entity_type
                ));
            }
        }
        Ok(())
    }
}

/// Registry of schemas keyed by entity type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schemas for the entity types the companion app syncs
    pub fn stakesync_default() -> Self {
        Self::new()
            .with(
                EntitySchema::new("bet")
                    .field("amount", FieldKind::Number)
                    .field("odds", FieldKind::Number)
                    .field("market", FieldKind::String)
                    .field("selection", FieldKind::String)
                    .field("status", FieldKind::String)
                    .field("placed_at", FieldKind::Integer)
                    .field("notes", FieldKind::String),
            )
            .with(
                EntitySchema::new("preference")
                    .field("value", FieldKind::Any)
                    .field("enabled", FieldKind::Bool),
            )
            .with(
                EntitySchema::new("bankroll")
                    .field("balance", FieldKind::Number)
                    .field("currency", FieldKind::String)
                    .field("unit_size", FieldKind::Number),
            )
    }

    #[must_use]
    pub fn with(mut self, schema: EntitySchema) -> Self {
        self.register(schema);
        self
    }

    pub fn register(&mut self, schema: EntitySchema) {
        self.schemas.insert(schema.entity_type.clone(), schema);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity_type)
    }

    /// Registered entity types, in stable order
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Validate a local write before it is queued
    pub fn validate_mutation(&self, mutation: &QueuedMutation) -> Result<&EntitySchema> {
        if mutation.entity_id.trim().is_empty() {
            return Err(Error::Validation("entity id must not be empty".to_string()));
        }
        let schema = self.get(&mutation.entity_type).ok_or_else(|| {
            Error::Validation(format!("unknown entity type '{}'", mutation.entity_type))
        })?;
        if mutation.operation != Operation::Delete {
            schema
                .validate_payload(&mutation.payload)
                .map_err(Error::Validation)?;
        }
        Ok(schema)
    }

    /// Validate a record received from the server
    pub fn validate_record(&self, record: &EntityRecord) -> Result<&EntitySchema> {
        let schema = self.get(&record.entity_type).ok_or_else(|| {
            Error::FatalSync(format!(
                "server sent record of unknown type '{}'",
                record.entity_type
            ))
        })?;
        schema.validate_payload(&record.data).map_err(|reason| {
            Error::FatalSync(format!("schema mismatch for {}: {reason}", record.entity_ref()))
        })?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_mutation_rejects_unknown_type() {
        let registry = SchemaRegistry::stakesync_default();
        let mutation = QueuedMutation::new("parlay", "1", Operation::Create, Payload::new(), 0);
        assert!(matches!(
            registry.validate_mutation(&mutation),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_mutation_rejects_undeclared_field() {
        let registry = SchemaRegistry::stakesync_default();
        let mutation = QueuedMutation::new(
            "bet",
            "1",
            Operation::Update,
            payload(json!({"amount": 10, "bookie": "x"})),
            1,
        );
        let error = registry.validate_mutation(&mutation).unwrap_err();
        assert!(error.to_string().contains("bookie"));
    }

    #[test]
    fn test_validate_mutation_rejects_wrong_kind() {
        let registry = SchemaRegistry::stakesync_default();
        let mutation = QueuedMutation::new(
            "bet",
            "1",
            Operation::Update,
            payload(json!({"placed_at": 1.5})),
            1,
        );
        assert!(registry.validate_mutation(&mutation).is_err());
    }

    #[test]
    fn test_validate_mutation_accepts_nulls_and_deletes() {
        let registry = SchemaRegistry::stakesync_default();
        let update = QueuedMutation::new(
            "bet",
            "1",
            Operation::Update,
            payload(json!({"notes": null, "amount": 25})),
            1,
        );
        assert!(registry.validate_mutation(&update).is_ok());

        let delete = QueuedMutation::new("bet", "1", Operation::Delete, Payload::new(), 1);
        assert!(registry.validate_mutation(&delete).is_ok());
    }

    #[test]
    fn test_validate_mutation_rejects_blank_id() {
        let registry = SchemaRegistry::stakesync_default();
        let mutation = QueuedMutation::new("bet", "  ", Operation::Create, Payload::new(), 0);
        assert!(registry.validate_mutation(&mutation).is_err());
    }

    #[test]
    fn test_validate_record_reports_fatal_mismatch() {
        let registry = SchemaRegistry::stakesync_default();
        let record = EntityRecord::synced("bet", "1", 2, 10, payload(json!({"odds": "high"})));
        assert!(matches!(
            registry.validate_record(&record),
            Err(Error::FatalSync(_))
        ));
    }

    #[test]
    fn test_field_names_are_sorted() {
        let schema = EntitySchema::new("t")
            .field("b", FieldKind::Any)
            .field("a", FieldKind::Any);
        assert_eq!(schema.field_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
