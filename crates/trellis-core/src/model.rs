//! Reader-side values.
//!
//! A `Model` is a structured value whose references are live bindings into
//! the reader's chunk table (`Ref`, `Module`), never copies of the target.

use std::collections::BTreeMap;

use crate::wire::{parse_text, ChunkId, Sentinel, WireError};

#[derive(Debug, Clone, PartialEq)]
pub enum Model {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<Model>),
    Map(BTreeMap<String, Model>),
    /// Stands for the eventual value of another chunk.
    Ref(ChunkId),
    /// External module; loaded by the host only when read.
    Module(ChunkId),
}

impl Model {
    /// Convert a decoded payload, interpreting reference sentinels.
    pub fn from_wire(value: serde_json::Value) -> Result<Self, WireError> {
        use serde_json::Value;

        Ok(match value {
            Value::Null => Model::Null,
            Value::Bool(b) => Model::Bool(b),
            Value::Number(n) => Model::Number(n),
            Value::String(s) => match parse_text(&s)? {
                Sentinel::Text(text) => Model::Text(text.to_string()),
                Sentinel::Ref(id) => Model::Ref(id),
                Sentinel::Module(id) => Model::Module(id),
            },
            Value::Array(items) => Model::List(
                items
                    .into_iter()
                    .map(Model::from_wire)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => Model::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, Model::from_wire(v)?)))
                    .collect::<Result<_, WireError>>()?,
            ),
        })
    }

    pub fn get(&self, key: &str) -> Option<&Model> {
        match self {
            Model::Map(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn at(&self, index: usize) -> Option<&Model> {
        match self {
            Model::List(items) => items.get(index),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Model::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Model::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Model::Ref(_) | Model::Module(_))
    }

    /// Every chunk this value points at, in document order.
    pub fn references(&self) -> Vec<ChunkId> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<ChunkId>) {
        match self {
            Model::Ref(id) | Model::Module(id) => out.push(*id),
            Model::List(items) => items.iter().for_each(|m| m.collect_references(out)),
            Model::Map(fields) => fields.values().for_each(|m| m.collect_references(out)),
            _ => {}
        }
    }
}
