// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model and collaborator traits for the gateway's binary RPC protocol.
//!
//! The wire codec itself (re-assembling a byte stream into discrete frames
//! and encoding values) is an external collaborator. This crate defines the
//! value model those collaborators traffic in, the traits the server drives
//! them through, and the method-dispatch interface implemented by
//! device-family logic.

pub mod dispatch;
pub mod frame;

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// A decoded RPC value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    Void,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<RpcValue>),
    Struct(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match self {
            RpcValue::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Human-readable name of the value's type, for fault messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcValue::Void => "Void",
            RpcValue::Bool(_) => "Boolean",
            RpcValue::Integer(_) => "Integer",
            RpcValue::Float(_) => "Float",
            RpcValue::String(_) => "String",
            RpcValue::Binary(_) => "Binary",
            RpcValue::Array(_) => "Array",
            RpcValue::Struct(_) => "Struct",
        }
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::String(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::String(value)
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        RpcValue::Integer(value)
    }
}

/// A structured fault carried in an RPC response.
///
/// The numeric codes follow the gateway's established dialect: `-1` for
/// request-shape problems, `-2` for invalid provisioning data and `-32500`
/// for internal errors whose details only appear in the log.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("RPC fault {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Outcome of an RPC call: a value or a structured fault.
pub type RpcResult = Result<RpcValue, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_accessor_rejects_other_types() {
        assert_eq!(RpcValue::from("pem").as_str(), Some("pem"));
        assert_eq!(RpcValue::Integer(7).as_str(), None);
        assert_eq!(RpcValue::Void.as_str(), None);
    }

    #[test]
    fn struct_accessor() {
        let mut fields = BTreeMap::new();
        fields.insert("caCert".to_string(), RpcValue::from("data"));
        let value = RpcValue::Struct(fields);
        assert_eq!(
            value.as_struct().and_then(|s| s.get("caCert")?.as_str()),
            Some("data"),
        );
        assert!(RpcValue::Array(Vec::new()).as_struct().is_none());
    }

    #[test]
    fn fault_display_includes_code_and_message() {
        let fault = RpcError::new(-2, "Data is invalid.");
        assert_eq!(fault.to_string(), "RPC fault -2: Data is invalid.");
    }

    #[test]
    fn values_round_trip_through_serde() {
        let mut fields = BTreeMap::new();
        fields.insert("flag".to_string(), RpcValue::Bool(true));
        let original = RpcValue::Array(vec![
            RpcValue::Void,
            RpcValue::Integer(-3),
            RpcValue::Binary(vec![0, 255]),
            RpcValue::Struct(fields),
        ]);

        let encoded = serde_json::to_vec(&original).unwrap();
        let decoded: RpcValue = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, original);
    }
}
