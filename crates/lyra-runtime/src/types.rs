//! Foundational types for the Lyra runtime core.
//!
//! This module defines the data structures shared across the crate:
//! - [`Value`] — the scalar value model the dispatch path moves around
//! - [`Method`] — the materialized contents of a method-table slot
//! - [`Visibility`] — method visibility, including the `Undef` tombstone
//! - [`ClassData`] — (class id, shape serial) pair keying specializations
//! - id newtypes ([`MethodId`], [`ScopeId`], [`ModuleId`], [`ObjRef`])
//! - the error enums ([`CodeError`], [`TableError`], [`ExecError`])
//! - serializable summaries consumed by the CLI

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code::CompiledCode;
use crate::symbol::Symbol;

// ── Id newtypes ──────────────────────────────────────────────────────────────

/// Late-bind token identifying an installable method artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u64);

/// Identifier of the lexical scope a method was defined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeId(pub u32);

/// Identifier of a module/class whose method table participates in
/// `alias` resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// Opaque handle to a heap object owned by the external collector.
///
/// `ObjRef::NULL` (raw 0) is the absent reference; it is never presented to
/// the GC mark callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque token handed to the native backend; 0 means "none".
pub type JitToken = u64;

// ── Visibility ───────────────────────────────────────────────────────────────

/// Method visibility as recorded in a table bucket.
///
/// `Undef` marks a name as explicitly removed for dispatch purposes while
/// still occupying a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Visibility {
    Public = 0,
    Private = 1,
    Protected = 2,
    Undef = 3,
}

impl Visibility {
    pub(crate) fn from_u8(raw: u8) -> Visibility {
        match raw {
            0 => Visibility::Public,
            1 => Visibility::Private,
            2 => Visibility::Protected,
            _ => Visibility::Undef,
        }
    }
}

// ── Class identity ───────────────────────────────────────────────────────────

/// A class identity together with its current shape version.
///
/// Specialization-cache slots compare both fields; a bumped serial
/// invalidates every specialization compiled against the old shape. Class id
/// 0 is reserved to mean "empty slot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassData {
    pub id: u32,
    pub serial: u32,
}

impl ClassData {
    pub fn new(id: u32, serial: u32) -> ClassData {
        ClassData { id, serial }
    }

    /// Pack into one word so cache slots can be read and written atomically.
    pub(crate) fn pack(self) -> u64 {
        (u64::from(self.id) << 32) | u64::from(self.serial)
    }

    pub(crate) fn unpack(raw: u64) -> ClassData {
        ClassData {
            id: (raw >> 32) as u32,
            serial: raw as u32,
        }
    }
}

// ── Values ───────────────────────────────────────────────────────────────────

/// The scalar value model threaded through dispatch and GC walks.
///
/// Heap state lives behind [`ObjRef`] handles owned by the external
/// collector, which keeps `Value` a `Copy` word pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Sym(Symbol),
    Ref(ObjRef),
}

impl Value {
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }
}

// ── Methods ──────────────────────────────────────────────────────────────────

/// The materialized method object stored in a table bucket.
#[derive(Debug, Clone)]
pub enum Method {
    /// A late-bind token; the artifact is installed on first dispatch.
    Installable(MethodId),
    /// A block of compiled code.
    Compiled(Arc<CompiledCode>),
    /// Sentinel: the slot exists but holds no executable artifact.
    Missing,
}

impl Method {
    /// True if the slot references something dispatch can execute,
    /// which is what `alias` resolution walks for.
    pub fn is_installable(&self) -> bool {
        !matches!(self, Method::Missing)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors raised by code-object operations.
///
/// Serialized with an internally-tagged `"type"` discriminator so JSON
/// consumers can switch on `error.type`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CodeError {
    /// The bytecode verifier rejected the body. No state was mutated.
    #[error("bytecode verification failed: {reason}")]
    Verification { reason: String },

    /// The given ip does not fall on an instruction boundary.
    #[error("ip {ip} is not an instruction boundary")]
    InvalidIp { ip: u32 },
}

/// Errors raised by method-table operations.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TableError {
    /// `alias` found no installable method anywhere along the hierarchy.
    #[error("undefined method `{name}` to alias")]
    NoMethodToAlias { name: String },
}

/// Errors surfaced from the execution path.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecError {
    /// Lazy internalization failed verification.
    #[error("bytecode verification failed: {reason}")]
    Verification { reason: String },

    /// Breakpoint administration was given a non-boundary ip.
    #[error("ip {ip} is not an instruction boundary")]
    InvalidIp { ip: u32 },

    /// The call-site argument count does not fit the code's argument shape.
    #[error("wrong number of arguments (given {given}, expected {required}..={total})")]
    InvalidArguments {
        required: u32,
        total: u32,
        given: u32,
    },

    /// An exception was raised and surfaced to the caller.
    #[error("exception raised: {message}")]
    Exception { message: String },
}

impl From<CodeError> for ExecError {
    fn from(err: CodeError) -> ExecError {
        match err {
            CodeError::Verification { reason } => ExecError::Verification { reason },
            CodeError::InvalidIp { ip } => ExecError::InvalidIp { ip },
        }
    }
}

// ── CLI-facing summaries ─────────────────────────────────────────────────────

/// Serializable snapshot of a method table's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    /// Current bin count (power of two).
    pub bins: usize,
    /// Live bucket count.
    pub entries: usize,
    /// Bins with at least one bucket.
    pub occupied_bins: usize,
    /// Length of the longest collision chain.
    pub longest_chain: usize,
}

/// Serializable snapshot of a compiled-code object's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSummary {
    pub name: String,
    pub file: String,
    /// Hex SHA-256 of the bytecode body and literal pool.
    pub fingerprint: String,
    pub bytecode_words: usize,
    pub literals: usize,
    pub required_args: u32,
    pub total_args: u32,
    pub splat: Option<u32>,
    pub stack_size: u32,
    /// Second entry of the line map, or −1 without one.
    pub start_line: i64,
    /// Whether the internal machine form has been materialized.
    pub internalized: bool,
    pub breakpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_data_pack_round_trip() {
        let cd = ClassData::new(7, 1);
        assert_eq!(ClassData::unpack(cd.pack()), cd);
        let cd = ClassData::new(u32::MAX, u32::MAX - 3);
        assert_eq!(ClassData::unpack(cd.pack()), cd);
    }

    #[test]
    fn test_visibility_round_trip() {
        for vis in [
            Visibility::Public,
            Visibility::Private,
            Visibility::Protected,
            Visibility::Undef,
        ] {
            assert_eq!(Visibility::from_u8(vis as u8), vis);
        }
    }

    #[test]
    fn test_method_installability() {
        assert!(Method::Installable(MethodId(9)).is_installable());
        assert!(!Method::Missing.is_installable());
    }

    #[test]
    fn test_obj_ref_null() {
        assert!(ObjRef::NULL.is_null());
        assert!(!ObjRef(4).is_null());
    }

    #[test]
    fn test_code_error_serde_tagged() {
        let err = CodeError::Verification {
            reason: "truncated instruction".to_string(),
        };
        let json = serde_json::to_string(&err).expect("serialize CodeError");
        assert!(
            json.contains(r#""type":"Verification""#),
            "JSON should contain type discriminator: {json}"
        );
        let back: CodeError = serde_json::from_str(&json).expect("deserialize CodeError");
        assert_eq!(back, err);
    }

    #[test]
    fn test_exec_error_from_code_error() {
        let err: ExecError = CodeError::InvalidIp { ip: 12 }.into();
        assert_eq!(err, ExecError::InvalidIp { ip: 12 });
    }

    #[test]
    fn test_invalid_arguments_message() {
        let err = ExecError::InvalidArguments {
            required: 1,
            total: 2,
            given: 5,
        };
        assert_eq!(
            err.to_string(),
            "wrong number of arguments (given 5, expected 1..=2)"
        );
    }
}
