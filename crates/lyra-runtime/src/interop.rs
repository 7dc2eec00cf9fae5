//! Collaborator interfaces consumed by the runtime core.
//!
//! The core sits below the interpreter, the native backend, the collector,
//! and the class/module system; each of those is reached through a narrow
//! trait defined here. [`ExecEnv`] bundles borrowed handles to all of them
//! and is threaded through every dispatch and execution entry point.
//!
//! Simple default implementations ([`NoPrimitives`], [`NullStack`],
//! [`NullInterpreter`], [`ClassMap`]) are provided for tools and tests; a
//! real language embedding supplies its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::code::CompiledCode;
use crate::dispatch::{Args, Executor};
use crate::machine::MachineCode;
use crate::method_table::MethodTable;
use crate::types::{ClassData, CodeError, ExecError, ModuleId, ObjRef, Value};

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Pure validation of a bytecode body, invoked before first interpretation.
pub trait BytecodeVerifier: Sync {
    fn verify(&self, code: &CompiledCode) -> Result<(), CodeError>;
}

/// Binds a code object's `primitive` name to a fast-path executor.
pub trait PrimitiveResolver: Sync {
    /// Return the primitive executor for `code`, or `None` if the name does
    /// not resolve (or the code declares no primitive).
    fn resolve(&self, code: &CompiledCode) -> Option<Executor>;
}

/// The interpreter proper. The runtime core only selects which variant runs.
pub trait InterpreterEntry: Sync {
    fn run(
        &self,
        env: &ExecEnv<'_>,
        code: &Arc<CompiledCode>,
        machine: &MachineCode,
        args: &Args<'_>,
    ) -> Result<Value, ExecError>;

    /// The debugging variant, entered while any breakpoint is armed.
    /// Defaults to the normal variant.
    fn run_debug(
        &self,
        env: &ExecEnv<'_>,
        code: &Arc<CompiledCode>,
        machine: &MachineCode,
        args: &Args<'_>,
    ) -> Result<Value, ExecError> {
        self.run(env, code, machine, args)
    }
}

/// Access to the executing call stack, for `of_sender` / `current`.
pub trait CallStack: Sync {
    /// The code object executing at `depth` frames up (0 = current), or
    /// `None` when no such frame exists.
    fn frame(&self, depth: u32) -> Option<Arc<CompiledCode>>;
}

/// Maps a receiver to its class identity and shape serial.
pub trait ClassResolver: Sync {
    fn class_data(&self, receiver: Value) -> ClassData;
}

/// Walks the module/class graph for `alias` resolution.
pub trait ModuleHierarchy {
    fn method_table(&self, module: ModuleId) -> Option<&MethodTable>;
    fn superclass(&self, module: ModuleId) -> Option<ModuleId>;
}

// ── Thread exception state ───────────────────────────────────────────────────

/// Per-thread raise state cleared on script entry.
#[derive(Debug, Default)]
pub struct ThreadState {
    pending: Mutex<Option<String>>,
}

impl ThreadState {
    pub fn new() -> ThreadState {
        ThreadState::default()
    }

    pub fn clear_raise(&self) {
        *self.pending.lock().expect("thread state mutex poisoned") = None;
    }

    pub fn set_raise(&self, message: String) {
        *self.pending.lock().expect("thread state mutex poisoned") = Some(message);
    }

    pub fn pending_raise(&self) -> Option<String> {
        self.pending
            .lock()
            .expect("thread state mutex poisoned")
            .clone()
    }
}

// ── ExecEnv ──────────────────────────────────────────────────────────────────

/// Borrowed handles to every collaborator, plus the root object.
///
/// Cheap to construct per call chain; everything behind it is shared.
#[derive(Clone, Copy)]
pub struct ExecEnv<'a> {
    pub verifier: &'a dyn BytecodeVerifier,
    pub primitives: &'a dyn PrimitiveResolver,
    pub interpreter: &'a dyn InterpreterEntry,
    pub stack: &'a dyn CallStack,
    pub classes: &'a dyn ClassResolver,
    pub thread: &'a ThreadState,
    /// The top-level receiver scripts run against.
    pub root: Value,
}

// ── Default implementations ──────────────────────────────────────────────────

/// Resolves no primitives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrimitives;

impl PrimitiveResolver for NoPrimitives {
    fn resolve(&self, _code: &CompiledCode) -> Option<Executor> {
        None
    }
}

/// A call stack with no frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStack;

impl CallStack for NullStack {
    fn frame(&self, _depth: u32) -> Option<Arc<CompiledCode>> {
        None
    }
}

/// An interpreter that evaluates nothing and returns nil.
///
/// Lets tools exercise internalization, breakpoints, and dispatch routing
/// without a language embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInterpreter;

impl InterpreterEntry for NullInterpreter {
    fn run(
        &self,
        _env: &ExecEnv<'_>,
        _code: &Arc<CompiledCode>,
        _machine: &MachineCode,
        _args: &Args<'_>,
    ) -> Result<Value, ExecError> {
        Ok(Value::Nil)
    }
}

/// A class resolver backed by a handle → class map.
///
/// Non-reference receivers and unmapped handles share a default class.
#[derive(Debug)]
pub struct ClassMap {
    default: ClassData,
    by_ref: Mutex<HashMap<ObjRef, ClassData>>,
}

impl ClassMap {
    pub fn new(default: ClassData) -> ClassMap {
        ClassMap {
            default,
            by_ref: Mutex::new(HashMap::new()),
        }
    }

    pub fn assign(&self, reference: ObjRef, class: ClassData) {
        self.by_ref
            .lock()
            .expect("class map mutex poisoned")
            .insert(reference, class);
    }
}

impl ClassResolver for ClassMap {
    fn class_data(&self, receiver: Value) -> ClassData {
        match receiver {
            Value::Ref(r) => self
                .by_ref
                .lock()
                .expect("class map mutex poisoned")
                .get(&r)
                .copied()
                .unwrap_or(self.default),
            _ => self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_state_raise_round_trip() {
        let state = ThreadState::new();
        assert_eq!(state.pending_raise(), None);
        state.set_raise("boom".to_string());
        assert_eq!(state.pending_raise(), Some("boom".to_string()));
        state.clear_raise();
        assert_eq!(state.pending_raise(), None);
    }

    #[test]
    fn test_class_map_assign_and_default() {
        let map = ClassMap::new(ClassData::new(1, 0));
        map.assign(ObjRef(42), ClassData::new(7, 3));
        assert_eq!(
            map.class_data(Value::Ref(ObjRef(42))),
            ClassData::new(7, 3)
        );
        assert_eq!(map.class_data(Value::Ref(ObjRef(43))), ClassData::new(1, 0));
        assert_eq!(map.class_data(Value::Int(5)), ClassData::new(1, 0));
    }

    #[test]
    fn test_null_stack_has_no_frames() {
        assert!(NullStack.frame(0).is_none());
        assert!(NullStack.frame(3).is_none());
    }
}
