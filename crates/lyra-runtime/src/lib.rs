// lyra-runtime: method dispatch and code-object core of the Lyra runtime.

pub mod code;
pub mod dispatch;
pub mod gc;
pub mod interop;
pub mod machine;
pub mod method_table;
pub mod symbol;
pub mod types;

pub use code::{CodeInfo, CompiledCode, NO_LINE_INFO, NO_START_LINE};
pub use dispatch::{
    default_dispatch, interpreter_dispatch, primitive_failed, specialized_dispatch, Args,
    Executor, SpecializationCache, MAX_SPECIALIZATIONS,
};
pub use gc::{mark_code, mark_table, Marker};
pub use interop::{
    BytecodeVerifier, CallStack, ClassResolver, ExecEnv, InterpreterEntry, ModuleHierarchy,
    PrimitiveResolver, ThreadState,
};
pub use machine::{Assembler, InterpreterVariant, MachineCode, Opcode, StructuralVerifier};
pub use method_table::{MethodTable, MethodTableEntry, MIN_BINS};
pub use symbol::Symbol;
pub use types::{
    ClassData, CodeError, CodeSummary, ExecError, JitToken, Method, MethodId, ModuleId, ObjRef,
    ScopeId, TableError, TableStats, Value, Visibility,
};

/// Abort on a structural invariant violation.
///
/// These are programming errors, not runtime conditions; the one diagnostic
/// line is all a crash report gets.
pub(crate) fn bug(message: &str) -> ! {
    log::error!("[BUG] {message}");
    std::process::abort();
}
