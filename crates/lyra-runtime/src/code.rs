//! The compiled-code object.
//!
//! A [`CompiledCode`] bundles a bytecode body with its creation metadata and
//! the runtime state that accretes around it: the lazily materialized
//! internal form ([`MachineCode`]), the current dispatch executor, the
//! breakpoint table, the specialization cache, and jit bookkeeping.
//!
//! # Internalization
//!
//! The portable body becomes interpretable exactly once, in
//! [`CompiledCode::internalize`]:
//!
//! 1. acquire-load the machine slot; done if present
//! 2. take the hard lock, re-check
//! 3. run the verifier; build the machine form; resolve a primitive or
//!    install the argument-shape handler
//! 4. publish the machine form (release)
//! 5. install the machine form's fallback as the current executor
//!
//! A losing racer observes the committed value at step 1 or step 2, so the
//! verifier runs at most once on the success path. A verification failure
//! publishes nothing; the slot stays absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use sha2::{Digest, Sha256};

use crate::dispatch::{self, Args, Executor, InstallSite, SpecializationCache};
use crate::interop::ExecEnv;
use crate::machine::MachineCode;
use crate::symbol::Symbol;
use crate::types::{ClassData, CodeSummary, ExecError, JitToken, ObjRef, ScopeId, Value};

/// `line(ip)` result when the code carries no line map.
pub const NO_LINE_INFO: i64 = -3;

/// `start_line()` result when the line map is missing or empty.
pub const NO_START_LINE: i64 = -1;

// ── Creation metadata ────────────────────────────────────────────────────────

/// Everything established when a code object is created.
#[derive(Debug, Clone)]
pub struct CodeInfo {
    pub name: Symbol,
    pub file: Symbol,
    pub scope: ScopeId,
    /// Instruction words. Immutable once the object exists.
    pub bytecode: Vec<u32>,
    /// Alternating `[ip0, line0, ip1, line1, …]` entries.
    pub lines: Option<Vec<u32>>,
    /// Literal-pool handles owned by the collector.
    pub literals: Vec<ObjRef>,
    pub local_names: Vec<Symbol>,
    pub local_count: u32,
    pub required_args: u32,
    pub total_args: u32,
    /// Index of the splat local, when the shape has one.
    pub splat: Option<u32>,
    pub stack_size: u32,
    /// Name of the primitive this code may bind to.
    pub primitive: Option<Symbol>,
}

impl Default for CodeInfo {
    fn default() -> Self {
        CodeInfo {
            name: Symbol::intern("(anonymous)"),
            file: Symbol::intern("(dynamic)"),
            scope: ScopeId(0),
            bytecode: Vec::new(),
            lines: None,
            literals: Vec::new(),
            local_names: Vec::new(),
            local_count: 0,
            required_args: 0,
            total_args: 0,
            splat: None,
            stack_size: 1,
            primitive: None,
        }
    }
}

// ── CompiledCode ─────────────────────────────────────────────────────────────

/// A bytecode body plus its runtime state. See the module docs.
pub struct CompiledCode {
    name: Symbol,
    file: Symbol,
    scope: ScopeId,
    bytecode: Arc<[u32]>,
    lines: Option<Arc<[u32]>>,
    /// Literal handles; rewritten only by the GC mark walk.
    literals: Box<[AtomicU32]>,
    local_names: Vec<Symbol>,
    local_count: u32,
    required_args: u32,
    total_args: u32,
    splat: Option<u32>,
    stack_size: u32,
    primitive: Option<Symbol>,

    /// Absent → present exactly once; reset only by duplication.
    machine: OnceLock<Arc<MachineCode>>,
    /// Serializes internalization and specialization registration.
    hard_lock: Mutex<()>,
    executor: dispatch::AtomicExecutor,
    breakpoints: Mutex<HashMap<u32, Value>>,
    specializations: SpecializationCache,
    jit_data: AtomicU64,
}

impl CompiledCode {
    /// Create a code object. The executor starts as the default dispatcher.
    pub fn new(info: CodeInfo) -> CompiledCode {
        CompiledCode {
            name: info.name,
            file: info.file,
            scope: info.scope,
            bytecode: info.bytecode.into(),
            lines: info.lines.map(Into::into),
            literals: info.literals.iter().map(|r| AtomicU32::new(r.0)).collect(),
            local_names: info.local_names,
            local_count: info.local_count,
            required_args: info.required_args,
            total_args: info.total_args,
            splat: info.splat,
            stack_size: info.stack_size,
            primitive: info.primitive,
            machine: OnceLock::new(),
            hard_lock: Mutex::new(()),
            executor: dispatch::AtomicExecutor::new(dispatch::default_dispatch),
            breakpoints: Mutex::new(HashMap::new()),
            specializations: SpecializationCache::new(),
            jit_data: AtomicU64::new(0),
        }
    }

    /// Copy this code object, resetting the machine slot, executor,
    /// breakpoints, and specialization cache. The copy re-internalizes on
    /// first use.
    pub fn duplicate(&self) -> CompiledCode {
        CompiledCode {
            name: self.name,
            file: self.file,
            scope: self.scope,
            bytecode: self.bytecode.clone(),
            lines: self.lines.clone(),
            literals: self
                .literals
                .iter()
                .map(|w| AtomicU32::new(w.load(Ordering::Acquire)))
                .collect(),
            local_names: self.local_names.clone(),
            local_count: self.local_count,
            required_args: self.required_args,
            total_args: self.total_args,
            splat: self.splat,
            stack_size: self.stack_size,
            primitive: self.primitive,
            machine: OnceLock::new(),
            hard_lock: Mutex::new(()),
            executor: dispatch::AtomicExecutor::new(dispatch::default_dispatch),
            breakpoints: Mutex::new(HashMap::new()),
            specializations: SpecializationCache::new(),
            jit_data: AtomicU64::new(0),
        }
    }

    // ── Metadata accessors ───────────────────────────────────────────────

    pub fn name(&self) -> Symbol {
        self.name
    }

    pub fn file(&self) -> Symbol {
        self.file
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn bytecode(&self) -> &[u32] {
        &self.bytecode
    }

    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    pub fn literal(&self, index: usize) -> Option<ObjRef> {
        self.literals
            .get(index)
            .map(|w| ObjRef(w.load(Ordering::Acquire)))
    }

    pub(crate) fn literal_slots(&self) -> &[AtomicU32] {
        &self.literals
    }

    pub fn local_names(&self) -> &[Symbol] {
        &self.local_names
    }

    pub fn local_count(&self) -> u32 {
        self.local_count
    }

    pub fn required_args(&self) -> u32 {
        self.required_args
    }

    pub fn total_args(&self) -> u32 {
        self.total_args
    }

    pub fn splat(&self) -> Option<u32> {
        self.splat
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn primitive(&self) -> Option<Symbol> {
        self.primitive
    }

    /// The materialized internal form, if internalization has happened.
    pub fn machine(&self) -> Option<&Arc<MachineCode>> {
        self.machine.get()
    }

    /// The current dispatch entry function.
    pub fn executor(&self) -> Executor {
        self.executor
            .load()
            .expect("executor cell is never empty")
    }

    pub fn jit_data(&self) -> JitToken {
        self.jit_data.load(Ordering::Acquire)
    }

    pub fn set_jit_data(&self, token: JitToken) {
        self.jit_data.store(token, Ordering::Release);
    }

    // ── Internalization ──────────────────────────────────────────────────

    /// Materialize the internal machine form, verifying the body first.
    /// Idempotent; see the module docs for the publication protocol.
    pub fn internalize(&self, env: &ExecEnv<'_>) -> Result<Arc<MachineCode>, ExecError> {
        if let Some(machine) = self.machine.get() {
            return Ok(machine.clone());
        }

        let _guard = self.hard_lock.lock().expect("code hard lock poisoned");
        if let Some(machine) = self.machine.get() {
            return Ok(machine.clone());
        }

        env.verifier.verify(self)?;
        let machine = Arc::new(MachineCode::new(self));
        match env.primitives.resolve(self) {
            Some(primitive) => machine.set_fallback(primitive),
            None => machine.set_fallback(dispatch::argument_handler_for(
                self.required_args,
                self.total_args,
                self.splat,
            )),
        }
        let fallback = machine.fallback();

        self.machine
            .set(machine.clone())
            .unwrap_or_else(|_| crate::bug("machine slot set twice under the hard lock"));
        self.executor.store(fallback);
        Ok(machine)
    }

    // ── Line map ─────────────────────────────────────────────────────────

    /// The source line covering `ip`, or [`NO_LINE_INFO`] without a map.
    ///
    /// Scans the alternating `(ip, line)` pairs; an ip past the last window
    /// reports the last recorded line.
    pub fn line(&self, ip: u32) -> i64 {
        let Some(lines) = self.lines.as_deref() else {
            return NO_LINE_INFO;
        };
        let paired = lines.len() / 2 * 2;
        if paired < 2 {
            return NO_LINE_INFO;
        }
        let mut i = 0usize;
        while i + 3 < paired {
            if lines[i] <= ip && ip < lines[i + 2] {
                return i64::from(lines[i + 1]);
            }
            i += 2;
        }
        i64::from(lines[paired - 1])
    }

    /// The line of the first recorded pair, or [`NO_START_LINE`].
    pub fn start_line(&self) -> i64 {
        match self.lines.as_deref() {
            Some(lines) if lines.len() >= 2 => i64::from(lines[1]),
            _ => NO_START_LINE,
        }
    }

    // ── Specializations ──────────────────────────────────────────────────

    /// Register a type-specialized executor for `class`.
    ///
    /// Requires the machine form; a premature registration is logged and
    /// ignored. When no primitive is bound, the top-level executor advances
    /// to the specialized dispatcher.
    pub fn add_specialized(&self, class: ClassData, executor: Executor, jit_data: JitToken) {
        let _guard = self.hard_lock.lock().expect("code hard lock poisoned");
        let Some(machine) = self.machine.get() else {
            log::warn!(
                "ignoring specialization for {} ({:?}): machine form absent",
                self.name,
                class
            );
            return;
        };
        if let InstallSite::Evicted(slot) = self.specializations.install(class, executor, jit_data)
        {
            log::warn!(
                "specialization cache full on {}; evicting slot {slot}",
                self.name
            );
        }
        machine.mark_jit_eligible();
        if self.primitive.is_none() {
            self.executor.store(dispatch::specialized_dispatch);
        }
    }

    /// Install the executor used by receivers with no specialized variant.
    ///
    /// With an empty cache and no primitive, the top-level executor is set
    /// to `executor` directly, skipping the cache scan entirely.
    pub fn set_unspecialized(&self, executor: Executor, jit_data: JitToken) {
        let _guard = self.hard_lock.lock().expect("code hard lock poisoned");
        let Some(machine) = self.machine.get() else {
            log::warn!(
                "ignoring unspecialized executor for {}: machine form absent",
                self.name
            );
            return;
        };
        machine.set_unspecialized_fn(executor);
        machine.set_jit_data(jit_data);
        if self.specializations.is_empty() && self.primitive.is_none() {
            self.executor.store(executor);
        }
    }

    /// Scan the cache for `class`. No side effects.
    pub fn find_specialized(&self, class: ClassData) -> Option<Executor> {
        self.specializations.find(class)
    }

    /// True iff the cache has room for another specialization.
    pub fn can_specialize(&self) -> bool {
        self.specializations.can_specialize()
    }

    pub fn specializations(&self) -> &SpecializationCache {
        &self.specializations
    }

    // ── Breakpoints ──────────────────────────────────────────────────────

    /// Arm a breakpoint at `ip`, storing `token` for the debugger.
    ///
    /// Internalizes first; `ip` must be an instruction boundary. Arming any
    /// breakpoint switches the interpreter to the debugging variant.
    pub fn set_breakpoint(
        &self,
        env: &ExecEnv<'_>,
        ip: u32,
        token: Value,
    ) -> Result<(), ExecError> {
        let machine = self.internalize(env)?;
        if !machine.is_boundary(ip) {
            return Err(ExecError::InvalidIp { ip });
        }
        let mut map = self.breakpoints.lock().expect("breakpoint mutex poisoned");
        map.insert(ip, token);
        machine.set_debugging(true);
        Ok(())
    }

    /// Disarm the breakpoint at `ip`. Clearing the last one restores the
    /// normal interpreter variant.
    pub fn clear_breakpoint(&self, env: &ExecEnv<'_>, ip: u32) -> Result<(), ExecError> {
        let machine = self.internalize(env)?;
        let mut map = self.breakpoints.lock().expect("breakpoint mutex poisoned");
        map.remove(&ip);
        if map.is_empty() {
            machine.set_debugging(false);
        }
        Ok(())
    }

    /// Whether a breakpoint is armed at `ip`.
    pub fn is_breakpoint(&self, env: &ExecEnv<'_>, ip: u32) -> Result<bool, ExecError> {
        self.internalize(env)?;
        let map = self.breakpoints.lock().expect("breakpoint mutex poisoned");
        Ok(map.contains_key(&ip))
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints
            .lock()
            .expect("breakpoint mutex poisoned")
            .len()
    }

    pub(crate) fn breakpoint_table(&self) -> &Mutex<HashMap<u32, Value>> {
        &self.breakpoints
    }

    // ── Stream introspection ─────────────────────────────────────────────

    /// Instruction pointers of message-send instructions.
    pub fn call_sites(&self, env: &ExecEnv<'_>) -> Result<Vec<u32>, ExecError> {
        let machine = self.internalize(env)?;
        Ok(machine.call_site_ips().to_vec())
    }

    /// Instruction pointers of embedded-reference loads.
    pub fn constant_caches(&self, env: &ExecEnv<'_>) -> Result<Vec<u32>, ExecError> {
        let machine = self.internalize(env)?;
        Ok(machine.constant_cache_ips().to_vec())
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// Invoke this code through its current executor.
    pub fn call(
        self: &Arc<Self>,
        env: &ExecEnv<'_>,
        args: &Args<'_>,
    ) -> Result<Value, ExecError> {
        (self.executor())(env, self, args)
    }

    /// Run this code as a top-level program against the root object.
    ///
    /// Clears the thread's pending raise state on entry. A raised exception
    /// is formatted as one diagnostic line and surfaced to the caller.
    pub fn execute_script(self: &Arc<Self>, env: &ExecEnv<'_>) -> Result<Value, ExecError> {
        env.thread.clear_raise();
        let args = Args::new(env.root, &[]);
        match self.call(env, &args) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::error!(
                    "toplevel raised: {err} ({}:{})",
                    self.file,
                    self.start_line()
                );
                env.thread.set_raise(err.to_string());
                Err(err)
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// The caller's enclosing code, if any frame encloses the current one.
    pub fn of_sender(env: &ExecEnv<'_>) -> Option<Arc<CompiledCode>> {
        env.stack.frame(1)
    }

    /// The currently executing code.
    pub fn current(env: &ExecEnv<'_>) -> Option<Arc<CompiledCode>> {
        env.stack.frame(0)
    }

    /// SHA-256 over the bytecode body and current literal pool.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for word in self.bytecode.iter() {
            hasher.update(word.to_le_bytes());
        }
        hasher.update([0xff]);
        for literal in self.literals.iter() {
            hasher.update(literal.load(Ordering::Acquire).to_le_bytes());
        }
        hasher.finalize().into()
    }

    /// [`fingerprint`](Self::fingerprint) as lowercase hex.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Serializable metadata snapshot for tools.
    pub fn summary(&self) -> CodeSummary {
        CodeSummary {
            name: self.name.as_str().to_string(),
            file: self.file.as_str().to_string(),
            fingerprint: self.fingerprint_hex(),
            bytecode_words: self.bytecode.len(),
            literals: self.literals.len(),
            required_args: self.required_args,
            total_args: self.total_args,
            splat: self.splat,
            stack_size: self.stack_size,
            start_line: self.start_line(),
            internalized: self.machine.get().is_some(),
            breakpoints: self.breakpoint_count(),
        }
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("name", &self.name.as_str())
            .field("file", &self.file.as_str())
            .field("bytecode_words", &self.bytecode.len())
            .field("internalized", &self.machine.get().is_some())
            .finish()
    }
}

// ── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{ClassMap, NoPrimitives, NullInterpreter, NullStack, ThreadState};
    use crate::machine::{Assembler, StructuralVerifier};

    fn with_env<R>(f: impl FnOnce(&ExecEnv<'_>) -> R) -> R {
        let thread = ThreadState::new();
        let classes = ClassMap::new(ClassData::new(1, 0));
        let env = ExecEnv {
            verifier: &StructuralVerifier,
            primitives: &NoPrimitives,
            interpreter: &NullInterpreter,
            stack: &NullStack,
            classes: &classes,
            thread: &thread,
            root: Value::Nil,
        };
        f(&env)
    }

    fn trivial_code() -> CompiledCode {
        CompiledCode::new(CodeInfo {
            bytecode: Assembler::new().push_nil().ret().finish(),
            ..CodeInfo::default()
        })
    }

    #[test]
    fn test_line_without_map_is_sentinel() {
        let code = trivial_code();
        assert_eq!(code.line(0), NO_LINE_INFO);
        assert_eq!(code.start_line(), NO_START_LINE);
    }

    #[test]
    fn test_line_windows_and_tail() {
        let code = CompiledCode::new(CodeInfo {
            bytecode: Assembler::new().push_nil().ret().finish(),
            lines: Some(vec![0, 10, 4, 12, 9, 20]),
            ..CodeInfo::default()
        });
        assert_eq!(code.start_line(), 10);
        assert_eq!(code.line(0), 10);
        assert_eq!(code.line(3), 10);
        assert_eq!(code.line(4), 12);
        assert_eq!(code.line(8), 12);
        assert_eq!(code.line(9), 20, "past the last window: last line");
        assert_eq!(code.line(1000), 20);
    }

    #[test]
    fn test_line_is_monotone_in_ip() {
        let code = CompiledCode::new(CodeInfo {
            bytecode: Assembler::new().push_nil().ret().finish(),
            lines: Some(vec![0, 1, 3, 4, 7, 9, 11, 15]),
            ..CodeInfo::default()
        });
        let mut last = i64::MIN;
        for ip in 0..20 {
            let line = code.line(ip);
            assert!(line >= last, "line({ip}) = {line} regressed below {last}");
            last = line;
        }
    }

    #[test]
    fn test_internalize_publishes_and_sets_executor() {
        with_env(|env| {
            let code = trivial_code();
            assert!(code.machine().is_none());
            let machine = code.internalize(env).expect("valid body");
            assert!(code.machine().is_some());
            assert!(Arc::ptr_eq(&machine, code.machine().unwrap()));
            assert_ne!(
                code.executor() as usize,
                dispatch::default_dispatch as usize,
                "internalize must advance the executor past the default"
            );
        });
    }

    #[test]
    fn test_internalize_failure_leaves_slot_absent() {
        with_env(|env| {
            let code = CompiledCode::new(CodeInfo {
                bytecode: vec![0xfe],
                ..CodeInfo::default()
            });
            let err = code.internalize(env).unwrap_err();
            assert!(matches!(err, ExecError::Verification { .. }));
            assert!(code.machine().is_none(), "failure must publish nothing");
            assert_eq!(code.executor() as usize, dispatch::default_dispatch as usize);
        });
    }

    #[test]
    fn test_duplicate_resets_machine_and_executor() {
        with_env(|env| {
            let code = trivial_code();
            code.internalize(env).expect("valid body");
            let copy = code.duplicate();
            assert!(copy.machine().is_none());
            assert_eq!(copy.executor() as usize, dispatch::default_dispatch as usize);
            assert_eq!(copy.bytecode(), code.bytecode());
            assert_eq!(copy.fingerprint(), code.fingerprint());
        });
    }

    #[test]
    fn test_fingerprint_distinguishes_bodies() {
        let a = trivial_code();
        let b = CompiledCode::new(CodeInfo {
            bytecode: Assembler::new().push_true().ret().finish(),
            ..CodeInfo::default()
        });
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint_hex().len(), 64);
    }

    #[test]
    fn test_call_sites_and_constant_caches() {
        with_env(|env| {
            let mut asm = Assembler::new();
            asm.push_ref(ObjRef(5)); //                 ip 0
            asm.send(Symbol::intern("length"), 0); //   ip 2
            asm.ret();
            let code = CompiledCode::new(CodeInfo {
                bytecode: asm.finish(),
                ..CodeInfo::default()
            });
            assert_eq!(code.call_sites(env).unwrap(), vec![2]);
            assert_eq!(code.constant_caches(env).unwrap(), vec![0]);
        });
    }

    #[test]
    fn test_summary_reflects_state() {
        with_env(|env| {
            let code = trivial_code();
            let before = code.summary();
            assert!(!before.internalized);
            code.internalize(env).expect("valid body");
            let after = code.summary();
            assert!(after.internalized);
            assert_eq!(after.fingerprint, before.fingerprint);
            assert_eq!(after.bytecode_words, 2);
        });
    }
}
