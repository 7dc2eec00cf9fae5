//! Dispatch entry functions and the specialization cache.
//!
//! Every code object carries a current [`Executor`]: the function that, given
//! a receiver and arguments, executes it. Executors are plain `fn` pointers
//! stored in single-word atomic cells so the dispatch path reads them without
//! locking. The transition order is monotone:
//!
//! ```text
//! default_dispatch ──internalize──► fallback (primitive | argument handler)
//!                  ──add_specialized──► specialized_dispatch
//!                  ──set_unspecialized─► unspecialized (direct install)
//! ```
//!
//! ## Cache lookup
//!
//! [`specialized_dispatch`] and [`primitive_failed`] scan the code object's
//! [`SpecializationCache`] for the receiver's `(class_id, serial)` pair. The
//! pair is packed into one `AtomicU64` per slot, so a reader can never
//! observe half a key; the executor word is released before the key, which
//! means a key hit always sees the matching executor.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::code::CompiledCode;
use crate::interop::ExecEnv;
use crate::machine::InterpreterVariant;
use crate::types::{ClassData, ExecError, JitToken, Value};

/// The function pointer that executes a code object.
pub type Executor =
    fn(&ExecEnv<'_>, &Arc<CompiledCode>, &Args<'_>) -> Result<Value, ExecError>;

/// Receiver and arguments for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    pub receiver: Value,
    pub arguments: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(receiver: Value, arguments: &'a [Value]) -> Args<'a> {
        Args {
            receiver,
            arguments,
        }
    }

    pub fn argc(&self) -> u32 {
        self.arguments.len() as u32
    }
}

// ── Atomic executor cells ────────────────────────────────────────────────────

/// A single-word cell holding an optional [`Executor`].
///
/// The pointer is stored as a `usize`; zero means empty. Stores use release
/// ordering and loads acquire, pairing executor publication with the reads
/// on the dispatch path. The word-erasure trick is the same one JIT code
/// caches use for compiled function pointers.
pub(crate) struct AtomicExecutor(AtomicUsize);

impl AtomicExecutor {
    pub(crate) fn new(f: Executor) -> AtomicExecutor {
        AtomicExecutor(AtomicUsize::new(f as usize))
    }

    pub(crate) fn empty() -> AtomicExecutor {
        AtomicExecutor(AtomicUsize::new(0))
    }

    pub(crate) fn load(&self) -> Option<Executor> {
        let raw = self.0.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            // SAFETY: the only non-zero values ever stored are `Executor`
            // pointers written by `store`/`new`; fn pointers and usize have
            // the same size and validity on every supported target.
            Some(unsafe { std::mem::transmute::<usize, Executor>(raw) })
        }
    }

    pub(crate) fn store(&self, f: Executor) {
        self.0.store(f as usize, Ordering::Release);
    }

    pub(crate) fn raw(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

// ── Specialization cache ─────────────────────────────────────────────────────

/// Capacity of a code object's specialization cache.
pub const MAX_SPECIALIZATIONS: usize = 8;

struct Slot {
    /// Packed [`ClassData`]; zero class id marks the slot empty.
    class_data: AtomicU64,
    execute: AtomicExecutor,
    jit_data: AtomicU64,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            class_data: AtomicU64::new(0),
            execute: AtomicExecutor::empty(),
            jit_data: AtomicU64::new(0),
        }
    }
}

/// Where [`SpecializationCache::install`] placed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallSite {
    /// A previously empty slot.
    Fresh(usize),
    /// A slot already bound to the same class id.
    Updated(usize),
    /// The cache was full; a victim was overwritten.
    Evicted(usize),
}

/// Fixed-size direct-scan cache of `(class identity, shape serial)` →
/// executor.
///
/// Readers scan lock-free; writers are serialized by the owning code
/// object's hard lock. When the cache is full the victim is chosen by a
/// rotating cursor rather than always slot 0, which spreads overflow across
/// the cache instead of thrashing one entry.
pub struct SpecializationCache {
    slots: [Slot; MAX_SPECIALIZATIONS],
    victim: AtomicU32,
}

impl SpecializationCache {
    pub(crate) fn new() -> SpecializationCache {
        SpecializationCache {
            slots: std::array::from_fn(|_| Slot::new()),
            victim: AtomicU32::new(0),
        }
    }

    /// Scan for an executor compiled against `class`. No side effects.
    pub fn find(&self, class: ClassData) -> Option<Executor> {
        for slot in &self.slots {
            let key = slot.class_data.load(Ordering::Acquire);
            if key != 0 && ClassData::unpack(key) == class {
                return slot.execute.load();
            }
        }
        None
    }

    /// Install `(class → execute)` at the first empty or same-class slot,
    /// evicting a rotating victim when the cache is full.
    ///
    /// Callers hold the owning code object's hard lock.
    pub(crate) fn install(
        &self,
        class: ClassData,
        execute: Executor,
        jit_data: JitToken,
    ) -> InstallSite {
        let mut target = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let key = slot.class_data.load(Ordering::Acquire);
            if key == 0 {
                target = Some(InstallSite::Fresh(i));
                break;
            }
            if ClassData::unpack(key).id == class.id {
                target = Some(InstallSite::Updated(i));
                break;
            }
        }
        let site = target.unwrap_or_else(|| {
            let i = self.victim.fetch_add(1, Ordering::Relaxed) as usize % MAX_SPECIALIZATIONS;
            InstallSite::Evicted(i)
        });
        let index = match site {
            InstallSite::Fresh(i) | InstallSite::Updated(i) | InstallSite::Evicted(i) => i,
        };

        let slot = &self.slots[index];
        // Invalidate, fill, then publish the key last so a concurrent scan
        // never pairs the new key with a stale executor.
        slot.class_data.store(0, Ordering::Release);
        slot.execute.store(execute);
        slot.jit_data.store(jit_data, Ordering::Release);
        slot.class_data.store(class.pack(), Ordering::Release);
        site
    }

    /// True iff any slot is empty.
    pub fn can_specialize(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.class_data.load(Ordering::Acquire) == 0)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.class_data.load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit the jit token of every occupied slot.
    pub(crate) fn for_each_jit(&self, mut f: impl FnMut(JitToken)) {
        for slot in &self.slots {
            if slot.class_data.load(Ordering::Acquire) != 0 {
                f(slot.jit_data.load(Ordering::Acquire));
            }
        }
    }
}

// ── Dispatch entry functions ─────────────────────────────────────────────────

/// Initial executor of every code object (and of every duplicate).
///
/// Internalizes, then re-enters through whatever executor internalization
/// (or a racing specialization registration) installed.
pub fn default_dispatch(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    let mc = code.internalize(env)?;
    let current = code.executor();
    if current as usize == default_dispatch as usize {
        // Cannot recurse: fall straight through to the installed fallback.
        return (mc.fallback())(env, code, args);
    }
    current(env, code, args)
}

/// Executor installed once a specialization exists and no primitive does.
pub fn specialized_dispatch(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    let Some(mc) = code.machine() else {
        crate::bug("specialized dispatch reached with absent machine form");
    };
    let class = env.classes.class_data(args.receiver);
    if let Some(f) = code.find_specialized(class) {
        return f(env, code, args);
    }
    match mc.unspecialized() {
        Some(f) => f(env, code, args),
        None => (mc.fallback())(env, code, args),
    }
}

/// Fallback used by primitives: same cache scan, but a miss enters the
/// interpreter directly.
pub fn primitive_failed(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    let class = env.classes.class_data(args.receiver);
    if let Some(f) = code.find_specialized(class) {
        return f(env, code, args);
    }
    interpreter_dispatch(env, code, args)
}

/// The generic interpreter entry: selects the normal or debugging variant.
pub fn interpreter_dispatch(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    let Some(mc) = code.machine() else {
        crate::bug("interpreter entry reached with absent machine form");
    };
    match mc.variant() {
        InterpreterVariant::Normal => env.interpreter.run(env, code, mc, args),
        InterpreterVariant::Debugging => env.interpreter.run_debug(env, code, mc, args),
    }
}

// ── Argument-shape handlers ──────────────────────────────────────────────────

/// Select the fallback entry matching the code's argument shape.
///
/// Installed by internalization when no primitive resolves; each handler
/// rejects mismatched argument counts before the interpreter is entered.
pub(crate) fn argument_handler_for(
    required: u32,
    total: u32,
    splat: Option<u32>,
) -> Executor {
    if splat.is_some() {
        interp_splat_args
    } else if total == 0 {
        interp_no_args
    } else if required == total {
        interp_exact_args
    } else {
        interp_flexible_args
    }
}

fn arity_error(code: &CompiledCode, given: u32) -> ExecError {
    ExecError::InvalidArguments {
        required: code.required_args(),
        total: code.total_args(),
        given,
    }
}

fn interp_no_args(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    if args.argc() != 0 {
        return Err(arity_error(code, args.argc()));
    }
    interpreter_dispatch(env, code, args)
}

fn interp_exact_args(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    if args.argc() != code.required_args() {
        return Err(arity_error(code, args.argc()));
    }
    interpreter_dispatch(env, code, args)
}

fn interp_flexible_args(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    let given = args.argc();
    if given < code.required_args() || given > code.total_args() {
        return Err(arity_error(code, given));
    }
    interpreter_dispatch(env, code, args)
}

fn interp_splat_args(
    env: &ExecEnv<'_>,
    code: &Arc<CompiledCode>,
    args: &Args<'_>,
) -> Result<Value, ExecError> {
    if args.argc() < code.required_args() {
        return Err(arity_error(code, args.argc()));
    }
    interpreter_dispatch(env, code, args)
}

// ── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_a(
        _env: &ExecEnv<'_>,
        _code: &Arc<CompiledCode>,
        _args: &Args<'_>,
    ) -> Result<Value, ExecError> {
        Ok(Value::Int(1))
    }

    fn exec_b(
        _env: &ExecEnv<'_>,
        _code: &Arc<CompiledCode>,
        _args: &Args<'_>,
    ) -> Result<Value, ExecError> {
        Ok(Value::Int(2))
    }

    #[test]
    fn test_atomic_executor_empty_then_store() {
        let cell = AtomicExecutor::empty();
        assert!(cell.load().is_none());
        cell.store(exec_a);
        let loaded = cell.load().expect("stored executor");
        assert_eq!(loaded as usize, exec_a as usize);
    }

    #[test]
    fn test_cache_install_and_find() {
        let cache = SpecializationCache::new();
        let cd = ClassData::new(7, 1);
        assert!(cache.find(cd).is_none());

        let site = cache.install(cd, exec_a, 0);
        assert_eq!(site, InstallSite::Fresh(0));
        let hit = cache.find(cd).expect("installed entry");
        assert_eq!(hit as usize, exec_a as usize);
    }

    #[test]
    fn test_cache_serial_mismatch_misses() {
        let cache = SpecializationCache::new();
        cache.install(ClassData::new(7, 1), exec_a, 0);
        assert!(
            cache.find(ClassData::new(7, 2)).is_none(),
            "a bumped serial must invalidate the specialization"
        );
        assert!(cache.find(ClassData::new(8, 1)).is_none());
    }

    #[test]
    fn test_cache_same_class_updates_in_place() {
        let cache = SpecializationCache::new();
        cache.install(ClassData::new(7, 1), exec_a, 0);
        let site = cache.install(ClassData::new(7, 2), exec_b, 0);
        assert_eq!(site, InstallSite::Updated(0));
        assert_eq!(cache.len(), 1, "same class id must reuse its slot");
        let hit = cache.find(ClassData::new(7, 2)).expect("updated entry");
        assert_eq!(hit as usize, exec_b as usize);
    }

    #[test]
    fn test_cache_full_evicts_rotating_victim() {
        let cache = SpecializationCache::new();
        for i in 0..MAX_SPECIALIZATIONS as u32 {
            cache.install(ClassData::new(i + 1, 0), exec_a, 0);
        }
        assert!(!cache.can_specialize());

        let first = cache.install(ClassData::new(100, 0), exec_b, 0);
        let second = cache.install(ClassData::new(101, 0), exec_b, 0);
        let (InstallSite::Evicted(a), InstallSite::Evicted(b)) = (first, second) else {
            panic!("full cache must evict, got {first:?} / {second:?}");
        };
        assert_ne!(a, b, "consecutive evictions must rotate victims");
        assert_eq!(cache.len(), MAX_SPECIALIZATIONS);
    }

    #[test]
    fn test_can_specialize_tracks_empty_slots() {
        let cache = SpecializationCache::new();
        assert!(cache.can_specialize());
        assert!(cache.is_empty());
        for i in 0..MAX_SPECIALIZATIONS as u32 {
            cache.install(ClassData::new(i + 1, 0), exec_a, 0);
        }
        assert!(!cache.can_specialize());
    }

    #[test]
    fn test_argument_handler_selection() {
        assert_eq!(
            argument_handler_for(0, 0, None) as usize,
            interp_no_args as usize
        );
        assert_eq!(
            argument_handler_for(2, 2, None) as usize,
            interp_exact_args as usize
        );
        assert_eq!(
            argument_handler_for(1, 3, None) as usize,
            interp_flexible_args as usize
        );
        assert_eq!(
            argument_handler_for(1, 2, Some(2)) as usize,
            interp_splat_args as usize
        );
    }

    #[test]
    fn test_for_each_jit_visits_occupied_slots_only() {
        let cache = SpecializationCache::new();
        cache.install(ClassData::new(1, 0), exec_a, 11);
        cache.install(ClassData::new(2, 0), exec_a, 22);
        let mut seen = Vec::new();
        cache.for_each_jit(|t| seen.push(t));
        seen.sort_unstable();
        assert_eq!(seen, vec![11, 22]);
    }
}
