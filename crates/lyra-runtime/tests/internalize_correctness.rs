// crates/lyra-runtime/tests/internalize_correctness.rs
//
// The one-time bytecode → machine-form transition: idempotence under
// contention, exactly-once verification, failure propagation, and the
// duplicate reset.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lyra_runtime::{
    Assembler, BytecodeVerifier, ClassData, CodeError, CodeInfo, CompiledCode, ExecEnv,
    ExecError, StructuralVerifier, ThreadState, Value,
};
use lyra_runtime::interop::{ClassMap, NoPrimitives, NullInterpreter, NullStack};

/// Delegates to the structural verifier while counting invocations.
struct CountingVerifier {
    calls: AtomicUsize,
}

impl CountingVerifier {
    fn new() -> CountingVerifier {
        CountingVerifier {
            calls: AtomicUsize::new(0),
        }
    }
}

impl BytecodeVerifier for CountingVerifier {
    fn verify(&self, code: &CompiledCode) -> Result<(), CodeError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        StructuralVerifier.verify(code)
    }
}

fn env_with<'a>(
    verifier: &'a dyn BytecodeVerifier,
    thread: &'a ThreadState,
    classes: &'a ClassMap,
) -> ExecEnv<'a> {
    ExecEnv {
        verifier,
        primitives: &NoPrimitives,
        interpreter: &NullInterpreter,
        stack: &NullStack,
        classes,
        thread,
        root: Value::Nil,
    }
}

fn trivial_code() -> Arc<CompiledCode> {
    Arc::new(CompiledCode::new(CodeInfo {
        bytecode: Assembler::new().push_nil().ret().finish(),
        ..CodeInfo::default()
    }))
}

/// Scenario: 8 threads race to internalize one code object. Every thread
/// gets the same machine-form identity and the verifier runs exactly once.
#[test]
fn test_concurrent_internalize_is_idempotent() {
    let verifier = CountingVerifier::new();
    let thread = ThreadState::new();
    let classes = ClassMap::new(ClassData::new(1, 0));
    let code = trivial_code();

    let machines = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let code = Arc::clone(&code);
                let env = env_with(&verifier, &thread, &classes);
                scope.spawn(move || code.internalize(&env).expect("valid body"))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("internalize thread should not panic"))
            .collect::<Vec<_>>()
    });

    assert_eq!(machines.len(), 8);
    for machine in &machines[1..] {
        assert!(
            Arc::ptr_eq(&machines[0], machine),
            "all racers must observe one machine form"
        );
    }
    assert_eq!(
        verifier.calls.load(Ordering::Acquire),
        1,
        "the verifier must run exactly once"
    );
}

/// Repeated sequential internalization returns the committed value without
/// re-verifying.
#[test]
fn test_sequential_internalize_verifies_once() {
    let verifier = CountingVerifier::new();
    let thread = ThreadState::new();
    let classes = ClassMap::new(ClassData::new(1, 0));
    let env = env_with(&verifier, &thread, &classes);
    let code = trivial_code();

    let first = code.internalize(&env).expect("valid body");
    let second = code.internalize(&env).expect("valid body");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(verifier.calls.load(Ordering::Acquire), 1);
}

/// A rejected body surfaces `Verification` from every operation that needs
/// the machine form, and publishes nothing.
#[test]
fn test_verification_failure_propagates_and_publishes_nothing() {
    let verifier = CountingVerifier::new();
    let thread = ThreadState::new();
    let classes = ClassMap::new(ClassData::new(1, 0));
    let env = env_with(&verifier, &thread, &classes);

    let code = Arc::new(CompiledCode::new(CodeInfo {
        bytecode: vec![0xfe, 0xfe],
        ..CodeInfo::default()
    }));

    for _ in 0..2 {
        let err = code.internalize(&env).unwrap_err();
        assert!(matches!(err, ExecError::Verification { .. }));
        assert!(code.machine().is_none());
    }

    let err = code.set_breakpoint(&env, 0, Value::Nil).unwrap_err();
    assert!(matches!(err, ExecError::Verification { .. }));
    let err = code.is_breakpoint(&env, 0).unwrap_err();
    assert!(matches!(err, ExecError::Verification { .. }));
    let err = code.call_sites(&env).unwrap_err();
    assert!(matches!(err, ExecError::Verification { .. }));
    let err = code.constant_caches(&env).unwrap_err();
    assert!(matches!(err, ExecError::Verification { .. }));
}

/// A duplicate starts over: machine slot absent, and its own first use
/// re-verifies.
#[test]
fn test_duplicate_re_internalizes() {
    let verifier = CountingVerifier::new();
    let thread = ThreadState::new();
    let classes = ClassMap::new(ClassData::new(1, 0));
    let env = env_with(&verifier, &thread, &classes);

    let code = trivial_code();
    let original_machine = code.internalize(&env).expect("valid body");
    assert_eq!(verifier.calls.load(Ordering::Acquire), 1);

    let copy = Arc::new(code.duplicate());
    assert!(copy.machine().is_none(), "duplicate resets the machine slot");

    let copy_machine = copy.internalize(&env).expect("valid body");
    assert!(
        !Arc::ptr_eq(&original_machine, &copy_machine),
        "the copy must build its own machine form"
    );
    assert_eq!(
        verifier.calls.load(Ordering::Acquire),
        2,
        "the copy's first use re-verifies"
    );
}
