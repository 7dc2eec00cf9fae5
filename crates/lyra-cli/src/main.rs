//! Driver binary for the Lyra runtime core.
//!
//! Supplies the minimal collaborators the core leaves external — most
//! notably a small stack interpreter for the demo opcode set — and emits one
//! JSON document per invocation. Errors are encoded in the payload, not the
//! exit code.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use lyra_runtime::interop::{ClassMap, NoPrimitives, NullStack};
use lyra_runtime::{
    Args, Assembler, ClassData, CodeInfo, CodeSummary, CompiledCode, ExecEnv, ExecError,
    InterpreterEntry, MachineCode, Method, MethodId, MethodTable, ObjRef, Opcode, ScopeId,
    StructuralVerifier, Symbol, TableStats, ThreadState, Value, Visibility,
};

#[derive(Parser, Debug)]
#[command(name = "lyra-cli", about = "Exercise the Lyra runtime core and emit JSON")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble a demo program and run it through the dispatch path.
    Demo,
    /// Dump a code object's metadata, call sites, and line table.
    Inspect,
    /// Exercise a method table and report its shape.
    Table {
        /// Number of methods to store.
        #[arg(long, default_value_t = 24)]
        entries: usize,
    },
}

// ── Demo interpreter ─────────────────────────────────────────────────────────

/// A stack interpreter for the runtime's demo opcode set.
///
/// `Send` resolves through a method table, re-entering the dispatch path of
/// the callee, which is the whole point of the demo.
struct DemoInterpreter {
    methods: Arc<MethodTable>,
}

impl DemoInterpreter {
    fn raise(message: impl Into<String>) -> ExecError {
        ExecError::Exception {
            message: message.into(),
        }
    }
}

impl InterpreterEntry for DemoInterpreter {
    fn run(
        &self,
        env: &ExecEnv<'_>,
        code: &Arc<CompiledCode>,
        machine: &MachineCode,
        args: &Args<'_>,
    ) -> Result<Value, ExecError> {
        let mut stack: Vec<Value> = Vec::with_capacity(code.stack_size() as usize);
        let mut ip = 0usize;
        while ip < machine.total() {
            let word = machine.opcode_word(ip);
            let op = Opcode::decode(word)
                .ok_or_else(|| Self::raise(format!("undecodable word at ip {ip}")))?;
            match op {
                Opcode::Nop => {}
                Opcode::PushNil => stack.push(Value::Nil),
                Opcode::PushTrue => stack.push(Value::Bool(true)),
                Opcode::PushFalse => stack.push(Value::Bool(false)),
                Opcode::PushInt => {
                    stack.push(Value::Int(machine.opcode_word(ip + 1) as i32 as i64));
                }
                Opcode::PushLiteral => {
                    let index = machine.opcode_word(ip + 1) as usize;
                    let literal = code
                        .literal(index)
                        .ok_or_else(|| Self::raise(format!("literal {index} out of range")))?;
                    stack.push(Value::Ref(literal));
                }
                Opcode::PushRef => {
                    stack.push(Value::Ref(ObjRef(machine.opcode_word(ip + 1))));
                }
                Opcode::Send => {
                    let name = Symbol::from_raw(machine.opcode_word(ip + 1));
                    let argc = machine.opcode_word(ip + 2) as usize;
                    if stack.len() < argc + 1 {
                        return Err(Self::raise(format!("stack underflow sending {name}")));
                    }
                    let arguments: Vec<Value> = stack.split_off(stack.len() - argc);
                    let receiver = stack.pop().expect("receiver checked above");
                    let entry = self
                        .methods
                        .lookup(name)
                        .filter(|e| e.visibility != Visibility::Undef)
                        .ok_or_else(|| {
                            Self::raise(format!("undefined method `{name}` for {receiver:?}"))
                        })?;
                    let result = match entry.method {
                        Method::Compiled(callee) => {
                            callee.call(env, &Args::new(receiver, &arguments))?
                        }
                        Method::Installable(id) => {
                            return Err(Self::raise(format!(
                                "method `{name}` ({id:?}) is not materialized"
                            )))
                        }
                        Method::Missing => {
                            return Err(Self::raise(format!("method `{name}` is missing")))
                        }
                    };
                    stack.push(result);
                }
                Opcode::Jump => {
                    ip = machine.opcode_word(ip + 1) as usize;
                    continue;
                }
                Opcode::JumpIfFalse => {
                    let condition = stack
                        .pop()
                        .ok_or_else(|| Self::raise("stack underflow on branch"))?;
                    if matches!(condition, Value::Nil | Value::Bool(false)) {
                        ip = machine.opcode_word(ip + 1) as usize;
                        continue;
                    }
                }
                Opcode::Pop => {
                    stack.pop();
                }
                Opcode::Ret => {
                    return Ok(stack.pop().unwrap_or(Value::Nil));
                }
            }
            ip += op.width();
        }
        Ok(Value::Nil)
    }
}

// ── Demo world ───────────────────────────────────────────────────────────────

struct World {
    methods: Arc<MethodTable>,
    interpreter: DemoInterpreter,
    classes: ClassMap,
    thread: ThreadState,
    answer: Arc<CompiledCode>,
    script: Arc<CompiledCode>,
}

impl World {
    /// A receiver object, a method `answer` returning 42, and a script that
    /// sends `answer` to it.
    fn build() -> World {
        let receiver = ObjRef(1);

        let answer = Arc::new(CompiledCode::new(CodeInfo {
            name: Symbol::intern("answer"),
            file: Symbol::intern("demo.lyra"),
            bytecode: Assembler::new().push_int(42).ret().finish(),
            lines: Some(vec![0, 2]),
            ..CodeInfo::default()
        }));

        let methods = Arc::new(MethodTable::new(16));
        methods.store(
            Symbol::intern("answer"),
            MethodId(1),
            Method::Compiled(answer.clone()),
            ScopeId(0),
            1,
            Visibility::Public,
        );

        let mut asm = Assembler::new();
        asm.push_ref(receiver);
        asm.send(Symbol::intern("answer"), 0);
        asm.ret();
        let script = Arc::new(CompiledCode::new(CodeInfo {
            name: Symbol::intern("__script__"),
            file: Symbol::intern("demo.lyra"),
            bytecode: asm.finish(),
            lines: Some(vec![0, 1, 2, 5]),
            ..CodeInfo::default()
        }));

        let classes = ClassMap::new(ClassData::new(1, 0));
        classes.assign(receiver, ClassData::new(7, 1));

        World {
            interpreter: DemoInterpreter {
                methods: methods.clone(),
            },
            methods,
            classes,
            thread: ThreadState::new(),
            answer,
            script,
        }
    }

    fn env(&self) -> ExecEnv<'_> {
        ExecEnv {
            verifier: &StructuralVerifier,
            primitives: &NoPrimitives,
            interpreter: &self.interpreter,
            stack: &NullStack,
            classes: &self.classes,
            thread: &self.thread,
            root: Value::Nil,
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DemoReport {
    result: Option<String>,
    error: Option<ExecError>,
    script: CodeSummary,
    method: CodeSummary,
    table: TableStats,
}

#[derive(Serialize)]
struct InspectReport {
    summary: CodeSummary,
    call_sites: Vec<u32>,
    constant_caches: Vec<u32>,
    lines: Vec<LineEntry>,
}

#[derive(Serialize)]
struct LineEntry {
    ip: u32,
    line: i64,
}

#[derive(Serialize)]
struct TableReport {
    stats: TableStats,
    duplicate_stats: TableStats,
    removed: String,
    lookup_after_remove_in_duplicate: bool,
}

fn run_demo() -> DemoReport {
    let world = World::build();
    let env = world.env();
    let (result, error) = match world.script.execute_script(&env) {
        Ok(value) => (Some(format!("{value:?}")), None),
        Err(err) => (None, Some(err)),
    };
    DemoReport {
        result,
        error,
        script: world.script.summary(),
        method: world.answer.summary(),
        table: world.methods.stats(),
    }
}

fn run_inspect() -> InspectReport {
    let world = World::build();
    let env = world.env();
    let script = &world.script;
    let call_sites = script.call_sites(&env).unwrap_or_default();
    let constant_caches = script.constant_caches(&env).unwrap_or_default();
    let lines = (0..script.bytecode().len() as u32)
        .map(|ip| LineEntry {
            ip,
            line: script.line(ip),
        })
        .collect();
    InspectReport {
        summary: script.summary(),
        call_sites,
        constant_caches,
        lines,
    }
}

fn run_table(entries: usize) -> TableReport {
    let table = MethodTable::new(16);
    for i in 0..entries {
        table.store(
            Symbol::intern(&format!("method_{i}")),
            MethodId(i as u64),
            Method::Installable(MethodId(i as u64)),
            ScopeId(0),
            1,
            Visibility::Public,
        );
    }
    let duplicate = table.duplicate();
    let removed = Symbol::intern("method_0");
    table.remove(removed);
    TableReport {
        stats: table.stats(),
        duplicate_stats: duplicate.stats(),
        removed: removed.as_str().to_string(),
        lookup_after_remove_in_duplicate: duplicate.has_name(removed),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let json = match cli.command {
        Command::Demo => serde_json::to_string_pretty(&run_demo()),
        Command::Inspect => serde_json::to_string_pretty(&run_inspect()),
        Command::Table { entries } => serde_json::to_string_pretty(&run_table(entries)),
    }
    .expect("reports are always serializable");
    println!("{json}");
    // Exit 0 always — errors are encoded in the JSON, not the exit code.
}
