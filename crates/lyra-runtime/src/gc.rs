//! Garbage-collector mark interop.
//!
//! The collector owns the object heap; the runtime core owns containers
//! that embed [`ObjRef`] handles. During a collection the collector calls
//! [`mark_code`] (and [`mark_table`]) with a [`Marker`], which walks every
//! owned reference, presents it, and writes back any relocation the marker
//! returns, notifying it through `just_set`.
//!
//! The embedded-reference walk over the opcode stream is the only place
//! opcode words are rewritten after publication. Marking runs with mutators
//! stopped; nothing here synchronizes beyond taking the owning locks to
//! enumerate.

use crate::code::CompiledCode;
use crate::method_table::MethodTable;
use crate::types::{JitToken, Method, ObjRef, Value};

/// The collector-side callback surface.
pub trait Marker {
    /// Mark `reference`; return its new handle if the object moved.
    fn mark(&mut self, reference: ObjRef) -> Option<ObjRef>;

    /// Write-barrier notification: `container` now stores `new_reference`.
    fn just_set(&mut self, container: &CompiledCode, new_reference: ObjRef);

    /// Mark native-backend metadata behind a jit token.
    fn mark_jit(&mut self, _token: JitToken) {}
}

/// Walk every reference a code object owns.
///
/// Order: literal pool, breakpoint tokens, then (when the machine form is
/// present) jit tokens and the embedded-reference offsets of the opcode
/// stream.
pub fn mark_code(code: &CompiledCode, marker: &mut dyn Marker) {
    for slot in code.literal_slots() {
        let raw = slot.load(std::sync::atomic::Ordering::Acquire);
        if raw == 0 {
            continue;
        }
        if let Some(moved) = marker.mark(ObjRef(raw)) {
            slot.store(moved.0, std::sync::atomic::Ordering::Release);
            marker.just_set(code, moved);
        }
    }

    {
        let mut breakpoints = code
            .breakpoint_table()
            .lock()
            .expect("breakpoint mutex poisoned");
        for token in breakpoints.values_mut() {
            if let Value::Ref(reference) = *token {
                if reference.is_null() {
                    continue;
                }
                if let Some(moved) = marker.mark(reference) {
                    *token = Value::Ref(moved);
                    marker.just_set(code, moved);
                }
            }
        }
    }

    let Some(machine) = code.machine() else {
        return;
    };

    if code.jit_data() != 0 {
        marker.mark_jit(code.jit_data());
    }
    if machine.jit_data() != 0 {
        marker.mark_jit(machine.jit_data());
    }
    code.specializations().for_each_jit(|token| {
        if token != 0 {
            marker.mark_jit(token);
        }
    });

    for &offset in machine.references() {
        let raw = machine.opcode_word(offset);
        if raw == 0 {
            continue;
        }
        if let Some(moved) = marker.mark(ObjRef(raw)) {
            machine.store_opcode_word(offset, moved.0);
            marker.just_set(code, moved);
        }
    }
}

/// Walk a method table, marking every compiled method it holds.
pub fn mark_table(table: &MethodTable, marker: &mut dyn Marker) {
    table.for_each(|entry| {
        if let Method::Compiled(code) = &entry.method {
            mark_code(code, marker);
        }
    });
}

// ── Unit tests ───────────────────────────────────────────────────────────────
