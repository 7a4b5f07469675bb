//! The primitive dispatcher (§4.F): a numeric registry of native
//! operations, grouped by range.
//!
//! - 0-49: arithmetic, comparisons, `class`, `==`, `hash`, reflection.
//! - 50-79: object manipulation (`basicNew:`, `basicAt:`, `basicAt:put:`,
//!   `size`, `shallowCopy`).
//! - 80-119: control/process (`perform:` and friends, scheduling a
//!   block onto the cooperative scheduler's VM-block queue).
//! - 120+: host/OS collaborators (file I/O, display, GPIO, networking,
//!   ...), routed entirely through `PrimitiveHost` since the core
//!   crate has no business knowing about real peripherals.
//!
//! Primitive 29 (block closure conversion) and the `perform:` family
//! need direct access to the currently executing process (to push a
//! new frame), which this module's `call_primitive` signature can't
//! provide, so the interpreter special-cases them before ever reaching
//! this table (`Interpreter::do_primitive`).

use crate::object::ObjectMemoryError;
use crate::oop::{NIL, Oop, OopValue};
use crate::platform::PrimitiveHost;
use crate::vm::Vm;

/// Closure conversion: combine a block template with the live context.
/// Handled directly by the interpreter; listed here so the number is
/// defined in one place and `call_primitive` can refuse to handle it
/// if it's ever reached by mistake.
pub const BLOCK_CLOSURE: u8 = 29;

/// `perform:` - send a dynamically-chosen selector to a receiver with
/// no arguments. Like `BLOCK_CLOSURE`, this needs a real message send
/// (method lookup, frame activation), so the interpreter special-cases
/// it ahead of `call_primitive` rather than handling it in this table.
pub const PERFORM: u8 = 80;
/// `perform:with:` - one argument.
pub const PERFORM_WITH: u8 = 81;
/// `perform:withArguments:` - arguments supplied as an `Array`.
pub const PERFORM_WITH_ARGUMENTS: u8 = 82;
/// `runBlock:` - enqueue a block onto the VM-block queue the scheduler
/// drains between bytecodes (§4.G).
pub const RUN_BLOCK: u8 = 83;
/// `runBlock:after:` - same, after the given number of interpreter
/// ticks elapse.
pub const RUN_BLOCK_AFTER: u8 = 84;

pub(crate) const ADD: u8 = 1;
pub(crate) const SUBTRACT: u8 = 2;
pub(crate) const MULTIPLY: u8 = 3;
pub(crate) const DIVIDE: u8 = 4;
pub(crate) const MODULO: u8 = 5;
pub(crate) const EQUAL: u8 = 6;
pub(crate) const NOT_EQUAL: u8 = 7;
pub(crate) const LESS: u8 = 8;
pub(crate) const GREATER: u8 = 9;
pub(crate) const LESS_OR_EQUAL: u8 = 10;
pub(crate) const GREATER_OR_EQUAL: u8 = 11;
pub(crate) const IDENTICAL: u8 = 12;
pub(crate) const CLASS: u8 = 13;
pub(crate) const HASH: u8 = 14;

pub(crate) const BASIC_NEW: u8 = 50;
pub(crate) const BASIC_NEW_SIZE: u8 = 51;
pub(crate) const BASIC_AT: u8 = 52;
pub(crate) const BASIC_AT_PUT: u8 = 53;
pub(crate) const SIZE: u8 = 54;
pub(crate) const SHALLOW_COPY: u8 = 55;

fn as_small_int(oop: Oop) -> Option<isize> {
    match oop.decode() {
        OopValue::SmallInt(n) => Some(n),
        OopValue::Object(_) => None,
    }
}

fn bool_oop<H: PrimitiveHost>(vm: &Vm<H>, value: bool) -> Oop {
    let name = if value { "true" } else { "false" };
    vm.global(name).unwrap_or(NIL)
}

fn arithmetic<H: PrimitiveHost>(vm: &Vm<H>, number: u8, args: &[Oop]) -> Option<Oop> {
    let [receiver, arg] = args else { return None };
    let a = as_small_int(*receiver)?;
    let b = as_small_int(*arg)?;
    match number {
        ADD => a.checked_add(b).map(Oop::int),
        SUBTRACT => a.checked_sub(b).map(Oop::int),
        MULTIPLY => a.checked_mul(b).map(Oop::int),
        DIVIDE => {
            if b == 0 {
                None
            } else {
                Some(Oop::int(a / b))
            }
        }
        MODULO => {
            if b == 0 {
                None
            } else {
                Some(Oop::int(a % b))
            }
        }
        EQUAL => Some(bool_oop(vm, a == b)),
        NOT_EQUAL => Some(bool_oop(vm, a != b)),
        LESS => Some(bool_oop(vm, a < b)),
        GREATER => Some(bool_oop(vm, a > b)),
        LESS_OR_EQUAL => Some(bool_oop(vm, a <= b)),
        GREATER_OR_EQUAL => Some(bool_oop(vm, a >= b)),
        _ => None,
    }
}

fn reflection<H: PrimitiveHost>(vm: &mut Vm<H>, number: u8, args: &[Oop]) -> Result<Option<Oop>, ObjectMemoryError> {
    match (number, args) {
        (IDENTICAL, [a, b]) => Ok(Some(bool_oop(vm, a == b))),
        (CLASS, [receiver]) => Ok(Some(vm.class_of(*receiver)?)),
        (HASH, [receiver]) => {
            let raw = match receiver.decode() {
                OopValue::SmallInt(n) => n,
                OopValue::Object(idx) => idx as isize,
            };
            Ok(Some(Oop::int(raw)))
        }
        _ => Ok(None),
    }
}

fn object_manipulation<H: PrimitiveHost>(
    vm: &mut Vm<H>,
    number: u8,
    args: &[Oop],
) -> Result<Option<Oop>, ObjectMemoryError> {
    match (number, args) {
        (BASIC_NEW, [class]) => {
            let oop = vm.objects.alloc_object(*class, 0)?;
            vm.objects.incr(oop);
            Ok(Some(oop))
        }
        (BASIC_NEW_SIZE, [class, size]) => {
            let Some(n) = as_small_int(*size).filter(|n| *n >= 0) else {
                return Ok(None);
            };
            let oop = vm.objects.alloc_object(*class, n as usize)?;
            vm.objects.incr(oop);
            Ok(Some(oop))
        }
        (BASIC_AT, [receiver, index]) => {
            let Some(i) = as_small_int(*index).filter(|n| *n >= 1) else {
                return Ok(None);
            };
            match vm.objects.basic_at(*receiver, i as usize) {
                Ok(value) => Ok(Some(value)),
                Err(_) => Ok(None),
            }
        }
        (BASIC_AT_PUT, [receiver, index, value]) => {
            let Some(i) = as_small_int(*index).filter(|n| *n >= 1) else {
                return Ok(None);
            };
            match vm.objects.basic_at_put(*receiver, i as usize, *value) {
                Ok(()) => Ok(Some(*value)),
                Err(_) => Ok(None),
            }
        }
        (SIZE, [receiver]) => {
            let raw = vm.objects.size_of(*receiver)?;
            Ok(Some(Oop::int(raw.abs())))
        }
        (SHALLOW_COPY, [receiver]) => {
            let copy = vm.objects.shallow_copy(*receiver)?;
            vm.objects.incr(copy);
            Ok(Some(copy))
        }
        _ => Ok(None),
    }
}

fn scheduling<H: PrimitiveHost>(vm: &mut Vm<H>, number: u8, args: &[Oop]) -> Option<Oop> {
    match (number, args) {
        (RUN_BLOCK, [block]) => {
            vm.scheduler.enqueue_vm_block(*block);
            Some(bool_oop(vm, true))
        }
        (RUN_BLOCK_AFTER, [block, ticks]) => {
            let n = as_small_int(*ticks).filter(|n| *n >= 0)?;
            vm.scheduler.run_block_after(*block, n as u64);
            Some(bool_oop(vm, true))
        }
        _ => None,
    }
}

/// Dispatch primitive `number` with `args` already popped off the
/// stack (receiver first). `None` means "primitive failed": the
/// interpreter falls through to the method's Smalltalk fallback body.
///
/// `PERFORM`/`PERFORM_WITH`/`PERFORM_WITH_ARGUMENTS` never reach this
/// function - they need a real message send, so the interpreter
/// special-cases them in `do_primitive` before calling here, the same
/// way it special-cases `BLOCK_CLOSURE`.
pub fn call_primitive<H: PrimitiveHost>(vm: &mut Vm<H>, number: u8, args: &[Oop]) -> Option<Oop> {
    if number == BLOCK_CLOSURE {
        return None;
    }
    if number < 50 {
        if let Some(value) = arithmetic(vm, number, args) {
            return Some(value);
        }
        return reflection(vm, number, args).ok().flatten();
    }
    if number < 80 {
        return object_manipulation(vm, number, args).ok().flatten();
    }
    if number < 120 {
        return scheduling(vm, number, args);
    }
    vm.host.call(number, args)
}
