//! The bytecode interpreter (§4.E).
//!
//! `Interpreter` borrows a `Vm` for the duration of one `execute` call
//! and steps a `Process` until it either finishes, runs out of its
//! step budget, or hits a runtime error. Activations are a native
//! `Vec<Frame>` call stack rather than the Blue-Book shared stack with
//! link-pointer indirection: each `Frame` owns its own value stack,
//! and a real `Context` object is materialized lazily - only when
//! Smalltalk code asks for one via `thisContext` or a block literal's
//! closure conversion (primitive 29) - rather than threading one
//! shared byte array through every opcode.
//!
//! A block's captured arguments/temporaries are shared with its home
//! activation through `Rc<RefCell<Vec<Oop>>>`, since a block and its
//! home method read and write the very same slots. That sharing is
//! also why a block's storage has to survive its creating `Frame`
//! being popped off the call stack: `Process::contexts` persists a
//! closure's `receiver`/`method`/`arguments`/`temporaries` keyed by
//! its materialized context `Oop`, independent of whether the frame
//! that made it is still live. `BlockReturn`, by contrast, genuinely
//! needs to know whether the home *activation* is still running, so
//! it scans the live frame stack rather than this persistent map.
//!
//! Local variable storage (arguments, temporaries, the expression
//! stack) does not participate in the object table's reference
//! counting at all - only slots reachable through an object's own
//! structure (instance variables, literal frames, globals) do. This
//! trades a little extra retention for the guarantee that a value
//! held only in a local variable is never collected out from under
//! it, which matters more for a system with no cycle collector.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::bytecode::{self, constant, op, special};
use crate::object::ObjectMemoryError;
use crate::oop::{NIL, Oop};
use crate::platform::PrimitiveHost;
use crate::primitive;
use crate::vm::{Vm, block_layout, class_layout, context_layout, method_layout};


/// Everything that can go wrong while stepping a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A high-nibble opcode outside the defined table (12 and 14 are
    /// reserved, unused slots).
    InvalidOpcode(u8),
    /// A `DoSpecial` sub-op outside the defined table.
    InvalidSpecial(u8),
    /// `pc` ran past the end of a method's bytecodes.
    BytecodeOutOfRange,
    /// An instruction needed a value that wasn't on the stack.
    StackUnderflow,
    /// `SendMessage` executed without a preceding `MarkArguments`.
    MissingArgumentMark,
    /// A send's argument count didn't match the callee's pattern.
    ArityMismatch { expected: u8, got: u8 },
    /// A block's `DEFINING_CONTEXT` slot is `nil`: the template was
    /// never passed through primitive 29.
    UnboundBlock,
    /// A non-local return (or a `#value` send) targets a context whose
    /// home activation has already returned.
    HomeContextGone,
    /// Lookup failed all the way to the root, and there is no
    /// `doesNotUnderstand:` handler installed either.
    MessageNotUnderstood { selector: Oop },
    /// Stepped a process with no frames left.
    EmptyProcess,
    /// The object table refused an allocation or access.
    ObjectTable(ObjectMemoryError),
}

impl From<ObjectMemoryError> for RuntimeError {
    fn from(e: ObjectMemoryError) -> Self {
        Self::ObjectTable(e)
    }
}

impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidOpcode(b) => write!(f, "invalid opcode {b}"),
            Self::InvalidSpecial(b) => write!(f, "invalid DoSpecial sub-op {b}"),
            Self::BytecodeOutOfRange => write!(f, "bytecode index out of range"),
            Self::StackUnderflow => write!(f, "stack underflow"),
            Self::MissingArgumentMark => write!(f, "SendMessage without a preceding MarkArguments"),
            Self::ArityMismatch { expected, got } => {
                write!(f, "expected {expected} argument(s), got {got}")
            }
            Self::UnboundBlock => write!(f, "block has no defining context"),
            Self::HomeContextGone => write!(f, "home context is no longer on the stack"),
            Self::MessageNotUnderstood { selector } => {
                write!(f, "message not understood: {selector}")
            }
            Self::EmptyProcess => write!(f, "process has no active frame"),
            Self::ObjectTable(e) => write!(f, "{e}"),
        }
    }
}

/// What one bounded `execute` call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// The step budget ran out with frames still on the stack.
    Runnable,
    /// The process's last frame returned; this is its answer.
    Finished(Oop),
}

/// One method or block activation.
struct Frame {
    receiver: Oop,
    method: Oop,
    method_class: Oop,
    bytecodes: Vec<u8>,
    literals: Vec<Oop>,
    pc: usize,
    arguments: Rc<RefCell<Vec<Oop>>>,
    temporaries: Rc<RefCell<Vec<Oop>>>,
    stack: Vec<Oop>,
    is_block: bool,
    /// For block frames only: the context a `BlockReturn` inside this
    /// activation must unwind to. Propagated unchanged from the
    /// enclosing block when a block is created while another block is
    /// running, so arbitrarily nested blocks all resolve to the same
    /// top-level method activation (§4.E).
    home_context_oop: Option<Oop>,
    /// This activation's own materialized `Context`, if anything has
    /// asked for one yet (`thisContext`, or primitive 29 closing over
    /// it).
    own_context_oop: Option<Oop>,
}

/// A closure's captured state, kept alive independently of whether the
/// `Frame` that created it is still on the call stack - a block can be
/// sent `#value` long after the method that built it has returned.
struct ContextData {
    receiver: Oop,
    method: Oop,
    method_class: Oop,
    arguments: Rc<RefCell<Vec<Oop>>>,
    temporaries: Rc<RefCell<Vec<Oop>>>,
}

/// A single thread of Smalltalk execution: a call stack of `Frame`s
/// plus the persisted closure contexts it has created.
pub struct Process {
    frames: Vec<Frame>,
    contexts: BTreeMap<Oop, ContextData>,
}

impl Process {
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: Vec::new(), contexts: BTreeMap::new() }
    }

    /// Push the initial activation for sending `selector` (already
    /// resolved to `method`) to `receiver` with `args`.
    pub fn activate<H: PrimitiveHost>(
        &mut self,
        vm: &mut Vm<H>,
        method: Oop,
        receiver: Oop,
        args: Vec<Oop>,
    ) -> Result<(), RuntimeError> {
        let frame = build_method_frame(vm, method, receiver, args)?;
        self.frames.push(frame);
        Ok(())
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of executing exactly one bytecode.
enum StepOutcome {
    Continue,
    Finished(Oop),
}

/// Decode a selector symbol's bytes back into a `&str`-owning `String`,
/// used only to resolve message-send arity and the small set of block
/// `#value`-family selectors.
fn selector_name<H: PrimitiveHost>(vm: &Vm<H>, selector: Oop) -> Result<String, RuntimeError> {
    let raw_len = vm.objects.size_of(selector)?;
    let len = if raw_len < 0 { (-raw_len) as usize } else { 0 };
    let mut bytes = Vec::with_capacity(len);
    for i in 1..=len {
        bytes.push(vm.objects.byte_at(selector, i)?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// A selector's argument count follows directly from its spelling:
/// one per keyword part, one for a binary operator, none for a bare
/// unary name.
fn arg_count_for_selector(name: &str) -> usize {
    if name.contains(':') {
        name.matches(':').count()
    } else if name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_') {
        0
    } else {
        1
    }
}

fn method_bytecodes_and_literals<H: PrimitiveHost>(
    vm: &Vm<H>,
    method: Oop,
) -> Result<(Vec<u8>, Vec<Oop>), RuntimeError> {
    let bytecodes_oop = vm.objects.basic_at(method, method_layout::BYTECODES)?;
    let raw_len = vm.objects.size_of(bytecodes_oop)?;
    let len = if raw_len < 0 { (-raw_len) as usize } else { 0 };
    let mut bytecodes = Vec::with_capacity(len);
    for i in 1..=len {
        bytecodes.push(vm.objects.byte_at(bytecodes_oop, i)?);
    }

    let literals_oop = vm.objects.basic_at(method, method_layout::LITERALS)?;
    let lit_len = vm.objects.size_of(literals_oop)?.max(0) as usize;
    let mut literals = Vec::with_capacity(lit_len);
    for i in 1..=lit_len {
        literals.push(vm.objects.basic_at(literals_oop, i)?);
    }

    Ok((bytecodes, literals))
}

fn build_method_frame<H: PrimitiveHost>(
    vm: &mut Vm<H>,
    method: Oop,
    receiver: Oop,
    args: Vec<Oop>,
) -> Result<Frame, RuntimeError> {
    let (bytecodes, literals) = method_bytecodes_and_literals(vm, method)?;
    let temp_size = vm
        .objects
        .basic_at(method, method_layout::TEMPORARY_SIZE)?
        .as_int()
        .unwrap_or(0)
        .max(0) as usize;
    let method_class = vm.objects.basic_at(method, method_layout::METHOD_CLASS)?;

    let mut argument_slots = Vec::with_capacity(args.len() + 1);
    argument_slots.push(receiver);
    argument_slots.extend(args);

    Ok(Frame {
        receiver,
        method,
        method_class,
        bytecodes,
        literals,
        pc: 0,
        arguments: Rc::new(RefCell::new(argument_slots)),
        temporaries: Rc::new(RefCell::new(alloc::vec![NIL; temp_size])),
        stack: Vec::new(),
        is_block: false,
        home_context_oop: None,
        own_context_oop: None,
    })
}

fn pop_items(frame: &mut Frame, count: usize) -> Result<Vec<Oop>, RuntimeError> {
    if frame.stack.len() < count {
        return Err(RuntimeError::StackUnderflow);
    }
    Ok(frame.stack.split_off(frame.stack.len() - count))
}

/// Runs a `Process` against a borrowed `Vm`.
pub struct Interpreter<'vm, H: PrimitiveHost> {
    vm: &'vm mut Vm<H>,
    /// Set by `MarkArguments`, consumed by the very next `SendMessage`.
    marked_args: Option<usize>,
    /// Set by `DoSpecial SendToSuper`, consumed by the very next send.
    pending_super: bool,
}

impl<'vm, H: PrimitiveHost> Interpreter<'vm, H> {
    pub fn new(vm: &'vm mut Vm<H>) -> Self {
        Self { vm, marked_args: None, pending_super: false }
    }

    /// Execute up to `max_steps` bytecodes, or until the process
    /// finishes. Before each bytecode, ticks the scheduler and, if a
    /// VM-queued block is waiting, invokes it synchronously on the
    /// current stack (§4.G) exactly as if `value` had been sent to it.
    pub fn execute(&mut self, process: &mut Process, max_steps: usize) -> Result<ExecResult, RuntimeError> {
        for _ in 0..max_steps {
            if process.frames.is_empty() {
                return Ok(ExecResult::Finished(NIL));
            }

            self.vm.scheduler.tick();
            if self.vm.scheduler.has_vm_block() {
                if let Some(block) = self.vm.scheduler.dequeue_vm_block() {
                    let frame = self.invoke_block(process, block, Vec::new())?;
                    process.frames.push(frame);
                    continue;
                }
            }

            match self.step(process)? {
                StepOutcome::Continue => {}
                StepOutcome::Finished(value) => return Ok(ExecResult::Finished(value)),
            }
        }

        if process.frames.is_empty() {
            Ok(ExecResult::Finished(NIL))
        } else {
            Ok(ExecResult::Runnable)
        }
    }

    fn fetch(&self, process: &mut Process, idx: usize) -> Result<(u8, u8), RuntimeError> {
        let frame = &mut process.frames[idx];
        let byte = *frame.bytecodes.get(frame.pc).ok_or(RuntimeError::BytecodeOutOfRange)?;
        frame.pc += 1;
        let (hi, lo) = bytecode::decode(byte);
        if hi == op::EXTENDED {
            let operand = *frame.bytecodes.get(frame.pc).ok_or(RuntimeError::BytecodeOutOfRange)?;
            frame.pc += 1;
            Ok((lo, operand))
        } else {
            Ok((hi, lo))
        }
    }

    fn read_byte(&self, process: &mut Process, idx: usize) -> Result<usize, RuntimeError> {
        let frame = &mut process.frames[idx];
        let byte = *frame.bytecodes.get(frame.pc).ok_or(RuntimeError::BytecodeOutOfRange)?;
        frame.pc += 1;
        Ok(byte as usize)
    }

    fn is_true(&self, value: Oop) -> bool {
        self.vm.global("true") == Some(value)
    }

    fn push_small_constant(&self, id: u8) -> Oop {
        match id {
            constant::ZERO => Oop::int(0),
            constant::ONE => Oop::int(1),
            constant::TWO => Oop::int(2),
            constant::MINUS_ONE => Oop::int(-1),
            constant::TRUE => self.vm.global("true").unwrap_or(NIL),
            constant::FALSE => self.vm.global("false").unwrap_or(NIL),
            constant::NIL | _ => NIL,
        }
    }

    fn step(&mut self, process: &mut Process) -> Result<StepOutcome, RuntimeError> {
        let idx = process.frames.len().checked_sub(1).ok_or(RuntimeError::EmptyProcess)?;
        let (opcode, operand) = self.fetch(process, idx)?;

        match opcode {
            op::PUSH_INSTANCE => {
                let receiver = process.frames[idx].receiver;
                let value = self.vm.objects.basic_at(receiver, operand as usize)?;
                process.frames[idx].stack.push(value);
                Ok(StepOutcome::Continue)
            }
            op::PUSH_ARGUMENT => {
                let value = process.frames[idx].arguments.borrow()[operand as usize];
                process.frames[idx].stack.push(value);
                Ok(StepOutcome::Continue)
            }
            op::PUSH_TEMPORARY => {
                let value = process.frames[idx].temporaries.borrow()[operand as usize];
                process.frames[idx].stack.push(value);
                Ok(StepOutcome::Continue)
            }
            op::PUSH_LITERAL => {
                let value = process.frames[idx].literals[operand as usize];
                process.frames[idx].stack.push(value);
                Ok(StepOutcome::Continue)
            }
            op::PUSH_CONSTANT => {
                let value = if operand == constant::CONTEXT {
                    self.materialize_context(process, idx)?
                } else {
                    self.push_small_constant(operand)
                };
                process.frames[idx].stack.push(value);
                Ok(StepOutcome::Continue)
            }
            op::ASSIGN_INSTANCE => {
                let receiver = process.frames[idx].receiver;
                let value = *process.frames[idx].stack.last().ok_or(RuntimeError::StackUnderflow)?;
                self.vm.objects.basic_at_put(receiver, operand as usize, value)?;
                Ok(StepOutcome::Continue)
            }
            op::ASSIGN_TEMPORARY => {
                let value = *process.frames[idx].stack.last().ok_or(RuntimeError::StackUnderflow)?;
                process.frames[idx].temporaries.borrow_mut()[operand as usize] = value;
                Ok(StepOutcome::Continue)
            }
            op::MARK_ARGUMENTS => {
                self.marked_args = Some(operand as usize);
                Ok(StepOutcome::Continue)
            }
            op::SEND_MESSAGE => {
                let selector = process.frames[idx].literals[operand as usize];
                let count = self.marked_args.take().ok_or(RuntimeError::MissingArgumentMark)?;
                let items = pop_items(&mut process.frames[idx], count)?;
                self.send(process, selector, items)
            }
            op::SEND_UNARY => {
                let selector = {
                    let Vm { objects, symbols, .. } = &mut *self.vm;
                    symbols.unary_selector(objects, operand as usize)?
                };
                let items = pop_items(&mut process.frames[idx], 1)?;
                self.send(process, selector, items)
            }
            op::SEND_BINARY => {
                let selector = {
                    let Vm { objects, symbols, .. } = &mut *self.vm;
                    symbols.binary_selector(objects, operand as usize)?
                };
                let items = pop_items(&mut process.frames[idx], 2)?;
                self.send(process, selector, items)
            }
            op::DO_PRIMITIVE => {
                let arg_count = operand as usize;
                let prim_num = self.read_byte(process, idx)? as u8;
                self.do_primitive(process, arg_count, prim_num)
            }
            op::DO_SPECIAL => self.do_special(process, operand),
            other => Err(RuntimeError::InvalidOpcode(other)),
        }
    }

    fn do_special(&mut self, process: &mut Process, sub_op: u8) -> Result<StepOutcome, RuntimeError> {
        let idx = process.frames.len() - 1;
        match sub_op {
            special::SELF_RETURN => {
                let value = process.frames[idx].arguments.borrow()[0];
                Ok(self.return_value(process, value))
            }
            special::STACK_RETURN => {
                let value = process.frames[idx].stack.pop().ok_or(RuntimeError::StackUnderflow)?;
                Ok(self.return_value(process, value))
            }
            special::BLOCK_RETURN => self.block_return(process),
            special::DUPLICATE => {
                let value = *process.frames[idx].stack.last().ok_or(RuntimeError::StackUnderflow)?;
                process.frames[idx].stack.push(value);
                Ok(StepOutcome::Continue)
            }
            special::POP_TOP => {
                process.frames[idx].stack.pop().ok_or(RuntimeError::StackUnderflow)?;
                Ok(StepOutcome::Continue)
            }
            special::BRANCH => {
                let target = self.read_byte(process, idx)?;
                process.frames[idx].pc = target;
                Ok(StepOutcome::Continue)
            }
            special::BRANCH_IF_TRUE => {
                let target = self.read_byte(process, idx)?;
                let value = process.frames[idx].stack.pop().ok_or(RuntimeError::StackUnderflow)?;
                if self.is_true(value) {
                    process.frames[idx].pc = target;
                }
                Ok(StepOutcome::Continue)
            }
            special::BRANCH_IF_FALSE => {
                let target = self.read_byte(process, idx)?;
                let value = process.frames[idx].stack.pop().ok_or(RuntimeError::StackUnderflow)?;
                if !self.is_true(value) {
                    process.frames[idx].pc = target;
                }
                Ok(StepOutcome::Continue)
            }
            special::AND_BRANCH => {
                let target = self.read_byte(process, idx)?;
                let value = *process.frames[idx].stack.last().ok_or(RuntimeError::StackUnderflow)?;
                if self.is_true(value) {
                    process.frames[idx].stack.pop();
                } else {
                    process.frames[idx].pc = target;
                }
                Ok(StepOutcome::Continue)
            }
            special::OR_BRANCH => {
                let target = self.read_byte(process, idx)?;
                let value = *process.frames[idx].stack.last().ok_or(RuntimeError::StackUnderflow)?;
                if self.is_true(value) {
                    process.frames[idx].pc = target;
                } else {
                    process.frames[idx].stack.pop();
                }
                Ok(StepOutcome::Continue)
            }
            special::SEND_TO_SUPER => {
                self.pending_super = true;
                Ok(StepOutcome::Continue)
            }
            other => Err(RuntimeError::InvalidSpecial(other)),
        }
    }

    fn return_value(&self, process: &mut Process, value: Oop) -> StepOutcome {
        process.frames.pop();
        match process.frames.last_mut() {
            Some(caller) => {
                caller.stack.push(value);
                StepOutcome::Continue
            }
            None => StepOutcome::Finished(value),
        }
    }

    fn block_return(&mut self, process: &mut Process) -> Result<StepOutcome, RuntimeError> {
        let idx = process.frames.len() - 1;
        let home = process.frames[idx].home_context_oop.ok_or(RuntimeError::HomeContextGone)?;
        let value = process.frames[idx].stack.pop().ok_or(RuntimeError::StackUnderflow)?;
        let target = process.frames.iter().rposition(|f| f.own_context_oop == Some(home));
        let Some(target) = target else {
            return Err(RuntimeError::HomeContextGone);
        };
        process.frames.truncate(target);
        Ok(match process.frames.last_mut() {
            Some(caller) => {
                caller.stack.push(value);
                StepOutcome::Continue
            }
            None => StepOutcome::Finished(value),
        })
    }

    /// Lazily reify the current activation's `Context`. Only method
    /// frames are registered for closure/`BlockReturn` lookups; a
    /// block frame may still materialize one for `thisContext`, but
    /// it is never itself a valid non-local-return or closure target
    /// (see the module doc comment).
    fn materialize_context(&mut self, process: &mut Process, idx: usize) -> Result<Oop, RuntimeError> {
        if let Some(oop) = process.frames[idx].own_context_oop {
            return Ok(oop);
        }
        let class = self.vm.global("Context").unwrap_or(NIL);
        let context_oop = self.vm.objects.alloc_object(class, context_layout::INSTANCE_SLOT_COUNT)?;
        self.vm.objects.incr(context_oop);

        let (receiver, method, method_class, is_block, arguments, temporaries) = {
            let f = &process.frames[idx];
            (f.receiver, f.method, f.method_class, f.is_block, Rc::clone(&f.arguments), Rc::clone(&f.temporaries))
        };
        self.vm.objects.basic_at_put(context_oop, context_layout::METHOD, method)?;
        self.vm.objects.basic_at_put(context_oop, context_layout::RECEIVER, receiver)?;
        process.frames[idx].own_context_oop = Some(context_oop);

        if !is_block {
            process.contexts.insert(context_oop, ContextData { receiver, method, method_class, arguments, temporaries });
        }
        Ok(context_oop)
    }

    /// Primitive 29: bind a block template to the currently executing
    /// activation, producing a closure. If the current frame is itself
    /// a block, the new closure inherits *its* home context rather
    /// than a fresh one, so nested blocks all unwind to the same
    /// top-level method on non-local return.
    fn primitive_block_closure(&mut self, process: &mut Process) -> Result<StepOutcome, RuntimeError> {
        let idx = process.frames.len() - 1;
        let template = process.frames[idx].stack.pop().ok_or(RuntimeError::StackUnderflow)?;
        let context_oop = if process.frames[idx].is_block {
            process.frames[idx].home_context_oop.ok_or(RuntimeError::HomeContextGone)?
        } else {
            self.materialize_context(process, idx)?
        };
        let closure = self.vm.objects.shallow_copy(template)?;
        self.vm.objects.incr(closure);
        self.vm.objects.basic_at_put(closure, block_layout::DEFINING_CONTEXT, context_oop)?;
        process.frames[idx].stack.push(closure);
        Ok(StepOutcome::Continue)
    }

    fn do_primitive(&mut self, process: &mut Process, arg_count: usize, prim_num: u8) -> Result<StepOutcome, RuntimeError> {
        if prim_num == primitive::BLOCK_CLOSURE {
            return self.primitive_block_closure(process);
        }
        let idx = process.frames.len() - 1;
        let items = pop_items(&mut process.frames[idx], arg_count)?;
        match prim_num {
            primitive::PERFORM => return self.primitive_perform(process, items, 0),
            primitive::PERFORM_WITH => return self.primitive_perform(process, items, 1),
            primitive::PERFORM_WITH_ARGUMENTS => return self.primitive_perform_with_arguments(process, items),
            _ => {}
        }
        if let Some(value) = primitive::call_primitive(self.vm, prim_num, &items) {
            process.frames[idx].stack.push(value);
        }
        Ok(StepOutcome::Continue)
    }

    /// `perform:`/`perform:with:`: `items` is `[receiver, selector, ...
    /// fixed_args]`, matching the shape `send` already expects
    /// (receiver first, selector dispatched separately).
    fn primitive_perform(
        &mut self,
        process: &mut Process,
        items: Vec<Oop>,
        fixed_arg_count: usize,
    ) -> Result<StepOutcome, RuntimeError> {
        let receiver = items[0];
        let selector = items[1];
        let args = items[2..2 + fixed_arg_count].to_vec();
        let mut send_items = alloc::vec![receiver];
        send_items.extend(args);
        self.send(process, selector, send_items)
    }

    /// `perform:withArguments:`: the variable argument list arrives as
    /// a live `Array`, unpacked the same way `valueWithArguments:`
    /// already unpacks one for block activation.
    fn primitive_perform_with_arguments(
        &mut self,
        process: &mut Process,
        items: Vec<Oop>,
    ) -> Result<StepOutcome, RuntimeError> {
        let receiver = items[0];
        let selector = items[1];
        let args = self.unpack_array(items[2])?;
        let mut send_items = alloc::vec![receiver];
        send_items.extend(args);
        self.send(process, selector, send_items)
    }

    /// Build the activation for invoking a block (closure) with
    /// `args`, used both by ordinary `#value`-family sends and by the
    /// scheduler's synchronous block dispatch.
    fn invoke_block(&mut self, process: &mut Process, block: Oop, args: Vec<Oop>) -> Result<Frame, RuntimeError> {
        let defining_context = self.vm.objects.basic_at(block, block_layout::DEFINING_CONTEXT)?;
        if defining_context.is_nil() {
            return Err(RuntimeError::UnboundBlock);
        }
        let arg_count = self.vm.objects.basic_at(block, block_layout::ARGUMENT_COUNT)?.as_int().unwrap_or(0) as usize;
        let arg_location = self.vm.objects.basic_at(block, block_layout::ARGUMENT_LOCATION)?.as_int().unwrap_or(0) as usize;
        let bytecode_position =
            self.vm.objects.basic_at(block, block_layout::BYTECODE_POSITION)?.as_int().unwrap_or(0) as usize;
        if args.len() != arg_count {
            return Err(RuntimeError::ArityMismatch { expected: arg_count as u8, got: args.len() as u8 });
        }

        let (receiver, method, method_class, arguments, temporaries) = {
            let data = process.contexts.get(&defining_context).ok_or(RuntimeError::HomeContextGone)?;
            (data.receiver, data.method, data.method_class, Rc::clone(&data.arguments), Rc::clone(&data.temporaries))
        };
        {
            let mut temps = temporaries.borrow_mut();
            for (i, a) in args.into_iter().enumerate() {
                if let Some(slot) = temps.get_mut(arg_location + i) {
                    *slot = a;
                }
            }
        }

        let (bytecodes, literals) = method_bytecodes_and_literals(self.vm, method)?;
        Ok(Frame {
            receiver,
            method,
            method_class,
            bytecodes,
            literals,
            pc: bytecode_position,
            arguments,
            temporaries,
            stack: Vec::new(),
            is_block: true,
            home_context_oop: Some(defining_context),
            own_context_oop: None,
        })
    }

    /// `#value`, `#value:`, ... sends on a `Block` are special-cased
    /// ahead of ordinary method-dictionary lookup, since there is no
    /// bootstrap image installing real bytecode methods for them.
    /// Returns `Ok(None)` when the selector isn't one of these, so the
    /// caller falls back to a normal send (e.g. `printString`).
    fn try_block_send(
        &mut self,
        process: &mut Process,
        receiver: Oop,
        selector: Oop,
        args: &[Oop],
    ) -> Result<Option<StepOutcome>, RuntimeError> {
        let name = selector_name(self.vm, selector)?;
        let block_args = match (name.as_str(), args.len()) {
            ("value", 0) => Vec::new(),
            ("value:", 1) | ("value:value:", 2) | ("value:value:value:", 3) => args.to_vec(),
            ("valueWithArguments:", 1) => self.unpack_array(args[0])?,
            _ => return Ok(None),
        };
        let frame = self.invoke_block(process, receiver, block_args)?;
        process.frames.push(frame);
        Ok(Some(StepOutcome::Continue))
    }

    fn unpack_array(&self, array: Oop) -> Result<Vec<Oop>, RuntimeError> {
        let len = self.vm.objects.size_of(array)?.max(0) as usize;
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            items.push(self.vm.objects.basic_at(array, i)?);
        }
        Ok(items)
    }

    fn does_not_understand(
        &mut self,
        process: &mut Process,
        receiver: Oop,
        selector: Oop,
        args: Vec<Oop>,
    ) -> Result<StepOutcome, RuntimeError> {
        let Some(dnu_selector) = self.vm.well_known.does_not_understand else {
            return Err(RuntimeError::MessageNotUnderstood { selector });
        };
        let class = self.vm.class_of(receiver)?;
        let Some((method, _)) = self.vm.lookup_method(class, dnu_selector)? else {
            return Err(RuntimeError::MessageNotUnderstood { selector });
        };

        let args_array = self.vm.objects.alloc_object(NIL, args.len())?;
        self.vm.objects.incr(args_array);
        for (i, a) in args.iter().enumerate() {
            self.vm.objects.basic_at_put(args_array, i + 1, *a)?;
        }
        let message = self.vm.objects.alloc_object(NIL, 2)?;
        self.vm.objects.incr(message);
        self.vm.objects.basic_at_put(message, 1, selector)?;
        self.vm.objects.basic_at_put(message, 2, args_array)?;

        let frame = self.activate_method(method, receiver, alloc::vec![message])?;
        process.frames.push(frame);
        Ok(StepOutcome::Continue)
    }

    fn activate_method(&mut self, method: Oop, receiver: Oop, args: Vec<Oop>) -> Result<Frame, RuntimeError> {
        let selector = self.vm.objects.basic_at(method, method_layout::SELECTOR)?;
        let name = selector_name(self.vm, selector)?;
        let expected = arg_count_for_selector(&name);
        if args.len() != expected {
            return Err(RuntimeError::ArityMismatch { expected: expected as u8, got: args.len() as u8 });
        }
        build_method_frame(self.vm, method, receiver, args)
    }

    /// `items[0]` is the receiver, `items[1..]` the arguments - the
    /// shape every `Send*` path already pops off the stack in.
    fn send(&mut self, process: &mut Process, selector: Oop, mut items: Vec<Oop>) -> Result<StepOutcome, RuntimeError> {
        let via_super = core::mem::take(&mut self.pending_super);
        let receiver = items.remove(0);
        let args = items;

        if !via_super {
            if let Ok(class) = self.vm.class_of(receiver) {
                if self.vm.global("Block") == Some(class) {
                    if let Some(outcome) = self.try_block_send(process, receiver, selector, &args)? {
                        return Ok(outcome);
                    }
                }
            }
        }

        let start_class = if via_super {
            let current = process.frames.last().ok_or(RuntimeError::EmptyProcess)?;
            self.vm.objects.basic_at(current.method_class, class_layout::SUPERCLASS)?
        } else {
            self.vm.class_of(receiver)?
        };

        match self.vm.lookup_method(start_class, selector)? {
            Some((method, _)) => {
                let frame = self.activate_method(method, receiver, args)?;
                process.frames.push(frame);
                Ok(StepOutcome::Continue)
            }
            None => self.does_not_understand(process, receiver, selector, args),
        }
    }
}
