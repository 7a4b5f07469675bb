//! One-pass source-to-bytecode compiler (§4.D).
//!
//! There is no intermediate syntax tree: `Parser` holds a `Lexer` plus
//! one token of lookahead, and each grammar production calls straight
//! into a `&mut MethodBuilder` to emit bytecodes as it recognizes the
//! input. A block literal is compiled into a scratch buffer first and
//! held as `pending_block` until the token immediately following its
//! `]` is known - if that token is one of the inlineable control-flow
//! keywords (`ifTrue:`, `whileTrue:`, `and:`, ...), the scratch bytes
//! are spliced straight into the method as a branch; otherwise they
//! are wrapped as a real `Block` literal behind a skip `Branch`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::bytecode::{constant, emit, op, special};
use crate::object::ObjectMemoryError;
use crate::oop::{NIL, Oop};
use crate::platform::PrimitiveHost;
use crate::reader::{LexError, Lexer, Token};
use crate::vm::{Vm, block_layout, class_layout, method_layout};


/// A compile-time mistake. Collected rather than raised eagerly - a
/// method with several syntax errors reports all of them at once
/// (§7 "compile errors do not abort").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub selector: Option<Oop>,
    pub message: String,
    pub detail: String,
}

impl core::fmt::Display for CompileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.message, self.detail)
    }
}

/// A non-fatal compile-time observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileWarning {
    pub message: String,
    pub detail: String,
}

impl core::fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.message, self.detail)
    }
}

fn error(message: &str, detail: impl Into<String>) -> CompileError {
    CompileError { selector: None, message: message.to_string(), detail: detail.into() }
}

/// One resolved name, per the §4.D lookup order.
enum Binding {
    Receiver,
    Temporary(u8),
    Argument(u8),
    Instance(u8),
    Constant(u8),
    Global(String),
}

/// What `try_assignment` found at the start of an expression.
enum AssignOutcome {
    /// `name :=` was consumed; the caller still needs to compile the
    /// right-hand side and emit the store.
    Assignment(String),
    /// The leading name wasn't an assignment target; it has already
    /// been pushed and carried through the unary/binary send loops.
    AlreadyCompiled,
    /// The expression doesn't start with a bare name at all.
    NotApplicable,
}

/// A block literal compiled into a scratch buffer, not yet committed
/// to the method's bytecode stream - either spliced inline by a
/// control-flow optimization or finalized as a real `Block` object.
struct PendingBlock {
    arg_count: usize,
    arg_start: usize,
    body: Vec<u8>,
}

/// Mutable state threaded through one method's compilation.
pub struct MethodBuilder<'vm, H: PrimitiveHost> {
    vm: &'vm mut Vm<H>,
    class: Oop,
    arg_names: Vec<String>,
    temp_names: Vec<String>,
    instance_vars: Vec<String>,
    literals: Vec<Oop>,
    code: Vec<u8>,
    max_stack: usize,
    stack_depth: usize,
    pending_block: Option<PendingBlock>,
    pending_super: bool,
    /// How many real (non-inlined) block bodies are currently being
    /// compiled into the scratch buffer, so an explicit `^` knows
    /// whether it needs `BlockReturn`'s home-context unwind instead of
    /// a plain `StackReturn`. Inlined control-flow bodies (`ifTrue:`
    /// etc.) never bump this, since they share the enclosing method's
    /// activation at runtime.
    block_depth: usize,
    errors: Vec<CompileError>,
    #[allow(dead_code)]
    warnings: Vec<CompileWarning>,
}

impl<'vm, H: PrimitiveHost> MethodBuilder<'vm, H> {
    fn new(vm: &'vm mut Vm<H>, class: Oop) -> Self {
        let instance_vars = collect_instance_vars(vm, class);
        Self {
            vm,
            class,
            arg_names: Vec::new(),
            temp_names: Vec::new(),
            instance_vars,
            literals: Vec::new(),
            code: Vec::new(),
            max_stack: 0,
            stack_depth: 0,
            pending_block: None,
            pending_super: false,
            block_depth: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push_depth(&mut self, n: usize) {
        self.stack_depth += n;
        self.max_stack = self.max_stack.max(self.stack_depth);
    }

    fn pop_depth(&mut self, n: usize) {
        self.stack_depth = self.stack_depth.saturating_sub(n);
    }

    fn emit(&mut self, opcode: u8, operand: u8) {
        emit(&mut self.code, opcode, operand);
    }

    fn emit_branch(&mut self, sub_op: u8) -> usize {
        self.emit(op::DO_SPECIAL, sub_op);
        self.code.push(0);
        self.code.len() - 1
    }

    fn patch_branch_here(&mut self, patch_at: usize) -> Result<(), CompileError> {
        self.patch_branch_to(patch_at, self.code.len())
    }

    fn patch_branch_to(&mut self, patch_at: usize, target: usize) -> Result<(), CompileError> {
        if target > u8::MAX as usize {
            return Err(error("method too large", "branch target exceeds 255 bytecodes"));
        }
        self.code[patch_at] = target as u8;
        Ok(())
    }

    fn literal_index(&mut self, oop: Oop) -> Result<u8, CompileError> {
        if let Some(i) = self.literals.iter().position(|&l| l == oop) {
            return u8::try_from(i).map_err(|_| error("method too large", "literal frame overflow"));
        }
        self.vm.objects.incr(oop);
        self.literals.push(oop);
        u8::try_from(self.literals.len() - 1)
            .map_err(|_| error("method too large", "literal frame overflow"))
    }

    fn intern(&mut self, name: &str) -> Result<Oop, CompileError> {
        self.vm
            .symbols
            .intern(&mut self.vm.objects, name)
            .map_err(|e| error("out of memory", object_error_detail(e)))
    }

    fn resolve(&self, name: &str) -> Binding {
        if name == "self" || name == "super" {
            return Binding::Receiver;
        }
        if let Some(i) = self.temp_names.iter().rposition(|n| n == name) {
            return Binding::Temporary(i as u8);
        }
        if let Some(i) = self.arg_names.iter().position(|n| n == name) {
            return Binding::Argument(i as u8 + 1);
        }
        if let Some(i) = self.instance_vars.iter().position(|n| n == name) {
            return Binding::Instance(i as u8 + 1);
        }
        match name {
            "nil" => Binding::Constant(constant::NIL),
            "true" => Binding::Constant(constant::TRUE),
            "false" => Binding::Constant(constant::FALSE),
            _ => Binding::Global(name.to_string()),
        }
    }

    fn push_name(&mut self, name: &str) -> Result<(), CompileError> {
        if name == "super" {
            self.pending_super = true;
        }
        match self.resolve(name) {
            Binding::Receiver => {
                self.emit(op::PUSH_ARGUMENT, 0);
                self.push_depth(1);
            }
            Binding::Temporary(i) => {
                self.emit(op::PUSH_TEMPORARY, i);
                self.push_depth(1);
            }
            Binding::Argument(i) => {
                self.emit(op::PUSH_ARGUMENT, i);
                self.push_depth(1);
            }
            Binding::Instance(i) => {
                self.emit(op::PUSH_INSTANCE, i);
                self.push_depth(1);
            }
            Binding::Constant(id) => {
                self.emit(op::PUSH_CONSTANT, id);
                self.push_depth(1);
            }
            Binding::Global(name) => {
                // Late-bound global lookup: push the name as a symbol
                // literal and send `value` (§4.D step 6).
                let sym = self.intern(&name)?;
                self.push_literal(sym)?;
                self.send_unary("value")?;
            }
        }
        Ok(())
    }

    fn push_literal(&mut self, oop: Oop) -> Result<(), CompileError> {
        let idx = self.literal_index(oop)?;
        self.emit(op::PUSH_LITERAL, idx);
        self.push_depth(1);
        Ok(())
    }

    fn push_small_int(&mut self, n: isize) -> Result<(), CompileError> {
        let id = match n {
            -1 => Some(constant::MINUS_ONE),
            0 => Some(constant::ZERO),
            1 => Some(constant::ONE),
            2 => Some(constant::TWO),
            _ => None,
        };
        match id {
            Some(id) => {
                self.emit(op::PUSH_CONSTANT, id);
                self.push_depth(1);
                Ok(())
            }
            None => self.push_literal(Oop::int(n)),
        }
    }

    fn assign_name(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name) {
            Binding::Temporary(i) => {
                self.emit(op::ASSIGN_TEMPORARY, i);
                Ok(())
            }
            Binding::Instance(i) => {
                self.emit(op::ASSIGN_INSTANCE, i);
                Ok(())
            }
            _ => Err(error("bad assignment target", name)),
        }
    }

    fn maybe_send_to_super(&mut self) {
        if self.pending_super {
            self.emit(op::DO_SPECIAL, special::SEND_TO_SUPER);
            self.pending_super = false;
        }
    }

    /// `arg_count` includes the receiver (§4.D `MarkArguments N`).
    fn send_keyword(&mut self, selector: &str, arg_count: usize) -> Result<(), CompileError> {
        self.maybe_send_to_super();
        let sym = self.intern(selector)?;
        let idx = self.literal_index(sym)?;
        self.emit(op::SEND_MESSAGE, idx);
        self.pop_depth(arg_count);
        self.push_depth(1);
        Ok(())
    }

    fn send_unary(&mut self, selector: &str) -> Result<(), CompileError> {
        if let Some(i) = crate::symbol::SymbolTable::unary_index(selector) {
            self.maybe_send_to_super();
            self.emit(op::SEND_UNARY, i);
            self.pop_depth(1);
            self.push_depth(1);
            Ok(())
        } else {
            self.mark_arguments(1)?;
            self.send_keyword(selector, 1)
        }
    }

    fn send_binary(&mut self, selector: &str) -> Result<(), CompileError> {
        if let Some(i) = crate::symbol::SymbolTable::binary_index(selector) {
            self.maybe_send_to_super();
            self.emit(op::SEND_BINARY, i);
            self.pop_depth(2);
            self.push_depth(1);
            Ok(())
        } else {
            self.mark_arguments(2)?;
            self.send_keyword(selector, 2)
        }
    }

    fn mark_arguments(&mut self, n: usize) -> Result<(), CompileError> {
        let n = u8::try_from(n).map_err(|_| error("too many arguments", n.to_string()))?;
        self.emit(op::MARK_ARGUMENTS, n);
        Ok(())
    }

    /// Commits a still-pending block as a real `Block` literal: a
    /// skip `Branch` around the scratch body, pushed as a literal.
    /// No-op if nothing is pending.
    fn finalize_pending(&mut self) -> Result<(), CompileError> {
        let Some(pending) = self.pending_block.take() else {
            return Ok(());
        };
        let skip = self.emit_branch(special::BRANCH);
        let body_position = self.code.len();
        self.code.extend_from_slice(&pending.body);
        self.patch_branch_here(skip)?;
        let block = alloc_block_template(
            self.vm,
            u8::try_from(pending.arg_count)
                .map_err(|_| error("too many block parameters", pending.arg_count.to_string()))?,
            u8::try_from(pending.arg_start)
                .map_err(|_| error("method too large", "temporary table overflow"))?,
            u8::try_from(body_position)
                .map_err(|_| error("method too large", "block body past byte 255"))?,
        )
        .map_err(|e| error("out of memory", object_error_detail(e)))?;
        self.push_literal(block)?;
        // Primitive 29 combines the template with the live context to
        // produce a closure; stack-neutral (pops the template, pushes
        // the closure), so no depth bookkeeping beyond push_literal's.
        self.emit(op::DO_PRIMITIVE, 1);
        self.code.push(29);
        Ok(())
    }
}

fn object_error_detail(e: ObjectMemoryError) -> String {
    alloc::format!("{e}")
}

/// Instance variable names, root class downward, so inherited slots
/// sort first (§4.D step 4).
fn collect_instance_vars<H: PrimitiveHost>(vm: &Vm<H>, class: Oop) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = class;
    while !current.is_nil() {
        chain.push(current);
        current = vm.objects.basic_at(current, class_layout::SUPERCLASS).unwrap_or(NIL);
    }
    let mut names = Vec::new();
    for &class in chain.iter().rev() {
        let Ok(vars) = vm.objects.basic_at(class, class_layout::VARIABLES) else { continue };
        let Ok(count) = vm.objects.size_of(vars) else { continue };
        for i in 1..=count.max(0) as usize {
            if let Ok(name_oop) = vm.objects.basic_at(vars, i) {
                if let Some(s) = read_string(vm, name_oop) {
                    names.push(s);
                }
            }
        }
    }
    names
}

fn read_string<H: PrimitiveHost>(vm: &Vm<H>, oop: Oop) -> Option<String> {
    let len = vm.objects.size_of(oop).ok()?;
    if len >= 0 {
        return None;
    }
    let len = (-len) as usize;
    let mut bytes = Vec::with_capacity(len);
    for i in 1..=len {
        bytes.push(vm.objects.byte_at(oop, i).ok()?);
    }
    String::from_utf8(bytes).ok()
}

/// Token-stream wrapper: a `Lexer` plus one token of lookahead,
/// matching the teacher's reader parser shape.
struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { lexer: Lexer::new(input), lookahead: None }
    }

    fn peek(&mut self) -> Result<&Token, LexError> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.lexer.next_token()?);
        }
        Ok(self.lookahead.as_ref().unwrap())
    }

    fn advance(&mut self) -> Result<Token, LexError> {
        match self.lookahead.take() {
            Some(t) => Ok(t),
            None => self.lexer.next_token(),
        }
    }

    fn at_binary(&mut self, s: &str) -> bool {
        matches!(self.peek(), Ok(Token::Binary(b)) if b == s)
    }

    fn at_closing(&mut self, c: char) -> bool {
        matches!(self.peek(), Ok(Token::Closing(cl)) if *cl == c)
    }

    fn at_keyword(&mut self, s: &str) -> bool {
        matches!(self.peek(), Ok(Token::NameColon(k)) if k == s)
    }
}

impl<H: PrimitiveHost> MethodBuilder<'_, H> {
    fn parse_temporaries(&mut self, p: &mut Parser) -> Result<Vec<String>, CompileError> {
        if !p.at_binary("|") {
            return Ok(Vec::new());
        }
        p.advance().map_err(lex_err)?;
        let mut names = Vec::new();
        loop {
            match p.peek().map_err(lex_err)?.clone() {
                Token::NameConst(name) => {
                    p.advance().map_err(lex_err)?;
                    names.push(name);
                }
                Token::Binary(b) if b == "|" => {
                    p.advance().map_err(lex_err)?;
                    break;
                }
                other => return Err(error("malformed temporaries", format_token(&other))),
            }
        }
        Ok(names)
    }

    /// Parses the method's message pattern, filling `arg_names`.
    fn parse_pattern(&mut self, p: &mut Parser) -> Result<String, CompileError> {
        let first = p.advance().map_err(lex_err)?;
        match first {
            Token::NameColon(part) => {
                let mut selector = part;
                loop {
                    match p.advance().map_err(lex_err)? {
                        Token::NameConst(arg) => self.arg_names.push(arg),
                        other => return Err(error("expected argument name", format_token(&other))),
                    }
                    match p.peek().map_err(lex_err)?.clone() {
                        Token::NameColon(part) => {
                            p.advance().map_err(lex_err)?;
                            selector.push_str(&part);
                        }
                        _ => break,
                    }
                }
                Ok(selector)
            }
            Token::Binary(op) if !matches!(op.as_str(), "(" | "[" | ":" | "^") => {
                match p.advance().map_err(lex_err)? {
                    Token::NameConst(arg) => self.arg_names.push(arg),
                    other => return Err(error("expected argument name", format_token(&other))),
                }
                Ok(op)
            }
            Token::NameConst(name) => Ok(name),
            other => Err(error("malformed message pattern", format_token(&other))),
        }
    }

    /// Returns `true` if the last statement compiled was an explicit
    /// `^` return (so its value is already handled and the caller
    /// need not append one of its own).
    fn compile_statements(
        &mut self,
        p: &mut Parser,
        terminator: impl Fn(&Token) -> bool,
        implicit_self_return: bool,
    ) -> Result<bool, CompileError> {
        let mut last_was_return = false;
        loop {
            let tok = p.peek().map_err(lex_err)?.clone();
            if terminator(&tok) {
                break;
            }
            last_was_return = self.compile_statement(p)?;
            if !last_was_return {
                self.pop_depth(1);
                self.emit(op::DO_SPECIAL, special::POP_TOP);
            }
            if p.at_closing('.') {
                p.advance().map_err(lex_err)?;
            } else {
                break;
            }
        }
        if implicit_self_return && !last_was_return {
            self.emit(op::DO_SPECIAL, special::SELF_RETURN);
            last_was_return = true;
        }
        Ok(last_was_return)
    }

    /// Returns `true` if the statement was an explicit `^` return.
    fn compile_statement(&mut self, p: &mut Parser) -> Result<bool, CompileError> {
        if p.at_binary("^") {
            p.advance().map_err(lex_err)?;
            self.compile_expression(p)?;
            self.finalize_pending()?;
            let sub_op = if self.block_depth > 0 {
                special::BLOCK_RETURN
            } else {
                special::STACK_RETURN
            };
            self.emit(op::DO_SPECIAL, sub_op);
            self.pop_depth(1);
            return Ok(true);
        }
        self.compile_expression(p)?;
        self.finalize_pending()?;
        Ok(false)
    }

    /// An expression is a binary-precedence receiver optionally
    /// followed by a keyword message send or assignment. A variable
    /// reference directly followed by `:=` or `_` is an assignment,
    /// not a send.
    fn compile_expression(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        match self.try_assignment(p)? {
            AssignOutcome::Assignment(target) => {
                self.compile_expression(p)?;
                self.finalize_pending()?;
                self.assign_name(&target)?;
                return Ok(());
            }
            AssignOutcome::AlreadyCompiled => {}
            AssignOutcome::NotApplicable => self.compile_binary_expression(p)?,
        }

        let Token::NameColon(first_part) = p.peek().map_err(lex_err)?.clone() else {
            return Ok(());
        };
        p.advance().map_err(lex_err)?;

        if self.pending_block.is_some() && self.try_compile_inline(p, &first_part)? {
            return Ok(());
        }
        self.finalize_pending()?;
        self.compile_keyword_tail(p, first_part)
    }

    /// Recognizes `name :=` ahead without consuming `name` unless it
    /// really is an assignment. Since one token of lookahead isn't
    /// enough to see past `name` to `:=`, a name that turns out not to
    /// be an assignment target is pushed and carried through the
    /// unary/binary loops right here - the caller must not compile a
    /// binary expression again in that case.
    fn try_assignment(&mut self, p: &mut Parser) -> Result<AssignOutcome, CompileError> {
        let Token::NameConst(name) = p.peek().map_err(lex_err)?.clone() else {
            return Ok(AssignOutcome::NotApplicable);
        };
        p.advance().map_err(lex_err)?;
        if p.at_binary(":=") {
            p.advance().map_err(lex_err)?;
            return Ok(AssignOutcome::Assignment(name));
        }
        self.push_name(&name)?;
        self.continue_unary(p)?;
        self.continue_binary(p)?;
        Ok(AssignOutcome::AlreadyCompiled)
    }

    fn compile_keyword_tail(&mut self, p: &mut Parser, first_part: String) -> Result<(), CompileError> {
        let mut selector = first_part;
        let mut arg_count = 1usize;
        self.compile_binary_expression(p)?;
        self.finalize_pending()?;
        arg_count += 1;
        loop {
            match p.peek().map_err(lex_err)?.clone() {
                Token::NameColon(part) => {
                    p.advance().map_err(lex_err)?;
                    selector.push_str(&part);
                    self.compile_binary_expression(p)?;
                    self.finalize_pending()?;
                    arg_count += 1;
                }
                _ => break,
            }
        }
        self.mark_arguments(arg_count)?;
        self.send_keyword(&selector, arg_count)
    }

    /// Recognizes the optimizable control-flow selectors when the
    /// receiver is a not-yet-finalized block literal. `first_part` is
    /// only ever the first keyword part (e.g. `"ifTrue:"`); the
    /// combined `ifTrue:ifFalse:`/`ifFalse:ifTrue:` forms are
    /// recognized by peeking for the matching second part once the
    /// first branch is compiled. Returns `true` if handled (the
    /// pending block is consumed either way); `false` means the
    /// caller must finalize the receiver and fall back to an ordinary
    /// keyword send starting with `first_part`.
    fn try_compile_inline(&mut self, p: &mut Parser, first_part: &str) -> Result<bool, CompileError> {
        match first_part {
            "ifTrue:" | "ifFalse:" => {
                if !p.at_binary("[") {
                    return Ok(false);
                }
                let condition = self.pending_block.take().expect("checked by caller");
                self.splice_condition(condition)?;
                let is_if_true = first_part == "ifTrue:";
                let other_part = if is_if_true { "ifFalse:" } else { "ifTrue:" };
                let branch_to_other = if is_if_true {
                    self.emit_branch(special::BRANCH_IF_FALSE)
                } else {
                    self.emit_branch(special::BRANCH_IF_TRUE)
                };
                self.pop_depth(1);
                self.compile_inline_block_body(p)?;
                let skip_other = self.emit_branch(special::BRANCH);
                self.patch_branch_here(branch_to_other)?;
                if p.at_keyword(other_part) {
                    p.advance().map_err(lex_err)?;
                    self.compile_inline_block_body(p)?;
                } else {
                    self.emit(op::PUSH_CONSTANT, constant::NIL);
                    self.push_depth(1);
                }
                self.patch_branch_here(skip_other)?;
                Ok(true)
            }
            "whileTrue:" => {
                if !p.at_binary("[") {
                    return Ok(false);
                }
                let condition = self.pending_block.take().expect("checked by caller");
                let loop_start = self.code.len();
                self.code.extend_from_slice(&condition.body);
                self.push_depth(1);
                let branch_out = self.emit_branch(special::BRANCH_IF_FALSE);
                self.pop_depth(1);
                self.compile_inline_block_body(p)?;
                self.pop_depth(1);
                self.emit(op::DO_SPECIAL, special::POP_TOP);
                let back = self.emit_branch(special::BRANCH);
                self.patch_branch_to(back, loop_start)?;
                self.patch_branch_here(branch_out)?;
                self.emit(op::PUSH_CONSTANT, constant::NIL);
                self.push_depth(1);
                Ok(true)
            }
            "and:" => {
                let condition = self.pending_block.take().expect("checked by caller");
                self.splice_condition(condition)?;
                if !p.at_binary("[") {
                    return Err(error("and: expects a block argument", first_part));
                }
                let branch_short = self.emit_branch(special::AND_BRANCH);
                self.compile_inline_block_body(p)?;
                self.patch_branch_here(branch_short)?;
                Ok(true)
            }
            "or:" => {
                let condition = self.pending_block.take().expect("checked by caller");
                self.splice_condition(condition)?;
                if !p.at_binary("[") {
                    return Err(error("or: expects a block argument", first_part));
                }
                let branch_short = self.emit_branch(special::OR_BRANCH);
                self.compile_inline_block_body(p)?;
                self.patch_branch_here(branch_short)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Splices a pending block's scratch body directly into the
    /// method's code stream as a plain boolean-producing expression
    /// (used for `ifTrue:`/`ifFalse:`/`and:`/`or:` receivers, which
    /// are evaluated exactly once, unlike `whileTrue:`'s condition).
    fn splice_condition(&mut self, condition: PendingBlock) -> Result<(), CompileError> {
        self.code.extend_from_slice(&condition.body);
        self.push_depth(1);
        Ok(())
    }

    fn compile_inline_block_body(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        expect_binary(p, "[")?;
        self.compile_statements(p, |t| matches!(t, Token::Closing(']')), false)?;
        expect_closing(p, ']')?;
        Ok(())
    }

    fn compile_binary_expression(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        self.compile_unary_expression(p)?;
        self.continue_binary(p)
    }

    /// The binary-send loop, factored out so `try_assignment` can
    /// resume it (after `continue_unary`) on a receiver it already
    /// pushed itself.
    fn continue_binary(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        loop {
            let Token::Binary(op) = p.peek().map_err(lex_err)?.clone() else { break };
            if matches!(op.as_str(), "[" | "(" | ":" | ":=" | "|" | "^") {
                break;
            }
            self.finalize_pending()?;
            p.advance().map_err(lex_err)?;
            self.compile_unary_expression(p)?;
            self.finalize_pending()?;
            self.send_binary(&op)?;
        }
        Ok(())
    }

    fn compile_unary_expression(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        self.compile_primary(p)?;
        self.continue_unary(p)
    }

    /// The unary-send loop, factored out so `try_assignment` can
    /// resume it on a receiver it already pushed itself.
    fn continue_unary(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        loop {
            match p.peek().map_err(lex_err)?.clone() {
                Token::NameConst(name) => {
                    self.finalize_pending()?;
                    p.advance().map_err(lex_err)?;
                    self.send_unary(&name)?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn compile_primary(&mut self, p: &mut Parser) -> Result<(), CompileError> {
        match p.advance().map_err(lex_err)? {
            Token::NameConst(name) => self.push_name(&name)?,
            Token::IntConst(n) => self.push_small_int(n as isize)?,
            Token::FloatConst(f) => {
                let oop = alloc_float(self.vm, f).map_err(|e| error("out of memory", object_error_detail(e)))?;
                self.push_literal(oop)?;
            }
            Token::CharConst(c) => {
                let oop = alloc_char(self.vm, c).map_err(|e| error("out of memory", object_error_detail(e)))?;
                self.push_literal(oop)?;
            }
            Token::StrConst(s) => {
                let class = self.vm.global("String").unwrap_or(NIL);
                let oop = self
                    .vm
                    .objects
                    .alloc_str(class, &s)
                    .map_err(|e| error("out of memory", object_error_detail(e)))?;
                self.push_literal(oop)?;
            }
            Token::SymConst(s) => {
                let sym = self.intern(&s)?;
                self.push_literal(sym)?;
            }
            Token::ArrayBegin => {
                let array = self.build_literal_array(p)?;
                self.push_literal(array)?;
            }
            Token::Binary(b) if b == "(" => {
                self.compile_expression(p)?;
                self.finalize_pending()?;
                expect_closing(p, ')')?;
            }
            Token::Binary(b) if b == "[" => {
                self.pending_block = Some(self.compile_pending_block(p)?);
            }
            other => return Err(error("unexpected token", format_token(&other))),
        }
        Ok(())
    }

    fn build_literal_array(&mut self, p: &mut Parser) -> Result<Oop, CompileError> {
        let class = self.vm.global("Array").unwrap_or(NIL);
        let mut elements = Vec::new();
        loop {
            if p.at_closing(')') {
                p.advance().map_err(lex_err)?;
                break;
            }
            elements.push(self.literal_array_element(p)?);
        }
        let array = self
            .vm
            .objects
            .alloc_object(class, elements.len())
            .map_err(|e| error("out of memory", object_error_detail(e)))?;
        self.vm.objects.incr(array);
        for (i, value) in elements.into_iter().enumerate() {
            self.vm
                .objects
                .basic_at_put(array, i + 1, value)
                .map_err(|e| error("out of memory", object_error_detail(e)))?;
        }
        Ok(array)
    }

    fn literal_array_element(&mut self, p: &mut Parser) -> Result<Oop, CompileError> {
        match p.advance().map_err(lex_err)? {
            Token::NameConst(name) => self.intern(&name),
            Token::NameColon(part) => self.intern(&part),
            Token::SymConst(s) => self.intern(&s),
            Token::IntConst(n) => Ok(Oop::int(n as isize)),
            Token::FloatConst(f) => alloc_float(self.vm, f).map_err(|e| error("out of memory", object_error_detail(e))),
            Token::CharConst(c) => alloc_char(self.vm, c).map_err(|e| error("out of memory", object_error_detail(e))),
            Token::StrConst(s) => {
                let class = self.vm.global("String").unwrap_or(NIL);
                self.vm
                    .objects
                    .alloc_str(class, &s)
                    .map_err(|e| error("out of memory", object_error_detail(e)))
            }
            Token::ArrayBegin => self.build_literal_array(p),
            Token::Binary(b) => self.intern(&b),
            other => Err(error("malformed literal array element", format_token(&other))),
        }
    }

    /// Compiles a block's parameter list and body into a scratch
    /// buffer without touching the method's main code stream.
    fn compile_pending_block(&mut self, p: &mut Parser) -> Result<PendingBlock, CompileError> {
        let arg_start = self.temp_names.len();
        let mut arg_count = 0usize;
        if p.at_binary(":") {
            loop {
                if !p.at_binary(":") {
                    break;
                }
                p.advance().map_err(lex_err)?;
                match p.advance().map_err(lex_err)? {
                    Token::NameConst(name) => {
                        self.temp_names.push(name);
                        arg_count += 1;
                    }
                    other => return Err(error("expected block parameter", format_token(&other))),
                }
            }
            expect_binary(p, "|")?;
        }

        let saved_code = core::mem::take(&mut self.code);
        self.block_depth += 1;
        let last_was_return = self.compile_statements(p, |t| matches!(t, Token::Closing(']')), false);
        self.block_depth -= 1;
        let last_was_return = last_was_return?;
        if !last_was_return {
            self.emit(op::DO_SPECIAL, special::STACK_RETURN);
            self.pop_depth(1);
        }
        expect_closing(p, ']')?;
        let body = core::mem::replace(&mut self.code, saved_code);
        Ok(PendingBlock { arg_count, arg_start, body })
    }

    /// Builds the final `Method` object from the accumulated state.
    fn finish(self, selector: Oop, source: &str) -> Result<Oop, Vec<CompileError>> {
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        macro_rules! try_alloc {
            ($expr:expr) => {
                match $expr {
                    Ok(v) => v,
                    Err(e) => return Err(alloc::vec![error("out of memory", object_error_detail(e))]),
                }
            };
        }

        let bytecodes = try_alloc!(self.vm.objects.alloc_byte(NIL, self.code.len()));
        for (i, &byte) in self.code.iter().enumerate() {
            let _ = self.vm.objects.byte_at_put(bytecodes, i + 1, byte);
        }
        self.vm.objects.incr(bytecodes);

        let literals = try_alloc!(self.vm.objects.alloc_object(NIL, self.literals.len()));
        self.vm.objects.incr(literals);
        for (i, &lit) in self.literals.iter().enumerate() {
            let _ = self.vm.objects.basic_at_put(literals, i + 1, lit);
        }

        let text = try_alloc!(self.vm.objects.alloc_str(NIL, source));
        self.vm.objects.incr(text);

        let method = try_alloc!(self.vm.objects.alloc_object(NIL, method_layout::INSTANCE_SLOT_COUNT));
        self.vm.objects.incr(method);
        let _ = self.vm.objects.basic_at_put(method, method_layout::TEXT, text);
        let _ = self.vm.objects.basic_at_put(method, method_layout::SELECTOR, selector);
        let _ = self.vm.objects.basic_at_put(method, method_layout::BYTECODES, bytecodes);
        let _ = self.vm.objects.basic_at_put(method, method_layout::LITERALS, literals);
        let _ =
            self.vm.objects.basic_at_put(method, method_layout::STACK_SIZE, Oop::int(self.max_stack as isize));
        let _ = self.vm.objects.basic_at_put(
            method,
            method_layout::TEMPORARY_SIZE,
            Oop::int(self.temp_names.len() as isize),
        );
        let _ = self.vm.objects.basic_at_put(method, method_layout::METHOD_CLASS, self.class);
        Ok(method)
    }
}

fn alloc_float<H: PrimitiveHost>(vm: &mut Vm<H>, value: f64) -> Result<Oop, ObjectMemoryError> {
    let class = vm.global("Float").unwrap_or(NIL);
    let bytes = value.to_ne_bytes();
    let oop = vm.objects.alloc_byte(class, bytes.len())?;
    for (i, &b) in bytes.iter().enumerate() {
        vm.objects.byte_at_put(oop, i + 1, b)?;
    }
    Ok(oop)
}

fn alloc_char<H: PrimitiveHost>(vm: &mut Vm<H>, c: char) -> Result<Oop, ObjectMemoryError> {
    let class = vm.global("Char").unwrap_or(NIL);
    let oop = vm.objects.alloc_byte(class, 1)?;
    vm.objects.byte_at_put(oop, 1, c as u8)?;
    Ok(oop)
}

fn alloc_block_template<H: PrimitiveHost>(
    vm: &mut Vm<H>,
    arg_count: u8,
    arg_location: u8,
    bytecode_position: u8,
) -> Result<Oop, ObjectMemoryError> {
    let class = vm.global("Block").unwrap_or(NIL);
    let block = vm.objects.alloc_object(class, block_layout::INSTANCE_SLOT_COUNT)?;
    vm.objects.basic_at_put(block, block_layout::ARGUMENT_COUNT, Oop::int(arg_count as isize))?;
    vm.objects.basic_at_put(block, block_layout::ARGUMENT_LOCATION, Oop::int(arg_location as isize))?;
    vm.objects.basic_at_put(block, block_layout::BYTECODE_POSITION, Oop::int(bytecode_position as isize))?;
    Ok(block)
}

fn lex_err(e: LexError) -> CompileError {
    error("lexical error", alloc::format!("{e}"))
}

fn format_token(t: &Token) -> String {
    alloc::format!("{t:?}")
}

fn expect_binary(p: &mut Parser, s: &str) -> Result<(), CompileError> {
    match p.advance().map_err(lex_err)? {
        Token::Binary(b) if b == s => Ok(()),
        other => Err(error("expected token", alloc::format!("'{s}', got {}", format_token(&other)))),
    }
}

fn expect_closing(p: &mut Parser, c: char) -> Result<(), CompileError> {
    match p.advance().map_err(lex_err)? {
        Token::Closing(cl) if cl == c => Ok(()),
        other => Err(error("expected token", alloc::format!("'{c}', got {}", format_token(&other)))),
    }
}

/// Compiles one method's source text against `class`'s instance
/// variables, returning a fully-formed `Method` object (§3 layout) or
/// the collected syntax errors.
///
/// # Errors
/// Returns every `CompileError` encountered; does not abort on the
/// first one (§7).
pub fn compile_method<H: PrimitiveHost>(
    vm: &mut Vm<H>,
    class: Oop,
    source: &str,
) -> Result<Oop, Vec<CompileError>> {
    let mut builder = MethodBuilder::new(vm, class);
    let mut parser = Parser::new(source);

    let selector_text = match builder.parse_pattern(&mut parser) {
        Ok(s) => s,
        Err(e) => {
            builder.errors.push(e);
            return Err(builder.errors);
        }
    };

    match builder.parse_temporaries(&mut parser) {
        Ok(names) => builder.temp_names.extend(names),
        Err(e) => builder.errors.push(e),
    }

    if builder.errors.is_empty() {
        if let Err(e) = builder.compile_statements(&mut parser, |t| matches!(t, Token::InputEnd), true) {
            builder.errors.push(e);
        }
    }

    if !builder.errors.is_empty() {
        return Err(builder.errors);
    }

    let selector = match builder.intern(&selector_text) {
        Ok(s) => s,
        Err(e) => return Err(alloc::vec![e]),
    };
    builder.finish(selector, source)
}
