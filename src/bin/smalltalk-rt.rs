// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Host shell for the Smalltalk virtual machine (§6).
//!
//! This binary owns argument parsing, file-to-bytes plumbing, a
//! stdio-backed `Platform` impl, and exit-code mapping. Every other
//! decision - how an image is laid out, how a method compiles, how a
//! process steps - lives in the library crate; this file never
//! touches `ObjectTable`/`Interpreter` internals directly.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use smalltalk_rt::compiler::CompileError;
use smalltalk_rt::image::{self, ImageError};
use smalltalk_rt::interpreter::{ExecResult, Interpreter, Process, RuntimeError};
use smalltalk_rt::object::ObjectTable;
use smalltalk_rt::oop::{NIL, Oop, OopValue};
use smalltalk_rt::platform::{NullPrimitiveHost, Platform};
use smalltalk_rt::vm::{BootstrapError, Vm};
use smalltalk_rt::{FatalError, ObjectMemoryError};

/// Step budget for `run`: generous enough for any realistic doit, but
/// finite so a runaway loop reports rather than hangs the shell.
const MAX_STEPS: usize = 10_000_000;

/// Default object-table capacity for a freshly bootstrapped image.
const TABLE_CAPACITY: usize = 1 << 20;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let mut platform = StdioPlatform::new();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.as_fatal() {
                Some(fatal) => fatal.report(&mut platform),
                None => eprint!("{e}"),
            }
            e.code()
        }
    }
}

/// The shell's own error taxonomy, distinct from the library's
/// per-domain error types (§7): it exists only to attach an exit code
/// and to decide whether a failure is "fatal" (reported through
/// `Platform`/`FatalError`, matching library-level VM failures) or an
/// ordinary CLI diagnostic (bad arguments, a file that doesn't exist,
/// collected compile errors - conditions the shell itself detects
/// before, or instead of, asking the VM to run anything).
enum ShellError {
    Usage(String),
    Io(String),
    Image(ImageError),
    Bootstrap(BootstrapError),
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
    MissingDoit,
}

impl ShellError {
    fn code(&self) -> ExitCode {
        match self {
            Self::Usage(_) => ExitCode::from(64),
            Self::Io(_) => ExitCode::from(66),
            Self::Image(_) | Self::Bootstrap(_) => ExitCode::from(65),
            Self::Compile(_) => ExitCode::from(70),
            Self::Runtime(_) | Self::MissingDoit => ExitCode::from(1),
        }
    }

    /// Library-surfaced VM failures map to `FatalError` per §7; shell-
    /// level problems (bad arguments, a missing file, collected
    /// compile diagnostics) are reported as ordinary text instead.
    fn as_fatal(&self) -> Option<FatalError> {
        match self {
            Self::Image(e) => Some(FatalError::new("image", e.to_string())),
            Self::Bootstrap(e) => Some(FatalError::new("bootstrap", e.to_string())),
            Self::Runtime(e) => Some(FatalError::new("interpreter", e.to_string())),
            Self::MissingDoit => Some(FatalError::new("run", "no 'doit' global bound to a method")),
            Self::Usage(_) | Self::Io(_) | Self::Compile(_) => None,
        }
    }
}

impl core::fmt::Display for ShellError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Usage(msg) => writeln!(f, "usage: {msg}"),
            Self::Io(msg) => writeln!(f, "io error: {msg}"),
            Self::Image(e) => writeln!(f, "{e}"),
            Self::Bootstrap(e) => writeln!(f, "{e}"),
            Self::Compile(errors) => {
                for e in errors {
                    writeln!(f, "compile error: {e}")?;
                }
                Ok(())
            }
            Self::Runtime(e) => writeln!(f, "runtime error: {e}"),
            Self::MissingDoit => writeln!(f, "image has no 'doit' global bound to a method"),
        }
    }
}

impl From<ImageError> for ShellError {
    fn from(e: ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<BootstrapError> for ShellError {
    fn from(e: BootstrapError) -> Self {
        Self::Bootstrap(e)
    }
}

impl From<RuntimeError> for ShellError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl From<ObjectMemoryError> for ShellError {
    fn from(e: ObjectMemoryError) -> Self {
        Self::Runtime(RuntimeError::from(e))
    }
}

fn run(args: &[String]) -> Result<(), ShellError> {
    match args.get(1).map(String::as_str) {
        Some("run") => {
            let path = args.get(2).ok_or_else(usage)?;
            run_image(Path::new(path))
        }
        Some("compile") => {
            let source_path = args.get(2).ok_or_else(usage)?;
            let image_in = args.get(3).ok_or_else(usage)?;
            let image_out = args.get(4).ok_or_else(usage)?;
            compile_into_image(Path::new(source_path), Path::new(image_in), Path::new(image_out))
        }
        _ => Err(usage()),
    }
}

fn usage() -> ShellError {
    ShellError::Usage("smalltalk-rt run <image>  |  smalltalk-rt compile <source.st> <image-in> <image-out>".into())
}

fn read_file(path: &Path) -> Result<Vec<u8>, ShellError> {
    fs::read(path).map_err(|e| ShellError::Io(io_context(path, &e)))
}

fn io_context(path: &Path, e: &io::Error) -> String {
    format!("{}: {e}", path.display())
}

/// A sibling `<path>.payload` file marks a split-format image; its
/// absence means `path` is a monolithic image (§6).
fn load_image(path: &Path) -> Result<(ObjectTable, Oop), ShellError> {
    let payload_path = sibling_payload_path(path);
    if payload_path.is_file() {
        let headers = read_file(path)?;
        let payload = read_file(&payload_path)?;
        Ok(image::decode_split(&headers, &payload, TABLE_CAPACITY)?)
    } else {
        let bytes = read_file(path)?;
        Ok(image::decode_monolithic(&bytes, TABLE_CAPACITY)?)
    }
}

fn sibling_payload_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".payload");
    path.with_file_name(name)
}

fn run_image(path: &Path) -> Result<(), ShellError> {
    let (objects, root) = load_image(path)?;
    let mut vm = Vm::bootstrap(objects, root, NullPrimitiveHost)?;
    let doit = vm.global("doit").ok_or(ShellError::MissingDoit)?;

    let mut process = Process::new();
    process.activate(&mut vm, doit, NIL, Vec::new())?;

    let mut interpreter = Interpreter::new(&mut vm);
    match interpreter.execute(&mut process, MAX_STEPS)? {
        ExecResult::Finished(value) => {
            print_result(&vm, value);
            Ok(())
        }
        ExecResult::Runnable => {
            eprintln!("doit did not finish within {MAX_STEPS} steps");
            Ok(())
        }
    }
}

/// Print a doit's result the way a Smalltalk console would: a
/// `String` prints as its literal text; everything else prints as its
/// tagged reference (`OopValue::SmallInt` shows the integer directly,
/// an object reference shows its table index), since there is no
/// bootstrap `printString` method to send without a full class
/// library loaded.
fn print_result(vm: &Vm<NullPrimitiveHost>, value: Oop) {
    if matches!(value.decode(), OopValue::Object(_)) && vm.class_of(value).ok() == vm.global("String") {
        if let Ok(text) = decode_string(vm, value) {
            println!("{text}");
            return;
        }
    }
    println!("{value}");
}

fn decode_string(vm: &Vm<NullPrimitiveHost>, value: Oop) -> Result<String, ObjectMemoryError> {
    let raw_len = vm.objects.size_of(value)?;
    let len = if raw_len < 0 { (-raw_len) as usize } else { 0 };
    let mut bytes = Vec::with_capacity(len);
    for i in 1..=len {
        bytes.push(vm.objects.byte_at(value, i)?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Compiles one method into `class`'s dictionary and rewrites the
/// image. The source file's first line names the class; the rest is
/// the method's source text (pattern, temporaries, statements) in the
/// form `compile_method` expects.
///
/// Installing the method only ever mutates the existing `class`
/// object's `methods` slot in place - the root `symbols` dictionary
/// that `load_image` returned stays exactly the object it already
/// was, so it is reused unchanged as the root for re-encoding.
fn compile_into_image(source_path: &Path, image_in: &Path, image_out: &Path) -> Result<(), ShellError> {
    let source = fs::read_to_string(source_path).map_err(|e| ShellError::Io(io_context(source_path, &e)))?;
    let (class_name, method_source) = source
        .split_once('\n')
        .ok_or_else(|| ShellError::Usage("source file must start with a class name line".into()))?;
    let class_name = class_name.trim();

    let (objects, root) = load_image(image_in)?;
    let mut vm = Vm::bootstrap(objects, root, NullPrimitiveHost)?;
    let class = vm.global(class_name).ok_or_else(|| ShellError::Usage(format!("unknown class {class_name:?}")))?;

    let method = smalltalk_rt::compiler::compile_method(&mut vm, class, method_source).map_err(ShellError::Compile)?;
    let selector = vm.objects.basic_at(method, smalltalk_rt::vm::method_layout::SELECTOR)?;
    vm.install_method(class, selector, method)?;

    write_image(&vm, root, image_out)
}

fn write_image(vm: &Vm<NullPrimitiveHost>, root: Oop, path: &Path) -> Result<(), ShellError> {
    let rom_eligible: Vec<Oop> = [vm.global("Array"), vm.global("String"), vm.global("Symbol"), vm.global("Block")]
        .into_iter()
        .flatten()
        .collect();
    let bytes = image::encode_monolithic(&vm.objects, root, &rom_eligible)?;
    fs::write(path, bytes).map_err(|e| ShellError::Io(io_context(path, &e)))
}

/// Line-oriented stdio console: backspace erases the last buffered
/// character, both CR and LF terminate a line, output is flushed as
/// soon as a newline is written (§6). Not yet wired to a
/// `PrimitiveHost` - the host/OS primitive range (§4.F 120+) has no
/// registered implementation in this shell, so `NullPrimitiveHost`
/// is what actually backs `run`/`compile`; this struct exists to
/// report fatal conditions and carry `run`'s own console output
/// through the same trait the core expects a real host to implement.
struct StdioPlatform {
    stdout: io::Stdout,
}

impl StdioPlatform {
    fn new() -> Self {
        Self { stdout: io::stdout() }
    }
}

impl Platform for StdioPlatform {
    fn print_line(&mut self, line: &str) {
        let mut out = self.stdout.lock();
        let _ = out.write_all(line.as_bytes());
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut out = self.stdout.lock();
        let _ = out.write_all(bytes);
        if bytes.contains(&b'\n') {
            let _ = out.flush();
        }
    }

    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let mut byte = [0u8; 1];
        let mut stdin = io::stdin().lock();
        loop {
            match stdin.read(&mut byte) {
                Ok(0) => return if line.is_empty() { None } else { Some(line) },
                Ok(_) => match byte[0] {
                    b'\n' | b'\r' => return Some(line),
                    0x08 | 0x7f => {
                        line.pop();
                    }
                    b => line.push(b as char),
                },
                Err(_) => return if line.is_empty() { None } else { Some(line) },
            }
        }
    }

    fn ticks(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}
