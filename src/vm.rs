//! The VM context: the object table, symbol dictionary, scheduler, and
//! well-known class/selector caches bundled behind one struct that the
//! compiler, interpreter, and primitive dispatcher all borrow (Design
//! Note 3: the object table lives on an explicit struct, not a global).

use alloc::string::String;
use alloc::vec::Vec;

use crate::object::{ObjectMemoryError, ObjectTable};
use crate::oop::{NIL, Oop, OopValue};
use crate::platform::{NullPrimitiveHost, PrimitiveHost};
use crate::scheduler::Scheduler;
use crate::symbol::SymbolTable;

/// 1-based slot indices of a `Class` instance, per the contractual
/// layout in §3.
pub mod class_layout {
    pub const NAME: usize = 1;
    pub const SIZE: usize = 2;
    pub const METHODS: usize = 3;
    pub const SUPERCLASS: usize = 4;
    pub const VARIABLES: usize = 5;
    pub const INSTANCE_SLOT_COUNT: usize = 5;
}

/// 1-based slot indices of a `Method` instance.
pub mod method_layout {
    pub const TEXT: usize = 1;
    pub const SELECTOR: usize = 2;
    pub const BYTECODES: usize = 3;
    pub const LITERALS: usize = 4;
    pub const STACK_SIZE: usize = 5;
    pub const TEMPORARY_SIZE: usize = 6;
    pub const METHOD_CLASS: usize = 7;
    pub const WATCH: usize = 8;
    pub const INSTANCE_SLOT_COUNT: usize = 8;
}

/// 1-based slot indices of a `Context` instance.
pub mod context_layout {
    pub const LINK_PTR: usize = 1;
    pub const METHOD: usize = 2;
    pub const ARGUMENTS: usize = 3;
    pub const TEMPORARIES: usize = 4;
    pub const BYTECODE_INDEX: usize = 5;
    pub const RECEIVER: usize = 6;
    pub const INSTANCE_SLOT_COUNT: usize = 6;
}

/// 1-based slot indices of a `Block` instance.
pub mod block_layout {
    pub const DEFINING_CONTEXT: usize = 1;
    pub const ARGUMENT_COUNT: usize = 2;
    pub const ARGUMENT_LOCATION: usize = 3;
    pub const BYTECODE_POSITION: usize = 4;
    pub const INSTANCE_SLOT_COUNT: usize = 4;
}

/// A fatal condition raised while resolving a well-known name against
/// the loaded image's global dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// `Object` error: table overflow, dangling reference, ...
    Memory(ObjectMemoryError),
    /// A name required at bootstrap (a core class, `doesNotUnderstand:`,
    /// ...) is absent from the loaded image's globals.
    MissingGlobal(String),
}

impl From<ObjectMemoryError> for BootstrapError {
    fn from(e: ObjectMemoryError) -> Self {
        Self::Memory(e)
    }
}

impl core::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Memory(e) => write!(f, "{e}"),
            Self::MissingGlobal(name) => write!(f, "bootstrap: missing global {name:?}"),
        }
    }
}

/// A global name binding: the `symbols` dictionary's entries, resolved
/// by name rather than by hardcoded index (spec §9 Open Question 3).
struct Globals {
    bindings: Vec<(String, Oop)>,
}

impl Globals {
    const fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    fn find(&self, name: &str) -> Option<Oop> {
        self.bindings.iter().find(|(n, _)| n == name).map(|(_, o)| *o)
    }

    fn bind(&mut self, name: &str, value: Oop) {
        if let Some(slot) = self.bindings.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.bindings.push((alloc::string::ToString::to_string(name), value));
        }
    }
}

/// Well-known selectors the interpreter sends itself (fallback paths),
/// resolved by name and cached once looked up.
pub struct WellKnownSelectors {
    pub does_not_understand: Option<Oop>,
    pub value: Option<Oop>,
}

/// The VM: object memory, symbol table, scheduler, and the globals
/// dictionary that bootstraps class/selector resolution, plus the
/// host's registered system-primitive implementation.
pub struct Vm<H: PrimitiveHost = NullPrimitiveHost> {
    pub objects: ObjectTable,
    pub symbols: SymbolTable,
    pub scheduler: Scheduler,
    pub host: H,
    globals: Globals,
    pub well_known: WellKnownSelectors,
}

impl<H: PrimitiveHost> Vm<H> {
    /// Build a fresh VM around an already-populated object table (e.g.
    /// one produced by `image::decode_image`) and a `symbol_class`
    /// reference used for future interning.
    #[must_use]
    pub fn new(objects: ObjectTable, symbol_class: Oop, host: H) -> Self {
        Self {
            objects,
            symbols: SymbolTable::new(symbol_class),
            scheduler: Scheduler::new(),
            host,
            globals: Globals::new(),
            well_known: WellKnownSelectors {
                does_not_understand: None,
                value: None,
            },
        }
    }

    /// Bind `name` to `value` in the globals dictionary (called by the
    /// image reader once it has walked the loaded `symbols` object, and
    /// by the compiler when a `compile` subcommand installs a new
    /// class).
    pub fn bind_global(&mut self, name: &str, value: Oop) {
        self.globals.bind(name, value);
    }

    /// Build a VM around a just-loaded image, walking the root
    /// `symbols` dictionary to populate the globals table.
    ///
    /// `symbols` shares the same flat `[key0, value0, key1, value1,
    /// ...]` pairs shape as a class's `methods` dictionary (§3
    /// "Dict"); each key is a `Symbol` byte object whose bytes are the
    /// global's name (a class name, or a well-known name such as
    /// `true`/`false`/`doesNotUnderstand:`).
    ///
    /// # Errors
    /// `BootstrapError::Memory` on a corrupt table; this function
    /// never fails on a missing well-known name, since not every
    /// image binds every optional one (`doesNotUnderstand:` support is
    /// optional, for instance) - callers that need a specific name
    /// check `global()` themselves afterwards.
    pub fn bootstrap(objects: ObjectTable, root: Oop, host: H) -> Result<Self, BootstrapError> {
        let pair_count = if root.is_nil() {
            0
        } else {
            (objects.size_of(root)?.max(0) as usize) / 2
        };

        let symbol_class = if pair_count == 0 {
            NIL
        } else {
            let first_key = objects.basic_at(root, 1)?;
            objects.class_of(first_key)?
        };

        let mut vm = Self::new(objects, symbol_class, host);
        for i in 0..pair_count {
            let key = vm.objects.basic_at(root, 2 * i + 1)?;
            let value = vm.objects.basic_at(root, 2 * i + 2)?;
            let name = symbol_bytes(&vm.objects, key)?;
            vm.bind_global(&name, value);
        }

        vm.well_known.does_not_understand = vm.global("doesNotUnderstand:");
        vm.well_known.value = vm.global("value");
        Ok(vm)
    }

    /// Install `method` under `selector` into `class`'s method
    /// dictionary, appending a new pair (no attempt to replace an
    /// existing binding for the same selector - a `compile` run always
    /// adds the freshest definition last, and lookup walks the pairs
    /// in order so the newest one is found only if it is reached
    /// first; callers that need replacement semantics should rebuild
    /// the dictionary instead).
    ///
    /// # Errors
    /// `ObjectMemoryError` on table overflow or a corrupt `methods`
    /// slot.
    pub fn install_method(&mut self, class: Oop, selector: Oop, method: Oop) -> Result<(), ObjectMemoryError> {
        let existing = self.objects.basic_at(class, class_layout::METHODS)?;
        let old_len = if existing.is_nil() {
            0
        } else {
            self.objects.size_of(existing)?.max(0) as usize
        };
        let new_methods = self.objects.alloc_object(NIL, old_len + 2)?;
        self.objects.incr(new_methods);
        for i in 1..=old_len {
            let v = self.objects.basic_at(existing, i)?;
            self.objects.basic_at_put(new_methods, i, v)?;
        }
        self.objects.basic_at_put(new_methods, old_len + 1, selector)?;
        self.objects.basic_at_put(new_methods, old_len + 2, method)?;
        self.objects.basic_at_put(class, class_layout::METHODS, new_methods)?;
        Ok(())
    }

    /// Resolve a name against the globals dictionary, e.g. a class name
    /// or `currentInterpreter`.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Oop> {
        self.globals.find(name)
    }

    /// Resolve the class a value belongs to. Small integers answer the
    /// `SmallInteger` global; everything else is looked up in the
    /// object table.
    pub fn class_of(&self, oop: Oop) -> Result<Oop, ObjectMemoryError> {
        match oop.decode() {
            OopValue::SmallInt(_) => Ok(self.global("SmallInteger").unwrap_or(NIL)),
            OopValue::Object(_) => self.objects.class_of(oop),
        }
    }

    /// Walk a class's superclass chain starting at `class`, looking up
    /// `selector` in each class's method dictionary (itself an
    /// association list of `(selector, method)` pairs stored as slots
    /// in pairs, per `class_layout::METHODS`). Returns the method and
    /// the class that defines it.
    pub fn lookup_method(
        &self,
        class: Oop,
        selector: Oop,
    ) -> Result<Option<(Oop, Oop)>, ObjectMemoryError> {
        let mut current = class;
        while !current.is_nil() {
            let methods = self.objects.basic_at(current, class_layout::METHODS)?;
            if let Some(method) = self.find_in_method_dict(methods, selector)? {
                return Ok(Some((method, current)));
            }
            current = self.objects.basic_at(current, class_layout::SUPERCLASS)?;
        }
        Ok(None)
    }

    /// `methods` is a flat array of `[selector0, method0, selector1,
    /// method1, ...]` pairs (the simplest method-dictionary shape that
    /// satisfies §3's "methods:Dict" without pulling in a general
    /// hashed-dictionary object).
    fn find_in_method_dict(
        &self,
        methods: Oop,
        selector: Oop,
    ) -> Result<Option<Oop>, ObjectMemoryError> {
        if methods.is_nil() {
            return Ok(None);
        }
        let size = self.objects.size_of(methods)?;
        let pair_count = (size.max(0) as usize) / 2;
        for i in 0..pair_count {
            let key = self.objects.basic_at(methods, 2 * i + 1)?;
            if key == selector {
                return Ok(Some(self.objects.basic_at(methods, 2 * i + 2)?));
            }
        }
        Ok(None)
    }
}

/// Decode a byte object's payload into a `String`, used to recover a
/// `Symbol`'s name while walking the globals dictionary.
fn symbol_bytes(objects: &ObjectTable, symbol: Oop) -> Result<String, ObjectMemoryError> {
    let raw_len = objects.size_of(symbol)?;
    let len = if raw_len < 0 { (-raw_len) as usize } else { 0 };
    let mut bytes = Vec::with_capacity(len);
    for i in 1..=len {
        bytes.push(objects.byte_at(symbol, i)?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
#[path = "vm_test.rs"]
mod vm_test;
