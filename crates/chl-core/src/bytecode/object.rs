//! Object modules: one compiled unit plus the symbols it leaves unresolved.
//!
//! The compiler front end hands modules to the linker through this shape only.
//! Placeholder ids are positions in the external tables; the persisted form
//! encodes them as `-(placeholder + 1)`.

use std::collections::BTreeSet;

use indexmap::IndexSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{GlobalVar, Image, InitGlobal, InitValue, Instruction, Operand, PushRejected, Script, SymRef};

/// External variable reference: `name`, element `index` (0 for scalars).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExternVar {
    /// Variable name.
    pub name: String,
    /// Array element (0 for the variable itself).
    pub index: u32,
}

/// External script reference: `name` with its expected parameter count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExternScript {
    /// Script name.
    pub name: String,
    /// Expected parameter count.
    pub params: u32,
}

/// One unlinked compilation unit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ObjectModule {
    /// Module identity (usually the source path), used in link errors.
    pub name: String,
    /// Module-local image; ids are local and may be `External`.
    pub image: Image,
    /// Variables defined elsewhere; placeholder id = position.
    pub extern_vars: IndexSet<ExternVar>,
    /// Scripts defined elsewhere; placeholder id = position.
    pub extern_scripts: IndexSet<ExternScript>,
    /// Addresses of integer PUSHes whose operand is a data-section offset.
    pub string_instructions: BTreeSet<u32>,
}

impl ObjectModule {
    /// Empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: Image::new(),
            extern_vars: IndexSet::new(),
            extern_scripts: IndexSet::new(),
            string_instructions: BTreeSet::new(),
        }
    }
}

/// Incremental construction of an [`ObjectModule`].
///
/// Globals must be declared before the scripts that see them: a script's
/// boundary is the global slot count at [`ModuleBuilder::begin_script`].
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    module: ObjectModule,
    source_file: String,
}

impl ModuleBuilder {
    /// New module; `name` is also the source file recorded on scripts.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { source_file: name.clone(), module: ObjectModule::new(name) }
    }

    /// Declare a scalar global.
    ///
    /// # Panics
    /// If the name is already declared in this module.
    pub fn global(&mut self, name: &str) -> SymRef { self.declare(GlobalVar::scalar(name)) }

    /// Declare an array global.
    ///
    /// # Panics
    /// If the name is already declared in this module, or the array overflows the slot space.
    pub fn array(&mut self, name: &str, size: u32) -> SymRef { self.declare(GlobalVar::array(name, size)) }

    fn declare(&mut self, var: GlobalVar) -> SymRef {
        let name = var.name.clone();
        match self.module.image.globals.push(var) {
            Ok(id) => SymRef::Internal(id),
            Err(PushRejected::DuplicateName) => panic!("global `{name}` declared twice"),
            Err(PushRejected::SlotOverflow) => panic!("global `{name}` does not fit in the slot space"),
        }
    }

    /// Record an initializer for a global.
    pub fn init(&mut self, name: &str, value: InitValue) {
        self.module.image.inits.push(InitGlobal { name: name.to_owned(), value });
    }

    /// Append a raw string to the data section.
    pub fn string(&mut self, text: &str) -> u32 { self.module.image.data.push_str(text) }

    /// Reference to a variable of another module.
    pub fn extern_var(&mut self, name: &str, index: u32) -> SymRef {
        let (p, _) = self.module.extern_vars.insert_full(ExternVar { name: name.to_owned(), index });
        SymRef::External(crate::len_u32(p))
    }

    /// Reference to a script of another module.
    pub fn extern_script(&mut self, name: &str, params: u32) -> SymRef {
        let (p, _) = self.module.extern_scripts.insert_full(ExternScript { name: name.to_owned(), params });
        SymRef::External(crate::len_u32(p))
    }

    /// Open a new script at the current address; `locals` starts with the parameters.
    pub fn begin_script(&mut self, name: &str, param_count: u32, locals: &[&str]) -> SymRef {
        let image = &mut self.module.image;
        let id = crate::len_u32(image.scripts.len()) + 1;
        image.scripts.push(Script {
            id,
            name: name.to_owned(),
            param_count,
            global_count: image.globals.slot_count(),
            local_vars: locals.iter().map(|s| (*s).to_owned()).collect(),
            address: image.next_address(),
            source_file: self.source_file.clone(),
        });
        SymRef::Internal(id)
    }

    /// Local variable of the script being built.
    pub fn local(&self, name: &str) -> Option<SymRef> {
        let s = self.module.image.scripts.last()?;
        let i = s.local_vars.iter().position(|l| l == name)?;
        Some(SymRef::Internal(s.global_count + 1 + crate::len_u32(i)))
    }

    /// Append an instruction and return its address.
    pub fn emit(&mut self, ins: Instruction) -> u32 {
        let at = self.module.image.next_address();
        self.module.image.code.push(ins);
        at
    }

    /// Append a string constant and the integer PUSH referencing it.
    pub fn push_string(&mut self, text: &str) -> u32 {
        let offset = self.string(text);
        let at = self.emit(Instruction::push_int(i32::try_from(offset).unwrap_or(i32::MAX)));
        self.module.string_instructions.insert(at);
        at
    }

    /// Next instruction address.
    pub fn here(&self) -> u32 { self.module.image.next_address() }

    /// Retarget the jump emitted at `at`.
    pub fn patch_jump(&mut self, at: u32, target: u32) {
        if let Some(ins) = self.module.image.code.get_mut(at as usize) {
            if let Operand::Addr(a) = &mut ins.operand {
                *a = target;
            }
        }
    }

    /// Register a script to run at load time.
    pub fn autostart(&mut self, script: SymRef) { self.module.image.autostart.push(script); }

    /// Finished module.
    pub fn finish(self) -> ObjectModule { self.module }
}
