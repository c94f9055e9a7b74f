//! Linked image: the in-memory form of one compiled CHL file.

use core::fmt;

use indexmap::IndexMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{DataSection, Instruction, Opcode, SymRef};
use crate::{len_u32, CHL_VERSION};

/// Name of the reserved null variable (slot 0, first initializer).
pub const NULL_VAR: &str = "Null";

/* ─────────────────────────── Variables globales ─────────────────────────── */

/// Global variable declaration; `size > 1` makes it an array.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlobalVar {
    /// Unique name.
    pub name: String,
    /// Number of slots (1 for a scalar).
    pub size: u32,
}

impl GlobalVar {
    /// Scalar variable.
    pub fn scalar(name: impl Into<String>) -> Self { Self { name: name.into(), size: 1 } }
    /// Array variable of `size` elements.
    pub fn array(name: impl Into<String>, size: u32) -> Self { Self { name: name.into(), size: size.max(1) } }
    /// True for arrays.
    pub const fn is_array(&self) -> bool { self.size > 1 }
}

/// Highest usable slot: variable ids are persisted as non-negative `i32` words.
pub const MAX_SLOT: u32 = i32::MAX.unsigned_abs();

/// Why [`GlobalVars::push`] refused a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRejected {
    /// The name is already declared.
    DuplicateName,
    /// The variable would end past [`MAX_SLOT`].
    SlotOverflow,
}

/// Ordered global table. Ids are 1-based slots: an array of `n` elements takes
/// `n` consecutive slots and its id is the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlobalVars {
    vars: IndexMap<String, GlobalVar>,
    starts: Vec<u32>,
    slots: u32,
}

impl GlobalVars {
    /// Empty table.
    pub fn new() -> Self { Self::default() }

    /// Empty table with reserved capacity.
    pub fn with_capacity(n: usize) -> Self {
        Self { vars: IndexMap::with_capacity(n), starts: Vec::with_capacity(n), slots: 0 }
    }

    /// Append a variable and return its id.
    pub fn push(&mut self, var: GlobalVar) -> Result<u32, PushRejected> {
        if self.vars.contains_key(&var.name) {
            return Err(PushRejected::DuplicateName);
        }
        let end = self
            .slots
            .checked_add(var.size.max(1))
            .filter(|&end| end <= MAX_SLOT)
            .ok_or(PushRejected::SlotOverflow)?;
        let id = self.slots + 1;
        self.slots = end;
        self.starts.push(id);
        self.vars.insert(var.name.clone(), var);
        Ok(id)
    }

    /// Lookup by name: `(id, declaration)`.
    pub fn find(&self, name: &str) -> Option<(u32, &GlobalVar)> {
        self.vars.get_full(name).map(|(i, _, v)| (self.starts[i], v))
    }

    /// Variable owning slot `id`, with the element index inside it.
    pub fn by_slot(&self, id: u32) -> Option<(&GlobalVar, u32)> {
        if id == 0 || id > self.slots {
            return None;
        }
        let i = self.starts.partition_point(|&s| s <= id) - 1;
        let (_, var) = self.vars.get_index(i)?;
        Some((var, id - self.starts[i]))
    }

    /// Declared array size of the variable starting at `id`.
    pub fn array_size(&self, id: u32) -> Option<u32> {
        let i = self.starts.binary_search(&id).ok()?;
        self.vars.get_index(i).map(|(_, v)| v.size)
    }

    /// Number of variables.
    pub fn len(&self) -> usize { self.vars.len() }

    /// True when empty.
    pub fn is_empty(&self) -> bool { self.vars.is_empty() }

    /// Number of slots (the highest valid global id).
    pub const fn slot_count(&self) -> u32 { self.slots }

    /// Declarations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &GlobalVar> + '_ { self.vars.values() }

    /// Names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ { self.vars.keys().map(String::as_str) }
}

/* ─────────────────────────── Scripts ─────────────────────────── */

/// Script table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Script {
    /// 1-based id, contiguous within an image.
    pub id: u32,
    /// Script name.
    pub name: String,
    /// Number of parameters (the first locals).
    pub param_count: u32,
    /// Boundary between global ids (`<=`) and this script's locals (`>`).
    pub global_count: u32,
    /// Local variable names; local `i` has id `global_count + 1 + i`.
    pub local_vars: Vec<String>,
    /// Address of the first instruction.
    pub address: u32,
    /// Source file (diagnostics only).
    pub source_file: String,
}

/* ─────────────────────────── Initialiseurs ─────────────────────────── */

/// Initial value of a global.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InitValue {
    /// Numeric constant.
    Float(f32),
    /// Constant expression kept in source form.
    Expr(String),
}

impl fmt::Display for InitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitValue::Float(v) => write!(f, "{v:?}"),
            InitValue::Expr(e) => f.write_str(e),
        }
    }
}

/// Startup initializer of a global variable.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InitGlobal {
    /// Variable name.
    pub name: String,
    /// Initial value.
    pub value: InitValue,
}

impl InitGlobal {
    /// The reserved entry that opens every initializer list.
    pub fn null() -> Self { Self { name: NULL_VAR.to_owned(), value: InitValue::Float(0.0) } }
}

/* ─────────────────────────── Image ─────────────────────────── */

/// Resolved name of a variable id, as seen from one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarName<'a> {
    /// Slot 0.
    Null,
    /// Global variable (element > 0 for array slots past the first).
    Global {
        /// Variable name.
        name: &'a str,
        /// Element index inside an array.
        element: u32,
    },
    /// Script local.
    Local(&'a str),
}

impl fmt::Display for VarName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarName::Null => f.write_str(NULL_VAR),
            VarName::Global { name, element: 0 } => f.write_str(name),
            VarName::Global { name, element } => write!(f, "{name}+{element}"),
            VarName::Local(name) => write!(f, "local {name}"),
        }
    }
}

/// Complete bytecode image.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Image {
    /// Format version.
    pub version: u32,
    /// Global variable table.
    pub globals: GlobalVars,
    /// Scripts in storage order.
    pub scripts: Vec<Script>,
    /// Shared instruction sequence.
    pub code: Vec<Instruction>,
    /// String constants.
    pub data: DataSection,
    /// Scripts started at load time.
    pub autostart: Vec<SymRef>,
    /// Global initializers; entry 0 is the reserved null entry.
    pub inits: Vec<InitGlobal>,
}

impl Default for Image {
    fn default() -> Self { Self::new() }
}

impl Image {
    /// Empty image at the current format version.
    pub fn new() -> Self {
        Self {
            version: CHL_VERSION,
            globals: GlobalVars::new(),
            scripts: Vec::new(),
            code: Vec::new(),
            data: DataSection::new(),
            autostart: Vec::new(),
            inits: vec![InitGlobal::null()],
        }
    }

    /// Script with the given id.
    pub fn script_by_id(&self, id: u32) -> Option<&Script> {
        let s = self.scripts.get(id.checked_sub(1)? as usize)?;
        if s.id == id { Some(s) } else { self.scripts.iter().find(|s| s.id == id) }
    }

    /// First script with the given name.
    pub fn script_by_name(&self, name: &str) -> Option<&Script> {
        self.scripts.iter().find(|s| s.name == name)
    }

    /// Instruction run of a script, END included. `None` if no END closes it.
    pub fn script_code(&self, script: &Script) -> Option<&[Instruction]> {
        let start = script.address as usize;
        let tail = self.code.get(start..)?;
        let end = tail.iter().position(|i| i.opcode == Opcode::End)?;
        Some(&tail[..=end])
    }

    /// Resolve a variable id as seen from `script`.
    pub fn var_name<'a>(&'a self, script: &'a Script, id: u32) -> Option<VarName<'a>> {
        if id == 0 {
            return Some(VarName::Null);
        }
        if id <= script.global_count {
            let (var, element) = self.globals.by_slot(id)?;
            return Some(VarName::Global { name: &var.name, element });
        }
        let local = (id - script.global_count - 1) as usize;
        script.local_vars.get(local).map(|n| VarName::Local(n))
    }

    /// Next free instruction address.
    pub fn next_address(&self) -> u32 { len_u32(self.code.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arrays_take_consecutive_slots() {
        let mut g = GlobalVars::new();
        assert_eq!(g.push(GlobalVar::scalar("a")), Ok(1));
        assert_eq!(g.push(GlobalVar::array("arr", 4)), Ok(2));
        assert_eq!(g.push(GlobalVar::scalar("b")), Ok(6));
        assert_eq!(g.push(GlobalVar::scalar("a")), Err(PushRejected::DuplicateName));

        assert_eq!(g.slot_count(), 6);
        assert_eq!(g.find("b").map(|(id, _)| id), Some(6));
        assert_eq!(g.array_size(2), Some(4));
        assert_eq!(g.array_size(3), None);
        assert_eq!(g.by_slot(4).map(|(v, e)| (v.name.as_str(), e)), Some(("arr", 2)));
        assert_eq!(g.by_slot(0), None);
        assert_eq!(g.by_slot(7), None);
    }

    #[test]
    fn slots_stop_at_the_encodable_limit() {
        let mut g = GlobalVars::new();
        assert_eq!(g.push(GlobalVar::array("huge", u32::MAX)), Err(PushRejected::SlotOverflow));
        assert_eq!(g.push(GlobalVar::array("big", MAX_SLOT - 1)), Ok(1));
        assert_eq!(g.push(GlobalVar::scalar("last")), Ok(MAX_SLOT));
        assert_eq!(g.push(GlobalVar::scalar("next")), Err(PushRejected::SlotOverflow));
        assert_eq!(g.slot_count(), MAX_SLOT);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn var_name_splits_globals_and_locals_at_the_boundary() {
        let mut img = Image::new();
        img.globals.push(GlobalVar::scalar("g1")).unwrap();
        img.globals.push(GlobalVar::scalar("g2")).unwrap();
        let s = Script {
            id: 1,
            name: "main".into(),
            param_count: 0,
            global_count: 2,
            local_vars: vec!["x".into()],
            address: 0,
            source_file: "main.txt".into(),
        };
        assert_eq!(img.var_name(&s, 0), Some(VarName::Null));
        assert_eq!(img.var_name(&s, 2), Some(VarName::Global { name: "g2", element: 0 }));
        assert_eq!(img.var_name(&s, 3), Some(VarName::Local("x")));
        assert_eq!(img.var_name(&s, 4), None);
    }

    #[test]
    fn script_code_stops_at_end() {
        let mut img = Image::new();
        img.code = vec![Instruction::push_int(1), Instruction::end(), Instruction::push_int(2)];
        let s = Script {
            id: 1,
            name: "s".into(),
            param_count: 0,
            global_count: 0,
            local_vars: vec![],
            address: 0,
            source_file: String::new(),
        };
        assert_eq!(img.script_code(&s).map(<[Instruction]>::len), Some(2));
        let open = Script { address: 2, ..s };
        assert_eq!(img.script_code(&open), None);
    }
}
