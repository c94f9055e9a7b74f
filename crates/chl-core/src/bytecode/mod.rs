//! Bytecode CHL : modèle en mémoire, modules objets, codec binaire, validation.
//!
//! Une [`Image`] est un fichier lié complet ; un [`ObjectModule`] est une image
//! d’une seule unité de compilation, accompagnée de ses références externes
//! non résolues. Le linker consomme des modules, le comparateur lit des images.

/// Opcodes, modes d’adressage et opérandes.
pub mod opcode;
/// Image liée : variables globales, scripts, initialiseurs.
pub mod image;
/// Section de données (chaînes terminées par NUL).
pub mod data;
/// Modules objets et constructeur côté front-end.
pub mod object;
/// Lecture/écriture binaire des images et modules objets.
pub mod codec;
/// Validation structurelle d’une image.
pub mod helpers;

pub use data::{DataSection, StringConst};
pub use image::{GlobalVar, GlobalVars, Image, InitGlobal, InitValue, PushRejected, Script, VarName, MAX_SLOT};
pub use object::{ExternScript, ExternVar, ModuleBuilder, ObjectModule};
pub use opcode::{DataType, Instruction, Mode, Opcode, Operand, OperandKind, SymRef};
