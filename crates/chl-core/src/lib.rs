//! chl-core : primitives partagées de la chaîne CHL
//!
//! Fournit :
//! - le modèle de bytecode (`Image`, `Script`, `Instruction`, `DataSection`…)
//! - les modules objets non liés (`ObjectModule`) et leur constructeur (`ModuleBuilder`)
//! - le codec binaire des images et des fichiers objets
//! - IO mémoire (little-endian) : `ByteWriter`, `ByteReader`
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//!
//! Features :
//! - `serde` (par défaut) : derive (dé)sérialisation sur les structures du modèle

#![deny(missing_docs)]

/* ─────────────────────────── Imports ─────────────────────────── */

use std::borrow::Cow;

use thiserror::Error;

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Modèle de bytecode (image, module objet, codec, validation).
pub mod bytecode;

/// Compatibilité : ré-exporte les helpers de validation.
pub use bytecode::helpers;

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = core::result::Result<T, CoreError>;

/* ─────────────────────────── CHL : constantes ─────────────────────────── */

/// Magic d’une image liée : `b"CHL\0"`.
pub const MAGIC_IMAGE: &[u8; 4] = b"CHL\0";

/// Magic d’un module objet (non lié) : `b"CHLO"`.
pub const MAGIC_OBJECT: &[u8; 4] = b"CHLO";

/// Version de format émise par le linker.
pub const CHL_VERSION: u32 = 8;

/* ─────────────────────────── Byte Writer (LE) ─────────────────────────── */

/// Buffer d’écriture (croît automatiquement).
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Crée un writer vide.
    pub fn new() -> Self { Self { buf: Vec::new() } }
    /// Accès en lecture au contenu.
    pub fn as_slice(&self) -> &[u8] { &self.buf }
    /// Récupère le buffer (consomme).
    pub fn into_vec(self) -> Vec<u8> { self.buf }
    /// Ajoute des octets bruts.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }
    /// Écrit un octet.
    pub fn write_u8(&mut self, v: u8) { self.buf.push(v); }
    /// Écrit un u32 little-endian.
    pub fn write_u32_le(&mut self, v: u32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit un i32 little-endian.
    pub fn write_i32_le(&mut self, v: i32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit un f32 little-endian.
    pub fn write_f32_le(&mut self, v: f32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit une longueur `u32` (saturée) suivie des octets.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32_le(len_u32(bytes.len()));
        self.write_bytes(bytes);
    }
    /// Écrit une chaîne préfixée par sa longueur.
    pub fn write_str(&mut self, s: &str) { self.write_blob(s.as_bytes()); }
}

/// Convertit une longueur en `u32` (les formats CHL sont bornés à 4 Gio).
pub(crate) fn len_u32(n: usize) -> u32 { u32::try_from(n).unwrap_or(u32::MAX) }

/* ─────────────────────────── Byte Reader (LE) ─────────────────────────── */

/// Lecteur séquentiel sur un slice d’octets (helpers LE).
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Construit un lecteur.
    pub fn new(data: &'a [u8]) -> Self { Self { data, off: 0 } }
    /// Offset courant.
    pub fn offset(&self) -> usize { self.off }
    /// Taille restante.
    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.off) }

    /// Lit `n` octets (ou erreur si EOF).
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n as u64, at: self.off as u64 });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Lit un octet.
    pub fn read_u8(&mut self) -> CoreResult<u8> { Ok(self.read_bytes(1)?[0]) }

    /// Lit un u32 LE.
    pub fn read_u32_le(&mut self) -> CoreResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Lit un i32 LE.
    pub fn read_i32_le(&mut self) -> CoreResult<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Lit un f32 LE.
    pub fn read_f32_le(&mut self) -> CoreResult<f32> { Ok(f32::from_bits(self.read_u32_le()?)) }

    /// Lit un blob préfixé par sa longueur.
    pub fn read_blob(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.read_u32_le()? as usize;
        self.read_bytes(len)
    }

    /// Lit une chaîne UTF-8 préfixée par sa longueur.
    pub fn read_str(&mut self) -> CoreResult<String> {
        let bytes = self.read_blob()?;
        core::str::from_utf8(bytes).map(str::to_owned).map_err(|_| CoreError::InvalidUtf8)
    }

    /// Lit un compteur d’éléments et vérifie qu’il tient dans le reste du buffer
    /// (chaque élément occupe au moins `min_size` octets).
    pub fn read_count(&mut self, min_size: usize) -> CoreResult<usize> {
        let at = self.off as u64;
        let n = self.read_u32_le()? as usize;
        if n.saturating_mul(min_size.max(1)) > self.remaining() {
            return Err(CoreError::InvalidLength { what: "count", len: n as u64, at });
        }
        Ok(n)
    }

    /// Vérifie qu’il ne reste aucun octet.
    pub fn finish(&self) -> CoreResult<()> {
        if self.remaining() == 0 { Ok(()) } else { Err(CoreError::TrailingBytes { at: self.off as u64 }) }
    }
}

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes (codec, validation).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Magic invalide.
    #[error("invalid magic (expected {expected:?})")]
    InvalidMagic {
        /// Magic attendu.
        expected: &'static [u8; 4],
    },
    /// Fin de buffer inattendue.
    #[error("unexpected EOF: need {needed} bytes at {at}")]
    UnexpectedEof {
        /// Nombre d’octets manquants.
        needed: u64,
        /// Offset où l’erreur s’est produite.
        at: u64,
    },
    /// Longueur/compteur invalide (ex: dépasse le buffer).
    #[error("invalid {what} {len} at {at}")]
    InvalidLength {
        /// Nature de la valeur fautive.
        what: &'static str,
        /// Valeur lue.
        len: u64,
        /// Offset de lecture.
        at: u64,
    },
    /// Code inconnu dans un champ énuméré.
    #[error("unknown {what} code 0x{raw:02X}")]
    UnknownCode {
        /// Champ concerné (`opcode`, `mode`, …).
        what: &'static str,
        /// Valeur brute.
        raw: u8,
    },
    /// Octets restants après la fin attendue.
    #[error("trailing bytes at {at}")]
    TrailingBytes {
        /// Offset de la fin attendue.
        at: u64,
    },
    /// UTF-8 invalide.
    #[error("invalid utf-8")]
    InvalidUtf8,
    /// Données corrompues (structure incohérente).
    #[error("corrupted: {0}")]
    Corrupted(Cow<'static, str>),
}

impl CoreError {
    /// Construit une erreur « corrompu ».
    pub fn corrupted(msg: impl Into<Cow<'static, str>>) -> Self { CoreError::Corrupted(msg.into()) }
}

/* ─────────────────────────── Prélude (reexports utiles) ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        bytecode::{
            DataSection, DataType, ExternScript, ExternVar, GlobalVar, GlobalVars, Image,
            InitGlobal, InitValue, Instruction, Mode, ModuleBuilder, ObjectModule, Opcode,
            Operand, OperandKind, Script, SymRef, VarName,
        },
        ByteReader, ByteWriter, CoreError, CoreResult, CHL_VERSION, MAGIC_IMAGE, MAGIC_OBJECT,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
