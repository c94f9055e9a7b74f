//! Data section: a raw byte buffer holding NUL-terminated string constants.
//!
//! Instructions address strings by byte offset. The derived index keeps one
//! entry per offset; equal texts at distinct offsets remain distinct entries.

use std::borrow::Cow;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::len_u32;

/// One string constant of the data section.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StringConst {
    /// Byte offset of the first character.
    pub offset: u32,
    /// Length in bytes, terminator excluded.
    pub len: u32,
}

/// Raw bytes plus the derived string index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DataSection {
    bytes: Vec<u8>,
    strings: Vec<StringConst>,
}

impl DataSection {
    /// Empty section.
    pub fn new() -> Self { Self::default() }

    /// Empty section with reserved capacity.
    pub fn with_capacity(bytes: usize) -> Self {
        Self { bytes: Vec::with_capacity(bytes), strings: Vec::new() }
    }

    /// Rebuild the string index from raw bytes.
    ///
    /// Every NUL-terminated run is one string; a trailing run without
    /// terminator is indexed too.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut strings = Vec::new();
        let mut start = 0usize;
        for (i, b) in bytes.iter().enumerate() {
            if *b == 0 {
                strings.push(StringConst { offset: len_u32(start), len: len_u32(i - start) });
                start = i + 1;
            }
        }
        if start < bytes.len() {
            strings.push(StringConst { offset: len_u32(start), len: len_u32(bytes.len() - start) });
        }
        Self { bytes, strings }
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] { &self.bytes }

    /// Byte length.
    pub fn len(&self) -> usize { self.bytes.len() }

    /// True when no byte is stored.
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    /// String constants in offset order.
    pub fn strings(&self) -> &[StringConst] { &self.strings }

    /// Append a string (NUL added) and return its offset.
    pub fn push_bytes(&mut self, text: &[u8]) -> u32 {
        let offset = len_u32(self.bytes.len());
        self.bytes.extend_from_slice(text);
        self.bytes.push(0);
        self.strings.push(StringConst { offset, len: len_u32(text.len()) });
        offset
    }

    /// Append a UTF-8 string and return its offset.
    pub fn push_str(&mut self, text: &str) -> u32 { self.push_bytes(text.as_bytes()) }

    /// Raw bytes of a string constant.
    pub fn bytes_of(&self, s: &StringConst) -> &[u8] {
        let start = s.offset as usize;
        &self.bytes[start..start + s.len as usize]
    }

    /// Decoded text of a string constant (lossy for non UTF-8 bytes).
    pub fn text_of(&self, s: &StringConst) -> Cow<'_, str> { String::from_utf8_lossy(self.bytes_of(s)) }

    /// String starting exactly at `offset`.
    pub fn string_at(&self, offset: u32) -> Option<Cow<'_, str>> {
        self.entry_at(offset).map(|s| self.text_of(s))
    }

    /// Index entry starting exactly at `offset`.
    pub fn entry_at(&self, offset: u32) -> Option<&StringConst> {
        self.strings.binary_search_by_key(&offset, |s| s.offset).ok().map(|i| &self.strings[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn index_is_rebuilt_from_raw_bytes() {
        let d = DataSection::from_bytes(b"hello\0\0world\0tail".to_vec());
        let offsets: Vec<u32> = d.strings().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 6, 7, 13]);
        assert_eq!(d.string_at(7).as_deref(), Some("world"));
        assert_eq!(d.string_at(6).as_deref(), Some(""));
        assert_eq!(d.string_at(13).as_deref(), Some("tail"));
        assert_eq!(d.string_at(8), None);
    }

    #[test]
    fn equal_texts_keep_their_own_offsets() {
        let mut d = DataSection::new();
        let a = d.push_str("cow");
        let b = d.push_str("cow");
        assert_ne!(a, b);
        assert_eq!(d.strings().len(), 2);
        assert_eq!(d.string_at(a), d.string_at(b));
        assert_eq!(DataSection::from_bytes(d.as_bytes().to_vec()), d);
    }
}
