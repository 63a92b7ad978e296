//! Bitfield types.

use super::types::PrimitiveKind;

/// A named run of bits inside a bitfield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub name: String,
    /// First bit.
    pub offset: u32,
    /// Bit count.
    pub count: u32,
}

/// A bitfield over an integer of kind `base`.
///
/// Flag offsets are assigned left to right in declaration order.
#[derive(Debug)]
pub struct Bitfield {
    pub debug_name: String,
    pub base: PrimitiveKind,
    pub flags: Vec<Flag>,
}

impl Bitfield {
    /// The flag named `name`.
    pub fn flag(&self, name: &str) -> Option<&Flag> {
        self.flags.iter().find(|flag| flag.name == name)
    }
}
