//! Enumerated types with their attribute schemas.

use super::types::{PrimitiveKind, StringMap, TypeSlot};

/// Value of an enum attribute, parsed according to the attribute type.
///
/// Attributes without a declared type stay unparsed strings.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Str(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// A value of another enum, recorded with its resolved integer.
    EnumValue { name: String, value: i32 },
}

/// Per-enum attribute declaration (`enum-attr`).
#[derive(Debug, Default)]
pub struct EnumAttribute {
    /// Attribute type: an integral primitive or another enum. Untyped
    /// attributes keep their values as raw strings.
    pub ty: Option<TypeSlot>,
    /// Default used when an item carries no override.
    pub default_value: Option<AttributeValue>,
}

/// One named enum value (`enum-item`).
#[derive(Debug)]
pub struct EnumItem {
    pub value: i32,
    /// Attribute overrides for this item.
    pub attributes: StringMap<AttributeValue>,
}

/// An enumerated type.
#[derive(Debug)]
pub struct EnumType {
    pub debug_name: String,
    /// Underlying integer kind.
    pub base: PrimitiveKind,
    pub attributes: StringMap<EnumAttribute>,
    pub values: StringMap<EnumItem>,
    /// The last declared value plus one.
    pub count: i32,
}

impl EnumType {
    /// Integer value for a value name.
    pub fn value(&self, name: &str) -> Option<i32> {
        self.values.get(name).map(|item| item.value)
    }

    /// Name for an integer value.
    pub fn name_of(&self, value: i32) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, item)| item.value == value)
            .map(|(name, _)| name.as_str())
    }

    /// Attribute value for `item`, falling back to the attribute default.
    pub fn attribute<'a>(&'a self, item: &str, attribute: &str) -> Option<&'a AttributeValue> {
        if let Some(value) = self
            .values
            .get(item)
            .and_then(|item| item.attributes.get(attribute))
        {
            return Some(value);
        }
        self.attributes
            .get(attribute)
            .and_then(|attr| attr.default_value.as_ref())
    }
}
