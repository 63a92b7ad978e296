//! Core type-graph nodes.
//!
//! Every schema type lives in the arena owned by
//! [`Structures`](super::Structures) and is addressed by [`TypeId`].
//! References between types are [`TypeSlot`]s: a name recorded during XML
//! import, rewritten to an arena index by the single resolution pass that
//! runs once all files have been read. This keeps the graph cyclic-safe
//! (self-referential linked-list nodes, pointer cycles) without any
//! shared-ownership plumbing.

use std::collections::BTreeMap;

/// Ordered name map, matching the schema's by-name lookups.
pub type StringMap<T> = BTreeMap<String, T>;

/// Index of a type node in the schema arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

/// A reference to another type: unresolved (by name) right after XML
/// import, resolved to an arena index afterwards.
#[derive(Debug, Clone)]
pub enum TypeSlot {
    Unresolved(String),
    Resolved(TypeId),
}

impl TypeSlot {
    /// The resolved arena index, if resolution succeeded.
    pub fn id(&self) -> Option<TypeId> {
        match self {
            TypeSlot::Resolved(id) => Some(*id),
            TypeSlot::Unresolved(_) => None,
        }
    }

    /// The referenced name, for diagnostics on unresolved slots.
    pub fn unresolved_name(&self) -> Option<&str> {
        match self {
            TypeSlot::Unresolved(name) => Some(name),
            TypeSlot::Resolved(_) => None,
        }
    }
}

impl From<TypeId> for TypeSlot {
    fn from(id: TypeId) -> Self {
        TypeSlot::Resolved(id)
    }
}

/// Primitive type kinds.
///
/// Some complex library types are listed here because the schema treats
/// them as opaque blobs with a fixed per-ABI size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PrimitiveKind {
    // Fixed width
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Char,
    // ABI dependent
    Bool,
    Long,
    ULong,
    SizeT,
    SFloat,
    DFloat,
    PtrString,
    StdString,
    StdBitVector,
    StdFStream,
    StdMap,
    StdUnorderedMap,
    StdMutex,
    StdConditionVariable,
    StdFuture,
    StdFunction,
    StdFsPath,
    DFFlagArray,
    DFArray,
}

impl PrimitiveKind {
    pub const COUNT: usize = PrimitiveKind::DFArray as usize + 1;

    /// All kinds, in declaration order.
    pub const ALL: [PrimitiveKind; Self::COUNT] = [
        PrimitiveKind::Int8,
        PrimitiveKind::UInt8,
        PrimitiveKind::Int16,
        PrimitiveKind::UInt16,
        PrimitiveKind::Int32,
        PrimitiveKind::UInt32,
        PrimitiveKind::Int64,
        PrimitiveKind::UInt64,
        PrimitiveKind::Char,
        PrimitiveKind::Bool,
        PrimitiveKind::Long,
        PrimitiveKind::ULong,
        PrimitiveKind::SizeT,
        PrimitiveKind::SFloat,
        PrimitiveKind::DFloat,
        PrimitiveKind::PtrString,
        PrimitiveKind::StdString,
        PrimitiveKind::StdBitVector,
        PrimitiveKind::StdFStream,
        PrimitiveKind::StdMap,
        PrimitiveKind::StdUnorderedMap,
        PrimitiveKind::StdMutex,
        PrimitiveKind::StdConditionVariable,
        PrimitiveKind::StdFuture,
        PrimitiveKind::StdFunction,
        PrimitiveKind::StdFsPath,
        PrimitiveKind::DFFlagArray,
        PrimitiveKind::DFArray,
    ];

    /// Maps a schema tag (or `type-name`/`base-type` value) to a kind.
    pub fn from_tag(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "d-float" => Self::DFloat,
            "df-array" => Self::DFArray,
            "df-flagarray" => Self::DFFlagArray,
            "int16_t" => Self::Int16,
            "int32_t" => Self::Int32,
            "int64_t" => Self::Int64,
            "int8_t" => Self::Int8,
            "long" => Self::Long,
            "ptr-string" => Self::PtrString,
            "s-float" => Self::SFloat,
            "size_t" => Self::SizeT,
            "static-string" => Self::Char,
            "stl-bit-vector" => Self::StdBitVector,
            "stl-condition-variable" => Self::StdConditionVariable,
            "stl-fs-path" => Self::StdFsPath,
            "stl-fstream" => Self::StdFStream,
            "stl-function" => Self::StdFunction,
            "stl-future" => Self::StdFuture,
            "stl-map" => Self::StdMap,
            "stl-mutex" => Self::StdMutex,
            "stl-string" => Self::StdString,
            "stl-unordered-map" => Self::StdUnorderedMap,
            "uint16_t" => Self::UInt16,
            "uint32_t" => Self::UInt32,
            "uint64_t" => Self::UInt64,
            "uint8_t" => Self::UInt8,
            "ulong" => Self::ULong,
            _ => return None,
        })
    }

    /// The schema tag corresponding to this kind.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Int8 => "int8_t",
            Self::UInt8 => "uint8_t",
            Self::Int16 => "int16_t",
            Self::UInt16 => "uint16_t",
            Self::Int32 => "int32_t",
            Self::UInt32 => "uint32_t",
            Self::Int64 => "int64_t",
            Self::UInt64 => "uint64_t",
            Self::Char => "static-string",
            Self::Bool => "bool",
            Self::Long => "long",
            Self::ULong => "ulong",
            Self::SizeT => "size_t",
            Self::SFloat => "s-float",
            Self::DFloat => "d-float",
            Self::PtrString => "ptr-string",
            Self::StdString => "stl-string",
            Self::StdBitVector => "stl-bit-vector",
            Self::StdFStream => "stl-fstream",
            Self::StdMap => "stl-map",
            Self::StdUnorderedMap => "stl-unordered-map",
            Self::StdMutex => "stl-mutex",
            Self::StdConditionVariable => "stl-condition-variable",
            Self::StdFuture => "stl-future",
            Self::StdFunction => "stl-function",
            Self::StdFsPath => "stl-fs-path",
            Self::DFFlagArray => "df-flagarray",
            Self::DFArray => "df-array",
        }
    }

    /// Whether an integral load of this kind sign-extends.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Long
        )
    }

    /// Whether this kind can be read as an integer.
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::UInt8
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
                | Self::Char
                | Self::Bool
                | Self::Long
                | Self::ULong
                | Self::SizeT
        )
    }
}

/// Standard library container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StdKind {
    SharedPtr,
    WeakPtr,
    Vector,
    Deque,
    Set,
    Optional,
    Map,
    UnorderedMap,
    Future,
    Variant,
}

impl StdKind {
    pub const COUNT: usize = StdKind::Variant as usize + 1;

    pub fn from_tag(name: &str) -> Option<Self> {
        Some(match name {
            "stl-deque" => Self::Deque,
            "stl-future" => Self::Future,
            "stl-map" => Self::Map,
            "stl-optional" => Self::Optional,
            "stl-set" => Self::Set,
            "stl-shared-ptr" => Self::SharedPtr,
            "stl-unordered-map" => Self::UnorderedMap,
            "stl-variant" => Self::Variant,
            "stl-vector" => Self::Vector,
            "stl-weak-ptr" => Self::WeakPtr,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::SharedPtr => "stl-shared-ptr",
            Self::WeakPtr => "stl-weak-ptr",
            Self::Vector => "stl-vector",
            Self::Deque => "stl-deque",
            Self::Set => "stl-set",
            Self::Optional => "stl-optional",
            Self::Map => "stl-map",
            Self::UnorderedMap => "stl-unordered-map",
            Self::Future => "stl-future",
            Self::Variant => "stl-variant",
        }
    }

    /// Whether the container's own size depends on its parameter types.
    ///
    /// Such containers cannot break layout cycles: their parameters must
    /// be complete before the container size is known.
    pub fn requires_complete_types(self) -> bool {
        matches!(self, Self::Optional | Self::Variant)
    }
}

/// Game-specific container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfKind {
    /// `{ uint8_t *bits; uint32_t size; }`
    FlagArray,
    /// `{ T *data; uint16_t size; }`
    Array,
    /// `{ T *item; node *prev; node *next; }`
    LinkedList,
}

impl DfKind {
    pub fn from_tag(name: &str) -> Option<Self> {
        Some(match name {
            "df-array" => Self::Array,
            "df-flagarray" => Self::FlagArray,
            "df-linked-list-type" => Self::LinkedList,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::FlagArray => "df-flagarray",
            Self::Array => "df-array",
            Self::LinkedList => "df-linked-list-type",
        }
    }
}

/// Member indices of the compounds materialized for [`DfKind`] containers.
pub mod df_members {
    pub const FLAG_ARRAY_BITS: usize = 0;
    pub const FLAG_ARRAY_SIZE: usize = 1;
    pub const ARRAY_DATA: usize = 0;
    pub const ARRAY_SIZE: usize = 1;
    pub const LINKED_LIST_ITEM: usize = 0;
    pub const LINKED_LIST_PREV: usize = 1;
    pub const LINKED_LIST_NEXT: usize = 2;
}

/// Explicit padding with unknown content.
#[derive(Debug, Clone, Copy)]
pub struct Padding {
    pub size: usize,
    pub align: usize,
}

/// Pointer type (`T *`).
#[derive(Debug, Default)]
pub struct PointerType {
    pub debug_name: String,
    /// Pointed-to type; `None` for the generic pointer of unknown target.
    pub item: Option<TypeSlot>,
    /// The pointer actually points at an array of items.
    pub is_array: bool,
    /// The target is known to hold uninitialized values; never dereference.
    pub has_bad_pointers: bool,
}

/// Fixed-extent array (`T[extent]`).
#[derive(Debug)]
pub struct StaticArray {
    pub debug_name: String,
    pub item: TypeSlot,
    /// Extent; `None` until resolution derives it from `index_enum`.
    pub extent: Option<usize>,
    pub index_enum: Option<TypeSlot>,
}

/// Standard library container.
#[derive(Debug)]
pub struct StdContainer {
    pub debug_name: String,
    pub kind: StdKind,
    pub params: Vec<TypeSlot>,
    pub index_enum: Option<TypeSlot>,
    pub has_bad_pointers: bool,
}

/// Game-specific container.
///
/// Each materializes an embedded compound (held in the arena) that makes
/// the byte layout explicit; see [`df_members`] for member indices.
#[derive(Debug)]
pub struct DfContainer {
    pub debug_name: String,
    pub kind: DfKind,
    pub params: Vec<TypeSlot>,
    pub compound: TypeId,
    pub index_enum: Option<TypeSlot>,
}

/// Any schema type node.
#[derive(Debug)]
pub enum Type {
    Primitive(PrimitiveKind),
    Enum(super::enums::EnumType),
    Bitfield(super::bitfield::Bitfield),
    Padding(Padding),
    Compound(super::compound::Compound),
    Pointer(PointerType),
    StaticArray(StaticArray),
    Std(StdContainer),
    Df(DfContainer),
}

impl Type {
    /// Short description used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Type::Primitive(kind) => kind.tag().to_owned(),
            Type::Enum(e) => e.debug_name.clone(),
            Type::Bitfield(b) => b.debug_name.clone(),
            Type::Padding(_) => "padding".to_owned(),
            Type::Compound(c) => c.debug_name.clone(),
            Type::Pointer(p) => format!("pointer ({})", p.debug_name),
            Type::StaticArray(a) => format!("static-array ({})", a.debug_name),
            Type::Std(c) => format!("{} ({})", c.kind.tag(), c.debug_name),
            Type::Df(c) => format!("{} ({})", c.kind.tag(), c.debug_name),
        }
    }
}
