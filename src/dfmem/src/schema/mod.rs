//! Schema model: parsed df-structures XML as a typed graph.
//!
//! [`Structures::load`] reads every `df.*.xml` file in a directory plus
//! `symbols.xml`, building an arena of type nodes. Parsing continues
//! through errors; every problem is logged and the load fails at the end
//! if any occurred, so no partial schema escapes.

mod bitfield;
mod compound;
mod enums;
mod symbols;
mod types;
pub mod xml;

pub use bitfield::{Bitfield, Flag};
pub use compound::{Compound, Member, Method};
pub use enums::{AttributeValue, EnumAttribute, EnumItem, EnumType};
pub use symbols::VersionInfo;
pub use types::{
    df_members, DfContainer, DfKind, Padding, PointerType, PrimitiveKind, StaticArray,
    StdContainer, StdKind, StringMap, Type, TypeId, TypeSlot,
};

use std::fs;
use std::path::Path as FsPath;

use thiserror::Error;
use tracing::error;

use crate::path::PathItem;
use xml::XmlNode;

/// Schema load and query errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to load structures xml ({errors} errors)")]
    LoadFailed { errors: usize },
    #[error("unresolved reference to {name}")]
    UnresolvedReference { name: String },
    #[error("member {0} not found")]
    MemberNotFound(String),
    #[error("{0} is not a compound")]
    NotACompound(String),
    #[error("{0} is not a container")]
    NotAContainer(String),
    #[error("unknown compound {0}")]
    UnknownCompound(String),
    #[error("unknown global {0}")]
    UnknownGlobal(String),
    #[error("path must begin with an identifier")]
    PathStart,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed df-structures data: the type arena, per-kind name tables and the
/// version list. Immutable once loaded.
pub struct Structures {
    arena: Vec<Type>,
    primitive_ids: Vec<TypeId>,
    primitives: StringMap<TypeId>,
    generic_pointer: TypeId,
    compounds: StringMap<TypeId>,
    enums: StringMap<TypeId>,
    bitfields: StringMap<TypeId>,
    linked_lists: StringMap<TypeId>,
    globals: StringMap<TypeSlot>,
    versions: Vec<VersionInfo>,
}

impl Structures {
    /// Load every `df.*.xml` file plus `symbols.xml` from `dir`.
    ///
    /// All parse problems are logged; if any occurred the load fails after
    /// visiting everything it could.
    pub fn load(dir: impl AsRef<FsPath>) -> Result<Structures, SchemaError> {
        let dir = dir.as_ref();
        let mut loader = Loader::new();

        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("df.") && name.ends_with(".xml") {
                files.push((name, entry.path()));
            }
        }
        files.sort();

        for (name, path) in &files {
            let source = match fs::read_to_string(path) {
                Ok(source) => source,
                Err(err) => {
                    loader.log.file = name.clone();
                    loader.log.error(format!("Failed to read {name}: {err}."));
                    continue;
                }
            };
            loader.log.file = name.clone();
            match xml::parse_document(&source) {
                Ok(doc) => loader.load_document(&doc),
                Err(err) => loader.log.error(format!("Failed to parse {name}: {err}.")),
            }
        }

        loader.build_other_vectors();
        loader.resolve();

        loader.log.file = "symbols.xml".to_owned();
        match fs::read_to_string(dir.join("symbols.xml")) {
            Ok(source) => match xml::parse_document(&source) {
                Ok(doc) => loader.load_symbols(&doc),
                Err(err) => loader
                    .log
                    .error(format!("Failed to parse symbols.xml: {err}.")),
            },
            Err(err) => loader
                .log
                .error(format!("Failed to read symbols.xml: {err}.")),
        }

        if loader.log.errors > 0 {
            Err(SchemaError::LoadFailed {
                errors: loader.log.errors,
            })
        } else {
            Ok(loader.s)
        }
    }

    /// The type node for `id`.
    pub fn get(&self, id: TypeId) -> &Type {
        &self.arena[id.0 as usize]
    }

    /// Short description of a type for diagnostics.
    pub fn describe(&self, id: TypeId) -> String {
        self.get(id).describe()
    }

    /// Canonical node for a primitive kind.
    pub fn primitive_id(&self, kind: PrimitiveKind) -> TypeId {
        self.primitive_ids[kind as usize]
    }

    /// The shared pointer-to-unknown type.
    pub fn generic_pointer(&self) -> TypeId {
        self.generic_pointer
    }

    pub fn find_primitive(&self, name: &str) -> Option<TypeId> {
        self.primitives.get(name).copied()
    }

    pub fn find_compound(&self, name: &str) -> Option<TypeId> {
        self.compounds.get(name).copied()
    }

    pub fn find_enum(&self, name: &str) -> Option<TypeId> {
        self.enums.get(name).copied()
    }

    pub fn find_bitfield(&self, name: &str) -> Option<TypeId> {
        self.bitfields.get(name).copied()
    }

    pub fn find_linked_list(&self, name: &str) -> Option<TypeId> {
        self.linked_lists.get(name).copied()
    }

    /// Type of the global object `name`.
    pub fn find_global_type(&self, name: &str) -> Option<TypeId> {
        self.globals.get(name).and_then(|slot| slot.id())
    }

    pub fn all_compounds(&self) -> impl Iterator<Item = (&str, TypeId)> {
        self.compounds.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn all_enums(&self) -> impl Iterator<Item = (&str, TypeId)> {
        self.enums.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn all_bitfields(&self) -> impl Iterator<Item = (&str, TypeId)> {
        self.bitfields.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn all_linked_lists(&self) -> impl Iterator<Item = (&str, TypeId)> {
        self.linked_lists
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
    }

    pub fn all_primitives(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.primitive_ids.iter().copied()
    }

    pub fn all_globals(&self) -> impl Iterator<Item = (&str, Option<TypeId>)> {
        self.globals
            .iter()
            .map(|(name, slot)| (name.as_str(), slot.id()))
    }

    /// All supported versions.
    pub fn versions(&self) -> &[VersionInfo] {
        &self.versions
    }

    pub fn version_by_name(&self, name: &str) -> Option<&VersionInfo> {
        self.versions.iter().find(|v| v.version_name == name)
    }

    /// The version whose build identifier matches `id`.
    pub fn version_by_id(&self, id: &[u8]) -> Option<&VersionInfo> {
        self.versions.iter().find(|v| v.id == id)
    }

    /// The compound node for `id`, if it is one.
    pub fn compound(&self, id: TypeId) -> Option<&Compound> {
        match self.get(id) {
            Type::Compound(c) => Some(c),
            _ => None,
        }
    }

    /// The item type slot of a container node, if `id` is a container.
    pub fn container_item(&self, id: TypeId) -> Option<&TypeSlot> {
        match self.get(id) {
            Type::Pointer(p) => p.item.as_ref(),
            Type::StaticArray(a) => Some(&a.item),
            Type::Std(c) => c.params.first(),
            Type::Df(c) => c.params.first(),
            _ => None,
        }
    }

    fn is_container(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            Type::Pointer(_) | Type::StaticArray(_) | Type::Std(_) | Type::Df(_)
        )
    }

    /// Find a member by name, descending into anonymous nested compounds.
    ///
    /// Returns the full path to the member: each entry is the containing
    /// compound and a member index, the first entry always refers to
    /// `compound` itself and the last names the found member. Empty when
    /// the member does not exist.
    pub fn search_member(&self, compound: TypeId, name: &str) -> Vec<(TypeId, usize)> {
        let mut out = Vec::new();
        if !self.search_member_rec(compound, name, &mut out) {
            out.clear();
        }
        out
    }

    fn search_member_rec(&self, cid: TypeId, name: &str, out: &mut Vec<(TypeId, usize)>) -> bool {
        let Some(c) = self.compound(cid) else {
            return false;
        };
        for (i, member) in c.members.iter().enumerate() {
            if member.name.is_empty() {
                if let Some(mid) = member.ty.id() {
                    if matches!(self.get(mid), Type::Compound(_)) {
                        out.push((cid, i));
                        if self.search_member_rec(mid, name, out) {
                            return true;
                        }
                        out.pop();
                    }
                }
            } else if member.name == name {
                out.push((cid, i));
                return true;
            }
        }
        false
    }

    fn slot_id(&self, slot: &TypeSlot) -> Result<TypeId, SchemaError> {
        slot.id().ok_or_else(|| SchemaError::UnresolvedReference {
            name: slot.unresolved_name().unwrap_or_default().to_owned(),
        })
    }

    fn unwrap_containers(&self, mut ty: TypeId) -> Result<TypeId, SchemaError> {
        while self.is_container(ty) {
            match self.container_item(ty) {
                Some(slot) => ty = self.slot_id(slot)?,
                None => break,
            }
        }
        Ok(ty)
    }

    /// Resolve `path` against the type `ty`, returning the subtype it
    /// addresses. Containers are looked through when a member name is
    /// applied to them.
    pub fn find_child_type(&self, ty: TypeId, path: &[PathItem]) -> Result<TypeId, SchemaError> {
        let mut ty = ty;
        for item in path {
            match item {
                PathItem::Identifier(name) => {
                    let base = self.unwrap_containers(ty)?;
                    if self.compound(base).is_none() {
                        return Err(SchemaError::NotACompound(self.describe(base)));
                    }
                    let found = self.search_member(base, name);
                    let Some(&(parent, index)) = found.last() else {
                        return Err(SchemaError::MemberNotFound(name.clone()));
                    };
                    let Some(member) = self.compound(parent).and_then(|c| c.members.get(index))
                    else {
                        return Err(SchemaError::NotACompound(self.describe(parent)));
                    };
                    ty = self.slot_id(&member.ty)?;
                }
                PathItem::ContainerOf(name) => {
                    let base = self.unwrap_containers(ty)?;
                    if self.compound(base).is_none() {
                        return Err(SchemaError::NotACompound(self.describe(base)));
                    }
                    let found = self.search_member(base, name);
                    let Some(&(parent, index)) = found.first() else {
                        return Err(SchemaError::MemberNotFound(name.clone()));
                    };
                    let Some(member) = self.compound(parent).and_then(|c| c.members.get(index))
                    else {
                        return Err(SchemaError::NotACompound(self.describe(parent)));
                    };
                    ty = self.slot_id(&member.ty)?;
                }
                PathItem::Index(_) => {
                    let Some(slot) = self.container_item(ty) else {
                        return Err(SchemaError::NotAContainer(self.describe(ty)));
                    };
                    ty = self.slot_id(slot)?;
                }
            }
        }
        Ok(ty)
    }

    /// The compound addressed by `path` (a type name optionally followed
    /// by member steps). Containers along the way are looked through.
    pub fn find_compound_path(&self, path: &[PathItem]) -> Result<TypeId, SchemaError> {
        let Some(PathItem::Identifier(first)) = path.first() else {
            return Err(SchemaError::PathStart);
        };
        let base = self
            .find_compound(first)
            .ok_or_else(|| SchemaError::UnknownCompound(first.clone()))?;
        if path.len() == 1 {
            return Ok(base);
        }
        let ty = self.find_child_type(base, &path[1..])?;
        let ty = self.unwrap_containers(ty)?;
        if self.compound(ty).is_some() {
            Ok(ty)
        } else {
            Err(SchemaError::NotACompound(self.describe(ty)))
        }
    }

    /// The type of the global object (or a member of it) named by `path`.
    pub fn global_type(&self, path: &[PathItem]) -> Result<TypeId, SchemaError> {
        let Some(PathItem::Identifier(first)) = path.first() else {
            return Err(SchemaError::PathStart);
        };
        let base = self
            .find_global_type(first)
            .ok_or_else(|| SchemaError::UnknownGlobal(first.clone()))?;
        self.find_child_type(base, &path[1..])
    }

    /// Parse a container index: an index-enum value name when the
    /// container has one, otherwise a plain number.
    pub fn parse_index(&self, container: TypeId, index: &str) -> Option<i64> {
        let index_enum = match self.get(container) {
            Type::StaticArray(a) => a.index_enum.as_ref(),
            Type::Std(c) => c.index_enum.as_ref(),
            Type::Df(c) => c.index_enum.as_ref(),
            _ => None,
        };
        if let Some(eid) = index_enum.and_then(|slot| slot.id()) {
            if let Type::Enum(e) = self.get(eid) {
                if let Some(value) = e.value(index) {
                    return Some(value.into());
                }
            }
        }
        index.parse().ok()
    }

}

/// Error accumulator for the load pass.
struct ErrorLog {
    file: String,
    errors: usize,
}

impl ErrorLog {
    fn error(&mut self, message: String) {
        self.errors += 1;
        error!(file = %self.file, "{message}");
    }

    fn error_at(&mut self, node: &XmlNode, message: String) {
        self.errors += 1;
        error!(file = %self.file, offset = node.offset, "{message}");
    }
}

/// Deferred member construction for `df-other-vectors-type`.
struct OtherVectorsBuilder {
    compound: Option<TypeId>,
    index_enum: String,
    default_item_type: String,
    overrides: Vec<Member>,
}

struct Loader {
    s: Structures,
    log: ErrorLog,
    other_vectors: Vec<OtherVectorsBuilder>,
}

const IGNORE_TAGS: [&str; 4] = ["code-helper", "custom-methods", "comment", "extra-include"];

fn attr_bool(node: &XmlNode, name: &str) -> bool {
    node.attr(name) == Some("true")
}

impl Loader {
    fn new() -> Loader {
        let mut arena = Vec::new();
        let mut primitive_ids = Vec::with_capacity(PrimitiveKind::COUNT);
        let mut primitives = StringMap::new();
        for kind in PrimitiveKind::ALL {
            let id = TypeId(arena.len() as u32);
            arena.push(Type::Primitive(kind));
            primitive_ids.push(id);
            primitives.insert(kind.tag().to_owned(), id);
        }
        let generic_pointer = TypeId(arena.len() as u32);
        arena.push(Type::Pointer(PointerType {
            debug_name: "generic_pointer".to_owned(),
            item: None,
            is_array: false,
            has_bad_pointers: false,
        }));
        Loader {
            s: Structures {
                arena,
                primitive_ids,
                primitives,
                generic_pointer,
                compounds: StringMap::new(),
                enums: StringMap::new(),
                bitfields: StringMap::new(),
                linked_lists: StringMap::new(),
                globals: StringMap::new(),
                versions: Vec::new(),
            },
            log: ErrorLog {
                file: String::new(),
                errors: 0,
            },
            other_vectors: Vec::new(),
        }
    }

    fn alloc(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.s.arena.len() as u32);
        self.s.arena.push(ty);
        id
    }

    fn load_document(&mut self, doc: &XmlNode) {
        for element in &doc.children {
            let tag = element.tag.clone();
            match tag.as_str() {
                "struct-type" => {
                    let c = self.parse_named_compound(element, false);
                    self.add_named(element, c, "compound");
                }
                "class-type" => {
                    let c = self.parse_named_compound(element, true);
                    self.add_named(element, c, "compound");
                }
                "df-linked-list-type" => {
                    self.parse_linked_list_type(element);
                }
                "df-other-vectors-type" => {
                    let name = element.attr("type-name").unwrap_or_default().to_owned();
                    let compound = Type::Compound(Compound {
                        debug_name: name.clone(),
                        ..Compound::default()
                    });
                    let id = self.add_named(element, compound, "compound");
                    let overrides = element
                        .children_named("stl-vector")
                        .filter_map(|child| {
                            let member_name = child.attr("name").unwrap_or_default();
                            self.parse_member(&name, member_name, child)
                        })
                        .collect();
                    self.other_vectors.push(OtherVectorsBuilder {
                        compound: id,
                        index_enum: element.attr("index-enum").unwrap_or_default().to_owned(),
                        default_item_type: element.attr("item-type").unwrap_or_default().to_owned(),
                        overrides,
                    });
                }
                "enum-type" => {
                    let name = element.attr("type-name").unwrap_or_default().to_owned();
                    let e = Type::Enum(self.parse_enum(&name, element));
                    self.add_named(element, e, "enum");
                }
                "bitfield-type" => {
                    let name = element.attr("type-name").unwrap_or_default().to_owned();
                    let b = Type::Bitfield(self.parse_bitfield(&name, element));
                    self.add_named(element, b, "bitfield");
                }
                "global-object" => {
                    let name = element.attr("name").unwrap_or_default().to_owned();
                    let slot = match element.attr("type-name") {
                        Some(type_name) => TypeSlot::Unresolved(type_name.to_owned()),
                        None => {
                            let c = self.parse_compound(&name, element, false);
                            TypeSlot::Resolved(self.alloc(Type::Compound(c)))
                        }
                    };
                    self.s.globals.entry(name).or_insert(slot);
                }
                other => {
                    self.log
                        .error_at(element, format!("Unknown type tag: {other}."));
                }
            }
        }
    }

    /// Insert a named top-level type into its per-kind table.
    fn add_named(&mut self, element: &XmlNode, ty: Type, kind: &str) -> Option<TypeId> {
        let name = element.attr("type-name").unwrap_or_default().to_owned();
        let table = match kind {
            "enum" => &self.s.enums,
            "bitfield" => &self.s.bitfields,
            _ => &self.s.compounds,
        };
        if table.contains_key(&name) {
            self.log
                .error_at(element, format!("Duplicated type {name}."));
            return None;
        }
        let id = self.alloc(ty);
        let table = match kind {
            "enum" => &mut self.s.enums,
            "bitfield" => &mut self.s.bitfields,
            _ => &mut self.s.compounds,
        };
        table.insert(name, id);
        Some(id)
    }

    fn parse_named_compound(&mut self, element: &XmlNode, vtable: bool) -> Type {
        let name = element.attr("type-name").unwrap_or_default().to_owned();
        Type::Compound(self.parse_compound(&name, element, vtable))
    }

    fn parse_compound(&mut self, debug_name: &str, element: &XmlNode, vtable: bool) -> Compound {
        let mut compound = Compound {
            debug_name: debug_name.to_owned(),
            symbol: element.attr("original-name").map(str::to_owned),
            parent: element
                .attr("inherits-from")
                .map(|p| TypeSlot::Unresolved(p.to_owned())),
            vtable,
            is_union: attr_bool(element, "is-union"),
            ..Compound::default()
        };
        for child in &element.children {
            let tag = child.tag.as_str();
            if tag == "virtual-methods" {
                if !vtable {
                    self.log.error_at(
                        child,
                        format!("{debug_name}: Adding virtual methods without a vtable."),
                    );
                    continue;
                }
                for vmethod in child.children_named("vmethod") {
                    let method = self.parse_method(debug_name, vmethod);
                    compound.vmethods.push(method);
                }
            } else if !IGNORE_TAGS.contains(&tag) {
                let name = child.attr("name").unwrap_or_default();
                if let Some(member) = self.parse_member(debug_name, name, child) {
                    compound.members.push(member);
                }
            }
        }
        compound
    }

    fn parse_member(&mut self, parent: &str, name: &str, element: &XmlNode) -> Option<Member> {
        let debug_name = Compound::member_debug_name(parent, name);
        let ty = self.make_type(&debug_name, element)?;
        Some(Member {
            name: name.to_owned(),
            ty,
        })
    }

    fn parse_method(&mut self, parent: &str, element: &XmlNode) -> Method {
        let mut method = Method::default();
        if element.attr("is-destructor").is_some() {
            method.is_destructor = attr_bool(element, "is-destructor");
        } else {
            method.name = element.attr("name").unwrap_or_default().to_owned();
        }
        if let Some(ret) = element.attr("ret-type") {
            method.return_type = Some(TypeSlot::Unresolved(ret.to_owned()));
        }
        for child in &element.children {
            let tag = child.tag.as_str();
            if tag == "ret-type" {
                if let Some(ret) = child.attr("type-name") {
                    method.return_type = Some(TypeSlot::Unresolved(ret.to_owned()));
                } else if let Some(inner) = child.children.first() {
                    let debug_name = format!("{parent}::{} return", method.name);
                    method.return_type = self.make_type(&debug_name, inner);
                } else {
                    self.log.error_at(
                        child,
                        format!("{parent}::{}: Empty ret-type element.", method.name),
                    );
                }
            } else if !IGNORE_TAGS.contains(&tag) {
                let arg_name = child.attr("name").unwrap_or_default().to_owned();
                let debug_name = format!("{parent}::{} parameter {arg_name}", method.name);
                if let Some(ty) = self.make_type(&debug_name, child) {
                    method.args.push((arg_name, ty));
                }
            }
        }
        method
    }

    /// Build a member/parameter type from its XML element.
    ///
    /// Returns `None` (after logging) for unknown tags.
    fn make_type(&mut self, debug_name: &str, element: &XmlNode) -> Option<TypeSlot> {
        let tag = element.tag.as_str();
        if tag == "compound" {
            if let Some(name) = element.attr("type-name") {
                return Some(TypeSlot::Unresolved(name.to_owned()));
            }
            let c = self.parse_compound(debug_name, element, false);
            return Some(TypeSlot::Resolved(self.alloc(Type::Compound(c))));
        }
        if tag == "df-linked-list" {
            return Some(TypeSlot::Unresolved(
                element.attr("type-name").unwrap_or_default().to_owned(),
            ));
        }
        if let Some(kind) = StdKind::from_tag(tag) {
            let c = self.parse_std_container(debug_name, element, kind);
            return Some(TypeSlot::Resolved(self.alloc(Type::Std(c))));
        }
        if tag == "df-array" || tag == "df-flagarray" {
            let kind = if tag == "df-array" {
                DfKind::Array
            } else {
                DfKind::FlagArray
            };
            let c = self.parse_df_container(debug_name, element, kind);
            return Some(TypeSlot::Resolved(self.alloc(Type::Df(c))));
        }
        if tag == "pointer" {
            let p = self.parse_pointer(debug_name, element);
            return Some(TypeSlot::Resolved(self.alloc(Type::Pointer(p))));
        }
        if tag == "static-array" {
            let a = StaticArray {
                debug_name: debug_name.to_owned(),
                item: self.parse_item_type(debug_name, element, false),
                extent: element
                    .attr("count")
                    .and_then(|v| v.parse::<usize>().ok()),
                index_enum: element
                    .attr("index-enum")
                    .map(|e| TypeSlot::Unresolved(e.to_owned())),
            };
            return Some(TypeSlot::Resolved(self.alloc(Type::StaticArray(a))));
        }
        if tag == "static-string" {
            let a = StaticArray {
                debug_name: debug_name.to_owned(),
                item: TypeSlot::Resolved(self.s.primitive_id(PrimitiveKind::Char)),
                extent: Some(
                    element
                        .attr("size")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0),
                ),
                index_enum: None,
            };
            return Some(TypeSlot::Resolved(self.alloc(Type::StaticArray(a))));
        }
        if tag == "padding" {
            let padding = Padding {
                size: element
                    .attr("size")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0),
                align: element
                    .attr("align")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(1),
            };
            return Some(TypeSlot::Resolved(self.alloc(Type::Padding(padding))));
        }
        if tag == "enum" || tag == "bitfield" {
            if let Some(type_name) = element.attr("type-name") {
                if let Some(base_name) = element.attr("base-type") {
                    return match PrimitiveKind::from_tag(base_name) {
                        Some(kind) => Some(TypeSlot::Resolved(self.s.primitive_id(kind))),
                        None => {
                            self.log.error_at(
                                element,
                                format!(
                                    "{debug_name}: enum/bitfield base type \"{base_name}\" \
                                     is not a primitive type."
                                ),
                            );
                            Some(TypeSlot::Resolved(
                                self.s.primitive_id(PrimitiveKind::Int32),
                            ))
                        }
                    };
                }
                return Some(TypeSlot::Unresolved(type_name.to_owned()));
            }
            let ty = if tag == "enum" {
                Type::Enum(self.parse_enum(debug_name, element))
            } else {
                Type::Bitfield(self.parse_bitfield(debug_name, element))
            };
            return Some(TypeSlot::Resolved(self.alloc(ty)));
        }
        if let Some(kind) = PrimitiveKind::from_tag(tag) {
            return Some(TypeSlot::Resolved(self.s.primitive_id(kind)));
        }
        self.log
            .error_at(element, format!("{debug_name}: Unknown member tag: {tag}."));
        None
    }

    /// Item type of a container element: a `type-name` reference, a
    /// pointer when `pointer-type` is set, or an anonymous compound built
    /// from the children (collapsed when it has a single member).
    fn parse_item_type(&mut self, debug_name: &str, element: &XmlNode, pointer_recurse: bool) -> TypeSlot {
        if let Some(name) = element.attr("type-name") {
            return TypeSlot::Unresolved(name.to_owned());
        }
        if let Some(pointee) = element.attr("pointer-type") {
            if pointer_recurse {
                return TypeSlot::Unresolved(pointee.to_owned());
            }
            let p = self.parse_pointer(debug_name, element);
            return TypeSlot::Resolved(self.alloc(Type::Pointer(p)));
        }
        let mut compound = self.parse_compound(debug_name, element, false);
        if compound.members.len() == 1 {
            compound.members.remove(0).ty
        } else {
            TypeSlot::Resolved(self.alloc(Type::Compound(compound)))
        }
    }

    fn parse_pointer(&mut self, debug_name: &str, element: &XmlNode) -> PointerType {
        PointerType {
            debug_name: debug_name.to_owned(),
            item: Some(self.parse_item_type(debug_name, element, true)),
            is_array: attr_bool(element, "is-array"),
            has_bad_pointers: attr_bool(element, "has-bad-pointers"),
        }
    }

    fn parse_std_container(
        &mut self,
        debug_name: &str,
        element: &XmlNode,
        kind: StdKind,
    ) -> StdContainer {
        StdContainer {
            debug_name: debug_name.to_owned(),
            kind,
            params: vec![self.parse_item_type(debug_name, element, false)],
            index_enum: element
                .attr("index-enum")
                .map(|e| TypeSlot::Unresolved(e.to_owned())),
            has_bad_pointers: attr_bool(element, "has-bad-pointers"),
        }
    }

    fn parse_df_container(
        &mut self,
        debug_name: &str,
        element: &XmlNode,
        kind: DfKind,
    ) -> DfContainer {
        let mut compound = Compound {
            debug_name: debug_name.to_owned(),
            ..Compound::default()
        };
        let mut params = Vec::new();
        match kind {
            DfKind::FlagArray => {
                let u8_id = self.s.primitive_id(PrimitiveKind::UInt8);
                let bits = self.alloc(Type::Pointer(PointerType {
                    debug_name: Compound::member_debug_name(debug_name, "bits"),
                    item: Some(TypeSlot::Resolved(u8_id)),
                    ..PointerType::default()
                }));
                compound.members.push(Member {
                    name: "bits".to_owned(),
                    ty: TypeSlot::Resolved(bits),
                });
                compound.members.push(Member {
                    name: "size".to_owned(),
                    ty: TypeSlot::Resolved(self.s.primitive_id(PrimitiveKind::UInt32)),
                });
            }
            DfKind::Array => {
                let item = element.attr("type-name").unwrap_or_default().to_owned();
                let data = self.alloc(Type::Pointer(PointerType {
                    debug_name: Compound::member_debug_name(debug_name, "data"),
                    item: Some(TypeSlot::Unresolved(item.clone())),
                    ..PointerType::default()
                }));
                compound.members.push(Member {
                    name: "data".to_owned(),
                    ty: TypeSlot::Resolved(data),
                });
                compound.members.push(Member {
                    name: "size".to_owned(),
                    ty: TypeSlot::Resolved(self.s.primitive_id(PrimitiveKind::UInt16)),
                });
                params.push(TypeSlot::Unresolved(item));
            }
            DfKind::LinkedList => {}
        }
        let cid = self.alloc(Type::Compound(compound));
        DfContainer {
            debug_name: debug_name.to_owned(),
            kind,
            params,
            compound: cid,
            index_enum: element
                .attr("index-enum")
                .map(|e| TypeSlot::Unresolved(e.to_owned())),
        }
    }

    /// `df-linked-list-type`: a self-referential node compound
    /// `{ item: T*, prev: node*, next: node* }`.
    fn parse_linked_list_type(&mut self, element: &XmlNode) {
        let name = element.attr("type-name").unwrap_or_default().to_owned();
        if self.s.linked_lists.contains_key(&name) {
            self.log
                .error_at(element, format!("Duplicated type {name}."));
            return;
        }
        let item_type = element.attr("item-type").unwrap_or_default().to_owned();
        let item_ptr = self.alloc(Type::Pointer(PointerType {
            debug_name: Compound::member_debug_name(&name, "item"),
            item: Some(TypeSlot::Unresolved(item_type)),
            ..PointerType::default()
        }));
        let prev = self.alloc(Type::Pointer(PointerType {
            debug_name: Compound::member_debug_name(&name, "prev"),
            item: Some(TypeSlot::Unresolved(name.clone())),
            ..PointerType::default()
        }));
        let next = self.alloc(Type::Pointer(PointerType {
            debug_name: Compound::member_debug_name(&name, "next"),
            item: Some(TypeSlot::Unresolved(name.clone())),
            ..PointerType::default()
        }));
        let compound = self.alloc(Type::Compound(Compound {
            debug_name: name.clone(),
            members: vec![
                Member {
                    name: "item".to_owned(),
                    ty: TypeSlot::Resolved(item_ptr),
                },
                Member {
                    name: "prev".to_owned(),
                    ty: TypeSlot::Resolved(prev),
                },
                Member {
                    name: "next".to_owned(),
                    ty: TypeSlot::Resolved(next),
                },
            ],
            ..Compound::default()
        }));
        let id = self.alloc(Type::Df(DfContainer {
            debug_name: name.clone(),
            kind: DfKind::LinkedList,
            params: vec![TypeSlot::Resolved(item_ptr)],
            compound,
            index_enum: None,
        }));
        self.s.linked_lists.insert(name, id);
    }

    fn parse_enum(&mut self, debug_name: &str, element: &XmlNode) -> EnumType {
        let base = self.parse_base_type(debug_name, element);
        let mut e = EnumType {
            debug_name: debug_name.to_owned(),
            base,
            attributes: StringMap::new(),
            values: StringMap::new(),
            count: 0,
        };
        let mut next_value: i32 = 0;
        for child in &element.children {
            match child.tag.as_str() {
                "enum-item" => {
                    if let Some(v) = child.attr("value").and_then(|v| v.parse::<i32>().ok()) {
                        next_value = v;
                    }
                    let value = next_value;
                    next_value += 1;
                    let name = child.attr("name").unwrap_or_default();
                    if e.values.contains_key(name) {
                        // Unnamed items legitimately collide; named ones are errors.
                        if !name.is_empty() {
                            self.log.error_at(
                                child,
                                format!("{debug_name}: Duplicate enum item: {name}."),
                            );
                        }
                        continue;
                    }
                    e.count = next_value;
                    let mut item = EnumItem {
                        value,
                        attributes: StringMap::new(),
                    };
                    for attr in child.children_named("item-attr") {
                        item.attributes.insert(
                            attr.attr("name").unwrap_or_default().to_owned(),
                            AttributeValue::Str(attr.attr("value").unwrap_or_default().to_owned()),
                        );
                    }
                    e.values.insert(name.to_owned(), item);
                }
                "enum-attr" => {
                    let name = child.attr("name").unwrap_or_default().to_owned();
                    if e.attributes.contains_key(&name) {
                        self.log.error_at(
                            child,
                            format!("{debug_name}: Duplicate attribute name: {name}."),
                        );
                        continue;
                    }
                    e.attributes.insert(
                        name,
                        EnumAttribute {
                            ty: child
                                .attr("type-name")
                                .map(|t| TypeSlot::Unresolved(t.to_owned())),
                            default_value: child
                                .attr("default-value")
                                .map(|v| AttributeValue::Str(v.to_owned())),
                        },
                    );
                }
                _ => {}
            }
        }
        e
    }

    fn parse_bitfield(&mut self, debug_name: &str, element: &XmlNode) -> Bitfield {
        let base = self.parse_base_type(debug_name, element);
        let mut flags = Vec::new();
        let mut offset = 0;
        for child in element.children_named("flag-bit") {
            let count = child
                .attr("count")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1);
            flags.push(Flag {
                name: child.attr("name").unwrap_or_default().to_owned(),
                offset,
                count,
            });
            offset += count;
        }
        Bitfield {
            debug_name: debug_name.to_owned(),
            base,
            flags,
        }
    }

    fn parse_base_type(&mut self, debug_name: &str, element: &XmlNode) -> PrimitiveKind {
        let name = element.attr("base-type").unwrap_or("uint32_t");
        match PrimitiveKind::from_tag(name) {
            Some(kind) if kind.is_integral() => kind,
            _ => {
                self.log.error_at(
                    element,
                    format!("{debug_name}: Invalid base type \"{name}\"."),
                );
                PrimitiveKind::Int32
            }
        }
    }

    /// Materialize the members of `df-other-vectors-type` compounds: one
    /// vector-of-pointers per index-enum value, unless overridden.
    fn build_other_vectors(&mut self) {
        let builders = std::mem::take(&mut self.other_vectors);
        for builder in builders {
            let Some(compound_id) = builder.compound else {
                continue;
            };
            let Some(&enum_id) = self.s.enums.get(&builder.index_enum) else {
                self.log.error(format!(
                    "Cannot resolve other-vectors index enum reference to {}.",
                    builder.index_enum
                ));
                continue;
            };
            let Type::Enum(e) = self.s.get(enum_id) else {
                continue;
            };
            let mut names: Vec<String> = Vec::new();
            for (name, item) in &e.values {
                if item.value < 0 {
                    continue;
                }
                let index = item.value as usize;
                if index >= names.len() {
                    names.resize(index + 1, String::new());
                }
                names[index] = name.clone();
            }
            let debug_name = match self.s.get(compound_id) {
                Type::Compound(c) => c.debug_name.clone(),
                _ => continue,
            };
            let mut overrides = builder.overrides;
            let mut members = Vec::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                if name.is_empty() {
                    self.log.error(format!(
                        "missing name for member {index} in other-vectors compound {debug_name}."
                    ));
                }
                if let Some(pos) = overrides.iter().position(|m| &m.name == name) {
                    members.push(overrides.remove(pos));
                    continue;
                }
                let member_name = Compound::member_debug_name(&debug_name, name);
                let pointer = self.alloc(Type::Pointer(PointerType {
                    debug_name: member_name.clone(),
                    item: Some(TypeSlot::Unresolved(builder.default_item_type.clone())),
                    ..PointerType::default()
                }));
                let vector = self.alloc(Type::Std(StdContainer {
                    debug_name: member_name,
                    kind: StdKind::Vector,
                    params: vec![TypeSlot::Resolved(pointer)],
                    index_enum: None,
                    has_bad_pointers: false,
                }));
                members.push(Member {
                    name: name.clone(),
                    ty: TypeSlot::Resolved(vector),
                });
            }
            if let Type::Compound(c) = &mut self.s.arena[compound_id.0 as usize] {
                c.members = members;
            }
        }
    }

    fn load_symbols(&mut self, doc: &XmlNode) {
        for table in doc.children_named("symbol-table") {
            let mut version = VersionInfo {
                version_name: table.attr("name").unwrap_or_default().to_owned(),
                ..VersionInfo::default()
            };
            for element in &table.children {
                match element.tag.as_str() {
                    "binary-timestamp" => {
                        let value = element.attr("value").and_then(symbols::parse_uint);
                        match value {
                            Some(timestamp) => {
                                version.id = (timestamp as u32).to_be_bytes().to_vec();
                            }
                            None => self
                                .log
                                .error_at(element, "invalid binary timestamp".to_owned()),
                        }
                    }
                    "md5-hash" => {
                        match element.attr("value").and_then(symbols::parse_md5) {
                            Some(digest) => version.id = digest.to_vec(),
                            None => self.log.error_at(element, "invalid md5 string".to_owned()),
                        }
                    }
                    "global-address" => {
                        let name = element.attr("name").unwrap_or_default().to_owned();
                        let value = element.attr("value").and_then(symbols::parse_uint);
                        match value {
                            Some(address) => {
                                if version
                                    .global_addresses
                                    .insert(name.clone(), address as usize)
                                    .is_some()
                                {
                                    self.log.error_at(
                                        element,
                                        format!("Duplicate global-address for {name}."),
                                    );
                                }
                            }
                            None => self.log.error_at(
                                element,
                                format!("Invalid global-address value for {name}."),
                            ),
                        }
                    }
                    "vtable-address" => {
                        let name = element.attr("name").unwrap_or_default().to_owned();
                        let value = element.attr("value").and_then(symbols::parse_uint);
                        match value {
                            Some(address) => {
                                if version
                                    .vtable_addresses
                                    .insert(name.clone(), address as usize)
                                    .is_some()
                                {
                                    self.log.error_at(
                                        element,
                                        format!("Duplicate vtable-address for {name}."),
                                    );
                                }
                            }
                            None => self.log.error_at(
                                element,
                                format!("Invalid vtable-address value for {name}."),
                            ),
                        }
                    }
                    other => {
                        self.log.error_at(
                            element,
                            format!("Unknown element {other} in symbol-table."),
                        );
                    }
                }
            }
            self.s.versions.push(version);
        }
    }

    /// Rewrite every name reference to an arena index. Failures are
    /// logged; the load fails afterwards.
    fn resolve(&mut self) {
        let Loader { s, log, .. } = self;
        let tables = NameTables {
            primitives: &s.primitives,
            compounds: &s.compounds,
            enums: &s.enums,
            bitfields: &s.bitfields,
            linked_lists: &s.linked_lists,
            generic_pointer: s.generic_pointer,
        };

        for ty in &mut s.arena {
            match ty {
                Type::Compound(c) => {
                    let debug_name = c.debug_name.clone();
                    if let Some(parent) = &mut c.parent {
                        tables.resolve_expect(
                            parent,
                            Expect::Compound,
                            log,
                            &format!("{debug_name} parent"),
                        );
                    }
                    for member in &mut c.members {
                        tables.resolve(
                            &mut member.ty,
                            log,
                            &format!("{debug_name} member {}", member.name),
                        );
                    }
                    for method in &mut c.vmethods {
                        if let Some(ret) = &mut method.return_type {
                            tables.resolve(
                                ret,
                                log,
                                &format!("{debug_name}::{} return type", method.name),
                            );
                        }
                        for (arg_name, arg) in &mut method.args {
                            tables.resolve(
                                arg,
                                log,
                                &format!("{debug_name}::{} parameter {arg_name}", method.name),
                            );
                        }
                    }
                }
                Type::Pointer(p) => {
                    let debug_name = p.debug_name.clone();
                    if let Some(item) = &mut p.item {
                        tables.resolve(item, log, &format!("{debug_name} item type"));
                    }
                }
                Type::StaticArray(a) => {
                    let debug_name = a.debug_name.clone();
                    tables.resolve(&mut a.item, log, &format!("{debug_name} item type"));
                    if let Some(index_enum) = &mut a.index_enum {
                        tables.resolve_expect(
                            index_enum,
                            Expect::Enum,
                            log,
                            &format!("{debug_name} index enum"),
                        );
                    }
                }
                Type::Std(c) => {
                    let debug_name = c.debug_name.clone();
                    for param in &mut c.params {
                        tables.resolve(param, log, &format!("{debug_name} item type"));
                    }
                    if let Some(index_enum) = &mut c.index_enum {
                        tables.resolve_expect(
                            index_enum,
                            Expect::Enum,
                            log,
                            &format!("{debug_name} index enum"),
                        );
                    }
                }
                Type::Df(c) => {
                    let debug_name = c.debug_name.clone();
                    for param in &mut c.params {
                        tables.resolve(param, log, &format!("{debug_name} item type"));
                    }
                    if let Some(index_enum) = &mut c.index_enum {
                        tables.resolve_expect(
                            index_enum,
                            Expect::Enum,
                            log,
                            &format!("{debug_name} index enum"),
                        );
                    }
                }
                Type::Enum(e) => {
                    let debug_name = e.debug_name.clone();
                    for (name, attr) in &mut e.attributes {
                        if let Some(ty) = &mut attr.ty {
                            tables.resolve(ty, log, &format!("{debug_name} attribute {name}"));
                        }
                    }
                }
                Type::Primitive(_) | Type::Bitfield(_) | Type::Padding(_) => {}
            }
        }

        for (name, slot) in &mut s.globals {
            tables.resolve(slot, log, &format!("global {name}"));
        }

        Self::resolve_array_extents(s, log);
        Self::resolve_enum_attributes(s, log);
    }

    /// Derive missing static-array extents from their index enums.
    fn resolve_array_extents(s: &mut Structures, log: &mut ErrorLog) {
        let mut fixes = Vec::new();
        for (index, ty) in s.arena.iter().enumerate() {
            let Type::StaticArray(a) = ty else { continue };
            if a.extent.is_some() {
                continue;
            }
            let from_enum = a
                .index_enum
                .as_ref()
                .and_then(|slot| slot.id())
                .and_then(|eid| match &s.arena[eid.0 as usize] {
                    Type::Enum(e) => Some(e.count.max(0) as usize),
                    _ => None,
                });
            match from_enum {
                Some(extent) => fixes.push((index, extent)),
                None => log.error(format!("Missing extent for static array {}.", a.debug_name)),
            }
        }
        for (index, extent) in fixes {
            if let Type::StaticArray(a) = &mut s.arena[index] {
                a.extent = Some(extent);
            }
        }
    }

    /// Parse typed enum attribute values (defaults and per-item
    /// overrides) now that attribute type references are resolved.
    fn resolve_enum_attributes(s: &mut Structures, log: &mut ErrorLog) {
        enum Target {
            Primitive(PrimitiveKind),
            EnumValues(StringMap<i32>),
        }

        let mut work = Vec::new();
        for (index, ty) in s.arena.iter().enumerate() {
            let Type::Enum(e) = ty else { continue };
            for (attr_name, attr) in &e.attributes {
                let Some(tid) = attr.ty.as_ref().and_then(|slot| slot.id()) else {
                    continue;
                };
                let target = match &s.arena[tid.0 as usize] {
                    Type::Primitive(kind) if kind.is_integral() => Target::Primitive(*kind),
                    Type::Enum(target) => Target::EnumValues(
                        target
                            .values
                            .iter()
                            .map(|(name, item)| (name.clone(), item.value))
                            .collect(),
                    ),
                    _ => {
                        log.error(format!(
                            "{}: invalid type for enum attribute {attr_name}.",
                            e.debug_name
                        ));
                        continue;
                    }
                };
                work.push((index, attr_name.clone(), target));
            }
        }

        fn parse(target: &Target, value: &str) -> Result<AttributeValue, String> {
            match target {
                Target::Primitive(PrimitiveKind::Bool) => match value {
                    "true" => Ok(AttributeValue::Bool(true)),
                    "false" => Ok(AttributeValue::Bool(false)),
                    _ => Err(format!("\"{value}\" is not a boolean")),
                },
                Target::Primitive(PrimitiveKind::UInt64) => value
                    .parse::<u64>()
                    .map(AttributeValue::UInt)
                    .map_err(|_| format!("\"{value}\" is not an integer")),
                Target::Primitive(_) => value
                    .parse::<i64>()
                    .map(AttributeValue::Int)
                    .map_err(|_| format!("\"{value}\" is not an integer")),
                Target::EnumValues(values) => values
                    .get(value)
                    .map(|&v| AttributeValue::EnumValue {
                        name: value.to_owned(),
                        value: v,
                    })
                    .ok_or_else(|| format!("Unknown enum value: {value}")),
            }
        }

        for (index, attr_name, target) in work {
            let Type::Enum(e) = &mut s.arena[index] else {
                continue;
            };
            let debug_name = e.debug_name.clone();
            if let Some(attr) = e.attributes.get_mut(&attr_name) {
                if let Some(AttributeValue::Str(raw)) = attr.default_value.clone() {
                    match parse(&target, &raw) {
                        Ok(value) => attr.default_value = Some(value),
                        Err(err) => log.error(format!(
                            "{debug_name}: Failed to parse default value for attribute \
                             {attr_name}: {err}."
                        )),
                    }
                }
            }
            for (item_name, item) in &mut e.values {
                if let Some(AttributeValue::Str(raw)) = item.attributes.get(&attr_name).cloned() {
                    match parse(&target, &raw) {
                        Ok(value) => {
                            item.attributes.insert(attr_name.clone(), value);
                        }
                        Err(err) => log.error(format!(
                            "{debug_name}: Failed to parse value for attribute {attr_name} \
                             of item {item_name}: {err}."
                        )),
                    }
                }
            }
        }

        // Item attributes that were never declared on the enum.
        let mut errors = Vec::new();
        for ty in &s.arena {
            let Type::Enum(e) = ty else { continue };
            for (item_name, item) in &e.values {
                for attr_name in item.attributes.keys() {
                    if !e.attributes.contains_key(attr_name) {
                        errors.push(format!(
                            "{}: Unknown enum attribute {attr_name} (item {item_name}).",
                            e.debug_name
                        ));
                    }
                }
            }
        }
        for message in errors {
            log.error(message);
        }
    }
}

enum Expect {
    Any,
    Compound,
    Enum,
}

struct NameTables<'a> {
    primitives: &'a StringMap<TypeId>,
    compounds: &'a StringMap<TypeId>,
    enums: &'a StringMap<TypeId>,
    bitfields: &'a StringMap<TypeId>,
    linked_lists: &'a StringMap<TypeId>,
    generic_pointer: TypeId,
}

impl NameTables<'_> {
    fn lookup(&self, name: &str, expect: &Expect) -> Option<TypeId> {
        match expect {
            Expect::Compound => self.compounds.get(name).copied(),
            Expect::Enum => self.enums.get(name).copied(),
            Expect::Any => self
                .primitives
                .get(name)
                .or_else(|| self.compounds.get(name))
                .or_else(|| self.enums.get(name))
                .or_else(|| self.bitfields.get(name))
                .or_else(|| self.linked_lists.get(name))
                .copied()
                .or((name == "pointer").then_some(self.generic_pointer)),
        }
    }

    fn resolve(&self, slot: &mut TypeSlot, log: &mut ErrorLog, context: &str) {
        self.resolve_expect(slot, Expect::Any, log, context);
    }

    fn resolve_expect(&self, slot: &mut TypeSlot, expect: Expect, log: &mut ErrorLog, context: &str) {
        if let TypeSlot::Unresolved(name) = slot {
            match self.lookup(name, &expect) {
                Some(id) => *slot = TypeSlot::Resolved(id),
                None => log.error(format!("Cannot resolve {context} reference to {name}.")),
            }
        }
    }
}
