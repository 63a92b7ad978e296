//! Size, alignment and member-offset computation.
//!
//! [`MemoryLayout::new`] walks every type reachable from the schema's
//! named types and globals and records its [`TypeInfo`], plus a
//! [`CompoundLayout`] for every compound. Pointer and most container
//! members break layout cycles; `optional`/`variant` do not, and a
//! compound re-entered while still being laid out is a hard error.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::abi::{round_up, Abi, CompilerKind, TypeInfo};
use crate::path::{PathItem, PathIndex};
use crate::schema::{Structures, Type, TypeId, TypeSlot};

/// Layout computation and offset query errors.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cyclic dependency through {0}")]
    CyclicDependency(String),
    #[error("unresolved reference to {0}")]
    UnresolvedReference(String),
    #[error("missing extent for static array {0}")]
    MissingExtent(String),
    #[error("invalid type parameters for {0}")]
    BadContainer(String),
    #[error("no layout for type {0}")]
    MissingTypeInfo(String),
    #[error("member {0} not found")]
    MemberNotFound(String),
    #[error("identifier needs a compound")]
    NeedsCompound,
    #[error("container_of needs a compound")]
    ContainerOfNeedsCompound,
    #[error("index needs a container")]
    NeedsContainer,
    #[error("index needs a static array")]
    NeedsStaticArray,
    #[error("named index on array without index enum")]
    NoIndexEnum,
    #[error("invalid index {0}")]
    InvalidIndex(String),
}

/// Extra layout information for a compound, beyond [`TypeInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundLayout {
    /// Size without the trailing padding. Under the GNU discipline a
    /// child's members start here rather than at the padded size.
    pub unaligned_size: usize,
    /// Offset for each member, indexed like `Compound::members`.
    pub member_offsets: Vec<usize>,
}

/// Sizes, alignments and member offsets for every reachable schema type
/// under one ABI. Computed once, immutable afterwards.
#[derive(Debug)]
pub struct MemoryLayout {
    type_info: HashMap<TypeId, TypeInfo>,
    compound_layout: HashMap<TypeId, CompoundLayout>,
}

impl MemoryLayout {
    /// Compute layout for all of `structures` under `abi`.
    pub fn new(structures: &Structures, abi: &Abi) -> Result<MemoryLayout, LayoutError> {
        let mut builder = Builder {
            s: structures,
            abi,
            type_info: HashMap::new(),
            compound_layout: HashMap::new(),
            in_progress: HashSet::new(),
            unvisited: BTreeSet::new(),
        };

        builder.unvisited.insert(structures.generic_pointer());
        for id in structures.all_primitives() {
            builder.unvisited.insert(id);
        }
        for (_, id) in structures.all_enums() {
            builder.unvisited.insert(id);
        }
        for (_, id) in structures.all_bitfields() {
            builder.unvisited.insert(id);
        }
        for (_, id) in structures.all_compounds() {
            builder.unvisited.insert(id);
        }
        for (_, id) in structures.all_linked_lists() {
            builder.unvisited.insert(id);
        }
        for (_, id) in structures.all_globals() {
            if let Some(id) = id {
                if !builder.type_info.contains_key(&id) {
                    builder.unvisited.insert(id);
                }
            }
        }

        while let Some(&id) = builder.unvisited.iter().next() {
            builder.info_of(id)?;
        }

        Ok(MemoryLayout {
            type_info: builder.type_info,
            compound_layout: builder.compound_layout,
        })
    }

    /// Size and alignment of `id`.
    pub fn type_info(&self, id: TypeId) -> Option<TypeInfo> {
        self.type_info.get(&id).copied()
    }

    /// Member offsets of a compound.
    pub fn compound(&self, id: TypeId) -> Option<&CompoundLayout> {
        self.compound_layout.get(&id)
    }

    pub(crate) fn require_info(
        &self,
        structures: &Structures,
        id: TypeId,
    ) -> Result<TypeInfo, LayoutError> {
        self.type_info(id)
            .ok_or_else(|| LayoutError::MissingTypeInfo(structures.describe(id)))
    }

    fn slot_id(slot: &TypeSlot) -> Result<TypeId, LayoutError> {
        slot.id().ok_or_else(|| {
            LayoutError::UnresolvedReference(slot.unresolved_name().unwrap_or_default().to_owned())
        })
    }

    /// Walk `path` from `base` and return the addressed type and its byte
    /// offset from the start of `base`.
    ///
    /// Identifiers descend into members (through anonymous compounds),
    /// `container_of` accounts only the outermost anonymous member's
    /// offset, and indices require a static array.
    pub fn offset_of(
        &self,
        structures: &Structures,
        base: TypeId,
        path: &[PathItem],
    ) -> Result<(TypeId, usize), LayoutError> {
        let mut ty = base;
        let mut offset = 0usize;
        for item in path {
            match item {
                PathItem::Identifier(name) => {
                    if structures.compound(ty).is_none() {
                        return Err(LayoutError::NeedsCompound);
                    }
                    let found = structures.search_member(ty, name);
                    if found.is_empty() {
                        return Err(LayoutError::MemberNotFound(name.clone()));
                    }
                    for (parent, index) in found {
                        let layout = self
                            .compound(parent)
                            .ok_or_else(|| LayoutError::MissingTypeInfo(structures.describe(parent)))?;
                        offset += layout.member_offsets[index];
                        let member = structures
                            .compound(parent)
                            .and_then(|c| c.members.get(index))
                            .ok_or(LayoutError::NeedsCompound)?;
                        ty = Self::slot_id(&member.ty)?;
                    }
                }
                PathItem::ContainerOf(name) => {
                    if structures.compound(ty).is_none() {
                        return Err(LayoutError::ContainerOfNeedsCompound);
                    }
                    let found = structures.search_member(ty, name);
                    let Some(&(parent, index)) = found.first() else {
                        return Err(LayoutError::MemberNotFound(name.clone()));
                    };
                    let layout = self
                        .compound(parent)
                        .ok_or_else(|| LayoutError::MissingTypeInfo(structures.describe(parent)))?;
                    offset += layout.member_offsets[index];
                    let member = structures
                        .compound(parent)
                        .and_then(|c| c.members.get(index))
                        .ok_or(LayoutError::ContainerOfNeedsCompound)?;
                    ty = Self::slot_id(&member.ty)?;
                }
                PathItem::Index(index) => {
                    let array = match structures.get(ty) {
                        Type::StaticArray(array) => array,
                        Type::Pointer(_) | Type::Std(_) | Type::Df(_) => {
                            return Err(LayoutError::NeedsStaticArray)
                        }
                        _ => return Err(LayoutError::NeedsContainer),
                    };
                    let i = match index {
                        PathIndex::Number(n) => *n,
                        PathIndex::Name(name) => {
                            let Some(eid) = array.index_enum.as_ref().and_then(|slot| slot.id())
                            else {
                                return Err(LayoutError::NoIndexEnum);
                            };
                            let Type::Enum(e) = structures.get(eid) else {
                                return Err(LayoutError::NoIndexEnum);
                            };
                            let value = e
                                .value(name)
                                .ok_or_else(|| LayoutError::InvalidIndex(name.clone()))?;
                            if value < 0 || value as usize >= array.extent.unwrap_or(0) {
                                return Err(LayoutError::InvalidIndex(name.clone()));
                            }
                            value as usize
                        }
                    };
                    let item = Self::slot_id(&array.item)?;
                    let info = self.require_info(structures, item)?;
                    offset += i * info.size;
                    ty = item;
                }
            }
        }
        Ok((ty, offset))
    }
}

struct Builder<'a> {
    s: &'a Structures,
    abi: &'a Abi,
    type_info: HashMap<TypeId, TypeInfo>,
    compound_layout: HashMap<TypeId, CompoundLayout>,
    in_progress: HashSet<TypeId>,
    unvisited: BTreeSet<TypeId>,
}

impl<'a> Builder<'a> {
    fn info_of(&mut self, id: TypeId) -> Result<TypeInfo, LayoutError> {
        if let Some(info) = self.type_info.get(&id) {
            self.unvisited.remove(&id);
            return Ok(*info);
        }
        self.compute(id)
    }

    fn slot_info(&mut self, slot: &TypeSlot) -> Result<TypeInfo, LayoutError> {
        self.info_of(MemoryLayout::slot_id(slot)?)
    }

    /// Queue a pointed-to type for later computation without requiring it
    /// to be complete now.
    fn defer(&mut self, slot: &TypeSlot) {
        if let Some(id) = slot.id() {
            if !self.type_info.contains_key(&id) {
                self.unvisited.insert(id);
            }
        }
    }

    fn compute(&mut self, id: TypeId) -> Result<TypeInfo, LayoutError> {
        let s = self.s;
        let info = match s.get(id) {
            Type::Primitive(kind) => self.abi.primitive(*kind),
            Type::Enum(e) => self.abi.primitive(e.base),
            Type::Bitfield(b) => self.abi.primitive(b.base),
            Type::Padding(padding) => TypeInfo::new(padding.size, padding.align),
            Type::Pointer(p) => {
                if let Some(item) = &p.item {
                    self.defer(item);
                }
                self.abi.pointer()
            }
            Type::StaticArray(array) => {
                let extent = array
                    .extent
                    .ok_or_else(|| LayoutError::MissingExtent(array.debug_name.clone()))?;
                let item = self.slot_info(&array.item)?;
                TypeInfo::new(extent * item.size, item.align)
            }
            Type::Std(container) => {
                if container.kind.requires_complete_types() {
                    let mut params = Vec::with_capacity(container.params.len());
                    for param in &container.params {
                        params.push(self.slot_info(param)?);
                    }
                    self.abi
                        .dependent_container(container.kind, &params)
                        .ok_or_else(|| LayoutError::BadContainer(container.debug_name.clone()))?
                } else {
                    for param in &container.params {
                        self.defer(param);
                    }
                    self.abi.std_container(container.kind)
                }
            }
            Type::Df(container) => {
                for param in &container.params {
                    self.defer(param);
                }
                self.info_of(container.compound)?
            }
            Type::Compound(compound) => {
                if !self.in_progress.insert(id) {
                    return Err(LayoutError::CyclicDependency(compound.debug_name.clone()));
                }

                let mut offset = 0usize;
                let mut align = 1usize;
                let mut union_size = 0usize;

                if let Some(parent) = &compound.parent {
                    let parent_id = MemoryLayout::slot_id(parent)?;
                    let parent_info = self.info_of(parent_id)?;
                    offset = match self.abi.compiler {
                        // Itanium tail packing: a child may reuse the
                        // parent's trailing padding.
                        CompilerKind::Gnu => {
                            self.compound_layout
                                .get(&parent_id)
                                .ok_or_else(|| {
                                    LayoutError::MissingTypeInfo(self.s.describe(parent_id))
                                })?
                                .unaligned_size
                        }
                        CompilerKind::Msvc => parent_info.size,
                    };
                    align = parent_info.align;
                } else if compound.vtable {
                    let pointer = self.abi.pointer();
                    offset = pointer.size;
                    align = pointer.align;
                }

                let mut member_offsets = Vec::with_capacity(compound.members.len());
                for member in &compound.members {
                    let member_info = self.slot_info(&member.ty)?;
                    let member_offset = round_up(offset, member_info.align.max(1));
                    member_offsets.push(if compound.is_union { 0 } else { member_offset });
                    if compound.is_union {
                        union_size = union_size.max(member_info.size);
                    } else {
                        offset = member_offset + member_info.size;
                    }
                    align = align.max(member_info.align);
                }

                let unaligned_size = if compound.is_union { union_size } else { offset };
                self.compound_layout.insert(
                    id,
                    CompoundLayout {
                        unaligned_size,
                        member_offsets,
                    },
                );
                self.in_progress.remove(&id);
                TypeInfo::new(round_up(unaligned_size, align), align)
            }
        };
        self.unvisited.remove(&id);
        self.type_info.insert(id, info);
        Ok(info)
    }
}
