//! Compound reader composition.
//!
//! A structure destination declares its fields with a [`CompoundSpec`]:
//! an optional vtable slot, base projections, and path-addressed fields
//! whose offsets are resolved against the layout at construction time.
//! Unsequenced composition (the default) reads every field concurrently
//! into an owned temporary and applies write-backs in declaration order;
//! sequenced composition reads in place left-to-right, which is required
//! for fields whose union discriminator is computed from earlier fields.

use std::cell::OnceCell;
use std::rc::Rc;

use futures::future::{join_all, LocalBoxFuture};
use tracing::warn;

use super::item::{ItemReader, ReadArgs, ReadDest};
use super::{ReadError, ReadSession, TypeError};
use crate::abi::TypeInfo;
use crate::path;
use crate::process::MemoryView;
use crate::schema::TypeId;
use crate::ReaderFactory;

/// Discriminator value that reads no union alternative, successfully.
pub const NO_ALTERNATIVE: usize = usize::MAX;

/// A structure destination readable through a [`CompoundReader`].
pub trait ReadableStructure: Default + Sized + 'static {
    fn spec() -> CompoundSpec<Self>;
}

/// A union destination readable through a [`UnionReader`].
pub trait ReadableUnion: Default + Sized + 'static {
    fn spec() -> UnionSpec<Self>;
}

type Writeback<T> = Box<dyn FnOnce(&mut T)>;

trait FieldRead<T> {
    fn label(&self) -> &str;

    /// Sequenced read: later fields observe the effect.
    fn read_in_place<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>>;

    /// Unsequenced read into an owned value, applied later.
    fn read_detached<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
    ) -> LocalBoxFuture<'a, Result<Writeback<T>, ReadError>>;
}

trait FieldSpec<T> {
    /// Resolve this field against the schema compound. Failures are
    /// returned as messages for the caller to log.
    fn init(
        &self,
        factory: &ReaderFactory<'_>,
        compound: TypeId,
        sequenced: bool,
    ) -> Result<Box<dyn FieldRead<T>>, String>;
}

/// Declaration of a structure destination's fields.
pub struct CompoundSpec<T> {
    type_path: &'static str,
    sequenced: bool,
    fields: Vec<Box<dyn FieldSpec<T>>>,
}

impl<T: ReadableStructure> CompoundSpec<T> {
    /// Unsequenced structure reader for the compound at `type_path`.
    pub fn structure(type_path: &'static str) -> CompoundSpec<T> {
        CompoundSpec {
            type_path,
            sequenced: false,
            fields: Vec::new(),
        }
    }

    /// Sequenced structure reader: fields are read strictly in order, so
    /// discriminators may inspect earlier fields.
    pub fn sequenced(type_path: &'static str) -> CompoundSpec<T> {
        CompoundSpec {
            type_path,
            sequenced: true,
            fields: Vec::new(),
        }
    }

    /// Store the vtable word (the compound's first pointer) in a member.
    pub fn vtable(mut self, access: fn(&mut T) -> &mut usize) -> Self {
        self.fields.push(Box::new(VtableDef { access }));
        self
    }

    /// Read the leading bytes as the base structure `U`.
    pub fn base<U: ReadableStructure>(mut self, access: fn(&mut T) -> &mut U) -> Self {
        self.fields.push(Box::new(BaseDef { access }));
        self
    }

    /// Read the member at `path` into the accessed field.
    pub fn field<F: ReadDest + Default>(
        mut self,
        path: &'static str,
        access: fn(&mut T) -> &mut F,
    ) -> Self {
        self.fields.push(Box::new(FieldDef {
            path,
            access,
            discriminator: None,
        }));
        self
    }

    /// Like [`CompoundSpec::field`], with a discriminator computed from
    /// the partially-read structure and handed to the member's reader
    /// (union members need one). Requires a sequenced spec.
    pub fn field_with<F: ReadDest + Default>(
        mut self,
        path: &'static str,
        access: fn(&mut T) -> &mut F,
        discriminator: fn(&T) -> ReadArgs,
    ) -> Self {
        self.fields.push(Box::new(FieldDef {
            path,
            access,
            discriminator: Some(discriminator),
        }));
        self
    }
}

/// Reads a non-union compound into a structure destination.
pub struct CompoundReader<T> {
    compound: TypeId,
    info: TypeInfo,
    sequenced: bool,
    debug_name: String,
    schema_name: String,
    symbol: Option<String>,
    fields: OnceCell<Vec<Box<dyn FieldRead<T>>>>,
}

impl<T: ReadableStructure> CompoundReader<T> {
    pub(crate) fn new(
        factory: &ReaderFactory<'_>,
        spec: &CompoundSpec<T>,
    ) -> Result<CompoundReader<T>, TypeError> {
        let (compound, schema_name) = resolve_compound::<T>(factory, spec.type_path)?;
        let node = factory
            .structures
            .compound(compound)
            .ok_or_else(|| type_error::<T>(factory, compound, "not a compound"))?;
        if node.is_union {
            return Err(type_error::<T>(factory, compound, "is a union"));
        }
        let info = factory
            .layout
            .type_info(compound)
            .ok_or_else(|| type_error::<T>(factory, compound, "no layout for compound"))?;
        Ok(CompoundReader {
            compound,
            info,
            sequenced: spec.sequenced,
            debug_name: node.debug_name.clone(),
            schema_name,
            symbol: node.symbol.clone(),
            fields: OnceCell::new(),
        })
    }

    pub(crate) fn init(
        &self,
        factory: &ReaderFactory<'_>,
        spec: CompoundSpec<T>,
    ) -> Result<(), TypeError> {
        let mut fields = Vec::with_capacity(spec.fields.len());
        let mut failed = false;
        for field in &spec.fields {
            match field.init(factory, self.compound, self.sequenced) {
                Ok(reader) => fields.push(reader),
                Err(message) => {
                    warn!(compound = %self.debug_name, "{message}");
                    failed = true;
                }
            }
        }
        let _ = self.fields.set(fields);
        if failed {
            Err(type_error::<T>(
                factory,
                self.compound,
                "nested errors in compound reader",
            ))
        } else {
            Ok(())
        }
    }

    /// The schema compound this reader decodes.
    pub fn compound(&self) -> TypeId {
        self.compound
    }

    /// Size and alignment of the schema compound.
    pub fn info(&self) -> TypeInfo {
        self.info
    }

    /// Symbol name used to locate this compound's vtable address.
    pub fn vtable_symbol(&self) -> &str {
        self.symbol.as_deref().unwrap_or(&self.schema_name)
    }

    pub fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let Some(fields) = self.fields.get() else {
                // Construction failed earlier; the session sees it here.
                return Err(ReadError::InvalidField);
            };
            let mut ok = true;
            if self.sequenced {
                for field in fields {
                    if let Err(err) = field.read_in_place(session, data, out).await {
                        warn!(
                            field = field.label(),
                            compound = %self.debug_name,
                            "read failed: {err}"
                        );
                        ok = false;
                    }
                }
            } else {
                let results =
                    join_all(fields.iter().map(|field| field.read_detached(session, data))).await;
                for (field, result) in fields.iter().zip(results) {
                    match result {
                        Ok(writeback) => writeback(out),
                        Err(err) => {
                            warn!(
                                field = field.label(),
                                compound = %self.debug_name,
                                "read failed: {err}"
                            );
                            ok = false;
                        }
                    }
                }
            }
            if ok {
                Ok(())
            } else {
                Err(ReadError::InvalidField)
            }
        })
    }
}

fn type_error<T>(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
    message: impl Into<String>,
) -> TypeError {
    TypeError::new(factory.structures, ty, std::any::type_name::<T>(), message)
}

fn resolve_compound<T>(
    factory: &ReaderFactory<'_>,
    type_path: &'static str,
) -> Result<(TypeId, String), TypeError> {
    let parsed = path::parse(type_path).map_err(|err| {
        TypeError::with_name(
            type_path,
            std::any::type_name::<T>(),
            format!("invalid type path: {err}"),
        )
    })?;
    let compound = factory.structures.find_compound_path(&parsed).map_err(|err| {
        TypeError::with_name(
            type_path,
            std::any::type_name::<T>(),
            format!("type not found: {err}"),
        )
    })?;
    let schema_name = match parsed.first() {
        Some(path::PathItem::Identifier(name)) => name.clone(),
        _ => type_path.to_owned(),
    };
    Ok((compound, schema_name))
}

// ---------------------------------------------------------------------
// Field kinds

struct VtableDef<T> {
    access: fn(&mut T) -> &mut usize,
}

struct VtableField<T> {
    access: fn(&mut T) -> &mut usize,
}

impl<T: 'static> FieldSpec<T> for VtableDef<T> {
    fn init(
        &self,
        factory: &ReaderFactory<'_>,
        compound: TypeId,
        _sequenced: bool,
    ) -> Result<Box<dyn FieldRead<T>>, String> {
        match factory.structures.compound(compound) {
            Some(node) if node.vtable => Ok(Box::new(VtableField {
                access: self.access,
            })),
            Some(node) => Err(format!("compound {} does not have a vtable", node.debug_name)),
            None => Err("not a compound".to_owned()),
        }
    }
}

impl<T: 'static> FieldRead<T> for VtableField<T> {
    fn label(&self) -> &str {
        "vtable"
    }

    fn read_in_place<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            *(self.access)(out) = session.abi().read_pointer(data.data);
            Ok(())
        })
    }

    fn read_detached<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
    ) -> LocalBoxFuture<'a, Result<Writeback<T>, ReadError>> {
        Box::pin(async move {
            let value = session.abi().read_pointer(data.data);
            let access = self.access;
            Ok(Box::new(move |out: &mut T| *access(out) = value) as Writeback<T>)
        })
    }
}

struct BaseDef<T, U: ReadableStructure> {
    access: fn(&mut T) -> &mut U,
}

struct BaseField<T, U: ReadableStructure> {
    reader: Rc<CompoundReader<U>>,
    access: fn(&mut T) -> &mut U,
}

impl<T: 'static, U: ReadableStructure> FieldSpec<T> for BaseDef<T, U> {
    fn init(
        &self,
        factory: &ReaderFactory<'_>,
        compound: TypeId,
        _sequenced: bool,
    ) -> Result<Box<dyn FieldRead<T>>, String> {
        let reader = factory
            .compound_reader::<U>()
            .map_err(|err| format!("init error in base {}: {err}", std::any::type_name::<U>()))?;
        // The schema compound's parent chain must contain the base.
        let mut current = compound;
        loop {
            let Some(node) = factory.structures.compound(current) else {
                return Err("not a compound".to_owned());
            };
            let Some(parent) = node.parent.as_ref().and_then(|slot| slot.id()) else {
                return Err(format!(
                    "{} ({}) is not a base of {}",
                    reader.debug_name,
                    std::any::type_name::<U>(),
                    node.debug_name
                ));
            };
            if parent == reader.compound() {
                break;
            }
            current = parent;
        }
        Ok(Box::new(BaseField {
            reader,
            access: self.access,
        }))
    }
}

impl<T: 'static, U: ReadableStructure> FieldRead<T> for BaseField<T, U> {
    fn label(&self) -> &str {
        &self.reader.debug_name
    }

    fn read_in_place<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        self.reader.read(session, data, (self.access)(out))
    }

    fn read_detached<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
    ) -> LocalBoxFuture<'a, Result<Writeback<T>, ReadError>> {
        Box::pin(async move {
            let mut value = U::default();
            self.reader.read(session, data, &mut value).await?;
            let access = self.access;
            Ok(Box::new(move |out: &mut T| *access(out) = value) as Writeback<T>)
        })
    }
}

struct FieldDef<T, F: ReadDest> {
    path: &'static str,
    access: fn(&mut T) -> &mut F,
    discriminator: Option<fn(&T) -> ReadArgs>,
}

struct BoundField<T, F: ReadDest> {
    path: &'static str,
    offset: usize,
    reader: ItemReader<F>,
    access: fn(&mut T) -> &mut F,
    discriminator: Option<fn(&T) -> ReadArgs>,
}

impl<T: 'static, F: ReadDest + Default> FieldSpec<T> for FieldDef<T, F> {
    fn init(
        &self,
        factory: &ReaderFactory<'_>,
        compound: TypeId,
        sequenced: bool,
    ) -> Result<Box<dyn FieldRead<T>>, String> {
        if self.discriminator.is_some() && !sequenced {
            return Err(format!(
                "field {} has a discriminator but the reader is unsequenced",
                self.path
            ));
        }
        let parsed =
            path::parse(self.path).map_err(|err| format!("invalid path {}: {err}", self.path))?;
        let (ty, offset) = factory
            .layout
            .offset_of(factory.structures, compound, &parsed)
            .map_err(|err| format!("member \"{}\" not found: {err}", self.path))?;
        let reader = F::make_reader(factory, ty)
            .map_err(|err| format!("{} (member \"{}\")", err, self.path))?;
        Ok(Box::new(BoundField {
            path: self.path,
            offset,
            reader,
            access: self.access,
            discriminator: self.discriminator,
        }))
    }
}

impl<T: 'static, F: ReadDest + Default> FieldRead<T> for BoundField<T, F> {
    fn label(&self) -> &str {
        self.path
    }

    fn read_in_place<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let args = match self.discriminator {
                Some(discriminator) => discriminator(out),
                None => ReadArgs::None,
            };
            let view = data.subview(self.offset, self.reader.size());
            self.reader.read(session, view, (self.access)(out), args).await
        })
    }

    fn read_detached<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
    ) -> LocalBoxFuture<'a, Result<Writeback<T>, ReadError>> {
        Box::pin(async move {
            let view = data.subview(self.offset, self.reader.size());
            let mut value = F::default();
            self.reader.read(session, view, &mut value, ReadArgs::None).await?;
            let access = self.access;
            Ok(Box::new(move |out: &mut T| *access(out) = value) as Writeback<T>)
        })
    }
}

// ---------------------------------------------------------------------
// Unions

trait AltRead<T> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>>;
}

trait AltSpec<T> {
    fn init(
        &self,
        factory: &ReaderFactory<'_>,
        compound: TypeId,
        member: usize,
    ) -> Result<Box<dyn AltRead<T>>, String>;
}

/// Declaration of a union destination's alternatives, in schema member
/// order.
pub struct UnionSpec<T> {
    type_path: &'static str,
    alternatives: Vec<Box<dyn AltSpec<T>>>,
}

impl<T: ReadableUnion> UnionSpec<T> {
    pub fn union(type_path: &'static str) -> UnionSpec<T> {
        UnionSpec {
            type_path,
            alternatives: Vec::new(),
        }
    }

    /// Register the next alternative; `set` stores the decoded value
    /// into the destination.
    pub fn alternative<F: ReadDest + Default>(mut self, set: fn(&mut T, F)) -> Self {
        self.alternatives.push(Box::new(AltDef { set }));
        self
    }
}

struct AltDef<T, F: ReadDest> {
    set: fn(&mut T, F),
}

struct BoundAlt<T, F: ReadDest> {
    offset: usize,
    reader: ItemReader<F>,
    set: fn(&mut T, F),
}

impl<T: 'static, F: ReadDest + Default> AltSpec<T> for AltDef<T, F> {
    fn init(
        &self,
        factory: &ReaderFactory<'_>,
        compound: TypeId,
        member: usize,
    ) -> Result<Box<dyn AltRead<T>>, String> {
        let node = factory
            .structures
            .compound(compound)
            .ok_or_else(|| "not a compound".to_owned())?;
        let member_node = node
            .members
            .get(member)
            .ok_or_else(|| format!("union has no member {member}"))?;
        let ty = member_node
            .ty
            .id()
            .ok_or_else(|| format!("unresolved member {member}"))?;
        let offset = factory
            .layout
            .compound(compound)
            .map(|layout| layout.member_offsets[member])
            .unwrap_or(0);
        let reader = F::make_reader(factory, ty)
            .map_err(|err| format!("in alternative {member}: {err}"))?;
        Ok(Box::new(BoundAlt {
            offset,
            reader,
            set: self.set,
        }))
    }
}

impl<T: 'static, F: ReadDest + Default> AltRead<T> for BoundAlt<T, F> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let view = data.subview(self.offset, self.reader.size());
            let mut value = F::default();
            self.reader.read(session, view, &mut value, ReadArgs::None).await?;
            (self.set)(out, value);
            Ok(())
        })
    }
}

/// Reads a union compound: exactly one alternative, selected by an
/// externally supplied discriminator.
pub struct UnionReader<T> {
    compound: TypeId,
    info: TypeInfo,
    debug_name: String,
    alternatives: OnceCell<Vec<Option<Box<dyn AltRead<T>>>>>,
}

impl<T: ReadableUnion> UnionReader<T> {
    pub(crate) fn new(
        factory: &ReaderFactory<'_>,
        spec: &UnionSpec<T>,
    ) -> Result<UnionReader<T>, TypeError> {
        let (compound, _) = resolve_compound::<T>(factory, spec.type_path)?;
        let node = factory
            .structures
            .compound(compound)
            .ok_or_else(|| type_error::<T>(factory, compound, "not a compound"))?;
        if !node.is_union {
            return Err(type_error::<T>(factory, compound, "is not a union"));
        }
        if node.members.len() != spec.alternatives.len() {
            return Err(type_error::<T>(
                factory,
                compound,
                format!(
                    "invalid union size {} (destination has {})",
                    node.members.len(),
                    spec.alternatives.len()
                ),
            ));
        }
        let info = factory
            .layout
            .type_info(compound)
            .ok_or_else(|| type_error::<T>(factory, compound, "no layout for union"))?;
        Ok(UnionReader {
            compound,
            info,
            debug_name: node.debug_name.clone(),
            alternatives: OnceCell::new(),
        })
    }

    pub(crate) fn init(
        &self,
        factory: &ReaderFactory<'_>,
        spec: UnionSpec<T>,
    ) -> Result<(), TypeError> {
        let mut alternatives = Vec::with_capacity(spec.alternatives.len());
        for (index, alt) in spec.alternatives.iter().enumerate() {
            match alt.init(factory, self.compound, index) {
                Ok(reader) => alternatives.push(Some(reader)),
                Err(message) => {
                    // A broken alternative only fails reads that select it.
                    warn!(union = %self.debug_name, index, "{message}");
                    alternatives.push(None);
                }
            }
        }
        let _ = self.alternatives.set(alternatives);
        Ok(())
    }

    pub fn compound(&self) -> TypeId {
        self.compound
    }

    pub fn info(&self) -> TypeInfo {
        self.info
    }

    /// Read the alternative `discriminator` selects; [`NO_ALTERNATIVE`]
    /// leaves the destination untouched.
    pub fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
        discriminator: usize,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            if discriminator == NO_ALTERNATIVE {
                return Ok(());
            }
            let Some(alternatives) = self.alternatives.get() else {
                return Err(ReadError::InvalidField);
            };
            let Some(alternative) = alternatives.get(discriminator) else {
                return Err(ReadError::InvalidDiscriminator(discriminator));
            };
            match alternative {
                Some(alternative) => alternative.read(session, data, out).await,
                None => {
                    warn!(
                        union = %self.debug_name,
                        discriminator,
                        "alternative reader unavailable"
                    );
                    Ok(())
                }
            }
        })
    }
}
