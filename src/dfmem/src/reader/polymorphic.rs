//! Polymorphic dispatch by vtable address.
//!
//! An open C++ class family becomes a closed, per-version sum type: the
//! destination family registers its base and every derived variant it
//! knows, and the reader builds a `vtable address -> variant` table from
//! the version's symbol data. At read time the pointed-to object's first
//! word (minus the process relocation) selects the variant.

use std::any::{Any, TypeId as RustTypeId};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use tracing::warn;

use super::compound::{CompoundReader, ReadableStructure};
use super::item::PointeeRead;
use super::{ReadError, ReadSession, TypeError};
use crate::process::MemoryView;
use crate::schema::{Type, TypeId};
use crate::ReaderFactory;

/// What to do when the observed vtable address is not registered.
///
/// Without an explicit policy the reader warns and falls back to the
/// base when it is concrete, or to a null result when it is abstract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Produce no object.
    Null,
    /// Read the object as the (concrete) base.
    Base,
    /// Fail the read.
    Error,
}

/// A family destination: a sum type over a base and its derived
/// structures, read through vtable dispatch.
pub trait PolymorphicDest: Sized + 'static {
    fn spec() -> PolymorphicSpec<Self>;
}

trait VariantRead<B> {
    /// Fetch and decode the object at `address` as this variant.
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<B, ReadError>>;
}

struct VariantReadImpl<B, V: ReadableStructure> {
    reader: Rc<CompoundReader<V>>,
    wrap: fn(V) -> B,
}

impl<B, V: ReadableStructure> VariantRead<B> for VariantReadImpl<B, V> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<B, ReadError>> {
        Box::pin(async move {
            let data = session.process().read(address, self.reader.info().size).await?;
            let mut value = V::default();
            self.reader
                .read(session, MemoryView::new(address, &data), &mut value)
                .await?;
            Ok((self.wrap)(value))
        })
    }
}

struct VariantEntry<B> {
    symbol: String,
    dest: RustTypeId,
    vtable: Option<usize>,
    /// `None` for an abstract base, which can be dispatched on but never
    /// instantiated.
    read: Option<Box<dyn VariantRead<B>>>,
    /// The registered `fn(B) -> Result<V, B>` extractor, type-erased.
    unwrap: Option<Box<dyn Any>>,
}

trait VariantSpec<B> {
    fn build(&self, factory: &ReaderFactory<'_>) -> Result<VariantEntry<B>, TypeError>;
}

struct ConcreteVariant<B, V: ReadableStructure> {
    wrap: fn(V) -> B,
    unwrap: fn(B) -> Result<V, B>,
}

impl<B: 'static, V: ReadableStructure> VariantSpec<B> for ConcreteVariant<B, V> {
    fn build(&self, factory: &ReaderFactory<'_>) -> Result<VariantEntry<B>, TypeError> {
        let reader = factory.compound_reader::<V>()?;
        let symbol = reader.vtable_symbol().to_owned();
        Ok(VariantEntry {
            symbol,
            dest: RustTypeId::of::<V>(),
            vtable: None,
            read: Some(Box::new(VariantReadImpl {
                reader,
                wrap: self.wrap,
            })),
            unwrap: Some(Box::new(self.unwrap)),
        })
    }
}

struct AbstractVariant<V: ReadableStructure> {
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<B: 'static, V: ReadableStructure> VariantSpec<B> for AbstractVariant<V> {
    fn build(&self, factory: &ReaderFactory<'_>) -> Result<VariantEntry<B>, TypeError> {
        let reader = factory.compound_reader::<V>()?;
        let symbol = reader.vtable_symbol().to_owned();
        Ok(VariantEntry {
            symbol,
            dest: RustTypeId::of::<V>(),
            vtable: None,
            read: None,
            unwrap: None,
        })
    }
}

/// Registration of a polymorphic family: the base (concrete or
/// abstract) followed by the derived variants.
pub struct PolymorphicSpec<B> {
    variants: Vec<Box<dyn VariantSpec<B>>>,
    fallback: Option<Fallback>,
}

impl<B: 'static> PolymorphicSpec<B> {
    /// Family whose base structure `V` can itself be materialized.
    pub fn with_base<V: ReadableStructure>(
        wrap: fn(V) -> B,
        unwrap: fn(B) -> Result<V, B>,
    ) -> PolymorphicSpec<B> {
        PolymorphicSpec {
            variants: vec![Box::new(ConcreteVariant { wrap, unwrap })],
            fallback: None,
        }
    }

    /// Family with an abstract base: its vtable is recognized (and
    /// rejected as abstract), but only derived variants materialize.
    pub fn with_abstract_base<V: ReadableStructure>() -> PolymorphicSpec<B> {
        PolymorphicSpec {
            variants: vec![Box::new(AbstractVariant::<V> {
                _marker: std::marker::PhantomData,
            })],
            fallback: None,
        }
    }

    /// Register a derived variant. `wrap` builds the family value,
    /// `unwrap` extracts it back for down-cast pointer destinations.
    pub fn variant<V: ReadableStructure>(
        mut self,
        wrap: fn(V) -> B,
        unwrap: fn(B) -> Result<V, B>,
    ) -> Self {
        self.variants.push(Box::new(ConcreteVariant { wrap, unwrap }));
        self
    }

    /// Explicit policy for unknown vtable addresses.
    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

struct PolyState<B> {
    entries: Vec<VariantEntry<B>>,
    by_vtable: HashMap<usize, usize>,
    by_dest: HashMap<RustTypeId, usize>,
    fallback: Option<Fallback>,
}

/// Reads a pointer to a polymorphic base, dispatching to the variant
/// whose vtable address matches the object's first word.
pub struct PolymorphicReader<B: 'static> {
    state: OnceCell<PolyState<B>>,
}

impl<B: 'static> PolymorphicReader<B> {
    pub(crate) fn unresolved() -> PolymorphicReader<B> {
        PolymorphicReader {
            state: OnceCell::new(),
        }
    }

    pub(crate) fn init(
        &self,
        factory: &ReaderFactory<'_>,
        spec: PolymorphicSpec<B>,
    ) -> Result<(), TypeError> {
        let mut entries = Vec::with_capacity(spec.variants.len());
        for variant in &spec.variants {
            entries.push(variant.build(factory)?);
        }
        let mut by_vtable = HashMap::new();
        let mut by_dest = HashMap::new();
        for (index, entry) in entries.iter_mut().enumerate() {
            match factory.version.vtable_addresses.get(&entry.symbol) {
                Some(&address) => {
                    entry.vtable = Some(address);
                    // Vtable addresses must be unique per version.
                    if by_vtable.insert(address, index).is_some() {
                        warn!(
                            symbol = %entry.symbol,
                            address,
                            "duplicate vtable address in version table"
                        );
                    }
                }
                None => {
                    if entry.read.is_some() {
                        warn!(
                            symbol = %entry.symbol,
                            "missing vtable for concrete type"
                        );
                    }
                }
            }
            by_dest.insert(entry.dest, index);
        }
        let _ = self.state.set(PolyState {
            entries,
            by_vtable,
            by_dest,
            fallback: spec.fallback,
        });
        Ok(())
    }

    fn state(&self) -> Result<&PolyState<B>, ReadError> {
        self.state.get().ok_or(ReadError::InvalidField)
    }

    /// Read the object at `address` as its concrete variant.
    pub fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<B>, ReadError>> {
        Box::pin(async move {
            if address == 0 {
                return Ok(None);
            }
            let state = self.state()?;
            let pointer_size = session.abi().pointer().size;
            let word = session.process().read(address, pointer_size).await?;
            let raw = session.abi().read_pointer(&word);
            let vtable = (raw as isize - session.process().base_offset()) as usize;
            if let Some(&index) = state.by_vtable.get(&vtable) {
                let entry = &state.entries[index];
                return match &entry.read {
                    Some(read) => read.read(session, address).await.map(Some),
                    None => Err(ReadError::AbstractType),
                };
            }
            match state.fallback {
                Some(Fallback::Null) => Ok(None),
                Some(Fallback::Base) => self.read_base(state, session, address).await,
                Some(Fallback::Error) => Err(ReadError::UnknownVtable(vtable)),
                None => {
                    warn!(vtable, "unknown vtable address");
                    match state.entries.first().and_then(|base| base.read.as_ref()) {
                        Some(read) => {
                            warn!("falling back to base type");
                            read.read(session, address).await.map(Some)
                        }
                        None => {
                            warn!("falling back to null pointer");
                            Ok(None)
                        }
                    }
                }
            }
        })
    }

    async fn read_base(
        &self,
        state: &PolyState<B>,
        session: &ReadSession<'_>,
        address: usize,
    ) -> Result<Option<B>, ReadError> {
        match state.entries.first().and_then(|base| base.read.as_ref()) {
            Some(read) => read.read(session, address).await.map(Some),
            None => Err(ReadError::AbstractType),
        }
    }

    fn unwrap_for<V: 'static>(&self) -> Result<fn(B) -> Result<V, B>, ReadError> {
        let state = self.state()?;
        let index = state
            .by_dest
            .get(&RustTypeId::of::<V>())
            .copied()
            .ok_or(ReadError::CastError)?;
        state.entries[index]
            .unwrap
            .as_ref()
            .and_then(|unwrap| unwrap.downcast_ref::<fn(B) -> Result<V, B>>())
            .copied()
            .ok_or(ReadError::CastError)
    }
}

/// Pointee behavior for family destinations: dereference via vtable
/// dispatch, interning shared reads under the family type.
pub fn polymorphic_pointee<B: PolymorphicDest>(
    factory: &ReaderFactory<'_>,
    pointer: TypeId,
) -> Result<Rc<dyn PointeeRead<B>>, TypeError> {
    check_pointer::<B>(factory, pointer)?;
    if let Type::Pointer(p) = factory.structures.get(pointer) {
        if p.has_bad_pointers {
            return Ok(Rc::new(NullPointee));
        }
    }
    let reader = factory.polymorphic_reader::<B>()?;
    Ok(Rc::new(PolymorphicPointee { reader }))
}

/// Pointee behavior for a concrete variant `V` of the family `B`: the
/// object is read polymorphically and then down-cast, failing with
/// `CastError` when the target turns out to be a different variant.
pub fn downcast_pointee<B: PolymorphicDest, V: ReadableStructure>(
    factory: &ReaderFactory<'_>,
    pointer: TypeId,
) -> Result<Rc<dyn PointeeRead<V>>, TypeError> {
    check_pointer::<V>(factory, pointer)?;
    if let Type::Pointer(p) = factory.structures.get(pointer) {
        if p.has_bad_pointers {
            return Ok(Rc::new(NullPointee));
        }
    }
    let reader = factory.polymorphic_reader::<B>()?;
    Ok(Rc::new(DowncastPointee::<B, V> {
        reader,
        _marker: std::marker::PhantomData,
    }))
}

fn check_pointer<T>(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<(), TypeError> {
    match factory.structures.get(ty) {
        Type::Pointer(_) => Ok(()),
        _ => Err(TypeError::new(
            factory.structures,
            ty,
            std::any::type_name::<T>(),
            "not a pointer",
        )),
    }
}

struct NullPointee;

impl<T: 'static> PointeeRead<T> for NullPointee {
    fn read_unique<'a>(
        &'a self,
        _session: &'a ReadSession<'a>,
        _address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Box<T>>, ReadError>> {
        Box::pin(async { Ok(None) })
    }

    fn read_shared<'a>(
        &'a self,
        _session: &'a ReadSession<'a>,
        _address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Rc<T>>, ReadError>> {
        Box::pin(async { Ok(None) })
    }
}

struct PolymorphicPointee<B: 'static> {
    reader: Rc<PolymorphicReader<B>>,
}

impl<B: PolymorphicDest> PointeeRead<B> for PolymorphicPointee<B> {
    fn read_unique<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Box<B>>, ReadError>> {
        Box::pin(async move {
            Ok(self
                .reader
                .read(session, address)
                .await?
                .map(Box::new))
        })
    }

    fn read_shared<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Rc<B>>, ReadError>> {
        Box::pin(async move {
            if address == 0 {
                return Ok(None);
            }
            let reader = self.reader.clone();
            // The cache entry holds `Option<Rc<B>>` so that a fallback
            // null result is remembered too.
            let value = session
                .shared_object(RustTypeId::of::<B>(), address, move |session| {
                    Box::pin(async move {
                        let result = reader.read(session, address).await?.map(Rc::new);
                        Ok(Rc::new(result) as Rc<dyn Any>)
                    })
                })
                .await?;
            let value = value
                .downcast::<Option<Rc<B>>>()
                .map_err(|_| ReadError::TypeMismatch)?;
            Ok(value.as_ref().clone())
        })
    }
}

struct DowncastPointee<B: 'static, V> {
    reader: Rc<PolymorphicReader<B>>,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<B: PolymorphicDest, V: ReadableStructure> PointeeRead<V> for DowncastPointee<B, V> {
    fn read_unique<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Box<V>>, ReadError>> {
        Box::pin(async move {
            let Some(value) = self.reader.read(session, address).await? else {
                return Ok(None);
            };
            let unwrap = self.reader.unwrap_for::<V>()?;
            match unwrap(value) {
                Ok(variant) => Ok(Some(Box::new(variant))),
                Err(_other) => Err(ReadError::CastError),
            }
        })
    }

    fn read_shared<'a>(
        &'a self,
        _session: &'a ReadSession<'a>,
        _address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Rc<V>>, ReadError>> {
        // Shared interning happens under the family type; a projected
        // Rc<V> cannot share with it.
        Box::pin(async { Err(ReadError::NotImplemented) })
    }
}
