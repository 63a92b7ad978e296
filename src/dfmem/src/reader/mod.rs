//! Typed reader core.
//!
//! [`ReaderFactory`] owns the layout for one (schema, version) pair and
//! caches per-destination-type readers. [`ReadSession`] scopes a stopped
//! target: it builds read tasks, drives them through the process driver,
//! and interns shared objects by address for the session's lifetime.

pub mod compound;
pub mod item;
pub mod polymorphic;

pub use compound::{
    CompoundReader, CompoundSpec, ReadableStructure, ReadableUnion, UnionReader, UnionSpec,
    NO_ALTERNATIVE,
};
pub use item::{
    array_item_reader, flag_array_item_reader, integral_item_reader, sequence_item_reader,
    static_pointee, string_item_reader, structure_item_reader, union_item_reader, FlagArray,
    FromScalar, ItemRead, ItemReader, PointeeRead, ReadArgs, ReadDest,
};
pub use polymorphic::{
    downcast_pointee, polymorphic_pointee, Fallback, PolymorphicDest, PolymorphicReader,
    PolymorphicSpec,
};

use std::any::TypeId as RustTypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use thiserror::Error;
use tracing::{error, warn};

use crate::abi::{Abi, AbiError};
use crate::layout::{LayoutError, MemoryLayout};
use crate::path::{self, PathError, PathItem};
use crate::process::event::ManualEvent;
use crate::process::Process;
use crate::schema::{SchemaError, Structures, TypeId, VersionInfo};

/// Mismatch between a destination type and the schema type it is asked
/// to read, reported while constructing a reader.
#[derive(Debug, Error)]
#[error("{message} (type: {schema_type}, destination: {destination})")]
pub struct TypeError {
    message: String,
    schema_type: String,
    destination: &'static str,
}

impl TypeError {
    pub fn new(
        structures: &Structures,
        ty: TypeId,
        destination: &'static str,
        message: impl Into<String>,
    ) -> TypeError {
        TypeError {
            message: message.into(),
            schema_type: structures.describe(ty),
            destination,
        }
    }

    pub fn with_name(
        schema_type: impl Into<String>,
        destination: &'static str,
        message: impl Into<String>,
    ) -> TypeError {
        TypeError {
            message: message.into(),
            schema_type: schema_type.into(),
            destination,
        }
    }
}

/// Read-time errors.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("not implemented")]
    NotImplemented,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("abstract type")]
    AbstractType,
    #[error("cast error")]
    CastError,
    #[error("invalid field")]
    InvalidField,
    #[error("invalid discriminator {0}")]
    InvalidDiscriminator(usize),
    #[error("union read without a discriminator")]
    MissingDiscriminator,
    #[error("expected {expected} extra arguments, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unknown vtable address {0:#x}")]
    UnknownVtable(usize),
    #[error("unknown global {0}")]
    UnknownGlobal(String),
    #[error("target version {id} not in the symbol table (known: {known:?})")]
    VersionMismatch { id: String, known: Vec<String> },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Shared(Rc<ReadError>),
}

/// A typed target address.
#[derive(Debug, Clone, Copy)]
pub struct TypedPointer {
    pub address: usize,
    pub ty: TypeId,
}

impl TypedPointer {
    /// Resolve a global path to its address and type under `version`,
    /// applying the process relocation `base_offset` and the layout
    /// offsets of any member steps.
    pub fn from_global(
        structures: &Structures,
        version: &VersionInfo,
        layout: &MemoryLayout,
        path: &[PathItem],
        base_offset: isize,
    ) -> Result<TypedPointer, ReadError> {
        let Some(PathItem::Identifier(name)) = path.first() else {
            return Err(SchemaError::PathStart.into());
        };
        let address = *version
            .global_addresses
            .get(name)
            .ok_or_else(|| ReadError::UnknownGlobal(name.clone()))?;
        let address = (address as isize + base_offset) as usize;
        let ty = structures
            .find_global_type(name)
            .ok_or_else(|| ReadError::UnknownGlobal(name.clone()))?;
        if path.len() > 1 {
            if structures.compound(ty).is_none() {
                return Err(SchemaError::NotACompound(structures.describe(ty)).into());
            }
            let (ty, offset) = layout.offset_of(structures, ty, &path[1..])?;
            Ok(TypedPointer {
                address: address + offset,
                ty,
            })
        } else {
            Ok(TypedPointer { address, ty })
        }
    }
}

/// Creates and caches readers for one schema + version.
///
/// Reader construction is re-entrant: a reader is registered before its
/// fields are built, so mutually referential destination types resolve
/// to the cached (possibly still initializing) instance.
pub struct ReaderFactory<'s> {
    pub structures: &'s Structures,
    pub abi: &'static Abi,
    pub layout: MemoryLayout,
    pub version: &'s VersionInfo,
    compound_readers: RefCell<HashMap<RustTypeId, Rc<dyn std::any::Any>>>,
    polymorphic_readers: RefCell<HashMap<RustTypeId, Rc<dyn std::any::Any>>>,
}

impl<'s> ReaderFactory<'s> {
    /// Build a factory for `version`, selecting the ABI from its name
    /// and computing the memory layout.
    pub fn new(structures: &'s Structures, version: &'s VersionInfo) -> Result<Self, ReadError> {
        let abi = Abi::from_version_name(&version.version_name)?;
        let layout = MemoryLayout::new(structures, abi)?;
        Ok(ReaderFactory {
            structures,
            abi,
            layout,
            version,
            compound_readers: RefCell::new(HashMap::new()),
            polymorphic_readers: RefCell::new(HashMap::new()),
        })
    }

    /// Build an [`ItemReader`] reading the schema type `ty` into `T`.
    pub fn item_reader<T: ReadDest>(&self, ty: TypeId) -> Result<ItemReader<T>, TypeError> {
        T::make_reader(self, ty)
    }

    /// The cached compound reader for `T`, creating it on first use.
    pub fn compound_reader<T: ReadableStructure>(
        &self,
    ) -> Result<Rc<CompoundReader<T>>, TypeError> {
        let key = RustTypeId::of::<T>();
        if let Some(existing) = self.compound_readers.borrow().get(&key) {
            return existing
                .clone()
                .downcast::<CompoundReader<T>>()
                .map_err(|_| {
                    TypeError::with_name(
                        "reader cache",
                        std::any::type_name::<T>(),
                        "cached reader has a different shape",
                    )
                });
        }
        let spec = T::spec();
        let reader = Rc::new(CompoundReader::new(self, &spec)?);
        self.compound_readers
            .borrow_mut()
            .insert(key, reader.clone());
        // May re-enter this factory for member readers.
        reader.init(self, spec)?;
        Ok(reader)
    }

    /// The cached union reader for `T`, creating it on first use.
    pub fn union_reader<T: ReadableUnion>(&self) -> Result<Rc<UnionReader<T>>, TypeError> {
        let key = RustTypeId::of::<T>();
        if let Some(existing) = self.compound_readers.borrow().get(&key) {
            return existing.clone().downcast::<UnionReader<T>>().map_err(|_| {
                TypeError::with_name(
                    "reader cache",
                    std::any::type_name::<T>(),
                    "cached reader has a different shape",
                )
            });
        }
        let spec = T::spec();
        let reader = Rc::new(UnionReader::new(self, &spec)?);
        self.compound_readers
            .borrow_mut()
            .insert(key, reader.clone());
        reader.init(self, spec)?;
        Ok(reader)
    }

    /// The cached polymorphic reader for the family `B`.
    pub fn polymorphic_reader<B: PolymorphicDest>(
        &self,
    ) -> Result<Rc<PolymorphicReader<B>>, TypeError> {
        let key = RustTypeId::of::<B>();
        if let Some(existing) = self.polymorphic_readers.borrow().get(&key) {
            return existing
                .clone()
                .downcast::<PolymorphicReader<B>>()
                .map_err(|_| {
                    TypeError::with_name(
                        "reader cache",
                        std::any::type_name::<B>(),
                        "cached reader has a different shape",
                    )
                });
        }
        let reader = Rc::new(PolymorphicReader::unresolved());
        self.polymorphic_readers
            .borrow_mut()
            .insert(key, reader.clone());
        reader.init(self, B::spec())?;
        Ok(reader)
    }
}

enum SharedEntry {
    Pending {
        ty: RustTypeId,
        done: ManualEvent,
    },
    Ready {
        ty: RustTypeId,
        value: Rc<dyn std::any::Any>,
    },
    Failed(Rc<ReadError>),
}

/// Interning table for shared-pointer destinations, keyed by target
/// address. Sessions own one by default; external caches can be attached
/// per destination type to extend interning beyond a session.
#[derive(Default)]
pub struct SharedObjectCache {
    entries: HashMap<usize, SharedEntry>,
}

impl SharedObjectCache {
    pub fn new() -> SharedObjectCache {
        SharedObjectCache::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reading session: the target is stopped while it exists.
///
/// Read tasks created through [`ReadSession::read`] only execute when
/// passed to [`ReadSession::sync`] (or the `*_sync` helpers), which
/// drives them through the process driver so decorators can batch the
/// traffic.
pub struct ReadSession<'a> {
    factory: &'a ReaderFactory<'a>,
    process: &'a dyn Process,
    shared: Rc<RefCell<SharedObjectCache>>,
    external_shared: RefCell<HashMap<RustTypeId, Rc<RefCell<SharedObjectCache>>>>,
}

impl<'a> ReadSession<'a> {
    /// Start a session: verify the target build matches the factory's
    /// version, then stop the target.
    pub fn new(
        factory: &'a ReaderFactory<'a>,
        process: &'a dyn Process,
    ) -> Result<ReadSession<'a>, ReadError> {
        if process.id() != factory.version.id.as_slice() {
            let mut id = String::new();
            for byte in process.id() {
                let _ = write!(id, "{byte:02x}");
            }
            return Err(ReadError::VersionMismatch {
                id,
                known: factory
                    .structures
                    .versions()
                    .iter()
                    .map(|v| v.version_name.clone())
                    .collect(),
            });
        }
        if let Err(err) = process.stop() {
            warn!("failed to stop process: {err}");
        }
        Ok(ReadSession {
            factory,
            process,
            shared: Rc::new(RefCell::new(SharedObjectCache::new())),
            external_shared: RefCell::new(HashMap::new()),
        })
    }

    pub fn factory(&self) -> &ReaderFactory<'a> {
        self.factory
    }

    pub fn structures(&self) -> &Structures {
        self.factory.structures
    }

    pub fn abi(&self) -> &'static Abi {
        self.factory.abi
    }

    pub fn process(&self) -> &dyn Process {
        self.process
    }

    /// Use `cache` for shared objects of destination type `T` instead of
    /// the session-owned table. Returns `false` if `T` already has one.
    pub fn add_shared_cache<T: 'static>(&self, cache: Rc<RefCell<SharedObjectCache>>) -> bool {
        let mut external = self.external_shared.borrow_mut();
        match external.entry(RustTypeId::of::<T>()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(cache);
                true
            }
        }
    }

    /// Address and type of the global addressed by `path`.
    pub fn global(&self, path: &str) -> Result<TypedPointer, ReadError> {
        let path = path::parse(path)?;
        TypedPointer::from_global(
            self.factory.structures,
            self.factory.version,
            &self.factory.layout,
            &path,
            self.process.base_offset(),
        )
    }

    /// Create a task reading the object at `ptr` into `dest`.
    pub fn read<'b, T: ReadDest>(
        &'b self,
        ptr: TypedPointer,
        dest: &'b mut T,
    ) -> LocalBoxFuture<'b, Result<(), ReadError>> {
        Box::pin(async move {
            let reader = self.factory.item_reader::<T>(ptr.ty)?;
            let data = self.process.read(ptr.address, reader.size()).await?;
            reader
                .read(
                    self,
                    crate::process::MemoryView::new(ptr.address, &data),
                    dest,
                    ReadArgs::None,
                )
                .await
        })
    }

    /// Create a task reading the global `path` into `dest`.
    pub fn read_global<'b, T: ReadDest>(
        &'b self,
        path: &str,
        dest: &'b mut T,
    ) -> LocalBoxFuture<'b, Result<(), ReadError>> {
        match self.global(path) {
            Ok(ptr) => self.read(ptr, dest),
            Err(err) => Box::pin(async move { Err(err) }),
        }
    }

    /// Drive `task` to completion. Failures are logged; returns whether
    /// the task succeeded.
    #[must_use]
    pub fn sync(&self, task: LocalBoxFuture<'_, Result<(), ReadError>>) -> bool {
        let slot = RefCell::new(None);
        self.process.sync(Box::pin(async {
            *slot.borrow_mut() = Some(task.await);
        }));
        match slot.into_inner() {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                error!("failed to read data: {err}");
                false
            }
            None => false,
        }
    }

    /// Drive several tasks concurrently; returns whether all succeeded.
    #[must_use]
    pub fn sync_all(&self, tasks: Vec<LocalBoxFuture<'_, Result<(), ReadError>>>) -> bool {
        let results = RefCell::new(Vec::new());
        self.process.sync(Box::pin(async {
            *results.borrow_mut() = futures::future::join_all(tasks).await;
        }));
        let mut ok = true;
        for result in results.into_inner() {
            if let Err(err) = result {
                error!("failed to read data: {err}");
                ok = false;
            }
        }
        ok
    }

    /// Read the object at `ptr` synchronously.
    #[must_use]
    pub fn read_sync<T: ReadDest>(&self, ptr: TypedPointer, dest: &mut T) -> bool {
        let task = self.read(ptr, dest);
        self.sync(task)
    }

    /// Read the global `path` synchronously.
    #[must_use]
    pub fn read_global_sync<T: ReadDest>(&self, path: &str, dest: &mut T) -> bool {
        let task = self.read_global(path, dest);
        self.sync(task)
    }

    fn cache_for(&self, family: RustTypeId) -> Rc<RefCell<SharedObjectCache>> {
        self.external_shared
            .borrow()
            .get(&family)
            .cloned()
            .unwrap_or_else(|| self.shared.clone())
    }

    /// Get or create the shared object at `address`, deduplicating
    /// concurrent and repeated reads. `family` is the destination type
    /// the cache entry is keyed under (the polymorphic base for family
    /// reads).
    pub(crate) fn shared_object<'b>(
        &'b self,
        family: RustTypeId,
        address: usize,
        make: impl FnOnce(&'b ReadSession<'a>) -> LocalBoxFuture<'b, Result<Rc<dyn std::any::Any>, ReadError>>
            + 'b,
    ) -> LocalBoxFuture<'b, Result<Rc<dyn std::any::Any>, ReadError>> {
        Box::pin(async move {
            let cache = self.cache_for(family);
            enum Action {
                Ready(Rc<dyn std::any::Any>),
                Wait(ManualEvent),
                Make,
            }
            let action = {
                let mut cache = cache.borrow_mut();
                match cache.entries.entry(address) {
                    std::collections::hash_map::Entry::Occupied(entry) => match entry.get() {
                        SharedEntry::Pending { ty, done } => {
                            if *ty != family {
                                warn!(
                                    address,
                                    "address already read with a different declared type"
                                );
                                return Err(ReadError::TypeMismatch);
                            }
                            Action::Wait(done.clone())
                        }
                        SharedEntry::Ready { ty, value } => {
                            if *ty != family {
                                warn!(
                                    address,
                                    "address already read with a different declared type"
                                );
                                return Err(ReadError::TypeMismatch);
                            }
                            Action::Ready(value.clone())
                        }
                        SharedEntry::Failed(err) => return Err(ReadError::Shared(err.clone())),
                    },
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(SharedEntry::Pending {
                            ty: family,
                            done: ManualEvent::new(),
                        });
                        Action::Make
                    }
                }
            };
            match action {
                Action::Ready(value) => Ok(value),
                Action::Wait(done) => {
                    done.wait().await;
                    let cache = cache.borrow();
                    match cache.entries.get(&address) {
                        Some(SharedEntry::Ready { value, .. }) => Ok(value.clone()),
                        Some(SharedEntry::Failed(err)) => Err(ReadError::Shared(err.clone())),
                        _ => Err(ReadError::InvalidField),
                    }
                }
                Action::Make => {
                    let result = make(self).await;
                    let mut cache_mut = cache.borrow_mut();
                    match result {
                        Ok(value) => {
                            let previous = cache_mut.entries.insert(
                                address,
                                SharedEntry::Ready {
                                    ty: family,
                                    value: value.clone(),
                                },
                            );
                            drop(cache_mut);
                            if let Some(SharedEntry::Pending { done, .. }) = previous {
                                done.set();
                            }
                            Ok(value)
                        }
                        Err(err) => {
                            let shared = Rc::new(err);
                            let previous = cache_mut
                                .entries
                                .insert(address, SharedEntry::Failed(shared.clone()));
                            drop(cache_mut);
                            if let Some(SharedEntry::Pending { done, .. }) = previous {
                                done.set();
                            }
                            Err(ReadError::Shared(shared))
                        }
                    }
                }
            }
        })
    }
}

impl Drop for ReadSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.process.cont() {
            warn!("failed to resume process: {err}");
        }
    }
}
