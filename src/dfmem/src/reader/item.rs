//! Item readers: one destination type from one schema type.
//!
//! [`ReadDest`] is implemented by every type that can be materialized
//! from target memory. `make_reader` validates the schema node against
//! the destination shape up front, so read time only moves bytes;
//! `make_pointee` decides how `Pointer(T)` destinations dereference
//! (in place by default, via vtable dispatch for polymorphic families).

use std::any::TypeId as RustTypeId;
use std::rc::Rc;

use byteorder::{ByteOrder, LE};
use futures::future::{join_all, LocalBoxFuture};

use super::{ReadError, ReadSession, TypeError};
use crate::abi::TypeInfo;
use crate::process::MemoryView;
use crate::reader::compound::{ReadableStructure, ReadableUnion};
use crate::schema::{df_members, DfKind, PrimitiveKind, StdKind, Type, TypeId, TypeSlot};
use crate::ReaderFactory;

/// Extra read-time arguments, used by union destinations.
#[derive(Clone)]
pub enum ReadArgs {
    None,
    /// Union alternative to read ([`super::NO_ALTERNATIVE`] reads none).
    Alternative(usize),
    /// One alternative index per container item.
    PerItem(Rc<[usize]>),
}

impl ReadArgs {
    fn for_item(&self, index: usize, count: usize) -> Result<ReadArgs, ReadError> {
        match self {
            ReadArgs::None => Ok(ReadArgs::None),
            ReadArgs::Alternative(alt) => Ok(ReadArgs::Alternative(*alt)),
            ReadArgs::PerItem(alts) => {
                if alts.len() != count {
                    return Err(ReadError::LengthMismatch {
                        expected: count,
                        actual: alts.len(),
                    });
                }
                Ok(ReadArgs::Alternative(alts[index]))
            }
        }
    }
}

/// The read behavior behind an [`ItemReader`].
pub trait ItemRead<T>: 'static {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
        args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>>;
}

/// Reads one destination value from a view of the bytes it occupies.
pub struct ItemReader<T> {
    size: usize,
    imp: Box<dyn ItemRead<T>>,
}

impl<T: 'static> ItemReader<T> {
    pub fn new(size: usize, imp: impl ItemRead<T>) -> ItemReader<T> {
        ItemReader {
            size,
            imp: Box::new(imp),
        }
    }

    /// Bytes this reader consumes, matching the schema type's size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
        args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        self.imp.read(session, data, out, args)
    }
}

/// How a `Pointer(T)` destination dereferences its target.
pub trait PointeeRead<T>: 'static {
    fn read_unique<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Box<T>>, ReadError>>;

    fn read_shared<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Rc<T>>, ReadError>>;
}

/// A destination type that can be read from target memory.
pub trait ReadDest: Sized + 'static {
    /// Build a reader for the schema type `ty`, validating shapes.
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError>;

    /// Build the dereference behavior for a schema pointer to this type.
    /// Most types read their target in place; polymorphic families
    /// dispatch on the observed vtable instead.
    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError>;
}

fn dest_name<T>() -> &'static str {
    std::any::type_name::<T>()
}

pub(crate) fn slot_id<T>(
    factory: &ReaderFactory<'_>,
    context: TypeId,
    slot: &TypeSlot,
) -> Result<TypeId, TypeError> {
    slot.id().ok_or_else(|| {
        TypeError::new(
            factory.structures,
            context,
            dest_name::<T>(),
            format!(
                "unresolved reference to {}",
                slot.unresolved_name().unwrap_or_default()
            ),
        )
    })
}

fn type_info<T>(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<TypeInfo, TypeError> {
    factory.layout.type_info(ty).ok_or_else(|| {
        TypeError::new(
            factory.structures,
            ty,
            dest_name::<T>(),
            "no layout for type",
        )
    })
}

// ---------------------------------------------------------------------
// Integral destinations

/// Conversion from the raw integral load, width-dispatched and
/// sign-extended by the reader. Enum-like destinations implement this to
/// become readable.
pub trait FromScalar: Sized + 'static {
    fn from_i64(value: i64) -> Self;
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_from_scalar {
    ($($ty:ty),*) => {
        $(impl FromScalar for $ty {
            fn from_i64(value: i64) -> Self {
                value as $ty
            }
            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        })*
    };
}

impl_from_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

impl FromScalar for bool {
    fn from_i64(value: i64) -> Self {
        value != 0
    }
    fn from_u64(value: u64) -> Self {
        value != 0
    }
}

struct IntegralReader<T> {
    size: usize,
    signed: bool,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: FromScalar> ItemRead<T> for IntegralReader<T> {
    fn read<'a>(
        &'a self,
        _session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            *out = if self.signed {
                T::from_i64(LE::read_int(&data.data[..self.size], self.size))
            } else {
                T::from_u64(LE::read_uint(&data.data[..self.size], self.size))
            };
            Ok(())
        })
    }
}

/// Reader for integral destinations: integer and bool primitives, enums
/// and bitfields through their underlying kind, and pointers when the
/// destination is pointer-sized.
pub fn integral_item_reader<T: FromScalar>(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<T>, TypeError> {
    let base = match factory.structures.get(ty) {
        Type::Primitive(kind) => *kind,
        Type::Enum(e) => e.base,
        Type::Bitfield(b) => b.base,
        Type::Pointer(_) => {
            if RustTypeId::of::<T>() != RustTypeId::of::<usize>() {
                return Err(TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<T>(),
                    "pointer requires a pointer-sized destination",
                ));
            }
            let size = factory.abi.pointer().size;
            return Ok(ItemReader::new(
                size,
                IntegralReader::<T> {
                    size,
                    signed: false,
                    _marker: std::marker::PhantomData,
                },
            ));
        }
        _ => {
            return Err(TypeError::new(
                factory.structures,
                ty,
                dest_name::<T>(),
                "incompatible type",
            ))
        }
    };
    if !base.is_integral() {
        return Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<T>(),
            "not an integral type",
        ));
    }
    let size = type_info::<T>(factory, ty)?.size;
    if size > std::mem::size_of::<T>() {
        return Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<T>(),
            format!(
                "storage is too small ({}, must be at least {size})",
                std::mem::size_of::<T>()
            ),
        ));
    }
    Ok(ItemReader::new(
        size,
        IntegralReader::<T> {
            size,
            signed: base.is_signed(),
            _marker: std::marker::PhantomData,
        },
    ))
}

macro_rules! impl_integral_dest {
    ($($ty:ty),*) => {
        $(impl ReadDest for $ty {
            fn make_reader(
                factory: &ReaderFactory<'_>,
                ty: TypeId,
            ) -> Result<ItemReader<Self>, TypeError> {
                integral_item_reader::<Self>(factory, ty)
            }
            fn make_pointee(
                factory: &ReaderFactory<'_>,
                pointer: TypeId,
            ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
                static_pointee::<Self>(factory, pointer)
            }
        })*
    };
}

impl_integral_dest!(i8, u8, i16, u16, i32, u32, i64, u64, usize, bool);

// ---------------------------------------------------------------------
// Strings

struct StringReader {
    kind: PrimitiveKind,
}

impl ItemRead<String> for StringReader {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut String,
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            match self.kind {
                PrimitiveKind::StdString => {
                    *out = session.abi().read_string(session.process(), data).await?;
                    Ok(())
                }
                _ => Err(ReadError::NotImplemented),
            }
        })
    }
}

/// Reader for `String` destinations (`stl-string` schema fields).
pub fn string_item_reader(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<String>, TypeError> {
    let kind = match factory.structures.get(ty) {
        Type::Primitive(kind @ (PrimitiveKind::StdString | PrimitiveKind::PtrString)) => *kind,
        Type::Primitive(_) => {
            return Err(TypeError::new(
                factory.structures,
                ty,
                dest_name::<String>(),
                "not a string type",
            ))
        }
        _ => {
            return Err(TypeError::new(
                factory.structures,
                ty,
                dest_name::<String>(),
                "not a primitive type",
            ))
        }
    };
    let size = factory.abi.primitive(kind).size;
    Ok(ItemReader::new(size, StringReader { kind }))
}

impl ReadDest for String {
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError> {
        string_item_reader(factory, ty)
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
        static_pointee::<Self>(factory, pointer)
    }
}

// ---------------------------------------------------------------------
// Flag arrays

/// Dense bit sequence read from a flag array; index `i` is bit `i % 8`
/// of byte `i / 8`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagArray(pub Vec<bool>);

impl FlagArray {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }
}

struct FlagArrayReader {
    bits_offset: usize,
    size_offset: usize,
    implemented: bool,
}

impl ItemRead<FlagArray> for FlagArrayReader {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut FlagArray,
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            if !self.implemented {
                return Err(ReadError::NotImplemented);
            }
            let p = session.abi().pointer().size;
            let address = session
                .abi()
                .read_pointer(&data.data[self.bits_offset..self.bits_offset + p]);
            let len =
                LE::read_u32(&data.data[self.size_offset..self.size_offset + 4]) as usize;
            let bytes = session.process().read(address, len).await?;
            out.0 = (0..len * 8)
                .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(())
        })
    }
}

/// Reader for [`FlagArray`] destinations (`df-flagarray` fields).
pub fn flag_array_item_reader(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<FlagArray>, TypeError> {
    match factory.structures.get(ty) {
        Type::Df(container) if container.kind == DfKind::FlagArray => {
            let layout = factory.layout.compound(container.compound).ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<FlagArray>(),
                    "no layout for flag array",
                )
            })?;
            let size = type_info::<FlagArray>(factory, ty)?.size;
            Ok(ItemReader::new(
                size,
                FlagArrayReader {
                    bits_offset: layout.member_offsets[df_members::FLAG_ARRAY_BITS],
                    size_offset: layout.member_offsets[df_members::FLAG_ARRAY_SIZE],
                    implemented: true,
                },
            ))
        }
        Type::Primitive(PrimitiveKind::DFFlagArray) => {
            let size = factory.abi.primitive(PrimitiveKind::DFFlagArray).size;
            Ok(ItemReader::new(
                size,
                FlagArrayReader {
                    bits_offset: 0,
                    size_offset: factory.abi.pointer().size,
                    implemented: true,
                },
            ))
        }
        Type::Primitive(PrimitiveKind::StdBitVector) => {
            let size = factory.abi.primitive(PrimitiveKind::StdBitVector).size;
            Ok(ItemReader::new(
                size,
                FlagArrayReader {
                    bits_offset: 0,
                    size_offset: 0,
                    implemented: false,
                },
            ))
        }
        _ => Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<FlagArray>(),
            "not a flag array type",
        )),
    }
}

impl ReadDest for FlagArray {
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError> {
        flag_array_item_reader(factory, ty)
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
        static_pointee::<Self>(factory, pointer)
    }
}

// ---------------------------------------------------------------------
// Sequences

enum SequenceKind {
    Vector {
        item_info: TypeInfo,
    },
    DfArray {
        data_offset: usize,
        size_offset: usize,
        item_info: TypeInfo,
    },
    LinkedList {
        node_size: usize,
        item_offset: usize,
        next_offset: usize,
    },
}

struct SequenceReader<T> {
    kind: SequenceKind,
    item: ItemReader<T>,
}

impl<T: ReadDest + Default> SequenceReader<T> {
    async fn read_contiguous<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
        len: usize,
        stride: usize,
        args: ReadArgs,
    ) -> Result<Vec<T>, ReadError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = session.process().read(address, len * stride).await?;
        let mut item_args = Vec::with_capacity(len);
        for index in 0..len {
            item_args.push(args.for_item(index, len)?);
        }
        let reads = item_args.into_iter().enumerate().map(|(index, arg)| {
            let view = MemoryView::new(
                address + index * stride,
                &bytes[index * stride..(index + 1) * stride],
            );
            async move {
                let mut value = T::default();
                self.item.read(session, view, &mut value, arg).await?;
                Ok::<T, ReadError>(value)
            }
        });
        join_all(reads).await.into_iter().collect()
    }
}

impl<T: ReadDest + Default> ItemRead<Vec<T>> for SequenceReader<T> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut Vec<T>,
        args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            match &self.kind {
                SequenceKind::Vector { item_info } => {
                    let header = session.abi().read_vector(data, *item_info)?;
                    *out = self
                        .read_contiguous(session, header.address, header.len, item_info.size, args)
                        .await?;
                    Ok(())
                }
                SequenceKind::DfArray {
                    data_offset,
                    size_offset,
                    item_info,
                } => {
                    let p = session.abi().pointer().size;
                    let address = session
                        .abi()
                        .read_pointer(&data.data[*data_offset..*data_offset + p]);
                    let len =
                        LE::read_u16(&data.data[*size_offset..*size_offset + 2]) as usize;
                    *out = self
                        .read_contiguous(session, address, len, item_info.size, args)
                        .await?;
                    Ok(())
                }
                SequenceKind::LinkedList {
                    node_size,
                    item_offset,
                    next_offset,
                } => {
                    let p = session.abi().pointer().size;
                    // Walk from the header's next pointer; the schema
                    // asserts the list is acyclic.
                    let mut address = session
                        .abi()
                        .read_pointer(&data.data[*next_offset..*next_offset + p]);
                    let mut nodes = Vec::new();
                    while address != 0 {
                        let bytes = session.process().read(address, *node_size).await?;
                        let next = session
                            .abi()
                            .read_pointer(&bytes[*next_offset..*next_offset + p]);
                        nodes.push((address, bytes));
                        address = next;
                    }
                    let reads = nodes.iter().map(|(node_address, bytes)| {
                        let view = MemoryView::new(
                            node_address + item_offset,
                            &bytes[*item_offset..*item_offset + self.item.size()],
                        );
                        async move {
                            let mut value = T::default();
                            self.item
                                .read(session, view, &mut value, ReadArgs::None)
                                .await?;
                            Ok::<T, ReadError>(value)
                        }
                    });
                    *out = join_all(reads).await.into_iter().collect::<Result<_, _>>()?;
                    Ok(())
                }
            }
        })
    }
}

/// Reader for `Vec<T>` destinations: `stl-vector`, `df-array` and
/// linked-list node types.
pub fn sequence_item_reader<T: ReadDest + Default>(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<Vec<T>>, TypeError> {
    match factory.structures.get(ty) {
        Type::Std(container) if container.kind == StdKind::Vector => {
            let item_slot = container.params.first().ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<Vec<T>>(),
                    "missing container item type",
                )
            })?;
            let item_id = slot_id::<Vec<T>>(factory, ty, item_slot)?;
            let item_info = type_info::<Vec<T>>(factory, item_id)?;
            let item = T::make_reader(factory, item_id)?;
            Ok(ItemReader::new(
                factory.abi.std_container(StdKind::Vector).size,
                SequenceReader {
                    kind: SequenceKind::Vector { item_info },
                    item,
                },
            ))
        }
        Type::Df(container) if container.kind == DfKind::Array => {
            let layout = factory.layout.compound(container.compound).ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<Vec<T>>(),
                    "no layout for df-array",
                )
            })?;
            let item_slot = container.params.first().ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<Vec<T>>(),
                    "missing container item type",
                )
            })?;
            let item_id = slot_id::<Vec<T>>(factory, ty, item_slot)?;
            let item_info = type_info::<Vec<T>>(factory, item_id)?;
            let item = T::make_reader(factory, item_id)?;
            Ok(ItemReader::new(
                type_info::<Vec<T>>(factory, ty)?.size,
                SequenceReader {
                    kind: SequenceKind::DfArray {
                        data_offset: layout.member_offsets[df_members::ARRAY_DATA],
                        size_offset: layout.member_offsets[df_members::ARRAY_SIZE],
                        item_info,
                    },
                    item,
                },
            ))
        }
        Type::Df(container) if container.kind == DfKind::LinkedList => {
            let layout = factory.layout.compound(container.compound).ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<Vec<T>>(),
                    "no layout for linked list",
                )
            })?;
            let node = factory.structures.compound(container.compound).ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<Vec<T>>(),
                    "linked list has no node compound",
                )
            })?;
            let item_member = node.members.get(df_members::LINKED_LIST_ITEM).ok_or_else(|| {
                TypeError::new(
                    factory.structures,
                    ty,
                    dest_name::<Vec<T>>(),
                    "linked list node has no item member",
                )
            })?;
            let item_id = slot_id::<Vec<T>>(factory, ty, &item_member.ty)?;
            let item = T::make_reader(factory, item_id)?;
            Ok(ItemReader::new(
                type_info::<Vec<T>>(factory, ty)?.size,
                SequenceReader {
                    kind: SequenceKind::LinkedList {
                        node_size: type_info::<Vec<T>>(factory, container.compound)?.size,
                        item_offset: layout.member_offsets[df_members::LINKED_LIST_ITEM],
                        next_offset: layout.member_offsets[df_members::LINKED_LIST_NEXT],
                    },
                    item,
                },
            ))
        }
        _ => Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<Vec<T>>(),
            "not a sequence container",
        )),
    }
}

impl<T: ReadDest + Default> ReadDest for Vec<T> {
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError> {
        sequence_item_reader::<T>(factory, ty)
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
        static_pointee::<Self>(factory, pointer)
    }
}

// ---------------------------------------------------------------------
// Fixed-size arrays

struct ArrayReader<T, const N: usize> {
    stride: usize,
    item: ItemReader<T>,
}

impl<T: ReadDest + Default, const N: usize> ItemRead<[T; N]> for ArrayReader<T, N> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut [T; N],
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let reads = (0..N).map(|index| {
                let view = data.subview(index * self.stride, self.stride);
                async move {
                    let mut value = T::default();
                    self.item
                        .read(session, view, &mut value, ReadArgs::None)
                        .await?;
                    Ok::<T, ReadError>(value)
                }
            });
            let values = join_all(reads).await;
            for (slot, value) in out.iter_mut().zip(values) {
                *slot = value?;
            }
            Ok(())
        })
    }
}

/// Reader for `[T; N]` destinations (`static-array` with extent `N`).
pub fn array_item_reader<T: ReadDest + Default, const N: usize>(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<[T; N]>, TypeError> {
    let Type::StaticArray(array) = factory.structures.get(ty) else {
        return Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<[T; N]>(),
            "not a static array",
        ));
    };
    if array.extent != Some(N) {
        return Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<[T; N]>(),
            format!("invalid array size (expected {N}, schema has {:?})", array.extent),
        ));
    }
    let item_id = slot_id::<[T; N]>(factory, ty, &array.item)?;
    let stride = type_info::<[T; N]>(factory, item_id)?.size;
    let item = T::make_reader(factory, item_id)?;
    Ok(ItemReader::new(stride * N, ArrayReader::<T, N> { stride, item }))
}

impl<T: ReadDest + Default, const N: usize> ReadDest for [T; N]
where
    [T; N]: Default,
{
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError> {
        array_item_reader::<T, N>(factory, ty)
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
        static_pointee::<Self>(factory, pointer)
    }
}

// ---------------------------------------------------------------------
// Pointers

/// The default dereference behavior: read the pointed-to object in
/// place. Null addresses and pointers flagged `has-bad-pointers` read as
/// absent; shared reads intern by `(address, destination type)`.
pub fn static_pointee<T: ReadDest + Default>(
    factory: &ReaderFactory<'_>,
    pointer: TypeId,
) -> Result<Rc<dyn PointeeRead<T>>, TypeError> {
    let Type::Pointer(p) = factory.structures.get(pointer) else {
        return Err(TypeError::new(
            factory.structures,
            pointer,
            dest_name::<T>(),
            "not a pointer",
        ));
    };
    if p.has_bad_pointers {
        return Ok(Rc::new(BadPointee));
    }
    let target_slot = p.item.as_ref().ok_or_else(|| {
        TypeError::new(
            factory.structures,
            pointer,
            dest_name::<T>(),
            "pointer has no item type",
        )
    })?;
    let target = slot_id::<T>(factory, pointer, target_slot)?;
    let reader = T::make_reader(factory, target)?;
    Ok(Rc::new(StaticPointee {
        reader: Rc::new(reader),
    }))
}

struct BadPointee;

impl<T: ReadDest> PointeeRead<T> for BadPointee {
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

struct StaticPointee<T> {
    reader: Rc<ItemReader<T>>,
}

impl<T: ReadDest + Default> PointeeRead<T> for StaticPointee<T> {
    fn read_unique<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Box<T>>, ReadError>> {
        Box::pin(async move {
            if address == 0 {
                return Ok(None);
            }
            let data = session.process().read(address, self.reader.size()).await?;
            let mut value = T::default();
            self.reader
                .read(
                    session,
                    MemoryView::new(address, &data),
                    &mut value,
                    ReadArgs::None,
                )
                .await?;
            Ok(Some(Box::new(value)))
        })
    }

    fn read_shared<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        address: usize,
    ) -> LocalBoxFuture<'a, Result<Option<Rc<T>>, ReadError>> {
        Box::pin(async move {
            if address == 0 {
                return Ok(None);
            }
            let reader = self.reader.clone();
            let value = session
                .shared_object(RustTypeId::of::<T>(), address, move |session| {
                    Box::pin(async move {
                        let data = session.process().read(address, reader.size()).await?;
                        let mut value = T::default();
                        reader
                            .read(
                                session,
                                MemoryView::new(address, &data),
                                &mut value,
                                ReadArgs::None,
                            )
                            .await?;
                        Ok(Rc::new(value) as Rc<dyn std::any::Any>)
                    })
                })
                .await?;
            value
                .downcast::<T>()
                .map(Some)
                .map_err(|_| ReadError::TypeMismatch)
        })
    }
}

struct UniquePointerReader<T> {
    pointee: Rc<dyn PointeeRead<T>>,
}

impl<T: ReadDest> ItemRead<Option<Box<T>>> for UniquePointerReader<T> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut Option<Box<T>>,
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let address = session.abi().read_pointer(data.data);
            *out = self.pointee.read_unique(session, address).await?;
            Ok(())
        })
    }
}

struct SharedPointerReader<T> {
    pointee: Rc<dyn PointeeRead<T>>,
}

impl<T: ReadDest> ItemRead<Option<Rc<T>>> for SharedPointerReader<T> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut Option<Rc<T>>,
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let address = session.abi().read_pointer(data.data);
            *out = self.pointee.read_shared(session, address).await?;
            Ok(())
        })
    }
}

fn check_pointer_schema<T>(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<(), TypeError> {
    match factory.structures.get(ty) {
        Type::Pointer(_) => Ok(()),
        _ => Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<T>(),
            "not a pointer",
        )),
    }
}

impl<T: ReadDest> ReadDest for Option<Box<T>> {
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError> {
        check_pointer_schema::<Self>(factory, ty)?;
        let pointee = T::make_pointee(factory, ty)?;
        Ok(ItemReader::new(
            factory.abi.pointer().size,
            UniquePointerReader { pointee },
        ))
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
        static_pointee::<Self>(factory, pointer)
    }
}

impl<T: ReadDest> ReadDest for Option<Rc<T>> {
    fn make_reader(factory: &ReaderFactory<'_>, ty: TypeId) -> Result<ItemReader<Self>, TypeError> {
        check_pointer_schema::<Self>(factory, ty)?;
        let pointee = T::make_pointee(factory, ty)?;
        Ok(ItemReader::new(
            factory.abi.pointer().size,
            SharedPointerReader { pointee },
        ))
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: TypeId,
    ) -> Result<Rc<dyn PointeeRead<Self>>, TypeError> {
        static_pointee::<Self>(factory, pointer)
    }
}

// ---------------------------------------------------------------------
// Structures and unions

struct StructureItemReader<T: ReadableStructure> {
    reader: Rc<super::CompoundReader<T>>,
}

impl<T: ReadableStructure> ItemRead<T> for StructureItemReader<T> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
        _args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        self.reader.read(session, data, out)
    }
}

/// Reader for structure destinations, delegating to the cached compound
/// reader for `T`.
pub fn structure_item_reader<T: ReadableStructure>(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<T>, TypeError> {
    let reader = factory.compound_reader::<T>()?;
    if reader.compound() != ty {
        return Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<T>(),
            "invalid type",
        ));
    }
    Ok(ItemReader::new(
        reader.info().size,
        StructureItemReader { reader },
    ))
}

struct UnionItemReader<T: ReadableUnion> {
    reader: Rc<super::UnionReader<T>>,
}

impl<T: ReadableUnion> ItemRead<T> for UnionItemReader<T> {
    fn read<'a>(
        &'a self,
        session: &'a ReadSession<'a>,
        data: MemoryView<'a>,
        out: &'a mut T,
        args: ReadArgs,
    ) -> LocalBoxFuture<'a, Result<(), ReadError>> {
        Box::pin(async move {
            let ReadArgs::Alternative(alternative) = args else {
                return Err(ReadError::MissingDiscriminator);
            };
            self.reader.read(session, data, out, alternative).await
        })
    }
}

/// Reader for union destinations; the read-time argument selects the
/// alternative.
pub fn union_item_reader<T: ReadableUnion>(
    factory: &ReaderFactory<'_>,
    ty: TypeId,
) -> Result<ItemReader<T>, TypeError> {
    let reader = factory.union_reader::<T>()?;
    if reader.compound() != ty {
        return Err(TypeError::new(
            factory.structures,
            ty,
            dest_name::<T>(),
            "invalid type",
        ));
    }
    Ok(ItemReader::new(
        reader.info().size,
        UnionItemReader { reader },
    ))
}

/// Implements [`ReadDest`] for a [`ReadableStructure`].
#[macro_export]
macro_rules! structure_read_dest {
    ($ty:ty) => {
        impl $crate::reader::ReadDest for $ty {
            fn make_reader(
                factory: &$crate::ReaderFactory<'_>,
                ty: $crate::schema::TypeId,
            ) -> Result<$crate::reader::ItemReader<Self>, $crate::reader::TypeError> {
                $crate::reader::structure_item_reader::<Self>(factory, ty)
            }
            fn make_pointee(
                factory: &$crate::ReaderFactory<'_>,
                pointer: $crate::schema::TypeId,
            ) -> Result<
                std::rc::Rc<dyn $crate::reader::PointeeRead<Self>>,
                $crate::reader::TypeError,
            > {
                $crate::reader::static_pointee::<Self>(factory, pointer)
            }
        }
    };
}

/// Implements [`ReadDest`] for a [`ReadableUnion`].
#[macro_export]
macro_rules! union_read_dest {
    ($ty:ty) => {
        impl $crate::reader::ReadDest for $ty {
            fn make_reader(
                factory: &$crate::ReaderFactory<'_>,
                ty: $crate::schema::TypeId,
            ) -> Result<$crate::reader::ItemReader<Self>, $crate::reader::TypeError> {
                $crate::reader::union_item_reader::<Self>(factory, ty)
            }
            fn make_pointee(
                factory: &$crate::ReaderFactory<'_>,
                pointer: $crate::schema::TypeId,
            ) -> Result<
                std::rc::Rc<dyn $crate::reader::PointeeRead<Self>>,
                $crate::reader::TypeError,
            > {
                $crate::reader::static_pointee::<Self>(factory, pointer)
            }
        }
    };
}
