//! Per-target ABI: sizes, alignments and byte-level decoders.
//!
//! An [`Abi`] records how one compiler/architecture combination lays out
//! primitives and library containers, and knows how to decode pointers,
//! `std::vector` headers and the three `std::string` representations the
//! game has shipped with. [`MemoryLayout`](crate::layout::MemoryLayout)
//! builds on these tables to compute whole-compound layouts.

use std::io;

use byteorder::{ByteOrder, LE};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::process::{MemoryView, Process};
use crate::schema::{PrimitiveKind, StdKind};

/// Strings longer than this are assumed to be garbage memory.
pub const MAX_STRING_CAPACITY: usize = 1_000_000;

/// Errors when decoding container representations.
#[derive(Debug, Error)]
pub enum AbiError {
    #[error("unaligned pointer")]
    UnalignedPointer,
    #[error("invalid pointer")]
    InvalidPointer,
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid capacity")]
    InvalidCapacity,
    #[error("failed to parse version name {0:?}")]
    BadVersionName(String),
    #[error("unsupported abi for {0:?}")]
    UnsupportedVersion(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Size and alignment of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeInfo {
    pub size: usize,
    pub align: usize,
}

impl TypeInfo {
    pub const fn new(size: usize, align: usize) -> TypeInfo {
        TypeInfo { size, align }
    }
}

/// Target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    Amd64,
}

impl Arch {
    pub const fn pointer_size(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::Amd64 => 8,
        }
    }
}

/// Compiler discipline for compound layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    Gnu,
    Msvc,
}

/// Which `std::string` representation the target uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringLayout {
    /// libstdc++ pre-C++11 refcounted string: a bare data pointer with a
    /// `{length, capacity, refcount}` record prepended to the payload.
    GccCow,
    /// libstdc++ C++11 small-string optimization:
    /// `{data, length, union {local[16], capacity}}`.
    GccSso,
    /// MSVC 2015+: `{union {local[16], data}, length, capacity}`,
    /// inline iff `capacity <= 15`.
    Msvc2015,
}

/// Decoded `std::vector` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorInfo {
    /// Address of the first item.
    pub address: usize,
    /// Item count.
    pub len: usize,
}

const fn min_size(a: usize, b: usize) -> usize {
    if a < b {
        a
    } else {
        b
    }
}

const P_COUNT: usize = PrimitiveKind::COUNT;
const C_COUNT: usize = StdKind::COUNT;

const fn fixed_int_types(max_align: usize) -> [TypeInfo; P_COUNT] {
    let mut info = [TypeInfo::new(0, 0); P_COUNT];
    let fixed: [(PrimitiveKind, usize); 9] = [
        (PrimitiveKind::Char, 1),
        (PrimitiveKind::Int8, 1),
        (PrimitiveKind::UInt8, 1),
        (PrimitiveKind::Int16, 2),
        (PrimitiveKind::UInt16, 2),
        (PrimitiveKind::Int32, 4),
        (PrimitiveKind::UInt32, 4),
        (PrimitiveKind::Int64, 8),
        (PrimitiveKind::UInt64, 8),
    ];
    let mut i = 0;
    while i < fixed.len() {
        let (kind, size) = fixed[i];
        info[kind as usize] = TypeInfo::new(size, min_size(size, max_align));
        i += 1;
    }
    info
}

const fn gcc_primitives(p: usize, cxx11: bool) -> [TypeInfo; P_COUNT] {
    let mut info = fixed_int_types(p);
    info[PrimitiveKind::Bool as usize] = TypeInfo::new(1, 1);
    info[PrimitiveKind::Long as usize] = TypeInfo::new(p, p);
    info[PrimitiveKind::ULong as usize] = TypeInfo::new(p, p);
    info[PrimitiveKind::SizeT as usize] = TypeInfo::new(p, p);
    info[PrimitiveKind::SFloat as usize] = TypeInfo::new(4, 4);
    info[PrimitiveKind::DFloat as usize] = TypeInfo::new(8, p);
    info[PrimitiveKind::PtrString as usize] = TypeInfo::new(p, p);
    info[PrimitiveKind::StdString as usize] = if cxx11 {
        TypeInfo::new(2 * p + 16, p)
    } else {
        TypeInfo::new(p, p)
    };
    info[PrimitiveKind::StdBitVector as usize] = TypeInfo::new(5 * p, p);
    info[PrimitiveKind::StdFStream as usize] = TypeInfo::new(61 * p + 40, p);
    info[PrimitiveKind::StdMap as usize] = TypeInfo::new(6 * p, p);
    info[PrimitiveKind::StdUnorderedMap as usize] = TypeInfo::new(7 * p, p);
    info[PrimitiveKind::StdMutex as usize] = TypeInfo::new(4 * p + 8, p);
    info[PrimitiveKind::StdConditionVariable as usize] = TypeInfo::new(48, p);
    info[PrimitiveKind::StdFuture as usize] = TypeInfo::new(2 * p, p);
    info[PrimitiveKind::StdFunction as usize] = TypeInfo::new(4 * p, p);
    info[PrimitiveKind::StdFsPath as usize] = TypeInfo::new(3 * p + 16, p);
    info[PrimitiveKind::DFFlagArray as usize] = TypeInfo::new(round_up(p + 4, p), p);
    info[PrimitiveKind::DFArray as usize] = TypeInfo::new(round_up(p + 2, p), p);
    info
}

const fn msvc_primitives(p: usize) -> [TypeInfo; P_COUNT] {
    let mut info = fixed_int_types(usize::MAX);
    info[PrimitiveKind::Bool as usize] = TypeInfo::new(1, 1);
    info[PrimitiveKind::Long as usize] = TypeInfo::new(4, 4);
    info[PrimitiveKind::ULong as usize] = TypeInfo::new(4, 4);
    info[PrimitiveKind::SizeT as usize] = TypeInfo::new(p, p);
    info[PrimitiveKind::SFloat as usize] = TypeInfo::new(4, 4);
    info[PrimitiveKind::DFloat as usize] = TypeInfo::new(8, 8);
    info[PrimitiveKind::PtrString as usize] = TypeInfo::new(p, p);
    info[PrimitiveKind::StdString as usize] = TypeInfo::new(2 * p + 16, p);
    info[PrimitiveKind::StdBitVector as usize] = TypeInfo::new(4 * p, p);
    info[PrimitiveKind::StdFStream as usize] = TypeInfo::new(22 * p + 104, 8);
    info[PrimitiveKind::StdMap as usize] = TypeInfo::new(2 * p, p);
    info[PrimitiveKind::StdUnorderedMap as usize] = TypeInfo::new(8 * p, p);
    info[PrimitiveKind::StdMutex as usize] = TypeInfo::new(8 * p + 16, p);
    info[PrimitiveKind::StdConditionVariable as usize] = TypeInfo::new(8 * p + 8, p);
    info[PrimitiveKind::StdFuture as usize] = TypeInfo::new(2 * p, p);
    info[PrimitiveKind::StdFunction as usize] = TypeInfo::new(6 * p + 16, 8);
    info[PrimitiveKind::StdFsPath as usize] = TypeInfo::new(2 * p + 16, p);
    info[PrimitiveKind::DFFlagArray as usize] = TypeInfo::new(round_up(p + 4, p), p);
    info[PrimitiveKind::DFArray as usize] = TypeInfo::new(round_up(p + 2, p), p);
    info
}

const fn gcc_containers(p: usize, cxx11: bool) -> [TypeInfo; C_COUNT] {
    let mut info = [TypeInfo::new(0, 0); C_COUNT];
    info[StdKind::SharedPtr as usize] = TypeInfo::new(2 * p, p);
    info[StdKind::WeakPtr as usize] = TypeInfo::new(2 * p, p);
    info[StdKind::Vector as usize] = TypeInfo::new(3 * p, p);
    info[StdKind::Deque as usize] = if cxx11 {
        TypeInfo::new(10 * p, p)
    } else {
        TypeInfo::new(3 * p, p)
    };
    info[StdKind::Set as usize] = TypeInfo::new(6 * p, p);
    info[StdKind::Map as usize] = TypeInfo::new(6 * p, p);
    info[StdKind::UnorderedMap as usize] = TypeInfo::new(7 * p, p);
    info[StdKind::Future as usize] = TypeInfo::new(2 * p, p);
    info
}

const fn msvc_containers(p: usize) -> [TypeInfo; C_COUNT] {
    let mut info = [TypeInfo::new(0, 0); C_COUNT];
    info[StdKind::SharedPtr as usize] = TypeInfo::new(2 * p, p);
    info[StdKind::WeakPtr as usize] = TypeInfo::new(2 * p, p);
    info[StdKind::Vector as usize] = TypeInfo::new(3 * p, p);
    info[StdKind::Deque as usize] = TypeInfo::new(5 * p, p);
    info[StdKind::Set as usize] = TypeInfo::new(2 * p, p);
    info[StdKind::Map as usize] = TypeInfo::new(2 * p, p);
    info[StdKind::UnorderedMap as usize] = TypeInfo::new(8 * p, p);
    info[StdKind::Future as usize] = TypeInfo::new(2 * p, p);
    info
}

pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

/// One compiler/architecture combination's memory conventions.
#[derive(Debug, PartialEq, Eq)]
pub struct Abi {
    pub architecture: Arch,
    pub compiler: CompilerKind,
    primitives: [TypeInfo; P_COUNT],
    pointer: TypeInfo,
    std_containers: [TypeInfo; C_COUNT],
    strings: StringLayout,
}

impl Abi {
    /// Pre-C++11 libstdc++ on x86.
    pub const GCC_32: Abi = Abi::gcc(Arch::X86, false);
    /// Pre-C++11 libstdc++ on x86-64.
    pub const GCC_64: Abi = Abi::gcc(Arch::Amd64, false);
    /// C++11 libstdc++ on x86.
    pub const GCC_CXX11_32: Abi = Abi::gcc(Arch::X86, true);
    /// C++11 libstdc++ on x86-64.
    pub const GCC_CXX11_64: Abi = Abi::gcc(Arch::Amd64, true);
    /// MSVC 2015 (v140) on x86.
    pub const MSVC2015_32: Abi = Abi::msvc(Arch::X86);
    /// MSVC 2015 (v140) on x86-64.
    pub const MSVC2015_64: Abi = Abi::msvc(Arch::Amd64);

    const fn gcc(arch: Arch, cxx11: bool) -> Abi {
        let p = arch.pointer_size();
        Abi {
            architecture: arch,
            compiler: CompilerKind::Gnu,
            primitives: gcc_primitives(p, cxx11),
            pointer: TypeInfo::new(p, p),
            std_containers: gcc_containers(p, cxx11),
            strings: if cxx11 {
                StringLayout::GccSso
            } else {
                StringLayout::GccCow
            },
        }
    }

    const fn msvc(arch: Arch) -> Abi {
        let p = arch.pointer_size();
        Abi {
            architecture: arch,
            compiler: CompilerKind::Msvc,
            primitives: msvc_primitives(p),
            pointer: TypeInfo::new(p, p),
            std_containers: msvc_containers(p),
            strings: StringLayout::Msvc2015,
        }
    }

    /// Pick the ABI matching a version name such as `v0.47.05 linux64`.
    ///
    /// The major series selects between the legacy and C++11 libstdc++
    /// string representations on Linux.
    pub fn from_version_name(name: &str) -> Result<&'static Abi, AbiError> {
        let mut tokens = name.split_whitespace();
        let version = tokens
            .next()
            .and_then(|tok| tok.strip_prefix("v0."))
            .ok_or_else(|| AbiError::BadVersionName(name.to_owned()))?;
        let major: u32 = version
            .split(['.', '-'])
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(|| AbiError::BadVersionName(name.to_owned()))?;
        let platform = tokens
            .next()
            .ok_or_else(|| AbiError::BadVersionName(name.to_owned()))?;
        match platform {
            "linux32" if major >= 50 => Ok(&Abi::GCC_CXX11_32),
            "linux32" => Ok(&Abi::GCC_32),
            "linux64" if major >= 50 => Ok(&Abi::GCC_CXX11_64),
            "linux64" => Ok(&Abi::GCC_64),
            "win32" => Ok(&Abi::MSVC2015_32),
            "win64" => Ok(&Abi::MSVC2015_64),
            _ => Err(AbiError::UnsupportedVersion(name.to_owned())),
        }
    }

    /// Size and alignment of a primitive.
    pub fn primitive(&self, kind: PrimitiveKind) -> TypeInfo {
        self.primitives[kind as usize]
    }

    /// Pointer size and alignment.
    pub fn pointer(&self) -> TypeInfo {
        self.pointer
    }

    /// Size and alignment of a container whose layout does not depend on
    /// its parameters.
    pub fn std_container(&self, kind: StdKind) -> TypeInfo {
        self.std_containers[kind as usize]
    }

    /// Size and alignment of `optional`/`variant`, which require complete
    /// parameter types. `None` for a parameter list the kind does not
    /// accept or a kind that is in the fixed table instead.
    pub fn dependent_container(&self, kind: StdKind, params: &[TypeInfo]) -> Option<TypeInfo> {
        match kind {
            StdKind::Optional => {
                let [item] = params else { return None };
                Some(TypeInfo::new(item.align + item.size, item.align))
            }
            StdKind::Variant => {
                if params.is_empty() {
                    return None;
                }
                let size = params.iter().map(|p| p.size).max().unwrap_or(0);
                let align = params.iter().map(|p| p.align).max().unwrap_or(1);
                Some(TypeInfo::new(align + size, align))
            }
            _ => None,
        }
    }

    /// Load a target pointer from the start of `data`.
    pub fn read_pointer(&self, data: &[u8]) -> usize {
        match self.architecture {
            Arch::X86 => LE::read_u32(data) as usize,
            Arch::Amd64 => LE::read_u64(data) as usize,
        }
    }

    /// Decode a `std::vector` header `{begin, end, end_capacity}`.
    ///
    /// All three pointers must be aligned to the item alignment, the used
    /// and allocated ranges must be non-negative multiples of the item
    /// size. Three null pointers are an empty vector.
    pub fn read_vector(&self, data: MemoryView<'_>, item: TypeInfo) -> Result<VectorInfo, AbiError> {
        let p = self.pointer.size;
        let begin = self.read_pointer(&data.data[0..p]);
        let end = self.read_pointer(&data.data[p..2 * p]);
        let end_capacity = self.read_pointer(&data.data[2 * p..3 * p]);
        if begin == 0 && end == 0 && end_capacity == 0 {
            return Ok(VectorInfo::default());
        }
        let align = item.align.max(1);
        if begin % align != 0 || end % align != 0 || end_capacity % align != 0 {
            return Err(AbiError::UnalignedPointer);
        }
        if item.size == 0 {
            return if end == begin && end_capacity == begin {
                Ok(VectorInfo::default())
            } else {
                Err(AbiError::InvalidLength)
            };
        }
        if end < begin || (end - begin) % item.size != 0 {
            return Err(AbiError::InvalidLength);
        }
        if end_capacity < end || (end_capacity - begin) % item.size != 0 {
            return Err(AbiError::InvalidCapacity);
        }
        Ok(VectorInfo {
            address: begin,
            len: (end - begin) / item.size,
        })
    }

    /// Read a `std::string` whose header bytes are in `data`.
    pub fn read_string<'a>(
        &'a self,
        process: &'a dyn Process,
        data: MemoryView<'a>,
    ) -> LocalBoxFuture<'a, Result<String, AbiError>> {
        match self.strings {
            StringLayout::GccCow => self.read_string_gcc_cow(process, data).boxed_local(),
            StringLayout::GccSso => self.read_string_gcc_sso(process, data).boxed_local(),
            StringLayout::Msvc2015 => self.read_string_msvc(process, data).boxed_local(),
        }
    }

    async fn read_string_gcc_cow(
        &self,
        process: &dyn Process,
        data: MemoryView<'_>,
    ) -> Result<String, AbiError> {
        let p = self.pointer.size;
        let addr = self.read_pointer(data.data);
        // The {length, capacity, refcount} record sits right before the
        // character data.
        let rep_addr = addr
            .checked_sub(3 * p)
            .ok_or(AbiError::InvalidPointer)?;
        let rep = process.read(rep_addr, 3 * p).await?;
        let length = self.read_pointer(&rep[0..p]);
        let capacity = self.read_pointer(&rep[p..2 * p]);
        if capacity > MAX_STRING_CAPACITY || length > capacity {
            return Err(AbiError::InvalidCapacity);
        }
        let payload = process.read(addr, length).await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    async fn read_string_gcc_sso(
        &self,
        process: &dyn Process,
        data: MemoryView<'_>,
    ) -> Result<String, AbiError> {
        let p = self.pointer.size;
        let buffer = self.read_pointer(&data.data[0..p]);
        let length = self.read_pointer(&data.data[p..2 * p]);
        let local = data.subview(2 * p, 16);
        let is_local = buffer == local.address;
        let capacity = if is_local {
            15
        } else {
            self.read_pointer(&local.data[0..p])
        };
        if capacity > MAX_STRING_CAPACITY || length > capacity {
            return Err(AbiError::InvalidCapacity);
        }
        if is_local {
            Ok(String::from_utf8_lossy(&local.data[..length]).into_owned())
        } else {
            let payload = process.read(buffer, length).await?;
            Ok(String::from_utf8_lossy(&payload).into_owned())
        }
    }

    async fn read_string_msvc(
        &self,
        process: &dyn Process,
        data: MemoryView<'_>,
    ) -> Result<String, AbiError> {
        let p = self.pointer.size;
        let length = self.read_pointer(&data.data[16..16 + p]);
        let capacity = self.read_pointer(&data.data[16 + p..16 + 2 * p]);
        if capacity > MAX_STRING_CAPACITY || length > capacity {
            return Err(AbiError::InvalidCapacity);
        }
        if capacity > 15 {
            let buffer = self.read_pointer(&data.data[0..p]);
            let payload = process.read(buffer, length).await?;
            Ok(String::from_utf8_lossy(&payload).into_owned())
        } else {
            Ok(String::from_utf8_lossy(&data.data[..length]).into_owned())
        }
    }
}
