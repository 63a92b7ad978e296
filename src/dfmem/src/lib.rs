//! # dfmem
//!
//! Typed access to a running Dwarf Fortress process, driven by the
//! df-structures XML corpus.
//!
//! The pipeline: load the schema ([`Structures`]), pick the
//! [`VersionInfo`](schema::VersionInfo) matching the target's build
//! identifier, build a [`ReaderFactory`] (which selects the
//! [`Abi`](abi::Abi) and computes the [`MemoryLayout`]), then open a
//! [`ReadSession`] over a [`Process`] and materialize game objects into
//! your own structures.
//!
//! ```no_run
//! use dfmem::{MemoryLayout, Structures};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let structures = Structures::load("df-structures")?;
//! let version = structures
//!     .version_by_name("v0.47.05 linux64")
//!     .ok_or("unknown version")?;
//! let abi = dfmem::abi::Abi::from_version_name(&version.version_name)?;
//! let layout = MemoryLayout::new(&structures, abi)?;
//!
//! let unit = structures.find_compound("unit").ok_or("no unit type")?;
//! let info = layout.type_info(unit).ok_or("no layout")?;
//! println!("unit is {} bytes, aligned {}", info.size, info.align);
//! # Ok(())
//! # }
//! ```
//!
//! Reading live memory adds a [`Process`] (ptrace-based adapters for
//! native and Wine targets live in [`process::linux`]), usually wrapped
//! in [`ProcessVectorizer`] and [`ProcessCache`] so the cooperative read
//! tasks batch their traffic into few scatter reads.

pub mod abi;
pub mod layout;
pub mod path;
pub mod process;
pub mod reader;
pub mod schema;

#[doc(inline)]
pub use abi::{Abi, AbiError, TypeInfo};
#[doc(inline)]
pub use layout::{CompoundLayout, LayoutError, MemoryLayout};
#[doc(inline)]
pub use process::{MemoryView, Process, ProcessCache, ProcessVectorizer};
#[doc(inline)]
pub use reader::{
    Fallback, FlagArray, ReadDest, ReadError, ReadSession, ReadableStructure, ReadableUnion,
    ReaderFactory, TypeError, TypedPointer,
};
#[doc(inline)]
pub use schema::{SchemaError, Structures, TypeId};
