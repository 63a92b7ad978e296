//! Compound types (structs, classes and unions).

use super::types::TypeSlot;

/// A compound member.
#[derive(Debug)]
pub struct Member {
    /// May be empty for anonymous members.
    pub name: String,
    pub ty: TypeSlot,
}

/// A virtual method declaration.
///
/// Only the presence of virtual methods matters for layout (it forces the
/// vtable slot); signatures are kept for downstream tooling.
#[derive(Debug, Default)]
pub struct Method {
    pub is_destructor: bool,
    pub name: String,
    pub return_type: Option<TypeSlot>,
    pub args: Vec<(String, TypeSlot)>,
}

/// A struct, class or union.
///
/// Can be a named top-level type or nested anonymously inside another
/// compound, container or global.
#[derive(Debug, Default)]
pub struct Compound {
    /// Name for diagnostics (`parent.member` for nested compounds).
    pub debug_name: String,
    /// Symbol name used to find the vtable address when it differs from
    /// the type name (`original-name`).
    pub symbol: Option<String>,
    pub members: Vec<Member>,
    /// Parent compound if this one inherits.
    pub parent: Option<TypeSlot>,
    /// The compound starts with a vtable pointer slot.
    pub vtable: bool,
    pub vmethods: Vec<Method>,
    pub is_union: bool,
}

impl Compound {
    /// Find a virtual method by name.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.vmethods.iter().find(|m| m.name == name)
    }

    /// Index of a virtual method by name.
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.vmethods.iter().position(|m| m.name == name)
    }

    pub(crate) fn member_debug_name(parent: &str, member: &str) -> String {
        format!("{parent}.{member}")
    }
}
