//! Type descriptors: primitive `Kind`s plus user-defined struct layouts.

use crate::common::{Kind, Map};
use std::fmt;

/// A type: a `Kind` plus, for structs, an index into the owning
/// [`TypeContext`]'s struct table. `id` is meaningless (and conventionally
/// zero) for non-struct kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type {
    pub kind: Kind,
    pub id: u32,
}

impl Type {
    pub fn primitive(kind: Kind) -> Type {
        debug_assert!(kind != Kind::Struct, "struct types need a TypeContext id");
        Type { kind, id: 0 }
    }

    pub fn struct_(id: u32) -> Type {
        Type {
            kind: Kind::Struct,
            id,
        }
    }

    pub const I8: Type = Type { kind: Kind::I8, id: 0 };
    pub const I16: Type = Type { kind: Kind::I16, id: 0 };
    pub const I32: Type = Type { kind: Kind::I32, id: 0 };
    pub const I64: Type = Type { kind: Kind::I64, id: 0 };
    pub const U8: Type = Type { kind: Kind::U8, id: 0 };
    pub const U16: Type = Type { kind: Kind::U16, id: 0 };
    pub const U32: Type = Type { kind: Kind::U32, id: 0 };
    pub const U64: Type = Type { kind: Kind::U64, id: 0 };
    pub const F32: Type = Type { kind: Kind::F32, id: 0 };
    pub const F64: Type = Type { kind: Kind::F64, id: 0 };
    pub const PTR: Type = Type { kind: Kind::Ptr, id: 0 };
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

/// One member of a struct type. A member with no `element_type` is a raw
/// byte blob of `count` bytes (e.g. padding, or an opaque buffer); a member
/// with an `element_type` is `count` repetitions of that type (1 for a
/// scalar field, >1 for an inline array).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub count: u64,
    pub element_type: Option<Type>,
}

impl Member {
    /// Size in bytes of this member on `target`, given a way to size
    /// nested struct types.
    pub fn size_of(&self, ctx: &TypeContext, pointer_size: u64) -> u64 {
        match self.element_type {
            None => self.count,
            Some(ty) => self.count * ctx.size_of(ty, pointer_size),
        }
    }
}

/// A named struct type: an ordered list of members. Offsets are computed
/// on demand from a target-specific pointer size, since two distinct
/// targets may lay the same declaration out differently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: u32,
    pub name: String,
    pub members: Vec<Member>,
}

impl TypeInfo {
    /// Byte offset of the member named `field`, and its size, on a target
    /// with the given pointer size. Members are laid out in declaration
    /// order, back-to-back (no padding/alignment — the source language has
    /// no alignment requirements stricter than natural field order).
    pub fn offset_of(&self, field: &str, ctx: &TypeContext, pointer_size: u64) -> Option<(u64, u64)> {
        let mut offset = 0u64;
        for m in &self.members {
            let size = m.size_of(ctx, pointer_size);
            if m.name == field {
                return Some((offset, size));
            }
            offset += size;
        }
        None
    }

    /// Index of a member by name, used when a memory operand names a field
    /// directly (`[%0 + Pair.left]`) rather than a byte offset.
    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == field)
    }

    pub fn size_of(&self, ctx: &TypeContext, pointer_size: u64) -> u64 {
        self.members.iter().map(|m| m.size_of(ctx, pointer_size)).sum()
    }
}

/// Owns the struct-type table for one compilation unit (one [`crate::object::Object`]).
/// Struct `Type::id`s index into this table.
#[derive(Clone, Debug, Default)]
pub struct TypeContext {
    types: Vec<TypeInfo>,
    by_name: Map<String, u32>,
}

impl TypeContext {
    pub fn new() -> TypeContext {
        TypeContext::default()
    }

    /// Declare a new struct type, returning its `Type`. Errors (as a panic,
    /// per the "internal invariant" class) if the name is already declared
    /// — duplicate-type detection belongs to the parser, which should
    /// reject this before it reaches here with a proper diagnostic.
    pub fn declare(&mut self, name: impl Into<String>, members: Vec<Member>) -> Type {
        let name = name.into();
        assert!(
            !self.by_name.contains_key(&name),
            "internal error: duplicate type declaration for `{name}` reached TypeContext"
        );
        let id = self.types.len() as u32;
        self.by_name.insert(name.clone(), id);
        self.types.push(TypeInfo { id, name, members });
        Type::struct_(id)
    }

    pub fn lookup(&self, name: &str) -> Option<Type> {
        self.by_name.get(name).map(|&id| Type::struct_(id))
    }

    pub fn info(&self, ty: Type) -> &TypeInfo {
        assert_eq!(ty.kind, Kind::Struct, "not a struct type: {ty}");
        &self.types[ty.id as usize]
    }

    pub fn all(&self) -> &[TypeInfo] {
        &self.types
    }

    pub fn size_of(&self, ty: Type, pointer_size: u64) -> u64 {
        match ty.kind {
            Kind::Struct => self.info(ty).size_of(self, pointer_size),
            Kind::Ptr => pointer_size,
            other => other.size().expect("scalar kind has a fixed size"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TypeContext, Type) {
        let mut ctx = TypeContext::new();
        let ty = ctx.declare(
            "Pair",
            vec![
                Member { name: "left".into(), count: 1, element_type: Some(Type::I64) },
                Member { name: "right".into(), count: 1, element_type: Some(Type::I64) },
            ],
        );
        (ctx, ty)
    }

    #[test]
    fn member_offsets_are_sequential() {
        let (ctx, ty) = pair();
        let info = ctx.info(ty);
        assert_eq!(info.offset_of("left", &ctx, 8), Some((0, 8)));
        assert_eq!(info.offset_of("right", &ctx, 8), Some((8, 8)));
        assert_eq!(info.size_of(&ctx, 8), 16);
    }

    #[test]
    #[should_panic(expected = "duplicate type declaration")]
    fn duplicate_declaration_panics() {
        let mut ctx = TypeContext::new();
        ctx.declare("Foo", vec![]);
        ctx.declare("Foo", vec![]);
    }
}
