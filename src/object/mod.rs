//! The relocatable object container: three byte sections, a symbol
//! definition table, a relocation table, and a type context, with
//! serialization to an internal format plus ELF64/COFF emission.

mod coff;
mod elf;
mod internal;

pub use internal::CRATE_MAJOR_VERSION;

use crate::common::{ByteBuf, Kind, Linkage, Map, Symbol};
use crate::error::ObjectError;
use crate::ir::{Insn, TypeContext};
use crate::target::Target;
use std::fmt;

/// One of the three byte streams an object carries, each with its own
/// load-time page protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Code,
    Data,
    Static,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::Code, Section::Data, Section::Static];

    fn tag(self) -> u64 {
        match self {
            Section::Code => 0,
            Section::Data => 1,
            Section::Static => 2,
        }
    }

    fn from_tag(tag: u64) -> Option<Section> {
        match tag {
            0 => Some(Section::Code),
            1 => Some(Section::Data),
            2 => Some(Section::Static),
            _ => None,
        }
    }
}

/// A deferred patch: when a relocation is resolved, the bytes at
/// `field_offset` from the relocation site are overwritten with either the
/// symbol's absolute address or its address relative to the site, in the
/// given width and endianness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefType {
    Rel8,
    Rel16Le,
    Rel16Be,
    Rel32Le,
    Rel32Be,
    Rel64Le,
    Rel64Be,
    Abs8,
    Abs16Le,
    Abs16Be,
    Abs32Le,
    Abs32Be,
    Abs64Le,
    Abs64Be,
}

impl RefType {
    pub fn size(self) -> usize {
        use RefType::*;
        match self {
            Rel8 | Abs8 => 1,
            Rel16Le | Rel16Be | Abs16Le | Abs16Be => 2,
            Rel32Le | Rel32Be | Abs32Le | Abs32Be => 4,
            Rel64Le | Rel64Be | Abs64Le | Abs64Be => 8,
        }
    }

    pub fn is_relative(self) -> bool {
        use RefType::*;
        matches!(self, Rel8 | Rel16Le | Rel16Be | Rel32Le | Rel32Be | Rel64Le | Rel64Be)
    }

    pub fn is_little_endian(self) -> bool {
        use RefType::*;
        !matches!(self, Rel16Be | Rel32Be | Rel64Be | Abs16Be | Abs32Be | Abs64Be)
    }

    fn code(self) -> u8 {
        use RefType::*;
        match self {
            Rel8 => 0, Rel16Le => 1, Rel16Be => 2, Rel32Le => 3, Rel32Be => 4,
            Rel64Le => 5, Rel64Be => 6, Abs8 => 7, Abs16Le => 8, Abs16Be => 9,
            Abs32Le => 10, Abs32Be => 11, Abs64Le => 12, Abs64Be => 13,
        }
    }

    fn from_code(code: u8) -> Option<RefType> {
        use RefType::*;
        Some(match code {
            0 => Rel8, 1 => Rel16Le, 2 => Rel16Be, 3 => Rel32Le, 4 => Rel32Be,
            5 => Rel64Le, 6 => Rel64Be, 7 => Abs8, 8 => Abs16Le, 9 => Abs16Be,
            10 => Abs32Le, 11 => Abs32Be, 12 => Abs64Le, 13 => Abs64Be,
            _ => return None,
        })
    }
}

/// One relocation: a reference to `symbol`, to be patched in as described
/// by `kind`, at `field_offset` bytes from the relocation site (almost
/// always 0; -4 for the binary IR's label encoding, see [`crate::ir::binary`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolRef {
    pub symbol: Symbol,
    pub kind: RefType,
    pub field_offset: i8,
}

/// Which architecture this object's `code` section holds: the
/// architecture-neutral Jasmine bytecode, or lowered native machine code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchTag {
    Jasmine,
    X86_64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsTag {
    None,
    Linux,
    MacOs,
    Windows,
}

/// A page-protected virtual memory region backing one section, owned by an
/// `Object` once [`Object::load`] has succeeded. Released on drop.
pub(crate) struct LoadedRegion {
    pub addr: *mut u8,
    pub len: usize,
}

unsafe impl Send for LoadedRegion {}
unsafe impl Sync for LoadedRegion {}

impl Drop for LoadedRegion {
    fn drop(&mut self) {
        if !self.addr.is_null() && self.len > 0 {
            let _ = unsafe { region::protect(self.addr, self.len, region::Protection::READ_WRITE) };
            let _ = unsafe { region::free(self.addr, self.len) };
        }
    }
}

/// The relocatable unit this whole crate exists to produce: three byte
/// sections, a symbol table, a relocation table, and (for the Jasmine
/// architecture) a struct-type context.
pub struct Object {
    pub arch: ArchTag,
    pub os: OsTag,
    pub version: (u16, u16, u16),
    pub code: ByteBuf,
    pub data: ByteBuf,
    pub static_: ByteBuf,
    pub types: TypeContext,
    pub symbol_defs: Map<Symbol, (Section, u64)>,
    pub symbol_positions: Map<(Section, u64), Symbol>,
    pub relocations: Map<(Section, u64), SymbolRef>,
    pub(crate) loaded: Option<[LoadedRegion; 3]>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("arch", &self.arch)
            .field("os", &self.os)
            .field("code_len", &self.code.len())
            .field("data_len", &self.data.len())
            .field("static_len", &self.static_.len())
            .field("symbols", &self.symbol_defs.len())
            .field("relocations", &self.relocations.len())
            .finish()
    }
}

impl Object {
    pub fn new(arch: ArchTag, os: OsTag) -> Object {
        Object {
            arch,
            os,
            version: (CRATE_MAJOR_VERSION, 0, 0),
            code: ByteBuf::new(),
            data: ByteBuf::new(),
            static_: ByteBuf::new(),
            types: TypeContext::new(),
            symbol_defs: Map::new(),
            symbol_positions: Map::new(),
            relocations: Map::new(),
            loaded: None,
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut ByteBuf {
        match section {
            Section::Code => &mut self.code,
            Section::Data => &mut self.data,
            Section::Static => &mut self.static_,
        }
    }

    pub fn section(&self, section: Section) -> &ByteBuf {
        match section {
            Section::Code => &self.code,
            Section::Data => &self.data,
            Section::Static => &self.static_,
        }
    }

    /// Record `symbol` as defined at the given section's current write
    /// cursor.
    pub fn define(&mut self, symbol: Symbol, section: Section) {
        let offset = self.section(section).write_pos() as u64;
        self.symbol_defs.insert(symbol, (section, offset));
        self.symbol_positions.insert((section, offset), symbol);
    }

    /// Bind `symbol` to a host address outside this object by writing a
    /// trampoline (`mov rax, imm64; call rax; ret`) into `code` and
    /// defining the symbol at its start. Used to satisfy references to
    /// natively-implemented runtime helpers before `load`.
    pub fn define_native(&mut self, symbol: Symbol, host_address: u64, target: &dyn Target) {
        let offset = self.code.write_pos() as u64;
        self.code.write_bytes(&target.trampoline(host_address));
        self.symbol_defs.insert(symbol, (Section::Code, offset));
        self.symbol_positions.insert((Section::Code, offset), symbol);
    }

    /// Record a relocation at `section`'s current write cursor, referring
    /// to `symbol`, to be patched per `kind` with an offset of
    /// `field_offset` bytes from the site.
    pub fn reference(&mut self, section: Section, symbol: Symbol, kind: RefType, field_offset: i8) {
        let offset = self.section(section).write_pos() as u64;
        self.relocations.insert((section, offset), SymbolRef { symbol, kind, field_offset });
    }

    /// Reserve `len` zero bytes in `section`, returning the offset they
    /// start at. Used by `global`/`lit`/`stat` to lay out space before a
    /// value or a relocation to it is known.
    pub fn reserve(&mut self, section: Section, len: usize) -> u64 {
        let offset = self.section(section).write_pos() as u64;
        self.section_mut(section).write_bytes(&vec![0u8; len]);
        offset
    }

    pub fn write_at(&mut self, section: Section, offset: u64, bytes: &[u8]) {
        self.section_mut(section).patch(offset as usize, bytes);
    }

    /// Recompile this object's Jasmine-IR `code` section for `target`,
    /// returning a fresh object holding native machine code.
    pub fn retarget(&self, target: &dyn Target) -> Result<Object, ObjectError> {
        assert_eq!(self.arch, ArchTag::Jasmine, "retarget expects a Jasmine-arch object");
        let (insns, types) = crate::ir::binary::disassemble(self.code.clone())?;
        let mut out = Object::new(ArchTag::X86_64, os_tag_of(target));
        out.types = types;
        out.data = self.data.clone();
        out.static_ = self.static_.clone();
        crate::select::lower_program(&insns, &out.types.clone(), target, &mut out)?;
        Ok(out)
    }

    /// Load this object's sections into executable/read-only/read-write
    /// virtual memory, fixing up relocations (including to addresses bound
    /// via [`Object::define_native`]). See [`crate::loader`].
    pub fn load(&mut self) -> Result<(), crate::error::LoadError> {
        crate::loader::load(self)
    }

    /// The runtime address of `symbol`, valid only after a successful
    /// [`Object::load`].
    pub fn loaded_address(&self, symbol: Symbol) -> Option<usize> {
        let (section, offset) = *self.symbol_defs.get(&symbol)?;
        let regions = self.loaded.as_ref()?;
        let idx = match section {
            Section::Code => 0,
            Section::Data => 1,
            Section::Static => 2,
        };
        Some(regions[idx].addr as usize + offset as usize)
    }

    pub fn write_internal(&self) -> Vec<u8> {
        internal::write(self)
    }

    pub fn read_internal(bytes: &[u8]) -> Result<Object, ObjectError> {
        internal::read(bytes)
    }

    pub fn write_elf(&self, target: &dyn Target) -> Vec<u8> {
        elf::write(self, target)
    }

    pub fn write_coff(&self, target: &dyn Target) -> Vec<u8> {
        coff::write(self, target)
    }

    /// Every symbol this object mentions, either by defining it or
    /// referencing it in a relocation — used to build the interned symbol
    /// table for both internal and ELF/COFF serialization.
    pub(crate) fn all_symbols(&self) -> Vec<Symbol> {
        let mut set: std::collections::BTreeSet<Symbol> = self.symbol_defs.keys().copied().collect();
        set.extend(self.relocations.values().map(|r| r.symbol));
        set.into_iter().collect()
    }
}

fn os_tag_of(target: &dyn Target) -> OsTag {
    match target.os() {
        crate::target::Os::Linux => OsTag::Linux,
        crate::target::Os::MacOs => OsTag::MacOs,
        crate::target::Os::Windows => OsTag::Windows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern_global;

    #[test]
    fn define_and_reference_round_trip_positions() {
        let mut obj = Object::new(ArchTag::Jasmine, OsTag::None);
        obj.code.write_bytes(&[0, 0, 0, 0]);
        let sym = intern_global("foo");
        obj.define(sym, Section::Code);
        assert_eq!(obj.symbol_defs[&sym], (Section::Code, 4));
    }

    #[test]
    fn reserve_zero_fills_and_returns_offset() {
        let mut obj = Object::new(ArchTag::Jasmine, OsTag::None);
        let at = obj.reserve(Section::Data, 8);
        assert_eq!(at, 0);
        assert_eq!(obj.data.len(), 8);
    }
}
