//! The internal object format: a self-contained serialization of an
//! [`Object`] used to pass compiled units between `jasmine` invocations
//! (`--assemble`/`--disassemble`/`--compile`) without going through a
//! system linker.
//!
//! Layout: `#!jasmine\n` shebang, 4 magic bytes, three `u16` version
//! fields, `u16` arch, `u16` os, three `u64` section lengths; then the
//! section bytes themselves; then an interned symbol table (linkage byte +
//! zero-terminated name), a defs table (packed `section<<62 | offset` plus
//! a symbol index), and a relocs table (packed location, reloc-kind byte,
//! signed field-offset byte, symbol index).

use crate::common::{intern_global, intern_local, ByteBuf, Linkage, Map, Symbol};
use crate::error::ObjectError;
use crate::ir::TypeContext;
use crate::object::{ArchTag, Object, OsTag, RefType, Section, SymbolRef};

const SHEBANG: &[u8; 10] = b"#!jasmine\n";
const MAGIC: [u8; 4] = *b"JSM1";

/// The highest object-format major version this build can read. A file
/// requesting a newer major version is rejected; one requesting an older
/// or equal major version is accepted and its version field is preserved
/// verbatim on read, not bumped to this constant.
pub const CRATE_MAJOR_VERSION: u16 = 1;

const SECTION_SHIFT: u32 = 62;
const OFFSET_MASK: u64 = (1u64 << SECTION_SHIFT) - 1;

fn pack_location(section: Section, offset: u64) -> u64 {
    assert!(offset <= OFFSET_MASK, "section offset {offset} exceeds the 62-bit budget");
    ((section.tag()) << SECTION_SHIFT) | offset
}

fn unpack_location(packed: u64) -> Result<(Section, u64), ObjectError> {
    let tag = packed >> SECTION_SHIFT;
    let offset = packed & OFFSET_MASK;
    let section = Section::from_tag(tag).ok_or(ObjectError::BadMagic)?;
    Ok((section, offset))
}

fn arch_code(arch: ArchTag) -> u16 {
    match arch {
        ArchTag::Jasmine => 0,
        ArchTag::X86_64 => 1,
    }
}

fn arch_from_code(code: u16) -> Option<ArchTag> {
    match code {
        0 => Some(ArchTag::Jasmine),
        1 => Some(ArchTag::X86_64),
        _ => None,
    }
}

fn os_code(os: OsTag) -> u16 {
    match os {
        OsTag::None => 0,
        OsTag::Linux => 1,
        OsTag::MacOs => 2,
        OsTag::Windows => 3,
    }
}

fn os_from_code(code: u16) -> Option<OsTag> {
    match code {
        0 => Some(OsTag::None),
        1 => Some(OsTag::Linux),
        2 => Some(OsTag::MacOs),
        3 => Some(OsTag::Windows),
        _ => None,
    }
}

fn linkage_code(linkage: Linkage) -> u8 {
    match linkage {
        Linkage::Global => 0,
        Linkage::Local => 1,
    }
}

fn intern_with_linkage(name: &str, code: u8) -> Symbol {
    if code == 0 {
        intern_global(name)
    } else {
        intern_local(name)
    }
}

/// Serialize `obj` to the internal object format. Deterministic: the
/// symbol, defs, and relocs tables are all written in the sections'
/// `BTreeMap` iteration order, which is the sort order of their keys, so
/// `write(read(write(obj))) == write(obj)`.
pub fn write(obj: &Object) -> Vec<u8> {
    let mut buf = ByteBuf::new();
    buf.write_bytes(SHEBANG);
    buf.write_bytes(&MAGIC);
    buf.write_u16_le(obj.version.0);
    buf.write_u16_le(obj.version.1);
    buf.write_u16_le(obj.version.2);
    buf.write_u16_le(arch_code(obj.arch));
    buf.write_u16_le(os_code(obj.os));
    buf.write_u64_le(obj.code.len() as u64);
    buf.write_u64_le(obj.data.len() as u64);
    buf.write_u64_le(obj.static_.len() as u64);

    buf.write_bytes(obj.code.as_slice());
    buf.write_bytes(obj.data.as_slice());
    buf.write_bytes(obj.static_.as_slice());

    let symbols = obj.all_symbols();
    let mut index: Map<Symbol, u32> = Map::new();
    buf.write_u32_le(symbols.len() as u32);
    for (i, sym) in symbols.iter().enumerate() {
        index.insert(*sym, i as u32);
        buf.write(linkage_code(sym.linkage));
        buf.write_bytes(sym.name().as_bytes());
        buf.write(0);
    }

    buf.write_u32_le(obj.symbol_defs.len() as u32);
    for (&sym, &(section, offset)) in &obj.symbol_defs {
        buf.write_u64_le(pack_location(section, offset));
        buf.write_u32_le(index[&sym]);
    }

    buf.write_u32_le(obj.relocations.len() as u32);
    for (&(section, offset), reloc) in &obj.relocations {
        buf.write_u64_le(pack_location(section, offset));
        buf.write(reloc.kind.code());
        buf.write(reloc.field_offset as u8);
        buf.write_u32_le(index[&reloc.symbol]);
    }

    buf.into_vec()
}

fn read_null_terminated(buf: &mut ByteBuf) -> Result<String, ObjectError> {
    let mut bytes = Vec::new();
    loop {
        match buf.read() {
            Some(0) | None => break,
            Some(b) => bytes.push(b),
        }
    }
    String::from_utf8(bytes).map_err(|_| ObjectError::BadMagic)
}

/// Deserialize the internal object format, rejecting anything whose
/// shebang, magic, or major version doesn't match what this build
/// understands.
pub fn read(bytes: &[u8]) -> Result<Object, ObjectError> {
    let mut buf = ByteBuf::from_vec(bytes.to_vec());

    let shebang = buf.read_n(10).ok_or(ObjectError::BadShebang)?;
    if shebang != SHEBANG.as_slice() {
        return Err(ObjectError::BadShebang);
    }
    let magic = buf.read_n(4).ok_or(ObjectError::BadMagic)?;
    if magic != MAGIC.as_slice() {
        return Err(ObjectError::BadMagic);
    }

    let major = buf.read_u16_le().ok_or(ObjectError::BadMagic)?;
    let minor = buf.read_u16_le().ok_or(ObjectError::BadMagic)?;
    let patch = buf.read_u16_le().ok_or(ObjectError::BadMagic)?;
    if major > CRATE_MAJOR_VERSION {
        return Err(ObjectError::VersionMismatch { required_major: major, actual_major: CRATE_MAJOR_VERSION });
    }

    let arch = arch_from_code(buf.read_u16_le().ok_or(ObjectError::BadMagic)?).ok_or(ObjectError::BadMagic)?;
    let os = os_from_code(buf.read_u16_le().ok_or(ObjectError::BadMagic)?).ok_or(ObjectError::BadMagic)?;

    let code_len = buf.read_u64_le().ok_or(ObjectError::BadMagic)?;
    let data_len = buf.read_u64_le().ok_or(ObjectError::BadMagic)?;
    let static_len = buf.read_u64_le().ok_or(ObjectError::BadMagic)?;

    let read_section = |buf: &mut ByteBuf, announced: u64| -> Result<ByteBuf, ObjectError> {
        let actual = buf.len() as u64;
        let bytes = buf
            .read_n(announced as usize)
            .ok_or(ObjectError::LengthMismatch { announced, actual })?
            .to_vec();
        Ok(ByteBuf::from_vec(bytes))
    };
    let code = read_section(&mut buf, code_len)?;
    let data = read_section(&mut buf, data_len)?;
    let static_ = read_section(&mut buf, static_len)?;

    let symbol_count = buf.read_u32_le().ok_or(ObjectError::BadMagic)?;
    let mut symbols = Vec::with_capacity(symbol_count as usize);
    for _ in 0..symbol_count {
        let linkage_byte = buf.read().ok_or(ObjectError::BadMagic)?;
        let name = read_null_terminated(&mut buf)?;
        symbols.push(intern_with_linkage(&name, linkage_byte));
    }

    let defs_count = buf.read_u32_le().ok_or(ObjectError::BadMagic)?;
    let mut symbol_defs = Map::new();
    let mut symbol_positions = Map::new();
    for _ in 0..defs_count {
        let packed = buf.read_u64_le().ok_or(ObjectError::BadMagic)?;
        let (section, offset) = unpack_location(packed)?;
        let idx = buf.read_u32_le().ok_or(ObjectError::BadMagic)?;
        let sym = *symbols.get(idx as usize).ok_or(ObjectError::BadMagic)?;
        symbol_defs.insert(sym, (section, offset));
        symbol_positions.insert((section, offset), sym);
    }

    let relocs_count = buf.read_u32_le().ok_or(ObjectError::BadMagic)?;
    let mut relocations = Map::new();
    for _ in 0..relocs_count {
        let packed = buf.read_u64_le().ok_or(ObjectError::BadMagic)?;
        let (section, offset) = unpack_location(packed)?;
        let kind_byte = buf.read().ok_or(ObjectError::BadMagic)?;
        let kind = RefType::from_code(kind_byte).ok_or(ObjectError::BadMagic)?;
        let field_offset = buf.read().ok_or(ObjectError::BadMagic)? as i8;
        let idx = buf.read_u32_le().ok_or(ObjectError::BadMagic)?;
        let symbol = *symbols.get(idx as usize).ok_or(ObjectError::BadMagic)?;
        relocations.insert((section, offset), SymbolRef { symbol, kind, field_offset });
    }

    Ok(Object {
        arch,
        os,
        version: (major, minor, patch),
        code,
        data,
        static_,
        types: TypeContext::new(),
        symbol_defs,
        symbol_positions,
        relocations,
        loaded: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern_global;
    use crate::object::RefType;

    fn sample() -> Object {
        let mut obj = Object::new(ArchTag::Jasmine, OsTag::None);
        obj.code.write_bytes(&[0x90, 0x90, 0x90]);
        let sym = intern_global("foo");
        obj.define(sym, Section::Code);
        let callee = intern_global("bar");
        obj.reference(Section::Code, callee, RefType::Rel32Le, -4);
        obj.code.write_bytes(&[0, 0, 0, 0]);
        obj
    }

    #[test]
    fn round_trips_sections_and_tables() {
        let obj = sample();
        let bytes = write(&obj);
        let back = read(&bytes).unwrap();
        assert_eq!(back.code.as_slice(), obj.code.as_slice());
        assert_eq!(back.symbol_defs.len(), obj.symbol_defs.len());
        assert_eq!(back.relocations.len(), obj.relocations.len());
    }

    #[test]
    fn write_is_a_fixed_point() {
        let obj = sample();
        let once = write(&obj);
        let twice = write(&read(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn bad_shebang_is_rejected() {
        let err = read(b"not-a-jasmine-object-at-all-------").unwrap_err();
        assert!(matches!(err, ObjectError::BadShebang));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let obj = sample();
        let mut bytes = write(&obj);
        // Major version sits right after the 10-byte shebang + 4-byte magic.
        bytes[14] = 0xff;
        bytes[15] = 0xff;
        let err = read(&bytes).unwrap_err();
        assert!(matches!(err, ObjectError::VersionMismatch { .. }));
    }
}
