//! In-memory loader: takes a native (`ArchTag::X86_64`) [`Object`] and maps
//! its three sections into page-protected virtual memory, resolving every
//! relocation in place. Used by `jasmine --run` and by anything embedding
//! this crate to JIT a compiled unit without going through a linker.

use crate::common::Symbol;
use crate::error::LoadError;
use crate::object::{Object, RefType, Section};

/// Protection a loaded section is left in once relocations are resolved:
/// `code` is executable and read-only, `data` is read-only, `static_` stays
/// writable for globals the program mutates at runtime.
fn final_protection(section: Section) -> region::Protection {
    match section {
        Section::Code => region::Protection::READ_EXECUTE,
        Section::Data => region::Protection::READ,
        Section::Static => region::Protection::READ_WRITE,
    }
}

fn alloc_region(len: usize) -> Result<(*mut u8, usize), LoadError> {
    if len == 0 {
        return Ok((std::ptr::null_mut(), 0));
    }
    let mut allocation = region::alloc(len, region::Protection::READ_WRITE)
        .map_err(|e| LoadError::Alloc { size: len, source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
    let addr = allocation.as_mut_ptr::<u8>();
    std::mem::forget(allocation);
    Ok((addr, len))
}

fn protect_region(addr: *mut u8, len: usize, protection: region::Protection) -> Result<(), LoadError> {
    if len == 0 {
        return Ok(());
    }
    unsafe { region::protect(addr, len, protection) }
        .map_err(|e| LoadError::Protect(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

/// Patch one relocation site. `symbol_addr` and `site_addr` are absolute
/// runtime addresses; relative kinds patch `symbol - site + field_offset`,
/// absolute kinds patch `symbol + field_offset` (mirroring
/// `crate::object::elf`'s `resolve_addends`, which bakes the same value in
/// as a `SHT_REL` addend rather than applying it directly).
fn patch_relocation(section_bytes: &mut [u8], offset: usize, kind: RefType, symbol_addr: usize, site_addr: usize, field_offset: i8) {
    let size = kind.size();
    let value: i64 = if kind.is_relative() {
        symbol_addr as i64 - site_addr as i64 + field_offset as i64
    } else {
        symbol_addr as i64 + field_offset as i64
    };
    let le_bytes = value.to_le_bytes();
    let patched: Vec<u8> = if kind.is_little_endian() {
        le_bytes[..size].to_vec()
    } else {
        let mut v = le_bytes[..size].to_vec();
        v.reverse();
        v
    };
    section_bytes[offset..offset + size].copy_from_slice(&patched);
}

fn section_index(section: Section) -> usize {
    match section {
        Section::Code => 0,
        Section::Data => 1,
        Section::Static => 2,
    }
}

/// Map `obj`'s sections into executable/read-only/read-write memory and
/// apply every relocation, storing the resulting regions on `obj.loaded`.
///
/// `obj` must already be natively lowered (`arch = ArchTag::X86_64`); any
/// externs the code references must have been bound first, either via
/// [`Object::define_native`] or by already being defined within `obj`
/// itself, or this fails with [`LoadError::UnresolvedSymbol`].
pub fn load(obj: &mut Object) -> Result<(), LoadError> {
    let mut code_bytes = obj.code.as_slice().to_vec();
    let mut data_bytes = obj.data.as_slice().to_vec();
    let mut static_bytes = obj.static_.as_slice().to_vec();

    let (code_addr, code_len) = alloc_region(code_bytes.len())?;
    let (data_addr, data_len) = alloc_region(data_bytes.len())?;
    let (static_addr, static_len) = alloc_region(static_bytes.len())?;
    let region_addrs = [code_addr, data_addr, static_addr];

    let address_of = |symbol: Symbol| -> Result<usize, LoadError> {
        let &(section, offset) = obj
            .symbol_defs
            .get(&symbol)
            .ok_or_else(|| LoadError::UnresolvedSymbol(symbol.name()))?;
        Ok(region_addrs[section_index(section)] as usize + offset as usize)
    };

    for (&(section, offset), reloc) in &obj.relocations {
        let symbol_addr = address_of(reloc.symbol)?;
        let site_addr = region_addrs[section_index(section)] as usize + offset as usize;
        let bytes = match section {
            Section::Code => &mut code_bytes,
            Section::Data => &mut data_bytes,
            Section::Static => &mut static_bytes,
        };
        patch_relocation(bytes, offset as usize, reloc.kind, symbol_addr, site_addr, reloc.field_offset);
    }

    unsafe {
        if code_len > 0 {
            std::ptr::copy_nonoverlapping(code_bytes.as_ptr(), code_addr, code_len);
        }
        if data_len > 0 {
            std::ptr::copy_nonoverlapping(data_bytes.as_ptr(), data_addr, data_len);
        }
        if static_len > 0 {
            std::ptr::copy_nonoverlapping(static_bytes.as_ptr(), static_addr, static_len);
        }
    }

    protect_region(code_addr, code_len, final_protection(Section::Code))?;
    protect_region(data_addr, data_len, final_protection(Section::Data))?;
    protect_region(static_addr, static_len, final_protection(Section::Static))?;

    obj.loaded = Some([
        crate::object::LoadedRegion { addr: code_addr, len: code_len },
        crate::object::LoadedRegion { addr: data_addr, len: data_len },
        crate::object::LoadedRegion { addr: static_addr, len: static_len },
    ]);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern_global;
    use crate::object::{ArchTag, OsTag};

    #[test]
    fn loads_a_bare_ret_and_calls_it() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Linux);
        // mov eax, 42; ret
        obj.code.write_bytes(&[0xb8, 42, 0, 0, 0, 0xc3]);
        obj.define(intern_global("main"), Section::Code);
        load(&mut obj).unwrap();

        let addr = obj.loaded_address(intern_global("main")).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn unresolved_extern_is_reported() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Linux);
        obj.code.write_bytes(&[0xc3]);
        obj.reference(Section::Code, intern_global("never_defined"), RefType::Rel32Le, -4);
        let err = load(&mut obj).unwrap_err();
        assert!(matches!(err, LoadError::UnresolvedSymbol(name) if name == "never_defined"));
    }
}
