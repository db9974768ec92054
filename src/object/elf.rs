//! ELF64 relocatable object emission (`--relocate` on Linux/most hosts).
//!
//! Always produces `ET_REL`, host-endian. Sections: `.shstrtab`, `.strtab`,
//! `.symtab`, `.text`/`.rel.text`, and `.rodata`/`.rel.rodata` and
//! `.data`/`.rel.data` when the object carries data/static bytes.
//! Relocations are `SHT_REL` (addend inline in the referencing bytes, not
//! a separate field), so the addend is baked into a scratch copy of the
//! section bytes before they're written out.

use crate::common::{Endian, Linkage, Map, Symbol};
use crate::object::{Object, RefType, Section, SymbolRef};
use crate::target::Target;

const EI_NIDENT: usize = 16;
const ET_REL: u16 = 1;
const EM_386: u16 = 0x03;
const EM_X86_64: u16 = 0x3e;
const EM_AARCH64: u16 = 0xb7;
const EV_CURRENT: u32 = 1;

const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;

const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_WRITE: u64 = 0x1;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_32: u32 = 10;
const R_X86_64_16: u32 = 12;
const R_X86_64_PC16: u32 = 13;
const R_X86_64_8: u32 = 14;
const R_X86_64_PC8: u32 = 15;

/// A growing byte vector plus a running string table, used identically
/// for `.shstrtab` and `.strtab`.
struct StrTab {
    bytes: Vec<u8>,
    offsets: Map<String, u32>,
}

impl StrTab {
    fn new() -> StrTab {
        StrTab { bytes: vec![0], offsets: Map::new() }
    }

    fn get(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.offsets.get(name) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), off);
        off
    }
}

#[derive(Default)]
struct SectionHeader {
    name: u32,
    ty: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

fn write_u16(out: &mut Vec<u8>, v: u16, le: bool) {
    out.extend_from_slice(&if le { v.to_le_bytes() } else { v.to_be_bytes() });
}
fn write_u32(out: &mut Vec<u8>, v: u32, le: bool) {
    out.extend_from_slice(&if le { v.to_le_bytes() } else { v.to_be_bytes() });
}
fn write_u64(out: &mut Vec<u8>, v: u64, le: bool) {
    out.extend_from_slice(&if le { v.to_le_bytes() } else { v.to_be_bytes() });
}

fn write_shdr(out: &mut Vec<u8>, s: &SectionHeader, le: bool) {
    write_u32(out, s.name, le);
    write_u32(out, s.ty, le);
    write_u64(out, s.flags, le);
    write_u64(out, 0, le); // sh_addr: unlinked relocatable object, no load address yet
    write_u64(out, s.offset, le);
    write_u64(out, s.size, le);
    write_u32(out, s.link, le);
    write_u32(out, s.info, le);
    write_u64(out, s.addralign, le);
    write_u64(out, s.entsize, le);
}

fn machine_for(target: &dyn Target) -> u16 {
    match target.arch() {
        crate::target::Arch::X86_64 => EM_X86_64,
    }
}

fn reloc_type(kind: RefType, linkage: Linkage) -> u32 {
    use RefType::*;
    match kind {
        Rel8 => R_X86_64_PC8,
        Rel16Le | Rel16Be => R_X86_64_PC16,
        Rel32Le | Rel32Be => {
            if linkage == Linkage::Local {
                R_X86_64_PLT32
            } else {
                R_X86_64_PC32
            }
        }
        Rel64Le | Rel64Be => R_X86_64_64, // x86-64 has no PC-relative 64-bit form
        Abs8 => R_X86_64_8,
        Abs16Le | Abs16Be => R_X86_64_16,
        Abs32Le | Abs32Be => R_X86_64_32,
        Abs64Le | Abs64Be => R_X86_64_64,
    }
}

/// Patch `field_offset` into the referencing bytes as the REL-style
/// inline addend, so a consumer computing `S + A - P` from the file's own
/// `.rel.*` entries (addend `A` read out of the patched bytes) gets the
/// same result our in-memory loader computes directly.
fn resolve_addends(bytes: &mut [u8], section: Section, relocations: &Map<(Section, u64), SymbolRef>) {
    for (&(sec, offset), reloc) in relocations {
        if sec != section {
            continue;
        }
        let size = reloc.kind.size();
        let at = offset as usize;
        if at + size > bytes.len() {
            continue;
        }
        let addend = reloc.field_offset as i64;
        let le_bytes = addend.to_le_bytes();
        let patched: Vec<u8> = if reloc.kind.is_little_endian() {
            le_bytes[..size].to_vec()
        } else {
            let mut v = le_bytes[..size].to_vec();
            v.reverse();
            v
        };
        bytes[at..at + size].copy_from_slice(&patched);
    }
}

fn section_has_relocs(section: Section, relocations: &Map<(Section, u64), SymbolRef>) -> bool {
    relocations.keys().any(|&(sec, _)| sec == section)
}

pub fn write(obj: &Object, target: &dyn Target) -> Vec<u8> {
    let le = Endian::host() == Endian::Little;

    let mut code_bytes = obj.code.as_slice().to_vec();
    resolve_addends(&mut code_bytes, Section::Code, &obj.relocations);
    let mut data_bytes = obj.data.as_slice().to_vec();
    resolve_addends(&mut data_bytes, Section::Data, &obj.relocations);
    let mut static_bytes = obj.static_.as_slice().to_vec();
    resolve_addends(&mut static_bytes, Section::Static, &obj.relocations);

    let has_data = !data_bytes.is_empty();
    let has_static = !static_bytes.is_empty();
    let text_has_rel = section_has_relocs(Section::Code, &obj.relocations);
    let data_has_rel = has_data && section_has_relocs(Section::Data, &obj.relocations);
    let static_has_rel = has_static && section_has_relocs(Section::Static, &obj.relocations);

    // Fixed section layout, decided purely from presence booleans so every
    // index below (symtab `st_shndx`, rel-section `sh_info`) is known
    // before a single byte of content is written.
    let mut index = 1u32; // 0 is the null section
    let text_shndx = index;
    index += 1;
    let rel_text_shndx = if text_has_rel { let i = index; index += 1; Some(i) } else { None };
    let rodata_shndx = if has_data { let i = index; index += 1; Some(i) } else { None };
    let rel_rodata_shndx = if data_has_rel { let i = index; index += 1; Some(i) } else { None };
    let data_shndx = if has_static { let i = index; index += 1; Some(i) } else { None };
    let rel_data_shndx = if static_has_rel { let i = index; index += 1; Some(i) } else { None };
    let symtab_shndx = index;
    index += 1;
    let strtab_shndx = index;
    index += 1;
    let shstrtab_shndx = index;

    let shndx_of = |section: Section| -> u16 {
        (match section {
            Section::Code => text_shndx,
            Section::Data => rodata_shndx.unwrap_or(0),
            Section::Static => data_shndx.unwrap_or(0),
        }) as u16
    };

    let all_symbols = obj.all_symbols();
    let (mut locals, mut globals): (Vec<Symbol>, Vec<Symbol>) =
        all_symbols.into_iter().partition(|s| s.linkage == Linkage::Local);
    locals.sort_by_key(|s| s.id());
    globals.sort_by_key(|s| s.id());
    let locals_count = locals.len();
    let ordered_symbols: Vec<Symbol> = locals.into_iter().chain(globals).collect();

    let mut strtab = StrTab::new();
    let mut shstrtab = StrTab::new();
    let mut symtab = Vec::new();
    let mut sym_index: Map<Symbol, u32> = Map::new();

    push_sym(&mut symtab, 0, 0, 0, 0, 0, le);
    for (i, sym) in ordered_symbols.iter().enumerate() {
        sym_index.insert(*sym, (i + 1) as u32);
        let name_off = strtab.get(&sym.name());
        let bind = if sym.linkage == Linkage::Local { STB_LOCAL } else { STB_GLOBAL };
        if let Some(&(section, offset)) = obj.symbol_defs.get(sym) {
            let ty = if section == Section::Code { STT_FUNC } else { STT_OBJECT };
            push_sym(&mut symtab, name_off, (bind << 4) | ty, shndx_of(section), offset, 0, le);
        } else {
            push_sym(&mut symtab, name_off, (bind << 4) | STT_NOTYPE, 0, 0, 0, le);
        }
    }

    let mut text_rel = Vec::new();
    build_rel_entries(&mut text_rel, Section::Code, &obj.relocations, &sym_index, le);
    let mut data_rel = Vec::new();
    build_rel_entries(&mut data_rel, Section::Data, &obj.relocations, &sym_index, le);
    let mut static_rel = Vec::new();
    build_rel_entries(&mut static_rel, Section::Static, &obj.relocations, &sym_index, le);

    let name_text = shstrtab.get(".text");
    let name_rel_text = if text_has_rel { shstrtab.get(".rel.text") } else { 0 };
    let name_rodata = if has_data { shstrtab.get(".rodata") } else { 0 };
    let name_rel_rodata = if data_has_rel { shstrtab.get(".rel.rodata") } else { 0 };
    let name_data = if has_static { shstrtab.get(".data") } else { 0 };
    let name_rel_data = if static_has_rel { shstrtab.get(".rel.data") } else { 0 };
    let name_symtab = shstrtab.get(".symtab");
    let name_strtab = shstrtab.get(".strtab");
    let name_shstrtab = shstrtab.get(".shstrtab");

    let ehdr_size = 64u64;
    let mut headers: Vec<SectionHeader> = vec![SectionHeader::default()];
    let mut body = Vec::new();

    let push_section = |body: &mut Vec<u8>, headers: &mut Vec<SectionHeader>, bytes: &[u8], hdr: SectionHeader| {
        let mut hdr = hdr;
        hdr.offset = ehdr_size + body.len() as u64;
        hdr.size = bytes.len() as u64;
        body.extend_from_slice(bytes);
        headers.push(hdr);
    };

    push_section(&mut body, &mut headers, &code_bytes, SectionHeader {
        name: name_text, ty: SHT_PROGBITS, flags: SHF_ALLOC | SHF_EXECINSTR, addralign: 16, ..Default::default()
    });
    if text_has_rel {
        push_section(&mut body, &mut headers, &text_rel, SectionHeader {
            name: name_rel_text, ty: SHT_REL, link: symtab_shndx, info: text_shndx, addralign: 8, entsize: 16, ..Default::default()
        });
    }
    if has_data {
        push_section(&mut body, &mut headers, &data_bytes, SectionHeader {
            name: name_rodata, ty: SHT_PROGBITS, flags: SHF_ALLOC, addralign: 8, ..Default::default()
        });
        if data_has_rel {
            push_section(&mut body, &mut headers, &data_rel, SectionHeader {
                name: name_rel_rodata, ty: SHT_REL, link: symtab_shndx, info: rodata_shndx.unwrap(), addralign: 8, entsize: 16, ..Default::default()
            });
        }
    }
    if has_static {
        push_section(&mut body, &mut headers, &static_bytes, SectionHeader {
            name: name_data, ty: SHT_PROGBITS, flags: SHF_ALLOC | SHF_WRITE, addralign: 8, ..Default::default()
        });
        if static_has_rel {
            push_section(&mut body, &mut headers, &static_rel, SectionHeader {
                name: name_rel_data, ty: SHT_REL, link: symtab_shndx, info: data_shndx.unwrap(), addralign: 8, entsize: 16, ..Default::default()
            });
        }
    }
    push_section(&mut body, &mut headers, &symtab, SectionHeader {
        name: name_symtab, ty: SHT_SYMTAB, link: strtab_shndx, info: (locals_count + 1) as u32, addralign: 8, entsize: 24, ..Default::default()
    });
    push_section(&mut body, &mut headers, &strtab.bytes, SectionHeader {
        name: name_strtab, ty: SHT_STRTAB, addralign: 1, ..Default::default()
    });
    push_section(&mut body, &mut headers, &shstrtab.bytes, SectionHeader {
        name: name_shstrtab, ty: SHT_STRTAB, addralign: 1, ..Default::default()
    });

    debug_assert_eq!(headers.len() as u32 - 1, shstrtab_shndx);
    debug_assert_eq!(rel_text_shndx.map(|i| i as usize), if text_has_rel { Some(text_shndx as usize + 1) } else { None });
    let _ = (rel_rodata_shndx, rel_data_shndx);

    let shoff = ehdr_size + body.len() as u64;

    let mut out = Vec::new();
    let mut ident = [0u8; EI_NIDENT];
    ident[0] = 0x7f;
    ident[1] = b'E';
    ident[2] = b'L';
    ident[3] = b'F';
    ident[4] = 2; // ELFCLASS64
    ident[5] = if le { 1 } else { 2 };
    ident[6] = EV_CURRENT as u8;
    out.extend_from_slice(&ident);
    write_u16(&mut out, ET_REL, le);
    write_u16(&mut out, machine_for(target), le);
    write_u32(&mut out, EV_CURRENT, le);
    write_u64(&mut out, 0, le); // e_entry
    write_u64(&mut out, 0, le); // e_phoff
    write_u64(&mut out, shoff, le);
    write_u32(&mut out, 0, le); // e_flags
    write_u16(&mut out, ehdr_size as u16, le);
    write_u16(&mut out, 0, le); // e_phentsize
    write_u16(&mut out, 0, le); // e_phnum
    write_u16(&mut out, 64, le); // e_shentsize
    write_u16(&mut out, headers.len() as u16, le);
    write_u16(&mut out, shstrtab_shndx as u16, le);

    out.extend_from_slice(&body);
    for h in &headers {
        write_shdr(&mut out, h, le);
    }
    out
}

fn push_sym(symtab: &mut Vec<u8>, name: u32, info: u8, shndx: u16, value: u64, size: u64, le: bool) {
    write_u32(symtab, name, le);
    symtab.push(info);
    symtab.push(0); // st_other
    write_u16(symtab, shndx, le);
    write_u64(symtab, value, le);
    write_u64(symtab, size, le);
}

fn build_rel_entries(
    out: &mut Vec<u8>,
    section: Section,
    relocations: &Map<(Section, u64), SymbolRef>,
    sym_index: &Map<Symbol, u32>,
    le: bool,
) {
    for (&(sec, offset), reloc) in relocations {
        if sec != section {
            continue;
        }
        let idx = sym_index[&reloc.symbol];
        let ty = reloc_type(reloc.kind, reloc.symbol.linkage);
        let r_info = ((idx as u64) << 32) | ty as u64;
        write_u64(out, offset, le);
        write_u64(out, r_info, le);
    }
}

/// Machine codes for architectures this crate doesn't itself lower to,
/// kept so `machine_for` reads as a closed mapping rather than a single
/// hard-coded constant.
#[allow(dead_code)]
const OTHER_MACHINES: [u16; 2] = [EM_386, EM_AARCH64];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern_global;
    use crate::object::{ArchTag, OsTag};
    use crate::target::{Os, SystemV};

    #[test]
    fn header_has_elf_magic_and_rel_type() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Linux);
        obj.code.write_bytes(&[0xc3]); // ret
        let target = SystemV { os: Os::Linux };
        let bytes = write(&obj, &target);
        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(bytes[4], 2); // ELFCLASS64
        let e_type = u16::from_le_bytes([bytes[16], bytes[17]]);
        assert_eq!(e_type, ET_REL);
        let e_machine = u16::from_le_bytes([bytes[18], bytes[19]]);
        assert_eq!(e_machine, EM_X86_64);
    }

    #[test]
    fn defined_global_symbol_produces_nonempty_object() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Linux);
        obj.code.write_bytes(&[0xc3]);
        obj.define(intern_global("main"), Section::Code);
        let target = SystemV { os: Os::Linux };
        let bytes = write(&obj, &target);
        assert!(bytes.len() > 64);
    }

    #[test]
    fn relocation_sections_omitted_when_no_relocs_present() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Linux);
        obj.code.write_bytes(&[0xc3]);
        let target = SystemV { os: Os::Linux };
        let bytes = write(&obj, &target);
        let e_shnum = u16::from_le_bytes([bytes[60], bytes[61]]);
        // null, .text, .symtab, .strtab, .shstrtab -- no .rel.text.
        assert_eq!(e_shnum, 5);
    }
}
