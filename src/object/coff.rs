//! COFF (Microsoft PE object) emission (`--relocate` on Windows).
//!
//! One section, `.text`, holding the code bytes; data/static bytes (if
//! any) are appended as a second `.data` section. Symbol names longer
//! than 8 bytes go through the string table (a 4-byte total-size prefix
//! followed by null-terminated names) rather than the inline 8-byte
//! `Name` field, per the PE/COFF spec. Every defined function symbol
//! also gets a trailing `.bf`/`.ef` auxiliary pair, matching what MSVC's
//! own `link.exe` expects to see for a `FUNCTION` storage class.

use crate::common::{Endian, Linkage, Map, Symbol};
use crate::object::{Object, RefType, Section, SymbolRef};
use crate::target::Target;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
const IMAGE_SCN_ALIGN_16BYTES: u32 = 0x0050_0000;

const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;
const IMAGE_SYM_CLASS_STATIC: u8 = 3;
const IMAGE_SYM_CLASS_FUNCTION: u8 = 101;

const IMAGE_SYM_TYPE_NULL: u16 = 0;
const IMAGE_SYM_DTYPE_FUNCTION: u16 = 0x20; // shifted into bits 4-5 below

const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
const IMAGE_REL_AMD64_ADDR32: u16 = 0x0002;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;

const SECTION_HEADER_SIZE: usize = 40;
const SYMBOL_RECORD_SIZE: usize = 18;

struct StrTab {
    bytes: Vec<u8>,
}

impl StrTab {
    fn new() -> StrTab {
        // The leading 4 bytes hold the table's own total size (including
        // themselves), patched in once the table is complete.
        StrTab { bytes: vec![0; 4] }
    }

    fn add(&mut self, name: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }

    fn finish(mut self) -> Vec<u8> {
        let size = self.bytes.len() as u32;
        self.bytes[0..4].copy_from_slice(&size.to_le_bytes());
        self.bytes
    }
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Encode a symbol's `Name` field: inline if it fits in 8 bytes, else a
/// `0` u32 followed by the string table offset.
fn write_name(out: &mut Vec<u8>, name: &str, strtab: &mut StrTab) {
    let bytes = name.as_bytes();
    if bytes.len() <= 8 {
        let mut field = [0u8; 8];
        field[..bytes.len()].copy_from_slice(bytes);
        out.extend_from_slice(&field);
    } else {
        write_u32(out, 0);
        write_u32(out, strtab.add(name));
    }
}

fn reloc_type(kind: RefType) -> u16 {
    use RefType::*;
    match kind {
        Rel32Le | Rel32Be => IMAGE_REL_AMD64_REL32,
        Abs64Le | Abs64Be => IMAGE_REL_AMD64_ADDR64,
        Abs32Le | Abs32Be => IMAGE_REL_AMD64_ADDR32,
        // COFF has no narrower relocation types on x86-64; these never
        // arise from `select::lower_program`'s output.
        Rel8 | Rel16Le | Rel16Be | Rel64Le | Rel64Be | Abs8 | Abs16Le | Abs16Be => IMAGE_REL_AMD64_ADDR32,
    }
}

fn section_has_relocs(section: Section, relocations: &Map<(Section, u64), SymbolRef>) -> bool {
    relocations.keys().any(|&(sec, _)| sec == section)
}

pub fn write(obj: &Object, target: &dyn Target) -> Vec<u8> {
    let _ = target; // COFF is Windows/x86-64 only; machine field is fixed.
    let code_bytes = obj.code.as_slice().to_vec();
    let mut data_bytes = obj.data.as_slice().to_vec();
    data_bytes.extend_from_slice(obj.static_.as_slice());
    let has_data = !data_bytes.is_empty();

    let text_has_rel = section_has_relocs(Section::Code, &obj.relocations);
    let data_has_rel = has_data
        && (section_has_relocs(Section::Data, &obj.relocations) || section_has_relocs(Section::Static, &obj.relocations));

    let mut strtab = StrTab::new();
    let mut symbols: Vec<u8> = Vec::new();
    let mut symbol_count = 0u32;
    let mut sym_index: Map<Symbol, u32> = Map::new();

    let all_symbols = obj.all_symbols();
    let (mut locals, mut globals): (Vec<Symbol>, Vec<Symbol>) =
        all_symbols.into_iter().partition(|s| s.linkage == Linkage::Local);
    locals.sort_by_key(|s| s.id());
    globals.sort_by_key(|s| s.id());
    let ordered_symbols: Vec<Symbol> = locals.into_iter().chain(globals).collect();

    for sym in &ordered_symbols {
        let idx = symbol_count;
        sym_index.insert(*sym, idx);

        let class = if sym.linkage == Linkage::Local { IMAGE_SYM_CLASS_STATIC } else { IMAGE_SYM_CLASS_EXTERNAL };
        let is_function_def = obj.symbol_defs.get(sym).map(|&(s, _)| s == Section::Code).unwrap_or(false);

        write_name(&mut symbols, &sym.name(), &mut strtab);
        let value = obj.symbol_defs.get(sym).map(|&(_, off)| off as u32).unwrap_or(0);
        write_u32(&mut symbols, value);
        let section_number: i16 = match obj.symbol_defs.get(sym) {
            Some(&(Section::Code, _)) => 1,
            Some(&(Section::Data, _)) | Some(&(Section::Static, _)) if has_data => 2,
            Some(_) => 1,
            None => 0, // undefined external, resolved at link time
        };
        write_u16(&mut symbols, section_number as u16);
        let ty: u16 = if is_function_def { (IMAGE_SYM_DTYPE_FUNCTION << 4) | IMAGE_SYM_TYPE_NULL } else { IMAGE_SYM_TYPE_NULL };
        write_u16(&mut symbols, ty);
        let storage_class = if is_function_def { IMAGE_SYM_CLASS_FUNCTION } else { class };
        symbols.push(storage_class);
        symbols.push(0); // NumberOfAuxSymbols; function aux records appended below bump this after the fact
        symbol_count += 1;
    }

    // Function symbols (internal-format style: any symbol defined in the
    // code section) get a `.bf`/`.ef` auxiliary pair so tools that expect
    // MSVC-shaped debug info don't choke on their absence.
    let mut aux_patches: Vec<(usize, u8)> = Vec::new();
    let mut func_defs: Vec<(Symbol, u64)> = obj
        .symbol_defs
        .iter()
        .filter(|&(_, &(section, _))| section == Section::Code)
        .map(|(&s, &(_, off))| (s, off))
        .collect();
    func_defs.sort_by_key(|&(_, off)| off);

    for (sym, _off) in &func_defs {
        let record_index = sym_index[sym] as usize;
        aux_patches.push((record_index, 2));
        append_bf_ef_aux(&mut symbols, &mut strtab);
    }
    for (record_index, count) in aux_patches {
        let byte_offset = record_index * SYMBOL_RECORD_SIZE + 17;
        symbols[byte_offset] = count;
    }

    let mut text_rel = Vec::new();
    build_rel_entries(&mut text_rel, Section::Code, &obj.relocations, &sym_index);
    let mut data_rel = Vec::new();
    if has_data {
        build_rel_entries(&mut data_rel, Section::Data, &obj.relocations, &sym_index);
        build_rel_entries(&mut data_rel, Section::Static, &obj.relocations, &sym_index);
    }

    let num_sections: u16 = if has_data { 2 } else { 1 };
    let header_size = 20usize; // IMAGE_FILE_HEADER
    let section_table_size = num_sections as usize * SECTION_HEADER_SIZE;

    let mut cursor = header_size + section_table_size;
    let text_offset = cursor;
    cursor += code_bytes.len();
    let text_reloc_offset = cursor;
    if text_has_rel {
        cursor += text_rel.len();
    }
    let data_offset = cursor;
    if has_data {
        cursor += data_bytes.len();
    }
    let data_reloc_offset = cursor;
    if data_has_rel {
        cursor += data_rel.len();
    }
    let symtab_offset = cursor;
    cursor += symbols.len();
    let strtab_offset = cursor;

    let mut out = Vec::new();
    write_u16(&mut out, IMAGE_FILE_MACHINE_AMD64);
    write_u16(&mut out, num_sections);
    write_u32(&mut out, 0); // TimeDateStamp: left at 0, reproducible builds
    write_u32(&mut out, symtab_offset as u32);
    write_u32(&mut out, symbol_count);
    write_u16(&mut out, 0); // SizeOfOptionalHeader: none, this is an object file
    write_u16(&mut out, 0); // Characteristics

    write_section_header(
        &mut out,
        b".text",
        code_bytes.len() as u32,
        text_offset as u32,
        if text_has_rel { text_reloc_offset as u32 } else { 0 },
        if text_has_rel { (text_rel.len() / 10) as u16 } else { 0 },
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ | IMAGE_SCN_ALIGN_16BYTES,
    );
    if has_data {
        write_section_header(
            &mut out,
            b".data",
            data_bytes.len() as u32,
            data_offset as u32,
            if data_has_rel { data_reloc_offset as u32 } else { 0 },
            if data_has_rel { (data_rel.len() / 10) as u16 } else { 0 },
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        );
    }

    out.extend_from_slice(&code_bytes);
    if text_has_rel {
        out.extend_from_slice(&text_rel);
    }
    if has_data {
        out.extend_from_slice(&data_bytes);
        if data_has_rel {
            out.extend_from_slice(&data_rel);
        }
    }
    out.extend_from_slice(&symbols);
    out.extend_from_slice(&strtab.finish());
    let _ = strtab_offset;
    out
}

fn write_section_header(
    out: &mut Vec<u8>,
    name: &[u8; 5],
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    number_of_relocations: u16,
    characteristics: u32,
) {
    let mut field = [0u8; 8];
    field[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&field);
    write_u32(out, size_of_raw_data); // VirtualSize: unused in object files, reuse for raw size
    write_u32(out, 0); // VirtualAddress
    write_u32(out, size_of_raw_data);
    write_u32(out, pointer_to_raw_data);
    write_u32(out, pointer_to_relocations);
    write_u32(out, 0); // PointerToLinenumbers
    write_u16(out, number_of_relocations);
    write_u16(out, 0); // NumberOfLinenumbers
    write_u32(out, characteristics);
}

fn append_bf_ef_aux(symbols: &mut Vec<u8>, _strtab: &mut StrTab) {
    // `.bf`/`.ef` auxiliary symbol: 18 bytes, mostly zero, carrying only
    // the source line number fields we don't track.
    symbols.extend_from_slice(&[0u8; SYMBOL_RECORD_SIZE]);
}

fn build_rel_entries(out: &mut Vec<u8>, section: Section, relocations: &Map<(Section, u64), SymbolRef>, sym_index: &Map<Symbol, u32>) {
    for (&(sec, offset), reloc) in relocations {
        if sec != section {
            continue;
        }
        write_u32(out, offset as u32); // VirtualAddress
        write_u32(out, sym_index[&reloc.symbol]); // SymbolTableIndex
        write_u16(out, reloc_type(reloc.kind)); // Type
    }
}

#[allow(dead_code)]
fn host_endian_is_little() -> bool {
    Endian::host() == Endian::Little
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern_global;
    use crate::object::{ArchTag, OsTag};
    use crate::target::MicrosoftX64;

    #[test]
    fn header_reports_amd64_machine_and_section_count() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Windows);
        obj.code.write_bytes(&[0xc3]);
        let bytes = write(&obj, &MicrosoftX64);
        let machine = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(machine, IMAGE_FILE_MACHINE_AMD64);
        let num_sections = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(num_sections, 1);
    }

    #[test]
    fn defined_symbol_is_counted() {
        let mut obj = Object::new(ArchTag::X86_64, OsTag::Windows);
        obj.code.write_bytes(&[0xc3]);
        obj.define(intern_global("entry"), Section::Code);
        let bytes = write(&obj, &MicrosoftX64);
        let symbol_count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(symbol_count, 1);
    }
}
