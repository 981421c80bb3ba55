//! The loader section: imports, exports, and the entry points a container
//! can expose to a caller binding it in. The loader section's own header,
//! the import library/symbol tables, and the relocation-header table use
//! fixed-size records read sequentially off one cursor; the string table,
//! export hash table, and export key table that follow are three more
//! variable-length passes over the same buffer, each needing the one before
//! it to know where to look.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use scroll::{Pread, Pwrite, SizeWith, BE};

use crate::error::{Error, Result};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderSectionHeader {
    main_symbol_section_index: i32,
    main_symbol_offset: u32,
    init_symbol_section_index: i32,
    init_symbol_offset: u32,
    term_symbol_section_index: i32,
    term_symbol_offset: u32,
    imported_lib_count: u32,
    imported_symbol_count: u32,
    rel_section_count: u32,
    rel_commands_offset: u32,
    string_table_offset: u32,
    export_hash_offset: u32,
    export_hash_power: u32,
    exported_symbol_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderImportLibrary {
    name_offset: u32,
    old_imp_version: u32,
    current_version: u32,
    imported_symbol_count: u32,
    start_index: u32,
    options: u8,
    reserved1: u8,
    reserved2: u16,
}

const IMPORT_LIBRARY_WEAK: u8 = 0x40;
const IMPORT_SYMBOL_WEAK: u8 = 0x80;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderImportSymbol(u32);

impl LoaderImportSymbol {
    fn flags(&self) -> u8 {
        ((self.0 >> 28) & 0x0F) as u8
    }
    fn ty(&self) -> u8 {
        ((self.0 >> 24) & 0x0F) as u8
    }
    fn name_offset(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderRelocationHeader {
    section_index: u16,
    reserved: u16,
    word_count: u32,
    start_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderExportHashEntry(u32);

impl LoaderExportHashEntry {
    fn chain_count(&self) -> u16 {
        ((self.0 >> 18) & 0x3FFF) as u16
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderExportHashKey {
    symbol_length: u16,
    #[allow(dead_code)]
    hash: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
struct LoaderExportSymbolRaw {
    type_and_name: u32,
    value: u32,
    section_index: u16,
}

impl LoaderExportSymbolRaw {
    fn flags(&self) -> u8 {
        ((self.type_and_name >> 28) & 0x0F) as u8
    }
    fn ty(&self) -> u8 {
        ((self.type_and_name >> 24) & 0x0F) as u8
    }
    fn name_offset(&self) -> u32 {
        self.type_and_name & 0x00FF_FFFF
    }
}

#[derive(Debug, Clone)]
pub struct ExportSymbol {
    pub name: String,
    pub section_index: u16,
    pub value: u32,
    pub flags: u8,
    pub ty: u8,
}

#[derive(Debug, Clone)]
pub struct ImportSymbol {
    pub lib_name: String,
    pub name: String,
    pub flags: u8,
    pub ty: u8,
}

impl ImportSymbol {
    pub fn is_weak(&self) -> bool {
        self.flags & IMPORT_SYMBOL_WEAK != 0
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoaderInfo {
    pub main_symbol: Option<ExportSymbol>,
    pub init_symbol: Option<ExportSymbol>,
    pub term_symbol: Option<ExportSymbol>,
    pub imports: Vec<ImportSymbol>,
    pub exports: BTreeMap<String, ExportSymbol>,
    /// `(section_index, relocation program bytes)`, one per section that has
    /// a relocation program.
    pub relocation_programs: Vec<(u16, Vec<u8>)>,
}

fn read_cstr(data: &[u8], offset: usize) -> Result<String> {
    let bytes = data.get(offset..).ok_or_else(|| Error::Malformed("name offset out of range".to_string()))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end])
        .map(|s| s.to_string())
        .map_err(|_| Error::Malformed("name is not valid UTF-8".to_string()))
}

pub fn parse_loader_section(data: &[u8], section_count: usize) -> Result<LoaderInfo> {
    let mut offset = 0usize;
    let header: LoaderSectionHeader = data.gread_with(&mut offset, BE)?;

    let mut info = LoaderInfo::default();

    if header.main_symbol_section_index >= 0 {
        info.main_symbol = Some(ExportSymbol {
            name: "[main]".to_string(),
            section_index: header.main_symbol_section_index as u16,
            value: header.main_symbol_offset,
            flags: 0,
            ty: 0,
        });
    }
    if header.init_symbol_section_index >= 0 {
        info.init_symbol = Some(ExportSymbol {
            name: "[init]".to_string(),
            section_index: header.init_symbol_section_index as u16,
            value: header.init_symbol_offset,
            flags: 0,
            ty: 0,
        });
    }
    if header.term_symbol_section_index >= 0 {
        info.term_symbol = Some(ExportSymbol {
            name: "[term]".to_string(),
            section_index: header.term_symbol_section_index as u16,
            value: header.term_symbol_offset,
            flags: 0,
            ty: 0,
        });
    }

    let mut import_library_start_indexes: BTreeMap<u32, (String, bool)> = BTreeMap::new();
    for _ in 0..header.imported_lib_count {
        let lib: LoaderImportLibrary = data.gread_with(&mut offset, BE)?;
        let name_offset = (header.string_table_offset as usize) + (lib.name_offset as usize);
        if name_offset >= data.len() {
            return Err(Error::Malformed("library name out of range".to_string()));
        }
        let name = read_cstr(data, name_offset)?;
        let weak = lib.options & IMPORT_LIBRARY_WEAK != 0;
        import_library_start_indexes.insert(lib.start_index, (name, weak));
    }

    let mut current_lib_name = "__missing__".to_string();
    let mut current_lib_weak = false;
    for x in 0..header.imported_symbol_count {
        let sym: LoaderImportSymbol = data.gread_with(&mut offset, BE)?;
        if let Some((name, weak)) = import_library_start_indexes.get(&x) {
            current_lib_name = name.clone();
            current_lib_weak = *weak;
        }

        let name_offset = (header.string_table_offset as usize) + (sym.name_offset() as usize);
        if name_offset >= data.len() {
            return Err(Error::Malformed("symbol name out of range".to_string()));
        }
        let name = read_cstr(data, name_offset)?;

        let mut flags = sym.flags();
        if current_lib_weak {
            flags |= IMPORT_SYMBOL_WEAK;
        }
        info.imports.push(ImportSymbol { lib_name: current_lib_name.clone(), name, flags, ty: sym.ty() });
    }

    for _ in 0..header.rel_section_count {
        let rel: LoaderRelocationHeader = data.gread_with(&mut offset, BE)?;
        if rel.section_index as usize >= section_count {
            return Err(Error::Malformed("relocation program refers to nonexistent section".to_string()));
        }
        let start = (header.rel_commands_offset + rel.start_offset) as usize;
        let len = (rel.word_count * 2) as usize;
        let program = data
            .get(start..start + len)
            .ok_or_else(|| Error::Malformed("relocation program runs past end of loader section".to_string()))?
            .to_vec();
        info.relocation_programs.push((rel.section_index, program));
    }

    let mut hash_offset = header.export_hash_offset as usize;
    let mut hash_export_count: usize = 0;
    for _ in 0..(1u32 << header.export_hash_power) {
        let entry: LoaderExportHashEntry = data.gread_with(&mut hash_offset, BE)?;
        hash_export_count += entry.chain_count() as usize;
    }
    if hash_export_count != header.exported_symbol_count as usize {
        return Err(Error::Malformed("hash key count does not match exported symbol count".to_string()));
    }

    let mut symbol_name_lengths = Vec::with_capacity(hash_export_count);
    for _ in 0..hash_export_count {
        let key: LoaderExportHashKey = data.gread_with(&mut hash_offset, BE)?;
        symbol_name_lengths.push(key.symbol_length);
    }
    for &name_len in &symbol_name_lengths {
        let sym: LoaderExportSymbolRaw = data.gread_with(&mut hash_offset, BE)?;
        let name_offset = (header.string_table_offset as usize) + (sym.name_offset() as usize);
        let name_bytes = data
            .get(name_offset..name_offset + name_len as usize)
            .ok_or_else(|| Error::Malformed("export symbol name out of range".to_string()))?;
        let name = core::str::from_utf8(name_bytes).map_err(|_| Error::Malformed("export name is not valid UTF-8".to_string()))?.to_string();
        info.exports.insert(
            name.clone(),
            ExportSymbol { name, section_index: sym.section_index, value: sym.value, flags: sym.flags(), ty: sym.ty() },
        );
    }

    Ok(info)
}
