//! A parser and loader for the Preferred Executable Format container: the
//! PowerPC (and 68K) "shared library" shape classic Mac OS used for code
//! resources and CFM binaries. Sections arrive pattern-compressed or flat;
//! a loader section describes how to bind imports/exports and relocate
//! every other section once it has a real address.

mod header;
mod loader;
mod pattern;
mod relocation;

use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use scroll::{Pread, BE};

pub use header::{SectionKind, ShareKind};
pub use loader::{ExportSymbol, ImportSymbol};

use crate::error::{Error, Result};
use crate::memory::MemoryContext;

use header::{PeffHeader, PeffSectionHeader, ARCH_M68K, ARCH_PPC, FORMAT_VERSION, MAGIC1, MAGIC2};

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub default_address: u32,
    pub total_size: u32,
    pub unpacked_size: u32,
    pub packed_size: u32,
    pub kind: SectionKind,
    pub share_kind: ShareKind,
    pub alignment: u8,
    pub data: Vec<u8>,
    pub relocation_program: Vec<u8>,
}

/// A parsed PEFF container: its sections (already pattern-decompressed) and
/// its loader section's imports, exports, and per-section relocation
/// programs.
pub struct PeffFile {
    pub file_timestamp: u32,
    pub old_def_version: u32,
    pub old_imp_version: u32,
    pub current_version: u32,
    pub arch_is_ppc: bool,

    pub sections: Vec<Section>,
    pub main_symbol: Option<ExportSymbol>,
    pub init_symbol: Option<ExportSymbol>,
    pub term_symbol: Option<ExportSymbol>,
    pub exports: alloc::collections::BTreeMap<String, ExportSymbol>,
    pub imports: Vec<ImportSymbol>,
}

impl PeffFile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let header: PeffHeader = data.gread_with(&mut offset, BE)?;
        if header.magic1 != MAGIC1 {
            return Err(Error::Malformed("file does not have Joy! signature".to_string()));
        }
        if header.magic2 != MAGIC2 {
            return Err(Error::Malformed("file does not have peff signature".to_string()));
        }
        if header.arch != ARCH_PPC && header.arch != ARCH_M68K {
            return Err(Error::Malformed("file is not for the pwpc or m68k architecture".to_string()));
        }
        if header.format_version != FORMAT_VERSION {
            return Err(Error::Malformed("file format version is not 1".to_string()));
        }

        let section_name_table_offset = offset + core::mem::size_of::<PeffSectionHeader>() * header.section_count as usize;

        let mut sections = Vec::with_capacity(header.section_count as usize);
        let mut loader_section_data: Option<Vec<u8>> = None;

        for _ in 0..header.section_count {
            let sec_header: PeffSectionHeader = data.gread_with(&mut offset, BE)?;
            let kind = SectionKind::from_u8(sec_header.section_kind);

            let container_offset = sec_header.container_offset as usize;
            let packed_size = sec_header.packed_size as usize;
            let raw = data
                .get(container_offset..container_offset + packed_size)
                .ok_or_else(|| Error::Malformed("section data runs past end of file".to_string()))?;

            let section_data = if kind == SectionKind::PatternData {
                pattern::decompress_pattern_data(raw)?
            } else if kind == SectionKind::Loader {
                loader_section_data = Some(raw.to_vec());
                Vec::new()
            } else {
                raw.to_vec()
            };

            let name = if sec_header.name_offset >= 0 {
                let name_offset = section_name_table_offset + sec_header.name_offset as usize;
                read_cstr(data, name_offset)?
            } else {
                String::new()
            };

            sections.push(Section {
                name,
                default_address: sec_header.default_address,
                total_size: sec_header.total_size,
                unpacked_size: sec_header.unpacked_size,
                packed_size: sec_header.packed_size,
                kind,
                share_kind: ShareKind::from_u8(sec_header.share_kind),
                alignment: sec_header.alignment,
                data: section_data,
                relocation_program: Vec::new(),
            });
        }

        let mut result = PeffFile {
            file_timestamp: header.timestamp,
            old_def_version: header.old_def_version,
            old_imp_version: header.old_imp_version,
            current_version: header.current_version,
            arch_is_ppc: header.arch == ARCH_PPC,
            sections,
            main_symbol: None,
            init_symbol: None,
            term_symbol: None,
            exports: alloc::collections::BTreeMap::new(),
            imports: Vec::new(),
        };

        if let Some(loader_data) = loader_section_data {
            let info = loader::parse_loader_section(&loader_data, result.sections.len())?;
            result.main_symbol = info.main_symbol;
            result.init_symbol = info.init_symbol;
            result.term_symbol = info.term_symbol;
            result.exports = info.exports;
            result.imports = info.imports;
            for (section_index, program) in info.relocation_programs {
                result.sections[section_index as usize].relocation_program = program;
            }
        }

        Ok(result)
    }

    /// Loads every section into `memory`, binding imports under
    /// `lib_name:symbol` names, running each section's relocation program,
    /// and registering this container's own exports as `lib_name:symbol`
    /// (plus `lib_name:section:N` for each loaded section's base address).
    ///
    /// When `base_addr` is `Some`, sections are placed starting there
    /// (rounded up to the next host page between sections) instead of
    /// wherever the allocator's best-fit search lands them.
    pub fn load_into(&self, lib_name: &str, memory: &Rc<RefCell<MemoryContext>>, base_addr: Option<u32>) -> Result<Vec<u32>> {
        let mut section_addrs = Vec::with_capacity(self.sections.len());
        let mut next_fixed_addr = base_addr;

        for section in &self.sections {
            if section.total_size < section.data.len() as u32 {
                return Err(Error::Malformed("section total size is smaller than data size".to_string()));
            }
            if section.total_size == 0 {
                section_addrs.push(0);
                continue;
            }

            let section_addr = {
                let mut mem = memory.borrow_mut();
                match next_fixed_addr {
                    None => {
                        let addr = mem.allocate(section.total_size, false);
                        if addr == 0 {
                            return Err(Error::AllocationFailure);
                        }
                        addr
                    }
                    Some(addr) => {
                        mem.allocate_at(addr, section.total_size)?;
                        let page_size = mem.page_size();
                        next_fixed_addr = Some((addr + section.total_size + (page_size - 1)) & !(page_size - 1));
                        addr
                    }
                }
            };

            {
                let mut mem = memory.borrow_mut();
                let dest = mem.at_mut(section_addr, section.total_size)?;
                dest[..section.data.len()].copy_from_slice(&section.data);
                for b in &mut dest[section.data.len()..] {
                    *b = 0;
                }
            }
            section_addrs.push(section_addr);
        }

        let resolve_import = |mem: &MemoryContext, index: u32| -> Result<u32> {
            let sym = self
                .imports
                .get(index as usize)
                .ok_or_else(|| Error::OutOfRange("relocation refers to a nonexistent import".to_string()))?;
            let name = alloc::format!("{}:{}", sym.lib_name, sym.name);
            match mem.get_symbol_addr(&name) {
                Ok(addr) => Ok(addr),
                Err(_) if sym.is_weak() => Ok(0),
                Err(err) => Err(err),
            }
        };

        let default_addrs: Vec<u32> = self.sections.iter().map(|s| s.default_address).collect();

        for (index, section) in self.sections.iter().enumerate() {
            if section.relocation_program.is_empty() {
                continue;
            }
            let mut resolve = resolve_import;
            let mut ctx = relocation::RelocationContext {
                section_addrs: &section_addrs,
                default_addrs: &default_addrs,
                resolve_import: &mut resolve,
            };
            let mut mem = memory.borrow_mut();
            relocation::run_relocation_program(&section.relocation_program, &mut mem, section_addrs[index], &mut ctx)?;
        }

        let mut mem = memory.borrow_mut();
        let mut register = |exp: &ExportSymbol| -> Result<()> {
            let name = alloc::format!("{lib_name}:{}", exp.name);
            let base = *section_addrs
                .get(exp.section_index as usize)
                .ok_or_else(|| Error::OutOfRange("export refers to a nonexistent section".to_string()))?;
            mem.set_symbol_addr(&name, base + exp.value)
        };
        if let Some(sym) = &self.main_symbol {
            register(sym)?;
        }
        if let Some(sym) = &self.init_symbol {
            register(sym)?;
        }
        if let Some(sym) = &self.term_symbol {
            register(sym)?;
        }
        for sym in self.exports.values() {
            register(sym)?;
        }
        for (index, &addr) in section_addrs.iter().enumerate() {
            if addr == 0 {
                continue;
            }
            let name = alloc::format!("{lib_name}:section:{index}");
            mem.set_symbol_addr(&name, addr)?;
        }

        Ok(section_addrs)
    }
}

fn read_cstr(data: &[u8], offset: usize) -> Result<String> {
    let bytes = data.get(offset..).ok_or_else(|| Error::Malformed("name offset out of range".to_string()))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).map(|s| s.to_string()).map_err(|_| Error::Malformed("name is not valid UTF-8".to_string()))
}

pub use relocation::disassemble_relocation_program;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let data = [0u8; 40];
        assert!(PeffFile::parse(&data).is_err());
    }
}
