//! Typed access to ELF input files. This is a thin layer over the `object` crate that resolves
//! the section and symbol tables once at parse time and adds the pieces `object` doesn't give us
//! directly: section decompression and extended-index handling.

use crate::arch::Architecture;
use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::SectionType;
use linker_utils::elf::secnames;
use object::LittleEndian;
use object::read::elf::CompressionHeader as _;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type SymtabEntry = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;
pub(crate) type CompressionHeader = object::elf::CompressionHeader64<LittleEndian>;
pub(crate) type Versym = object::elf::Versym<LittleEndian>;
pub(crate) type Verdef = object::elf::Verdef<LittleEndian>;
pub(crate) type Verdaux = object::elf::Verdaux<LittleEndian>;
pub(crate) type NoteHeader = object::elf::NoteHeader64<LittleEndian>;
pub(crate) type VerdefIterator<'data> = object::read::elf::VerdefIterator<'data, FileHeader>;

pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

pub(crate) const COMMON_PAGE_SIZE: u64 = 0x1000;

pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) arch: Architecture,
    pub(crate) sections: SectionTable<'data>,
    /// symtab for relocatable objects, dynsym for shared objects.
    pub(crate) symbols: SymbolTable<'data>,
    /// Index of the first non-local symbol, from the symbol table header's sh_info field.
    pub(crate) first_global: usize,
    pub(crate) versym: &'data [Versym],
    pub(crate) verdef: Option<(VerdefIterator<'data>, object::SectionIndex)>,
    pub(crate) is_dynamic: bool,
}

/// A snapshot of the fields of a section header that the pipeline cares about. Decompression
/// replaces the snapshot rather than the underlying header, which is how compressed sections get
/// a synthetic header with the uncompressed size and the compressed flag cleared.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionInfo<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: SectionType,
    pub(crate) sh_flags: SectionFlags,
    pub(crate) sh_size: u64,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8], is_dynamic: bool) -> Result<Self> {
        let endian = LittleEndian;
        let header = FileHeader::parse(data).context("invalid ELF header")?;

        let e_machine = header.e_machine.get(endian);
        let arch = Architecture::from_e_machine(e_machine)
            .with_context(|| format!("unsupported machine type {e_machine}"))?;

        // `object` resolves both header-overflow extensions here: a zero e_shnum redirects to
        // section 0's sh_size and SHN_XINDEX redirects e_shstrndx to section 0's sh_link.
        let sections = header
            .sections(endian, data)
            .context("invalid section header table")?;

        let symtab_kind = if is_dynamic {
            object::elf::SHT_DYNSYM
        } else {
            object::elf::SHT_SYMTAB
        };
        let symbols = sections
            .symbols(endian, data, symtab_kind)
            .context("invalid symbol table")?;

        // The index of the first global comes from the symbol table header's sh_info field. An
        // absent symbol table leaves `symbols.section()` pointing at the null section, whose
        // sh_info is zero.
        let first_global = sections
            .section(symbols.section())
            .map_or(0, |header| header.sh_info.get(endian) as usize);

        let versym = sections
            .gnu_versym(endian, data)
            .context("invalid .gnu.version section")?
            .map_or(&[][..], |(syms, _)| syms);

        let verdef = sections
            .gnu_verdef(endian, data)
            .context("invalid .gnu.version_d section")?;

        Ok(Self {
            data,
            arch,
            sections,
            symbols,
            first_global,
            versym,
            verdef,
            is_dynamic,
        })
    }

    pub(crate) fn section(&self, index: object::SectionIndex) -> Result<&'data SectionHeader> {
        Ok(self.sections.section(index)?)
    }

    pub(crate) fn section_name(&self, header: &SectionHeader) -> Result<&'data [u8]> {
        Ok(self.sections.section_name(LittleEndian, header)?)
    }

    pub(crate) fn section_info(&self, header: &SectionHeader) -> Result<SectionInfo<'data>> {
        let e = LittleEndian;
        Ok(SectionInfo {
            name: self.section_name(header)?,
            sh_type: SectionType(header.sh_type.get(e)),
            sh_flags: SectionFlags::from_u64(header.sh_flags.get(e)),
            sh_size: header.sh_size.get(e),
            sh_addralign: header.sh_addralign.get(e),
            sh_entsize: header.sh_entsize.get(e),
        })
    }

    /// Returns the contents of a section, decompressing them if the section is compressed. For a
    /// compressed section, the snapshot in `info` is rewritten to describe the decompressed bytes.
    pub(crate) fn section_data(
        &self,
        header: &SectionHeader,
        info: &mut SectionInfo<'data>,
        allocator: &bumpalo_herd::Member<'data>,
    ) -> Result<&'data [u8]> {
        let e = LittleEndian;
        if info.sh_type == linker_utils::elf::sht::NOBITS {
            return Ok(&[]);
        }
        let data = header.data(e, self.data).map_err(|_| {
            anyhow::anyhow!("section `{}` extends past end of file", String::from_utf8_lossy(info.name))
        })?;

        if info.name.starts_with(secnames::ZDEBUG_PREFIX) {
            // Legacy compressed debug section: a "ZLIB" magic followed by the uncompressed size
            // as a big-endian u64, then the deflate stream.
            if data.len() < 12 || &data[..4] != b"ZLIB" {
                bail!("corrupted .zdebug section");
            }
            let size = u64::from_be_bytes(data[4..12].try_into().unwrap());
            let out = allocator.alloc_slice_fill_default(size as usize);
            decompress_into(&data[12..], out)?;
            info.sh_size = size;
            return Ok(out);
        }

        if info.sh_flags.contains(linker_utils::elf::shf::COMPRESSED) {
            let (compression, offset, compressed_size) = header
                .compression(e, self.data)?
                .context("SHF_COMPRESSED section has no compression header")?;
            if compression.ch_type.get(e) != object::elf::ELFCOMPRESS_ZLIB {
                bail!("unsupported compression type {}", compression.ch_type.get(e));
            }
            let size = compression.ch_size(e);
            let out = allocator.alloc_slice_fill_default(size as usize);
            let compressed = self
                .data
                .get(offset as usize..(offset + compressed_size) as usize)
                .context("compressed section extends past end of file")?;
            decompress_into(compressed, out)?;
            info.sh_size = size;
            info.sh_addralign = compression.ch_addralign(e);
            info.sh_flags = info.sh_flags.without(linker_utils::elf::shf::COMPRESSED);
            return Ok(out);
        }

        Ok(data)
    }

    pub(crate) fn symbol(&self, index: object::SymbolIndex) -> Result<&'data SymtabEntry> {
        Ok(self.symbols.symbol(index)?)
    }

    pub(crate) fn symbol_name(&self, symbol: &SymtabEntry) -> Result<&'data [u8]> {
        Ok(symbol.name(LittleEndian, self.symbols.strings())?)
    }

    /// Returns the section a symbol is defined in, handling the extended-index escape used by
    /// objects with more than 0xff00 sections.
    pub(crate) fn symbol_section(
        &self,
        symbol: &SymtabEntry,
        index: object::SymbolIndex,
    ) -> Result<Option<object::SectionIndex>> {
        Ok(self.symbols.symbol_section(LittleEndian, symbol, index)?)
    }

    /// Reads the relocations out of a RELA section.
    pub(crate) fn relocations(&self, header: &SectionHeader) -> Result<&'data [Rela]> {
        let data = header
            .data(LittleEndian, self.data)
            .map_err(|_| anyhow::anyhow!("relocation section extends past end of file"))?;
        object::pod::slice_from_all_bytes(data)
            .map_err(|()| anyhow::anyhow!("incorrectly sized relocation section"))
    }

    pub(crate) fn dynamic_tags(
        &self,
    ) -> Result<Option<&'data [object::elf::Dyn64<LittleEndian>]>> {
        let e = LittleEndian;
        for header in self.sections.iter() {
            if header.sh_type.get(e) == object::elf::SHT_DYNAMIC {
                if let Some((tags, _)) = header.dynamic(e, self.data)? {
                    return Ok(Some(tags));
                }
            }
        }
        Ok(None)
    }
}

fn decompress_into(compressed: &[u8], out: &mut [u8]) -> Result {
    let mut decompressor = flate2::Decompress::new(true);
    decompressor
        .decompress(compressed, out, flate2::FlushDecompress::Finish)
        .context("decompression failed")?;
    if decompressor.total_out() != out.len() as u64 {
        bail!("decompressed section had wrong size");
    }
    Ok(())
}

pub(crate) fn is_hidden_symbol(symbol: &SymtabEntry) -> bool {
    symbol.st_visibility() == object::elf::STV_HIDDEN
        || symbol.st_visibility() == object::elf::STV_INTERNAL
}

/// Whether a section is a debug-info section for the purposes of --strip-debug.
pub(crate) fn is_debug_section(info: &SectionInfo) -> bool {
    !info.sh_flags.contains(linker_utils::elf::shf::ALLOC)
        && (info.name.starts_with(secnames::DEBUG_PREFIX)
            || info.name.starts_with(secnames::ZDEBUG_PREFIX))
}
