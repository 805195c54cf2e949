//! Identifies what sort of file we're dealing with from its leading bytes.

use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;
use object::read::elf::FileHeader as _;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
    ThinArchive,
    MachOObject,
    MachODylib,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            return Ok(FileKind::Archive);
        }
        if bytes.starts_with(&object::archive::THIN_MAGIC) {
            return Ok(FileKind::ThinArchive);
        }
        if bytes.starts_with(object::elf::ELFMAG.as_slice()) {
            return identify_elf(bytes);
        }
        if bytes.starts_with(&object::macho::MH_MAGIC_64.to_le_bytes()) {
            return identify_macho(bytes);
        }
        if bytes.starts_with(b"BC\xc0\xde") {
            bail!("file contains LLVM bitcode; LTO objects are not supported");
        }
        bail!("couldn't identify file type");
    }
}

fn identify_elf(bytes: &[u8]) -> Result<FileKind> {
    const HEADER_LEN: usize = size_of::<crate::elf::FileHeader>();
    if bytes.len() < HEADER_LEN {
        bail!("invalid ELF file: truncated header");
    }
    let header: &crate::elf::FileHeader = object::from_bytes(&bytes[..HEADER_LEN]).unwrap().0;
    if header.e_ident.class != object::elf::ELFCLASS64 {
        bail!("only 64 bit ELF is currently supported");
    }
    if header.e_ident.data != object::elf::ELFDATA2LSB {
        bail!("only little endian is currently supported");
    }
    match header.e_type.get(LittleEndian) {
        object::elf::ET_REL => Ok(FileKind::ElfObject),
        object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
        t => bail!("unsupported ELF type {t}"),
    }
}

fn identify_macho(bytes: &[u8]) -> Result<FileKind> {
    const HEADER_LEN: usize = size_of::<object::macho::MachHeader64<LittleEndian>>();
    if bytes.len() < HEADER_LEN {
        bail!("invalid Mach-O file: truncated header");
    }
    let header: &object::macho::MachHeader64<LittleEndian> =
        object::from_bytes(&bytes[..HEADER_LEN]).unwrap().0;
    match header.filetype.get(LittleEndian) {
        object::macho::MH_OBJECT => Ok(FileKind::MachOObject),
        object::macho::MH_DYLIB => Ok(FileKind::MachODylib),
        t => bail!("unsupported Mach-O file type {t}"),
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF dynamic",
            FileKind::Archive => "archive",
            FileKind::ThinArchive => "thin archive",
            FileKind::MachOObject => "Mach-O object",
            FileKind::MachODylib => "Mach-O dylib",
        })
    }
}
