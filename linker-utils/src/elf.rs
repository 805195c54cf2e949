//! ELF constants wrapped in slightly more ergonomic types. We use the raw constants from the
//! `object` crate, but wrap section flags and types so that call sites read as `shf::ALLOC` rather
//! than bare integers and so that flag tests can't accidentally mix flags with types.

/// Section flag bit values.
#[allow(unused)]
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_WRITE as u64);
    pub const ALLOC: SectionFlags = SectionFlags::from_u64(object::elf::SHF_ALLOC as u64);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u64(object::elf::SHF_EXECINSTR as u64);
    pub const MERGE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_MERGE as u64);
    pub const STRINGS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_STRINGS as u64);
    pub const INFO_LINK: SectionFlags = SectionFlags::from_u64(object::elf::SHF_INFO_LINK as u64);
    pub const LINK_ORDER: SectionFlags = SectionFlags::from_u64(object::elf::SHF_LINK_ORDER as u64);
    pub const GROUP: SectionFlags = SectionFlags::from_u64(object::elf::SHF_GROUP as u64);
    pub const TLS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_TLS as u64);
    pub const COMPRESSED: SectionFlags = SectionFlags::from_u64(object::elf::SHF_COMPRESSED as u64);
    pub const EXCLUDE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_EXCLUDE as u64);
    pub const GNU_RETAIN: SectionFlags = SectionFlags::from_u64(object::elf::SHF_GNU_RETAIN as u64);
}

/// Section types.
#[allow(unused)]
pub mod sht {
    use super::SectionType;

    pub const NULL: SectionType = SectionType(object::elf::SHT_NULL);
    pub const PROGBITS: SectionType = SectionType(object::elf::SHT_PROGBITS);
    pub const SYMTAB: SectionType = SectionType(object::elf::SHT_SYMTAB);
    pub const STRTAB: SectionType = SectionType(object::elf::SHT_STRTAB);
    pub const RELA: SectionType = SectionType(object::elf::SHT_RELA);
    pub const HASH: SectionType = SectionType(object::elf::SHT_HASH);
    pub const DYNAMIC: SectionType = SectionType(object::elf::SHT_DYNAMIC);
    pub const NOTE: SectionType = SectionType(object::elf::SHT_NOTE);
    pub const NOBITS: SectionType = SectionType(object::elf::SHT_NOBITS);
    pub const REL: SectionType = SectionType(object::elf::SHT_REL);
    pub const DYNSYM: SectionType = SectionType(object::elf::SHT_DYNSYM);
    pub const INIT_ARRAY: SectionType = SectionType(object::elf::SHT_INIT_ARRAY);
    pub const FINI_ARRAY: SectionType = SectionType(object::elf::SHT_FINI_ARRAY);
    pub const PREINIT_ARRAY: SectionType = SectionType(object::elf::SHT_PREINIT_ARRAY);
    pub const GROUP: SectionType = SectionType(object::elf::SHT_GROUP);
    pub const SYMTAB_SHNDX: SectionType = SectionType(object::elf::SHT_SYMTAB_SHNDX);
    pub const GNU_HASH: SectionType = SectionType(object::elf::SHT_GNU_HASH);
    pub const GNU_VERDEF: SectionType = SectionType(object::elf::SHT_GNU_VERDEF);
    pub const GNU_VERNEED: SectionType = SectionType(object::elf::SHT_GNU_VERNEED);
    pub const GNU_VERSYM: SectionType = SectionType(object::elf::SHT_GNU_VERSYM);
}

/// Section names that the linker recognizes by name rather than by type or flags.
#[allow(unused)]
pub mod secnames {
    pub const EH_FRAME: &[u8] = b".eh_frame";
    pub const EH_FRAME_HDR: &[u8] = b".eh_frame_hdr";
    pub const INIT_ARRAY: &[u8] = b".init_array";
    pub const FINI_ARRAY: &[u8] = b".fini_array";
    pub const PREINIT_ARRAY: &[u8] = b".preinit_array";
    pub const CTORS: &[u8] = b".ctors";
    pub const DTORS: &[u8] = b".dtors";
    pub const INIT: &[u8] = b".init";
    pub const FINI: &[u8] = b".fini";
    pub const COMMENT: &[u8] = b".comment";
    pub const COMMON: &[u8] = b".common";
    pub const BSS: &[u8] = b".bss";
    pub const NOTE_GNU_PROPERTY: &[u8] = b".note.gnu.property";
    pub const NOTE_GNU_STACK: &[u8] = b".note.GNU-stack";
    pub const GNU_WARNING_PREFIX: &[u8] = b".gnu.warning.";
    pub const DEBUG_PREFIX: &[u8] = b".debug";
    pub const ZDEBUG_PREFIX: &[u8] = b".zdebug";
    pub const GNU_LTO_PREFIX: &[u8] = b".gnu.lto_";
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectionFlags(u64);

impl SectionFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    /// Returns self with the specified flags set.
    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> Self {
        Self(self.0 | flags.0)
    }

    /// Returns self with the specified flags cleared.
    #[must_use]
    pub const fn without(self, flags: SectionFlags) -> Self {
        Self(self.0 & !flags.0)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct SectionType(pub u32);

impl SectionType {
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (flag, ch) in [
            (shf::WRITE, 'W'),
            (shf::ALLOC, 'A'),
            (shf::EXECINSTR, 'X'),
            (shf::MERGE, 'M'),
            (shf::STRINGS, 'S'),
            (shf::INFO_LINK, 'I'),
            (shf::LINK_ORDER, 'L'),
            (shf::GROUP, 'G'),
            (shf::TLS, 'T'),
            (shf::COMPRESSED, 'C'),
        ] {
            if self.contains(flag) {
                f.write_str(ch.encode_utf8(&mut [0; 4]))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl std::ops::BitOrAssign for SectionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_display() {
        let flags = shf::ALLOC.with(shf::WRITE).with(shf::TLS);
        assert_eq!(format!("{flags}"), "WAT");
        assert!(flags.contains(shf::TLS));
        assert!(!flags.without(shf::TLS).contains(shf::TLS));
    }
}
