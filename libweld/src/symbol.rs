//! Global symbols. A symbol is created lazily the first time any file interns its name and lives
//! in the process-wide symbol map for the whole link. Resolution passes race to claim symbols;
//! each carries its own mutex so the races stay per-symbol rather than per-table.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Handle to an interned symbol: its slot in the global symbol map.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SymbolId(pub(crate) u32);

/// Index of a file in `Context::files`. Files are priority-ordered, so comparing the priorities
/// of two files is meaningful; comparing FileIds is not.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct FileId(pub(crate) u32);

pub(crate) struct Symbol<'data> {
    pub(crate) name: &'data [u8],

    /// The resolution state. Only resolution passes take this lock; once the resolution barrier
    /// has passed, readers take it uncontended or copy the core out.
    core: Mutex<SymbolCore>,

    /// Strictest visibility seen in any file that mentions this symbol. STV_* values; merged
    /// monotonically with a CAS loop.
    visibility: AtomicU8,

    /// Whether --wrap was requested for this name. Set before parsing starts, so plain data.
    pub(crate) wrap: bool,

    /// Slot in the output symbol table, assigned during output composition. `u32::MAX` means the
    /// symbol isn't written.
    pub(crate) aux_idx: AtomicU32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SymbolCore {
    /// The rank of the current definition: `(class << 24) + file_priority`, lower wins. See
    /// `rank()`. Storing the rank (rather than recomputing it from the owning file) keeps the
    /// critical section down to a load and a compare.
    pub(crate) rank: u64,
    pub(crate) file: Option<FileId>,
    pub(crate) origin: SymbolOrigin,
    /// Section offset, fragment addend, or absolute value depending on `origin`.
    pub(crate) value: u64,
    /// Index into the owning file's symbol table.
    pub(crate) sym_idx: u32,
    pub(crate) ver_idx: u16,
    pub(crate) is_lazy: bool,
    pub(crate) is_weak: bool,
    pub(crate) is_imported: bool,
    pub(crate) is_exported: bool,
    /// A definition synthesized by the linker itself (`__ehdr_start`, `__start_<sec>`, ...).
    /// Such symbols have no owning file.
    pub(crate) is_synthetic: bool,
}

/// Where a definition's value is anchored. A symbol defined inside a mergeable section keeps a
/// `Section` origin here; its fragment binding lives in the owning file's `sym_fragments` and is
/// consulted first by address computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SymbolOrigin {
    Absolute,
    Section(object::SectionIndex),
}

/// Definition classes, best first. The numeric values are the high bits of the rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DefinitionClass {
    Strong = 1,
    Weak = 2,
    DsoStrong = 3,
    DsoWeak = 4,
    Lazy = 5,
    Common = 6,
}

pub(crate) const RANK_UNCLAIMED: u64 = 7 << 24;

pub(crate) fn rank(class: DefinitionClass, file_priority: u32) -> u64 {
    ((class as u64) << 24) + u64::from(file_priority)
}

impl SymbolCore {
    pub(crate) fn unclaimed() -> Self {
        Self {
            rank: RANK_UNCLAIMED,
            file: None,
            origin: SymbolOrigin::Absolute,
            value: 0,
            sym_idx: 0,
            ver_idx: object::elf::VER_NDX_GLOBAL,
            is_lazy: false,
            is_weak: false,
            is_imported: false,
            is_exported: false,
            is_synthetic: false,
        }
    }
}

impl<'data> Symbol<'data> {
    pub(crate) fn new(name: &'data [u8], wrap: bool) -> Self {
        Self {
            name,
            core: Mutex::new(SymbolCore::unclaimed()),
            visibility: AtomicU8::new(object::elf::STV_DEFAULT),
            wrap,
            aux_idx: AtomicU32::new(u32::MAX),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SymbolCore> {
        self.core.lock().unwrap()
    }

    /// Copies the resolution state out. Cheap enough to use freely in post-resolution passes.
    pub(crate) fn core(&self) -> SymbolCore {
        *self.core.lock().unwrap()
    }

    pub(crate) fn visibility(&self) -> u8 {
        self.visibility.load(Ordering::Relaxed)
    }

    /// Merges in a visibility seen in some file. Stricter wins; STV_INTERNAL canonicalizes to
    /// STV_HIDDEN.
    pub(crate) fn merge_visibility(&self, mut visibility: u8) {
        if visibility == object::elf::STV_INTERNAL {
            visibility = object::elf::STV_HIDDEN;
        }

        fn strictness(visibility: u8) -> u8 {
            match visibility {
                object::elf::STV_HIDDEN => 1,
                object::elf::STV_PROTECTED => 2,
                _ => 3,
            }
        }

        let mut current = self.visibility.load(Ordering::Relaxed);
        while strictness(visibility) < strictness(current) {
            match self.visibility.compare_exchange_weak(
                current,
                visibility,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    pub(crate) fn display(&self, demangle: bool) -> SymbolDisplay<'_> {
        SymbolDisplay {
            name: self.name,
            demangle,
        }
    }
}

impl SymbolCore {
    pub(crate) fn is_defined(&self) -> bool {
        (self.file.is_some() || self.is_synthetic) && !self.is_lazy
    }
}

pub(crate) struct SymbolDisplay<'a> {
    name: &'a [u8],
    demangle: bool,
}

impl std::fmt::Display for SymbolDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.name) {
            Ok(name) if self.demangle => {
                std::fmt::Display::fmt(&symbolic_demangle::demangle(name), f)
            }
            Ok(name) => std::fmt::Display::fmt(name, f),
            Err(_) => write!(f, "{}", String::from_utf8_lossy(self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_ordering_matches_priority_table() {
        // Strong beats weak beats DSO beats lazy beats common; ties break by file priority.
        let strong_late = rank(DefinitionClass::Strong, 9);
        let strong_early = rank(DefinitionClass::Strong, 2);
        let weak_early = rank(DefinitionClass::Weak, 2);
        let dso = rank(DefinitionClass::DsoStrong, 2);
        let lazy = rank(DefinitionClass::Lazy, 2);
        let common = rank(DefinitionClass::Common, 2);

        assert!(strong_early < strong_late);
        assert!(strong_late < weak_early);
        assert!(weak_early < dso);
        assert!(dso < rank(DefinitionClass::DsoWeak, 2));
        assert!(rank(DefinitionClass::DsoWeak, 2) < lazy);
        assert!(lazy < common);
        assert!(common < RANK_UNCLAIMED);
    }

    #[test]
    fn visibility_merges_to_strictest() {
        let symbol = Symbol::new(b"sym", false);
        assert_eq!(symbol.visibility(), object::elf::STV_DEFAULT);
        symbol.merge_visibility(object::elf::STV_PROTECTED);
        assert_eq!(symbol.visibility(), object::elf::STV_PROTECTED);
        symbol.merge_visibility(object::elf::STV_DEFAULT);
        assert_eq!(symbol.visibility(), object::elf::STV_PROTECTED);
        symbol.merge_visibility(object::elf::STV_INTERNAL);
        assert_eq!(symbol.visibility(), object::elf::STV_HIDDEN);
    }
}
