//! The linking context: every piece of state shared across pipeline stages lives here and is
//! passed explicitly, so there are no global mutable statics. Concurrency discipline: the global
//! maps are concurrent tables, per-file state is only written by passes that hold `&mut` or by
//! the file's own parse task, and everything else is atomics.

use crate::args::Args;
use crate::comdat::ComdatGroup;
use crate::error::Result;
use crate::hash::hash_bytes;
use crate::intern::ConcurrentMap;
use crate::merge::MergedSection;
use crate::merge::MergedSectionRegistry;
use crate::object_file::LinkFile;
use crate::object_file::ObjectFile;
use crate::object_file::SharedFile;
use crate::output_section::OutputSections;
use crate::symbol::FileId;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use anyhow::bail;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::fmt::Display;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub(crate) struct Context<'data> {
    pub(crate) args: &'data Args,
    pub(crate) herd: &'data bumpalo_herd::Herd,

    pub(crate) symbols: ConcurrentMap<'data, Symbol<'data>>,
    pub(crate) comdat_groups: ConcurrentMap<'data, ComdatGroup>,

    pub(crate) merged_registry: MergedSectionRegistry<'data>,
    pub(crate) merged: Vec<MergedSection<'data>>,

    pub(crate) output_sections: OutputSections<'data>,

    pub(crate) files: Vec<LinkFile<'data>>,

    /// Linker-defined symbols (`__ehdr_start`, `__start_<sec>`, ...), in definition order.
    pub(crate) synthetic_symbols: Vec<SymbolId>,

    /// Count of reported (non-fatal) errors. Checked at stage checkpoints.
    pub(crate) error_count: AtomicUsize,
}

impl<'data> Context<'data> {
    pub(crate) fn new(
        args: &'data Args,
        herd: &'data bumpalo_herd::Herd,
        num_global_symbols: usize,
        num_comdat_groups: usize,
    ) -> Self {
        Self {
            args,
            herd,
            symbols: ConcurrentMap::with_capacity(num_global_symbols * 2),
            comdat_groups: ConcurrentMap::with_capacity(num_comdat_groups * 2),
            merged_registry: MergedSectionRegistry::default(),
            merged: Vec::new(),
            output_sections: OutputSections::new(),
            files: Vec::new(),
            synthetic_symbols: Vec::new(),
            error_count: AtomicUsize::new(0),
        }
    }

    /// Returns the symbol with the given name, creating an unclaimed one if needed.
    pub(crate) fn intern(&self, name: &'data [u8]) -> SymbolId {
        let (slot, _) = self
            .symbols
            .intern(name, hash_bytes(name), || Symbol::new(name, false));
        SymbolId(slot)
    }

    /// Interns `name` with the wrap flag set. Must be called before parsing starts so that every
    /// later intern of the same name observes the flag.
    pub(crate) fn intern_wrapped(&self, name: &'data [u8]) -> SymbolId {
        let (slot, _) = self
            .symbols
            .intern(name, hash_bytes(name), || Symbol::new(name, true));
        SymbolId(slot)
    }

    pub(crate) fn lookup(&self, name: &[u8]) -> Option<SymbolId> {
        self.symbols
            .get(name, hash_bytes(name))
            .map(|(slot, _)| SymbolId(slot))
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        self.symbols.value(id.0)
    }

    pub(crate) fn file(&self, id: FileId) -> &LinkFile<'data> {
        &self.files[id.0 as usize]
    }

    pub(crate) fn object(&self, id: FileId) -> &ObjectFile<'data> {
        match self.file(id) {
            LinkFile::Object(obj) => obj,
            _ => panic!("file {id:?} is not an ELF relocatable object"),
        }
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = &ObjectFile<'data>> {
        self.files.iter().filter_map(LinkFile::as_object)
    }

    pub(crate) fn dsos(&self) -> impl Iterator<Item = &SharedFile<'data>> {
        self.files.iter().filter_map(LinkFile::as_dso)
    }

    /// Runs `f` over every input file in parallel. Aliveness is deliberately not filtered:
    /// several passes (lazy resolution in particular) work on not-yet-loaded archive members.
    pub(crate) fn for_each_file(&self, f: impl Fn(&LinkFile<'data>) + Sync + Send) {
        self.files.par_iter().for_each(f);
    }

    /// Runs `f` over every ELF relocatable object in parallel.
    pub(crate) fn for_each_object(&self, f: impl Fn(&ObjectFile<'data>) + Sync) {
        self.files.par_iter().for_each(|file| {
            if let LinkFile::Object(obj) = file {
                f(obj);
            }
        });
    }

    /// Runs `f` over every Mach-O relocatable object in parallel.
    pub(crate) fn for_each_mach_object(
        &self,
        f: impl Fn(&crate::macho::MachObjectFile<'data>) + Sync,
    ) {
        self.files.par_iter().for_each(|file| {
            if let LinkFile::MachObject(obj) = file {
                f(obj);
            }
        });
    }

    /// Whether any input is Mach-O. Such links stop at the image-writing seam: parsing and
    /// resolution run on the shared model, emission belongs to the darwin output layer.
    pub(crate) fn has_macho_inputs(&self) -> bool {
        self.files
            .iter()
            .any(|file| matches!(file, LinkFile::MachObject(_) | LinkFile::MachDylib(_)))
    }

    pub(crate) fn for_each_dso(&self, f: impl Fn(&SharedFile<'data>) + Sync) {
        self.files.par_iter().for_each(|file| {
            if let LinkFile::Dso(dso) = file {
                f(dso);
            }
        });
    }

    pub(crate) fn input_section(
        &self,
        section_ref: crate::object_file::SectionRef,
    ) -> Option<&crate::object_file::InputSection<'data>> {
        self.file(section_ref.file)
            .as_object()
            .and_then(|obj| obj.section(section_ref.index))
    }

    pub(crate) fn merged_section(&self, id: crate::merge::MergedSectionId) -> &MergedSection<'data> {
        &self.merged[id.0 as usize]
    }

    pub(crate) fn fragment(&self, id: crate::merge::FragmentId) -> &crate::merge::SectionFragment {
        self.merged_section(id.section).fragment(id.slot)
    }

    /// Copies `bytes` into the long-lived arena. For strings the linker synthesizes itself, e.g.
    /// `__wrap_` names and `__start_`/`__stop_` names.
    pub(crate) fn save_bytes(&self, parts: &[&[u8]]) -> &'data [u8] {
        let member = self.herd.get();
        let total = parts.iter().map(|p| p.len()).sum();
        let out = member.alloc_slice_fill_default::<u8>(total);
        let mut offset = 0;
        for part in parts {
            out[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        out
    }

    /// Records a semantic error. We keep going so that one invocation reports as many problems
    /// as possible; the next `checkpoint` turns them into a failure.
    pub(crate) fn error(&self, message: impl Display) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        eprintln!("weld: error: {message}");
    }

    pub(crate) fn warn(&self, message: impl Display) {
        if self.args.fatal_warnings {
            self.error(message);
        } else {
            crate::error::warning(&message);
        }
    }

    pub(crate) fn checkpoint(&self) -> Result {
        let count = self.error_count.load(Ordering::Relaxed);
        if count > 0 {
            bail!("link failed with {count} error(s)");
        }
        Ok(())
    }
}
