//! Parsing of input files into the link's data model: sections, symbols, relocations, comdat
//! groups, mergeable pieces and exception-frame records. Every file parses independently, so this
//! whole module runs fully in parallel; the only shared state it touches is the concurrent maps
//! (symbols, comdat groups, merged-section registry).

use crate::comdat::ComdatGroup;
use crate::comdat::ComdatGroupId;
use crate::context::Context;
use crate::elf;
use crate::elf::SectionInfo;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::hash::hash_bytes;
use crate::input_data::InputBytes;
use crate::input_data::InputRef;
use crate::merge::FragmentId;
use crate::merge::MergeableSection;
use crate::output_section::OutputSectionId;
use crate::symbol::FileId;
use crate::symbol::SymbolId;
use anyhow::bail;
use linker_utils::elf::SectionType;
use linker_utils::elf::secnames;
use linker_utils::elf::shf;
use linker_utils::elf::sht;
use object::LittleEndian;
use object::read::elf::Rela as _;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub(crate) enum LinkFile<'data> {
    Object(Box<ObjectFile<'data>>),
    Dso(Box<SharedFile<'data>>),
    MachObject(Box<crate::macho::MachObjectFile<'data>>),
    MachDylib(Box<crate::macho::MachDylibFile<'data>>),
}

impl<'data> LinkFile<'data> {
    pub(crate) fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            LinkFile::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub(crate) fn as_dso(&self) -> Option<&SharedFile<'data>> {
        match self {
            LinkFile::Dso(dso) => Some(dso),
            _ => None,
        }
    }

    pub(crate) fn priority(&self) -> u32 {
        match self {
            LinkFile::Object(obj) => obj.priority,
            LinkFile::Dso(dso) => dso.priority,
            LinkFile::MachObject(obj) => obj.priority,
            LinkFile::MachDylib(dylib) => dylib.priority,
        }
    }

    pub(crate) fn file_id(&self) -> FileId {
        match self {
            LinkFile::Object(obj) => obj.file_id,
            LinkFile::Dso(dso) => dso.file_id,
            LinkFile::MachObject(obj) => obj.file_id,
            LinkFile::MachDylib(dylib) => dylib.file_id,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            LinkFile::Object(obj) => obj.is_alive(),
            LinkFile::Dso(dso) => dso.is_alive(),
            LinkFile::MachObject(obj) => obj.is_alive(),
            LinkFile::MachDylib(dylib) => dylib.is_alive(),
        }
    }

    pub(crate) fn mark_alive(&self) -> bool {
        match self {
            LinkFile::Object(obj) => !obj.is_alive.swap(true, Ordering::Relaxed),
            LinkFile::Dso(dso) => !dso.is_alive.swap(true, Ordering::Relaxed),
            LinkFile::MachObject(obj) => !obj.is_alive.swap(true, Ordering::Relaxed),
            LinkFile::MachDylib(dylib) => !dylib.is_alive.swap(true, Ordering::Relaxed),
        }
    }

    /// Whether the file is a dynamic library (of either family): its definitions are runtime
    /// imports, and undefined references never pull more files through it.
    pub(crate) fn is_dso(&self) -> bool {
        matches!(self, LinkFile::Dso(_) | LinkFile::MachDylib(_))
    }

    pub(crate) fn input(&self) -> InputRef<'data> {
        match self {
            LinkFile::Object(obj) => obj.input,
            LinkFile::Dso(dso) => dso.input,
            LinkFile::MachObject(obj) => obj.input,
            LinkFile::MachDylib(dylib) => dylib.input,
        }
    }
}

impl std::fmt::Display for LinkFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input(), f)
    }
}

/// Which symbol a symbol-table slot refers to: a file-local symbol or an interned global.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SymbolRef {
    Local(u32),
    Global(SymbolId),
}

#[derive(Debug)]
pub(crate) struct LocalSymbol<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) value: u64,
    pub(crate) section: Option<object::SectionIndex>,
    pub(crate) write_to_symtab: bool,
}

/// Fragment association for one symbol-table slot. Populated by `register_section_pieces` for
/// symbols defined inside mergeable sections.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct FragmentUse {
    pub(crate) fragment: Option<FragmentId>,
    pub(crate) addend: u64,
}

/// Fragment association for one relocation, for relocations whose symbol is a section symbol of a
/// mergeable section. Stored as a parallel array terminated by a sentinel with
/// `rel_idx == u32::MAX`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SectionFragmentRef {
    pub(crate) fragment: FragmentId,
    pub(crate) rel_idx: u32,
    pub(crate) addend: i64,
}

pub(crate) const REL_FRAGMENT_SENTINEL: u32 = u32::MAX;

#[derive(Default)]
pub(crate) struct BitVec {
    bits: Vec<u8>,
}

impl BitVec {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
        }
    }

    pub(crate) fn get(&self, index: usize) -> bool {
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    pub(crate) fn set(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }
}

pub(crate) struct InputSection<'data> {
    pub(crate) info: SectionInfo<'data>,
    pub(crate) contents: &'data [u8],
    pub(crate) index: object::SectionIndex,
    pub(crate) output_section: OutputSectionId,

    pub(crate) rels: &'data [elf::Rela],
    pub(crate) relsec_idx: Option<object::SectionIndex>,
    pub(crate) rel_fragments: Option<Box<[SectionFragmentRef]>>,
    pub(crate) needs_dynrel: BitVec,
    pub(crate) needs_baserel: BitVec,

    /// Offset within the output section, assigned during output composition. Atomic because the
    /// assigning pass iterates output sections, not files.
    pub(crate) offset: AtomicU64,

    pub(crate) is_alive: AtomicBool,
    pub(crate) is_visited: AtomicBool,
    pub(crate) is_ehframe: bool,

    /// Range of this section's FDEs within the owning file's `fdes`. Empty if none.
    pub(crate) fde_begin: u32,
    pub(crate) fde_end: u32,
}

impl<'data> InputSection<'data> {
    /// A section that exists only in the linker, e.g. the NOBITS section that a surviving common
    /// symbol is converted into.
    pub(crate) fn new_synthetic(info: SectionInfo<'data>, index: object::SectionIndex) -> Self {
        Self::new(info, &[], index)
    }

    fn new(info: SectionInfo<'data>, contents: &'data [u8], index: object::SectionIndex) -> Self {
        Self {
            info,
            contents,
            index,
            output_section: OutputSectionId::PLACEHOLDER,
            rels: &[],
            relsec_idx: None,
            rel_fragments: None,
            needs_dynrel: BitVec::default(),
            needs_baserel: BitVec::default(),
            offset: AtomicU64::new(0),
            is_alive: AtomicBool::new(true),
            is_visited: AtomicBool::new(false),
            is_ehframe: false,
            fde_begin: 0,
            fde_end: 0,
        }
    }

    pub(crate) fn name(&self) -> &'data [u8] {
        self.info.name
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn kill(&self) {
        self.is_alive.store(false, Ordering::Relaxed);
    }

    pub(crate) fn fdes(&self) -> std::ops::Range<usize> {
        self.fde_begin as usize..self.fde_end as usize
    }

    /// The fragment binding for a relocation, if the relocation was re-bound to a fragment of a
    /// mergeable section. `rel_fragments` is sorted by relocation index.
    pub(crate) fn rel_fragment(&self, rel_idx: u32) -> Option<&SectionFragmentRef> {
        let rel_fragments = self.rel_fragments.as_ref()?;
        let n = rel_fragments.len() - 1;
        rel_fragments[..n]
            .binary_search_by_key(&rel_idx, |r| r.rel_idx)
            .ok()
            .map(|i| &rel_fragments[i])
    }
}

pub(crate) struct ObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) is_in_lib: bool,
    pub(crate) exclude_libs: bool,

    pub(crate) elf: elf::File<'data>,
    pub(crate) sections: Vec<Option<InputSection<'data>>>,

    pub(crate) local_syms: Vec<LocalSymbol<'data>>,
    pub(crate) symbols: Vec<SymbolRef>,
    /// Version suffix (after '@') for each global that was defined with one.
    pub(crate) symvers: Vec<Option<&'data [u8]>>,
    pub(crate) sym_fragments: Vec<FragmentUse>,

    pub(crate) comdat_groups: Vec<(ComdatGroupId, &'data [object::U32Bytes<LittleEndian>])>,
    pub(crate) mergeable_sections: Vec<Option<MergeableSection<'data>>>,
    /// All fragments this file contributed, for the passes that mark fragments wholesale.
    pub(crate) fragments: Vec<FragmentId>,

    pub(crate) cies: Vec<crate::eh_frame::CieRecord>,
    pub(crate) fdes: Vec<crate::eh_frame::FdeRecord>,

    /// Accumulated GNU_PROPERTY_X86_FEATURE_1_AND bits from .note.gnu.property.
    pub(crate) features: u32,
    pub(crate) has_common_symbol: bool,
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn first_global(&self) -> usize {
        self.elf.first_global
    }

    pub(crate) fn section(&self, index: object::SectionIndex) -> Option<&InputSection<'data>> {
        self.sections.get(index.0)?.as_ref()
    }

    /// Layout priority of a section: file priority then section index, so sorting by it groups a
    /// file's sections in their original order.
    pub(crate) fn section_priority(&self, index: object::SectionIndex) -> u64 {
        (u64::from(self.priority) << 32) | index.0 as u64
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    /// The section or fragment a symbol-table slot ultimately refers to, following resolution for
    /// globals. This is what both the GC and relocation application traverse.
    pub(crate) fn symbol_target(&self, ctx: &Context<'data>, sym_idx: usize) -> SymTarget {
        match self.symbols[sym_idx] {
            SymbolRef::Local(local) => {
                if let Some(fragment) = self.sym_fragments[sym_idx].fragment {
                    return SymTarget::Fragment(fragment);
                }
                match self.local_syms[local as usize].section {
                    Some(section) => SymTarget::Section(self.file_id, section),
                    None => SymTarget::None,
                }
            }
            SymbolRef::Global(id) => global_symbol_target(ctx, id),
        }
    }
}

/// Resolves a global symbol to the section or fragment its chosen definition lives in.
pub(crate) fn global_symbol_target<'data>(ctx: &Context<'data>, id: SymbolId) -> SymTarget {
    let core = ctx.symbol(id).core();
    let Some(file_id) = core.file else {
        return SymTarget::None;
    };
    if let LinkFile::Object(owner) = ctx.file(file_id) {
        if let Some(fragment) = owner
            .sym_fragments
            .get(core.sym_idx as usize)
            .and_then(|f| f.fragment)
        {
            return SymTarget::Fragment(fragment);
        }
    }
    match core.origin {
        crate::symbol::SymbolOrigin::Section(section) => SymTarget::Section(file_id, section),
        crate::symbol::SymbolOrigin::Absolute => SymTarget::None,
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum SymTarget {
    None,
    Section(FileId, object::SectionIndex),
    Fragment(FragmentId),
}

/// A reference to one input section of one file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SectionRef {
    pub(crate) file: FileId,
    pub(crate) index: object::SectionIndex,
}

impl std::fmt::Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}

/// Parses a relocatable object. `file_id` is assigned afterwards when the file list is built.
pub(crate) fn parse_object<'data>(
    ctx: &Context<'data>,
    input: &InputBytes<'data>,
) -> Result<Box<ObjectFile<'data>>> {
    let elf = elf::File::parse(input.data, false)
        .with_context(|| format!("failed to parse object file `{}`", input.input))?;

    if elf.arch != ctx.args.arch {
        bail!(
            "`{}` has incompatible architecture {}, expecting {}",
            input.input,
            elf.arch,
            ctx.args.arch
        );
    }

    let mut obj = Box::new(ObjectFile {
        input: input.input,
        file_id: FileId(0),
        priority: input.priority,
        is_alive: AtomicBool::new(!input.is_in_lib),
        is_in_lib: input.is_in_lib,
        exclude_libs: false,
        elf,
        sections: Vec::new(),
        local_syms: Vec::new(),
        symbols: Vec::new(),
        symvers: Vec::new(),
        sym_fragments: Vec::new(),
        comdat_groups: Vec::new(),
        mergeable_sections: Vec::new(),
        fragments: Vec::new(),
        cies: Vec::new(),
        fdes: Vec::new(),
        features: 0,
        has_common_symbol: false,
    });

    initialize_sections(ctx, &mut obj)?;
    attach_relocations(&mut obj)?;
    initialize_symbols(ctx, &mut obj)?;
    initialize_mergeable_sections(ctx, &mut obj)?;
    crate::eh_frame::initialize_ehframe_sections(&mut obj)
        .with_context(|| format!("malformed .eh_frame in `{}`", input.input))?;

    Ok(obj)
}

fn initialize_sections<'data>(ctx: &Context<'data>, obj: &mut ObjectFile<'data>) -> Result {
    let e = LittleEndian;
    let num_sections = obj.elf.sections.len();
    obj.sections = (0..num_sections).map(|_| None).collect();
    let member = ctx.herd.get();

    for index in 0..num_sections {
        let index = object::SectionIndex(index);
        let header = obj.elf.section(index)?;
        let mut info = obj.elf.section_info(header)?;

        if info.sh_flags.contains(shf::EXCLUDE) && !info.sh_flags.contains(shf::ALLOC) {
            continue;
        }

        match info.sh_type {
            sht::GROUP => {
                // The group's signature is the name of the symbol named by sh_info.
                let signature_sym = obj
                    .elf
                    .symbol(object::SymbolIndex(header.sh_info.get(e) as usize))
                    .context("invalid comdat signature symbol index")?;
                let signature = obj.elf.symbol_name(signature_sym)?;

                let data = header
                    .data(e, obj.elf.data)
                    .map_err(|_| anyhow::anyhow!("SHT_GROUP section extends past end of file"))?;
                let entries: &[object::U32Bytes<LittleEndian>] =
                    object::pod::slice_from_all_bytes(data)
                        .map_err(|()| anyhow::anyhow!("incorrectly sized SHT_GROUP section"))?;
                let Some((first, members)) = entries.split_first() else {
                    bail!("empty SHT_GROUP section");
                };
                match first.get(e) {
                    0 => continue,
                    object::elf::GRP_COMDAT => {}
                    other => bail!("unsupported SHT_GROUP format {other}"),
                }

                let (slot, _) = ctx
                    .comdat_groups
                    .intern(signature, hash_bytes(signature), ComdatGroup::new);
                obj.comdat_groups.push((ComdatGroupId(slot), members));
            }
            sht::SYMTAB | sht::STRTAB | sht::REL | sht::RELA | sht::NULL | sht::SYMTAB_SHNDX => {}
            _ => {
                if info.name == secnames::NOTE_GNU_STACK
                    || info.name.starts_with(secnames::GNU_WARNING_PREFIX)
                {
                    continue;
                }
                if info.name.starts_with(secnames::GNU_LTO_PREFIX) {
                    bail!("`{}` contains GCC intermediate code; LTO objects are not supported", obj.input);
                }
                if info.name == secnames::NOTE_GNU_PROPERTY {
                    let features = read_note_gnu_property(obj, header)?;
                    obj.features |= features;
                    continue;
                }
                if ctx.args.strip_debug() && elf::is_debug_section(&info) {
                    continue;
                }

                let contents = obj.elf.section_data(header, &mut info, &member)?;
                let mut section = InputSection::new(info, contents, index);
                section.output_section = ctx.output_sections.get_or_create(
                    output_section_name(info.name),
                    info.sh_type,
                    info.sh_flags,
                );
                obj.sections[index.0] = Some(section);
            }
        }
    }

    Ok(())
}

/// Attaches each relocation section to its target by sh_info.
fn attach_relocations(obj: &mut ObjectFile) -> Result {
    let e = LittleEndian;
    for (index, header) in obj.elf.sections.iter().enumerate() {
        let sh_type = SectionType(header.sh_type.get(e));
        if sh_type == sht::REL {
            bail!("REL-format relocations are not supported for this architecture");
        }
        if sh_type != sht::RELA {
            continue;
        }

        let target_index = header.sh_info.get(e) as usize;
        if target_index >= obj.sections.len() {
            bail!("invalid relocated section index {target_index}");
        }
        let rels = obj.elf.relocations(header)?;
        if let Some(target) = &mut obj.sections[target_index] {
            debug_assert!(target.relsec_idx.is_none());
            target.relsec_idx = Some(object::SectionIndex(index));
            target.rels = rels;
            if target.info.sh_flags.contains(shf::ALLOC) {
                target.needs_dynrel = BitVec::with_len(rels.len());
                target.needs_baserel = BitVec::with_len(rels.len());
            }
        }
    }
    Ok(())
}

fn initialize_symbols<'data>(ctx: &Context<'data>, obj: &mut ObjectFile<'data>) -> Result {
    let e = LittleEndian;
    let num_syms = obj.elf.symbols.len();
    let first_global = obj.first_global().min(num_syms);

    obj.local_syms = Vec::with_capacity(first_global);
    obj.symbols = Vec::with_capacity(num_syms);
    obj.symvers = vec![None; num_syms.saturating_sub(first_global)];
    obj.sym_fragments = vec![FragmentUse::default(); num_syms];

    for index in 0..num_syms {
        let sym_index = object::SymbolIndex(index);
        let esym = obj.elf.symbol(sym_index)?;

        if index < first_global {
            let mut name = obj.elf.symbol_name(esym)?;
            let section = if esym.is_absolute(e) {
                if esym.is_common(e) {
                    bail!("common local symbol in `{}`", obj.input);
                }
                None
            } else {
                obj.elf.symbol_section(esym, sym_index)?
            };
            if name.is_empty() && esym.st_type() == object::elf::STT_SECTION {
                if let Some(section) = section.and_then(|s| obj.section(s)) {
                    name = section.name();
                }
            }

            let write_to_symtab = should_write_to_local_symtab(ctx, obj, name, esym, section);
            obj.local_syms.push(LocalSymbol {
                name,
                value: esym.st_value.get(e),
                section,
                write_to_symtab,
            });
            obj.symbols.push(SymbolRef::Local(index as u32));
            continue;
        }

        // Global: split a version suffix off the name. `foo@ver` is a non-default versioned
        // symbol and keeps the version in its interning key; `foo@@ver` is the default version
        // and is reachable by the bare name. The recorded version keeps its leading '@' for the
        // default case so the version-assignment pass can tell the two apart.
        let raw_name = obj.elf.symbol_name(esym)?;
        let mut key = raw_name;
        let mut name = raw_name;
        if let Some(at) = memchr::memchr(b'@', raw_name) {
            let version = &raw_name[at + 1..];
            name = &raw_name[..at];
            if !version.is_empty() && version != b"@" {
                if version.starts_with(b"@") {
                    key = name;
                }
                if esym.is_definition(e) {
                    obj.symvers[index - first_global] = Some(version);
                }
            } else {
                key = name;
            }
        }

        let symbol_id = insert_symbol(ctx, esym.is_undefined(e), key, name);
        obj.symbols.push(SymbolRef::Global(symbol_id));
        if esym.is_common(e) {
            obj.has_common_symbol = true;
        }
    }

    Ok(())
}

/// Returns the symbol for a given interning key, applying the --wrap rewrites: an undefined
/// reference to `__real_X` becomes `X`, and an undefined reference to a wrapped `X` becomes
/// `__wrap_X`.
fn insert_symbol<'data>(
    ctx: &Context<'data>,
    is_undefined: bool,
    key: &'data [u8],
    name: &[u8],
) -> SymbolId {
    if is_undefined {
        if let Some(real) = name.strip_prefix(b"__real_") {
            if ctx.args.wrap.iter().any(|w| w.as_bytes() == real) {
                let stripped = &key[b"__real_".len()..];
                return ctx.intern(stripped);
            }
        }
    }

    let symbol_id = ctx.intern(key);

    if is_undefined && ctx.symbol(symbol_id).wrap {
        let wrapped = ctx.save_bytes(&[b"__wrap_", key]);
        return ctx.intern(wrapped);
    }
    symbol_id
}

fn should_write_to_local_symtab(
    ctx: &Context,
    obj: &ObjectFile,
    name: &[u8],
    esym: &elf::SymtabEntry,
    section: Option<object::SectionIndex>,
) -> bool {
    if ctx.args.discard_all || ctx.args.strip_all || ctx.args.retain_symbols_file.is_some() {
        return false;
    }
    if esym.st_type() == object::elf::STT_SECTION {
        return false;
    }
    // Compiler-generated locals are dropped with --discard-locals, and always when they live in a
    // mergeable section, where merging makes their origin meaningless.
    if name.starts_with(b".L") {
        if ctx.args.discard_locals {
            return false;
        }
        if let Some(section) = section.and_then(|s| obj.section(s)) {
            if section.info.sh_flags.contains(shf::MERGE) {
                return false;
            }
        }
    }
    true
}

fn initialize_mergeable_sections<'data>(ctx: &Context<'data>, obj: &mut ObjectFile<'data>) -> Result {
    obj.mergeable_sections = (0..obj.sections.len()).map(|_| None).collect();

    for index in 0..obj.sections.len() {
        let Some(section) = &obj.sections[index] else {
            continue;
        };
        if !section.is_alive()
            || !section.info.sh_flags.contains(shf::MERGE)
            || section.info.sh_size == 0
            || section.info.sh_entsize == 0
        {
            continue;
        }
        if !section.rels.is_empty() {
            bail!(
                "`{}`: mergeable section `{}` has relocations, which is not supported",
                obj.input,
                String::from_utf8_lossy(section.name())
            );
        }

        let parent = ctx.merged_registry.get_or_create(
            output_section_name(section.name()),
            section.info.sh_type,
            section.info.sh_flags,
        );
        let mergeable = crate::merge::split_section(
            section.contents,
            section.info.sh_entsize,
            section.info.sh_addralign,
            section.info.sh_flags.contains(shf::STRINGS),
            parent,
        )
        .with_context(|| {
            format!(
                "`{}`: failed to split section `{}`",
                obj.input,
                String::from_utf8_lossy(section.name())
            )
        })?;

        ctx.merged_registry.add_piece_estimate(parent, mergeable.pieces.len());
        obj.mergeable_sections[index] = Some(mergeable);
        // The section's contents now flow through the fragment table.
        section.kill();
    }

    Ok(())
}

/// Interns this file's pieces into the fragment tables and builds the fragment re-binding arrays:
/// `rel_fragments` for relocations through section symbols and `sym_fragments` for symbols
/// defined inside mergeable sections. Runs after all files are split (the tables need sizing).
pub(crate) fn register_section_pieces<'data>(
    merged_sections: &[crate::merge::MergedSection<'data>],
    obj: &mut ObjectFile<'data>,
) -> Result {
    let e = LittleEndian;

    for mergeable in obj.mergeable_sections.iter_mut().flatten() {
        let merged = &merged_sections[mergeable.parent.0 as usize];
        mergeable.fragments.reserve(mergeable.pieces.len());
        for (piece, hash) in mergeable.pieces.iter().zip(&mergeable.hashes) {
            let slot = merged.insert(piece, *hash, mergeable.alignment);
            mergeable.fragments.push(FragmentId {
                section: mergeable.parent,
                slot,
            });
        }
        obj.fragments.extend_from_slice(&mergeable.fragments);
    }

    // rel_fragments: relocations whose symbol is a section symbol of a mergeable section bind to
    // a specific fragment plus delta.
    for section_index in 0..obj.sections.len() {
        let Some(section) = &obj.sections[section_index] else {
            continue;
        };
        if !section.is_alive() || section.rels.is_empty() {
            continue;
        }

        let mut refs = Vec::new();
        for (rel_idx, rel) in section.rels.iter().enumerate() {
            let sym_idx = rel.r_sym(e, false) as usize;
            let esym = obj.elf.symbol(object::SymbolIndex(sym_idx))?;
            if esym.st_type() != object::elf::STT_SECTION {
                continue;
            }
            let Some(target) = obj.elf.symbol_section(esym, object::SymbolIndex(sym_idx))? else {
                continue;
            };
            let Some(mergeable) = &obj.mergeable_sections[target.0] else {
                continue;
            };

            let offset = esym.st_value.get(e).wrapping_add(rel.r_addend.get(e) as u64);
            let (fragment, delta) = mergeable
                .fragment_at(offset)
                .with_context(|| format!("`{}`: bad relocation {rel_idx}", obj.input))?;
            refs.push(SectionFragmentRef {
                fragment,
                rel_idx: rel_idx as u32,
                addend: delta as i64,
            });
        }

        if !refs.is_empty() {
            refs.push(SectionFragmentRef {
                fragment: FragmentId {
                    section: crate::merge::MergedSectionId(0),
                    slot: 0,
                },
                rel_idx: REL_FRAGMENT_SENTINEL,
                addend: 0,
            });
            // We just checked the section exists; re-borrow mutably to store.
            obj.sections[section_index].as_mut().unwrap().rel_fragments =
                Some(refs.into_boxed_slice());
        }
    }

    // sym_fragments: symbols defined inside mergeable sections.
    for index in 0..obj.symbols.len() {
        let sym_index = object::SymbolIndex(index);
        let esym = obj.elf.symbol(sym_index)?;
        if esym.is_absolute(e) || esym.is_common(e) || esym.is_undefined(e) {
            continue;
        }
        let Some(section) = obj.elf.symbol_section(esym, sym_index)? else {
            continue;
        };
        let Some(mergeable) = &obj.mergeable_sections[section.0] else {
            continue;
        };

        let value = esym.st_value.get(e);
        let (fragment, addend) = mergeable
            .fragment_at(value)
            .with_context(|| format!("`{}`: bad symbol value {value:#x}", obj.input))?;
        if let SymbolRef::Local(local) = obj.symbols[index] {
            obj.local_syms[local as usize].value = addend;
        }
        obj.sym_fragments[index] = FragmentUse {
            fragment: Some(fragment),
            addend,
        };
    }

    Ok(())
}

fn read_note_gnu_property(obj: &ObjectFile, header: &elf::SectionHeader) -> Result<u32> {
    let e = LittleEndian;
    let mut data = header
        .data(e, obj.elf.data)
        .map_err(|_| anyhow::anyhow!(".note.gnu.property extends past end of file"))?;
    let mut features = 0;

    while data.len() >= 12 {
        let namesz = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let descsz = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        let n_type = u32::from_le_bytes(data[8..12].try_into().unwrap());
        data = &data[12..];

        let name = data.get(..namesz.saturating_sub(1)).unwrap_or_default();
        data = data.get(namesz.next_multiple_of(4)..).context("truncated note")?;
        let mut desc = data.get(..descsz).context("truncated note")?;
        data = data.get(descsz.next_multiple_of(8)..).unwrap_or_default();

        if n_type != object::elf::NT_GNU_PROPERTY_TYPE_0 || name != b"GNU" {
            continue;
        }
        while desc.len() >= 8 {
            let prop_type = u32::from_le_bytes(desc[0..4].try_into().unwrap());
            let prop_size = u32::from_le_bytes(desc[4..8].try_into().unwrap()) as usize;
            desc = &desc[8..];
            if prop_type == object::elf::GNU_PROPERTY_X86_FEATURE_1_AND && prop_size >= 4 {
                features |= u32::from_le_bytes(desc[0..4].try_into().unwrap());
            }
            desc = desc.get(prop_size.next_multiple_of(8)..).unwrap_or_default();
        }
    }
    Ok(features)
}

/// Maps an input section name to its output section name, e.g. `.text.foo` lands in `.text`.
pub(crate) fn output_section_name(name: &[u8]) -> &[u8] {
    const PREFIXES: &[&[u8]] = &[
        b".text",
        b".data.rel.ro",
        b".data",
        b".rodata",
        b".bss.rel.ro",
        b".bss",
        b".init_array",
        b".fini_array",
        b".preinit_array",
        b".tdata",
        b".tbss",
        b".gcc_except_table",
        b".ctors",
        b".dtors",
    ];
    for prefix in PREFIXES {
        if name == *prefix {
            return prefix;
        }
        if name.starts_with(prefix) && name.get(prefix.len()) == Some(&b'.') {
            return prefix;
        }
    }
    name
}

pub(crate) struct SharedFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) soname: &'data [u8],

    pub(crate) elf: elf::File<'data>,

    /// Every global the dynsym mentions, defined or not. Undefined entries drive DSO-to-DSO
    /// liveness.
    pub(crate) globals: Vec<SymbolId>,

    /// Defined, exportable symbols, parallel with `defined_syms` and `versyms`.
    pub(crate) symbols: Vec<SymbolId>,
    pub(crate) defined_syms: Vec<object::SymbolIndex>,
    pub(crate) versyms: Vec<u16>,
}

impl<'data> SharedFile<'data> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

impl std::fmt::Display for SharedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}

pub(crate) fn parse_shared<'data>(
    ctx: &Context<'data>,
    input: &InputBytes<'data>,
) -> Result<Box<SharedFile<'data>>> {
    let e = LittleEndian;
    let elf = elf::File::parse(input.data, true)
        .with_context(|| format!("failed to parse shared object `{}`", input.input))?;

    if elf.arch != ctx.args.arch {
        bail!(
            "`{}` has incompatible architecture {}, expecting {}",
            input.input,
            elf.arch,
            ctx.args.arch
        );
    }

    let soname = soname(&elf, input)?;
    let version_strings = read_verdef(&elf)?;

    let mut dso = Box::new(SharedFile {
        input: input.input,
        file_id: FileId(0),
        priority: input.priority,
        is_alive: AtomicBool::new(!input.modifiers.as_needed),
        soname,
        elf,
        globals: Vec::new(),
        symbols: Vec::new(),
        defined_syms: Vec::new(),
        versyms: Vec::new(),
    });

    let num_syms = dso.elf.symbols.len();
    for index in dso.elf.first_global..num_syms {
        let sym_index = object::SymbolIndex(index);
        let esym = dso.elf.symbol(sym_index)?;
        let name = dso.elf.symbol_name(esym)?;

        dso.globals.push(ctx.intern(name));
        if esym.is_undefined(e) || elf::is_hidden_symbol(esym) {
            continue;
        }

        let versym = dso
            .elf
            .versym
            .get(index)
            .map_or(object::elf::VER_NDX_GLOBAL, |v| v.0.get(e));
        let version = versym & object::elf::VERSYM_VERSION;
        if version == object::elf::VER_NDX_LOCAL {
            continue;
        }

        // A hidden versioned symbol is only reachable with an explicit `name@version`.
        let symbol_id = if versym & object::elf::VERSYM_HIDDEN != 0 {
            let version_name = version_strings
                .get(version as usize)
                .copied()
                .flatten()
                .unwrap_or(b"");
            ctx.intern(ctx.save_bytes(&[name, b"@", version_name]))
        } else {
            ctx.intern(name)
        };

        dso.symbols.push(symbol_id);
        dso.defined_syms.push(sym_index);
        dso.versyms.push(version);
    }

    Ok(dso)
}

fn soname<'data>(elf: &elf::File<'data>, input: &InputBytes<'data>) -> Result<&'data [u8]> {
    let e = LittleEndian;
    if let Some(tags) = elf.dynamic_tags()? {
        for tag in tags {
            if tag.d_tag.get(e) == u64::from(object::elf::DT_SONAME) {
                if let Ok(name) = elf.symbols.strings().get(tag.d_val.get(e) as u32) {
                    return Ok(name);
                }
            }
        }
    }
    Ok(input
        .input
        .path
        .file_name()
        .map(|n| n.as_encoded_bytes())
        .unwrap_or_default())
}

/// Reads the version-definition table of a DSO: index -> version name.
fn read_verdef<'data>(elf: &elf::File<'data>) -> Result<Vec<Option<&'data [u8]>>> {
    let e = LittleEndian;
    let mut names: Vec<Option<&[u8]>> = Vec::new();

    if let Some((verdefs, string_table_index)) = &elf.verdef {
        let strings = elf.sections.strings(e, elf.data, *string_table_index)?;
        for result in verdefs.clone() {
            let (verdef, mut aux_iterator) = result?;
            // Every VERDEF carries at least one AUX entry naming the version.
            let aux = aux_iterator
                .next()?
                .context("VERDEF with no AUX entry")?;
            let index = verdef.vd_ndx.get(e) as usize;
            if names.len() <= index {
                names.resize(index + 1, None);
            }
            names[index] = Some(aux.name(e, strings)?);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names_collapse_dot_suffixes() {
        assert_eq!(output_section_name(b".text.hot.main"), b".text");
        assert_eq!(output_section_name(b".data.rel.ro.local"), b".data.rel.ro");
        assert_eq!(output_section_name(b".rodata.str1.1"), b".rodata");
        assert_eq!(output_section_name(b".textual"), b".textual");
        assert_eq!(output_section_name(b"my_custom"), b"my_custom");
    }

    #[test]
    fn bitvec() {
        let mut bits = BitVec::with_len(20);
        assert!(!bits.get(13));
        bits.set(13);
        assert!(bits.get(13));
        assert!(!bits.get(12));
    }
}
