//! Mach-O input handling, the second object-file family. Mach-O has no section-per-function
//! convention; instead each section is split into subsections at symbol boundaries, and the
//! subsection plays the role an input section plays for ELF. Unwind information comes as fixed
//! 32-byte `__compact_unwind` records rather than `.eh_frame` bytes, with relocations at fixed
//! field offsets.
//!
//! Symbols are interned into the same process-wide table the ELF side uses and resolved with the
//! same rank arithmetic, so archives mixing both families behave consistently. What stays outside
//! this crate is Mach-O byte emission (and the TBD text-stub format): the driver runs these files
//! through parsing and resolution, then hands off at the image-writing seam.

use object::read::macho::Segment as _;

use crate::arch::Architecture;
use crate::context::Context;
use crate::error::Context as _;
use crate::error::Result;
use crate::input_data::InputBytes;
use crate::input_data::InputRef;
use crate::symbol::DefinitionClass;
use crate::symbol::FileId;
use crate::symbol::SymbolCore;
use crate::symbol::SymbolId;
use crate::symbol::SymbolOrigin;
use crate::symbol::rank;
use anyhow::bail;
use object::LittleEndian;
use object::macho;
use object::read::macho::MachHeader as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

type MachHeader = macho::MachHeader64<LittleEndian>;
type MachSection = macho::Section64<LittleEndian>;
type MachSym = macho::Nlist64<LittleEndian>;
type SymtabCommand = macho::SymtabCommand<LittleEndian>;
type DylibCommand = macho::DylibCommand<LittleEndian>;
type LinkeditDataCommand = macho::LinkeditDataCommand<LittleEndian>;
type DyldInfoCommand = macho::DyldInfoCommand<LittleEndian>;
type MachRel = macho::Relocation<LittleEndian>;

/// N_ALT_ENTRY in n_desc: the symbol marks an alternate entry point rather than the start of a
/// new subsection.
const N_ALT_ENTRY: u16 = 0x0200;

/// N_WEAK_REF in n_desc: the reference may legitimately stay unresolved.
const N_WEAK_REF: u16 = 0x0040;

/// The fixed layout of one `__compact_unwind` record.
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct CompactUnwindEntry {
    pub(crate) code_start: u64,
    pub(crate) code_len: u32,
    pub(crate) encoding: u32,
    pub(crate) personality: u64,
    pub(crate) lsda: u64,
}

// SAFETY: `#[repr(C)]` struct of plain integers with no padding (see `_ASSERTS` below).
unsafe impl object::Pod for CompactUnwindEntry {}

const _ASSERTS: () = {
    assert!(size_of::<CompactUnwindEntry>() == 32);
    assert!(std::mem::offset_of!(CompactUnwindEntry, personality) == 16);
    assert!(std::mem::offset_of!(CompactUnwindEntry, lsda) == 24);
};

/// One region of a section, delimited by the symbols defined inside the section.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Subsection {
    pub(crate) section: u32,
    pub(crate) input_offset: u32,
    pub(crate) input_size: u32,
    pub(crate) input_addr: u32,
    pub(crate) p2align: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UnwindRecord {
    pub(crate) subsec: Option<u32>,
    pub(crate) offset: u32,
    pub(crate) code_len: u32,
    pub(crate) encoding: u32,
    pub(crate) personality: Option<SymbolId>,
    pub(crate) lsda: Option<u32>,
    pub(crate) lsda_offset: u32,
}

pub(crate) struct MachSectionInfo<'data> {
    pub(crate) segname: &'data [u8],
    pub(crate) sectname: &'data [u8],
    pub(crate) addr: u64,
    pub(crate) size: u64,
    pub(crate) p2align: u8,
    pub(crate) contents: &'data [u8],
}

pub(crate) struct MachObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) is_in_lib: bool,
    data: &'data [u8],

    pub(crate) sections: Vec<Option<MachSectionInfo<'data>>>,
    pub(crate) subsections: Vec<Subsection>,
    /// Subsection of each symbol-table slot, for N_SECT symbols.
    pub(crate) sym_to_subsec: Vec<Option<u32>>,

    mach_syms: Vec<MachSym>,
    /// Interned global for each symbol-table slot; None for non-extern (local) symbols.
    pub(crate) symbols: Vec<Option<SymbolId>>,

    pub(crate) unwind_records: Vec<UnwindRecord>,
    pub(crate) data_in_code: &'data [macho::DataInCodeEntry<LittleEndian>],
}

impl std::fmt::Display for MachObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}

impl<'data> MachObjectFile<'data> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn parse(
        ctx: &Context<'data>,
        input: &InputBytes<'data>,
    ) -> Result<Box<MachObjectFile<'data>>> {
        let mut obj = Box::new(MachObjectFile {
            input: input.input,
            file_id: FileId(0),
            priority: input.priority,
            is_alive: AtomicBool::new(!input.is_in_lib),
            is_in_lib: input.is_in_lib,
            data: input.data,
            sections: Vec::new(),
            subsections: Vec::new(),
            sym_to_subsec: Vec::new(),
            mach_syms: Vec::new(),
            symbols: Vec::new(),
            unwind_records: Vec::new(),
            data_in_code: &[],
        });

        check_architecture(ctx, obj.data, &input.input)?;

        let mut unwind_section = None;
        obj.parse_sections(&mut unwind_section)
            .with_context(|| format!("failed to parse Mach-O object `{}`", input.input))?;
        obj.parse_symtab(ctx)
            .with_context(|| format!("failed to parse Mach-O symtab in `{}`", input.input))?;
        obj.split_subsections();
        obj.parse_data_in_code()?;
        if let Some(section) = unwind_section {
            obj.parse_compact_unwind(section)
                .with_context(|| format!("in `{}`", input.input))?;
        }

        Ok(obj)
    }

    fn load_commands(
        &self,
    ) -> Result<object::read::macho::LoadCommandIterator<'data, LittleEndian>> {
        let header = MachHeader::parse(self.data, 0).context("invalid Mach-O header")?;
        Ok(header
            .load_commands(LittleEndian, self.data, 0)
            .context("invalid load commands")?)
    }

    fn parse_sections(&mut self, unwind_section: &mut Option<MachSection>) -> Result {
        let e = LittleEndian;
        let mut commands = self.load_commands()?;
        while let Some(command) = commands.next()? {
            let Some((segment, section_data)) = command.segment_64()? else {
                continue;
            };
            for header in segment.sections(e, section_data)? {
                let segname = strip_nulls(&header.segname);
                let sectname = strip_nulls(&header.sectname);

                self.sections.push(None);

                if segname == b"__LD" && sectname == b"__compact_unwind" {
                    *unwind_section = Some(*header);
                    continue;
                }
                // Debug-map sections don't participate in linking.
                if header.flags.get(e) & macho::S_ATTR_DEBUG != 0 {
                    continue;
                }

                let offset = header.offset.get(e) as usize;
                let size = header.size.get(e) as usize;
                let contents = self
                    .data
                    .get(offset..offset + size)
                    .context("section data out of bounds")?;
                *self.sections.last_mut().unwrap() = Some(MachSectionInfo {
                    segname,
                    sectname,
                    addr: header.addr.get(e),
                    size: header.size.get(e),
                    p2align: header.align.get(e) as u8,
                    contents,
                });
            }
        }
        Ok(())
    }

    /// Reads the symbol table. Extern symbols go straight into the shared symbol map; locals stay
    /// file-private.
    fn parse_symtab(&mut self, ctx: &Context<'data>) -> Result {
        let e = LittleEndian;
        let mut commands = self.load_commands()?;
        let mut symtab: Option<&SymtabCommand> = None;
        while let Some(command) = commands.next()? {
            if let Some(cmd) = command.symtab()? {
                symtab = Some(cmd);
            }
        }
        let Some(cmd) = symtab else {
            return Ok(());
        };

        let nsyms = cmd.nsyms.get(e) as usize;
        let syms: &[MachSym] = object::pod::slice_from_bytes(
            self.data
                .get(cmd.symoff.get(e) as usize..)
                .context("symbol table out of bounds")?,
            nsyms,
        )
        .map_err(|()| anyhow::anyhow!("symbol table out of bounds"))?
        .0;
        let strings = self
            .data
            .get(cmd.stroff.get(e) as usize..(cmd.stroff.get(e) + cmd.strsize.get(e)) as usize)
            .context("string table out of bounds")?;

        self.mach_syms = syms.to_vec();
        for sym in &self.mach_syms {
            if sym.n_type & macho::N_EXT == 0 {
                self.symbols.push(None);
                continue;
            }
            let start = sym.n_strx.get(e) as usize;
            let name = strings
                .get(start..)
                .and_then(|rest| rest.split(|&b| b == 0).next())
                .context("invalid symbol name offset")?;
            self.symbols.push(Some(ctx.intern(name)));
        }
        Ok(())
    }

    /// Splits each section into subsections at the offsets of the symbols defined inside it. A
    /// symbol flagged N_ALT_ENTRY doesn't start a new subsection.
    fn split_subsections(&mut self) {
        let e = LittleEndian;
        self.sym_to_subsec = vec![None; self.mach_syms.len()];

        // Per section: (offset, symbol index, is_alt_entry), sorted by offset.
        let mut regions: Vec<Vec<(u32, u32, bool)>> = vec![Vec::new(); self.sections.len()];
        for (i, sym) in self.mach_syms.iter().enumerate() {
            if sym.n_type & macho::N_TYPE != macho::N_SECT {
                continue;
            }
            let section_idx = sym.n_sect as usize - 1;
            let Some(Some(section)) = self.sections.get(section_idx) else {
                continue;
            };
            regions[section_idx].push((
                (sym.n_value.get(e) - section.addr) as u32,
                i as u32,
                sym.n_desc.get(e) & N_ALT_ENTRY != 0,
            ));
        }

        // Subsections must end up sorted by address so that address lookups can binary-search.
        let mut order: Vec<usize> = (0..self.sections.len())
            .filter(|&i| self.sections[i].is_some())
            .collect();
        order.sort_by_key(|&i| self.sections[i].as_ref().unwrap().addr);

        for section_idx in order {
            let mut splits = std::mem::take(&mut regions[section_idx]);
            let section = self.sections[section_idx].as_ref().unwrap();

            if splits.is_empty() {
                self.subsections.push(Subsection {
                    section: section_idx as u32,
                    input_offset: 0,
                    input_size: section.size as u32,
                    input_addr: section.addr as u32,
                    p2align: section.p2align,
                });
                continue;
            }

            splits.sort_unstable();
            if splits[0].0 > 0 {
                splits.insert(0, (0, u32::MAX, false));
            }

            let starts: Vec<u32> = splits
                .iter()
                .filter(|(_, _, alt)| !alt)
                .map(|(offset, _, _)| *offset)
                .collect();

            let mut start_to_subsec = hashbrown::HashMap::new();
            for (i, &offset) in starts.iter().enumerate() {
                let end = starts.get(i + 1).copied().unwrap_or(section.size as u32);
                start_to_subsec.insert(offset, self.subsections.len() as u32);
                self.subsections.push(Subsection {
                    section: section_idx as u32,
                    input_offset: offset,
                    input_size: end - offset,
                    input_addr: (section.addr as u32) + offset,
                    p2align: section.p2align,
                });
            }

            for (offset, sym_idx, _) in splits {
                if sym_idx == u32::MAX {
                    continue;
                }
                // An alt-entry symbol belongs to the subsection containing its offset.
                let subsec = start_to_subsec.get(&offset).copied().or_else(|| {
                    let i = starts.partition_point(|&s| s <= offset);
                    i.checked_sub(1)
                        .and_then(|i| start_to_subsec.get(&starts[i]).copied())
                });
                self.sym_to_subsec[sym_idx as usize] = subsec;
            }
        }
    }

    fn parse_data_in_code(&mut self) -> Result {
        let e = LittleEndian;
        let mut commands = self.load_commands()?;
        while let Some(command) = commands.next()? {
            if command.cmd() != macho::LC_DATA_IN_CODE {
                continue;
            }
            let cmd: &LinkeditDataCommand = command.data()?;
            let count =
                cmd.datasize.get(e) as usize / size_of::<macho::DataInCodeEntry<LittleEndian>>();
            self.data_in_code = object::pod::slice_from_bytes(
                self.data
                    .get(cmd.dataoff.get(e) as usize..)
                    .context("data-in-code table out of bounds")?,
                count,
            )
            .map_err(|()| anyhow::anyhow!("data-in-code table out of bounds"))?
            .0;
        }
        Ok(())
    }

    pub(crate) fn find_subsection(&self, addr: u32) -> Option<u32> {
        let idx = self
            .subsections
            .partition_point(|subsec| subsec.input_addr <= addr);
        idx.checked_sub(1).map(|i| i as u32)
    }

    fn parse_compact_unwind(&mut self, header: MachSection) -> Result {
        let e = LittleEndian;
        let size = header.size.get(e) as usize;
        if size % size_of::<CompactUnwindEntry>() != 0 {
            bail!("invalid __compact_unwind section size");
        }
        let num_entries = size / size_of::<CompactUnwindEntry>();

        let entries: &[CompactUnwindEntry] = object::pod::slice_from_bytes(
            self.data
                .get(header.offset.get(e) as usize..)
                .context("__compact_unwind out of bounds")?,
            num_entries,
        )
        .map_err(|()| anyhow::anyhow!("__compact_unwind out of bounds"))?
        .0;

        self.unwind_records = entries
            .iter()
            .map(|entry| UnwindRecord {
                subsec: None,
                offset: 0,
                code_len: entry.code_len,
                encoding: entry.encoding,
                personality: None,
                lsda: None,
                lsda_offset: 0,
            })
            .collect();

        let rels: &[MachRel] = object::pod::slice_from_bytes(
            self.data
                .get(header.reloff.get(e) as usize..)
                .context("__compact_unwind relocations out of bounds")?,
            header.nreloc.get(e) as usize,
        )
        .map_err(|()| anyhow::anyhow!("__compact_unwind relocations out of bounds"))?
        .0;

        for (i, rel) in rels.iter().enumerate() {
            let info = rel.info(e);
            if info.r_address as usize >= size {
                bail!("__compact_unwind: relocation offset too large: {i}");
            }
            let idx = info.r_address as usize / size_of::<CompactUnwindEntry>();
            let field = info.r_address as usize % size_of::<CompactUnwindEntry>();

            // Only non-pcrel, 8-byte relocations appear here, at the three pointer fields.
            if info.r_pcrel || info.r_length != 3 || info.r_type != 0 {
                bail!("__compact_unwind: unsupported relocation: {i}");
            }

            match field {
                0 => {
                    // code_start: points at the function's subsection.
                    if info.r_extern {
                        bail!("__compact_unwind: unsupported relocation: {i}");
                    }
                    let addr = entries[idx].code_start as u32;
                    let subsec = self
                        .find_subsection(addr)
                        .context("__compact_unwind: bad code_start")?;
                    let offset = addr - self.subsections[subsec as usize].input_addr;
                    let record = &mut self.unwind_records[idx];
                    record.subsec = Some(subsec);
                    record.offset = offset;
                }
                16 => {
                    if !info.r_extern {
                        bail!("__compact_unwind: unsupported relocation: {i}");
                    }
                    let Some(Some(personality)) =
                        self.symbols.get(info.r_symbolnum as usize).copied()
                    else {
                        bail!("__compact_unwind: personality must be an extern symbol: {i}");
                    };
                    let record = &mut self.unwind_records[idx];
                    record.personality = Some(personality);
                }
                24 => {
                    if info.r_extern {
                        bail!("__compact_unwind: unsupported relocation: {i}");
                    }
                    let addr = entries[idx].lsda as u32;
                    let subsec = self
                        .find_subsection(addr)
                        .context("__compact_unwind: bad lsda")?;
                    let lsda_offset = addr - self.subsections[subsec as usize].input_addr;
                    let record = &mut self.unwind_records[idx];
                    record.lsda = Some(subsec);
                    record.lsda_offset = lsda_offset;
                }
                _ => bail!("__compact_unwind: unsupported relocation: {i}"),
            }
        }

        for (i, record) in self.unwind_records.iter().enumerate() {
            if record.subsec.is_none() {
                bail!("__compact_unwind: missing relocation at {i}");
            }
        }

        self.unwind_records
            .sort_by_key(|record| (record.subsec, record.offset));
        Ok(())
    }

    /// A common symbol is spelled as an extern undefined with a nonzero size in n_value.
    fn is_common(sym: &MachSym) -> bool {
        sym.n_type & macho::N_TYPE == macho::N_UNDF && sym.n_value.get(LittleEndian) != 0
    }

    fn is_undefined(sym: &MachSym) -> bool {
        sym.n_type & macho::N_TYPE == macho::N_UNDF && sym.n_value.get(LittleEndian) == 0
    }

    fn definition_class(sym: &MachSym, is_lazy: bool) -> DefinitionClass {
        if Self::is_common(sym) {
            DefinitionClass::Common
        } else if is_lazy {
            DefinitionClass::Lazy
        } else {
            DefinitionClass::Strong
        }
    }

    /// Replaces a symbol's definition. The caller holds the symbol's lock and has already decided
    /// the candidate outranks the incumbent.
    fn override_symbol(&self, core: &mut SymbolCore, sym_idx: usize, new_rank: u64) {
        let e = LittleEndian;
        let sym = &self.mach_syms[sym_idx];
        core.rank = new_rank;
        core.file = Some(self.file_id);
        core.sym_idx = sym_idx as u32;
        core.is_lazy = false;
        core.is_weak = false;
        core.is_imported = false;
        core.is_exported = false;
        core.is_synthetic = false;

        match sym.n_type & macho::N_TYPE {
            // Only commons reach here as N_UNDF; the "value" of a common is its size.
            macho::N_UNDF | macho::N_ABS => {
                core.origin = SymbolOrigin::Absolute;
                core.value = sym.n_value.get(e);
            }
            _ => {
                core.origin = SymbolOrigin::Section(object::SectionIndex(sym.n_sect as usize - 1));
                let base = self.sym_to_subsec[sym_idx]
                    .map_or(0, |s| u64::from(self.subsections[s as usize].input_addr));
                core.value = sym.n_value.get(e) - base;
            }
        }
    }

    pub(crate) fn resolve_regular_symbols(&self, ctx: &Context) {
        debug_assert!(!self.is_in_lib);
        for (i, sym) in self.mach_syms.iter().enumerate() {
            let Some(id) = self.symbols[i] else {
                continue;
            };
            if Self::is_undefined(sym) {
                continue;
            }
            let new_rank = rank(Self::definition_class(sym, false), self.priority);
            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if new_rank < core.rank {
                self.override_symbol(&mut core, i, new_rank);
            }
        }
    }

    pub(crate) fn resolve_lazy_symbols(&self, ctx: &Context) {
        debug_assert!(self.is_in_lib);
        for (i, sym) in self.mach_syms.iter().enumerate() {
            let Some(id) = self.symbols[i] else {
                continue;
            };
            if Self::is_undefined(sym) || Self::is_common(sym) {
                continue;
            }
            let new_rank = rank(DefinitionClass::Lazy, self.priority);
            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if new_rank < core.rank {
                core.rank = new_rank;
                core.file = Some(self.file_id);
                core.sym_idx = i as u32;
                core.is_lazy = true;
                core.is_weak = false;
            }
        }
    }

    /// Walks one live file's externs: activates the files its strong undefined references resolve
    /// into (returning newly-activated objects as more work) and registers its own definitions.
    pub(crate) fn mark_live_objects(&self, ctx: &Context) -> Vec<FileId> {
        debug_assert!(self.is_alive());
        let mut feeder = Vec::new();

        for (i, sym) in self.mach_syms.iter().enumerate() {
            let Some(id) = self.symbols[i] else {
                continue;
            };
            let symbol = ctx.symbol(id);

            if Self::is_undefined(sym) || Self::is_common(sym) {
                if sym.n_desc.get(LittleEndian) & N_WEAK_REF != 0 {
                    continue;
                }
                let core = symbol.lock();
                if let Some(owner) = core.file {
                    let file = ctx.file(owner);
                    if file.mark_alive() && !file.is_dso() {
                        feeder.push(owner);
                    }
                }
                continue;
            }

            let new_rank = rank(Self::definition_class(sym, false), self.priority);
            let mut core = symbol.lock();
            if new_rank < core.rank {
                self.override_symbol(&mut core, i, new_rank);
            }
        }

        feeder
    }

    /// Applies the unresolved-reference policy to externs that never found a definition.
    pub(crate) fn claim_unresolved_symbols(&self, ctx: &Context) {
        for (i, sym) in self.mach_syms.iter().enumerate() {
            let Some(id) = self.symbols[i] else {
                continue;
            };
            if !Self::is_undefined(sym) {
                continue;
            }

            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if core.file.is_some() || core.is_synthetic {
                continue;
            }

            let is_weak = sym.n_desc.get(LittleEndian) & N_WEAK_REF != 0;
            if ctx.args.unresolved_symbols != crate::args::UnresolvedKind::Error || is_weak {
                core.rank = rank(DefinitionClass::Strong, self.priority);
                core.file = Some(self.file_id);
                core.origin = SymbolOrigin::Absolute;
                core.value = 0;
                core.sym_idx = i as u32;
                core.is_lazy = false;
                core.is_weak = false;
                core.is_imported = false;
                core.is_exported = false;
                if ctx.args.unresolved_symbols == crate::args::UnresolvedKind::Warn && !is_weak {
                    ctx.warn(format_args!(
                        "undefined symbol: {}: {}",
                        self.input,
                        symbol.display(ctx.args.demangle)
                    ));
                }
            } else {
                ctx.error(format_args!(
                    "undefined symbol: {}: {}",
                    self.input,
                    symbol.display(ctx.args.demangle)
                ));
            }
        }
    }

    /// Reports externs this file defines strongly but lost to another file's definition.
    pub(crate) fn check_duplicate_symbols(&self, ctx: &Context) {
        for (i, sym) in self.mach_syms.iter().enumerate() {
            let Some(id) = self.symbols[i] else {
                continue;
            };
            if Self::is_undefined(sym) || Self::is_common(sym) {
                continue;
            }
            let symbol = ctx.symbol(id);
            let core = symbol.core();
            if core.file == Some(self.file_id) || core.file.is_none() {
                continue;
            }
            ctx.error(format_args!(
                "duplicate symbol: {}: {}: {}",
                self.input,
                ctx.file(core.file.unwrap()),
                symbol.display(ctx.args.demangle)
            ));
        }
    }

    pub(crate) fn reset_owned_symbols(&self, ctx: &Context) {
        for id in self.symbols.iter().flatten() {
            let symbol = ctx.symbol(*id);
            let mut core = symbol.lock();
            if core.file == Some(self.file_id) {
                *core = SymbolCore::unclaimed();
            }
        }
    }
}

fn check_architecture(ctx: &Context, data: &[u8], input: &InputRef) -> Result {
    let e = LittleEndian;
    let header = MachHeader::parse(data, 0).context("invalid Mach-O header")?;
    let arch = match header.cputype.get(e) {
        macho::CPU_TYPE_X86_64 => Some(Architecture::X86_64),
        macho::CPU_TYPE_ARM64 => Some(Architecture::AArch64),
        _ => None,
    };
    if arch != Some(ctx.args.arch) {
        bail!(
            "`{input}` has incompatible architecture, expecting {}",
            ctx.args.arch
        );
    }
    Ok(())
}

fn strip_nulls(field: &[u8; 16]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// A dylib contributes only exported names (from its export trie) plus an install name.
pub(crate) struct MachDylibFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) install_name: &'data [u8],
    pub(crate) exports: Vec<SymbolId>,
}

impl std::fmt::Display for MachDylibFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}

impl<'data> MachDylibFile<'data> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn parse(
        ctx: &Context<'data>,
        input: &InputBytes<'data>,
    ) -> Result<Box<MachDylibFile<'data>>> {
        let e = LittleEndian;
        check_architecture(ctx, input.data, &input.input)?;
        let header = MachHeader::parse(input.data, 0).context("invalid Mach-O header")?;
        let mut commands = header
            .load_commands(e, input.data, 0)
            .with_context(|| format!("invalid load commands in `{}`", input.input))?;

        let mut install_name: &[u8] = &[];
        let mut exports = Vec::new();

        while let Some(command) = commands.next()? {
            match command.cmd() {
                macho::LC_ID_DYLIB => {
                    let cmd: &DylibCommand = command.data()?;
                    install_name = command.string(e, cmd.dylib.name)?;
                }
                macho::LC_DYLD_INFO_ONLY => {
                    let cmd: &DyldInfoCommand = command.data()?;
                    if cmd.export_off.get(e) != 0 {
                        let trie = input
                            .data
                            .get(cmd.export_off.get(e) as usize..)
                            .context("export trie out of bounds")?;
                        read_trie(ctx, trie, 0, Vec::new(), &mut exports)?;
                    }
                }
                macho::LC_DYLD_EXPORTS_TRIE => {
                    let cmd: &LinkeditDataCommand = command.data()?;
                    let trie = input
                        .data
                        .get(cmd.dataoff.get(e) as usize..)
                        .context("export trie out of bounds")?;
                    read_trie(ctx, trie, 0, Vec::new(), &mut exports)?;
                }
                _ => {}
            }
        }

        Ok(Box::new(Self {
            input: input.input,
            file_id: FileId(0),
            priority: input.priority,
            is_alive: AtomicBool::new(!input.modifiers.as_needed),
            install_name,
            exports,
        }))
    }

    pub(crate) fn resolve_symbols(&self, ctx: &Context) {
        for &id in &self.exports {
            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            let new_rank = rank(DefinitionClass::DsoStrong, self.priority);
            if new_rank < core.rank {
                core.rank = new_rank;
                core.file = Some(self.file_id);
                core.origin = SymbolOrigin::Absolute;
                core.value = 0;
                core.sym_idx = 0;
                core.is_lazy = false;
                core.is_weak = false;
                core.is_imported = true;
                core.is_exported = false;
                core.is_synthetic = false;
            }
        }
    }

    pub(crate) fn reset_owned_symbols(&self, ctx: &Context) {
        for &id in &self.exports {
            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if core.file == Some(self.file_id) {
                *core = SymbolCore::unclaimed();
            }
        }
    }
}

/// Walks the dyld export trie, interning every exported name into the shared symbol map. Names
/// are spelled out along the edges; a node with a nonzero terminal size exports the name
/// accumulated so far.
fn read_trie<'data>(
    ctx: &Context<'data>,
    trie: &'data [u8],
    offset: usize,
    prefix: Vec<u8>,
    exports: &mut Vec<SymbolId>,
) -> Result {
    let mut pos = offset;
    let terminal_size = read_uleb(trie, &mut pos)?;
    if terminal_size > 0 {
        read_uleb(trie, &mut pos)?; // flags
        read_uleb(trie, &mut pos)?; // address
        // Names assembled across trie edges need stable storage for the rest of the link.
        exports.push(ctx.intern(ctx.save_bytes(&[&prefix])));
    }

    let mut pos = offset;
    let terminal_size = read_uleb(trie, &mut pos)? as usize;
    pos += terminal_size;

    let nchildren = read_uleb(trie, &mut pos)?;
    for _ in 0..nchildren {
        let start = pos;
        let end = start
            + trie[start..]
                .iter()
                .position(|&b| b == 0)
                .context("unterminated trie edge")?;
        let mut child_prefix = prefix.clone();
        child_prefix.extend_from_slice(&trie[start..end]);
        pos = end + 1;
        let child_offset = read_uleb(trie, &mut pos)? as usize;
        read_trie(ctx, trie, child_offset, child_prefix, exports)?;
    }
    Ok(())
}

fn read_uleb(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data.get(*pos).context("truncated uleb128")?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Header-level symbol-count estimate used to size the shared symbol map.
pub(crate) fn estimate_symbol_count(data: &[u8]) -> usize {
    let e = LittleEndian;
    let Ok(header) = MachHeader::parse(data, 0) else {
        return 0;
    };
    let Ok(mut commands) = header.load_commands(e, data, 0) else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(command)) = commands.next() {
        if let Ok(Some(cmd)) = command.symtab() {
            count += cmd.nsyms.get(e) as usize;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::args::Modifiers;
    use crate::file_kind::FileKind;
    use std::path::Path;

    fn push_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(out: &mut Vec<u8>, value: u64) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_name16(out: &mut Vec<u8>, name: &[u8]) {
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name);
        out.extend_from_slice(&field);
    }

    /// A minimal relocatable object: one 16-byte `__TEXT,__text` section, `_used` at offset 0,
    /// `_used2` at offset 8, and an undefined extern `_ext`.
    fn build_object() -> Vec<u8> {
        let mut out = Vec::new();

        // mach_header_64
        push_u32(&mut out, macho::MH_MAGIC_64);
        push_u32(&mut out, macho::CPU_TYPE_X86_64 as u32);
        push_u32(&mut out, 3);
        push_u32(&mut out, macho::MH_OBJECT);
        push_u32(&mut out, 2); // ncmds
        push_u32(&mut out, 152 + 24); // sizeofcmds
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);

        // LC_SEGMENT_64 with one section
        push_u32(&mut out, macho::LC_SEGMENT_64);
        push_u32(&mut out, 152);
        push_name16(&mut out, b"");
        push_u64(&mut out, 0); // vmaddr
        push_u64(&mut out, 16); // vmsize
        push_u64(&mut out, 208); // fileoff
        push_u64(&mut out, 16); // filesize
        push_u32(&mut out, 7);
        push_u32(&mut out, 7);
        push_u32(&mut out, 1); // nsects
        push_u32(&mut out, 0);

        push_name16(&mut out, b"__text");
        push_name16(&mut out, b"__TEXT");
        push_u64(&mut out, 0); // addr
        push_u64(&mut out, 16); // size
        push_u32(&mut out, 208); // offset
        push_u32(&mut out, 4); // align (p2)
        push_u32(&mut out, 0); // reloff
        push_u32(&mut out, 0); // nreloc
        push_u32(&mut out, 0); // flags
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);

        // LC_SYMTAB
        push_u32(&mut out, macho::LC_SYMTAB);
        push_u32(&mut out, 24);
        push_u32(&mut out, 224); // symoff
        push_u32(&mut out, 3); // nsyms
        push_u32(&mut out, 272); // stroff
        push_u32(&mut out, 19); // strsize

        assert_eq!(out.len(), 208);
        out.extend_from_slice(&[0xc3; 16]);

        // nlist_64 entries
        for (strx, n_type, n_sect, value) in [
            (1u32, macho::N_SECT | macho::N_EXT, 1u8, 0u64),
            (7, macho::N_SECT | macho::N_EXT, 1, 8),
            (14, macho::N_EXT, 0, 0),
        ] {
            push_u32(&mut out, strx);
            out.push(n_type);
            out.push(n_sect);
            out.extend_from_slice(&0u16.to_le_bytes());
            push_u64(&mut out, value);
        }

        out.extend_from_slice(b"\0_used\0_used2\0_ext\0");
        out
    }

    /// A minimal dylib: LC_ID_DYLIB plus an export trie exporting `_used`.
    fn build_dylib() -> Vec<u8> {
        let trie: Vec<u8> = vec![
            0, 1, b'_', b'u', b's', b'e', b'd', 0, 9, // root, one edge to offset 9
            3, 0, 0, 0, 0, // terminal node
        ];

        let mut out = Vec::new();
        push_u32(&mut out, macho::MH_MAGIC_64);
        push_u32(&mut out, macho::CPU_TYPE_X86_64 as u32);
        push_u32(&mut out, 3);
        push_u32(&mut out, macho::MH_DYLIB);
        push_u32(&mut out, 2);
        push_u32(&mut out, 40 + 16);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);

        // LC_ID_DYLIB, name inline after the 24-byte fixed part, padded to 40.
        push_u32(&mut out, macho::LC_ID_DYLIB);
        push_u32(&mut out, 40);
        push_u32(&mut out, 24); // name offset
        push_u32(&mut out, 0); // timestamp
        push_u32(&mut out, 0); // current_version
        push_u32(&mut out, 0); // compatibility_version
        out.extend_from_slice(b"libdemo.dylib\0\0\0");

        // LC_DYLD_EXPORTS_TRIE
        push_u32(&mut out, macho::LC_DYLD_EXPORTS_TRIE);
        push_u32(&mut out, 16);
        push_u32(&mut out, 88); // dataoff
        push_u32(&mut out, trie.len() as u32);

        assert_eq!(out.len(), 88);
        out.extend_from_slice(&trie);
        out
    }

    fn input_bytes<'a>(data: &'a [u8], kind: FileKind, priority: u32) -> InputBytes<'a> {
        InputBytes {
            input: InputRef {
                path: Path::new("demo"),
                member: None,
            },
            kind,
            data,
            modifiers: Modifiers::default(),
            is_in_lib: false,
            priority,
        }
    }

    #[test]
    fn parses_object_and_resolves_through_shared_table() {
        let args = Args::default();
        let herd = bumpalo_herd::Herd::new();
        let data = build_object();
        let ctx = Context::new(&args, &herd, 16, 1);

        let input = input_bytes(&data, FileKind::MachOObject, 2);
        let mut obj = MachObjectFile::parse(&ctx, &input).unwrap();
        obj.file_id = FileId(0);

        assert_eq!(obj.sections.iter().flatten().count(), 1);
        assert_eq!(obj.subsections.len(), 2);
        assert_eq!(obj.subsections[0].input_offset, 0);
        assert_eq!(obj.subsections[0].input_size, 8);
        assert_eq!(obj.subsections[1].input_offset, 8);
        assert_eq!(obj.sym_to_subsec[0], Some(0));
        assert_eq!(obj.sym_to_subsec[1], Some(1));
        assert_eq!(obj.find_subsection(0xb), Some(1));

        obj.resolve_regular_symbols(&ctx);

        let used = ctx.symbol(ctx.lookup(b"_used").unwrap()).core();
        assert_eq!(used.file, Some(FileId(0)));
        assert_eq!(used.origin, SymbolOrigin::Section(object::SectionIndex(0)));

        // `_used2` sits at the start of its own subsection, so its value is subsection-relative.
        let used2 = ctx.symbol(ctx.lookup(b"_used2").unwrap()).core();
        assert_eq!(used2.value, 0);

        // The undefined extern is interned but unclaimed.
        let ext = ctx.symbol(ctx.lookup(b"_ext").unwrap()).core();
        assert!(ext.file.is_none());
    }

    #[test]
    fn dylib_exports_lose_to_regular_definitions() {
        let args = Args::default();
        let herd = bumpalo_herd::Herd::new();
        let dylib_data = build_dylib();
        let object_data = build_object();
        let ctx = Context::new(&args, &herd, 16, 1);

        // The dylib comes first on the command line (lower priority) and claims `_used` first.
        let input = input_bytes(&dylib_data, FileKind::MachODylib, 2);
        let mut dylib = MachDylibFile::parse(&ctx, &input).unwrap();
        dylib.file_id = FileId(0);
        assert_eq!(dylib.install_name, b"libdemo.dylib");
        assert_eq!(dylib.exports.len(), 1);
        dylib.resolve_symbols(&ctx);

        let core = ctx.symbol(ctx.lookup(b"_used").unwrap()).core();
        assert_eq!(core.file, Some(FileId(0)));
        assert!(core.is_imported);

        // A regular definition outranks the dylib export despite the later priority.
        let input = input_bytes(&object_data, FileKind::MachOObject, 5);
        let mut obj = MachObjectFile::parse(&ctx, &input).unwrap();
        obj.file_id = FileId(1);
        obj.resolve_regular_symbols(&ctx);

        let core = ctx.symbol(ctx.lookup(b"_used").unwrap()).core();
        assert_eq!(core.file, Some(FileId(1)));
        assert!(!core.is_imported);
    }

    #[test]
    fn rejects_wrong_architecture() {
        let mut args = Args::default();
        args.arch = Architecture::AArch64;
        let herd = bumpalo_herd::Herd::new();
        let data = build_object();
        let ctx = Context::new(&args, &herd, 16, 1);

        let input = input_bytes(&data, FileKind::MachOObject, 2);
        assert!(MachObjectFile::parse(&ctx, &input).is_err());
    }

    #[test]
    fn uleb_roundtrip() {
        let data = [0xe5, 0x8e, 0x26];
        let mut pos = 0;
        assert_eq!(read_uleb(&data, &mut pos).unwrap(), 624485);
        assert_eq!(pos, 3);
    }

    #[test]
    fn symbol_count_estimate_reads_headers_only() {
        assert_eq!(estimate_symbol_count(&build_object()), 3);
        assert_eq!(estimate_symbol_count(&build_dylib()), 0);
        assert_eq!(estimate_symbol_count(b"not mach-o"), 0);
    }
}
