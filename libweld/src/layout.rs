//! Output composition: binning input sections into output sections, ordering the output chunks,
//! and assigning file offsets and virtual addresses. After this module runs, every retained byte
//! of the output has a home; actually writing the bytes is `elf_writer`'s job.

use crate::context::Context;
use crate::eh_frame::cies_equal;
use crate::elf::COMMON_PAGE_SIZE;
use crate::error::Result;
use crate::merge::MergedSectionId;
use crate::object_file::LinkFile;
use crate::object_file::SectionRef;
use crate::output_section::OutputSectionId;
use crate::symbol::DefinitionClass;
use crate::symbol::FileId;
use crate::symbol::SymbolCore;
use crate::symbol::SymbolId;
use crate::symbol::SymbolOrigin;
use crate::symbol::rank;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::SectionType;
use linker_utils::elf::secnames;
use linker_utils::elf::shf;
use linker_utils::elf::sht;
use linker_utils::utils::align_to;
use linker_utils::utils::align_with_skew;
use linker_utils::utils::is_c_identifier;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice;
use std::sync::atomic::Ordering;

/// Shard count for parallel section binning.
const BIN_SHARDS: usize = 128;

pub(crate) struct Layout<'data> {
    pub(crate) chunks: Vec<Chunk<'data>>,
    /// OutputSectionId -> index into `chunks`, for sections that made it into the output.
    pub(crate) osec_chunk: Vec<Option<usize>>,
    /// MergedSectionId -> index into `chunks`.
    pub(crate) merged_chunk: Vec<Option<usize>>,
    pub(crate) eh_frame: EhFrameLayout,
    pub(crate) symtab: SymtabLayout,
    pub(crate) segments: Vec<Segment>,
    pub(crate) filesize: u64,
}

pub(crate) struct Chunk<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) kind: ChunkKind,
    pub(crate) shdr: OutShdr,
    /// Forces the address assignment to start a fresh page (segment boundary).
    pub(crate) new_page: bool,
    /// Index in the output section header table; 0 for the pseudo-chunks that aren't sections.
    pub(crate) shndx: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    Ehdr,
    Phdr,
    Shdr,
    Interp,
    Regular {
        osec: OutputSectionId,
        members: Vec<SectionRef>,
    },
    Merged(MergedSectionId),
    EhFrame,
    EhFrameHdr,
    NoteProperty,
    BuildId,
    Symtab,
    Strtab,
    Shstrtab,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OutShdr {
    pub(crate) sh_type: SectionType,
    pub(crate) sh_flags: SectionFlags,
    pub(crate) sh_addr: u64,
    pub(crate) sh_offset: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Segment {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    /// Range of chunk indices the segment covers.
    pub(crate) first_chunk: usize,
    pub(crate) last_chunk: usize,
}

pub(crate) struct EhFrameLayout {
    /// Per file (indexed by FileId), per CIE: the CIE's offset in the output .eh_frame. A CIE
    /// deduplicated against an earlier identical one records the leader's offset.
    pub(crate) cie_offsets: Vec<Vec<u64>>,
    /// The CIEs that actually get emitted, in output order.
    pub(crate) leaders: Vec<(FileId, u32, u64)>,
    pub(crate) fdes: Vec<FdeInstance>,
    pub(crate) size: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FdeInstance {
    pub(crate) file: FileId,
    pub(crate) fde_idx: u32,
    pub(crate) offset: u64,
}

pub(crate) struct SymtabLayout {
    /// Per file (indexed by FileId): index of the file's first local symtab entry.
    pub(crate) local_offsets: Vec<u32>,
    /// Per file: index of the file's first global symtab entry.
    pub(crate) global_offsets: Vec<u32>,
    pub(crate) first_synthetic: u32,
    pub(crate) num_symbols: u32,
    /// Index of the first non-local symbol (symtab sh_info).
    pub(crate) first_global: u32,
    pub(crate) strtab_size: u64,
}

/// The names the linker defines itself, beyond the per-section `__start_`/`__stop_` pairs.
const SYNTHETIC_NAMES: &[&[u8]] = &[
    b"__ehdr_start",
    b"__executable_start",
    b"__bss_start",
    b"_end",
    b"_etext",
    b"_edata",
    b"__init_array_start",
    b"__init_array_end",
    b"__fini_array_start",
    b"__fini_array_end",
    b"__preinit_array_start",
    b"__preinit_array_end",
    b"_DYNAMIC",
    b"_GLOBAL_OFFSET_TABLE_",
];

/// Names that are only linker-defined when no input claims them.
const WEAK_SYNTHETIC_NAMES: &[&[u8]] = &[b"end", b"etext", b"edata"];

/// Interns and claims the linker-defined symbols. Runs before unresolved-reference claiming so
/// that references to e.g. `__start_my_section` resolve cleanly. Values are filled in by
/// `fix_synthetic_symbols` once addresses are known.
#[tracing::instrument(skip_all, name = "Define synthetic symbols")]
pub(crate) fn define_synthetic_symbols(ctx: &mut Context) {
    let mut names: Vec<&[u8]> = SYNTHETIC_NAMES.to_vec();

    if ctx.args.eh_frame_hdr {
        names.push(b"__GNU_EH_FRAME_HDR");
    }

    for def in ctx.output_sections.defs() {
        if is_c_identifier(def.name) {
            names.push(ctx.save_bytes(&[b"__start_", def.name]));
            names.push(ctx.save_bytes(&[b"__stop_", def.name]));
        }
    }

    let mut claimed = Vec::new();
    for name in names {
        let id = ctx.intern(name);
        claim_synthetic(ctx, id);
        claimed.push(id);
    }
    for name in WEAK_SYNTHETIC_NAMES {
        let id = ctx.intern(name);
        if !ctx.symbol(id).core().is_defined() {
            claim_synthetic(ctx, id);
            claimed.push(id);
        }
    }

    ctx.synthetic_symbols = claimed;
}

fn claim_synthetic(ctx: &Context, id: SymbolId) {
    let symbol = ctx.symbol(id);
    let mut core = symbol.lock();
    *core = SymbolCore {
        rank: rank(DefinitionClass::Strong, crate::input_data::INTERNAL_FILE_PRIORITY),
        is_synthetic: true,
        ..SymbolCore::unclaimed()
    };
    symbol.merge_visibility(object::elf::STV_HIDDEN);
}

#[tracing::instrument(skip_all, name = "Compute layout")]
pub(crate) fn compute<'data>(ctx: &mut Context<'data>) -> Result<Layout<'data>> {
    // Merged sections get their sizes first; they become chunks like everything else.
    ctx.merged.par_iter_mut().for_each(|sec| sec.assign_offsets());

    let members_by_osec = bin_sections(ctx);
    let mut chunks = build_chunks(ctx, members_by_osec);
    sort_init_fini(ctx, &mut chunks);
    compute_section_sizes(ctx, &mut chunks);

    let eh_frame = compute_eh_frame_layout(ctx, &mut chunks);
    let symtab = compute_symtab_layout(ctx, &mut chunks);

    chunks.sort_by_key(|chunk| section_rank(chunk));

    let mut osec_chunk = vec![None; ctx.output_sections.len()];
    let mut merged_chunk = vec![None; ctx.merged.len()];
    let mut shndx = 1u32;
    for (i, chunk) in chunks.iter_mut().enumerate() {
        match &chunk.kind {
            ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr => {}
            kind => {
                chunk.shndx = shndx;
                shndx += 1;
                match kind {
                    ChunkKind::Regular { osec, .. } => osec_chunk[osec.0 as usize] = Some(i),
                    ChunkKind::Merged(id) => merged_chunk[id.0 as usize] = Some(i),
                    _ => {}
                }
            }
        }
    }
    let num_sections = shndx;

    // Late sizes that depend on the final chunk list.
    let segments = compute_segments(&mut chunks);
    let shstrtab_size = chunks_shstrtab_size(&chunks);
    for chunk in &mut chunks {
        match chunk.kind {
            ChunkKind::Phdr => {
                chunk.shdr.sh_size =
                    segments.len() as u64 * size_of::<crate::elf::ProgramHeader>() as u64;
            }
            ChunkKind::Shdr => {
                chunk.shdr.sh_size =
                    u64::from(num_sections) * size_of::<crate::elf::SectionHeader>() as u64;
            }
            ChunkKind::Shstrtab => chunk.shdr.sh_size = shstrtab_size,
            _ => {}
        }
    }

    let filesize = set_osec_offsets(ctx, &mut chunks);

    let layout = Layout {
        chunks,
        osec_chunk,
        merged_chunk,
        eh_frame,
        symtab,
        segments,
        filesize,
    };
    fix_synthetic_symbols(ctx, &layout);

    Ok(layout)
}

/// Builds each output section's member list. Objects are sharded; each shard bins its sections
/// locally and a deterministic reduction concatenates the shards, so the result is independent of
/// scheduling.
fn bin_sections<'data>(ctx: &Context<'data>) -> Vec<Vec<SectionRef>> {
    let num_osec = ctx.output_sections.len();
    let objs: Vec<&crate::object_file::ObjectFile> =
        ctx.objects().filter(|obj| obj.is_alive()).collect();

    let shard_size = objs.len().div_ceil(BIN_SHARDS).max(1);
    let shards: Vec<Vec<Vec<SectionRef>>> = objs
        .par_chunks(shard_size)
        .map(|shard| {
            let mut bins: Vec<Vec<SectionRef>> = vec![Vec::new(); num_osec];
            for obj in shard {
                for section in obj.sections.iter().flatten() {
                    if section.is_alive() {
                        bins[section.output_section.0 as usize].push(SectionRef {
                            file: obj.file_id,
                            index: section.index,
                        });
                    }
                }
            }
            bins
        })
        .collect();

    let mut members: Vec<Vec<SectionRef>> = vec![Vec::new(); num_osec];
    for shard in shards {
        for (osec, mut bin) in shard.into_iter().enumerate() {
            members[osec].append(&mut bin);
        }
    }
    members
}

fn build_chunks<'data>(
    ctx: &Context<'data>,
    members_by_osec: Vec<Vec<SectionRef>>,
) -> Vec<Chunk<'data>> {
    let mut chunks = Vec::new();

    let pseudo = |kind: ChunkKind| Chunk {
        name: b"",
        kind,
        shdr: OutShdr {
            sh_addralign: 8,
            ..OutShdr::default()
        },
        new_page: false,
        shndx: 0,
    };
    chunks.push(Chunk {
        shdr: OutShdr {
            sh_flags: shf::ALLOC,
            sh_size: size_of::<crate::elf::FileHeader>() as u64,
            sh_addralign: 8,
            ..OutShdr::default()
        },
        ..pseudo(ChunkKind::Ehdr)
    });
    chunks.push(Chunk {
        shdr: OutShdr {
            sh_flags: shf::ALLOC,
            sh_addralign: 8,
            ..OutShdr::default()
        },
        ..pseudo(ChunkKind::Phdr)
    });
    chunks.push(pseudo(ChunkKind::Shdr));

    if let Some(path) = &ctx.args.dynamic_linker {
        chunks.push(Chunk {
            name: b".interp",
            kind: ChunkKind::Interp,
            shdr: OutShdr {
                sh_type: sht::PROGBITS,
                sh_flags: shf::ALLOC,
                sh_size: path.as_os_str().len() as u64 + 1,
                sh_addralign: 1,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
    }

    // Regular output sections with at least one member. Sections are created in parallel during
    // parsing, so sort for a deterministic output order.
    let defs = ctx.output_sections.defs();
    let mut regular: Vec<(usize, Vec<SectionRef>)> = members_by_osec
        .into_iter()
        .enumerate()
        .filter(|(_, members)| !members.is_empty())
        .collect();
    regular.sort_by_key(|(osec, _)| {
        let def = defs[*osec];
        (def.name, def.sh_type.raw(), def.sh_flags.raw())
    });

    for (osec, members) in regular {
        let def = defs[osec];
        chunks.push(Chunk {
            name: def.name,
            kind: ChunkKind::Regular {
                osec: OutputSectionId(osec as u32),
                members,
            },
            shdr: OutShdr {
                sh_type: def.sh_type,
                sh_flags: def.sh_flags,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
    }

    // Merged (string/constant) sections with nonzero size.
    let mut merged: Vec<usize> = (0..ctx.merged.len())
        .filter(|&i| ctx.merged[i].size > 0)
        .collect();
    merged.sort_by_key(|&i| {
        let sec = &ctx.merged[i];
        (sec.name, sec.sh_type.raw(), sec.sh_flags.raw())
    });
    for i in merged {
        let sec = &ctx.merged[i];
        chunks.push(Chunk {
            name: sec.name,
            kind: ChunkKind::Merged(MergedSectionId(i as u16)),
            shdr: OutShdr {
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags,
                sh_size: sec.size,
                sh_addralign: sec.addralign,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
    }

    if !ctx.args.strip_all {
        chunks.push(Chunk {
            name: b".symtab",
            kind: ChunkKind::Symtab,
            shdr: OutShdr {
                sh_type: sht::SYMTAB,
                sh_addralign: 8,
                sh_entsize: size_of::<crate::elf::SymtabEntry>() as u64,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
        chunks.push(Chunk {
            name: b".strtab",
            kind: ChunkKind::Strtab,
            shdr: OutShdr {
                sh_type: sht::STRTAB,
                sh_addralign: 1,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
    }
    chunks.push(Chunk {
        name: b".shstrtab",
        kind: ChunkKind::Shstrtab,
        shdr: OutShdr {
            sh_type: sht::STRTAB,
            sh_addralign: 1,
            ..OutShdr::default()
        },
        new_page: false,
        shndx: 0,
    });

    // The x86 feature bits are an AND across inputs: the output only advertises what every
    // object supports.
    let mut features = u32::MAX;
    let mut any = false;
    for obj in ctx.objects().filter(|o| o.is_alive()) {
        features &= obj.features;
        any = true;
    }
    if any && features != 0 && features != u32::MAX {
        chunks.push(Chunk {
            name: secnames::NOTE_GNU_PROPERTY,
            kind: ChunkKind::NoteProperty,
            shdr: OutShdr {
                sh_type: sht::NOTE,
                sh_flags: shf::ALLOC,
                sh_size: 32,
                sh_addralign: 8,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
    }

    if ctx.args.build_id != crate::args::BuildIdOption::None {
        let desc_len: u64 = match &ctx.args.build_id {
            crate::args::BuildIdOption::Hex(bytes) => bytes.len() as u64,
            _ => 16,
        };
        chunks.push(Chunk {
            name: b".note.gnu.build-id",
            kind: ChunkKind::BuildId,
            shdr: OutShdr {
                sh_type: sht::NOTE,
                sh_flags: shf::ALLOC,
                sh_size: 16 + align_to(desc_len, 4),
                sh_addralign: 4,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });
    }

    chunks
}

/// Priority of an init/fini member section, parsed from a `_array.<digits>` name suffix. Sections
/// without a priority suffix run last.
fn init_fini_priority(name: &[u8]) -> u32 {
    if let Some(pos) = memchr::memmem::rfind(name, b"_array.") {
        let digits = &name[pos + b"_array.".len()..];
        if !digits.is_empty() && digits.iter().all(|b| b.is_ascii_digit()) {
            if let Ok(s) = std::str::from_utf8(digits) {
                if let Ok(v) = s.parse::<u32>() {
                    return v;
                }
            }
        }
    }
    65536
}

fn sort_init_fini(ctx: &Context, chunks: &mut [Chunk]) {
    for chunk in chunks {
        if chunk.name != secnames::INIT_ARRAY && chunk.name != secnames::FINI_ARRAY {
            continue;
        }
        let ChunkKind::Regular { members, .. } = &mut chunk.kind else {
            continue;
        };
        members.sort_by_key(|section_ref| {
            ctx.input_section(*section_ref)
                .map_or(65536, |section| init_fini_priority(section.name()))
        });
    }
}

/// Walks each output section's members, aligning and assigning their offsets, and accumulates
/// the section's size and alignment.
fn compute_section_sizes(ctx: &Context, chunks: &mut [Chunk]) {
    chunks.par_iter_mut().for_each(|chunk| {
        let ChunkKind::Regular { members, .. } = &chunk.kind else {
            return;
        };
        let mut offset = 0u64;
        let mut align = 1u64;
        for member in members {
            let Some(section) = ctx.input_section(*member) else {
                continue;
            };
            let sh_addralign = section.info.sh_addralign.max(1);
            offset = align_to(offset, sh_addralign);
            section.offset.store(offset, Ordering::Relaxed);
            offset += section.info.sh_size;
            align = align.max(sh_addralign);
        }
        chunk.shdr.sh_size = offset;
        chunk.shdr.sh_addralign = align;
    });
}

fn compute_eh_frame_layout<'data>(
    ctx: &Context<'data>,
    chunks: &mut Vec<Chunk<'data>>,
) -> EhFrameLayout {
    let mut layout = EhFrameLayout {
        cie_offsets: vec![Vec::new(); ctx.files.len()],
        leaders: Vec::new(),
        fdes: Vec::new(),
        size: 0,
    };

    // CIEs are deduplicated across the whole link: identical bytes with identically-resolving
    // relocations collapse to the first occurrence (file order makes this deterministic).
    let mut offset = 0u64;
    let mut leaders: hashbrown::HashMap<&[u8], Vec<(FileId, u32, u64)>> = hashbrown::HashMap::new();

    for file in &ctx.files {
        let LinkFile::Object(obj) = file else {
            continue;
        };
        if !obj.is_alive() {
            continue;
        }
        let mut offsets = Vec::with_capacity(obj.cies.len());
        for (cie_idx, cie) in obj.cies.iter().enumerate() {
            let contents = cie.contents(obj);
            let candidates = leaders.entry(contents).or_default();
            let existing = candidates.iter().find(|(leader_file, leader_idx, _)| {
                let leader_obj = ctx.object(*leader_file);
                cies_equal(leader_obj, &leader_obj.cies[*leader_idx as usize], obj, cie)
            });
            match existing {
                Some(&(_, _, leader_offset)) => offsets.push(leader_offset),
                None => {
                    candidates.push((obj.file_id, cie_idx as u32, offset));
                    layout.leaders.push((obj.file_id, cie_idx as u32, offset));
                    offsets.push(offset);
                    offset += u64::from(cie.len);
                }
            }
        }
        layout.cie_offsets[obj.file_id.0 as usize] = offsets;
    }

    // An FDE survives iff the section whose code it describes survived.
    for file in &ctx.files {
        let LinkFile::Object(obj) = file else {
            continue;
        };
        if !obj.is_alive() {
            continue;
        }
        for section in obj.sections.iter().flatten() {
            if !section.is_alive() {
                continue;
            }
            for fde_idx in section.fdes() {
                layout.fdes.push(FdeInstance {
                    file: obj.file_id,
                    fde_idx: fde_idx as u32,
                    offset,
                });
                offset += u64::from(obj.fdes[fde_idx].len);
            }
        }
    }

    if offset > 0 {
        // Null terminator record.
        layout.size = offset + 4;
        chunks.push(Chunk {
            name: secnames::EH_FRAME,
            kind: ChunkKind::EhFrame,
            shdr: OutShdr {
                sh_type: sht::PROGBITS,
                sh_flags: shf::ALLOC,
                sh_size: layout.size,
                sh_addralign: 8,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        });

        if ctx.args.eh_frame_hdr {
            chunks.push(Chunk {
                name: secnames::EH_FRAME_HDR,
                kind: ChunkKind::EhFrameHdr,
                shdr: OutShdr {
                    sh_type: sht::PROGBITS,
                    sh_flags: shf::ALLOC,
                    sh_size: 12 + 8 * layout.fdes.len() as u64,
                    sh_addralign: 4,
                    ..OutShdr::default()
                },
                new_page: false,
                shndx: 0,
            });
        }
    }

    layout
}

fn compute_symtab_layout(ctx: &Context, chunks: &mut [Chunk]) -> SymtabLayout {
    let mut layout = SymtabLayout {
        local_offsets: vec![0; ctx.files.len()],
        global_offsets: vec![0; ctx.files.len()],
        first_synthetic: 0,
        num_symbols: 0,
        first_global: 0,
        strtab_size: 1,
    };

    if ctx.args.strip_all {
        return layout;
    }

    // Symbol 0 is the null entry.
    let mut next = 1u32;
    for obj in ctx.objects().filter(|o| o.is_alive()) {
        layout.local_offsets[obj.file_id.0 as usize] = next;
        for local in &obj.local_syms {
            if written_local(ctx, obj, local) {
                next += 1;
                layout.strtab_size += local.name.len() as u64 + 1;
            }
        }
    }
    layout.first_global = next;

    for obj in ctx.objects().filter(|o| o.is_alive()) {
        layout.global_offsets[obj.file_id.0 as usize] = next;
        for index in obj.first_global()..obj.num_symbols() {
            if let Some(id) = written_global(ctx, obj, index) {
                next += 1;
                layout.strtab_size += ctx.symbol(id).name.len() as u64 + 1;
            }
        }
    }

    layout.first_synthetic = next;
    for &id in &ctx.synthetic_symbols {
        next += 1;
        layout.strtab_size += ctx.symbol(id).name.len() as u64 + 1;
    }

    layout.num_symbols = next;

    for chunk in chunks {
        match chunk.kind {
            ChunkKind::Symtab => {
                chunk.shdr.sh_size =
                    u64::from(next) * size_of::<crate::elf::SymtabEntry>() as u64;
                chunk.shdr.sh_info = layout.first_global;
            }
            ChunkKind::Strtab => chunk.shdr.sh_size = layout.strtab_size,
            _ => {}
        }
    }

    layout
}

/// Whether a local symbol gets a symtab entry: it must have been eligible at parse time and its
/// section must have survived.
pub(crate) fn written_local(
    ctx: &Context,
    obj: &crate::object_file::ObjectFile,
    local: &crate::object_file::LocalSymbol,
) -> bool {
    if !local.write_to_symtab {
        return false;
    }
    match local.section {
        Some(index) => ctx
            .input_section(SectionRef {
                file: obj.file_id,
                index,
            })
            .is_some_and(|s| s.is_alive()),
        None => true,
    }
}

/// Whether a global symtab slot of `obj` gets an entry: `obj` must own the definition and the
/// defining section must be alive.
pub(crate) fn written_global(
    ctx: &Context,
    obj: &crate::object_file::ObjectFile,
    index: usize,
) -> Option<SymbolId> {
    let crate::object_file::SymbolRef::Global(id) = obj.symbols[index] else {
        return None;
    };
    let symbol = ctx.symbol(id);
    let core = symbol.core();
    if core.file != Some(obj.file_id) {
        return None;
    }
    if let Some(retain) = &ctx.args.retain_symbols_file {
        if !retain.iter().any(|name| name == symbol.name) {
            return None;
        }
    }
    if let SymbolOrigin::Section(section) = core.origin {
        let alive = ctx
            .input_section(SectionRef {
                file: obj.file_id,
                index: section,
            })
            .is_some_and(|s| s.is_alive());
        if !alive {
            return None;
        }
    }
    Some(id)
}

/// Sort key for output chunks: headers first, then .interp and notes, then alloc sections grouped
/// so that segments with equal permissions are contiguous (read-only, executable, TLS, RELRO,
/// writable data, then bss), then non-alloc sections, then the section header table.
pub(crate) fn section_rank(chunk: &Chunk) -> i64 {
    match chunk.kind {
        ChunkKind::Ehdr => return -4,
        ChunkKind::Phdr => return -3,
        ChunkKind::Interp => return -2,
        ChunkKind::Shdr => return 1 << 6,
        _ => {}
    }

    let shdr = &chunk.shdr;
    if shdr.sh_type == sht::NOTE && shdr.sh_flags.contains(shf::ALLOC) {
        return -1;
    }
    if !shdr.sh_flags.contains(shf::ALLOC) {
        return 1 << 5;
    }

    let writable = shdr.sh_flags.contains(shf::WRITE) as i64;
    let exec = shdr.sh_flags.contains(shf::EXECINSTR) as i64;
    let tls = shdr.sh_flags.contains(shf::TLS) as i64;
    let relro = is_relro(chunk) as i64;
    let is_bss = (shdr.sh_type == sht::NOBITS) as i64;

    (writable << 4) | (exec << 3) | ((1 - tls) << 2) | ((1 - relro) << 1) | is_bss
}

fn is_relro(chunk: &Chunk) -> bool {
    chunk.shdr.sh_type == sht::INIT_ARRAY
        || chunk.shdr.sh_type == sht::FINI_ARRAY
        || chunk.shdr.sh_type == sht::PREINIT_ARRAY
        || chunk.name == secnames::CTORS
        || chunk.name == secnames::DTORS
        || chunk.name == b".data.rel.ro"
        || chunk.name == b".got"
        || chunk.name == b".dynamic"
}

/// Derives the program segments from the sorted chunk list and marks segment-leading chunks as
/// starting a new page.
fn compute_segments(chunks: &mut [Chunk]) -> Vec<Segment> {
    let mut segments = Vec::new();

    // LOAD segments: consecutive alloc chunks with the same permissions.
    let mut current: Option<(u32, usize)> = None;
    for (i, chunk) in chunks.iter_mut().enumerate() {
        if !chunk.shdr.sh_flags.contains(shf::ALLOC) {
            if let Some((flags, first)) = current.take() {
                segments.push(Segment {
                    p_type: object::elf::PT_LOAD,
                    p_flags: flags,
                    first_chunk: first,
                    last_chunk: i - 1,
                });
            }
            continue;
        }

        let mut p_flags = object::elf::PF_R;
        if chunk.shdr.sh_flags.contains(shf::WRITE) {
            p_flags |= object::elf::PF_W;
        }
        if chunk.shdr.sh_flags.contains(shf::EXECINSTR) {
            p_flags |= object::elf::PF_X;
        }

        match current {
            Some((flags, _)) if flags == p_flags => {}
            Some((flags, first)) => {
                segments.push(Segment {
                    p_type: object::elf::PT_LOAD,
                    p_flags: flags,
                    first_chunk: first,
                    last_chunk: i - 1,
                });
                chunk.new_page = true;
                current = Some((p_flags, i));
            }
            None => current = Some((p_flags, i)),
        }
    }
    if let Some((flags, first)) = current {
        let last = chunks
            .iter()
            .rposition(|c| c.shdr.sh_flags.contains(shf::ALLOC))
            .unwrap();
        segments.push(Segment {
            p_type: object::elf::PT_LOAD,
            p_flags: flags,
            first_chunk: first,
            last_chunk: last,
        });
    }

    if let Some(interp) = chunks.iter().position(|c| matches!(c.kind, ChunkKind::Interp)) {
        segments.push(Segment {
            p_type: object::elf::PT_INTERP,
            p_flags: object::elf::PF_R,
            first_chunk: interp,
            last_chunk: interp,
        });
    }

    let tls: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.shdr.sh_flags.contains(shf::TLS))
        .map(|(i, _)| i)
        .collect();
    if let (Some(&first), Some(&last)) = (tls.first(), tls.last()) {
        segments.push(Segment {
            p_type: object::elf::PT_TLS,
            p_flags: object::elf::PF_R,
            first_chunk: first,
            last_chunk: last,
        });
    }

    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.shdr.sh_type == sht::NOTE && chunk.shdr.sh_flags.contains(shf::ALLOC) {
            segments.push(Segment {
                p_type: object::elf::PT_NOTE,
                p_flags: object::elf::PF_R,
                first_chunk: i,
                last_chunk: i,
            });
        }
    }

    if let Some(hdr) = chunks.iter().position(|c| matches!(c.kind, ChunkKind::EhFrameHdr)) {
        segments.push(Segment {
            p_type: object::elf::PT_GNU_EH_FRAME,
            p_flags: object::elf::PF_R,
            first_chunk: hdr,
            last_chunk: hdr,
        });
    }

    // A non-executable stack, unconditionally; we don't support trampoline-requiring inputs.
    segments.push(Segment {
        p_type: object::elf::PT_GNU_STACK,
        p_flags: object::elf::PF_R | object::elf::PF_W,
        first_chunk: usize::MAX,
        last_chunk: usize::MAX,
    });

    segments
}

/// Assigns virtual addresses and file offsets. Alloc chunks keep `vaddr ≡ fileoff (mod page)`;
/// BSS advances the address but not the file offset, and TLS BSS advances neither (its address
/// range overlays the next section).
fn set_osec_offsets(ctx: &Context, chunks: &mut [Chunk]) -> u64 {
    let page = COMMON_PAGE_SIZE;
    let mut fileoff = 0u64;
    let mut vaddr = ctx.args.image_base;

    let end = chunks
        .iter()
        .position(|c| !c.shdr.sh_flags.contains(shf::ALLOC))
        .unwrap_or(chunks.len());

    let mut i = 0;
    while i < end {
        fileoff = align_with_skew(fileoff, page, vaddr % page);

        // A run of non-BSS chunks followed by a run of BSS chunks shares a page group.
        while i < end && chunks[i].shdr.sh_type != sht::NOBITS {
            let chunk = &mut chunks[i];
            let prev_vaddr = vaddr;
            if chunk.new_page {
                vaddr = align_to(vaddr, page);
            }
            vaddr = align_to(vaddr, chunk.shdr.sh_addralign);
            fileoff += vaddr - prev_vaddr;

            chunk.shdr.sh_addr = vaddr;
            vaddr += chunk.shdr.sh_size;
            chunk.shdr.sh_offset = fileoff;
            fileoff += chunk.shdr.sh_size;
            i += 1;
        }

        while i < end && chunks[i].shdr.sh_type == sht::NOBITS {
            let chunk = &mut chunks[i];
            if chunk.new_page {
                vaddr = align_to(vaddr, page);
            }
            vaddr = align_to(vaddr, chunk.shdr.sh_addralign);
            fileoff = align_with_skew(fileoff, page, vaddr % page);

            chunk.shdr.sh_addr = vaddr;
            chunk.shdr.sh_offset = fileoff;
            if !chunk.shdr.sh_flags.contains(shf::TLS) {
                vaddr += chunk.shdr.sh_size;
            }
            i += 1;
        }
    }

    for chunk in &mut chunks[end..] {
        debug_assert!(!chunk.shdr.sh_flags.contains(shf::ALLOC));
        fileoff = align_to(fileoff, chunk.shdr.sh_addralign);
        chunk.shdr.sh_offset = fileoff;
        if chunk.shdr.sh_type != sht::NOBITS {
            fileoff += chunk.shdr.sh_size;
        }
    }

    fileoff
}

fn chunks_shstrtab_size(chunks: &[Chunk]) -> u64 {
    1 + chunks
        .iter()
        .filter(|c| !c.name.is_empty())
        .map(|c| c.name.len() as u64 + 1)
        .sum::<u64>()
}

/// Gives the linker-defined symbols their final values now that addresses are known.
fn fix_synthetic_symbols(ctx: &Context, layout: &Layout) {
    let chunks = &layout.chunks;

    let set = |name: &[u8], value: u64| {
        if let Some(id) = ctx.lookup(name) {
            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if core.is_synthetic {
                core.value = value;
            }
        }
    };

    let image_base = chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::Ehdr))
        .map_or(ctx.args.image_base, |c| c.shdr.sh_addr);
    set(b"__ehdr_start", image_base);
    set(b"__executable_start", image_base);

    if let Some(bss) = chunks.iter().find(|c| c.name == secnames::BSS) {
        set(b"__bss_start", bss.shdr.sh_addr);
    }

    for (ty, start, end_name) in [
        (sht::INIT_ARRAY, &b"__init_array_start"[..], &b"__init_array_end"[..]),
        (sht::FINI_ARRAY, b"__fini_array_start", b"__fini_array_end"),
        (sht::PREINIT_ARRAY, b"__preinit_array_start", b"__preinit_array_end"),
    ] {
        for chunk in chunks {
            if chunk.shdr.sh_type == ty {
                set(start, chunk.shdr.sh_addr);
                set(end_name, chunk.shdr.sh_addr + chunk.shdr.sh_size);
                break;
            }
        }
    }

    let mut end = 0u64;
    let mut etext = 0u64;
    let mut edata = 0u64;
    for chunk in chunks {
        if matches!(chunk.kind, ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr) {
            continue;
        }
        let shdr = &chunk.shdr;
        if shdr.sh_flags.contains(shf::ALLOC) {
            end = end.max(shdr.sh_addr + shdr.sh_size);
        }
        if shdr.sh_flags.contains(shf::EXECINSTR) {
            etext = etext.max(shdr.sh_addr + shdr.sh_size);
        }
        if shdr.sh_flags.contains(shf::ALLOC) && shdr.sh_type != sht::NOBITS {
            edata = edata.max(shdr.sh_addr + shdr.sh_size);
        }
    }
    for name in [&b"_end"[..], b"end"] {
        set(name, end);
    }
    for name in [&b"_etext"[..], b"etext"] {
        set(name, etext);
    }
    for name in [&b"_edata"[..], b"edata"] {
        set(name, edata);
    }

    if let Some(hdr) = chunks.iter().find(|c| matches!(c.kind, ChunkKind::EhFrameHdr)) {
        set(b"__GNU_EH_FRAME_HDR", hdr.shdr.sh_addr);
    }

    for chunk in chunks {
        if is_c_identifier(chunk.name) {
            set(ctx.save_bytes(&[b"__start_", chunk.name]), chunk.shdr.sh_addr);
            set(
                ctx.save_bytes(&[b"__stop_", chunk.name]),
                chunk.shdr.sh_addr + chunk.shdr.sh_size,
            );
        }
    }
}

impl<'data> Layout<'data> {
    pub(crate) fn chunk_for_osec(&self, osec: OutputSectionId) -> Option<&Chunk<'data>> {
        self.osec_chunk[osec.0 as usize].map(|i| &self.chunks[i])
    }

    pub(crate) fn section_address(&self, ctx: &Context, section_ref: SectionRef) -> u64 {
        let Some(section) = ctx.input_section(section_ref) else {
            return 0;
        };
        let Some(chunk) = self.chunk_for_osec(section.output_section) else {
            return 0;
        };
        chunk.shdr.sh_addr + section.offset.load(Ordering::Relaxed)
    }

    pub(crate) fn fragment_address(&self, ctx: &Context, id: crate::merge::FragmentId) -> u64 {
        let Some(chunk_idx) = self.merged_chunk[id.section.0 as usize] else {
            return 0;
        };
        let fragment = ctx.fragment(id);
        if fragment.offset() == crate::merge::FRAGMENT_OFFSET_UNASSIGNED {
            return 0;
        }
        self.chunks[chunk_idx].shdr.sh_addr + fragment.offset()
    }

    /// The runtime address of a global symbol's definition.
    pub(crate) fn symbol_address(&self, ctx: &Context, id: SymbolId) -> u64 {
        let core = ctx.symbol(id).core();
        if core.is_synthetic {
            return core.value;
        }
        let Some(file_id) = core.file else {
            return 0;
        };
        if let LinkFile::Object(owner) = ctx.file(file_id) {
            if let Some(fragment) = owner
                .sym_fragments
                .get(core.sym_idx as usize)
                .and_then(|f| f.fragment)
            {
                return self.fragment_address(ctx, fragment) + core.value;
            }
        }
        match core.origin {
            SymbolOrigin::Section(index) => {
                self.section_address(
                    ctx,
                    SectionRef {
                        file: file_id,
                        index,
                    },
                ) + core.value
            }
            SymbolOrigin::Absolute => core.value,
        }
    }

    /// The value a relocation in `obj` against symbol-table slot `sym_idx` resolves to.
    pub(crate) fn symbol_value(
        &self,
        ctx: &Context,
        obj: &crate::object_file::ObjectFile,
        sym_idx: usize,
    ) -> u64 {
        if let Some(fragment) = obj.sym_fragments[sym_idx].fragment {
            return self.fragment_address(ctx, fragment) + obj.sym_fragments[sym_idx].addend;
        }
        match obj.symbols[sym_idx] {
            crate::object_file::SymbolRef::Local(local) => {
                let local = &obj.local_syms[local as usize];
                match local.section {
                    Some(index) => {
                        self.section_address(
                            ctx,
                            SectionRef {
                                file: obj.file_id,
                                index,
                            },
                        ) + local.value
                    }
                    None => local.value,
                }
            }
            crate::object_file::SymbolRef::Global(id) => self.symbol_address(ctx, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(name: &'static [u8], sh_type: SectionType, sh_flags: SectionFlags) -> Chunk<'static> {
        Chunk {
            name,
            kind: ChunkKind::Regular {
                osec: OutputSectionId(0),
                members: Vec::new(),
            },
            shdr: OutShdr {
                sh_type,
                sh_flags,
                ..OutShdr::default()
            },
            new_page: false,
            shndx: 0,
        }
    }

    #[test]
    fn ranks_follow_canonical_layout_order() {
        let ehdr = Chunk {
            kind: ChunkKind::Ehdr,
            ..chunk(b"", sht::NULL, SectionFlags::empty())
        };
        let interp = Chunk {
            kind: ChunkKind::Interp,
            ..chunk(b".interp", sht::PROGBITS, shf::ALLOC)
        };
        let note = chunk(b".note.x", sht::NOTE, shf::ALLOC);
        let text = chunk(b".text", sht::PROGBITS, shf::ALLOC.with(shf::EXECINSTR));
        let rodata = chunk(b".rodata", sht::PROGBITS, shf::ALLOC);
        let data = chunk(b".data", sht::PROGBITS, shf::ALLOC.with(shf::WRITE));
        let bss = chunk(b".bss", sht::NOBITS, shf::ALLOC.with(shf::WRITE));
        let relro = chunk(b".data.rel.ro", sht::PROGBITS, shf::ALLOC.with(shf::WRITE));
        let tdata = chunk(b".tdata", sht::PROGBITS, shf::ALLOC.with(shf::WRITE).with(shf::TLS));
        let debug = chunk(b".debug_info", sht::PROGBITS, SectionFlags::empty());
        let shdr = Chunk {
            kind: ChunkKind::Shdr,
            ..chunk(b"", sht::NULL, SectionFlags::empty())
        };

        let mut ranks = [
            section_rank(&ehdr),
            section_rank(&interp),
            section_rank(&note),
            section_rank(&rodata),
            section_rank(&text),
            section_rank(&tdata),
            section_rank(&relro),
            section_rank(&data),
            section_rank(&bss),
            section_rank(&debug),
            section_rank(&shdr),
        ];
        let sorted = ranks;
        ranks.sort();
        assert_eq!(ranks, sorted);
        // Writable sections come after read-only ones, bss after data.
        assert!(section_rank(&data) > section_rank(&rodata));
        assert!(section_rank(&bss) > section_rank(&data));
        assert!(section_rank(&debug) > section_rank(&bss));
    }

    #[test]
    fn init_fini_priorities() {
        assert_eq!(init_fini_priority(b".init_array.00010"), 10);
        assert_eq!(init_fini_priority(b".fini_array.5"), 5);
        assert_eq!(init_fini_priority(b".init_array"), 65536);
        assert_eq!(init_fini_priority(b".init_array.abc"), 65536);
    }
}
