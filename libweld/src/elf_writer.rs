//! Emits the composed image. Layout has already decided where everything goes; this module fills
//! a byte buffer accordingly: headers, section contents with relocations applied, the reassembled
//! .eh_frame, the merged-string sections and the symbol table.

use crate::arch::Arch;
use crate::args::BuildIdOption;
use crate::context::Context;
use crate::elf;
use crate::error::Context as _;
use crate::error::Result;
use crate::layout::Chunk;
use crate::layout::ChunkKind;
use crate::layout::Layout;
use crate::layout::written_global;
use crate::layout::written_local;
use crate::object_file::LinkFile;
use crate::object_file::ObjectFile;
use crate::object_file::SectionRef;
use crate::symbol::SymbolOrigin;
use linker_utils::elf::sht;
use object::LittleEndian;
use object::U16;
use object::U32;
use object::U64;
use object::read::elf::Rela as _;
use object::read::elf::Sym as _;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Write output")]
pub(crate) fn write<A: Arch>(ctx: &Context, layout: &Layout) -> Result {
    let mut buf = vec![0u8; layout.filesize as usize];

    write_program_headers(layout, &mut buf);
    write_section_headers(layout, &mut buf);
    write_shstrtab(layout, &mut buf);

    for chunk in &layout.chunks {
        match &chunk.kind {
            ChunkKind::Interp => {
                if let Some(path) = &ctx.args.dynamic_linker {
                    let bytes = path.as_os_str().as_encoded_bytes();
                    let start = chunk.shdr.sh_offset as usize;
                    buf[start..start + bytes.len()].copy_from_slice(bytes);
                }
            }
            ChunkKind::Regular { members, .. } => {
                write_regular_chunk::<A>(ctx, layout, chunk, members, &mut buf)?;
            }
            ChunkKind::Merged(id) => {
                let start = chunk.shdr.sh_offset as usize;
                let end = start + chunk.shdr.sh_size as usize;
                ctx.merged_section(*id).write(&mut buf[start..end]);
            }
            ChunkKind::EhFrame => write_eh_frame::<A>(ctx, layout, chunk, &mut buf)?,
            ChunkKind::EhFrameHdr => write_eh_frame_hdr(ctx, layout, chunk, &mut buf)?,
            ChunkKind::NoteProperty => write_note_property(ctx, chunk, &mut buf),
            ChunkKind::Symtab => write_symtab(ctx, layout, chunk, &mut buf)?,
            _ => {}
        }
    }

    if let Some(chunk) = layout
        .chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::BuildId))
    {
        write_build_id(ctx, chunk, &mut buf);
    }

    // The ELF header goes last so the entry address sees final symbol values.
    write_file_header(ctx, layout, &mut buf);

    let mut output = crate::fs::OutputFile::new(&ctx.args.output);
    output.write(&buf)
}

fn write_file_header(ctx: &Context, layout: &Layout, buf: &mut [u8]) {
    let e = LittleEndian;
    let mut ident = [0u8; 16];
    ident[..4].copy_from_slice(&object::elf::ELFMAG);
    ident[4] = object::elf::ELFCLASS64;
    ident[5] = object::elf::ELFDATA2LSB;
    ident[6] = object::elf::EV_CURRENT as u8;

    let e_type = if ctx.args.output_kind().is_relocatable() {
        object::elf::ET_DYN
    } else {
        object::elf::ET_EXEC
    };

    let entry = ctx
        .lookup(ctx.args.entry_symbol_name())
        .map(|id| layout.symbol_address(ctx, id))
        .filter(|&addr| addr != 0)
        .unwrap_or_else(|| {
            if !ctx.args.shared {
                crate::error::warning(format_args!(
                    "cannot find entry symbol {}; defaulting to image base",
                    String::from_utf8_lossy(ctx.args.entry_symbol_name())
                ));
            }
            ctx.args.image_base
        });

    let find = |kind: fn(&ChunkKind) -> bool| layout.chunks.iter().find(|c| kind(&c.kind));
    let phdr = find(|k| matches!(k, ChunkKind::Phdr));
    let shdr = find(|k| matches!(k, ChunkKind::Shdr));
    let shstrtab = find(|k| matches!(k, ChunkKind::Shstrtab));
    let num_sections = layout.chunks.iter().map(|c| c.shndx).max().unwrap_or(0) + 1;

    let header = elf::FileHeader {
        e_ident: object::elf::Ident {
            magic: *b"\x7fELF",
            class: ident[4],
            data: ident[5],
            version: ident[6],
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(e, e_type),
        e_machine: U16::new(e, ctx.args.arch.e_machine()),
        e_version: U32::new(e, 1),
        e_entry: U64::new(e, entry),
        e_phoff: U64::new(e, phdr.map_or(0, |c| c.shdr.sh_offset)),
        e_shoff: U64::new(e, shdr.map_or(0, |c| c.shdr.sh_offset)),
        e_flags: U32::new(e, 0),
        e_ehsize: U16::new(e, size_of::<elf::FileHeader>() as u16),
        e_phentsize: U16::new(e, size_of::<elf::ProgramHeader>() as u16),
        e_phnum: U16::new(e, layout.segments.len() as u16),
        e_shentsize: U16::new(e, size_of::<elf::SectionHeader>() as u16),
        e_shnum: U16::new(e, num_sections as u16),
        e_shstrndx: U16::new(e, shstrtab.map_or(0, |c| c.shndx) as u16),
    };
    buf[..size_of::<elf::FileHeader>()].copy_from_slice(object::bytes_of(&header));
}

fn write_program_headers(layout: &Layout, buf: &mut [u8]) {
    let e = LittleEndian;
    let Some(phdr_chunk) = layout.chunks.iter().find(|c| matches!(c.kind, ChunkKind::Phdr))
    else {
        return;
    };
    let mut offset = phdr_chunk.shdr.sh_offset as usize;

    for segment in &layout.segments {
        let header = if segment.first_chunk == usize::MAX {
            // PT_GNU_STACK carries no contents; it only conveys permissions.
            elf::ProgramHeader {
                p_type: U32::new(e, segment.p_type),
                p_flags: U32::new(e, segment.p_flags),
                p_offset: U64::new(e, 0),
                p_vaddr: U64::new(e, 0),
                p_paddr: U64::new(e, 0),
                p_filesz: U64::new(e, 0),
                p_memsz: U64::new(e, 0),
                p_align: U64::new(e, 16),
            }
        } else {
            let first = &layout.chunks[segment.first_chunk];
            let last = &layout.chunks[segment.last_chunk];
            let file_end = if last.shdr.sh_type == sht::NOBITS {
                last.shdr.sh_offset
            } else {
                last.shdr.sh_offset + last.shdr.sh_size
            };
            let mem_end = last.shdr.sh_addr + last.shdr.sh_size;
            let align = if segment.p_type == object::elf::PT_LOAD {
                elf::COMMON_PAGE_SIZE
            } else {
                first.shdr.sh_addralign
            };
            elf::ProgramHeader {
                p_type: U32::new(e, segment.p_type),
                p_flags: U32::new(e, segment.p_flags),
                p_offset: U64::new(e, first.shdr.sh_offset),
                p_vaddr: U64::new(e, first.shdr.sh_addr),
                p_paddr: U64::new(e, first.shdr.sh_addr),
                p_filesz: U64::new(e, file_end.saturating_sub(first.shdr.sh_offset)),
                p_memsz: U64::new(e, mem_end.saturating_sub(first.shdr.sh_addr)),
                p_align: U64::new(e, align),
            }
        };
        buf[offset..offset + size_of::<elf::ProgramHeader>()]
            .copy_from_slice(object::bytes_of(&header));
        offset += size_of::<elf::ProgramHeader>();
    }
}

fn shstrtab_offset_of(layout: &Layout, name: &[u8]) -> u32 {
    let mut offset = 1u32;
    for chunk in &layout.chunks {
        if chunk.name.is_empty() {
            continue;
        }
        if chunk.name == name {
            return offset;
        }
        offset += chunk.name.len() as u32 + 1;
    }
    0
}

fn write_section_headers(layout: &Layout, buf: &mut [u8]) {
    let e = LittleEndian;
    let Some(shdr_chunk) = layout.chunks.iter().find(|c| matches!(c.kind, ChunkKind::Shdr))
    else {
        return;
    };
    let base = shdr_chunk.shdr.sh_offset as usize;

    let strtab_shndx = layout
        .chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::Strtab))
        .map_or(0, |c| c.shndx);

    // Index 0 is the null header, already zeroed.
    for chunk in &layout.chunks {
        if chunk.shndx == 0 {
            continue;
        }
        let sh_link = match chunk.kind {
            ChunkKind::Symtab => strtab_shndx,
            _ => chunk.shdr.sh_link,
        };
        let header = elf::SectionHeader {
            sh_name: U32::new(e, shstrtab_offset_of(layout, chunk.name)),
            sh_type: U32::new(e, chunk.shdr.sh_type.raw()),
            sh_flags: U64::new(e, chunk.shdr.sh_flags.raw()),
            sh_addr: U64::new(e, chunk.shdr.sh_addr),
            sh_offset: U64::new(e, chunk.shdr.sh_offset),
            sh_size: U64::new(e, chunk.shdr.sh_size),
            sh_link: U32::new(e, sh_link),
            sh_info: U32::new(e, chunk.shdr.sh_info),
            sh_addralign: U64::new(e, chunk.shdr.sh_addralign),
            sh_entsize: U64::new(e, chunk.shdr.sh_entsize),
        };
        let at = base + chunk.shndx as usize * size_of::<elf::SectionHeader>();
        buf[at..at + size_of::<elf::SectionHeader>()].copy_from_slice(object::bytes_of(&header));
    }
}

fn write_shstrtab(layout: &Layout, buf: &mut [u8]) {
    let Some(chunk) = layout
        .chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::Shstrtab))
    else {
        return;
    };
    let mut offset = chunk.shdr.sh_offset as usize + 1;
    for chunk in &layout.chunks {
        if chunk.name.is_empty() {
            continue;
        }
        buf[offset..offset + chunk.name.len()].copy_from_slice(chunk.name);
        offset += chunk.name.len() + 1;
    }
}

fn write_regular_chunk<A: Arch>(
    ctx: &Context,
    layout: &Layout,
    chunk: &Chunk,
    members: &[SectionRef],
    buf: &mut [u8],
) -> Result {
    if chunk.shdr.sh_type == sht::NOBITS {
        return Ok(());
    }

    for member in members {
        let Some(section) = ctx.input_section(*member) else {
            continue;
        };
        let obj = ctx.object(member.file);
        let offset = chunk.shdr.sh_offset + section.offset.load(Ordering::Relaxed);
        let out = &mut buf[offset as usize..offset as usize + section.contents.len()];
        out.copy_from_slice(section.contents);

        let section_addr = chunk.shdr.sh_addr + section.offset.load(Ordering::Relaxed);
        apply_relocations::<A>(ctx, layout, obj, section, section_addr, out)
            .with_context(|| format!("failed to relocate `{}`", obj.input))?;
    }
    Ok(())
}

fn apply_relocations<A: Arch>(
    ctx: &Context,
    layout: &Layout,
    obj: &ObjectFile,
    section: &crate::object_file::InputSection,
    section_addr: u64,
    out: &mut [u8],
) -> Result {
    let e = LittleEndian;
    for (rel_idx, rel) in section.rels.iter().enumerate() {
        let r_offset = rel.r_offset.get(e);
        let place = section_addr + r_offset;
        let field = &mut out[r_offset as usize..];

        // Relocations through section symbols of mergeable sections were re-bound to fragments;
        // their addend is relative to the fragment.
        let (value, addend) = match section.rel_fragment(rel_idx as u32) {
            Some(fragment_ref) => (
                layout.fragment_address(ctx, fragment_ref.fragment),
                fragment_ref.addend,
            ),
            None => (
                layout.symbol_value(ctx, obj, rel.r_sym(e, false) as usize),
                rel.r_addend.get(e),
            ),
        };

        A::apply_relocation(rel.r_type(e, false), place, value, addend, field)?;
    }
    Ok(())
}

fn write_eh_frame<A: Arch>(ctx: &Context, layout: &Layout, chunk: &Chunk, buf: &mut [u8]) -> Result {
    let e = LittleEndian;
    let base = chunk.shdr.sh_offset;
    let base_addr = chunk.shdr.sh_addr;

    let mut apply = |obj: &ObjectFile,
                     record_in_offset: u32,
                     record_out_offset: u64,
                     rels: &[elf::Rela],
                     buf: &mut [u8]|
     -> Result {
        for rel in rels {
            let rel_offset_in_record = rel.r_offset.get(e) - u64::from(record_in_offset);
            let out_offset = base + record_out_offset + rel_offset_in_record;
            let place = base_addr + record_out_offset + rel_offset_in_record;
            let value = layout.symbol_value(ctx, obj, rel.r_sym(e, false) as usize);
            A::apply_relocation(
                rel.r_type(e, false),
                place,
                value,
                rel.r_addend.get(e),
                &mut buf[out_offset as usize..],
            )?;
        }
        Ok(())
    };

    for &(file_id, cie_idx, out_offset) in &layout.eh_frame.leaders {
        let obj = ctx.object(file_id);
        let cie = &obj.cies[cie_idx as usize];
        let start = (base + out_offset) as usize;
        buf[start..start + cie.len as usize].copy_from_slice(cie.contents(obj));
        apply(obj, cie.input_offset, out_offset, cie.rels(obj), buf)?;
    }

    for instance in &layout.eh_frame.fdes {
        let obj = ctx.object(instance.file);
        let fde = &obj.fdes[instance.fde_idx as usize];
        let start = (base + instance.offset) as usize;
        buf[start..start + fde.len as usize].copy_from_slice(fde.contents(obj));

        // Patch the CIE back-pointer: distance from this FDE's pointer field back to its CIE.
        let cie_offset = layout.eh_frame.cie_offsets[instance.file.0 as usize][fde.cie_idx as usize];
        let back = (instance.offset + 4 - cie_offset) as u32;
        buf[start + 4..start + 8].copy_from_slice(&back.to_le_bytes());

        apply(obj, fde.input_offset, instance.offset, fde.rels(obj), buf)?;
    }

    // The section ends with a zero-length terminator record, already zeroed.
    Ok(())
}

/// Builds the `.eh_frame_hdr` binary-search table: (function address, FDE address) pairs sorted
/// by function address, both encoded relative to the header.
fn write_eh_frame_hdr(ctx: &Context, layout: &Layout, chunk: &Chunk, buf: &mut [u8]) -> Result {
    let e = LittleEndian;
    let hdr_addr = chunk.shdr.sh_addr;
    let eh_frame_addr = layout
        .chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::EhFrame))
        .map_or(0, |c| c.shdr.sh_addr);

    let mut entries: Vec<(i32, i32)> = layout
        .eh_frame
        .fdes
        .iter()
        .map(|instance| {
            let obj = ctx.object(instance.file);
            let fde = &obj.fdes[instance.fde_idx as usize];
            let first_rel = &fde.rels(obj)[0];
            let func = layout
                .symbol_value(ctx, obj, first_rel.r_sym(e, false) as usize)
                .wrapping_add(first_rel.r_addend.get(e) as u64);
            let fde_addr = eh_frame_addr + instance.offset;
            (
                func.wrapping_sub(hdr_addr) as i64 as i32,
                fde_addr.wrapping_sub(hdr_addr) as i64 as i32,
            )
        })
        .collect();
    entries.sort_unstable();

    let start = chunk.shdr.sh_offset as usize;
    buf[start] = 1; // version
    buf[start + 1] = 0x1b; // eh_frame_ptr: pcrel sdata4
    buf[start + 2] = 0x03; // fde_count: udata4
    buf[start + 3] = 0x3b; // table: datarel sdata4

    let eh_frame_ptr = eh_frame_addr.wrapping_sub(hdr_addr + 4) as i64 as i32;
    buf[start + 4..start + 8].copy_from_slice(&eh_frame_ptr.to_le_bytes());
    buf[start + 8..start + 12].copy_from_slice(&(entries.len() as u32).to_le_bytes());

    let mut at = start + 12;
    for (func, fde) in entries {
        buf[at..at + 4].copy_from_slice(&func.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&fde.to_le_bytes());
        at += 8;
    }
    Ok(())
}

fn write_note_property(ctx: &Context, chunk: &Chunk, buf: &mut [u8]) {
    let mut features = u32::MAX;
    for obj in ctx.objects().filter(|o| o.is_alive()) {
        features &= obj.features;
    }

    let start = chunk.shdr.sh_offset as usize;
    buf[start..start + 4].copy_from_slice(&4u32.to_le_bytes()); // n_namesz
    buf[start + 4..start + 8].copy_from_slice(&16u32.to_le_bytes()); // n_descsz
    buf[start + 8..start + 12]
        .copy_from_slice(&object::elf::NT_GNU_PROPERTY_TYPE_0.to_le_bytes());
    buf[start + 12..start + 16].copy_from_slice(b"GNU\0");
    buf[start + 16..start + 20]
        .copy_from_slice(&object::elf::GNU_PROPERTY_X86_FEATURE_1_AND.to_le_bytes());
    buf[start + 20..start + 24].copy_from_slice(&4u32.to_le_bytes());
    buf[start + 24..start + 28].copy_from_slice(&features.to_le_bytes());
}

fn write_build_id(ctx: &Context, chunk: &Chunk, buf: &mut [u8]) {
    let desc: Vec<u8> = match &ctx.args.build_id {
        BuildIdOption::Hex(bytes) => bytes.clone(),
        BuildIdOption::Fast => {
            // A fast non-cryptographic digest of the image is plenty for build IDs.
            let h1 = crate::hash::hash_bytes(buf);
            let h2 = crate::hash::hash_bytes(&h1.to_le_bytes());
            let mut digest = Vec::with_capacity(16);
            digest.extend_from_slice(&h1.to_le_bytes());
            digest.extend_from_slice(&h2.to_le_bytes());
            digest
        }
        BuildIdOption::None => return,
    };

    let start = chunk.shdr.sh_offset as usize;
    buf[start..start + 4].copy_from_slice(&4u32.to_le_bytes());
    buf[start + 4..start + 8].copy_from_slice(&(desc.len() as u32).to_le_bytes());
    buf[start + 8..start + 12].copy_from_slice(&object::elf::NT_GNU_BUILD_ID.to_le_bytes());
    buf[start + 12..start + 16].copy_from_slice(b"GNU\0");
    buf[start + 16..start + 16 + desc.len()].copy_from_slice(&desc);
}

fn write_symtab(ctx: &Context, layout: &Layout, chunk: &Chunk, buf: &mut [u8]) -> Result {
    let e = LittleEndian;
    let strtab_chunk = layout
        .chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::Strtab))
        .context(".symtab without .strtab")?;

    let symtab_base = chunk.shdr.sh_offset as usize;
    let strtab_base = strtab_chunk.shdr.sh_offset as usize;
    let mut strtab_offset = 1u32;
    let entsize = size_of::<elf::SymtabEntry>();

    let tls_base = layout
        .segments
        .iter()
        .find(|s| s.p_type == object::elf::PT_TLS)
        .map_or(0, |s| layout.chunks[s.first_chunk].shdr.sh_addr);

    let mut write_entry = |slot: u32, name: &[u8], mut sym: elf::SymtabEntry, buf: &mut [u8]| {
        sym.st_name = U32::new(e, strtab_offset);
        let at = symtab_base + slot as usize * entsize;
        buf[at..at + entsize].copy_from_slice(object::bytes_of(&sym));

        let at = strtab_base + strtab_offset as usize;
        buf[at..at + name.len()].copy_from_slice(name);
        strtab_offset += name.len() as u32 + 1;
    };

    let section_shndx = |section_ref: SectionRef| -> u16 {
        ctx.input_section(section_ref)
            .and_then(|s| layout.chunk_for_osec(s.output_section))
            .map_or(object::elf::SHN_ABS, |c| c.shndx as u16)
    };

    for file in &ctx.files {
        let LinkFile::Object(obj) = file else {
            continue;
        };
        if !obj.is_alive() {
            continue;
        }

        let mut slot = layout.symtab.local_offsets[obj.file_id.0 as usize];
        for (index, local) in obj.local_syms.iter().enumerate() {
            if !written_local(ctx, obj, local) {
                continue;
            }
            let esym = obj.elf.symbol(object::SymbolIndex(index))?;
            let value = layout.symbol_value(ctx, obj, index);
            let shndx = match local.section {
                Some(section_index) => section_shndx(SectionRef {
                    file: obj.file_id,
                    index: section_index,
                }),
                None => object::elf::SHN_ABS,
            };
            let mut out = *esym;
            out.st_value = U64::new(e, value);
            out.st_shndx = U16::new(e, shndx);
            write_entry(slot, local.name, out, buf);
            slot += 1;
        }

        let mut slot = layout.symtab.global_offsets[obj.file_id.0 as usize];
        for index in obj.first_global()..obj.num_symbols() {
            let Some(id) = written_global(ctx, obj, index) else {
                continue;
            };
            let symbol = ctx.symbol(id);
            symbol.aux_idx.store(slot, Ordering::Relaxed);
            let core = symbol.core();
            let esym = obj.elf.symbol(object::SymbolIndex(core.sym_idx as usize))?;

            let mut value = layout.symbol_address(ctx, id);
            if esym.st_type() == object::elf::STT_TLS {
                value -= tls_base;
            }
            let shndx = match core.origin {
                SymbolOrigin::Section(section_index) => section_shndx(SectionRef {
                    file: obj.file_id,
                    index: section_index,
                }),
                SymbolOrigin::Absolute => object::elf::SHN_ABS,
            };

            let mut out = *esym;
            out.st_value = U64::new(e, value);
            out.st_shndx = U16::new(e, shndx);
            out.st_other = symbol.visibility();
            write_entry(slot, symbol.name, out, buf);
            slot += 1;
        }
    }

    let mut slot = layout.symtab.first_synthetic;
    for &id in &ctx.synthetic_symbols {
        let symbol = ctx.symbol(id);
        let core = symbol.core();
        let out = elf::SymtabEntry {
            st_name: U32::new(e, 0),
            st_info: (object::elf::STB_GLOBAL << 4) | object::elf::STT_NOTYPE,
            st_other: object::elf::STV_HIDDEN,
            st_shndx: U16::new(e, object::elf::SHN_ABS),
            st_value: U64::new(e, core.value),
            st_size: U64::new(e, 0),
        };
        write_entry(slot, symbol.name, out, buf);
        slot += 1;
    }

    Ok(())
}
