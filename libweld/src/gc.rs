//! A mark-sweep garbage collector for --gc-sections. Vertices are input sections, edges are
//! relocations (plus the exception-frame records attached to a function's section). Any section
//! reachable from the root set stays; everything else is killed before output composition.

use crate::context::Context;
use crate::object_file::SectionRef;
use crate::object_file::SymTarget;
use crate::object_file::global_symbol_target;
use crate::symbol::SymbolId;
use crossbeam_queue::SegQueue;
use linker_utils::elf::secnames;
use linker_utils::elf::shf;
use linker_utils::elf::sht;
use linker_utils::utils::is_c_identifier;
use object::LittleEndian;
use object::read::elf::Rela as _;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "GC sections")]
pub(crate) fn gc_sections(ctx: &Context) {
    mark_nonalloc_fragments(ctx);
    let rootset = collect_root_set(ctx);
    mark(ctx, rootset);
    sweep(ctx);
}

/// The no-GC path still needs fragment liveness: every fragment referenced by a live object is
/// kept.
#[tracing::instrument(skip_all, name = "Mark fragments")]
pub(crate) fn mark_all_fragments(ctx: &Context) {
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        for &fragment in &obj.fragments {
            ctx.fragment(fragment).mark_alive();
        }
    });
}

/// Fragments in non-alloc merged sections (e.g. .comment) can't be referenced by relocations from
/// live code, so they're exempt from GC.
fn mark_nonalloc_fragments(ctx: &Context) {
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        for &fragment in &obj.fragments {
            if !ctx.merged_section(fragment.section).is_alloc() {
                ctx.fragment(fragment).mark_alive();
            }
        }
    });
}

fn is_init_fini(section: &crate::object_file::InputSection) -> bool {
    section.info.sh_type == sht::INIT_ARRAY
        || section.info.sh_type == sht::FINI_ARRAY
        || section.info.sh_type == sht::PREINIT_ARRAY
        || section.name().starts_with(secnames::CTORS)
        || section.name().starts_with(secnames::DTORS)
        || section.name().starts_with(secnames::INIT)
        || section.name().starts_with(secnames::FINI)
}

/// Marks a section visited. Returns true if the caller is responsible for expanding it.
fn mark_section(ctx: &Context, section_ref: SectionRef) -> bool {
    ctx.input_section(section_ref).is_some_and(|section| {
        section.is_alive() && !section.is_visited.swap(true, Ordering::Relaxed)
    })
}

fn collect_root_set(ctx: &Context) -> Vec<SectionRef> {
    let rootset = SegQueue::new();

    let enqueue_section = |section_ref: SectionRef| {
        if mark_section(ctx, section_ref) {
            rootset.push(section_ref);
        }
    };

    let enqueue_target = |target: SymTarget| match target {
        SymTarget::Fragment(fragment) => ctx.fragment(fragment).mark_alive(),
        SymTarget::Section(file, index) => enqueue_section(SectionRef { file, index }),
        SymTarget::None => {}
    };

    let enqueue_symbol = |symbol_id: SymbolId| {
        enqueue_target(global_symbol_target(ctx, symbol_id));
    };

    // Sections that aren't subject to garbage collection. Only SHF_ALLOC sections are ever
    // discarded; non-alloc sections are marked visited so the sweep keeps them without the mark
    // phase having to expand them.
    ctx.for_each_object(|obj| {
        for section in obj.sections.iter().flatten() {
            if !section.is_alive() {
                continue;
            }
            if !section.info.sh_flags.contains(shf::ALLOC) {
                section.is_visited.store(true, Ordering::Relaxed);
            }
            if is_init_fini(section)
                || is_c_identifier(section.name())
                || section.info.sh_type == sht::NOTE
            {
                enqueue_section(SectionRef {
                    file: obj.file_id,
                    index: section.index,
                });
            }
        }
    });

    // Sections defining exported symbols.
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        for symbol_ref in &obj.symbols {
            let crate::object_file::SymbolRef::Global(id) = symbol_ref else {
                continue;
            };
            let core = ctx.symbol(*id).core();
            if core.file == Some(obj.file_id) && core.is_exported {
                enqueue_symbol(*id);
            }
        }
    });

    // Sections referenced by root symbols.
    let mut root_names: Vec<&[u8]> = vec![ctx.args.entry_symbol_name()];
    root_names.extend(ctx.args.undefined.iter().map(|n| n.as_bytes()));
    root_names.extend(ctx.args.require_defined.iter().map(|n| n.as_bytes()));
    for name in root_names {
        if let Some(symbol_id) = ctx.lookup(name) {
            enqueue_symbol(symbol_id);
        }
    }

    // CIE records are kept wholesale, so everything they reference is a root.
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        let e = LittleEndian;
        for cie in &obj.cies {
            for rel in cie.rels(obj) {
                enqueue_target(obj.symbol_target(ctx, rel.r_sym(e, false) as usize));
            }
        }
    });

    rootset.into_iter().collect()
}

/// Marks everything reachable from the roots. Work items are visited sections; expanding one
/// yields the sections it references that haven't been visited yet.
fn mark(ctx: &Context, rootset: Vec<SectionRef>) {
    crate::threading::for_each_spawn(rootset, |section_ref| expand_section(ctx, section_ref));
}

fn expand_section<'data>(ctx: &Context<'data>, section_ref: SectionRef) -> Vec<SectionRef> {
    let e = LittleEndian;
    let obj = ctx.object(section_ref.file);
    let Some(section) = obj.section(section_ref.index) else {
        return Vec::new();
    };
    debug_assert!(section.is_visited.load(Ordering::Relaxed));

    let mut found = Vec::new();
    let mut follow = |target: SymTarget, found: &mut Vec<SectionRef>| match target {
        SymTarget::Fragment(fragment) => ctx.fragment(fragment).mark_alive(),
        SymTarget::Section(file, index) => {
            let next = SectionRef { file, index };
            if mark_section(ctx, next) {
                found.push(next);
            }
        }
        SymTarget::None => {}
    };

    // Relocations that were re-bound to fragments of mergeable sections.
    if let Some(rel_fragments) = &section.rel_fragments {
        for fragment_ref in rel_fragments.iter() {
            if fragment_ref.rel_idx == crate::object_file::REL_FRAGMENT_SENTINEL {
                break;
            }
            ctx.fragment(fragment_ref.fragment).mark_alive();
        }
    }

    // If this is a text section, keep the unwind records that describe it: every symbol an
    // associated FDE references beyond its first relocation (which points back at this section)
    // is reachable.
    for fde in &obj.fdes[section.fdes()] {
        for rel in &fde.rels(obj)[1..] {
            follow(obj.symbol_target(ctx, rel.r_sym(e, false) as usize), &mut found);
        }
    }

    for rel in section.rels {
        follow(obj.symbol_target(ctx, rel.r_sym(e, false) as usize), &mut found);
    }

    found
}

fn sweep(ctx: &Context) {
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        for section in obj.sections.iter().flatten() {
            if section.is_alive() && !section.is_visited.load(Ordering::Relaxed) {
                if ctx.args.print_gc_sections {
                    println!(
                        "removing unused section {}:({})",
                        obj,
                        String::from_utf8_lossy(section.name())
                    );
                }
                section.kill();
            }
        }
    });
}
