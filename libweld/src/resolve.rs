//! Symbol resolution. Every global symbol ends up with at most one owning definition, chosen by
//! rank: strong beats weak beats shared-library beats lazy-archive beats common, with file
//! priority (command-line order) breaking ties. The passes run in a fixed order with a barrier
//! between each: lazy resolution for archive members, regular objects, shared objects, archive
//! liveness, then common symbols and finally claiming of whatever is still unresolved.

use crate::args::UnresolvedKind;
use crate::context::Context;
use crate::elf;
use crate::object_file::LinkFile;
use crate::object_file::ObjectFile;
use crate::object_file::SharedFile;
use crate::object_file::SymbolRef;
use crate::symbol::DefinitionClass;
use crate::symbol::FileId;
use crate::symbol::SymbolCore;
use crate::symbol::SymbolOrigin;
use crate::symbol::rank;
use anyhow::bail;
use linker_utils::elf::shf;
use linker_utils::elf::sht;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

/// Marks objects named by --exclude-libs: their defined symbols get demoted to hidden while
/// their liveness is marked. This applies uniformly, even to weak definitions.
#[tracing::instrument(skip_all, name = "Apply exclude-libs")]
pub(crate) fn apply_exclude_libs(ctx: &mut Context) {
    if ctx.args.exclude_libs.is_empty() {
        return;
    }
    let all = ctx.args.exclude_libs.iter().any(|lib| lib == "ALL");
    let patterns: Vec<&[u8]> = ctx.args.exclude_libs.iter().map(|l| l.as_bytes()).collect();

    for file in &mut ctx.files {
        let LinkFile::Object(obj) = file else {
            continue;
        };
        if obj.input.member.is_none() {
            continue;
        }
        let archive_name = obj
            .input
            .path
            .file_name()
            .map(|n| n.as_encoded_bytes())
            .unwrap_or_default();
        if all || patterns.iter().any(|p| *p == archive_name) {
            obj.exclude_libs = true;
        }
    }
}

#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub(crate) fn resolve_symbols(ctx: &Context) -> crate::error::Result {
    // Pass 1 & 2: register definitions. Archive members only advertise lazy definitions; loading
    // is decided by the liveness traversal below. Both object-file families resolve into the same
    // symbol table.
    ctx.for_each_file(|file| match file {
        LinkFile::Object(obj) => {
            if obj.is_in_lib {
                resolve_lazy_symbols(ctx, obj);
            } else {
                resolve_regular_symbols(ctx, obj);
            }
        }
        LinkFile::MachObject(obj) => {
            if obj.is_in_lib {
                obj.resolve_lazy_symbols(ctx);
            } else {
                obj.resolve_regular_symbols(ctx);
            }
        }
        LinkFile::Dso(_) | LinkFile::MachDylib(_) => {}
    });

    // Pass 3: dynamic libraries.
    ctx.for_each_file(|file| match file {
        LinkFile::Dso(dso) => resolve_dso_symbols(ctx, dso),
        LinkFile::MachDylib(dylib) => dylib.resolve_symbols(ctx),
        _ => {}
    });

    // Pass 4a: archive liveness. Starting from the explicitly-live objects and the forced roots,
    // every strong undefined reference into an unloaded archive member activates that member,
    // which may in turn activate more.
    let mut live: Vec<FileId> = ctx
        .files
        .iter()
        .filter(|file| !file.is_dso() && file.is_alive())
        .map(|file| file.file_id())
        .collect();

    for name in ctx.args.undefined.iter().chain(&ctx.args.require_defined) {
        if let Some(symbol_id) = ctx.lookup(name.as_bytes()) {
            let core = ctx.symbol(symbol_id).core();
            if let Some(file_id) = core.file {
                let file = ctx.file(file_id);
                if file.mark_alive() && !file.is_dso() {
                    live.push(file_id);
                }
            }
        }
    }

    crate::threading::for_each_spawn(live, |file_id| match ctx.file(file_id) {
        LinkFile::Object(obj) => mark_live_objects(ctx, obj),
        LinkFile::MachObject(obj) => obj.mark_live_objects(ctx),
        _ => Vec::new(),
    });

    // Unloaded archive members must not provide definitions: reset every symbol they own.
    ctx.for_each_file(|file| match file {
        LinkFile::Object(obj) if !obj.is_alive() => {
            reset_owned_symbols(ctx, obj.file_id, &obj.symbols);
        }
        LinkFile::MachObject(obj) if !obj.is_alive() => obj.reset_owned_symbols(ctx),
        _ => {}
    });

    // Strong undefined references into shared objects keep those shared objects alive.
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        let e = LittleEndian;
        for index in obj.first_global()..obj.num_symbols() {
            let SymbolRef::Global(id) = obj.symbols[index] else {
                continue;
            };
            let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
                continue;
            };
            if !esym.is_undefined(e) || esym.is_weak() {
                continue;
            }
            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if let Some(file_id) = core.file {
                if ctx.file(file_id).is_dso() {
                    ctx.file(file_id).mark_alive();
                    core.is_weak = false;
                }
            }
        }
    });

    // Shared objects referenced by live shared objects are also alive.
    let live_dsos: Vec<FileId> = ctx
        .dsos()
        .filter(|dso| dso.is_alive())
        .map(|dso| dso.file_id)
        .collect();
    crate::threading::for_each_spawn(live_dsos, |file_id| {
        let LinkFile::Dso(dso) = ctx.file(file_id) else {
            return Vec::new();
        };
        let mut feeder = Vec::new();
        for &symbol_id in &dso.globals {
            let core = ctx.symbol(symbol_id).core();
            if let Some(owner) = core.file {
                if owner != dso.file_id && ctx.file(owner).is_dso() && ctx.file(owner).mark_alive()
                {
                    feeder.push(owner);
                }
            }
        }
        feeder
    });

    ctx.for_each_file(|file| match file {
        LinkFile::Dso(dso) if !dso.is_alive() => reset_dso_symbols(ctx, dso),
        LinkFile::MachDylib(dylib) if !dylib.is_alive() => dylib.reset_owned_symbols(ctx),
        _ => {}
    });

    // Pass 5: common symbols resolve last so that any real definition beats them.
    ctx.for_each_object(|obj| {
        if obj.is_alive() {
            resolve_common_symbols(ctx, obj);
        }
    });

    if let Some(symbol_id) = ctx.lookup(b"__gnu_lto_slim") {
        if let Some(file_id) = ctx.symbol(symbol_id).core().file {
            bail!(
                "{}: looks like this file contains GCC intermediate code, but LTO is not supported",
                ctx.file(file_id)
            );
        }
    }

    Ok(())
}

fn definition_class(esym: &elf::SymtabEntry, is_lazy: bool, is_dso: bool) -> DefinitionClass {
    let e = LittleEndian;
    if esym.is_common(e) {
        DefinitionClass::Common
    } else if is_lazy {
        DefinitionClass::Lazy
    } else if is_dso {
        if esym.is_weak() {
            DefinitionClass::DsoWeak
        } else {
            DefinitionClass::DsoStrong
        }
    } else if esym.is_weak() {
        DefinitionClass::Weak
    } else {
        DefinitionClass::Strong
    }
}

/// Replaces a symbol's definition. The caller holds the symbol's lock and has already decided the
/// candidate outranks the incumbent.
fn override_symbol(
    ctx: &Context,
    core: &mut SymbolCore,
    obj: &ObjectFile,
    sym_idx: usize,
    esym: &elf::SymtabEntry,
    new_rank: u64,
) {
    let e = LittleEndian;
    core.rank = new_rank;
    core.file = Some(obj.file_id);
    core.origin = if esym.is_absolute(e) {
        SymbolOrigin::Absolute
    } else {
        match obj.elf.symbol_section(esym, object::SymbolIndex(sym_idx)) {
            Ok(Some(section)) => SymbolOrigin::Section(section),
            _ => SymbolOrigin::Absolute,
        }
    };
    core.value = match obj.sym_fragments[sym_idx].fragment {
        Some(_) => obj.sym_fragments[sym_idx].addend,
        None => esym.st_value.get(e),
    };
    core.sym_idx = sym_idx as u32;
    core.ver_idx = ctx.args.default_version;
    core.is_lazy = false;
    core.is_weak = esym.is_weak();
    core.is_imported = false;
    core.is_exported = false;
    core.is_synthetic = false;
}

fn resolve_lazy_symbols(ctx: &Context, obj: &ObjectFile) {
    debug_assert!(obj.is_in_lib);
    let e = LittleEndian;

    for index in obj.first_global()..obj.num_symbols() {
        let SymbolRef::Global(id) = obj.symbols[index] else {
            continue;
        };
        let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
            continue;
        };
        if esym.is_undefined(e) || esym.is_common(e) {
            continue;
        }

        let new_rank = rank(DefinitionClass::Lazy, obj.priority);
        let symbol = ctx.symbol(id);
        let mut core = symbol.lock();
        if new_rank < core.rank {
            core.rank = new_rank;
            core.file = Some(obj.file_id);
            core.sym_idx = index as u32;
            core.is_lazy = true;
            core.is_weak = false;
        }
    }
}

fn resolve_regular_symbols(ctx: &Context, obj: &ObjectFile) {
    debug_assert!(!obj.is_in_lib);
    let e = LittleEndian;

    for index in obj.first_global()..obj.num_symbols() {
        let SymbolRef::Global(id) = obj.symbols[index] else {
            continue;
        };
        let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
            continue;
        };
        if esym.is_undefined(e) || esym.is_common(e) {
            continue;
        }

        let new_rank = rank(definition_class(esym, false, false), obj.priority);
        let symbol = ctx.symbol(id);
        let mut core = symbol.lock();
        if new_rank < core.rank {
            override_symbol(ctx, &mut core, obj, index, esym, new_rank);
        }
    }
}

fn resolve_dso_symbols(ctx: &Context, dso: &SharedFile) {
    let e = LittleEndian;
    for i in 0..dso.symbols.len() {
        let Ok(esym) = dso.elf.symbol(dso.defined_syms[i]) else {
            continue;
        };
        let new_rank = rank(definition_class(esym, false, true), dso.priority);

        let symbol = ctx.symbol(dso.symbols[i]);
        let mut core = symbol.lock();
        if new_rank < core.rank {
            core.rank = new_rank;
            core.file = Some(dso.file_id);
            core.origin = SymbolOrigin::Absolute;
            core.value = esym.st_value.get(e);
            core.sym_idx = dso.defined_syms[i].0 as u32;
            core.ver_idx = dso.versyms[i];
            core.is_lazy = false;
            core.is_weak = esym.is_weak();
            core.is_imported = true;
            core.is_exported = false;
        }
    }
}

/// Walks one live object's globals: merges visibility, activates archive members reached by
/// strong undefined references (returning them as new work), and registers this file's own
/// definitions.
fn mark_live_objects(ctx: &Context, obj: &ObjectFile) -> Vec<FileId> {
    debug_assert!(obj.is_alive());
    let e = LittleEndian;
    let mut feeder = Vec::new();

    for index in obj.first_global()..obj.num_symbols() {
        let SymbolRef::Global(id) = obj.symbols[index] else {
            continue;
        };
        let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
            continue;
        };
        let symbol = ctx.symbol(id);

        let mut visibility = esym.st_visibility();
        if esym.is_definition(e) && obj.exclude_libs {
            visibility = object::elf::STV_HIDDEN;
        }
        symbol.merge_visibility(visibility);

        if esym.is_undefined(e) || esym.is_common(e) {
            // Weak references don't pull in archive members.
            if esym.is_weak() {
                continue;
            }
            let core = symbol.lock();
            if let Some(file_id) = core.file {
                let file = ctx.file(file_id);
                if !file.is_dso() && file.mark_alive() {
                    feeder.push(file_id);
                }
            }
            continue;
        }

        let new_rank = rank(definition_class(esym, false, false), obj.priority);
        let mut core = symbol.lock();
        if new_rank < core.rank {
            override_symbol(ctx, &mut core, obj, index, esym, new_rank);
        }
    }

    feeder
}

fn resolve_common_symbols(ctx: &Context, obj: &ObjectFile) {
    if !obj.has_common_symbol {
        return;
    }
    let e = LittleEndian;

    for index in obj.first_global()..obj.num_symbols() {
        let SymbolRef::Global(id) = obj.symbols[index] else {
            continue;
        };
        let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
            continue;
        };
        if !esym.is_common(e) {
            continue;
        }

        let new_rank = rank(DefinitionClass::Common, obj.priority);
        let symbol = ctx.symbol(id);
        let mut core = symbol.lock();
        if new_rank < core.rank {
            core.rank = new_rank;
            core.file = Some(obj.file_id);
            core.origin = SymbolOrigin::Absolute;
            // For a common symbol st_value holds the required alignment.
            core.value = esym.st_value.get(e);
            core.sym_idx = index as u32;
            core.ver_idx = ctx.args.default_version;
            core.is_lazy = false;
            core.is_weak = false;
            core.is_imported = false;
            core.is_exported = false;
        }
    }
}

fn reset_owned_symbols(ctx: &Context, file_id: FileId, symbols: &[SymbolRef]) {
    for symbol_ref in symbols {
        let SymbolRef::Global(id) = symbol_ref else {
            continue;
        };
        let symbol = ctx.symbol(*id);
        let mut core = symbol.lock();
        if core.file == Some(file_id) {
            *core = SymbolCore::unclaimed();
        }
    }
}

fn reset_dso_symbols(ctx: &Context, dso: &SharedFile) {
    for &id in &dso.symbols {
        let symbol = ctx.symbol(id);
        let mut core = symbol.lock();
        if core.file == Some(dso.file_id) {
            *core = SymbolCore::unclaimed();
        }
    }
}

/// Converts surviving common symbols into synthetic NOBITS sections. A file that lost its common
/// symbol to a bigger one elsewhere just drops it (with a warning under --warn-common).
#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub(crate) fn convert_common_symbols(ctx: &mut Context) {
    let multiple_commons = crossbeam_queue::SegQueue::new();
    let Context {
        files,
        symbols,
        output_sections,
        args,
        ..
    } = ctx;
    let symbols = &*symbols;
    let output_sections = &*output_sections;
    let warn_common = args.warn_common;

    files.par_iter_mut().for_each(|file| {
        let LinkFile::Object(obj) = file else {
            return;
        };
        if !obj.is_alive() || !obj.has_common_symbol {
            return;
        }
        let e = LittleEndian;

        for index in obj.elf.first_global..obj.symbols.len() {
            let SymbolRef::Global(id) = obj.symbols[index] else {
                continue;
            };
            let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
                continue;
            };
            if !esym.is_common(e) {
                continue;
            }

            let symbol = symbols.value(id.0);
            let mut core = symbol.lock();
            if core.file != Some(obj.file_id) {
                if warn_common {
                    multiple_commons.push(format!(
                        "{}: multiple common symbols: {}",
                        obj.input,
                        symbol.display(true)
                    ));
                }
                continue;
            }

            let section_index = object::SectionIndex(obj.sections.len());
            let mut section = crate::object_file::InputSection::new_synthetic(
                elf::SectionInfo {
                    name: linker_utils::elf::secnames::COMMON,
                    sh_type: sht::NOBITS,
                    sh_flags: shf::ALLOC.with(shf::WRITE),
                    sh_size: esym.st_size.get(e),
                    sh_addralign: esym.st_value.get(e).max(1),
                    sh_entsize: 0,
                },
                section_index,
            );
            section.output_section = output_sections.get_or_create(
                linker_utils::elf::secnames::COMMON,
                sht::NOBITS,
                shf::ALLOC.with(shf::WRITE),
            );
            obj.sections.push(Some(section));
            obj.sym_fragments.push(Default::default());
            obj.mergeable_sections.push(None);

            core.origin = SymbolOrigin::Section(section_index);
            core.value = 0;
        }
    });

    while let Some(message) = multiple_commons.pop() {
        ctx.warn(message);
    }
}

/// Applies the configured policy to references that never found a definition.
#[tracing::instrument(skip_all, name = "Claim unresolved symbols")]
pub(crate) fn claim_unresolved_symbols(ctx: &Context) {
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        let e = LittleEndian;

        for index in obj.first_global()..obj.num_symbols() {
            let SymbolRef::Global(id) = obj.symbols[index] else {
                continue;
            };
            let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
                continue;
            };
            if !esym.is_undefined(e) {
                continue;
            }

            let symbol = ctx.symbol(id);
            let mut core = symbol.lock();
            if core.file.is_some() || core.is_synthetic {
                continue;
            }

            let is_weak = esym.is_weak();
            let mut claim = |core: &mut SymbolCore, is_imported: bool| {
                core.rank = rank(DefinitionClass::Strong, obj.priority);
                core.file = Some(obj.file_id);
                core.origin = SymbolOrigin::Absolute;
                core.value = 0;
                core.sym_idx = index as u32;
                core.ver_idx = ctx.args.default_version;
                core.is_lazy = false;
                core.is_weak = false;
                core.is_imported = is_imported;
                core.is_exported = false;
            };

            // Unresolved symbols traditionally only fail the link for executables. In a shared
            // object they're promoted to dynamic symbols so the runtime gets another chance,
            // unless -z defs. Weak undefineds are promoted even with -z defs; some major
            // programs depend on that loophole.
            if ctx.args.shared && (!ctx.args.z_defs || is_weak) {
                claim(&mut core, !ctx.args.is_static);
            } else if ctx.args.unresolved_symbols != UnresolvedKind::Error || is_weak {
                claim(&mut core, false);
                if ctx.args.unresolved_symbols == UnresolvedKind::Warn && !is_weak {
                    ctx.warn(format_args!(
                        "undefined symbol: {}: {}",
                        obj.input,
                        symbol.display(ctx.args.demangle)
                    ));
                }
            } else {
                ctx.error(format_args!(
                    "undefined symbol: {}: {}",
                    obj.input,
                    symbol.display(ctx.args.demangle)
                ));
            }
        }
    });

    ctx.for_each_mach_object(|obj| {
        if obj.is_alive() {
            obj.claim_unresolved_symbols(ctx);
        }
    });

    // --require-defined names must have a real definition by now.
    for name in &ctx.args.require_defined {
        let defined = ctx
            .lookup(name.as_bytes())
            .map(|id| ctx.symbol(id).core())
            .is_some_and(|core| core.is_defined());
        if !defined {
            ctx.error(format_args!("required symbol is not defined: {name}"));
        }
    }
}

/// Reports multiply-defined strong symbols. Weak pairs and comdat-deduplicated definitions are
/// fine; two surviving strong definitions are not.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub(crate) fn check_duplicate_symbols(ctx: &Context) {
    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        let e = LittleEndian;

        for index in obj.first_global()..obj.num_symbols() {
            let SymbolRef::Global(id) = obj.symbols[index] else {
                continue;
            };
            let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
                continue;
            };
            if esym.is_undefined(e) || esym.is_common(e) || esym.is_weak() {
                continue;
            }

            // A definition in a section that comdat deduplication killed doesn't count.
            if !esym.is_absolute(e) {
                let alive = obj
                    .elf
                    .symbol_section(esym, object::SymbolIndex(index))
                    .ok()
                    .flatten()
                    .and_then(|s| obj.section(s))
                    .is_some_and(|s| s.is_alive());
                if !alive {
                    continue;
                }
            }

            let symbol = ctx.symbol(id);
            let core = symbol.core();
            if core.file == Some(obj.file_id) || core.file.is_none() {
                continue;
            }

            ctx.error(format_args!(
                "duplicate symbol: {}: {}: {}",
                obj.input,
                ctx.file(core.file.unwrap()),
                symbol.display(ctx.args.demangle)
            ));
        }
    });

    ctx.for_each_mach_object(|obj| {
        if obj.is_alive() {
            obj.check_duplicate_symbols(ctx);
        }
    });
}

/// Decides which symbols are imported and exported.
#[tracing::instrument(skip_all, name = "Compute import/export")]
pub(crate) fn compute_import_export(ctx: &Context) {
    // Symbols defined here but referenced by a live shared object must be exported.
    if !ctx.args.shared {
        ctx.for_each_dso(|dso| {
            if !dso.is_alive() {
                return;
            }
            for &id in &dso.globals {
                let symbol = ctx.symbol(id);
                if symbol.visibility() == object::elf::STV_HIDDEN {
                    continue;
                }
                let mut core = symbol.lock();
                if core.file.is_some_and(|f| !ctx.file(f).is_dso()) {
                    core.is_exported = true;
                }
            }
        });
    }

    // Global symbols are exported from shared objects by default, and from executables under
    // --export-dynamic.
    if ctx.args.shared || ctx.args.export_dynamic {
        ctx.for_each_object(|obj| {
            if !obj.is_alive() {
                return;
            }
            let e = LittleEndian;
            for index in obj.first_global()..obj.num_symbols() {
                let SymbolRef::Global(id) = obj.symbols[index] else {
                    continue;
                };
                let Ok(esym) = obj.elf.symbol(object::SymbolIndex(index)) else {
                    continue;
                };
                let symbol = ctx.symbol(id);
                if symbol.visibility() == object::elf::STV_HIDDEN {
                    continue;
                }

                let mut core = symbol.lock();
                if core.file != Some(obj.file_id) || core.ver_idx == object::elf::VER_NDX_LOCAL {
                    continue;
                }
                core.is_exported = true;

                if ctx.args.shared
                    && symbol.visibility() != object::elf::STV_PROTECTED
                    && !ctx.args.b_symbolic
                    && !(ctx.args.b_symbolic_functions
                        && esym.st_type() == object::elf::STT_FUNC)
                {
                    core.is_imported = true;
                }
            }
        });
    }
}

/// Applies --version-pattern globs to defined symbols.
#[tracing::instrument(skip_all, name = "Apply version patterns")]
pub(crate) fn apply_version_patterns(ctx: &Context) {
    for pattern in &ctx.args.version_patterns {
        if !pattern.pattern.contains('*') && !pattern.pattern.contains('?') {
            if let Some(id) = ctx.lookup(pattern.pattern.as_bytes()) {
                let symbol = ctx.symbol(id);
                let mut core = symbol.lock();
                if core.file.is_some_and(|f| !ctx.file(f).is_dso()) {
                    core.ver_idx = pattern.ver_idx;
                }
            }
            continue;
        }

        let Ok(glob) = glob::Pattern::new(&pattern.pattern) else {
            ctx.error(format_args!("invalid version pattern: {}", pattern.pattern));
            continue;
        };

        ctx.for_each_object(|obj| {
            if !obj.is_alive() {
                return;
            }
            for index in obj.first_global()..obj.num_symbols() {
                let SymbolRef::Global(id) = obj.symbols[index] else {
                    continue;
                };
                let symbol = ctx.symbol(id);
                let Ok(name) = std::str::from_utf8(symbol.name) else {
                    continue;
                };
                if !glob.matches(name) {
                    continue;
                }
                let mut core = symbol.lock();
                if core.file == Some(obj.file_id) {
                    core.ver_idx = pattern.ver_idx;
                }
            }
        });
    }
}

/// Resolves `@version` suffixes recorded at parse time against --version-definition names.
#[tracing::instrument(skip_all, name = "Parse symbol versions")]
pub(crate) fn parse_symbol_versions(ctx: &Context) {
    if !ctx.args.shared {
        return;
    }

    ctx.for_each_object(|obj| {
        if !obj.is_alive() {
            return;
        }
        for index in obj.first_global()..obj.num_symbols() {
            let Some(mut version) = obj.symvers[index - obj.first_global()] else {
                continue;
            };
            let SymbolRef::Global(id) = obj.symbols[index] else {
                continue;
            };
            let symbol = ctx.symbol(id);
            {
                let core = symbol.core();
                if core.file != Some(obj.file_id) {
                    continue;
                }
            }

            let is_default = if let Some(rest) = version.strip_prefix(b"@") {
                version = rest;
                true
            } else {
                false
            };

            let Some(position) = ctx
                .args
                .version_definitions
                .iter()
                .position(|v| v.as_bytes() == version)
            else {
                ctx.error(format_args!(
                    "{}: symbol {} has undefined version {}",
                    obj.input,
                    symbol.display(ctx.args.demangle),
                    String::from_utf8_lossy(version)
                ));
                continue;
            };

            let mut ver_idx = position as u16 + crate::args::VER_NDX_LAST_RESERVED + 1;
            if !is_default {
                ver_idx |= object::elf::VERSYM_HIDDEN;
            }
            symbol.lock().ver_idx = ver_idx;
        }
    });
}
