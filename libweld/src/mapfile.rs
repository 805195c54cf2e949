//! Writes the link map requested with --Map: every output section, its member input sections,
//! and the symbols defined in each member, with addresses and sizes.

use crate::context::Context;
use crate::error::Context as _;
use crate::error::Result;
use crate::layout::ChunkKind;
use crate::layout::Layout;
use crate::object_file::SectionRef;
use crate::object_file::SymbolRef;
use crate::symbol::SymbolOrigin;
use hashbrown::HashMap;
use std::io::Write as _;

#[tracing::instrument(skip_all, name = "Write map file")]
pub(crate) fn print_map(ctx: &Context, layout: &Layout) -> Result {
    let Some(path) = &ctx.args.map_file else {
        return Ok(());
    };
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    let section_symbols = collect_section_symbols(ctx, layout);

    writeln!(out, "             VMA       Size Align Out     In      Symbol")?;

    for chunk in &layout.chunks {
        if chunk.shndx == 0 {
            continue;
        }
        writeln!(
            out,
            "{:>16x} {:>10x} {:>5} {}",
            chunk.shdr.sh_addr,
            chunk.shdr.sh_size,
            chunk.shdr.sh_addralign,
            String::from_utf8_lossy(chunk.name)
        )?;

        let ChunkKind::Regular { members, .. } = &chunk.kind else {
            continue;
        };
        for member in members {
            let Some(section) = ctx.input_section(*member) else {
                continue;
            };
            let address = layout.section_address(ctx, *member);
            writeln!(
                out,
                "{:>16x} {:>10x} {:>5}         {}",
                address,
                section.info.sh_size,
                section.info.sh_addralign,
                ctx.file(member.file)
            )?;

            if let Some(symbols) = section_symbols.get(member) {
                for (value, name) in symbols {
                    writeln!(out, "{:>16x}          0     0                 {name}", value)?;
                }
            }
        }
    }

    Ok(())
}

/// Maps each input section to the symbols defined in it, sorted by address.
fn collect_section_symbols(
    ctx: &Context,
    layout: &Layout,
) -> HashMap<SectionRef, Vec<(u64, String)>> {
    let mut map: HashMap<SectionRef, Vec<(u64, String)>> = HashMap::new();

    for obj in ctx.objects().filter(|o| o.is_alive()) {
        for (index, symbol_ref) in obj.symbols.iter().enumerate() {
            let (section, name) = match symbol_ref {
                SymbolRef::Local(local) => {
                    let local = &obj.local_syms[*local as usize];
                    if !local.write_to_symtab {
                        continue;
                    }
                    let Some(section) = local.section else {
                        continue;
                    };
                    (section, local.name)
                }
                SymbolRef::Global(id) => {
                    let symbol = ctx.symbol(*id);
                    let core = symbol.core();
                    if core.file != Some(obj.file_id) || core.sym_idx as usize != index {
                        continue;
                    }
                    let SymbolOrigin::Section(section) = core.origin else {
                        continue;
                    };
                    (section, symbol.name)
                }
            };

            let section_ref = SectionRef {
                file: obj.file_id,
                index: section,
            };
            let value = layout.symbol_value(ctx, obj, index);
            let name = if ctx.args.demangle {
                std::str::from_utf8(name)
                    .map(|n| symbolic_demangle::demangle(n).into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(name).into_owned())
            } else {
                String::from_utf8_lossy(name).into_owned()
            };
            map.entry(section_ref).or_default().push((value, name));
        }
    }

    for symbols in map.values_mut() {
        symbols.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    }
    map
}
