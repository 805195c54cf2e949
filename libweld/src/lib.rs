//! weld - a parallel linker.
//!
//! The pipeline is a sequence of barriered passes over the input files: parse, resolve symbols
//! (deciding which archive members to load), deduplicate comdat groups, garbage-collect sections,
//! merge string fragments, process exception frames, then compose and write the output. Within a
//! pass everything runs data-parallel over files or output sections; the pass boundaries are the
//! only global synchronization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) mod aarch64;
pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod comdat;
pub(crate) mod context;
pub(crate) mod eh_frame;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod fs;
pub(crate) mod gc;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod intern;
pub(crate) mod layout;
pub(crate) mod macho;
pub(crate) mod mapfile;
pub(crate) mod merge;
pub(crate) mod object_file;
pub(crate) mod output_section;
pub(crate) mod resolve;
pub(crate) mod symbol;
pub(crate) mod threading;
pub(crate) mod x86_64;

use crate::arch::Arch;
use crate::arch::Architecture;
use crate::args::Args;
use crate::context::Context;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputBytes;
use crate::input_data::InputData;
use crate::object_file::LinkFile;
use crate::symbol::FileId;
use anyhow::bail;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

pub struct Linker {
    action: args::Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> Result<Self> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> Result {
        match &self.action {
            args::Action::Link(args) => {
                tracing_subscriber::registry()
                    .with(fmt::layer())
                    .with(EnvFilter::from_default_env())
                    .try_init()
                    .ok();
                match args.arch {
                    Architecture::X86_64 => link::<x86_64::X86_64>(args),
                    Architecture::AArch64 => link::<aarch64::AArch64>(args),
                }
            }
            args::Action::Version => {
                println!("weld {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link<A: Arch>(args: &Args) -> Result {
    args.setup_thread_pool()?;

    let input_data = InputData::from_args(args)?;
    let inputs = input_data.expand_archives()?;
    if inputs.is_empty() {
        bail!("no input files");
    }

    let (num_globals, num_groups) = estimate_counts(&inputs);
    let herd = bumpalo_herd::Herd::new();
    let mut ctx = Context::new(args, &herd, num_globals.max(1), num_groups.max(1));

    // --wrap names must carry their flag before the first file interns them.
    for name in &args.wrap {
        ctx.intern_wrapped(name.as_bytes());
    }

    // The linker identifies itself in .comment, like compilers do.
    let comment_section = ctx.merged_registry.get_or_create(
        linker_utils::elf::secnames::COMMENT,
        linker_utils::elf::sht::PROGBITS,
        linker_utils::elf::shf::MERGE.with(linker_utils::elf::shf::STRINGS),
    );
    ctx.merged_registry.add_piece_estimate(comment_section, 1);

    parse_input_files(&mut ctx, &inputs)?;

    ctx.merged = ctx.merged_registry.build();
    {
        let comment = ctx.save_bytes(&[b"weld ", env!("CARGO_PKG_VERSION").as_bytes(), b"\0"]);
        let merged = &ctx.merged[comment_section.0 as usize];
        let slot = merged.insert(comment, hash::hash_bytes(comment), 1);
        merged.fragment(slot).mark_alive();
    }

    register_section_pieces(&mut ctx)?;

    resolve::apply_exclude_libs(&mut ctx);
    resolve::resolve_symbols(&ctx)?;
    ctx.checkpoint()?;

    comdat::resolve_comdat_groups(&ctx);
    comdat::eliminate_duplicate_comdat_groups(&ctx);

    resolve::convert_common_symbols(&mut ctx);
    layout::define_synthetic_symbols(&mut ctx);

    resolve::apply_version_patterns(&ctx);
    resolve::parse_symbol_versions(&ctx);
    resolve::compute_import_export(&ctx);

    resolve::claim_unresolved_symbols(&ctx);
    ctx.checkpoint()?;

    if args.gc_sections {
        gc::gc_sections(&ctx);
    } else {
        gc::mark_all_fragments(&ctx);
    }

    resolve::check_duplicate_symbols(&ctx);
    ctx.checkpoint()?;

    // Mach-O inputs run through parsing and resolution on the shared model; composing and
    // writing a Mach-O image is the darwin output layer's job, which this driver doesn't carry.
    if ctx.has_macho_inputs() {
        bail!("inputs are Mach-O: symbol resolution completed, but writing Mach-O images is not supported by this driver");
    }

    let layout = layout::compute(&mut ctx)?;
    elf_writer::write::<A>(&ctx, &layout)?;
    mapfile::print_map(&ctx, &layout)?;

    if let Some(tar_path) = &args.repro {
        fs::write_repro_tar(tar_path, &input_data.input_paths())?;
    }

    ctx.checkpoint()
}

#[tracing::instrument(skip_all, name = "Parse input files")]
fn parse_input_files<'data>(ctx: &mut Context<'data>, inputs: &[InputBytes<'data>]) -> Result {
    let files: Vec<LinkFile<'data>> = {
        let ctx: &Context<'data> = ctx;
        inputs
            .par_iter()
            .map(|input| -> Result<LinkFile<'data>> {
                match input.kind {
                    FileKind::ElfObject => {
                        Ok(LinkFile::Object(object_file::parse_object(ctx, input)?))
                    }
                    FileKind::ElfDynamic => {
                        Ok(LinkFile::Dso(object_file::parse_shared(ctx, input)?))
                    }
                    FileKind::MachOObject => {
                        Ok(LinkFile::MachObject(macho::MachObjectFile::parse(ctx, input)?))
                    }
                    FileKind::MachODylib => {
                        Ok(LinkFile::MachDylib(macho::MachDylibFile::parse(ctx, input)?))
                    }
                    FileKind::Archive | FileKind::ThinArchive => {
                        unreachable!("archives are expanded before parsing")
                    }
                }
            })
            .collect::<Result<_>>()?
    };

    ctx.files = files;
    for (index, file) in ctx.files.iter_mut().enumerate() {
        match file {
            LinkFile::Object(obj) => obj.file_id = FileId(index as u32),
            LinkFile::Dso(dso) => dso.file_id = FileId(index as u32),
            LinkFile::MachObject(obj) => obj.file_id = FileId(index as u32),
            LinkFile::MachDylib(dylib) => dylib.file_id = FileId(index as u32),
        }
    }
    Ok(())
}

#[tracing::instrument(skip_all, name = "Register section pieces")]
fn register_section_pieces(ctx: &mut Context) -> Result {
    let Context { files, merged, .. } = ctx;
    let merged = &*merged;
    files.par_iter_mut().try_for_each(|file| {
        if let LinkFile::Object(obj) = file {
            object_file::register_section_pieces(merged, obj)?;
        }
        Ok(())
    })
}

/// Upper-bound estimates used to size the concurrent maps before the parallel phase starts. This
/// reads only headers and section tables, not contents.
fn estimate_counts(inputs: &[InputBytes]) -> (usize, usize) {
    let e = LittleEndian;
    inputs
        .par_iter()
        .map(|input| {
            let mut num_symbols = 0usize;
            let mut num_groups = 0usize;
            match input.kind {
                FileKind::MachOObject | FileKind::MachODylib => {
                    num_symbols += macho::estimate_symbol_count(input.data);
                }
                _ => {
                    if let Ok(header) = elf::FileHeader::parse(input.data) {
                        if let Ok(sections) = header.sections(e, input.data) {
                            for section in sections.iter() {
                                match section.sh_type.get(e) {
                                    object::elf::SHT_SYMTAB | object::elf::SHT_DYNSYM => {
                                        let entsize = section.sh_entsize.get(e).max(1) as usize;
                                        let total = section.sh_size.get(e) as usize / entsize;
                                        num_symbols += total
                                            .saturating_sub(section.sh_info.get(e) as usize);
                                    }
                                    object::elf::SHT_GROUP => num_groups += 1,
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }
            (num_symbols, num_groups)
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
}
