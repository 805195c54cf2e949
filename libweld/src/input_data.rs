//! Opens and maps the input files, then flattens archives into a single priority-ordered list of
//! linkable inputs. File priorities are just command-line order; archive members are numbered in
//! the slot where their archive appeared, so the rank arithmetic in resolution can break ties with
//! a plain integer compare.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use anyhow::bail;
use memmap2::Mmap;
use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;

pub struct InputData {
    files: Vec<InputFile>,
}

struct InputFile {
    filename: PathBuf,
    /// Set for files referenced by a thin archive: the archive that named them.
    parent_archive: Option<PathBuf>,
    kind: FileKind,
    modifiers: Modifiers,
    data: Option<Mmap>,
}

/// One linkable input: an object, shared object, or archive member, with its bytes and the
/// position-derived priority used for symbol-resolution tie breaking.
pub(crate) struct InputBytes<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) kind: FileKind,
    pub(crate) data: &'data [u8],
    pub(crate) modifiers: Modifiers,
    pub(crate) is_in_lib: bool,
    pub(crate) priority: u32,
}

#[derive(Clone, Copy)]
pub(crate) struct InputRef<'data> {
    pub(crate) path: &'data Path,
    pub(crate) member: Option<&'data [u8]>,
}

/// Priority of the internal file holding linker-synthesized symbols. Lower values win ties, so
/// the synthetic file outranks everything the user supplied.
pub(crate) const INTERNAL_FILE_PRIORITY: u32 = 1;
const FIRST_INPUT_PRIORITY: u32 = 2;

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut files = Vec::with_capacity(args.inputs.len());
        for input in &args.inputs {
            let path = match &input.spec {
                InputSpec::File(path) => apply_chroot(args, path),
                InputSpec::Lib(name) => search_for_lib(args, name)?,
            };
            load_file(&mut files, path, None, input.modifiers)?;
        }
        Ok(Self { files })
    }

    /// Flattens archives, assigning each linkable input its priority.
    pub(crate) fn expand_archives(&self) -> Result<Vec<InputBytes<'_>>> {
        let mut inputs = Vec::with_capacity(self.files.len());
        let mut next_priority = FIRST_INPUT_PRIORITY;
        let mut priority = move || {
            let p = next_priority;
            next_priority += 1;
            p
        };

        for file in &self.files {
            match file.kind {
                FileKind::Archive => {
                    let mut extended_filenames = None;
                    for entry in ArchiveIterator::from_archive_bytes(file.data())? {
                        match entry.with_context(|| format!("in {}", file.filename.display()))? {
                            ArchiveEntry::Ignored => {}
                            ArchiveEntry::Filenames(f) => extended_filenames = Some(f),
                            ArchiveEntry::Thin(_) => {
                                bail!("thin entry in regular archive {}", file.filename.display())
                            }
                            ArchiveEntry::Regular(member) => {
                                let kind = FileKind::identify_bytes(member.data).with_context(
                                    || format!("in {}", file.filename.display()),
                                )?;
                                inputs.push(InputBytes {
                                    input: InputRef {
                                        path: &file.filename,
                                        member: Some(
                                            member.identifier(extended_filenames).as_slice(),
                                        ),
                                    },
                                    kind,
                                    data: member.data,
                                    modifiers: file.modifiers,
                                    is_in_lib: !file.modifiers.whole_archive,
                                    priority: priority(),
                                });
                            }
                        }
                    }
                }
                // The thin archive itself contributes nothing; its members were loaded as
                // separate files right after it and carry `parent_archive`.
                FileKind::ThinArchive => {}
                kind => {
                    let in_archive = file.parent_archive.is_some();
                    inputs.push(InputBytes {
                        input: InputRef {
                            path: file
                                .parent_archive
                                .as_deref()
                                .unwrap_or(&file.filename),
                            member: in_archive
                                .then(|| file.filename.as_os_str().as_encoded_bytes()),
                        },
                        kind,
                        data: file.data(),
                        modifiers: file.modifiers,
                        is_in_lib: in_archive && !file.modifiers.whole_archive,
                        priority: priority(),
                    });
                }
            }
        }
        Ok(inputs)
    }
}

impl InputData {
    /// The on-disk files that went into the link, for --reproduce.
    pub(crate) fn input_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.filename.clone()).collect()
    }
}

impl InputFile {
    fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

fn load_file(
    files: &mut Vec<InputFile>,
    path: PathBuf,
    parent_archive: Option<PathBuf>,
    modifiers: Modifiers,
) -> Result {
    let file = std::fs::File::open(&path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    // Safety: the file is mapped read-only and we expect our inputs not to change while we run.
    let data = unsafe { Mmap::map(&file) }
        .with_context(|| format!("cannot mmap {}", path.display()))?;
    let kind = FileKind::identify_bytes(&data)
        .with_context(|| format!("in {}", path.display()))?;

    let mut member_paths = Vec::new();
    if kind == FileKind::ThinArchive {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(&data)? {
            match entry.with_context(|| format!("in {}", path.display()))? {
                ArchiveEntry::Filenames(f) => extended_filenames = Some(f),
                ArchiveEntry::Thin(ident) => {
                    let name = ident.resolve(extended_filenames).as_slice();
                    let name = std::str::from_utf8(name)
                        .context("thin archive member name is invalid UTF-8")?;
                    member_paths.push(dir.join(name));
                }
                _ => {}
            }
        }
    }

    files.push(InputFile {
        filename: path.clone(),
        parent_archive,
        kind,
        modifiers,
        data: Some(data),
    });

    for member in member_paths {
        load_file(files, member, Some(path.clone()), modifiers)?;
    }
    Ok(())
}

fn apply_chroot(args: &Args, path: &Path) -> PathBuf {
    match (&args.chroot, path.is_absolute()) {
        (Some(chroot), true) => {
            chroot.join(path.strip_prefix("/").unwrap_or(path))
        }
        _ => path.to_owned(),
    }
}

fn search_for_lib(args: &Args, name: &str) -> Result<PathBuf> {
    for dir in &args.lib_search_path {
        if !args.is_static {
            let shared = dir.join(format!("lib{name}.so"));
            if shared.exists() {
                return Ok(apply_chroot(args, &shared));
            }
        }
        let archive = dir.join(format!("lib{name}.a"));
        if archive.exists() {
            return Ok(apply_chroot(args, &archive));
        }
    }
    bail!("library not found: -l{name}");
}

impl Display for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.member {
            Some(member) => write!(
                f,
                "{}({})",
                self.path.display(),
                String::from_utf8_lossy(member)
            ),
            None => write!(f, "{}", self.path.display()),
        }
    }
}
