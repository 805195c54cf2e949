//! A handwritten parser for our arguments.
//!
//! We don't use a third-party option parser because we need to behave like the other linkers on
//! the platform: long options must be accepted with either one or two dashes, values can be
//! attached with '=' or follow as a separate token, and a few flags (`--as-needed`,
//! `--whole-archive`) are stateful - they modify how subsequent input files are treated rather
//! than setting a global.

use crate::arch::Architecture;
use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use std::num::NonZeroUsize;
use std::path::PathBuf;

pub struct Args {
    pub(crate) arch: Architecture,
    pub(crate) inputs: Vec<Input>,
    pub(crate) output: PathBuf,
    pub(crate) lib_search_path: Vec<PathBuf>,

    pub(crate) entry: Option<String>,
    pub(crate) undefined: Vec<String>,
    pub(crate) require_defined: Vec<String>,
    pub(crate) wrap: Vec<String>,
    pub(crate) exclude_libs: Vec<String>,

    pub(crate) gc_sections: bool,
    pub(crate) print_gc_sections: bool,

    pub(crate) discard_all: bool,
    pub(crate) discard_locals: bool,
    pub(crate) strip_all: bool,
    pub(crate) strip_debug: bool,
    pub(crate) retain_symbols_file: Option<Vec<Vec<u8>>>,

    pub(crate) shared: bool,
    pub(crate) pic: bool,
    pub(crate) z_defs: bool,
    pub(crate) is_static: bool,
    pub(crate) export_dynamic: bool,
    pub(crate) b_symbolic: bool,
    pub(crate) b_symbolic_functions: bool,
    pub(crate) unresolved_symbols: UnresolvedKind,

    pub(crate) default_version: u16,
    pub(crate) version_definitions: Vec<String>,
    pub(crate) version_patterns: Vec<VersionPattern>,

    pub(crate) image_base: u64,
    pub(crate) eh_frame_hdr: bool,
    pub(crate) build_id: BuildIdOption,
    pub(crate) hash_style_sysv: bool,
    pub(crate) hash_style_gnu: bool,
    pub(crate) compress_debug_sections: CompressKind,

    pub(crate) fatal_warnings: bool,
    pub(crate) warn_common: bool,
    pub(crate) demangle: bool,
    pub(crate) repro: Option<PathBuf>,
    pub(crate) chroot: Option<PathBuf>,
    pub(crate) map_file: Option<PathBuf>,
    pub(crate) dynamic_linker: Option<PathBuf>,

    pub num_threads: NonZeroUsize,
}

/// One input file together with the stateful modifiers that were in effect at the point on the
/// command line where it appeared.
#[derive(Debug, Clone)]
pub(crate) struct Input {
    pub(crate) spec: InputSpec,
    pub(crate) modifiers: Modifiers,
}

#[derive(Debug, Clone)]
pub(crate) enum InputSpec {
    File(PathBuf),
    Lib(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Modifiers {
    pub(crate) as_needed: bool,
    pub(crate) whole_archive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnresolvedKind {
    Error,
    Warn,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BuildIdOption {
    None,
    Fast,
    Hex(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressKind {
    None,
    Gabi,
    Gnu,
}

#[derive(Debug, Clone)]
pub(crate) struct VersionPattern {
    pub(crate) pattern: String,
    pub(crate) ver_idx: u16,
}

/// Version indices 0 and 1 (local / global) are reserved by the gABI. User-supplied version
/// definitions are numbered from 2.
pub(crate) const VER_NDX_LAST_RESERVED: u16 = 1;

pub(crate) const DEFAULT_IMAGE_BASE: u64 = 0x20_0000;

impl Default for Args {
    fn default() -> Self {
        Self {
            arch: Architecture::X86_64,
            inputs: Vec::new(),
            output: PathBuf::from("a.out"),
            lib_search_path: Vec::new(),
            entry: None,
            undefined: Vec::new(),
            require_defined: Vec::new(),
            wrap: Vec::new(),
            exclude_libs: Vec::new(),
            gc_sections: false,
            print_gc_sections: false,
            discard_all: false,
            discard_locals: false,
            strip_all: false,
            strip_debug: false,
            retain_symbols_file: None,
            shared: false,
            pic: false,
            z_defs: false,
            is_static: false,
            export_dynamic: false,
            b_symbolic: false,
            b_symbolic_functions: false,
            unresolved_symbols: UnresolvedKind::Error,
            default_version: object::elf::VER_NDX_GLOBAL,
            version_definitions: Vec::new(),
            version_patterns: Vec::new(),
            image_base: DEFAULT_IMAGE_BASE,
            eh_frame_hdr: false,
            build_id: BuildIdOption::None,
            hash_style_sysv: false,
            hash_style_gnu: true,
            compress_debug_sections: CompressKind::None,
            fatal_warnings: false,
            warn_common: false,
            demangle: true,
            repro: None,
            chroot: None,
            map_file: None,
            dynamic_linker: None,
            num_threads: available_parallelism(),
        }
    }
}

fn available_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
}

pub(crate) enum Action {
    Link(Args),
    Version,
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Action> {
    let mut args = Args::default();
    let mut modifiers = Modifiers::default();
    let mut input = input.peekable();

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        // Helper that accepts `--flag=value` and `--flag value`.
        let mut value_for = |long: &str, attached: Option<&str>| -> Result<String> {
            if let Some(v) = attached {
                return Ok(v.to_owned());
            }
            input
                .next()
                .map(|v| v.as_ref().to_owned())
                .with_context(|| format!("missing argument to {long}"))
        };

        if let Some(rest) = arg.strip_prefix("-l") {
            if rest.is_empty() {
                bail!("missing argument to -l");
            }
            args.inputs.push(Input {
                spec: InputSpec::Lib(rest.to_owned()),
                modifiers,
            });
            continue;
        }
        if let Some(rest) = arg.strip_prefix("-L") {
            let dir = if rest.is_empty() {
                value_for("-L", None)?
            } else {
                rest.to_owned()
            };
            args.lib_search_path.push(PathBuf::from(dir));
            continue;
        }

        // Strip one or two leading dashes so that e.g. `-gc-sections` and `--gc-sections` are
        // equivalent, the way GNU linkers accept them.
        let Some(long) = arg.strip_prefix('-') else {
            args.inputs.push(Input {
                spec: InputSpec::File(PathBuf::from(arg)),
                modifiers,
            });
            continue;
        };
        let long = long.strip_prefix('-').unwrap_or(long);
        let (name, attached) = match long.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (long, None),
        };

        match name {
            "o" | "output" => args.output = PathBuf::from(value_for("-o", attached)?),
            "m" => args.arch = Architecture::from_emulation(&value_for("-m", attached)?)?,
            "e" | "entry" => args.entry = Some(value_for("--entry", attached)?),
            "u" | "undefined" => args.undefined.push(value_for("--undefined", attached)?),
            "require-defined" => args
                .require_defined
                .push(value_for("--require-defined", attached)?),
            "wrap" => args.wrap.push(value_for("--wrap", attached)?),
            "exclude-libs" => args.exclude_libs.extend(
                value_for("--exclude-libs", attached)?
                    .split(',')
                    .map(str::to_owned),
            ),
            "gc-sections" => args.gc_sections = true,
            "no-gc-sections" => args.gc_sections = false,
            "print-gc-sections" => args.print_gc_sections = true,
            "x" | "discard-all" => args.discard_all = true,
            "X" | "discard-locals" => args.discard_locals = true,
            "s" | "strip-all" => args.strip_all = true,
            "S" | "strip-debug" => args.strip_debug = true,
            "retain-symbols-file" => {
                let path = value_for("--retain-symbols-file", attached)?;
                let data = std::fs::read(&path)
                    .with_context(|| format!("cannot read {path}"))?;
                args.retain_symbols_file = Some(
                    data.split(|b| *b == b'\n')
                        .map(|line| line.trim_ascii())
                        .filter(|line| !line.is_empty())
                        .map(|line| line.to_vec())
                        .collect(),
                );
            }
            "shared" | "Bshareable" => args.shared = true,
            "pie" | "pic-executable" => args.pic = true,
            "no-pie" => args.pic = false,
            "static" | "Bstatic" | "dn" => args.is_static = true,
            "export-dynamic" | "E" => args.export_dynamic = true,
            "no-export-dynamic" => args.export_dynamic = false,
            "Bsymbolic" => args.b_symbolic = true,
            "Bsymbolic-functions" => args.b_symbolic_functions = true,
            "unresolved-symbols" => {
                args.unresolved_symbols = match value_for("--unresolved-symbols", attached)?.as_str()
                {
                    "report-all" => UnresolvedKind::Error,
                    "ignore-all" | "ignore-in-object-files" => UnresolvedKind::Ignore,
                    other => bail!("unknown --unresolved-symbols argument: {other}"),
                }
            }
            "warn-unresolved-symbols" => args.unresolved_symbols = UnresolvedKind::Warn,
            "error-unresolved-symbols" => args.unresolved_symbols = UnresolvedKind::Error,
            "version-definition" => {
                args.version_definitions
                    .push(value_for("--version-definition", attached)?);
            }
            "version-pattern" => {
                // PATTERN@VERSION, where VERSION must name an already-declared definition.
                let value = value_for("--version-pattern", attached)?;
                let (pattern, version) = value
                    .rsplit_once('@')
                    .with_context(|| format!("malformed --version-pattern {value}"))?;
                let ver_idx = args
                    .version_definitions
                    .iter()
                    .position(|v| v == version)
                    .map(|i| i as u16 + VER_NDX_LAST_RESERVED + 1)
                    .with_context(|| format!("unknown version {version}"))?;
                args.version_patterns.push(VersionPattern {
                    pattern: pattern.to_owned(),
                    ver_idx,
                });
            }
            "image-base" | "Ttext" => {
                args.image_base = parse_number(&value_for("--image-base", attached)?)?;
            }
            "eh-frame-hdr" => args.eh_frame_hdr = true,
            "no-eh-frame-hdr" => args.eh_frame_hdr = false,
            "build-id" => {
                args.build_id = match attached {
                    None | Some("fast") | Some("sha1") | Some("md5") => BuildIdOption::Fast,
                    Some("none") => BuildIdOption::None,
                    Some(hex) => {
                        let hex = hex.strip_prefix("0x").unwrap_or(hex);
                        BuildIdOption::Hex(parse_hex_bytes(hex)?)
                    }
                }
            }
            "hash-style" => match value_for("--hash-style", attached)?.as_str() {
                "sysv" => (args.hash_style_sysv, args.hash_style_gnu) = (true, false),
                "gnu" => (args.hash_style_sysv, args.hash_style_gnu) = (false, true),
                "both" => (args.hash_style_sysv, args.hash_style_gnu) = (true, true),
                other => bail!("unknown --hash-style argument: {other}"),
            },
            "compress-debug-sections" => {
                args.compress_debug_sections =
                    match value_for("--compress-debug-sections", attached)?.as_str() {
                        "none" => CompressKind::None,
                        "zlib" | "zlib-gabi" => CompressKind::Gabi,
                        "zlib-gnu" => CompressKind::Gnu,
                        other => bail!("unknown --compress-debug-sections argument: {other}"),
                    }
            }
            "fatal-warnings" => args.fatal_warnings = true,
            "no-fatal-warnings" => args.fatal_warnings = false,
            "warn-common" => args.warn_common = true,
            "demangle" => args.demangle = true,
            "no-demangle" => args.demangle = false,
            "reproduce" => args.repro = Some(PathBuf::from(value_for("--reproduce", attached)?)),
            "chroot" => args.chroot = Some(PathBuf::from(value_for("--chroot", attached)?)),
            "Map" | "M" => args.map_file = Some(PathBuf::from(value_for("--Map", attached)?)),
            "dynamic-linker" | "I" => {
                args.dynamic_linker = Some(PathBuf::from(value_for("--dynamic-linker", attached)?));
            }
            "no-dynamic-linker" => args.dynamic_linker = None,
            "as-needed" => modifiers.as_needed = true,
            "no-as-needed" => modifiers.as_needed = false,
            "whole-archive" => modifiers.whole_archive = true,
            "no-whole-archive" => modifiers.whole_archive = false,
            "threads" | "thread-count" => {
                args.num_threads = NonZeroUsize::new(
                    value_for("--threads", attached)?
                        .parse()
                        .context("invalid thread count")?,
                )
                .context("thread count must be nonzero")?;
            }
            "z" => match value_for("-z", attached)?.as_str() {
                "defs" => args.z_defs = true,
                "undefs" => args.z_defs = false,
                // Keywords we accept for compatibility but which don't change anything we do.
                "relro" | "norelro" | "now" | "lazy" | "notext" | "noexecstack" => {}
                other => crate::error::warning(format_args!("ignoring unknown -z option: {other}")),
            },
            "v" | "version" => return Ok(Action::Version),
            // Options other linkers accept that are no-ops for us.
            "nostdlib" | "color-diagnostics" | "start-group" | "end-group" | "(" | ")"
            | "EB" | "EL" | "plugin" | "O0" | "O1" | "O2" => {
                if name == "plugin" {
                    let _ = value_for("-plugin", attached)?;
                }
            }
            other => bail!("unrecognized option: -{other}"),
        }
    }

    Ok(Action::Link(args))
}

impl Args {
    pub(crate) fn setup_thread_pool(&self) -> Result {
        // Linking twice in one process (as the tests do) will have already built the global pool;
        // that's fine, the second configuration attempt is ignored.
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads.get())
            .build_global();
        Ok(())
    }

    pub(crate) fn output_kind(&self) -> OutputKind {
        if self.shared {
            OutputKind::SharedObject
        } else if self.pic {
            OutputKind::PieExecutable
        } else {
            OutputKind::Executable
        }
    }

    pub(crate) fn entry_symbol_name(&self) -> &[u8] {
        self.entry.as_deref().map(str::as_bytes).unwrap_or(b"_start")
    }

    pub(crate) fn strip_debug(&self) -> bool {
        self.strip_debug || self.strip_all
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputKind {
    Executable,
    PieExecutable,
    SharedObject,
}

impl OutputKind {
    pub(crate) fn is_relocatable(self) -> bool {
        !matches!(self, OutputKind::Executable)
    }
}

pub(crate) fn parse_number(s: &str) -> Result<u64> {
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    value.with_context(|| format!("invalid number `{s}`"))
}

fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 || hex.is_empty() {
        bail!("invalid hex string `{hex}`");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).with_context(|| format!("invalid hex string `{hex}`")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_link(args: &[&str]) -> Args {
        match parse(args.iter()).unwrap() {
            Action::Link(args) => args,
            Action::Version => panic!("expected link action"),
        }
    }

    #[test]
    fn basic_invocation() {
        let args = parse_link(&[
            "-o", "out", "main.o", "-L/usr/lib", "-lfoo", "--gc-sections", "--entry=begin",
        ]);
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.inputs.len(), 2);
        assert!(args.gc_sections);
        assert_eq!(args.entry_symbol_name(), b"begin");
        assert_eq!(args.lib_search_path, vec![PathBuf::from("/usr/lib")]);
    }

    #[test]
    fn single_and_double_dash_are_equivalent() {
        let a = parse_link(&["-gc-sections", "-wrap=malloc"]);
        let b = parse_link(&["--gc-sections", "--wrap", "malloc"]);
        assert_eq!(a.gc_sections, b.gc_sections);
        assert_eq!(a.wrap, b.wrap);
    }

    #[test]
    fn stateful_modifiers_attach_to_following_inputs() {
        let args = parse_link(&["a.o", "--as-needed", "-lfoo", "--no-as-needed", "-lbar"]);
        assert!(!args.inputs[0].modifiers.as_needed);
        assert!(args.inputs[1].modifiers.as_needed);
        assert!(!args.inputs[2].modifiers.as_needed);
    }

    #[test]
    fn version_patterns() {
        let args = parse_link(&[
            "--version-definition=VERS_1",
            "--version-pattern=foo*@VERS_1",
        ]);
        assert_eq!(args.version_patterns.len(), 1);
        assert_eq!(args.version_patterns[0].ver_idx, VER_NDX_LAST_RESERVED + 1);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x200000").unwrap(), 0x20_0000);
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert!(parse_number("zog").is_err());
        let args = parse_link(&["--image-base=0x400000"]);
        assert_eq!(args.image_base, 0x40_0000);
    }

    #[test]
    fn build_id_forms() {
        assert_eq!(parse_link(&["--build-id"]).build_id, BuildIdOption::Fast);
        assert_eq!(parse_link(&["--build-id=none"]).build_id, BuildIdOption::None);
        assert_eq!(
            parse_link(&["--build-id=0xdeadbeef"]).build_id,
            BuildIdOption::Hex(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }
}
