use crate::error::Result;
use anyhow::bail;

/// The machine architectures we can link for. Selecting an architecture monomorphizes the final
/// stages of the pipeline via the `Arch` trait; everything before relocation application is
/// architecture-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    AArch64,
}

impl Architecture {
    pub(crate) fn from_emulation(name: &str) -> Result<Self> {
        match name {
            "elf_x86_64" => Ok(Architecture::X86_64),
            "aarch64linux" | "aarch64elf" => Ok(Architecture::AArch64),
            other => bail!("unsupported emulation: {other}"),
        }
    }

    pub(crate) fn from_e_machine(e_machine: u16) -> Option<Self> {
        match e_machine {
            object::elf::EM_X86_64 => Some(Architecture::X86_64),
            object::elf::EM_AARCH64 => Some(Architecture::AArch64),
            _ => None,
        }
    }

    pub(crate) fn e_machine(self) -> u16 {
        match self {
            Architecture::X86_64 => object::elf::EM_X86_64,
            Architecture::AArch64 => object::elf::EM_AARCH64,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Architecture::X86_64 => "x86_64",
            Architecture::AArch64 => "aarch64",
        })
    }
}

/// Architecture-specific mechanics. The interesting linking logic is architecture-independent;
/// what varies per machine is only how a relocated field is patched.
pub(crate) trait Arch {
    const ARCH: Architecture;

    /// Patches the bytes of a relocated field. `place` is the address the field will have at
    /// runtime, `value` is the resolved symbol value and `addend` the relocation addend. `out` is
    /// the field's bytes within the output image, starting at the relocation offset.
    fn apply_relocation(rel_type: u32, place: u64, value: u64, addend: i64, out: &mut [u8])
        -> Result;

    fn page_size() -> u64 {
        0x1000
    }
}

pub(crate) fn write_le<const N: usize>(out: &mut [u8], value: u64) {
    out[..N].copy_from_slice(&value.to_le_bytes()[..N]);
}
