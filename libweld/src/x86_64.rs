use crate::arch::Arch;
use crate::arch::Architecture;
use crate::arch::write_le;
use crate::error::Result;
use anyhow::bail;
use object::elf;

pub(crate) struct X86_64;

impl Arch for X86_64 {
    const ARCH: Architecture = Architecture::X86_64;

    fn apply_relocation(
        rel_type: u32,
        place: u64,
        value: u64,
        addend: i64,
        out: &mut [u8],
    ) -> Result {
        let s_plus_a = value.wrapping_add(addend as u64);
        match rel_type {
            elf::R_X86_64_NONE => {}
            elf::R_X86_64_64 => write_le::<8>(out, s_plus_a),
            elf::R_X86_64_32 => {
                if u32::try_from(s_plus_a).is_err() {
                    bail!("relocation R_X86_64_32 overflows");
                }
                write_le::<4>(out, s_plus_a);
            }
            elf::R_X86_64_32S => {
                if i32::try_from(s_plus_a as i64).is_err() {
                    bail!("relocation R_X86_64_32S overflows");
                }
                write_le::<4>(out, s_plus_a);
            }
            // Without lazy binding there is no PLT indirection, so a PLT-relative branch binds
            // directly to the definition.
            elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
                let delta = s_plus_a.wrapping_sub(place);
                if i32::try_from(delta as i64).is_err() {
                    bail!("PC-relative relocation overflows");
                }
                write_le::<4>(out, delta);
            }
            elf::R_X86_64_PC64 => write_le::<8>(out, s_plus_a.wrapping_sub(place)),
            elf::R_X86_64_16 => write_le::<2>(out, s_plus_a),
            elf::R_X86_64_8 => write_le::<1>(out, s_plus_a),
            other => bail!("unsupported x86_64 relocation type {other}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_and_pcrel() {
        let mut buf = [0u8; 8];
        X86_64::apply_relocation(elf::R_X86_64_64, 0, 0x1234, 8, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x123c);

        let mut buf = [0u8; 4];
        X86_64::apply_relocation(elf::R_X86_64_PC32, 0x2000, 0x1000, -4, &mut buf).unwrap();
        assert_eq!(i32::from_le_bytes(buf), -0x1004);
    }

    #[test]
    fn overflow_is_an_error() {
        let mut buf = [0u8; 4];
        assert!(
            X86_64::apply_relocation(elf::R_X86_64_32, 0, u64::MAX - 2, 0, &mut buf).is_err()
        );
    }
}
