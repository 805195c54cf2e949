use crate::arch::Arch;
use crate::arch::Architecture;
use crate::arch::write_le;
use crate::error::Result;
use anyhow::bail;
use object::elf;

pub(crate) struct AArch64;

impl Arch for AArch64 {
    const ARCH: Architecture = Architecture::AArch64;

    fn apply_relocation(
        rel_type: u32,
        place: u64,
        value: u64,
        addend: i64,
        out: &mut [u8],
    ) -> Result {
        let s_plus_a = value.wrapping_add(addend as u64);
        match rel_type {
            elf::R_AARCH64_NONE => {}
            elf::R_AARCH64_ABS64 => write_le::<8>(out, s_plus_a),
            elf::R_AARCH64_ABS32 => write_le::<4>(out, s_plus_a),
            elf::R_AARCH64_PREL64 => write_le::<8>(out, s_plus_a.wrapping_sub(place)),
            elf::R_AARCH64_PREL32 => write_le::<4>(out, s_plus_a.wrapping_sub(place)),
            elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => {
                let delta = s_plus_a.wrapping_sub(place) as i64;
                if !(-(1 << 27)..1 << 27).contains(&delta) {
                    bail!("branch target out of range");
                }
                patch_insn(out, 0x03ff_ffff, (delta >> 2) as u32);
            }
            elf::R_AARCH64_ADR_PREL_PG_HI21 => {
                let delta = (page(s_plus_a).wrapping_sub(page(place))) as i64 >> 12;
                if !(-(1 << 20)..1 << 20).contains(&delta) {
                    bail!("ADRP target out of range");
                }
                let delta = delta as u32;
                let immlo = (delta & 3) << 29;
                let immhi = ((delta >> 2) & 0x7ffff) << 5;
                patch_insn(out, (3 << 29) | (0x7ffff << 5), immlo | immhi);
            }
            elf::R_AARCH64_ADD_ABS_LO12_NC => {
                patch_insn(out, 0xfff << 10, ((s_plus_a & 0xfff) as u32) << 10);
            }
            elf::R_AARCH64_LDST64_ABS_LO12_NC => {
                patch_insn(out, 0xfff << 10, (((s_plus_a & 0xfff) >> 3) as u32) << 10);
            }
            other => bail!("unsupported aarch64 relocation type {other}"),
        }
        Ok(())
    }
}

fn page(addr: u64) -> u64 {
    addr & !0xfff
}

/// Merges `bits` into the instruction word under `mask`, leaving the other bits as the compiler
/// emitted them.
fn patch_insn(out: &mut [u8], mask: u32, bits: u32) {
    let insn = u32::from_le_bytes(out[..4].try_into().unwrap());
    write_le::<4>(out, u64::from((insn & !mask) | (bits & mask)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call26_encodes_word_offset() {
        // A `bl 0` instruction.
        let mut buf = 0x9400_0000u32.to_le_bytes();
        AArch64::apply_relocation(elf::R_AARCH64_CALL26, 0x1000, 0x1400, 0, &mut buf).unwrap();
        let insn = u32::from_le_bytes(buf);
        assert_eq!(insn & 0x03ff_ffff, 0x400 >> 2);
        assert_eq!(insn >> 26, 0x9400_0000 >> 26);
    }

    #[test]
    fn adrp_pairs_with_lo12() {
        let mut adrp = 0x9000_0000u32.to_le_bytes();
        AArch64::apply_relocation(
            elf::R_AARCH64_ADR_PREL_PG_HI21,
            0x1_0000,
            0x3_0123,
            0,
            &mut adrp,
        )
        .unwrap();

        let mut add = 0x9100_0000u32.to_le_bytes();
        AArch64::apply_relocation(elf::R_AARCH64_ADD_ABS_LO12_NC, 0, 0x3_0123, 0, &mut add)
            .unwrap();
        let insn = u32::from_le_bytes(add);
        assert_eq!((insn >> 10) & 0xfff, 0x123);
    }
}
