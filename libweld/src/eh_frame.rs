//! Exception-frame handling. `.eh_frame` is the one section whose contents the linker has to
//! understand: records for functions in dead sections must be dropped, and the CIE records that
//! compilers duplicate into every object should be emitted once. Input sections named `.eh_frame`
//! are therefore parsed into CIE/FDE records at parse time and the raw section is dropped from
//! the output; the output `.eh_frame` is reassembled from the surviving records.

use crate::elf;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::symbol::FileId;
use crate::symbol::SymbolId;
use anyhow::bail;
use linker_utils::elf::secnames;
use object::LittleEndian;
use object::read::elf::Rela as _;
use std::ops::Range;

#[derive(Debug, Clone)]
pub(crate) struct CieRecord {
    /// The `.eh_frame` input section the record came from.
    pub(crate) section_index: object::SectionIndex,
    pub(crate) input_offset: u32,
    /// Total record length including the 4-byte length field.
    pub(crate) len: u32,
    /// Relocations whose offset falls inside the record, as indices into the section's rels.
    pub(crate) rel_range: Range<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct FdeRecord {
    pub(crate) section_index: object::SectionIndex,
    pub(crate) input_offset: u32,
    pub(crate) len: u32,
    pub(crate) rel_range: Range<u32>,
    /// Index of the CIE this FDE refers to, within the owning file's `cies`.
    pub(crate) cie_idx: u32,
}

/// Finds the `.eh_frame` sections of a freshly parsed object, turns them into records, links each
/// FDE to its CIE and each text section to its FDEs, and drops the raw sections.
pub(crate) fn initialize_ehframe_sections(obj: &mut ObjectFile) -> Result {
    let e = LittleEndian;

    for index in 0..obj.sections.len() {
        let Some(section) = &obj.sections[index] else {
            continue;
        };
        if !section.is_alive() || section.name() != secnames::EH_FRAME {
            continue;
        }

        let fdes_begin = obj.fdes.len();
        let (cies, fdes) = parse_records(
            section.contents,
            section.rels,
            object::SectionIndex(index),
            obj.cies.len() as u32,
        )?;
        obj.cies.extend(cies);
        obj.fdes.extend(fdes);

        let section = obj.sections[index].as_mut().unwrap();
        section.is_ehframe = true;
        section.kill();

        // Group the new FDEs by the section whose code they describe. The first relocation of an
        // FDE points at that section.
        let rels = obj.sections[index].as_ref().unwrap().rels;
        let mut owners: Vec<(u64, usize)> = Vec::with_capacity(obj.fdes.len() - fdes_begin);
        for fde_idx in fdes_begin..obj.fdes.len() {
            let fde = &obj.fdes[fde_idx];
            let rel = &rels[fde.rel_range.start as usize];
            let sym_index = object::SymbolIndex(rel.r_sym(e, false) as usize);
            let esym = obj.elf.symbol(sym_index)?;
            let Some(owner) = obj.elf.symbol_section(esym, sym_index)? else {
                bail!("FDE function pointer does not reference a section");
            };
            owners.push((obj.section_priority(owner), fde_idx));
        }
        owners.sort_by_key(|&(priority, _)| priority);

        let reordered: Vec<FdeRecord> =
            owners.iter().map(|&(_, idx)| obj.fdes[idx].clone()).collect();
        obj.fdes.truncate(fdes_begin);
        obj.fdes.extend(reordered);

        // Store each owning section's FDE range.
        let mut i = fdes_begin;
        while i < obj.fdes.len() {
            let rel = &rels[obj.fdes[i].rel_range.start as usize];
            let sym_index = object::SymbolIndex(rel.r_sym(e, false) as usize);
            let esym = obj.elf.symbol(sym_index)?;
            let owner = obj.elf.symbol_section(esym, sym_index)?.unwrap();

            let mut j = i + 1;
            while j < obj.fdes.len() {
                let rel = &rels[obj.fdes[j].rel_range.start as usize];
                let sym_index = object::SymbolIndex(rel.r_sym(e, false) as usize);
                let esym = obj.elf.symbol(sym_index)?;
                if obj.elf.symbol_section(esym, sym_index)? != Some(owner) {
                    break;
                }
                j += 1;
            }

            if let Some(owning_section) = obj.sections[owner.0].as_mut() {
                owning_section.fde_begin = i as u32;
                owning_section.fde_end = j as u32;
            }
            i = j;
        }
    }

    Ok(())
}

/// Walks the bytes of one `.eh_frame` section. Each record starts with a 4-byte length (zero
/// terminates the section); the following word is zero for a CIE and otherwise a back-pointer to
/// the record's CIE.
fn parse_records(
    contents: &[u8],
    rels: &[elf::Rela],
    section_index: object::SectionIndex,
    cie_base: u32,
) -> Result<(Vec<CieRecord>, Vec<FdeRecord>)> {
    let e = LittleEndian;

    // The record walk below merges the relocation list in one pass, which only works if offsets
    // increase monotonically.
    for pair in rels.windows(2) {
        if pair[1].r_type(e, false) != 0 && pair[1].r_offset.get(e) <= pair[0].r_offset.get(e) {
            bail!("relocation offsets must increase monotonically");
        }
    }

    let mut cies = Vec::new();
    let mut fdes = Vec::new();
    let mut offset = 0usize;
    let mut rel_idx = 0u32;

    while offset < contents.len() {
        let Some(bytes) = contents.get(offset..offset + 4) else {
            bail!("truncated record length");
        };
        let size = u32::from_le_bytes(bytes.try_into().unwrap()) as usize;
        if size == 0 {
            if contents.len() - offset != 4 {
                bail!("garbage at end of section");
            }
            break;
        }

        let end_offset = offset + size + 4;
        if end_offset > contents.len() {
            bail!("record extends past end of section");
        }
        let id = u32::from_le_bytes(contents[offset + 4..offset + 8].try_into().unwrap());

        let rel_begin = rel_idx;
        while (rel_idx as usize) < rels.len()
            && rels[rel_idx as usize].r_offset.get(e) < end_offset as u64
        {
            rel_idx += 1;
        }

        if id == 0 {
            cies.push(CieRecord {
                section_index,
                input_offset: offset as u32,
                len: (size + 4) as u32,
                rel_range: rel_begin..rel_idx,
            });
        } else if rel_begin == rel_idx {
            // An FDE with no relocations describes code that was never attached to a section;
            // some archivers produce these. It's dead on arrival, skip it.
        } else {
            if rels[rel_begin as usize].r_offset.get(e) != offset as u64 + 8 {
                bail!("FDE's first relocation must be at offset 8");
            }
            fdes.push(FdeRecord {
                section_index,
                input_offset: offset as u32,
                len: (size + 4) as u32,
                rel_range: rel_begin..rel_idx,
                cie_idx: 0,
            });
        }

        offset = end_offset;
    }

    // Link each FDE to its CIE: the back-pointer is relative to the word it's stored in.
    for fde in &mut fdes {
        let ptr_pos = fde.input_offset as usize + 4;
        let back = i32::from_le_bytes(contents[ptr_pos..ptr_pos + 4].try_into().unwrap());
        let cie_offset = (ptr_pos as i64 - i64::from(back)) as u32;
        let Some(idx) = cies.iter().position(|cie| cie.input_offset == cie_offset) else {
            bail!("bad FDE CIE pointer");
        };
        fde.cie_idx = cie_base + idx as u32;
    }

    Ok((cies, fdes))
}

impl CieRecord {
    pub(crate) fn contents<'data>(&self, obj: &ObjectFile<'data>) -> &'data [u8] {
        let section = obj.section(self.section_index).unwrap();
        &section.contents[self.input_offset as usize..(self.input_offset + self.len) as usize]
    }

    pub(crate) fn rels<'data>(&self, obj: &ObjectFile<'data>) -> &'data [elf::Rela] {
        let section = obj.section(self.section_index).unwrap();
        &section.rels[self.rel_range.start as usize..self.rel_range.end as usize]
    }
}

impl FdeRecord {
    pub(crate) fn contents<'data>(&self, obj: &ObjectFile<'data>) -> &'data [u8] {
        let section = obj.section(self.section_index).unwrap();
        &section.contents[self.input_offset as usize..(self.input_offset + self.len) as usize]
    }

    pub(crate) fn rels<'data>(&self, obj: &ObjectFile<'data>) -> &'data [elf::Rela] {
        let section = obj.section(self.section_index).unwrap();
        &section.rels[self.rel_range.start as usize..self.rel_range.end as usize]
    }
}

/// Identity of what a relocation refers to, for deciding whether two CIEs can merge. Globals
/// compare by interned symbol; locals are only ever equal within one file.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum RelTarget {
    Global(SymbolId),
    Local(FileId, u32),
}

fn rel_target(obj: &ObjectFile, sym_idx: u32) -> RelTarget {
    match obj.symbols[sym_idx as usize] {
        crate::object_file::SymbolRef::Global(id) => RelTarget::Global(id),
        crate::object_file::SymbolRef::Local(local) => RelTarget::Local(obj.file_id, local),
    }
}

/// Two CIEs are eligible to merge iff their bytes are identical and their relocations refer to
/// identically-resolving symbols. Equal bytes with different symbols stay distinct.
pub(crate) fn cies_equal(
    a_obj: &ObjectFile,
    a: &CieRecord,
    b_obj: &ObjectFile,
    b: &CieRecord,
) -> bool {
    let e = LittleEndian;
    if a.contents(a_obj) != b.contents(b_obj) {
        return false;
    }
    let a_rels = a.rels(a_obj);
    let b_rels = b.rels(b_obj);
    if a_rels.len() != b_rels.len() {
        return false;
    }
    a_rels.iter().zip(b_rels).all(|(ra, rb)| {
        ra.r_offset.get(e) - u64::from(a.input_offset) == rb.r_offset.get(e) - u64::from(b.input_offset)
            && ra.r_type(e, false) == rb.r_type(e, false)
            && ra.r_addend.get(e) == rb.r_addend.get(e)
            && rel_target(a_obj, ra.r_sym(e, false)) == rel_target(b_obj, rb.r_sym(e, false))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::I64;
    use object::U64;

    fn rela(offset: u64, sym: u32, addend: i64) -> elf::Rela {
        elf::Rela {
            r_offset: U64::new(LittleEndian, offset),
            r_info: U64::new(LittleEndian, (u64::from(sym) << 32) | u64::from(object::elf::R_X86_64_PC32)),
            r_addend: I64::new(LittleEndian, addend),
        }
    }

    fn record(len: u32, id: u32, pad: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend(std::iter::repeat_n(0u8, pad));
        out
    }

    /// One CIE at offset 0 (length 20), one FDE at offset 24 whose back-pointer targets the CIE.
    fn sample_section() -> Vec<u8> {
        let mut contents = record(20, 0, 16);
        contents.extend(record(20, 28, 16));
        contents.extend_from_slice(&0u32.to_le_bytes());
        contents
    }

    #[test]
    fn parses_cie_and_fde() {
        let contents = sample_section();
        let rels = [rela(32, 1, 0), rela(40, 2, 0)];
        let (cies, fdes) =
            parse_records(&contents, &rels, object::SectionIndex(1), 0).unwrap();

        assert_eq!(cies.len(), 1);
        assert_eq!(cies[0].input_offset, 0);
        assert_eq!(cies[0].len, 24);
        assert_eq!(cies[0].rel_range, 0..0);

        assert_eq!(fdes.len(), 1);
        assert_eq!(fdes[0].input_offset, 24);
        assert_eq!(fdes[0].cie_idx, 0);
        assert_eq!(fdes[0].rel_range, 0..2);
    }

    #[test]
    fn fde_without_relocations_is_dropped() {
        let contents = sample_section();
        let (cies, fdes) =
            parse_records(&contents, &[], object::SectionIndex(1), 0).unwrap();
        assert_eq!(cies.len(), 1);
        assert!(fdes.is_empty());
    }

    #[test]
    fn empty_section_is_fine() {
        let (cies, fdes) = parse_records(&[], &[], object::SectionIndex(1), 0).unwrap();
        assert!(cies.is_empty());
        assert!(fdes.is_empty());
    }

    #[test]
    fn rejects_malformed_records() {
        // Terminator followed by trailing garbage.
        let mut contents = record(20, 0, 16);
        contents.extend_from_slice(&0u32.to_le_bytes());
        contents.extend_from_slice(b"junk");
        assert!(parse_records(&contents, &[], object::SectionIndex(1), 0).is_err());

        // FDE whose first relocation is not at offset 8.
        let contents = sample_section();
        let rels = [rela(36, 1, 0)];
        assert!(parse_records(&contents, &rels, object::SectionIndex(1), 0).is_err());

        // FDE back-pointer that doesn't land on a CIE.
        let mut contents = record(20, 0, 16);
        contents.extend(record(20, 9999, 16));
        contents.extend_from_slice(&0u32.to_le_bytes());
        let rels = [rela(32, 1, 0)];
        assert!(parse_records(&contents, &rels, object::SectionIndex(1), 0).is_err());
    }
}
