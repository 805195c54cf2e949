//! Merging of SHF_MERGE sections. Mergeable contents are split into pieces (null-terminated
//! strings or fixed-size records) at parse time; pieces are interned into a per-output-section
//! fragment table so that identical bytes from different objects collapse to one copy. Everything
//! that referenced a duplicate piece ends up referencing the surviving fragment.
//!
//! Splitting happens while each file is parsed, but fragment tables can't be sized until all
//! files have been split. So the registry runs in two phases: during parsing it only records the
//! (name, type, flags) identity of each merged output section plus a piece-count estimate, and
//! once parsing is done `build()` turns the registry into concrete tables sized for interning.

use crate::error::Result;
use crate::intern::ConcurrentMap;
use anyhow::bail;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::SectionType;
use linker_utils::elf::shf;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Identifies a merged output section.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct MergedSectionId(pub(crate) u16);

/// Identifies one interned fragment: a merged section plus a slot in its table. Slots are stable,
/// so this handle can be stored and dereferenced for the rest of the link.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct FragmentId {
    pub(crate) section: MergedSectionId,
    pub(crate) slot: u32,
}

pub(crate) struct SectionFragment {
    pub(crate) is_alive: AtomicBool,
    /// Maximum alignment requested by any inserter. Capped to 16 bits at split time.
    alignment: AtomicU16,
    /// Offset within the merged output section, assigned after liveness settles.
    offset: AtomicU64,
}

pub(crate) const FRAGMENT_OFFSET_UNASSIGNED: u64 = u64::MAX;

impl SectionFragment {
    fn new() -> Self {
        Self {
            is_alive: AtomicBool::new(false),
            alignment: AtomicU16::new(1),
            offset: AtomicU64::new(FRAGMENT_OFFSET_UNASSIGNED),
        }
    }

    pub(crate) fn update_alignment(&self, alignment: u16) {
        self.alignment.fetch_max(alignment, Ordering::Relaxed);
    }

    pub(crate) fn alignment(&self) -> u16 {
        self.alignment.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }
}

/// Parse-time registry of merged output sections.
#[derive(Default)]
pub(crate) struct MergedSectionRegistry<'data> {
    inner: Mutex<RegistryInner<'data>>,
}

#[derive(Default)]
struct RegistryInner<'data> {
    lookup: hashbrown::HashMap<(&'data [u8], u32, u64), MergedSectionId>,
    defs: Vec<MergedSectionDef<'data>>,
}

struct MergedSectionDef<'data> {
    name: &'data [u8],
    sh_type: SectionType,
    sh_flags: SectionFlags,
    piece_estimate: usize,
}

impl<'data> MergedSectionRegistry<'data> {
    pub(crate) fn get_or_create(
        &self,
        name: &'data [u8],
        sh_type: SectionType,
        sh_flags: SectionFlags,
    ) -> MergedSectionId {
        let mut inner = self.inner.lock().unwrap();
        let key = (name, sh_type.raw(), sh_flags.raw());
        if let Some(&id) = inner.lookup.get(&key) {
            return id;
        }
        let id = MergedSectionId(u16::try_from(inner.defs.len()).expect("too many merged sections"));
        inner.defs.push(MergedSectionDef {
            name,
            sh_type,
            sh_flags,
            piece_estimate: 0,
        });
        inner.lookup.insert(key, id);
        id
    }

    pub(crate) fn add_piece_estimate(&self, id: MergedSectionId, count: usize) {
        self.inner.lock().unwrap().defs[id.0 as usize].piece_estimate += count;
    }

    /// Consumes the registry, producing the sized fragment tables. Must only be called once all
    /// files have been split (parsing barrier).
    pub(crate) fn build(&self) -> Vec<MergedSection<'data>> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.defs)
            .into_iter()
            .map(|def| MergedSection {
                name: def.name,
                sh_type: def.sh_type,
                sh_flags: def.sh_flags,
                map: ConcurrentMap::with_capacity(def.piece_estimate * 2),
                size: 0,
                addralign: 1,
            })
            .collect()
    }
}

/// A merged output section with its fragment table.
pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: SectionType,
    pub(crate) sh_flags: SectionFlags,
    map: ConcurrentMap<'data, SectionFragment>,
    pub(crate) size: u64,
    pub(crate) addralign: u64,
}

impl<'data> MergedSection<'data> {
    pub(crate) fn insert(&self, bytes: &'data [u8], hash: u64, alignment: u16) -> u32 {
        let (slot, fragment) = self.map.intern(bytes, hash, SectionFragment::new);
        fragment.update_alignment(alignment);
        slot
    }

    pub(crate) fn fragment(&self, slot: u32) -> &SectionFragment {
        self.map.value(slot)
    }

    pub(crate) fn fragment_bytes(&self, slot: u32) -> &'data [u8] {
        self.map.key(slot)
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.sh_flags.contains(shf::ALLOC)
    }

    /// Assigns output offsets to the live fragments. Fragments are ordered by contents, which is
    /// arbitrary but deterministic regardless of which thread interned each piece first.
    pub(crate) fn assign_offsets(&mut self) {
        let mut live: Vec<(&'data [u8], u32)> = Vec::new();
        self.map.for_each(|slot, bytes, fragment| {
            if fragment.is_alive() {
                live.push((bytes, slot));
            }
        });
        live.sort_unstable();

        let mut offset = 0u64;
        let mut max_align = 1u64;
        for (bytes, slot) in live {
            let fragment = self.map.value(slot);
            let align = u64::from(fragment.alignment());
            offset = linker_utils::utils::align_to(offset, align);
            fragment.offset.store(offset, Ordering::Relaxed);
            offset += bytes.len() as u64;
            max_align = max_align.max(align);
        }
        self.size = offset;
        self.addralign = max_align;
    }

    /// Writes the live fragments into `out`, which must be the section's bytes in the output
    /// image.
    pub(crate) fn write(&self, out: &mut [u8]) {
        self.map.for_each(|_, bytes, fragment| {
            if fragment.is_alive() {
                let offset = fragment.offset() as usize;
                out[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
        });
    }
}

/// The per-file view of one mergeable input section: its pieces, their offsets within the
/// original section, and (after registration) the interned fragment for each piece.
pub(crate) struct MergeableSection<'data> {
    pub(crate) parent: MergedSectionId,
    pub(crate) pieces: Vec<&'data [u8]>,
    pub(crate) piece_offsets: Vec<u32>,
    pub(crate) hashes: Vec<u64>,
    pub(crate) fragments: Vec<FragmentId>,
    pub(crate) alignment: u16,
}

impl<'data> MergeableSection<'data> {
    /// Looks up the piece containing `offset` in the original section. Returns the fragment and
    /// the delta of `offset` from the piece start. Offsets may point into the middle of a piece;
    /// that only happens via section symbols.
    pub(crate) fn fragment_at(&self, offset: u64) -> Result<(FragmentId, u64)> {
        let idx = self
            .piece_offsets
            .partition_point(|&piece_offset| u64::from(piece_offset) <= offset);
        if idx == 0 {
            bail!("offset {offset} is not within any section piece");
        }
        let idx = idx - 1;
        Ok((
            self.fragments[idx],
            offset - u64::from(self.piece_offsets[idx]),
        ))
    }
}

/// Splits the contents of a mergeable input section into pieces. With SHF_STRINGS the pieces are
/// null-terminated (terminator width = entsize); otherwise they're fixed entsize-long records.
pub(crate) fn split_section<'data>(
    contents: &'data [u8],
    entsize: u64,
    sh_addralign: u64,
    is_strings: bool,
    parent: MergedSectionId,
) -> Result<MergeableSection<'data>> {
    if sh_addralign >= u64::from(u16::MAX) {
        bail!("mergeable section alignment too large");
    }
    let entsize = usize::try_from(entsize).unwrap();

    let mut section = MergeableSection {
        parent,
        pieces: Vec::new(),
        piece_offsets: Vec::new(),
        hashes: Vec::new(),
        fragments: Vec::new(),
        alignment: sh_addralign.max(1) as u16,
    };

    let mut data = contents;
    let mut offset = 0usize;
    if is_strings {
        while !data.is_empty() {
            let Some(null) = find_null(data, entsize) else {
                bail!("string is not null terminated");
            };
            let piece = &data[..null + entsize];
            data = &data[null + entsize..];
            section.push_piece(piece, offset);
            offset += piece.len();
        }
    } else {
        if !data.len().is_multiple_of(entsize) {
            bail!("section size is not a multiple of sh_entsize");
        }
        while !data.is_empty() {
            let (piece, rest) = data.split_at(entsize);
            data = rest;
            section.push_piece(piece, offset);
            offset += entsize;
        }
    }

    Ok(section)
}

impl<'data> MergeableSection<'data> {
    fn push_piece(&mut self, piece: &'data [u8], offset: usize) {
        self.pieces.push(piece);
        self.piece_offsets.push(offset as u32);
        self.hashes.push(crate::hash::hash_bytes(piece));
    }
}

/// Finds the first null terminator in `data`, honouring the entity size: for wide-character
/// strings the terminator is `entsize` zero bytes at an entsize-aligned position.
fn find_null(data: &[u8], entsize: usize) -> Option<usize> {
    if entsize == 1 {
        return memchr::memchr(0, data);
    }
    (0..data.len().saturating_sub(entsize - 1))
        .step_by(entsize)
        .find(|&i| data[i..i + entsize].iter().all(|&b| b == 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use linker_utils::elf::sht;

    fn registry_with_one<'data>(
        name: &'data [u8],
    ) -> (MergedSectionRegistry<'data>, MergedSectionId) {
        let registry = MergedSectionRegistry::default();
        let id = registry.get_or_create(
            name,
            sht::PROGBITS,
            shf::ALLOC.with(shf::MERGE).with(shf::STRINGS),
        );
        (registry, id)
    }

    #[test]
    fn registry_deduplicates_by_identity() {
        let registry = MergedSectionRegistry::default();
        let a = registry.get_or_create(b".rodata.str1.1", sht::PROGBITS, shf::MERGE);
        let b = registry.get_or_create(b".rodata.str1.1", sht::PROGBITS, shf::MERGE);
        let c = registry.get_or_create(b".rodata.cst8", sht::PROGBITS, shf::MERGE);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn string_split() {
        let section =
            split_section(b"hello\0world\0", 1, 1, true, MergedSectionId(0)).unwrap();
        assert_eq!(section.pieces, vec![&b"hello\0"[..], &b"world\0"[..]]);
        assert_eq!(section.piece_offsets, vec![0, 6]);

        assert!(split_section(b"unterminated", 1, 1, true, MergedSectionId(0)).is_err());
    }

    #[test]
    fn wide_string_split() {
        let data = b"a\0b\0\0\0c\0\0\0";
        let section = split_section(data, 2, 2, true, MergedSectionId(0)).unwrap();
        assert_eq!(section.pieces.len(), 2);
        assert_eq!(section.pieces[0], b"a\0b\0\0\0");
        assert_eq!(section.pieces[1], b"c\0\0\0");
    }

    #[test]
    fn fixed_size_split() {
        let section = split_section(b"abcdefgh", 4, 4, false, MergedSectionId(0)).unwrap();
        assert_eq!(section.pieces, vec![&b"abcd"[..], &b"efgh"[..]]);
        assert!(split_section(b"abcde", 4, 4, false, MergedSectionId(0)).is_err());
    }

    #[test]
    fn identical_pieces_intern_to_one_fragment() {
        let (registry, id) = registry_with_one(b".rodata.str1.1");
        registry.add_piece_estimate(id, 4);
        let sections = registry.build();
        let merged = &sections[id.0 as usize];

        let a = merged.insert(b"hello\0", hash_bytes(b"hello\0"), 1);
        let b = merged.insert(b"hello\0", hash_bytes(b"hello\0"), 4);
        let c = merged.insert(b"world\0", hash_bytes(b"world\0"), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // The surviving fragment takes the maximum alignment of its duplicates.
        assert_eq!(merged.fragment(a).alignment(), 4);
    }

    #[test]
    fn offsets_respect_alignment_and_skip_dead_fragments() {
        let (registry, id) = registry_with_one(b".rodata");
        registry.add_piece_estimate(id, 4);
        let mut sections = registry.build();
        let merged = &mut sections[id.0 as usize];

        let a = merged.insert(b"aa\0", hash_bytes(b"aa\0"), 1);
        let b = merged.insert(b"bbbb\0", hash_bytes(b"bbbb\0"), 8);
        let dead = merged.insert(b"dead\0", hash_bytes(b"dead\0"), 1);
        merged.fragment(a).mark_alive();
        merged.fragment(b).mark_alive();

        merged.assign_offsets();

        assert_eq!(merged.fragment(dead).offset(), FRAGMENT_OFFSET_UNASSIGNED);
        let (a_off, b_off) = (merged.fragment(a).offset(), merged.fragment(b).offset());
        assert_eq!(b_off % 8, 0);
        assert_ne!(a_off, b_off);
        assert_eq!(merged.addralign, 8);
        assert!(merged.size >= 8);

        let mut out = vec![0u8; merged.size as usize];
        merged.write(&mut out);
        assert_eq!(&out[a_off as usize..a_off as usize + 3], b"aa\0");
    }

    #[test]
    fn fragment_lookup_by_input_offset() {
        let (registry, id) = registry_with_one(b".rodata.str1.1");
        registry.add_piece_estimate(id, 2);
        let sections = registry.build();
        let merged = &sections[id.0 as usize];

        let mut section =
            split_section(b"hello\0world\0", 1, 1, true, id).unwrap();
        for (piece, hash) in section.pieces.iter().zip(&section.hashes) {
            let slot = merged.insert(piece, *hash, 1);
            section.fragments.push(FragmentId { section: id, slot });
        }

        let (frag, delta) = section.fragment_at(6).unwrap();
        assert_eq!(frag, section.fragments[1]);
        assert_eq!(delta, 0);

        let (frag, delta) = section.fragment_at(8).unwrap();
        assert_eq!(frag, section.fragments[1]);
        assert_eq!(delta, 2);
    }
}
