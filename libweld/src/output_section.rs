//! The registry of regular output sections. Input sections pick (or create) their output section
//! while files parse in parallel, so creation is behind a mutex; after parsing the registry is
//! read-only and sections are addressed by ID.

use linker_utils::elf::SectionFlags;
use linker_utils::elf::SectionType;
use linker_utils::elf::shf;
use std::sync::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct OutputSectionId(pub(crate) u32);

impl OutputSectionId {
    /// Stand-in used while a section is being constructed.
    pub(crate) const PLACEHOLDER: OutputSectionId = OutputSectionId(u32::MAX);
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct OutputSectionDef<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: SectionType,
    pub(crate) sh_flags: SectionFlags,
}

pub(crate) struct OutputSections<'data> {
    inner: Mutex<Inner<'data>>,
}

#[derive(Default)]
struct Inner<'data> {
    lookup: hashbrown::HashMap<(&'data [u8], u32, u64), OutputSectionId>,
    defs: Vec<OutputSectionDef<'data>>,
}

impl<'data> OutputSections<'data> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn get_or_create(
        &self,
        name: &'data [u8],
        sh_type: SectionType,
        sh_flags: SectionFlags,
    ) -> OutputSectionId {
        // Flags that distinguish input sections but not output sections.
        let sh_flags = sh_flags
            .without(shf::GROUP)
            .without(shf::COMPRESSED)
            .without(shf::GNU_RETAIN)
            .without(shf::LINK_ORDER);

        let mut inner = self.inner.lock().unwrap();
        let key = (name, sh_type.raw(), sh_flags.raw());
        if let Some(&id) = inner.lookup.get(&key) {
            return id;
        }
        let id = OutputSectionId(inner.defs.len() as u32);
        inner.defs.push(OutputSectionDef {
            name,
            sh_type,
            sh_flags,
        });
        inner.lookup.insert(key, id);
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().defs.len()
    }

    pub(crate) fn defs(&self) -> Vec<OutputSectionDef<'data>> {
        self.inner.lock().unwrap().defs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linker_utils::elf::sht;

    #[test]
    fn identity_ignores_group_and_retain_flags() {
        let sections = OutputSections::new();
        let a = sections.get_or_create(b".text", sht::PROGBITS, shf::ALLOC.with(shf::EXECINSTR));
        let b = sections.get_or_create(
            b".text",
            sht::PROGBITS,
            shf::ALLOC.with(shf::EXECINSTR).with(shf::GROUP).with(shf::GNU_RETAIN),
        );
        let c = sections.get_or_create(b".data", sht::PROGBITS, shf::ALLOC.with(shf::WRITE));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(sections.len(), 2);
    }
}
