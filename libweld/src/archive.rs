//! Reads ar archives. We borrow each member's bytes straight out of the mapped archive rather
//! than going through a Read-based crate, since the whole pipeline works on borrowed data.

use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) enum ArchiveEntry<'data> {
    /// The archive's own symbol index. We ignore it; member symbol tables are authoritative.
    Ignored,
    Regular(ArchiveMember<'data>),
    Filenames(ExtendedFilenames<'data>),
    /// A thin-archive entry: the member lives in a separate file named by the identifier.
    Thin(Identifier<'data>),
}

pub(crate) struct ArchiveMember<'data> {
    ident: &'data [u8],
    pub(crate) data: &'data [u8],
}

/// The `//` entry holding names too long for the 16-byte header field.
#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

/// A member name, either inline or an offset into the extended-filenames table.
#[derive(Clone, Copy)]
pub(crate) struct Identifier<'data> {
    data: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    is_thin: bool,
}

impl<'data> ArchiveIterator<'data> {
    /// `data` must be the whole archive file including the magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        if let Some(rest) = data.strip_prefix(&object::archive::MAGIC) {
            Ok(Self {
                data: rest,
                is_thin: false,
            })
        } else if let Some(rest) = data.strip_prefix(&object::archive::THIN_MAGIC) {
            Ok(Self {
                data: rest,
                is_thin: true,
            })
        } else {
            bail!("missing archive magic");
        }
    }

    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("short archive entry header");
        }
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        let size = parse_decimal(&header.size).context("invalid archive entry size")?;
        let ident = trim_ascii(&header.ident);
        self.data = rest;

        // Thin archives record the referenced file's size, not an inline payload, so regular
        // members of a thin archive consume no bytes beyond the header.
        let is_inline = !self.is_thin || ident == b"/" || ident == b"//";
        let payload = if is_inline {
            if self.data.len() < size {
                bail!("archive entry size {size} exceeds remaining {} bytes", self.data.len());
            }
            let payload = &self.data[..size];
            let padded = size.next_multiple_of(2).min(self.data.len());
            self.data = &self.data[padded..];
            payload
        } else {
            &[]
        };

        let entry = match ident {
            b"/" => ArchiveEntry::Ignored,
            b"//" => ArchiveEntry::Filenames(ExtendedFilenames { data: payload }),
            _ if self.is_thin => ArchiveEntry::Thin(Identifier { data: ident }),
            _ => ArchiveEntry::Regular(ArchiveMember {
                ident,
                data: payload,
            }),
        };
        Ok(Some(entry))
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl<'data> ArchiveMember<'data> {
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> Identifier<'data> {
        resolve_identifier(self.ident, extended_filenames)
    }
}

impl<'data> Identifier<'data> {
    pub(crate) fn resolve(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> Identifier<'data> {
        resolve_identifier(self.data, extended_filenames)
    }

    pub(crate) fn as_slice(&self) -> &'data [u8] {
        // Inline names end with '/', extended names with "/\n". Strip whichever is present; a
        // name containing '/' path separators only occurs in the extended table, where scanning
        // from the end is still correct.
        let mut data = self.data;
        if let Some(pos) = memchr::memchr(b'\n', data) {
            data = &data[..pos];
        }
        data.strip_suffix(b"/").unwrap_or(data)
    }
}

fn resolve_identifier<'data>(
    ident: &'data [u8],
    extended_filenames: Option<ExtendedFilenames<'data>>,
) -> Identifier<'data> {
    if let Some(filenames) = extended_filenames {
        if let Some(rest) = ident.strip_prefix(b"/") {
            if let Some(offset) = std::str::from_utf8(rest)
                .ok()
                .and_then(|r| r.trim_end_matches('/').trim().parse::<usize>().ok())
            {
                if offset < filenames.data.len() {
                    return Identifier {
                        data: &filenames.data[offset..],
                    };
                }
            }
        }
    }
    Identifier { data: ident }
}

fn parse_decimal(field: &[u8]) -> Option<usize> {
    let field = trim_ascii(field);
    if field.is_empty() {
        return Some(0);
    }
    let mut value = 0usize;
    for &b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(value)
}

fn trim_ascii(field: &[u8]) -> &[u8] {
    let start = field.iter().position(|b| !b.is_ascii_whitespace());
    let end = field.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &field[s..=e],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ident: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           0     0     644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn iterates_members_and_resolves_names() {
        let mut archive = object::archive::MAGIC.to_vec();
        archive.extend(entry("/", b"\0\0\0\0"));
        archive.extend(entry("//", b"very_long_member_name.o/\n"));
        archive.extend(entry("short.o/", b"abc"));
        archive.extend(entry("/0", b"defg"));

        let mut filenames = None;
        let mut members = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&archive).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Ignored => {}
                ArchiveEntry::Filenames(f) => filenames = Some(f),
                ArchiveEntry::Regular(m) => members.push(m),
                ArchiveEntry::Thin(_) => panic!("not a thin archive"),
            }
        }

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].identifier(filenames).as_slice(), b"short.o");
        assert_eq!(members[0].data, b"abc");
        assert_eq!(
            members[1].identifier(filenames).as_slice(),
            b"very_long_member_name.o"
        );
        assert_eq!(members[1].data, b"defg");
    }

    #[test]
    fn rejects_truncated_archives() {
        let mut archive = object::archive::MAGIC.to_vec();
        archive.extend(entry("short.o/", b"abc"));
        archive.truncate(archive.len() - 2);
        let result: Result<Vec<_>> =
            ArchiveIterator::from_archive_bytes(&archive).unwrap().collect();
        assert!(result.is_err());
    }
}
