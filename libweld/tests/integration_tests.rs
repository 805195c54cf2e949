//! End-to-end tests: build small relocatable objects in memory, run the whole link pipeline on
//! them, and inspect the resulting executable.

use object::Object as _;
use object::ObjectSection as _;
use object::ObjectSymbol as _;
use object::write::Object;
use object::write::Relocation;
use object::write::Symbol;
use object::write::SymbolSection;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

fn new_object() -> Object<'static> {
    Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    )
}

fn global_symbol(name: &str, section: object::write::SectionId, value: u64, weak: bool) -> Symbol {
    Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size: 0,
        kind: object::SymbolKind::Data,
        scope: object::SymbolScope::Dynamic,
        weak,
        section: SymbolSection::Section(section),
        flags: object::SymbolFlags::None,
    }
}

fn undefined_symbol(name: &str, weak: bool) -> Symbol {
    Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: object::SymbolKind::Unknown,
        scope: object::SymbolScope::Dynamic,
        weak,
        section: SymbolSection::Undefined,
        flags: object::SymbolFlags::None,
    }
}

/// An object with a `_start` in `.text` so the linker has an entry point.
fn start_object() -> Object<'static> {
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    obj.append_section_data(text, &[0xc3; 8], 16);
    obj.add_symbol(Symbol {
        name: b"_start".to_vec(),
        value: 0,
        size: 8,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: object::SymbolFlags::None,
    });
    obj
}

struct TestDir {
    path: PathBuf,
}

impl TestDir {
    fn new(name: &str) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "weld-test-{}-{}-{name}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn out(&self) -> PathBuf {
        self.path.join("a.out")
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn link(out: &Path, inputs: &[&Path], extra: &[&str]) -> libweld::error::Result {
    let mut args: Vec<String> = vec!["-o".into(), out.to_string_lossy().into_owned()];
    args.extend(extra.iter().map(|s| s.to_string()));
    args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
    libweld::Linker::from_args(args.iter())?.run()
}

fn output_symbols(bytes: &[u8]) -> Vec<(String, u64)> {
    let file = object::File::parse(bytes).unwrap();
    file.symbols()
        .filter_map(|sym| Some((sym.name().ok()?.to_owned(), sym.address())))
        .collect()
}

fn symbol_address(bytes: &[u8], name: &str) -> Option<u64> {
    output_symbols(bytes)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, addr)| addr)
}

fn read_at_address(bytes: &[u8], addr: u64, len: usize) -> Vec<u8> {
    let file = object::File::parse(bytes).unwrap();
    for section in file.sections() {
        let start = section.address();
        if addr >= start && addr + len as u64 <= start + section.size() {
            let data = section.data().unwrap();
            let offset = (addr - start) as usize;
            return data[offset..offset + len].to_vec();
        }
    }
    panic!("address {addr:#x} not inside any section");
}

/// A minimal regular (non-thin) ar archive.
fn ar_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        out.extend_from_slice(format!("{:<16}", format!("{name}/")).as_bytes());
        out.extend_from_slice(b"0           0     0     644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

#[test]
fn duplicate_strong_definitions_are_an_error() {
    let dir = TestDir::new("dup");

    let make = |marker: u8| {
        let mut obj = start_object();
        let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
        obj.append_section_data(data, &[marker; 4], 4);
        obj.add_symbol(global_symbol("foo", data, 0, false));
        obj.write().unwrap()
    };

    let a = dir.write("a.o", &make(0xaa));
    let b = dir.write("b.o", &make(0xbb));
    assert!(link(&dir.out(), &[&a, &b], &[]).is_err());
}

#[test]
fn strong_definition_beats_earlier_weak() {
    let dir = TestDir::new("weak-strong");

    let mut a = start_object();
    let data = a.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    a.append_section_data(data, &[0xaa; 4], 4);
    a.add_symbol(global_symbol("foo", data, 0, true));
    let a = dir.write("a.o", &a.write().unwrap());

    let mut b = new_object();
    let data = b.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    b.append_section_data(data, &[0xbb; 4], 4);
    b.add_symbol(global_symbol("foo", data, 0, false));
    let b = dir.write("b.o", &b.write().unwrap());

    link(&dir.out(), &[&a, &b], &[]).unwrap();
    let bytes = std::fs::read(dir.out()).unwrap();

    let symbols = output_symbols(&bytes);
    assert_eq!(symbols.iter().filter(|(n, _)| n == "foo").count(), 1);
    let foo = symbol_address(&bytes, "foo").unwrap();
    assert_eq!(read_at_address(&bytes, foo, 1), vec![0xbb]);
}

#[test]
fn strong_reference_pulls_archive_member_weak_does_not() {
    for (weak, expect_defined) in [(false, true), (true, false)] {
        let dir = TestDir::new("archive");

        let mut bar = new_object();
        let data = bar.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
        bar.append_section_data(data, &[0xbb; 4], 4);
        bar.add_symbol(global_symbol("bar", data, 0, false));
        let archive = dir.write("lib.a", &ar_archive(&[("bar.o", &bar.write().unwrap())]));

        let mut main = start_object();
        main.add_symbol(undefined_symbol("bar", weak));
        let main = dir.write("main.o", &main.write().unwrap());

        // A weak reference mustn't fail the link even though it stays undefined.
        link(&dir.out(), &[&main, &archive], &[]).unwrap();
        let bytes = std::fs::read(dir.out()).unwrap();

        let bar_defined = symbol_address(&bytes, "bar").is_some_and(|addr| addr != 0);
        assert_eq!(bar_defined, expect_defined, "weak = {weak}");
    }
}

#[test]
fn identical_string_literals_are_merged() {
    let dir = TestDir::new("merge");

    let make = |with_start: bool| {
        let mut obj = if with_start { start_object() } else { new_object() };
        let strings = obj.add_section(
            Vec::new(),
            b".rodata.str1.1".to_vec(),
            object::SectionKind::ReadOnlyString,
        );
        obj.append_section_data(strings, b"hello\0", 1);
        let strings_sym = obj.section_symbol(strings);

        let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
        obj.append_section_data(data, &[0u8; 8], 8);
        obj.add_relocation(
            data,
            Relocation {
                offset: 0,
                symbol: strings_sym,
                addend: 0,
                flags: object::RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_64,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    };

    let a = dir.write("a.o", &make(true));
    let b = dir.write("b.o", &make(false));
    link(&dir.out(), &[&a, &b], &[]).unwrap();
    let bytes = std::fs::read(dir.out()).unwrap();

    // Both relocated words point at the same single copy of "hello\0".
    let file = object::File::parse(&*bytes).unwrap();
    let data = file.section_by_name(".data").unwrap();
    let contents = data.data().unwrap();
    let first = u64::from_le_bytes(contents[0..8].try_into().unwrap());
    let second = u64::from_le_bytes(contents[8..16].try_into().unwrap());
    assert_eq!(first, second);
    assert_eq!(read_at_address(&bytes, first, 6), b"hello\0");

    let rodata = file.section_by_name(".rodata").unwrap();
    let rodata_bytes = rodata.data().unwrap();
    assert_eq!(
        rodata_bytes.windows(6).filter(|w| w == b"hello\0").count(),
        1
    );
}

#[test]
fn comdat_groups_keep_one_copy() {
    let dir = TestDir::new("comdat");

    let make = |marker: u8, with_start: bool| {
        let mut obj = if with_start { start_object() } else { new_object() };
        let text = obj.add_section(
            Vec::new(),
            b".text._ZN1XIiE3fooEv".to_vec(),
            object::SectionKind::Text,
        );
        obj.append_section_data(text, &[marker; 4], 16);
        let sym = obj.add_symbol(Symbol {
            name: b"_ZN1XIiE3fooEv".to_vec(),
            value: 0,
            size: 4,
            kind: object::SymbolKind::Text,
            scope: object::SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        obj.add_comdat(object::write::Comdat {
            kind: object::ComdatKind::Any,
            symbol: sym,
            sections: vec![text],
        });
        obj.write().unwrap()
    };

    let a = dir.write("a.o", &make(0xaa, true));
    let b = dir.write("b.o", &make(0xbb, false));

    // A has lower file priority, so A's copy survives and B's group is discarded without a
    // duplicate-symbol error.
    link(&dir.out(), &[&a, &b], &[]).unwrap();
    let bytes = std::fs::read(dir.out()).unwrap();
    let addr = symbol_address(&bytes, "_ZN1XIiE3fooEv").unwrap();
    assert_eq!(read_at_address(&bytes, addr, 1), vec![0xaa]);

    let file = object::File::parse(&*bytes).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let text_bytes = text.data().unwrap();
    assert!(!text_bytes.windows(4).any(|w| w == [0xbb; 4]));
}

#[test]
fn gc_sections_discards_unreferenced_code() {
    let dir = TestDir::new("gc");

    let mut obj = new_object();
    let start_text = obj.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    obj.append_section_data(start_text, &[0xe8, 0, 0, 0, 0, 0xc3], 16);
    obj.add_symbol(Symbol {
        name: b"_start".to_vec(),
        value: 0,
        size: 6,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(start_text),
        flags: object::SymbolFlags::None,
    });

    let used_text = obj.add_section(Vec::new(), b".text.used".to_vec(), object::SectionKind::Text);
    obj.append_section_data(used_text, &[0xc3; 4], 16);
    let used = obj.add_symbol(Symbol {
        name: b"used".to_vec(),
        value: 0,
        size: 4,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(used_text),
        flags: object::SymbolFlags::None,
    });

    let unused_text =
        obj.add_section(Vec::new(), b".text.unused".to_vec(), object::SectionKind::Text);
    obj.append_section_data(unused_text, &[0xcc; 4], 16);
    obj.add_symbol(Symbol {
        name: b"unused".to_vec(),
        value: 0,
        size: 4,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(unused_text),
        flags: object::SymbolFlags::None,
    });

    // A custom section whose name is a C identifier must be kept by the __start_/__stop_ rule.
    let custom = obj.add_section(Vec::new(), b"my_custom".to_vec(), object::SectionKind::Data);
    obj.append_section_data(custom, &[0x77; 4], 4);

    obj.add_relocation(
        start_text,
        Relocation {
            offset: 1,
            symbol: used,
            addend: -4,
            flags: object::RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32,
            },
        },
    )
    .unwrap();

    let input = dir.write("main.o", &obj.write().unwrap());
    link(&dir.out(), &[&input], &["--gc-sections"]).unwrap();
    let bytes = std::fs::read(dir.out()).unwrap();

    assert!(symbol_address(&bytes, "used").is_some());
    assert!(symbol_address(&bytes, "unused").is_none());
    assert!(symbol_address(&bytes, "__start_my_custom").is_some());

    let file = object::File::parse(&*bytes).unwrap();
    let text = file.section_by_name(".text").unwrap();
    assert!(!text.data().unwrap().windows(4).any(|w| w == [0xcc; 4]));
    assert!(file.section_by_name("my_custom").is_some());
}

#[test]
fn alloc_sections_are_page_congruent() {
    let dir = TestDir::new("congruence");

    let mut obj = start_object();
    let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    obj.append_section_data(data, &[1; 100], 32);
    let bss = obj.add_section(
        Vec::new(),
        b".bss".to_vec(),
        object::SectionKind::UninitializedData,
    );
    obj.append_section_bss(bss, 64, 32);
    let input = dir.write("main.o", &obj.write().unwrap());

    link(&dir.out(), &[&input], &[]).unwrap();
    let bytes = std::fs::read(dir.out()).unwrap();

    let file = object::File::parse(&*bytes).unwrap();
    for section in file.sections() {
        let Ok(name) = section.name() else { continue };
        if section.address() == 0 {
            continue;
        }
        if let Some((offset, _)) = section.file_range() {
            assert_eq!(
                section.address() % 0x1000,
                offset % 0x1000,
                "section {name} is not page-congruent"
            );
        }
    }

    // __bss_start and _end bracket the bss section.
    let bss_start = symbol_address(&bytes, "__bss_start").unwrap();
    let end = symbol_address(&bytes, "_end").unwrap();
    assert!(end >= bss_start + 64);
}

#[test]
fn output_is_deterministic() {
    let dir = TestDir::new("determinism");

    let mut obj = start_object();
    let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    obj.append_section_data(data, &[7; 16], 8);
    obj.add_symbol(global_symbol("value", data, 0, false));
    let input = dir.write("main.o", &obj.write().unwrap());

    link(&dir.out(), &[&input], &[]).unwrap();
    let first = std::fs::read(dir.out()).unwrap();
    link(&dir.out(), &[&input], &[]).unwrap();
    let second = std::fs::read(dir.out()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn macho_objects_resolve_but_image_writing_is_refused() {
    let dir = TestDir::new("macho");

    let mut obj = Object::new(
        object::BinaryFormat::MachO,
        object::Architecture::X86_64,
        object::Endianness::Little,
    );
    let text = obj.add_section(b"__TEXT".to_vec(), b"__text".to_vec(), object::SectionKind::Text);
    obj.append_section_data(text, &[0xc3; 8], 16);
    obj.add_symbol(Symbol {
        name: b"start".to_vec(),
        value: 0,
        size: 8,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: object::SymbolFlags::None,
    });
    let input = dir.write("main.o", &obj.write().unwrap());

    // The object parses and its symbols resolve; the link then stops at the Mach-O
    // image-writing seam rather than failing to understand the input.
    let error = link(&dir.out(), &[&input], &[]).unwrap_err();
    let message = format!("{error:#}");
    assert!(message.contains("Mach-O"), "unexpected error: {message}");
    assert!(
        !message.contains("failed to parse"),
        "unexpected error: {message}"
    );
}

#[test]
fn wrap_rewrites_references() {
    let dir = TestDir::new("wrap");

    // main references malloc and __real_malloc; wrap.o defines __wrap_malloc and the real one.
    let mut main = start_object();
    main.add_symbol(undefined_symbol("malloc", false));
    main.add_symbol(undefined_symbol("__real_malloc", false));
    let main = dir.write("main.o", &main.write().unwrap());

    let mut def = new_object();
    let data = def.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    def.append_section_data(data, &[0x11; 4], 4);
    def.add_symbol(global_symbol("malloc", data, 0, false));
    let wrap_data = def.add_section(Vec::new(), b".data.wrap".to_vec(), object::SectionKind::Data);
    def.append_section_data(wrap_data, &[0x22; 4], 4);
    def.add_symbol(global_symbol("__wrap_malloc", wrap_data, 0, false));
    let def = dir.write("def.o", &def.write().unwrap());

    link(&dir.out(), &[&main, &def], &["--wrap=malloc"]).unwrap();
    let bytes = std::fs::read(dir.out()).unwrap();
    assert!(symbol_address(&bytes, "malloc").is_some());
    assert!(symbol_address(&bytes, "__wrap_malloc").is_some());
}
