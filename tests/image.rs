//! Image emission, parsing, and combining, exercised over synthetic ELF
//! objects so no toolchain artifacts are needed.

use std::io::SeekFrom;

use esp_tool::{
    byte_file::ByteFile,
    elf::ElfReader,
    error::Error,
    image_format::{self, Combiner, CHECKSUM_INIT, ESP_MAGIC},
};

const EHSIZE: usize = 52;
const SHENTSIZE: usize = 40;

fn put_u16(buf: &mut [u8], ofst: usize, val: u16) {
    buf[ofst..ofst + 2].copy_from_slice(&val.to_le_bytes());
}

fn put_u32(buf: &mut [u8], ofst: usize, val: u32) {
    buf[ofst..ofst + 4].copy_from_slice(&val.to_le_bytes());
}

fn push_shdr(image: &mut Vec<u8>, name: u32, sh_type: u32, addr: u32, offset: u32, size: u32) {
    let mut shdr = [0u8; SHENTSIZE];
    put_u32(&mut shdr, 0, name);
    put_u32(&mut shdr, 4, sh_type);
    put_u32(&mut shdr, 8, 0x2); // SHF_ALLOC
    put_u32(&mut shdr, 12, addr);
    put_u32(&mut shdr, 16, offset);
    put_u32(&mut shdr, 20, size);
    put_u32(&mut shdr, 32, 1); // sh_addralign
    image.extend_from_slice(&shdr);
}

/// Assemble a minimal little-endian ELF32 with the given progbits sections
fn build_elf(entry: u32, sections: &[(&str, u32, &[u8])]) -> Vec<u8> {
    // section name string table: leading NUL, then each name
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for (name, _, _) in sections {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    let shstrtab_name = strtab.len() as u32;
    strtab.extend_from_slice(b".shstrtab");
    strtab.push(0);

    // header, then section contents, then the string table, then headers
    let mut image = vec![0u8; EHSIZE];
    let mut data_offsets = Vec::new();
    for (_, _, data) in sections {
        data_offsets.push(image.len() as u32);
        image.extend_from_slice(data);
    }
    let strtab_offset = image.len() as u32;
    image.extend_from_slice(&strtab);
    while image.len() % 4 != 0 {
        image.push(0);
    }
    let shoff = image.len() as u32;

    let shnum = sections.len() as u16 + 2; // null + shstrtab
    image.extend_from_slice(&[0u8; SHENTSIZE]);
    for (i, (_, addr, data)) in sections.iter().enumerate() {
        push_shdr(
            &mut image,
            name_offsets[i],
            0x1, // SHT_PROGBITS
            *addr,
            data_offsets[i],
            data.len() as u32,
        );
    }
    push_shdr(
        &mut image,
        shstrtab_name,
        0x3, // SHT_STRTAB
        0,
        strtab_offset,
        strtab.len() as u32,
    );

    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 1; // ELFCLASS32
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1; // EV_CURRENT
    put_u16(&mut image, 16, 2); // ET_EXEC
    put_u16(&mut image, 18, 94); // EM_XTENSA
    put_u32(&mut image, 20, 1);
    put_u32(&mut image, 24, entry);
    put_u32(&mut image, 32, shoff);
    put_u16(&mut image, 40, EHSIZE as u16);
    put_u16(&mut image, 46, SHENTSIZE as u16);
    put_u16(&mut image, 48, shnum);
    put_u16(&mut image, 50, shnum - 1);
    image
}

fn in_memory_with(bytes: &[u8]) -> ByteFile {
    let mut vf = ByteFile::in_memory("image");
    vf.write_all(bytes).unwrap();
    vf.seek(SeekFrom::Start(0)).unwrap();
    vf
}

#[test]
fn empty_sections_make_a_header_only_image() {
    let entry = 0x4010_0000;
    let data = build_elf(
        entry,
        &[
            (".text", 0x4010_0000, &[]),
            (".data", 0x3FFE_8000, &[]),
            (".rodata", 0x3FFE_9000, &[]),
        ],
    );
    let elf = ElfReader::parse("empty.elf", &data).unwrap();

    let mut out = ByteFile::in_memory("empty_0x00000.bin");
    image_format::write_sections(&elf, &mut out, ".text,.data,.rodata", 0).unwrap();

    let bytes = out.bytes();
    assert_eq!(bytes.len(), 48);
    assert_eq!(&bytes[0..4], &[ESP_MAGIC, 3, 0x00, 0x00]);
    assert_eq!(&bytes[4..8], &entry.to_le_bytes());
    // three segment headers with zero sizes
    for (i, addr) in [0x4010_0000u32, 0x3FFE_8000, 0x3FFE_9000].iter().enumerate() {
        let seg = &bytes[8 + i * 8..16 + i * 8];
        assert_eq!(&seg[0..4], &addr.to_le_bytes());
        assert_eq!(&seg[4..8], &0u32.to_le_bytes());
    }
    // sixteen bytes of padding, checksum seed in the last one
    assert!(bytes[32..47].iter().all(|&b| b == 0));
    assert_eq!(bytes[47], CHECKSUM_INIT);
}

#[test]
fn emitted_images_hold_the_alignment_and_checksum_invariants() {
    let text: Vec<u8> = (0u8..57).collect();
    let data_sec: Vec<u8> = (100u8..139).collect();
    let rodata: Vec<u8> = vec![0xC0, 0xDB, 0x7E];
    let data = build_elf(
        0x4010_0044,
        &[
            (".text", 0x4010_0000, &text),
            (".data", 0x3FFE_8000, &data_sec),
            (".rodata", 0x3FFE_9000, &rodata),
        ],
    );
    let elf = ElfReader::parse("fw.elf", &data).unwrap();

    let mut out = ByteFile::in_memory("fw_0x00000.bin");
    image_format::write_sections(&elf, &mut out, ".text,.data,.rodata", 0x4240).unwrap();
    let bytes = out.bytes();

    // total length is a multiple of sixteen
    assert_eq!(bytes.len() % 16, 0);

    // walk the segment table: sizes are multiples of four and the checksum
    // over all segment bytes plus the final pad byte folds to the seed
    let seg_count = bytes[1] as usize;
    assert_eq!(seg_count, 3);
    let mut cksum = CHECKSUM_INIT;
    let mut pos = 8;
    for _ in 0..seg_count {
        let size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        assert_eq!(size % 4, 0);
        pos += 8;
        for &b in &bytes[pos..pos + size] {
            cksum ^= b;
        }
        pos += size;
    }
    assert_eq!(cksum ^ bytes[bytes.len() - 1], 0);

    // padded segments carry the original bytes followed by zeros
    let text_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    assert_eq!(text_size, 60);
    assert_eq!(&bytes[16..16 + 57], &text[..]);
    assert_eq!(&bytes[16 + 57..16 + 60], &[0, 0, 0]);
}

#[test]
fn image_info_round_trips_an_emitted_image() {
    let text: Vec<u8> = vec![0xAA; 20];
    let data = build_elf(
        0x4010_0010,
        &[
            (".text", 0x4010_0000, &text),
            (".data", 0x3FFE_8000, &[1, 2, 3, 4]),
            (".rodata", 0x3FFE_9000, &[9]),
        ],
    );
    let elf = ElfReader::parse("fw.elf", &data).unwrap();

    // 4M, DIO, 40MHz
    let parm = 0x4000 | 0x0002;
    let mut out = ByteFile::in_memory("fw_0x00000.bin");
    image_format::write_sections(&elf, &mut out, ".text,.data,.rodata", parm).unwrap();

    out.seek(SeekFrom::Start(0)).unwrap();
    let info = image_format::image_info(&mut out).unwrap();
    assert!(info.contains("size=4MB, mode=DIO, freq=40MHz"), "{info}");
    assert!(info.contains("segment  0: address 0x40100000, size 0x000014"), "{info}");
    assert!(info.contains("segment  1: address 0x3ffe8000, size 0x000004"), "{info}");
    assert!(info.contains("The checksum is correct"), "{info}");
}

#[test]
fn unknown_leading_byte_is_rejected() {
    let mut vf = in_memory_with(&[0x7F, 0x00, 0x00, 0x00, 0x00]);
    match image_format::image_info(&mut vf) {
        Err(Error::UnknownImageFormat(name)) => assert_eq!(name, "image"),
        other => panic!("expected an unknown-format error, got {other:?}"),
    }
}

#[test]
fn sparse_container_round_trips_three_images() {
    let mut container = ByteFile::in_memory("combined.bin");
    let mut combiner = Combiner::new(false);

    let payloads: [(u32, Vec<u8>); 3] = [
        (0x00000, vec![0xE9; 16]),
        (0x10000, vec![0x22; 10]), // padded to 12
        (0x7E000, vec![0x33; 8]),
    ];
    for (addr, data) in &payloads {
        let mut image = in_memory_with(data);
        combiner.add_image(&mut container, &mut image, *addr).unwrap();
    }

    let bytes = container.bytes().to_vec();
    assert_eq!(&bytes[0..4], b"esp\x03");
    assert_eq!(bytes.len() % 4, 0);

    // walk the entries back out
    let mut pos = 4;
    for (addr, data) in &payloads {
        let entry_addr = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let entry_len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
        pos += 8;
        assert_eq!(entry_addr, *addr);
        assert_eq!(entry_len as usize, (data.len() + 3) & !3);
        assert_eq!(entry_len % 4, 0);
        assert_eq!(&bytes[pos..pos + data.len()], &data[..]);
        assert!(bytes[pos + data.len()..pos + entry_len as usize]
            .iter()
            .all(|&b| b == 0));
        pos += entry_len as usize;
    }
    assert_eq!(pos, bytes.len());

    container.seek(SeekFrom::Start(0)).unwrap();
    let info = image_format::image_info(&mut container).unwrap();
    assert!(info.contains("Combined image file containing 3 images"), "{info}");
    assert!(info.contains("Flash address 0x000000"), "{info}");
    assert!(info.contains("Flash address 0x010000"), "{info}");
    assert!(info.contains("Flash address 0x07e000"), "{info}");
}

#[test]
fn padded_container_is_a_flash_snapshot() {
    let mut container = ByteFile::in_memory("snapshot.bin");
    let mut combiner = Combiner::new(true);

    let first = vec![0x11u8; 100];
    let second = vec![0x22u8; 40];
    let mut image = in_memory_with(&first);
    combiner.add_image(&mut container, &mut image, 0).unwrap();
    let mut image = in_memory_with(&second);
    combiner.add_image(&mut container, &mut image, 0x400).unwrap();

    let bytes = container.bytes();
    assert_eq!(bytes.len(), 0x400 + 40);
    assert_eq!(&bytes[..100], &first[..]);
    // the gap between the images is erased flash
    assert!(bytes[100..0x400].iter().all(|&b| b == 0xFF));
    assert_eq!(&bytes[0x400..], &second[..]);
}

#[test]
fn images_must_be_added_in_address_order() {
    let mut container = ByteFile::in_memory("combined.bin");
    let mut combiner = Combiner::new(false);

    let mut image = in_memory_with(&[0x11; 64]);
    combiner.add_image(&mut container, &mut image, 0x1000).unwrap();

    // 0x800 lies below the running size of 0x1000 + 64
    let mut image = in_memory_with(&[0x22; 16]);
    assert!(matches!(
        combiner.add_image(&mut container, &mut image, 0x800),
        Err(Error::Param(_))
    ));

    // zero-length images are rejected outright
    let mut empty = ByteFile::in_memory("empty.bin");
    assert!(matches!(
        combiner.add_image(&mut container, &mut empty, 0x2000),
        Err(Error::ImageSize(_))
    ));
}

#[test]
fn auto_extract_names_images_by_flash_offset() {
    let irom: Vec<u8> = (0u8..=255).cycle().take(600).collect();
    let data = build_elf(
        0x4010_0000,
        &[
            (".text", 0x4010_0000, &[1, 2, 3, 4]),
            (".data", 0x3FFE_8000, &[5, 6, 7, 8]),
            (".rodata", 0x3FFE_9000, &[9, 10, 11, 12]),
            (".irom0.text", 0x4024_0000, &irom),
        ],
    );
    let elf = ElfReader::parse("firmware.elf", &data).unwrap();

    let mut container = ByteFile::in_memory("combined.bin");
    let mut combiner = Combiner::new(false);
    let produced =
        image_format::auto_extract(&elf, Some((&mut combiner, &mut container)), 0, None).unwrap();

    assert_eq!(produced, vec!["firmware_0x00000.bin", "firmware_0x40000.bin"]);

    // the container holds the boot image at zero and the raw irom bytes at
    // its rebased flash offset
    let bytes = container.bytes();
    assert_eq!(&bytes[0..4], b"esp\x02");
    let first_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let second = 12 + first_len;
    let irom_addr = u32::from_le_bytes(bytes[second..second + 4].try_into().unwrap());
    assert_eq!(irom_addr, 0x40000);
    assert_eq!(&bytes[second + 8..second + 8 + 600], &irom[..]);
}

#[test]
fn auto_extract_requires_an_irom_section_above_the_flash_base() {
    let data = build_elf(
        0x4010_0000,
        &[
            (".text", 0x4010_0000, &[1, 2, 3, 4]),
            (".data", 0x3FFE_8000, &[5, 6, 7, 8]),
            (".rodata", 0x3FFE_9000, &[9, 10, 11, 12]),
            (".irom0.text", 0x4020_0000, &[0xAB; 8]),
        ],
    );
    let elf = ElfReader::parse("firmware.elf", &data).unwrap();

    let mut container = ByteFile::in_memory("combined.bin");
    let mut combiner = Combiner::new(false);
    assert!(matches!(
        image_format::auto_extract(&elf, Some((&mut combiner, &mut container)), 0, None),
        Err(Error::Param(_))
    ));
}

#[test]
fn single_section_extraction_writes_a_raw_blob() {
    let rodata = vec![0xC0, 0xDB, 0x01, 0x02, 0x03];
    let data = build_elf(0, &[(".rodata", 0x3FFE_9000, &rodata)]);
    let elf = ElfReader::parse("fw.elf", &data).unwrap();

    let mut out = ByteFile::in_memory("rodata.bin");
    image_format::write_sections(&elf, &mut out, ".rodata", 0).unwrap();
    assert_eq!(out.bytes(), &rodata[..]);

    let missing = image_format::write_sections(&elf, &mut out, ".nosuch", 0);
    match missing {
        Err(Error::Param(msg)) => {
            assert!(msg.contains(".nosuch") && msg.contains("fw.elf"), "{msg}")
        }
        other => panic!("expected a parameter error, got {other:?}"),
    }
}

#[test]
fn elf_queries_report_entry_and_sections() {
    let data = build_elf(0x4010_0400, &[(".text", 0x4010_0000, &[0; 32])]);
    let elf = ElfReader::parse("fw.elf", &data).unwrap();
    assert_eq!(elf.entry(), 0x4010_0400);
    let info = elf.section_info();
    assert!(info.contains(".text"), "{info}");

    // a non-ELF input is a parse error, not a silent success
    assert!(matches!(
        ElfReader::parse("bogus.bin", &[0u8; 64]),
        Err(Error::InvalidElf(_))
    ));
}
