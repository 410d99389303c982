#![allow(dead_code)]

use {
    scroll::{LE, Pwrite},
    std::path::{Path, PathBuf},
};

pub const MACHINE_I386: u16 = 0x14c;
pub const MACHINE_AMD64: u16 = 0x8664;

const PE_OFFSET: usize = 0x80;
const SIZE_OF_HEADERS: usize = 0x400;
const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;
const DEBUG_DIRECTORY_INDEX: usize = 6;

/// Name written into the DOS stub, to check that it gets replaced
pub const STUB_NAME: &[u8] = b"ORIGINAL-BUILD-NAME.EXE";

pub struct TestSection {
    pub name: &'static str,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_size: u32,
    pub fill: u8,
}

impl TestSection {
    pub fn new(
        name: &'static str,
        virtual_address: u32,
        virtual_size: u32,
        raw_size: u32,
        fill: u8,
    ) -> Self {
        Self {
            name,
            virtual_address,
            virtual_size,
            raw_size,
            fill,
        }
    }
}

/// A minimal PE image, good enough for the image describer
pub struct TestImage {
    pub machine: u16,
    pub image_base: u64,
    pub entry_point: u32,
    pub time_date_stamp: u32,
    pub sections: Vec<TestSection>,
    /// Adds a `.rdata` section holding a debug directory with one RSDS record
    pub pdb_name: Option<&'static str>,
    /// Writes a PE32+ optional header even when the machine isn't AMD64
    pub force_pe32_plus: bool,
}

impl TestImage {
    pub fn new(machine: u16, image_base: u64) -> Self {
        Self {
            machine,
            image_base,
            entry_point: 0x1010,
            time_date_stamp: 0x5f5e_0000,
            sections: Vec::new(),
            pdb_name: None,
            force_pe32_plus: false,
        }
    }

    pub fn section(mut self, section: TestSection) -> Self {
        self.sections.push(section);
        self
    }

    pub fn pdb(mut self, name: &'static str) -> Self {
        self.pdb_name = Some(name);
        self
    }

    pub fn pe32_plus(mut self) -> Self {
        self.force_pe32_plus = true;
        self
    }

    /// Anything but AMD64 gets a PE32 optional header unless told otherwise
    fn is_64_bit(&self) -> bool {
        self.machine == MACHINE_AMD64 || self.force_pe32_plus
    }

    /// The CodeView record embedded for `pdb_name`
    pub fn codeview_record(&self) -> Option<Vec<u8>> {
        let name = self.pdb_name?;
        let mut record = b"RSDS".to_vec();
        record.extend((1..=16u8).collect::<Vec<_>>());
        record.extend(7u32.to_le_bytes());
        record.extend(name.as_bytes());
        record.push(0);
        Some(record)
    }

    /// Number of memory regions the image should produce
    pub fn region_count(&self) -> usize {
        1 + self.sections.len() + usize::from(self.pdb_name.is_some())
    }

    pub fn build(&self) -> Vec<u8> {
        let mut sections: Vec<(&str, u32, u32, Vec<u8>)> = self
            .sections
            .iter()
            .map(|s| {
                (
                    s.name,
                    s.virtual_address,
                    s.virtual_size,
                    vec![s.fill; s.raw_size as usize],
                )
            })
            .collect();

        let next_va = self
            .sections
            .iter()
            .map(|s| align(s.virtual_address + s.virtual_size.max(1), SECTION_ALIGNMENT))
            .max()
            .unwrap_or(SECTION_ALIGNMENT);

        let mut debug_directory = None;
        if let Some(record) = self.codeview_record() {
            let mut data = vec![0u8; FILE_ALIGNMENT as usize];
            let record_rva = next_va + 28;
            // IMAGE_DEBUG_DIRECTORY, pointer_to_raw_data is patched below
            data.pwrite_with(2u32, 12, LE).unwrap(); // CODEVIEW
            data.pwrite_with(record.len() as u32, 16, LE).unwrap();
            data.pwrite_with(record_rva, 20, LE).unwrap();
            data[28..28 + record.len()].copy_from_slice(&record);
            sections.push((".rdata", next_va, FILE_ALIGNMENT, data));
            debug_directory = Some((next_va, 28u32));
        }

        let mut raw_offsets = Vec::new();
        let mut offset = SIZE_OF_HEADERS as u32;
        for (_, _, _, data) in &sections {
            raw_offsets.push(offset);
            offset += align(data.len() as u32, FILE_ALIGNMENT);
        }
        let mut bytes = vec![0u8; offset as usize];

        // DOS header and stub
        bytes[0..2].copy_from_slice(b"MZ");
        bytes.pwrite_with(PE_OFFSET as u32, 0x3c, LE).unwrap();
        bytes[64..64 + STUB_NAME.len()].copy_from_slice(STUB_NAME);

        // COFF header
        bytes[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");
        let coff = PE_OFFSET + 4;
        let optional_size: u16 = if self.is_64_bit() { 0xf0 } else { 0xe0 };
        bytes.pwrite_with(self.machine, coff, LE).unwrap();
        bytes.pwrite_with(sections.len() as u16, coff + 2, LE).unwrap();
        bytes.pwrite_with(self.time_date_stamp, coff + 4, LE).unwrap();
        bytes.pwrite_with(optional_size, coff + 16, LE).unwrap();
        bytes.pwrite_with(0x0102u16, coff + 18, LE).unwrap();

        // Optional header
        let opt = coff + 20;
        let size_of_image = sections
            .iter()
            .map(|(_, va, vsize, _)| align(va + vsize, SECTION_ALIGNMENT))
            .max()
            .unwrap_or(SECTION_ALIGNMENT);
        let data_directories = if self.is_64_bit() {
            bytes.pwrite_with(0x20bu16, opt, LE).unwrap();
            bytes.pwrite_with(self.entry_point, opt + 16, LE).unwrap();
            bytes.pwrite_with(self.image_base, opt + 24, LE).unwrap();
            bytes.pwrite_with(SECTION_ALIGNMENT, opt + 32, LE).unwrap();
            bytes.pwrite_with(FILE_ALIGNMENT, opt + 36, LE).unwrap();
            bytes.pwrite_with(6u16, opt + 48, LE).unwrap();
            bytes.pwrite_with(size_of_image, opt + 56, LE).unwrap();
            bytes.pwrite_with(SIZE_OF_HEADERS as u32, opt + 60, LE).unwrap();
            bytes.pwrite_with(0x1234u32, opt + 64, LE).unwrap();
            bytes.pwrite_with(3u16, opt + 68, LE).unwrap();
            bytes.pwrite_with(16u32, opt + 108, LE).unwrap();
            opt + 112
        } else {
            bytes.pwrite_with(0x10bu16, opt, LE).unwrap();
            bytes.pwrite_with(self.entry_point, opt + 16, LE).unwrap();
            bytes.pwrite_with(self.image_base as u32, opt + 28, LE).unwrap();
            bytes.pwrite_with(SECTION_ALIGNMENT, opt + 32, LE).unwrap();
            bytes.pwrite_with(FILE_ALIGNMENT, opt + 36, LE).unwrap();
            bytes.pwrite_with(4u16, opt + 48, LE).unwrap();
            bytes.pwrite_with(size_of_image, opt + 56, LE).unwrap();
            bytes.pwrite_with(SIZE_OF_HEADERS as u32, opt + 60, LE).unwrap();
            bytes.pwrite_with(0x1234u32, opt + 64, LE).unwrap();
            bytes.pwrite_with(3u16, opt + 68, LE).unwrap();
            bytes.pwrite_with(16u32, opt + 92, LE).unwrap();
            opt + 96
        };
        if let Some((rva, size)) = debug_directory {
            let entry = data_directories + DEBUG_DIRECTORY_INDEX * 8;
            bytes.pwrite_with(rva, entry, LE).unwrap();
            bytes.pwrite_with(size, entry + 4, LE).unwrap();
        }

        // Section table and section data
        let table = opt + optional_size as usize;
        for (i, ((name, va, vsize, data), raw_offset)) in
            sections.iter().zip(&raw_offsets).enumerate()
        {
            let header = table + i * 40;
            let mut name_bytes = [0u8; 8];
            name_bytes[..name.len()].copy_from_slice(name.as_bytes());
            bytes[header..header + 8].copy_from_slice(&name_bytes);
            bytes.pwrite_with(*vsize, header + 8, LE).unwrap();
            bytes.pwrite_with(*va, header + 12, LE).unwrap();
            bytes.pwrite_with(data.len() as u32, header + 16, LE).unwrap();
            let pointer = if data.is_empty() { 0 } else { *raw_offset };
            bytes.pwrite_with(pointer, header + 20, LE).unwrap();
            bytes.pwrite_with(0x4000_0040u32, header + 36, LE).unwrap();

            let start = *raw_offset as usize;
            bytes[start..start + data.len()].copy_from_slice(data);
        }

        // The debug entry needs the file offset of its record
        if debug_directory.is_some() {
            let rdata = *raw_offsets.last().unwrap();
            bytes.pwrite_with(rdata + 28, rdata as usize + 24, LE).unwrap();
        }

        bytes
    }

    /// Writes the image to `dir/name` and returns its path
    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

fn align(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// The module with two sections used by most tests: 0x200 bytes of data in a
/// 0x400 byte section, and a section whose raw and virtual sizes match
pub fn two_section_image(machine: u16, image_base: u64) -> TestImage {
    TestImage::new(machine, image_base)
        .section(TestSection::new(".text", 0x1000, 0x400, 0x200, 0xcc))
        .section(TestSection::new(".data", 0x2000, 0x100, 0x100, 0xdd))
}

pub fn write_blob(dir: &Path, name: &str, len: usize, fill: u8) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![fill; len]).unwrap();
    path
}

/// Wrapping sum of the little-endian words of `bytes`
pub fn word_sum(bytes: &[u8]) -> u32 {
    bytes.chunks_exact(4).fold(0u32, |sum, word| {
        sum.wrapping_add(u32::from_le_bytes(word.try_into().unwrap()))
    })
}
