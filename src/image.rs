//! Extraction of the pieces of a PE image that get embedded in a dump

use {
    crate::errors::{ImageError, ImageSoftError},
    error_graph::WriteErrorList,
    goblin::pe::{
        debug::ImageDebugDirectory,
        header::{
            self, COFF_MACHINE_ARM, COFF_MACHINE_ARM64, COFF_MACHINE_ARMNT, COFF_MACHINE_IA64,
            COFF_MACHINE_X86, COFF_MACHINE_X86_64, Header,
        },
    },
    memmap2::Mmap,
    scroll::{LE, Pread},
    std::{fs::File, ops::Range, path::Path},
};

/// Size of one `IMAGE_DEBUG_DIRECTORY` entry
const DEBUG_DIRECTORY_ENTRY_SIZE: usize = 28;

/// Offset and length of the name field rewritten by [`normalize_header_name`].
/// This is the DOS stub area, which nothing reads once the image is loaded.
const HEADER_NAME_OFFSET: usize = 64;
const HEADER_NAME_LEN: usize = 64;

/// Signatures of the CodeView records we embed: `RSDS` (PDB 7.0) and `NB10`
/// (PDB 2.0)
const CODEVIEW_TAGS: [&[u8; 2]; 2] = [b"RS", b"NB"];

/// Offset of the 32-bit `ImageBase` field in a PE32 optional header
const PE32_IMAGE_BASE_OFFSET: usize = 28;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionDescription {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl SectionDescription {
    fn contains_rva(&self, rva: u32) -> bool {
        let start = self.virtual_address as u64;
        let end = start + self.virtual_size as u64;
        (start..end).contains(&(rva as u64))
    }
}

/// What the builder needs to know about an image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDescription {
    pub is_64_bit: bool,
    pub machine: u16,
    pub image_base: u64,
    pub entry_point_rva: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub sections: Vec<SectionDescription>,
    /// File range of the CodeView record, if the image has one
    pub debug_record: Option<Range<usize>>,
}

impl ImageDescription {
    /// Virtual address of the image headers, which are mapped at the base
    pub fn header_va(&self) -> u64 {
        self.image_base
    }

    pub fn entry_va(&self) -> u64 {
        self.image_base.wrapping_add(self.entry_point_rva as u64)
    }
}

/// Describes the PE image in `bytes`
///
/// Fails if the DOS or PE signature is wrong or there is no optional header.
/// Problems that still leave a usable description, such as an unrecognized
/// machine type, are pushed to `soft_errors`.
pub fn describe(
    bytes: &[u8],
    mut soft_errors: impl WriteErrorList<ImageSoftError>,
) -> Result<ImageDescription, ImageError> {
    let header = Header::parse(bytes)?;
    let optional_header = header
        .optional_header
        .ok_or(ImageError::MissingOptionalHeader)?;

    let optional_header_offset = header.dos_header.pe_pointer as usize
        + header::SIZEOF_PE_MAGIC
        + header::SIZEOF_COFF_HEADER;

    let machine = header.coff_header.machine;
    let mut image_base = u64::from(optional_header.windows_fields.image_base);
    let is_64_bit = match machine {
        COFF_MACHINE_X86_64 | COFF_MACHINE_ARM64 | COFF_MACHINE_IA64 => true,
        COFF_MACHINE_X86 | COFF_MACHINE_ARM | COFF_MACHINE_ARMNT => false,
        other => {
            log::warn!("unrecognized machine type {other:#06x}, assuming 32-bit");
            soft_errors.push(ImageSoftError::UnknownMachine(other));
            // The base is read with the PE32 layout whatever the optional
            // header magic says
            image_base = bytes
                .pread_with::<u32>(optional_header_offset + PE32_IMAGE_BASE_OFFSET, LE)
                .map_err(goblin::error::Error::Scroll)?
                .into();
            false
        }
    };

    let mut offset =
        optional_header_offset + header.coff_header.size_of_optional_header as usize;
    let sections: Vec<_> = header
        .coff_header
        .sections(bytes, &mut offset)?
        .iter()
        .map(|section| SectionDescription {
            name: section.name().unwrap_or_default().to_owned(),
            virtual_address: section.virtual_address,
            virtual_size: section.virtual_size,
            size_of_raw_data: section.size_of_raw_data,
            pointer_to_raw_data: section.pointer_to_raw_data,
        })
        .collect();

    let size_of_headers = optional_header.windows_fields.size_of_headers;
    if size_of_headers as usize > bytes.len() {
        return Err(ImageError::TruncatedHeaders {
            header_size: size_of_headers as u64,
            file_size: bytes.len() as u64,
        });
    }

    let debug_record = match optional_header.data_directories.get_debug_table() {
        Some(debug_table) => find_debug_record(
            bytes,
            &sections,
            debug_table.virtual_address,
            debug_table.size,
            &mut soft_errors,
        ),
        None => None,
    };

    Ok(ImageDescription {
        is_64_bit,
        machine,
        image_base,
        entry_point_rva: optional_header.standard_fields.address_of_entry_point as u32,
        size_of_image: optional_header.windows_fields.size_of_image,
        size_of_headers,
        checksum: optional_header.windows_fields.check_sum,
        time_date_stamp: header.coff_header.time_date_stamp,
        sections,
        debug_record,
    })
}

/// Maps an RVA to a file offset through the section containing it
///
/// Returns 0 when no section contains `rva`, or when the offset doesn't fit
/// in 32 bits. Offset 0 is the DOS header, so it never is a valid location
/// for anything this is used to find.
pub fn rva_to_offset(sections: &[SectionDescription], rva: u32) -> u32 {
    sections
        .iter()
        .find(|section| section.contains_rva(rva))
        .and_then(|section| {
            (rva - section.virtual_address).checked_add(section.pointer_to_raw_data)
        })
        .unwrap_or(0)
}

fn find_debug_record(
    bytes: &[u8],
    sections: &[SectionDescription],
    directory_rva: u32,
    directory_size: u32,
    soft_errors: &mut impl WriteErrorList<ImageSoftError>,
) -> Option<Range<usize>> {
    let directory_offset = rva_to_offset(sections, directory_rva) as usize;
    if directory_offset == 0 {
        return None;
    }

    let mut candidates = Vec::new();
    for index in 0..directory_size as usize / DEBUG_DIRECTORY_ENTRY_SIZE {
        let entry_offset = directory_offset + index * DEBUG_DIRECTORY_ENTRY_SIZE;
        let entry: ImageDebugDirectory = match bytes.pread_with(entry_offset, LE) {
            Ok(entry) => entry,
            Err(source) => {
                soft_errors.push(ImageSoftError::UnreadableDebugDirectory { index, source });
                break;
            }
        };

        let start = entry.pointer_to_raw_data as usize;
        let Some(end) = start
            .checked_add(entry.size_of_data as usize)
            .filter(|end| *end <= bytes.len())
        else {
            soft_errors.push(ImageSoftError::DebugRecordOutOfBounds {
                offset: entry.pointer_to_raw_data,
                size: entry.size_of_data,
            });
            continue;
        };

        let record = &bytes[start..end];
        if CODEVIEW_TAGS.iter().any(|tag| record.starts_with(*tag)) {
            candidates.push(start..end);
        }
    }

    if candidates.len() > 1 {
        log::warn!(
            "found {} CodeView records, using the first one",
            candidates.len()
        );
        soft_errors.push(ImageSoftError::MultipleDebugRecords(candidates.len()));
    }
    candidates.into_iter().next()
}

/// Overwrites the name field of an owned copy of the image headers with the
/// lowercased file name of `path`
///
/// The field is zeroed first and the name is truncated so that it is always
/// NUL terminated. Headers too short to hold the field are left untouched.
pub fn normalize_header_name(header: &mut [u8], path: &Path) {
    let Some(field) = header.get_mut(HEADER_NAME_OFFSET..HEADER_NAME_OFFSET + HEADER_NAME_LEN)
    else {
        return;
    };
    field.fill(0);
    let name = file_name(path).to_lowercase();
    let len = name.len().min(HEADER_NAME_LEN - 1);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
}

/// The final component of `path`, accepting both separator styles
pub fn file_name(path: &Path) -> String {
    let path = path.to_string_lossy();
    path.rsplit(['/', '\\', ':'])
        .next()
        .unwrap_or_default()
        .to_owned()
}

/// A PE image loaded from disk
#[derive(Debug)]
pub struct Image {
    map: Mmap,
    headers: Vec<u8>,
    name: String,
    description: ImageDescription,
}

impl Image {
    /// Maps and describes the image at `path`
    pub fn open(
        path: &Path,
        soft_errors: impl WriteErrorList<ImageSoftError>,
    ) -> Result<Self, ImageError> {
        let file = File::open(path)?;
        // SAFETY: the map is read-only and never outlives the image. Changes
        // to the file by other processes while it is mapped are not
        // something we can guard against.
        let map = unsafe { Mmap::map(&file)? };
        Self::from_map(map, path, soft_errors)
    }

    fn from_map(
        map: Mmap,
        path: &Path,
        soft_errors: impl WriteErrorList<ImageSoftError>,
    ) -> Result<Self, ImageError> {
        let description = describe(&map, soft_errors)?;
        let mut headers = map[..description.size_of_headers as usize].to_vec();
        normalize_header_name(&mut headers, path);
        Ok(Self {
            map,
            headers,
            name: file_name(path),
            description,
        })
    }

    pub fn description(&self) -> &ImageDescription {
        &self.description
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The image headers with their name field normalized
    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Bytes of the CodeView record, if any
    pub fn debug_record(&self) -> Option<&[u8]> {
        self.description
            .debug_record
            .clone()
            .map(|range| &self.map[range])
    }

    /// The file bytes backing `section`, clamped to the end of the file
    pub fn section_data(&self, section: &SectionDescription) -> &[u8] {
        let start = (section.pointer_to_raw_data as usize).min(self.map.len());
        let end = start
            .saturating_add(section.size_of_raw_data as usize)
            .min(self.map.len());
        &self.map[start..end]
    }

    /// Number of memory regions the image occupies in a dump: the headers
    /// plus one per section
    pub fn region_count(&self) -> usize {
        1 + self.description.sections.len()
    }
}
