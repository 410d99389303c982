use {
    crate::serializers::*,
    error_graph::ErrorList,
    std::path::PathBuf,
    thiserror::Error,
};

#[derive(Debug, Error, serde::Serialize)]
pub enum OutputError {
    #[error("I/O error on the output file")]
    Io(
        #[from]
        #[serde(serialize_with = "serialize_error")]
        std::io::Error,
    ),
    #[error("Short write at offset {offset:#x}: wrote {written} of {requested} bytes")]
    ShortWrite {
        offset: u64,
        written: usize,
        requested: usize,
    },
    #[error("Short read at offset {offset:#x}: read {read} of {requested} bytes")]
    ShortRead {
        offset: u64,
        read: usize,
        requested: usize,
    },
}

#[derive(Debug, Error, serde::Serialize)]
pub enum ImageError {
    #[error("Couldn't open or map the image")]
    Io(
        #[from]
        #[serde(serialize_with = "serialize_error")]
        std::io::Error,
    ),
    #[error("Invalid PE image")]
    InvalidImage(
        #[from]
        #[serde(serialize_with = "serialize_error")]
        goblin::error::Error,
    ),
    #[error("PE image has no optional header")]
    MissingOptionalHeader,
    #[error("Image headers ({header_size:#x} bytes) extend past the end of the file ({file_size:#x} bytes)")]
    TruncatedHeaders { header_size: u64, file_size: u64 },
}

/// Problems in an image that don't prevent it from being embedded
#[derive(Debug, Error, serde::Serialize)]
pub enum ImageSoftError {
    #[error("Unrecognized machine type {0:#06x}, treating the image as 32-bit")]
    UnknownMachine(u16),
    #[error("Found {0} debug records, only the first one is embedded")]
    MultipleDebugRecords(usize),
    #[error("Debug record at {offset:#x} ({size:#x} bytes) is outside of the image")]
    DebugRecordOutOfBounds { offset: u32, size: u32 },
    #[error("Couldn't read debug directory entry {index}")]
    UnreadableDebugDirectory {
        index: usize,
        #[source]
        #[serde(serialize_with = "serialize_error")]
        source: scroll::Error,
    },
}

#[derive(Debug, Error, serde::Serialize)]
pub enum BuilderError {
    #[error("Couldn't load image {}", .path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("Couldn't load blob {}", .path.display())]
    BlobLoad {
        path: PathBuf,
        #[source]
        #[serde(serialize_with = "serialize_error")]
        source: std::io::Error,
    },
    #[error("Couldn't create output file {}", .path.display())]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: OutputError,
    },
    #[error("Failed to write the dump")]
    Output(#[from] OutputError),
    #[error("Failed to serialize a record")]
    Scroll(
        #[from]
        #[serde(serialize_with = "serialize_error")]
        scroll::Error,
    ),
    #[error("Dump layout exceeds the 32-bit offset range ({0:#x})")]
    RvaOverflow(u64),
    #[error("Region {size:#x} bytes at {address:#x} is too large for a memory descriptor")]
    RegionTooLarge { address: u64, size: u64 },
    #[error("Module {name} emitted {written} regions, expected {expected}")]
    RegionCountMismatch {
        name: String,
        expected: usize,
        written: usize,
    },
}

/// Problems collected while building that don't abort the dump
#[derive(Debug, Error, serde::Serialize)]
pub enum BuilderSoftError {
    #[error("Soft errors in image {}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        errors: ErrorList<ImageSoftError>,
    },
}

#[derive(Debug, Error, serde::Serialize)]
pub enum ReaderError {
    #[error("Couldn't open or map the dump")]
    Io(
        #[from]
        #[serde(serialize_with = "serialize_error")]
        std::io::Error,
    ),
    #[error("Failed to parse a record")]
    Scroll(
        #[from]
        #[serde(serialize_with = "serialize_error")]
        scroll::Error,
    ),
    #[error("Not a minidump (signature {0:#010x})")]
    HeaderMismatch(u32),
    #[error("Stream {stream_type:#x} ({size:#x} bytes at {rva:#x}) is outside of the file")]
    StreamOutOfBounds { stream_type: u32, rva: u32, size: u32 },
    #[error("Stream {0:#x} not found")]
    StreamNotFound(u32),
    #[error("Location {size:#x} bytes at {rva:#x} is outside of the file")]
    LocationOutOfBounds { rva: u32, size: u32 },
    #[error("Unrecognized thread context (flags {0:#x})")]
    UnknownContext(u32),
}
