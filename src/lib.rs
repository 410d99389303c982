pub mod allocator;
pub mod builder;
pub mod errors;
pub mod image;
pub mod minidump_format;
pub mod output;
pub mod reader;
pub mod sections;

mod serializers;

pub use {
    builder::{DumpSummary, MinidumpBuilder},
    reader::MinidumpReader,
};

failspot::failspot_name! {
    pub enum FailSpotName {
        WriteThreadList,
        WriteModuleList,
        WriteMemoryList,
        Checksum,
    }
}
