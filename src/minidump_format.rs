//! On-disk structures of the minidump container
//!
//! Every structure is serialized field by field in little-endian order with
//! [`scroll`], so the in-memory layout of these types never matters. The sizes
//! used by the builder come from [`SizeWith`], not from `std::mem::size_of`.

use bitflags::bitflags;
pub use minidump_common::format::{
    MINIDUMP_SIGNATURE as MD_HEADER_SIGNATURE, MINIDUMP_STREAM_TYPE as MDStreamType,
    MINIDUMP_VERSION as MD_HEADER_VERSION, ProcessorArchitecture,
};
use scroll::{Pread, Pwrite, SizeWith};

/* An MDRVA is an offset into the minidump file.  The beginning of the
 * MDRawHeader is at offset 0. */
pub type MDRVA = u32;

/// Application-defined stream type of the trailer record
pub const MD_TRAILER_STREAM: u32 = 0xCAFEFACE;
/// First magic word of the trailer record
pub const MD_TRAILER_MAGIC: u32 = 0xFEEDBEEF;

/// Number of streams in every dump produced by this crate: thread list,
/// module list, memory list, system info and the trailer
pub const MD_STREAM_COUNT: u32 = 5;

bitflags! {
    /// For (MDRawHeader).flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MDType: u64 {
        /// The standard type of minidump, has no bits set
        const NORMAL = 0x00000000;
        const WITH_DATA_SEGS = 0x00000001;
        const WITH_FULL_MEMORY = 0x00000002;
        const WITH_HANDLE_DATA = 0x00000004;
    }
}

bitflags! {
    /// For the `context_flags` field of the CPU contexts
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        const CONTEXT_X86 = 0x00010000;
        const CONTEXT_AMD64 = 0x00100000;
        const CONTROL = 0x00000001;
        const INTEGER = 0x00000002;
        const SEGMENTS = 0x00000004;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDLocationDescriptor {
    pub data_size: u32,
    pub rva: MDRVA,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDMemoryDescriptor {
    /* The base address of the memory range on the host that produced the
     * minidump. */
    pub start_of_memory_range: u64,
    pub memory: MDLocationDescriptor,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawHeader {
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: MDRVA, /* A |stream_count|-sized array of
                                      * MDRawDirectory structures. */
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub flags: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawDirectory {
    pub stream_type: u32,
    pub location: MDLocationDescriptor,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawThread {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64, /* Thread environment block */
    pub stack: MDMemoryDescriptor,
    pub thread_context: MDLocationDescriptor, /* MDRawContext[CPU] */
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDVSFixedFileInfo {
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32, /* Identifies valid bits in fileFlags */
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

/// A module entry of the module list. Serialized without tail padding, so it
/// always occupies 108 bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawModule {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,          /* 0 if unknown */
    pub time_date_stamp: u32,   /* time_t */
    pub module_name_rva: MDRVA, /* MDString, pathname or filename */
    pub version_info: MDVSFixedFileInfo,

    /* The next field stores a CodeView record and is populated when a module's
     * debug information resides in a PDB file.  It identifies the PDB file. */
    pub cv_record: MDLocationDescriptor,

    /* The next field is populated when a module's debug information resides
     * in a DBG file.  It identifies the DBG file.  This field is effectively
     * obsolete with modules built by recent toolchains. */
    pub misc_record: MDLocationDescriptor,

    pub reserved0: u64,
    pub reserved1: u64,
}

/// The 24-byte `CPU_INFORMATION` union, kept as raw bytes
#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDCPUInformation {
    pub data: [u8; 24],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawSystemInfo {
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: MDRVA,
    pub suite_mask: u16,
    pub reserved2: u16,
    pub cpu: MDCPUInformation,
}

/// Trailer record closing every dump written by this crate
///
/// The checksum is the two's-complement negation of the sum of every other
/// 4-byte word in the file, so the words of the whole file sum to zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawTrailer {
    pub magic: u32,
    pub stream_type: u32,
    pub reserved: u32,
    pub checksum: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDFloatingSaveAreaX86 {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

impl Default for MDFloatingSaveAreaX86 {
    fn default() -> Self {
        Self {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            error_offset: 0,
            error_selector: 0,
            data_offset: 0,
            data_selector: 0,
            register_area: [0; 80],
            cr0_npx_state: 0,
        }
    }
}

/// `CONTEXT_X86`, 716 bytes
#[derive(Clone, Debug, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawContextX86 {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: MDFloatingSaveAreaX86,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
    pub extended_registers: [u8; 512],
}

impl Default for MDRawContextX86 {
    fn default() -> Self {
        Self {
            context_flags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            float_save: MDFloatingSaveAreaX86::default(),
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            edi: 0,
            esi: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ebp: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
            extended_registers: [0; 512],
        }
    }
}

/// `CONTEXT_AMD64`, 1232 bytes
#[derive(Clone, Debug, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MDRawContextAMD64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /* XMM_SAVE_AREA32 */
    pub float_save: [u8; 512],
    /* 26 128-bit vector registers */
    pub vector_register: [u64; 52],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

impl Default for MDRawContextAMD64 {
    fn default() -> Self {
        Self {
            p1_home: 0,
            p2_home: 0,
            p3_home: 0,
            p4_home: 0,
            p5_home: 0,
            p6_home: 0,
            context_flags: 0,
            mx_csr: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            eflags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            float_save: [0; 512],
            vector_register: [0; 52],
            vector_control: 0,
            debug_control: 0,
            last_branch_to_rip: 0,
            last_branch_from_rip: 0,
            last_exception_to_rip: 0,
            last_exception_from_rip: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scroll::{LE, ctx::SizeWith};

    #[test]
    fn record_sizes() {
        assert_eq!(MDRawHeader::size_with(&LE), 32);
        assert_eq!(MDRawDirectory::size_with(&LE), 12);
        assert_eq!(MDRawThread::size_with(&LE), 48);
        assert_eq!(MDRawModule::size_with(&LE), 108);
        assert_eq!(MDMemoryDescriptor::size_with(&LE), 16);
        assert_eq!(MDRawSystemInfo::size_with(&LE), 56);
        assert_eq!(MDRawTrailer::size_with(&LE), 16);
        assert_eq!(MDRawContextX86::size_with(&LE), 716);
        assert_eq!(MDRawContextAMD64::size_with(&LE), 1232);
    }

    #[test]
    fn header_is_packed_little_endian() {
        let header = MDRawHeader {
            signature: MD_HEADER_SIGNATURE,
            version: MD_HEADER_VERSION,
            stream_count: MD_STREAM_COUNT,
            stream_directory_rva: 32,
            checksum: 0,
            time_date_stamp: 0,
            flags: (MDType::NORMAL | MDType::WITH_DATA_SEGS).bits(),
        };
        let mut bytes = [0u8; 32];
        bytes.pwrite_with(header.clone(), 0, LE).unwrap();
        assert_eq!(&bytes[..4], b"MDMP");
        assert_eq!(bytes[24], 1);

        let read: MDRawHeader = bytes.pread_with(0, LE).unwrap();
        assert_eq!(read, header);
    }
}
