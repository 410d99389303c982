//! A read-only walker over the dumps this crate produces

use {
    crate::{errors::ReaderError, minidump_format::*, sections::context::RawContextCPU},
    memmap2::Mmap,
    scroll::{
        Endian, LE, Pread,
        ctx::{SizeWith, TryFromCtx},
    },
    std::{fs::File, io::Write, ops::Deref, path::Path},
};

type Result<T> = std::result::Result<T, ReaderError>;

/// Number of modules [`MinidumpReader::print`] shows before eliding the rest
const PRINTED_MODULE_LIMIT: usize = 10;

/// A parsed header and directory over the bytes of a dump
#[derive(Debug)]
pub struct MinidumpReader<T> {
    data: T,
    header: MDRawHeader,
    directory: Vec<MDRawDirectory>,
}

impl MinidumpReader<Mmap> {
    /// Maps the file at `path` and reads its header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: read-only map, owned by the reader
        let map = unsafe { Mmap::map(&file)? };
        Self::new(map)
    }
}

impl<T> MinidumpReader<T>
where
    T: Deref<Target = [u8]>,
{
    pub fn new(data: T) -> Result<Self> {
        let header: MDRawHeader = data.pread_with(0, LE)?;
        if header.signature != MD_HEADER_SIGNATURE {
            return Err(ReaderError::HeaderMismatch(header.signature));
        }

        let entry_size = MDRawDirectory::size_with(&LE);
        let directory = (0..header.stream_count as usize)
            .map(|i| {
                data.pread_with::<MDRawDirectory>(
                    header.stream_directory_rva as usize + i * entry_size,
                    LE,
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            data,
            header,
            directory,
        })
    }

    pub fn header(&self) -> &MDRawHeader {
        &self.header
    }

    pub fn directory(&self) -> &[MDRawDirectory] {
        &self.directory
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// The bytes described by `location`
    pub fn location_bytes(&self, location: &MDLocationDescriptor) -> Result<&[u8]> {
        let start = location.rva as usize;
        start
            .checked_add(location.data_size as usize)
            .and_then(|end| self.data.get(start..end))
            .ok_or(ReaderError::LocationOutOfBounds {
                rva: location.rva,
                size: location.data_size,
            })
    }

    fn stream(&self, stream_type: u32) -> Result<&[u8]> {
        let dirent = self
            .directory
            .iter()
            .find(|dirent| dirent.stream_type == stream_type)
            .ok_or(ReaderError::StreamNotFound(stream_type))?;
        self.location_bytes(&dirent.location)
            .map_err(|_| ReaderError::StreamOutOfBounds {
                stream_type,
                rva: dirent.location.rva,
                size: dirent.location.data_size,
            })
    }

    fn counted_list<R>(&self, stream_type: u32) -> Result<Vec<R>>
    where
        R: SizeWith<Endian> + for<'a> TryFromCtx<'a, Endian, Error = scroll::Error>,
    {
        let bytes = self.stream(stream_type)?;
        let count: u32 = bytes.pread_with(0, LE)?;
        let entry_size = R::size_with(&LE);
        (0..count as usize)
            .map(|i| Ok(bytes.pread_with::<R>(4 + i * entry_size, LE)?))
            .collect()
    }

    pub fn thread_list(&self) -> Result<Vec<MDRawThread>> {
        self.counted_list(MDStreamType::ThreadListStream as u32)
    }

    pub fn module_list(&self) -> Result<Vec<MDRawModule>> {
        self.counted_list(MDStreamType::ModuleListStream as u32)
    }

    pub fn memory_list(&self) -> Result<Vec<MDMemoryDescriptor>> {
        self.counted_list(MDStreamType::MemoryListStream as u32)
    }

    pub fn system_info(&self) -> Result<MDRawSystemInfo> {
        Ok(self
            .stream(MDStreamType::SystemInfoStream as u32)?
            .pread_with(0, LE)?)
    }

    pub fn trailer(&self) -> Result<MDRawTrailer> {
        Ok(self.stream(MD_TRAILER_STREAM)?.pread_with(0, LE)?)
    }

    /// Reads the context of `thread`, picking the layout from its flags
    pub fn thread_context(&self, thread: &MDRawThread) -> Result<RawContextCPU> {
        let bytes = self.location_bytes(&thread.thread_context)?;
        let flags = ContextFlags::from_bits_retain(bytes.pread_with::<u32>(0, LE)?);
        // The AMD64 context has its flags after the six home registers
        let amd64_flags = bytes
            .pread_with::<u32>(48, LE)
            .map(ContextFlags::from_bits_retain)
            .unwrap_or(ContextFlags::empty());
        if amd64_flags.contains(ContextFlags::CONTEXT_AMD64) {
            Ok(RawContextCPU::Amd64(Box::new(bytes.pread_with(0, LE)?)))
        } else if flags.contains(ContextFlags::CONTEXT_X86) {
            Ok(RawContextCPU::X86(Box::new(bytes.pread_with(0, LE)?)))
        } else {
            Err(ReaderError::UnknownContext(flags.bits()))
        }
    }

    /// Reads the length-prefixed UTF-16 string at `rva`
    pub fn read_string(&self, rva: MDRVA) -> Result<String> {
        let offset = rva as usize;
        let byte_len: u32 = self.data.pread_with(offset, LE)?;
        let units = (0..byte_len as usize / 2)
            .map(|i| self.data.pread_with::<u16>(offset + 4 + i * 2, LE))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(String::from_utf16_lossy(&units))
    }

    /// The file bytes backing a memory region
    pub fn memory_bytes(&self, descriptor: &MDMemoryDescriptor) -> Result<&[u8]> {
        self.location_bytes(&descriptor.memory)
    }

    /// Wrapping sum of every little-endian 4-byte word in the file
    pub fn checksum(&self) -> u32 {
        self.data.chunks_exact(4).fold(0u32, |sum, word| {
            sum.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        })
    }

    /// Whether the words of the file sum to zero, as they do once the
    /// trailer checksum is in place
    pub fn verify_checksum(&self) -> bool {
        self.checksum() == 0
    }

    /// Write a human-readable description of every known stream to `f`.
    /// Streams of unknown types are skipped.
    pub fn print<W: Write>(&self, f: &mut W) -> Result<()> {
        write!(
            f,
            "MDRawHeader
  signature            = {:#x}
  version              = {:#x}
  stream_count         = {}
  stream_directory_rva = {:#x}
  checksum             = {:#x}
  time_date_stamp      = {:#x}
  flags                = {:#x}

",
            self.header.signature,
            self.header.version,
            self.header.stream_count,
            self.header.stream_directory_rva,
            self.header.checksum,
            self.header.time_date_stamp,
            self.header.flags,
        )?;

        for (i, dirent) in self.directory.iter().enumerate() {
            writeln!(
                f,
                "mDirectory[{i}]\n  stream_type       = {:#x}\n  location.data_size = {}\n  location.rva       = {:#x}\n",
                dirent.stream_type, dirent.location.data_size, dirent.location.rva
            )?;
        }

        for dirent in &self.directory {
            match dirent.stream_type {
                t if t == MDStreamType::ThreadListStream as u32 => self.print_threads(f)?,
                t if t == MDStreamType::ModuleListStream as u32 => self.print_modules(f)?,
                t if t == MDStreamType::MemoryListStream as u32 => self.print_memory(f)?,
                t if t == MDStreamType::SystemInfoStream as u32 => self.print_system_info(f)?,
                MD_TRAILER_STREAM => self.print_trailer(f)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn print_threads<W: Write>(&self, f: &mut W) -> Result<()> {
        let threads = self.thread_list()?;
        write!(f, "MinidumpThreadList\n  thread_count = {}\n\n", threads.len())?;
        for (i, thread) in threads.iter().enumerate() {
            write!(
                f,
                "thread[{i}]
MDRawThread
  thread_id                   = {:#x}
  suspend_count               = {}
  priority_class              = {:#x}
  priority                    = {:#x}
  teb                         = {:#x}
  stack.start_of_memory_range = {:#x}
  stack.memory.data_size      = {:#x}
  stack.memory.rva            = {:#x}
  thread_context.data_size    = {:#x}
  thread_context.rva          = {:#x}

",
                thread.thread_id,
                thread.suspend_count,
                thread.priority_class,
                thread.priority,
                thread.teb,
                thread.stack.start_of_memory_range,
                thread.stack.memory.data_size,
                thread.stack.memory.rva,
                thread.thread_context.data_size,
                thread.thread_context.rva,
            )?;
            match self.thread_context(thread) {
                Ok(RawContextCPU::X86(ctx)) => write!(
                    f,
                    "MDRawContextX86\n  context_flags = {:#x}\n  eip = {:#x}\n  esp = {:#x}\n  ecx = {:#x}\n  edx = {:#x}\n\n",
                    ctx.context_flags, ctx.eip, ctx.esp, ctx.ecx, ctx.edx
                )?,
                Ok(RawContextCPU::Amd64(ctx)) => write!(
                    f,
                    "MDRawContextAMD64\n  context_flags = {:#x}\n  rip = {:#x}\n  rsp = {:#x}\n  rcx = {:#x}\n  rdx = {:#x}\n\n",
                    ctx.context_flags, ctx.rip, ctx.rsp, ctx.rcx, ctx.rdx
                )?,
                Err(e) => writeln!(f, "  (context unreadable: {e})\n")?,
            }
        }
        Ok(())
    }

    fn print_modules<W: Write>(&self, f: &mut W) -> Result<()> {
        let modules = self.module_list()?;
        write!(f, "MinidumpModuleList\n  module_count = {}\n\n", modules.len())?;
        for (i, module) in modules.iter().take(PRINTED_MODULE_LIMIT).enumerate() {
            let name = self
                .read_string(module.module_name_rva)
                .unwrap_or_else(|_| "(unreadable)".to_owned());
            write!(
                f,
                "module[{i}]
MDRawModule
  base_of_image         = {:#x}
  size_of_image         = {:#x}
  checksum              = {:#x}
  time_date_stamp       = {:#x}
  module_name_rva       = {:#x}
  cv_record.data_size   = {}
  cv_record.rva         = {:#x}
  misc_record.data_size = {}
  misc_record.rva       = {:#x}
  (code_file)           = \"{}\"

",
                module.base_of_image,
                module.size_of_image,
                module.checksum,
                module.time_date_stamp,
                module.module_name_rva,
                module.cv_record.data_size,
                module.cv_record.rva,
                module.misc_record.data_size,
                module.misc_record.rva,
                name,
            )?;
        }
        if modules.len() > PRINTED_MODULE_LIMIT {
            writeln!(f, "...\n")?;
        }
        Ok(())
    }

    fn print_memory<W: Write>(&self, f: &mut W) -> Result<()> {
        let regions = self.memory_list()?;
        write!(
            f,
            "MinidumpMemoryList\n  region_count = {}\n\n",
            regions.len()
        )?;
        for (i, region) in regions.iter().enumerate() {
            write!(
                f,
                "region[{i}]
MDMemoryDescriptor
  start_of_memory_range = {:#x}
  memory.data_size      = {:#x}
  memory.rva            = {:#x}

",
                region.start_of_memory_range, region.memory.data_size, region.memory.rva,
            )?;
        }
        Ok(())
    }

    fn print_system_info<W: Write>(&self, f: &mut W) -> Result<()> {
        let info = self.system_info()?;
        write!(
            f,
            "MDRawSystemInfo
  processor_architecture = {:#x}
  processor_level        = {}
  processor_revision     = {:#x}
  number_of_processors   = {}
  product_type           = {}
  major_version          = {}
  minor_version          = {}
  build_number           = {}
  platform_id            = {:#x}
  csd_version_rva        = {:#x}
  suite_mask             = {:#x}

",
            info.processor_architecture,
            info.processor_level,
            info.processor_revision,
            info.number_of_processors,
            info.product_type,
            info.major_version,
            info.minor_version,
            info.build_number,
            info.platform_id,
            info.csd_version_rva,
            info.suite_mask,
        )?;
        Ok(())
    }

    fn print_trailer<W: Write>(&self, f: &mut W) -> Result<()> {
        let trailer = self.trailer()?;
        write!(
            f,
            "Trailer
  magic       = {:#x}
  stream_type = {:#x}
  checksum    = {:#x} ({})

",
            trailer.magic,
            trailer.stream_type,
            trailer.checksum,
            if self.verify_checksum() { "valid" } else { "INVALID" },
        )?;
        Ok(())
    }
}
