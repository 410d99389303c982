//! Assembly of a dump from PE images, raw blobs and a synthetic stack

use {
    crate::{
        allocator::RegionAllocator,
        errors::{BuilderError, BuilderSoftError},
        image::{self, Image},
        minidump_format::*,
        output::{DumpFile, OutputStream},
        sections::{
            SectionArrayWriter, SectionWriter,
            context::{ContextWriter, EntryRegisters, RawContextCPU},
            memory_list_stream::{MemoryListWriter, Region},
            module_list_stream, systeminfo_stream, thread_list_stream, to_bytes, trailer,
        },
    },
    error_graph::{ErrorList, WriteErrorList},
    memmap2::Mmap,
    scroll::{LE, ctx::SizeWith},
    std::{
        fs::File,
        io::{Read, Seek, Write},
        path::{Path, PathBuf},
    },
};

type Result<T> = std::result::Result<T, BuilderError>;

pub const DEFAULT_STACK_ADDRESS: u64 = 0x2fff00;
pub const DEFAULT_STACK_SIZE: u64 = 0x100;
pub const DEFAULT_THREAD_ID: u32 = 1;

#[derive(Debug)]
struct Module {
    path: PathBuf,
    image: Image,
}

impl Module {
    fn base(&self) -> u64 {
        self.image.description().image_base
    }
}

#[derive(Debug)]
struct Blob {
    name: String,
    address: u64,
    map: Mmap,
}

/// What was written, for comparison with what a reader finds in the file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpSummary {
    pub stream_count: u32,
    pub directory: Vec<MDRawDirectory>,
    pub module_count: usize,
    pub thread_count: usize,
    /// Memory list entries, in file order
    pub regions: Vec<MDMemoryDescriptor>,
    /// Value stored in the trailer
    pub checksum: u32,
    pub file_size: u64,
}

/// Source of the next region in the address-ordered merge
///
/// The declaration order is the precedence among sources at the same address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Module,
    Blob,
    Stack,
}

/// Picks the source whose next region has the lowest address. `None` marks
/// an exhausted source.
fn pick_next(module: Option<u64>, blob: Option<u64>, stack: Option<u64>) -> Option<Source> {
    [
        (module, Source::Module),
        (blob, Source::Blob),
        (stack, Source::Stack),
    ]
    .into_iter()
    .filter_map(|(address, source)| Some((address?, source)))
    .min()
    .map(|(_, source)| source)
}

/// Builds a minidump out of static inputs
///
/// Images and blobs are collected with [`Self::add_module`] and
/// [`Self::add_blob`], then laid out and written in one go by
/// [`Self::write`]. Dropping the builder without writing deletes the output
/// file, as does any failure during [`Self::write`].
#[derive(Debug)]
pub struct MinidumpBuilder {
    file: DumpFile,
    modules: Vec<Module>,
    blobs: Vec<Blob>,
    stack_address: u64,
    stack_size: u64,
    thread_id: u32,
    soft_errors: ErrorList<BuilderSoftError>,
}

impl MinidumpBuilder {
    /// Creates (or truncates) the output file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = DumpFile::create(path).map_err(|source| BuilderError::CreateOutput {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            file,
            modules: Vec::new(),
            blobs: Vec::new(),
            stack_address: DEFAULT_STACK_ADDRESS,
            stack_size: DEFAULT_STACK_SIZE,
            thread_id: DEFAULT_THREAD_ID,
            soft_errors: ErrorList::default(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Adds the PE image at `path`
    ///
    /// The first image added is the primary image: the synthetic thread starts
    /// at its entry point and it decides the CPU type of the dump.
    pub fn add_module(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let soft_errors_path = path.to_owned();
        let image = Image::open(
            path,
            self.soft_errors
                .subwriter(move |errors| BuilderSoftError::Image {
                    path: soft_errors_path,
                    errors,
                }),
        )
        .map_err(|source| BuilderError::ImageLoad {
            path: path.to_owned(),
            source,
        })?;

        let description = image.description();
        if self.modules.is_empty() {
            log::debug!(
                "primary image {}: base {:#x} entry {:#x} {}-bit",
                image.name(),
                description.image_base,
                description.entry_va(),
                if description.is_64_bit { 64 } else { 32 }
            );
        }
        log::debug!(
            "module {} at {:#x}, {} sections",
            image.name(),
            description.image_base,
            description.sections.len()
        );

        self.modules.push(Module {
            path: path.to_owned(),
            image,
        });
        Ok(())
    }

    /// Adds the contents of the file at `path` as memory at `address`, and
    /// returns its size
    pub fn add_blob(&mut self, path: impl AsRef<Path>, address: u64) -> Result<u64> {
        let path = path.as_ref();
        let map_blob = || -> std::io::Result<Mmap> {
            let file = File::open(path)?;
            // SAFETY: the map is read-only and lives as long as the builder
            unsafe { Mmap::map(&file) }
        };
        let map = map_blob().map_err(|source| BuilderError::BlobLoad {
            path: path.to_owned(),
            source,
        })?;

        let size = map.len() as u64;
        log::debug!("blob {} at {address:#x}, {size:#x} bytes", path.display());
        self.blobs.push(Blob {
            name: image::file_name(path),
            address,
            map,
        });
        Ok(size)
    }

    /// Places the synthetic stack region
    pub fn set_stack(&mut self, address: u64, size: u64) -> &mut Self {
        self.stack_address = address;
        self.stack_size = size;
        self
    }

    /// Sets the id of the synthetic thread
    pub fn set_thread_id(&mut self, thread_id: u32) -> &mut Self {
        self.thread_id = thread_id;
        self
    }

    /// Problems found in the inputs that didn't stop them from being added
    pub fn soft_errors(&self) -> &ErrorList<BuilderSoftError> {
        &self.soft_errors
    }

    /// Paths of the images added so far, in the order they were added
    pub fn module_paths(&self) -> impl Iterator<Item = &Path> {
        self.modules.iter().map(|module| module.path.as_path())
    }

    /// Abandons the dump and removes the output file
    pub fn delete(self) -> Result<()> {
        self.file.delete()?;
        Ok(())
    }

    /// Lays out and writes the dump
    ///
    /// On failure the output file is removed.
    pub fn write(self) -> Result<DumpSummary> {
        let Self {
            mut file,
            modules,
            blobs,
            stack_address,
            stack_size,
            thread_id,
            soft_errors: _,
        } = self;

        let summary = Assembly {
            modules: &modules,
            blobs: &blobs,
            stack_address,
            stack_size,
            thread_id,
        }
        .write(file.stream())?;

        log::debug!(
            "wrote {} ({:#x} bytes, {} regions, checksum {:#010x})",
            file.path().display(),
            summary.file_size,
            summary.regions.len(),
            summary.checksum
        );
        file.persist()?;
        Ok(summary)
    }
}

/// Everything needed to lay out the dump, borrowed from the builder
struct Assembly<'a> {
    modules: &'a [Module],
    blobs: &'a [Blob],
    stack_address: u64,
    stack_size: u64,
    thread_id: u32,
}

impl Assembly<'_> {
    fn write<W>(&self, out: &mut OutputStream<W>) -> Result<DumpSummary>
    where
        W: Read + Write + Seek,
    {
        let primary = self.modules.first().map(|module| module.image.description());
        let is_64_bit = primary.is_some_and(|primary| primary.is_64_bit);
        let primary_base = primary.map_or(0, |primary| primary.image_base);

        // Regions go out in address order, module names and debug records
        // in the order the modules were added
        let mut modules: Vec<&Module> = self.modules.iter().collect();
        modules.sort_by_key(|module| module.base());
        let mut blobs: Vec<&Blob> = self.blobs.iter().collect();
        blobs.sort_by_key(|blob| blob.address);

        let region_count = 1
            + self
                .modules
                .iter()
                .map(|module| module.image.region_count())
                .sum::<usize>()
            + self.blobs.len();

        let header_size = MDRawHeader::size_with(&LE) as u64;
        let directory_size = MDRawDirectory::size_with(&LE) as u64 * MD_STREAM_COUNT as u64;
        let mut allocator = RegionAllocator::new(header_size + directory_size);

        let thread_list = thread_list_stream::alloc(&mut allocator, out, 1)?;
        let module_list =
            SectionArrayWriter::<MDRawModule>::alloc_list(&mut allocator, out, self.modules.len())?;
        let mut memory_list = MemoryListWriter::alloc(&mut allocator, out, region_count)?;
        let system_info = SectionWriter::<MDRawSystemInfo>::alloc(&mut allocator)?;
        let trailer = SectionWriter::<MDRawTrailer>::alloc(&mut allocator)?;
        let context = ContextWriter::alloc(&mut allocator, is_64_bit)?;

        let mut module_entries = self
            .modules
            .iter()
            .map(|module| module_list_stream::write_module_info(&mut allocator, out, &module.image))
            .collect::<Result<Vec<_>>>()?;

        let mut modules = modules.into_iter().peekable();
        let mut blobs = blobs.into_iter().peekable();
        let mut stack = Some(self.stack_address);
        let mut stack_descriptor = MDMemoryDescriptor::default();
        while let Some(source) = pick_next(
            modules.peek().map(|module| module.base()),
            blobs.peek().map(|blob| blob.address),
            stack,
        ) {
            match source {
                Source::Module => {
                    if let Some(module) = modules.next() {
                        write_module_regions(&mut allocator, out, &mut memory_list, &module.image)?;
                    }
                }
                Source::Blob => {
                    if let Some(blob) = blobs.next() {
                        memory_list.add(
                            &mut allocator,
                            out,
                            Region {
                                address: blob.address,
                                data: &blob.map[..],
                                logical_size: blob.map.len() as u64,
                                tag: "blob",
                                name: &blob.name,
                            },
                        )?;
                    }
                }
                Source::Stack => {
                    stack = None;
                    stack_descriptor = memory_list.add(
                        &mut allocator,
                        out,
                        Region {
                            address: self.stack_address,
                            data: &[],
                            logical_size: self.stack_size,
                            tag: "stack",
                            name: "",
                        },
                    )?;
                }
            }
        }

        let registers = EntryRegisters {
            stack_pointer: self.stack_address,
            image_base: primary_base,
            image_head: primary.map_or(0, |primary| primary.header_va()),
            entry_point: primary.map_or(0, |primary| primary.entry_va()),
        };
        context.set_value(out, &RawContextCPU::synthetic(is_64_bit, registers))?;
        let thread = MDRawThread {
            thread_id: self.thread_id,
            suspend_count: 0,
            stack: stack_descriptor,
            thread_context: context.location(),
            ..Default::default()
        };

        let thread_dirent = thread_list_stream::write(out, &thread_list, vec![thread])?;
        module_list_stream::sort_modules(&mut module_entries, primary_base);
        let module_dirent = module_list_stream::write(out, &module_list, module_entries)?;
        let (memory_dirent, regions) = memory_list.finish()?;
        let system_info_dirent =
            systeminfo_stream::write(out, &system_info, primary.map(|primary| primary.machine))?;
        let trailer_dirent = trailer::write(out, &trailer)?;

        let directory = vec![
            thread_dirent,
            module_dirent,
            memory_dirent,
            system_info_dirent,
            trailer_dirent,
        ];
        write_header(out, &directory)?;

        let file_size = allocator.end();
        out.pad_to(file_size)?;
        let checksum = trailer::patch_checksum(out, &trailer)?;
        out.flush()?;

        Ok(DumpSummary {
            stream_count: MD_STREAM_COUNT,
            directory,
            module_count: self.modules.len(),
            thread_count: 1,
            regions,
            checksum,
            file_size,
        })
    }
}

/// Writes the header region and one region per section of `image`
fn write_module_regions<W>(
    allocator: &mut RegionAllocator,
    out: &mut OutputStream<W>,
    memory_list: &mut MemoryListWriter,
    image: &Image,
) -> Result<()>
where
    W: Read + Write + Seek,
{
    let description = image.description();
    let before = memory_list.len();

    memory_list.add(
        allocator,
        out,
        Region {
            address: description.header_va(),
            data: image.headers(),
            logical_size: description.size_of_headers as u64,
            tag: "headers",
            name: image.name(),
        },
    )?;
    for section in &description.sections {
        memory_list.add(
            allocator,
            out,
            Region {
                address: description
                    .image_base
                    .wrapping_add(section.virtual_address as u64),
                data: image.section_data(section),
                logical_size: section.virtual_size as u64,
                tag: &section.name,
                name: image.name(),
            },
        )?;
    }

    let written = memory_list.len() - before;
    if written != image.region_count() {
        return Err(BuilderError::RegionCountMismatch {
            name: image.name().to_owned(),
            expected: image.region_count(),
            written,
        });
    }
    Ok(())
}

fn write_header<W>(out: &mut OutputStream<W>, directory: &[MDRawDirectory]) -> Result<()>
where
    W: Read + Write + Seek,
{
    let header_size = MDRawHeader::size_with(&LE);
    let header = MDRawHeader {
        signature: MD_HEADER_SIGNATURE,
        version: MD_HEADER_VERSION,
        stream_count: directory.len() as u32,
        stream_directory_rva: header_size as MDRVA,
        checksum: 0,
        time_date_stamp: 0,
        flags: (MDType::NORMAL | MDType::WITH_DATA_SEGS).bits(),
    };

    let mut bytes = to_bytes(header)?;
    for dirent in directory {
        bytes.extend(to_bytes(*dirent)?);
    }
    out.write_at(0, &bytes)?;
    Ok(())
}
