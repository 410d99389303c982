use super::*;

/// One memory region to copy into the dump
#[derive(Debug)]
pub struct Region<'a> {
    pub address: u64,
    /// Bytes backing the start of the region
    pub data: &'a [u8],
    /// Size of the region in the address space. When it exceeds `data` the
    /// rest is zero filled.
    pub logical_size: u64,
    pub tag: &'a str,
    pub name: &'a str,
}

impl Region<'_> {
    /// Number of bytes the region occupies in the file
    pub fn file_size(&self) -> u64 {
        self.logical_size.max(self.data.len() as u64)
    }
}

/// The memory list and the write cursor into it
#[derive(Debug)]
pub struct MemoryListWriter {
    list: SectionArrayWriter<MDMemoryDescriptor>,
    written: Vec<MDMemoryDescriptor>,
}

impl MemoryListWriter {
    /// Reserves a memory list with room for `num_regions` descriptors
    pub fn alloc<W>(
        allocator: &mut RegionAllocator,
        out: &mut OutputStream<W>,
        num_regions: usize,
    ) -> Result<Self>
    where
        W: Read + Write + Seek,
    {
        Ok(Self {
            list: SectionArrayWriter::alloc_list(allocator, out, num_regions)?,
            written: Vec::with_capacity(num_regions),
        })
    }

    /// Copies the region into newly allocated file space and records its
    /// descriptor in the next free slot of the list
    pub fn add<W>(
        &mut self,
        allocator: &mut RegionAllocator,
        out: &mut OutputStream<W>,
        region: Region<'_>,
    ) -> Result<MDMemoryDescriptor>
    where
        W: Read + Write + Seek,
    {
        let size = region.file_size();
        let data_size = u32::try_from(size).map_err(|_| BuilderError::RegionTooLarge {
            address: region.address,
            size,
        })?;
        if self.written.len() == self.list.len() {
            return Err(BuilderError::RegionCountMismatch {
                name: region.name.to_owned(),
                expected: self.list.len(),
                written: self.written.len() + 1,
            });
        }

        let rva = allocate_rva(allocator, size)?;
        out.write_at(rva as u64, region.data)?;
        out.zero_fill(size - region.data.len() as u64)?;

        log::debug!(
            "  add {:#x}..{:#x} {} {}",
            region.address,
            region.address.wrapping_add(size),
            region.tag,
            region.name
        );

        let descriptor = MDMemoryDescriptor {
            start_of_memory_range: region.address,
            memory: MDLocationDescriptor { data_size, rva },
        };
        self.list.set_value_at(out, descriptor, self.written.len())?;
        self.written.push(descriptor);
        Ok(descriptor)
    }

    /// Number of descriptors written so far
    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Checks that every reserved slot was filled
    pub fn finish(self) -> Result<(MDRawDirectory, Vec<MDMemoryDescriptor>)> {
        failspot::failspot!(WriteMemoryList bail(BuilderError::Output(
            crate::errors::OutputError::Io(std::io::Error::other("memory list write failed"))
        )));

        if self.written.len() != self.list.len() {
            return Err(BuilderError::RegionCountMismatch {
                name: "memory list".to_owned(),
                expected: self.list.len(),
                written: self.written.len(),
            });
        }

        let dirent = MDRawDirectory {
            stream_type: MDStreamType::MemoryListStream as u32,
            location: self.list.location(),
        };
        Ok((dirent, self.written))
    }
}
