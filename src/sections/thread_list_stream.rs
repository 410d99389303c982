use super::*;

/// Reserves a thread list with room for `num_threads` threads
pub fn alloc<W>(
    allocator: &mut RegionAllocator,
    out: &mut OutputStream<W>,
    num_threads: usize,
) -> Result<SectionArrayWriter<MDRawThread>>
where
    W: Read + Write + Seek,
{
    SectionArrayWriter::alloc_list(allocator, out, num_threads)
}

/// Writes the threads into the reserved list
pub fn write<W>(
    out: &mut OutputStream<W>,
    thread_list: &SectionArrayWriter<MDRawThread>,
    threads: Vec<MDRawThread>,
) -> Result<MDRawDirectory>
where
    W: Read + Write + Seek,
{
    failspot::failspot!(WriteThreadList bail(BuilderError::Output(
        crate::errors::OutputError::Io(std::io::Error::other("thread list write failed"))
    )));

    debug_assert_eq!(threads.len(), thread_list.len());
    for (idx, thread) in threads.into_iter().enumerate() {
        thread_list.set_value_at(out, thread, idx)?;
    }

    Ok(MDRawDirectory {
        stream_type: MDStreamType::ThreadListStream as u32,
        location: thread_list.location(),
    })
}
