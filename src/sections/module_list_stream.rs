use {super::*, crate::image::Image};

/// Writes the CodeView record and the name of `image` and returns its module
/// list entry
pub fn write_module_info<W>(
    allocator: &mut RegionAllocator,
    out: &mut OutputStream<W>,
    image: &Image,
) -> Result<MDRawModule>
where
    W: Read + Write + Seek,
{
    let cv_record = match image.debug_record() {
        Some(record) => write_raw(allocator, out, record)?,
        None => MDLocationDescriptor::default(),
    };
    let module_name_rva = write_string(allocator, out, image.name())?;

    let description = image.description();
    Ok(MDRawModule {
        base_of_image: description.image_base,
        size_of_image: description.size_of_image,
        checksum: description.checksum,
        time_date_stamp: description.time_date_stamp,
        module_name_rva,
        cv_record,
        ..Default::default()
    })
}

/// Orders the entries by base address, except that entries at `primary_base`
/// come first
pub fn sort_modules(modules: &mut [MDRawModule], primary_base: u64) {
    modules.sort_by_key(|module| {
        if module.base_of_image == primary_base {
            0
        } else {
            module.base_of_image
        }
    });
}

pub fn write<W>(
    out: &mut OutputStream<W>,
    module_list: &SectionArrayWriter<MDRawModule>,
    modules: Vec<MDRawModule>,
) -> Result<MDRawDirectory>
where
    W: Read + Write + Seek,
{
    failspot::failspot!(WriteModuleList bail(BuilderError::Output(
        crate::errors::OutputError::Io(std::io::Error::other("module list write failed"))
    )));

    for (idx, module) in modules.into_iter().enumerate() {
        module_list.set_value_at(out, module, idx)?;
    }

    Ok(MDRawDirectory {
        stream_type: MDStreamType::ModuleListStream as u32,
        location: module_list.location(),
    })
}
