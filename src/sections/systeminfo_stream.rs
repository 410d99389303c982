use {super::*, goblin::pe::header::COFF_MACHINE_X86_64};

/// Fills the reserved system info slot
///
/// Nothing here is discovered from a live machine: the dump claims a single
/// processor. Only an AMD64 primary image sets the architecture, anything
/// else leaves it at 0 (x86).
pub fn write<W>(
    out: &mut OutputStream<W>,
    info_section: &SectionWriter<MDRawSystemInfo>,
    primary_machine: Option<u16>,
) -> Result<MDRawDirectory>
where
    W: Read + Write + Seek,
{
    let dirent = MDRawDirectory {
        stream_type: MDStreamType::SystemInfoStream as u32,
        location: info_section.location(),
    };
    let info = MDRawSystemInfo {
        processor_architecture: processor_architecture(primary_machine),
        number_of_processors: 1,
        ..Default::default()
    };

    info_section.set_value(out, info)?;
    Ok(dirent)
}

fn processor_architecture(primary_machine: Option<u16>) -> u16 {
    match primary_machine {
        Some(COFF_MACHINE_X86_64) => ProcessorArchitecture::PROCESSOR_ARCHITECTURE_AMD64 as u16,
        _ => ProcessorArchitecture::PROCESSOR_ARCHITECTURE_INTEL as u16,
    }
}
