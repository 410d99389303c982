use super::*;

/// Offset of the checksum word within the trailer record
const CHECKSUM_OFFSET: u64 = 12;

/// Writes the trailer with a zero checksum. The checksum is patched in with
/// [`patch_checksum`] once every other byte of the file is final.
pub fn write<W>(
    out: &mut OutputStream<W>,
    trailer: &SectionWriter<MDRawTrailer>,
) -> Result<MDRawDirectory>
where
    W: Read + Write + Seek,
{
    trailer.set_value(
        out,
        MDRawTrailer {
            magic: MD_TRAILER_MAGIC,
            stream_type: MD_TRAILER_STREAM,
            reserved: 0,
            checksum: 0,
        },
    )?;
    Ok(MDRawDirectory {
        stream_type: MD_TRAILER_STREAM,
        location: trailer.location(),
    })
}

/// Checksums the whole file and stores the negated sum in the trailer, so
/// that the words of the finished file sum to zero. Returns the stored value.
pub fn patch_checksum<W>(
    out: &mut OutputStream<W>,
    trailer: &SectionWriter<MDRawTrailer>,
) -> Result<u32>
where
    W: Read + Write + Seek,
{
    failspot::failspot!(Checksum bail(BuilderError::Output(
        crate::errors::OutputError::Io(std::io::Error::other("checksum pass failed"))
    )));

    let sum = out.checksum()?;
    let checksum = 0u32.wrapping_sub(sum);
    out.write_at(
        trailer.position as u64 + CHECKSUM_OFFSET,
        &checksum.to_le_bytes(),
    )?;
    Ok(checksum)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn patched_file_sums_to_zero() {
        let mut allocator = RegionAllocator::new(0);
        let mut out = OutputStream::new(Cursor::new(Vec::new())).unwrap();
        write_raw(&mut allocator, &mut out, &[0x12, 0x34, 0x56, 0x78, 0xff, 0xff, 0xff, 0xff])
            .unwrap();
        let trailer = SectionWriter::<MDRawTrailer>::alloc(&mut allocator).unwrap();
        write(&mut out, &trailer).unwrap();

        let checksum = patch_checksum(&mut out, &trailer).unwrap();
        assert_ne!(checksum, 0);
        assert_eq!(out.checksum().unwrap(), 0);

        let bytes = out.into_inner().into_inner();
        assert_eq!(&bytes[20..24], &checksum.to_le_bytes());
    }
}
