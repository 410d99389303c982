pub mod context;
pub mod memory_list_stream;
pub mod module_list_stream;
pub mod systeminfo_stream;
pub mod thread_list_stream;
pub mod trailer;

use {
    crate::{
        allocator::RegionAllocator,
        errors::BuilderError,
        minidump_format::*,
        output::OutputStream,
    },
    scroll::{
        Endian, LE, Pwrite,
        ctx::{SizeWith, TryIntoCtx},
    },
    std::{
        io::{Read, Seek, Write},
        marker::PhantomData,
    },
};

type Result<T> = std::result::Result<T, BuilderError>;

/// Reserves `size` bytes and returns their offset as an RVA
///
/// Fails if any part of the reservation lies beyond what a 32-bit RVA can
/// address.
pub fn allocate_rva(allocator: &mut RegionAllocator, size: u64) -> Result<MDRVA> {
    let offset = allocator.allocate(size);
    let end = allocator.position();
    if end > u32::MAX as u64 {
        return Err(BuilderError::RvaOverflow(end));
    }
    Ok(offset as MDRVA)
}

/// Serializes a record in its exact on-disk layout
pub fn to_bytes<T>(val: T) -> std::result::Result<Vec<u8>, scroll::Error>
where
    T: SizeWith<Endian> + TryIntoCtx<Endian, Error = scroll::Error>,
{
    let mut bytes = vec![0u8; T::size_with(&LE)];
    bytes.pwrite_with(val, 0, LE)?;
    Ok(bytes)
}

/// A slot for one `T` in the dump, whose offset is known before its value
#[derive(Debug, PartialEq)]
pub struct SectionWriter<T> {
    pub position: MDRVA,
    phantom: PhantomData<T>,
}

impl<T> SectionWriter<T>
where
    T: SizeWith<Endian> + TryIntoCtx<Endian, Error = scroll::Error>,
{
    /// Reserve a slot for a `T`, to be filled later with [`Self::set_value`]
    pub fn alloc(allocator: &mut RegionAllocator) -> Result<Self> {
        let position = allocate_rva(allocator, T::size_with(&LE) as u64)?;
        Ok(Self {
            position,
            phantom: PhantomData,
        })
    }

    /// Reserve a slot and fill it right away
    pub fn alloc_with_val<W>(
        allocator: &mut RegionAllocator,
        out: &mut OutputStream<W>,
        val: T,
    ) -> Result<Self>
    where
        W: Read + Write + Seek,
    {
        let section = Self::alloc(allocator)?;
        section.set_value(out, val)?;
        Ok(section)
    }

    /// Write the actual value into the slot we got during `alloc()`
    pub fn set_value<W>(&self, out: &mut OutputStream<W>, val: T) -> Result<()>
    where
        W: Read + Write + Seek,
    {
        out.write_at(self.position as u64, &to_bytes(val)?)?;
        Ok(())
    }

    pub fn location(&self) -> MDLocationDescriptor {
        MDLocationDescriptor {
            data_size: T::size_with(&LE) as u32,
            rva: self.position,
        }
    }
}

/// A counted list: a `u32` entry count directly followed by the entries
///
/// The count and the entries share one reservation, so they are always
/// contiguous.
#[derive(Debug, PartialEq)]
pub struct SectionArrayWriter<T> {
    pub position: MDRVA,
    array_size: usize,
    phantom: PhantomData<T>,
}

impl<T> SectionArrayWriter<T>
where
    T: SizeWith<Endian> + TryIntoCtx<Endian, Error = scroll::Error>,
{
    /// Reserve a list of `array_size` entries and write its count. Entries are
    /// filled later with [`Self::set_value_at`].
    pub fn alloc_list<W>(
        allocator: &mut RegionAllocator,
        out: &mut OutputStream<W>,
        array_size: usize,
    ) -> Result<Self>
    where
        W: Read + Write + Seek,
    {
        let size = 4 + (T::size_with(&LE) * array_size) as u64;
        let position = allocate_rva(allocator, size)?;
        out.write_at(position as u64, &(array_size as u32).to_le_bytes())?;
        Ok(Self {
            position,
            array_size,
            phantom: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.array_size
    }

    pub fn is_empty(&self) -> bool {
        self.array_size == 0
    }

    /// Write the entry at `index`
    pub fn set_value_at<W>(&self, out: &mut OutputStream<W>, val: T, index: usize) -> Result<()>
    where
        W: Read + Write + Seek,
    {
        debug_assert!(index < self.array_size);
        let offset = self.position as u64 + 4 + (T::size_with(&LE) * index) as u64;
        out.write_at(offset, &to_bytes(val)?)?;
        Ok(())
    }

    pub fn location(&self) -> MDLocationDescriptor {
        MDLocationDescriptor {
            data_size: (4 + T::size_with(&LE) * self.array_size) as u32,
            rva: self.position,
        }
    }
}

/// Writes `s` as a length-prefixed, NUL-terminated UTF-16LE string and
/// returns its RVA. The length prefix counts bytes and excludes the NUL.
pub fn write_string<W>(
    allocator: &mut RegionAllocator,
    out: &mut OutputStream<W>,
    s: &str,
) -> Result<MDRVA>
where
    W: Read + Write + Seek,
{
    let units: Vec<u16> = s.encode_utf16().collect();
    let byte_len = units.len() * 2;
    let mut bytes = Vec::with_capacity(4 + byte_len + 2);
    bytes.extend_from_slice(&(byte_len as u32).to_le_bytes());
    for unit in units.iter().chain(std::iter::once(&0)) {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }

    let rva = allocate_rva(allocator, bytes.len() as u64)?;
    out.write_at(rva as u64, &bytes)?;
    Ok(rva)
}

/// Copies `bytes` into the dump and returns where they went
pub fn write_raw<W>(
    allocator: &mut RegionAllocator,
    out: &mut OutputStream<W>,
    bytes: &[u8],
) -> Result<MDLocationDescriptor>
where
    W: Read + Write + Seek,
{
    let rva = allocate_rva(allocator, bytes.len() as u64)?;
    out.write_at(rva as u64, bytes)?;
    Ok(MDLocationDescriptor {
        data_size: bytes.len() as u32,
        rva,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn setup() -> (RegionAllocator, OutputStream<Cursor<Vec<u8>>>) {
        (
            RegionAllocator::new(92),
            OutputStream::new(Cursor::new(Vec::new())).unwrap(),
        )
    }

    #[test]
    fn list_count_and_entries_are_contiguous() {
        let (mut allocator, mut out) = setup();
        let list = SectionArrayWriter::<MDMemoryDescriptor>::alloc_list(&mut allocator, &mut out, 2)
            .unwrap();
        assert_eq!(list.position, 96);
        assert_eq!(
            list.location(),
            MDLocationDescriptor {
                data_size: 36,
                rva: 96
            }
        );

        let desc = MDMemoryDescriptor {
            start_of_memory_range: 0x1122_3344_5566_7788,
            memory: MDLocationDescriptor {
                data_size: 0x10,
                rva: 0x20,
            },
        };
        list.set_value_at(&mut out, desc, 1).unwrap();

        let bytes = out.into_inner().into_inner();
        assert_eq!(&bytes[96..100], &2u32.to_le_bytes());
        assert_eq!(&bytes[116..124], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[124..128], &0x10u32.to_le_bytes());
    }

    #[test]
    fn set_value_fills_reserved_slot() {
        let (mut allocator, mut out) = setup();
        let trailer = SectionWriter::<MDRawTrailer>::alloc(&mut allocator).unwrap();
        let next = allocator.allocate(1);
        assert_eq!(next, trailer.position as u64 + 16);

        trailer
            .set_value(
                &mut out,
                MDRawTrailer {
                    magic: MD_TRAILER_MAGIC,
                    stream_type: MD_TRAILER_STREAM,
                    reserved: 0,
                    checksum: 0,
                },
            )
            .unwrap();
        let bytes = out.into_inner().into_inner();
        assert_eq!(&bytes[96..100], &MD_TRAILER_MAGIC.to_le_bytes());
        assert_eq!(&bytes[100..104], &MD_TRAILER_STREAM.to_le_bytes());
    }

    #[test]
    fn strings_are_counted_utf16() {
        let (mut allocator, mut out) = setup();
        let rva = write_string(&mut allocator, &mut out, "ab.dll").unwrap();
        assert_eq!(rva, 96);
        // 4 + 12 + 2
        assert_eq!(allocator.position(), 96 + 18);

        let bytes = out.into_inner().into_inner();
        assert_eq!(&bytes[96..100], &12u32.to_le_bytes());
        assert_eq!(&bytes[100..104], &[b'a', 0, b'b', 0]);
        assert_eq!(&bytes[112..114], &[0, 0]);
    }

    #[test]
    fn allocations_past_4gib_overflow() {
        let mut allocator = RegionAllocator::new(u32::MAX as u64 - 16);
        assert!(allocate_rva(&mut allocator, 8).is_ok());
        let err = allocate_rva(&mut allocator, 16).unwrap_err();
        assert!(matches!(err, BuilderError::RvaOverflow(_)));
    }
}
