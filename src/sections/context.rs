//! The register context of the synthetic thread

use super::*;

/// Register values that let a debugger start from the image entry point
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryRegisters {
    pub stack_pointer: u64,
    pub image_base: u64,
    pub image_head: u64,
    pub entry_point: u64,
}

/// A context record sized for the target CPU
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawContextCPU {
    X86(Box<MDRawContextX86>),
    Amd64(Box<MDRawContextAMD64>),
}

impl RawContextCPU {
    /// Builds a context with only the stack pointer, `(e|r)cx`, `(e|r)dx` and
    /// the instruction pointer set
    pub fn synthetic(is_64_bit: bool, regs: EntryRegisters) -> Self {
        let flags = ContextFlags::CONTROL | ContextFlags::INTEGER;
        if is_64_bit {
            let mut ctx = Box::<MDRawContextAMD64>::default();
            ctx.context_flags = (ContextFlags::CONTEXT_AMD64 | flags).bits();
            ctx.rsp = regs.stack_pointer;
            ctx.rcx = regs.image_base;
            ctx.rdx = regs.image_head;
            ctx.rip = regs.entry_point;
            Self::Amd64(ctx)
        } else {
            // 32-bit images only have 32-bit addresses to give
            let mut ctx = Box::<MDRawContextX86>::default();
            ctx.context_flags = (ContextFlags::CONTEXT_X86 | flags).bits();
            ctx.esp = regs.stack_pointer as u32;
            ctx.ecx = regs.image_base as u32;
            ctx.edx = regs.image_head as u32;
            ctx.eip = regs.entry_point as u32;
            Self::X86(ctx)
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::X86(_) => MDRawContextX86::size_with(&LE),
            Self::Amd64(_) => MDRawContextAMD64::size_with(&LE),
        }
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, scroll::Error> {
        match self {
            Self::X86(ctx) => to_bytes(ctx.as_ref().clone()),
            Self::Amd64(ctx) => to_bytes(ctx.as_ref().clone()),
        }
    }
}

/// The reserved slot for the thread context. Its size depends on whether the
/// primary image is 64-bit, which is known before anything is written.
#[derive(Debug)]
pub struct ContextWriter {
    location: MDLocationDescriptor,
}

impl ContextWriter {
    pub fn alloc(allocator: &mut RegionAllocator, is_64_bit: bool) -> Result<Self> {
        let size = if is_64_bit {
            MDRawContextAMD64::size_with(&LE)
        } else {
            MDRawContextX86::size_with(&LE)
        };
        let rva = allocate_rva(allocator, size as u64)?;
        Ok(Self {
            location: MDLocationDescriptor {
                data_size: size as u32,
                rva,
            },
        })
    }

    pub fn set_value<W>(&self, out: &mut OutputStream<W>, context: &RawContextCPU) -> Result<()>
    where
        W: Read + Write + Seek,
    {
        let bytes = context.to_bytes()?;
        debug_assert_eq!(bytes.len(), self.location.data_size as usize);
        out.write_at(self.location.rva as u64, &bytes)?;
        Ok(())
    }

    pub fn location(&self) -> MDLocationDescriptor {
        self.location
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scroll::Pread;

    const REGS: EntryRegisters = EntryRegisters {
        stack_pointer: 0x2fff00,
        image_base: 0x1_4000_0000,
        image_head: 0x1_4000_0000,
        entry_point: 0x1_4000_1234,
    };

    #[test]
    fn amd64_context() {
        let ctx = RawContextCPU::synthetic(true, REGS);
        assert_eq!(ctx.size(), 1232);
        let bytes = ctx.to_bytes().unwrap();
        let read: MDRawContextAMD64 = bytes.pread_with(0, LE).unwrap();
        assert_eq!(read.context_flags, 0x100003);
        assert_eq!(read.rsp, 0x2fff00);
        assert_eq!(read.rcx, 0x1_4000_0000);
        assert_eq!(read.rdx, 0x1_4000_0000);
        assert_eq!(read.rip, 0x1_4000_1234);
        assert_eq!(read.rax, 0);
    }

    #[test]
    fn x86_context_truncates_to_32_bits() {
        let ctx = RawContextCPU::synthetic(false, REGS);
        assert_eq!(ctx.size(), 716);
        let RawContextCPU::X86(ctx) = ctx else {
            panic!("expected an x86 context");
        };
        assert_eq!(ctx.context_flags, 0x10003);
        assert_eq!(ctx.esp, 0x2fff00);
        assert_eq!(ctx.ecx, 0x4000_0000);
        assert_eq!(ctx.eip, 0x4000_1234);
    }
}
