use std::{collections::HashMap, iter, marker::PhantomData};

use bitflags::bitflags;
use bytemuck::{bytes_of, Pod};
use iced_x86::{
    code_asm::{CodeAssembler, CodeLabel},
    BlockEncoderOptions,
};

use super::compiler::CompilerError;

const LOAD_POS: u64 = 0x08048000;
const PAGE_SIZE: u64 = 0x1000;
const EHDR_SIZE: u16 = 0x40; // known statically for elf64
const PHDR_SIZE: u16 = 0x38;

struct BinaryBuilder {
    binary: Vec<u8>,
    outstanding_patches: usize,
}

/// A hole of `size_of::<T>()` bytes to be filled in once its value is known.
struct Patch<T> {
    index: usize,
    phantom: PhantomData<T>,
}

impl BinaryBuilder {
    fn new() -> Self {
        BinaryBuilder {
            binary: vec![],
            outstanding_patches: 0,
        }
    }

    fn current_addr(&self) -> usize {
        self.binary.len()
    }

    fn emit(&mut self, bytes: impl Pod) {
        self.binary.extend_from_slice(bytes_of(&bytes));
    }

    fn emit_slice(&mut self, bytes: &[u8]) {
        self.binary.extend_from_slice(bytes);
    }

    fn pad(&mut self, count: usize) {
        self.binary.extend(iter::repeat(0).take(count));
    }

    fn pad_to_width(&mut self, width: usize) {
        let over = self.current_addr() % width;
        if over != 0 {
            self.pad(width - over);
        }
    }

    fn mark<T>(&mut self) -> Patch<T> {
        let patch = Patch {
            index: self.current_addr(),
            phantom: PhantomData,
        };

        self.outstanding_patches += 1;
        self.pad(size_of::<T>());

        patch
    }

    fn patch<T>(&mut self, patch: Patch<T>, bytes: T)
    where
        T: Pod,
    {
        self.outstanding_patches -= 1;

        self.binary[patch.index..patch.index + size_of::<T>()]
            .copy_from_slice(bytes_of(&bytes));
    }

    fn build(self) -> Result<Vec<u8>, CompilerError> {
        if self.outstanding_patches == 0 {
            Ok(self.binary)
        } else {
            Err(CompilerError::MissingPatch)
        }
    }
}

bitflags! {
    pub struct PhdrFlags: u32 {
        const X = 1 << 0;
        const W = 1 << 1;
        const R = 1 << 2;
    }
}

/// Addresses of the labels exported by the segments built so far.
#[derive(Debug, Default)]
pub struct LabelMap(HashMap<&'static str, u64>);

impl LabelMap {
    pub fn get(&self, name: &'static str) -> Result<u64, CompilerError> {
        self.0
            .get(name)
            .copied()
            .ok_or(CompilerError::MissingLabel(name))
    }

    fn insert(&mut self, name: &'static str, address: u64) {
        self.0.insert(name, address);
    }
}

pub struct Segment {
    code: CodeAssembler,
    labels: Vec<(&'static str, CodeLabel)>,
    /// Zero-filled bytes mapped after the assembled code but not stored in
    /// the file.
    zeroed: u64,
}

impl Segment {
    pub fn new(
        code: CodeAssembler,
        labels: Vec<(&'static str, CodeLabel)>,
    ) -> Self {
        Self {
            code,
            labels,
            zeroed: 0,
        }
    }

    pub fn with_zeroed(mut self, bytes: u64) -> Self {
        self.zeroed = bytes;
        self
    }
}

#[macro_export]
macro_rules! segment {
    ($code:expr, $($label:ident),*) => {
        $crate::backend::elf::Segment::new(
            $code,
            vec![$((stringify!($label), $label)),+]
        )
    };
}

pub struct BuiltSegment {
    bytes: Vec<u8>,
    zeroed: u64,
}

pub trait SegmentBuilder {
    fn code(&self, labels: &LabelMap) -> Result<Segment, CompilerError>;

    fn flags(&self) -> PhdrFlags;

    fn build(
        &self,
        ip: u64,
        labels: &mut LabelMap,
    ) -> Result<BuiltSegment, CompilerError> {
        let Segment {
            mut code,
            labels: new_labels,
            zeroed,
        } = self.code(labels)?;

        let result = code.assemble_options(
            ip,
            BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
        )?;

        for (name, label) in new_labels {
            labels.insert(name, result.label_ip(&label)?);
        }

        Ok(BuiltSegment {
            bytes: result.inner.code_buffer,
            zeroed,
        })
    }
}

fn round_up(value: u64, width: u64) -> u64 {
    value.div_ceil(width) * width
}

/// Lays the segments out in order, one page-aligned `PT_LOAD` each, and
/// enters at the `_start` label. Later segments may refer to labels of
/// earlier ones.
pub fn compile_to_elf(
    segments: &[&dyn SegmentBuilder],
) -> Result<Vec<u8>, CompilerError> {
    if cfg!(target_endian = "big") {
        return Err(CompilerError::UnsupportedTarget);
    }

    let mut b = BinaryBuilder::new();

    // === ELF HEADER ===
    b.emit(*b"\x7FELF"); // magic
    b.emit([2u8, 1, 1, 0]); // class, endian, version, abi
    b.pad(8);

    b.emit(2u16); // type: executable
    b.emit(0x3Eu16); // machine: x86-64
    b.emit(1u32); // version

    let entry_point = b.mark(); // entry point
    let prog_header_offset = b.mark(); // program header table offset
    b.emit(0u64); // section header (none)

    b.emit(0u32); // flags (none)
    b.emit(EHDR_SIZE); // elf header size
    b.emit(PHDR_SIZE); // program header size
    b.emit(segments.len() as u16); // number of program headers

    b.emit([0u16, 0, 0]); // no section header

    b.patch(prog_header_offset, b.current_addr() as u64);

    // === PHDR HEADERS ===
    let mut seg_patches: Vec<[Patch<u64>; 4]> = Vec::new();
    for seg in segments {
        b.emit(1u32); // segment type: loadable
        b.emit(seg.flags().bits());
        let offset = b.mark();
        let vaddr = b.mark();
        b.emit(0u64); // physical memory size is ignored
        let file_size = b.mark();
        let mem_size = b.mark();
        b.emit(PAGE_SIZE);

        seg_patches.push([offset, vaddr, file_size, mem_size]);
    }

    b.pad_to_width(PAGE_SIZE as usize);

    // === SEGMENTS ===
    // zero-filled tails take address space but no file space, so virtual
    // addresses drift ahead of file offsets by whole pages
    let mut vaddr_skew = 0;
    let mut labels = LabelMap::default();
    for (seg, patches) in segments.iter().zip(seg_patches) {
        let [offset, vaddr, file_size, mem_size] = patches;

        let file_offset = b.current_addr() as u64;
        let vmem_offset = file_offset + LOAD_POS + vaddr_skew;
        let built = seg.build(vmem_offset, &mut labels)?;

        b.patch(offset, file_offset);
        b.patch(vaddr, vmem_offset);
        b.patch(file_size, built.bytes.len() as u64);
        b.patch(mem_size, built.bytes.len() as u64 + built.zeroed);

        vaddr_skew += round_up(built.zeroed, PAGE_SIZE);

        b.emit_slice(&built.bytes[..]);
        b.pad_to_width(PAGE_SIZE as usize);
    }

    let start = labels
        .get("_start")
        .map_err(|_| CompilerError::MissingEntryPoint)?;
    b.patch(entry_point, start);

    b.build()
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::{self as asm, CodeAssembler};
    use pretty_assertions::assert_eq;

    use super::*;

    struct Exit;

    impl SegmentBuilder for Exit {
        fn code(&self, _labels: &LabelMap) -> Result<Segment, CompilerError> {
            let mut a = CodeAssembler::new(64)?;

            let mut _start = a.create_label();
            a.set_label(&mut _start)?;
            a.mov(asm::rax, 60u64)?;
            a.mov(asm::rdi, 0u64)?;
            a.syscall()?;

            Ok(crate::segment![a, _start])
        }

        fn flags(&self) -> PhdrFlags {
            PhdrFlags::R | PhdrFlags::X
        }
    }

    struct NoEntry;

    impl SegmentBuilder for NoEntry {
        fn code(&self, _labels: &LabelMap) -> Result<Segment, CompilerError> {
            let mut a = CodeAssembler::new(64)?;

            let mut data = a.create_label();
            a.set_label(&mut data)?;
            a.db(&[0u8; 8])?;

            Ok(crate::segment![a, data].with_zeroed(0x2345))
        }

        fn flags(&self) -> PhdrFlags {
            PhdrFlags::R | PhdrFlags::W
        }
    }

    fn u64_at(binary: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(binary[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn header_layout() {
        let binary = compile_to_elf(&[&NoEntry, &Exit]).unwrap();

        assert_eq!(&binary[..4], b"\x7FELF");
        // program headers follow the elf header directly
        assert_eq!(u64_at(&binary, 0x20), EHDR_SIZE as u64);

        let phdr = |i: usize| EHDR_SIZE as usize + i * PHDR_SIZE as usize;

        // data: 8 bytes in the file, the rest zero-filled
        assert_eq!(u64_at(&binary, phdr(0) + 8), PAGE_SIZE);
        assert_eq!(u64_at(&binary, phdr(0) + 16), LOAD_POS + PAGE_SIZE);
        assert_eq!(u64_at(&binary, phdr(0) + 32), 8);
        assert_eq!(u64_at(&binary, phdr(0) + 40), 8 + 0x2345);

        // text is pushed past the zero-filled pages
        let text_vaddr = LOAD_POS + 2 * PAGE_SIZE + 3 * PAGE_SIZE;
        assert_eq!(u64_at(&binary, phdr(1) + 8), 2 * PAGE_SIZE);
        assert_eq!(u64_at(&binary, phdr(1) + 16), text_vaddr);
        assert_eq!(u64_at(&binary, 0x18), text_vaddr);
    }

    #[test]
    fn requires_entry_point() {
        assert!(matches!(
            compile_to_elf(&[&NoEntry]),
            Err(CompilerError::MissingEntryPoint)
        ));
    }
}
