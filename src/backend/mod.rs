pub mod compiler;
pub mod elf;
