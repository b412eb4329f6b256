pub mod codegen;
pub mod parser;
