pub mod backend;
pub mod frontend;
pub mod ir;
pub mod test_helpers;
