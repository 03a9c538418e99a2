//! 追踪器契约与内存实现

pub mod memory;
pub mod span;

pub use memory::*;
pub use span::*;
