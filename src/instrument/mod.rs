//! 函数插桩层
//!
//! 宿主函数模型、模块导出对象以及把回调函数转换为生命周期事件的包装器

pub mod exports;
pub mod function;
pub mod wrapper;

pub use exports::*;
pub use function::*;
pub use wrapper::*;
