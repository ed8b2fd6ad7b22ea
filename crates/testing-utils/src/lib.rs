//! # Scheduler Testing Utils
//!
//! 各crate测试共享的工具：基于临时文件的SQLite测试库、测试数据构建器、
//! 以及模拟Worker认领/完成执行的辅助函数。
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod database;
pub mod helpers;

pub use builders::*;
pub use database::*;
pub use helpers::*;
