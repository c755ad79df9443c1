//! 核心：轮次错误与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::TurnError;
pub use shutdown::{ShutdownManager, ShutdownReason, TurnGuard};
