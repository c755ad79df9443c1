//! Deckmind - 幻灯片文档的 Agent 会话编排
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 轮次错误类型、优雅关闭
//! - **environment**: 执行环境（本机 / 模拟）及其生命周期管理
//! - **observability**: 日志初始化与计数器
//! - **protocol**: Agent 事件解码、客户端响应流编码
//! - **slides**: 拆页与可见内容 / 演讲者备注分类
//! - **store**: 带 TTL 的会话存储（内存 / Upstash Redis）
//! - **turn**: 单轮执行状态机与多轮续接策略
//! - **server**: axum HTTP 接口（feature `web`）

pub mod config;
pub mod core;
pub mod environment;
pub mod observability;
pub mod protocol;
#[cfg(feature = "web")]
pub mod server;
pub mod slides;
pub mod store;
pub mod turn;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{ShutdownManager, TurnError};
pub use turn::{build_executor, TurnExecutor, TurnOutcome, TurnRequest, TurnSink};
