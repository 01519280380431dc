//! 能力协议客户端
//!
//! - **jsonrpc**: JSON-RPC 2.0 编解码
//! - **pending**: 在途调用表与截止时间看门狗
//! - **transport**: 本地进程 / Streamed-HTTP / Socket 三种通道
//! - **peer**: 一条通道上的请求-响应关联与入站分发
//! - **session**: 会话生命周期（握手、发现、重连、关闭）
//! - **client**: 会话集合与对上接口

pub mod catalog;
pub mod client;
pub mod jsonrpc;
pub mod peer;
pub mod pending;
pub mod session;
pub mod transport;

pub use catalog::{CapabilityDescriptor, Liveness, ResourceContent, ResourceDescriptor, SessionInfo};
pub use client::{InitReport, ProtocolClient};
pub use session::TransportSession;
