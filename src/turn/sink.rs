//! 轮次输出通道
//!
//! 执行器把 [`WireEvent`] 依次送进无界 mpsc，HTTP 层把接收端转成响应体流。
//! 客户端断开后发送会失败，这里直接忽略：轮次继续跑完，持久化状态保持一致。

use tokio::sync::mpsc;

use crate::protocol::WireEvent;

#[derive(Debug, Clone)]
pub struct TurnSink {
    tx: mpsc::UnboundedSender<WireEvent>,
}

impl TurnSink {
    pub fn new(tx: mpsc::UnboundedSender<WireEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WireEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// 返回 false 表示接收端已关闭（客户端断开）
    pub fn emit(&self, event: WireEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn narrate(&self, text: impl Into<String>) -> bool {
        self.emit(WireEvent::Narration(text.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
