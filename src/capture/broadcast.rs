//! 实时事件扇出
//!
//! 把每条捕获记录分发给所有订阅者，best-effort 投递：
//! 发布方从不等待订阅者，缓冲满即对该订阅者丢弃

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use super::model::{CaptureRequest, CaptureResponse};

/// 订阅者出站缓冲容量
const SUBSCRIBER_BUFFER: usize = 256;

/// 推送给订阅者的消息信封
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Request { data: CaptureRequest },
    Response { data: CaptureResponse },
}

type SubscriberMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Arc<BroadcastMessage>>>>>;

/// 订阅句柄；Drop 时自动退订，未消费的缓冲消息随之释放
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<BroadcastMessage>>,
    subscribers: SubscriberMap,
}

impl Subscription {
    /// 接收下一条消息；扇出端全部关闭时返回 None
    pub async fn recv(&mut self) -> Option<Arc<BroadcastMessage>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// 订阅者注册表与发布入口
#[derive(Default)]
pub struct Broadcaster {
    subscribers: SubscriberMap,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个订阅者
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(SUBSCRIBER_BUFFER)
    }

    fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        Subscription {
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// 非阻塞发布到所有订阅者
    ///
    /// 锁内只拷贝发送端列表，发送在锁外进行；
    /// 缓冲满丢弃该订阅者的本条消息，通道已关闭则惰性退订
    pub fn publish(&self, message: BroadcastMessage) {
        let message = Arc::new(message);

        let senders: Vec<(u64, mpsc::Sender<Arc<BroadcastMessage>>)> = {
            let guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut closed = Vec::new();
        for (id, tx) in senders {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "订阅者缓冲已满，丢弃消息");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for id in closed {
                guard.remove(&id);
            }
        }
    }
}
