use qa_core::Event;
use tokio::sync::mpsc;

/// 事件下发端：按流水线访问顺序投递，终止事件最后一条
///
/// 接收端关闭（客户端断开）时 emit 返回 false，
/// 流水线在下一个安全点据此触发取消。
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_core::EventType;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (sink, mut rx) = EventSink::channel(16);
        assert!(sink.emit(Event::node_start("retrieve")).await);
        assert!(
            sink.emit(Event::node_end("retrieve", serde_json::json!({"documents_count": 3})))
                .await
        );
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::NodeStart);
        assert_eq!(second.event_type, EventType::NodeEnd);
    }

    #[tokio::test]
    async fn test_closed_receiver_reports_disconnect() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        assert!(!sink.emit(Event::node_start("retrieve")).await);
    }
}
