//! Real-time event streaming
//! 审批事件总线与 SSE 推送
//!
//! 事件只在状态成功提交后发布；没有订阅者时发布是空操作。

use axum::response::sse::Event;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::flow::RejectionReason;

/// 审批事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ApprovalEvent {
    /// 步骤被激活，等待候选人决定
    StepPendingApproval {
        step_id: Uuid,
        flow_id: Uuid,
        candidate_approver_ids: Vec<Uuid>,
    },
    FlowApproved {
        flow_id: Uuid,
    },
    FlowRejected {
        flow_id: Uuid,
        reason: RejectionReason,
    },
    FlowCancelled {
        flow_id: Uuid,
    },
    /// 某层级没有可用审批人，流程停滞
    ApproverUnresolved {
        flow_id: Uuid,
        level_order: i32,
    },
    /// 心跳信号（保持连接活跃）
    Heartbeat,
}

impl ApprovalEvent {
    /// 获取事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            ApprovalEvent::StepPendingApproval { .. } => "step_pending_approval",
            ApprovalEvent::FlowApproved { .. } => "flow_approved",
            ApprovalEvent::FlowRejected { .. } => "flow_rejected",
            ApprovalEvent::FlowCancelled { .. } => "flow_cancelled",
            ApprovalEvent::ApproverUnresolved { .. } => "approver_unresolved",
            ApprovalEvent::Heartbeat => "heartbeat",
        }
    }

    pub fn flow_id(&self) -> Option<Uuid> {
        match self {
            ApprovalEvent::StepPendingApproval { flow_id, .. }
            | ApprovalEvent::FlowApproved { flow_id }
            | ApprovalEvent::FlowRejected { flow_id, .. }
            | ApprovalEvent::FlowCancelled { flow_id }
            | ApprovalEvent::ApproverUnresolved { flow_id, .. } => Some(*flow_id),
            ApprovalEvent::Heartbeat => None,
        }
    }

    /// 转换为 SSE 数据
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    fn to_sse_event(&self) -> Event {
        Event::default().event(self.event_type()).data(self.to_sse_data())
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    /// 广播发送器（用于向所有订阅者发送事件）
    sender: broadcast::Sender<ApprovalEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: ApprovalEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(event_type = event.event_type(), "No subscribers for event");
                0
            }
        }
    }

    pub fn publish_all(&self, events: Vec<ApprovalEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.sender.subscribe()
    }

    /// 订阅审批事件，可按审批流过滤
    pub fn subscribe_to_approvals(&self, flow_id: Option<Uuid>) -> ApprovalEventStream {
        ApprovalEventStream::new(self.subscribe(), flow_id)
    }
}

/// 审批事件流
pub struct ApprovalEventStream {
    receiver: broadcast::Receiver<ApprovalEvent>,
    flow_id: Option<Uuid>,
}

impl ApprovalEventStream {
    fn new(receiver: broadcast::Receiver<ApprovalEvent>, flow_id: Option<Uuid>) -> Self {
        Self { receiver, flow_id }
    }

    fn accepts(&self, event: &ApprovalEvent) -> bool {
        match (self.flow_id, event.flow_id()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }

    /// 转换为 SSE 流
    pub fn into_sse_stream(
        mut self,
        heartbeat: Duration,
    ) -> impl futures::Stream<Item = std::result::Result<Event, Infallible>> {
        let (tx, rx) = tokio::sync::mpsc::channel(100);

        // 心跳定时器
        let heartbeat_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            loop {
                interval.tick().await;
                if heartbeat_tx.send(Ok(ApprovalEvent::Heartbeat.to_sse_event())).await.is_err() {
                    break;
                }
            }
        });

        // 事件转发任务
        tokio::spawn(async move {
            loop {
                match self.receiver.recv().await {
                    Ok(event) => {
                        if self.accepts(&event) && tx.send(Ok(event.to_sse_event())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "SSE subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tokio_stream::wrappers::ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(ApprovalEvent::FlowApproved { flow_id: Uuid::new_v4() }), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let flow_id = Uuid::new_v4();

        bus.publish_all(vec![
            ApprovalEvent::ApproverUnresolved { flow_id, level_order: 1 },
            ApprovalEvent::FlowCancelled { flow_id },
        ]);

        assert_eq!(
            rx.recv().await.unwrap(),
            ApprovalEvent::ApproverUnresolved { flow_id, level_order: 1 }
        );
        assert_eq!(rx.recv().await.unwrap(), ApprovalEvent::FlowCancelled { flow_id });
    }

    #[test]
    fn test_sse_payload_shape() {
        let flow_id = Uuid::nil();
        let event = ApprovalEvent::FlowRejected { flow_id, reason: RejectionReason::Timeout };
        let value: serde_json::Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(value["type"], "flow_rejected");
        assert_eq!(value["data"]["reason"], "timeout");
        assert_eq!(event.event_type(), "flow_rejected");
    }

    #[test]
    fn test_stream_filter_by_flow() {
        let bus = EventBus::new(4);
        let wanted = Uuid::new_v4();
        let stream = bus.subscribe_to_approvals(Some(wanted));
        assert!(stream.accepts(&ApprovalEvent::FlowApproved { flow_id: wanted }));
        assert!(!stream.accepts(&ApprovalEvent::FlowApproved { flow_id: Uuid::new_v4() }));
        assert!(stream.accepts(&ApprovalEvent::Heartbeat));
    }
}
