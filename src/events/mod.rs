// 领域事件与推送分发
// 业务逻辑只负责发出事件，推送在独立任务中完成

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::database::RadrStore;

mod notifier;

pub use notifier::{LogNotifier, Notification, NotifyError, PushNotifier, WebhookNotifier};

const NAVIGATE_TO: &str = "/radr_messages";

#[derive(Debug, Clone, PartialEq)]
pub enum RadrEvent {
    MemberInvited {
        group_id: String,
        group_name: String,
        inviter_name: String,
        user_id: String,
    },
    MemberArrived {
        group_id: String,
        group_name: String,
        user_id: String,
        display_name: String,
    },
    MessagePosted {
        group_id: String,
        group_name: String,
        sender_id: String,
        sender_name: String,
    },
}

impl RadrEvent {
    pub fn group_id(&self) -> &str {
        match self {
            RadrEvent::MemberInvited { group_id, .. }
            | RadrEvent::MemberArrived { group_id, .. }
            | RadrEvent::MessagePosted { group_id, .. } => group_id,
        }
    }

    pub fn notification(&self) -> Notification {
        let (title, body, kind) = match self {
            RadrEvent::MemberInvited {
                group_name,
                inviter_name,
                ..
            } => (
                "New Radr Group Invite".to_string(),
                format!("{inviter_name} invited you to {group_name}"),
                "group_invite",
            ),
            RadrEvent::MemberArrived {
                group_name,
                display_name,
                ..
            } => (
                group_name.clone(),
                format!("{display_name} has arrived!"),
                "arrival",
            ),
            RadrEvent::MessagePosted {
                group_name,
                sender_name,
                ..
            } => (
                group_name.clone(),
                format!("{sender_name}: New message"),
                "message",
            ),
        };

        Notification {
            title,
            body,
            data: serde_json::json!({
                "type": kind,
                "group_id": self.group_id(),
                "navigate_to": NAVIGATE_TO,
            }),
        }
    }
}

/// 事件发送端，克隆后放进 AppState
#[derive(Clone)]
pub struct EventBus {
    tx: UnboundedSender<RadrEvent>,
}

impl EventBus {
    pub fn new() -> (Self, UnboundedReceiver<RadrEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RadrEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!("Event dispatcher is gone, dropping event: {:?}", e.0);
        }
    }
}

// 计算事件的接收者：邀请只通知被邀请人，其余通知除本人外的所有成员
async fn recipients(store: &dyn RadrStore, event: &RadrEvent) -> Vec<String> {
    let (group_id, actor) = match event {
        RadrEvent::MemberInvited { user_id, .. } => return vec![user_id.clone()],
        RadrEvent::MemberArrived {
            group_id, user_id, ..
        } => (group_id, user_id),
        RadrEvent::MessagePosted {
            group_id,
            sender_id,
            ..
        } => (group_id, sender_id),
    };

    match store.member_ids(group_id).await {
        Ok(ids) => ids.into_iter().filter(|id| id != actor).collect(),
        Err(e) => {
            tracing::warn!("Failed to load recipients for group {}: {}", group_id, e);
            Vec::new()
        }
    }
}

/// 逐条处理事件；单次推送超过 `notify_timeout` 即放弃，后续事件不受影响
pub async fn dispatch_events(
    mut rx: UnboundedReceiver<RadrEvent>,
    store: Arc<dyn RadrStore>,
    notifier: Arc<dyn PushNotifier>,
    notify_timeout: Duration,
) {
    while let Some(event) = rx.recv().await {
        let notification = event.notification();
        for user_id in recipients(store.as_ref(), &event).await {
            match tokio::time::timeout(notify_timeout, notifier.notify(&user_id, &notification))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Failed to send push notification to {}: {}", user_id, e)
                }
                Err(_) => tracing::warn!(
                    "Push notification to {} timed out after {:?}",
                    user_id,
                    notify_timeout
                ),
            }
        }
    }
    tracing::debug!("Event channel closed, dispatcher exiting");
}

pub fn spawn_dispatcher(
    rx: UnboundedReceiver<RadrEvent>,
    store: Arc<dyn RadrStore>,
    notifier: Arc<dyn PushNotifier>,
    notify_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(dispatch_events(rx, store, notifier, notify_timeout))
}
