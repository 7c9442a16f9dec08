use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// 推送内容
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// 推送通道，失败只记录日志，不影响业务结果
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user_id: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// 只写日志的推送实现
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, user_id: &str, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            "Push to {}: {} - {}",
            user_id,
            notification.title,
            notification.body
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// 把推送以 JSON 形式 POST 到外部推送网关
pub struct WebhookNotifier {
    http: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    /// 每个推送请求（含连接和读响应）最多等待 `timeout`
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PushNotifier for WebhookNotifier {
    async fn notify(&self, user_id: &str, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&WebhookPayload {
                user_id,
                notification,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn sample() -> Notification {
        Notification {
            title: "Cafe".into(),
            body: "Alice has arrived!".into(),
            data: serde_json::json!({ "type": "arrival" }),
        }
    }

    #[tokio::test]
    async fn silent_gateway_times_out() {
        // 接受连接但从不回应
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let notifier =
            WebhookNotifier::new(format!("http://{addr}/push"), Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            notifier.notify("u-bob", &sample()),
        )
        .await
        .expect("notify should give up on its own");

        match result {
            Err(NotifyError::Http(e)) => assert!(e.is_timeout()),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }
}
