use std::sync::Arc;

use futures_util::future::join_all;
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::database::{MessageEntity, MessageKind};
use crate::routes::Done;
use crate::routes::arrival::{ArrivalOutcome, ArrivalResponse, CheckArrivalRequest};
use crate::routes::group::{
    AddMembersRequest, AddMembersResponse, CreateGroupRequest, GroupInfo, GroupListItem,
    InviteRequest, RemoveMemberRequest,
};
use crate::routes::message::PostMessageRequest;
use crate::routes::presence::{NearbyUser, UpdatePresenceRequest};
use crate::utils::{ApiResponse, error_codes};

use super::crypto::{CryptoError, GroupKeyRing, generate_exported_key};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}, code {code}): {msg}")]
    Api {
        status: StatusCode,
        code: i32,
        msg: String,
    },
    #[error("server returned no data")]
    EmptyResponse,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status(),
            _ => None,
        }
    }
}

/// 新建群组时的参数，密钥由客户端生成
#[derive(Debug, Clone, Default)]
pub struct NewGroupParams {
    pub target_name: String,
    pub target_lat: f64,
    pub target_lng: f64,
    pub target_radius_km: Option<f64>,
    pub expires_in_hours: Option<i64>,
    pub invite_usernames: Vec<String>,
}

/// Radr 接口客户端，负责消息的端到端加解密
pub struct RadrClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    keys: Arc<GroupKeyRing>,
}

impl RadrClient {
    /// `base_url` 包含接口前缀，例如 `http://localhost:3000/api`
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, keys: Arc<GroupKeyRing>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            keys,
        }
    }

    pub fn keys(&self) -> &GroupKeyRing {
        &self.keys
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let envelope: ApiResponse<T> = response.json().await?;

        if !status.is_success() || envelope.code != error_codes::SUCCESS {
            return Err(ClientError::Api {
                status,
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        envelope.resp_data.ok_or(ClientError::EmptyResponse)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.call::<(), T>(Method::GET, path, None).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        self.call(Method::POST, path, Some(body)).await
    }

    /// 本地生成密钥并随创建请求提交，成功后以服务端分配的ID保存密钥
    pub async fn create_group(&self, params: NewGroupParams) -> Result<GroupInfo, ClientError> {
        let exported = generate_exported_key();
        let req = CreateGroupRequest {
            target_name: Some(params.target_name),
            target_lat: Some(params.target_lat),
            target_lng: Some(params.target_lng),
            target_radius_km: params.target_radius_km,
            expires_in_hours: params.expires_in_hours,
            invite_usernames: params.invite_usernames,
            encryption_key: Some(exported.clone()),
        };

        let group: GroupInfo = self.post("/radr/groups", &req).await?;
        self.keys.import_group_key(&group.id, &exported).await?;
        Ok(group)
    }

    /// 拉取群组列表并导入其中下发的所有密钥
    pub async fn sync_groups(&self) -> Result<Vec<GroupListItem>, ClientError> {
        let groups: Vec<GroupListItem> = self.get("/radr/groups").await?;
        for group in &groups {
            if let Err(e) = self
                .keys
                .import_group_key(&group.info.id, &group.encryption_key)
                .await
            {
                tracing::warn!("Failed to import key for group {}: {}", group.info.id, e);
            }
        }
        Ok(groups)
    }

    pub async fn send_message(&self, group_id: &str, plaintext: &str) -> Result<MessageEntity, ClientError> {
        let ciphertext = self.keys.encrypt_message(group_id, plaintext).await?;
        let req = PostMessageRequest {
            content: Some(ciphertext),
        };
        self.post(&format!("/radr/groups/{group_id}/messages"), &req)
            .await
    }

    /// 获取消息并逐条并发解密，系统消息原样返回
    pub async fn fetch_messages(&self, group_id: &str) -> Result<Vec<MessageEntity>, ClientError> {
        let messages: Vec<MessageEntity> = self
            .get(&format!("/radr/groups/{group_id}/messages"))
            .await?;

        let keys = &self.keys;
        let decrypted = join_all(messages.into_iter().map(|mut message| async move {
            if message.kind == MessageKind::Text {
                message.content = keys.decrypt_message(&message.group_id, &message.content).await;
            }
            message
        }))
        .await;

        Ok(decrypted)
    }

    pub async fn check_arrival(&self, group_id: &str, lat: f64, lng: f64) -> Result<ArrivalOutcome, ClientError> {
        let req = CheckArrivalRequest {
            lat: Some(lat),
            lng: Some(lng),
        };
        let resp: ArrivalResponse = self
            .post(&format!("/radr/groups/{group_id}/check-arrival"), &req)
            .await?;
        Ok(resp.outcome)
    }

    pub async fn update_presence(&self, lat: f64, lng: f64) -> Result<(), ClientError> {
        let _: Done = self
            .post("/radr/update", &UpdatePresenceRequest { lat, lng })
            .await?;
        Ok(())
    }

    pub async fn nearby(&self, lat: f64, lng: f64) -> Result<Vec<NearbyUser>, ClientError> {
        self.get(&format!("/radr/nearby?lat={lat}&lng={lng}")).await
    }

    pub async fn add_members(&self, group_id: &str, usernames: &[&str]) -> Result<Vec<String>, ClientError> {
        let req = AddMembersRequest {
            usernames: usernames.iter().map(|u| u.to_string()).collect(),
        };
        let resp: AddMembersResponse = self
            .post(&format!("/radr/groups/{group_id}/add-members"), &req)
            .await?;
        Ok(resp.added)
    }

    pub async fn invite_member(&self, group_id: &str, username: &str) -> Result<Vec<String>, ClientError> {
        let req = InviteRequest {
            username: username.to_string(),
        };
        let resp: AddMembersResponse = self
            .post(&format!("/radr/groups/{group_id}/invite"), &req)
            .await?;
        Ok(resp.added)
    }

    pub async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<(), ClientError> {
        let req = RemoveMemberRequest {
            user_id: user_id.to_string(),
        };
        let _: Done = self
            .post(&format!("/radr/groups/{group_id}/remove-member"), &req)
            .await?;
        Ok(())
    }

    pub async fn leave_group(&self, group_id: &str) -> Result<(), ClientError> {
        let _: Done = self
            .post(&format!("/radr/groups/{group_id}/leave"), &serde_json::json!({}))
            .await?;
        self.keys.remove_group_key(group_id).await?;
        Ok(())
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<(), ClientError> {
        let _: Done = self
            .call::<(), _>(Method::DELETE, &format!("/radr/groups/{group_id}"), None)
            .await?;
        self.keys.remove_group_key(group_id).await?;
        Ok(())
    }
}
