use std::net::SocketAddr;
use std::sync::Arc;

use radr::{
    AppState,
    client::{GroupKeyRing, MemoryKeyStore, NewGroupParams, RadrClient},
    config::Config,
    database::{MemoryStore, MessageKind, RadrStore, UserProfile},
    events::EventBus,
    router::build_router,
    routes::arrival::ArrivalOutcome,
    utils::generate_token,
};
use reqwest::StatusCode;

struct Server {
    base_url: String,
    config: Config,
    store: Arc<MemoryStore>,
}

impl Server {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        for (username, name) in [("alice", Some("Alice")), ("bob", Some("Bob")), ("carol", None)] {
            store
                .insert_user(UserProfile {
                    user_id: format!("u-{username}"),
                    username: username.to_string(),
                    name: name.map(str::to_string),
                    country: None,
                    profile_icon: None,
                    profile_color: Some("#ff8800".into()),
                })
                .await;
        }

        let config = Config::development("lifecycle-secret");
        let (events, _rx) = EventBus::new();
        let state = AppState::new(store.clone(), config.clone(), events);
        let app = build_router(state, None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base_url: format!("http://{addr}/api"),
            config,
            store,
        }
    }

    fn client(&self, username: &str) -> RadrClient {
        let (token, _) =
            generate_token(&format!("u-{username}"), username, false, &self.config).unwrap();
        let keys = Arc::new(GroupKeyRing::new(Arc::new(MemoryKeyStore::new())));
        RadrClient::new(&self.base_url, token, keys)
    }
}

#[tokio::test]
async fn full_group_lifecycle() {
    let server = Server::start().await;
    let alice = server.client("alice");
    let bob = server.client("bob");

    let group = alice
        .create_group(NewGroupParams {
            target_name: "Cafe".into(),
            target_lat: 10.0,
            target_lng: 20.0,
            target_radius_km: Some(1.0),
            expires_in_hours: None,
            invite_usernames: vec!["bob".into(), "nobody".into()],
        })
        .await
        .unwrap();
    assert!(alice.keys().has_group_key(&group.id).await);

    // A 到达
    let outcome = alice.check_arrival(&group.id, 10.0, 20.0005).await.unwrap();
    assert!(matches!(outcome, ArrivalOutcome::Arrived { .. }));

    // B 还很远
    let outcome = bob.check_arrival(&group.id, 10.5, 20.5).await.unwrap();
    assert!(!outcome.within_radius());
    let arrivals = |messages: &[radr::database::MessageEntity]| {
        messages.iter().filter(|m| m.kind == MessageKind::Arrival).count()
    };
    let stored = server.store.list_messages(&group.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(arrivals(&stored), 1);

    // B 从群组列表拿到密钥后发送加密消息
    assert!(!bob.keys().has_group_key(&group.id).await);
    let groups = bob.sync_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].member_count, 2);
    assert_eq!(groups[0].arrived_count, 1);
    assert!(!groups[0].is_creator);

    bob.send_message(&group.id, "on my way ☕").await.unwrap();
    let stored = server.store.list_messages(&group.id).await.unwrap();
    assert_ne!(stored.last().unwrap().content, "on my way ☕");

    let messages = alice.fetch_messages(&group.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Alice has entered Cafe");
    assert_eq!(messages[1].content, "on my way ☕");
    assert_eq!(messages[1].name.as_deref(), Some("Bob"));

    // A 移除 B
    alice.remove_member(&group.id, "u-bob").await.unwrap();
    assert!(server.store.find_member(&group.id, "u-bob").await.unwrap().is_none());
    let messages = alice.fetch_messages(&group.id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.kind, MessageKind::Leave);
    assert_eq!(last.content, "Bob was removed from the group");

    let err = bob.send_message(&group.id, "still here?").await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));

    // 删除群组后本地密钥同时清除
    alice.delete_group(&group.id).await.unwrap();
    assert!(!alice.keys().has_group_key(&group.id).await);
    assert!(alice.sync_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn creator_cannot_leave_and_members_can() {
    let server = Server::start().await;
    let alice = server.client("alice");
    let carol = server.client("carol");

    let group = alice
        .create_group(NewGroupParams {
            target_name: "Park".into(),
            target_lat: 52.0,
            target_lng: 4.0,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(group.target_radius_km, 10.0);

    let added = alice.invite_member(&group.id, "carol").await.unwrap();
    assert_eq!(added, vec!["u-carol".to_string()]);
    assert!(alice.invite_member(&group.id, "carol").await.unwrap().is_empty());
    let err = alice.invite_member(&group.id, "nobody").await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));

    let err = alice.leave_group(&group.id).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));

    carol.sync_groups().await.unwrap();
    carol.leave_group(&group.id).await.unwrap();
    assert!(!carol.keys().has_group_key(&group.id).await);

    let messages = alice.fetch_messages(&group.id).await.unwrap();
    assert_eq!(messages.last().unwrap().content, "carol left the group");
}

#[tokio::test]
async fn nearby_users_over_http() {
    let server = Server::start().await;
    let alice = server.client("alice");
    let bob = server.client("bob");
    let carol = server.client("carol");

    alice.update_presence(52.3700, 4.8900).await.unwrap();
    bob.update_presence(52.3710, 4.8910).await.unwrap();
    carol.update_presence(48.8566, 2.3522).await.unwrap();

    let nearby = alice.nearby(52.3700, 4.8900).await.unwrap();
    assert_eq!(nearby.len(), 1);
    assert_eq!(nearby[0].record.username, "bob");
    assert_eq!(nearby[0].record.profile_color.as_deref(), Some("#ff8800"));
    assert!(nearby[0].distance < 1.0);
}
