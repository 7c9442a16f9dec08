use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::common::MapLocation;
use crate::database::{MessageKind, NewMessage};
use crate::error::{RadrError, RadrResult};
use crate::events::RadrEvent;
use crate::routes::group::{display_name_of, load_active_group, require_member};
use crate::utils::{Claims, distance_km};

// 浮点误差容忍度，正好落在半径上算作到达
const BOUNDARY_EPSILON_KM: f64 = 1e-6;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CheckArrivalRequest {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// 到达检测结果
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArrivalOutcome {
    /// 之前已经到达，本次无任何改动
    AlreadyArrived { message: String },
    /// 本次首次到达
    Arrived { message: String },
    /// 尚未进入半径
    NotYet { distance: f64, message: String },
}

impl ArrivalOutcome {
    pub fn within_radius(&self) -> bool {
        !matches!(self, ArrivalOutcome::NotYet { .. })
    }
}

/// 接口返回体：结果本身加上便于客户端判断的布尔字段
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ArrivalResponse {
    #[serde(flatten)]
    pub outcome: ArrivalOutcome,
    pub arrived: bool,
    pub already_arrived: bool,
    pub within_radius: bool,
}

impl From<ArrivalOutcome> for ArrivalResponse {
    fn from(outcome: ArrivalOutcome) -> Self {
        Self {
            arrived: matches!(outcome, ArrivalOutcome::Arrived { .. }),
            already_arrived: matches!(outcome, ArrivalOutcome::AlreadyArrived { .. }),
            within_radius: outcome.within_radius(),
            outcome,
        }
    }
}

pub fn is_within_radius(distance: f64, radius_km: f64) -> bool {
    distance <= radius_km + BOUNDARY_EPSILON_KM
}

pub async fn check_arrival(
    state: &AppState,
    actor: &Claims,
    group_id: &str,
    req: CheckArrivalRequest,
) -> RadrResult<ArrivalOutcome> {
    let position = match (req.lat, req.lng) {
        (Some(lat), Some(lng)) => MapLocation::new(lat, lng),
        _ => return Err(RadrError::validation("Invalid coordinates")),
    };
    if !position.is_valid() {
        return Err(RadrError::validation("Invalid coordinates"));
    }

    let group = load_active_group(state, group_id).await?;
    let member = require_member(state, &group.id, &actor.sub).await?;

    let already = || ArrivalOutcome::AlreadyArrived {
        message: "You have already arrived".to_string(),
    };

    // 终态上的重复调用直接返回，GPS 抖动不会让状态回退
    if member.has_arrived {
        return Ok(already());
    }

    let target = MapLocation::new(group.target_lat, group.target_lng);
    let distance = distance_km(position, target);

    if !is_within_radius(distance, group.target_radius_km) {
        return Ok(ArrivalOutcome::NotYet {
            distance: (distance * 10.0).round() / 10.0,
            message: format!(
                "You are {} km away from {}",
                distance.round(),
                group.target_name
            ),
        });
    }

    let (display_name, profile) = display_name_of(state, &actor.sub).await;
    let message = NewMessage {
        group_id: group.id.clone(),
        user_id: actor.sub.clone(),
        kind: MessageKind::Arrival,
        content: format!("{} has entered {}", display_name, group.target_name),
        metadata: serde_json::json!({
            "country": profile.and_then(|p| p.country),
            "location": group.target_name,
        }),
    };

    // 状态翻转和系统消息在同一个原子操作里，并发调用只有一个能成功
    let Some(_) = state
        .store
        .mark_arrived(&group.id, &actor.sub, message)
        .await?
    else {
        // 没有翻转成功：要么已被并发请求标记，要么成员记录已被删除
        return match state.store.find_member(&group.id, &actor.sub).await? {
            Some(_) => {
                tracing::debug!("Concurrent arrival for {} in {} already recorded", actor.sub, group.id);
                Ok(already())
            }
            None => Err(RadrError::forbidden("Not a member of this group")),
        };
    };

    tracing::info!(
        "User {} arrived at {} ({:.3} km from target)",
        actor.sub,
        group.target_name,
        distance
    );

    state.events.emit(RadrEvent::MemberArrived {
        group_id: group.id.clone(),
        group_name: group.target_name.clone(),
        user_id: actor.sub.clone(),
        display_name,
    });

    Ok(ArrivalOutcome::Arrived {
        message: format!("Arrival recorded! Welcome to {}", group.target_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::group::model::{CreateGroupRequest, create_group};
    use crate::test_support::{RemovalPoint, TestWorld, group_key};
    use crate::utils::geo::EARTH_RADIUS_KM;

    async fn cafe(world: &TestWorld, lat: f64, lng: f64, radius_km: f64) -> String {
        let req = CreateGroupRequest {
            target_name: Some("Cafe".into()),
            target_lat: Some(lat),
            target_lng: Some(lng),
            target_radius_km: Some(radius_km),
            expires_in_hours: Some(1),
            invite_usernames: vec!["bob".into()],
            encryption_key: Some(group_key()),
        };
        create_group(&world.state, &world.claims("alice"), req)
            .await
            .unwrap()
            .id
    }

    fn at(lat: f64, lng: f64) -> CheckArrivalRequest {
        CheckArrivalRequest {
            lat: Some(lat),
            lng: Some(lng),
        }
    }

    async fn arrival_count(world: &TestWorld, group_id: &str) -> usize {
        world
            .state
            .store
            .list_messages(group_id)
            .await
            .unwrap()
            .iter()
            .filter(|m| m.kind == MessageKind::Arrival)
            .count()
    }

    #[tokio::test]
    async fn arrives_exactly_once() {
        let mut world = TestWorld::new().await;
        let group_id = cafe(&world, 10.0, 20.0, 1.0).await;
        world.drain_events();
        let alice = world.claims("alice");

        let first = check_arrival(&world.state, &alice, &group_id, at(10.0, 20.0005))
            .await
            .unwrap();
        assert!(matches!(first, ArrivalOutcome::Arrived { .. }));

        let second = check_arrival(&world.state, &alice, &group_id, at(10.0, 20.0005))
            .await
            .unwrap();
        assert!(matches!(second, ArrivalOutcome::AlreadyArrived { .. }));

        // 已到达后离开半径也不会回退
        let third = check_arrival(&world.state, &alice, &group_id, at(50.0, 50.0))
            .await
            .unwrap();
        assert!(matches!(third, ArrivalOutcome::AlreadyArrived { .. }));

        assert_eq!(arrival_count(&world, &group_id).await, 1);
        let member = world
            .state
            .store
            .find_member(&group_id, "u-alice")
            .await
            .unwrap()
            .unwrap();
        assert!(member.has_arrived);
        assert!(member.arrived_at.is_some());

        let events = world.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RadrEvent::MemberArrived { display_name, .. } if display_name == "Alice"));

        let messages = world.state.store.list_messages(&group_id).await.unwrap();
        assert_eq!(messages[0].content, "Alice has entered Cafe");
        assert_eq!(messages[0].metadata["country"], "NL");
        assert_eq!(messages[0].metadata["location"], "Cafe");
    }

    #[tokio::test]
    async fn far_away_reports_distance_without_side_effects() {
        let world = TestWorld::new().await;
        let group_id = cafe(&world, 10.0, 20.0, 1.0).await;

        let outcome = check_arrival(&world.state, &world.claims("bob"), &group_id, at(10.5, 20.5))
            .await
            .unwrap();
        match outcome {
            ArrivalOutcome::NotYet { distance, message } => {
                assert!(distance > 70.0 && distance < 80.0, "got {distance}");
                assert!(message.ends_with("km away from Cafe"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(arrival_count(&world, &group_id).await, 0);
    }

    #[tokio::test]
    async fn boundary_counts_as_arrived() {
        let world = TestWorld::new().await;
        let radius = 2.0;
        let group_id = cafe(&world, 0.0, 0.0, radius).await;

        // 沿经线正好 radius 公里
        let lat = (radius / EARTH_RADIUS_KM).to_degrees();
        let outcome = check_arrival(&world.state, &world.claims("bob"), &group_id, at(lat, 0.0))
            .await
            .unwrap();
        assert!(matches!(outcome, ArrivalOutcome::Arrived { .. }));
    }

    #[tokio::test]
    async fn concurrent_checks_write_one_message() {
        let world = TestWorld::new().await;
        let group_id = cafe(&world, 10.0, 20.0, 1.0).await;
        let bob = world.claims("bob");

        let calls = (0..8).map(|_| check_arrival(&world.state, &bob, &group_id, at(10.0, 20.0)));
        let outcomes = futures_util::future::join_all(calls).await;

        let arrived = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(ArrivalOutcome::Arrived { .. })))
            .count();
        assert_eq!(arrived, 1);
        assert!(outcomes.iter().all(|o| o.as_ref().unwrap().within_radius()));
        assert_eq!(arrival_count(&world, &group_id).await, 1);
    }

    #[tokio::test]
    async fn rejects_missing_groups_and_strangers() {
        let world = TestWorld::new().await;
        let group_id = cafe(&world, 10.0, 20.0, 1.0).await;

        let err = check_arrival(&world.state, &world.claims("bob"), "missing", at(0.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));

        let err = check_arrival(&world.state, &world.claims("carol"), &group_id, at(10.0, 20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));

        let err = check_arrival(
            &world.state,
            &world.claims("bob"),
            &group_id,
            CheckArrivalRequest::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RadrError::Validation(_)));
    }

    #[tokio::test]
    async fn member_removed_mid_check_is_forbidden() {
        let world = TestWorld::racing_removal("bob", RemovalPoint::AfterFindMember).await;
        let group_id = cafe(&world, 10.0, 20.0, 1.0).await;

        let err = check_arrival(&world.state, &world.claims("bob"), &group_id, at(10.0, 20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));
        assert_eq!(arrival_count(&world, &group_id).await, 0);
    }

    #[tokio::test]
    async fn expired_group_is_not_found() {
        let world = TestWorld::new().await;
        let group_id = cafe(&world, 10.0, 20.0, 1.0).await;
        world.expire_group(&group_id).await;

        let err = check_arrival(&world.state, &world.claims("bob"), &group_id, at(10.0, 20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));
        assert_eq!(arrival_count(&world, &group_id).await, 0);
    }

    #[test]
    fn response_carries_flat_flags() {
        let not_yet = ArrivalResponse::from(ArrivalOutcome::NotYet {
            distance: 78.2,
            message: "You are 78 km away from Cafe".into(),
        });
        let json = serde_json::to_value(&not_yet).unwrap();
        assert_eq!(json["status"], "not_yet");
        assert_eq!(json["within_radius"], false);
        assert_eq!(json["arrived"], false);
        assert_eq!(json["distance"], 78.2);

        let arrived = ArrivalResponse::from(ArrivalOutcome::Arrived {
            message: "Arrival recorded! Welcome to Cafe".into(),
        });
        let json = serde_json::to_value(&arrived).unwrap();
        assert_eq!(json["arrived"], true);
        assert_eq!(json["already_arrived"], false);
        assert_eq!(json["within_radius"], true);

        let back: ArrivalResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, arrived);
    }
}
