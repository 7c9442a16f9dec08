use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::common::MapLocation;
use crate::utils::distance_km;

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdatePresenceRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
}

/// 用户最近一次上报的位置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub username: String,
    pub lat: f64,
    pub lng: f64,
    pub last_seen: DateTime<Utc>,
    pub profile_icon: Option<String>,
    pub profile_color: Option<String>,
}

impl PresenceRecord {
    pub fn location(&self) -> MapLocation {
        MapLocation::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyUser {
    #[serde(flatten)]
    pub record: PresenceRecord,
    pub distance: f64,
}

/// 在线用户位置表，只保存在内存中，重启即丢失
#[derive(Clone)]
pub struct PresenceMap {
    inner: Arc<RwLock<HashMap<String, PresenceRecord>>>,
    ttl: Duration,
}

impl PresenceMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn evict_stale(map: &mut HashMap<String, PresenceRecord>, cutoff: DateTime<Utc>) {
        let before = map.len();
        map.retain(|_, r| r.last_seen >= cutoff);
        let evicted = before - map.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} stale presence records", evicted);
        }
    }

    /// 写入或覆盖位置记录，同时清理过期记录
    pub async fn update(&self, record: PresenceRecord) {
        let cutoff = record.last_seen - self.ttl;
        let mut map = self.inner.write().await;
        map.insert(record.user_id.clone(), record);
        Self::evict_stale(&mut map, cutoff);
    }

    /// 半径内的其他用户，按距离从近到远排序
    pub async fn nearby(
        &self,
        user_id: &str,
        origin: MapLocation,
        radius_km: f64,
        now: DateTime<Utc>,
    ) -> Vec<NearbyUser> {
        let mut map = self.inner.write().await;
        Self::evict_stale(&mut map, now - self.ttl);

        let mut nearby: Vec<NearbyUser> = map
            .values()
            .filter(|r| r.user_id != user_id)
            .map(|r| NearbyUser {
                distance: distance_km(origin, r.location()),
                record: r.clone(),
            })
            .filter(|u| u.distance <= radius_km)
            .collect();

        nearby.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        nearby
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
