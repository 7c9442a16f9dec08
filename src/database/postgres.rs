use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Error as SqlxError, PgExecutor, PgPool, types::Json};
use uuid::Uuid;

use super::{
    GroupEntity, GroupSummary, MemberEntity, MemberSummary, MessageEntity, MessageKind,
    NewGroup, NewMessage, RadrStore, UserProfile,
};

/// Postgres 存储实现
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    group_id: String,
    user_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    content: String,
    metadata: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
    username: Option<String>,
    name: Option<String>,
}

impl TryFrom<MessageRow> for MessageEntity {
    type Error = SqlxError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let kind = MessageKind::parse(&row.kind).ok_or_else(|| {
            SqlxError::Decode(format!("unknown message type: {}", row.kind).into())
        })?;

        Ok(MessageEntity {
            id: row.id,
            group_id: row.group_id,
            user_id: row.user_id,
            kind,
            content: row.content,
            metadata: row.metadata.0,
            created_at: row.created_at,
            username: row.username,
            name: row.name,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupListRow {
    #[sqlx(flatten)]
    group: GroupEntity,
    has_arrived: bool,
    arrived_at: Option<DateTime<Utc>>,
    member_count: i64,
    arrived_count: i64,
}

const GROUP_COLUMNS: &str = "id, creator_id, target_name, target_lat, target_lng, \
     target_radius_km, expires_at, encryption_key, created_at";

// 插入一条消息，可在连接池或事务上执行
async fn insert_message_with<'e, E: PgExecutor<'e>>(
    executor: E,
    message: &NewMessage,
) -> Result<MessageEntity, SqlxError> {
    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        WITH inserted AS (
            INSERT INTO radr_messages (group_id, user_id, type, content, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, clock_timestamp())
            RETURNING id, group_id, user_id, type, content, metadata, created_at
        )
        SELECT i.*, u.username, u.name
        FROM inserted i
        LEFT JOIN users u ON u.user_id = i.user_id
        "#,
    )
    .bind(&message.group_id)
    .bind(&message.user_id)
    .bind(message.kind.as_str())
    .bind(&message.content)
    .bind(Json(&message.metadata))
    .fetch_one(executor)
    .await?;

    row.try_into()
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn members_of(&self, group_ids: &[String]) -> Result<Vec<MemberSummary>, SqlxError> {
        sqlx::query_as::<_, MemberSummary>(
            r#"
            SELECT gm.group_id, gm.user_id, u.username, u.name, gm.has_arrived,
                   u.profile_icon, u.profile_color
            FROM radr_group_members gm
            JOIN users u ON u.user_id = gm.user_id
            WHERE gm.group_id = ANY($1)
            ORDER BY gm.arrived_at ASC NULLS LAST, u.username ASC
            "#,
        )
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await
    }
}

#[async_trait]
impl RadrStore for PgStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, SqlxError> {
        sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT user_id, username, name, country, profile_icon, profile_color
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_users_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<UserProfile>, SqlxError> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT user_id, username, name, country, profile_icon, profile_color
            FROM users
            WHERE username = ANY($1)
            "#,
        )
        .bind(usernames)
        .fetch_all(&self.pool)
        .await
    }

    async fn create_group(
        &self,
        group: NewGroup,
        invitee_ids: &[String],
    ) -> Result<GroupEntity, SqlxError> {
        let group_id = Uuid::new_v4().to_string();

        // 开启事务：群组和创建者成员记录必须一起写入
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, GroupEntity>(&format!(
            r#"
            INSERT INTO radr_groups (
                id, creator_id, target_name, target_lat, target_lng,
                target_radius_km, expires_at, encryption_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(&group_id)
        .bind(&group.creator_id)
        .bind(&group.target_name)
        .bind(group.target_lat)
        .bind(group.target_lng)
        .bind(group.target_radius_km)
        .bind(group.expires_at)
        .bind(&group.encryption_key)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO radr_group_members (group_id, user_id, has_arrived)
            SELECT $1, member_id, FALSE
            FROM UNNEST($2::TEXT[]) AS member_id
            ON CONFLICT (group_id, user_id) DO NOTHING
            "#,
        )
        .bind(&group_id)
        .bind(
            std::iter::once(group.creator_id.clone())
                .chain(invitee_ids.iter().cloned())
                .collect::<Vec<_>>(),
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(created)
    }

    async fn find_group(&self, group_id: &str) -> Result<Option<GroupEntity>, SqlxError> {
        sqlx::query_as::<_, GroupEntity>(&format!(
            "SELECT {GROUP_COLUMNS} FROM radr_groups WHERE id = $1"
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_groups_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<GroupSummary>, SqlxError> {
        let rows = sqlx::query_as::<_, GroupListRow>(
            r#"
            SELECT g.id, g.creator_id, g.target_name, g.target_lat, g.target_lng,
                   g.target_radius_km, g.expires_at, g.encryption_key, g.created_at,
                   m.has_arrived, m.arrived_at,
                   (SELECT COUNT(*) FROM radr_group_members WHERE group_id = g.id) AS member_count,
                   (SELECT COUNT(*) FROM radr_group_members
                     WHERE group_id = g.id AND has_arrived = TRUE) AS arrived_count
            FROM radr_groups g
            JOIN radr_group_members m ON g.id = m.group_id
            WHERE m.user_id = $1 AND g.expires_at > $2
            ORDER BY g.created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        // 一次查出所有群组的成员名单，再按群组分组
        let group_ids: Vec<String> = rows.iter().map(|r| r.group.id.clone()).collect();
        let mut rosters: HashMap<String, Vec<MemberSummary>> = HashMap::new();
        for member in self.members_of(&group_ids).await? {
            rosters.entry(member.group_id.clone()).or_default().push(member);
        }

        Ok(rows
            .into_iter()
            .map(|row| GroupSummary {
                members: rosters.remove(&row.group.id).unwrap_or_default(),
                group: row.group,
                has_arrived: row.has_arrived,
                arrived_at: row.arrived_at,
                member_count: row.member_count,
                arrived_count: row.arrived_count,
            })
            .collect())
    }

    async fn find_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberEntity>, SqlxError> {
        sqlx::query_as::<_, MemberEntity>(
            r#"
            SELECT group_id, user_id, has_arrived, arrived_at
            FROM radr_group_members
            WHERE group_id = $1 AND user_id = $2
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn member_ids(&self, group_id: &str) -> Result<Vec<String>, SqlxError> {
        sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM radr_group_members WHERE group_id = $1",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn add_members(
        &self,
        group_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<String>, SqlxError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        // 重复插入被 ON CONFLICT 吸收，RETURNING 只返回新增的行
        sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO radr_group_members (group_id, user_id, has_arrived)
            SELECT $1, member_id, FALSE
            FROM UNNEST($2::TEXT[]) AS member_id
            ON CONFLICT (group_id, user_id) DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(group_id)
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
    }

    async fn remove_member(
        &self,
        group_id: &str,
        user_id: &str,
        leave_message: NewMessage,
    ) -> Result<Option<MessageEntity>, SqlxError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM radr_group_members WHERE group_id = $1 AND user_id = $2",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let message = insert_message_with(&mut *tx, &leave_message).await?;
        tx.commit().await?;

        Ok(Some(message))
    }

    async fn delete_group(&self, group_id: &str) -> Result<bool, SqlxError> {
        // 成员和消息通过 ON DELETE CASCADE 一并删除
        let deleted = sqlx::query("DELETE FROM radr_groups WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    async fn mark_arrived(
        &self,
        group_id: &str,
        user_id: &str,
        arrival_message: NewMessage,
    ) -> Result<Option<(MemberEntity, MessageEntity)>, SqlxError> {
        let mut tx = self.pool.begin().await?;

        // 条件更新：并发调用时只有一个能看到 has_arrived = FALSE
        let member = sqlx::query_as::<_, MemberEntity>(
            r#"
            UPDATE radr_group_members
            SET has_arrived = TRUE, arrived_at = NOW()
            WHERE group_id = $1 AND user_id = $2 AND has_arrived = FALSE
            RETURNING group_id, user_id, has_arrived, arrived_at
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(member) = member else {
            tx.rollback().await?;
            return Ok(None);
        };

        let message = insert_message_with(&mut *tx, &arrival_message).await?;
        tx.commit().await?;

        Ok(Some((member, message)))
    }

    async fn insert_member_message(
        &self,
        message: NewMessage,
    ) -> Result<Option<MessageEntity>, SqlxError> {
        let mut tx = self.pool.begin().await?;

        // 锁住成员行，事务提交前并发的移除或删除群组会等待
        let member = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id FROM radr_group_members
            WHERE group_id = $1 AND user_id = $2
            FOR KEY SHARE
            "#,
        )
        .bind(&message.group_id)
        .bind(&message.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if member.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let message = insert_message_with(&mut *tx, &message).await?;
        tx.commit().await?;

        Ok(Some(message))
    }

    async fn list_messages(&self, group_id: &str) -> Result<Vec<MessageEntity>, SqlxError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT m.id, m.group_id, m.user_id, m.type, m.content, m.metadata, m.created_at,
                   u.username, u.name
            FROM radr_messages m
            LEFT JOIN users u ON m.user_id = u.user_id
            WHERE m.group_id = $1
            ORDER BY m.created_at ASC, m.id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MessageEntity::try_from).collect()
    }

    async fn delete_message(&self, message_id: i64) -> Result<bool, SqlxError> {
        let deleted = sqlx::query("DELETE FROM radr_messages WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }
}
