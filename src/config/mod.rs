use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub presence_ttl_secs: u64,
    pub nearby_radius_km: f64,
    pub default_group_radius_km: f64,
    pub default_group_ttl_hours: i64,
    pub push_webhook_url: Option<String>,
    pub push_timeout_secs: u64,
}

// 读取可选变量，缺失或解析失败时使用默认值
fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let jwt_expiration = env::var("JWT_EXPIRATION")
            .unwrap_or_default()
            .trim_end_matches('h')
            .parse::<u64>()
            .unwrap_or(24);

        Ok(Config {
            database_url: optional_var("DATABASE_URL"),
            redis_url: optional_var("REDIS_URL"),
            jwt_secret: env::var("JWT_SECRET")?,
            jwt_expiration_secs: jwt_expiration * 3600,
            rate_limit_window_secs: var_or("RATE_LIMIT_WINDOW", 60),
            rate_limit_requests: var_or("RATE_LIMIT_REQUESTS", 100),
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "::".into()),
            server_port: var_or("SERVER_PORT", 3000),
            api_base_uri: env::var("API_BASE_URI").unwrap_or_else(|_| "/api".into()),
            presence_ttl_secs: var_or("PRESENCE_TTL_SECS", 120),
            nearby_radius_km: var_or("NEARBY_RADIUS_KM", 10.0),
            default_group_radius_km: var_or("DEFAULT_GROUP_RADIUS_KM", 10.0),
            default_group_ttl_hours: var_or("DEFAULT_GROUP_TTL_HOURS", 24),
            push_webhook_url: optional_var("PUSH_WEBHOOK_URL"),
            push_timeout_secs: var_or("PUSH_TIMEOUT_SECS", 10),
        })
    }

    /// 本地开发与测试用配置：内存存储，无限流，无推送
    pub fn development(jwt_secret: &str) -> Self {
        Config {
            database_url: None,
            redis_url: None,
            jwt_secret: jwt_secret.to_string(),
            jwt_expiration_secs: 24 * 3600,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            server_host: "127.0.0.1".into(),
            server_port: 3000,
            api_base_uri: "/api".into(),
            presence_ttl_secs: 120,
            nearby_radius_km: 10.0,
            default_group_radius_km: 10.0,
            default_group_ttl_hours: 24,
            push_webhook_url: None,
            push_timeout_secs: 10,
        }
    }

    pub fn jwt_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn presence_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_ttl_secs as i64)
    }

    /// 单次推送请求的上限，至少一秒
    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs.max(1))
    }
}
