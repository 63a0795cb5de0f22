use anyhow::{Context, Result};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::transport;

/// ブローカーのURL（指定がない場合）
pub const DEFAULT_URL: &str = "https://bridge.outerbase.com/";
/// キープアライブの ping 間隔
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// 再接続の待ち時間の刻み
pub const DEFAULT_RECONNECT_STEP: Duration = Duration::from_secs(5);

/// 環境変数名
pub const ENV_ID: &str = "id";
pub const ENV_SECRET: &str = "secret";
pub const ENV_URL: &str = "url";

/// コマンドラインと環境変数から集めた生の値
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgentArgs {
    pub id: Option<String>,
    pub secret: Option<String>,
    pub url: Option<String>,
}

impl AgentArgs {
    /// 環境変数が設定されていればフラグより優先する
    pub fn with_env_overrides<F>(self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            id: lookup(ENV_ID).or(self.id),
            secret: lookup(ENV_SECRET).or(self.secret),
            url: lookup(ENV_URL).or(self.url),
        }
    }
}

/// エージェントの設定（プロセスの寿命の間は変わらない）
#[derive(Clone)]
pub struct AgentConfig {
    pub endpoint: Url,
    pub agent_id: String,
    pub agent_secret: String,
    pub keepalive_interval: Duration,
    pub reconnect_step: Duration,
}

impl AgentConfig {
    pub fn new(endpoint: &str, agent_id: impl Into<String>, agent_secret: impl Into<String>) -> Result<Self> {
        let endpoint =
            transport::parse_ws_url(endpoint).context("Invalid broker URL")?;

        Ok(Self {
            endpoint,
            agent_id: agent_id.into(),
            agent_secret: agent_secret.into(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect_step: DEFAULT_RECONNECT_STEP,
        })
    }

    pub fn from_args(args: AgentArgs) -> Result<Self> {
        let url = args.url.as_deref().unwrap_or(DEFAULT_URL);
        Self::new(
            url,
            args.id.unwrap_or_default(),
            args.secret.unwrap_or_default(),
        )
    }
}

// シークレットはログに出さない
impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("agent_id", &self.agent_id)
            .field("agent_secret", &"<redacted>")
            .field("keepalive_interval", &self.keepalive_interval)
            .field("reconnect_step", &self.reconnect_step)
            .finish()
    }
}
