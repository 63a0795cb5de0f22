use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// コントロールチャネルの認証ヘッダー
pub const AGENT_ID_HEADER: &str = "x-agent-id";
pub const AGENT_SECRET_HEADER: &str = "x-agent-secret";

/// クレデンシャルが不正
pub const CLOSE_INVALID_CREDENTIAL: u16 = 4001;
/// 同じエージェントが既に接続済み
pub const CLOSE_ANOTHER_AGENT_CONNECTED: u16 = 4002;
/// クローズフレームなしで切断された場合のコード
pub const CLOSE_ABNORMAL: u16 = 1006;

/// ブローカー → エージェント: トンネル作成リクエスト
///
/// JSON形式 (camelCase) で届く。
/// `{"tunnelAddress": "...", "tunnelToken": "...", "host": "...", "port": 8080}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub tunnel_address: String,
    pub tunnel_token: String,
    pub host: String,
    pub port: u16,
}

impl TunnelRequest {
    /// メッセージのペイロードからデコード
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let json = std::str::from_utf8(payload)
            .with_context(|| "Failed to convert message data to UTF-8")?;

        serde_json::from_str(json)
            .with_context(|| format!("Failed to deserialize JSON: {}", json))
    }
}

/// 切断理由のうち、再接続してはいけないもの
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    InvalidCredential,
    AnotherAgentConnected,
}

impl FatalReason {
    /// クローズコードを分類する。`None` なら再接続可能
    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            CLOSE_INVALID_CREDENTIAL => Some(FatalReason::InvalidCredential),
            CLOSE_ANOTHER_AGENT_CONNECTED => Some(FatalReason::AnotherAgentConnected),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalReason::InvalidCredential => write!(f, "Invalid credential"),
            FatalReason::AnotherAgentConnected => write!(f, "Another agent is connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tunnel_request() {
        let payload = br#"{"tunnelAddress":"wss://bridge.example/rooms/abc","tunnelToken":"T1","host":"127.0.0.1","port":9000}"#;
        let req = TunnelRequest::from_slice(payload).unwrap();

        assert_eq!(req.tunnel_address, "wss://bridge.example/rooms/abc");
        assert_eq!(req.tunnel_token, "T1");
        assert_eq!(req.host, "127.0.0.1");
        assert_eq!(req.port, 9000);
    }

    #[test]
    fn test_json_field_names() {
        let req = TunnelRequest {
            tunnel_address: "ws://localhost/r".into(),
            tunnel_token: "t".into(),
            host: "localhost".into(),
            port: 80,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["tunnelAddress"], "ws://localhost/r");
        assert_eq!(value["tunnelToken"], "t");
        assert_eq!(value["port"], 80);
    }

    #[test]
    fn test_malformed_payloads() {
        // JSONではない
        assert!(TunnelRequest::from_slice(b"hello").is_err());
        // UTF-8ではない
        assert!(TunnelRequest::from_slice(&[0xff, 0xfe, 0x00]).is_err());
        // フィールド不足
        assert!(TunnelRequest::from_slice(br#"{"tunnelAddress":"ws://x/y"}"#).is_err());
        // ポート範囲外
        assert!(TunnelRequest::from_slice(
            br#"{"tunnelAddress":"ws://x/y","tunnelToken":"t","host":"h","port":70000}"#
        )
        .is_err());
    }

    #[test]
    fn test_close_code_classification() {
        assert_eq!(
            FatalReason::from_close_code(4001),
            Some(FatalReason::InvalidCredential)
        );
        assert_eq!(
            FatalReason::from_close_code(4002),
            Some(FatalReason::AnotherAgentConnected)
        );
        for code in [1000, 1001, 1006, 1011, 4000, 4003] {
            assert_eq!(FatalReason::from_close_code(code), None);
        }
        assert_eq!(FatalReason::InvalidCredential.exit_code(), 1);
        assert_eq!(FatalReason::AnotherAgentConnected.exit_code(), 1);
    }
}
