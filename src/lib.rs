// リバーストンネルのエージェント
// ブローカーへのコントロールチャネルを維持し、要求に応じてローカルサービスへのブリッジを張る

mod config;
mod protocol;
mod reconnect;
mod session;
mod tap;
mod transport;
mod tunnel;

// パブリックAPI
pub use config::{AgentArgs, AgentConfig, DEFAULT_URL};
pub use protocol::{FatalReason, TunnelRequest};
pub use session::{Action, ControlEvent, ControlSession, SessionExit, SessionState};
pub use tap::BridgeStats;
pub use tunnel::TunnelBridge;
