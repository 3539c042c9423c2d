// Конфигурация сессии
// Логирование по умолчанию подробное только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_DIRECTIVE: &str = "pairsync=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_DIRECTIVE: &str = "warn";

/// Максимальный размер одного сообщения data-channel (DEFAULT_MAX_MESSAGE_SIZE в webrtc-sctp)
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Запас под JSON-обёртку сообщения file (имя, тип, ключи)
const FILE_ENVELOPE_BYTES: usize = 1024;

/// Сырые байты файла, которые после base64 ещё помещаются в одно сообщение
pub const DEFAULT_FILE_WARN_BYTES: usize = (MAX_MESSAGE_BYTES - FILE_ENVELOPE_BYTES) / 4 * 3;

/// Настройки одной сессии; каждое поле имеет значение по умолчанию
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Сколько держать отклонённое data-соединение открытым после Busy
    pub busy_grace_ms: u64,
    /// Сколько ждать открытия отклонённого data-соединения, прежде чем бросить его
    pub busy_open_timeout_secs: u64,
    pub data_channel_label: String,
    pub ice_servers: Vec<ServerConfig>,
    pub gather_timeout_secs: u64,
    /// Жёсткий лимит на размер файла; не задан - не ограничиваем
    pub max_file_bytes: Option<usize>,
    pub file_warn_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            busy_grace_ms: 1000,
            busy_open_timeout_secs: 15,
            data_channel_label: "pairsync-data".into(),
            ice_servers: default_ice_servers(),
            gather_timeout_secs: 10,
            max_file_bytes: None,
            file_warn_bytes: DEFAULT_FILE_WARN_BYTES,
        }
    }
}

impl SessionConfig {
    /// Разбор конфигурации, пришедшей из фронтенда
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyUrl(server.id.clone()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        Ok(())
    }

    pub fn busy_grace(&self) -> Duration {
        Duration::from_millis(self.busy_grace_ms)
    }

    pub fn busy_open_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_open_timeout_secs)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }
}

fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}
