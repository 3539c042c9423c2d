//! Типы ошибок сессионного слоя

use crate::session::SessionState;
use thiserror::Error;

/// Основная ошибка операций сессии
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{op} is not allowed while {state:?}")]
    InvalidTransition {
        op: &'static str,
        state: SessionState,
    },

    #[error("Invalid remote peer id: {0:?}")]
    InvalidPeer(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Screen share is already running")]
    AlreadySharing,

    #[error("Screen share is not running")]
    NotSharing,

    #[error("File too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: usize, limit: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session driver is no longer running")]
    DriverClosed,
}

/// Ошибки транспорта
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not open")]
    NotOpen,

    #[error("Link closed")]
    Closed,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Message of {size} bytes exceeds the {limit} byte channel limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Signaling failed: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    Rtc(String),
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError::Rtc(err.to_string())
    }
}

/// Ошибки захвата медиа
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Capture aborted")]
    Aborted,
}

/// Ошибки протокола data-channel и сигналинга
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Invalid signal payload: {0}")]
    InvalidPayload(String),
}

/// Ошибки конфигурации
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("ICE server {0:?} has an empty url")]
    EmptyUrl(String),

    #[error("TURN server {0:?} requires username and credential")]
    MissingTurnCredentials(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
