//! Ядро p2p-сессии на двоих: звонок, передача файлов и общая доска.
//!
//! Вся логика синхронная и живёт в [`SessionController`]; асинхронный мир
//! (webrtc, захват медиа, таймеры) возвращается в него событиями. Для
//! приложения есть готовая связка [`SessionDriver`] + [`SessionHandle`].

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod file_relay;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod transport;
pub mod utils;
pub mod whiteboard;

#[cfg(test)]
mod test_support;

pub use commands::{SessionDriver, SessionHandle, SessionSnapshot};
pub use config::SessionConfig;
pub use controller::SessionController;
pub use error::{Result, SessionError};
pub use events::{EndReason, Notice, SessionEvent};
pub use peer::connection::RtcTransport;
pub use peer::signal::{Signal, SignalKind, SignalingChannel};
