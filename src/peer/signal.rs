//! Сигналинг: offer/answer упакованы в `SdpPayload`, затем gzip + base64.
//!
//! Брокер идентификаторов внешний: приложение реализует [`SignalingChannel`]
//! и возвращает пришедшие сигналы в `RtcTransport::handle_signal`.

use crate::error::{ProtocolError, TransportError};
use crate::peer::types::SdpPayload;
use base64::{engine::general_purpose, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Ограничение распаковки для защиты от zip-bomb
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// К какому соединению относится сигнал
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Call,
    Data,
}

/// Конверт, который доставляет брокер
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub from: String,
    pub to: String,
    pub kind: SignalKind,
    /// Результат [`encode_payload`]
    pub payload: String,
}

pub trait SignalingChannel: Send + Sync {
    fn send(&self, signal: Signal) -> Result<(), TransportError>;
}

pub fn encode_payload(p: &SdpPayload) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(p).map_err(ProtocolError::Encode)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .and_then(|_| gz.finish())
        .map(|compressed| general_purpose::STANDARD.encode(compressed))
        .map_err(|e| ProtocolError::InvalidPayload(format!("gzip: {e}")))
}

pub fn decode_payload(s: &str) -> Result<SdpPayload, ProtocolError> {
    let compressed = general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| ProtocolError::InvalidPayload(format!("base64: {e}")))?;

    let mut json = Vec::new();
    GzDecoder::new(&compressed[..])
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_end(&mut json)
        .map_err(|e| ProtocolError::InvalidPayload(format!("gunzip: {e}")))?;

    serde_json::from_slice(&json).map_err(|e| ProtocolError::InvalidPayload(format!("json: {e}")))
}
