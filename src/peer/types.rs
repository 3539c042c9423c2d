use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Сообщение data-channel; на проводе это один JSON-объект с полем `type`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataMessage {
    #[serde(rename_all = "camelCase")]
    File {
        name: String,
        mime_type: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Draw {
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
        color: String,
    },
    Clear,
    Busy,
}

impl DataMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DataMessage::File { .. } => "file",
            DataMessage::Draw { .. } => "draw",
            DataMessage::Clear => "clear",
            DataMessage::Busy => "busy",
        }
    }
}

/// Байты файла передаются строкой base64 внутри JSON
mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Полезная нагрузка SDP с метаданными
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
    pub id: String,
    pub ts: i64,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}
