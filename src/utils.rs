use crate::peer::types::ServerConfig;
use rand::Rng;

/// Случайный идентификатор соединения, 16 hex-символов
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Добавляет схему к URL ICE сервера, если её нет
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
