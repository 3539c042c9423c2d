//! Передача файлов целиком одним сообщением `file`.
//!
//! Чанков нет: размер упирается в лимит сообщения транспорта. Жёсткий лимит
//! включается только конфигурацией, порог предупреждения только логирует.

use crate::error::SessionError;
use crate::peer::data_channel::DataChannelProtocol;
use crate::peer::types::DataMessage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use tracing::{info, warn};

/// Файл, выбранный пользователем для отправки
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// Принятый файл; живёт до закрытия UI
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Отпечаток для сверки с отправителем вне канала
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.payload))
    }

    /// "Скачать": отдать содержимое в любой приёмник
    pub fn write_to<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_all(&self.payload)?;
        out.flush()
    }
}

pub struct FileRelay {
    max_bytes: Option<usize>,
    warn_bytes: usize,
    received: Vec<ReceivedFile>,
}

impl FileRelay {
    pub fn new(max_bytes: Option<usize>, warn_bytes: usize) -> Self {
        Self {
            max_bytes,
            warn_bytes,
            received: Vec::new(),
        }
    }

    /// Отправка через канал сессии; если канал ещё не открыт, он сам отложит сообщение
    pub fn send_file(
        &self,
        file: OutgoingFile,
        channel: &mut DataChannelProtocol,
    ) -> Result<(), SessionError> {
        let size = file.bytes.len();
        if let Some(limit) = self.max_bytes {
            if size > limit {
                return Err(SessionError::FileTooLarge { size, limit });
            }
        }
        if size > self.warn_bytes {
            warn!(
                "File {:?} is {} bytes, above the {} bytes that fit in one channel message",
                file.name, size, self.warn_bytes
            );
        }
        info!(
            "Sending file {:?} ({}, {} bytes, sha256 {}) to {}",
            file.name,
            file.mime_type,
            size,
            hex::encode(Sha256::digest(&file.bytes)),
            channel.peer()
        );
        channel.send(&DataMessage::File {
            name: file.name,
            mime_type: file.mime_type,
            bytes: file.bytes,
        })
    }

    /// Принятое сообщение `file` превращается в скачиваемый объект
    pub fn on_file(&mut self, name: String, mime_type: String, bytes: Vec<u8>) -> &ReceivedFile {
        let file = ReceivedFile {
            name,
            mime_type,
            payload: Bytes::from(bytes),
            received_at: Utc::now(),
        };
        info!(
            "Received file {:?} ({} bytes, sha256 {})",
            file.name,
            file.len(),
            file.sha256()
        );
        self.received.push(file);
        &self.received[self.received.len() - 1]
    }

    pub fn received(&self) -> &[ReceivedFile] {
        &self.received
    }
}
