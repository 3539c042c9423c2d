use crate::error::{ProtocolError, SessionError, TransportError};
use crate::peer::types::DataMessage;
use crate::transport::{DataLink, LinkId};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Один канал на пару пиров; все виды сообщений идут через него
pub struct DataChannelProtocol {
    link: Box<dyn DataLink>,
    open: bool,
    pending: VecDeque<String>,
}

impl DataChannelProtocol {
    pub fn new(link: Box<dyn DataLink>) -> Self {
        let open = link.is_open();
        debug!("Data channel protocol on {} (open: {})", link.id(), open);
        Self {
            link,
            open,
            pending: VecDeque::new(),
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn peer(&self) -> &str {
        self.link.peer()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Отправка сразу, если канал открыт; иначе в очередь до события open
    pub fn send(&mut self, msg: &DataMessage) -> Result<(), SessionError> {
        let payload = serde_json::to_string(msg).map_err(ProtocolError::Encode)?;
        if let Some(limit) = self.link.max_message_bytes() {
            if payload.len() > limit {
                warn!("{} of {} bytes will not fit on {}", msg.kind(), payload.len(), self.link.id());
                return Err(TransportError::TooLarge {
                    size: payload.len(),
                    limit,
                }
                .into());
            }
        }
        if self.open {
            debug!("Sending {} ({} bytes) on {}", msg.kind(), payload.len(), self.link.id());
            self.link.send(payload)?;
        } else {
            debug!("Channel {} not open yet, deferring {}", self.link.id(), msg.kind());
            self.pending.push_back(payload);
        }
        Ok(())
    }

    /// Канал открылся: отправляем отложенное в исходном порядке
    pub fn on_open(&mut self) -> Result<usize, TransportError> {
        self.open = true;
        let mut flushed = 0;
        while let Some(payload) = self.pending.pop_front() {
            if let Err(e) = self.link.send(payload) {
                warn!("Flush on {} failed after {} message(s): {}", self.link.id(), flushed, e);
                return Err(e);
            }
            flushed += 1;
        }
        if flushed > 0 {
            info!("Flushed {} deferred message(s) on {}", flushed, self.link.id());
        }
        Ok(flushed)
    }

    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "Closing {} with {} undelivered message(s)",
                self.link.id(),
                self.pending.len()
            );
            self.pending.clear();
        }
        self.open = false;
        self.link.close();
    }

    /// Неизвестные и битые сообщения только логируются
    pub fn decode(payload: &str) -> Option<DataMessage> {
        match serde_json::from_str::<DataMessage>(payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("{}", ProtocolError::Malformed(e));
                None
            }
        }
    }
}
