//! Граница с внешним p2p-транспортом.
//!
//! Транспорт - чёрный ящик: он умеет звонить, открывать data-соединения и
//! присылать события. Все события приходят в контроллер как
//! [`SessionEvent`](crate::events::SessionEvent) с [`LinkId`] хэндла.

use crate::error::TransportError;
use crate::events::SessionEvent;
use crate::media::{LocalStream, MediaTrack};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// Уникальный в пределах процесса идентификатор хэндла звонка или data-соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        LinkId(NEXT_LINK.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Хэндл медиа-звонка
pub trait CallLink: Send {
    fn id(&self) -> LinkId;
    fn peer(&self) -> &str;
    /// Ответить на входящий звонок своим потоком
    fn answer(&mut self, stream: &LocalStream) -> Result<(), TransportError>;
    /// Подменить исходящее видео без пересогласования звонка
    fn replace_video_track(&mut self, track: &MediaTrack) -> Result<(), TransportError>;
    fn close(&mut self);
}

/// Хэндл data-соединения
pub trait DataLink: Send {
    fn id(&self) -> LinkId;
    fn peer(&self) -> &str;
    fn is_open(&self) -> bool;
    fn send(&mut self, payload: String) -> Result<(), TransportError>;
    fn close(&mut self);
    /// Предел одного сообщения, если транспорт его знает
    fn max_message_bytes(&self) -> Option<usize> {
        None
    }
}

/// Исходящие примитивы транспорта
pub trait PeerTransport: Send {
    fn call(
        &mut self,
        remote: &str,
        stream: &LocalStream,
    ) -> Result<Box<dyn CallLink>, TransportError>;

    fn connect(&mut self, remote: &str) -> Result<Box<dyn DataLink>, TransportError>;
}

/// Единственный таймер: событие вернётся в контроллер через `delay`
pub trait Scheduler: Send {
    fn schedule(&mut self, delay: Duration, event: SessionEvent);
}

/// Таймер поверх tokio; событие попадает в общую очередь сессии
pub struct TokioScheduler {
    events: UnboundedSender<SessionEvent>,
}

impl TokioScheduler {
    pub fn new(events: UnboundedSender<SessionEvent>) -> Self {
        Self { events }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, event: SessionEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(event).is_err() {
                tracing::debug!("session queue closed before timer fired");
            }
        });
    }
}
