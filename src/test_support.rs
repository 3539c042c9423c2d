//! Записывающие заглушки транспорта, медиа и таймера для тестов

use crate::error::TransportError;
use crate::events::SessionEvent;
use crate::media::{CaptureKind, LocalStream, MediaDevices, MediaTicket, MediaTrack, TrackId};
use crate::transport::{CallLink, DataLink, LinkId, PeerTransport, Scheduler};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct DataLog {
    pub open: bool,
    pub sent: Vec<String>,
    pub closed: bool,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct DataProbe {
    pub id: LinkId,
    pub peer: String,
    pub log: Arc<Mutex<DataLog>>,
}

impl DataProbe {
    pub fn set_open(&self) {
        self.log.lock().unwrap().open = true;
    }

    pub fn set_limit(&self, limit: usize) {
        self.log.lock().unwrap().limit = Some(limit);
    }

    pub fn sent(&self) -> Vec<String> {
        self.log.lock().unwrap().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }
}

pub struct MockDataLink {
    probe: DataProbe,
}

/// Новый data-линк и его зонд
pub fn data_link(peer: &str, open: bool) -> (Box<dyn DataLink>, DataProbe) {
    let probe = DataProbe {
        id: LinkId::next(),
        peer: peer.to_string(),
        log: Arc::new(Mutex::new(DataLog {
            open,
            ..Default::default()
        })),
    };
    (
        Box::new(MockDataLink {
            probe: probe.clone(),
        }),
        probe,
    )
}

impl DataLink for MockDataLink {
    fn id(&self) -> LinkId {
        self.probe.id
    }

    fn peer(&self) -> &str {
        &self.probe.peer
    }

    fn is_open(&self) -> bool {
        let log = self.probe.log.lock().unwrap();
        log.open && !log.closed
    }

    fn send(&mut self, payload: String) -> Result<(), TransportError> {
        let mut log = self.probe.log.lock().unwrap();
        if log.closed {
            return Err(TransportError::Closed);
        }
        log.sent.push(payload);
        Ok(())
    }

    fn close(&mut self) {
        self.probe.log.lock().unwrap().closed = true;
    }

    fn max_message_bytes(&self) -> Option<usize> {
        self.probe.log.lock().unwrap().limit
    }
}

#[derive(Default)]
pub struct CallLog {
    pub answered_with: Option<LocalStream>,
    pub outgoing_video: Option<MediaTrack>,
    pub replaced: Vec<MediaTrack>,
    pub closed: bool,
}

#[derive(Clone)]
pub struct CallProbe {
    pub id: LinkId,
    pub peer: String,
    pub log: Arc<Mutex<CallLog>>,
}

impl CallProbe {
    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    pub fn outgoing_video(&self) -> Option<MediaTrack> {
        self.log.lock().unwrap().outgoing_video.clone()
    }

    pub fn answered_with(&self) -> Option<LocalStream> {
        self.log.lock().unwrap().answered_with.clone()
    }
}

pub struct MockCallLink {
    probe: CallProbe,
}

/// Хэндл звонка; `stream` - то, с чем звонок был начат (для исходящих)
pub fn call_link(peer: &str, stream: Option<&LocalStream>) -> (Box<dyn CallLink>, CallProbe) {
    let probe = CallProbe {
        id: LinkId::next(),
        peer: peer.to_string(),
        log: Arc::new(Mutex::new(CallLog {
            outgoing_video: stream.and_then(|s| s.video_track().cloned()),
            ..Default::default()
        })),
    };
    (
        Box::new(MockCallLink {
            probe: probe.clone(),
        }),
        probe,
    )
}

impl CallLink for MockCallLink {
    fn id(&self) -> LinkId {
        self.probe.id
    }

    fn peer(&self) -> &str {
        &self.probe.peer
    }

    fn answer(&mut self, stream: &LocalStream) -> Result<(), TransportError> {
        let mut log = self.probe.log.lock().unwrap();
        log.answered_with = Some(stream.clone());
        log.outgoing_video = stream.video_track().cloned();
        Ok(())
    }

    fn replace_video_track(&mut self, track: &MediaTrack) -> Result<(), TransportError> {
        let mut log = self.probe.log.lock().unwrap();
        if log.closed {
            return Err(TransportError::Closed);
        }
        log.outgoing_video = Some(track.clone());
        log.replaced.push(track.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.probe.log.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
pub struct TransportLog {
    pub calls: Vec<CallProbe>,
    pub connects: Vec<DataProbe>,
    pub fail_connect: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub log: Arc<Mutex<TransportLog>>,
}

impl MockTransport {
    pub fn last_call(&self) -> CallProbe {
        self.log.lock().unwrap().calls.last().cloned().expect("no call placed")
    }

    pub fn last_connect(&self) -> DataProbe {
        self.log
            .lock()
            .unwrap()
            .connects
            .last()
            .cloned()
            .expect("no data connection opened")
    }

    pub fn call_count(&self) -> usize {
        self.log.lock().unwrap().calls.len()
    }

    pub fn connect_count(&self) -> usize {
        self.log.lock().unwrap().connects.len()
    }
}

impl PeerTransport for MockTransport {
    fn call(
        &mut self,
        remote: &str,
        stream: &LocalStream,
    ) -> Result<Box<dyn CallLink>, TransportError> {
        let (link, probe) = call_link(remote, Some(stream));
        self.log.lock().unwrap().calls.push(probe);
        Ok(link)
    }

    fn connect(&mut self, remote: &str) -> Result<Box<dyn DataLink>, TransportError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_connect {
            return Err(TransportError::ConnectFailed(remote.to_string()));
        }
        let (link, probe) = data_link(remote, false);
        log.connects.push(probe);
        Ok(link)
    }
}

#[derive(Default)]
pub struct DevicesLog {
    pub requests: Vec<(CaptureKind, MediaTicket)>,
    pub watched: Vec<TrackId>,
}

#[derive(Clone, Default)]
pub struct MockDevices {
    pub log: Arc<Mutex<DevicesLog>>,
}

impl MockDevices {
    pub fn last_request(&self) -> (CaptureKind, MediaTicket) {
        *self
            .log
            .lock()
            .unwrap()
            .requests
            .last()
            .expect("no media requested")
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().requests.len()
    }
}

impl MediaDevices for MockDevices {
    fn request(&mut self, kind: CaptureKind, ticket: MediaTicket) {
        self.log.lock().unwrap().requests.push((kind, ticket));
    }

    fn watch_ended(&mut self, track: &MediaTrack) {
        self.log.lock().unwrap().watched.push(track.id());
    }
}

#[derive(Clone, Default)]
pub struct ManualScheduler {
    pub queued: Arc<Mutex<Vec<(Duration, SessionEvent)>>>,
}

impl ManualScheduler {
    pub fn take(&self) -> Vec<(Duration, SessionEvent)> {
        std::mem::take(&mut *self.queued.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, event: SessionEvent) {
        self.queued.lock().unwrap().push((delay, event));
    }
}
