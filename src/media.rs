//! Локальные медиапотоки: камера, микрофон, захват экрана.
//!
//! Сам захват внешний ([`MediaDevices`]); здесь только учёт треков,
//! билеты запросов и подмена исходящего видео в звонке.

use crate::error::{MediaError, SessionError};
use crate::transport::CallLink;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_TRACK: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Camera,
    Microphone,
    Screen,
}

struct TrackInner {
    id: TrackId,
    kind: TrackKind,
    source: TrackSource,
    stopped: AtomicBool,
}

/// Разделяемый хэндл трека; остановка видна через все клоны
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId(NEXT_TRACK.fetch_add(1, Ordering::Relaxed)),
                kind,
                source,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!("Stopped {} ({:?})", self.inner.id, self.inner.source);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Набор локальных треков
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalStream {
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// Камера + микрофон
    pub fn camera_and_mic() -> Self {
        Self::new(vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Microphone),
            MediaTrack::new(TrackKind::Video, TrackSource::Camera),
        ])
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }

    /// Тот же поток, но с другим видеотреком; аудио не трогаем
    pub fn with_video(&self, video: MediaTrack) -> Self {
        let mut tracks: Vec<MediaTrack> = self
            .tracks
            .iter()
            .filter(|t| t.kind() != TrackKind::Video)
            .cloned()
            .collect();
        tracks.push(video);
        Self { tracks }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    CameraAndMic,
    CameraVideo,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaTicket(u64);

/// Зачем был сделан запрос захвата
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPurpose {
    Outgoing,
    Answer,
    ScreenShare,
    CameraRestore,
}

impl MediaPurpose {
    fn capture(self) -> CaptureKind {
        match self {
            MediaPurpose::Outgoing | MediaPurpose::Answer => CaptureKind::CameraAndMic,
            MediaPurpose::ScreenShare => CaptureKind::Screen,
            MediaPurpose::CameraRestore => CaptureKind::CameraVideo,
        }
    }
}

/// Внешний захват медиа. Результат приходит событием `MediaReady` с тем же билетом
pub trait MediaDevices: Send {
    fn request(&mut self, kind: CaptureKind, ticket: MediaTicket);
    /// Сообщить `TrackEnded`, если трек остановят вне приложения
    fn watch_ended(&mut self, track: &MediaTrack);
}

pub struct MediaTrackController {
    devices: Box<dyn MediaDevices>,
    next_ticket: u64,
    pending: Option<(MediaTicket, MediaPurpose)>,
    outgoing: Option<LocalStream>,
    screen: Option<MediaTrack>,
}

impl MediaTrackController {
    pub fn new(devices: Box<dyn MediaDevices>) -> Self {
        Self {
            devices,
            next_ticket: 1,
            pending: None,
            outgoing: None,
            screen: None,
        }
    }

    /// Новый запрос вытесняет незавершённый
    pub fn request(&mut self, purpose: MediaPurpose) -> MediaTicket {
        let ticket = MediaTicket(self.next_ticket);
        self.next_ticket += 1;
        if let Some((old, old_purpose)) = self.pending.replace((ticket, purpose)) {
            debug!("Media request {:?} ({:?}) superseded", old, old_purpose);
        }
        self.devices.request(purpose.capture(), ticket);
        ticket
    }

    /// Цель запроса, если билет всё ещё актуален
    pub fn resolve(&mut self, ticket: MediaTicket) -> Option<MediaPurpose> {
        match self.pending {
            Some((pending, purpose)) if pending == ticket => {
                self.pending = None;
                Some(purpose)
            }
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<MediaPurpose> {
        self.pending.map(|(_, purpose)| purpose)
    }

    /// Камера+микрофон становятся исходящим потоком и превью
    pub fn attach_camera(&mut self, stream: LocalStream) -> LocalStream {
        if let Some(old) = self.outgoing.replace(stream.clone()) {
            old.stop_all();
        }
        stream
    }

    pub fn outgoing(&self) -> Option<&LocalStream> {
        self.outgoing.as_ref()
    }

    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn is_screen_track(&self, track: TrackId) -> bool {
        self.screen.as_ref().is_some_and(|s| s.id() == track)
    }

    pub fn start_screen_share(&mut self) -> Result<MediaTicket, SessionError> {
        if self.screen.is_some() || self.pending() == Some(MediaPurpose::ScreenShare) {
            return Err(SessionError::AlreadySharing);
        }
        Ok(self.request(MediaPurpose::ScreenShare))
    }

    /// Подменяет исходящее видео захватом экрана; аудио остаётся прежним
    pub fn apply_screen(
        &mut self,
        capture: LocalStream,
        call: &mut dyn CallLink,
    ) -> Result<LocalStream, SessionError> {
        let Some(screen) = capture.video_track().cloned() else {
            capture.stop_all();
            return Err(MediaError::NotFound("screen capture has no video".into()).into());
        };
        let Some(outgoing) = self.outgoing.clone() else {
            capture.stop_all();
            return Err(SessionError::NoActiveSession);
        };
        if let Err(err) = call.replace_video_track(&screen) {
            capture.stop_all();
            return Err(err.into());
        }
        stop_except(&capture, &screen);
        if let Some(camera) = outgoing.video_track() {
            camera.stop();
        }
        self.devices.watch_ended(&screen);
        let preview = outgoing.with_video(screen.clone());
        self.outgoing = Some(preview.clone());
        self.screen = Some(screen);
        info!("Screen share started on {}", call.id());
        Ok(preview)
    }

    pub fn stop_screen_share(&mut self) -> Result<MediaTicket, SessionError> {
        if self.screen.is_none() {
            return Err(SessionError::NotSharing);
        }
        if let Some((ticket, MediaPurpose::CameraRestore)) = self.pending {
            return Ok(ticket);
        }
        Ok(self.request(MediaPurpose::CameraRestore))
    }

    /// Возвращает камеру в звонок и превью, захват экрана останавливается
    pub fn apply_camera_restore(
        &mut self,
        capture: LocalStream,
        call: &mut dyn CallLink,
    ) -> Result<LocalStream, SessionError> {
        let Some(camera) = capture.video_track().cloned() else {
            capture.stop_all();
            return Err(MediaError::NotFound("camera capture has no video".into()).into());
        };
        let Some(outgoing) = self.outgoing.clone() else {
            capture.stop_all();
            return Err(SessionError::NoActiveSession);
        };
        if let Err(err) = call.replace_video_track(&camera) {
            capture.stop_all();
            return Err(err.into());
        }
        stop_except(&capture, &camera);
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        let preview = outgoing.with_video(camera);
        self.outgoing = Some(preview.clone());
        info!("Screen share stopped on {}, camera restored", call.id());
        Ok(preview)
    }

    /// Останавливает всё, что сейчас прикреплено; повторный вызов ничего не делает
    pub fn release_all(&mut self) {
        if let Some((ticket, purpose)) = self.pending.take() {
            debug!("Dropping pending media request {:?} ({:?})", ticket, purpose);
        }
        if let Some(stream) = self.outgoing.take() {
            stream.stop_all();
            info!("Released {} local track(s)", stream.tracks().len());
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
    }

    /// Захват, который уже никому не нужен: треки сразу останавливаем
    pub fn discard(&self, stream: LocalStream) {
        warn!("Discarding stale capture: {} track(s)", stream.tracks().len());
        stream.stop_all();
    }
}

fn stop_except(stream: &LocalStream, keep: &MediaTrack) {
    for track in stream.tracks() {
        if track != keep {
            track.stop();
        }
    }
}
