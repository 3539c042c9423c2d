//! Конечный автомат звонка и допуска.
//!
//! Контроллер владеет единственной [`PeerSession`] и единственный говорит с
//! транспортом. Все асинхронные результаты (медиа, транспорт, таймеры)
//! приходят через [`SessionController::handle`], поэтому каждое ожидание -
//! явная точка, где состояние перепроверяется.

use crate::config::SessionConfig;
use crate::error::{MediaError, Result, SessionError, TransportError};
use crate::events::{EndReason, Notice, RemoteStream, SessionEvent};
use crate::file_relay::{FileRelay, OutgoingFile, ReceivedFile};
use crate::logger::Notifier;
use crate::media::{LocalStream, MediaDevices, MediaPurpose, MediaTrackController, TrackId};
use crate::peer::data_channel::DataChannelProtocol;
use crate::peer::types::DataMessage;
use crate::session::{ParkedLink, PeerSession, Role, SessionState};
use crate::transport::{CallLink, DataLink, LinkId, PeerTransport, Scheduler};
use crate::whiteboard::{Canvas, Point, StrokeCanvas, WhiteboardSync};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SessionController {
    session: PeerSession,
    transport: Box<dyn PeerTransport>,
    media: MediaTrackController,
    scheduler: Box<dyn Scheduler>,
    board: WhiteboardSync,
    files: FileRelay,
    notifier: Notifier,
    /// Отклонённые data-соединения, ждущие доставки Busy
    lingering: HashMap<LinkId, DataChannelProtocol>,
    remote_stream: Option<RemoteStream>,
    busy_grace: Duration,
    busy_open_timeout: Duration,
}

impl SessionController {
    pub fn new(
        config: &SessionConfig,
        transport: Box<dyn PeerTransport>,
        devices: Box<dyn MediaDevices>,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self {
            session: PeerSession::new(),
            transport,
            media: MediaTrackController::new(devices),
            scheduler,
            board: WhiteboardSync::new(Box::<StrokeCanvas>::default()),
            files: FileRelay::new(config.max_file_bytes, config.file_warn_bytes),
            notifier: Notifier::silent(),
            lingering: HashMap::new(),
            remote_stream: None,
            busy_grace: config.busy_grace(),
            busy_open_timeout: config.busy_open_timeout(),
        }
    }

    pub fn with_canvas(mut self, canvas: Box<dyn Canvas>) -> Self {
        self.board = WhiteboardSync::new(canvas);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn local_preview(&self) -> Option<&LocalStream> {
        self.media.outgoing()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn received_files(&self) -> &[ReceivedFile] {
        self.files.received()
    }

    pub fn whiteboard(&self) -> &WhiteboardSync {
        &self.board
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.media.is_sharing()
    }

    // ========== ОПЕРАЦИИ ПОЛЬЗОВАТЕЛЯ ==========

    /// Исходящий звонок. Busy и Connecting выставляются до первого ожидания
    pub fn initiate_call(&mut self, remote: &str) -> Result<()> {
        self.expect_state("initiate_call", &[SessionState::Idle])?;
        let remote = remote.trim();
        if remote.is_empty() || self.session.local_id() == Some(remote) {
            return Err(SessionError::InvalidPeer(remote.to_string()));
        }

        self.session.busy = true;
        self.session.remote_id = Some(remote.to_string());
        self.session.role = Some(Role::Caller);
        self.set_state(SessionState::Connecting);
        info!("Calling {}", remote);

        let inbox = match self.take_parked_from(remote) {
            Some(parked) => self.promote(parked),
            None => match self.transport.connect(remote) {
                Ok(link) => {
                    self.session.data = Some(DataChannelProtocol::new(link));
                    Vec::new()
                }
                Err(e) => {
                    warn!("Data connection to {} failed: {}", remote, e);
                    self.teardown(EndReason::TransportFailure(e.to_string()));
                    return Err(e.into());
                }
            },
        };
        self.media.request(MediaPurpose::Outgoing);
        for payload in inbox {
            self.route(payload);
        }
        Ok(())
    }

    /// Принять входящий; звонок отвечается, когда будет готова камера
    pub fn accept_incoming(&mut self) -> Result<()> {
        self.expect_state("accept_incoming", &[SessionState::Incoming])?;
        if self.media.pending() == Some(MediaPurpose::Answer) {
            debug!("accept_incoming already in progress");
            return Ok(());
        }
        info!("Accepting call from {:?}", self.session.remote_id);
        self.media.request(MediaPurpose::Answer);
        Ok(())
    }

    pub fn reject_incoming(&mut self) -> Result<()> {
        self.expect_state("reject_incoming", &[SessionState::Incoming])?;
        info!("Rejecting call from {:?}", self.session.remote_id);
        self.teardown(EndReason::Rejected);
        Ok(())
    }

    /// Завершение из любого состояния; после вызова сессия всегда Idle
    pub fn end_call(&mut self) {
        info!("end_call in {:?}", self.session.state);
        self.teardown(EndReason::Local);
    }

    pub fn send_file(&mut self, file: OutgoingFile) -> Result<()> {
        self.expect_state(
            "send_file",
            &[SessionState::Connecting, SessionState::Active],
        )
        .map_err(|_| SessionError::NoActiveSession)?;
        if self.session.data.is_none() {
            let remote = self
                .session
                .remote_id
                .clone()
                .ok_or(SessionError::NoActiveSession)?;
            for payload in self.ensure_data_channel(&remote)? {
                self.route(payload);
            }
        }
        let channel = self
            .session
            .data
            .as_mut()
            .ok_or(SessionError::NoActiveSession)?;
        self.files.send_file(file, channel)
    }

    pub fn set_pen_color(&mut self, color: impl Into<String>) {
        self.board.set_color(color);
    }

    pub fn pointer_down(&mut self, at: Point) {
        self.board.pointer_down(at);
    }

    pub fn pointer_move(&mut self, to: Point) {
        if let Some(msg) = self.board.pointer_move(to) {
            self.broadcast(&msg);
        }
    }

    pub fn pointer_up(&mut self) {
        self.board.pointer_up();
    }

    pub fn clear_board(&mut self) {
        let msg = self.board.clear_local();
        self.broadcast(&msg);
    }

    pub fn start_screen_share(&mut self) -> Result<()> {
        self.expect_state("start_screen_share", &[SessionState::Active])?;
        if self.session.call.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        self.media.start_screen_share()?;
        Ok(())
    }

    pub fn stop_screen_share(&mut self) -> Result<()> {
        self.expect_state("stop_screen_share", &[SessionState::Active])?;
        self.media.stop_screen_share()?;
        Ok(())
    }

    // ========== СОБЫТИЯ ==========

    pub fn handle(&mut self, event: SessionEvent) {
        debug!("event {:?} in {:?}", event, self.session.state);
        match event {
            SessionEvent::TransportOpened { local_id } => {
                info!("Transport open, local id {}", local_id);
                self.session.local_id = Some(local_id.clone());
                self.notifier.emit(Notice::Ready { local_id });
            }
            SessionEvent::IncomingCall { from, call } => self.on_incoming_call(from, call),
            SessionEvent::IncomingData { from, link } => self.on_incoming_data(from, link),
            SessionEvent::RemoteStream { call, stream } => self.on_remote_stream(call, stream),
            SessionEvent::CallClosed { call } => {
                if self.session.call_id() == Some(call) {
                    info!("Call {} closed by transport", call);
                    self.teardown(EndReason::RemoteClosed);
                } else {
                    debug!("Ignoring close of stale call {}", call);
                }
            }
            SessionEvent::DataOpen { link } => self.on_data_open(link),
            SessionEvent::Data { link, payload } => self.on_data(link, payload),
            SessionEvent::DataClosed { link } => self.on_data_closed(link),
            SessionEvent::MediaReady { ticket, result } => match self.media.resolve(ticket) {
                Some(purpose) => self.on_media(purpose, result),
                None => {
                    if let Ok(stream) = result {
                        warn!("Media for stale request {:?} arrived late", ticket);
                        self.media.discard(stream);
                    }
                }
            },
            SessionEvent::TrackEnded { track } => self.on_track_ended(track),
            SessionEvent::BusyGraceElapsed { link } => {
                if let Some(mut dc) = self.lingering.remove(&link) {
                    debug!("Busy grace over, closing {}", link);
                    dc.close();
                }
            }
            SessionEvent::BusyOpenTimeout { link } => {
                if self.lingering.get(&link).is_some_and(|dc| !dc.is_open()) {
                    if let Some(mut dc) = self.lingering.remove(&link) {
                        info!("Rejected link {} never opened, dropping it", link);
                        dc.close();
                    }
                }
            }
        }
    }

    fn on_incoming_call(&mut self, from: String, mut call: Box<dyn CallLink>) {
        if self.session.busy && !self.session.is_active_peer(&from) {
            info!(
                "Busy with {:?}, closing call {} from {}",
                self.session.remote_id,
                call.id(),
                from
            );
            call.close();
            self.notifier.emit(Notice::AdmissionRejected { from });
            return;
        }

        match self.session.state {
            SessionState::Idle => {
                if self
                    .session
                    .parked
                    .as_ref()
                    .is_some_and(|p| p.link.peer() != from)
                {
                    self.drop_parked();
                }
                self.session.busy = true;
                self.session.remote_id = Some(from.clone());
                self.session.role = Some(Role::Callee);
                self.session.call = Some(call);
                self.set_state(SessionState::Incoming);
                self.notifier.emit(Notice::IncomingCall { from });
            }
            SessionState::Incoming => {
                debug!("Caller {} offered again, replacing call handle", from);
                if let Some(mut old) = self.session.call.replace(call) {
                    old.close();
                }
            }
            SessionState::Connecting | SessionState::Active => self.adopt_call(from, call),
        }
    }

    /// Звонок от текущего собеседника во время Connecting/Active
    fn adopt_call(&mut self, from: String, mut call: Box<dyn CallLink>) {
        let glare = self.session.state == SessionState::Connecting
            && self.session.role == Some(Role::Caller);
        if glare {
            if let Some(local) = self.session.local_id.as_deref() {
                if local < from.as_str() {
                    info!("Call glare with {}: own call wins", from);
                    call.close();
                    return;
                }
            }
        }

        info!("Adopting call {} from {}", call.id(), from);
        match self.media.outgoing().cloned() {
            Some(stream) => {
                if let Err(e) = call.answer(&stream) {
                    warn!("Answering adopted call failed: {}", e);
                    call.close();
                    return;
                }
                if let Some(mut old) = self.session.call.replace(call) {
                    old.close();
                }
                self.session.role = Some(Role::Callee);
                self.set_state(SessionState::Active);
            }
            // камера ещё не готова: ответим в on_camera_ready
            None => {
                if let Some(mut old) = self.session.call.replace(call) {
                    old.close();
                }
                self.session.role = Some(Role::Callee);
            }
        }
    }

    fn on_incoming_data(&mut self, from: String, link: Box<dyn DataLink>) {
        if self.session.busy && !self.session.is_active_peer(&from) {
            self.reject_busy(from, link);
            return;
        }

        match self.session.state {
            SessionState::Idle | SessionState::Incoming => {
                self.drop_parked();
                debug!("Parking data link {} from {}", link.id(), from);
                self.session.parked = Some(ParkedLink {
                    link,
                    inbox: Vec::new(),
                });
            }
            SessionState::Connecting | SessionState::Active => {
                if self.session.data.is_none() {
                    info!("Adopting data link {} from {}", link.id(), from);
                    self.session.data = Some(DataChannelProtocol::new(link));
                } else {
                    debug!("Extra data link {} from {}, receive only", link.id(), from);
                    self.session.secondary.push(link);
                }
            }
        }
    }

    /// Занято: отправляем Busy и закрываем соединение после паузы
    fn reject_busy(&mut self, from: String, link: Box<dyn DataLink>) {
        let id = link.id();
        info!("Busy with {:?}, answering {} from {} with busy", self.session.remote_id, id, from);
        let mut dc = DataChannelProtocol::new(link);
        if let Err(e) = dc.send(&DataMessage::Busy) {
            warn!("Could not send busy on {}: {}", id, e);
            dc.close();
            return;
        }
        if dc.is_open() {
            self.scheduler.schedule(self.busy_grace, SessionEvent::BusyGraceElapsed { link: id });
        } else {
            self.scheduler
                .schedule(self.busy_open_timeout, SessionEvent::BusyOpenTimeout { link: id });
        }
        self.lingering.insert(id, dc);
        self.notifier.emit(Notice::AdmissionRejected { from });
    }

    fn on_remote_stream(&mut self, call: LinkId, stream: RemoteStream) {
        if self.session.call_id() != Some(call) {
            debug!("Ignoring stream of stale call {}", call);
            return;
        }
        info!("Remote stream {} on {}", stream.id, call);
        self.remote_stream = Some(stream.clone());
        self.notifier.emit(Notice::RemoteStream(Some(stream)));
        if self.session.state == SessionState::Connecting {
            self.set_state(SessionState::Active);
        }
    }

    fn on_data_open(&mut self, link: LinkId) {
        if self.session.data_id() == Some(link) {
            let flushed = self.session.data.as_mut().map(DataChannelProtocol::on_open);
            if let Some(Err(e)) = flushed {
                warn!("Data channel {} failed on open: {}", link, e);
                self.teardown(EndReason::TransportFailure(e.to_string()));
            }
        } else if let Some(dc) = self.lingering.get_mut(&link) {
            match dc.on_open() {
                Ok(_) => self
                    .scheduler
                    .schedule(self.busy_grace, SessionEvent::BusyGraceElapsed { link }),
                Err(_) => {
                    if let Some(mut dc) = self.lingering.remove(&link) {
                        dc.close();
                    }
                }
            }
        } else {
            debug!("Open of non-primary link {}", link);
        }
    }

    fn on_data(&mut self, link: LinkId, payload: String) {
        if self.session.data_id() == Some(link) || self.session.secondary.iter().any(|l| l.id() == link) {
            self.route(payload);
        } else if let Some(parked) = self
            .session
            .parked
            .as_mut()
            .filter(|p| p.link.id() == link)
        {
            parked.inbox.push(payload);
        } else {
            debug!("Dropping {} bytes from inactive link {}", payload.len(), link);
        }
    }

    fn on_data_closed(&mut self, link: LinkId) {
        if self.session.data_id() == Some(link) {
            info!("Data channel {} closed", link);
            // канал уже закрыт, повторно не закрываем
            self.session.data = None;
            self.teardown(EndReason::RemoteClosed);
        } else if self.lingering.remove(&link).is_some() {
            debug!("Rejected link {} closed", link);
        } else if self
            .session
            .parked
            .as_ref()
            .is_some_and(|p| p.link.id() == link)
        {
            self.session.parked = None;
        } else {
            self.session.secondary.retain(|l| l.id() != link);
        }
    }

    /// Разбор по типу сообщения
    fn route(&mut self, payload: String) {
        let Some(msg) = DataChannelProtocol::decode(&payload) else {
            return;
        };
        match msg {
            DataMessage::File {
                name,
                mime_type,
                bytes,
            } => {
                let size = bytes.len();
                let file = self.files.on_file(name, mime_type, bytes);
                let name = file.name.clone();
                self.notifier.emit(Notice::FileReceived { name, size });
            }
            DataMessage::Draw { .. } | DataMessage::Clear => self.board.apply_remote(&msg),
            DataMessage::Busy => match self.session.state {
                SessionState::Connecting | SessionState::Active => {
                    let peer = self.session.remote_id.clone().unwrap_or_default();
                    info!("Peer {} is busy, ending session", peer);
                    self.notifier.emit(Notice::PeerBusy { peer });
                    self.teardown(EndReason::PeerBusy);
                }
                state => debug!("Ignoring busy in {:?}", state),
            },
        }
    }

    fn on_media(&mut self, purpose: MediaPurpose, result: std::result::Result<LocalStream, MediaError>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Media for {:?} failed: {}", purpose, e);
                self.notifier.emit(Notice::MediaDenied {
                    purpose,
                    reason: e.to_string(),
                });
                if matches!(purpose, MediaPurpose::Outgoing | MediaPurpose::Answer) {
                    self.teardown(EndReason::MediaDenied);
                }
                return;
            }
        };

        match purpose {
            MediaPurpose::Outgoing | MediaPurpose::Answer => self.on_camera_ready(stream),
            MediaPurpose::ScreenShare | MediaPurpose::CameraRestore => {
                let call = match (self.session.state, self.session.call.as_mut()) {
                    (SessionState::Active, Some(call)) => call,
                    _ => {
                        warn!("{:?} media arrived without an active call", purpose);
                        self.media.discard(stream);
                        return;
                    }
                };
                let applied = if purpose == MediaPurpose::ScreenShare {
                    self.media.apply_screen(stream, call.as_mut())
                } else {
                    self.media.apply_camera_restore(stream, call.as_mut())
                };
                match applied {
                    Ok(preview) => self.notifier.emit(Notice::LocalPreview(Some(preview))),
                    Err(e) => warn!("{:?} not applied: {}", purpose, e),
                }
            }
        }
    }

    fn on_camera_ready(&mut self, stream: LocalStream) {
        let Some(remote) = self.session.remote_id.clone() else {
            self.media.discard(stream);
            return;
        };
        match (self.session.state, self.session.role) {
            (SessionState::Connecting, Some(Role::Caller)) => {
                let preview = self.media.attach_camera(stream);
                self.notifier.emit(Notice::LocalPreview(Some(preview.clone())));
                match self.transport.call(&remote, &preview) {
                    Ok(call) => {
                        info!("Call {} placed to {}", call.id(), remote);
                        self.session.call = Some(call);
                    }
                    Err(e) => {
                        warn!("Call to {} failed: {}", remote, e);
                        self.teardown(EndReason::TransportFailure(e.to_string()));
                    }
                }
            }
            (SessionState::Incoming | SessionState::Connecting, Some(Role::Callee)) => {
                let preview = self.media.attach_camera(stream);
                self.notifier.emit(Notice::LocalPreview(Some(preview.clone())));
                let answered = match self.session.call.as_mut() {
                    Some(call) => call.answer(&preview),
                    None => Err(TransportError::Closed),
                };
                if let Err(e) = answered {
                    warn!("Answering {} failed: {}", remote, e);
                    self.teardown(EndReason::TransportFailure(e.to_string()));
                    return;
                }
                let inbox = match self.ensure_data_channel(&remote) {
                    Ok(inbox) => inbox,
                    Err(e) => {
                        warn!("Data connection to {} failed: {}", remote, e);
                        self.teardown(EndReason::TransportFailure(e.to_string()));
                        return;
                    }
                };
                self.set_state(SessionState::Active);
                for payload in inbox {
                    self.route(payload);
                }
            }
            (state, role) => {
                warn!("Camera arrived in {:?} as {:?}, discarding", state, role);
                self.media.discard(stream);
            }
        }
    }

    fn on_track_ended(&mut self, track: TrackId) {
        if !self.media.is_screen_track(track) {
            debug!("Track {} ended", track);
            return;
        }
        info!("Screen capture {} stopped outside the app", track);
        if let Err(e) = self.stop_screen_share() {
            warn!("Could not restore camera: {}", e);
        }
    }

    // ========== ВСПОМОГАТЕЛЬНОЕ ==========

    fn expect_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.session.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                op,
                state: self.session.state,
            })
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.session.state != state {
            info!("Session {:?} -> {:?}", self.session.state, state);
            self.session.state = state;
            self.notifier.emit(Notice::StateChanged(state));
        }
    }

    fn broadcast(&mut self, msg: &DataMessage) {
        if let Some(dc) = self.session.data.as_mut() {
            if let Err(e) = dc.send(msg) {
                warn!("Broadcast of {} failed: {}", msg.kind(), e);
            }
        }
    }

    fn take_parked_from(&mut self, peer: &str) -> Option<ParkedLink> {
        match self.session.parked.take() {
            Some(parked) if parked.link.peer() == peer => Some(parked),
            Some(mut other) => {
                debug!("Closing parked link {} from {}", other.link.id(), other.link.peer());
                other.link.close();
                None
            }
            None => None,
        }
    }

    fn drop_parked(&mut self) {
        if let Some(mut parked) = self.session.parked.take() {
            debug!("Closing parked link {}", parked.link.id());
            parked.link.close();
        }
    }

    /// Припаркованный линк становится основным; возвращает накопленные сообщения
    fn promote(&mut self, parked: ParkedLink) -> Vec<String> {
        info!("Promoting parked link {}", parked.link.id());
        self.session.data = Some(DataChannelProtocol::new(parked.link));
        parked.inbox
    }

    fn ensure_data_channel(
        &mut self,
        remote: &str,
    ) -> std::result::Result<Vec<String>, TransportError> {
        if self.session.data.is_some() {
            return Ok(Vec::new());
        }
        if let Some(parked) = self.take_parked_from(remote) {
            return Ok(self.promote(parked));
        }
        let link = self.transport.connect(remote)?;
        self.session.data = Some(DataChannelProtocol::new(link));
        Ok(Vec::new())
    }

    /// Общий путь завершения: закрыть всё, остановить треки, снять busy.
    /// Из Idle доска не трогается
    fn teardown(&mut self, reason: EndReason) {
        let was = self.session.state;
        if let Some(mut call) = self.session.call.take() {
            call.close();
        }
        if let Some(mut dc) = self.session.data.take() {
            dc.close();
        }
        self.drop_parked();
        for mut link in self.session.secondary.drain(..) {
            link.close();
        }

        let had_preview = self.media.outgoing().is_some();
        self.media.release_all();
        if had_preview {
            self.notifier.emit(Notice::LocalPreview(None));
        }
        if self.remote_stream.take().is_some() {
            self.notifier.emit(Notice::RemoteStream(None));
        }
        if was != SessionState::Idle {
            self.board.reset();
        }

        self.session.busy = false;
        self.session.remote_id = None;
        self.session.role = None;
        self.set_state(SessionState::Idle);
        if was != SessionState::Idle {
            info!("Session ended: {:?}", reason);
            self.notifier.emit(Notice::Ended { reason });
        }
    }
}
