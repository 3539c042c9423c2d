use crate::config::{SessionConfig, MAX_MESSAGE_BYTES};
use crate::error::TransportError;
use crate::events::{RemoteStream, SessionEvent};
use crate::logger::dump_selected_pair;
use crate::media::{LocalStream, MediaTrack, TrackId, TrackKind};
use crate::peer::signal::{decode_payload, encode_payload, Signal, SignalKind, SignalingChannel};
use crate::peer::types::{SdpPayload, ServerConfig};
use crate::transport::{CallLink, DataLink, LinkId, PeerTransport};
use crate::utils::{add_ice_url_scheme, random_id};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Конфигурация peer connection из списка серверов
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            ..Default::default()
        }]
    } else {
        get_user_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Общее состояние транспорта; живёт, пока жив хоть один хэндл
struct Shared {
    local_id: String,
    api: API,
    rtc: RTCConfiguration,
    label: String,
    gather_timeout: Duration,
    signaling: Arc<dyn SignalingChannel>,
    events: UnboundedSender<SessionEvent>,
    /// Наши offer, ждущие answer, по id соединения
    awaiting_answer: Mutex<HashMap<String, (LinkId, Arc<RTCPeerConnection>)>>,
    /// Куда захват пишет сэмплы каждого локального трека; ключ владельца - линк
    sinks: Mutex<HashMap<TrackId, (LinkId, Arc<TrackLocalStaticSample>)>>,
}

impl Shared {
    /// Линк закрыт или упал: транспорт больше ничего за ним не держит
    fn forget(&self, link: LinkId) {
        lock(&self.awaiting_answer).retain(|_, (owner, _)| *owner != link);
        lock(&self.sinks).retain(|_, (owner, _)| *owner != link);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session queue closed, transport event dropped");
        }
    }

    async fn new_peer(
        self: &Arc<Self>,
        kind: SignalKind,
        link: LinkId,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc.clone()).await?);

        let events = self.events.clone();
        let weak = Arc::downgrade(&pc);
        let shared = Arc::downgrade(self);
        let ended = AtomicBool::new(false);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("{} ({:?}) peer connection state: {:?}", link, kind, st);
            match st {
                RTCPeerConnectionState::Disconnected => {
                    if let Some(pc) = weak.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "DISCONNECTED").await;
                        });
                    }
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    if !ended.swap(true, Ordering::AcqRel) {
                        if let Some(shared) = shared.upgrade() {
                            shared.forget(link);
                        }
                        let event = match kind {
                            SignalKind::Call => SessionEvent::CallClosed { call: link },
                            SignalKind::Data => SessionEvent::DataClosed { link },
                        };
                        if events.send(event).is_err() {
                            debug!("Session queue closed before {} ended", link);
                        }
                    }
                }
                _ => {}
            }
            Box::pin(async {})
        }));
        Ok(pc)
    }

    /// Первый удалённый трек звонка даёт событие RemoteStream
    fn watch_remote(&self, pc: &RTCPeerConnection, call: LinkId) {
        let events = self.events.clone();
        let seen = AtomicBool::new(false);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if !seen.swap(true, Ordering::AcqRel) {
                let stream = RemoteStream {
                    id: track.stream_id().to_string(),
                };
                info!("Remote stream {} on {}", stream.id, call);
                if events.send(SessionEvent::RemoteStream { call, stream }).is_err() {
                    debug!("Session queue closed, remote stream dropped");
                }
            }
            Box::pin(async {})
        }));
    }

    fn sink_for(
        &self,
        link: LinkId,
        track: &MediaTrack,
        stream_id: &str,
    ) -> Arc<TrackLocalStaticSample> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            stream_id.to_owned(),
        ));
        lock(&self.sinks).insert(track.id(), (link, sample.clone()));
        sample
    }

    /// Добавляет треки потока; возвращает отправителя видео для подмены
    async fn add_stream(
        &self,
        pc: &RTCPeerConnection,
        link: LinkId,
        stream: &LocalStream,
        stream_id: &str,
    ) -> Result<Option<Arc<RTCRtpSender>>, TransportError> {
        let mut video = None;
        for track in stream.tracks() {
            let sample = self.sink_for(link, track, stream_id);
            let sender = pc
                .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            if track.kind() == TrackKind::Video {
                video = Some(sender);
            }
        }
        Ok(video)
    }

    /// Offer или answer целиком, после сбора кандидатов (без trickle)
    async fn publish(
        &self,
        pc: &RTCPeerConnection,
        remote: &str,
        kind: SignalKind,
        id: &str,
        offer: bool,
    ) -> Result<(), TransportError> {
        let desc = if offer {
            pc.create_offer(None).await?
        } else {
            pc.create_answer(None).await?
        };
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(desc).await?;
        if timeout(self.gather_timeout, gathered.recv()).await.is_err() {
            warn!(
                "ICE gathering for {} not finished in {:?}, sending partial candidates",
                id, self.gather_timeout
            );
        }

        let sdp = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Signaling("no local description".into()))?;
        let payload = encode_payload(&SdpPayload {
            sdp,
            id: id.to_owned(),
            ts: chrono::Utc::now().timestamp(),
        })
        .map_err(|e| TransportError::Signaling(e.to_string()))?;

        debug!("Sending {:?} {} to {}", kind, if offer { "offer" } else { "answer" }, remote);
        self.signaling.send(Signal {
            from: self.local_id.clone(),
            to: remote.to_owned(),
            kind,
            payload,
        })
    }

    async fn accept_offer(
        self: &Arc<Self>,
        from: String,
        kind: SignalKind,
        payload: SdpPayload,
    ) -> Result<(), TransportError> {
        let core = LinkCore::new(Arc::downgrade(self), &from);
        let pc = self.new_peer(kind, core.id).await?;
        core.attach(pc.clone());
        info!("Incoming {:?} offer {} from {} as {}", kind, payload.id, from, core.id);

        match kind {
            SignalKind::Data => {
                let link = RtcDataLink::new(core.clone());
                let state = link.state.clone();
                let events = self.events.clone();
                let id = core.id;
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    wire_channel(dc, id, state.clone(), events.clone());
                    Box::pin(async {})
                }));
                pc.set_remote_description(payload.sdp).await?;
                self.emit(SessionEvent::IncomingData {
                    from: from.clone(),
                    link: Box::new(link),
                });
                self.publish(&pc, &from, kind, &payload.id, false).await
            }
            SignalKind::Call => {
                self.watch_remote(&pc, core.id);
                pc.set_remote_description(payload.sdp).await?;
                let call = RtcCallLink::new(core, self.clone(), payload.id.clone(), Some(payload.id));
                self.emit(SessionEvent::IncomingCall {
                    from,
                    call: Box::new(call),
                });
                Ok(())
            }
        }
    }
}

/// Транспорт поверх webrtc: один RTCPeerConnection на звонок и на data-соединение
#[derive(Clone)]
pub struct RtcTransport {
    shared: Arc<Shared>,
}

impl RtcTransport {
    pub fn new(
        config: &SessionConfig,
        signaling: Arc<dyn SignalingChannel>,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Self, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let local_id = random_id();
        info!(
            "Transport ready as {} with {} ICE server(s)",
            local_id,
            config.ice_servers.len()
        );
        let shared = Arc::new(Shared {
            local_id: local_id.clone(),
            api,
            rtc: rtc_config(&config.ice_servers),
            label: config.data_channel_label.clone(),
            gather_timeout: config.gather_timeout(),
            signaling,
            events,
            awaiting_answer: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        });
        shared.emit(SessionEvent::TransportOpened { local_id });
        Ok(Self { shared })
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    /// Приёмник сэмплов для локального трека, если он уже в звонке
    pub fn sample_sink(&self, track: TrackId) -> Option<Arc<TrackLocalStaticSample>> {
        lock(&self.shared.sinks)
            .get(&track)
            .map(|(_, sample)| sample.clone())
    }

    /// Сигнал от брокера: offer создаёт входящий хэндл, answer завершает наш offer
    pub async fn handle_signal(&self, signal: Signal) -> Result<(), TransportError> {
        let payload =
            decode_payload(&signal.payload).map_err(|e| TransportError::Signaling(e.to_string()))?;
        match payload.sdp.sdp_type {
            RTCSdpType::Offer => {
                self.shared
                    .accept_offer(signal.from, signal.kind, payload)
                    .await
            }
            RTCSdpType::Answer => {
                let pc = lock(&self.shared.awaiting_answer).remove(&payload.id);
                match pc {
                    Some((_, pc)) => {
                        debug!("Answer for {} from {}", payload.id, signal.from);
                        pc.set_remote_description(payload.sdp).await?;
                        Ok(())
                    }
                    None => {
                        debug!("Answer for unknown connection {}", payload.id);
                        Ok(())
                    }
                }
            }
            other => Err(TransportError::Signaling(format!(
                "unexpected {:?} description",
                other
            ))),
        }
    }
}

impl PeerTransport for RtcTransport {
    fn call(
        &mut self,
        remote: &str,
        stream: &LocalStream,
    ) -> Result<Box<dyn CallLink>, TransportError> {
        let core = LinkCore::new(Arc::downgrade(&self.shared), remote);
        let id = random_id();
        let call = RtcCallLink::new(core.clone(), self.shared.clone(), id.clone(), None);
        let video = call.video_sender.clone();
        let shared = self.shared.clone();
        let stream = stream.clone();

        tokio::spawn(async move {
            let res: Result<(), TransportError> = async {
                let pc = shared.new_peer(SignalKind::Call, core.id).await?;
                shared.watch_remote(&pc, core.id);
                let sender = shared.add_stream(&pc, core.id, &stream, &id).await?;
                *lock(&video) = sender;
                lock(&shared.awaiting_answer).insert(id.clone(), (core.id, pc.clone()));
                if !core.attach(pc.clone()) {
                    return Ok(());
                }
                shared.publish(&pc, &core.peer, SignalKind::Call, &id, true).await
            }
            .await;
            if let Err(e) = res {
                warn!("Call {} to {} failed: {}", core.id, core.peer, e);
                shared.forget(core.id);
                shared.emit(SessionEvent::CallClosed { call: core.id });
            }
        });
        Ok(Box::new(call))
    }

    fn connect(&mut self, remote: &str) -> Result<Box<dyn DataLink>, TransportError> {
        let core = LinkCore::new(Arc::downgrade(&self.shared), remote);
        let link = RtcDataLink::new(core.clone());
        let state = link.state.clone();
        let shared = self.shared.clone();
        let id = random_id();

        tokio::spawn(async move {
            let res: Result<(), TransportError> = async {
                let pc = shared.new_peer(SignalKind::Data, core.id).await?;
                let dc = pc
                    .create_data_channel(&shared.label, Some(RTCDataChannelInit::default()))
                    .await?;
                wire_channel(dc, core.id, state, shared.events.clone());
                lock(&shared.awaiting_answer).insert(id.clone(), (core.id, pc.clone()));
                if !core.attach(pc.clone()) {
                    return Ok(());
                }
                shared.publish(&pc, &core.peer, SignalKind::Data, &id, true).await
            }
            .await;
            if let Err(e) = res {
                warn!("Data connection {} to {} failed: {}", core.id, core.peer, e);
                shared.forget(core.id);
                shared.emit(SessionEvent::DataClosed { link: core.id });
            }
        });
        Ok(Box::new(link))
    }
}

/// Общая часть хэндлов: peer connection появляется асинхронно
struct LinkCore {
    id: LinkId,
    peer: String,
    shared: Weak<Shared>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    closed: AtomicBool,
}

impl LinkCore {
    fn new(shared: Weak<Shared>, peer: &str) -> Arc<Self> {
        Arc::new(Self {
            id: LinkId::next(),
            peer: peer.to_owned(),
            shared,
            pc: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn forget(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(self.id);
        }
    }

    fn pc(&self) -> Option<Arc<RTCPeerConnection>> {
        lock(&self.pc).clone()
    }

    /// false, если хэндл закрыли раньше, чем соединение было создано
    fn attach(&self, pc: Arc<RTCPeerConnection>) -> bool {
        let mut slot = lock(&self.pc);
        if self.is_closed() {
            drop(slot);
            close_pc(self.id, pc);
            self.forget();
            return false;
        }
        *slot = Some(pc);
        true
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pc = lock(&self.pc).take();
        if let Some(pc) = pc {
            close_pc(self.id, pc);
        }
        self.forget();
    }
}

fn close_pc(link: LinkId, pc: Arc<RTCPeerConnection>) {
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            warn!("Closing {} failed: {}", link, e);
        }
    });
}

pub struct RtcCallLink {
    core: Arc<LinkCore>,
    shared: Arc<Shared>,
    stream_id: String,
    /// id offer собеседника; есть только у входящих и до ответа
    offer_id: Option<String>,
    video_sender: Arc<Mutex<Option<Arc<RTCRtpSender>>>>,
}

impl RtcCallLink {
    fn new(
        core: Arc<LinkCore>,
        shared: Arc<Shared>,
        stream_id: String,
        offer_id: Option<String>,
    ) -> Self {
        Self {
            core,
            shared,
            stream_id,
            offer_id,
            video_sender: Arc::new(Mutex::new(None)),
        }
    }
}

impl CallLink for RtcCallLink {
    fn id(&self) -> LinkId {
        self.core.id
    }

    fn peer(&self) -> &str {
        &self.core.peer
    }

    fn answer(&mut self, stream: &LocalStream) -> Result<(), TransportError> {
        let offer_id = self
            .offer_id
            .take()
            .ok_or_else(|| TransportError::Signaling("no pending offer to answer".into()))?;
        let pc = self.core.pc().ok_or(TransportError::Closed)?;
        let core = self.core.clone();
        let shared = self.shared.clone();
        let video = self.video_sender.clone();
        let stream = stream.clone();

        tokio::spawn(async move {
            let res: Result<(), TransportError> = async {
                let sender = shared.add_stream(&pc, core.id, &stream, &offer_id).await?;
                if core.is_closed() {
                    core.forget();
                    return Ok(());
                }
                *lock(&video) = sender;
                shared
                    .publish(&pc, &core.peer, SignalKind::Call, &offer_id, false)
                    .await
            }
            .await;
            if let Err(e) = res {
                warn!("Answer on {} failed: {}", core.id, e);
                shared.emit(SessionEvent::CallClosed { call: core.id });
            }
        });
        Ok(())
    }

    /// replace_track: без пересогласования, собеседник видит новый источник
    fn replace_video_track(&mut self, track: &MediaTrack) -> Result<(), TransportError> {
        if self.core.is_closed() {
            return Err(TransportError::Closed);
        }
        let sender = lock(&self.video_sender).clone().ok_or(TransportError::NotOpen)?;
        let sample = self.shared.sink_for(self.core.id, track, &self.stream_id);
        let link = self.core.id;
        let track_id = track.id();
        tokio::spawn(async move {
            match sender
                .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
                .await
            {
                Ok(()) => debug!("{} now sends {}", link, track_id),
                Err(e) => warn!("Replacing video on {} failed: {}", link, e),
            }
        });
        Ok(())
    }

    fn close(&mut self) {
        self.core.close();
    }
}

struct DataState {
    open: AtomicBool,
    /// Забирается писателем, когда канал появится
    outbox: Mutex<Option<UnboundedReceiver<String>>>,
}

pub struct RtcDataLink {
    core: Arc<LinkCore>,
    state: Arc<DataState>,
    outbox: UnboundedSender<String>,
}

impl RtcDataLink {
    fn new(core: Arc<LinkCore>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            core,
            state: Arc::new(DataState {
                open: AtomicBool::new(false),
                outbox: Mutex::new(Some(rx)),
            }),
            outbox: tx,
        }
    }
}

impl DataLink for RtcDataLink {
    fn id(&self) -> LinkId {
        self.core.id
    }

    fn peer(&self) -> &str {
        &self.core.peer
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    fn send(&mut self, payload: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(TransportError::TooLarge {
                size: payload.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }
        self.outbox.send(payload).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.state.open.store(false, Ordering::Release);
        self.core.close();
    }

    fn max_message_bytes(&self) -> Option<usize> {
        Some(MAX_MESSAGE_BYTES)
    }
}

/// События канала переводятся в SessionEvent; отправка идёт одной задачей по порядку
fn wire_channel(
    dc: Arc<RTCDataChannel>,
    link: LinkId,
    state: Arc<DataState>,
    events: UnboundedSender<SessionEvent>,
) {
    let open_state = state.clone();
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        info!("Data channel {} open", link);
        open_state.open.store(true, Ordering::Release);
        if open_events.send(SessionEvent::DataOpen { link }).is_err() {
            debug!("Session queue closed, open of {} dropped", link);
        }
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if !msg.is_string {
            debug!("Binary message on {} ignored ({} bytes)", link, msg.data.len());
        } else {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(payload) => {
                    if message_events
                        .send(SessionEvent::Data { link, payload })
                        .is_err()
                    {
                        debug!("Session queue closed, message on {} dropped", link);
                    }
                }
                Err(e) => warn!("Non-UTF-8 text on {}: {}", link, e),
            }
        }
        Box::pin(async {})
    }));

    let close_state = state.clone();
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        info!("Data channel {} closed", link);
        close_state.open.store(false, Ordering::Release);
        if close_events.send(SessionEvent::DataClosed { link }).is_err() {
            debug!("Session queue closed, close of {} dropped", link);
        }
        Box::pin(async {})
    }));

    let Some(outbox) = lock(&state.outbox).take() else {
        warn!("Data channel {} wired twice", link);
        return;
    };
    tokio::spawn(async move {
        let writer = dc.clone();
        let drained = drain_outbox(link, outbox, events, move |text| {
            let dc = writer.clone();
            async move {
                dc.send_text(text)
                    .await
                    .map(|_| ())
                    .map_err(TransportError::from)
            }
        })
        .await;
        if !drained {
            state.open.store(false, Ordering::Release);
            if let Err(e) = dc.close().await {
                warn!("Closing data channel {} failed: {}", link, e);
            }
        }
    });
}

/// Пишет исходящие строго по порядку. Первая неудачная запись делает канал
/// мёртвым для сессии: очередь закрывается и контроллер получает DataClosed.
/// false, если запись оборвалась ошибкой
async fn drain_outbox<F, Fut>(
    link: LinkId,
    mut outbox: UnboundedReceiver<String>,
    events: UnboundedSender<SessionEvent>,
    mut send: F,
) -> bool
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    while let Some(text) = outbox.recv().await {
        let size = text.len();
        if let Err(e) = send(text).await {
            warn!("Send of {} bytes on {} failed, dropping channel: {}", size, link, e);
            outbox.close();
            if events.send(SessionEvent::DataClosed { link }).is_err() {
                debug!("Session queue closed, failure of {} dropped", link);
            }
            return false;
        }
    }
    true
}
