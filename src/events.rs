use crate::error::MediaError;
use crate::media::{LocalStream, MediaPurpose, MediaTicket, TrackId};
use crate::session::SessionState;
use crate::transport::{CallLink, DataLink, LinkId};
use std::fmt;

/// Удалённый медиапоток, который UI показывает в главном окне
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

/// Входящие события: всё асинхронное возвращается в контроллер только так
pub enum SessionEvent {
    TransportOpened {
        local_id: String,
    },
    IncomingCall {
        from: String,
        call: Box<dyn CallLink>,
    },
    IncomingData {
        from: String,
        link: Box<dyn DataLink>,
    },
    RemoteStream {
        call: LinkId,
        stream: RemoteStream,
    },
    CallClosed {
        call: LinkId,
    },
    DataOpen {
        link: LinkId,
    },
    Data {
        link: LinkId,
        payload: String,
    },
    DataClosed {
        link: LinkId,
    },
    MediaReady {
        ticket: MediaTicket,
        result: Result<LocalStream, MediaError>,
    },
    TrackEnded {
        track: TrackId,
    },
    BusyGraceElapsed {
        link: LinkId,
    },
    /// Отклонённый линк так и не открылся
    BusyOpenTimeout {
        link: LinkId,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::TransportOpened { local_id } => {
                write!(f, "TransportOpened({local_id})")
            }
            SessionEvent::IncomingCall { from, call } => {
                write!(f, "IncomingCall({from}, {})", call.id())
            }
            SessionEvent::IncomingData { from, link } => {
                write!(f, "IncomingData({from}, {})", link.id())
            }
            SessionEvent::RemoteStream { call, stream } => {
                write!(f, "RemoteStream({call}, {})", stream.id)
            }
            SessionEvent::CallClosed { call } => write!(f, "CallClosed({call})"),
            SessionEvent::DataOpen { link } => write!(f, "DataOpen({link})"),
            SessionEvent::Data { link, payload } => {
                write!(f, "Data({link}, {} bytes)", payload.len())
            }
            SessionEvent::DataClosed { link } => write!(f, "DataClosed({link})"),
            SessionEvent::MediaReady { ticket, result } => match result {
                Ok(stream) => write!(f, "MediaReady({ticket:?}, {} tracks)", stream.tracks().len()),
                Err(err) => write!(f, "MediaReady({ticket:?}, {err})"),
            },
            SessionEvent::TrackEnded { track } => write!(f, "TrackEnded({track})"),
            SessionEvent::BusyGraceElapsed { link } => write!(f, "BusyGraceElapsed({link})"),
            SessionEvent::BusyOpenTimeout { link } => write!(f, "BusyOpenTimeout({link})"),
        }
    }
}

/// Почему сессия вернулась в Idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Local,
    Rejected,
    PeerBusy,
    RemoteClosed,
    MediaDenied,
    TransportFailure(String),
}

/// Исходящие уведомления для слоя представления
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Ready { local_id: String },
    StateChanged(SessionState),
    IncomingCall { from: String },
    AdmissionRejected { from: String },
    LocalPreview(Option<LocalStream>),
    RemoteStream(Option<RemoteStream>),
    PeerBusy { peer: String },
    FileReceived { name: String, size: usize },
    MediaDenied { purpose: MediaPurpose, reason: String },
    Ended { reason: EndReason },
}
