use crate::peer::data_channel::DataChannelProtocol;
use crate::transport::{CallLink, DataLink, LinkId};
use serde::Serialize;

/// Состояние единственной сессии процесса
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Incoming,
    Connecting,
    Active,
}

/// Кто начал звонок
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Data-соединение от собеседника, пришедшее до перехода в Active
pub(crate) struct ParkedLink {
    pub link: Box<dyn DataLink>,
    pub inbox: Vec<String>,
}

/// Единственная сессия; меняется только через SessionController
pub struct PeerSession {
    pub(crate) local_id: Option<String>,
    pub(crate) remote_id: Option<String>,
    pub(crate) state: SessionState,
    pub(crate) role: Option<Role>,
    pub(crate) busy: bool,
    pub(crate) call: Option<Box<dyn CallLink>>,
    pub(crate) data: Option<DataChannelProtocol>,
    pub(crate) parked: Option<ParkedLink>,
    /// Лишние входящие линки от того же собеседника: только приём
    pub(crate) secondary: Vec<Box<dyn DataLink>>,
}

impl PeerSession {
    pub(crate) fn new() -> Self {
        Self {
            local_id: None,
            remote_id: None,
            state: SessionState::Idle,
            role: None,
            busy: false,
            call: None,
            data: None,
            parked: None,
            secondary: Vec::new(),
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn has_data_channel(&self) -> bool {
        self.data.is_some()
    }

    pub(crate) fn is_active_peer(&self, peer: &str) -> bool {
        self.remote_id.as_deref() == Some(peer)
    }

    pub(crate) fn call_id(&self) -> Option<LinkId> {
        self.call.as_ref().map(|c| c.id())
    }

    pub(crate) fn data_id(&self) -> Option<LinkId> {
        self.data.as_ref().map(|d| d.link_id())
    }
}
