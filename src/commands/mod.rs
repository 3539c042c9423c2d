//! Команды от UI к задаче сессии и асинхронный фасад над ними.

mod driver;

pub use driver::SessionDriver;

use crate::error::{Result, SessionError};
use crate::file_relay::OutgoingFile;
use crate::session::SessionState;
use crate::whiteboard::Point;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Ёмкость очереди команд
pub const COMMAND_QUEUE: usize = 64;

pub type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Command {
    InitiateCall { remote: String, reply: Reply<()> },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    EndCall { reply: Reply<()> },
    SendFile { file: OutgoingFile, reply: Reply<()> },
    SetPenColor { color: String, reply: Reply<()> },
    PointerDown { at: Point, reply: Reply<()> },
    PointerMove { to: Point, reply: Reply<()> },
    PointerUp { reply: Reply<()> },
    ClearBoard { reply: Reply<()> },
    StartScreenShare { reply: Reply<()> },
    StopScreenShare { reply: Reply<()> },
    Snapshot { reply: Reply<SessionSnapshot> },
}

/// Состояние сессии для отображения
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub busy: bool,
    pub sharing_screen: bool,
    pub received_files: usize,
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::DriverClosed)?;
        rx.await.map_err(|_| SessionError::DriverClosed)?
    }

    pub async fn initiate_call(&self, remote: impl Into<String>) -> Result<()> {
        let remote = remote.into();
        self.request(|reply| Command::InitiateCall { remote, reply })
            .await
    }

    pub async fn accept_incoming(&self) -> Result<()> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_incoming(&self) -> Result<()> {
        self.request(|reply| Command::Reject { reply }).await
    }

    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn send_file(&self, file: OutgoingFile) -> Result<()> {
        self.request(|reply| Command::SendFile { file, reply }).await
    }

    pub async fn set_pen_color(&self, color: impl Into<String>) -> Result<()> {
        let color = color.into();
        self.request(|reply| Command::SetPenColor { color, reply })
            .await
    }

    pub async fn pointer_down(&self, at: Point) -> Result<()> {
        self.request(|reply| Command::PointerDown { at, reply }).await
    }

    pub async fn pointer_move(&self, to: Point) -> Result<()> {
        self.request(|reply| Command::PointerMove { to, reply }).await
    }

    pub async fn pointer_up(&self) -> Result<()> {
        self.request(|reply| Command::PointerUp { reply }).await
    }

    pub async fn clear_board(&self) -> Result<()> {
        self.request(|reply| Command::ClearBoard { reply }).await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}
