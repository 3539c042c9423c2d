use super::{Command, SessionHandle, SessionSnapshot, COMMAND_QUEUE};
use crate::controller::SessionController;
use crate::events::SessionEvent;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Единственная задача, которая владеет контроллером
pub struct SessionDriver {
    controller: SessionController,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionDriver {
    pub fn new(
        controller: SessionController,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        (
            Self {
                controller,
                commands,
                events,
            },
            SessionHandle::new(tx),
        )
    }

    /// Работает, пока жив хоть один SessionHandle; на выходе сессия завершается
    pub async fn run(mut self) {
        info!("Session driver started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.execute(cmd),
                    None => break,
                },
                Some(event) = self.events.recv() => self.controller.handle(event),
            }
        }
        self.controller.end_call();
        info!("Session driver stopped");
    }

    fn execute(&mut self, cmd: Command) {
        let c = &mut self.controller;
        match cmd {
            Command::InitiateCall { remote, reply } => respond(reply, c.initiate_call(&remote)),
            Command::Accept { reply } => respond(reply, c.accept_incoming()),
            Command::Reject { reply } => respond(reply, c.reject_incoming()),
            Command::EndCall { reply } => {
                c.end_call();
                respond(reply, Ok(()));
            }
            Command::SendFile { file, reply } => respond(reply, c.send_file(file)),
            Command::SetPenColor { color, reply } => {
                c.set_pen_color(color);
                respond(reply, Ok(()));
            }
            Command::PointerDown { at, reply } => {
                c.pointer_down(at);
                respond(reply, Ok(()));
            }
            Command::PointerMove { to, reply } => {
                c.pointer_move(to);
                respond(reply, Ok(()));
            }
            Command::PointerUp { reply } => {
                c.pointer_up();
                respond(reply, Ok(()));
            }
            Command::ClearBoard { reply } => {
                c.clear_board();
                respond(reply, Ok(()));
            }
            Command::StartScreenShare { reply } => respond(reply, c.start_screen_share()),
            Command::StopScreenShare { reply } => respond(reply, c.stop_screen_share()),
            Command::Snapshot { reply } => {
                let session = c.session();
                let snapshot = SessionSnapshot {
                    state: session.state(),
                    local_id: session.local_id().map(str::to_owned),
                    remote_id: session.remote_id().map(str::to_owned),
                    busy: session.is_busy(),
                    sharing_screen: c.is_sharing_screen(),
                    received_files: c.received_files().len(),
                };
                respond(reply, Ok(snapshot));
            }
        }
    }
}

fn respond<T: Debug>(reply: oneshot::Sender<T>, value: T) {
    if let Err(value) = reply.send(value) {
        debug!("Caller went away before reply {:?}", value);
    }
}
