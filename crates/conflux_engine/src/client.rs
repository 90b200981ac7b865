//! The client actor: one thread per member.
//!
//! A client owns no shared state. It translates engine commands into
//! [`Member`] calls on its own thread and sends each outcome back as a
//! reply message; changes the member reports stream to the engine as
//! individual `NewChange` messages before the reply.

use crate::error::EngineError;
use crate::member::{ChangeSink, Member, MemberHandle};
use crate::msg::{ClientMsg, ClientOp, EngineMsg, ReplyBody};
use crate::queue::{CallId, EventLoop, Polled, QueueSender};
use conflux_protocol::{Change, MemberId};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Streams reported changes to the engine as they arrive.
struct ReportSink {
    member: MemberId,
    engine: QueueSender<EngineMsg>,
}

impl ChangeSink for ReportSink {
    fn report(&mut self, change: Change) {
        self.engine.send(EngineMsg::NewChange {
            member: self.member,
            change,
        });
    }
}

pub(crate) struct ClientActor {
    member_id: MemberId,
    name: String,
    member: Box<dyn Member>,
    engine: QueueSender<EngineMsg>,
    lp: EventLoop<ClientMsg>,
}

impl ClientActor {
    /// Spawns the actor thread; returns the command queue and the handle.
    pub(crate) fn spawn(
        member_id: MemberId,
        name: String,
        member: Box<dyn Member>,
        engine: QueueSender<EngineMsg>,
    ) -> std::io::Result<(QueueSender<ClientMsg>, JoinHandle<()>)> {
        let lp = EventLoop::new();
        let tx = lp.sender();
        let thread_name = format!("conflux-client-{name}");
        let actor = ClientActor {
            member_id,
            name,
            member,
            engine,
            lp,
        };
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || actor.run())?;
        Ok((tx, handle))
    }

    fn run(mut self) {
        self.member
            .attach(MemberHandle::new(self.member_id, self.engine.clone()));
        loop {
            match self.lp.next() {
                Polled::Message(ClientMsg::Command { call, op }) => self.execute(call, op),
                Polled::Message(ClientMsg::Shutdown) | Polled::Closed => break,
            }
        }
        debug!(member = %self.member_id, name = %self.name, "client actor stopped");
    }

    fn execute(&mut self, call: CallId, op: ClientOp) {
        let member = self.member_id;
        debug!(%member, ?op, "executing command");
        let result = match op {
            ClientOp::Connect => self
                .member
                .connect()
                .map(|()| ReplyBody::Done)
                .map_err(|e| EngineError::connect(member, flatten(e))),
            ClientOp::GetChanges {
                with_data,
                slow_sync,
            } => {
                let mut sink = ReportSink {
                    member,
                    engine: self.engine.clone(),
                };
                self.member
                    .get_changes(with_data, slow_sync, &mut sink)
                    .map(|()| ReplyBody::Done)
                    .map_err(|e| EngineError::read(member, flatten(e)))
            }
            ClientOp::GetData { change } => self
                .member
                .get_change_data(&change)
                .map(ReplyBody::Data)
                .map_err(|e| EngineError::read(member, flatten(e))),
            ClientOp::Commit { change } => self
                .member
                .commit_change(&change)
                .map(|()| ReplyBody::Done)
                .map_err(|e| EngineError::write(member, flatten(e))),
            ClientOp::SyncDone => self
                .member
                .sync_done()
                .map(|()| ReplyBody::Done)
                .map_err(|e| EngineError::sync_done(member, flatten(e))),
            ClientOp::Disconnect => self
                .member
                .disconnect()
                .map(|()| ReplyBody::Done)
                .map_err(|e| EngineError::disconnect(member, flatten(e))),
        };
        self.engine.send(EngineMsg::Reply {
            member,
            call,
            result,
        });
    }
}

/// Unwraps generic member errors so the phase wrapper does not stack
/// prefixes.
fn flatten(e: EngineError) -> String {
    match e {
        EngineError::Generic(message) => message,
        other => other.to_string(),
    }
}
