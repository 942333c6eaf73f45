//! WebSocket connection actor for poll watchers
//!
//! The actor only moves frames: it parses client commands and forwards
//! them to the `PollServer`. Which poll (if any) this connection watches
//! is state the registry owns, keyed by the connection id. Nothing here
//! tracks it.

use super::message::{ClientCommand, Connect, Disconnect, Join, Leave, Reply, ServerEvent};
use super::server::PollServer;
use crate::app_config::RealtimeConfig;
use actix::*;
use actix_web_actors::ws;
use std::time::{Duration, Instant};

/// Represents a single WebSocket connection watching polls
pub struct PollConnection {
    /// Connection ID (assigned by server)
    pub id: usize,
    /// Last heartbeat timestamp
    pub hb: Instant,
    /// Address of the poll server
    pub server: Addr<PollServer>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl PollConnection {
    pub fn new(server: Addr<PollServer>, realtime: &RealtimeConfig) -> Self {
        Self {
            id: 0,
            hb: Instant::now(),
            server,
            heartbeat_interval: realtime.heartbeat_interval(),
            client_timeout: realtime.client_timeout(),
        }
    }

    /// Start heartbeat process
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                log::debug!("Poll connection {} timed out", act.id);
                act.server.do_send(Disconnect { id: act.id });
                ctx.stop();
                return;
            }

            ctx.ping(b"");
        });
    }

    /// Register with server and start heartbeat
    fn start_connection(&self, ctx: &mut ws::WebsocketContext<Self>) {
        self.hb(ctx);

        self.server
            .send(Connect {
                addr: ctx.address().recipient(),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(id) => {
                        act.id = id;
                        log::debug!("Poll connection established: id={}", id);
                    }
                    Err(err) => {
                        log::warn!("Failed to register poll connection: {:?}", err);
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    /// Parse and dispatch one client frame.
    fn handle_command(&self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(ClientCommand::JoinPoll { poll_id, user_id }) => {
                self.server.do_send(Join {
                    id: self.id,
                    poll_id,
                    user_id,
                });
            }
            Ok(ClientCommand::LeavePoll) => {
                self.server.do_send(Leave { id: self.id });
            }
            Err(err) => {
                log::debug!("Connection {} sent unparseable command: {}", self.id, err);
                self.send_error(ctx, "Unrecognized command");
            }
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        let event = ServerEvent::Error {
            message: message.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&event) {
            ctx.text(json);
        }
    }
}

impl Actor for PollConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.start_connection(ctx);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        // Notify server of disconnect
        self.server.do_send(Disconnect { id: self.id });
        Running::Stop
    }
}

/// Handle events pushed from the poll server
impl Handler<Reply> for PollConnection {
    type Result = ();

    fn handle(&mut self, msg: Reply, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Handle incoming WebSocket messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PollConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Err(_) => {
                ctx.stop();
                return;
            }
            Ok(msg) => msg,
        };

        match msg {
            ws::Message::Ping(data) => {
                self.hb = Instant::now();
                ctx.pong(&data);
            }
            ws::Message::Pong(_) => {
                self.hb = Instant::now();
            }
            ws::Message::Text(text) => {
                self.hb = Instant::now();
                self.handle_command(text.trim(), ctx);
            }
            ws::Message::Binary(_) => {
                // Commands are JSON text only
            }
            ws::Message::Close(reason) => {
                log::debug!("Poll client disconnecting: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                ctx.stop();
            }
            ws::Message::Nop => (),
        }
    }
}
