//! Real-time poll result distribution over WebSocket
//!
//! ## Architecture
//!
//! - `PollServer` actor owns the poll-room registry and fans events out
//! - `PollConnection` actor handles an individual WebSocket connection
//! - The vote path publishes a `pollUpdate` whenever a vote commits
//!
//! Room membership lives only in process memory; a restart drops it and
//! clients are expected to re-join.

pub mod connection;
pub mod message;
pub mod server;

use actix::Addr;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

pub use server::PollServer;

pub(super) fn configure(conf: &mut web::ServiceConfig) {
    conf.service(poll_socket);
}

/// WebSocket endpoint for live poll results
///
/// GET /polls.ws
///
/// Clients send `joinPoll` / `leavePoll` commands and receive
/// `pollResults`, `pollUpdate`, `userJoined`, `userLeft` and `error`
/// events.
#[get("/polls.ws")]
pub async fn poll_socket(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<Addr<PollServer>>,
) -> Result<HttpResponse, Error> {
    let realtime = crate::app_config::realtime();

    ws::start(
        connection::PollConnection::new(server.get_ref().clone(), &realtime),
        &req,
        stream,
    )
}
