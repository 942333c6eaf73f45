//! Message types for the poll WebSocket system
//!
//! Actor messages exchanged between connections and the `PollServer`,
//! plus the JSON wire protocol spoken with clients.

use crate::results::ResultSnapshot;
use actix::prelude::*;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// New WebSocket connection registering with the server
pub struct Connect {
    /// Channel to send messages back to this connection
    pub addr: Recipient<Reply>,
}

impl Message for Connect {
    /// Returns connection ID
    type Result = usize;
}

/// Disconnect message
pub struct Disconnect {
    /// Connection ID
    pub id: usize,
}

impl Message for Disconnect {
    type Result = ();
}

/// A connection asks to watch a poll.
///
/// A connection watches at most one poll; joining while subscribed
/// elsewhere is leave-then-join.
pub struct Join {
    pub id: usize,
    pub poll_id: i32,
    pub user_id: Option<i32>,
}

impl Message for Join {
    type Result = ();
}

/// A connection stops watching its current poll. No-op if unsubscribed.
pub struct Leave {
    pub id: usize,
}

impl Message for Leave {
    type Result = ();
}

/// Broadcast an event to every current subscriber of a poll.
///
/// Zero subscribers is a normal outcome, not an error.
#[derive(Clone)]
pub struct Publish {
    pub poll_id: i32,
    pub event: RoomEvent,
}

impl Message for Publish {
    type Result = ();
}

/// Drop registry entries for polls with no subscribers left.
pub struct SweepRooms;

impl Message for SweepRooms {
    /// Returns number of rooms removed
    type Result = usize;
}

/// Current subscriber count for a poll, `None` if no registry entry exists
/// (for monitoring and tests)
pub struct RoomStatus {
    pub poll_id: i32,
}

impl Message for RoomStatus {
    type Result = Option<usize>;
}

/// Server -> client push message, already serialized
pub struct Reply(pub String);

impl Message for Reply {
    type Result = ();
}

/// Payload handed to the broadcast dispatcher by the vote path.
#[derive(Clone)]
pub enum RoomEvent {
    VoteRecorded {
        snapshot: ResultSnapshot,
        new_vote: NewVote,
    },
    ResultsOnly {
        snapshot: ResultSnapshot,
    },
}

/// Details of a freshly committed vote, attached to `pollUpdate` events.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVote {
    pub option_id: i32,
    pub option_text: String,
    pub voter_name: String,
    pub timestamp: NaiveDateTime,
}

/// Commands a client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "joinPoll")]
    JoinPoll {
        #[serde(rename = "pollId")]
        poll_id: i32,
        #[serde(rename = "userId", default)]
        user_id: Option<i32>,
    },
    #[serde(rename = "leavePoll")]
    LeavePoll,
}

/// Events pushed to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "pollResults")]
    PollResults { results: ResultSnapshot },
    #[serde(rename = "pollUpdate")]
    PollUpdate {
        #[serde(rename = "pollId")]
        poll_id: i32,
        results: ResultSnapshot,
        #[serde(rename = "newVote")]
        new_vote: NewVote,
    },
    #[serde(rename = "userJoined")]
    UserJoined {
        #[serde(rename = "pollId")]
        poll_id: i32,
        #[serde(rename = "userId")]
        user_id: i32,
    },
    #[serde(rename = "userLeft")]
    UserLeft {
        #[serde(rename = "pollId")]
        poll_id: i32,
        #[serde(rename = "userId")]
        user_id: i32,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    /// Translate a dispatcher payload into its wire event.
    pub fn from_room_event(poll_id: i32, event: RoomEvent) -> Self {
        match event {
            RoomEvent::VoteRecorded { snapshot, new_vote } => ServerEvent::PollUpdate {
                poll_id,
                results: snapshot,
                new_vote,
            },
            RoomEvent::ResultsOnly { snapshot } => ServerEvent::PollResults { results: snapshot },
        }
    }
}
