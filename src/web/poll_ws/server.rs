//! `PollServer` actor: the subscription registry and broadcast dispatcher
//!
//! Tracks which connections watch which poll ("rooms") and fans events out
//! to them. Room membership is keyed by connection identity here, never on
//! the transport actor. A recurring sweep drops entries for rooms that
//! emptied out. Correctness never depends on the sweep's timing; a poll
//! with no subscribers simply has no one to notify.

use super::message::{
    Connect, Disconnect, Join, Leave, Publish, Reply, RoomStatus, ServerEvent, SweepRooms,
};
use crate::results;
use actix::prelude::*;
use rand::{self, rngs::ThreadRng, Rng};
use sea_orm::DatabaseConnection;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Stored connection information
struct Subscriber {
    /// Channel to send messages to this connection
    recipient: Recipient<Reply>,
    /// User identity supplied on join, if any
    user_id: Option<i32>,
}

pub struct PollServer {
    rng: ThreadRng,
    db: Arc<DatabaseConnection>,
    sweep_interval: Duration,

    /// Random Id -> Subscriber
    connections: HashMap<usize, Subscriber>,
    /// Poll Id -> connection ids currently watching it
    rooms: HashMap<i32, HashSet<usize>>,
    /// Connection Id -> the poll it watches (at most one)
    conn_poll: HashMap<usize, i32>,
}

impl PollServer {
    pub fn new(db: impl Into<Arc<DatabaseConnection>>, sweep_interval: Duration) -> Self {
        log::info!("PollServer starting up.");
        Self {
            rng: rand::thread_rng(),
            db: db.into(),
            sweep_interval,
            connections: HashMap::new(),
            rooms: HashMap::new(),
            conn_poll: HashMap::new(),
        }
    }

    /// Send an event to a specific connection
    fn send_to_conn(&self, recipient: usize, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                log::error!("Failed to serialize server event: {}", err);
                return;
            }
        };

        if let Some(conn) = self.connections.get(&recipient) {
            conn.recipient.do_send(Reply(json));
        }
    }

    /// Send an event to every connection watching a poll.
    ///
    /// A member id without a live connection is logged and skipped; it
    /// never blocks delivery to the rest of the room.
    fn send_to_room(&self, poll_id: i32, event: &ServerEvent, except: Option<usize>) {
        let members = match self.rooms.get(&poll_id) {
            Some(members) => members,
            None => return,
        };

        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                log::error!("Failed to serialize server event: {}", err);
                return;
            }
        };

        for id in members {
            if except == Some(*id) {
                continue;
            }
            match self.connections.get(id) {
                Some(conn) => conn.recipient.do_send(Reply(json.clone())),
                None => log::debug!(
                    "Skipping delivery to stale connection {} in poll {}",
                    id,
                    poll_id
                ),
            }
        }
    }

    /// Detach a connection from its current poll, if any. Returns the poll
    /// it left. The room entry stays behind (possibly empty) for the sweep.
    fn leave_room(&mut self, id: usize) -> Option<i32> {
        let poll_id = self.conn_poll.remove(&id)?;
        if let Some(members) = self.rooms.get_mut(&poll_id) {
            members.remove(&id);
        }
        Some(poll_id)
    }

    /// Remove registry entries for rooms with no subscribers.
    fn sweep_rooms(&mut self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, members| !members.is_empty());
        let removed = before - self.rooms.len();
        if removed > 0 {
            log::debug!("Swept {} empty poll room(s)", removed);
        }
        removed
    }
}

impl Actor for PollServer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(64);
        ctx.run_interval(self.sweep_interval, |actor, _| {
            actor.sweep_rooms();
        });
    }
}

/// Handler for Connect message.
///
/// Register new connection and assign unique id to it
impl Handler<Connect> for PollServer {
    type Result = usize;

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) -> Self::Result {
        let mut id = self.rng.gen::<usize>();
        while self.connections.contains_key(&id) {
            id = self.rng.gen::<usize>();
        }

        self.connections.insert(
            id,
            Subscriber {
                recipient: msg.addr,
                user_id: None,
            },
        );

        log::debug!(
            "Connection {} registered (total connections: {})",
            id,
            self.connections.len()
        );
        id
    }
}

/// Handler for Disconnect message.
///
/// Equivalent to Leave, plus a departure notification to the poll's
/// remaining subscribers.
impl Handler<Disconnect> for PollServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        let user_id = self.connections.get(&msg.id).and_then(|c| c.user_id);

        if let Some(poll_id) = self.leave_room(msg.id) {
            if let Some(user_id) = user_id {
                self.send_to_room(poll_id, &ServerEvent::UserLeft { poll_id, user_id }, None);
            }
        }

        self.connections.remove(&msg.id);
        log::debug!(
            "Connection {} disconnected (total connections: {})",
            msg.id,
            self.connections.len()
        );
    }
}

/// Subscribe a connection to a poll's room.
///
/// Validates the poll and hands the joiner a fresh snapshot before the
/// room hears about it. Joining while subscribed elsewhere leaves the old
/// room first.
impl Handler<Join> for PollServer {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: Join, _: &mut Context<Self>) -> Self::Result {
        let db = self.db.clone();
        Box::pin(
            async move { results::compute_results(&db, msg.poll_id).await }
                .into_actor(self)
                .map(move |res, actor, _ctx| {
                    // Connection may have dropped while we were loading.
                    if !actor.connections.contains_key(&msg.id) {
                        return;
                    }

                    match res {
                        Ok(Some(snapshot)) => {
                            // Only now is the old subscription given up; a
                            // failed join must leave it intact.
                            actor.leave_room(msg.id);

                            if let Some(conn) = actor.connections.get_mut(&msg.id) {
                                conn.user_id = msg.user_id;
                            }
                            actor.rooms.entry(msg.poll_id).or_default().insert(msg.id);
                            actor.conn_poll.insert(msg.id, msg.poll_id);

                            actor.send_to_conn(
                                msg.id,
                                &ServerEvent::PollResults { results: snapshot },
                            );

                            if let Some(user_id) = msg.user_id {
                                actor.send_to_room(
                                    msg.poll_id,
                                    &ServerEvent::UserJoined {
                                        poll_id: msg.poll_id,
                                        user_id,
                                    },
                                    Some(msg.id),
                                );
                            }

                            log::debug!("Connection {} joined poll {}", msg.id, msg.poll_id);
                        }
                        Ok(None) => {
                            actor.send_to_conn(
                                msg.id,
                                &ServerEvent::Error {
                                    message: "Poll not found".to_string(),
                                },
                            );
                        }
                        Err(err) => {
                            log::warn!("Failed to load poll {} for join: {}", msg.poll_id, err);
                            actor.send_to_conn(
                                msg.id,
                                &ServerEvent::Error {
                                    message: "Failed to join poll".to_string(),
                                },
                            );
                        }
                    }
                }),
        )
    }
}

/// Handler for Leave message. No-op for unsubscribed connections.
impl Handler<Leave> for PollServer {
    type Result = ();

    fn handle(&mut self, msg: Leave, _: &mut Context<Self>) {
        if let Some(poll_id) = self.leave_room(msg.id) {
            log::debug!("Connection {} left poll {}", msg.id, poll_id);
        }
    }
}

/// Broadcast an event to a poll's room.
///
/// Events for one poll are dispatched in the order `Publish` messages
/// arrive, which is commit order on the vote path.
impl Handler<Publish> for PollServer {
    type Result = ();

    fn handle(&mut self, msg: Publish, _: &mut Context<Self>) {
        let event = ServerEvent::from_room_event(msg.poll_id, msg.event);
        self.send_to_room(msg.poll_id, &event, None);
    }
}

/// Handler for the periodic room sweep, also invocable directly.
impl Handler<SweepRooms> for PollServer {
    type Result = usize;

    fn handle(&mut self, _: SweepRooms, _: &mut Context<Self>) -> Self::Result {
        self.sweep_rooms()
    }
}

/// Subscriber count lookup (for monitoring and tests)
impl Handler<RoomStatus> for PollServer {
    type Result = Option<usize>;

    fn handle(&mut self, msg: RoomStatus, _: &mut Context<Self>) -> Self::Result {
        self.rooms.get(&msg.poll_id).map(|members| members.len())
    }
}

impl Supervised for PollServer {
    fn restarting(&mut self, _: &mut Context<PollServer>) {
        log::warn!("Restarting the PollServer.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::{poll_options, polls};
    use crate::results::ResultSnapshot;
    use crate::web::poll_ws::message::{NewVote, RoomEvent};
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase, Value};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// Collects everything the server pushes at a connection.
    struct Collector {
        events: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Reply> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Reply, _: &mut Context<Self>) {
            let value = serde_json::from_str(&msg.0).expect("server sent invalid JSON");
            self.events.lock().unwrap().push(value);
        }
    }

    /// Mailbox barrier: once this resolves, earlier Replies are processed.
    struct Flush;

    impl Message for Flush {
        type Result = ();
    }

    impl Handler<Flush> for Collector {
        type Result = ();

        fn handle(&mut self, _: Flush, _: &mut Context<Self>) {}
    }

    fn collector() -> (Addr<Collector>, Arc<Mutex<Vec<serde_json::Value>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector {
            events: events.clone(),
        }
        .start();
        (addr, events)
    }

    fn poll_fixture(id: i32) -> polls::Model {
        polls::Model {
            id,
            question: format!("Question {}", id),
            is_published: true,
            created_by: 1,
            created_at: Utc::now().naive_utc(),
        }
    }

    fn option_fixture(id: i32, poll_id: i32) -> poll_options::Model {
        poll_options::Model {
            id,
            poll_id,
            option_text: format!("Option {}", id),
        }
    }

    fn count_row(option_id: i32, votes: i64) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("option_id", Value::Int(Some(option_id))),
            ("votes", Value::BigInt(Some(votes))),
        ])
    }

    fn snapshot_fixture(poll_id: i32) -> ResultSnapshot {
        ResultSnapshot {
            poll_id,
            question: format!("Question {}", poll_id),
            total_votes: 1,
            options: Vec::new(),
            updated_at: Utc::now().naive_utc(),
        }
    }

    /// Mock with one poll lookup queued for a successful join.
    fn db_for_one_join(poll_id: i32) -> DatabaseConnection {
        MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results(vec![vec![poll_fixture(poll_id)]])
            .append_query_results(vec![vec![option_fixture(1, poll_id)]])
            .append_query_results(vec![vec![count_row(1, 1)]])
            .into_connection()
    }

    #[actix_rt::test]
    async fn join_delivers_current_snapshot_to_joiner() {
        let server = PollServer::new(db_for_one_join(1), Duration::from_secs(3600)).start();
        let (addr, events) = collector();

        let id = server
            .send(Connect {
                addr: addr.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id,
                poll_id: 1,
                user_id: Some(7),
            })
            .await
            .unwrap();
        addr.send(Flush).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "pollResults");
        assert_eq!(events[0]["results"]["pollId"], 1);
        assert_eq!(events[0]["results"]["totalVotes"], 1);
    }

    #[actix_rt::test]
    async fn join_unknown_poll_sends_error() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results(vec![Vec::<polls::Model>::new()])
            .into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();
        let (addr, events) = collector();

        let id = server
            .send(Connect {
                addr: addr.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id,
                poll_id: 404,
                user_id: None,
            })
            .await
            .unwrap();
        addr.send(Flush).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(
            server.send(RoomStatus { poll_id: 404 }).await.unwrap(),
            None
        );
    }

    #[actix_rt::test]
    async fn publish_reaches_room_members_only() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            // Two joins, two polls.
            .append_query_results(vec![vec![poll_fixture(1)]])
            .append_query_results(vec![vec![option_fixture(1, 1)]])
            .append_query_results(vec![vec![count_row(1, 1)]])
            .append_query_results(vec![vec![poll_fixture(2)]])
            .append_query_results(vec![vec![option_fixture(2, 2)]])
            .append_query_results(vec![vec![count_row(2, 1)]])
            .into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();
        let (watcher, watcher_events) = collector();
        let (bystander, bystander_events) = collector();

        let watcher_id = server
            .send(Connect {
                addr: watcher.clone().recipient(),
            })
            .await
            .unwrap();
        let bystander_id = server
            .send(Connect {
                addr: bystander.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id: watcher_id,
                poll_id: 1,
                user_id: None,
            })
            .await
            .unwrap();
        server
            .send(Join {
                id: bystander_id,
                poll_id: 2,
                user_id: None,
            })
            .await
            .unwrap();

        server
            .send(Publish {
                poll_id: 1,
                event: RoomEvent::VoteRecorded {
                    snapshot: snapshot_fixture(1),
                    new_vote: NewVote {
                        option_id: 1,
                        option_text: "Option 1".to_string(),
                        voter_name: "alice".to_string(),
                        timestamp: Utc::now().naive_utc(),
                    },
                },
            })
            .await
            .unwrap();
        watcher.send(Flush).await.unwrap();
        bystander.send(Flush).await.unwrap();

        let watcher_events = watcher_events.lock().unwrap();
        let updates: Vec<_> = watcher_events
            .iter()
            .filter(|e| e["type"] == "pollUpdate")
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["pollId"], 1);
        assert_eq!(updates[0]["newVote"]["voterName"], "alice");

        let bystander_events = bystander_events.lock().unwrap();
        assert!(bystander_events.iter().all(|e| e["type"] != "pollUpdate"));
    }

    #[actix_rt::test]
    async fn publish_with_no_subscribers_is_silent() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();

        // Must simply complete; zero subscribers is not an error.
        server
            .send(Publish {
                poll_id: 9,
                event: RoomEvent::ResultsOnly {
                    snapshot: snapshot_fixture(9),
                },
            })
            .await
            .unwrap();
    }

    #[actix_rt::test]
    async fn disconnect_notifies_room_and_sweep_removes_empty_entry() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results(vec![vec![poll_fixture(1)]])
            .append_query_results(vec![vec![option_fixture(1, 1)]])
            .append_query_results(vec![vec![count_row(1, 0)]])
            .append_query_results(vec![vec![poll_fixture(1)]])
            .append_query_results(vec![vec![option_fixture(1, 1)]])
            .append_query_results(vec![vec![count_row(1, 0)]])
            .append_query_results(vec![vec![poll_fixture(2)]])
            .append_query_results(vec![vec![option_fixture(2, 2)]])
            .append_query_results(vec![vec![count_row(2, 0)]])
            .into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();
        let (stayer, stayer_events) = collector();
        let (leaver, _leaver_events) = collector();
        let (other, _other_events) = collector();

        let stayer_id = server
            .send(Connect {
                addr: stayer.clone().recipient(),
            })
            .await
            .unwrap();
        let leaver_id = server
            .send(Connect {
                addr: leaver.clone().recipient(),
            })
            .await
            .unwrap();
        let other_id = server
            .send(Connect {
                addr: other.clone().recipient(),
            })
            .await
            .unwrap();

        server
            .send(Join {
                id: stayer_id,
                poll_id: 1,
                user_id: Some(1),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id: leaver_id,
                poll_id: 1,
                user_id: Some(2),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id: other_id,
                poll_id: 2,
                user_id: Some(3),
            })
            .await
            .unwrap();

        server.send(Disconnect { id: leaver_id }).await.unwrap();
        stayer.send(Flush).await.unwrap();

        {
            let events = stayer_events.lock().unwrap();
            let left: Vec<_> = events.iter().filter(|e| e["type"] == "userLeft").collect();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0]["userId"], 2);
        }

        // Room 1 still has the stayer; nothing to sweep yet.
        assert_eq!(server.send(SweepRooms).await.unwrap(), 0);

        server.send(Disconnect { id: stayer_id }).await.unwrap();
        assert_eq!(
            server.send(RoomStatus { poll_id: 1 }).await.unwrap(),
            Some(0)
        );

        assert_eq!(server.send(SweepRooms).await.unwrap(), 1);
        assert_eq!(server.send(RoomStatus { poll_id: 1 }).await.unwrap(), None);
        // Other poll's entry is untouched.
        assert_eq!(
            server.send(RoomStatus { poll_id: 2 }).await.unwrap(),
            Some(1)
        );
    }

    #[actix_rt::test]
    async fn failed_join_keeps_existing_subscription() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results(vec![vec![poll_fixture(1)]])
            .append_query_results(vec![vec![option_fixture(1, 1)]])
            .append_query_results(vec![vec![count_row(1, 0)]])
            // Second join targets a poll that does not exist.
            .append_query_results(vec![Vec::<polls::Model>::new()])
            .into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();
        let (addr, events) = collector();

        let id = server
            .send(Connect {
                addr: addr.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id,
                poll_id: 1,
                user_id: None,
            })
            .await
            .unwrap();
        server
            .send(Join {
                id,
                poll_id: 404,
                user_id: None,
            })
            .await
            .unwrap();
        addr.send(Flush).await.unwrap();

        // The bad join answered with an error but the connection still
        // watches poll 1.
        assert_eq!(
            server.send(RoomStatus { poll_id: 1 }).await.unwrap(),
            Some(1)
        );
        assert_eq!(server.send(RoomStatus { poll_id: 404 }).await.unwrap(), None);
        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap()["type"], "error");
    }

    #[actix_rt::test]
    async fn leave_is_noop_for_unsubscribed_connection() {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();
        let (addr, events) = collector();

        let id = server
            .send(Connect {
                addr: addr.clone().recipient(),
            })
            .await
            .unwrap();
        server.send(Leave { id }).await.unwrap();
        addr.send(Flush).await.unwrap();

        assert!(events.lock().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn switching_polls_is_leave_then_join() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results(vec![vec![poll_fixture(1)]])
            .append_query_results(vec![vec![option_fixture(1, 1)]])
            .append_query_results(vec![vec![count_row(1, 0)]])
            .append_query_results(vec![vec![poll_fixture(2)]])
            .append_query_results(vec![vec![option_fixture(2, 2)]])
            .append_query_results(vec![vec![count_row(2, 0)]])
            .into_connection();
        let server = PollServer::new(db, Duration::from_secs(3600)).start();
        let (addr, _events) = collector();

        let id = server
            .send(Connect {
                addr: addr.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Join {
                id,
                poll_id: 1,
                user_id: None,
            })
            .await
            .unwrap();
        server
            .send(Join {
                id,
                poll_id: 2,
                user_id: None,
            })
            .await
            .unwrap();

        assert_eq!(
            server.send(RoomStatus { poll_id: 1 }).await.unwrap(),
            Some(0)
        );
        assert_eq!(
            server.send(RoomStatus { poll_id: 2 }).await.unwrap(),
            Some(1)
        );
    }
}
