//! Vote ingestion: consistency guard and submission service
//!
//! The guard owns the one-vote-per-user-per-poll invariant. The original
//! check-then-create pattern is collapsed into a single critical section
//! per (voter, poll) key: the existence check and the insert happen under
//! that key's lock, so of two racing submissions exactly one commits and
//! the other deterministically observes the committed vote. Submissions
//! for different (voter, poll) pairs never contend. The `votes` table's
//! unique index on (user_id, poll_id) backstops this at the storage layer.

use crate::orm::{poll_options, polls, users, votes};
use crate::results::{self, ResultSnapshot};
use crate::web::poll_ws::message::{NewVote, Publish, RoomEvent};
use crate::web::poll_ws::server::PollServer;
use actix::Addr;
use chrono::Utc;
use dashmap::DashMap;
use futures::lock::Mutex;
use sea_orm::{entity::*, query::*, ColumnTrait, DatabaseConnection, DbErr, EntityTrait};
use std::sync::Arc;

/// Why a submission was refused. Expected outcomes of concurrent use, not
/// server faults.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteRejection {
    PollNotFound,
    OptionNotFound,
    UserNotFound,
    PollNotPublished,
    /// Carries the earlier vote's option so the client can self-correct.
    AlreadyVoted {
        option_id: i32,
        option_text: String,
    },
}

#[derive(Debug)]
pub enum SubmitError {
    Rejected(VoteRejection),
    Database(DbErr),
}

impl From<DbErr> for SubmitError {
    fn from(err: DbErr) -> Self {
        SubmitError::Database(err)
    }
}

/// A committed vote and the snapshot computed right after it.
#[derive(Debug)]
pub struct VoteAccepted {
    pub vote: votes::Model,
    pub snapshot: ResultSnapshot,
}

enum GuardVerdict {
    Accepted(votes::Model),
    AlreadyVoted { existing: votes::Model },
}

/// Serializes vote commits per (voter, poll) key.
#[derive(Default)]
pub struct VoteGuard {
    locks: DashMap<(i32, i32), Arc<Mutex<()>>>,
}

impl VoteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, voter_id: i32, poll_id: i32) -> Arc<Mutex<()>> {
        self.locks
            .entry((voter_id, poll_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomic test-and-set for the uniqueness invariant.
    ///
    /// Rejection performs no writes; there is no partially-applied state
    /// for other operations to observe.
    async fn try_record_vote(
        &self,
        db: &DatabaseConnection,
        voter_id: i32,
        poll_id: i32,
        option_id: i32,
    ) -> Result<GuardVerdict, DbErr> {
        let lock = self.lock_for(voter_id, poll_id);
        let verdict = Self::commit_vote(db, &lock, voter_id, poll_id, option_id).await;

        // At two strong refs only the map entry and this call hold the
        // lock: no waiter loses its clone if the entry goes. Keeps the
        // lock map from growing with every distinct (voter, poll) pair.
        self.locks
            .remove_if(&(voter_id, poll_id), |_, mutex| {
                Arc::strong_count(mutex) <= 2
            });

        verdict
    }

    /// The critical section proper: check and insert under the key's lock.
    async fn commit_vote(
        db: &DatabaseConnection,
        lock: &Mutex<()>,
        voter_id: i32,
        poll_id: i32,
        option_id: i32,
    ) -> Result<GuardVerdict, DbErr> {
        let _held = lock.lock().await;

        if let Some(existing) = votes::Entity::find()
            .filter(votes::Column::UserId.eq(voter_id))
            .filter(votes::Column::PollId.eq(poll_id))
            .one(db)
            .await?
        {
            return Ok(GuardVerdict::AlreadyVoted { existing });
        }

        let created_at = Utc::now().naive_utc();
        let insert = votes::Entity::insert(votes::ActiveModel {
            user_id: Set(voter_id),
            poll_id: Set(poll_id),
            option_id: Set(option_id),
            created_at: Set(created_at),
            ..Default::default()
        })
        .exec(db)
        .await?;

        Ok(GuardVerdict::Accepted(votes::Model {
            id: insert.last_insert_id,
            user_id: voter_id,
            poll_id,
            option_id,
            created_at,
        }))
    }
}

/// Orchestrates one vote submission end to end.
///
/// Holds its broadcast handle explicitly; nothing here reaches into
/// ambient process state.
pub struct VoteService {
    db: Arc<DatabaseConnection>,
    guard: VoteGuard,
    dispatcher: Addr<PollServer>,
}

impl VoteService {
    pub fn new(db: impl Into<Arc<DatabaseConnection>>, dispatcher: Addr<PollServer>) -> Self {
        Self {
            db: db.into(),
            guard: VoteGuard::new(),
            dispatcher,
        }
    }

    /// Validate, commit and announce one vote.
    ///
    /// On success the fan-out is fire-and-forget: the caller's response
    /// never waits on delivery, and an empty room is not an error.
    pub async fn submit_vote(
        &self,
        voter_id: i32,
        option_id: i32,
    ) -> Result<VoteAccepted, SubmitError> {
        let option = poll_options::Entity::find_by_id(option_id)
            .one(&*self.db)
            .await?
            .ok_or(SubmitError::Rejected(VoteRejection::OptionNotFound))?;

        let poll = polls::Entity::find_by_id(option.poll_id)
            .one(&*self.db)
            .await?
            .ok_or(SubmitError::Rejected(VoteRejection::PollNotFound))?;

        if !poll.is_published {
            return Err(SubmitError::Rejected(VoteRejection::PollNotPublished));
        }

        let voter = users::Entity::find_by_id(voter_id)
            .one(&*self.db)
            .await?
            .ok_or(SubmitError::Rejected(VoteRejection::UserNotFound))?;

        match self
            .guard
            .try_record_vote(&self.db, voter_id, poll.id, option.id)
            .await?
        {
            GuardVerdict::AlreadyVoted { existing } => {
                let option_text = if existing.option_id == option.id {
                    option.option_text
                } else {
                    poll_options::Entity::find_by_id(existing.option_id)
                        .one(&*self.db)
                        .await?
                        .map(|o| o.option_text)
                        .unwrap_or_default()
                };

                Err(SubmitError::Rejected(VoteRejection::AlreadyVoted {
                    option_id: existing.option_id,
                    option_text,
                }))
            }
            GuardVerdict::Accepted(vote) => {
                let snapshot = results::compute_results(&self.db, poll.id)
                    .await?
                    .ok_or_else(|| {
                        SubmitError::Database(DbErr::Custom(
                            "poll disappeared during aggregation".to_string(),
                        ))
                    })?;

                self.dispatcher.do_send(Publish {
                    poll_id: poll.id,
                    event: RoomEvent::VoteRecorded {
                        snapshot: snapshot.clone(),
                        new_vote: NewVote {
                            option_id: option.id,
                            option_text: option.option_text,
                            voter_name: voter.name,
                            timestamp: vote.created_at,
                        },
                    },
                });

                Ok(VoteAccepted { vote, snapshot })
            }
        }
    }

    /// Basic removal hook: delete a vote by id. Returns rows removed.
    pub async fn remove_vote(&self, vote_id: i32) -> Result<u64, DbErr> {
        let res = votes::Entity::delete_many()
            .filter(votes::Column::Id.eq(vote_id))
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected)
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}
