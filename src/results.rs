//! Poll result aggregation
//!
//! Turns a poll's vote tallies into a snapshot of counts and percentages.
//! Percentages are rounded half-up per option independently; with three
//! options at one vote each the snapshot reports 33/33/33, and the total
//! is allowed to miss 100. Consumers must not "fix" this by redistributing
//! the remainder.

use crate::orm::{poll_options, polls, votes};
use chrono::{NaiveDateTime, Utc};
use sea_orm::{
    entity::*, query::*, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, FromQueryResult,
    QueryFilter,
};
use serde::Serialize;
use std::collections::HashMap;

/// Point-in-time aggregation of a poll's votes.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    pub poll_id: i32,
    pub question: String,
    pub total_votes: i64,
    pub options: Vec<OptionResult>,
    pub updated_at: NaiveDateTime,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionResult {
    pub id: i32,
    pub text: String,
    pub votes: i64,
    pub percentage: i32,
}

/// Per-option tally row for the group-by query below.
#[derive(Debug, FromQueryResult)]
struct VoteCountRow {
    option_id: i32,
    votes: i64,
}

/// Compute current results for a poll, or `None` if the poll does not exist.
///
/// Pure read: no caching, no side effects. Options keep their declaration
/// order regardless of vote counts.
pub async fn compute_results(
    db: &DatabaseConnection,
    poll_id: i32,
) -> Result<Option<ResultSnapshot>, DbErr> {
    let poll = match polls::Entity::find_by_id(poll_id).one(db).await? {
        Some(poll) => poll,
        None => return Ok(None),
    };

    let options = poll_options::Entity::find()
        .filter(poll_options::Column::PollId.eq(poll_id))
        .order_by_asc(poll_options::Column::Id)
        .all(db)
        .await?;

    let counts: HashMap<i32, i64> = votes::Entity::find()
        .select_only()
        .column(votes::Column::OptionId)
        .column_as(votes::Column::Id.count(), "votes")
        .filter(votes::Column::PollId.eq(poll_id))
        .group_by(votes::Column::OptionId)
        .into_model::<VoteCountRow>()
        .all(db)
        .await?
        .into_iter()
        .map(|row| (row.option_id, row.votes))
        .collect();

    Ok(Some(build_snapshot(&poll, &options, &counts)))
}

/// Assemble a snapshot from already-fetched rows.
pub fn build_snapshot(
    poll: &polls::Model,
    options: &[poll_options::Model],
    counts: &HashMap<i32, i64>,
) -> ResultSnapshot {
    let total_votes: i64 = options
        .iter()
        .map(|option| counts.get(&option.id).copied().unwrap_or(0))
        .sum();

    let options = options
        .iter()
        .map(|option| {
            let votes = counts.get(&option.id).copied().unwrap_or(0);
            OptionResult {
                id: option.id,
                text: option.option_text.clone(),
                votes,
                percentage: percentage(votes, total_votes),
            }
        })
        .collect();

    ResultSnapshot {
        poll_id: poll.id,
        question: poll.question.clone(),
        total_votes,
        options,
        updated_at: Utc::now().naive_utc(),
    }
}

/// Integer percentage, rounded half-up. Zero when there are no votes.
fn percentage(votes: i64, total: i64) -> i32 {
    if total == 0 {
        return 0;
    }
    ((votes as f64 / total as f64) * 100.0).round() as i32
}
