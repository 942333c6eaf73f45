//! Vote submission and poll result endpoints

use crate::db::get_db_pool;
use crate::orm::{poll_options, polls, users, votes};
use crate::results;
use crate::vote::{SubmitError, VoteRejection, VoteService};
use actix_web::{delete, error, get, post, web, Error, HttpResponse};
use chrono::{NaiveDateTime, Utc};
use sea_orm::{entity::*, query::*, ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use validator::Validate;

pub(super) fn configure(conf: &mut actix_web::web::ServiceConfig) {
    conf.service(submit_vote)
        .service(get_poll_results)
        .service(get_poll_votes)
        .service(remove_vote)
        .service(health);
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitVoteForm {
    #[validate(range(min = 1))]
    pub user_id: i32,
    #[validate(range(min = 1))]
    pub poll_option_id: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoteInfo {
    id: i32,
    user_id: i32,
    poll_id: i32,
    option_id: i32,
    created_at: NaiveDateTime,
}

impl From<&votes::Model> for VoteInfo {
    fn from(vote: &votes::Model) -> Self {
        Self {
            id: vote.id,
            user_id: vote.user_id,
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            created_at: vote.created_at,
        }
    }
}

/// Submit a vote for a poll option.
///
/// `201` with the vote and fresh results on success; `404` when the
/// user/option/poll is unresolvable; `400` for unpublished polls; `409`
/// with the existing vote's option when the voter already voted.
#[post("/votes")]
async fn submit_vote(
    service: web::Data<VoteService>,
    body: web::Json<SubmitVoteForm>,
) -> Result<HttpResponse, Error> {
    body.validate().map_err(error::ErrorBadRequest)?;

    match service.submit_vote(body.user_id, body.poll_option_id).await {
        Ok(accepted) => Ok(HttpResponse::Created().json(json!({
            "success": true,
            "message": "Vote submitted successfully",
            "data": {
                "vote": VoteInfo::from(&accepted.vote),
                "pollResults": accepted.snapshot,
            },
        }))),
        Err(SubmitError::Rejected(rejection)) => Ok(rejection_response(rejection)),
        Err(SubmitError::Database(err)) => {
            log::error!("Vote submission failed: {}", err);
            Err(error::ErrorInternalServerError("Internal server error"))
        }
    }
}

fn rejection_response(rejection: VoteRejection) -> HttpResponse {
    match rejection {
        VoteRejection::UserNotFound => not_found("User not found"),
        VoteRejection::OptionNotFound => not_found("Poll option not found"),
        VoteRejection::PollNotFound => not_found("Poll not found"),
        VoteRejection::PollNotPublished => HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "Cannot vote on unpublished poll",
        })),
        VoteRejection::AlreadyVoted {
            option_id,
            option_text,
        } => HttpResponse::Conflict().json(json!({
            "success": false,
            "error": "User has already voted in this poll",
            "details": {
                "existingVote": {
                    "optionId": option_id,
                    "optionText": option_text,
                },
            },
        })),
    }
}

fn not_found(message: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({
        "success": false,
        "error": message,
    }))
}

/// Current results for a poll
#[get("/votes/poll/{poll_id}/results")]
async fn get_poll_results(path: web::Path<i32>) -> Result<HttpResponse, Error> {
    let snapshot = results::compute_results(&get_db_pool(), path.into_inner())
        .await
        .map_err(error::ErrorInternalServerError)?;

    match snapshot {
        Some(snapshot) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": snapshot,
        }))),
        None => Ok(not_found("Poll not found")),
    }
}

/// Votes cast on a poll, newest first, with voter and option detail
#[get("/votes/poll/{poll_id}")]
async fn get_poll_votes(path: web::Path<i32>) -> Result<HttpResponse, Error> {
    let payload = poll_votes_payload(&get_db_pool(), path.into_inner())
        .await
        .map_err(error::ErrorInternalServerError)?;

    match payload {
        Some(data) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": data,
        }))),
        None => Ok(not_found("Poll not found")),
    }
}

/// Build the vote-list payload, or `None` if the poll does not exist.
async fn poll_votes_payload(
    db: &sea_orm::DatabaseConnection,
    poll_id: i32,
) -> Result<Option<serde_json::Value>, sea_orm::DbErr> {
    let poll = match polls::Entity::find_by_id(poll_id).one(db).await? {
        Some(poll) => poll,
        None => return Ok(None),
    };

    let vote_rows = votes::Entity::find()
        .filter(votes::Column::PollId.eq(poll_id))
        .order_by_desc(votes::Column::CreatedAt)
        .all(db)
        .await?;

    // No votes means no voters to look up.
    let voters: HashMap<i32, String> = if vote_rows.is_empty() {
        HashMap::new()
    } else {
        let user_ids: Vec<i32> = vote_rows.iter().map(|v| v.user_id).collect();
        users::Entity::find()
            .filter(users::Column::Id.is_in(user_ids))
            .all(db)
            .await?
            .into_iter()
            .map(|u| (u.id, u.name))
            .collect()
    };

    let options: HashMap<i32, String> = poll_options::Entity::find()
        .filter(poll_options::Column::PollId.eq(poll_id))
        .all(db)
        .await?
        .into_iter()
        .map(|o| (o.id, o.option_text))
        .collect();

    let votes: Vec<_> = vote_rows
        .iter()
        .map(|vote| {
            json!({
                "id": vote.id,
                "createdAt": vote.created_at,
                "user": {
                    "id": vote.user_id,
                    "name": voters.get(&vote.user_id),
                },
                "pollOption": {
                    "id": vote.option_id,
                    "text": options.get(&vote.option_id),
                },
            })
        })
        .collect();

    Ok(Some(json!({
        "votes": votes,
        "poll": {
            "id": poll.id,
            "question": poll.question,
        },
    })))
}

/// Basic vote removal hook. No broadcast; retraction semantics beyond
/// deletion are out of scope.
#[delete("/votes/{vote_id}")]
async fn remove_vote(
    service: web::Data<VoteService>,
    path: web::Path<i32>,
) -> Result<HttpResponse, Error> {
    let removed = service
        .remove_vote(path.into_inner())
        .await
        .map_err(error::ErrorInternalServerError)?;

    if removed == 0 {
        return Ok(not_found("Vote not found"));
    }

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Vote removed",
    })))
}

/// Liveness check
#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "OK",
        "timestamp": Utc::now().naive_utc(),
    }))
}
