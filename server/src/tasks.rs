//! Deferred work for the `api` namespace.
//!
//! Task bodies read their extensions from the current application context;
//! the runner wraps every task so that context is always the worker's
//! instance.

use keel_core::context;
use keel_runtime::{Task, TaskFault, TaskModule, parse_args};
use keel_web::{Cache, Persistence};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Cache key holding feedback counts per status.
pub const STATUS_COUNTS_KEY: &str = "status_counts";

/// Tasks registered as `api.*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiTasks;

impl TaskModule for ApiTasks {
    fn name(&self) -> &'static str {
        "api"
    }

    fn tasks(&self) -> Vec<Task> {
        vec![
            Task::new("refresh_status_counts", |_args| refresh_status_counts()),
            Task::new("recount_votes", recount_votes).with_max_retries(5),
        ]
    }
}

async fn refresh_status_counts() -> Result<Value, TaskFault> {
    let ctx = context::require_current()?;
    let persistence = ctx.require::<Persistence>()?;
    let cache = ctx.require::<Cache>()?;

    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT s.name, count(f.id) FROM statuses s \
         LEFT JOIN feedback f ON f.status_id = s.id GROUP BY s.name",
    )
    .fetch_all(persistence.pool())
    .await
    .map_err(|e| TaskFault::Failed(e.into()))?;

    let counts: BTreeMap<String, i64> = rows.into_iter().collect();
    cache
        .set(STATUS_COUNTS_KEY, &counts)
        .await
        .map_err(|e| TaskFault::Failed(e.into()))?;

    tracing::info!(statuses = counts.len(), "Status counts refreshed");
    Ok(json!(counts))
}

#[derive(Debug, Deserialize)]
struct RecountVotes {
    feedback_id: i64,
}

async fn recount_votes(args: Value) -> Result<Value, TaskFault> {
    let RecountVotes { feedback_id } = parse_args(args)?;
    let ctx = context::require_current()?;
    let persistence = ctx.require::<Persistence>()?;

    let votes: Option<i64> = sqlx::query_scalar(
        "UPDATE feedback SET votes = (SELECT count(*) FROM votes WHERE feedback_id = $1) \
         WHERE id = $1 RETURNING votes",
    )
    .bind(feedback_id)
    .fetch_optional(persistence.pool())
    .await
    .map_err(|e| TaskFault::Failed(e.into()))?;

    match votes {
        Some(votes) => Ok(json!({ "feedback_id": feedback_id, "votes": votes })),
        None => Err(TaskFault::InvalidArguments(format!(
            "feedback {feedback_id} does not exist"
        ))),
    }
}
