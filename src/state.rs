//! Durable agent state: the managed [`Position`] and the daily
//! [`ActionBudgetState`], stored as a single SQLite row so a restart
//! neither forgets an inactivity stamp nor refills the budget early.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::budget::ActionBudgetState;
use crate::policy::Position;

#[derive(Debug, thiserror::Error)]
pub(crate) enum StateError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored {field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentState {
    pub(crate) position: Position,
    pub(crate) budget: ActionBudgetState,
}

#[derive(sqlx::FromRow)]
struct AgentStateRow {
    current_bin_id: i64,
    inactive_since: Option<DateTime<Utc>>,
    period_start: DateTime<Utc>,
    max_actions: i64,
    actions_taken: i64,
}

fn to_u32(field: &'static str, value: i64) -> Result<u32, StateError> {
    u32::try_from(value).map_err(|_| StateError::OutOfRange { field, value })
}

impl TryFrom<AgentStateRow> for AgentState {
    type Error = StateError;

    fn try_from(row: AgentStateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            position: Position {
                current_bin_id: to_u32("current_bin_id", row.current_bin_id)?,
                inactive_since: row.inactive_since,
            },
            budget: ActionBudgetState {
                period_start: row.period_start,
                max_actions: to_u32("max_actions", row.max_actions)?,
                actions_taken: to_u32("actions_taken", row.actions_taken)?,
            },
        })
    }
}

#[derive(Clone)]
pub(crate) struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn load(&self) -> Result<Option<AgentState>, StateError> {
        let row = sqlx::query_as::<_, AgentStateRow>(
            "SELECT current_bin_id, inactive_since, period_start, max_actions, actions_taken
             FROM agent_state
             WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(AgentState::try_from).transpose()
    }

    pub(crate) async fn save(&self, state: &AgentState, now: DateTime<Utc>) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO agent_state
                (id, current_bin_id, inactive_since, period_start, max_actions, actions_taken, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                current_bin_id = excluded.current_bin_id,
                inactive_since = excluded.inactive_since,
                period_start = excluded.period_start,
                max_actions = excluded.max_actions,
                actions_taken = excluded.actions_taken,
                updated_at = excluded.updated_at",
        )
        .bind(i64::from(state.position.current_bin_id))
        .bind(state.position.inactive_since)
        .bind(state.budget.period_start)
        .bind(i64::from(state.budget.max_actions))
        .bind(i64::from(state.budget.actions_taken))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
