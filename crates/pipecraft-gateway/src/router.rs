//! HTTP handlers for the command verbs in `GET /worktrees/:id/*` and
//! `POST /worktrees/:id/*` form, each a thin call into that worktree's
//! [`RunController`].

use crate::errors::GatewayError;
use crate::registry::WorktreeRegistry;
use axum::extract::{Path, State};
use axum::Json;
use pipecraft_core::{PipecraftError, TaskId};
use pipecraft_run::{Briefing, Snapshot};
use pipecraft_store::{ConversationEntry, Role, RunRecord, TaskRecord};
use pipecraft_worker::WorkerSpawnConfig;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

fn parse_task_id(raw: &str) -> Result<TaskId, GatewayError> {
    TaskId::from_str(raw).map_err(|_| GatewayError(PipecraftError::Validation(format!("invalid task id {raw}"))))
}

pub async fn get_snapshot(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
) -> Result<Json<Snapshot>, GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    Ok(Json(controller.snapshot().await?))
}

pub async fn start_run(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
    Json(briefing): Json<Briefing>,
) -> Result<Json<RunRecord>, GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    Ok(Json(controller.start_run(briefing).await?))
}

#[derive(Deserialize)]
pub struct FollowUpInput {
    pub description: String,
}

pub async fn submit_follow_up(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
    Json(input): Json<FollowUpInput>,
) -> Result<(), GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    controller.submit_follow_up(input.description).await?;
    Ok(())
}

#[derive(Deserialize)]
pub struct ApproveInput {
    pub approver: String,
}

pub async fn approve_task(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path((worktree_id, task_id)): Path<(String, String)>,
    Json(input): Json<ApproveInput>,
) -> Result<Json<TaskRecord>, GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(controller.approve_task(task_id, input.approver).await?))
}

#[derive(Deserialize)]
pub struct CommentInput {
    pub author: String,
    pub message: String,
}

pub async fn comment_on_task(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path((worktree_id, task_id)): Path<(String, String)>,
    Json(input): Json<CommentInput>,
) -> Result<Json<ConversationEntry>, GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(controller.comment_on_task(task_id, input.author, input.message).await?))
}

#[derive(Deserialize)]
pub struct ConfigureWorkersInput {
    pub configs: Vec<WorkerSpawnConfig>,
}

pub async fn configure_workers(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
    Json(input): Json<ConfigureWorkersInput>,
) -> Result<(), GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    controller.configure_workers(input.configs).await?;
    Ok(())
}

#[derive(Deserialize, Default)]
pub struct StartWorkersInput {
    pub configs: Option<Vec<WorkerSpawnConfig>>,
}

pub async fn start_workers(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
    Json(input): Json<StartWorkersInput>,
) -> Result<(), GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    controller.start_workers(input.configs).await?;
    Ok(())
}

#[derive(Deserialize, Default)]
pub struct StopWorkersInput {
    pub roles: Option<Vec<Role>>,
}

pub async fn stop_workers(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
    Json(input): Json<StopWorkersInput>,
) -> Result<(), GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    controller.stop_workers(input.roles).await?;
    Ok(())
}

#[derive(Deserialize, Default)]
pub struct StopRunInput {
    pub failure: Option<String>,
}

pub async fn stop_run(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
    Json(input): Json<StopRunInput>,
) -> Result<Json<RunRecord>, GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    Ok(Json(controller.stop_run(input.failure).await?))
}

pub async fn agent_graph(
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
) -> Result<Json<pipecraft_run::AgentGraph>, GatewayError> {
    let controller = registry.controller(&worktree_id).await?;
    Ok(Json(controller.agent_graph().await?))
}
