//! Admin HTTP API.
//!
//! Operator and test surface over a [`SwarmNode`]:
//! - GET /health
//! - GET /v1/cache/stats
//! - POST /v1/cache/requests/{id}, DELETE /v1/cache/requests/{id}
//! - POST /v1/swarm/contexts/{id}, GET /v1/swarm/contexts/{id}, DELETE /v1/swarm/contexts/{id}
//! - GET /v1/swarm/contexts/{id}/route
//! - POST /v1/swarm/contexts/{id}/shards/{index}/migrate
//! - POST /v1/swarm/ranks/{rank}/dead, POST /v1/swarm/ranks/{rank}/alive
//! - GET /v1/swarm/migrations
//! - GET /metrics

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::coordinator::{CoordinatorError, CoordinatorStats};
use crate::cache::pool::PoolStats;
use crate::node::{Allocation, SwarmNode};
use crate::swarm::manager::{RankRoute, ShardError};
use crate::swarm::migration::{MigrationError, MigrationOutcome, MigrationRecord, MigrationStats};
use crate::swarm::shard::{RankId, ShardDescriptor};

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<SwarmNode>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/requests/{id}", post(allocate_request).delete(free_request))
        .route(
            "/v1/swarm/contexts/{id}",
            post(shard_context).get(get_context).delete(delete_context),
        )
        .route("/v1/swarm/contexts/{id}/route", get(route_token))
        .route("/v1/swarm/contexts/{id}/shards/{index}/migrate", post(migrate_shard))
        .route("/v1/swarm/ranks/{rank}/dead", post(mark_dead))
        .route("/v1/swarm/ranks/{rank}/alive", post(mark_alive))
        .route("/v1/swarm/migrations", get(migrations))
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Handler error: a status code plus a message.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = if e.is_out_of_blocks() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::BAD_REQUEST
        };
        ApiError(status, e.to_string())
    }
}

impl From<ShardError> for ApiError {
    fn from(e: ShardError) -> Self {
        let status = match e {
            ShardError::NoAvailableRanks => StatusCode::BAD_REQUEST,
            ShardError::ContextNotFound(_) | ShardError::TenantMismatch(_) | ShardError::ShardIndexOutOfRange { .. } => {
                StatusCode::NOT_FOUND
            }
        };
        ApiError(status, e.to_string())
    }
}

impl From<MigrationError> for ApiError {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::Shard(e) => e.into(),
            MigrationError::Conflict { .. } => ApiError(StatusCode::CONFLICT, e.to_string()),
            MigrationError::TargetUnavailable(_) | MigrationError::Transport(_) => {
                ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            MigrationError::Encode(_) => ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub contexts: usize,
    pub dead_ranks: Vec<RankId>,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub strategy: String,
    pub direct: CoordinatorStats,
    pub prefetch_pending: usize,
    /// Successful layer-scoped allocations, indexed by layer.
    pub layer_allocations: Vec<u64>,
    pub pool: PoolStats,
    pub hit_rate: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct AllocateRequest {
    /// Tokens to reserve space for.
    #[serde(default)]
    pub tokens: usize,
    /// Prompt token ids, used for prefix reuse.
    #[serde(default)]
    pub token_ids: Vec<u32>,
    /// Allocate on behalf of this model layer.
    #[serde(default)]
    pub layer: Option<usize>,
    /// Queue the allocation instead of serving it now. Takes precedence
    /// over `layer`.
    #[serde(default)]
    pub prefetch: bool,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocateResponse {
    Allocated {
        request_id: String,
        blocks: Vec<Vec<u32>>,
        cached_tokens: usize,
    },
    Queued {
        request_id: String,
        pending: usize,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct FreeParams {
    /// Final completion length, fed to the length predictor.
    pub completion_tokens: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FreeResponse {
    pub request_id: String,
    pub freed_blocks: usize,
}

#[derive(Debug, Deserialize)]
pub struct ShardContextRequest {
    pub total_tokens: usize,
    pub tenant_id: String,
    /// Defaults to the configured ranks.
    pub ranks: Option<Vec<RankId>>,
    /// Defaults to the configured overlap.
    pub overlap: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TenantParams {
    pub tenant: String,
}

#[derive(Debug, Deserialize)]
pub struct RouteParams {
    pub token: usize,
    pub tenant: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteResponse {
    pub route: RankRoute,
    /// Token indices whose shards were warmed by this lookup.
    pub prefetched: Vec<usize>,
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub target: RankId,
}

#[derive(Debug, Serialize)]
pub struct MigrationsResponse {
    pub stats: MigrationStats,
    pub history: Vec<MigrationRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RankStatusResponse {
    pub rank: RankId,
    pub alive: bool,
    pub changed: bool,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<SwarmNode>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        contexts: state.shards.num_contexts(),
        dead_ranks: state.shards.dead_ranks(),
    })
}

async fn metrics(State(state): State<Arc<SwarmNode>>) -> Result<String, ApiError> {
    state
        .render_metrics()
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn cache_stats(State(state): State<Arc<SwarmNode>>) -> Json<CacheStatsResponse> {
    let direct = state.allocator.lock().inner().stats();
    let prefetch_pending = state.prefetch_queue.lock().pending();
    let layer_allocations = state.layered.lock().layer_allocations().to_vec();
    let pool = state.pool.lock().stats();
    Json(CacheStatsResponse {
        strategy: format!("{:?}", state.config.allocation.strategy).to_lowercase(),
        direct,
        prefetch_pending,
        layer_allocations,
        hit_rate: pool.hit_rate(),
        pool,
    })
}

async fn allocate_request(
    State(state): State<Arc<SwarmNode>>,
    Path(id): Path<String>,
    Json(req): Json<AllocateRequest>,
) -> Result<(StatusCode, Json<AllocateResponse>), ApiError> {
    if req.prefetch {
        let mut queue = state.prefetch_queue.lock();
        let tokens = req.tokens.max(req.token_ids.len());
        if !queue.enqueue(id.clone(), tokens, req.priority) {
            return Err(ApiError(StatusCode::TOO_MANY_REQUESTS, "prefetch queue full".to_string()));
        }
        return Ok((
            StatusCode::ACCEPTED,
            Json(AllocateResponse::Queued {
                request_id: id,
                pending: queue.pending(),
            }),
        ));
    }

    let Allocation { blocks, cached_tokens } = match req.layer {
        Some(layer) => state.allocate_for_layer(layer, &id, req.tokens, &req.token_ids)?,
        None => state.allocate(&id, req.tokens, &req.token_ids)?,
    };
    Ok((
        StatusCode::OK,
        Json(AllocateResponse::Allocated {
            request_id: id,
            blocks,
            cached_tokens,
        }),
    ))
}

async fn free_request(
    State(state): State<Arc<SwarmNode>>,
    Path(id): Path<String>,
    Query(params): Query<FreeParams>,
) -> Result<Json<FreeResponse>, ApiError> {
    let freed_blocks = state.release(&id, params.completion_tokens)?;
    if freed_blocks == 0 {
        return Err(ApiError(StatusCode::NOT_FOUND, format!("request {id} holds no blocks")));
    }
    Ok(Json(FreeResponse {
        request_id: id,
        freed_blocks,
    }))
}

async fn shard_context(
    State(state): State<Arc<SwarmNode>>,
    Path(id): Path<String>,
    Json(req): Json<ShardContextRequest>,
) -> Result<(StatusCode, Json<Vec<ShardDescriptor>>), ApiError> {
    let ranks = req.ranks.unwrap_or_else(|| state.config.sharding.ranks.clone());
    let overlap = req.overlap.unwrap_or(state.config.sharding.default_overlap);
    let shards = state
        .shards
        .shard_context(&id, req.total_tokens, &ranks, &req.tenant_id, overlap)?;
    Ok((StatusCode::CREATED, Json(shards)))
}

async fn get_context(
    State(state): State<Arc<SwarmNode>>,
    Path(id): Path<String>,
    Query(params): Query<TenantParams>,
) -> Result<Json<Vec<ShardDescriptor>>, ApiError> {
    Ok(Json(state.shards.shards_for_tenant(&id, &params.tenant)?))
}

async fn delete_context(State(state): State<Arc<SwarmNode>>, Path(id): Path<String>) -> StatusCode {
    if state.delete_context(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn route_token(
    State(state): State<Arc<SwarmNode>>,
    Path(id): Path<String>,
    Query(params): Query<RouteParams>,
) -> (StatusCode, Json<RouteResponse>) {
    let route = state.shards.get_rank_for_token(&id, params.token, &params.tenant);
    let (status, prefetched) = match route {
        RankRoute::Primary(_) | RankRoute::Replica(_) => {
            state.compressor.touch_shard(&id, params.token);
            (StatusCode::OK, state.prefetcher.record_access(&id, params.token))
        }
        RankRoute::NotFound => (StatusCode::NOT_FOUND, Vec::new()),
        RankRoute::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, Vec::new()),
    };
    (status, Json(RouteResponse { route, prefetched }))
}

async fn migrate_shard(
    State(state): State<Arc<SwarmNode>>,
    Path((id, index)): Path<(String, usize)>,
    Json(req): Json<MigrateRequest>,
) -> Result<Response, ApiError> {
    match state.engine.migrate_shard(&id, index, req.target).await? {
        MigrationOutcome::AlreadyOnTarget => Ok(StatusCode::NO_CONTENT.into_response()),
        MigrationOutcome::Migrated(record) => Ok(Json(record).into_response()),
    }
}

async fn mark_dead(State(state): State<Arc<SwarmNode>>, Path(rank): Path<RankId>) -> Json<RankStatusResponse> {
    let changed = state.shards.mark_rank_dead(rank);
    info!(rank, changed, "Rank marked dead via admin API");
    Json(RankStatusResponse {
        rank,
        alive: false,
        changed,
    })
}

async fn mark_alive(State(state): State<Arc<SwarmNode>>, Path(rank): Path<RankId>) -> Json<RankStatusResponse> {
    let changed = state.shards.mark_rank_alive(rank);
    info!(rank, changed, "Rank marked alive via admin API");
    Json(RankStatusResponse {
        rank,
        alive: true,
        changed,
    })
}

async fn migrations(State(state): State<Arc<SwarmNode>>) -> Json<MigrationsResponse> {
    Json(MigrationsResponse {
        stats: state.engine.migration_stats(),
        history: state.engine.history(),
    })
}
