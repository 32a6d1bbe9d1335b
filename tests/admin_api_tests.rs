//! Admin API round trips against an in-process router.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use kv_swarm::config::{Config, PoolConfig, ShardingConfig};
use kv_swarm::node::SwarmNode;
use kv_swarm::server::admin_api::build_router;

fn app() -> (Arc<SwarmNode>, Router) {
    let config = Config {
        pool: PoolConfig {
            num_blocks: 16,
            block_size: 4,
            ..Default::default()
        },
        sharding: ShardingConfig {
            shard_size: 100,
            redundancy: 2,
            default_overlap: 0,
            ranks: vec![0, 1, 2],
        },
        ..Default::default()
    };
    let node = Arc::new(SwarmNode::new(config).unwrap());
    let router = build_router(node.clone());
    (node, router)
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (_, router) = app();
    let (status, body) = call(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_allocate_and_free_request() {
    let (node, router) = app();
    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/cache/requests/r1",
        Some(json!({ "token_ids": [1, 2, 3, 4, 5, 6, 7, 8] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "allocated");
    assert_eq!(body["blocks"][0].as_array().unwrap().len(), 2);

    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/cache/requests/r2",
        Some(json!({ "token_ids": [1, 2, 3, 4, 5, 6, 7, 8] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached_tokens"], 8);

    let (status, body) = call(&router, Method::DELETE, "/v1/cache/requests/r1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["freed_blocks"], 2);
    let (status, _) = call(&router, Method::DELETE, "/v1/cache/requests/r1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(node.pool.lock().stats().cache_hits, 2);
}

#[tokio::test]
async fn test_allocation_beyond_pool_is_unavailable() {
    let (_, router) = app();
    let (status, body) = call(&router, Method::POST, "/v1/cache/requests/big", Some(json!({ "tokens": 1000 }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("blocks"));
}

#[tokio::test]
async fn test_unavailable_allocation_after_prefix_hit_holds_nothing() {
    let (node, router) = app();
    let prompt = json!([1, 2, 3, 4, 5, 6, 7, 8]);
    let (status, body) = call(&router, Method::POST, "/v1/cache/requests/r1", Some(json!({ "token_ids": prompt }))).await;
    assert_eq!(status, StatusCode::OK);
    let shared: Vec<u32> = serde_json::from_value(body["blocks"][0].clone()).unwrap();

    let (status, _) = call(
        &router,
        Method::POST,
        "/v1/cache/requests/r2",
        Some(json!({ "tokens": 1000, "token_ids": prompt })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = call(&router, Method::DELETE, "/v1/cache/requests/r2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    for id in shared {
        assert_eq!(node.pool.lock().get_block(id).unwrap().ref_cnt, 1);
    }
    let (_, stats) = call(&router, Method::GET, "/v1/cache/stats", None).await;
    assert_eq!(stats["direct"]["active_requests"], 1);
}

#[tokio::test]
async fn test_layer_scoped_allocation() {
    let (_, router) = app();
    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/cache/requests/l1",
        Some(json!({ "tokens": 8, "layer": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["blocks"][0].as_array().unwrap().len(), 2);

    let (_, stats) = call(&router, Method::GET, "/v1/cache/stats", None).await;
    assert_eq!(stats["layer_allocations"][2], 1);

    let (status, _) = call(
        &router,
        Method::POST,
        "/v1/cache/requests/l2",
        Some(json!({ "tokens": 8, "layer": 999 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&router, Method::DELETE, "/v1/cache/requests/l1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["freed_blocks"], 2);
}

#[tokio::test]
async fn test_prefetch_is_queued() {
    let (node, router) = app();
    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/cache/requests/p",
        Some(json!({ "tokens": 8, "prefetch": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(node.prefetch_queue.lock().pending(), 1);
}

#[tokio::test]
async fn test_context_routing_and_tenant_isolation() {
    let (_, router) = app();
    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/swarm/contexts/doc",
        Some(json!({ "total_tokens": 300, "tenant_id": "acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, body) = call(&router, Method::GET, "/v1/swarm/contexts/doc/route?token=150&tenant=acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["route"], json!({ "status": "primary", "rank": 1 }));

    let (status, _) = call(&router, Method::GET, "/v1/swarm/contexts/doc?tenant=globex", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = call(&router, Method::GET, "/v1/swarm/contexts/doc/route?token=150&tenant=globex", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["route"]["status"], "not_found");

    call(&router, Method::POST, "/v1/swarm/ranks/1/dead", None).await;
    let (_, body) = call(&router, Method::GET, "/v1/swarm/contexts/doc/route?token=150&tenant=acme", None).await;
    assert_eq!(body["route"], json!({ "status": "replica", "rank": 2 }));
}

#[tokio::test]
async fn test_migration_endpoint_and_history() {
    let (_, router) = app();
    call(
        &router,
        Method::POST,
        "/v1/swarm/contexts/doc",
        Some(json!({ "total_tokens": 200, "tenant_id": "acme", "ranks": [0, 1] })),
    )
    .await;

    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/swarm/contexts/doc/shards/0/migrate",
        Some(json!({ "target": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target_rank"], 2);

    let (status, _) = call(
        &router,
        Method::POST,
        "/v1/swarm/contexts/doc/shards/7/migrate",
        Some(json!({ "target": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&router, Method::GET, "/v1/swarm/migrations", None).await;
    assert_eq!(body["stats"]["total_migrations"], 1);
    assert_eq!(body["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (_, router) = app();
    let response = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("kv_swarm_pool_free_blocks 16"));
}
