//! In-process stand-in for a database instance, used by tests.
//!
//! Implements the subset of the v2 collection API the replication path
//! touches, plus `/echo` for byte-fidelity checks and a switch that makes
//! every route answer 503.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Default)]
struct FakeCollection {
    name: String,
    metadata: Option<Value>,
    configuration: Option<Value>,
    documents: BTreeSet<String>,
}

#[derive(Default)]
struct FakeState {
    collections: HashMap<String, FakeCollection>,
    down: bool,
    last_body: Option<Bytes>,
    requests: Vec<String>,
}

type Shared = Arc<Mutex<FakeState>>;

/// Running fake instance
pub struct FakeInstance {
    addr: std::net::SocketAddr,
    state: Shared,
}

impl FakeInstance {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState::default()));
        let collections = "/api/v2/tenants/:tenant/databases/:database/collections";

        let app = Router::new()
            .route("/api/v2/heartbeat", get(heartbeat))
            .route(collections, get(list_collections).post(create_collection))
            .route(
                &format!("{}/:collection", collections),
                get(get_collection).delete(delete_collection),
            )
            .route(&format!("{}/:collection/:op", collections), post(collection_op))
            .route("/echo", post(echo))
            .layer(middleware::from_fn_with_state(Arc::clone(&state), availability))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn set_down(&self, down: bool) {
        self.state.lock().await.down = down;
    }

    /// Create a collection directly, bypassing HTTP; returns its id
    pub async fn seed_collection(&self, name: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.state.lock().await.collections.insert(
            id.clone(),
            FakeCollection {
                name: name.to_string(),
                ..Default::default()
            },
        );
        id
    }

    /// Drop a collection behind the mapper's back
    pub async fn drop_collection(&self, name: &str) {
        self.state
            .lock()
            .await
            .collections
            .retain(|_, c| c.name != name);
    }

    pub async fn collection_id(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        find(&state, name).map(|(id, _)| id.clone())
    }

    pub async fn document_count(&self, name: &str) -> usize {
        let state = self.state.lock().await;
        find(&state, name).map(|(_, c)| c.documents.len()).unwrap_or(0)
    }

    /// Body of the last `/echo` request, as received
    pub async fn last_body(&self) -> Option<Bytes> {
        self.state.lock().await.last_body.clone()
    }

    /// `METHOD path` of every request that reached a handler
    pub async fn requests(&self) -> Vec<String> {
        self.state.lock().await.requests.clone()
    }
}

/// Collections are keyed by id but the top-level routes address them by name
fn find<'a>(state: &'a FakeState, name: &str) -> Option<(&'a String, &'a FakeCollection)> {
    state.collections.iter().find(|(_, c)| c.name == name)
}

fn describe(id: &str, c: &FakeCollection) -> Value {
    json!({
        "id": id,
        "name": c.name,
        "metadata": c.metadata,
        "configuration_json": c.configuration,
    })
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Collection {} does not exist.", what)})),
    )
        .into_response()
}

async fn availability(State(state): State<Shared>, request: Request, next: Next) -> Response {
    {
        let mut guard = state.lock().await;
        if guard.down {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        guard
            .requests
            .push(format!("{} {}", request.method(), request.uri().path()));
    }
    next.run(request).await
}

async fn heartbeat() -> Json<Value> {
    Json(json!({"nanosecond heartbeat": 1}))
}

async fn list_collections(State(state): State<Shared>) -> Json<Value> {
    let state = state.lock().await;
    let all: Vec<Value> = state
        .collections
        .iter()
        .map(|(id, c)| describe(id, c))
        .collect();
    Json(Value::Array(all))
}

async fn create_collection(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let Some(name) = body.get("name").and_then(Value::as_str) else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "missing name").into_response();
    };

    let mut state = state.lock().await;
    if let Some((id, c)) = find(&state, name) {
        return Json(describe(id, c)).into_response();
    }

    let id = uuid::Uuid::new_v4().to_string();
    let collection = FakeCollection {
        name: name.to_string(),
        metadata: body.get("metadata").cloned().filter(|m| !m.is_null()),
        configuration: body.get("configuration").cloned().filter(|c| !c.is_null()),
        documents: BTreeSet::new(),
    };
    let described = describe(&id, &collection);
    state.collections.insert(id, collection);
    Json(described).into_response()
}

async fn get_collection(
    State(state): State<Shared>,
    Path((_tenant, _database, collection)): Path<(String, String, String)>,
) -> Response {
    let state = state.lock().await;
    match find(&state, &collection) {
        Some((id, c)) => Json(describe(id, c)).into_response(),
        None => not_found(&collection),
    }
}

async fn delete_collection(
    State(state): State<Shared>,
    Path((_tenant, _database, collection)): Path<(String, String, String)>,
) -> Response {
    let mut state = state.lock().await;
    let id = match find(&state, &collection) {
        Some((id, _)) => id.clone(),
        None => return not_found(&collection),
    };
    state.collections.remove(&id);
    Json(json!({})).into_response()
}

async fn collection_op(
    State(state): State<Shared>,
    Path((_tenant, _database, collection, op)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    let mut state = state.lock().await;
    // Sub-resources are addressed by id only
    let Some(target) = state.collections.get_mut(&collection) else {
        return not_found(&collection);
    };

    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let ids: Vec<String> = parsed
        .get("ids")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    match op.as_str() {
        "add" | "upsert" => {
            target.documents.extend(ids);
            (StatusCode::CREATED, Json(json!(true))).into_response()
        }
        "delete" => {
            for id in &ids {
                target.documents.remove(id);
            }
            Json(json!(ids)).into_response()
        }
        "count" => Json(json!(target.documents.len())).into_response(),
        "get" | "query" => {
            let docs: Vec<&String> = target.documents.iter().collect();
            Json(json!({ "ids": docs })).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn echo(State(state): State<Shared>, body: Bytes) -> Response {
    state.lock().await.last_body = Some(body.clone());
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}
