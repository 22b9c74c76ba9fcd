use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    FileMeta, InitWorkerRequest, InitWorkerResponse, PoolResponse, ResolveRequest,
    ResolveResponse, ShufflerRequest, ShufflerResponse, WorkerEntry, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use glob::Pattern;
use std::{
    collections::{BTreeMap, HashMap},
    time::SystemTime,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{AppState, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/files/resolve", post(resolve_files))
        .route("/api/v1/pool", post(allocate_pool))
        .route("/api/v1/pool/init", post(init_worker))
        .route("/api/v1/shufflers", post(allocate_shuffler))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Metadatos de los archivos que coinciden con cada path (se aceptan globs).
// Un path sin coincidencias vuelve igual, sin ubicaciones.
async fn resolve_files(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, StatusCode> {
    let mut patterns = Vec::with_capacity(req.paths.len());
    for p in &req.paths {
        match Pattern::new(p) {
            Ok(pat) => patterns.push((p.clone(), pat)),
            Err(e) => {
                warn!("patrón inválido '{}': {}", p, e);
                return Err(StatusCode::BAD_REQUEST);
            }
        }
    }

    let workers = state.workers();
    let mut files = Vec::new();

    for (path, pattern) in &patterns {
        // nombre -> metadatos con todas las réplicas vivas
        let mut found: BTreeMap<&str, FileMeta> = BTreeMap::new();
        let mut live: Vec<&WorkerMeta> = workers.values().filter(|w| !w.dead).collect();
        live.sort_by_key(|w| w.data());

        for w in live {
            for f in w.files.iter().filter(|f| pattern.matches(&f.name)) {
                found
                    .entry(f.name.as_str())
                    .or_insert_with(|| FileMeta {
                        name: f.name.clone(),
                        size: f.size,
                        records: f.records,
                        locations: Vec::new(),
                    })
                    .locations
                    .push(w.data());
            }
        }

        if found.is_empty() {
            files.push(FileMeta {
                name: path.clone(),
                size: 0,
                records: -1,
                locations: Vec::new(),
            });
        } else {
            for meta in found.into_values() {
                if !files.iter().any(|f: &FileMeta| f.name == meta.name) {
                    files.push(meta);
                }
            }
        }
    }

    info!(
        "resolve {:?}: {} archivos ({} sin ubicación)",
        req.paths,
        files.len(),
        files.iter().filter(|f| f.locations.is_empty()).count()
    );
    Ok(Json(ResolveResponse { files }))
}

// Todos los workers vivos, en orden estable
async fn allocate_pool(State(state): State<AppState>) -> Json<PoolResponse> {
    let workers = state.workers();
    let mut pool: Vec<WorkerEntry> = workers
        .values()
        .filter(|w| !w.dead)
        .map(|w| w.entry())
        .collect();
    pool.sort_by(|a, b| a.data.cmp(&b.data));

    info!("pool de {} workers", pool.len());
    Json(PoolResponse { workers: pool })
}

fn live_worker_mut<'a>(
    workers: &'a mut HashMap<WorkerId, WorkerMeta>,
    entry: &WorkerEntry,
) -> Option<(&'a WorkerId, &'a mut WorkerMeta)> {
    workers
        .iter_mut()
        .find(|(_, w)| !w.dead && w.data() == entry.data)
}

// Prepara un worker para un job: le asigna una sesión del canal de datos
async fn init_worker(
    State(state): State<AppState>,
    Json(req): Json<InitWorkerRequest>,
) -> Result<Json<InitWorkerResponse>, StatusCode> {
    let session = state.new_session();
    let mut workers = state.workers();
    let Some((id, meta)) = live_worker_mut(&mut workers, &req.worker) else {
        warn!("init pedido para worker desconocido o muerto: {}", req.worker.data);
        return Err(StatusCode::NOT_FOUND);
    };
    meta.sessions_started += 1;

    info!(
        "worker {} ({}) inicializado: udf={} modo={:?} sesión={}",
        id, req.worker.data, req.op, req.mode, session
    );
    Ok(Json(InitWorkerResponse { session }))
}

// Reserva el shuffler de un worker para un job con salida en buckets
async fn allocate_shuffler(
    State(state): State<AppState>,
    Json(req): Json<ShufflerRequest>,
) -> Result<Json<ShufflerResponse>, StatusCode> {
    let session = state.new_session();
    let mut workers = state.workers();
    let Some((id, meta)) = live_worker_mut(&mut workers, &req.worker) else {
        warn!("shuffler pedido en worker desconocido o muerto: {}", req.worker.data);
        return Err(StatusCode::NOT_FOUND);
    };
    meta.shufflers_started += 1;

    info!(
        "shuffler en worker {} ({}:{}) para {}/{} ({} archivos), sesión={}",
        id, meta.host, meta.shuffle_port, req.path, req.name, req.file_count, session
    );
    Ok(Json(ShufflerResponse {
        port: meta.shuffle_port,
        session,
    }))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    info!(
        "worker registrado: {} en {}:{} (shuffler :{}, max_concurrency={}, {} archivos)",
        worker_id,
        req.host,
        req.data_port,
        req.shuffle_port,
        req.max_concurrency,
        req.files.len()
    );

    {
        let mut workers = state.workers();
        workers.insert(
            worker_id.clone(),
            WorkerMeta {
                hostname: req.hostname,
                host: req.host,
                data_port: req.data_port,
                shuffle_port: req.shuffle_port,
                registered_at: Utc::now(),
                last_heartbeat: SystemTime::now(),
                dead: false,
                max_concurrency: req.max_concurrency,
                files: req.files,

                sessions_started: 0,
                shufflers_started: 0,

                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );
    }

    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = state.workers();
    if let Some(meta) = workers.get_mut(&req.worker_id) {
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = Some(req.cpu_percent);
        meta.last_mem_bytes = Some(req.mem_bytes);
        if meta.dead {
            info!("worker {} volvió a mandar heartbeats", req.worker_id);
            meta.dead = false;
        }
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();
    let workers = state.workers();
    let mut out = Vec::new();

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            data: meta.data(),
            control: meta.control(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            registered_at: meta.registered_at,
            last_heartbeat_secs_ago: age_secs,
            files: meta.files.len(),
            sessions_started: meta.sessions_started,
            shufflers_started: meta.shufflers_started,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        });
    }
    out.sort_by(|a, b| a.data.cmp(&b.data));

    Json(out)
}
