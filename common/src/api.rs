use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::topology::Endpoint;
use crate::{SessionId, WorkerId};

/* --------- Metadatos de archivos --------- */

/// Lo que el coordinador sabe de un archivo: tamaño, registros y réplicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    /// -1 si el archivo no tiene índice de registros
    pub records: i64,
    pub locations: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Nombres lógicos o patrones glob ("logs/*.txt")
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub files: Vec<FileMeta>,
}

/* --------- Pool de workers --------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    /// Puerto de control (donde vive el shuffler del worker)
    pub control: Endpoint,
    /// Puerto del canal de datos
    pub data: Endpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolResponse {
    pub workers: Vec<WorkerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    /// Sólo la UDF; la salida queda como la escriben los workers
    Map,
    /// La UDF produce pares clave,valor y los shufflers reducen al cerrar
    MapReduce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitWorkerRequest {
    pub worker: WorkerEntry,
    pub op: String,
    pub param: String,
    pub mode: ProcessingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitWorkerResponse {
    pub session: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShufflerRequest {
    pub worker: WorkerEntry,
    pub path: String,
    pub name: String,
    pub file_count: usize,
    pub mode: ProcessingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShufflerResponse {
    pub port: u16,
    pub session: SessionId,
}

/* --------- Registro y heartbeats de workers --------- */

/// Archivo local que un worker tiene en su directorio de datos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
    pub records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    /// Host por el que los demás llegan a este worker
    pub host: String,
    pub data_port: u16,
    pub shuffle_port: u16,
    pub max_concurrency: u32,
    pub files: Vec<LocalFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub data: Endpoint,
    pub control: Endpoint,
    pub dead: bool,
    pub max_concurrency: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_secs_ago: u64,
    pub files: usize,
    pub sessions_started: u64,
    pub shufflers_started: u64,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
