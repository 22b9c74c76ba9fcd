// master/src/state.rs

use chrono::{DateTime, Utc};
use common::{Endpoint, LocalFile, SessionId, WorkerEntry, WorkerId};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, SystemTime},
};

#[derive(Clone)]
pub struct AppState {
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // sesiones del canal de datos (workers y shufflers)
    pub next_session: Arc<AtomicI32>,
    pub dead_timeout: Duration,
}

impl AppState {
    pub fn new(dead_timeout: Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_session: Arc::new(AtomicI32::new(1)),
            dead_timeout,
        }
    }

    pub fn workers(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerMeta>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub host: String,
    pub data_port: u16,
    pub shuffle_port: u16,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,
    pub files: Vec<LocalFile>,

    // Métricas
    pub sessions_started: u64,
    pub shufflers_started: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn data(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.data_port)
    }

    pub fn control(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.shuffle_port)
    }

    pub fn entry(&self) -> WorkerEntry {
        WorkerEntry {
            control: self.control(),
            data: self.data(),
        }
    }
}
