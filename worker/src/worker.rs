use anyhow::Result;
use common::config::env_or;
use common::{WorkerHeartbeatRequest, WorkerRegisterRequest, WorkerRegisterResponse};
use reqwest::Client;
use std::{env, path::PathBuf, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::files;
use crate::server::{self, DataServer};
use crate::shuffler::{self, ShufflerState};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_DATA_PORT: u16 = 6001;
const DEFAULT_SHUFFLE_PORT: u16 = 7001;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const REGISTER_RETRY: Duration = Duration::from_secs(2);

/// Configuración del worker, leída del entorno.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_url: String,
    pub data_dir: PathBuf,
    /// Host con el que el master publica a este worker
    pub host: String,
    pub hostname: String,
    pub data_port: u16,
    pub shuffle_port: u16,
    pub max_concurrency: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        Self {
            master_url: env::var("MASTER_URL").unwrap_or_else(|_| "http://master:8080".to_string()),
            data_dir: PathBuf::from(env_or("DATA_DIR", "/data".to_string())),
            host: env_or("WORKER_HOST", hostname.clone()),
            hostname,
            data_port: env_or("WORKER_DATA_PORT", DEFAULT_DATA_PORT),
            shuffle_port: env_or("WORKER_SHUFFLE_PORT", DEFAULT_SHUFFLE_PORT),
            max_concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
        }
    }
}

/// Loop principal del worker.
/// - Levanta el canal de datos y el shuffler.
/// - Se registra en el master con los archivos de su directorio de datos.
/// - Manda heartbeats periódicos con CPU y memoria.
pub async fn run() -> Result<()> {
    let cfg = WorkerConfig::from_env();
    std::fs::create_dir_all(&cfg.data_dir)?;

    let data_listener = TcpListener::bind(("0.0.0.0", cfg.data_port)).await?;
    let shuffle_listener = TcpListener::bind(("0.0.0.0", cfg.shuffle_port)).await?;

    let data_server = DataServer::new(cfg.data_dir.clone(), cfg.max_concurrency as usize);
    tokio::spawn(async move {
        if let Err(e) = server::serve(data_listener, data_server).await {
            warn!("el canal de datos terminó: {:?}", e);
        }
    });

    let shuffler_state = ShufflerState::new(cfg.data_dir.clone());
    tokio::spawn(async move {
        if let Err(e) = shuffler::serve(shuffle_listener, shuffler_state).await {
            warn!("el shuffler terminó: {:?}", e);
        }
    });

    let client = Client::new();
    let worker_id = register(&client, &cfg).await;

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // en sysinfo 0.29 used_memory ya viene en bytes
        let mem_bytes = sys.used_memory();

        let hb_url = format!("{}/api/v1/workers/heartbeat", cfg.master_url);
        let res = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent,
                mem_bytes,
            })
            .send()
            .await;
        if let Err(e) = res {
            warn!("heartbeat fallido: {}", e);
        }

        sleep(HEARTBEAT_INTERVAL).await;
    }
}

/// Registra el worker; reintenta hasta que el master responda.
async fn register(client: &Client, cfg: &WorkerConfig) -> String {
    let register_url = format!("{}/api/v1/workers/register", cfg.master_url);

    loop {
        let files = match files::scan_data_dir(&cfg.data_dir) {
            Ok(f) => f,
            Err(e) => {
                warn!("no se pudo leer {}: {}", cfg.data_dir.display(), e);
                Vec::new()
            }
        };
        let req = WorkerRegisterRequest {
            hostname: cfg.hostname.clone(),
            host: cfg.host.clone(),
            data_port: cfg.data_port,
            shuffle_port: cfg.shuffle_port,
            max_concurrency: cfg.max_concurrency,
            files,
        };
        let file_count = req.files.len();

        let res = async {
            let resp = client.post(&register_url).json(&req).send().await?;
            resp.error_for_status()?
                .json::<WorkerRegisterResponse>()
                .await
        }
        .await;

        match res {
            Ok(WorkerRegisterResponse { worker_id }) => {
                info!(
                    "worker {} registrado como {}:{} (shuffle {}, concurrency={}, {} archivos) contra {}",
                    worker_id,
                    cfg.host,
                    cfg.data_port,
                    cfg.shuffle_port,
                    cfg.max_concurrency,
                    file_count,
                    cfg.master_url
                );
                return worker_id;
            }
            Err(e) => {
                warn!("no se pudo registrar en {}: {}; reintento", cfg.master_url, e);
                sleep(REGISTER_RETRY).await;
            }
        }
    }
}
