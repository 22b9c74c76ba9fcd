use std::collections::BTreeSet;

use tracing::{info, warn};

use common::protocol::{BucketSpec, BucketTarget, Frame, CMD_OPEN_BUCKET};
use common::{
    Endpoint, ProcessingMode, Result, SessionId, ShufflerRequest, SphereError, StreamDescriptor,
    WorkerEntry,
};

use crate::channel::DataChannel;
use crate::coordinator::Coordinator;

/// Destino de shuffle: un shuffler remoto abierto para este job.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub id: usize,
    pub worker: WorkerEntry,
    /// host del worker + puerto que devolvió el coordinador
    pub endpoint: Endpoint,
    pub session: SessionId,
    /// 0 = abierto, 100 = cerrado (confirmado o forzado)
    pub progress: i32,
}

impl Bucket {
    pub fn is_closed(&self) -> bool {
        self.progress >= 100
    }
}

/// Parámetros con los que se abren los buckets de un job.
#[derive(Debug, Clone)]
pub struct BucketRequest<'a> {
    pub path: &'a str,
    pub name: &'a str,
    pub file_count: usize,
    pub mode: ProcessingMode,
}

/// Pide un shuffler por worker físico y abre cada uno con `OPEN_BUCKET`.
/// Los workers que fallan se saltean; si no queda ninguno, `NoBucketAllocated`.
pub async fn open_buckets(
    coordinator: &dyn Coordinator,
    channel: &dyn DataChannel,
    workers: &[WorkerEntry],
    req: &BucketRequest<'_>,
) -> Result<Vec<Bucket>> {
    let mut seen = BTreeSet::new();
    let mut buckets = Vec::new();

    for worker in workers {
        if !seen.insert(worker.data.clone()) {
            continue;
        }

        let resp = match coordinator
            .allocate_shuffler(&ShufflerRequest {
                worker: worker.clone(),
                path: req.path.to_string(),
                name: req.name.to_string(),
                file_count: req.file_count,
                mode: req.mode,
            })
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("no se pudo reservar shuffler en {}: {}", worker.data, e);
                continue;
            }
        };

        let id = buckets.len();
        let endpoint = worker.control.with_port(resp.port);
        let spec = BucketSpec {
            bucket: id,
            path: req.path.to_string(),
            name: req.name.to_string(),
            mode: req.mode,
        };

        let sent = match Frame::json(CMD_OPEN_BUCKET, &spec) {
            Ok(frame) => channel.send(&endpoint, resp.session, frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("shuffler {} no respondió al abrir el bucket: {}", endpoint, e);
            channel.disconnect(&endpoint, resp.session).await;
            continue;
        }

        info!("bucket {} abierto en {} (sesión {})", id, endpoint, resp.session);
        buckets.push(Bucket {
            id,
            worker: worker.clone(),
            endpoint,
            session: resp.session,
            progress: 0,
        });
    }

    if buckets.is_empty() {
        return Err(SphereError::NoBucketAllocated);
    }
    Ok(buckets)
}

/// Asigna cada archivo lógico de salida a un bucket: round-robin, salvo que
/// el archivo tenga una pista de ubicación que coincida con el host de un
/// bucket. Devuelve el destino de cada archivo (índice = id del archivo).
pub fn assign_output_files(output: &mut StreamDescriptor, buckets: &[Bucket]) -> Vec<BucketTarget> {
    if buckets.is_empty() {
        return Vec::new();
    }

    let mut next = 0;
    let mut targets = Vec::with_capacity(output.files.len());

    for file in output.files.iter_mut() {
        let hinted = file.locations.first().and_then(|hint| {
            buckets
                .iter()
                .position(|b| b.worker.data.host == hint.host)
        });

        let idx = match hinted {
            Some(i) => i,
            None => {
                let i = next % buckets.len();
                next += 1;
                i
            }
        };

        let b = &buckets[idx];
        file.bucket = Some(b.id);
        file.locations = vec![b.worker.data.clone()];
        targets.push(BucketTarget {
            bucket: b.id,
            endpoint: b.endpoint.clone(),
            session: b.session,
        });
    }

    targets
}
