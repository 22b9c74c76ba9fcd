use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use common::protocol::{
    BucketClosed, Frame, OutputTarget, PoolInit, SegmentAssignment, SegmentReport,
    CMD_BUCKET_CLOSED, CMD_INIT, CMD_RESULT, CMD_SEGMENT, PROGRESS_WORKER_FAULT,
};
use common::{
    Endpoint, InitWorkerRequest, JobId, ProcessingMode, Result, SegmentId, SessionId, SlotId,
    SphereError, WorkerEntry,
};

use crate::channel::{DataChannel, ProgressEvent};
use crate::coordinator::Coordinator;
use crate::job::{JobTables, SlotLoss};
use crate::workers::SlotStatus;

/// Tiempo máximo esperando el RESULT después de un progreso 100.
const RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Qué corre el job y hacia dónde va la salida.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub op: String,
    pub param: String,
    pub rows: i64,
    pub mode: ProcessingMode,
    pub output: OutputTarget,
}

/// Lado lector: resultados listos + señal de fin.
pub(crate) struct Reader {
    pub ready_rx: mpsc::UnboundedReceiver<SegmentId>,
    pub done_rx: watch::Receiver<bool>,
}

pub struct Job {
    tables: Mutex<JobTables>,
    coordinator: Arc<dyn Coordinator>,
    channel: Arc<dyn DataChannel>,
    spec: JobSpec,
    tick: Duration,
    cancel: AtomicBool,
    done_tx: watch::Sender<bool>,
    pub(crate) reader: AsyncMutex<Reader>,
}

impl Job {
    /// `ready_rx` es el otro extremo del canal con el que se armó `tables`.
    pub fn new(
        tables: JobTables,
        ready_rx: mpsc::UnboundedReceiver<SegmentId>,
        coordinator: Arc<dyn Coordinator>,
        channel: Arc<dyn DataChannel>,
        spec: JobSpec,
        tick: Duration,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            tables: Mutex::new(tables),
            coordinator,
            channel,
            spec,
            tick,
            cancel: AtomicBool::new(false),
            done_tx,
            reader: AsyncMutex::new(Reader { ready_rx, done_rx }),
        }
    }

    /// Lock de las tablas. Nunca se mantiene a través de un `.await`.
    pub fn tables(&self) -> MutexGuard<'_, JobTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Inicializa un slot que todavía no tiene sesión.
async fn init_slot(job: &Job, slot: SlotId, worker: &WorkerEntry) -> Result<SessionId> {
    let session = job
        .coordinator
        .init_worker(&InitWorkerRequest {
            worker: worker.clone(),
            op: job.spec.op.clone(),
            param: job.spec.param.clone(),
            mode: job.spec.mode,
        })
        .await?;

    let init = PoolInit {
        slot,
        op: job.spec.op.clone(),
        param: job.spec.param.clone(),
        rows: job.spec.rows,
        output: job.spec.output.clone(),
    };
    let sent = match Frame::json(CMD_INIT, &init) {
        Ok(frame) => job.channel.send(&worker.data, session, frame).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        job.channel.disconnect(&worker.data, session).await;
        return Err(e);
    }

    job.tables().mark_initialized(slot, session);
    debug!("slot {} inicializado en {} (sesión {})", slot, worker.data, session);
    Ok(session)
}

/// Slot perdido: actualiza las tablas y cierra la conexión.
async fn lose_slot(job: &Job, slot: SlotId, peer: &Endpoint, session: SessionId) -> SlotLoss {
    let loss = job.tables().handle_slot_loss(slot);
    match loss {
        SlotLoss::JobFailed => warn!("se perdió el slot {} ({}) con buckets abiertos", slot, peer),
        SlotLoss::Requeued(id) => warn!("se perdió el slot {} ({}); segmento {} reencolado", slot, peer, id),
        SlotLoss::Failed(id) => warn!("se perdió el slot {} ({}); segmento {} fallido", slot, peer, id),
        SlotLoss::Idle => warn!("se perdió el slot {} ({})", slot, peer),
    }
    job.channel.disconnect(peer, session).await;
    loss
}

/// Una pasada sobre los slots: sondea los conectados, asigna segmentos a los
/// libres. Devuelve cuántos slots siguen activos; 0 si el job no puede seguir.
pub(crate) async fn check_slots(job: &Job) -> usize {
    let probes: Vec<(SlotId, Endpoint, SessionId)> = {
        let t = job.tables();
        if t.read_error().is_some() {
            return 0;
        }
        t.slots
            .iter()
            .filter(|s| s.is_active())
            .filter_map(|s| s.session.map(|ss| (s.id, s.data().clone(), ss)))
            .collect()
    };

    for (slot, peer, session) in probes {
        if !job.channel.is_connected(&peer, session).await
            && lose_slot(job, slot, &peer, session).await == SlotLoss::JobFailed
        {
            return 0;
        }
    }

    let free: Vec<SlotId> = {
        let t = job.tables();
        t.slots
            .iter()
            .filter(|s| matches!(s.status, SlotStatus::Idle | SlotStatus::Uninitialized))
            .map(|s| s.id)
            .collect()
    };

    let mut assigned = 0;
    for slot in free {
        let (id, worker, session) = {
            let mut t = job.tables();
            let Some(id) = t.next_candidate(slot) else {
                continue;
            };
            let s = &t.slots[slot];
            (id, s.worker.clone(), s.session)
        };

        let session = match session {
            Some(s) => s,
            None => match init_slot(job, slot, &worker).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("no se pudo inicializar el slot {} en {}: {}", slot, worker.data, e);
                    job.tables().abandon_unused(slot);
                    continue;
                }
            },
        };

        let msg = {
            let mut t = job.tables();
            if !t.assign(slot, id, Instant::now()) {
                continue;
            }
            let seg = &t.segments[&id];
            SegmentAssignment {
                id,
                file: seg.file.clone(),
                offset: seg.offset,
                length: seg.length,
            }
        };

        let sent = match Frame::json(CMD_SEGMENT, &msg) {
            Ok(frame) => job.channel.send(&worker.data, session, frame).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                assigned += 1;
                debug!(
                    "segmento {} ({} @{}+{}) -> slot {}",
                    id, msg.file, msg.offset, msg.length, slot
                );
            }
            Err(e) => {
                warn!("no se pudo entregar el segmento {} al slot {}: {}", id, slot, e);
                if lose_slot(job, slot, &worker.data, session).await == SlotLoss::JobFailed {
                    return 0;
                }
            }
        }
    }

    let t = job.tables();
    if t.read_error().is_some() {
        return 0;
    }
    if t.running_slots() == 0 && assigned == 0 && t.unfinished() {
        return 0;
    }
    t.active_slots()
}

/// Procesa un mensaje de progreso de un worker.
pub(crate) async fn handle_progress(job: &Job, ev: ProgressEvent) {
    let ProgressEvent { session, message } = ev;
    let slot = message.slot;

    let peer = {
        let t = job.tables();
        match t.slots.get(slot) {
            Some(s) if s.status == SlotStatus::Running && s.session == Some(session) => {
                s.data().clone()
            }
            _ => {
                debug!("progreso ignorado del slot {} (sesión {})", slot, session);
                return;
            }
        }
    };

    if message.progress < 0 {
        let code = message.progress;
        let detail = message.detail.unwrap_or_default();
        let id = job.tables().fail_segment(slot, code, detail.clone());
        warn!(
            "segmento {:?} falló en el slot {} (código {}): {}",
            id, slot, code, detail
        );
        if code == PROGRESS_WORKER_FAULT {
            let _ = job.channel.send(&peer, session, Frame::release()).await;
            job.channel.disconnect(&peer, session).await;
        }
        return;
    }

    if message.progress < 100 {
        job.tables().update_progress(slot, message.progress);
        return;
    }

    match fetch_result(job, &peer, session).await {
        Ok(report) => {
            let id = job.tables().complete_segment(slot, report, Instant::now());
            debug!("segmento {:?} terminado en el slot {}", id, slot);
        }
        Err(e) => {
            warn!("no se pudo leer el resultado del slot {}: {}", slot, e);
            lose_slot(job, slot, &peer, session).await;
        }
    }
}

async fn fetch_result(job: &Job, peer: &Endpoint, session: SessionId) -> Result<SegmentReport> {
    let frame = tokio::time::timeout(RESULT_TIMEOUT, job.channel.recv(peer, session))
        .await
        .map_err(|_| SphereError::Timeout)??;
    if frame.code != CMD_RESULT {
        return Err(SphereError::Protocol(format!(
            "se esperaba RESULT y llegó el código {}",
            frame.code
        )));
    }
    frame.parse()
}

/// Loop de control de un job. Corre en su propia tarea hasta que todos los
/// segmentos terminan, el job falla o se cancela.
pub async fn run_loop(job: Arc<Job>) {
    let (total, slots) = {
        let t = job.tables();
        (t.total, t.slots.len())
    };
    info!("job {}: {} segmentos en {} slots", job.spec.id, total, slots);

    loop {
        if job.canceled() {
            job.tables().set_fatal(SphereError::Canceled);
            info!("job {} cancelado", job.spec.id);
            break;
        }
        if !job.tables().unfinished() {
            break;
        }

        if check_slots(&job).await == 0 {
            let mut t = job.tables();
            t.set_fatal(SphereError::AllWorkersFailed);
            warn!(
                "job {}: ningún worker puede avanzar ({:?})",
                job.spec.id,
                t.read_error()
            );
            break;
        }

        match tokio::time::timeout(job.tick, job.channel.recv_progress()).await {
            Ok(Some(ev)) => handle_progress(&job, ev).await,
            Ok(None) => tokio::time::sleep(job.tick).await,
            Err(_) => {}
        }
    }

    teardown(&job).await;
}

/// Libera los slots, cierra los buckets y publica la señal de fin.
async fn teardown(job: &Job) {
    let sessions: Vec<(Endpoint, SessionId)> = {
        let t = job.tables();
        t.slots
            .iter()
            .filter(|s| s.is_active())
            .filter_map(|s| s.session.map(|ss| (s.data().clone(), ss)))
            .collect()
    };
    for (peer, session) in sessions {
        if let Err(e) = job.channel.send(&peer, session, Frame::release()).await {
            debug!("no se pudo liberar {} (sesión {}): {}", peer, session, e);
        }
        job.channel.disconnect(&peer, session).await;
    }

    let buckets: Vec<(usize, Endpoint, SessionId)> = {
        let t = job.tables();
        t.buckets
            .iter()
            .filter(|b| !b.is_closed())
            .map(|b| (b.id, b.endpoint.clone(), b.session))
            .collect()
    };

    let mut waiting = Vec::new();
    for (id, peer, session) in buckets {
        match job.channel.send(&peer, session, Frame::close_bucket()).await {
            Ok(()) => waiting.push((id, peer, session)),
            Err(e) => {
                warn!("bucket {} inaccesible al cerrar ({}): {}", id, peer, e);
                job.tables().lose_bucket(id);
            }
        }
    }

    for (id, peer, session) in waiting {
        wait_bucket_closed(job, id, &peer, session).await;
        job.channel.disconnect(&peer, session).await;
    }

    let mut t = job.tables();
    let pruned = t.output.prune_empty();
    if pruned > 0 {
        debug!("{} archivos de salida vacíos descartados", pruned);
    }
    t.finished = true;
    info!(
        "job {} terminado: {}/{} segmentos, promedio {:?} por segmento, {} escrituras locales, buckets sanos: {}",
        job.spec.id, t.completed, t.total, t.avg_run_time, t.local_writes, t.bucket_healthy
    );
    job.done_tx.send_replace(true);
}

async fn wait_bucket_closed(job: &Job, id: usize, peer: &Endpoint, session: SessionId) {
    loop {
        if job.canceled() {
            job.tables().close_bucket(id);
            return;
        }

        match tokio::time::timeout(job.tick, job.channel.recv(peer, session)).await {
            Ok(Ok(frame)) if frame.code == CMD_BUCKET_CLOSED => {
                match frame.parse::<BucketClosed>() {
                    Ok(ack) => info!(
                        "bucket {} cerrado: {} bytes, {} filas",
                        id, ack.bytes, ack.rows
                    ),
                    Err(e) => warn!("confirmación inválida del bucket {}: {}", id, e),
                }
                job.tables().close_bucket(id);
                return;
            }
            Ok(Ok(frame)) => {
                debug!("bucket {}: frame {} ignorado", id, frame.code);
            }
            Ok(Err(e)) => {
                warn!("bucket {} inaccesible ({}): {}", id, peer, e);
                job.tables().lose_bucket(id);
                return;
            }
            Err(_) => {
                if !job.channel.is_connected(peer, session).await {
                    warn!("bucket {} desconectado ({})", id, peer);
                    job.tables().lose_bucket(id);
                    return;
                }
            }
        }
    }
}
