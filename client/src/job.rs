//! Estado de un job: tablas de segmentos, slots y buckets, contadores y
//! stream de salida. Todo vive detrás de un único `Mutex<JobTables>`; acá
//! sólo hay transiciones síncronas, el I/O lo hace el scheduler.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::protocol::{SegmentReport, PROGRESS_WORKER_FAULT, PROGRESS_WORKER_LOST};
use common::segment::MAX_SEGMENT_RETRIES;
use common::{
    DataSegment, Result, SegmentId, SegmentOutcome, SegmentResult, SegmentStatus, SessionId,
    SlotId, SphereError, StreamDescriptor,
};

use crate::buckets::Bucket;
use crate::workers::{SlotStatus, WorkerSlot};

/// Qué pasó con el segmento de un slot perdido.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLoss {
    /// Había buckets: el job ya no puede terminar bien
    JobFailed,
    /// El segmento volvió a pending
    Requeued(SegmentId),
    /// El segmento agotó los reintentos
    Failed(SegmentId),
    /// El slot no tenía segmento asignado
    Idle,
}

pub struct JobTables {
    pub segments: BTreeMap<SegmentId, DataSegment>,
    pub slots: Vec<WorkerSlot>,
    pub buckets: Vec<Bucket>,
    pub output: StreamDescriptor,
    pub total: usize,
    pub completed: usize,
    pub bucket_healthy: bool,
    pub fatal: Option<SphereError>,
    /// promedio móvil del tiempo por segmento
    pub avg_run_time: Option<Duration>,
    /// segmentos escritos al archivo local de salida
    pub local_writes: u64,
    pub finished: bool,
    progress_mark: u32,
    ready_tx: mpsc::UnboundedSender<SegmentId>,
}

impl JobTables {
    pub fn new(
        segments: Vec<DataSegment>,
        slots: Vec<WorkerSlot>,
        buckets: Vec<Bucket>,
        output: StreamDescriptor,
        ready_tx: mpsc::UnboundedSender<SegmentId>,
    ) -> Self {
        let total = segments.len();
        Self {
            segments: segments.into_iter().map(|s| (s.id, s)).collect(),
            slots,
            buckets,
            output,
            total,
            completed: 0,
            bucket_healthy: true,
            fatal: None,
            avg_run_time: None,
            local_writes: 0,
            finished: false,
            progress_mark: 0,
            ready_tx,
        }
    }

    /* ---------------- consultas ---------------- */

    pub fn unfinished(&self) -> bool {
        self.completed < self.total
    }

    /// Slots que no fueron abandonados.
    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_active()).count()
    }

    pub fn running_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Running)
            .count()
    }

    /// Error que corta el job, si lo hay.
    pub fn read_error(&self) -> Option<SphereError> {
        if !self.bucket_healthy {
            return Some(SphereError::BucketUnhealthy);
        }
        self.fatal.clone()
    }

    /// Guarda el primer error fatal; los siguientes se ignoran.
    pub fn set_fatal(&mut self, err: SphereError) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    /* ---------------- slots ---------------- */

    pub fn mark_initialized(&mut self, slot: SlotId, session: SessionId) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.session = Some(session);
            if s.status == SlotStatus::Uninitialized {
                s.status = SlotStatus::Idle;
            }
        }
    }

    /// El slot nunca pudo inicializarse; no tenía segmento.
    pub fn abandon_unused(&mut self, slot: SlotId) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.status = SlotStatus::Abandoned;
            s.queue.clear();
        }
    }

    /// Se perdió la conexión con un slot.
    pub fn handle_slot_loss(&mut self, slot: SlotId) -> SlotLoss {
        let Some(s) = self.slots.get_mut(slot) else {
            return SlotLoss::Idle;
        };
        s.status = SlotStatus::Abandoned;
        s.queue.clear();
        s.progress = 0;
        let current = s.current.take();

        if !self.buckets.is_empty() {
            // la salida parcial ya está repartida en los shufflers
            self.bucket_healthy = false;
            self.set_fatal(SphereError::BucketUnhealthy);
            return SlotLoss::JobFailed;
        }

        let Some(id) = current else {
            return SlotLoss::Idle;
        };
        let Some(seg) = self.segments.get_mut(&id) else {
            return SlotLoss::Idle;
        };

        seg.assigned_slot = None;
        seg.retry_count += 1;

        if seg.retry_count > MAX_SEGMENT_RETRIES {
            seg.status = SegmentStatus::Failed;
            seg.result = Some(SegmentOutcome::Failed {
                code: PROGRESS_WORKER_LOST,
                detail: format!("segmento perdido {} veces", seg.retry_count),
            });
            self.completed += 1;
            let _ = self.ready_tx.send(id);
            warn!("segmento {} agotó los reintentos", id);
            SlotLoss::Failed(id)
        } else {
            seg.status = SegmentStatus::Pending;
            debug!("segmento {} vuelve a pending (reintento {})", id, seg.retry_count);
            SlotLoss::Requeued(id)
        }
    }

    /// Próximo segmento pending para el slot, el más cercano primero.
    /// De paso limpia de la cola los que ya terminaron o se consumieron.
    pub fn next_candidate(&mut self, slot: SlotId) -> Option<SegmentId> {
        let segments = &self.segments;
        let s = self.slots.get_mut(slot)?;

        for q in s.queue.values_mut() {
            q.retain(|id| segments.get(id).is_some_and(|d| !d.is_terminal()));
            let found = q
                .iter()
                .find(|id| segments.get(*id).is_some_and(|d| d.status == SegmentStatus::Pending));
            if let Some(id) = found {
                return Some(*id);
            }
        }
        None
    }

    /// Asigna el segmento al slot. false si el estado cambió mientras tanto.
    pub fn assign(&mut self, slot: SlotId, id: SegmentId, now: Instant) -> bool {
        let slot_ok = self
            .slots
            .get(slot)
            .is_some_and(|s| s.status == SlotStatus::Idle && s.session.is_some());
        let seg_ok = self
            .segments
            .get(&id)
            .is_some_and(|d| d.status == SegmentStatus::Pending);
        if !slot_ok || !seg_ok {
            return false;
        }

        if let Some(seg) = self.segments.get_mut(&id) {
            seg.status = SegmentStatus::InProgress;
            seg.assigned_slot = Some(slot);
        }
        let s = &mut self.slots[slot];
        s.status = SlotStatus::Running;
        s.current = Some(id);
        s.progress = 0;
        s.started_at = Some(now);
        s.remove_from_queue(id);
        true
    }

    /* ---------------- mensajes de progreso ---------------- */

    pub fn update_progress(&mut self, slot: SlotId, progress: i32) {
        if let Some(s) = self.slots.get_mut(slot) {
            if s.status == SlotStatus::Running {
                s.progress = progress.clamp(0, 99);
            }
        }
    }

    /// El worker reportó un error para el segmento en curso.
    pub fn fail_segment(&mut self, slot: SlotId, code: i32, detail: String) -> Option<SegmentId> {
        let s = self.slots.get_mut(slot)?;
        if s.status != SlotStatus::Running {
            return None;
        }
        let id = s.current.take()?;
        s.progress = 0;
        s.status = if code == PROGRESS_WORKER_FAULT {
            s.queue.clear();
            SlotStatus::Abandoned
        } else {
            SlotStatus::Idle
        };

        let seg = self.segments.get_mut(&id)?;
        seg.status = SegmentStatus::Failed;
        seg.assigned_slot = None;
        seg.result = Some(SegmentOutcome::Failed { code, detail });
        self.completed += 1;
        let _ = self.ready_tx.send(id);
        Some(id)
    }

    /// El worker terminó el segmento y mandó su RESULT.
    pub fn complete_segment(
        &mut self,
        slot: SlotId,
        report: SegmentReport,
        now: Instant,
    ) -> Option<SegmentId> {
        let s = self.slots.get_mut(slot)?;
        if s.status != SlotStatus::Running {
            return None;
        }
        let id = s.current.take()?;
        s.status = SlotStatus::Idle;
        s.progress = 0;
        let elapsed = s.started_at.map(|t| now.saturating_duration_since(t));

        let outcome = match report {
            SegmentReport::Data { data, index } => SegmentOutcome::Data { data, index },
            SegmentReport::Written { path, bytes, rows } => {
                if let Some(f) = self.output.files.iter_mut().find(|f| f.name == path) {
                    f.size += bytes;
                    f.records += rows as i64;
                } else if let Some(f) = self.output.files.first_mut() {
                    f.size += bytes;
                    f.records += rows as i64;
                }
                self.local_writes += 1;
                SegmentOutcome::Written { bytes, rows }
            }
            SegmentReport::Buckets { files } => {
                let (mut bytes, mut rows) = (0, 0);
                for w in files {
                    if let Some(f) = self.output.files.get_mut(w.file) {
                        f.size += w.bytes;
                        f.records += w.rows as i64;
                    }
                    bytes += w.bytes;
                    rows += w.rows;
                }
                SegmentOutcome::Written { bytes, rows }
            }
        };

        let seg = self.segments.get_mut(&id)?;
        seg.status = SegmentStatus::Done;
        seg.assigned_slot = None;
        seg.result = Some(outcome);
        self.completed += 1;

        if let Some(elapsed) = elapsed {
            self.avg_run_time = Some(match self.avg_run_time {
                None => elapsed,
                Some(avg) => (avg * 7 + elapsed) / 8,
            });
        }

        let _ = self.ready_tx.send(id);
        Some(id)
    }

    /// Saca el segmento de la tabla y lo devuelve como resultado.
    pub fn take_result(&mut self, id: SegmentId) -> Option<SegmentResult> {
        let seg = self.segments.remove(&id)?;
        seg.to_result()
    }

    /* ---------------- buckets ---------------- */

    pub fn close_bucket(&mut self, id: usize) {
        if let Some(b) = self.buckets.iter_mut().find(|b| b.id == id) {
            b.progress = 100;
        }
    }

    /// El shuffler no responde: se da por cerrado y la salida queda incompleta.
    pub fn lose_bucket(&mut self, id: usize) {
        self.close_bucket(id);
        self.bucket_healthy = false;
        self.set_fatal(SphereError::BucketUnhealthy);
    }

    /* ---------------- progreso ---------------- */

    fn raw_progress(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        let running: f64 = self
            .slots
            .iter()
            .filter(|s| s.status == SlotStatus::Running)
            .map(|s| s.progress as f64 / 100.0)
            .sum();
        let pct = ((self.completed as f64 + running) * 100.0 / self.total as f64).floor();
        (pct as u32).min(100)
    }

    /// Progreso de la fase map, nunca decrece.
    pub fn map_progress(&mut self) -> Result<u32> {
        if let Some(e) = self.read_error() {
            return Err(e);
        }
        self.progress_mark = self.progress_mark.max(self.raw_progress());
        Ok(self.progress_mark)
    }

    /// Como `map_progress`, pero se queda en 99 mientras haya buckets abiertos.
    pub fn progress(&mut self) -> Result<u32> {
        let p = self.map_progress()?;
        if self.buckets.iter().any(|b| !b.is_closed()) {
            return Ok(p.min(99));
        }
        Ok(p)
    }

    pub fn reduce_progress(&self) -> Result<u32> {
        if self.buckets.is_empty() {
            return Err(SphereError::NoBucketAllocated);
        }
        if let Some(e) = self.read_error() {
            return Err(e);
        }
        let closed = self.buckets.iter().filter(|b| b.is_closed()).count();
        Ok((closed * 100 / self.buckets.len()) as u32)
    }
}
