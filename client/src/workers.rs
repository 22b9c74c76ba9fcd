use rand::Rng;
use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

use common::{DataSegment, Endpoint, SegmentId, SessionId, SlotId, Topology, WorkerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Todavía no se conectó (se inicializa al primer segmento)
    Uninitialized,
    Idle,
    Running,
    Abandoned,
}

/// Un slot de ejecución en un worker remoto. Un worker físico puede tener
/// varios slots ("procs por nodo").
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub id: SlotId,
    pub worker: WorkerEntry,
    pub status: SlotStatus,
    pub current: Option<SegmentId>,
    pub progress: i32,
    pub started_at: Option<Instant>,
    pub session: Option<SessionId>,
    /// distancia de localidad -> segmentos en orden FIFO
    pub queue: BTreeMap<u32, VecDeque<SegmentId>>,
}

impl WorkerSlot {
    fn new(id: SlotId, worker: WorkerEntry) -> Self {
        Self {
            id,
            worker,
            status: SlotStatus::Uninitialized,
            current: None,
            progress: 0,
            started_at: None,
            session: None,
            queue: BTreeMap::new(),
        }
    }

    pub fn data(&self) -> &Endpoint {
        &self.worker.data
    }

    pub fn is_active(&self) -> bool {
        self.status != SlotStatus::Abandoned
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.values().map(|q| q.len()).sum()
    }

    pub fn remove_from_queue(&mut self, id: SegmentId) {
        for q in self.queue.values_mut() {
            q.retain(|x| *x != id);
        }
    }
}

/// Replica la lista de workers `procs_per_node` veces.
/// Slot id = core * cantidad_de_workers + índice_del_worker.
pub fn prepare_workers(workers: &[WorkerEntry], procs_per_node: usize) -> Vec<WorkerSlot> {
    let n = workers.len();
    let mut slots = Vec::with_capacity(n * procs_per_node.max(1));
    for core in 0..procs_per_node.max(1) {
        for (i, w) in workers.iter().enumerate() {
            slots.push(WorkerSlot::new(core * n + i, w.clone()));
        }
    }
    slots
}

/// Arma la cola de localidad de cada slot.
///
/// Para cada slot se recorre la tabla de segmentos una vez, empezando en un
/// offset aleatorio, y cada segmento va a `queue[distancia]`. Sin movimiento
/// de datos, los segmentos que no están en el host del slot se saltan.
pub fn prepare_job_queue<R: Rng>(
    slots: &mut [WorkerSlot],
    segments: &BTreeMap<SegmentId, DataSegment>,
    topology: &Topology,
    allow_data_move: bool,
    rng: &mut R,
) {
    let ids: Vec<SegmentId> = segments.keys().copied().collect();
    if ids.is_empty() {
        return;
    }

    for slot in slots.iter_mut() {
        slot.queue.clear();
        let start = rng.random_range(0..ids.len());

        for k in 0..ids.len() {
            let id = ids[(start + k) % ids.len()];
            let seg = &segments[&id];
            let dist = topology.min_distance(&slot.worker.data.host, &seg.locations);
            if !allow_data_move && dist != 0 {
                continue;
            }
            slot.queue.entry(dist).or_default().push_back(id);
        }
    }
}
