//! Coordinador y canal en memoria para probar el scheduler sin red.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicI32, Ordering},
        Mutex,
    },
    time::Duration,
};

use common::protocol::{
    BucketClosed, FileWrite, Frame, OutputTarget, PoolInit, ProgressMessage, SegmentAssignment,
    SegmentReport, CMD_BUCKET_CLOSED, CMD_CLOSE_BUCKET, CMD_INIT, CMD_RESULT, CMD_SEGMENT,
};
use common::{
    Endpoint, FileMeta, InitWorkerRequest, Result, SessionId, ShufflerRequest, ShufflerResponse,
    SphereError, WorkerEntry,
};

use crate::channel::{DataChannel, ProgressEvent};
use crate::coordinator::Coordinator;

pub fn entry(host: &str) -> WorkerEntry {
    WorkerEntry {
        control: Endpoint::new(host, 7001),
        data: Endpoint::new(host, 6001),
    }
}

/// Archivo de 100 bytes y 10 registros guardado en `host`.
pub fn file(name: &str, host: &str) -> FileMeta {
    FileMeta {
        name: name.to_string(),
        size: 100,
        records: 10,
        locations: vec![Endpoint::new(host, 6001)],
    }
}

pub struct FakeCoordinator {
    workers: Vec<WorkerEntry>,
    files: Vec<FileMeta>,
    failing_init: HashSet<String>,
    shufflers: bool,
    next_session: AtomicI32,
}

impl FakeCoordinator {
    pub fn new(workers: Vec<WorkerEntry>) -> Self {
        Self {
            workers,
            files: Vec::new(),
            failing_init: HashSet::new(),
            shufflers: true,
            next_session: AtomicI32::new(1),
        }
    }

    pub fn with_files(mut self, files: Vec<FileMeta>) -> Self {
        self.files = files;
        self
    }

    pub fn without_shufflers(mut self) -> Self {
        self.shufflers = false;
        self
    }

    pub fn failing_init(mut self, host: &str) -> Self {
        self.failing_init.insert(host.to_string());
        self
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn resolve_inputs(&self, paths: &[String]) -> Result<Vec<FileMeta>> {
        Ok(self
            .files
            .iter()
            .filter(|f| paths.iter().any(|p| p == "*" || *p == f.name))
            .cloned()
            .collect())
    }

    async fn allocate_workers(&self) -> Result<Vec<WorkerEntry>> {
        Ok(self.workers.clone())
    }

    async fn init_worker(&self, req: &InitWorkerRequest) -> Result<SessionId> {
        if self.failing_init.contains(&req.worker.data.host) {
            return Err(SphereError::Coordinator("init rechazado".into()));
        }
        Ok(self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    async fn allocate_shuffler(&self, req: &ShufflerRequest) -> Result<ShufflerResponse> {
        if !self.shufflers {
            return Err(SphereError::Coordinator("sin shufflers".into()));
        }
        Ok(ShufflerResponse {
            port: req.worker.control.port,
            session: 1000 + self.next_session.fetch_add(1, Ordering::SeqCst),
        })
    }
}

type Key = (Endpoint, SessionId);

#[derive(Default)]
struct FakeState {
    sent: Vec<(Endpoint, Frame)>,
    inits: HashMap<Key, PoolInit>,
    replies: HashMap<Key, VecDeque<Frame>>,
    progress: VecDeque<ProgressEvent>,
    connected: HashSet<Key>,
    down: HashSet<Endpoint>,
    silent: HashSet<String>,
    fail_next: HashMap<String, i32>,
    drop_on_close: bool,
}

/// Workers que terminan cada segmento en el acto y shufflers que confirman
/// el cierre, salvo que se configure otra cosa.
#[derive(Default)]
pub struct FakeChannel {
    state: Mutex<FakeState>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Los workers de este host aceptan segmentos pero nunca responden.
    pub fn silence(&self, host: &str) {
        self.state().silent.insert(host.to_string());
    }

    /// Se cae el endpoint: `is_connected` da false y los envíos fallan.
    pub fn kill(&self, host: &str, port: u16) {
        let peer = Endpoint::new(host, port);
        let mut st = self.state();
        st.connected.retain(|(p, _)| *p != peer);
        st.down.insert(peer);
    }

    /// El próximo segmento que reciba `host` termina con `code` en vez de
    /// progreso 100 y RESULT.
    pub fn fail_next(&self, host: &str, code: i32) {
        self.state().fail_next.insert(host.to_string(), code);
    }

    /// Los shufflers se caen en cuanto reciben `CLOSE_BUCKET`.
    pub fn drop_on_close(&self) {
        self.state().drop_on_close = true;
    }

    pub fn sent_with_code(&self, code: i32) -> usize {
        self.state().sent.iter().filter(|(_, f)| f.code == code).count()
    }

    pub fn sent_to(&self, code: i32) -> Vec<Endpoint> {
        self.state()
            .sent
            .iter()
            .filter(|(_, f)| f.code == code)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn releases(&self) -> usize {
        self.state()
            .sent
            .iter()
            .filter(|(_, f)| f.code == CMD_SEGMENT)
            .filter(|(_, f)| f.parse::<SegmentAssignment>().unwrap().is_release())
            .count()
    }
}

fn report_for(init: &PoolInit, seg: &SegmentAssignment) -> SegmentReport {
    match &init.output {
        OutputTarget::Direct => SegmentReport::Data {
            data: format!("{}\n", seg.file).into_bytes(),
            index: vec![0],
        },
        OutputTarget::LocalFile { path } => SegmentReport::Written {
            path: path.clone(),
            bytes: 10,
            rows: 1,
        },
        OutputTarget::Buckets { files } => SegmentReport::Buckets {
            files: vec![FileWrite {
                file: seg.id as usize % files.len(),
                bytes: 10,
                rows: 1,
            }],
        },
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    async fn send(&self, peer: &Endpoint, session: SessionId, frame: Frame) -> Result<()> {
        let mut st = self.state();
        if st.down.contains(peer) {
            return Err(SphereError::Channel(format!("{peer} caído")));
        }
        let key = (peer.clone(), session);
        st.connected.insert(key.clone());
        st.sent.push((peer.clone(), frame.clone()));

        match frame.code {
            CMD_INIT => {
                let init: PoolInit = frame.parse()?;
                st.inits.insert(key, init);
            }
            CMD_SEGMENT => {
                let seg: SegmentAssignment = frame.parse()?;
                if seg.is_release() {
                    return Ok(());
                }
                let Some(init) = st.inits.get(&key).cloned() else {
                    return Err(SphereError::Protocol("segmento sin INIT".into()));
                };
                if let Some(code) = st.fail_next.remove(&peer.host) {
                    st.progress.push_back(ProgressEvent {
                        session,
                        message: ProgressMessage {
                            slot: init.slot,
                            progress: code,
                            detail: Some(format!("segmento {} falló", seg.id)),
                        },
                    });
                    return Ok(());
                }
                if st.silent.contains(&peer.host) {
                    return Ok(());
                }
                let result = Frame::json(CMD_RESULT, &report_for(&init, &seg))?;
                st.replies.entry(key).or_default().push_back(result);
                st.progress.push_back(ProgressEvent {
                    session,
                    message: ProgressMessage {
                        slot: init.slot,
                        progress: 100,
                        detail: None,
                    },
                });
            }
            CMD_CLOSE_BUCKET => {
                if st.drop_on_close {
                    st.down.insert(peer.clone());
                    st.connected.remove(&key);
                } else {
                    let ack = BucketClosed {
                        bucket: 0,
                        bytes: 0,
                        rows: 0,
                    };
                    let frame = Frame::json(CMD_BUCKET_CLOSED, &ack)?;
                    st.replies.entry(key).or_default().push_back(frame);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn recv(&self, peer: &Endpoint, session: SessionId) -> Result<Frame> {
        let key = (peer.clone(), session);
        loop {
            {
                let mut st = self.state();
                if st.down.contains(peer) {
                    return Err(SphereError::Channel(format!("{peer} caído")));
                }
                if let Some(frame) = st.replies.get_mut(&key).and_then(|q| q.pop_front()) {
                    return Ok(frame);
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn recv_progress(&self) -> Option<ProgressEvent> {
        loop {
            if let Some(ev) = self.state().progress.pop_front() {
                return Some(ev);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn is_connected(&self, peer: &Endpoint, session: SessionId) -> bool {
        let st = self.state();
        !st.down.contains(peer) && st.connected.contains(&(peer.clone(), session))
    }

    async fn disconnect(&self, peer: &Endpoint, session: SessionId) {
        self.state().connected.remove(&(peer.clone(), session));
    }
}
