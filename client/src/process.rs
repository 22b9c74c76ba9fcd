use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use common::protocol::OutputTarget;
use common::segment::segment_data;
use common::{
    new_job_id, Endpoint, ProcessingMode, Result, SchedulerConfig, SegmentResult, SphereError,
    StreamDescriptor, StreamFile,
};

use crate::buckets::{assign_output_files, open_buckets, BucketRequest};
use crate::channel::DataChannel;
use crate::coordinator::Coordinator;
use crate::job::JobTables;
use crate::scheduler::{run_loop, Job, JobSpec};
use crate::workers::{prepare_job_queue, prepare_workers};

/// Cada cuánto `read(true)` vuelve a mirar el estado aunque no llegue nada.
const READ_RECHECK: Duration = Duration::from_secs(10);
/// Intervalo mínimo entre logs de `wait_for_completion`.
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Salida en buckets (shuffle por clave).
#[derive(Debug, Clone, Default)]
pub struct BucketOutput {
    pub path: String,
    pub name: String,
    /// Archivos lógicos de salida; 0 = uno por bucket
    pub files: usize,
    /// Pista de ubicación por archivo (índice = id del archivo)
    pub hints: Vec<Option<Endpoint>>,
}

#[derive(Debug, Clone)]
pub enum OutputSpec {
    /// Los resultados vuelven al caller por `read`
    Direct,
    /// Cada worker agrega al mismo path en su nodo
    LocalFile { path: String },
    Buckets(BucketOutput),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    Segment(SegmentResult),
    /// Todos los segmentos terminaron y ya fueron leídos
    Finished,
}

/// Punto de entrada del scheduler: lanza jobs sobre el pool de workers y
/// entrega sus resultados.
pub struct SphereProcess {
    coordinator: Arc<dyn Coordinator>,
    channel: Arc<dyn DataChannel>,
    config: SchedulerConfig,
    current: Mutex<Option<Arc<Job>>>,
    scope: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SphereProcess {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        channel: Arc<dyn DataChannel>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            coordinator,
            channel,
            config,
            current: Mutex::new(None),
            scope: AsyncMutex::new(None),
        }
    }

    pub fn set_min_unit_size(&mut self, bytes: u64) {
        self.config.min_unit_size = bytes;
    }

    pub fn set_max_unit_size(&mut self, bytes: u64) {
        self.config.max_unit_size = bytes;
    }

    pub fn set_proc_num_per_node(&mut self, procs: usize) {
        self.config.procs_per_node = procs.max(1);
    }

    pub fn set_data_move_attr(&mut self, allow: bool) {
        self.config.allow_data_move = allow;
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Arma el stream de entrada con los metadatos que da el coordinador.
    pub async fn prepare_input(&self, paths: &[String]) -> Result<StreamDescriptor> {
        let files = self.coordinator.resolve_inputs(paths).await?;
        Ok(StreamDescriptor::input(files))
    }

    fn job(&self) -> Option<Arc<Job>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Lanza la UDF `op` sobre `input`. Vuelve apenas el loop de control
    /// quedó corriendo; los resultados se consumen con `read`.
    pub async fn run(
        &self,
        input: &StreamDescriptor,
        output: OutputSpec,
        op: &str,
        rows: i64,
        param: &str,
    ) -> Result<()> {
        self.start(input, output, op, rows, param, ProcessingMode::Map)
            .await
    }

    /// Como `run` con salida en buckets, pero los shufflers reducen por clave
    /// al cerrar.
    pub async fn run_mr(
        &self,
        input: &StreamDescriptor,
        output: BucketOutput,
        op: &str,
        rows: i64,
        param: &str,
    ) -> Result<()> {
        self.start(
            input,
            OutputSpec::Buckets(output),
            op,
            rows,
            param,
            ProcessingMode::MapReduce,
        )
        .await
    }

    async fn start(
        &self,
        input: &StreamDescriptor,
        output: OutputSpec,
        op: &str,
        rows: i64,
        param: &str,
        mode: ProcessingMode,
    ) -> Result<()> {
        let mut scope = self.scope.lock().await;
        if let Some(previous) = scope.take() {
            let _ = previous.await;
        }

        let workers = self.coordinator.allocate_workers().await?;
        if workers.is_empty() {
            return Err(SphereError::NoWorkersAvailable);
        }

        let mut slots = prepare_workers(&workers, self.config.procs_per_node);
        let segments = segment_data(input, rows, slots.len(), &self.config.limits())?;
        let by_id = segments.iter().map(|s| (s.id, s.clone())).collect();

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        prepare_job_queue(
            &mut slots,
            &by_id,
            &self.config.topology,
            self.config.allow_data_move,
            &mut rng,
        );

        let (stream, buckets, target) = match output {
            OutputSpec::Direct => (StreamDescriptor::default(), Vec::new(), OutputTarget::Direct),
            OutputSpec::LocalFile { path } => {
                let stream = StreamDescriptor {
                    files: vec![StreamFile {
                        name: path.clone(),
                        size: 0,
                        records: 0,
                        locations: Vec::new(),
                        bucket: None,
                    }],
                    path: Some(path.clone()),
                    name: None,
                };
                (stream, Vec::new(), OutputTarget::LocalFile { path })
            }
            OutputSpec::Buckets(spec) => {
                let req = BucketRequest {
                    path: &spec.path,
                    name: &spec.name,
                    file_count: spec.files,
                    mode,
                };
                let buckets =
                    open_buckets(&*self.coordinator, &*self.channel, &workers, &req).await?;

                let count = if spec.files == 0 {
                    buckets.len()
                } else {
                    spec.files
                };
                let mut stream = StreamDescriptor::output(&spec.path, &spec.name, count);
                for (i, hint) in spec.hints.into_iter().enumerate() {
                    if let Some(h) = hint {
                        stream.set_location_hint(i, h);
                    }
                }
                let files = assign_output_files(&mut stream, &buckets);
                (stream, buckets, OutputTarget::Buckets { files })
            }
        };

        let spec = JobSpec {
            id: new_job_id(),
            op: op.to_string(),
            param: param.to_string(),
            rows,
            mode,
            output: target,
        };
        info!(
            "job {}: udf '{}' sobre {} archivos, {} segmentos, {} workers",
            spec.id,
            spec.op,
            input.file_count(),
            segments.len(),
            workers.len()
        );

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let tables = JobTables::new(segments, slots, buckets, stream, ready_tx);
        let job = Arc::new(Job::new(
            tables,
            ready_rx,
            self.coordinator.clone(),
            self.channel.clone(),
            spec,
            self.config.tick,
        ));

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(job.clone());
        *scope = Some(tokio::spawn(run_loop(job)));
        Ok(())
    }

    /// Próximo segmento terminado (o fallido). Cada segmento se entrega una
    /// sola vez. Con `wait == false` devuelve `Timeout` si no hay nada listo.
    pub async fn read(&self, wait: bool) -> Result<ReadResult> {
        let Some(job) = self.job() else {
            return Ok(ReadResult::Finished);
        };
        let mut reader = job.reader.lock().await;

        loop {
            {
                let mut t = job.tables();
                if let Some(e) = t.read_error() {
                    return Err(e);
                }
                // los ids se mandan con el lock tomado: si el canal está vacío
                // y el job terminó, no va a llegar nada más
                match reader.ready_rx.try_recv() {
                    Ok(id) => {
                        if let Some(res) = t.take_result(id) {
                            return Ok(ReadResult::Segment(res));
                        }
                        continue;
                    }
                    Err(_) if t.finished => return Ok(ReadResult::Finished),
                    Err(_) => {}
                }
            }

            if !wait {
                return Err(SphereError::Timeout);
            }

            let reader = &mut *reader;
            tokio::select! {
                Some(id) = reader.ready_rx.recv() => {
                    let mut t = job.tables();
                    if let Some(e) = t.read_error() {
                        return Err(e);
                    }
                    if let Some(res) = t.take_result(id) {
                        return Ok(ReadResult::Segment(res));
                    }
                }
                _ = reader.done_rx.changed() => {}
                _ = tokio::time::sleep(READ_RECHECK) => {}
            }
        }
    }

    /// Porcentaje completado; 99 mientras haya buckets sin cerrar.
    pub fn check_progress(&self) -> Result<u32> {
        match self.job() {
            Some(job) => job.tables().progress(),
            None => Ok(0),
        }
    }

    pub fn check_map_progress(&self) -> Result<u32> {
        match self.job() {
            Some(job) => job.tables().map_progress(),
            None => Ok(0),
        }
    }

    pub fn check_reduce_progress(&self) -> Result<u32> {
        match self.job() {
            Some(job) => job.tables().reduce_progress(),
            None => Err(SphereError::NoBucketAllocated),
        }
    }

    /// Lee y descarta resultados hasta que el job termina.
    pub async fn wait_for_completion(&self) -> Result<()> {
        let mut last_log = Instant::now();
        loop {
            match self.read(true).await? {
                ReadResult::Segment(res) => {
                    if res.is_failed() {
                        warn!("segmento {} falló: {:?}", res.segment, res.outcome);
                    }
                }
                ReadResult::Finished => return Ok(()),
            }

            if last_log.elapsed() >= WAIT_LOG_INTERVAL {
                last_log = Instant::now();
                if let Ok(p) = self.check_progress() {
                    info!("progreso: {}%", p);
                }
            }
        }
    }

    /// Cancela el job en curso y espera a que el loop termine. Los workers
    /// reciben la liberación pero el trabajo remoto en curso no se interrumpe.
    pub async fn close(&self) {
        if let Some(job) = self.job() {
            job.cancel();
        }
        let mut scope = self.scope.lock().await;
        if let Some(handle) = scope.take() {
            if let Err(e) = handle.await {
                warn!("el loop de control terminó con error: {}", e);
            }
        }
    }

    /// Stream de salida del último job (archivos vacíos ya descartados si
    /// terminó).
    pub fn output(&self) -> Option<StreamDescriptor> {
        self.job().map(|job| job.tables().output.clone())
    }

    /// Promedio móvil (7:1) del tiempo por segmento del último job.
    pub fn avg_run_time(&self) -> Option<Duration> {
        self.job().and_then(|job| job.tables().avg_run_time)
    }

    /// Segmentos que el último job escribió al archivo local de salida.
    pub fn local_writes(&self) -> u64 {
        self.job().map_or(0, |job| job.tables().local_writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{entry, file, FakeChannel, FakeCoordinator};
    use common::protocol::{CMD_INIT, CMD_SEGMENT, PROGRESS_WORKER_FAULT};
    use common::SegmentOutcome;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(5),
            seed: Some(7),
            ..SchedulerConfig::default()
        }
    }

    fn process(coord: FakeCoordinator, ch: Arc<FakeChannel>) -> SphereProcess {
        SphereProcess::new(Arc::new(coord), ch, config())
    }

    async fn read_all(p: &SphereProcess) -> Vec<SegmentResult> {
        let mut out = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), p.read(true))
                .await
                .expect("read colgado")
                .unwrap()
            {
                ReadResult::Segment(r) => out.push(r),
                ReadResult::Finished => return out,
            }
        }
    }

    /// Espera a que `host` tenga un segmento asignado.
    async fn wait_for_segment(ch: &FakeChannel, host: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ch.sent_to(CMD_SEGMENT).iter().any(|p| p.host == host) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("el segmento nunca se asignó");
    }

    #[tokio::test]
    async fn salida_directa_entrega_cada_segmento_una_vez() {
        let workers = vec![entry("10.0.0.1"), entry("10.0.0.2")];
        let coord = FakeCoordinator::new(workers)
            .with_files(vec![file("a", "10.0.0.1"), file("b", "10.0.0.2"), file("c", "10.0.0.1")]);
        let ch = Arc::new(FakeChannel::new());
        let p = process(coord, ch.clone());

        let input = p.prepare_input(&["*".to_string()]).await.unwrap();
        assert_eq!(input.file_count(), 3);
        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();

        let mut results = read_all(&p).await;
        results.sort_by_key(|r| r.segment);
        assert_eq!(results.len(), 3);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.segment, i as u64);
            assert!(matches!(r.outcome, SegmentOutcome::Data { .. }));
        }

        assert_eq!(p.read(false).await.unwrap(), ReadResult::Finished);
        assert_eq!(p.check_progress(), Ok(100));
        assert_eq!(ch.sent_with_code(CMD_INIT), 2);
        assert_eq!(ch.releases(), 2);
        assert_eq!(p.local_writes(), 0);
        p.close().await;
    }

    #[tokio::test]
    async fn worker_caido_reencola_el_segmento_en_otro_slot() {
        let workers = vec![entry("10.0.0.1"), entry("10.0.0.2")];
        let coord = FakeCoordinator::new(workers).with_files(vec![file("a", "10.0.0.1")]);
        let ch = Arc::new(FakeChannel::new());
        ch.silence("10.0.0.1");
        let p = process(coord, ch.clone());
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();
        wait_for_segment(&ch, "10.0.0.1").await;
        ch.kill("10.0.0.1", 6001);

        let results = read_all(&p).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_failed());
        assert_eq!(results[0].retries, 1);
        let last = ch.sent_to(CMD_SEGMENT).into_iter().next_back().unwrap();
        assert_eq!(last.host, "10.0.0.2");
        assert_eq!(p.check_progress(), Ok(100));
    }

    #[tokio::test]
    async fn slot_perdido_con_buckets_abiertos_deja_el_job_no_sano() {
        let workers = vec![entry("10.0.0.1"), entry("10.0.0.2")];
        let coord = FakeCoordinator::new(workers)
            .with_files(vec![file("a", "10.0.0.1"), file("b", "10.0.0.2")]);
        let ch = Arc::new(FakeChannel::new());
        ch.silence("10.0.0.1");
        let p = process(coord, ch.clone());
        let input = p.prepare_input(&["*".to_string()]).await.unwrap();

        let output = BucketOutput {
            path: "/out".into(),
            name: "wc".into(),
            files: 2,
            hints: Vec::new(),
        };
        p.run_mr(&input, output, "wordcount", 0, "").await.unwrap();
        wait_for_segment(&ch, "10.0.0.1").await;
        // se cae el canal de datos; el shuffler del mismo host sigue vivo
        ch.kill("10.0.0.1", 6001);

        let err = tokio::time::timeout(Duration::from_secs(5), p.wait_for_completion())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, SphereError::BucketUnhealthy);
        assert_eq!(p.check_progress(), Err(SphereError::BucketUnhealthy));
    }

    #[tokio::test]
    async fn falla_del_worker_libera_y_desconecta_el_slot() {
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")])
            .with_files(vec![file("a", "10.0.0.1")]);
        let ch = Arc::new(FakeChannel::new());
        ch.fail_next("10.0.0.1", PROGRESS_WORKER_FAULT);
        let p = process(coord, ch.clone());
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();
        let results = read_all(&p).await;
        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            SegmentOutcome::Failed { code, .. } => assert_eq!(*code, PROGRESS_WORKER_FAULT),
            other => panic!("se esperaba una falla: {other:?}"),
        }

        // el slot abandonado recibe una sola liberación y queda desconectado
        assert_eq!(ch.releases(), 1);
        assert!(!ch.is_connected(&entry("10.0.0.1").data, 1).await);
        assert_eq!(p.check_progress(), Ok(100));
    }

    #[tokio::test]
    async fn segundo_run_espera_al_loop_anterior() {
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")])
            .with_files(vec![file("a", "10.0.0.1"), file("b", "10.0.0.1")]);
        let ch = Arc::new(FakeChannel::new());
        let p = process(coord, ch.clone());
        let first = p.prepare_input(&["*".to_string()]).await.unwrap();
        let second = p.prepare_input(&["a".to_string()]).await.unwrap();

        p.run(&first, OutputSpec::Direct, "identity", 0, "").await.unwrap();
        p.run(&second, OutputSpec::Direct, "identity", 0, "").await.unwrap();

        // el primer job ya terminó y liberó su slot; el segundo todavía no corrió
        assert_eq!(ch.releases(), 1);
        assert_eq!(ch.sent_with_code(CMD_INIT), 1);

        p.wait_for_completion().await.unwrap();
        assert_eq!(p.check_progress(), Ok(100));
        assert_eq!(ch.sent_with_code(CMD_INIT), 2);
        assert_eq!(ch.releases(), 2);
    }

    #[tokio::test]
    async fn sin_workers_no_arranca() {
        let coord = FakeCoordinator::new(Vec::new()).with_files(vec![file("a", "10.0.0.1")]);
        let p = process(coord, Arc::new(FakeChannel::new()));
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        let err = p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap_err();
        assert_eq!(err, SphereError::NoWorkersAvailable);
        assert_eq!(p.read(false).await.unwrap(), ReadResult::Finished);
    }

    #[tokio::test]
    async fn entrada_sin_ubicacion_no_arranca() {
        let mut missing = file("a", "10.0.0.1");
        missing.locations.clear();
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")]).with_files(vec![missing]);
        let p = process(coord, Arc::new(FakeChannel::new()));
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        let err = p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap_err();
        assert!(matches!(err, SphereError::MissingInput(_)));
    }

    #[tokio::test]
    async fn segmentos_sin_worker_local_fallan_el_job() {
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")])
            .with_files(vec![file("a", "10.0.9.9")]);
        let mut p = process(coord, Arc::new(FakeChannel::new()));
        p.set_data_move_attr(false);
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), p.read(true))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, SphereError::AllWorkersFailed);
        assert_eq!(p.check_progress(), Err(SphereError::AllWorkersFailed));
    }

    #[tokio::test]
    async fn init_fallido_abandona_el_slot_y_sigue_con_otro() {
        let workers = vec![entry("10.0.0.1"), entry("10.0.0.2")];
        let coord = FakeCoordinator::new(workers)
            .with_files(vec![file("a", "10.0.0.1"), file("b", "10.0.0.1")])
            .failing_init("10.0.0.1");
        let ch = Arc::new(FakeChannel::new());
        let p = process(coord, ch.clone());
        let input = p.prepare_input(&["*".to_string()]).await.unwrap();

        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();
        let results = read_all(&p).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_failed()));
        // todo se ejecutó en el único worker que pudo inicializarse
        assert!(ch
            .sent_to(CMD_SEGMENT)
            .iter()
            .all(|peer| peer.host == "10.0.0.2"));
    }

    #[tokio::test]
    async fn read_sin_espera_da_timeout() {
        let ch = Arc::new(FakeChannel::new());
        ch.silence("10.0.0.1");
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")])
            .with_files(vec![file("a", "10.0.0.1")]);
        let p = process(coord, ch);
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();
        assert_eq!(p.read(false).await, Err(SphereError::Timeout));

        p.close().await;
        assert_eq!(p.read(false).await, Err(SphereError::Canceled));
        assert_eq!(p.check_progress(), Err(SphereError::Canceled));
    }

    #[tokio::test]
    async fn salida_local_acumula_escrituras() {
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")])
            .with_files(vec![file("a", "10.0.0.1"), file("b", "10.0.0.1")]);
        let p = process(coord, Arc::new(FakeChannel::new()));
        let input = p.prepare_input(&["*".to_string()]).await.unwrap();

        let output = OutputSpec::LocalFile {
            path: "/tmp/sphere.out".into(),
        };
        p.run(&input, output, "identity", 0, "").await.unwrap();
        p.wait_for_completion().await.unwrap();

        let out = p.output().unwrap();
        assert_eq!(out.file_count(), 1);
        assert_eq!(out.files[0].name, "/tmp/sphere.out");
        assert_eq!(out.files[0].size, 20);
        assert_eq!(out.files[0].records, 2);
        assert_eq!(p.local_writes(), 2);
        assert!(p.avg_run_time().is_some());
    }

    #[tokio::test]
    async fn buckets_cierran_y_se_descartan_archivos_vacios() {
        let workers = vec![entry("10.0.0.1"), entry("10.0.0.2")];
        let coord = FakeCoordinator::new(workers).with_files(vec![
            file("a", "10.0.0.1"),
            file("b", "10.0.0.2"),
        ]);
        let ch = Arc::new(FakeChannel::new());
        let p = process(coord, ch);
        let input = p.prepare_input(&["*".to_string()]).await.unwrap();

        let output = BucketOutput {
            path: "/out".into(),
            name: "wc".into(),
            files: 4,
            hints: Vec::new(),
        };
        p.run_mr(&input, output, "wordcount", 0, "").await.unwrap();
        p.wait_for_completion().await.unwrap();

        assert_eq!(p.check_progress(), Ok(100));
        assert_eq!(p.check_reduce_progress(), Ok(100));
        // el worker falso escribe el segmento i en el archivo i % 4
        let out = p.output().unwrap();
        let names: Vec<&str> = out.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["wc.0", "wc.1"]);
    }

    #[tokio::test]
    async fn bucket_que_no_confirma_deja_el_job_no_sano() {
        let workers = vec![entry("10.0.0.1")];
        let coord = FakeCoordinator::new(workers).with_files(vec![file("a", "10.0.0.1")]);
        let ch = Arc::new(FakeChannel::new());
        let p = process(coord, ch.clone());
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();

        let output = BucketOutput {
            path: "/out".into(),
            name: "r".into(),
            files: 0,
            hints: Vec::new(),
        };
        ch.drop_on_close();
        p.run_mr(&input, output, "wordcount", 0, "").await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), p.wait_for_completion())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, SphereError::BucketUnhealthy);
        assert_eq!(p.check_progress(), Err(SphereError::BucketUnhealthy));
    }

    #[tokio::test]
    async fn reduce_sin_buckets() {
        let coord = FakeCoordinator::new(vec![entry("10.0.0.1")])
            .with_files(vec![file("a", "10.0.0.1")]);
        let p = process(coord, Arc::new(FakeChannel::new()));
        let input = p.prepare_input(&["a".to_string()]).await.unwrap();
        p.run(&input, OutputSpec::Direct, "identity", 0, "").await.unwrap();

        assert_eq!(p.check_reduce_progress(), Err(SphereError::NoBucketAllocated));
        p.wait_for_completion().await.unwrap();
    }
}
