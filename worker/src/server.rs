//! Canal de datos del worker: una conexión por sesión del pool.
//!
//! HELLO → INIT → SEGMENT* (hasta el segmento de liberación o EOF). Por cada
//! segmento se manda progreso 0, 50 y 100 y después el RESULT.

use std::{
    collections::{BTreeMap, HashMap},
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};
use tracing::{debug, info, warn};

use common::protocol::{
    frame_reader, frame_writer, framed, BucketTarget, FileWrite, Frame, FrameStream, FrameWriter,
    Hello, OutputTarget, PoolInit, ProgressMessage, SegmentAssignment, SegmentReport, ShufflePush,
    CMD_HELLO, CMD_INIT, CMD_PROGRESS, CMD_RESULT, CMD_SEGMENT, CMD_SHUFFLE_ACK, CMD_SHUFFLE_BUSY,
    CMD_SHUFFLE_PUSH, PROGRESS_SEGMENT_FAILED, PROGRESS_WORKER_FAULT,
};
use common::shuffle::{bucket_for_key, FlushThreshold};
use common::{Endpoint, SessionId, SlotId};

use crate::files;
use crate::udf::{self, OutputRow};

const BUSY_BACKOFF_START: Duration = Duration::from_millis(50);
const BUSY_BACKOFF_MAX: Duration = Duration::from_secs(2);
const MAX_BUSY_RETRIES: u32 = 60;

#[derive(Clone)]
pub struct DataServer {
    data_dir: PathBuf,
    permits: Arc<Semaphore>,
    // appends de salida local de todas las sesiones
    local_lock: Arc<Mutex<()>>,
}

impl DataServer {
    pub fn new(data_dir: PathBuf, max_concurrency: usize) -> Self {
        Self {
            data_dir,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            local_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub async fn serve(listener: TcpListener, server: DataServer) -> Result<()> {
    info!("canal de datos escuchando en {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let srv = server.clone();
        tokio::spawn(async move {
            let (rd, wr) = stream.into_split();
            if let Err(e) = handle_connection(rd, wr, srv).await {
                warn!("sesión con {} terminó con error: {}", peer, e);
            }
        });
    }
}

async fn send_progress<W: AsyncWrite + Unpin>(
    wr: &mut FrameWriter<W>,
    slot: SlotId,
    progress: i32,
    detail: Option<String>,
) -> Result<()> {
    let msg = ProgressMessage {
        slot,
        progress,
        detail,
    };
    wr.send(Frame::json(CMD_PROGRESS, &msg)?).await?;
    Ok(())
}

pub async fn handle_connection<R, W>(rd: R, wr: W, server: DataServer) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rd = frame_reader(rd);
    let mut wr = frame_writer(wr);

    let Some(first) = rd.next().await.transpose()? else {
        return Ok(());
    };
    if first.code != CMD_HELLO {
        return Err(anyhow!("se esperaba HELLO, llegó {}", first.code));
    }
    let Hello { session } = first.parse()?;

    let Some(frame) = rd.next().await.transpose()? else {
        return Ok(());
    };
    if frame.code != CMD_INIT {
        return Err(anyhow!("sesión {}: se esperaba INIT, llegó {}", session, frame.code));
    }
    let init: PoolInit = frame.parse()?;
    info!(
        "sesión {} lista: slot {}, udf {} ({:?})",
        session, init.slot, init.op, init.output
    );

    // una UDF desconocida se informa con el primer segmento, cuando el slot
    // ya tiene algo corriendo
    let fault = (!udf::is_known(&init.op)).then(|| format!("udf desconocida: {}", init.op));

    let mut pusher = match &init.output {
        OutputTarget::Buckets { files } => Some(ShufflePusher::new(files.clone(), FlushThreshold::random())),
        _ => None,
    };

    while let Some(frame) = rd.next().await.transpose()? {
        if frame.code != CMD_SEGMENT {
            debug!("sesión {}: código {} ignorado", session, frame.code);
            continue;
        }
        let seg: SegmentAssignment = frame.parse()?;
        if seg.is_release() {
            debug!("sesión {} liberada", session);
            break;
        }

        if let Some(detail) = &fault {
            send_progress(&mut wr, init.slot, PROGRESS_WORKER_FAULT, Some(detail.clone())).await?;
            continue;
        }

        run_segment(&mut wr, &server, &init, pusher.as_mut(), seg).await?;
    }

    Ok(())
}

async fn run_segment<W: AsyncWrite + Unpin>(
    wr: &mut FrameWriter<W>,
    server: &DataServer,
    init: &PoolInit,
    pusher: Option<&mut ShufflePusher>,
    seg: SegmentAssignment,
) -> Result<()> {
    let slot = init.slot;
    send_progress(wr, slot, 0, None).await?;

    let permit = server.permits.clone().acquire_owned().await?;
    let dir = server.data_dir.clone();
    let (op, param, rows) = (init.op.clone(), init.param.clone(), init.rows);
    let input = seg.clone();
    let computed = tokio::task::spawn_blocking(move || {
        let path = files::resolve(&dir, &input.file).map_err(|e| e.to_string())?;
        let lines = files::read_records(&path, input.offset, input.length)
            .map_err(|e| format!("{}: {}", input.file, e))?;
        udf::apply(&op, &param, &lines, rows)
    })
    .await;
    drop(permit);

    let out = match computed {
        Ok(Ok(out)) => out,
        Ok(Err(detail)) => {
            warn!("segmento {} falló: {}", seg.id, detail);
            return send_progress(wr, slot, PROGRESS_SEGMENT_FAILED, Some(detail)).await;
        }
        Err(e) => {
            warn!("la UDF abortó en el segmento {}: {}", seg.id, e);
            return send_progress(wr, slot, PROGRESS_WORKER_FAULT, Some(e.to_string())).await;
        }
    };

    send_progress(wr, slot, 50, None).await?;

    let delivered = match (&init.output, pusher) {
        (OutputTarget::Direct, _) => Ok(direct_report(&out)),
        (OutputTarget::LocalFile { path }, _) => write_local(server, path, out).await,
        (OutputTarget::Buckets { .. }, Some(pusher)) => pusher
            .push_segment(out)
            .await
            .map(|files| SegmentReport::Buckets { files }),
        (OutputTarget::Buckets { .. }, None) => Err(anyhow!("salida por buckets sin destinos")),
    };

    let report = match delivered {
        Ok(r) => r,
        Err(e) => {
            warn!("no se pudo entregar la salida del segmento {}: {}", seg.id, e);
            return send_progress(wr, slot, PROGRESS_SEGMENT_FAILED, Some(e.to_string())).await;
        }
    };

    debug!("segmento {} terminado ({})", seg.id, seg.file);
    send_progress(wr, slot, 100, None).await?;
    wr.send(Frame::json(CMD_RESULT, &report)?).await?;
    Ok(())
}

/// Filas concatenadas, con el offset de inicio de cada una.
fn direct_report(rows: &[OutputRow]) -> SegmentReport {
    let mut data = Vec::new();
    let mut index = Vec::with_capacity(rows.len());
    for row in rows {
        index.push(data.len() as u64);
        data.extend_from_slice(row.line.as_bytes());
        data.push(b'\n');
    }
    SegmentReport::Data { data, index }
}

async fn write_local(server: &DataServer, path: &str, rows: Vec<OutputRow>) -> Result<SegmentReport> {
    let target = files::resolve(&server.data_dir, path)?;
    let lock = server.local_lock.clone();

    let (bytes, count) = tokio::task::spawn_blocking(move || -> std::io::Result<(u64, u64)> {
        let mut buf = Vec::new();
        for row in &rows {
            buf.extend_from_slice(row.line.as_bytes());
            buf.push(b'\n');
        }

        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&target)?;
        f.write_all(&buf)?;
        Ok((buf.len() as u64, rows.len() as u64))
    })
    .await??;

    Ok(SegmentReport::Written {
        path: path.to_string(),
        bytes,
        rows: count,
    })
}

/// Reparte filas entre los archivos lógicos de salida y las empuja a los
/// shufflers cuando lo pendiente supera el umbral (y al final de cada
/// segmento).
pub struct ShufflePusher {
    targets: Vec<BucketTarget>,
    conns: HashMap<(Endpoint, SessionId), FrameStream<TcpStream>>,
    pending: BTreeMap<usize, Vec<String>>,
    pending_bytes: u64,
    threshold: FlushThreshold,
}

impl ShufflePusher {
    pub fn new(targets: Vec<BucketTarget>, threshold: FlushThreshold) -> Self {
        Self {
            targets,
            conns: HashMap::new(),
            pending: BTreeMap::new(),
            pending_bytes: 0,
            threshold,
        }
    }

    /// Entrega todas las filas del segmento; devuelve lo escrito por archivo.
    pub async fn push_segment(&mut self, rows: Vec<OutputRow>) -> Result<Vec<FileWrite>> {
        if self.targets.is_empty() {
            return Err(anyhow!("salida por buckets sin destinos"));
        }

        let mut written: BTreeMap<usize, (u64, u64)> = BTreeMap::new();
        for row in rows {
            let file = bucket_for_key(&row.key, self.targets.len());
            let bytes = row.byte_len();
            let w = written.entry(file).or_insert((0, 0));
            w.0 += bytes;
            w.1 += 1;

            self.pending.entry(file).or_default().push(row.line);
            self.pending_bytes += bytes;
            if self.threshold.reached(self.pending_bytes) {
                self.flush().await?;
            }
        }
        self.flush().await?;

        Ok(written
            .into_iter()
            .map(|(file, (bytes, rows))| FileWrite { file, bytes, rows })
            .collect())
    }

    async fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (file, rows) in pending {
            if !rows.is_empty() {
                self.push_file(file, rows).await?;
            }
        }
        self.pending_bytes = 0;
        self.threshold.advance();
        Ok(())
    }

    async fn push_file(&mut self, file: usize, rows: Vec<String>) -> Result<()> {
        let target = self
            .targets
            .get(file)
            .cloned()
            .ok_or_else(|| anyhow!("archivo de salida {} sin bucket", file))?;
        let frame = Frame::json(CMD_SHUFFLE_PUSH, &ShufflePush { file, rows })?;

        let mut backoff = BUSY_BACKOFF_START;
        for _ in 0..MAX_BUSY_RETRIES {
            let key = (target.endpoint.clone(), target.session);
            let reply = match self.exchange(&key, &frame).await {
                Ok(r) => r,
                Err(e) => {
                    self.conns.remove(&key);
                    return Err(e);
                }
            };

            match reply {
                CMD_SHUFFLE_ACK => return Ok(()),
                CMD_SHUFFLE_BUSY => {
                    debug!("shuffler {} ocupado, reintento en {:?}", target.endpoint, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BUSY_BACKOFF_MAX);
                }
                other => {
                    self.conns.remove(&key);
                    return Err(anyhow!("respuesta inesperada del shuffler: {}", other));
                }
            }
        }
        Err(anyhow!(
            "shuffler {} sigue ocupado tras {} intentos",
            target.endpoint,
            MAX_BUSY_RETRIES
        ))
    }

    async fn exchange(&mut self, key: &(Endpoint, SessionId), frame: &Frame) -> Result<i32> {
        if !self.conns.contains_key(key) {
            let (peer, session) = key;
            let stream = TcpStream::connect((peer.host.as_str(), peer.port)).await?;
            let _ = stream.set_nodelay(true);
            let mut conn = framed(stream);
            conn.send(Frame::json(CMD_HELLO, &Hello { session: *session })?)
                .await?;
            self.conns.insert(key.clone(), conn);
        }
        let conn = self
            .conns
            .get_mut(key)
            .ok_or_else(|| anyhow!("conexión con {} perdida", key.0))?;

        conn.send(frame.clone()).await?;
        let reply = conn
            .next()
            .await
            .transpose()?
            .ok_or_else(|| anyhow!("el shuffler {} cerró la conexión", key.0))?;
        Ok(reply.code)
    }
}
