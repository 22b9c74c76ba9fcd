//! Shuffler: recibe filas ya particionadas de los workers y las escribe en
//! los archivos de salida de cada bucket. En modo MapReduce reduce cada
//! archivo al cerrar el bucket.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use common::protocol::{
    frame_reader, frame_writer, BucketClosed, BucketSpec, Frame, Hello, ShufflePush,
    CMD_BUCKET_CLOSED, CMD_CLOSE_BUCKET, CMD_HELLO, CMD_OPEN_BUCKET, CMD_SHUFFLE_ACK,
    CMD_SHUFFLE_BUSY, CMD_SHUFFLE_PUSH,
};
use common::shuffle::SHUFFLER_BACKLOG_LIMIT;
use common::{ProcessingMode, SessionId};

use crate::files;
use crate::reduce;

type WriteTask = JoinHandle<std::io::Result<(usize, u64, u64)>>;

/// Un bucket abierto: dónde escribe y las escrituras en curso.
struct BucketSession {
    spec: BucketSpec,
    dir: PathBuf,
    // serializa los appends de distintos pushers al mismo bucket
    write_lock: Mutex<()>,
    pending: Mutex<Vec<WriteTask>>,
}

impl BucketSession {
    fn file_path(&self, file: usize) -> PathBuf {
        self.dir.join(format!("{}.{}", self.spec.name, file))
    }
}

#[derive(Clone)]
pub struct ShufflerState {
    data_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<SessionId, Arc<BucketSession>>>>,
    backlog: Arc<AtomicU64>,
    backlog_limit: u64,
}

impl ShufflerState {
    pub fn new(data_dir: PathBuf) -> Self {
        Self::with_backlog_limit(data_dir, SHUFFLER_BACKLOG_LIMIT)
    }

    pub fn with_backlog_limit(data_dir: PathBuf, backlog_limit: u64) -> Self {
        Self {
            data_dir,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            backlog: Arc::new(AtomicU64::new(0)),
            backlog_limit,
        }
    }

    fn session(&self, id: SessionId) -> Option<Arc<BucketSession>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(&id).cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::SeqCst)
    }

    fn open(&self, session: SessionId, spec: BucketSpec) -> std::io::Result<()> {
        let dir = files::resolve(&self.data_dir, &spec.path)?;
        fs::create_dir_all(&dir)?;
        info!(
            "bucket {} abierto (sesión {}, {}/{}.*, {:?})",
            spec.bucket, session, spec.path, spec.name, spec.mode
        );
        let bucket = Arc::new(BucketSession {
            spec,
            dir,
            write_lock: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
        });
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session, bucket);
        Ok(())
    }

    /// true si el push fue aceptado; false = BUSY.
    fn push(&self, bucket: &Arc<BucketSession>, push: ShufflePush) -> bool {
        let bytes: u64 = push.rows.iter().map(|r| r.len() as u64 + 1).sum();
        let backlog = self.backlog.load(Ordering::SeqCst);
        // con backlog vacío se acepta siempre, aunque el push solo supere el límite
        if backlog > 0 && backlog + bytes > self.backlog_limit {
            return false;
        }
        self.backlog.fetch_add(bytes, Ordering::SeqCst);

        let b = bucket.clone();
        let counter = self.backlog.clone();
        let task = tokio::task::spawn_blocking(move || {
            let res = append_rows(&b, push.file, &push.rows);
            counter.fetch_sub(bytes, Ordering::SeqCst);
            res.map(|()| (push.file, bytes, push.rows.len() as u64))
        });

        let mut pending = bucket.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(task);
        true
    }

    /// Espera las escrituras pendientes, reduce si corresponde y da de baja
    /// la sesión. Devuelve el total escrito en el bucket.
    async fn close(&self, session: SessionId) -> BucketClosed {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(&session)
        };
        let Some(bucket) = removed else {
            warn!("CLOSE_BUCKET para sesión {} desconocida", session);
            return BucketClosed {
                bucket: 0,
                bytes: 0,
                rows: 0,
            };
        };

        let tasks: Vec<WriteTask> = {
            let mut pending = bucket.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };

        let mut per_file: BTreeMap<usize, (u64, u64)> = BTreeMap::new();
        for task in tasks {
            match task.await {
                Ok(Ok((file, bytes, rows))) => {
                    let e = per_file.entry(file).or_insert((0, 0));
                    e.0 += bytes;
                    e.1 += rows;
                }
                Ok(Err(e)) => warn!("bucket {}: escritura fallida: {}", bucket.spec.bucket, e),
                Err(e) => warn!("bucket {}: tarea de escritura abortada: {}", bucket.spec.bucket, e),
            }
        }

        if bucket.spec.mode == ProcessingMode::MapReduce {
            let paths: Vec<(usize, PathBuf)> = per_file
                .keys()
                .map(|f| (*f, bucket.file_path(*f)))
                .collect();
            let threshold = reduce::max_in_mem_keys();
            let reduced = tokio::task::spawn_blocking(move || reduce_all(&paths, threshold)).await;
            match reduced {
                Ok(results) => {
                    for (file, written) in results {
                        per_file.insert(file, written);
                    }
                }
                Err(e) => warn!("bucket {}: reduce abortado: {}", bucket.spec.bucket, e),
            }
        }

        let (bytes, rows) = per_file
            .values()
            .fold((0, 0), |acc, (b, r)| (acc.0 + b, acc.1 + r));
        info!(
            "bucket {} cerrado (sesión {}): {} archivos, {} bytes, {} filas",
            bucket.spec.bucket,
            session,
            per_file.len(),
            bytes,
            rows
        );
        debug!(
            "quedan {} buckets abiertos, backlog {} bytes",
            self.open_sessions(),
            self.backlog()
        );
        BucketClosed {
            bucket: bucket.spec.bucket,
            bytes,
            rows,
        }
    }
}

fn append_rows(bucket: &BucketSession, file: usize, rows: &[String]) -> std::io::Result<()> {
    let mut buf = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum());
    for row in rows {
        buf.push_str(row);
        buf.push('\n');
    }

    let _guard = bucket.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(bucket.file_path(file))?;
    f.write_all(buf.as_bytes())
}

fn reduce_all(paths: &[(usize, PathBuf)], threshold: usize) -> Vec<(usize, (u64, u64))> {
    let mut out = Vec::new();
    for (file, path) in paths {
        match reduce::reduce_file_in_place(path, threshold) {
            Ok(written) => out.push((*file, written)),
            Err(e) => warn!("reduce de {} falló: {}", path.display(), e),
        }
    }
    out
}

pub async fn serve(listener: TcpListener, state: ShufflerState) -> Result<()> {
    info!("shuffler escuchando en {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let st = state.clone();
        tokio::spawn(async move {
            let (rd, wr) = stream.into_split();
            if let Err(e) = handle_connection(rd, wr, st).await {
                debug!("conexión de shuffle con {} terminó: {}", peer, e);
            }
        });
    }
}

/// Una conexión: HELLO con la sesión del bucket, después OPEN_BUCKET /
/// SHUFFLE_PUSH / CLOSE_BUCKET hasta que el otro lado cierre.
pub async fn handle_connection<R, W>(rd: R, wr: W, state: ShufflerState) -> Result<()>
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
        anyhow::bail!("se esperaba HELLO, llegó {}", first.code);
    }
    let Hello { session } = first.parse()?;

    while let Some(frame) = rd.next().await.transpose()? {
        match frame.code {
            CMD_OPEN_BUCKET => {
                let spec: BucketSpec = frame.parse()?;
                state.open(session, spec)?;
            }
            CMD_SHUFFLE_PUSH => {
                let push: ShufflePush = frame.parse()?;
                // sin bucket todavía (OPEN_BUCKET en camino): el pusher reintenta
                let code = match state.session(session) {
                    Some(bucket) if state.push(&bucket, push) => CMD_SHUFFLE_ACK,
                    Some(_) => CMD_SHUFFLE_BUSY,
                    None => {
                        debug!("push para sesión {} sin bucket abierto", session);
                        CMD_SHUFFLE_BUSY
                    }
                };
                wr.send(Frame::new(code, Vec::new())).await?;
            }
            CMD_CLOSE_BUCKET => {
                let closed = state.close(session).await;
                wr.send(Frame::json(CMD_BUCKET_CLOSED, &closed)?).await?;
            }
            other => warn!("shuffler: código {} ignorado (sesión {})", other, session),
        }
    }
    Ok(())
}

#[cfg(test)]
pub fn bucket_file(data_dir: &std::path::Path, path: &str, name: &str, file: usize) -> std::io::Result<PathBuf> {
    files::resolve(data_dir, &format!("{}/{}.{}", path, name, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::protocol::{framed, FrameStream};
    use tokio::io::DuplexStream;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("worker_shuffler_tests").join(sub);
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(&base).unwrap();
        base
    }

    fn spec(mode: ProcessingMode) -> BucketSpec {
        BucketSpec {
            bucket: 1,
            path: "out".into(),
            name: "wc".into(),
            mode,
        }
    }

    type Conn = FrameStream<DuplexStream>;

    async fn connect(state: &ShufflerState, session: SessionId) -> Conn {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let st = state.clone();
        tokio::spawn(async move {
            let (rd, wr) = tokio::io::split(server);
            let _ = handle_connection(rd, wr, st).await;
        });
        let mut conn = framed(client);
        conn.send(Frame::json(CMD_HELLO, &Hello { session }).unwrap())
            .await
            .unwrap();
        conn
    }

    async fn send(conn: &mut Conn, frame: Frame) {
        conn.send(frame).await.unwrap();
    }

    async fn reply(conn: &mut Conn) -> Frame {
        conn.next().await.unwrap().unwrap()
    }

    async fn push(conn: &mut Conn, file: usize, rows: &[&str]) -> i32 {
        let msg = ShufflePush {
            file,
            rows: rows.iter().map(|s| s.to_string()).collect(),
        };
        send(conn, Frame::json(CMD_SHUFFLE_PUSH, &msg).unwrap()).await;
        reply(conn).await.code
    }

    #[tokio::test]
    async fn map_escribe_filas_por_archivo() {
        let dir = temp_dir("map");
        let state = ShufflerState::new(dir.clone());

        let mut control = connect(&state, 42).await;
        send(&mut control, Frame::json(CMD_OPEN_BUCKET, &spec(ProcessingMode::Map)).unwrap()).await;

        // el pusher llega por otra conexión con la misma sesión
        let mut pusher = connect(&state, 42).await;
        while state.open_sessions() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(push(&mut pusher, 0, &["a,1", "b,2"]).await, CMD_SHUFFLE_ACK);
        assert_eq!(push(&mut pusher, 3, &["c,3"]).await, CMD_SHUFFLE_ACK);

        send(&mut control, Frame::close_bucket()).await;
        let closed_frame = reply(&mut control).await;
        assert_eq!(closed_frame.code, CMD_BUCKET_CLOSED);
        let closed: BucketClosed = closed_frame.parse().unwrap();
        assert_eq!(closed.bucket, 1);
        assert_eq!(closed.rows, 3);
        assert_eq!(closed.bytes, 12);

        let f0 = bucket_file(&dir, "out", "wc", 0).unwrap();
        assert_eq!(std::fs::read_to_string(f0).unwrap(), "a,1\nb,2\n");
        let f3 = bucket_file(&dir, "out", "wc", 3).unwrap();
        assert_eq!(std::fs::read_to_string(f3).unwrap(), "c,3\n");
        assert_eq!(state.open_sessions(), 0);
        assert_eq!(state.backlog(), 0);
    }

    #[tokio::test]
    async fn mapreduce_reduce_al_cerrar() {
        let dir = temp_dir("mapreduce");
        let state = ShufflerState::new(dir.clone());

        let mut conn = connect(&state, 7).await;
        send(&mut conn, Frame::json(CMD_OPEN_BUCKET, &spec(ProcessingMode::MapReduce)).unwrap()).await;
        assert_eq!(push(&mut conn, 0, &["hola,1", "mundo,1"]).await, CMD_SHUFFLE_ACK);
        assert_eq!(push(&mut conn, 0, &["hola,1"]).await, CMD_SHUFFLE_ACK);

        send(&mut conn, Frame::close_bucket()).await;
        let closed: BucketClosed = reply(&mut conn).await.parse().unwrap();
        assert_eq!(closed.rows, 2);

        let f0 = bucket_file(&dir, "out", "wc", 0).unwrap();
        assert_eq!(std::fs::read_to_string(f0).unwrap(), "hola,2\nmundo,1\n");
    }

    #[tokio::test]
    async fn backlog_lleno_responde_busy() {
        let dir = temp_dir("busy");
        let state = ShufflerState::with_backlog_limit(dir, 10);
        state.open(9, spec(ProcessingMode::Map)).unwrap();
        let bucket = state.session(9).unwrap();

        // simula escrituras todavía en curso
        state.backlog.fetch_add(8, Ordering::SeqCst);
        let big = ShufflePush {
            file: 0,
            rows: vec!["123456".into()],
        };
        assert!(!state.push(&bucket, big.clone()));

        // con backlog vacío se acepta aunque supere el límite
        state.backlog.store(0, Ordering::SeqCst);
        assert!(state.push(&bucket, big));
    }

    #[tokio::test]
    async fn push_sin_bucket_responde_busy() {
        let dir = temp_dir("sin_bucket");
        let state = ShufflerState::new(dir);
        let mut conn = connect(&state, 99).await;

        assert_eq!(push(&mut conn, 0, &["x"]).await, CMD_SHUFFLE_BUSY);
        assert_eq!(state.backlog(), 0);
    }
}
