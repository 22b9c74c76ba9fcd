use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use common::protocol::{
    frame_reader, frame_writer, Frame, FrameReader, FrameWriter, Hello, ProgressMessage, CMD_HELLO,
    CMD_PROGRESS,
};
use common::{Endpoint, Result, SessionId, SphereError};

/// Mensaje de progreso junto con la sesión por la que llegó.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub session: SessionId,
    pub message: ProgressMessage,
}

/// Canal de streaming hacia workers y shufflers, indexado por (peer, sesión).
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, peer: &Endpoint, session: SessionId, frame: Frame) -> Result<()>;

    /// Siguiente frame (que no sea de progreso) recibido de ese peer.
    async fn recv(&self, peer: &Endpoint, session: SessionId) -> Result<Frame>;

    /// Siguiente mensaje de progreso de cualquier worker. `None` si ya no
    /// puede llegar ninguno más.
    async fn recv_progress(&self) -> Option<ProgressEvent>;

    async fn is_connected(&self, peer: &Endpoint, session: SessionId) -> bool;

    async fn disconnect(&self, peer: &Endpoint, session: SessionId);
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type ConnKey = (Endpoint, SessionId);

struct Connection {
    writer: AsyncMutex<FrameWriter<OwnedWriteHalf>>,
    frames: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Implementación sobre TCP: una conexión por (peer, sesión). Cada conexión
/// tiene una tarea lectora que separa los frames de progreso (van a una cola
/// común) del resto (van a la cola de esa conexión).
pub struct TcpDataChannel {
    conns: Mutex<HashMap<ConnKey, Arc<Connection>>>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    progress_rx: AsyncMutex<mpsc::UnboundedReceiver<ProgressEvent>>,
}

impl Default for TcpDataChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpDataChannel {
    pub fn new() -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            conns: Mutex::new(HashMap::new()),
            progress_tx,
            progress_rx: AsyncMutex::new(progress_rx),
        }
    }

    fn existing(&self, peer: &Endpoint, session: SessionId) -> Option<Arc<Connection>> {
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.get(&(peer.clone(), session)).cloned()
    }

    async fn connection(&self, peer: &Endpoint, session: SessionId) -> Result<Arc<Connection>> {
        if let Some(conn) = self.existing(peer, session) {
            if conn.alive.load(Ordering::SeqCst) {
                return Ok(conn);
            }
        }

        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((peer.host.as_str(), peer.port)),
        )
        .await
        .map_err(|_| SphereError::Channel(format!("timeout conectando a {peer}")))?
        .map_err(|e| SphereError::Channel(format!("no se pudo conectar a {peer}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let (rd, wr) = stream.into_split();
        let mut wr = frame_writer(wr);
        wr.send(Frame::json(CMD_HELLO, &Hello { session })?).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            frame_reader(rd),
            tx,
            self.progress_tx.clone(),
            session,
            alive.clone(),
            peer.clone(),
        ));

        let conn = Arc::new(Connection {
            writer: AsyncMutex::new(wr),
            frames: AsyncMutex::new(rx),
            alive,
            reader,
        });

        debug!("conexión abierta con {} (sesión {})", peer, session);
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.insert((peer.clone(), session), conn.clone());
        Ok(conn)
    }
}

async fn read_loop(
    mut rd: FrameReader<OwnedReadHalf>,
    frames: mpsc::UnboundedSender<Frame>,
    progress: mpsc::UnboundedSender<ProgressEvent>,
    session: SessionId,
    alive: Arc<AtomicBool>,
    peer: Endpoint,
) {
    loop {
        match rd.next().await {
            Some(Ok(frame)) if frame.code == CMD_PROGRESS => {
                match frame.parse::<ProgressMessage>() {
                    Ok(message) => {
                        let _ = progress.send(ProgressEvent { session, message });
                    }
                    Err(e) => warn!("progreso inválido de {}: {}", peer, e),
                }
            }
            Some(Ok(frame)) => {
                if frames.send(frame).is_err() {
                    break;
                }
            }
            None => {
                debug!("{} cerró la conexión (sesión {})", peer, session);
                break;
            }
            Some(Err(e)) => {
                warn!("error leyendo de {} (sesión {}): {}", peer, session, e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

#[async_trait]
impl DataChannel for TcpDataChannel {
    async fn send(&self, peer: &Endpoint, session: SessionId, frame: Frame) -> Result<()> {
        let conn = self.connection(peer, session).await?;
        let mut writer = conn.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            conn.alive.store(false, Ordering::SeqCst);
            return Err(SphereError::Channel(format!("envío a {peer} falló: {e}")));
        }
        Ok(())
    }

    async fn recv(&self, peer: &Endpoint, session: SessionId) -> Result<Frame> {
        let conn = self
            .existing(peer, session)
            .ok_or_else(|| SphereError::Channel(format!("sin conexión con {peer}")))?;
        let mut frames = conn.frames.lock().await;
        frames
            .recv()
            .await
            .ok_or_else(|| SphereError::Channel(format!("{peer} cerró la conexión")))
    }

    async fn recv_progress(&self) -> Option<ProgressEvent> {
        self.progress_rx.lock().await.recv().await
    }

    async fn is_connected(&self, peer: &Endpoint, session: SessionId) -> bool {
        self.existing(peer, session)
            .map(|c| c.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn disconnect(&self, peer: &Endpoint, session: SessionId) {
        let removed = {
            let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
            conns.remove(&(peer.clone(), session))
        };
        if let Some(conn) = removed {
            conn.alive.store(false, Ordering::SeqCst);
            let mut writer = conn.writer.lock().await;
            let _ = writer.close().await;
        }
    }
}
