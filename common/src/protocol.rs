//! Protocolo del canal de datos entre el scheduler, los workers y los shufflers.
//!
//! Cada frame es `[código i32 BE][largo u32 BE][payload]`; el payload es JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::api::ProcessingMode;
use crate::error::{Result, SphereError};
use crate::segment::SegmentId;
use crate::topology::Endpoint;
use crate::{SessionId, SlotId};

/* ---------------- códigos de comando ---------------- */

/// Primer frame de toda conexión: identifica la sesión
pub const CMD_HELLO: i32 = 0;
/// Inicializa la entrada del pool (UDF, modo de salida, buckets)
pub const CMD_INIT: i32 = 1;
/// Entrega un segmento (offset, length, id, file); offset -1 = liberar
pub const CMD_SEGMENT: i32 = 2;
pub const CMD_PROGRESS: i32 = 3;
pub const CMD_RESULT: i32 = 4;
pub const CMD_SHUFFLE_PUSH: i32 = 5;
pub const CMD_SHUFFLE_ACK: i32 = 6;
/// El shuffler tiene demasiado backlog; reintentar más tarde
pub const CMD_SHUFFLE_BUSY: i32 = 7;
pub const CMD_OPEN_BUCKET: i32 = 8;
pub const CMD_BUCKET_CLOSED: i32 = 9;
pub const CMD_CLOSE_BUCKET: i32 = -1;

pub const RELEASE_OFFSET: i64 = -1;

/// Progreso negativo: falló el segmento, el worker sigue sano
pub const PROGRESS_SEGMENT_FAILED: i32 = -1;
/// Progreso negativo: el worker no puede seguir trabajando
pub const PROGRESS_WORKER_FAULT: i32 = -2;
/// Código que se guarda en segmentos que agotaron reintentos por pérdida de workers
pub const PROGRESS_WORKER_LOST: i32 = -3;

pub const MAX_FRAME_LEN: usize = 1 << 30;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: i32, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn json<T: Serialize>(code: i32, msg: &T) -> Result<Self> {
        Ok(Self::new(code, serde_json::to_vec(msg)?))
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            SphereError::Protocol(format!("payload inválido para código {}: {e}", self.code))
        })
    }

    /// Centinela que libera un slot: un segmento con offset -1.
    pub fn release() -> Self {
        let msg = SegmentAssignment {
            id: 0,
            file: String::new(),
            offset: RELEASE_OFFSET,
            length: 0,
        };
        // serializar este struct no puede fallar
        Self::new(CMD_SEGMENT, serde_json::to_vec(&msg).unwrap_or_default())
    }

    pub fn close_bucket() -> Self {
        Self::new(CMD_CLOSE_BUCKET, Vec::new())
    }
}

/// Codec de frames sobre `LengthDelimitedCodec`: el código de comando va
/// delante del largo y el payload queda tal cual.
#[derive(Debug)]
pub struct FrameCodec {
    // devuelve cabecera + payload; de la cabecera sale el código
    decoder: LengthDelimitedCodec,
    // escribe sólo largo + payload; el código lo pone `encode`
    encoder: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        let decoder = LengthDelimitedCodec::builder()
            .length_field_offset(4)
            .length_field_length(4)
            .length_adjustment(HEADER_LEN as isize)
            .num_skip(0)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        let encoder = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self { decoder, encoder }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SphereError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decoder.decode(src)? {
            Some(mut data) => {
                let code = data.get_i32();
                data.advance(HEADER_LEN - 4);
                Ok(Some(Frame {
                    code,
                    payload: data.to_vec(),
                }))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SphereError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > MAX_FRAME_LEN {
            return Err(SphereError::Protocol(format!(
                "frame de {} bytes supera el máximo",
                item.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_i32(item.code);
        self.encoder.encode(Bytes::from(item.payload), dst)?;
        Ok(())
    }
}

pub type FrameReader<R> = FramedRead<R, FrameCodec>;
pub type FrameWriter<W> = FramedWrite<W, FrameCodec>;

pub fn frame_reader<R: AsyncRead>(r: R) -> FrameReader<R> {
    FramedRead::new(r, FrameCodec::new())
}

pub fn frame_writer<W: AsyncWrite>(w: W) -> FrameWriter<W> {
    FramedWrite::new(w, FrameCodec::new())
}

/// Lectura y escritura sobre el mismo stream.
pub type FrameStream<T> = Framed<T, FrameCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> FrameStream<T> {
    Framed::new(io, FrameCodec::new())
}

/* ---------------- mensajes ---------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub session: SessionId,
}

/// Destino de un archivo lógico de salida en modo buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketTarget {
    pub bucket: usize,
    pub endpoint: Endpoint,
    pub session: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputTarget {
    Direct,
    LocalFile { path: String },
    /// Un destino por archivo lógico de salida (índice = id del archivo)
    Buckets { files: Vec<BucketTarget> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInit {
    pub slot: SlotId,
    pub op: String,
    pub param: String,
    /// Lote de registros por llamada a la UDF (0 = todo el segmento)
    pub rows: i64,
    pub output: OutputTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAssignment {
    pub id: SegmentId,
    pub file: String,
    pub offset: i64,
    pub length: i64,
}

impl SegmentAssignment {
    pub fn is_release(&self) -> bool {
        self.offset == RELEASE_OFFSET
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub slot: SlotId,
    /// 0..=100, o negativo con un código de error
    pub progress: i32,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWrite {
    pub file: usize,
    pub bytes: u64,
    pub rows: u64,
}

/// Lo que manda el worker en el frame RESULT al terminar un segmento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentReport {
    Data { data: Vec<u8>, index: Vec<u64> },
    Written { path: String, bytes: u64, rows: u64 },
    Buckets { files: Vec<FileWrite> },
}

/// Abre un bucket en el shuffler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub bucket: usize,
    pub path: String,
    pub name: String,
    pub mode: ProcessingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShufflePush {
    pub file: usize,
    pub rows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketClosed {
    pub bucket: usize,
    pub bytes: u64,
    pub rows: u64,
}
