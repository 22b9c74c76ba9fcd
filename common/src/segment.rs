use serde::{Deserialize, Serialize};

use crate::error::{Result, SphereError};
use crate::stream::{StreamDescriptor, StreamFile};
use crate::topology::Endpoint;
use crate::SlotId;

pub type SegmentId = u64;

/// Reasignaciones permitidas tras perder un worker antes de dar el segmento
/// por fallido.
pub const MAX_SEGMENT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Lo que queda guardado de un segmento terminado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentOutcome {
    /// Salida directa: bytes del resultado + offsets de inicio de cada fila
    Data { data: Vec<u8>, index: Vec<u64> },
    /// Salida escrita en otro lado (archivo local o buckets)
    Written { bytes: u64, rows: u64 },
    Failed { code: i32, detail: String },
}

/// Resultado que devuelve `read`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentResult {
    pub segment: SegmentId,
    pub file: String,
    pub offset: i64,
    pub length: i64,
    pub retries: u32,
    pub outcome: SegmentOutcome,
}

impl SegmentResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SegmentOutcome::Failed { .. })
    }
}

/// Unidad de trabajo: un rango de registros (o un archivo entero) de un
/// archivo de entrada.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub id: SegmentId,
    pub file: String,
    pub file_index: usize,
    pub offset: i64,
    /// -1 = archivo completo
    pub length: i64,
    pub size: u64,
    pub locations: Vec<Endpoint>,
    pub assigned_slot: Option<SlotId>,
    pub status: SegmentStatus,
    pub retry_count: u32,
    pub result: Option<SegmentOutcome>,
}

impl DataSegment {
    fn new(id: SegmentId, file_index: usize, file: &StreamFile, offset: i64, length: i64) -> Self {
        // tamaño estimado proporcional a los registros que cubre
        let size = if length < 0 || file.records <= 0 {
            file.size
        } else {
            (file.size as u128 * length as u128 / file.records as u128) as u64
        };

        Self {
            id,
            file: file.name.clone(),
            file_index,
            offset,
            length,
            size,
            locations: file.locations.clone(),
            assigned_slot: None,
            status: SegmentStatus::Pending,
            retry_count: 0,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SegmentStatus::Done | SegmentStatus::Failed)
    }

    /// Convierte el segmento terminado en lo que ve el caller.
    pub fn to_result(&self) -> Option<SegmentResult> {
        let outcome = self.result.clone()?;
        Some(SegmentResult {
            segment: self.id,
            file: self.file.clone(),
            offset: self.offset,
            length: self.length,
            retries: self.retry_count,
            outcome,
        })
    }
}

/// Límites de tamaño (en bytes) de la carga promedio por worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSizeLimits {
    pub min_unit_size: u64,
    pub max_unit_size: u64,
}

impl Default for UnitSizeLimits {
    fn default() -> Self {
        Self {
            min_unit_size: crate::config::DEFAULT_MIN_UNIT_SIZE,
            max_unit_size: crate::config::DEFAULT_MAX_UNIT_SIZE,
        }
    }
}

/// Registros por segmento, de forma que la carga promedio de cada worker
/// quede dentro de `[min_unit_size, max_unit_size]` bytes. Nunca menor que 1.
pub fn compute_unit_size(
    total_bytes: u64,
    total_records: u64,
    worker_count: usize,
    limits: &UnitSizeLimits,
) -> u64 {
    let workers = worker_count.max(1) as u64;
    let avg = total_bytes / workers;

    let unit = if avg > limits.max_unit_size {
        let n = total_bytes.div_ceil(limits.max_unit_size.max(1)).max(1);
        total_records / n
    } else if avg < limits.min_unit_size {
        let n = total_bytes.div_ceil(limits.min_unit_size.max(1)).max(1);
        total_records / n
    } else {
        total_records / workers
    };

    unit.max(1)
}

/// Parte un stream de entrada en segmentos.
///
/// - `rows == 0`: un segmento por archivo.
/// - `rows != 0`: rangos de registros de `compute_unit_size` registros;
///   exige que todos los archivos tengan índice.
///
/// `rows` es además el tamaño de lote de la UDF, pero eso no cambia los
/// cortes. Con la misma entrada y los mismos límites siempre sale lo mismo.
pub fn segment_data(
    stream: &StreamDescriptor,
    rows: i64,
    worker_count: usize,
    limits: &UnitSizeLimits,
) -> Result<Vec<DataSegment>> {
    let mut out = Vec::new();

    if rows == 0 {
        for (i, f) in stream.files.iter().enumerate() {
            if f.locations.is_empty() {
                return Err(SphereError::MissingInput(f.name.clone()));
            }
            out.push(DataSegment::new(out.len() as SegmentId, i, f, 0, f.records));
        }
        return Ok(out);
    }

    for f in &stream.files {
        if f.records < 0 {
            return Err(SphereError::NoIndex(f.name.clone()));
        }
        if f.locations.is_empty() {
            return Err(SphereError::MissingInput(f.name.clone()));
        }
    }

    let total_records = stream.total_records().unwrap_or(0);
    let unit = compute_unit_size(stream.total_size(), total_records, worker_count, limits) as i64;

    for (i, f) in stream.files.iter().enumerate() {
        let mut offset = 0_i64;
        while offset < f.records {
            let length = unit.min(f.records - offset);
            out.push(DataSegment::new(out.len() as SegmentId, i, f, offset, length));
            offset += length;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FileMeta;

    const MB: u64 = 1_000_000;

    fn input(files: &[(u64, i64)]) -> StreamDescriptor {
        StreamDescriptor::input(
            files
                .iter()
                .enumerate()
                .map(|(i, (size, records))| FileMeta {
                    name: format!("part-{}.txt", i),
                    size: *size,
                    records: *records,
                    locations: vec![Endpoint::new(format!("10.0.0.{}", i + 1), 6001)],
                })
                .collect(),
        )
    }

    fn limits(min: u64, max: u64) -> UnitSizeLimits {
        UnitSizeLimits {
            min_unit_size: min,
            max_unit_size: max,
        }
    }

    #[test]
    fn cuatro_archivos_dos_workers_un_segmento_por_archivo() {
        let stream = input(&[(25 * MB, 250_000); 4]);
        let lim = limits(1_000_000, 256_000_000);

        assert_eq!(compute_unit_size(100 * MB, 1_000_000, 2, &lim), 500_000);

        let segs = segment_data(&stream, 1, 2, &lim).unwrap();
        assert_eq!(segs.len(), 4);
        for (i, s) in segs.iter().enumerate() {
            assert_eq!(s.file_index, i);
            assert_eq!(s.offset, 0);
            assert_eq!(s.length, 250_000);
            assert_eq!(s.status, SegmentStatus::Pending);
            assert_eq!(s.retry_count, 0);
        }
    }

    #[test]
    fn carga_grande_se_parte_segun_max_unit_size() {
        // 1 archivo de 100MB y 1000 registros, max 10MB por unidad => 10 segmentos de 100
        let stream = input(&[(100 * MB, 1000)]);
        let segs = segment_data(&stream, 1, 2, &limits(1, 10 * MB)).unwrap();

        assert_eq!(segs.len(), 10);
        assert!(segs.iter().all(|s| s.length == 100));
        assert_eq!(segs.last().unwrap().offset, 900);
        assert_eq!(segs[3].size, 10 * MB);
    }

    #[test]
    fn carga_chica_no_se_parte_por_debajo_de_min_unit_size() {
        // 2MB en total, min 4MB => n=1, un segmento con todos los registros
        let stream = input(&[(2 * MB, 300)]);
        let segs = segment_data(&stream, 1, 8, &limits(4 * MB, 256 * MB)).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].length, 300);
    }

    #[test]
    fn ultimo_segmento_lleva_el_resto() {
        let stream = input(&[(30 * MB, 10)]);
        // avg=10MB dentro de límites => unit = 10/3 = 3 => 3,3,3,1
        let segs = segment_data(&stream, 1, 3, &limits(1, 256 * MB)).unwrap();
        let lens: Vec<i64> = segs.iter().map(|s| s.length).collect();
        assert_eq!(lens, vec![3, 3, 3, 1]);
    }

    #[test]
    fn unit_size_nunca_es_cero() {
        let lim = limits(0, 0);
        assert_eq!(compute_unit_size(10 * MB, 3, 4, &lim), 1);
        assert_eq!(compute_unit_size(0, 0, 0, &limits(1, 1)), 1);
        assert_eq!(compute_unit_size(10, 5, 100, &limits(1, 1)), 1);
    }

    #[test]
    fn segmentacion_es_determinista() {
        let stream = input(&[(7 * MB, 1234), (3 * MB, 77), (11 * MB, 9999)]);
        let lim = limits(MB, 2 * MB);

        let a = segment_data(&stream, 5, 3, &lim).unwrap();
        let b = segment_data(&stream, 5, 3, &lim).unwrap();
        assert_eq!(a, b);

        // rows sólo es el lote de la UDF: no cambia los cortes
        let c = segment_data(&stream, 500, 3, &lim).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn archivo_completo_por_segmento_con_rows_cero() {
        let stream = input(&[(10, -1), (20, 4)]);
        let segs = segment_data(&stream, 0, 2, &UnitSizeLimits::default()).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].length, -1);
        assert_eq!(segs[1].length, 4);
        assert_eq!(segs[1].id, 1);
    }

    #[test]
    fn sin_ubicacion_es_missing_input() {
        let mut stream = input(&[(10, 4), (20, 4)]);
        stream.files[1].locations.clear();

        assert_eq!(
            segment_data(&stream, 0, 2, &UnitSizeLimits::default()),
            Err(SphereError::MissingInput("part-1.txt".into()))
        );
        assert_eq!(
            segment_data(&stream, 1, 2, &UnitSizeLimits::default()),
            Err(SphereError::MissingInput("part-1.txt".into()))
        );
    }

    #[test]
    fn sin_indice_con_rows_es_no_index() {
        let stream = input(&[(10, 4), (20, -1)]);
        assert_eq!(
            segment_data(&stream, 1, 2, &UnitSizeLimits::default()),
            Err(SphereError::NoIndex("part-1.txt".into()))
        );
    }

    #[test]
    fn to_result_solo_para_segmentos_con_resultado() {
        let stream = input(&[(10, 4)]);
        let mut seg = segment_data(&stream, 0, 1, &UnitSizeLimits::default())
            .unwrap()
            .remove(0);
        assert!(seg.to_result().is_none());

        seg.status = SegmentStatus::Failed;
        seg.result = Some(SegmentOutcome::Failed {
            code: -1,
            detail: "boom".into(),
        });
        let r = seg.to_result().unwrap();
        assert!(r.is_failed());
        assert_eq!(r.file, "part-0.txt");
        assert!(seg.is_terminal());
    }
}
