use serde::{Deserialize, Serialize};

use crate::api::FileMeta;
use crate::topology::Endpoint;

/// Un archivo dentro de un stream (entrada o salida).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFile {
    pub name: String,
    pub size: u64,
    /// -1 si no se conoce
    pub records: i64,
    pub locations: Vec<Endpoint>,
    /// Sólo en salidas por buckets: bucket al que quedó asignado el archivo
    #[serde(default)]
    pub bucket: Option<usize>,
}

impl From<FileMeta> for StreamFile {
    fn from(meta: FileMeta) -> Self {
        Self {
            name: meta.name,
            size: meta.size,
            records: meta.records,
            locations: meta.locations,
            bucket: None,
        }
    }
}

/// Describe un dataset lógico: la lista ordenada de archivos con sus tamaños,
/// conteos de registros y ubicaciones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub files: Vec<StreamFile>,
    /// Sólo en salidas: directorio destino
    #[serde(default)]
    pub path: Option<String>,
    /// Sólo en salidas: prefijo de nombre de los archivos
    #[serde(default)]
    pub name: Option<String>,
}

impl StreamDescriptor {
    pub fn input(files: Vec<FileMeta>) -> Self {
        Self {
            files: files.into_iter().map(StreamFile::from).collect(),
            path: None,
            name: None,
        }
    }

    /// Stream de salida con `count` archivos vacíos `<name>.<i>`.
    pub fn output(path: &str, name: &str, count: usize) -> Self {
        let files = (0..count)
            .map(|i| StreamFile {
                name: format!("{}.{}", name, i),
                size: 0,
                records: 0,
                locations: Vec::new(),
                bucket: None,
            })
            .collect();

        Self {
            files,
            path: Some(path.to_string()),
            name: Some(name.to_string()),
        }
    }

    /// Pista de ubicación para el archivo de salida `idx`.
    pub fn set_location_hint(&mut self, idx: usize, location: Endpoint) {
        if let Some(f) = self.files.get_mut(idx) {
            f.locations = vec![location];
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Suma de registros, o None si algún archivo no tiene índice.
    pub fn total_records(&self) -> Option<u64> {
        self.files
            .iter()
            .map(|f| u64::try_from(f.records).ok())
            .sum()
    }

    /// Quita los archivos que nunca recibieron datos.
    pub fn prune_empty(&mut self) -> usize {
        let before = self.files.len();
        self.files.retain(|f| f.size > 0);
        before - self.files.len()
    }
}
