use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SphereError>;

/// Errores del scheduler.
///
/// Cada variante tiene un código negativo estable (`code()`), que es lo que
/// ven los clientes que sólo consultan el progreso.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SphereError {
    #[error("el archivo de entrada {0} no tiene ninguna ubicación conocida")]
    MissingInput(String),

    #[error("el archivo {0} no tiene índice de registros")]
    NoIndex(String),

    #[error("el coordinador no devolvió ningún worker")]
    NoWorkersAvailable,

    #[error("no se pudo asignar ningún bucket")]
    NoBucketAllocated,

    #[error("la salida por buckets quedó inconsistente tras perder un worker")]
    BucketUnhealthy,

    #[error("no quedan workers activos para terminar el job")]
    AllWorkersFailed,

    #[error("tiempo de espera agotado")]
    Timeout,

    #[error("job cancelado")]
    Canceled,

    #[error("error del coordinador: {0}")]
    Coordinator(String),

    #[error("error en el canal de datos: {0}")]
    Channel(String),

    #[error("mensaje inválido: {0}")]
    Protocol(String),

    #[error("error de E/S: {0}")]
    Io(String),
}

impl SphereError {
    pub fn code(&self) -> i32 {
        match self {
            SphereError::MissingInput(_) => -1001,
            SphereError::NoIndex(_) => -1002,
            SphereError::NoWorkersAvailable => -1003,
            SphereError::NoBucketAllocated => -1004,
            SphereError::BucketUnhealthy => -1005,
            SphereError::AllWorkersFailed => -1006,
            SphereError::Timeout => -1007,
            SphereError::Canceled => -1008,
            SphereError::Coordinator(_) => -1009,
            SphereError::Channel(_) => -1010,
            SphereError::Protocol(_) => -1011,
            SphereError::Io(_) => -1012,
        }
    }

    /// true para los errores que dejan al job sin posibilidad de avanzar.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SphereError::BucketUnhealthy | SphereError::AllWorkersFailed | SphereError::Canceled
        )
    }
}

impl From<io::Error> for SphereError {
    fn from(e: io::Error) -> Self {
        SphereError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SphereError {
    fn from(e: serde_json::Error) -> Self {
        SphereError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codigos_son_negativos_y_distintos() {
        let all = vec![
            SphereError::MissingInput("a".into()),
            SphereError::NoIndex("a".into()),
            SphereError::NoWorkersAvailable,
            SphereError::NoBucketAllocated,
            SphereError::BucketUnhealthy,
            SphereError::AllWorkersFailed,
            SphereError::Timeout,
            SphereError::Canceled,
            SphereError::Coordinator("x".into()),
            SphereError::Channel("x".into()),
            SphereError::Protocol("x".into()),
            SphereError::Io("x".into()),
        ];

        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn io_error_se_convierte() {
        let e: SphereError = io::Error::new(io::ErrorKind::NotFound, "no existe").into();
        assert!(matches!(e, SphereError::Io(ref m) if m.contains("no existe")));
        assert!(!e.is_fatal());
    }
}
