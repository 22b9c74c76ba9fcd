use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::SphereError;

/// Dirección host:puerto de un worker, un shuffler o un canal de datos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Mismo host, otro puerto.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = SphereError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SphereError::Protocol(format!("dirección sin puerto: {s}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| SphereError::Protocol(format!("puerto inválido en {s}")))?;
        if host.is_empty() {
            return Err(SphereError::Protocol(format!("dirección sin host: {s}")));
        }
        Ok(Endpoint::new(host, port))
    }
}

pub const DISTANCE_SAME_HOST: u32 = 0;
pub const DISTANCE_SAME_RACK: u32 = 1;
pub const DISTANCE_REMOTE: u32 = 2;

/// Topología de la red para calcular distancias de localidad.
///
/// Los racks se configuran como prefijos de host (`10.0.1.=r1`). Si ningún
/// prefijo coincide, el rack es la subred /24 del host (todo menos el último
/// octeto), o el host entero si no tiene puntos.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    racks: Vec<(String, String)>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsea una lista `prefijo=rack` separada por comas.
    /// Las entradas mal formadas se ignoran.
    pub fn parse(spec: &str) -> Self {
        let racks = spec
            .split(',')
            .filter_map(|entry| {
                let (prefix, rack) = entry.trim().split_once('=')?;
                let (prefix, rack) = (prefix.trim(), rack.trim());
                if prefix.is_empty() || rack.is_empty() {
                    return None;
                }
                Some((prefix.to_string(), rack.to_string()))
            })
            .collect();
        Self { racks }
    }

    pub fn with_rack(mut self, prefix: &str, rack: &str) -> Self {
        self.racks.push((prefix.to_string(), rack.to_string()));
        self
    }

    fn rack_of(&self, host: &str) -> String {
        if let Some((_, rack)) = self.racks.iter().find(|(p, _)| host.starts_with(p.as_str())) {
            return rack.clone();
        }
        match host.rsplit_once('.') {
            Some((subnet, _)) => subnet.to_string(),
            None => host.to_string(),
        }
    }

    pub fn distance(&self, a: &str, b: &str) -> u32 {
        if a == b {
            DISTANCE_SAME_HOST
        } else if self.rack_of(a) == self.rack_of(b) {
            DISTANCE_SAME_RACK
        } else {
            DISTANCE_REMOTE
        }
    }

    /// Distancia mínima entre `host` y cualquiera de las ubicaciones.
    /// Sin ubicaciones se considera remoto.
    pub fn min_distance(&self, host: &str, locations: &[Endpoint]) -> u32 {
        locations
            .iter()
            .map(|loc| self.distance(host, &loc.host))
            .min()
            .unwrap_or(DISTANCE_REMOTE)
    }
}
