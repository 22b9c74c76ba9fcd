use std::{env, str::FromStr, time::Duration};

use crate::segment::UnitSizeLimits;
use crate::topology::Topology;

pub const DEFAULT_MIN_UNIT_SIZE: u64 = 1_000_000;
pub const DEFAULT_MAX_UNIT_SIZE: u64 = 256_000_000;
pub const DEFAULT_PROCS_PER_NODE: usize = 1;

/// Cada cuánto vuelve a pasar el loop de scheduling si no llegan mensajes.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Lee una variable de entorno y la parsea; si falta o no parsea, usa el default.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parámetros del scheduler del lado cliente.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub min_unit_size: u64,
    pub max_unit_size: u64,
    /// Slots por worker físico ("cores por nodo")
    pub procs_per_node: usize,
    /// false = cada segmento sólo corre donde ya están sus datos
    pub allow_data_move: bool,
    pub topology: Topology,
    pub tick: Duration,
    /// Semilla para el orden de las colas de localidad (None = aleatoria)
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_unit_size: DEFAULT_MIN_UNIT_SIZE,
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
            procs_per_node: DEFAULT_PROCS_PER_NODE,
            allow_data_move: true,
            topology: Topology::new(),
            tick: DEFAULT_TICK,
            seed: None,
        }
    }
}

impl SchedulerConfig {
    /// Defaults sobreescritos por SPHERE_MIN_UNIT_SIZE, SPHERE_MAX_UNIT_SIZE,
    /// SPHERE_PROCS_PER_NODE, SPHERE_DATA_MOVE y SPHERE_TOPOLOGY.
    pub fn from_env() -> Self {
        let topology = env::var("SPHERE_TOPOLOGY")
            .map(|s| Topology::parse(&s))
            .unwrap_or_default();

        Self {
            min_unit_size: env_or("SPHERE_MIN_UNIT_SIZE", DEFAULT_MIN_UNIT_SIZE),
            max_unit_size: env_or("SPHERE_MAX_UNIT_SIZE", DEFAULT_MAX_UNIT_SIZE),
            procs_per_node: env_or("SPHERE_PROCS_PER_NODE", DEFAULT_PROCS_PER_NODE).max(1),
            allow_data_move: env_or("SPHERE_DATA_MOVE", true),
            topology,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> UnitSizeLimits {
        UnitSizeLimits {
            min_unit_size: self.min_unit_size,
            max_unit_size: self.max_unit_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_respeta_variables() {
        env::set_var("SPHERE_MAX_UNIT_SIZE", "4096");
        env::set_var("SPHERE_PROCS_PER_NODE", "0");
        env::set_var("SPHERE_DATA_MOVE", "false");

        let cfg = SchedulerConfig::from_env();
        assert_eq!(cfg.max_unit_size, 4096);
        assert_eq!(cfg.min_unit_size, DEFAULT_MIN_UNIT_SIZE);
        // nunca menos de un slot por nodo
        assert_eq!(cfg.procs_per_node, 1);
        assert!(!cfg.allow_data_move);
        assert_eq!(cfg.limits().max_unit_size, 4096);

        env::remove_var("SPHERE_MAX_UNIT_SIZE");
        env::remove_var("SPHERE_PROCS_PER_NODE");
        env::remove_var("SPHERE_DATA_MOVE");
    }

    #[test]
    fn env_or_usa_default_si_no_parsea() {
        env::set_var("SPHERE_TEST_BASURA", "no-es-numero");
        assert_eq!(env_or("SPHERE_TEST_BASURA", 7_u32), 7);
        assert_eq!(env_or("SPHERE_TEST_NO_EXISTE", 3_u32), 3);
        env::remove_var("SPHERE_TEST_BASURA");
    }
}
