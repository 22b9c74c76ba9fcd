use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

const MB: u64 = 1024 * 1024;

/// Umbral mínimo de bytes sin enviar antes de empujar filas a los shufflers.
pub const MIN_FLUSH_BYTES: u64 = 32 * MB;
/// Umbral máximo (exclusivo).
pub const MAX_FLUSH_BYTES: u64 = 224 * MB;
/// Backlog máximo que acepta un shuffler antes de responder BUSY.
pub const SHUFFLER_BACKLOG_LIMIT: u64 = 256 * MB;

/// Archivo lógico de salida para una clave: hash(clave) % n.
pub fn bucket_for_key(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % buckets as u64) as usize
}

/// Umbral de envío con jitter, para que no todos los workers empujen a los
/// shufflers al mismo tiempo. La fuente de aleatoriedad es explícita así los
/// tests son reproducibles.
#[derive(Debug, Clone)]
pub struct FlushThreshold {
    rng: StdRng,
    current: u64,
}

impl FlushThreshold {
    pub fn new(mut rng: StdRng) -> Self {
        let current = rng.random_range(MIN_FLUSH_BYTES..MAX_FLUSH_BYTES);
        Self { rng, current }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn random() -> Self {
        Self::seeded(rand::random::<u64>())
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// true si con `pending` bytes sin enviar ya hay que empujar.
    pub fn reached(&self, pending: u64) -> bool {
        pending >= self.current
    }

    /// Sortea el próximo umbral (se llama después de cada envío).
    pub fn advance(&mut self) -> u64 {
        self.current = self.rng.random_range(MIN_FLUSH_BYTES..MAX_FLUSH_BYTES);
        self.current
    }
}
