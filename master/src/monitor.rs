use crate::state::AppState;
use common::WorkerId;
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tracing::warn;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Marca como muertos a los workers sin heartbeat. Los muertos dejan de
/// aparecer en los pools y como ubicación de archivos.
pub async fn monitor_workers(state: AppState) {
    loop {
        sleep(SWEEP_INTERVAL).await;
        sweep_dead_workers(&state, SystemTime::now());
    }
}

/// Una pasada: devuelve los workers que se acaban de marcar como muertos.
pub fn sweep_dead_workers(state: &AppState, now: SystemTime) -> Vec<WorkerId> {
    let mut newly_dead = Vec::new();
    let mut workers = state.workers();

    for (id, meta) in workers.iter_mut() {
        if meta.dead {
            continue;
        }
        // last_heartbeat en el futuro: se ignora
        let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
            continue;
        };
        if elapsed > state.dead_timeout {
            meta.dead = true;
            warn!(
                "marcando worker {} ({}) como DEAD (sin heartbeat hace {:?})",
                id,
                meta.data(),
                elapsed
            );
            newly_dead.push(id.clone());
        }
    }

    newly_dead
}
