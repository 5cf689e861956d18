use std::time::{Duration, Instant};

use crate::internal::server::comm::CommSenderRef;
use crate::internal::server::core::CoreRef;
use crate::internal::server::reactor::on_liveness_sweep;

/// Periodically removes workers without heartbeats and forces unacknowledged cancellations.
///
/// Runs next to the scheduler loop; a sweep only needs the core for a short moment,
/// so it is never delayed by more than one scheduling pass.
pub(crate) async fn liveness_loop(core_ref: CoreRef, comm_ref: CommSenderRef, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut core = core_ref.get_mut();
        let mut comm = comm_ref.get_mut();
        trace_time!("liveness", "sweep", {
            on_liveness_sweep(&mut core, &mut *comm, Instant::now())
        });
    }
}
