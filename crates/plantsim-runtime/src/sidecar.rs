//! Persistence sidecar: one task per worker that writes the engine's events
//! into the store, stamped with the owning session id.
//!
//! Persistence failures are logged and swallowed — losing an event row is
//! acceptable, stalling or killing the simulation is not. Event order is
//! preserved (single consumer draining a FIFO queue).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use plantsim_core::ids::SessionId;
use plantsim_core::sim::SimEvent;
use plantsim_store::buffers::BufferStateRepo;
use plantsim_store::car_events::CarEventRepo;
use plantsim_store::metrics::MetricsRepo;
use plantsim_store::sessions::SessionRepo;
use plantsim_store::snapshots::PlantSnapshotRepo;
use plantsim_store::stop_events::StopEventRepo;
use plantsim_store::Database;

const QUEUE_CAPACITY: usize = 1024;

enum SidecarMessage {
    Event(SimEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle held by the worker. Dropping it (without `drain`) lets the sidecar
/// finish whatever is queued and exit.
pub struct SidecarHandle {
    tx: mpsc::Sender<SidecarMessage>,
    depth: Arc<AtomicUsize>,
}

impl SidecarHandle {
    pub fn spawn(session_id: SessionId, db: Database) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let depth = Arc::new(AtomicUsize::new(0));
        let writer = SidecarWriter {
            session_id,
            cars: CarEventRepo::new(db.clone()),
            stops: StopEventRepo::new(db.clone()),
            buffers: BufferStateRepo::new(db.clone()),
            snapshots: PlantSnapshotRepo::new(db.clone()),
            metrics: MetricsRepo::new(db.clone()),
            sessions: SessionRepo::new(db),
        };
        tokio::spawn(run(writer, rx, Arc::clone(&depth)));
        Self { tx, depth }
    }

    /// Enqueue an event without waiting. A full queue drops the event — the
    /// loss is logged, the simulation keeps going.
    pub fn submit(&self, event: SimEvent) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.try_send(SidecarMessage::Event(event)) {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            warn!(error = %e, "persistence queue full, event dropped");
        }
    }

    /// Pending writes, reported in the worker's heartbeat.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Flush everything queued so far and shut the sidecar down. Runs before
    /// the stop grace window so force-termination cannot truncate events
    /// produced before the STOP was observed.
    pub async fn drain(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SidecarMessage::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct SidecarWriter {
    session_id: SessionId,
    cars: CarEventRepo,
    stops: StopEventRepo,
    buffers: BufferStateRepo,
    snapshots: PlantSnapshotRepo,
    metrics: MetricsRepo,
    sessions: SessionRepo,
}

async fn run(writer: SidecarWriter, mut rx: mpsc::Receiver<SidecarMessage>, depth: Arc<AtomicUsize>) {
    while let Some(message) = rx.recv().await {
        match message {
            SidecarMessage::Event(event) => {
                if let Err(e) = writer.persist(&event) {
                    warn!(
                        session_id = %writer.session_id,
                        event_type = event.event_type(),
                        error = %e,
                        "failed to persist event"
                    );
                }
                depth.fetch_sub(1, Ordering::Relaxed);
            }
            SidecarMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(session_id = %writer.session_id, "persistence sidecar stopped");
}

impl SidecarWriter {
    fn persist(&self, event: &SimEvent) -> Result<(), plantsim_store::StoreError> {
        let sid = &self.session_id;
        match event {
            SimEvent::Car { car_id, kind, location, payload, timestamp } => {
                self.cars.append(sid, car_id, *kind, location.as_deref(), payload.as_ref(), *timestamp)
            }
            SimEvent::StopStarted {
                stop_id,
                location,
                reason,
                stop_type,
                category,
                severity,
                start_time,
            } => self.stops.start(sid, stop_id, location, reason, stop_type, category, severity, *start_time),
            SimEvent::StopEnded { stop_id, end_time, duration_ms } => {
                self.stops.end(sid, stop_id, *end_time, *duration_ms)
            }
            SimEvent::Buffer { buffer_id, capacity, current_count, car_ids, status, timestamp } => {
                self.buffers.append(sid, buffer_id, *capacity, *current_count, car_ids, status, *timestamp)
            }
            SimEvent::Snapshot {
                timestamp,
                total_cars_produced,
                cars_in_progress,
                active_stops,
                snapshot_data,
            } => {
                self.snapshots.append(
                    sid,
                    *timestamp,
                    *total_cars_produced,
                    *cars_in_progress,
                    *active_stops,
                    snapshot_data,
                )?;
                self.sessions.touch_snapshot(sid, Utc::now())
            }
            SimEvent::Oee { date, location, availability, performance, quality, oee } => {
                self.metrics.append_oee(sid, date, location, *availability, *performance, *quality, *oee)
            }
            SimEvent::MttrMtbf { date, location, mttr_ms, mtbf_ms, failure_count } => {
                self.metrics.append_mttr_mtbf(sid, date, location, *mttr_ms, *mtbf_ms, *failure_count)
            }
            SimEvent::Clock { simulated_timestamp, tick } => {
                self.sessions.update_checkpoint(sid, *simulated_timestamp, *tick)
            }
        }
    }
}
