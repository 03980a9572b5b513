//! Built-in tandem-line engine: N stations in series with bounded buffers
//! between them. Cars enter at the first station, flow downstream through
//! the buffers, and count as produced when they leave the last station.
//! Stops are injected at random per station and block it until they clear.
//!
//! All randomness comes from a seeded RNG, so two engines with the same
//! config produce the same event tape.

use std::collections::{HashSet, VecDeque};

use chrono::DateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use plantsim_core::config::SimulationConfig;
use plantsim_core::sim::{BufferRestore, CarEventKind, SimEvent, StopRestore};

use crate::error::EngineError;
use crate::{EngineCapabilities, SimEngine};

/// Emit buffer states and a plant snapshot every this many ticks.
const SNAPSHOT_EVERY_TICKS: u64 = 10;

const STOP_REASONS: [(&str, &str, &str, &str); 4] = [
    ("conveyor jam", "UNPLANNED", "MECHANICAL", "HIGH"),
    ("robot fault", "UNPLANNED", "ELECTRICAL", "MEDIUM"),
    ("material shortage", "UNPLANNED", "LOGISTICS", "LOW"),
    ("quality check", "PLANNED", "QUALITY", "LOW"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    Running,
    Paused,
    Stopped,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

struct ActiveStop {
    stop_id: String,
    remaining_ms: u64,
    start_time: i64,
}

struct Station {
    name: String,
    /// Car being worked on and its remaining cycle time.
    current: Option<(String, u64)>,
    stop: Option<ActiveStop>,
    // Per-day accumulators for the OEE / MTTR-MTBF aggregates
    produced_today: u32,
    stopped_ms_today: u64,
    failures_today: u32,
}

impl Station {
    fn new(index: usize) -> Self {
        Self {
            name: format!("station-{}", index + 1),
            current: None,
            stop: None,
            produced_today: 0,
            stopped_ms_today: 0,
            failures_today: 0,
        }
    }
}

pub struct LineEngine {
    config: SimulationConfig,
    phase: Phase,
    rng: StdRng,
    stations: Vec<Station>,
    /// `buffers[i]` sits between station `i` and station `i + 1`.
    buffers: Vec<VecDeque<String>>,
    next_car: u64,
    completed: HashSet<String>,
    tick: u64,
    stop_seq: u64,
    last_metrics_day: i64,
}

impl LineEngine {
    pub fn new(config: SimulationConfig) -> Self {
        let seed = config.seed;
        Self {
            config,
            phase: Phase::Created,
            rng: StdRng::seed_from_u64(seed),
            stations: Vec::new(),
            buffers: Vec::new(),
            next_car: 1,
            completed: HashSet::new(),
            tick: 0,
            stop_seq: 1,
            last_metrics_day: 0,
        }
    }

    fn invalid(&self, command: &str) -> EngineError {
        EngineError::InvalidCommand {
            phase: self.phase.name().to_string(),
            command: command.to_string(),
        }
    }

    fn buffer_name(index: usize) -> String {
        format!("buffer-{}", index + 1)
    }

    fn new_car_id(&mut self) -> String {
        let id = format!("car-{:05}", self.next_car);
        self.next_car += 1;
        id
    }

    fn cars_in_progress(&self) -> u32 {
        let on_station = self.stations.iter().filter(|s| s.current.is_some()).count();
        let in_buffers: usize = self.buffers.iter().map(VecDeque::len).sum();
        (on_station + in_buffers) as u32
    }

    fn buffer_status(&self, index: usize) -> &'static str {
        let len = self.buffers[index].len() as u32;
        if len == 0 {
            "EMPTY"
        } else if len >= self.config.buffer_capacity {
            "FULL"
        } else {
            "OK"
        }
    }

    fn emit_buffer_states(&self, sim_now_ms: i64, events: &mut Vec<SimEvent>) {
        for (i, buffer) in self.buffers.iter().enumerate() {
            events.push(SimEvent::Buffer {
                buffer_id: Self::buffer_name(i),
                capacity: self.config.buffer_capacity,
                current_count: buffer.len() as u32,
                car_ids: buffer.iter().cloned().collect(),
                status: self.buffer_status(i).to_string(),
                timestamp: sim_now_ms,
            });
        }
    }

    fn emit_snapshot(&self, sim_now_ms: i64, events: &mut Vec<SimEvent>) {
        let stations: Vec<serde_json::Value> = self
            .stations
            .iter()
            .map(|s| {
                serde_json::json!({
                    "name": s.name,
                    "car": s.current.as_ref().map(|(id, _)| id.clone()),
                })
            })
            .collect();
        let buffers: Vec<Vec<String>> = self
            .buffers
            .iter()
            .map(|b| b.iter().cloned().collect())
            .collect();

        events.push(SimEvent::Snapshot {
            timestamp: sim_now_ms,
            total_cars_produced: self.completed.len() as u32,
            cars_in_progress: self.cars_in_progress(),
            active_stops: self.stations.iter().filter(|s| s.stop.is_some()).count() as u32,
            snapshot_data: serde_json::json!({
                "stations": stations,
                "buffers": buffers,
                "next_car": self.next_car,
            }),
        });
    }

    fn emit_daily_metrics(&mut self, sim_now_ms: i64, events: &mut Vec<SimEvent>) {
        let date = DateTime::from_timestamp_millis(sim_now_ms)
            .map(|dt| dt.date_naive().to_string())
            .unwrap_or_else(|| format!("day-{}", sim_now_ms / 86_400_000));
        let day_ms = 86_400_000u64;

        for station in &mut self.stations {
            let uptime = day_ms.saturating_sub(station.stopped_ms_today);
            let availability = uptime as f64 / day_ms as f64;
            let ideal = day_ms / self.config.cycle_time_ms.max(1);
            let performance = (f64::from(station.produced_today) / ideal as f64).min(1.0);

            events.push(SimEvent::Oee {
                date: date.clone(),
                location: station.name.clone(),
                availability,
                performance,
                quality: 1.0,
                oee: availability * performance,
            });

            if station.failures_today > 0 {
                events.push(SimEvent::MttrMtbf {
                    date: date.clone(),
                    location: station.name.clone(),
                    mttr_ms: station.stopped_ms_today as f64 / f64::from(station.failures_today),
                    mtbf_ms: uptime as f64 / f64::from(station.failures_today),
                    failure_count: station.failures_today,
                });
            }

            station.produced_today = 0;
            station.stopped_ms_today = 0;
            station.failures_today = 0;
        }
    }
}

impl SimEngine for LineEngine {
    fn init(&mut self, config: &SimulationConfig) -> Result<(), EngineError> {
        if config.station_count == 0 {
            return Err(EngineError::InitFailed("station_count must be at least 1".into()));
        }
        if config.cycle_time_ms == 0 {
            return Err(EngineError::InitFailed("cycle_time_ms must be nonzero".into()));
        }

        self.config = config.clone();
        self.rng = StdRng::seed_from_u64(config.seed);
        self.stations = (0..config.station_count).map(Station::new).collect();
        self.buffers = (1..config.station_count).map(|_| VecDeque::new()).collect();
        self.phase = Phase::Ready;
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        match self.phase {
            Phase::Ready | Phase::Stopped => {
                self.phase = Phase::Running;
                Ok(())
            }
            _ => Err(self.invalid("start")),
        }
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        match self.phase {
            Phase::Running => {
                self.phase = Phase::Paused;
                Ok(())
            }
            _ => Err(self.invalid("pause")),
        }
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        match self.phase {
            Phase::Paused => {
                self.phase = Phase::Running;
                Ok(())
            }
            _ => Err(self.invalid("resume")),
        }
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.phase = Phase::Stopped;
        Ok(())
    }

    fn tick(&mut self, sim_now_ms: i64) -> Vec<SimEvent> {
        if self.phase != Phase::Running {
            return Vec::new();
        }

        self.tick += 1;
        let dt = u64::from(SimulationConfig::TICK_SIM_MS);
        let mut events = Vec::new();

        // Downstream first, so a station freed this tick can accept from its
        // upstream buffer on the same tick next round.
        for i in (0..self.stations.len()).rev() {
            let is_last = i == self.stations.len() - 1;

            // An active stop blocks the station for the whole tick.
            if let Some(mut stop) = self.stations[i].stop.take() {
                let consumed = stop.remaining_ms.min(dt);
                stop.remaining_ms -= consumed;
                self.stations[i].stopped_ms_today += consumed;
                if stop.remaining_ms == 0 {
                    events.push(SimEvent::StopEnded {
                        stop_id: stop.stop_id,
                        end_time: sim_now_ms,
                        duration_ms: sim_now_ms - stop.start_time,
                    });
                } else {
                    self.stations[i].stop = Some(stop);
                }
                continue;
            }

            // Random stop injection
            if self.rng.gen_bool(self.config.stop_probability.clamp(0.0, 1.0)) {
                let (reason, stop_type, category, severity) =
                    STOP_REASONS[self.rng.gen_range(0..STOP_REASONS.len())];
                let stop_id = format!("stop-{:05}", self.stop_seq);
                self.stop_seq += 1;
                let duration_ticks = self.rng.gen_range(1..=5u64);
                events.push(SimEvent::StopStarted {
                    stop_id: stop_id.clone(),
                    location: self.stations[i].name.clone(),
                    reason: reason.to_string(),
                    stop_type: stop_type.to_string(),
                    category: category.to_string(),
                    severity: severity.to_string(),
                    start_time: sim_now_ms,
                });
                self.stations[i].failures_today += 1;
                self.stations[i].stop = Some(ActiveStop {
                    stop_id,
                    remaining_ms: duration_ticks * dt,
                    start_time: sim_now_ms,
                });
                continue;
            }

            // Advance the car in progress
            if let Some((car, remaining)) = self.stations[i].current.take() {
                let remaining = remaining.saturating_sub(dt);
                if remaining > 0 {
                    self.stations[i].current = Some((car, remaining));
                } else if is_last {
                    events.push(SimEvent::Car {
                        car_id: car.clone(),
                        kind: CarEventKind::Completed,
                        location: Some(self.stations[i].name.clone()),
                        payload: None,
                        timestamp: sim_now_ms,
                    });
                    self.completed.insert(car);
                    self.stations[i].produced_today += 1;
                } else if (self.buffers[i].len() as u32) < self.config.buffer_capacity {
                    events.push(SimEvent::Car {
                        car_id: car.clone(),
                        kind: CarEventKind::BufferIn,
                        location: Some(Self::buffer_name(i)),
                        payload: None,
                        timestamp: sim_now_ms,
                    });
                    self.buffers[i].push_back(car);
                    self.stations[i].produced_today += 1;
                } else {
                    // Blocked: downstream buffer is full, hold the finished car
                    self.stations[i].current = Some((car, 0));
                }
            }

            // Pull new work
            if self.stations[i].current.is_none() {
                if i == 0 {
                    let car = self.new_car_id();
                    events.push(SimEvent::Car {
                        car_id: car.clone(),
                        kind: CarEventKind::Created,
                        location: Some(self.stations[0].name.clone()),
                        payload: None,
                        timestamp: sim_now_ms,
                    });
                    self.stations[0].current = Some((car, self.config.cycle_time_ms));
                } else if let Some(car) = self.buffers[i - 1].pop_front() {
                    events.push(SimEvent::Car {
                        car_id: car.clone(),
                        kind: CarEventKind::BufferOut,
                        location: Some(Self::buffer_name(i - 1)),
                        payload: None,
                        timestamp: sim_now_ms,
                    });
                    events.push(SimEvent::Car {
                        car_id: car.clone(),
                        kind: CarEventKind::Moved,
                        location: Some(self.stations[i].name.clone()),
                        payload: None,
                        timestamp: sim_now_ms,
                    });
                    self.stations[i].current = Some((car, self.config.cycle_time_ms));
                }
            }
        }

        if self.tick % SNAPSHOT_EVERY_TICKS == 0 {
            self.emit_buffer_states(sim_now_ms, &mut events);
            self.emit_snapshot(sim_now_ms, &mut events);
        }

        let day = sim_now_ms / 86_400_000;
        if day > self.last_metrics_day {
            self.last_metrics_day = day;
            self.emit_daily_metrics(sim_now_ms, &mut events);
        }

        events.push(SimEvent::Clock {
            simulated_timestamp: sim_now_ms,
            tick: self.tick,
        });

        events
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::all()
    }

    fn restore_completed_cars(&mut self, ids: &[String]) -> Result<(), EngineError> {
        self.completed = ids.iter().cloned().collect();
        // Keep new car ids clear of the restored ones
        let max_seen = ids
            .iter()
            .filter_map(|id| id.strip_prefix("car-").and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0);
        self.next_car = self.next_car.max(max_seen + 1);
        Ok(())
    }

    fn restore_buffers(&mut self, buffers: &[BufferRestore]) -> Result<(), EngineError> {
        for restore in buffers {
            let index = restore
                .buffer_id
                .strip_prefix("buffer-")
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1))
                .filter(|&n| n < self.buffers.len())
                .ok_or_else(|| EngineError::RestoreFailed {
                    step: "buffers",
                    detail: format!("unknown buffer {}", restore.buffer_id),
                })?;
            self.buffers[index] = restore.car_ids.iter().cloned().collect();
            let max_seen = restore
                .car_ids
                .iter()
                .filter_map(|id| id.strip_prefix("car-").and_then(|n| n.parse::<u64>().ok()))
                .max()
                .unwrap_or(0);
            self.next_car = self.next_car.max(max_seen + 1);
        }
        Ok(())
    }

    fn restore_stops(&mut self, stops: &[StopRestore]) -> Result<(), EngineError> {
        for restore in stops {
            let station = self
                .stations
                .iter_mut()
                .find(|s| s.name == restore.location)
                .ok_or_else(|| EngineError::RestoreFailed {
                    step: "stops",
                    detail: format!("unknown location {}", restore.location),
                })?;
            station.stop = Some(ActiveStop {
                stop_id: restore.stop_id.clone(),
                remaining_ms: self.config.cycle_time_ms,
                start_time: restore.start_time,
            });
        }
        Ok(())
    }

    fn restore_snapshot(&mut self, snapshot: &serde_json::Value) -> Result<(), EngineError> {
        let stations = snapshot
            .get("stations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::RestoreFailed {
                step: "snapshot",
                detail: "missing stations array".into(),
            })?;

        for (i, entry) in stations.iter().enumerate().take(self.stations.len()) {
            if let Some(car) = entry.get("car").and_then(|v| v.as_str()) {
                self.stations[i].current = Some((car.to_string(), self.config.cycle_time_ms));
            }
        }
        if let Some(next_car) = snapshot.get("next_car").and_then(|v| v.as_u64()) {
            self.next_car = self.next_car.max(next_car);
        }
        Ok(())
    }

    fn set_clock(&mut self, simulated_timestamp: i64, tick: u64) -> Result<(), EngineError> {
        self.tick = tick;
        self.last_metrics_day = simulated_timestamp / 86_400_000;
        Ok(())
    }
}
