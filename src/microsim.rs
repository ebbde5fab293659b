//! Minimal deterministic single-intersection queue model.
//!
//! Stands in for a real traffic simulator behind [`TrafficSim`]: one FIFO
//! queue per incoming lane; each step the head vehicle of every green
//! approach enters the intersection and leaves through its route's outgoing
//! leg after a fixed traverse time. Traffic fidelity is out of scope; the
//! model only has to produce consistent counts and waiting times.

use std::collections::VecDeque;

use crate::env::{SimError, TrafficSim, network};

const APPROACHES: usize = 4;
const TRAVERSE_STEPS: u32 = 3;

#[derive(Debug)]
struct QueuedVehicle {
    id: String,
    /// Index into the outgoing half of [`network::LANES`], fixed by the route.
    out_lane: usize,
    /// Consecutive standing time; resets when the vehicle moves.
    waiting: f64,
}

#[derive(Debug)]
struct CrossingVehicle {
    id: String,
    /// Index into the outgoing half of [`network::LANES`].
    out_lane: usize,
    remaining: u32,
}

/// Incoming approach index and outgoing lane index for a route id.
fn route_lanes(route: &str) -> Result<(usize, usize), SimError> {
    // Outgoing legs are ordered C_N, C_S, C_E, C_W.
    let (approach, turns) = match route.split_once('_') {
        Some(("N", turn)) => (0usize, ("C_E_0", "C_S_0", "C_W_0", turn)),
        Some(("S", turn)) => (1, ("C_W_0", "C_N_0", "C_E_0", turn)),
        Some(("E", turn)) => (2, ("C_S_0", "C_W_0", "C_N_0", turn)),
        Some(("W", turn)) => (3, ("C_N_0", "C_E_0", "C_S_0", turn)),
        _ => return Err(SimError::UnknownLane(route.to_string())),
    };
    let (left, straight, right, turn) = turns;
    let out = match turn {
        "left" => left,
        "straight" => straight,
        "right" => right,
        _ => return Err(SimError::UnknownLane(route.to_string())),
    };
    let out_lane = network::LANES[APPROACHES..]
        .iter()
        .position(|lane| *lane == out)
        .expect("outgoing leg is part of the monitored network");
    Ok((approach, out_lane))
}

pub struct MicroSim {
    queues: [VecDeque<QueuedVehicle>; APPROACHES],
    crossing: Vec<CrossingVehicle>,
    green: [bool; APPROACHES],
    discharged: u64,
    closed: bool,
}

impl MicroSim {
    pub fn new() -> Self {
        Self {
            queues: Default::default(),
            crossing: Vec::new(),
            green: [false; APPROACHES],
            discharged: 0,
            closed: false,
        }
    }

    /// Vehicles that completed their crossing since the start of the run.
    pub fn discharged(&self) -> u64 {
        self.discharged
    }

    fn ensure_open(&self) -> Result<(), SimError> {
        if self.closed {
            return Err(SimError::Connection("simulator closed".to_string()));
        }
        Ok(())
    }

    fn lane_index(lane: &str) -> Result<usize, SimError> {
        network::LANES
            .iter()
            .position(|l| *l == lane)
            .ok_or_else(|| SimError::UnknownLane(lane.to_string()))
    }

    fn is_active(&self, id: &str) -> bool {
        self.queues.iter().any(|q| q.iter().any(|v| v.id == id))
            || self.crossing.iter().any(|v| v.id == id)
    }
}

impl Default for MicroSim {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficSim for MicroSim {
    fn step(&mut self) -> Result<(), SimError> {
        self.ensure_open()?;

        // Vehicles in the box move towards their outgoing leg.
        for v in &mut self.crossing {
            v.remaining -= 1;
        }
        let before = self.crossing.len();
        self.crossing.retain(|v| v.remaining > 0);
        self.discharged += (before - self.crossing.len()) as u64;

        // Head of every green queue enters the intersection.
        for (approach, queue) in self.queues.iter_mut().enumerate() {
            if self.green[approach] {
                if let Some(head) = queue.pop_front() {
                    self.crossing.push(CrossingVehicle {
                        id: head.id,
                        out_lane: head.out_lane,
                        remaining: TRAVERSE_STEPS,
                    });
                }
            }
            // Everyone still queued stood for another step.
            for v in queue.iter_mut() {
                v.waiting += 1.0;
            }
        }
        Ok(())
    }

    fn lane_vehicle_count(&self, lane: &str) -> Result<usize, SimError> {
        let idx = Self::lane_index(lane)?;
        if idx < APPROACHES {
            Ok(self.queues[idx].len())
        } else {
            let out = idx - APPROACHES;
            Ok(self.crossing.iter().filter(|v| v.out_lane == out).count())
        }
    }

    fn lane_waiting_time(&self, lane: &str) -> Result<f64, SimError> {
        let idx = Self::lane_index(lane)?;
        if idx < APPROACHES {
            Ok(self.queues[idx].iter().map(|v| v.waiting).sum())
        } else {
            // Crossing vehicles are moving.
            Ok(0.0)
        }
    }

    fn apply_light_configuration(&mut self, tls_id: &str, state: &str) -> Result<(), SimError> {
        self.ensure_open()?;
        if tls_id != network::TLS_ID {
            return Err(SimError::UnknownIntersection(tls_id.to_string()));
        }
        if state.len() != 24 || !state.bytes().all(|b| matches!(b, b'r' | b'y' | b'G' | b'g')) {
            return Err(SimError::InvalidLightState(state.to_string()));
        }
        for approach in 0..APPROACHES {
            let block = &state[approach * 6..approach * 6 + 6];
            self.green[approach] = block.contains(['G', 'g']);
        }
        Ok(())
    }

    fn spawn_vehicle(&mut self, id: &str, route: &str, _vtype: &str) -> Result<(), SimError> {
        self.ensure_open()?;
        if self.is_active(id) {
            return Err(SimError::DuplicateVehicleId(id.to_string()));
        }
        let (approach, out_lane) = route_lanes(route)?;
        self.queues[approach].push_back(QueuedVehicle {
            id: id.to_string(),
            out_lane,
            waiting: 0.0,
        });
        Ok(())
    }

    fn active_vehicle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .iter()
            .flatten()
            .map(|v| v.id.clone())
            .chain(self.crossing.iter().map(|v| v.id.clone()))
            .collect();
        ids.sort();
        ids
    }

    fn vehicle_waiting_time(&self, id: &str) -> Result<f64, SimError> {
        for queue in &self.queues {
            if let Some(v) = queue.iter().find(|v| v.id == id) {
                return Ok(v.waiting);
            }
        }
        if self.crossing.iter().any(|v| v.id == id) {
            return Ok(0.0);
        }
        Err(SimError::UnknownVehicle(id.to_string()))
    }

    fn close(&mut self) {
        self.closed = true;
        for queue in &mut self.queues {
            queue.clear();
        }
        self.crossing.clear();
    }
}
