use rand::Rng;
use rand::rngs::SmallRng;
use thiserror::Error;

use crate::policy::rng_from_seed;
use crate::{Features, STATE_DIM};

// =============================================================================
// Intersection Topology
// =============================================================================

pub mod network {
    /// Signal-controlled intersection.
    pub const TLS_ID: &str = "C";

    /// Monitored lanes in encoding order: the four incoming approaches, then
    /// the four outgoing legs.
    pub const LANES: [&str; 8] = [
        "N_C_0", "S_C_0", "E_C_0", "W_C_0", "C_N_0", "C_S_0", "C_E_0", "C_W_0",
    ];

    pub const VEHICLE_TYPES: [&str; 3] = ["car", "truck", "bike"];

    /// Routes grouped by incoming approach.
    pub const ROUTES: [[&str; 3]; 4] = [
        ["N_left", "N_straight", "N_right"],
        ["S_left", "S_straight", "S_right"],
        ["E_left", "E_straight", "E_right"],
        ["W_left", "W_straight", "W_right"],
    ];
}

// =============================================================================
// Simulator Interface
// =============================================================================

#[derive(Debug, Error)]
pub enum SimError {
    #[error("vehicle id {0:?} already exists")]
    DuplicateVehicleId(String),
    #[error("unknown lane {0:?}")]
    UnknownLane(String),
    #[error("unknown vehicle {0:?}")]
    UnknownVehicle(String),
    #[error("unknown intersection {0:?}")]
    UnknownIntersection(String),
    #[error("invalid light state {0:?}")]
    InvalidLightState(String),
    #[error("simulator connection lost: {0}")]
    Connection(String),
}

/// Narrow contract the traffic micro-simulator has to satisfy. The training
/// loop only ever talks to the simulator through this trait, so a scripted
/// stub can stand in for deterministic tests.
pub trait TrafficSim {
    /// Advance simulated time by one unit.
    fn step(&mut self) -> Result<(), SimError>;

    /// Number of vehicles on `lane` during the last step.
    fn lane_vehicle_count(&self, lane: &str) -> Result<usize, SimError>;

    /// Cumulative waiting time of the vehicles currently on `lane`.
    fn lane_waiting_time(&self, lane: &str) -> Result<f64, SimError>;

    /// Set the red/yellow/green head string of an intersection.
    fn apply_light_configuration(&mut self, tls_id: &str, state: &str) -> Result<(), SimError>;

    fn spawn_vehicle(&mut self, id: &str, route: &str, vtype: &str) -> Result<(), SimError>;

    fn active_vehicle_ids(&self) -> Vec<String>;

    /// Consecutive standing time of a single vehicle.
    fn vehicle_waiting_time(&self, id: &str) -> Result<f64, SimError>;

    /// Release simulator resources. Further calls fail with
    /// [`SimError::Connection`].
    fn close(&mut self);
}

// =============================================================================
// Action Space
// =============================================================================

/// Protected-green phase for one incoming approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    North = 0,
    South = 1,
    East = 2,
    West = 3,
}

impl Action {
    pub const COUNT: usize = 4;

    pub fn from_index(i: usize) -> Self {
        assert!(i < Self::COUNT);
        unsafe { std::mem::transmute(i as u8) }
    }

    /// 24-char signal head string: six heads per approach in N, S, E, W order.
    pub fn light_state(self) -> &'static str {
        match self {
            Action::North => "GGGGggrrrrrrrrrrrrrrrrrr",
            Action::South => "rrrrrrGGGGggrrrrrrrrrrrr",
            Action::East => "rrrrrrrrrrrrGGGGggrrrrrr",
            Action::West => "rrrrrrrrrrrrrrrrrrGGGGgg",
        }
    }
}

// =============================================================================
// Environment Constants
// =============================================================================

pub struct EnvConfig {
    /// Steps a phase must hold before the controller may change it.
    pub min_green: u32,
    /// One vehicle is injected every `spawn_period` steps (0 disables demand).
    pub spawn_period: u64,
    /// Seed for the demand generator; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            min_green: 10,
            spawn_period: 3,
            seed: None,
        }
    }
}

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

pub struct RewardConfig {
    /// Standing time beyond which a vehicle counts as stuck ("teleporting").
    pub stuck_threshold: f64,
    /// Penalty per stuck vehicle, subtracted from the waiting-time delta.
    pub teleport_penalty: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: 1000.0,
            teleport_penalty: 50.0,
        }
    }
}

// =============================================================================
// Traffic Environment
// =============================================================================

/// Wraps the simulator with state encoding, reward computation and randomized
/// demand injection.
pub struct TrafficEnv<S: TrafficSim> {
    sim: S,
    vehicle_counter: u64,
    rng: SmallRng,
    pub env_config: EnvConfig,
    pub reward_config: RewardConfig,
}

impl<S: TrafficSim> TrafficEnv<S> {
    pub fn new(sim: S, env_config: EnvConfig, reward_config: RewardConfig) -> Self {
        let rng = rng_from_seed(env_config.seed);
        Self {
            sim,
            vehicle_counter: 0,
            rng,
            env_config,
            reward_config,
        }
    }

    pub fn step(&mut self) -> Result<(), SimError> {
        self.sim.step()
    }

    /// One (vehicle count, waiting time) pair per monitored lane, in fixed
    /// lane order.
    pub fn encode_state(&self) -> Result<Features, SimError> {
        let mut f = [0f32; STATE_DIM];
        for (i, lane) in network::LANES.iter().enumerate() {
            f[i * 2] = self.sim.lane_vehicle_count(lane)? as f32;
            f[i * 2 + 1] = self.sim.lane_waiting_time(lane)? as f32;
        }
        Ok(f)
    }

    pub fn total_waiting_time(&self) -> Result<f64, SimError> {
        let mut total = 0.0;
        for lane in network::LANES.iter() {
            total += self.sim.lane_waiting_time(lane)?;
        }
        Ok(total)
    }

    /// Active vehicles standing longer than the stuck threshold.
    pub fn count_stuck_vehicles(&self) -> Result<usize, SimError> {
        let mut stuck = 0;
        for id in self.sim.active_vehicle_ids() {
            if self.sim.vehicle_waiting_time(&id)? > self.reward_config.stuck_threshold {
                stuck += 1;
            }
        }
        Ok(stuck)
    }

    /// Waiting-time delta minus the stuck-vehicle penalty. Returns the reward
    /// and the new total to carry into the next decision. Never clamped; a
    /// large negative value is the congestion signal the learner needs.
    pub fn compute_reward(
        &self,
        prev_total_wait: f64,
        teleport_count: usize,
    ) -> Result<(f64, f64), SimError> {
        let curr_total_wait = self.total_waiting_time()?;
        let delta = prev_total_wait - curr_total_wait;
        let reward = delta - self.reward_config.teleport_penalty * teleport_count as f64;
        Ok((reward, curr_total_wait))
    }

    pub fn apply_action(&mut self, action: Action) -> Result<(), SimError> {
        self.sim
            .apply_light_configuration(network::TLS_ID, action.light_state())
    }

    /// Inject one vehicle on a random route. A duplicate id is skipped
    /// silently; demand resumes on the next eligible step.
    pub fn spawn_demand(&mut self) -> Result<(), SimError> {
        let routes = network::ROUTES[self.rng.random_range(0..network::ROUTES.len())];
        let route = routes[self.rng.random_range(0..routes.len())];
        let vtype = network::VEHICLE_TYPES[self.rng.random_range(0..network::VEHICLE_TYPES.len())];
        let id = format!("veh{}", self.vehicle_counter);
        match self.sim.spawn_vehicle(&id, route, vtype) {
            Ok(()) => {
                self.vehicle_counter += 1;
                Ok(())
            }
            Err(SimError::DuplicateVehicleId(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn active_vehicle_count(&self) -> usize {
        self.sim.active_vehicle_ids().len()
    }

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn close(&mut self) {
        self.sim.close()
    }
}

// =============================================================================
// Tests
// =============================================================================
