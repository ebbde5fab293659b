pub const LANE_COUNT: usize = 8;
pub const STATE_DIM: usize = LANE_COUNT * 2;
pub type Features = [f32; STATE_DIM];

pub mod dqn;
pub mod env;
pub mod eval;
pub mod microsim;
pub mod policy;
pub mod train;

pub use dqn::{
    AgentConfig, BatchTensors, DqnAgent, IncompatibleWeightsError, InsufficientDataError, QNet,
    ReplayBuffer, TrainMeta, Transition, save_checkpoint,
};
pub use env::{Action, EnvConfig, RewardConfig, SimError, TrafficEnv, TrafficSim, network};
pub use eval::{EvalStats, run_eval};
pub use microsim::MicroSim;
pub use policy::EpsilonGreedy;
pub use train::{TrainConfig, Trainer};
