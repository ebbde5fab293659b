use anyhow::{Context, Result};
use candle_core::{D, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::env::Action;
use crate::policy::{EpsilonGreedy, rng_from_seed};
use crate::{Features, STATE_DIM};

// =============================================================================
// Agent Hyperparameters
// =============================================================================

pub struct AgentConfig {
    pub hidden_size: usize,
    pub gamma: f64,
    pub learning_rate: f64,
    pub replay_capacity: usize,
    pub batch_size: usize,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    /// Seeds the policy and batch-sampling rngs; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hidden_size: 128,
            gamma: 0.95,
            learning_rate: 1e-3,
            replay_capacity: 50_000,
            batch_size: 64,
            epsilon_start: 1.0,
            epsilon_min: 0.05,
            epsilon_decay: 0.99995,
            seed: None,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Sampling was attempted before the buffer held a full batch.
#[derive(Debug, Error)]
#[error("replay buffer holds {available} transitions, need {requested}")]
pub struct InsufficientDataError {
    pub requested: usize,
    pub available: usize,
}

/// Saved weights do not fit the configured network architecture. Fatal on
/// load; mismatched tensors are never truncated or padded.
#[derive(Debug, Error)]
#[error("saved weights are incompatible: {0}")]
pub struct IncompatibleWeightsError(pub String);

// =============================================================================
// Q-Function Approximator (candle)
// =============================================================================

/// Per-lane (count, waiting) features → per-phase Q-values.
pub struct QNet {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
}

impl QNet {
    pub fn new(vs: VarBuilder, hidden_size: usize) -> Result<Self> {
        let fc1 = candle_nn::linear(STATE_DIM, hidden_size, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden_size, hidden_size, vs.pp("fc2"))?;
        let out = candle_nn::linear(hidden_size, Action::COUNT, vs.pp("out"))?;
        Ok(Self { fc1, fc2, out })
    }

    /// Forward pass: batch of states → Q-values for all phases.
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(x)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        self.out.forward(&h)
    }
}

// =============================================================================
// Experience Replay Buffer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Features,
    pub action: usize,
    pub reward: f32,
    pub next_state: Features,
    pub done: bool,
}

/// Bounded FIFO store of transitions with uniform random sampling.
#[derive(Serialize, Deserialize)]
pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends, evicting the oldest transition once at capacity.
    pub fn push(&mut self, t: Transition) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(t);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.buffer.iter()
    }

    /// `batch_size` independent uniform draws. Storage is untouched; the same
    /// transition may appear more than once in a batch.
    pub fn sample_transitions(
        &self,
        batch_size: usize,
        rng: &mut SmallRng,
    ) -> Result<Vec<&Transition>, InsufficientDataError> {
        let len = self.buffer.len();
        if len < batch_size {
            return Err(InsufficientDataError {
                requested: batch_size,
                available: len,
            });
        }
        Ok((0..batch_size)
            .map(|_| &self.buffer[rng.random_range(0..len)])
            .collect())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let replay = bincode::deserialize_from(reader)?;
        Ok(replay)
    }
}

pub struct BatchTensors {
    pub states: Tensor,
    pub actions: Tensor,
    pub rewards: Tensor,
    pub next_states: Tensor,
    pub not_dones: Tensor,
}

impl BatchTensors {
    /// Pack sampled transitions into training tensors.
    pub fn pack(batch: &[&Transition], dev: &Device) -> Result<Self> {
        let n = batch.len();
        let mut states = Vec::with_capacity(n * STATE_DIM);
        let mut actions = Vec::with_capacity(n);
        let mut rewards = Vec::with_capacity(n);
        let mut next_states = Vec::with_capacity(n * STATE_DIM);
        let mut not_dones = Vec::with_capacity(n);

        for t in batch {
            states.extend_from_slice(&t.state);
            actions.push(t.action as i64);
            rewards.push(t.reward);
            next_states.extend_from_slice(&t.next_state);
            not_dones.push(if t.done { 0.0f32 } else { 1.0f32 });
        }

        Ok(Self {
            states: Tensor::from_vec(states, (n, STATE_DIM), dev)?,
            actions: Tensor::from_vec(actions, n, dev)?,
            rewards: Tensor::from_vec(rewards, n, dev)?,
            next_states: Tensor::from_vec(next_states, (n, STATE_DIM), dev)?,
            not_dones: Tensor::from_vec(not_dones, n, dev)?,
        })
    }
}

// =============================================================================
// Checkpointing
// =============================================================================

#[derive(Serialize, Deserialize)]
struct OptimizerState {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

impl From<&ParamsAdamW> for OptimizerState {
    fn from(params: &ParamsAdamW) -> Self {
        Self {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
        }
    }
}

/// Checkpoint metadata. The architecture fields version the weight files:
/// a checkpoint only loads into a network of the same shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct TrainMeta {
    pub state_dim: usize,
    pub action_count: usize,
    pub hidden_size: usize,
    pub total_steps: u64,
    pub train_steps: u64,
    pub epsilon: f64,
}

pub fn save_checkpoint<P: AsRef<Path>>(agent: &DqnAgent, total_steps: u64, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    agent.online_varmap.save(dir.join("model.safetensors"))?;
    agent.target_varmap.save(dir.join("target.safetensors"))?;
    agent.save_optimizer(dir.join("optimizer.json"))?;
    agent.replay.save(dir.join("replay.bin"))?;

    let meta = TrainMeta {
        state_dim: STATE_DIM,
        action_count: Action::COUNT,
        hidden_size: agent.hidden_size,
        total_steps,
        train_steps: agent.train_steps,
        epsilon: agent.policy.epsilon,
    };
    let file = File::create(dir.join("meta.json"))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, &meta)?;
    Ok(())
}

// =============================================================================
// DQN Agent
// =============================================================================

pub struct DqnAgent {
    pub online_varmap: VarMap,
    pub target_varmap: VarMap,
    online_net: QNet,
    target_net: QNet,
    optimizer: AdamW,
    device: Device,
    gamma: f64,
    hidden_size: usize,
    pub policy: EpsilonGreedy,
    pub replay: ReplayBuffer,
    batch_size: usize,
    pub train_steps: u64,
    rng: SmallRng,
}

#[cfg(target_os = "macos")]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

impl DqnAgent {
    pub fn new(device: &Device, config: AgentConfig) -> Result<Self> {
        let online_varmap = VarMap::new();
        let target_varmap = VarMap::new();

        let online_vb = VarBuilder::from_varmap(&online_varmap, candle_core::DType::F32, device);
        let target_vb = VarBuilder::from_varmap(&target_varmap, candle_core::DType::F32, device);

        let online_net = QNet::new(online_vb, config.hidden_size)?;
        let target_net = QNet::new(target_vb, config.hidden_size)?;

        let opt_params = ParamsAdamW {
            lr: config.learning_rate,
            ..Default::default()
        };
        let optimizer = AdamW::new(online_varmap.all_vars(), opt_params)?;

        let policy = EpsilonGreedy::new(
            config.epsilon_start,
            config.epsilon_min,
            config.epsilon_decay,
            config.seed,
        );

        let mut agent = Self {
            online_varmap,
            target_varmap,
            online_net,
            target_net,
            optimizer,
            device: device.clone(),
            gamma: config.gamma,
            hidden_size: config.hidden_size,
            policy,
            replay: ReplayBuffer::new(config.replay_capacity),
            batch_size: config.batch_size,
            train_steps: 0,
            rng: rng_from_seed(config.seed.map(|s| s.wrapping_add(1))),
        };
        agent.sync_target_from_online()?;
        Ok(agent)
    }

    /// Select a phase index for `state` under the current epsilon.
    pub fn select_action(&mut self, state: &Features) -> Result<usize> {
        let net = &self.online_net;
        let device = &self.device;
        self.policy.select(|| {
            let s = Tensor::from_slice(state, (1, STATE_DIM), device)?;
            let q = net.forward(&s)?;
            Ok(q.squeeze(0)?.to_vec1::<f32>()?)
        })
    }

    /// Online-network Q-values for a single state.
    pub fn q_values(&self, state: &Features) -> Result<Vec<f32>> {
        let s = Tensor::from_slice(state, (1, STATE_DIM), &self.device)?;
        let q = self.online_net.forward(&s)?;
        Ok(q.squeeze(0)?.to_vec1::<f32>()?)
    }

    pub fn epsilon(&self) -> f64 {
        self.policy.epsilon
    }

    /// Store a transition in the replay buffer.
    pub fn remember(&mut self, t: Transition) {
        self.replay.push(t);
    }

    /// One batch update of the online network against the frozen target
    /// network. Returns `None` without touching the networks while the buffer
    /// cannot fill a batch.
    pub fn train_step(&mut self) -> Result<Option<f32>> {
        let picks = match self
            .replay
            .sample_transitions(self.batch_size, &mut self.rng)
        {
            Ok(picks) => picks,
            // Not enough experience yet; the controller skips this cycle.
            Err(InsufficientDataError { .. }) => return Ok(None),
        };
        let batch = BatchTensors::pack(&picks, &self.device)?;
        drop(picks);
        self.train_steps += 1;

        with_autorelease_pool(|| {
            // y = r + gamma * max_a Q'(s', a), masked to r on terminal
            // transitions.
            let next_q = self.target_net.forward(&batch.next_states)?.max(D::Minus1)?;
            let discounted = next_q.affine(self.gamma, 0.0)?;
            let targets = batch.rewards.add(&discounted.mul(&batch.not_dones)?)?;

            // The regression target equals the prediction everywhere except
            // the taken-action index, so the loss only moves that entry.
            let q_all = self.online_net.forward(&batch.states)?;
            let mask =
                candle_nn::encoding::one_hot(batch.actions.clone(), Action::COUNT, 1f32, 0f32)?;
            let inv_mask = mask.affine(-1.0, 1.0)?;
            let target_full = q_all
                .detach()
                .mul(&inv_mask)?
                .add(&targets.unsqueeze(1)?.broadcast_mul(&mask)?)?
                .detach();
            let loss = candle_nn::loss::mse(&q_all, &target_full)?;

            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;

            Ok(Some(loss.to_scalar::<f32>()?))
        })
    }

    /// Copy online weights → target, wholesale. No interpolation.
    pub fn sync_target_from_online(&mut self) -> Result<()> {
        let online_data = self
            .online_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock online varmap for target sync"))?;
        let mut target_data = self
            .target_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock target varmap for target sync"))?;
        for (name, target_v) in target_data.iter_mut() {
            let online_v = online_data.get(name).ok_or_else(|| {
                anyhow::anyhow!("Missing var {name} in online varmap during target sync")
            })?;
            target_v.set(&online_v.as_tensor().detach())?;
        }
        Ok(())
    }

    /// Load weights saved by [`save_checkpoint`], verifying the architecture
    /// stamp first.
    pub fn load_from(&mut self, dir: &Path) -> Result<TrainMeta> {
        let meta = read_meta(dir)?;
        self.check_architecture(&meta)?;
        self.online_varmap
            .load(dir.join("model.safetensors"))
            .map_err(|err| IncompatibleWeightsError(err.to_string()))?;
        self.sync_target_from_online()?;
        Ok(meta)
    }

    /// Restore a full training checkpoint: weights, target, optimizer state,
    /// replay buffer, epsilon and counters.
    pub fn resume_from(&mut self, dir: &Path) -> Result<TrainMeta> {
        let meta = self.load_from(dir)?;
        self.target_varmap
            .load(dir.join("target.safetensors"))
            .map_err(|err| IncompatibleWeightsError(err.to_string()))?;
        if let Err(err) = self.load_optimizer(dir.join("optimizer.json")) {
            warn!("optimizer state load failed ({err}); continuing with fresh optimizer state");
        }
        self.replay = ReplayBuffer::load(dir.join("replay.bin"))?;
        self.policy.epsilon = meta.epsilon;
        self.train_steps = meta.train_steps;
        Ok(meta)
    }

    fn check_architecture(&self, meta: &TrainMeta) -> Result<(), IncompatibleWeightsError> {
        if meta.state_dim != STATE_DIM
            || meta.action_count != Action::COUNT
            || meta.hidden_size != self.hidden_size
        {
            return Err(IncompatibleWeightsError(format!(
                "checkpoint built for state_dim={} hidden={} actions={}, \
                 configured state_dim={} hidden={} actions={}",
                meta.state_dim,
                meta.hidden_size,
                meta.action_count,
                STATE_DIM,
                self.hidden_size,
                Action::COUNT
            )));
        }
        Ok(())
    }

    pub fn save_optimizer<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = OptimizerState::from(self.optimizer.params());
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, &state)?;
        Ok(())
    }

    pub fn load_optimizer<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let file = File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let state: OptimizerState =
            serde_json::from_reader(reader).context("Failed to parse optimizer state")?;
        let params = ParamsAdamW {
            lr: state.lr,
            beta1: state.beta1,
            beta2: state.beta2,
            eps: state.eps,
            weight_decay: state.weight_decay,
        };
        self.optimizer.set_params(params);
        Ok(())
    }
}

fn read_meta(dir: &Path) -> Result<TrainMeta> {
    let path = dir.join("meta.json");
    let file = File::open(&path)
        .with_context(|| format!("Failed to open checkpoint metadata {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let meta = serde_json::from_reader(reader)?;
    Ok(meta)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn test_config() -> AgentConfig {
        AgentConfig {
            hidden_size: 8,
            batch_size: 4,
            seed: Some(42),
            ..Default::default()
        }
    }

    fn transition(marker: f32) -> Transition {
        Transition {
            state: [marker; STATE_DIM],
            action: (marker as usize) % Action::COUNT,
            reward: marker,
            next_state: [marker + 0.5; STATE_DIM],
            done: false,
        }
    }

    fn probe_state() -> Features {
        let mut s = [0f32; STATE_DIM];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as f32 / 10.0;
        }
        s
    }

    #[test]
    fn buffer_never_exceeds_capacity_and_evicts_fifo() {
        let mut buffer = ReplayBuffer::new(4);
        for i in 0..6 {
            buffer.push(transition(i as f32));
            assert!(buffer.len() <= 4);
        }
        let rewards: Vec<f32> = buffer.iter().map(|t| t.reward).collect();
        assert_eq!(rewards, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn sample_fails_until_a_full_batch_is_stored() {
        let mut buffer = ReplayBuffer::new(16);
        let mut rng = SmallRng::seed_from_u64(0);

        let err = buffer.sample_transitions(1, &mut rng).unwrap_err();
        assert_eq!(err.requested, 1);
        assert_eq!(err.available, 0);

        for i in 0..3 {
            buffer.push(transition(i as f32));
        }
        let err = buffer.sample_transitions(4, &mut rng).unwrap_err();
        assert_eq!(err.requested, 4);
        assert_eq!(err.available, 3);

        buffer.push(transition(3.0));
        assert!(buffer.sample_transitions(4, &mut rng).is_ok());
    }

    #[test]
    fn sample_returns_stored_transitions_without_mutating() {
        let mut buffer = ReplayBuffer::new(8);
        for i in 0..5 {
            buffer.push(transition(i as f32));
        }
        let mut rng = SmallRng::seed_from_u64(1);

        for _ in 0..10 {
            let picks = buffer.sample_transitions(3, &mut rng).unwrap();
            assert_eq!(picks.len(), 3);
            for pick in picks {
                assert!(buffer.iter().any(|t| t == pick));
            }
            assert_eq!(buffer.len(), 5);
        }
    }

    fn nudge_online(agent: &DqnAgent) -> Result<()> {
        let data = agent.online_varmap.data().lock().unwrap();
        for var in data.values() {
            var.set(&var.as_tensor().affine(1.0, 0.1)?)?;
        }
        Ok(())
    }

    #[test]
    fn target_sync_is_a_full_overwrite() -> Result<()> {
        let device = Device::Cpu;
        let mut agent = DqnAgent::new(&device, test_config())?;
        let state = probe_state();

        let target_q = |agent: &DqnAgent| -> Result<Vec<f32>> {
            let s = Tensor::from_slice(&state, (1, STATE_DIM), &device)?;
            Ok(agent.target_net.forward(&s)?.squeeze(0)?.to_vec1::<f32>()?)
        };

        // the constructor already syncs
        assert_eq!(agent.q_values(&state)?, target_q(&agent)?);

        nudge_online(&agent)?;
        assert_ne!(agent.q_values(&state)?, target_q(&agent)?);

        agent.sync_target_from_online()?;
        assert_eq!(agent.q_values(&state)?, target_q(&agent)?);
        Ok(())
    }

    #[test]
    fn train_step_is_skipped_until_the_buffer_fills_a_batch() -> Result<()> {
        let device = Device::Cpu;
        let mut agent = DqnAgent::new(&device, test_config())?;

        for i in 0..3 {
            agent.remember(transition(i as f32));
            assert!(agent.train_step()?.is_none());
        }
        assert_eq!(agent.train_steps, 0);

        agent.remember(transition(3.0));
        let loss = agent.train_step()?.expect("batch is full");
        assert!(loss.is_finite());
        assert_eq!(agent.train_steps, 1);
        Ok(())
    }

    #[test]
    fn training_moves_only_the_online_network() -> Result<()> {
        let device = Device::Cpu;
        let mut agent = DqnAgent::new(&device, test_config())?;
        let state = probe_state();

        for i in 0..8 {
            agent.remember(transition(i as f32));
        }
        let before_target = {
            let s = Tensor::from_slice(&state, (1, STATE_DIM), &device)?;
            agent.target_net.forward(&s)?.squeeze(0)?.to_vec1::<f32>()?
        };
        agent.train_step()?.expect("batch is full");

        let after_target = {
            let s = Tensor::from_slice(&state, (1, STATE_DIM), &device)?;
            agent.target_net.forward(&s)?.squeeze(0)?.to_vec1::<f32>()?
        };
        assert_eq!(before_target, after_target);
        Ok(())
    }

    #[test]
    fn checkpoint_round_trip_restores_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut agent = DqnAgent::new(&device, test_config())?;
        for i in 0..4 {
            agent.remember(transition(i as f32));
        }
        save_checkpoint(&agent, 123, dir.path())?;

        let mut restored = DqnAgent::new(&device, test_config())?;
        let meta = restored.load_from(dir.path())?;
        assert_eq!(meta.total_steps, 123);

        let state = probe_state();
        assert_eq!(agent.q_values(&state)?, restored.q_values(&state)?);
        Ok(())
    }

    #[test]
    fn resume_restores_replay_and_epsilon() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut agent = DqnAgent::new(&device, test_config())?;
        for i in 0..7 {
            agent.remember(transition(i as f32));
        }
        agent.policy.epsilon = 0.37;
        save_checkpoint(&agent, 50, dir.path())?;

        let mut restored = DqnAgent::new(&device, test_config())?;
        restored.resume_from(dir.path())?;
        assert_eq!(restored.replay.len(), 7);
        assert_eq!(restored.policy.epsilon, 0.37);
        Ok(())
    }

    #[test]
    fn load_rejects_a_mismatched_architecture() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let agent = DqnAgent::new(&device, test_config())?;
        save_checkpoint(&agent, 0, dir.path())?;

        let mut wider = DqnAgent::new(
            &device,
            AgentConfig {
                hidden_size: 16,
                ..test_config()
            },
        )?;
        let err = wider.load_from(dir.path()).unwrap_err();
        assert!(err.downcast_ref::<IncompatibleWeightsError>().is_some());
        Ok(())
    }
}
