use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::dqn::{DqnAgent, Transition, save_checkpoint};
use crate::env::{Action, TrafficEnv, TrafficSim};

// =============================================================================
// Training Loop
// =============================================================================

pub struct TrainConfig {
    /// Simulation step budget; the run ends when it is spent.
    pub total_steps: u64,
    pub checkpoint_dir: PathBuf,
    pub log_every: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_steps: 10_000,
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_every: 100,
        }
    }
}

/// Drives the simulator and the learner. Owns all mutable training state:
/// phase timer, waiting history, and the agent with its buffer and epsilon.
pub struct Trainer<S: TrafficSim> {
    env: TrafficEnv<S>,
    agent: DqnAgent,
    config: TrainConfig,
    phase_timer: u32,
    prev_total_wait: f64,
    waiting_history: Vec<f64>,
    decisions: u64,
    trained: u64,
}

impl<S: TrafficSim> Trainer<S> {
    pub fn new(env: TrafficEnv<S>, agent: DqnAgent, config: TrainConfig) -> Self {
        Self {
            env,
            agent,
            config,
            phase_timer: 0,
            prev_total_wait: 0.0,
            waiting_history: Vec::new(),
            decisions: 0,
            trained: 0,
        }
    }

    /// Restore agent state from an earlier checkpoint before running.
    pub fn resume(&mut self, dir: &Path) -> Result<()> {
        let meta = self.agent.resume_from(dir)?;
        info!(
            total_steps = meta.total_steps,
            epsilon = meta.epsilon,
            "resumed from {}",
            dir.display()
        );
        Ok(())
    }

    /// Run the configured step budget. The simulator is closed before this
    /// returns, whether the run completed or failed mid-step.
    pub fn run(&mut self) -> Result<Vec<f64>> {
        let outcome = self.run_loop();
        self.env.close();
        outcome?;
        self.persist()?;
        Ok(self.waiting_history.clone())
    }

    fn run_loop(&mut self) -> Result<()> {
        for step in 0..self.config.total_steps {
            self.env.step()?;

            let spawn_period = self.env.env_config.spawn_period;
            if spawn_period > 0 && step % spawn_period == 0 {
                self.env.spawn_demand()?;
            }

            // The previously applied phase persists until the minimum green
            // time has elapsed.
            if self.phase_timer >= self.env.env_config.min_green {
                self.decision_cycle()?;
            }
            self.phase_timer += 1;

            let total_wait = self.env.total_waiting_time()?;
            self.waiting_history.push(total_wait);

            if step % self.config.log_every == 0 {
                info!(
                    step,
                    active = self.env.active_vehicle_count(),
                    total_wait,
                    epsilon = self.agent.epsilon(),
                    "train"
                );
            }
        }
        Ok(())
    }

    /// One full decision: encode, act, observe, store, learn, sync, decay.
    fn decision_cycle(&mut self) -> Result<()> {
        let state = self.env.encode_state()?;
        let action_idx = self.agent.select_action(&state)?;
        self.env.apply_action(Action::from_index(action_idx))?;

        let teleport_count = self.env.count_stuck_vehicles()?;
        let (reward, new_total_wait) = self
            .env
            .compute_reward(self.prev_total_wait, teleport_count)?;
        self.prev_total_wait = new_total_wait;
        let next_state = self.env.encode_state()?;

        // The run ends on a step budget the learner never observes, so no
        // transition is terminal (infinite-horizon approximation).
        self.agent.remember(Transition {
            state,
            action: action_idx,
            reward: reward as f32,
            next_state,
            done: false,
        });

        if self.agent.train_step()?.is_some() {
            self.agent.sync_target_from_online()?;
            self.trained += 1;
        }

        self.phase_timer = 0;
        self.agent.policy.decay();
        self.decisions += 1;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        save_checkpoint(&self.agent, self.config.total_steps, &self.config.checkpoint_dir)
            .context("Failed to save checkpoint")?;
        let path = self.config.checkpoint_dir.join("waiting_history.json");
        let file = File::create(&path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, &self.waiting_history)?;
        info!(path = %path.display(), "checkpoint and waiting history saved");
        Ok(())
    }

    pub fn decisions(&self) -> u64 {
        self.decisions
    }

    /// Decision cycles that actually ran a batch update.
    pub fn trained_updates(&self) -> u64 {
        self.trained
    }

    pub fn waiting_history(&self) -> &[f64] {
        &self.waiting_history
    }

    pub fn env(&self) -> &TrafficEnv<S> {
        &self.env
    }

    pub fn agent(&self) -> &DqnAgent {
        &self.agent
    }
}
