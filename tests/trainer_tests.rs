use anyhow::Result;
use candle_core::Device;

use traffic_rl::dqn::{AgentConfig, DqnAgent};
use traffic_rl::env::{EnvConfig, RewardConfig, SimError, TrafficEnv, TrafficSim};
use traffic_rl::train::{TrainConfig, Trainer};

/// Scripted simulator that records every applied light configuration and can
/// be told to fail at a given step.
#[derive(Default)]
struct StubSim {
    steps: u64,
    applied: Vec<(u64, String)>,
    closed: bool,
    fail_at: Option<u64>,
}

impl TrafficSim for StubSim {
    fn step(&mut self) -> Result<(), SimError> {
        self.steps += 1;
        if Some(self.steps) == self.fail_at {
            return Err(SimError::Connection("scripted failure".to_string()));
        }
        Ok(())
    }

    fn lane_vehicle_count(&self, _lane: &str) -> Result<usize, SimError> {
        Ok((self.steps % 5) as usize)
    }

    fn lane_waiting_time(&self, _lane: &str) -> Result<f64, SimError> {
        Ok((self.steps % 7) as f64)
    }

    fn apply_light_configuration(&mut self, _tls_id: &str, state: &str) -> Result<(), SimError> {
        self.applied.push((self.steps, state.to_string()));
        Ok(())
    }

    fn spawn_vehicle(&mut self, _id: &str, _route: &str, _vtype: &str) -> Result<(), SimError> {
        Ok(())
    }

    fn active_vehicle_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn vehicle_waiting_time(&self, id: &str) -> Result<f64, SimError> {
        Err(SimError::UnknownVehicle(id.to_string()))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn trainer_with(
    sim: StubSim,
    min_green: u32,
    total_steps: u64,
    checkpoint_dir: std::path::PathBuf,
) -> Result<Trainer<StubSim>> {
    let env_config = EnvConfig {
        min_green,
        spawn_period: 0,
        seed: Some(11),
    };
    let env = TrafficEnv::new(sim, env_config, RewardConfig::default());
    let agent = DqnAgent::new(
        &Device::Cpu,
        AgentConfig {
            hidden_size: 8,
            seed: Some(11),
            ..Default::default()
        },
    )?;
    let train_config = TrainConfig {
        total_steps,
        checkpoint_dir,
        log_every: 1_000_000,
    };
    Ok(Trainer::new(env, agent, train_config))
}

#[test]
fn min_green_gates_every_phase_change() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut trainer = trainer_with(StubSim::default(), 10, 50, dir.path().to_path_buf())?;
    let history = trainer.run()?;

    // Phase changes only at sim steps 11, 21, 31, 41: nine untouched steps
    // between consecutive decisions.
    let applied = &trainer.env().sim().applied;
    let stamps: Vec<u64> = applied.iter().map(|(step, _)| *step).collect();
    assert_eq!(stamps, vec![11, 21, 31, 41]);
    assert_eq!(trainer.decisions(), 4);

    // Waiting history covers every simulation step, not just decisions.
    assert_eq!(history.len(), 50);

    // Far below batch size: no training happened, storage did.
    assert_eq!(trainer.trained_updates(), 0);
    assert_eq!(trainer.agent().replay.len(), 4);

    assert!(trainer.env().sim().closed);
    Ok(())
}

#[test]
fn first_update_fires_exactly_when_the_buffer_reaches_batch_size() -> Result<()> {
    // With min_green 0 every step is a decision cycle; batch size is the
    // default 64.
    let dir = tempfile::tempdir()?;
    let mut trainer = trainer_with(StubSim::default(), 0, 63, dir.path().to_path_buf())?;
    trainer.run()?;
    assert_eq!(trainer.decisions(), 63);
    assert_eq!(trainer.trained_updates(), 0);

    let dir = tempfile::tempdir()?;
    let mut trainer = trainer_with(StubSim::default(), 0, 64, dir.path().to_path_buf())?;
    trainer.run()?;
    assert_eq!(trainer.decisions(), 64);
    assert_eq!(trainer.trained_updates(), 1);
    Ok(())
}

#[test]
fn epsilon_decays_once_per_decision() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut trainer = trainer_with(StubSim::default(), 10, 50, dir.path().to_path_buf())?;
    trainer.run()?;

    // Four decisions at decay rate 0.99995 from 1.0.
    let expected = (0..4).fold(1.0f64, |eps, _| (eps * 0.99995).max(0.05));
    assert_eq!(trainer.agent().epsilon(), expected);
    Ok(())
}

#[test]
fn simulator_is_closed_even_when_a_step_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sim = StubSim {
        fail_at: Some(5),
        ..Default::default()
    };
    let mut trainer = trainer_with(sim, 10, 50, dir.path().to_path_buf())?;
    assert!(trainer.run().is_err());
    assert!(trainer.env().sim().closed);
    Ok(())
}
