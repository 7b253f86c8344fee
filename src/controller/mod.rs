pub mod dispatch;
pub mod energy;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use std::sync::Arc;
use strum::Display;
use tracing::{error, info, warn};

use crate::config::DispatchConfig;
use crate::domain::{CommandSink, TelemetryStore};
use crate::meter::{PowerSampler, SampleError};

pub use dispatch::{clamp_candidate, CycleOutcome, DispatchState, SkipReason, ANTI_REPEAT_DELTA_W};
pub use energy::EnergyAccumulator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ControllerPhase {
    Idle,
    WarmingUp,
    Running,
}

/// Sequential sample → decide → emit loop around a [`DispatchState`].
pub struct DispatchController {
    cfg: DispatchConfig,
    sampler: PowerSampler,
    telemetry: TelemetryStore,
    sink: Arc<dyn CommandSink>,
    state: DispatchState,
    phase: ControllerPhase,
}

impl DispatchController {
    pub fn new(
        cfg: DispatchConfig,
        sampler: PowerSampler,
        telemetry: TelemetryStore,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            cfg,
            sampler,
            telemetry,
            sink,
            state: DispatchState::new(),
            phase: ControllerPhase::Idle,
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    /// Waits for the first battery telemetry, sleeps the warm-up period and
    /// takes over the battery's reported power as the starting set-point.
    pub async fn warm_up(&mut self) {
        self.phase = ControllerPhase::WarmingUp;
        if !self.telemetry.wait_for_first(self.cfg.telemetry_wait()).await {
            warn!(
                waited_s = self.cfg.telemetry_wait_seconds,
                "no battery telemetry yet, starting without it"
            );
        }
        tokio::time::sleep(self.cfg.warmup()).await;

        let telemetry = self.telemetry.read();
        if self.state.adopt(&telemetry) {
            info!(
                set_point_w = self.state.current_set_point_w(),
                "starting from battery reported power"
            );
        }
        self.phase = ControllerPhase::Running;
    }

    /// Runs forever. Only a cycle without any power reading ends the loop.
    pub async fn run(&mut self) -> Result<()> {
        if self.phase != ControllerPhase::Running {
            self.warm_up().await;
        }
        info!(
            cycle_s = self.cfg.update_cycle_seconds,
            samples = self.cfg.samples_per_cycle,
            max_charge_w = self.cfg.max_charge_w,
            max_discharge_w = self.cfg.max_discharge_w,
            "dispatch loop running"
        );
        loop {
            self.run_cycle().await?;
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, SampleError> {
        self.run_cycle_on(Local::now().date_naive()).await
    }

    /// One cycle with an explicit calendar day.
    pub async fn run_cycle_on(&mut self, today: NaiveDate) -> Result<CycleOutcome, SampleError> {
        let sample_w = self
            .sampler
            .sample(self.cfg.cycle(), self.cfg.samples_per_cycle)
            .await?;
        let telemetry = self.telemetry.read();
        let outcome = self.state.step(&self.cfg, sample_w, &telemetry, today);

        match outcome {
            CycleOutcome::Emit { set_point_w } => {
                info!(
                    sample_w,
                    soc_percent = ?telemetry.soc_percent,
                    battery_w = ?telemetry.grid_power_w,
                    set_point_w,
                    energy_in_wh = self.state.energy().energy_in_wh,
                    energy_out_wh = self.state.energy().energy_out_wh,
                    "new battery set-point"
                );
                if let Err(e) = self.sink.send(set_point_w).await {
                    error!(error = %e, set_point_w, "set-point not delivered");
                }
            }
            CycleOutcome::Skip { reason } => {
                info!(
                    sample_w,
                    soc_percent = ?telemetry.soc_percent,
                    battery_w = ?telemetry.grid_power_w,
                    %reason,
                    "nothing to do, battery set-point is zero"
                );
            }
        }
        Ok(outcome)
    }
}
