use crate::config::{ControllerState, ShutterConfig};
use crate::driver::StepperDriver;
use crate::math::{clamp_i32, percent_to_steps, to_logical, to_raw};
use crate::types::{ApiError, MotionPhase};

/// What one motion quantum did; the engine uses this to mark state dirty
/// and to force a save at the end of a travel.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionTick {
    pub position_changed: bool,
    pub just_stopped: bool,
}

/// State machine over {Idle, Moving} on top of a raw stepper driver.
/// Owns the logical target, the overdrive rebound flag, and the coil-hold
/// timer; every transition that must clear the rebound flag does so itself
/// rather than relying on tick ordering.
#[derive(Debug)]
pub struct MotionController<D: StepperDriver> {
    driver: D,
    target: i32,
    rebound_pending: bool,
    stopped_at_ms: u64,
}

impl<D: StepperDriver> MotionController<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            target: 0,
            rebound_pending: false,
            stopped_at_ms: 0,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub fn is_moving(&self) -> bool {
        self.driver.distance_to_go() != 0
    }

    pub fn rebound_pending(&self) -> bool {
        self.rebound_pending
    }

    pub fn coils_released(&self) -> bool {
        !self.driver.outputs_enabled()
    }

    pub fn raw_position(&self) -> i32 {
        self.driver.current_position()
    }

    pub fn current_logical(&self, state: &ControllerState) -> i32 {
        clamp_i32(
            to_logical(self.driver.current_position(), state.reverse_direction),
            0,
            state.travel_steps,
        )
    }

    pub fn phase(&self, state: &ControllerState) -> MotionPhase {
        if !self.is_moving() {
            return MotionPhase::Idle;
        }
        let logical_to_go = to_logical(self.driver.distance_to_go(), state.reverse_direction);
        if logical_to_go > 0 {
            MotionPhase::Closing
        } else {
            MotionPhase::Opening
        }
    }

    pub fn apply_profile(&mut self, state: &ControllerState) {
        self.driver.set_max_speed(state.max_speed);
        self.driver.set_acceleration(state.acceleration);
    }

    /// Boot-time seeding from the persisted position hint: the physical
    /// shutter has not moved, so the driver is told where it already is.
    pub fn seed(&mut self, state: &ControllerState) {
        self.apply_profile(state);
        self.target = clamp_i32(state.current_position, 0, state.travel_steps);
        let raw = to_raw(self.target, state.reverse_direction);
        self.driver.set_current_position(raw);
        self.driver.move_to(raw);
        self.driver.disable_outputs();
    }

    pub fn move_to_logical(&mut self, state: &ControllerState, logical_target: i32) {
        self.target = clamp_i32(logical_target, 0, state.travel_steps);
        self.rebound_pending = false;
        self.driver.enable_outputs();
        self.driver
            .move_to(to_raw(self.target, state.reverse_direction));
    }

    /// Open with a push past logical zero, then settle back, so the shutter
    /// seats fully against the top end-stop. Falls back to a plain open when
    /// overdrive is disabled or rounds to nothing.
    pub fn open_with_overdrive(&mut self, state: &ControllerState) {
        if !state.top_overdrive_enabled || state.top_overdrive_percent <= 0.0 {
            self.move_to_logical(state, 0);
            return;
        }
        let extra_steps = percent_to_steps(state.top_overdrive_percent, state.travel_steps);
        if extra_steps <= 0 {
            self.move_to_logical(state, 0);
            return;
        }
        self.target = 0;
        self.rebound_pending = true;
        self.driver.enable_outputs();
        self.driver
            .move_to(to_raw(-extra_steps, state.reverse_direction));
    }

    /// Cancels remaining travel by snapping the driver's target onto its
    /// current raw position.
    pub fn stop(&mut self, state: &ControllerState, now_ms: u64) {
        let raw_now = self.driver.current_position();
        self.driver.set_current_position(raw_now);
        self.driver.move_to(raw_now);
        self.target = clamp_i32(
            to_logical(raw_now, state.reverse_direction),
            0,
            state.travel_steps,
        );
        self.rebound_pending = false;
        self.stopped_at_ms = now_ms;
    }

    /// Immediate coil release without waiting out the hold time; used to
    /// quiesce the motor before flashing.
    pub fn release_coils(&mut self) {
        self.driver.disable_outputs();
    }

    /// Relative move clamped into travel bounds; used by the move endpoint.
    pub fn move_jog(&mut self, state: &ControllerState, logical_delta: i32) -> Result<(), ApiError> {
        if logical_delta == 0 {
            return Err(ApiError::validation("steps must be non-zero"));
        }
        self.move_to_logical(state, self.current_logical(state) + logical_delta);
        Ok(())
    }

    /// Unclamped relative move in raw space; used while measuring travel,
    /// when the end-stops are not yet known.
    pub fn calibrate_jog(
        &mut self,
        state: &ControllerState,
        logical_delta: i32,
    ) -> Result<(), ApiError> {
        if logical_delta == 0 {
            return Err(ApiError::validation("steps must be non-zero"));
        }
        let raw_delta = to_raw(logical_delta, state.reverse_direction);
        let raw_target = self.driver.current_position() + raw_delta;
        self.rebound_pending = false;
        self.driver.enable_outputs();
        self.driver.move_to(raw_target);
        Ok(())
    }

    /// Defines raw zero (fully open) at the current physical position.
    pub fn calibrate_set_top(&mut self, state: &mut ControllerState) {
        self.driver.set_current_position(0);
        self.driver.move_to(0);
        self.target = 0;
        self.rebound_pending = false;
        state.current_position = 0;
    }

    /// Adopts the signed displacement from top as the travel length.
    /// Rejects, with no state change, a displacement shorter than the
    /// minimum travel.
    pub fn calibrate_set_bottom(
        &mut self,
        cfg: &ShutterConfig,
        state: &mut ControllerState,
    ) -> Result<(), ApiError> {
        let measured = to_logical(self.driver.current_position(), state.reverse_direction).abs();
        if measured < cfg.min_travel_steps {
            return Err(ApiError::validation("measured travel is too short"));
        }
        state.travel_steps = clamp_i32(measured, cfg.min_travel_steps, cfg.max_travel_steps);
        let raw = to_raw(state.travel_steps, state.reverse_direction);
        self.driver.set_current_position(raw);
        self.driver.move_to(raw);
        self.target = state.travel_steps;
        self.rebound_pending = false;
        state.current_position = state.travel_steps;
        state.calibrated = true;
        Ok(())
    }

    /// After a direction or travel-length change the same physical spot must
    /// keep its meaning: re-clamp the logical position/target into the new
    /// bounds and re-issue them to the driver under the new mapping.
    pub fn reapply_bounds(&mut self, state: &ControllerState, logical_pos_before: i32) {
        self.apply_profile(state);
        let clamped_pos = clamp_i32(logical_pos_before, 0, state.travel_steps);
        self.target = clamp_i32(self.target, 0, state.travel_steps);
        self.driver
            .set_current_position(to_raw(clamped_pos, state.reverse_direction));
        self.driver
            .move_to(to_raw(self.target, state.reverse_direction));
    }

    /// One motion quantum: advance the driver, finish an overdrive rebound,
    /// and release the coils once the hold time expires.
    pub fn run(&mut self, state: &ControllerState, now_ms: u64) -> MotionTick {
        let was_moving = self.is_moving();
        let position_changed = self.driver.run(now_ms);
        let is_moving = self.is_moving();

        let mut just_stopped = false;
        if was_moving && !is_moving {
            if self.rebound_pending {
                // Overdrive push finished; settle back onto true zero.
                self.rebound_pending = false;
                self.driver.move_to(to_raw(0, state.reverse_direction));
            } else {
                self.stopped_at_ms = now_ms;
                self.target = self.current_logical(state);
                just_stopped = true;
            }
        }

        if !self.is_moving()
            && !self.coils_released()
            && now_ms.saturating_sub(self.stopped_at_ms) >= u64::from(state.coil_hold_ms)
        {
            self.driver.disable_outputs();
        }

        MotionTick {
            position_changed,
            just_stopped,
        }
    }
}
