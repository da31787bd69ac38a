/// The raw stepper surface the motion controller drives. Position and
/// target here are in the driver's native (raw) coordinate; the logical
/// mapping lives entirely in the motion controller.
pub trait StepperDriver {
    fn current_position(&self) -> i32;
    fn set_current_position(&mut self, position: i32);
    fn move_to(&mut self, target: i32);
    fn distance_to_go(&self) -> i32;
    /// Advances the motor by at most one tick's worth of steps.
    /// Returns true when the position changed.
    fn run(&mut self, now_ms: u64) -> bool;
    fn set_max_speed(&mut self, steps_per_sec: f32);
    fn set_acceleration(&mut self, steps_per_sec2: f32);
    fn enable_outputs(&mut self);
    fn disable_outputs(&mut self);
    fn outputs_enabled(&self) -> bool;
}

/// Software stepper used by the host build and the engine tests. Moves at
/// a constant `max_speed` toward the target; the acceleration profile of a
/// real driver is not modelled.
#[derive(Debug, Clone)]
pub struct SoftStepper {
    position: i32,
    target: i32,
    max_speed: f32,
    acceleration: f32,
    outputs_enabled: bool,
    last_run_ms: Option<u64>,
    step_budget: f32,
}

impl SoftStepper {
    pub fn new() -> Self {
        Self {
            position: 0,
            target: 0,
            max_speed: 700.0,
            acceleration: 350.0,
            outputs_enabled: true,
            last_run_ms: None,
            step_budget: 0.0,
        }
    }

    pub fn max_speed(&self) -> f32 {
        self.max_speed
    }

    pub fn acceleration(&self) -> f32 {
        self.acceleration
    }

    pub fn target(&self) -> i32 {
        self.target
    }
}

impl Default for SoftStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl StepperDriver for SoftStepper {
    fn current_position(&self) -> i32 {
        self.position
    }

    fn set_current_position(&mut self, position: i32) {
        self.position = position;
        self.target = position;
        self.step_budget = 0.0;
    }

    fn move_to(&mut self, target: i32) {
        self.target = target;
    }

    fn distance_to_go(&self) -> i32 {
        self.target - self.position
    }

    fn run(&mut self, now_ms: u64) -> bool {
        let elapsed = match self.last_run_ms {
            Some(last) => now_ms.saturating_sub(last),
            None => 0,
        };
        self.last_run_ms = Some(now_ms);

        let remaining = self.target - self.position;
        if remaining == 0 || !self.outputs_enabled {
            self.step_budget = 0.0;
            return false;
        }

        self.step_budget += self.max_speed * elapsed as f32 / 1000.0;
        // Always make forward progress once motion is commanded, even at
        // very small tick intervals.
        let available = (self.step_budget as i32).max(1);
        let steps = available.min(remaining.abs());
        self.step_budget -= steps as f32;
        if self.step_budget < 0.0 {
            self.step_budget = 0.0;
        }

        self.position += steps * remaining.signum();
        steps != 0
    }

    fn set_max_speed(&mut self, steps_per_sec: f32) {
        self.max_speed = steps_per_sec;
    }

    fn set_acceleration(&mut self, steps_per_sec2: f32) {
        self.acceleration = steps_per_sec2;
    }

    fn enable_outputs(&mut self) {
        self.outputs_enabled = true;
    }

    fn disable_outputs(&mut self) {
        self.outputs_enabled = false;
    }

    fn outputs_enabled(&self) -> bool {
        self.outputs_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_rest(driver: &mut SoftStepper, start_ms: u64) -> u64 {
        let mut now = start_ms;
        for _ in 0..100_000 {
            now += 10;
            driver.run(now);
            if driver.distance_to_go() == 0 {
                return now;
            }
        }
        panic!("driver never reached its target");
    }

    #[test]
    fn reaches_target_in_both_directions() {
        let mut driver = SoftStepper::new();
        driver.move_to(1500);
        run_to_rest(&mut driver, 0);
        assert_eq!(driver.current_position(), 1500);

        driver.move_to(-300);
        run_to_rest(&mut driver, 100_000);
        assert_eq!(driver.current_position(), -300);
    }

    #[test]
    fn respects_speed_limit() {
        let mut driver = SoftStepper::new();
        driver.set_max_speed(100.0);
        driver.move_to(1_000);

        driver.run(0);
        // One second at 100 steps/s.
        driver.run(1_000);
        assert!(driver.current_position() <= 101);
    }

    #[test]
    fn released_outputs_do_not_move() {
        let mut driver = SoftStepper::new();
        driver.move_to(500);
        driver.disable_outputs();
        assert!(!driver.run(100));
        assert_eq!(driver.current_position(), 0);
    }
}
