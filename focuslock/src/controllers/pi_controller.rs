//! Proportional-integral focus controller
//!
//! Turns a focus error in micrometres into a relative Z move.
//!
//! # Operation
//! 1. Create controller with `PiController::new(gains)`
//! 2. Enable control with `set_enabled(true)`
//! 3. Call `update()` each frame with the setpoint error in µm
//! 4. Use `set_hold(true)` to pause control (integral is preserved)
//! 5. Call `unwind()` when the resulting command is clipped or withheld
//!
//! # Units
//! - Input: setpoint error in micrometres (positive means move up)
//! - Output: relative Z command in micrometres

/// Gains and limits for [`PiController`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiGains {
    /// Proportional gain (µm command per µm error)
    pub kp: f64,
    /// Integral gain (µm command per µm·s of accumulated error)
    pub ki: f64,
    /// Update rate; the integral advances by `error / loop_hz` per update
    pub loop_hz: f64,
    /// Largest relative move per update
    pub max_step_um: f64,
    /// Integral accumulator bound, µm·s
    pub integral_limit_um: f64,
}

/// Result of one [`PiController::update`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PiOutput {
    /// Relative Z command after the slew limit
    pub delta_um: f64,
    /// Integral accumulator after this update
    pub integral_um: f64,
    /// The slew limit was active
    pub slew_limited: bool,
}

/// PI law with slew limit, integral clamp and one-step unwind
#[derive(Debug, Clone)]
pub struct PiController {
    gains: PiGains,
    integral: f64,
    /// Integral accumulated by the most recent update, for `unwind`
    last_increment: f64,
    enabled: bool,
    hold: bool,
}

impl PiController {
    /// Create a disabled controller with an empty integral
    pub fn new(gains: PiGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_increment: 0.0,
            enabled: false,
            hold: false,
        }
    }

    /// Enable or disable the controller
    ///
    /// Disabling clears the integral.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.reset();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Set hold mode
    ///
    /// While held the controller commands no motion and the integral is
    /// left exactly as it was, so control resumes where it left off.
    pub fn set_hold(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Clear the integral
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_increment = 0.0;
    }

    pub fn integral_um(&self) -> f64 {
        self.integral
    }

    pub fn gains(&self) -> &PiGains {
        &self.gains
    }

    /// Advance the controller by one sample
    pub fn update(&mut self, error_um: f64) -> PiOutput {
        if self.hold || !self.enabled {
            self.last_increment = 0.0;
            return PiOutput {
                integral_um: self.integral,
                ..Default::default()
            };
        }

        let limit = self.gains.integral_limit_um;
        let before = self.integral;
        self.integral = (self.integral + error_um / self.gains.loop_hz).clamp(-limit, limit);
        self.last_increment = self.integral - before;

        let raw = self.gains.kp * error_um + self.gains.ki * self.integral;
        let max_step = self.gains.max_step_um;
        let delta = raw.clamp(-max_step, max_step);

        PiOutput {
            delta_um: delta,
            integral_um: self.integral,
            slew_limited: delta != raw,
        }
    }

    /// Undo the integral accumulated by the most recent update
    ///
    /// Used when the resulting command is clipped by a hard limit or not sent
    /// at all. Returns the integral afterwards.
    pub fn unwind(&mut self) -> f64 {
        let limit = self.gains.integral_limit_um;
        self.integral = (self.integral - self.last_increment).clamp(-limit, limit);
        self.last_increment = 0.0;
        self.integral
    }
}
