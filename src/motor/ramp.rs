// Rate limiter for velocity setpoints
//
// Used for normal driving and for the emergency-stop deceleration (target 0).

/// Move `current` toward `target` by at most `max_rate * dt`, never past it.
///
/// A non-positive or non-finite `max_rate` disables limiting. A NaN target
/// holds the current value.
pub fn step(dt: f32, current: f32, target: f32, max_rate: f32) -> f32 {
    if target.is_nan() {
        return current;
    }
    if !(max_rate.is_finite() && max_rate > 0.0) {
        return target;
    }

    let max_delta = max_rate * dt.max(0.0);
    let delta = target - current;
    if delta.abs() <= max_delta {
        target
    } else {
        current + max_delta.copysign(delta)
    }
}

/// Ramp state for one wheel channel
#[derive(Debug, Clone, Copy)]
pub struct Ramp {
    value: f32,
    max_rate: f32,
}

impl Ramp {
    /// `max_rate` in units per second
    pub fn new(max_rate: f32) -> Self {
        Self {
            value: 0.0,
            max_rate,
        }
    }

    /// Advance one control tick toward `target` at the configured rate
    pub fn update(&mut self, target: f32, dt: f32) -> f32 {
        self.update_with_rate(target, dt, self.max_rate)
    }

    /// Advance one tick at an explicit rate (e.g. emergency deceleration)
    pub fn update_with_rate(&mut self, target: f32, dt: f32, max_rate: f32) -> f32 {
        self.value = step(dt, self.value, target, max_rate);
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Jump to a value without ramping
    pub fn reset(&mut self, value: f32) {
        self.value = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_is_rate_limited() {
        assert_eq!(step(0.1, 0.0, 100.0, 200.0), 20.0);
        assert_eq!(step(0.1, 0.0, -100.0, 200.0), -20.0);
        assert_eq!(step(0.1, 50.0, -50.0, 200.0), 30.0);
    }

    #[test]
    fn test_step_never_overshoots() {
        assert_eq!(step(0.1, 95.0, 100.0, 200.0), 100.0);
        assert_eq!(step(1.0, -3.0, 0.0, 200.0), 0.0);
    }

    #[test]
    fn test_step_bound_holds_for_many_inputs() {
        let dt = 0.02;
        let rate = 1500.0;
        for current in [-3000.0f32, -250.5, 0.0, 13.0, 2999.0] {
            for target in [-3000.0f32, -1.0, 0.0, 0.25, 800.0, 3000.0] {
                let next = step(dt, current, target, rate);
                assert!((next - current).abs() <= rate * dt + 1e-3);
                // Between current and target
                assert!((next - current) * (target - current) >= 0.0);
                assert!((target - next).abs() <= (target - current).abs());
            }
        }
    }

    #[test]
    fn test_converges_in_expected_steps() {
        // |175 - 0| / (100 * 0.5) = 3.5 -> 4 steps
        let mut ramp = Ramp::new(100.0);
        let mut steps = 0;
        while ramp.value() != 175.0 {
            ramp.update(175.0, 0.5);
            steps += 1;
            assert!(steps <= 4);
        }
        assert_eq!(steps, 4);
    }

    #[test]
    fn test_disabled_limit_jumps() {
        assert_eq!(step(0.02, 0.0, 500.0, 0.0), 500.0);
        assert_eq!(step(0.02, 0.0, 500.0, f32::INFINITY), 500.0);
    }

    #[test]
    fn test_nan_target_holds() {
        assert_eq!(step(0.02, 12.0, f32::NAN, 100.0), 12.0);
    }

    #[test]
    fn test_deceleration_to_zero() {
        let mut ramp = Ramp::new(100.0);
        ramp.reset(300.0);
        assert_eq!(ramp.update_with_rate(0.0, 0.05, 3000.0), 150.0);
        assert_eq!(ramp.update_with_rate(0.0, 0.05, 3000.0), 0.0);
    }
}
