use ino_shared::{PidGains, PID_PARAM_BASE};

pub const AMBIENT_TEMP: f64 = 25.0;
const PID_SETTLE_DELTA: f64 = 1.0;
const PID_SETTLE_SLOPE: f64 = 0.1;

/// Positional PID with derivative smoothing and integral anti-windup.
///
/// Gains are configured in 0..255 PWM units and scaled down to produce a
/// 0.0-1.0 power fraction.
#[derive(Debug, Clone)]
pub struct ControlPid {
    gains: PidGains,
    kp: f64,
    ki: f64,
    kd: f64,
    max_power: f64,
    min_deriv_time: f64,
    temp_integ_max: f64,
    prev_temp: f64,
    prev_temp_time: f64,
    prev_temp_deriv: f64,
    prev_temp_integ: f64,
}

impl ControlPid {
    pub fn new(gains: PidGains, max_power: f64, smooth_time: f64) -> Self {
        let mut pid = Self {
            gains,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            max_power,
            min_deriv_time: smooth_time,
            temp_integ_max: 0.0,
            prev_temp: AMBIENT_TEMP,
            prev_temp_time: 0.0,
            prev_temp_deriv: 0.0,
            prev_temp_integ: 0.0,
        };
        pid.set_gains(gains);
        pid
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    /// Swap gains in place. Accumulated state is kept, the integral clamped
    /// to the new limit.
    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
        self.kp = gains.kp / PID_PARAM_BASE;
        self.ki = gains.ki / PID_PARAM_BASE;
        self.kd = gains.kd / PID_PARAM_BASE;
        self.temp_integ_max = if self.ki > 0.0 { self.max_power / self.ki } else { 0.0 };
        self.prev_temp_integ = self.prev_temp_integ.clamp(0.0, self.temp_integ_max);
    }

    /// Forget the integral and slope, e.g. after another controller drove the heater.
    pub fn reset(&mut self) {
        self.prev_temp_deriv = 0.0;
        self.prev_temp_integ = 0.0;
    }

    /// Advance the controller with a reading taken at `read_time` and return
    /// the bounded output.
    pub fn update(&mut self, read_time: f64, temp: f64, target_temp: f64) -> f64 {
        let time_diff = read_time - self.prev_temp_time;
        let temp_diff = temp - self.prev_temp;
        let temp_deriv = if time_diff >= self.min_deriv_time {
            temp_diff / time_diff
        } else {
            (self.prev_temp_deriv * (self.min_deriv_time - time_diff) + temp_diff) / self.min_deriv_time
        };

        let temp_err = target_temp - temp;
        let temp_integ = (self.prev_temp_integ + temp_err * time_diff).clamp(0.0, self.temp_integ_max);

        let co = self.kp * temp_err + self.ki * temp_integ - self.kd * temp_deriv;
        let bounded_co = co.clamp(0.0, self.max_power);

        self.prev_temp = temp;
        self.prev_temp_time = read_time;
        self.prev_temp_deriv = temp_deriv;
        // Integrate only while unsaturated.
        if co == bounded_co {
            self.prev_temp_integ = temp_integ;
        }
        bounded_co
    }

    pub fn check_busy(&self, smoothed_temp: f64, target_temp: f64) -> bool {
        (target_temp - smoothed_temp).abs() > PID_SETTLE_DELTA || self.prev_temp_deriv.abs() > PID_SETTLE_SLOPE
    }

    pub fn integral(&self) -> f64 {
        self.prev_temp_integ
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_pid() -> ControlPid {
        ControlPid::new(PidGains::new(13.41, 30.91, 1.46), 1.0, 1.0)
    }

    #[test]
    fn test_far_below_target_saturates() {
        let mut pid = default_pid();
        assert_eq!(pid.update(0.1, 50.0, 250.0), 1.0);
        // Saturated, so the integral did not wind up.
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn test_above_target_is_off() {
        let mut pid = default_pid();
        pid.update(0.1, 260.0, 250.0);
        assert_eq!(pid.update(0.2, 262.0, 250.0), 0.0);
    }

    #[test]
    fn test_integral_limited_by_max_power() {
        let mut pid = ControlPid::new(PidGains::new(0.0, 30.0, 0.0), 0.5, 1.0);
        let mut t = 0.0;
        for _ in 0..100 {
            t += 0.1;
            pid.update(t, 199.0, 200.0);
        }
        assert!(pid.integral() <= 0.5 / (30.0 / PID_PARAM_BASE) + 1e-9);
    }

    #[test]
    fn test_zero_ki_disables_integral() {
        let mut pid = ControlPid::new(PidGains::new(10.0, 0.0, 0.0), 1.0, 1.0);
        pid.update(0.1, 249.0, 250.0);
        assert_eq!(pid.integral(), 0.0);
    }
}
