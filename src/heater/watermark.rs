/// Bang-bang control with `max_delta` hysteresis around the target.
#[derive(Debug, Clone)]
pub struct ControlBangBang {
    max_power: f64,
    max_delta: f64,
    heating: bool,
}

impl ControlBangBang {
    pub fn new(max_power: f64, max_delta: f64) -> Self {
        Self { max_power, max_delta, heating: false }
    }

    pub fn update(&mut self, temp: f64, target_temp: f64) -> f64 {
        if self.heating && temp >= target_temp + self.max_delta {
            self.heating = false;
        } else if !self.heating && temp <= target_temp - self.max_delta {
            self.heating = true;
        }
        if self.heating { self.max_power } else { 0.0 }
    }

    pub fn check_busy(&self, smoothed_temp: f64, target_temp: f64) -> bool {
        smoothed_temp < target_temp - self.max_delta
    }
}
