/// Lumped thermal model of a hotend with a lagging thermistor.
#[derive(Debug, Clone)]
pub struct ThermalModel {
    /// Block temperature, °C.
    pub temp: f64,
    /// What the sensor reports, °C.
    pub sensor_temp: f64,
    pub ambient: f64,
    /// Temperature rise per second at full power, ignoring losses.
    pub heat_rate: f64,
    /// Newtonian loss coefficient, 1/s.
    pub loss_coeff: f64,
    /// Sensor response rate, 1/s.
    pub sensor_lag: f64,
    /// Peak-to-peak sensor noise, °C.
    pub noise: f64,
}

const MAX_SUBSTEP: f64 = 0.05;

impl ThermalModel {
    pub fn hotend() -> Self {
        Self {
            temp: 25.0,
            sensor_temp: 25.0,
            ambient: 25.0,
            heat_rate: 12.0,
            loss_coeff: 0.02,
            sensor_lag: 0.8,
            noise: 0.0,
        }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Force both the block and the sensor to `temp`.
    pub fn set_temperature(&mut self, temp: f64) {
        self.temp = temp;
        self.sensor_temp = temp;
    }

    /// Advance the model by `dt` seconds at a constant power fraction.
    pub fn step(&mut self, power: f64, dt: f64) {
        let power = power.clamp(0.0, 1.0);
        let mut remaining = dt.max(0.0);
        while remaining > 0.0 {
            let h = remaining.min(MAX_SUBSTEP);
            let heat_gain = power * self.heat_rate * h;
            let heat_loss = self.loss_coeff * (self.temp - self.ambient) * h;
            self.temp += heat_gain - heat_loss;
            let follow = (self.sensor_lag * h).min(1.0);
            self.sensor_temp += follow * (self.temp - self.sensor_temp);
            remaining -= h;
        }
        if self.noise > 0.0 {
            self.sensor_temp += self.noise * (rand::random::<f64>() - 0.5);
        }
    }

    pub fn measured(&self) -> f64 {
        self.sensor_temp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heats_at_full_power() {
        let mut model = ThermalModel::hotend();
        model.step(1.0, 10.0);
        assert!(model.temp > 100.0);
        assert!(model.measured() < model.temp);
    }

    #[test]
    fn test_cools_toward_ambient() {
        let mut model = ThermalModel::hotend();
        model.set_temperature(200.0);
        model.step(0.0, 30.0);
        assert!(model.temp < 200.0);
        assert!(model.temp > model.ambient);
    }
}
