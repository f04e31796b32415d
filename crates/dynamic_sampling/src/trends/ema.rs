/// Exponential moving average over a fixed period.
///
/// The smoothing factor is `smoothing / (period + 1)`. The first observation seeds the
/// average directly since there is nothing to blend it with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: f64,
    count: u64,
}

impl ExponentialMovingAverage {
    pub fn new(smoothing: f64, period: u32) -> Self {
        Self {
            alpha: smoothing / (f64::from(period) + 1.0),
            value: 0.0,
            count: 0,
        }
    }

    /// Restores a previously persisted average so updates continue from it.
    pub fn set(&mut self, value: f64, count: u64) {
        self.value = value;
        self.count = count;
    }

    pub fn update(&mut self, new_value: f64) {
        self.value = if self.count == 0 {
            new_value
        } else {
            self.alpha * new_value + (1.0 - self.alpha) * self.value
        };
        self.count += 1;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-12;

    #[test]
    fn cold_start_takes_first_value() {
        for value in [0.0, -3.5, 42.0, 1e9] {
            let mut ema = ExponentialMovingAverage::new(2.0, 20);
            ema.update(value);
            assert_eq!(ema.value(), value);
            assert_eq!(ema.count(), 1);
        }
    }

    #[test]
    fn warm_update_blends_with_previous() {
        let mut ema = ExponentialMovingAverage::new(2.0, 20);
        let alpha = 2.0 / 21.0;
        assert!((ema.alpha() - alpha).abs() < EPSILON);

        ema.set(10.0, 5);
        ema.update(31.0);

        let expected = alpha * 31.0 + (1.0 - alpha) * 10.0;
        assert!((ema.value() - expected).abs() < EPSILON);
        assert_eq!(ema.count(), 6);
    }

    #[test]
    fn restored_average_continues_instead_of_restarting() {
        let mut continuous = ExponentialMovingAverage::new(2.0, 40);
        for value in [4.0, 8.0, 15.0] {
            continuous.update(value);
        }

        let mut restored = ExponentialMovingAverage::new(2.0, 40);
        let mut first = ExponentialMovingAverage::new(2.0, 40);
        first.update(4.0);
        first.update(8.0);
        restored.set(first.value(), first.count());
        restored.update(15.0);

        assert!((continuous.value() - restored.value()).abs() < EPSILON);
        assert_eq!(continuous.count(), restored.count());
    }
}
