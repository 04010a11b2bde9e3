use log::debug;

/// Exponentially weighted moving average.
///
/// `alpha = 1.0` makes the newest sample win outright.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            value: None,
        }
    }

    pub fn reset(&mut self) {
        self.value = None;
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Fold in a sample and return the filtered value.
    pub fn sample(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => prev + self.alpha * (x - prev),
        };
        debug!("Ewma: in={:.3}, out={:.3}, alpha={:.3}", x, next, self.alpha);
        self.value = Some(next);
        next
    }
}

/// A parameter that approaches its target exponentially, like a one-pole
/// lowpass on a control signal. Time is in audio-clock seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedParam {
    start_value: f64,
    target: f64,
    start_time: f64,
    time_constant: f64,
}

impl SmoothedParam {
    pub fn new(value: f64) -> Self {
        SmoothedParam {
            start_value: value,
            target: value,
            start_time: 0.0,
            time_constant: 0.0,
        }
    }

    /// Begin moving toward `target` from whatever the value is at `now`.
    pub fn set_target(&mut self, target: f64, now: f64, time_constant: f64) {
        self.start_value = self.value_at(now);
        self.start_time = now;
        self.target = target;
        self.time_constant = time_constant.max(0.0);
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn value_at(&self, t: f64) -> f64 {
        if self.time_constant <= 0.0 {
            return self.target;
        }
        if t <= self.start_time {
            return self.start_value;
        }
        let k = (-(t - self.start_time) / self.time_constant).exp();
        self.target + (self.start_value - self.target) * k
    }
}
