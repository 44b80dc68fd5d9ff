//! Small helpers for progress reporting.
use std::time::Instant;

/// Compact step-count formatting for log banners.
pub fn human_format(num: usize) -> String {
    if num < 1000 {
        return num.to_string();
    }
    let mut value = num as f64;
    let mut magnitude = 0;
    while value >= 1000. && magnitude < 5 {
        value /= 1000.;
        magnitude += 1;
    }
    let unit = ["", "K", "M", "G", "T", "P"][magnitude];
    format!("{value:.1}{unit}")
}

/// Splits wall-clock time between data reads and forward/backward work
/// within one progress window.
#[derive(Debug)]
pub struct Timer {
    mark: Instant,
    read_secs: f64,
    compute_secs: f64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            mark: Instant::now(),
            read_secs: 0.,
            compute_secs: 0.,
        }
    }

    /// Restarts the window.
    pub fn set(&mut self) {
        self.mark = Instant::now();
        self.read_secs = 0.;
        self.compute_secs = 0.;
    }

    /// Books the time since the last mark as data-read.
    pub fn cnt_read(&mut self) {
        self.read_secs += self.mark.elapsed().as_secs_f64();
        self.mark = Instant::now();
    }

    /// Books the time since the last mark as compute.
    pub fn cnt_compute(&mut self) {
        self.compute_secs += self.mark.elapsed().as_secs_f64();
        self.mark = Instant::now();
    }

    pub fn show(&self) -> String {
        format!("rd {:.2}s | fw {:.2}s", self.read_secs, self.compute_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_format_scales() {
        assert_eq!(human_format(999), "999");
        assert_eq!(human_format(1200), "1.2K");
        assert_eq!(human_format(100_000), "100.0K");
        assert_eq!(human_format(2_500_000), "2.5M");
    }

    #[test]
    fn timer_accumulates_and_resets() {
        let mut timer = Timer::new();
        timer.cnt_read();
        timer.cnt_compute();
        assert!(timer.read_secs >= 0.);
        timer.set();
        assert_eq!(timer.read_secs, 0.);
        assert_eq!(timer.compute_secs, 0.);
    }
}
