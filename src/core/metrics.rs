//! Connection quality scoring from sampled transport health.
//!
//! `ConnectionMetrics` is produced by a transport and read by the streaming
//! manager; the discrete `ConnectionQuality` tier is always derived from the
//! measured latency and loss, never set directly.

use std::collections::VecDeque;
use std::time::Instant;

/// Discrete health tier for a transport connection.
///
/// Variants are ordered worst-to-best so that `quality <= Poor` reads as
/// "degraded enough to trigger fallback".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionQuality {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Derive the quality tier from latency (ms) and packet-loss rate (0-1).
    ///
    /// The threshold table is evaluated top-to-bottom with strict `<`
    /// comparisons; the first row where both conditions hold wins.
    pub fn from_measurements(latency_ms: f64, packet_loss: f64) -> Self {
        if latency_ms < 50.0 && packet_loss < 0.001 {
            ConnectionQuality::Excellent
        } else if latency_ms < 100.0 && packet_loss < 0.01 {
            ConnectionQuality::Good
        } else if latency_ms < 200.0 && packet_loss < 0.03 {
            ConnectionQuality::Fair
        } else if latency_ms < 500.0 && packet_loss < 0.05 {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Critical
        }
    }

    /// Whether this tier should trigger the fallback handler.
    pub fn is_degraded(self) -> bool {
        self <= ConnectionQuality::Poor
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Critical => "critical",
        }
    }
}

/// Sampled health of a single transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Packet-loss rate in the range 0.0 to 1.0.
    pub packet_loss: f64,
    /// Variance in packet arrival timing, in milliseconds.
    pub jitter_ms: f64,
    /// Available bandwidth in kbit/s, when the transport can measure it.
    pub bandwidth_kbps: f64,
    /// Quality tier derived from latency and loss on every update.
    pub quality: ConnectionQuality,
    /// When the metrics were last refreshed.
    pub last_update: Instant,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            packet_loss: 0.0,
            jitter_ms: 0.0,
            bandwidth_kbps: 0.0,
            quality: ConnectionQuality::Good,
            last_update: Instant::now(),
        }
    }
}

impl ConnectionMetrics {
    /// Refresh all measured fields and recompute the quality tier.
    pub fn update(&mut self, latency_ms: f64, packet_loss: f64, jitter_ms: f64, bandwidth_kbps: f64) {
        self.latency_ms = latency_ms;
        self.packet_loss = packet_loss.clamp(0.0, 1.0);
        self.jitter_ms = jitter_ms;
        self.bandwidth_kbps = bandwidth_kbps;
        self.quality = ConnectionQuality::from_measurements(self.latency_ms, self.packet_loss);
        self.last_update = Instant::now();
    }

    /// Set a coarse quality estimate before any real samples exist.
    ///
    /// Used by the data-channel transport to map native connection states to
    /// an initial tier. Measured fields are left untouched; the next call to
    /// [`update`](Self::update) overrides the estimate.
    pub fn set_coarse_quality(&mut self, quality: ConnectionQuality) {
        self.quality = quality;
        self.last_update = Instant::now();
    }
}

/// Bounded rolling window of round-trip-time samples.
///
/// The socket transport feeds one sample per ping round trip; the mean over
/// the window is reported as the connection latency.
#[derive(Debug)]
pub struct RttWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RttWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, rtt_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    /// Mean of the retained samples, or 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for RttWindow {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_threshold_table() {
        let cases = [
            (10.0, 0.0, ConnectionQuality::Excellent),
            (49.9, 0.0009, ConnectionQuality::Excellent),
            (80.0, 0.005, ConnectionQuality::Good),
            (150.0, 0.02, ConnectionQuality::Fair),
            (400.0, 0.04, ConnectionQuality::Poor),
            (600.0, 0.0, ConnectionQuality::Critical),
            (10.0, 0.5, ConnectionQuality::Critical),
        ];
        for (latency, loss, expected) in cases {
            assert_eq!(
                ConnectionQuality::from_measurements(latency, loss),
                expected,
                "latency={latency} loss={loss}"
            );
        }
    }

    #[test]
    fn test_quality_boundaries_are_strict() {
        // Exactly at a row's limits falls through to the next row.
        assert_eq!(
            ConnectionQuality::from_measurements(50.0, 0.0),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_measurements(10.0, 0.001),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_measurements(100.0, 0.0),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::from_measurements(200.0, 0.0),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::from_measurements(500.0, 0.0),
            ConnectionQuality::Critical
        );
        assert_eq!(
            ConnectionQuality::from_measurements(10.0, 0.05),
            ConnectionQuality::Critical
        );
    }

    #[test]
    fn test_quality_ordering() {
        assert!(ConnectionQuality::Critical < ConnectionQuality::Poor);
        assert!(ConnectionQuality::Poor < ConnectionQuality::Fair);
        assert!(ConnectionQuality::Fair < ConnectionQuality::Good);
        assert!(ConnectionQuality::Good < ConnectionQuality::Excellent);
        assert!(ConnectionQuality::Poor.is_degraded());
        assert!(ConnectionQuality::Critical.is_degraded());
        assert!(!ConnectionQuality::Fair.is_degraded());
    }

    #[test]
    fn test_metrics_update_recomputes_quality() {
        let mut metrics = ConnectionMetrics::default();
        metrics.update(30.0, 0.0, 2.0, 512.0);
        assert_eq!(metrics.quality, ConnectionQuality::Excellent);

        metrics.update(450.0, 0.04, 20.0, 64.0);
        assert_eq!(metrics.quality, ConnectionQuality::Poor);
        assert_eq!(metrics.latency_ms, 450.0);
        assert_eq!(metrics.bandwidth_kbps, 64.0);
    }

    #[test]
    fn test_metrics_loss_clamped() {
        let mut metrics = ConnectionMetrics::default();
        metrics.update(10.0, 1.5, 0.0, 0.0);
        assert_eq!(metrics.packet_loss, 1.0);
        assert_eq!(metrics.quality, ConnectionQuality::Critical);
    }

    #[test]
    fn test_rtt_window_retains_last_ten() {
        let mut window = RttWindow::new(10);
        for i in 1..=15 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 10);
        // Samples 6..=15 remain; their mean is 10.5.
        assert!((window.mean() - 10.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rtt_window_empty_mean() {
        let window = RttWindow::new(10);
        assert!(window.is_empty());
        assert_eq!(window.mean(), 0.0);
    }
}
