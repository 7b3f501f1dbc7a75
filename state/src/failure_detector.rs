//! The phi accrual failure detector
//!
//! Each peer carries a bounded window of heartbeat inter-arrival samples.
//! Rather than a boolean verdict, the detector reports a continuous
//! suspicion level: `phi = -log10(P(no arrival for this long))` under the
//! configured inter-arrival distribution. Callers convict a peer once phi
//! crosses their threshold.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, RwLock},
};

use common::types::NodeId;
use config::{Distribution, FailureDetectorConfig};

/// The floor applied to the sample standard deviation in nanoseconds
///
/// Perfectly regular arrivals would otherwise drive sigma to zero and make
/// a single late heartbeat convict instantly
const MIN_STD_DEV_NS: f64 = 10_000_000.0; // 10ms

/// The smallest tail probability fed into the log; caps phi rather than
/// letting it reach infinity
const MIN_TAIL_PROBABILITY: f64 = 1e-30;

// ------------------
// | Arrival window |
// ------------------

/// A bounded window of inter-arrival samples for one peer
#[derive(Debug)]
struct ArrivalWindow {
    /// The retained samples in nanoseconds, oldest first
    samples: VecDeque<u64>,
    /// The maximum number of samples retained
    capacity: usize,
    /// The monotonic reading of the most recent arrival
    last_arrival_ns: Option<u64>,
}

impl ArrivalWindow {
    /// Constructor
    fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity, last_arrival_ns: None }
    }

    /// Record an arrival, appending an inter-arrival sample if a prior
    /// arrival exists and evicting the oldest sample when full
    fn record(&mut self, now_ns: u64) {
        if let Some(prev) = self.last_arrival_ns {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(now_ns.saturating_sub(prev));
        }
        self.last_arrival_ns = Some(now_ns);
    }

    /// The sample mean in nanoseconds
    fn mean(&self) -> f64 {
        let sum: u64 = self.samples.iter().sum();
        sum as f64 / self.samples.len() as f64
    }

    /// The sample variance in nanoseconds squared
    fn variance(&self) -> f64 {
        let mean = self.mean();
        let sum: f64 =
            self.samples.iter().map(|&sample| (sample as f64 - mean).powi(2)).sum();
        sum / self.samples.len() as f64
    }
}

// ------------
// | Detector |
// ------------

/// Per-peer inter-arrival statistics and phi scoring
///
/// Never blocks and never errors: a peer without enough history simply
/// reports phi = 0 and cannot yet be convicted
#[derive(Debug)]
pub struct FailureDetector {
    /// The detector's tuning
    config: FailureDetectorConfig,
    /// The arrival window per tracked peer
    ///
    /// The outer lock guards the peer set; each window carries its own
    /// mutex so reports for different peers never contend
    windows: RwLock<HashMap<NodeId, Mutex<ArrivalWindow>>>,
}

impl FailureDetector {
    /// Constructor
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self { config, windows: RwLock::new(HashMap::new()) }
    }

    /// The phi value at and above which callers convict a peer
    pub fn conviction_threshold(&self) -> f64 {
        self.config.conviction_threshold
    }

    /// Record a heartbeat arrival for a peer
    pub fn report(&self, peer: &NodeId, now_ns: u64) {
        // Common case: the peer already has a window
        {
            let windows = self.windows.read().expect("windows lock poisoned");
            if let Some(window) = windows.get(peer) {
                window.lock().expect("window lock poisoned").record(now_ns);
                return;
            }
        } // read lock released

        let mut windows = self.windows.write().expect("windows lock poisoned");
        windows
            .entry(peer.clone())
            .or_insert_with(|| Mutex::new(ArrivalWindow::new(self.config.window_size)))
            .lock()
            .expect("window lock poisoned")
            .record(now_ns);
    }

    /// The current suspicion level for a peer
    ///
    /// Zero for unknown peers and peers below the minimum sample count
    pub fn phi(&self, peer: &NodeId, now_ns: u64) -> f64 {
        let windows = self.windows.read().expect("windows lock poisoned");
        let window = match windows.get(peer) {
            Some(window) => window.lock().expect("window lock poisoned"),
            None => return 0.0,
        };

        if window.samples.len() < self.config.minimum_samples {
            return 0.0;
        }

        // The window's last arrival always exists once samples do
        let last = window.last_arrival_ns.unwrap_or(now_ns);
        let elapsed = now_ns.saturating_sub(last) as f64;
        let mean = window.mean();

        match self.config.distribution {
            Distribution::Exponential => elapsed / (mean * std::f64::consts::LN_10),
            Distribution::Normal => {
                let sigma = window.variance().sqrt().max(MIN_STD_DEV_NS);
                normal_phi(elapsed, mean, sigma)
            },
        }
    }

    /// Whether at least one arrival has been observed for a peer
    ///
    /// A peer is only eligible for an UP verdict once this holds; seeded
    /// peers that have never spoken stay DOWN no matter how low phi reads
    pub fn has_arrivals(&self, peer: &NodeId) -> bool {
        let windows = self.windows.read().expect("windows lock poisoned");
        windows
            .get(peer)
            .map(|window| window.lock().expect("window lock poisoned").last_arrival_ns.is_some())
            .unwrap_or(false)
    }

    /// Drop all tracking state for a peer
    pub fn forget(&self, peer: &NodeId) {
        self.windows.write().expect("windows lock poisoned").remove(peer);
    }
}

/// Phi under a Gaussian inter-arrival assumption
///
/// `P(X >= elapsed)` via the survival function `erfc((x - mu)/(sigma sqrt 2)) / 2`
fn normal_phi(elapsed: f64, mean: f64, sigma: f64) -> f64 {
    let z = (elapsed - mean) / (sigma * std::f64::consts::SQRT_2);
    let tail = (0.5 * libm::erfc(z)).max(MIN_TAIL_PROBABILITY);
    -tail.log10()
}

#[cfg(test)]
mod test {
    use common::types::NodeId;
    use config::{Distribution, FailureDetectorConfig};

    use super::FailureDetector;

    /// The heartbeat period used throughout these tests, in nanoseconds
    const PERIOD_NS: u64 = 100_000_000; // 100ms

    /// Builds a detector with a small warm-up threshold
    fn detector(distribution: Distribution) -> FailureDetector {
        FailureDetector::new(FailureDetectorConfig {
            window_size: 100,
            minimum_samples: 5,
            distribution,
            conviction_threshold: 8.0,
        })
    }

    /// Feed `count` heartbeats at the steady period, returning the reading
    /// of the last arrival
    fn feed_steady(detector: &FailureDetector, peer: &NodeId, count: u64) -> u64 {
        let mut now = 0;
        for _ in 0..count {
            now += PERIOD_NS;
            detector.report(peer, now);
        }
        now
    }

    /// Tests that a peer with no samples cannot be convicted
    #[test]
    fn test_unknown_peer_is_zero() {
        let detector = detector(Distribution::Normal);
        assert_eq!(detector.phi(&NodeId::from("ghost"), 1_000_000), 0.0);
    }

    /// Tests that phi stays below warm-up until the minimum sample count
    #[test]
    fn test_warmup_threshold() {
        let detector = detector(Distribution::Normal);
        let peer = NodeId::from("n1");

        // Four reports yield three samples, below the minimum of five
        let now = feed_steady(&detector, &peer, 4);
        assert_eq!(detector.phi(&peer, now + 10 * PERIOD_NS), 0.0);
    }

    /// Tests that steady heartbeats keep phi below the threshold and that
    /// silence pushes it across within a bounded number of periods
    #[test]
    fn test_conviction_after_silence() {
        for distribution in [Distribution::Normal, Distribution::Exponential] {
            let detector = detector(distribution);
            let peer = NodeId::from("n1");
            let last = feed_steady(&detector, &peer, 50);

            // At one period of silence the peer is comfortably alive
            assert!(detector.phi(&peer, last + PERIOD_NS) < 8.0);

            // Thirty periods of silence convict under either distribution
            assert!(detector.phi(&peer, last + 30 * PERIOD_NS) >= 8.0);
        }
    }

    /// Tests that phi is monotone in elapsed silence
    #[test]
    fn test_phi_monotone_in_silence() {
        let detector = detector(Distribution::Normal);
        let peer = NodeId::from("n1");
        let last = feed_steady(&detector, &peer, 20);

        let mut prev = 0.0;
        for periods in 1..20 {
            let phi = detector.phi(&peer, last + periods * PERIOD_NS);
            assert!(phi >= prev);
            prev = phi;
        }
    }

    /// Tests that forgetting a peer resets its suspicion
    #[test]
    fn test_forget() {
        let detector = detector(Distribution::Normal);
        let peer = NodeId::from("n1");
        let last = feed_steady(&detector, &peer, 50);

        assert!(detector.phi(&peer, last + 30 * PERIOD_NS) >= 8.0);
        detector.forget(&peer);
        assert_eq!(detector.phi(&peer, last + 30 * PERIOD_NS), 0.0);
    }
}
