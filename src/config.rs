//! Registry configuration.

use std::time::Duration;

/// How often the live debug channel should sample transitions for
/// logging. The transport itself lives outside this crate; this only
/// shapes how aggressively a collaborator sampler should throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLogging {
    /// Sample every transition.
    All,
    /// Sample one transition out of every `N`.
    OneInN(u32),
}

/// A single flat configuration record rather than a builder-pattern or
/// inheritance-chain proliferation of registry variants.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// System-wide shaping rate, events/sec.
    pub target_tps: u32,
    /// Per-machine hard cap, events/sec.
    pub max_events_per_machine_per_second: u32,
    /// Hard cap on the number of simultaneously active machines.
    pub max_concurrent_machines: usize,
    /// Soft cap above which idle machines become eviction candidates.
    /// Must be `< max_concurrent_machines`.
    pub machine_eviction_threshold: usize,
    /// How long a machine must have been idle before it's a valid LRU
    /// eviction candidate once over threshold.
    pub machine_idle_timeout: Duration,
    /// Persist every transition, not only offline/final ones. The core
    /// records this flag; the act of persisting every transition is already
    /// what the transition procedure does at save time, so `snapshot_debug`
    /// only widens what a collaborator debug sampler chooses to record, not
    /// core persistence behavior.
    pub snapshot_debug: bool,
    /// Enable the live debug channel. The transport itself lives outside this
    /// crate; this flag only gates whether [`crate::debug::DebugMessage`]
    /// values are worth constructing.
    pub live_debug: bool,
    /// Debug channel port, only meaningful if `live_debug` is set.
    pub debug_port: Option<u16>,
    /// Debug record sampling.
    pub sample_logging: SampleLogging,
    /// How long `shutdown()` waits for in-flight event processing to drain
    /// before abandoning stragglers (default 5s).
    pub shutdown_timeout: Duration,
    /// Multiplier applied to `target_tps` to get the system token bucket's
    /// burst capacity (default 2x).
    pub system_burst_multiplier: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            target_tps: 1_000,
            max_events_per_machine_per_second: 20,
            max_concurrent_machines: 100_000,
            machine_eviction_threshold: 90_000,
            machine_idle_timeout: Duration::from_secs(300),
            snapshot_debug: false,
            live_debug: false,
            debug_port: None,
            sample_logging: SampleLogging::All,
            shutdown_timeout: Duration::from_secs(5),
            system_burst_multiplier: 2.0,
        }
    }
}
