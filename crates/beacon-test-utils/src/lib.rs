// beacon-test-utils: Shared test utilities for the telemetry client.
//
// Provides a mock Collector for integration testing of the generator's
// session, state machine, and UVE sync paths.

pub mod mock_collector;

pub use mock_collector::{MockCollector, MockCollectorConfig};
