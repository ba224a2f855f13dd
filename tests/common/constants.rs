//! Shared constants for integration tests

use std::time::Duration;

/// Sample rate of every synthetic clip.
pub const SAMPLE_RATE: u32 = 11025;

/// Owner of jobs submitted by tests
pub const OWNER: &str = "user-1";

/// Reference track ids used across tests
pub const SAMPLE_A: &str = "sample-a";
pub const SAMPLE_B: &str = "sample-b";

/// How long to wait for a job before failing the test
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting on job state
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
