//! Post-flash functional testing over the UART channel.
//!
//! After a successful flash the device is exercised with a stimulus/response
//! profile to confirm the new firmware actually runs. A failed test is a
//! verdict, never an error: flashing succeeded, the firmware just did not
//! answer as expected, and the report keeps those two facts separate.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::config::TEST_RESPONSE_TIMEOUT_MS;
use super::error::{FlashError, Result};
use super::mode::{ModeControl, ModeState};

/// How an observed response is compared to the expected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// The trimmed response must equal the expected text.
    Exact,
    /// The response must contain the expected text. The default; device
    /// firmware tends to decorate replies with prompts and line endings.
    Contains,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::Contains
    }
}

/// One stimulus/response exchange in a test profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    /// Text sent to the device.
    pub stimulus: String,
    /// Pattern the response is matched against.
    pub expected: String,
    #[serde(default)]
    pub policy: MatchPolicy,
    #[serde(default = "default_step_timeout")]
    pub timeout_ms: u64,
}

fn default_step_timeout() -> u64 {
    TEST_RESPONSE_TIMEOUT_MS
}

/// A named sequence of test steps.
///
/// Stimulus and response bytes are firmware-specific, so profiles are data:
/// load a device's profile from JSON, or use the default ping check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestProfile {
    pub name: String,
    pub steps: Vec<TestStep>,
}

impl Default for TestProfile {
    fn default() -> Self {
        Self {
            name: "ping".to_string(),
            steps: vec![TestStep {
                stimulus: "PING\n".to_string(),
                expected: "PONG".to_string(),
                policy: MatchPolicy::Contains,
                timeout_ms: TEST_RESPONSE_TIMEOUT_MS,
            }],
        }
    }
}

impl TestProfile {
    /// Load a profile from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| FlashError::InvalidImage {
            reason: format!("invalid test profile: {}", e),
        })
    }
}

/// Outcome of a single test step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Passed,
    /// Nothing arrived within the step timeout.
    Timeout,
    /// A response arrived but did not match the expected pattern.
    Mismatch,
}

/// Record of one executed test step, observed bytes included.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub stimulus: String,
    pub expected: String,
    pub observed: String,
    pub outcome: StepOutcome,
}

/// Aggregate result of a post-flash test run.
///
/// `passed` is the conjunction of all step outcomes. Port-level failures
/// during testing fold into `detail` with `passed = false`; they never
/// surface as errors, because the flash itself already succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct TestVerdict {
    pub passed: bool,
    pub profile: String,
    pub steps: Vec<StepResult>,
    pub detail: Option<String>,
}

/// Runs a [`TestProfile`] against a freshly flashed device.
pub struct PostFlashTester;

impl PostFlashTester {
    /// Execute every step of the profile and collect a verdict.
    ///
    /// Re-confirms run mode first when the controller's believed mode is
    /// stale. All steps run even after a failure, so the verdict shows the
    /// full picture.
    pub fn run(controller: &mut dyn ModeControl, profile: &TestProfile) -> TestVerdict {
        log::info!("running post-flash test profile '{}'", profile.name);

        if controller.mode() != ModeState::Run {
            if let Err(e) = controller.switch_to(ModeState::Run) {
                log::warn!("could not confirm run mode before testing: {}", e);
                return TestVerdict {
                    passed: false,
                    profile: profile.name.clone(),
                    steps: Vec::new(),
                    detail: Some(format!("could not enter run mode: {}", e)),
                };
            }
        }

        let mut steps = Vec::with_capacity(profile.steps.len());
        for step in &profile.steps {
            match controller.exchange(step.stimulus.as_bytes(), step.timeout_ms) {
                Ok(response) => {
                    let observed = String::from_utf8_lossy(&response).into_owned();
                    let outcome = if response.is_empty() {
                        StepOutcome::Timeout
                    } else if matches(&observed, &step.expected, step.policy) {
                        StepOutcome::Passed
                    } else {
                        StepOutcome::Mismatch
                    };
                    log::debug!(
                        "test step {:?} -> {:?} ({:?})",
                        step.stimulus.trim_end(),
                        observed.trim_end(),
                        outcome
                    );
                    steps.push(StepResult {
                        stimulus: step.stimulus.clone(),
                        expected: step.expected.clone(),
                        observed,
                        outcome,
                    });
                }
                Err(e) => {
                    log::warn!("test exchange failed: {}", e);
                    return TestVerdict {
                        passed: false,
                        profile: profile.name.clone(),
                        steps,
                        detail: Some(format!("exchange failed: {}", e)),
                    };
                }
            }
        }

        let passed = steps.iter().all(|s| s.outcome == StepOutcome::Passed);
        TestVerdict {
            passed,
            profile: profile.name.clone(),
            steps,
            detail: None,
        }
    }
}

fn matches(observed: &str, expected: &str, policy: MatchPolicy) -> bool {
    match policy {
        MatchPolicy::Exact => observed.trim() == expected,
        MatchPolicy::Contains => observed.contains(expected),
    }
}
