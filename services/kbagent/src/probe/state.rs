//! Threshold debouncing of probe results.

use kbagent_proto::{ProbeEvent, PROBE_FAILURE_CODE, PROBE_SUCCESS_CODE};

/// Per-probe counters and the outputs they are compared against.
///
/// Owned by a single runner; every tick feeds exactly one result in and gets
/// at most one event out.
#[derive(Debug, Clone)]
pub struct ProbeState {
    instance: String,
    probe: String,
    success_threshold: u32,
    failure_threshold: u32,
    succeed_count: u32,
    failed_count: u32,
    /// Output of the most recent successful tick.
    latest_output: Vec<u8>,
    /// Output carried by the most recent success event.
    reported_output: Option<Vec<u8>>,
}

impl ProbeState {
    pub fn new(
        instance: impl Into<String>,
        probe: impl Into<String>,
        success_threshold: u32,
        failure_threshold: u32,
    ) -> Self {
        Self {
            instance: instance.into(),
            probe: probe.into(),
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
            succeed_count: 0,
            failed_count: 0,
            latest_output: Vec::new(),
            reported_output: None,
        }
    }

    /// Records a successful tick.
    ///
    /// Emits when the success threshold is first reached, and afterwards
    /// whenever the output differs from the last reported one.
    pub fn on_success(&mut self, output: Vec<u8>) -> Option<ProbeEvent> {
        self.failed_count = 0;
        self.succeed_count = self.succeed_count.saturating_add(1);
        self.latest_output = output;

        if self.succeed_count < self.success_threshold {
            return None;
        }
        let at_threshold = self.succeed_count == self.success_threshold;
        let changed = self.reported_output.as_deref() != Some(self.latest_output.as_slice());
        if !at_threshold && !changed {
            return None;
        }

        self.reported_output = Some(self.latest_output.clone());
        Some(self.event(PROBE_SUCCESS_CODE, String::new()))
    }

    /// Records a failed tick. Emits on every tick at or past the failure
    /// threshold, carrying the last known-good output.
    pub fn on_failure(&mut self, message: impl Into<String>) -> Option<ProbeEvent> {
        self.succeed_count = 0;
        self.failed_count = self.failed_count.saturating_add(1);

        if self.failed_count < self.failure_threshold {
            return None;
        }
        Some(self.event(PROBE_FAILURE_CODE, message.into()))
    }

    fn event(&self, code: i32, message: String) -> ProbeEvent {
        ProbeEvent {
            instance: self.instance.clone(),
            probe: self.probe.clone(),
            code,
            output: self.latest_output.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_success_emitted_at_threshold_only() {
        let mut state = ProbeState::new("mysql", "roleProbe", 3, 1);
        assert!(state.on_success(b"leader".to_vec()).is_none());
        assert!(state.on_success(b"leader".to_vec()).is_none());

        let event = state.on_success(b"leader".to_vec()).unwrap();
        assert_eq!(event.code, PROBE_SUCCESS_CODE);
        assert_eq!(event.output, b"leader");
        assert_eq!(event.probe, "roleProbe");
        assert_eq!(event.instance, "mysql");

        assert!(state.on_success(b"leader".to_vec()).is_none());
    }

    #[test]
    fn test_success_emitted_when_output_changes() {
        let mut state = ProbeState::new("mysql", "roleProbe", 1, 1);
        assert!(state.on_success(b"leader".to_vec()).is_some());
        assert!(state.on_success(b"leader".to_vec()).is_none());

        let event = state.on_success(b"follower".to_vec()).unwrap();
        assert_eq!(event.output, b"follower");
    }

    #[test]
    fn test_failure_carries_last_good_output() {
        let mut state = ProbeState::new("mysql", "roleProbe", 1, 2);
        state.on_success(b"leader".to_vec());

        assert!(state.on_failure("exit code: 1").is_none());
        let event = state.on_failure("exit code: 1").unwrap();
        assert_eq!(event.code, PROBE_FAILURE_CODE);
        assert_eq!(event.output, b"leader");
        assert_eq!(event.message, "exit code: 1");

        // every qualifying tick reports
        assert!(state.on_failure("exit code: 1").is_some());
    }

    #[test]
    fn test_failure_resets_success_count() {
        let mut state = ProbeState::new("mysql", "roleProbe", 2, 3);
        state.on_success(b"leader".to_vec());
        state.on_failure("boom");
        assert!(state.on_success(b"leader".to_vec()).is_none());
        assert!(state.on_success(b"leader".to_vec()).is_some());
    }

    proptest! {
        #[test]
        fn prop_success_events_require_threshold(
            threshold in 1u32..6,
            ticks in prop::collection::vec(any::<bool>(), 0..40),
        ) {
            let mut state = ProbeState::new("i", "p", threshold, 1);
            let mut streak = 0u32;
            for ok in ticks {
                if ok {
                    streak += 1;
                    let event = state.on_success(b"same".to_vec());
                    // constant output: emits exactly at the threshold point
                    prop_assert_eq!(event.is_some(), streak == threshold);
                } else {
                    streak = 0;
                    let event = state.on_failure("failed");
                    prop_assert!(event.map(|e| e.code) == Some(PROBE_FAILURE_CODE));
                }
            }
        }

        #[test]
        fn prop_failure_events_require_threshold(
            threshold in 1u32..6,
            ticks in prop::collection::vec(any::<bool>(), 0..40),
        ) {
            let mut state = ProbeState::new("i", "p", 1, threshold);
            let mut streak = 0u32;
            for ok in ticks {
                if ok {
                    streak = 0;
                    state.on_success(Vec::new());
                } else {
                    streak += 1;
                    let event = state.on_failure("failed");
                    prop_assert_eq!(event.is_some(), streak >= threshold);
                }
            }
        }
    }
}
