//! Validation result side-channel: block-validation paths return `bool` and
//! record the DoS score, reject code and reason here, so failures never
//! propagate as panics across the consensus surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Invalid = 0x10,
    Duplicate = 0x12,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationState {
    invalid: bool,
    dos_score: u32,
    reject_code: Option<RejectCode>,
    reject_reason: String,
}

impl ValidationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark invalid with a DoS score. Returns `false` so call sites can
    /// `return state.dos(...)` the way the original validation code does.
    pub fn dos(&mut self, score: u32, code: RejectCode, reason: &str) -> bool {
        // Keep the first failure; later ones would mask the root cause.
        if !self.invalid {
            self.invalid = true;
            self.dos_score = score;
            self.reject_code = Some(code);
            self.reject_reason = reason.to_string();
        }
        false
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    pub fn dos_score(&self) -> u32 {
        self.dos_score
    }

    pub fn reject_code(&self) -> Option<RejectCode> {
        self.reject_code
    }

    pub fn reject_reason(&self) -> &str {
        &self.reject_reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_wins() {
        let mut state = ValidationState::new();
        assert!(state.is_valid());

        assert!(!state.dos(100, RejectCode::Invalid, "bad-protx-payload"));
        assert!(!state.dos(10, RejectCode::Duplicate, "later"));

        assert!(!state.is_valid());
        assert_eq!(state.dos_score(), 100);
        assert_eq!(state.reject_code(), Some(RejectCode::Invalid));
        assert_eq!(state.reject_reason(), "bad-protx-payload");
    }
}
