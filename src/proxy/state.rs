//! Session lifecycle.

use crate::error::{Error, Result};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for an offer
    #[default]
    Init,
    /// Offer applied, answer and data channel pending
    Negotiating,
    /// Both transports open, data flowing
    Relaying,
    /// Both transports torn down
    Closed,
}

impl SessionState {
    /// Check whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Init, Negotiating) | (Negotiating, Relaying) | (Init | Negotiating | Relaying, Closed)
        )
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(Error::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    /// Check if the session is finished.
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = SessionState::default();
        state.transition(SessionState::Negotiating).unwrap();
        state.transition(SessionState::Relaying).unwrap();
        state.transition(SessionState::Closed).unwrap();
        assert!(state.is_closed());
    }

    #[test]
    fn test_close_from_any_live_state() {
        for from in [SessionState::Init, SessionState::Negotiating, SessionState::Relaying] {
            let mut state = from;
            assert!(state.transition(SessionState::Closed).is_ok());
        }
    }

    #[test]
    fn test_rejects_invalid_transitions() {
        let mut state = SessionState::Init;
        assert!(matches!(
            state.transition(SessionState::Relaying),
            Err(Error::InvalidTransition {
                from: SessionState::Init,
                to: SessionState::Relaying
            })
        ));
        assert_eq!(state, SessionState::Init);

        let mut state = SessionState::Closed;
        assert!(state.transition(SessionState::Init).is_err());
        assert!(state.transition(SessionState::Closed).is_err());

        let mut state = SessionState::Relaying;
        assert!(state.transition(SessionState::Negotiating).is_err());
    }
}
