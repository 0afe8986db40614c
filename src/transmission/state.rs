use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, trace};
use crate::error::TransmissionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionState {
    Created,
    Sending,
    AwaitingAck,
    Completed,
    Canceled,
    TimedOut,
}

impl TransmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransmissionState::Completed | TransmissionState::Canceled | TransmissionState::TimedOut)
    }

    pub fn can_transition_to(self, next: TransmissionState) -> bool {
        use TransmissionState::*;

        match (self, next) {
            (Created, Sending) => true,
            // receiving transmissions wait for data right away
            (Created, AwaitingAck) => true,
            (Sending, AwaitingAck) => true,
            (AwaitingAck, Sending) => true,
            (Sending, Completed) => true,
            (AwaitingAck, Completed) => true,
            (from, Canceled) | (from, TimedOut) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// State and lifecycle bookkeeping shared by sending and receiving transmissions
pub struct TransmissionCore {
    id: u32,
    state: watch::Sender<TransmissionState>,
    /// more specific reason for a cancellation, e.g. a closed connection
    cancel_reason: Mutex<Option<TransmissionError>>,
    disposed: AtomicBool,
}

impl TransmissionCore {
    pub fn new(id: u32) -> TransmissionCore {
        let (state, _) = watch::channel(TransmissionState::Created);
        TransmissionCore {
            id,
            state,
            cancel_reason: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> TransmissionState {
        *self.state.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Moves to `next` if that is a valid transition from the current state. Returns `false`
    ///  otherwise, leaving the state unchanged.
    pub fn transition(&self, next: TransmissionState) -> bool {
        let id = self.id;
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                trace!("transmission {}: ignoring transition {:?} -> {:?}", id, state, next);
                return false;
            }
            debug!("transmission {}: {:?} -> {:?}", id, state, next);
            *state = next;
            true
        })
    }

    /// Cancels with a specific error that awaiting callers observe instead of `Canceled`
    pub fn cancel_with(&self, reason: TransmissionError) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self.cancel_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.transition(TransmissionState::Canceled)
    }

    /// Returns `true` exactly once, for the caller that is responsible for releasing the
    ///  transmission's resources
    pub fn dispose_once(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// The result for a terminal state, `None` while the transmission is still running
    pub fn outcome(&self) -> Option<Result<(), TransmissionError>> {
        match self.state() {
            TransmissionState::Completed => Some(Ok(())),
            TransmissionState::TimedOut => Some(Err(TransmissionError::TimedOut)),
            TransmissionState::Canceled => {
                let reason = self.cancel_reason.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                Some(Err(reason.unwrap_or(TransmissionError::Canceled)))
            }
            _ => None,
        }
    }

    /// Waits until the transmission reaches a terminal state
    pub async fn wait(&self) -> Result<(), TransmissionError> {
        let mut receiver = self.state.subscribe();
        if receiver.wait_for(|s| s.is_terminal()).await.is_err() {
            return Err(TransmissionError::ConnectionClosed);
        }
        self.outcome()
            .unwrap_or(Err(TransmissionError::ConnectionClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use rstest::rstest;
    use TransmissionState::*;

    #[rstest]
    #[case::start(Created, Sending, true)]
    #[case::receive(Created, AwaitingAck, true)]
    #[case::handed_over(Sending, AwaitingAck, true)]
    #[case::retransmit(AwaitingAck, Sending, true)]
    #[case::complete(AwaitingAck, Completed, true)]
    #[case::complete_while_sending(Sending, Completed, true)]
    #[case::created_to_completed(Created, Completed, false)]
    #[case::cancel_created(Created, Canceled, true)]
    #[case::cancel_sending(Sending, Canceled, true)]
    #[case::timeout_awaiting(AwaitingAck, TimedOut, true)]
    #[case::cancel_completed(Completed, Canceled, false)]
    #[case::timeout_canceled(Canceled, TimedOut, false)]
    #[case::restart(TimedOut, Sending, false)]
    #[case::back_to_created(Sending, Created, false)]
    fn test_can_transition_to(#[case] from: TransmissionState, #[case] to: TransmissionState, #[case] expected: bool) {
        assert_eq!(from.can_transition_to(to), expected);
    }

    #[test]
    fn test_transition() {
        let core = TransmissionCore::new(5);
        assert!(core.transition(Sending));
        assert!(!core.transition(Sending));
        assert!(!core.transition(Created));
        assert!(core.transition(Completed));
        assert!(!core.transition(Canceled));
        assert_eq!(core.state(), Completed);
        assert_eq!(core.outcome(), Some(Ok(())));
    }

    #[test]
    fn test_dispose_once() {
        let core = TransmissionCore::new(5);
        assert!(core.dispose_once());
        assert!(!core.dispose_once());
    }

    #[rstest]
    #[case::completed(Completed, Ok(()))]
    #[case::timed_out(TimedOut, Err(TransmissionError::TimedOut))]
    #[case::canceled(Canceled, Err(TransmissionError::Canceled))]
    #[tokio::test]
    async fn test_wait(#[case] final_state: TransmissionState, #[case] expected: Result<(), TransmissionError>) {
        let core = Arc::new(TransmissionCore::new(1));
        core.transition(Sending);

        let waiting = {
            let core = core.clone();
            tokio::spawn(async move { core.wait().await })
        };
        tokio::task::yield_now().await;

        core.transition(final_state);
        assert_eq!(waiting.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_cancel_with_reason() {
        let core = TransmissionCore::new(1);
        assert!(core.cancel_with(TransmissionError::ConnectionClosed));
        assert!(!core.cancel_with(TransmissionError::Canceled));
        assert_eq!(core.wait().await, Err(TransmissionError::ConnectionClosed));
    }
}
