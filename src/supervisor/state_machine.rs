use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No worker running.
    Idle,
    /// Spawning a worker process.
    Starting,
    /// Worker alive, readiness not signaled yet.
    Running,
    /// Worker ready; the listening address is published.
    Listening,
    /// Waiting for the current worker to exit.
    Closing,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &State) -> bool {
        matches!(
            (&self.state, to),
            (State::Idle, State::Starting)
                | (State::Starting, State::Running)
                | (State::Starting, State::Idle)
                | (State::Running, State::Listening)
                | (State::Running, State::Closing)
                | (State::Running, State::Idle)
                | (State::Listening, State::Closing)
                | (State::Listening, State::Idle)
                | (State::Closing, State::Idle)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::info!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
