//! Supervisor 전용 에러 타입. reload 호출자에게 실패 원인을 구분해서 전달합니다.

use super::state_machine::TransitionError;
use crate::protocol::ProtocolError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker stdin closed before the load message was delivered")]
    ChannelClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("supervisor state lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Transition(_) => "INVALID_TRANSITION",
            Self::LockPoisoned => "LOCK_POISONED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state_machine::State;

    #[test]
    fn test_spawn_error_message() {
        let err = SupervisorError::Spawn {
            program: "missing-binary".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("missing-binary"));
        assert_eq!(err.error_code(), "SPAWN_FAILED");
        assert_eq!(err.to_json()["error_code"], "SPAWN_FAILED");
    }

    #[test]
    fn test_transition_error_is_transparent() {
        let err: SupervisorError =
            TransitionError::InvalidTransition(State::Closing, State::Starting).into();
        assert_eq!(err.to_string(), "invalid transition: Closing -> Starting");
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }
}
