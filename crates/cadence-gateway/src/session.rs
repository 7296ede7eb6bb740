use std::time::Duration;

use cadence_models::gateway::{Ready, Resume};
use cadence_models::Snowflake;

/// Resumable state of one gateway session. Owned by the connection task.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSession {
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    pub resume_url: Option<String>,
    pub user_id: Option<Snowflake>,
    pub heartbeat_interval: Option<Duration>,
}

impl ConnectionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `seq` only when it is strictly greater than the last one seen.
    pub fn observe_sequence(&mut self, seq: u64) -> bool {
        match self.sequence {
            Some(last) if seq <= last => false,
            _ => {
                self.sequence = Some(seq);
                true
            }
        }
    }

    pub fn on_ready(&mut self, ready: &Ready) {
        self.session_id = Some(ready.session_id.clone());
        self.resume_url = ready.resume_gateway_url.clone();
        self.user_id = Some(ready.user.id);
    }

    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn resume_payload(&self, token: &str) -> Option<Resume> {
        let session_id = self.session_id.clone()?;
        Some(Resume {
            token: token.to_string(),
            session_id,
            seq: self.sequence.unwrap_or(0),
        })
    }

    /// Forget the session so the next handshake identifies fresh.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_models::gateway::ReadyUser;

    fn ready() -> Ready {
        Ready {
            session_id: "abc".into(),
            resume_gateway_url: Some("wss://resume.example".into()),
            user: ReadyUser {
                id: Snowflake(7),
                username: None,
            },
        }
    }

    #[test]
    fn sequence_only_moves_forward() {
        let mut session = ConnectionSession::new();
        assert!(session.observe_sequence(1));
        assert!(session.observe_sequence(5));
        assert!(!session.observe_sequence(5));
        assert!(!session.observe_sequence(3));
        assert_eq!(session.sequence, Some(5));
    }

    #[test]
    fn resume_payload_requires_session() {
        let mut session = ConnectionSession::new();
        assert!(session.resume_payload("t").is_none());

        session.on_ready(&ready());
        session.observe_sequence(12);
        let resume = session.resume_payload("t").unwrap();
        assert_eq!(resume.session_id, "abc");
        assert_eq!(resume.seq, 12);
    }

    #[test]
    fn reset_keeps_user() {
        let mut session = ConnectionSession::new();
        session.on_ready(&ready());
        session.observe_sequence(4);
        session.reset();
        assert!(!session.is_resumable());
        assert_eq!(session.sequence, None);
        assert_eq!(session.user_id, Some(Snowflake(7)));
    }
}
