//! Reconnect-relevant session identity.

use std::time::Duration;

use crate::close::CloseClassification;

/// Everything the connection must remember to decide between IDENTIFY and
/// RESUME after a disconnect.
///
/// This is a data holder: every mutation happens from the connection in
/// direct response to inbound traffic, never from timers or the caller.
#[derive(Debug)]
pub(crate) struct Session {
    /// session id captured from READY
    pub session_id: Option<String>,
    /// highest dispatch sequence observed
    pub sequence: Option<u64>,
    /// normalized resume endpoint captured from READY
    pub resume_gateway_url: Option<String>,
    /// heartbeat interval announced by HELLO
    pub heartbeat_interval: Option<Duration>,
    /// whether the most recent heartbeat was acknowledged
    pub acknowledged: bool,
    /// a close frame has been sent or received
    pub closing: bool,
    /// the websocket reached its terminal state
    pub closed: bool,
    /// connection attempts since the last HELLO
    pub reconnect_attempts: u32,
    /// verdict of the most recent close
    pub classification: Option<CloseClassification>,
    /// whether a verdict was recorded on the current connection
    classified: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: None,
            sequence: None,
            resume_gateway_url: None,
            heartbeat_interval: None,
            acknowledged: true,
            closing: false,
            closed: false,
            reconnect_attempts: 0,
            classification: None,
            classified: false,
        }
    }

    /// Whether the held `(session_id, sequence)` pair is usable for RESUME.
    pub fn should_resume(&self) -> bool {
        self.session_id.is_some()
            && self.sequence.is_some()
            && self
                .classification
                .is_some_and(CloseClassification::resumable)
    }

    /// Track a dispatch sequence number. The stored value never decreases.
    pub fn observe_sequence(&mut self, sequence: u64) {
        match self.sequence {
            Some(current) if sequence <= current => {
                log::trace!("sequence {sequence} not beyond {current}, keeping the old value");
            }
            _ => self.sequence = Some(sequence),
        }
    }

    /// Record the close verdict. The first verdict of a connection wins:
    /// the echo of a close the connection initiated itself must not
    /// reclassify what was already decided.
    pub fn record_classification(&mut self, classification: CloseClassification) {
        if self.classified {
            log::trace!("close already classified, ignoring {classification:?}");
            return;
        }
        self.classification = Some(classification);
        self.classified = true;
    }

    /// Forget the close verdict; called when the caller commits to an
    /// IDENTIFY or RESUME.
    pub fn clear_verdict(&mut self) {
        self.classification = None;
        self.classified = false;
    }

    /// Drop the resumption identity.
    pub fn clear_identity(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_gateway_url = None;
    }

    /// Reset the per-connection flags for a fresh websocket, keeping the
    /// resumption identity and the recorded verdict.
    pub fn reopen(&mut self) {
        self.heartbeat_interval = None;
        self.acknowledged = true;
        self.closing = false;
        self.closed = false;
        self.classified = false;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            resume_gateway_url: self.resume_gateway_url.clone(),
            heartbeat_interval: self.heartbeat_interval,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

/// Read-only snapshot of the session state, cloned out so it can be
/// inspected without keeping the connection borrowed.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// session id captured from READY
    pub session_id: Option<String>,
    /// highest dispatch sequence observed
    pub sequence: Option<u64>,
    /// resume endpoint captured from READY
    pub resume_gateway_url: Option<String>,
    /// heartbeat interval announced by HELLO
    pub heartbeat_interval: Option<Duration>,
    /// connection attempts since the last HELLO
    pub reconnect_attempts: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sequence_never_decreases() {
        let mut session = Session::new();

        session.observe_sequence(5);
        session.observe_sequence(3);
        assert_eq!(session.sequence, Some(5));

        session.observe_sequence(6);
        assert_eq!(session.sequence, Some(6));
    }

    #[test]
    fn test_should_resume_needs_identity_and_verdict() {
        let mut session = Session::new();
        assert!(!session.should_resume());

        session.session_id = Some("sid".to_string());
        session.observe_sequence(1);
        assert!(!session.should_resume());

        session.record_classification(CloseClassification::Resumable);
        assert!(session.should_resume());

        session.clear_identity();
        assert!(!session.should_resume());
    }

    #[test]
    fn test_first_verdict_wins_within_a_connection() {
        let mut session = Session::new();

        session.record_classification(CloseClassification::NonResumable);
        session.record_classification(CloseClassification::Graceful);
        assert_eq!(session.classification, Some(CloseClassification::NonResumable));

        // a fresh websocket may classify again
        session.reopen();
        session.record_classification(CloseClassification::Fatal);
        assert_eq!(session.classification, Some(CloseClassification::Fatal));
    }
}
