//! Session state machine.

/// Lifecycle state of a PowerShell session.
///
/// State is written only by the session's event loop; callers observe
/// snapshots through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Subprocess is being spawned and probed for readiness.
    #[default]
    Starting,
    /// Idle and able to accept the next command.
    Ready,
    /// A command is in flight.
    Busy,
    /// Graceful shutdown in progress.
    Closing,
    /// Session is finished; the subprocess has been released.
    Closed,
    /// Unrecoverable fault (process death, protocol desync, stuck command).
    /// The subprocess has been or is being torn down; the session must be
    /// recreated, never restarted in place, because interpreter state died
    /// with the process.
    Faulted,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Starting -> Ready | Closing | Faulted
    /// - Ready    -> Busy | Closing | Faulted
    /// - Busy     -> Ready | Closing | Faulted
    /// - Closing  -> Closed | Faulted
    /// - Faulted  -> Closing | Closed
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Starting, Ready)
                | (Starting, Closing)
                | (Starting, Faulted)
                | (Ready, Busy)
                | (Ready, Closing)
                | (Ready, Faulted)
                | (Busy, Ready)
                | (Busy, Closing)
                | (Busy, Faulted)
                | (Closing, Closed)
                | (Closing, Faulted)
                | (Faulted, Closing)
                | (Faulted, Closed)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: SessionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::PwshBridgeError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Check if the session can accept a new command.
    pub fn can_execute(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// Check if the session is faulted.
    pub fn is_faulted(&self) -> bool {
        matches!(self, SessionState::Faulted)
    }
}
