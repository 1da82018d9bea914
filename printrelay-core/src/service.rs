use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    StopPending,
    Stopped,
}

/// Control signals delivered by the hosting environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceControl {
    Interrogate,
    Stop,
    Shutdown,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// State unchanged; the host should re-report it.
    Report(ServiceState),
    Transition {
        from: ServiceState,
        to: ServiceState,
    },
    Ignored(ServiceControl),
}

#[derive(Debug)]
pub struct ServiceStateMachine {
    state: ServiceState,
}

impl ServiceStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ServiceState::StartPending,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn mark_running(&mut self) -> Result<ServiceState, CoreError> {
        self.advance(ServiceState::StartPending, ServiceState::Running)
    }

    pub fn mark_stopped(&mut self) -> Result<ServiceState, CoreError> {
        self.advance(ServiceState::StopPending, ServiceState::Stopped)
    }

    pub fn handle(&mut self, control: ServiceControl) -> ControlOutcome {
        match control {
            ServiceControl::Interrogate => ControlOutcome::Report(self.state),
            ServiceControl::Stop | ServiceControl::Shutdown => match self.state {
                ServiceState::StartPending | ServiceState::Running => {
                    let from = self.state;
                    self.state = ServiceState::StopPending;
                    ControlOutcome::Transition {
                        from,
                        to: ServiceState::StopPending,
                    }
                }
                ServiceState::StopPending | ServiceState::Stopped => {
                    ControlOutcome::Report(self.state)
                }
            },
            ServiceControl::Other(_) => ControlOutcome::Ignored(control),
        }
    }

    fn advance(
        &mut self,
        expected: ServiceState,
        next: ServiceState,
    ) -> Result<ServiceState, CoreError> {
        if self.state != expected {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }
}

impl Default for ServiceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
