//! Run-mode wrappers around [`PrintAgent`].
//!
//! Every host binds exactly one listener after supersession. They differ in
//! how they stop and how a bind failure is surfaced.

use std::{future::Future, io, pin::Pin};

use printrelay_core::{
    ControlOutcome, CoreError, ServiceControl, ServiceState, ServiceStateMachine,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::{PrintAgent, serve};

/// First user-defined control code in the Windows service control range.
pub const USER_DEFINED_CONTROL: u32 = 128;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to bind {address}: {source}")]
    ListenerStart {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("server exited: {0}")]
    Serve(#[source] io::Error),
    #[error("failed to install control handlers: {0}")]
    Signals(#[source] io::Error),
    #[error(transparent)]
    State(#[from] CoreError),
}

pub trait ExecutionHost {
    fn run(self, agent: PrintAgent) -> impl Future<Output = Result<(), HostError>> + Send;
}

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Foreground mode. A bind failure is returned to the caller, which exits.
pub struct ConsoleHost {
    shutdown: ShutdownFuture,
}

impl ConsoleHost {
    pub fn until_ctrl_c() -> Self {
        Self::with_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl-C, shutting down"),
                Err(err) => {
                    // Without a handler the process only ends when killed.
                    warn!("failed to listen for Ctrl-C: {}", err);
                    std::future::pending::<()>().await;
                }
            }
        })
    }

    pub fn with_shutdown(shutdown: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            shutdown: Box::pin(shutdown),
        }
    }
}

impl ExecutionHost for ConsoleHost {
    async fn run(self, agent: PrintAgent) -> Result<(), HostError> {
        let listener = agent.start_listener().await?;
        serve(listener, agent.router(), self.shutdown).await
    }
}

/// Status channel back to the service control host.
pub trait StatusReporter: Send + Sync {
    fn report(&self, state: ServiceState);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusReporter;

impl StatusReporter for LogStatusReporter {
    fn report(&self, state: ServiceState) {
        info!("service status: {:?}", state);
    }
}

/// Background mode driven by control signals.
///
/// A bind failure is reported and the service stays up without a listener
/// until it is told to stop.
pub struct ServiceHost<R> {
    controls: mpsc::Receiver<ServiceControl>,
    reporter: R,
}

impl<R: StatusReporter> ServiceHost<R> {
    pub fn new(controls: mpsc::Receiver<ServiceControl>, reporter: R) -> Self {
        Self { controls, reporter }
    }
}

impl<R: StatusReporter> ExecutionHost for ServiceHost<R> {
    async fn run(mut self, agent: PrintAgent) -> Result<(), HostError> {
        let mut machine = ServiceStateMachine::new();
        self.reporter.report(machine.state());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = match agent.start_listener().await {
            Ok(listener) => Some(tokio::spawn(serve(listener, agent.router(), async move {
                let _ = shutdown_rx.await;
            }))),
            Err(err) => {
                error!("{}; running without a listener", err);
                None
            }
        };

        self.reporter.report(machine.mark_running()?);

        loop {
            let control = match self.controls.recv().await {
                Some(control) => control,
                None => {
                    info!("control channel closed, stopping");
                    ServiceControl::Stop
                }
            };

            match machine.handle(control) {
                ControlOutcome::Report(state) => self.reporter.report(state),
                ControlOutcome::Transition { from, to } => {
                    info!("service {:?} -> {:?}", from, to);
                    self.reporter.report(to);
                    if to == ServiceState::StopPending {
                        break;
                    }
                }
                ControlOutcome::Ignored(control) => {
                    warn!("ignoring unrecognized service control {:?}", control);
                }
            }
        }

        let _ = shutdown_tx.send(());
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("{}", err),
                Err(err) => warn!("server task failed: {}", err),
            }
        }

        self.reporter.report(machine.mark_stopped()?);
        Ok(())
    }
}

/// Maps process signals onto service controls.
///
/// Interrupt or console close stops the service, terminate or system shutdown
/// shuts it down, hangup or Ctrl-Break interrogates, and SIGUSR1 arrives as an
/// unrecognized control.
pub fn signal_controls() -> io::Result<mpsc::Receiver<ServiceControl>> {
    let (tx, rx) = mpsc::channel(8);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mapping = [
            (SignalKind::interrupt(), ServiceControl::Stop),
            (SignalKind::terminate(), ServiceControl::Shutdown),
            (SignalKind::hangup(), ServiceControl::Interrogate),
            (
                SignalKind::user_defined1(),
                ServiceControl::Other(USER_DEFINED_CONTROL),
            ),
        ];
        for (kind, control) in mapping {
            let mut stream = signal(kind)?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(control).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    #[cfg(windows)]
    {
        use tokio::signal::windows;

        macro_rules! forward {
            ($stream:expr, $control:expr) => {{
                let mut stream = $stream?;
                let tx = tx.clone();
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        if tx.send($control).await.is_err() {
                            break;
                        }
                    }
                });
            }};
        }

        forward!(windows::ctrl_c(), ServiceControl::Stop);
        forward!(windows::ctrl_close(), ServiceControl::Stop);
        forward!(windows::ctrl_shutdown(), ServiceControl::Shutdown);
        forward!(windows::ctrl_break(), ServiceControl::Interrogate);
    }

    drop(tx);
    Ok(rx)
}
