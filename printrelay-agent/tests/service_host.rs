use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use printrelay_agent::{
    PrintAgent,
    dispatch::{Dispatcher, Launcher},
    host::{ConsoleHost, ExecutionHost, HostError, ServiceHost, StatusReporter, USER_DEFINED_CONTROL},
    settings::AgentConfig,
};
use printrelay_core::{
    ExecutableLocator, InstanceRecord, PrintInvocation, ProcessTable, ServiceControl, ServiceState,
    SupersedeError,
};
use tokio::sync::mpsc;

struct NeverLaunch;

impl Launcher for NeverLaunch {
    fn launch(&self, _invocation: &PrintInvocation) -> io::Result<Option<u32>> {
        Err(io::Error::other("no launches expected in host tests"))
    }
}

/// One older instance (pid 7) is running next to us (pid 1).
#[derive(Default)]
struct OlderInstanceTable {
    lookups: AtomicUsize,
    terminated: Mutex<Vec<u32>>,
}

impl ProcessTable for OlderInstanceTable {
    fn current(&self) -> Result<InstanceRecord, SupersedeError> {
        Ok(InstanceRecord {
            pid: 1,
            image_name: "printrelay-agent.exe".to_owned(),
        })
    }

    fn find_by_image(&self, image_name: &str) -> Result<Vec<InstanceRecord>, SupersedeError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok([1, 7]
            .into_iter()
            .map(|pid| InstanceRecord {
                pid,
                image_name: image_name.to_owned(),
            })
            .collect())
    }

    fn terminate(&self, pid: u32) -> Result<(), SupersedeError> {
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingReporter {
    states: Arc<Mutex<Vec<ServiceState>>>,
}

impl RecordingReporter {
    fn states(&self) -> Vec<ServiceState> {
        self.states.lock().unwrap().clone()
    }
}

impl StatusReporter for RecordingReporter {
    fn report(&self, state: ServiceState) {
        self.states.lock().unwrap().push(state);
    }
}

fn agent(bind_address: String, table: Arc<OlderInstanceTable>) -> (PrintAgent, tempfile::TempDir) {
    let workdir = tempfile::tempdir().expect("create workdir");
    let config = AgentConfig {
        bind_address,
        staging_dir: workdir.path().join("staging"),
        ..AgentConfig::default()
    };
    let locator = ExecutableLocator::new(None).with_search_path("");
    let agent = PrintAgent::new(config, Dispatcher::new(locator, Arc::new(NeverLaunch)), table);
    (agent, workdir)
}

async fn wait_for_state(reporter: &RecordingReporter, state: ServiceState) {
    for _ in 0..100 {
        if reporter.states().contains(&state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("service never reported {state:?}: {:?}", reporter.states());
}

#[tokio::test]
async fn service_reports_lifecycle_and_supersedes_once() {
    let table = Arc::new(OlderInstanceTable::default());
    let (agent, _workdir) = agent("127.0.0.1:0".to_owned(), table.clone());
    let reporter = RecordingReporter::default();
    let (controls_tx, controls_rx) = mpsc::channel(8);

    let host = ServiceHost::new(controls_rx, reporter.clone());
    let task = tokio::spawn(host.run(agent));

    wait_for_state(&reporter, ServiceState::Running).await;
    controls_tx
        .send(ServiceControl::Interrogate)
        .await
        .expect("send interrogate");
    controls_tx
        .send(ServiceControl::Other(USER_DEFINED_CONTROL))
        .await
        .expect("send user control");
    controls_tx
        .send(ServiceControl::Stop)
        .await
        .expect("send stop");

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("service stops in time")
        .expect("service task joins")
        .expect("service exits cleanly");

    assert_eq!(
        reporter.states(),
        vec![
            ServiceState::StartPending,
            ServiceState::Running,
            ServiceState::Running,
            ServiceState::StopPending,
            ServiceState::Stopped,
        ]
    );
    assert_eq!(table.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(*table.terminated.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn service_stays_up_without_listener_until_stopped() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("occupy a port");
    let address = occupied.local_addr().expect("occupied addr").to_string();

    let table = Arc::new(OlderInstanceTable::default());
    let (agent, _workdir) = agent(address, table);
    let reporter = RecordingReporter::default();
    let (controls_tx, controls_rx) = mpsc::channel(8);

    let task = tokio::spawn(ServiceHost::new(controls_rx, reporter.clone()).run(agent));

    wait_for_state(&reporter, ServiceState::Running).await;
    assert!(!task.is_finished(), "degraded service must keep running");

    controls_tx
        .send(ServiceControl::Shutdown)
        .await
        .expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("service stops in time")
        .expect("service task joins")
        .expect("service exits cleanly");

    assert_eq!(
        reporter.states().last().copied(),
        Some(ServiceState::Stopped)
    );
    drop(occupied);
}

#[tokio::test]
async fn closed_control_channel_stops_the_service() {
    let table = Arc::new(OlderInstanceTable::default());
    let (agent, _workdir) = agent("127.0.0.1:0".to_owned(), table);
    let reporter = RecordingReporter::default();
    let (controls_tx, controls_rx) = mpsc::channel(1);
    drop(controls_tx);

    tokio::time::timeout(
        Duration::from_secs(5),
        ServiceHost::new(controls_rx, reporter.clone()).run(agent),
    )
    .await
    .expect("service stops in time")
    .expect("service exits cleanly");

    assert_eq!(
        reporter.states(),
        vec![
            ServiceState::StartPending,
            ServiceState::Running,
            ServiceState::StopPending,
            ServiceState::Stopped,
        ]
    );
}

#[tokio::test]
async fn console_host_returns_bind_failure() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("occupy a port");
    let address = occupied.local_addr().expect("occupied addr").to_string();

    let table = Arc::new(OlderInstanceTable::default());
    let (agent, _workdir) = agent(address.clone(), table);

    let err = ConsoleHost::with_shutdown(std::future::pending())
        .run(agent)
        .await
        .expect_err("port is already taken");
    match err {
        HostError::ListenerStart { address: failed, .. } => assert_eq!(failed, address),
        other => panic!("unexpected error: {other}"),
    }
    drop(occupied);
}

#[tokio::test]
async fn console_host_serves_until_shutdown_future_resolves() {
    let table = Arc::new(OlderInstanceTable::default());
    let (agent, _workdir) = agent("127.0.0.1:0".to_owned(), table.clone());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        ConsoleHost::with_shutdown(tokio::time::sleep(Duration::from_millis(100))).run(agent),
    )
    .await
    .expect("console host stops in time");
    assert!(result.is_ok());
    assert_eq!(*table.terminated.lock().unwrap(), vec![7]);
}
