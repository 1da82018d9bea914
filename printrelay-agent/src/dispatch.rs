use std::{io, process::Stdio, sync::Arc, time::SystemTime};

use printrelay_core::{
    DispatchError, DispatchedProcess, ExecutableLocator, PrintInvocation, StagedDocument,
};
use tracing::{error, info, warn};

/// OS process-spawn seam.
pub trait Launcher: Send + Sync {
    /// Starts the program without waiting for it. Returns the pid when it is known.
    fn launch(&self, invocation: &PrintInvocation) -> io::Result<Option<u32>>;
}

/// Spawns the real print program.
///
/// The quoted form from [`PrintInvocation::args`] is what Windows receives on
/// its command line, and it is also what gets logged. Elsewhere each argument
/// is passed unquoted as its own argv entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, invocation: &PrintInvocation) -> io::Result<Option<u32>> {
        let mut command = std::process::Command::new(invocation.program());

        // Arguments are already quoted; pass them through untouched.
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            for arg in invocation.args() {
                command.raw_arg(arg);
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            command
                .arg(printrelay_core::SILENT_PRINT_FLAG)
                .arg(invocation.document())
                .arg(invocation.device_name());
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = tokio::process::Command::from(command)
            .kill_on_drop(false)
            .spawn()?;
        let pid = child.id();
        // Dropping the handle detaches; the runtime reaps the exit status.
        drop(child);
        Ok(pid)
    }
}

pub struct Dispatcher {
    locator: ExecutableLocator,
    launcher: Arc<dyn Launcher>,
}

impl Dispatcher {
    pub fn new(locator: ExecutableLocator, launcher: Arc<dyn Launcher>) -> Self {
        Self { locator, launcher }
    }

    /// Starts the print program for `staged` and returns as soon as it is running.
    pub fn dispatch(
        &self,
        staged: &StagedDocument,
        device_name: &str,
    ) -> Result<DispatchedProcess, DispatchError> {
        let resolved = self.locator.resolve().inspect_err(|err| {
            error!("cannot print {}: {}", staged.path.display(), err);
        })?;

        let invocation = PrintInvocation::new(resolved.path, &staged.path, device_name);
        let command_line = invocation.command_line();
        info!("executing print command: {}", command_line);

        let pid = self.launcher.launch(&invocation).map_err(|source| {
            error!("failed to start print command: {}", source);
            DispatchError::LaunchFailed {
                program: invocation.program().display().to_string(),
                source,
            }
        })?;

        match pid {
            Some(pid) => info!("print command started in background (pid {})", pid),
            None => warn!("print command started but its pid is unavailable; detaching anyway"),
        }

        Ok(DispatchedProcess {
            pid,
            command_line,
            started_at: SystemTime::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Mutex};

    use super::*;

    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, invocation: &PrintInvocation) -> io::Result<Option<u32>> {
            self.calls.lock().unwrap().push(invocation.argv());
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(Some(4242))
        }
    }

    fn staged(dir: &std::path::Path) -> StagedDocument {
        StagedDocument {
            path: dir.join("quarterly report.pdf"),
            size_bytes: 10,
            generation: 1,
        }
    }

    fn locator_with_reader(dir: &std::path::Path) -> (ExecutableLocator, PathBuf) {
        let reader = dir.join("AcroRd32.exe");
        std::fs::write(&reader, b"MZ").expect("write fake reader");
        (
            ExecutableLocator::new(Some(reader.clone())).with_search_path(""),
            reader,
        )
    }

    #[test]
    fn dispatch_launches_once_with_quoted_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (locator, reader) = locator_with_reader(dir.path());
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher = Dispatcher::new(locator, launcher.clone());

        let staged = staged(dir.path());
        let process = dispatcher
            .dispatch(&staged, "Office 2F")
            .expect("dispatch succeeds");

        let calls = launcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                format!("\"{}\"", reader.display()),
                "/t".to_owned(),
                format!("\"{}\"", staged.path.display()),
                "\"Office 2F\"".to_owned(),
            ]
        );
        assert_eq!(process.pid, Some(4242));
        assert_eq!(process.command_line, calls[0].join(" "));
    }

    #[test]
    fn missing_executable_never_launches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locator = ExecutableLocator::new(Some(dir.path().join("nope.exe")))
            .with_default_path(dir.path().join("default.exe"))
            .with_search_path("");
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher = Dispatcher::new(locator, launcher.clone());

        let err = dispatcher
            .dispatch(&staged(dir.path()), "Office-2F")
            .expect_err("no executable");
        assert!(matches!(err, DispatchError::ExecutableNotFound { .. }));
        assert!(launcher.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn spawn_error_becomes_launch_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (locator, _) = locator_with_reader(dir.path());
        let launcher = Arc::new(RecordingLauncher {
            fail: true,
            ..RecordingLauncher::default()
        });
        let dispatcher = Dispatcher::new(locator, launcher);

        let err = dispatcher
            .dispatch(&staged(dir.path()), "Office-2F")
            .expect_err("launch fails");
        match err {
            DispatchError::LaunchFailed { program, source } => {
                assert!(program.ends_with("AcroRd32.exe"));
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_launcher_does_not_wait_for_exit() {
        let invocation = PrintInvocation::new("sleep", "5", "ignored");
        let started = std::time::Instant::now();
        // `sleep /t 5 ignored` exits with a usage error; either way we must not block.
        let pid = ProcessLauncher.launch(&invocation).expect("spawn sleep");
        assert!(pid.is_some());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn process_launcher_passes_plain_argv_outside_windows() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-reader");
        let captured = dir.path().join("fake-reader.args");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$0.tmp\" && mv \"$0.tmp\" \"$0.args\"\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");

        let invocation = PrintInvocation::new(&script, dir.path().join("a b.pdf"), "Office 2F");
        // Another test forking while the script fd is open yields ETXTBSY.
        let mut attempts = 0;
        loop {
            match ProcessLauncher.launch(&invocation) {
                Ok(_) => break,
                Err(err) if err.raw_os_error() == Some(26) && attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(err) => panic!("spawn script: {err}"),
            }
        }

        for _ in 0..100 {
            if captured.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let argv = std::fs::read_to_string(&captured).expect("read captured argv");
        assert_eq!(
            argv,
            format!("/t\n{}\nOffice 2F\n", dir.path().join("a b.pdf").display())
        );
    }

    #[tokio::test]
    async fn process_launcher_reports_missing_program() {
        let invocation = PrintInvocation::new("/definitely/not/here/reader", "a.pdf", "p");
        let err = ProcessLauncher.launch(&invocation).expect_err("missing program");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
