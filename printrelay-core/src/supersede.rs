//! Single-instance supersession.
//!
//! Matching is by image name only. Two copies started inside the same
//! enumeration window can each miss the other and both keep running.

use tracing::{info, warn};

use crate::SupersedeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub pid: u32,
    pub image_name: String,
}

/// OS process enumeration and termination.
pub trait ProcessTable: Send + Sync {
    fn current(&self) -> Result<InstanceRecord, SupersedeError>;
    fn find_by_image(&self, image_name: &str) -> Result<Vec<InstanceRecord>, SupersedeError>;
    fn terminate(&self, pid: u32) -> Result<(), SupersedeError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupersessionReport {
    pub terminated: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl SupersessionReport {
    pub fn is_noop(&self) -> bool {
        self.terminated.is_empty() && self.failed.is_empty()
    }
}

/// Terminates every other process running under this program's image name.
///
/// Never fails: every problem is logged and reflected in the report.
pub fn supersede_older_instances(table: &dyn ProcessTable) -> SupersessionReport {
    let mut report = SupersessionReport::default();

    let current = match table.current() {
        Ok(current) => current,
        Err(err) => {
            warn!("skipping instance supersession: {}", err);
            return report;
        }
    };

    let matches = match table.find_by_image(&current.image_name) {
        Ok(matches) => matches,
        Err(err) => {
            warn!("failed to look up running instances: {}", err);
            return report;
        }
    };

    for record in matches.into_iter().filter(|r| r.pid != current.pid) {
        info!(
            "found older instance {} (pid {}), terminating",
            record.image_name, record.pid
        );
        match table.terminate(record.pid) {
            Ok(()) => {
                info!("terminated older instance (pid {})", record.pid);
                report.terminated.push(record.pid);
            }
            Err(err) => {
                warn!("{}", err);
                report.failed.push((record.pid, err.to_string()));
            }
        }
    }

    report
}

/// Process table backed by the host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn current(&self) -> Result<InstanceRecord, SupersedeError> {
        let exe = std::env::current_exe().map_err(SupersedeError::CurrentExecutable)?;
        let image_name = exe
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SupersedeError::CurrentExecutable(std::io::Error::other(
                    "executable path has no file name",
                ))
            })?;
        Ok(InstanceRecord {
            pid: std::process::id(),
            image_name,
        })
    }

    fn find_by_image(&self, image_name: &str) -> Result<Vec<InstanceRecord>, SupersedeError> {
        platform::find_by_image(image_name)
    }

    fn terminate(&self, pid: u32) -> Result<(), SupersedeError> {
        platform::terminate(pid)
    }
}

/// Parses `tasklist /FO CSV /NH` output.
///
/// Lines look like `"printrelay-agent.exe","12345","Console","1","12,345 K"`.
/// Anything else, such as the "No tasks are running" notice, is skipped.
pub fn parse_tasklist_csv(output: &str) -> Vec<InstanceRecord> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split("\",\"").collect();
            if fields.len() < 2 {
                return None;
            }
            let image_name = fields[0].trim_start_matches('"');
            let pid = fields[1].trim_matches('"').parse::<u32>().ok()?;
            Some(InstanceRecord {
                pid,
                image_name: image_name.to_owned(),
            })
        })
        .collect()
}

#[cfg(target_os = "windows")]
mod platform {
    use std::{io, os::windows::process::CommandExt, process::Command};

    use windows_sys::Win32::{
        Foundation::CloseHandle,
        System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess},
    };

    use super::{InstanceRecord, parse_tasklist_csv};
    use crate::SupersedeError;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    pub fn find_by_image(image_name: &str) -> Result<Vec<InstanceRecord>, SupersedeError> {
        let output = Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {image_name}"), "/FO", "CSV", "/NH"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|err| SupersedeError::Enumeration(err.to_string()))?;
        if !output.status.success() {
            return Err(SupersedeError::Enumeration(format!(
                "tasklist exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tasklist_csv(&text))
    }

    pub fn terminate(pid: u32) -> Result<(), SupersedeError> {
        let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) };
        if handle == 0 {
            return Err(SupersedeError::Terminate {
                pid,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        let ok = unsafe { TerminateProcess(handle, 1) };
        let failure = (ok == 0).then(io::Error::last_os_error);
        unsafe { CloseHandle(handle) };
        match failure {
            Some(err) => Err(SupersedeError::Terminate {
                pid,
                reason: err.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::{fs, process::Command};

    use super::InstanceRecord;
    use crate::SupersedeError;

    pub fn find_by_image(image_name: &str) -> Result<Vec<InstanceRecord>, SupersedeError> {
        let entries =
            fs::read_dir("/proc").map_err(|err| SupersedeError::Enumeration(err.to_string()))?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Unreadable links belong to other users or exited processes.
            let Ok(exe) = fs::read_link(entry.path().join("exe")) else {
                continue;
            };
            let Some(name) = exe.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let name = name.trim_end_matches(" (deleted)");
            if name == image_name {
                records.push(InstanceRecord {
                    pid,
                    image_name: name.to_owned(),
                });
            }
        }
        Ok(records)
    }

    pub fn terminate(pid: u32) -> Result<(), SupersedeError> {
        let status = Command::new("kill")
            .args(["-s", "KILL", &pid.to_string()])
            .status()
            .map_err(|err| SupersedeError::Terminate {
                pid,
                reason: err.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(SupersedeError::Terminate {
                pid,
                reason: format!("kill exited with {status}"),
            })
        }
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
mod platform {
    use super::InstanceRecord;
    use crate::SupersedeError;

    pub fn find_by_image(_image_name: &str) -> Result<Vec<InstanceRecord>, SupersedeError> {
        Ok(Vec::new())
    }

    pub fn terminate(pid: u32) -> Result<(), SupersedeError> {
        Err(SupersedeError::Terminate {
            pid,
            reason: "process termination is not supported on this platform".to_owned(),
        })
    }
}
