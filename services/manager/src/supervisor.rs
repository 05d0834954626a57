//! Process supervisor: keeps one recorder OS process running per desired
//! archive.
//!
//! Each pass runs the stop phase before the start phase, so a stream
//! leaving and re-entering the desired set frees its slot before a
//! replacement is considered. Reaping is always non-blocking; a child that
//! has been signaled but not yet exited is simply left for the next pass.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{ArchiveSpec, DesiredArchives};

/// How long shutdown waits for signaled recorders before leaving them to
/// finish on their own.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);
/// Delay between reap attempts during the shutdown drain.
const DRAIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Starts a recorder process for one stream. A trait so tests can launch a
/// stub command instead of the real binary.
pub trait RecorderLauncher: Send {
    fn launch(&self, stream_uuid: &str) -> io::Result<Child>;
}

/// Launches the configured recorder binary with the stream identity and a
/// reference to the shared configuration file.
pub struct RecorderCommand {
    pub bin: PathBuf,
    pub config_path: PathBuf,
}

impl RecorderLauncher for RecorderCommand {
    fn launch(&self, stream_uuid: &str) -> io::Result<Child> {
        Command::new(&self.bin)
            .arg(stream_uuid)
            .arg(format!("--config={}", self.config_path.display()))
            .stdin(Stdio::null())
            .spawn()
    }
}

/// A live recorder process owned by the supervisor.
struct ControlledProcess {
    child: Child,
    term_sent: bool,
}

pub struct Supervisor<L: RecorderLauncher> {
    desired: DesiredArchives,
    launcher: L,
    controlled: HashMap<String, ControlledProcess>,
}

impl<L: RecorderLauncher> Supervisor<L> {
    pub fn new(desired: DesiredArchives, launcher: L) -> Self {
        Self {
            desired,
            launcher,
            controlled: HashMap::new(),
        }
    }

    /// Streams with a live (or not yet reaped) recorder process.
    pub fn controlled_streams(&self) -> Vec<String> {
        self.controlled.keys().cloned().collect()
    }

    /// One reconciliation pass: stop phase, then start phase. The desired
    /// snapshot is taken under the lock; spawning happens without it.
    pub fn pass(&mut self) {
        let desired: HashMap<String, ArchiveSpec> = self.desired.lock().clone();
        self.stop_phase(&desired);
        self.start_phase(&desired);
    }

    fn stop_phase(&mut self, desired: &HashMap<String, ArchiveSpec>) {
        for (stream_uuid, process) in self.controlled.iter_mut() {
            if !desired.contains_key(stream_uuid) && !process.term_sent {
                signal_terminate(&process.child);
                process.term_sent = true;
                info!(%stream_uuid, pid = process.child.id(), "recorder signaled to stop");
            }
        }

        // Non-blocking reap of every controlled process. Signaled children
        // drop their records here; self-exited children do too, and the
        // start phase restarts them if their stream is still desired.
        self.controlled
            .retain(|stream_uuid, process| match process.child.try_wait() {
                Ok(Some(exit)) => {
                    if process.term_sent {
                        info!(%stream_uuid, %exit, "recorder stopped");
                    } else {
                        warn!(%stream_uuid, %exit, "recorder exited unexpectedly");
                    }
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(%stream_uuid, error = %e, "failed to poll recorder process");
                    true
                }
            });
    }

    fn start_phase(&mut self, desired: &HashMap<String, ArchiveSpec>) {
        for stream_uuid in desired.keys() {
            if self.controlled.contains_key(stream_uuid) {
                continue;
            }

            match self.launcher.launch(stream_uuid) {
                Ok(child) => {
                    info!(%stream_uuid, pid = child.id(), "recorder started");
                    metrics::counter!("manager.recorders.started").increment(1);
                    self.controlled.insert(
                        stream_uuid.clone(),
                        ControlledProcess {
                            child,
                            term_sent: false,
                        },
                    );
                }
                // Retried on the next pass; no record is kept for a failed
                // spawn.
                Err(e) => {
                    error!(%stream_uuid, error = %e, "failed to start recorder");
                    metrics::counter!("manager.recorders.start_failures").increment(1);
                }
            }
        }
    }

    /// Run passes at the poll interval until cancelled, then signal every
    /// remaining child and wait out a bounded drain period.
    pub async fn run(mut self, poll: Duration, shutdown: CancellationToken) {
        info!("process supervisor started");

        loop {
            self.pass();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        self.drain().await;
        info!("process supervisor stopped");
    }

    async fn drain(&mut self) {
        for (stream_uuid, process) in self.controlled.iter_mut() {
            if !process.term_sent {
                signal_terminate(&process.child);
                process.term_sent = true;
                debug!(%stream_uuid, "recorder signaled for shutdown");
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while !self.controlled.is_empty() && tokio::time::Instant::now() < deadline {
            self.controlled
                .retain(|stream_uuid, process| match process.child.try_wait() {
                    Ok(Some(_)) => {
                        debug!(%stream_uuid, "recorder reaped");
                        false
                    }
                    _ => true,
                });

            if self.controlled.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_REAP_INTERVAL).await;
        }

        if !self.controlled.is_empty() {
            warn!(
                remaining = self.controlled.len(),
                "leaving recorder processes to finish on their own"
            );
        }
    }
}

/// Send SIGTERM without waiting. Reaping happens via `try_wait` so the
/// reconciliation loop never blocks on a child.
fn signal_terminate(child: &Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    /// Launches a process that stays alive until signaled.
    struct SleepLauncher;

    impl RecorderLauncher for SleepLauncher {
        fn launch(&self, _stream_uuid: &str) -> io::Result<Child> {
            Command::new("sleep").arg("60").stdin(Stdio::null()).spawn()
        }
    }

    /// Launches a process that exits immediately.
    struct ExitingLauncher;

    impl RecorderLauncher for ExitingLauncher {
        fn launch(&self, _stream_uuid: &str) -> io::Result<Child> {
            Command::new("true").stdin(Stdio::null()).spawn()
        }
    }

    struct FailingLauncher;

    impl RecorderLauncher for FailingLauncher {
        fn launch(&self, _stream_uuid: &str) -> io::Result<Child> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no recorder binary"))
        }
    }

    fn desired_with(streams: &[&str]) -> DesiredArchives {
        let map = streams
            .iter()
            .map(|s| {
                (
                    (*s).to_owned(),
                    ArchiveSpec {
                        stream_uuid: (*s).to_owned(),
                        retention_days: 7,
                    },
                )
            })
            .collect();
        Arc::new(Mutex::new(map))
    }

    /// Run passes until the controlled set reaches `len` or time runs out.
    fn pass_until_len<L: RecorderLauncher>(supervisor: &mut Supervisor<L>, len: usize) {
        for _ in 0..50 {
            supervisor.pass();
            if supervisor.controlled.len() == len {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        panic!(
            "controlled set never reached {len}: {:?}",
            supervisor.controlled_streams()
        );
    }

    #[test]
    fn starts_exactly_one_process_per_desired_archive() {
        let desired = desired_with(&["cam1_main", "cam2_main"]);
        let mut supervisor = Supervisor::new(desired.clone(), SleepLauncher);

        supervisor.pass();
        supervisor.pass();
        assert_eq!(supervisor.controlled.len(), 2);

        let mut streams = supervisor.controlled_streams();
        streams.sort();
        assert_eq!(streams, vec!["cam1_main", "cam2_main"]);

        desired.lock().clear();
        pass_until_len(&mut supervisor, 0);
    }

    #[test]
    fn stops_and_reaps_removed_archives() {
        let desired = desired_with(&["cam1_main"]);
        let mut supervisor = Supervisor::new(desired.clone(), SleepLauncher);

        supervisor.pass();
        assert_eq!(supervisor.controlled.len(), 1);

        desired.lock().remove("cam1_main");
        pass_until_len(&mut supervisor, 0);
    }

    #[test]
    fn self_exited_recorder_is_restarted_while_desired() {
        let desired = desired_with(&["cam1_main"]);
        let mut supervisor = Supervisor::new(desired, ExitingLauncher);

        supervisor.pass();
        assert_eq!(supervisor.controlled.len(), 1);

        // Give the child time to exit, then reconcile: the dead process is
        // reaped and a replacement started in the same pass. Never two
        // records for one stream.
        thread::sleep(Duration::from_millis(200));
        supervisor.pass();
        assert_eq!(supervisor.controlled.len(), 1);
    }

    #[test]
    fn spawn_failure_leaves_no_record() {
        let desired = desired_with(&["cam1_main"]);
        let mut supervisor = Supervisor::new(desired, FailingLauncher);

        supervisor.pass();
        assert!(supervisor.controlled.is_empty());

        // Retried on the next pass, still failing, still no record.
        supervisor.pass();
        assert!(supervisor.controlled.is_empty());
    }
}
