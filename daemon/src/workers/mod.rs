pub mod extractor;
pub mod prober;
pub mod processes;
pub mod progress_file;
pub mod transcoder;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Forward a child's stderr to debug logs; the task yields the last non-empty line.
pub(crate) fn forward_stderr(stderr: ChildStderr, label: &'static str) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut last = None;
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            debug!(target: "child_process", "[{}] {}", label, line);
            last = Some(line);
        }
        last
    })
}

/// Kill a child and reap it.
pub(crate) async fn terminate(child: &mut Child, label: &str) {
    let pid = child.id();
    match child.kill().await {
        Ok(()) => debug!("Killed {} (pid {:?})", label, pid),
        Err(e) => warn!("Failed to kill {} (pid {:?}): {}", label, pid, e),
    }
}
