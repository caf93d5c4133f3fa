//! Process launching and process-tree termination for job instances.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, geteuid};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use openbach_shared::errors::{OpenbachError, OpenbachResult};

/// Grace period between SIGTERM and SIGKILL for descendants of a job.
pub const CHILDREN_GRACE: Duration = Duration::from_secs(1);
/// Grace period between SIGTERM and SIGKILL for the job process itself.
pub const MAIN_GRACE: Duration = Duration::from_secs(2);

const POLL_STEP: Duration = Duration::from_millis(50);

/// Identity of a launched job instance, exported to its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnvironment {
    pub job_name: String,
    pub instance_id: i64,
    pub scenario_id: u64,
    pub owner_id: u64,
}

impl JobEnvironment {
    pub fn variables(&self) -> [(&'static str, String); 4] {
        [
            ("JOB_NAME", self.job_name.clone()),
            ("JOB_INSTANCE_ID", self.instance_id.to_string()),
            ("SCENARIO_INSTANCE_ID", self.scenario_id.to_string()),
            ("OWNER_SCENARIO_INSTANCE_ID", self.owner_id.to_string()),
        ]
    }
}

/// Build the command line for a job, prefixing `sudo -n` when it needs
/// privileges the agent does not have.
pub fn command_line(command: &[String], arguments: &[String], need_privileges: bool) -> Vec<String> {
    let mut line = Vec::with_capacity(command.len() + arguments.len() + 2);
    if need_privileges && !geteuid().is_root() {
        line.push("sudo".to_string());
        line.push("-n".to_string());
    }
    line.extend(command.iter().cloned());
    line.extend(arguments.iter().cloned());
    line
}

/// Spawn a job process with its output discarded, leading a new process
/// group so that signals aimed at the agent do not reach it.
pub fn spawn(line: &[String], environment: Option<&JobEnvironment>) -> OpenbachResult<Child> {
    let (program, args) = line
        .split_first()
        .ok_or_else(|| OpenbachError::bad_request("Job command line is empty"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    if let Some(environment) = environment {
        command.envs(environment.variables());
    }

    command
        .spawn()
        .map_err(|e| OpenbachError::internal(format!("Failed to launch '{}': {}", program, e)))
}

/// Run a command to completion, typically a job's stop command.
pub async fn run_to_completion(line: &[String]) -> OpenbachResult<Option<i32>> {
    let mut child = spawn(line, None)?;
    let status = child
        .wait()
        .await
        .map_err(|e| OpenbachError::internal(format!("Failed to wait for '{}': {}", line.join(" "), e)))?;
    Ok(status.code())
}

/// Parse `/proc/<pid>/stat` into `(state, ppid)`.
///
/// The command name is parenthesized and may contain spaces, so fields are
/// read after the last closing parenthesis.
fn read_stat(pid: i32) -> Option<(char, i32)> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Whether a process exists and is not a zombie.
pub fn is_alive(pid: i32) -> bool {
    matches!(read_stat(pid), Some((state, _)) if state != 'Z' && state != 'X')
}

/// All descendants of `pid`, found by walking parent links in `/proc`.
pub fn descendants(pid: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(candidate) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some((_, ppid)) = read_stat(candidate) {
                children.entry(ppid).or_default().push(candidate);
            }
        }
    }

    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![pid];
    while let Some(parent) = stack.pop() {
        for child in children.get(&parent).into_iter().flatten() {
            if seen.insert(*child) {
                found.push(*child);
                stack.push(*child);
            }
        }
    }
    found
}

fn signal(pids: &[i32], sig: Signal) {
    for pid in pids {
        if let Err(e) = kill(Pid::from_raw(*pid), sig) {
            debug!("Cannot send {} to {}: {}", sig, pid, e);
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL whatever survived.
async fn terminate(pids: &[i32], grace: Duration) {
    if pids.is_empty() {
        return;
    }
    signal(pids, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    loop {
        let survivors: Vec<i32> = pids.iter().copied().filter(|pid| is_alive(*pid)).collect();
        if survivors.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            warn!("Killing processes {:?} that ignored SIGTERM", survivors);
            signal(&survivors, Signal::SIGKILL);
            return;
        }
        sleep(POLL_STEP).await;
    }
}

/// Stop a job process together with every process it spawned.
pub async fn terminate_tree(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if !is_alive(pid) {
        return;
    }
    terminate(&descendants(pid), CHILDREN_GRACE).await;
    terminate(&[pid], MAIN_GRACE).await;

    // Orphans re-parented away from the tree are still in its group.
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("No process left in group {}: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &[&str]) -> Vec<String> {
        line.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_line_appends_arguments() {
        let line = command_line(&words(&["ping", "-c"]), &words(&["3", "localhost"]), false);
        assert_eq!(line, words(&["ping", "-c", "3", "localhost"]));
    }

    #[test]
    fn test_command_line_privileges() {
        let line = command_line(&words(&["tc"]), &[], true);
        if geteuid().is_root() {
            assert_eq!(line, words(&["tc"]));
        } else {
            assert_eq!(line, words(&["sudo", "-n", "tc"]));
        }
    }

    #[test]
    fn test_environment_variables() {
        let environment = JobEnvironment {
            job_name: "fping".to_string(),
            instance_id: 42,
            scenario_id: 7,
            owner_id: 3,
        };
        let variables = environment.variables();
        assert_eq!(variables[0], ("JOB_NAME", "fping".to_string()));
        assert_eq!(variables[1], ("JOB_INSTANCE_ID", "42".to_string()));
        assert_eq!(variables[3], ("OWNER_SCENARIO_INSTANCE_ID", "3".to_string()));
    }

    #[test]
    fn test_spawn_empty_line() {
        assert!(matches!(
            spawn(&[], None),
            Err(OpenbachError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_tree_kills_children() {
        let child = spawn(&words(&["/bin/sh", "-c", "sleep 30 & sleep 30; wait"]), None).unwrap();
        let pid = child.id().unwrap() as i32;
        sleep(Duration::from_millis(200)).await;

        let children = descendants(pid);
        assert!(!children.is_empty());

        terminate_tree(pid as u32).await;
        assert!(children.iter().all(|child| !is_alive(*child)));
        drop(child);
    }

    #[tokio::test]
    async fn test_job_leads_its_process_group() {
        let mut child = spawn(&words(&["/bin/sleep", "30"]), None).unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);
        assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap(), pid);
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_tree_reaches_orphans() {
        let temp = tempfile::TempDir::new().unwrap();
        let pid_file = temp.path().join("orphan.pid");
        let script = format!("(sleep 30 & echo $! > {}); sleep 30", pid_file.display());
        let child = spawn(&words(&["/bin/sh", "-c", &script]), None).unwrap();
        let pid = child.id().unwrap() as i32;

        let mut orphan = None;
        for _ in 0..50 {
            sleep(Duration::from_millis(20)).await;
            orphan = fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<i32>().ok());
            if orphan.is_some() {
                break;
            }
        }
        let orphan = orphan.unwrap();
        assert!(is_alive(orphan));

        terminate_tree(pid as u32).await;
        sleep(Duration::from_millis(100)).await;
        assert!(!is_alive(orphan));
        drop(child);
    }

    #[tokio::test]
    async fn test_run_to_completion_reports_code() {
        let code = run_to_completion(&words(&["/bin/sh", "-c", "exit 3"])).await.unwrap();
        assert_eq!(code, Some(3));
    }
}
