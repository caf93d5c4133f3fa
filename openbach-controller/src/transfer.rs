//! File copies between the controller and agent hosts over `scp`.

use tokio::process::Command;
use tracing::{debug, warn};

use openbach_shared::errors::{OpenbachError, OpenbachResult};

/// One file of a `push_file` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedFile {
    pub local_path: String,
    pub remote_path: String,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Delete the local copy once pushed.
    pub remove: bool,
}

impl PushedFile {
    /// `user:group`, `user` or `:group` for `chown`.
    fn ownership(&self) -> Option<String> {
        match (&self.user, &self.group) {
            (None, None) => None,
            (Some(user), None) => Some(user.clone()),
            (None, Some(group)) => Some(format!(":{}", group)),
            (Some(user), Some(group)) => Some(format!("{}:{}", user, group)),
        }
    }
}

/// Zip the parallel lists of a `push_file` action.
///
/// `local_paths` and `remote_paths` must have the same length; `users`,
/// `groups` and `removes` are either empty or of that same length too.
pub fn pushed_files(
    local_paths: &[String],
    remote_paths: &[String],
    users: &[String],
    groups: &[String],
    removes: &[bool],
) -> OpenbachResult<Vec<PushedFile>> {
    let count = local_paths.len();
    if remote_paths.len() != count {
        return Err(OpenbachError::bad_request(format!(
            "Cannot push {} local file(s) to {} remote path(s)",
            count,
            remote_paths.len()
        )));
    }
    for (name, len) in [
        ("users", users.len()),
        ("groups", groups.len()),
        ("removes", removes.len()),
    ] {
        if len != 0 && len != count {
            return Err(OpenbachError::bad_request(format!(
                "Expected {} {} for {} file(s), got {}",
                count, name, count, len
            )));
        }
    }

    let non_empty = |value: Option<&String>| value.filter(|v| !v.is_empty()).cloned();
    Ok((0..count)
        .map(|i| PushedFile {
            local_path: local_paths[i].clone(),
            remote_path: remote_paths[i].clone(),
            user: non_empty(users.get(i)),
            group: non_empty(groups.get(i)),
            remove: removes.get(i).copied().unwrap_or(false),
        })
        .collect())
}

pub async fn push(host: &str, file: &PushedFile) -> OpenbachResult<()> {
    let destination = format!("{}:{}", host, file.remote_path);
    run("scp", &["-q", "-B", &file.local_path, &destination]).await?;

    if let Some(owner) = file.ownership() {
        run("ssh", &["-o", "BatchMode=yes", host, "chown", &owner, &file.remote_path]).await?;
    }
    if file.remove {
        if let Err(e) = tokio::fs::remove_file(&file.local_path).await {
            warn!("Pushed {} but could not remove it: {}", file.local_path, e);
        }
    }
    Ok(())
}

pub async fn pull(host: &str, remote_path: &str, local_path: &str) -> OpenbachResult<()> {
    let source = format!("{}:{}", host, remote_path);
    run("scp", &["-q", "-B", &source, local_path]).await
}

async fn run(program: &str, args: &[&str]) -> OpenbachResult<()> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| OpenbachError::internal(format!("Failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OpenbachError::unprocessable(format!(
            "{} failed: {}",
            program,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_pushed_files_zip_lists() {
        let files = pushed_files(
            &strings(&["/srv/a.conf", "/srv/b.conf"]),
            &strings(&["/etc/a.conf", "/etc/b.conf"]),
            &strings(&["root", ""]),
            &[],
            &[false, true],
        )
        .unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].ownership().as_deref(), Some("root"));
        assert_eq!(files[1].ownership(), None);
        assert!(files[1].remove);
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let mismatch = pushed_files(
            &strings(&["/srv/a.conf"]),
            &strings(&["/etc/a.conf", "/etc/b.conf"]),
            &[],
            &[],
            &[],
        );
        assert!(matches!(mismatch, Err(OpenbachError::BadRequest { .. })));

        let bad_groups = pushed_files(
            &strings(&["/srv/a.conf"]),
            &strings(&["/etc/a.conf"]),
            &[],
            &strings(&["wheel", "adm"]),
            &[],
        );
        assert!(matches!(bad_groups, Err(OpenbachError::BadRequest { .. })));
    }

    #[test]
    fn test_ownership_forms() {
        let file = PushedFile {
            local_path: "a".into(),
            remote_path: "b".into(),
            user: None,
            group: Some("adm".into()),
            remove: false,
        };
        assert_eq!(file.ownership().as_deref(), Some(":adm"));
        let file = PushedFile {
            user: Some("openbach".into()),
            ..file
        };
        assert_eq!(file.ownership().as_deref(), Some("openbach:adm"));
    }

    #[tokio::test]
    async fn test_failed_command_is_unprocessable() {
        let error = run("false", &[]).await.unwrap_err();
        assert!(matches!(error, OpenbachError::Unprocessable { .. }));
        let missing = run("/nonexistent/openbach-scp", &[]).await.unwrap_err();
        assert!(matches!(missing, OpenbachError::Internal { .. }));
    }
}
