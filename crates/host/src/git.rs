//! Host-local Git inspection RPCs : `git status
//! --porcelain` and a single-file diff, shelled out to the system `git`
//! binary and run on a blocking worker thread.

use std::process::Command;

use hub_protocol::rpc::{GitFileDiffParams, GitFileEntry, GitStatusParams, GitStatusResult, RpcMethod};
use hub_protocol::HubError;
use serde_json::Value;

pub async fn dispatch(method: RpcMethod, params: Value) -> Result<Value, HubError> {
    match method {
        RpcMethod::GitStatus => {
            let p: GitStatusParams = decode(params)?;
            status(p.cwd).await
        }
        RpcMethod::GitFileDiff => {
            let p: GitFileDiffParams = decode(params)?;
            file_diff(p.cwd, p.path).await
        }
        _ => Err(HubError::internal(format!("{method:?} is not a git RPC"))),
    }
}

async fn status(cwd: String) -> Result<Value, HubError> {
    let result = tokio::task::spawn_blocking(move || run_status(&cwd))
        .await
        .map_err(|e| HubError::internal(format!("git:status worker thread panicked: {e}")))??;
    Ok(serde_json::to_value(result).unwrap())
}

fn run_status(cwd: &str) -> Result<GitStatusResult, HubError> {
    let branch = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(cwd)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());

    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(cwd)
        .output()
        .map_err(|e| HubError::validation(format!("failed to run git in '{cwd}': {e}")))?;
    if !output.status.success() {
        return Err(HubError::validation(format!(
            "'{cwd}' is not a git repository: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let files = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let (status, path) = line.split_at(2.min(line.len()));
            if path.is_empty() {
                None
            } else {
                Some(GitFileEntry {
                    path: path.trim().to_string(),
                    status: status.trim().to_string(),
                })
            }
        })
        .collect();

    Ok(GitStatusResult { branch, files })
}

async fn file_diff(cwd: String, path: String) -> Result<Value, HubError> {
    let result = tokio::task::spawn_blocking(move || run_file_diff(&cwd, &path))
        .await
        .map_err(|e| HubError::internal(format!("git:fileDiff worker thread panicked: {e}")))??;
    Ok(serde_json::to_value(result).unwrap())
}

fn run_file_diff(cwd: &str, path: &str) -> Result<hub_protocol::rpc::GitFileDiffResult, HubError> {
    let output = Command::new("git")
        .args(["diff", "--no-color", "--", path])
        .current_dir(cwd)
        .output()
        .map_err(|e| HubError::validation(format!("failed to run git diff in '{cwd}': {e}")))?;
    if !output.status.success() {
        return Err(HubError::validation(format!(
            "git diff failed for '{path}': {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(hub_protocol::rpc::GitFileDiffResult {
        path: path.to_string(),
        diff: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, HubError> {
    serde_json::from_value(params).map_err(|e| HubError::validation(format!("invalid RPC params: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_rejects_non_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_status(dir.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.code, hub_protocol::ErrorCode::RequestValidationFailed);
    }
}
