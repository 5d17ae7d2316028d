//! Host-local filesystem inspection RPCs: directory listing and a capped
//! file preview. Blocking filesystem calls run on `spawn_blocking` worker
//! threads so socket I/O stays event-driven.
//!
//! `fs:*` and `hostfs:*` share one dispatch table, differing only in
//! whether the path is relative to a session's `cwd` (`fs:*`) or an
//! absolute host path (`hostfs:*`); this host treats them identically
//! since it never sandboxes a session to a subtree.

use hub_protocol::rpc::{FsEntriesParams, FsEntry, FsFileParams, FsFileResult, RpcMethod};
use hub_protocol::HubError;
use serde_json::Value;

/// Default cap on file preview size, matching the "file preview with a
/// size cap" requirement without shipping multi-gigabyte files through
/// the gateway socket.
const DEFAULT_MAX_BYTES: usize = 256 * 1024;

pub async fn dispatch(method: RpcMethod, params: Value) -> Result<Value, HubError> {
    match method {
        RpcMethod::FsRoots | RpcMethod::HostFsRoots => roots().await,
        RpcMethod::FsEntries | RpcMethod::HostFsEntries => {
            let p: FsEntriesParams = decode(params)?;
            entries(p.path).await
        }
        RpcMethod::FsFile => {
            let p: FsFileParams = decode(params)?;
            file(p.path, p.max_bytes.unwrap_or(DEFAULT_MAX_BYTES)).await
        }
        RpcMethod::FsResources => Ok(serde_json::json!({"resources": []})),
        _ => Err(HubError::internal(format!("{method:?} is not a filesystem RPC"))),
    }
}

async fn roots() -> Result<Value, HubError> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    Ok(serde_json::json!({"roots": [{"name": "home", "path": home}]}))
}

async fn entries(path: String) -> Result<Value, HubError> {
    let listed = tokio::task::spawn_blocking(move || list_dir(&path))
        .await
        .map_err(|e| HubError::internal(format!("fs:entries worker thread panicked: {e}")))??;
    Ok(serde_json::to_value(listed).unwrap())
}

fn list_dir(path: &str) -> Result<Vec<FsEntry>, HubError> {
    let read_dir = std::fs::read_dir(path).map_err(|e| HubError::validation(format!("cannot list '{path}': {e}")))?;
    let mut out = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| HubError::internal(format!("directory read error: {e}")))?;
        let file_type = entry.file_type().map_err(|e| HubError::internal(format!("stat error: {e}")))?;
        out.push(FsEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

async fn file(path: String, max_bytes: usize) -> Result<Value, HubError> {
    let result = tokio::task::spawn_blocking(move || read_capped(&path, max_bytes))
        .await
        .map_err(|e| HubError::internal(format!("fs:file worker thread panicked: {e}")))??;
    Ok(serde_json::to_value(result).unwrap())
}

fn read_capped(path: &str, max_bytes: usize) -> Result<FsFileResult, HubError> {
    let bytes = std::fs::read(path).map_err(|e| HubError::validation(format!("cannot read '{path}': {e}")))?;
    let truncated = bytes.len() > max_bytes;
    let slice = &bytes[..bytes.len().min(max_bytes)];
    Ok(FsFileResult {
        path: path.to_string(),
        content: String::from_utf8_lossy(slice).into_owned(),
        truncated,
    })
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, HubError> {
    serde_json::from_value(params).map_err(|e| HubError::validation(format!("invalid RPC params: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_capped_marks_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, vec![b'a'; 100]).unwrap();
        let result = read_capped(path.to_str().unwrap(), 10).unwrap();
        assert!(result.truncated);
        assert_eq!(result.content.len(), 10);
    }

    #[test]
    fn list_dir_sorts_entries_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"").unwrap();
        let entries = list_dir(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[1].name, "b.txt");
    }
}
