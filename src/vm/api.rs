use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    InstanceStart,
    SendCtrlAltDel,
}

impl VmAction {
    fn as_str(self) -> &'static str {
        match self {
            VmAction::InstanceStart => "InstanceStart",
            VmAction::SendCtrlAltDel => "SendCtrlAltDel",
        }
    }
}

/// Client for the hypervisor's HTTP/1.1-over-unix-socket configuration API.
///
/// There is no DNS or TCP involved; the dial target is the per-job control
/// socket. One request per connection, each with a bounded deadline.
pub struct ApiClient {
    socket: PathBuf,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn configure_machine(&self, vcpus: u32, mem_size_mib: u32) -> Result<()> {
        self.put(
            "/machine-config",
            json!({
                "vcpu_count": vcpus,
                "mem_size_mib": mem_size_mib,
            }),
        )
        .await
    }

    pub async fn set_boot_source(&self, kernel: &Path, boot_args: &str) -> Result<()> {
        self.put(
            "/boot-source",
            json!({
                "kernel_image_path": kernel,
                "boot_args": boot_args,
            }),
        )
        .await
    }

    pub async fn attach_drive(
        &self,
        drive_id: &str,
        host_path: &Path,
        is_root: bool,
        read_only: bool,
    ) -> Result<()> {
        self.put(
            &format!("/drives/{drive_id}"),
            json!({
                "drive_id": drive_id,
                "path_on_host": host_path,
                "is_root_device": is_root,
                "is_read_only": read_only,
            }),
        )
        .await
    }

    pub async fn attach_nic(&self, iface_id: &str, host_dev: &str, guest_mac: &str) -> Result<()> {
        self.put(
            &format!("/network-interfaces/{iface_id}"),
            json!({
                "iface_id": iface_id,
                "host_dev_name": host_dev,
                "guest_mac": guest_mac,
            }),
        )
        .await
    }

    pub async fn action(&self, action: VmAction) -> Result<()> {
        self.put("/actions", json!({ "action_type": action.as_str() })).await
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let payload = body.to_string();
        let request = format!(
            "PUT {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {payload}",
            payload.len()
        );

        let response = timeout(self.timeout, self.round_trip(request.as_bytes()))
            .await
            .map_err(|_| {
                Error::SupervisorTimeout(format!(
                    "PUT {path} got no response within {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| Error::Protocol {
                method: "PUT",
                path: path.to_string(),
                detail: e.to_string(),
            })?;

        let status = parse_status_line(&response).ok_or_else(|| Error::Protocol {
            method: "PUT",
            path: path.to_string(),
            detail: "malformed status line".to_string(),
        })?;

        if !(200..300).contains(&status) {
            return Err(Error::Protocol {
                method: "PUT",
                path: path.to_string(),
                detail: format!("status {status}"),
            });
        }
        Ok(())
    }

    async fn round_trip(&self, request: &[u8]) -> std::io::Result<String> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        stream.write_all(request).await?;
        // Connection: close lets the peer delimit the response by EOF
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

fn parse_status_line(response: &str) -> Option<u16> {
    let line = response.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 204 No Content\r\n\r\n"), Some(204));
        assert_eq!(parse_status_line("HTTP/1.1 400 Bad Request\r\n\r\n{}"), Some(400));
        assert_eq!(parse_status_line("garbage"), None);
        assert_eq!(parse_status_line(""), None);
    }

    async fn fake_hypervisor(listener: UnixListener, response: &'static str) {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn test_put_accepts_2xx() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_hypervisor(listener, "HTTP/1.1 204 No Content\r\n\r\n"));

        let client = ApiClient::new(&socket);
        client.action(VmAction::InstanceStart).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_rejects_non_2xx() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_hypervisor(
            listener,
            "HTTP/1.1 400 Bad Request\r\n\r\n{\"fault_message\":\"bad\"}",
        ));

        let client = ApiClient::new(&socket);
        let err = client.configure_machine(1, 512).await.unwrap_err();
        match err {
            Error::Protocol { method, path, detail } => {
                assert_eq!(method, "PUT");
                assert_eq!(path, "/machine-config");
                assert!(detail.contains("400"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_unreachable_socket_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(dir.path().join("missing.sock"));
        let err = client.action(VmAction::SendCtrlAltDel).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
