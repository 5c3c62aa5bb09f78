use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use csi_s3_types::error::Result;
use csi_s3_types::{DriverError, OptionsFrame, RedactedFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, info};

/// Receives exactly one [`OptionsFrame`] over the mount-options socket (C2, §4.2). Binds the
/// socket with permissions restricted to the pod's own uid, accepts a single connection within
/// `accept_timeout`, acks, then unlinks the socket — reconnection is deliberately unsupported.
pub async fn receive_options(socket_path: &Path, accept_timeout: Duration) -> Result<OptionsFrame> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| DriverError::Internal(format!("binding options socket {}: {e}", socket_path.display())))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| DriverError::Internal(format!("restricting options socket permissions: {e}")))?;

    let (mut stream, _addr) = tokio::time::timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| DriverError::Unavailable("no sender connected before accept timeout".to_owned()))?
        .map_err(|e| DriverError::Internal(format!("accepting options connection: {e}")))?;

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DriverError::Internal(format!("reading frame length: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| DriverError::Internal(format!("reading frame body: {e}")))?;

    let frame: OptionsFrame =
        serde_json::from_slice(&body).map_err(|e| DriverError::Internal(format!("decoding options frame: {e}")))?;

    stream
        .write_all(&[1])
        .await
        .map_err(|e| DriverError::Internal(format!("writing ack: {e}")))?;

    let _ = std::fs::remove_file(socket_path);
    debug!(frame = ?RedactedFrame(&frame), "options frame received");
    info!("options frame accepted, proceeding to exec");
    Ok(frame)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mount-options.sock");
        let socket_path_for_server = socket_path.clone();

        let server = tokio::spawn(async move {
            receive_options(&socket_path_for_server, Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let frame = OptionsFrame {
            argv: vec!["mount-s3".to_owned()],
            envp: HashMap::new(),
            credential_files: HashMap::new(),
            fs_group: String::new(),
            bucket_name: "my-bucket".to_owned(),
            source_path: "/mnt/source".to_owned(),
        };
        let payload = serde_json::to_vec(&frame).unwrap();
        client.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(&payload).await.unwrap();
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], 1);

        let received = server.await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn times_out_with_no_sender() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mount-options.sock");
        let result = receive_options(&socket_path, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
