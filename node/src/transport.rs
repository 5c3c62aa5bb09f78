use std::path::Path;
use std::time::Duration;

use csi_s3_types::error::Result;
use csi_s3_types::{DriverError, OptionsFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Sends one [`OptionsFrame`] over the mounter pod's options socket (C2, §4.2) and waits for its
/// single-byte ack. The socket path is the host-side bind mount of the pod's `/tmp`, i.e.
/// `<plugin_root_dir>/mnt/<pod_name>/mount-options.sock` is not used directly here — callers pass
/// whatever path they resolved the pod's socket volume to on the host.
pub async fn send_options(socket_path: &Path, frame: &OptionsFrame, accept_timeout: Duration) -> Result<()> {
    let payload = serde_json::to_vec(frame)
        .map_err(|e| DriverError::Internal(format!("encoding options frame: {e}")))?;

    let mut stream = tokio::time::timeout(accept_timeout, connect_with_retry(socket_path))
        .await
        .map_err(|_| DriverError::Unavailable(format!("mounter options socket {} never appeared", socket_path.display())))??;

    let len = u32::try_from(payload.len())
        .map_err(|_| DriverError::Internal("options frame too large to frame".to_owned()))?;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| DriverError::Unavailable(format!("writing frame length: {e}")))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| DriverError::Unavailable(format!("writing frame body: {e}")))?;

    let mut ack = [0u8; 1];
    stream
        .read_exact(&mut ack)
        .await
        .map_err(|e| DriverError::Unavailable(format!("reading ack: {e}")))?;
    if ack[0] != 1 {
        return Err(DriverError::Internal(format!("mounter rejected options frame (ack byte {})", ack[0])));
    }

    debug!(socket = %socket_path.display(), "options frame delivered");
    Ok(())
}

async fn connect_with_retry(socket_path: &Path) -> Result<UnixStream> {
    const RETRY_INTERVAL: Duration = Duration::from_millis(250);
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(RETRY_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn delivers_a_frame_and_reads_the_ack() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mount-options.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            stream.write_all(&[1]).await.unwrap();
            body
        });

        let frame = OptionsFrame {
            argv: vec!["mount-s3".to_owned(), "my-bucket".to_owned()],
            envp: HashMap::new(),
            credential_files: HashMap::new(),
            fs_group: String::new(),
            bucket_name: "my-bucket".to_owned(),
            source_path: "/mnt/source".to_owned(),
        };

        send_options(&socket_path, &frame, Duration::from_secs(2)).await.unwrap();
        let received = server.await.unwrap();
        let decoded: OptionsFrame = serde_json::from_slice(&received).unwrap();
        assert_eq!(decoded, frame);
    }
}
