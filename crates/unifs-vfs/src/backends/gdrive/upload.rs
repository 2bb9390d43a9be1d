//! Writer side of a Drive upload.
//!
//! The caller writes into a bounded channel; an uploader task drains it as
//! the request body. A full channel makes `poll_write` pend until the
//! uploader catches up. The upload's outcome is reported on `shutdown`.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

use super::api::{ByteStream, DriveApi, DriveFile, UploadTarget};
use crate::error::VfsResult;

/// `AsyncWrite` feeding an uploader task.
pub struct UploadWriter {
    sink: PollSender<Bytes>,
    outcome: Option<oneshot::Receiver<VfsResult<DriveFile>>>,
    /// Kept so a failure seen by `poll_write` is reported again on shutdown.
    failure: Option<(io::ErrorKind, String)>,
}

/// Start an upload and return the writer feeding it.
pub fn spawn_upload(api: Arc<dyn DriveApi>, target: UploadTarget, capacity: usize) -> UploadWriter {
    let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));
    let (done_tx, done_rx) = oneshot::channel();

    let body: ByteStream = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    }));
    tokio::spawn(async move {
        let result = api.upload(target, body).await;
        if let Err(e) = &result {
            warn!(error = %e, "drive upload failed");
        }
        // The writer may have been dropped without shutdown.
        let _ = done_tx.send(result);
    });

    UploadWriter {
        sink: PollSender::new(tx),
        outcome: Some(done_rx),
        failure: None,
    }
}

impl UploadWriter {
    /// The uploader stopped reading: report why.
    fn poll_failure(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if let Some((kind, msg)) = &self.failure {
            return Poll::Ready(io::Error::new(*kind, msg.clone()));
        }
        let err = match self.outcome.as_mut() {
            Some(outcome) => match ready!(Pin::new(outcome).poll(cx)) {
                Ok(Err(e)) => e.into(),
                Ok(Ok(_)) => {
                    io::Error::new(io::ErrorKind::BrokenPipe, "upload finished before the writer")
                }
                Err(_) => {
                    io::Error::new(io::ErrorKind::BrokenPipe, "upload task ended without a result")
                }
            },
            None => io::Error::new(io::ErrorKind::BrokenPipe, "upload already finished"),
        };
        self.outcome = None;
        self.failure = Some((err.kind(), err.to_string()));
        Poll::Ready(err)
    }
}

impl AsyncWrite for UploadWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = &mut *self;
        if ready!(this.sink.poll_reserve(cx)).is_err() {
            return this.poll_failure(cx).map(Err);
        }
        if this.sink.send_item(Bytes::copy_from_slice(buf)).is_err() {
            return this.poll_failure(cx).map(Err);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.sink.close();
        if let Some((kind, msg)) = &this.failure {
            return Poll::Ready(Err(io::Error::new(*kind, msg.clone())));
        }
        let Some(outcome) = this.outcome.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(outcome).poll(cx));
        this.outcome = None;
        match result {
            Ok(Ok(file)) => {
                debug!(id = %file.id, "upload committed");
                Poll::Ready(Ok(()))
            }
            Ok(Err(e)) => Poll::Ready(Err(e.into())),
            Err(_) => Poll::Ready(Err(io::Error::other("upload task ended without a result"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::gdrive::memory::MemoryDrive;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn bytes_arrive_after_shutdown() {
        let drive = MemoryDrive::new();
        let mut writer = spawn_upload(
            Arc::new(drive.clone()),
            UploadTarget::New {
                parent: "root".into(),
                name: "out.txt".into(),
            },
            2,
        );
        for chunk in [&b"one "[..], b"two ", b"three"] {
            writer.write_all(chunk).await.unwrap();
        }
        writer.shutdown().await.unwrap();
        let file = drive.find("out.txt").unwrap();
        assert_eq!(drive.content(&file.id).unwrap(), b"one two three");
        assert_eq!(file.size, Some(13));
    }

    #[tokio::test]
    async fn full_channel_applies_backpressure() {
        let drive = MemoryDrive::new();
        drive.hold_uploads();
        let mut writer = spawn_upload(
            Arc::new(drive.clone()),
            UploadTarget::New {
                parent: "root".into(),
                name: "slow.bin".into(),
            },
            2,
        );
        writer.write_all(b"a").await.unwrap();
        writer.write_all(b"b").await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), writer.write_all(b"c")).await;
        assert!(blocked.is_err(), "third chunk should wait for the uploader");

        drive.release_uploads();
        writer.write_all(b"c").await.unwrap();
        writer.shutdown().await.unwrap();
        let file = drive.find("slow.bin").unwrap();
        assert_eq!(drive.content(&file.id).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn upload_errors_surface_on_shutdown() {
        let drive = MemoryDrive::new();
        let mut writer = spawn_upload(
            Arc::new(drive.clone()),
            UploadTarget::New {
                parent: "no-such-folder".into(),
                name: "x".into(),
            },
            4,
        );
        // Writes may succeed or fail depending on when the uploader gives up.
        let _ = writer.write_all(b"data").await;
        let err = writer.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
