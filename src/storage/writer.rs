use crate::error::{BittorrentError, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// One write for the filesystem writer.
#[derive(Debug)]
struct WriteTask {
    file_name: String,
    data: Vec<u8>,
    offset: u64,
    /// Replace the file contents instead of patching a range.
    truncate: bool,
    /// Receives the outcome once the bytes are on disk.
    done: Option<oneshot::Sender<std::io::Result<()>>>,
}

/// Handle to the background task that places bytes into files under `root`.
#[derive(Debug, Clone)]
pub struct FsWriter {
    root: PathBuf,
    tx: mpsc::Sender<WriteTask>,
}

impl FsWriter {
    /// Start the writer. It runs until every handle is dropped.
    pub fn spawn<P: AsRef<Path>>(root: P, queue: usize) -> (Self, JoinHandle<()>) {
        let root = root.as_ref().to_path_buf();
        let (tx, mut rx) = mpsc::channel::<WriteTask>(queue.max(1));

        let task_root = root.clone();
        let task = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let outcome = write_task(&task_root, &task).await;
                if let Err(e) = &outcome {
                    error!("Error writing to file {}: {}", task.file_name, e);
                } else {
                    debug!(
                        "Wrote {} bytes to file {} starting from {}",
                        task.data.len(),
                        task.file_name,
                        task.offset
                    );
                }
                if let Some(done) = task.done {
                    let _ = done.send(outcome);
                }
            }
        });

        (Self { root, tx }, task)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn submit(&self, task: WriteTask) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| BittorrentError::Storage("filesystem writer stopped".to_string()))
    }

    /// Write `data` at `offset` and wait until it has landed.
    pub async fn write(&self, file_name: &str, data: Vec<u8>, offset: u64) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(WriteTask {
            file_name: file_name.to_string(),
            data,
            offset,
            truncate: false,
            done: Some(done_tx),
        })
        .await?;

        done_rx
            .await
            .map_err(|_| BittorrentError::Storage("filesystem writer dropped a task".to_string()))?
            .map_err(BittorrentError::from)
    }

    /// Queue a whole-file dump without waiting for it.
    pub async fn dump(&self, file_name: String, data: Vec<u8>) -> Result<()> {
        self.submit(WriteTask {
            file_name,
            data,
            offset: 0,
            truncate: true,
            done: None,
        })
        .await
    }
}

async fn write_task(root: &Path, task: &WriteTask) -> std::io::Result<()> {
    let path = root.join(&task.file_name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(task.truncate)
        .open(&path)
        .await?;

    file.seek(std::io::SeekFrom::Start(task.offset)).await?;
    file.write_all(&task.data).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_dir;

    #[tokio::test]
    async fn test_writes_land_at_offsets() {
        let root = test_dir("writer");
        let (writer, _task) = FsWriter::spawn(&root, 4);

        writer.write("movie.bin", vec![2u8; 4], 4).await.unwrap();
        writer.write("movie.bin", vec![1u8; 4], 0).await.unwrap();
        writer.write("movie.bin", vec![1u8; 4], 0).await.unwrap();

        let content = tokio::fs::read(root.join("movie.bin")).await.unwrap();
        assert_eq!(content, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_dump_replaces_file() {
        let root = test_dir("writer-dump");
        let (writer, task) = FsWriter::spawn(&root, 4);

        writer.dump("piece_1_failed_buf".to_string(), vec![9u8; 8]).await.unwrap();
        writer.dump("piece_1_failed_buf".to_string(), vec![7u8; 2]).await.unwrap();
        drop(writer);
        task.await.unwrap();

        let content = tokio::fs::read(root.join("piece_1_failed_buf")).await.unwrap();
        assert_eq!(content, vec![7u8; 2]);
    }
}
