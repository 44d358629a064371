use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, Mutex};

const RING_BUFFER_SIZE: usize = 64 * 1024;

/// Child output sink: a bounded in-memory tail, a live broadcast, and an
/// optional size-rotated log file.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	log_writer: Arc<Mutex<Option<LogWriter>>>,
	sender: broadcast::Sender<Vec<u8>>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	bytes_written: u64,
	max_size: u64,
}

impl OutputCapture {
	/// Memory-only capture.
	pub fn in_memory() -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
			log_writer: Arc::new(Mutex::new(None)),
			sender,
		}
	}

	/// Capture that also appends to `<log_dir>/<name>.log`.
	pub fn with_log_file(log_dir: &Path, name: &str, max_log_size: u64) -> Self {
		let capture = Self::in_memory();
		if let Err(e) = fs::create_dir_all(log_dir) {
			tracing::warn!("cannot create log dir {}: {}", log_dir.display(), e);
			return capture;
		}

		let path = log_dir.join(format!("{}.log", name));
		let file = open_append(&path);
		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		let writer = LogWriter {
			file,
			path,
			bytes_written,
			max_size: max_log_size,
		};
		Self {
			log_writer: Arc::new(Mutex::new(Some(writer))),
			..capture
		}
	}

	pub async fn write(&self, data: &[u8]) {
		{
			let mut ring = self.ring.lock().await;
			let overflow = (ring.len() + data.len()).saturating_sub(RING_BUFFER_SIZE);
			let n = overflow.min(ring.len());
			ring.drain(..n);
			let tail = &data[data.len().saturating_sub(RING_BUFFER_SIZE)..];
			ring.extend(tail);
		}

		if let Some(writer) = self.log_writer.lock().await.as_mut() {
			writer.write(data);
		}

		let _ = self.sender.send(data.to_vec());
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.sender.subscribe()
	}

	pub async fn log_path(&self) -> Option<PathBuf> {
		self.log_writer.lock().await.as_ref().map(|w| w.path.clone())
	}

	/// Copies everything from `reader` until EOF or a read error.
	pub async fn pipe_from<R: AsyncRead + Unpin>(&self, mut reader: R) {
		let mut buf = [0u8; 4096];
		loop {
			match reader.read(&mut buf).await {
				Ok(0) => break,
				Ok(n) => self.write(&buf[..n]).await,
				Err(_) => break,
			}
		}
	}
}

impl LogWriter {
	fn write(&mut self, data: &[u8]) {
		if let Some(ref mut file) = self.file {
			let _ = file.write_all(data);

			self.bytes_written += data.len() as u64;

			if self.max_size > 0 && self.bytes_written >= self.max_size {
				self.rotate();
			}
		}
	}

	// Keeps exactly one previous generation: `<name>.log.1`.
	fn rotate(&mut self) {
		drop(self.file.take());

		let mut rotated = self.path.clone().into_os_string();
		rotated.push(".1");
		let _ = fs::rename(&self.path, PathBuf::from(rotated));

		self.file = open_append(&self.path);
		self.bytes_written = 0;
	}
}

fn open_append(path: &Path) -> Option<File> {
	OpenOptions::new().create(true).append(true).open(path).ok()
}
