//! Drains a daemon's standard streams so full pipes never block it.
//!
//! Daemons may write non-UTF-8 bytes, so lines are read as bytes and decoded
//! lossily. Lines longer than [`MAX_LINE_BYTES`] are cut and the remainder
//! up to the next newline is dropped. The last lines of each stream are
//! retained for diagnostics.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::debug;

use super::OUTPUT_TARGET;

/// Longest output line kept, in bytes.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// Bounded buffer holding the most recent lines of one stream.
#[derive(Debug, Clone)]
pub(crate) struct OutputCapture {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputCapture {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn tail(&self, count: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// Spawns a thread that reads `stream` to EOF into `capture`.
pub(crate) fn spawn_drain<R>(
    stream: R,
    daemon_id: &str,
    stream_name: &'static str,
    capture: OutputCapture,
) -> std::io::Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let owner = daemon_id.to_owned();
    thread::Builder::new()
        .name(format!("corral-{stream_name}-{owner}"))
        .spawn(move || drain(stream, &owner, stream_name, &capture, MAX_LINE_BYTES))
}

fn drain<R: Read>(
    stream: R,
    daemon_id: &str,
    stream_name: &'static str,
    capture: &OutputCapture,
    limit: usize,
) {
    let mut reader = BufReader::new(stream);
    let cap = u64::try_from(limit).unwrap_or(u64::MAX);
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.by_ref().take(cap).read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let truncated = buf.last() != Some(&b'\n') && buf.len() >= limit;
                if truncated && let Err(error) = discard_rest_of_line(&mut reader) {
                    debug!(
                        target: OUTPUT_TARGET,
                        daemon_id,
                        stream = stream_name,
                        error = %error,
                        "output reader exiting after read error"
                    );
                    break;
                }
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                debug!(
                    target: OUTPUT_TARGET,
                    daemon_id,
                    stream = stream_name,
                    truncated,
                    "{line}"
                );
                capture.push(line);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                debug!(
                    target: OUTPUT_TARGET,
                    daemon_id,
                    stream = stream_name,
                    error = %error,
                    "output reader exiting after read error"
                );
                break;
            }
        }
    }
}

/// Skips bytes up to and including the next newline, or to EOF.
fn discard_rest_of_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(position) => {
                reader.consume(position.saturating_add(1));
                return Ok(());
            }
            None => {
                let skipped = available.len();
                reader.consume(skipped);
            }
        }
    }
}
