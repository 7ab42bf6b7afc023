use super::backend::BackendOutput;
use super::buffer::BoundedBuffer;
use crate::events::{Event, EventBus, EventType};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

/// Everything an output reader needs besides the stream itself.
pub(crate) struct OutputReader {
    pub terminal_id: String,
    pub cwd: String,
    pub buffer: Arc<TokioMutex<BoundedBuffer>>,
    pub bus: Arc<EventBus>,
    pub chunk_size: usize,
    pub poll_interval: Duration,
}

impl OutputReader {
    /// Starts draining `output` until `stop` flips to true or the stream ends.
    pub(crate) fn spawn(self, output: BackendOutput, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = tracing::debug_span!("output_reader", terminal_id = %self.terminal_id);
        tokio::spawn(
            async move {
                if output.nonblocking {
                    self.run_nonblocking(output.reader, stop).await;
                } else {
                    self.run_blocking(output.reader, stop).await;
                }
            }
            .instrument(span),
        )
    }

    async fn run_nonblocking(self, mut reader: Box<dyn Read + Send>, mut stop: watch::Receiver<bool>) {
        let mut decoder = Utf8Stream::default();
        let mut buf = vec![0u8; self.chunk_size.max(1)];
        loop {
            if *stop.borrow() {
                debug!("Stop requested");
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("Output stream ended");
                    break;
                }
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    self.deliver(text).await;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_read_error(&e);
                    break;
                }
            }
        }
        self.deliver(decoder.finish()).await;
    }

    async fn run_blocking(self, reader: Box<dyn Read + Send>, mut stop: watch::Receiver<bool>) {
        let mut decoder = Utf8Stream::default();
        let mut state = Some((reader, vec![0u8; self.chunk_size.max(1)]));
        while let Some((mut reader, mut buf)) = state.take() {
            if *stop.borrow() {
                debug!("Stop requested");
                break;
            }
            let read = tokio::task::spawn_blocking(move || {
                let result = reader.read(&mut buf);
                (reader, buf, result)
            });
            tokio::select! {
                _ = stop.changed() => {
                    // The blocking read is left to finish on its own once the process goes away.
                    debug!("Stop requested during blocking read");
                    break;
                }
                joined = read => {
                    let (reader, buf, result) = match joined {
                        Ok(parts) => parts,
                        Err(e) => {
                            warn!(error = %e, "Blocking read task failed");
                            break;
                        }
                    };
                    match result {
                        Ok(0) => {
                            debug!("Output stream ended");
                            break;
                        }
                        Ok(n) => {
                            let text = decoder.decode(&buf[..n]);
                            self.deliver(text).await;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log_read_error(&e);
                            break;
                        }
                    }
                    state = Some((reader, buf));
                }
            }
        }
        self.deliver(decoder.finish()).await;
    }

    /// Publishes a `stdout` event, then appends to the buffer.
    async fn deliver(&self, text: String) {
        if text.is_empty() {
            return;
        }
        self.bus.publish(
            Event::new(self.terminal_id.clone(), EventType::Stdout)
                .with_text(text.clone())
                .with_cwd(self.cwd.clone()),
        );
        self.buffer.lock().await.append(&text);
    }
}

fn log_read_error(e: &io::Error) {
    // A pty master reports EIO once the shell side has closed.
    if e.raw_os_error() == Some(5) {
        debug!(error = %e, "Terminal closed");
    } else {
        warn!(error = %e, "Terminal read failed, stopping reader");
    }
}

/// Incremental UTF-8 decoder that carries split characters between reads.
#[derive(Debug, Default)]
pub(crate) struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut input: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            trace!(bytes = ?&rest[..bad], "Replacing invalid UTF-8 in terminal output");
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for the next read.
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }
        let carry = input.to_vec();
        self.pending = carry;
        out
    }

    /// Flushes a dangling partial sequence as a replacement character.
    pub(crate) fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        trace!(bytes = ?self.pending, "Dropping truncated UTF-8 at end of stream");
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_char_is_carried_over() {
        let mut dec = Utf8Stream::default();
        let bytes = "a→b".as_bytes();
        assert_eq!(dec.decode(&bytes[..2]), "a");
        assert_eq!(dec.decode(&bytes[2..]), "→b");
        assert_eq!(dec.finish(), "");
    }

    #[test]
    fn invalid_bytes_become_replacement_chars() {
        let mut dec = Utf8Stream::default();
        assert_eq!(dec.decode(b"ok\xffthen\xc3("), "ok\u{FFFD}then\u{FFFD}(");
    }

    #[test]
    fn truncated_tail_is_flushed_on_finish() {
        let mut dec = Utf8Stream::default();
        assert_eq!(dec.decode(&[b'x', 0xe2, 0x86]), "x");
        assert_eq!(dec.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn reader_publishes_then_buffers_until_eof() {
        let bus = Arc::new(EventBus::new(100, None));
        let buffer = Arc::new(TokioMutex::new(BoundedBuffer::new(1000)));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let reader = OutputReader {
            terminal_id: "t1".into(),
            cwd: "/tmp".into(),
            buffer: Arc::clone(&buffer),
            bus: Arc::clone(&bus),
            chunk_size: 4,
            poll_interval: Duration::from_millis(5),
        };
        let output = BackendOutput {
            reader: Box::new(io::Cursor::new(b"hello world\n".to_vec())),
            nonblocking: true,
        };
        reader.spawn(output, stop_rx).await.unwrap();

        assert_eq!(buffer.lock().await.snapshot(None), "hello world\n");
        let page = bus.query(&Default::default());
        assert_eq!(page.count, 3);
        assert!(page.events.iter().all(|e| e.kind == EventType::Stdout && e.cwd.as_deref() == Some("/tmp")));
    }

    #[tokio::test]
    async fn stop_signal_ends_an_idle_reader() {
        struct Idle;
        impl Read for Idle {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let reader = OutputReader {
            terminal_id: "t1".into(),
            cwd: "/tmp".into(),
            buffer: Arc::new(TokioMutex::new(BoundedBuffer::new(10))),
            bus: Arc::new(EventBus::new(10, None)),
            chunk_size: 16,
            poll_interval: Duration::from_secs(30),
        };
        let handle = reader.spawn(
            BackendOutput {
                reader: Box::new(Idle),
                nonblocking: true,
            },
            stop_rx,
        );
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader should stop promptly")
            .unwrap();
    }
}
