//! Bounded store for broker messages published while disconnected.
//!
//! Memory-only by default. With a directory configured, every stored message
//! is appended to `offline.jsonl` and the file is reloaded on open, so a
//! restart while offline does not lose the backlog. The file is rewritten
//! atomically from memory after drains and whenever appends outgrow it.
use crate::config::BufferCfg;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use weigh_traits::BrokerMessage;

pub const BUFFER_FILE: &str = "offline.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    topic: String,
    /// base64 so binary payloads survive the line format.
    payload: String,
    qos: u8,
    retain: bool,
}

impl From<&BrokerMessage> for StoredMessage {
    fn from(m: &BrokerMessage) -> Self {
        Self {
            topic: m.topic.clone(),
            payload: B64.encode(&m.payload),
            qos: m.qos,
            retain: m.retain,
        }
    }
}

impl StoredMessage {
    fn into_message(self) -> Option<BrokerMessage> {
        let payload = B64.decode(self.payload.as_bytes()).ok()?;
        Some(BrokerMessage::new(self.topic, payload, self.qos, self.retain))
    }
}

#[derive(Debug)]
pub struct OfflineBuffer {
    max_items: usize,
    items: VecDeque<BrokerMessage>,
    path: Option<PathBuf>,
    /// Lines in the file that are no longer in memory.
    stale_lines: usize,
    dropped: u64,
}

impl OfflineBuffer {
    pub fn in_memory(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            items: VecDeque::new(),
            path: None,
            stale_lines: 0,
            dropped: 0,
        }
    }

    /// Opens the buffer described by `cfg`, loading any persisted backlog.
    /// Malformed lines are skipped with a warning.
    pub fn open(cfg: &BufferCfg) -> std::io::Result<Self> {
        let mut buf = Self::in_memory(cfg.max_items);
        let Some(dir) = &cfg.dir else {
            return Ok(buf);
        };
        fs::create_dir_all(dir)?;
        let path = dir.join(BUFFER_FILE);
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredMessage>(&line)
                    .ok()
                    .and_then(StoredMessage::into_message)
                {
                    Some(msg) => {
                        buf.push_memory(msg);
                    }
                    None => tracing::warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        "skipping malformed offline buffer entry"
                    ),
                }
            }
            tracing::info!(file = %path.display(), items = buf.items.len(), "offline buffer loaded");
        }
        buf.path = Some(path);
        buf.compact();
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Messages evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn push_memory(&mut self, msg: BrokerMessage) -> bool {
        let mut evicted = false;
        while self.items.len() >= self.max_items {
            self.items.pop_front();
            self.dropped += 1;
            self.stale_lines += 1;
            evicted = true;
        }
        self.items.push_back(msg);
        evicted
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&mut self, msg: BrokerMessage) {
        let line = self.path.as_ref().map(|_| StoredMessage::from(&msg));
        if self.push_memory(msg) {
            tracing::warn!(max_items = self.max_items, "offline buffer full; dropped oldest message");
        }
        if let (Some(path), Some(line)) = (&self.path, line)
            && let Err(e) = append_line(path, &line)
        {
            tracing::warn!(file = %path.display(), error = %e, "offline buffer append failed");
        }
        if self.stale_lines >= self.max_items {
            self.compact();
        }
    }

    pub fn pop_front(&mut self) -> Option<BrokerMessage> {
        let msg = self.items.pop_front()?;
        self.stale_lines += 1;
        Some(msg)
    }

    /// Put a message back at the head after a failed publish.
    pub fn requeue_front(&mut self, msg: BrokerMessage) {
        self.items.push_front(msg);
        self.stale_lines = self.stale_lines.saturating_sub(1);
    }

    /// Put messages a lost session never confirmed back at the head, in
    /// send order, ahead of everything buffered since. Over capacity the
    /// oldest entries go first, as with `push`.
    pub fn requeue_unconfirmed(&mut self, msgs: Vec<BrokerMessage>) {
        if msgs.is_empty() {
            return;
        }
        for msg in msgs.into_iter().rev() {
            self.items.push_front(msg);
        }
        let mut evicted = 0u64;
        while self.items.len() > self.max_items {
            self.items.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.dropped += evicted;
            tracing::warn!(evicted, max_items = self.max_items, "offline buffer full; dropped oldest messages");
        }
        self.compact();
    }

    /// Rewrite the backing file from memory. No-op when memory-only.
    pub fn compact(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        let mut out = Vec::new();
        for m in &self.items {
            if serde_json::to_writer(&mut out, &StoredMessage::from(m)).is_ok() {
                out.push(b'\n');
            }
        }
        match write_atomic(path, &out) {
            Ok(()) => self.stale_lines = 0,
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "offline buffer compaction failed"),
        }
    }
}

fn append_line(path: &Path, msg: &StoredMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg).map_err(std::io::Error::other)?;
    line.push(b'\n');
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(&line)
}

/// Write to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}
