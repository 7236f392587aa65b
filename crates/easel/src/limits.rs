//! Resource limits for sandboxed snippet execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to every sandbox invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Hard limit on the synchronous part of a snippet
    #[serde(with = "duration_ms")]
    pub script_timeout: Duration,
    /// Limit on the whole invocation, including every `await`
    #[serde(with = "duration_ms")]
    pub async_timeout: Duration,
    /// Largest delay `setTimeout` will honour; longer delays are clamped
    #[serde(with = "duration_ms")]
    pub max_timer_delay: Duration,
    /// Absolute timeout for a single `fetch`
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
    /// JavaScript heap limit in bytes
    pub max_memory_bytes: u64,
    /// JavaScript stack limit in bytes
    pub max_stack_bytes: u64,
    /// Cap on captured `log` output
    pub max_log_bytes: u64,
    /// Cap on a `fetch` response body
    pub max_fetch_bytes: u64,
    /// Cap on the text returned by `read("file:...")`
    pub max_read_bytes: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_secs(30),
            async_timeout: Duration::from_secs(120),
            max_timer_delay: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            max_memory_bytes: 256 * 1024 * 1024, // 256 MB
            max_stack_bytes: 1024 * 1024,        // 1 MB
            max_log_bytes: 64 * 1024,            // 64 KB
            max_fetch_bytes: 5 * 1024 * 1024,    // 5 MB
            max_read_bytes: 2 * 1024 * 1024,     // 2 MB
        }
    }
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Buffer that limits how much text can be captured
#[derive(Debug, Clone)]
pub struct LimitedBuffer {
    buffer: String,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    /// Create an empty buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append one line, truncating at a char boundary once the limit is hit.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }

        let needed = line.len() + 1;
        let remaining = self.limit.saturating_sub(self.buffer.len());
        if needed <= remaining {
            self.buffer.push_str(line);
            self.buffer.push('\n');
            return;
        }

        let mut cut = remaining.min(line.len());
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buffer.push_str(&line[..cut]);
        self.buffer.push_str("\n... [output truncated] ...\n");
        self.truncated = true;
    }

    /// Whether anything was dropped.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Captured text so far.
    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consume the buffer, returning the captured text.
    pub fn into_string(self) -> String {
        self.buffer
    }
}
