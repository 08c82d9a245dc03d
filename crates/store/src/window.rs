use perch_core::config::WindowConfig;

/// Per-chat bounded list of message IDs, oldest first.
///
/// Appends are unbounded until [`trim`](Self::trim) runs; once the list has
/// grown past `cap`, trimming keeps only the `keep` newest entries. Trimming
/// once per event rather than per append gives bursts headroom before the
/// oldest entries go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisWindow {
    cap: usize,
    keep: usize,
}

impl HysteresisWindow {
    pub const MESSAGES: HysteresisWindow = HysteresisWindow { cap: 20, keep: 15 };
    pub const QUOTED: HysteresisWindow = HysteresisWindow { cap: 30, keep: 20 };

    pub fn new(cap: usize, keep: usize) -> Self {
        let keep = keep.clamp(1, cap.max(1));
        Self { cap: cap.max(keep), keep }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Append `id` unless already present. Returns whether it was added.
    pub fn append(&self, entries: &mut Vec<String>, id: &str) -> bool {
        if entries.iter().any(|entry| entry == id) {
            return false;
        }
        entries.push(id.to_string());
        true
    }

    /// Trim to the newest `keep` entries if `cap` is exceeded. Returns the
    /// evicted IDs, oldest first.
    pub fn trim(&self, entries: &mut Vec<String>) -> Vec<String> {
        if entries.len() <= self.cap {
            return Vec::new();
        }
        let excess = entries.len() - self.keep;
        entries.drain(..excess).collect()
    }
}

impl From<WindowConfig> for HysteresisWindow {
    fn from(config: WindowConfig) -> Self {
        Self::new(config.cap, config.keep)
    }
}
