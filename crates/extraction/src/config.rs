use std::path::PathBuf;

/// Static configuration for one extractor run. Deserializable from whatever
/// format the embedding binary prefers (TOML, YAML, env); this crate does not
/// parse CLI arguments or config files itself.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExtractorConfig {
    /// Directory queue state files (`%<name>.queue`) are read from and
    /// written to. `None` disables persistence entirely, which is only
    /// sensible for tests and one-shot backfills.
    pub dest_dir: Option<PathBuf>,

    /// Default row cap handed to `ExtractorQueue::new` for queues that don't
    /// override it.
    #[serde(default = "default_messages_per_batch")]
    pub messages_per_batch: u64,

    /// Dispatcher worker thread count.
    #[serde(default = "default_dispatcher_parallelism")]
    pub dispatcher_parallelism: usize,

    /// If set, a handler error aborts `flush()` instead of only being
    /// logged. Production backfills typically want this on; a long-running
    /// service ingesting best-effort telemetry may not.
    #[serde(default)]
    pub fatal_exceptions: bool,

    /// If set, queue state files are written with sorted keys and sorted
    /// per-timestamp hash lists, for byte-exact reproducible output (useful
    /// for snapshot testing and diffing state across runs).
    #[serde(default)]
    pub deterministic_output: bool,
}

fn default_messages_per_batch() -> u64 {
    1000
}

fn default_dispatcher_parallelism() -> usize {
    4
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            dest_dir: None,
            messages_per_batch: default_messages_per_batch(),
            dispatcher_parallelism: default_dispatcher_parallelism(),
            fatal_exceptions: false,
            deterministic_output: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let cfg: ExtractorConfig = serde_json::from_str(r#"{"dest_dir": "/var/lib/extract"}"#).unwrap();
        assert_eq!(cfg.messages_per_batch, 1000);
        assert_eq!(cfg.dispatcher_parallelism, 4);
        assert!(!cfg.fatal_exceptions);
        assert!(!cfg.deterministic_output);
        assert_eq!(cfg.dest_dir, Some(PathBuf::from("/var/lib/extract")));
    }
}
