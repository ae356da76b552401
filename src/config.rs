/// Configuration for an index instance.
///
/// `log_size` is expressed in entries, not bytes; the byte budget of the
/// log file is `log_size * entry_size` for the instantiated key/value types.
#[derive(Debug, Clone)]
pub struct Config {
    /// Soft bound on the log file, in entries. Exceeding the bound on a
    /// write triggers a merge after the write has been appended.
    pub log_size: usize,

    /// Open as a read-only observer (default: false).
    pub readonly: bool,

    /// Truncate any existing data on open (default: false).
    pub fresh: bool,
}

impl Config {
    /// Create a new config with the given log budget in entries.
    pub fn new(log_size: usize) -> Self {
        Self {
            log_size,
            readonly: false,
            fresh: false,
        }
    }

    /// Open as a read-only observer.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Truncate any existing data on open.
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// The log byte budget for the given entry size.
    pub(crate) fn log_size_bytes(&self, entry_size: usize) -> u64 {
        (self.log_size * entry_size) as u64
    }
}
