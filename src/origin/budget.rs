use thiserror::Error;

#[derive(Debug, Error)]
#[error("admitting {requested} bytes would exceed the {limit} byte ceiling ({in_use} in use)")]
pub struct WouldExceed {
    pub requested: u64,
    pub in_use: u64,
    pub limit: u64,
}

/// Tracks the bytes held in memory across all file records and enforces
/// the optional global ceiling. Admission is all-or-nothing: a candidate
/// that would push usage past the ceiling is refused before any state
/// changes, so usage never transiently overshoots.
#[derive(Debug)]
pub struct SizeBudget {
    limit: Option<u64>,
    in_use: u64,
}

impl SizeBudget {
    pub fn new(limit_kib: Option<u64>) -> Self {
        Self {
            limit: limit_kib.map(|kib| kib.saturating_mul(1024)),
            in_use: 0,
        }
    }

    pub fn in_use(&self) -> u64 {
        self.in_use
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Admits a replacement of `old_size` bytes with `new_size` bytes,
    /// updating usage on success.
    pub fn admit(&mut self, old_size: u64, new_size: u64) -> Result<(), WouldExceed> {
        let prospective = self.in_use.saturating_sub(old_size).saturating_add(new_size);
        if let Some(limit) = self.limit
            && prospective > limit
        {
            return Err(WouldExceed {
                requested: new_size,
                in_use: self.in_use,
                limit,
            });
        }
        self.in_use = prospective;
        Ok(())
    }

    pub fn release(&mut self, size: u64) {
        self.in_use = self.in_use.saturating_sub(size);
    }

    pub fn reset(&mut self) {
        self.in_use = 0;
    }
}
