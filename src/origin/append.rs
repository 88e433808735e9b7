use bytes::Bytes;
use tokio::task::JoinHandle;

/// One buffered range-write chunk of a multipart upload, with its byte
/// region already resolved against the contents at arrival time.
#[derive(Debug)]
pub struct AppendChunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub data: Bytes,
}

/// The chunks buffered for one multipart id, ordered by index, plus the
/// expiry timer armed when the first chunk arrived.
#[derive(Debug, Default)]
pub struct PendingUpload {
    timer: Option<JoinHandle<()>>,
    chunks: Vec<AppendChunk>,
}

impl PendingUpload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timer(&mut self, handle: JoinHandle<()>) {
        self.timer = Some(handle);
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Inserts a chunk keeping indices unique and ascending; a repeated
    /// index replaces the earlier chunk.
    pub fn store(&mut self, chunk: AppendChunk) {
        match self.chunks.binary_search_by_key(&chunk.index, |c| c.index) {
            Ok(pos) => self.chunks[pos] = chunk,
            Err(pos) => self.chunks.insert(pos, chunk),
        }
    }

    /// Aborting an already-finished timer task is a no-op, so cancellation
    /// is idempotent.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn into_chunks(mut self) -> Vec<AppendChunk> {
        self.cancel_timer();
        std::mem::take(&mut self.chunks)
    }

    #[cfg(test)]
    pub fn indices(&self) -> Vec<u32> {
        self.chunks.iter().map(|chunk| chunk.index).collect()
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Splices `data` into `contents` over the region `start..=end`. The
/// region classifies as interior replacement, tail overlap (old bytes past
/// the payload end are dropped), append at EOF, or append past EOF with a
/// zero-filled gap.
pub fn splice(contents: &mut Vec<u8>, start: u64, end: u64, data: &[u8]) {
    let start = start as usize;
    let region = (end - start as u64 + 1) as usize;
    let data = &data[..data.len().min(region)];
    let len = contents.len();
    if start > len {
        contents.resize(start, 0);
        contents.extend_from_slice(data);
    } else if start == len {
        contents.extend_from_slice(data);
    } else if start + data.len() >= len {
        contents.truncate(start);
        contents.extend_from_slice(data);
    } else {
        contents[start..start + data.len()].copy_from_slice(data);
    }
}
