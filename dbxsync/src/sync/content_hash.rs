use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Block size used by the server when hashing file contents.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Incremental content hasher: SHA-256 of each 4 MiB block, then SHA-256 of
/// the concatenated block digests.
#[derive(Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    pub fn finish(mut self) -> String {
        if self.block_len > 0 {
            self.flush_block();
        }
        format!("{:x}", self.overall.finalize())
    }

    fn flush_block(&mut self) {
        let digest = std::mem::take(&mut self.block).finalize();
        self.overall.update(digest);
        self.block_len = 0;
    }
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish()
}

pub fn content_hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}
