//! Streaming whole-file SHA-256 with an optional per-block SHA-1 signature.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Default read buffer for the hash loop.
pub const READ_BUF: usize = 64 * 1024;
/// Default rollover size for signature blocks.
pub const SIGNATURE_BLOCK: usize = 16 * 1024;

/// Text encoding of digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestEncoding {
    #[default]
    Hex,
    Base64,
}

impl DigestEncoding {
    fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(bytes),
            Self::Base64 => BASE64.encode(bytes),
        }
    }
}

/// Options for `hash_reader`/`hash_file`.
#[derive(Debug, Clone)]
pub struct HashOptions {
    pub encoding: DigestEncoding,
    /// Also compute per-block SHA-1 checksums.
    pub signature: bool,
    /// Signature rollover size in bytes.
    pub block_size: usize,
    pub buffer_size: usize,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            encoding: DigestEncoding::Hex,
            signature: false,
            block_size: SIGNATURE_BLOCK,
            buffer_size: READ_BUF,
        }
    }
}

/// One rolled block of a signature stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub offset: u64,
    pub size: u64,
    pub checksum: String,
}

/// Result of hashing one stream.
#[derive(Debug, Clone)]
pub struct HashOutput {
    pub digest: String,
    pub size: u64,
    pub signature: Option<Vec<SignatureBlock>>,
}

struct SignatureState {
    sha: Sha1,
    block_size: u64,
    start: u64,
    len: u64,
    encoding: DigestEncoding,
    blocks: Vec<SignatureBlock>,
}

impl SignatureState {
    fn new(block_size: usize, encoding: DigestEncoding) -> Self {
        Self {
            sha: Sha1::new(),
            block_size: block_size.max(1) as u64,
            start: 0,
            len: 0,
            encoding,
            blocks: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = usize::try_from(self.block_size - self.len).unwrap_or(usize::MAX);
            let take = room.min(data.len());
            self.sha.update(&data[..take]);
            self.len += take as u64;
            data = &data[take..];
            if self.len == self.block_size {
                self.roll();
            }
        }
    }

    fn roll(&mut self) {
        let sum = std::mem::replace(&mut self.sha, Sha1::new()).finalize();
        self.blocks.push(SignatureBlock {
            offset: self.start,
            size: self.len,
            checksum: self.encoding.encode(&sum),
        });
        self.start += self.len;
        self.len = 0;
    }

    fn finish(mut self) -> Vec<SignatureBlock> {
        // The final incomplete block, if non-empty, is also emitted.
        if self.len > 0 {
            self.roll();
        }
        self.blocks
    }
}

/// Hash a stream the caller owns; the reader is left open.
///
/// # Errors
/// Returns any read error.
pub fn hash_reader<R: Read + ?Sized>(reader: &mut R, opts: &HashOptions) -> io::Result<HashOutput> {
    let mut sha = Sha256::new();
    let mut sig = opts.signature.then(|| SignatureState::new(opts.block_size, opts.encoding));
    let mut buf = vec![0u8; opts.buffer_size.max(1)];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
        if let Some(state) = sig.as_mut() {
            state.update(&buf[..n]);
        }
        size += n as u64;
    }
    Ok(HashOutput {
        digest: opts.encoding.encode(&sha.finalize()),
        size,
        signature: sig.map(SignatureState::finish),
    })
}

/// Hash a file by path; the file is opened and closed internally.
///
/// # Errors
/// Returns any open or read error.
pub fn hash_file(path: &Path, opts: &HashOptions) -> io::Result<HashOutput> {
    let mut reader = BufReader::new(File::open(path)?);
    hash_reader(&mut reader, opts)
}
