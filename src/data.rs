//! Pre-tokenized data: shard reading and the rank-sharded batch walk.
//!
//! A shard is a flat stream of little-endian u16 token ids, optionally
//! gzip- or zstd-compressed. Rank r starts `r * batch * seq` tokens in
//! and every rank advances by the full cross-rank span, so the ranks
//! stream disjoint windows in lockstep and replay identically after a
//! reset.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use rand::Rng;
use tracing::info;

/// Opens a file, decompressing by extension (.gz, .gzip, .zst, .zstd).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match extension.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(file)),
        "zst" | "zstd" => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Reads a whole shard of little-endian u16 token ids.
pub fn read_tokens<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let mut reader = open_file(path)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .with_context(|| format!("reading {}", path.display()))?;
    ensure!(
        bytes.len().is_multiple_of(2),
        "token shard {} has an odd byte length {}",
        path.display(),
        bytes.len()
    );
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]) as u32)
        .collect())
}

#[derive(Debug)]
pub struct TokenLoader {
    tokens: Vec<u32>,
    batch_size: usize,
    seq_len: usize,
    rank: usize,
    world_size: usize,
    pos: usize,
}

impl TokenLoader {
    pub fn new<P: AsRef<Path>>(
        path: P,
        batch_size: usize,
        seq_len: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let tokens = read_tokens(&path)?;
        info!(
            "loaded {} tokens from {}",
            tokens.len(),
            path.as_ref().display()
        );
        Self::from_tokens(tokens, batch_size, seq_len, rank, world_size)
    }

    pub fn from_tokens(
        tokens: Vec<u32>,
        batch_size: usize,
        seq_len: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        ensure!(world_size > 0, "world_size must be positive");
        ensure!(
            rank < world_size,
            "rank {rank} out of range for world size {world_size}"
        );
        let needed = batch_size * seq_len * world_size + 1;
        ensure!(
            tokens.len() >= needed,
            "token stream holds {} tokens but one cross-rank batch needs {}",
            tokens.len(),
            needed
        );
        let mut loader = Self {
            tokens,
            batch_size,
            seq_len,
            rank,
            world_size,
            pos: 0,
        };
        loader.reset();
        Ok(loader)
    }

    /// Rewinds to this rank's start offset.
    pub fn reset(&mut self) {
        self.pos = self.rank * self.batch_size * self.seq_len;
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Next `(inputs, targets)` pair, targets shifted one token ahead.
    /// Wraps to the rank's start offset when the next cross-rank window
    /// would run past the stream.
    pub fn next_batch(&mut self, device: &Device) -> Result<(Tensor, Tensor)> {
        let span = self.batch_size * self.seq_len;
        let chunk = &self.tokens[self.pos..self.pos + span + 1];
        let inputs = Tensor::from_slice(&chunk[..span], (self.batch_size, self.seq_len), device)?;
        let targets = Tensor::from_slice(&chunk[1..], (self.batch_size, self.seq_len), device)?;
        self.pos += span * self.world_size;
        if self.pos + span * self.world_size + 1 > self.tokens.len() {
            self.reset();
        }
        Ok((inputs, targets))
    }
}

/// Uniform random batch, for smoke runs and tests.
pub fn random_batch(
    batch_size: usize,
    seq_len: usize,
    vocab_size: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut rng = rand::rng();
    let data: Vec<u32> = (0..batch_size * seq_len + 1)
        .map(|_| rng.random_range(0..vocab_size as u32))
        .collect();
    let span = batch_size * seq_len;
    let inputs = Tensor::from_slice(&data[..span], (batch_size, seq_len), device)?;
    let targets = Tensor::from_slice(&data[1..], (batch_size, seq_len), device)?;
    Ok((inputs, targets))
}
