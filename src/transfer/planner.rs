//! Chunk planning / 分片规划
//!
//! Pure and deterministic: the same inputs always yield the same plan, so a
//! plan recomputed after session renewal keeps the original part numbering.

use serde::{Deserialize, Serialize};

use crate::error::{TransferError, TransferResult};

const MIB: u64 = 1024 * 1024;

/// Part-size ladder used by Open-API style drives: 20MB default, then
/// sizes that split 128GB..1TB files into at most 10,000 parts, then 5GB.
/// 分片阶梯
pub const PART_SIZE_LADDER: [u64; 7] = [
    20 * MIB,
    27_487_791,  // ≈26.2MB, >128GB
    41_231_687,  // ≈39.3MB, >256GB
    54_975_582,  // ≈52.4MB, >384GB
    82_463_373,  // ≈78.6MB, >512GB
    109_951_163, // ≈104.9MB, >768GB
    5 * 1024 * MIB,
];

/// How the chunk size grows when the count ceiling is exceeded / 分片增长方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkGrowth {
    Doubling,
    /// Ascending list of allowed sizes / 升序的可选大小
    Ladder(Vec<u64>),
}

impl ChunkGrowth {
    pub fn ladder() -> Self {
        Self::Ladder(PART_SIZE_LADDER.to_vec())
    }

    /// Next candidate size strictly above `current` / 下一个候选大小
    fn next(&self, current: u64, cap: u64) -> u64 {
        let next = match self {
            Self::Doubling => current.saturating_mul(2),
            Self::Ladder(steps) => steps.iter().copied().find(|s| *s > current).unwrap_or(cap),
        };
        next.min(cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConstraints {
    pub min_chunk: u64,
    pub max_chunk_size: u64,
    pub max_chunk_count: usize,
    pub growth: ChunkGrowth,
}

impl PlanConstraints {
    pub fn new(min_chunk: u64, max_chunk_size: u64, max_chunk_count: usize) -> Self {
        Self {
            min_chunk,
            max_chunk_size,
            max_chunk_count,
            growth: ChunkGrowth::Doubling,
        }
    }

    pub fn with_growth(mut self, growth: ChunkGrowth) -> Self {
        self.growth = growth;
        self
    }
}

/// One contiguous byte range of the file / 分片
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

impl Chunk {
    /// 1-based part number used on the wire / 分片编号（从1开始）
    ///
    /// `plan` refuses plans with more than `u32::MAX` parts.
    pub fn part_number(&self) -> u32 {
        u32::try_from(self.index + 1).unwrap_or(u32::MAX)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<Chunk>,
}

impl TransferPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn part_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks.iter().map(Chunk::part_number)
    }
}

/// Split `size` bytes into an ordered chunk list / 计算分片
pub fn plan(size: u64, constraints: &PlanConstraints) -> TransferResult<TransferPlan> {
    if constraints.min_chunk == 0 {
        return Err(TransferError::InvalidPlan("min_chunk must be > 0".into()));
    }
    if constraints.max_chunk_count == 0 {
        return Err(TransferError::InvalidPlan("max_chunk_count must be > 0".into()));
    }

    let cap = constraints.max_chunk_size.max(constraints.min_chunk);
    let max_count = constraints.max_chunk_count as u64;
    let mut chunk_size = constraints.min_chunk;

    while size.div_ceil(chunk_size) > max_count {
        if chunk_size >= cap {
            return Err(TransferError::InvalidPlan(format!(
                "{} bytes need more than {} chunks even at {} bytes per chunk",
                size, max_count, cap
            )));
        }
        chunk_size = constraints.growth.next(chunk_size, cap);
    }

    let count = size.div_ceil(chunk_size);
    if u32::try_from(count).is_err() {
        return Err(TransferError::InvalidPlan(format!(
            "{} chunks exceed the part number range",
            count
        )));
    }
    let count = count as usize;
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0u64;
    for index in 0..count {
        let length = chunk_size.min(size - offset);
        chunks.push(Chunk { index, offset, length });
        offset += length;
    }

    Ok(TransferPlan {
        total_size: size,
        chunk_size,
        chunks,
    })
}
