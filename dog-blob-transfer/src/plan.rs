//! Chunk planning: decides between a single-shot put and a block partition.
//!
//! Planning is pure. Nothing here touches the network, so every
//! configuration problem surfaces before the first request is built.

use crate::config::{MAX_PAGE_WRITE_SIZE, PAGE_SIZE};
use crate::{BlockId, TransferConfig, TransferError, TransferResult};

/// One contiguous byte range of the payload, transferred independently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub offset: u64,
    pub length: u32,
}

impl Block {
    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// Ordered, immutable partition of a payload
#[derive(Debug, Clone)]
pub struct TransferPlan {
    total_size: u64,
    block_size: u64,
    single_shot: bool,
    blocks: Vec<Block>,
}

impl TransferPlan {
    /// Whole payload in one request; no block list, no commit step
    pub fn is_single_shot(&self) -> bool {
        self.single_shot
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Nominal block size (the last block may be shorter)
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Blocks in offset order. Empty for single-shot plans.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block ids in commit order
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id.clone()).collect()
    }
}

/// Plan an upload of `total_size` bytes from a source that can be read in one pass.
pub fn plan(total_size: u64, config: &TransferConfig) -> TransferResult<TransferPlan> {
    config.validate()?;
    if total_size <= config.max_single_upload_size {
        return Ok(TransferPlan {
            total_size,
            block_size: total_size,
            single_shot: true,
            blocks: Vec::new(),
        });
    }
    plan_blocks(total_size, config)
}

/// Plan a block partition regardless of the single-shot threshold.
pub fn plan_blocks(total_size: u64, config: &TransferConfig) -> TransferResult<TransferPlan> {
    config.validate()?;
    let block_size = resolve_block_size(total_size, config)?;
    partition(total_size, block_size)
}

/// Plan page writes for a page blob. Both sizes must be 512-byte aligned.
pub fn plan_pages(total_size: u64, page_write_size: u64) -> TransferResult<TransferPlan> {
    if total_size % PAGE_SIZE != 0 {
        return Err(TransferError::configuration(format!(
            "page blob size {} is not a multiple of {}",
            total_size, PAGE_SIZE
        )));
    }
    if page_write_size == 0 || page_write_size % PAGE_SIZE != 0 || page_write_size > MAX_PAGE_WRITE_SIZE {
        return Err(TransferError::configuration(format!(
            "page write size {} must be a non-zero multiple of {} up to {}",
            page_write_size, PAGE_SIZE, MAX_PAGE_WRITE_SIZE
        )));
    }
    partition(total_size, page_write_size)
}

/// Pick the block size for `total_size`, honoring an explicit choice
/// and the block-count and service ceilings.
pub fn resolve_block_size(total_size: u64, config: &TransferConfig) -> TransferResult<u64> {
    let max_block_size = config.service_version.max_block_size();
    let max_count = config.max_block_count as u64;

    let ceiling = max_block_size.saturating_mul(max_count);
    if total_size > ceiling {
        return Err(TransferError::configuration(format!(
            "payload of {} bytes exceeds the service ceiling of {} bytes",
            total_size, ceiling
        )));
    }

    // Unset: spread the payload over the concurrency target, then grow
    // only as far as the block-count limit demands.
    let block_size = match config.block_size {
        Some(size) => size,
        None => total_size
            .div_ceil(config.max_concurrency as u64)
            .clamp(1, max_block_size)
            .max(total_size.div_ceil(max_count))
            .min(max_block_size),
    };

    if block_size.saturating_mul(max_count) < total_size {
        return Err(TransferError::configuration(format!(
            "block size {} x {} blocks cannot hold {} bytes",
            block_size, max_count, total_size
        )));
    }
    Ok(block_size)
}

fn partition(total_size: u64, block_size: u64) -> TransferResult<TransferPlan> {
    if block_size == 0 {
        return Err(TransferError::configuration("block size must be at least 1 byte"));
    }
    let count = total_size.div_ceil(block_size);
    let mut blocks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    while offset < total_size {
        let length = block_size.min(total_size - offset);
        let length = u32::try_from(length).map_err(|_| {
            TransferError::configuration(format!("block of {} bytes does not fit a block length", length))
        })?;
        blocks.push(Block {
            id: BlockId::new(),
            offset,
            length,
        });
        offset += length as u64;
    }

    Ok(TransferPlan {
        total_size,
        block_size,
        single_shot: false,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceVersion;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_contiguous(plan: &TransferPlan) {
        let mut expected = 0u64;
        for block in plan.blocks() {
            assert_eq!(block.offset, expected);
            assert!(block.length >= 1);
            assert!(block.length as u64 <= plan.block_size());
            expected = block.end();
        }
        assert_eq!(expected, plan.total_size());
    }

    #[test]
    fn ten_mib_is_single_shot_with_default_threshold() {
        let plan = plan(10 * MIB, &TransferConfig::default()).unwrap();
        assert!(plan.is_single_shot());
        assert!(plan.blocks().is_empty());
    }

    #[test]
    fn exact_block_size_yields_one_block() {
        let config = TransferConfig::new().with_block_size(2500 * MIB);
        let plan = plan(2500 * MIB, &config).unwrap();
        assert!(!plan.is_single_shot());
        assert_eq!(plan.block_count(), 1);
        assert_eq!(plan.blocks()[0].length as u64, 2500 * MIB);
    }

    #[test]
    fn tail_becomes_final_block() {
        let config = TransferConfig::new().with_block_size(2500 * MIB);
        let plan = plan(2501 * MIB, &config).unwrap();
        let lengths: Vec<u64> = plan.blocks().iter().map(|b| b.length as u64).collect();
        assert_eq!(lengths, vec![2500 * MIB, MIB]);
        assert_eq!(plan.block_ids()[0], plan.blocks()[0].id);
        assert_contiguous(&plan);
    }

    #[test]
    fn too_small_block_size_is_rejected() {
        let config = TransferConfig::new()
            .with_block_size(1)
            .with_max_block_count(4)
            .with_max_single_upload_size(0);
        assert!(matches!(plan(5, &config), Err(TransferError::Configuration { .. })));
        assert_eq!(plan(4, &config).unwrap().block_count(), 4);
    }

    #[test]
    fn payload_above_service_ceiling_is_rejected() {
        let config = TransferConfig::new()
            .with_service_version(ServiceVersion::V2016_05_31)
            .with_max_block_count(2);
        let err = plan_blocks(200 * MIB + 1, &config).unwrap_err();
        assert!(err.to_string().contains("service ceiling"));
    }

    #[test]
    fn default_block_size_spreads_over_concurrency() {
        let config = TransferConfig::default();
        assert_eq!(resolve_block_size(100 * MIB, &config).unwrap(), 13_107_200);
        assert_eq!(resolve_block_size(3, &config).unwrap(), 1);
        assert_eq!(resolve_block_size(0, &config).unwrap(), 1);

        let plan = plan_blocks(100 * MIB, &config).unwrap();
        assert_eq!(plan.block_count(), 8);
        assert_contiguous(&plan);
    }

    #[test]
    fn default_block_size_grows_to_fit_block_count() {
        let config = TransferConfig::new().with_max_concurrency(100).with_max_block_count(10);
        assert_eq!(resolve_block_size(100 * MIB, &config).unwrap(), 10 * MIB);

        let wide = TransferConfig::new().with_max_concurrency(2).with_max_block_count(10);
        assert_eq!(resolve_block_size(100 * MIB, &wide).unwrap(), 50 * MIB);
    }

    #[test]
    fn default_block_size_is_bounded_by_service_version() {
        let config = TransferConfig::new()
            .with_service_version(ServiceVersion::V2016_05_31)
            .with_max_concurrency(1);
        assert_eq!(resolve_block_size(1000 * MIB, &config).unwrap(), 100 * MIB);
    }

    #[test]
    fn empty_payload_forced_to_blocks_has_no_blocks() {
        let plan = plan_blocks(0, &TransferConfig::default()).unwrap();
        assert!(!plan.is_single_shot());
        assert_eq!(plan.block_count(), 0);
    }

    #[test]
    fn page_plans_require_alignment() {
        assert!(plan_pages(1000, 512).is_err());
        assert!(plan_pages(1024, 500).is_err());
        assert!(plan_pages(1024, 8 * MIB).is_err());
        let plan = plan_pages(1536, 1024).unwrap();
        let lengths: Vec<u32> = plan.blocks().iter().map(|b| b.length).collect();
        assert_eq!(lengths, vec![1024, 512]);
    }

    proptest! {
        #[test]
        fn blocks_cover_payload_exactly(total in 1u64..2_000_000, block_size in 64u64..50_000) {
            let config = TransferConfig::new()
                .with_block_size(block_size)
                .with_max_block_count(u32::MAX);
            let plan = plan_blocks(total, &config).unwrap();
            assert_contiguous(&plan);
            let ids: std::collections::HashSet<_> = plan.blocks().iter().map(|b| &b.id).collect();
            prop_assert_eq!(ids.len(), plan.block_count());
        }
    }
}
