//! Device register map used by the transport layer.
//!
//! Only the registers the transport itself touches live here: the DMA
//! engine's per-channel groups and the firmware shared-memory words that
//! hold the claim record. Radio blocks have their own maps elsewhere.

// ── DMA engine ────────────────────────────────────────────────────────────────

/// Channels available on one DMA-attached device.
pub const DMA_MAX_CHANNELS: u32 = 6;

const DMA_TX_BASE: u32 = 0x40200;
const DMA_RX_BASE: u32 = 0x40400;
const DMA_GROUP_STRIDE: u32 = 16;

pub const DMA_CTRL_STATUS_REG: u32 = 0x0;
/// Frame size in 64-bit words.
pub const DMA_FRAME_SIZE_REG: u32 = 0x4;
pub const DMA_SAMPLE_COUNT_REG: u32 = 0x8;
pub const DMA_PKT_COUNT_REG: u32 = 0xC;

// Control bits
pub const DMA_CTRL_DISABLED: u32 = 0x0000_0000;
pub const DMA_CTRL_CLEAR: u32 = 0x0000_0001;
pub const DMA_CTRL_ENABLED: u32 = 0x0000_0002;
pub const DMA_CTRL_SW_BUF_U32: u32 = 0x0000_0020;
pub const DMA_CTRL_SW_BUF_U64: u32 = 0x0000_0030;

// Status bits
pub const DMA_STATUS_ERROR: u32 = 0x0000_0001;
pub const DMA_STATUS_BUSY: u32 = 0x0000_0002;
pub const DMA_STATUS_SUSPENDED: u32 = 0x0000_0004;

/// Address of a register in the host→device (TX) group of `channel`.
pub const fn dma_tx_reg(channel: u32, offset: u32) -> u32 {
    DMA_TX_BASE + DMA_GROUP_STRIDE * channel + offset
}

/// Address of a register in the device→host (RX) group of `channel`.
pub const fn dma_rx_reg(channel: u32, offset: u32) -> u32 {
    DMA_RX_BASE + DMA_GROUP_STRIDE * channel + offset
}

// ── Firmware shared memory ────────────────────────────────────────────────────

pub const FW_SHMEM_BASE: u32 = 0x6000;

const fn fw_shmem(index: u32) -> u32 {
    FW_SHMEM_BASE + index * 4
}

/// Non-zero while a fresh claim is held. Maintained by firmware.
pub const CLAIM_STATUS_REG: u32 = fw_shmem(10);
/// Host-written claim time; firmware watches it for changes.
pub const CLAIM_TIME_REG: u32 = fw_shmem(11);
/// Identity hash of the claiming process.
pub const CLAIM_SRC_REG: u32 = fw_shmem(12);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_groups_are_sixteen_bytes_apart() {
        assert_eq!(dma_tx_reg(0, DMA_CTRL_STATUS_REG), 0x40200);
        assert_eq!(dma_tx_reg(5, DMA_FRAME_SIZE_REG), 0x40254);
        assert_eq!(dma_rx_reg(1, DMA_PKT_COUNT_REG), 0x4041C);
    }

    #[test]
    fn claim_words_are_consecutive() {
        assert_eq!(CLAIM_STATUS_REG, 0x6028);
        assert_eq!(CLAIM_TIME_REG, CLAIM_STATUS_REG + 4);
        assert_eq!(CLAIM_SRC_REG, CLAIM_TIME_REG + 4);
    }
}
