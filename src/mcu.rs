use super::{address, config};
use once_cell::sync::Lazy;
use regex::Regex;

#[must_use]
pub fn mask_limit(mask: address) -> (u8, u8) {
    let mut high = 64;
    let mut low = 0;
    let mut low_found = false;
    for i in 0..64 {
        if (mask & (1u64 << i)) != 0 {
            high = i + 1;
            if !low_found {
                low = i;
                low_found = true;
            }
        }
    }
    (low, high)
}

/// Gather the bits of `value` selected by `mask` into a contiguous field.
#[must_use]
fn packbits(mask: address, value: address, low: u8, high: u8) -> address {
    debug_assert!(low <= 64);
    debug_assert!(high <= 64);
    let mut pos = 0;
    let mut result: address = 0;
    for i in low.min(64)..high.min(64) {
        if mask & (1u64 << i) != 0 {
            result |= ((value & (1u64 << i)) >> i) << pos;
            pos += 1;
        }
    }
    result
}

/// A linear address decoded into its DRAM coordinates.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PhysicalAddress {
    pub chip: u64,
    pub bank: u64,
    pub row: u64,
    pub col: u64,
    pub burst: u64,
    pub sub_partition: u64,
}

/// One bit-field of the address mapping.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Mask {
    pub mask: address,
    pub low: u8,
    pub high: u8,
}

impl From<address> for Mask {
    fn from(mask: address) -> Self {
        let (low, high) = mask_limit(mask);
        Self { mask, low, high }
    }
}

impl std::fmt::Debug for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Mask")
            .field("mask", &format!("{:016x}", self.mask))
            .field("low", &self.low)
            .field("high", &self.high)
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid address mapping {mapping:?}: {message}")]
    InvalidMapping { mapping: String, message: String },

    #[error("number of memory channels ({0}) must be a power of two when no dramid position is given")]
    NonPowerOfTwoChannels(usize),

    #[error("number of sub partitions per channel ({0}) must be a power of two")]
    NonPowerOfTwoSubPartitions(usize),
}

/// Decode failure for addresses beyond the modeled DRAM capacity.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("address {addr:#x} is outside the modeled DRAM ({size:#x} bytes)")]
pub struct OutOfRangeAddress {
    pub addr: address,
    pub size: u64,
}

/// The per-field bit masks of the address mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecodeConfig {
    pub addr_chip_start: Option<usize>,
    pub chip: Mask,
    pub bank: Mask,
    pub row: Mask,
    pub col: Mask,
    pub burst: Mask,
}

static ADDRESS_MAPPING_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(dramid@(?P<dramid>\d+))?;?(?P<rest>.*)").unwrap());

impl DecodeConfig {
    /// Parse a mapping string like
    /// `dramid@8;00000000.00000000.00000000.00000000.0000RRRR.RRRRRRRR.RBBBCCCC.BCCSSSSS`.
    ///
    /// `D`/`B`/`R`/`C`/`S` select chip, bank, row, column and burst bits;
    /// burst bits also count as column bits. `.`, `|` and spaces are
    /// separators.
    pub fn parse(mapping: impl AsRef<str>) -> Result<Self, Error> {
        let mapping = mapping.as_ref().to_lowercase();
        let invalid = |message: String| Error::InvalidMapping {
            mapping: mapping.clone(),
            message,
        };

        let captures = ADDRESS_MAPPING_REGEX
            .captures(&mapping)
            .ok_or_else(|| invalid("bad format".to_string()))?;

        let addr_chip_start = captures
            .name("dramid")
            .map(|m| m.as_str().parse())
            .transpose()
            .map_err(|err| invalid(format!("bad dramid: {err}")))?;

        let rest = captures
            .name("rest")
            .map(|m| m.as_str())
            .unwrap_or_default();

        let mut chip_mask = 0x0u64;
        let mut bank_mask = 0x0u64;
        let mut row_mask = 0x0u64;
        let mut col_mask = 0x0u64;
        let mut burst_mask = 0x0u64;

        let mut offset: i8 = 63;
        for c in rest.chars() {
            match c {
                'd' => {
                    chip_mask |= 1 << offset;
                    offset -= 1;
                }
                'b' => {
                    bank_mask |= 1 << offset;
                    offset -= 1;
                }
                'r' => {
                    row_mask |= 1 << offset;
                    offset -= 1;
                }
                'c' => {
                    col_mask |= 1 << offset;
                    offset -= 1;
                }
                's' => {
                    burst_mask |= 1 << offset;
                    col_mask |= 1 << offset;
                    offset -= 1;
                }
                '0' => {
                    offset -= 1;
                }
                '|' | ' ' | '.' => {}
                other => return Err(invalid(format!("undefined character {other:?}"))),
            }
        }
        if offset != -1 {
            return Err(invalid(format!(
                "expected 64 mask bits but found {}",
                63 - offset
            )));
        }
        Ok(Self {
            addr_chip_start,
            chip: chip_mask.into(),
            bank: bank_mask.into(),
            row: row_mask.into(),
            col: col_mask.into(),
            burst: burst_mask.into(),
        })
    }
}

/// Translates linear addresses into DRAM coordinates.
///
/// The translation is a pure function of the configured bit masks: the same
/// address always yields the same decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryController {
    pub num_channels: usize,
    pub num_sub_partitions_per_channel: usize,
    decode_config: DecodeConfig,
    has_gap: bool,
    num_channels_log2: u32,
    num_sub_partitions_per_channel_log2: u32,
    sub_partition_id_mask: address,
    /// Modeled DRAM capacity; decodes beyond it fail.
    dram_size_bytes: u64,
}

impl MemoryController {
    pub fn new(config: &config::GPU) -> Result<Self, Error> {
        let num_channels = config.num_memory_controllers;
        let num_sub_partitions_per_channel = config.num_sub_partitions_per_memory_controller;

        let num_channels_log2 = num_channels.ilog2();
        let num_sub_partitions_per_channel_log2 = num_sub_partitions_per_channel.ilog2();

        let mut num_chip_bits = num_channels_log2;
        let gap = num_channels as i64 - i64::from(2u32.pow(num_chip_bits));
        if gap > 0 {
            num_chip_bits += 1;
        }

        let mut decode_config = match config.memory_addr_mapping {
            Some(ref mapping) => DecodeConfig::parse(mapping)?,
            None => DecodeConfig {
                addr_chip_start: Some(10),
                chip: 0x0000_0000_0000_1C00.into(),
                bank: 0x0000_0000_0000_0300.into(),
                row: 0x0000_0000_0FFF_0000.into(),
                col: 0x0000_0000_0000_E0FF.into(),
                burst: 0x0000_0000_0000_000F.into(),
            },
        };

        match decode_config.addr_chip_start {
            Some(addr_chip_start) if gap == 0 => {
                // power-of-two channel count: insert the chip bits at the
                // configured position and shift the other fields up past them
                let low_mask: address = (1 << addr_chip_start as u64) - 1;

                let mut bank_mask = decode_config.bank.mask;
                bank_mask = ((bank_mask & !low_mask) << num_chip_bits) | (bank_mask & low_mask);
                decode_config.bank = bank_mask.into();

                let mut row_mask = decode_config.row.mask;
                row_mask = ((row_mask & !low_mask) << num_chip_bits) | (row_mask & low_mask);
                decode_config.row = row_mask.into();

                let mut col_mask = decode_config.col.mask;
                col_mask = ((col_mask & !low_mask) << num_chip_bits) | (col_mask & low_mask);
                decode_config.col = col_mask.into();

                let mut chip_mask = decode_config.chip.mask;
                for i in addr_chip_start..(addr_chip_start + num_chip_bits as usize) {
                    chip_mask |= 1 << i;
                }
                decode_config.chip = chip_mask.into();
            }
            Some(_) => {
                // the gap case keeps the masks and splits the address instead
            }
            None => {
                if !utils::is_power_of_two(num_channels) {
                    return Err(Error::NonPowerOfTwoChannels(num_channels));
                }
            }
        }

        if !utils::is_power_of_two(num_sub_partitions_per_channel) {
            return Err(Error::NonPowerOfTwoSubPartitions(
                num_sub_partitions_per_channel,
            ));
        }

        // the lowest bank bits select the sub partition within a channel
        let mut sub_partition_id_mask = 0;
        if num_sub_partitions_per_channel > 1 {
            let mut pos = 0;
            let Mask { mask, low, high } = decode_config.bank;
            for i in low..high {
                if (mask & (1 << i)) != 0 {
                    sub_partition_id_mask |= 1 << i;
                    pos += 1;
                    if pos >= num_sub_partitions_per_channel_log2 {
                        break;
                    }
                }
            }
        }

        Ok(Self {
            num_channels,
            num_sub_partitions_per_channel,
            decode_config,
            has_gap: gap != 0,
            num_channels_log2,
            num_sub_partitions_per_channel_log2,
            sub_partition_id_mask,
            dram_size_bytes: config.dram_size_bytes,
        })
    }

    #[must_use]
    pub fn num_sub_partitions_total(&self) -> usize {
        self.num_channels * self.num_sub_partitions_per_channel
    }

    /// Check that `addr` lies within the modeled DRAM.
    pub fn check_in_range(&self, addr: address) -> Result<(), OutOfRangeAddress> {
        if addr >= self.dram_size_bytes {
            return Err(OutOfRangeAddress {
                addr,
                size: self.dram_size_bytes,
            });
        }
        Ok(())
    }

    /// Decode a linear address into `{chip, bank, row, col, burst, sub partition}`.
    #[must_use]
    pub fn decode(&self, addr: address) -> PhysicalAddress {
        let dec = &self.decode_config;
        let mut decoded = PhysicalAddress::default();

        if self.has_gap {
            // the chip is the modulus of the upper bits; the rest of the
            // address is re-stitched from the quotient and the lower bits
            let addr_chip_start = dec.addr_chip_start.unwrap();
            let num_channels = self.num_channels as u64;
            let addr_for_chip = (addr >> addr_chip_start) % num_channels;
            let mut rest_of_addr = (addr >> addr_chip_start) / num_channels;
            rest_of_addr <<= addr_chip_start;
            rest_of_addr |= addr & ((1 << addr_chip_start) - 1);

            decoded.chip = addr_for_chip;
            decoded.bank = packbits(dec.bank.mask, rest_of_addr, dec.bank.low, dec.bank.high);
            decoded.row = packbits(dec.row.mask, rest_of_addr, dec.row.low, dec.row.high);
            decoded.col = packbits(dec.col.mask, rest_of_addr, dec.col.low, dec.col.high);
            decoded.burst = packbits(dec.burst.mask, rest_of_addr, dec.burst.low, dec.burst.high);
        } else {
            decoded.chip = packbits(dec.chip.mask, addr, dec.chip.low, dec.chip.high);
            decoded.bank = packbits(dec.bank.mask, addr, dec.bank.low, dec.bank.high);
            decoded.row = packbits(dec.row.mask, addr, dec.row.low, dec.row.high);
            decoded.col = packbits(dec.col.mask, addr, dec.col.low, dec.col.high);
            decoded.burst = packbits(dec.burst.mask, addr, dec.burst.low, dec.burst.high);
        }

        // chip bits and the low bank bits form the sub partition id
        let sub_partition_mask = self.num_sub_partitions_per_channel as u64 - 1;
        decoded.sub_partition = decoded.chip * self.num_sub_partitions_per_channel as u64
            + (decoded.bank & sub_partition_mask);
        decoded
    }

    /// The address with chip and sub-partition bits squeezed out, used for L2
    /// set indexing within a slice.
    #[must_use]
    pub fn partition_address(&self, addr: address) -> address {
        if self.has_gap {
            let addr_chip_start = self.decode_config.addr_chip_start.unwrap();
            let mut partition_addr = (addr >> addr_chip_start) / self.num_channels as u64;
            partition_addr <<= addr_chip_start;
            partition_addr |= addr & ((1 << addr_chip_start) - 1);
            packbits(!self.sub_partition_id_mask, partition_addr, 0, 64)
        } else {
            let mut mask = self.decode_config.chip.mask;
            mask |= self.sub_partition_id_mask;
            packbits(!mask, addr, 0, 64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DecodeConfig, MemoryController};
    use color_eyre::eyre;

    fn controller() -> eyre::Result<MemoryController> {
        let config = crate::config::GPU::default();
        Ok(MemoryController::new(&config)?)
    }

    #[test]
    fn decode_is_pure() -> eyre::Result<()> {
        let mcu = controller()?;
        let addr = 0x0123_4567;
        assert_eq!(mcu.decode(addr), mcu.decode(addr));
        Ok(())
    }

    #[test]
    fn sub_partition_is_bounded() -> eyre::Result<()> {
        let mcu = controller()?;
        for addr in (0u64..(1 << 24)).step_by(4099) {
            let decoded = mcu.decode(addr);
            assert!((decoded.sub_partition as usize) < mcu.num_sub_partitions_total());
            assert!((decoded.chip as usize) < mcu.num_channels);
        }
        Ok(())
    }

    #[test]
    fn consecutive_sectors_rotate_sub_partitions() -> eyre::Result<()> {
        let mcu = controller()?;
        // a 512 byte span must touch more than one sub partition
        let touched: std::collections::HashSet<u64> = (0u64..512)
            .step_by(32)
            .map(|offset| mcu.decode(offset).sub_partition)
            .collect();
        assert!(touched.len() > 1);
        Ok(())
    }

    #[test]
    fn out_of_range_addresses_fail() -> eyre::Result<()> {
        let mcu = controller()?;
        assert!(mcu.check_in_range(0x1000).is_ok());
        assert!(mcu.check_in_range(u64::MAX).is_err());
        Ok(())
    }

    #[test]
    fn parses_mapping_string() -> eyre::Result<()> {
        let mapping = "dramid@8;00000000.00000000.00000000.00000000.0000RRRR.RRRRRRRR.RBBBCCCC.BCCSSSSS";
        let decoded = DecodeConfig::parse(mapping)?;
        assert_eq!(decoded.addr_chip_start, Some(8));
        assert_eq!(decoded.burst.mask, 0x1f);
        assert_eq!(decoded.bank.mask, 0x0000_0000_0000_7080);
        Ok(())
    }

    #[test]
    fn rejects_malformed_mapping() {
        let err = DecodeConfig::parse("dramid@8;XYZ").unwrap_err();
        assert!(matches!(err, super::Error::InvalidMapping { .. }));
    }
}
