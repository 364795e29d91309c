// Block map: the byte ranges of an image that actually hold data

use super::checksum::ChecksumAlgorithm;
use crate::error::FlashError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub offset: u64,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BlockRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Sorted, non-overlapping in-use ranges of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    image_size: u64,
    block_size: u64,
    checksum_type: Option<ChecksumAlgorithm>,
    ranges: Vec<BlockRange>,
    image_checksum: Option<String>,
}

impl BlockMap {
    pub fn new(
        image_size: u64,
        block_size: u64,
        checksum_type: Option<ChecksumAlgorithm>,
        ranges: Vec<BlockRange>,
        image_checksum: Option<String>,
    ) -> Result<Self, FlashError> {
        if block_size == 0 {
            return Err(FlashError::BlockMap("block size must not be zero".into()));
        }

        let mut previous_end = 0;
        for range in &ranges {
            if range.length == 0 {
                return Err(FlashError::BlockMap(format!(
                    "empty range at offset {}",
                    range.offset
                )));
            }
            if range.offset < previous_end {
                return Err(FlashError::BlockMap(format!(
                    "range at offset {} overlaps or is out of order",
                    range.offset
                )));
            }
            if range.end() > image_size {
                return Err(FlashError::BlockMap(format!(
                    "range {}..{} exceeds the image size {}",
                    range.offset,
                    range.end(),
                    image_size
                )));
            }
            previous_end = range.end();
        }

        if image_checksum.is_some() && checksum_type.is_none() {
            return Err(FlashError::BlockMap(
                "an image checksum requires a checksum type".into(),
            ));
        }

        Ok(Self {
            image_size,
            block_size,
            checksum_type,
            ranges,
            image_checksum,
        })
    }

    /// Parse a bmap XML document (bmaptool format 1.x/2.x)
    ///
    /// Block ranges are converted to byte ranges. The last range is clipped to
    /// the image size since the image need not end on a block boundary.
    pub fn parse_bmap(xml: &str) -> Result<Self, FlashError> {
        let image_size = bmap_number(xml, "ImageSize")?;
        let block_size = bmap_number(xml, "BlockSize")?;
        let blocks_count = bmap_number(xml, "BlocksCount")?;
        let checksum_type = match bmap_tag(xml, "ChecksumType")? {
            Some(name) => Some(ChecksumAlgorithm::from_name(&name).ok_or_else(|| {
                FlashError::BlockMap(format!("unsupported checksum type {name}"))
            })?),
            None => None,
        };

        if block_size == 0 {
            return Err(FlashError::BlockMap("block size must not be zero".into()));
        }
        if image_size.div_ceil(block_size) != blocks_count {
            return Err(FlashError::BlockMap(format!(
                "{blocks_count} blocks of {block_size} bytes do not match the image size {image_size}"
            )));
        }

        let range_re = Regex::new(
            r#"<Range(?:\s+(?:chksum|sha1|sha256)="([0-9a-fA-F]+)")?\s*>\s*(\d+)(?:\s*-\s*(\d+))?\s*</Range>"#,
        )
        .map_err(|e| FlashError::BlockMap(e.to_string()))?;

        let mut ranges = Vec::new();
        for caps in range_re.captures_iter(xml) {
            let first: u64 = parse_number(&caps[2])?;
            let last: u64 = match caps.get(3) {
                Some(m) => parse_number(m.as_str())?,
                None => first,
            };
            if last < first {
                return Err(FlashError::BlockMap(format!("inverted range {first}-{last}")));
            }

            let offset = first * block_size;
            let end = ((last + 1) * block_size).min(image_size);
            if offset >= end {
                return Err(FlashError::BlockMap(format!(
                    "range {first}-{last} lies beyond the image"
                )));
            }
            let mut range = BlockRange::new(offset, end - offset);
            if checksum_type.is_some() {
                range.checksum = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
            }
            ranges.push(range);
        }

        if let Some(mapped) = bmap_tag(xml, "MappedBlocksCount")? {
            let mapped = parse_number(&mapped)?;
            let counted: u64 = ranges
                .iter()
                .map(|r| r.length.div_ceil(block_size))
                .sum();
            if mapped != counted {
                return Err(FlashError::BlockMap(format!(
                    "header declares {mapped} mapped blocks but ranges cover {counted}"
                )));
            }
        }

        debug!(
            "Parsed block map: {} ranges, {} of {} bytes mapped",
            ranges.len(),
            ranges.iter().map(|r| r.length).sum::<u64>(),
            image_size
        );

        Self::new(image_size, block_size, checksum_type, ranges, None)
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn checksum_type(&self) -> Option<ChecksumAlgorithm> {
        self.checksum_type
    }

    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    pub fn image_checksum(&self) -> Option<&str> {
        self.image_checksum.as_deref()
    }

    /// Total number of in-use bytes
    pub fn mapped_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.length).sum()
    }
}

fn parse_number(text: &str) -> Result<u64, FlashError> {
    text.trim()
        .parse()
        .map_err(|_| FlashError::BlockMap(format!("invalid number {:?}", text.trim())))
}

fn bmap_tag(xml: &str, tag: &str) -> Result<Option<String>, FlashError> {
    let re = Regex::new(&format!(r"<{tag}>\s*([^<]*?)\s*</{tag}>"))
        .map_err(|e| FlashError::BlockMap(e.to_string()))?;
    Ok(re.captures(xml).map(|caps| caps[1].to_string()))
}

fn bmap_number(xml: &str, tag: &str) -> Result<u64, FlashError> {
    let text = bmap_tag(xml, tag)?
        .ok_or_else(|| FlashError::BlockMap(format!("missing <{tag}>")))?;
    parse_number(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BMAP: &str = r#"<?xml version="1.0" ?>
<bmap version="2.0">
    <ImageSize> 10000 </ImageSize>
    <BlockSize> 4096 </BlockSize>
    <BlocksCount> 3 </BlocksCount>
    <MappedBlocksCount> 2 </MappedBlocksCount>
    <ChecksumType> sha256 </ChecksumType>
    <BmapFileChecksum> 0000 </BmapFileChecksum>
    <BlockMap>
        <Range chksum="ABCDEF"> 0 </Range>
        <Range chksum="123456"> 2 </Range>
    </BlockMap>
</bmap>
"#;

    #[test]
    fn parses_bmap_and_clips_last_range() {
        let map = BlockMap::parse_bmap(BMAP).unwrap();
        assert_eq!(map.image_size(), 10000);
        assert_eq!(map.block_size(), 4096);
        assert_eq!(map.checksum_type(), Some(ChecksumAlgorithm::Sha256));
        assert_eq!(
            map.ranges(),
            &[
                BlockRange::new(0, 4096).with_checksum("abcdef"),
                BlockRange::new(8192, 10000 - 8192).with_checksum("123456"),
            ]
        );
        assert_eq!(map.mapped_bytes(), 4096 + 1808);
        assert_eq!(map.ranges().last().map(BlockRange::end), Some(10000));
    }

    #[test]
    fn parses_multi_block_ranges() {
        let xml = BMAP
            .replace("<MappedBlocksCount> 2 </MappedBlocksCount>", "<MappedBlocksCount> 3 </MappedBlocksCount>")
            .replace(r#"<Range chksum="ABCDEF"> 0 </Range>"#, r#"<Range chksum="ab"> 0-1 </Range>"#);
        let map = BlockMap::parse_bmap(&xml).unwrap();
        assert_eq!(map.ranges()[0], BlockRange::new(0, 8192).with_checksum("ab"));
        assert_eq!(map.ranges()[1].offset, 8192);
    }

    #[test]
    fn rejects_inconsistent_headers() {
        let xml = BMAP.replace("<BlocksCount> 3 </BlocksCount>", "<BlocksCount> 4 </BlocksCount>");
        assert!(matches!(BlockMap::parse_bmap(&xml), Err(FlashError::BlockMap(_))));

        let xml = BMAP.replace("<ChecksumType> sha256 </ChecksumType>", "<ChecksumType> md5 </ChecksumType>");
        assert!(BlockMap::parse_bmap(&xml).is_err());
    }

    #[test]
    fn rejects_overlapping_and_out_of_bounds_ranges() {
        let overlapping = vec![BlockRange::new(0, 100), BlockRange::new(50, 10)];
        assert!(BlockMap::new(1000, 512, None, overlapping, None).is_err());

        let unsorted = vec![BlockRange::new(500, 10), BlockRange::new(0, 10)];
        assert!(BlockMap::new(1000, 512, None, unsorted, None).is_err());

        let beyond = vec![BlockRange::new(900, 200)];
        assert!(BlockMap::new(1000, 512, None, beyond, None).is_err());

        let adjacent = vec![BlockRange::new(0, 100), BlockRange::new(100, 10)];
        assert!(BlockMap::new(1000, 512, None, adjacent, None).is_ok());
    }
}
