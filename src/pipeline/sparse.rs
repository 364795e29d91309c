// Sparse range filter: passes on only the bytes covered by a block map.
//
// Used on both sides of a run. While writing it selects the in-use ranges of
// the sequential source stream; while verifying it receives positioned range
// reads. Each range is digested on its own and checked against the map, and an
// aggregate digest is kept over the in-use bytes in offset order.

use super::block_map::{BlockMap, BlockRange};
use super::checksum::{ChecksumAlgorithm, ChecksumSet, Hasher, MultiHasher};
use super::{Chunk, Stage};
use crate::error::FlashError;

pub struct SparseFilter {
    ranges: Vec<BlockRange>,
    range_algorithm: ChecksumAlgorithm,
    image_algorithm: Option<ChecksumAlgorithm>,
    image_checksum: Option<String>,
    index: usize,
    // Stream offset of the next unpositioned byte
    position: u64,
    filled: u64,
    range_hasher: Hasher,
    aggregate: Option<MultiHasher>,
    digests: Vec<String>,
    result: Option<ChecksumSet>,
}

impl SparseFilter {
    pub fn new(map: &BlockMap, algorithms: &[ChecksumAlgorithm]) -> Self {
        let range_algorithm = map.checksum_type().unwrap_or(ChecksumAlgorithm::Sha256);
        let image_algorithm = map.image_checksum().and(map.checksum_type());

        let mut aggregate_algorithms = algorithms.to_vec();
        aggregate_algorithms.extend(image_algorithm);

        Self {
            ranges: map.ranges().to_vec(),
            range_algorithm,
            image_algorithm,
            image_checksum: map.image_checksum().map(str::to_ascii_lowercase),
            index: 0,
            position: 0,
            filled: 0,
            range_hasher: Hasher::new(range_algorithm),
            aggregate: Some(MultiHasher::new(&aggregate_algorithms)),
            digests: Vec::new(),
            result: None,
        }
    }

    /// Per-range digests of every range completed so far, in map order
    pub fn range_digests(&self) -> &[String] {
        &self.digests
    }

    fn complete_range(&mut self) -> Result<(), FlashError> {
        let hasher = std::mem::replace(&mut self.range_hasher, Hasher::new(self.range_algorithm));
        let digest = hasher.finalize();
        let range = &self.ranges[self.index];

        if let Some(expected) = &range.checksum {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(FlashError::RangeChecksum {
                    offset: range.offset,
                    length: range.length,
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        self.digests.push(digest);
        self.index += 1;
        self.filled = 0;
        Ok(())
    }
}

impl Stage for SparseFilter {
    fn name(&self) -> &'static str {
        "sparse-filter"
    }

    fn transform(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        let start = chunk.position.unwrap_or(self.position);
        let end = start + chunk.len() as u64;
        let mut cursor = start;

        while cursor < end && self.index < self.ranges.len() {
            let range = &self.ranges[self.index];
            let expected_next = range.offset + self.filled;
            let from = cursor.max(range.offset);
            if from >= end {
                break;
            }
            if from != expected_next {
                return Err(FlashError::BlockMap(format!(
                    "data for range at {} arrived out of order (expected offset {}, got {})",
                    range.offset, expected_next, from
                )));
            }

            let to = end.min(range.end());
            let slice = chunk
                .data
                .slice((from - start) as usize..(to - start) as usize);

            self.range_hasher.update(&slice);
            if let Some(aggregate) = &mut self.aggregate {
                aggregate.update(&slice);
            }
            self.filled += to - from;
            out.push(Chunk::at(slice, from));
            cursor = to;

            if self.filled == range.length {
                self.complete_range()?;
            }
        }

        self.position = self.position.max(end);
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<Chunk>) -> Result<(), FlashError> {
        if let Some(range) = self.ranges.get(self.index) {
            return Err(FlashError::BlockMap(format!(
                "stream ended at {} before range {}..{} was complete",
                self.position,
                range.offset,
                range.end()
            )));
        }

        let Some(aggregate) = self.aggregate.take() else {
            return Ok(());
        };
        let set = aggregate.finalize();

        if let (Some(alg), Some(expected)) = (self.image_algorithm, &self.image_checksum) {
            let actual = set.get(alg).unwrap_or_default().to_string();
            if actual != *expected {
                return Err(FlashError::ImageChecksum {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        self.result = Some(set);
        Ok(())
    }

    fn take_checksum(&mut self) -> Option<ChecksumSet> {
        self.result.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    fn digest(alg: ChecksumAlgorithm, data: &[u8]) -> String {
        let mut h = Hasher::new(alg);
        h.update(data);
        h.finalize()
    }

    // 40% of a 10 KiB image in three ranges
    fn forty_percent_map(data: &[u8], with_checksums: bool) -> BlockMap {
        let spans = [(0u64, 1024u64), (3072, 2048), (8192, 1024)];
        let ranges = spans
            .iter()
            .map(|&(offset, length)| {
                let range = BlockRange::new(offset, length);
                if with_checksums {
                    let bytes = &data[offset as usize..(offset + length) as usize];
                    range.with_checksum(digest(ChecksumAlgorithm::Sha256, bytes))
                } else {
                    range
                }
            })
            .collect();
        BlockMap::new(
            data.len() as u64,
            512,
            Some(ChecksumAlgorithm::Sha256),
            ranges,
            None,
        )
        .unwrap()
    }

    #[test]
    fn emits_exactly_the_mapped_ranges() {
        let data = image(10240);
        let map = forty_percent_map(&data, true);
        let mut filter = SparseFilter::new(&map, &[ChecksumAlgorithm::Crc32]);

        let mut out = Vec::new();
        for piece in data.chunks(700) {
            filter
                .transform(Chunk::new(Bytes::copy_from_slice(piece)), &mut out)
                .unwrap();
        }
        filter.flush(&mut out).unwrap();

        let written: u64 = out.iter().map(|c| c.len() as u64).sum();
        assert_eq!(written, map.mapped_bytes());
        assert_eq!(written * 10, data.len() as u64 * 4);
        for chunk in &out {
            let offset = chunk.position.unwrap();
            assert!(map
                .ranges()
                .iter()
                .any(|r| offset >= r.offset && offset + chunk.len() as u64 <= r.end()));
            assert_eq!(&chunk.data[..], &data[offset as usize..offset as usize + chunk.len()]);
        }

        // Per-range digests match the map, aggregate matches the concatenated ranges
        let mut concatenated = Vec::new();
        for (range, d) in map.ranges().iter().zip(filter.range_digests()) {
            assert_eq!(Some(d), range.checksum.as_ref());
            concatenated.extend_from_slice(&data[range.offset as usize..range.end() as usize]);
        }
        let set = filter.take_checksum().unwrap();
        assert_eq!(
            set.get(ChecksumAlgorithm::Crc32).unwrap(),
            digest(ChecksumAlgorithm::Crc32, &concatenated)
        );
    }

    #[test]
    fn positioned_reads_produce_the_same_aggregate() {
        let data = image(10240);
        let map = forty_percent_map(&data, false);

        let mut sequential = SparseFilter::new(&map, &[ChecksumAlgorithm::Sha256]);
        let mut out = Vec::new();
        sequential
            .transform(Chunk::new(Bytes::from(data.clone())), &mut out)
            .unwrap();
        sequential.flush(&mut out).unwrap();

        let mut positioned = SparseFilter::new(&map, &[ChecksumAlgorithm::Sha256]);
        let mut out = Vec::new();
        for range in map.ranges() {
            let bytes = Bytes::copy_from_slice(&data[range.offset as usize..range.end() as usize]);
            positioned.transform(Chunk::at(bytes, range.offset), &mut out).unwrap();
        }
        positioned.flush(&mut out).unwrap();

        assert_eq!(sequential.take_checksum(), positioned.take_checksum());
    }

    #[test]
    fn detects_range_corruption() {
        let data = image(10240);
        let map = forty_percent_map(&data, true);
        let mut corrupted = data.clone();
        corrupted[3500] ^= 0xff;

        let mut filter = SparseFilter::new(&map, &[]);
        let mut out = Vec::new();
        let err = filter
            .transform(Chunk::new(Bytes::from(corrupted)), &mut out)
            .unwrap_err();
        assert!(matches!(err, FlashError::RangeChecksum { offset: 3072, .. }));
    }

    #[test]
    fn short_stream_is_an_error() {
        let data = image(10240);
        let map = forty_percent_map(&data, false);
        let mut filter = SparseFilter::new(&map, &[]);
        let mut out = Vec::new();
        filter
            .transform(Chunk::new(Bytes::copy_from_slice(&data[..4000])), &mut out)
            .unwrap();
        assert!(filter.flush(&mut out).is_err());
    }

    #[test]
    fn checks_image_checksum() {
        let data = image(4096);
        let ranges = vec![BlockRange::new(0, 4096)];
        let map = BlockMap::new(
            4096,
            512,
            Some(ChecksumAlgorithm::Sha256),
            ranges,
            Some("00".into()),
        )
        .unwrap();
        let mut filter = SparseFilter::new(&map, &[]);
        let mut out = Vec::new();
        filter.transform(Chunk::new(Bytes::from(data)), &mut out).unwrap();
        assert!(matches!(
            filter.flush(&mut out),
            Err(FlashError::ImageChecksum { .. })
        ));
    }
}
