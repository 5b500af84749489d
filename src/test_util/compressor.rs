use crate::compressor::Compressor;

/// A trivial run-length [Compressor]: pairs of (run length, byte). It compresses the zero
///  padding typical of test payloads well and is easy to reason about in tests.
pub struct RunLengthCompressor;

impl Compressor for RunLengthCompressor {
    fn compress(&self, input: &[u8], limit: usize) -> Option<Vec<u8>> {
        let mut result = Vec::new();
        let mut rest = input;
        while let Some(&b) = rest.first() {
            let run = rest.iter()
                .take(u8::MAX as usize)
                .take_while(|&&x| x == b)
                .count();
            if result.len() + 2 > limit {
                return None;
            }
            result.push(run as u8);
            result.push(b);
            rest = &rest[run..];
        }
        Some(result)
    }

    fn decompress(&self, input: &[u8], limit: usize) -> Option<Vec<u8>> {
        if input.len() % 2 != 0 {
            return None;
        }

        let mut result = Vec::new();
        for pair in input.chunks_exact(2) {
            let (run, b) = (pair[0] as usize, pair[1]);
            if run == 0 || result.len() + run > limit {
                return None;
            }
            result.resize(result.len() + run, b);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![5])]
    #[case::runs(vec![0, 0, 0, 1, 1, 2])]
    #[case::long_run(vec![9; 600])]
    fn test_round_trip(#[case] input: Vec<u8>) {
        let compressed = RunLengthCompressor.compress(&input, 10_000).unwrap();
        assert_eq!(RunLengthCompressor.decompress(&compressed, 10_000).unwrap(), input);
    }

    #[test]
    fn test_compress_limit() {
        assert!(RunLengthCompressor.compress(&[1, 2, 3], 5).is_none());
        assert_eq!(RunLengthCompressor.compress(&[0; 100], 2).unwrap(), vec![100, 0]);
    }

    #[rstest]
    #[case::odd_length(vec![1, 2, 3], 100)]
    #[case::zero_run(vec![0, 7], 100)]
    #[case::exceeds_limit(vec![200, 7], 100)]
    fn test_decompress_rejects(#[case] input: Vec<u8>, #[case] limit: usize) {
        assert!(RunLengthCompressor.decompress(&input, limit).is_none());
    }
}
