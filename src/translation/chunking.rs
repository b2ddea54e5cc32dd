//! Splits token sequences into fixed-width chunks that fit the model's input budget.
//!
//! Chunks are cut just before the last sentence separator inside the budget. Every chunk starts
//! with the sequence's leading token, every chunk except the last ends with the sequence's
//! trailing token, and all chunks are padded to exactly `chunk_size` tokens so they can be
//! stacked into one batch.

use super::ChunkingError;

/// Smallest budget able to hold one content token plus the end-of-sequence marker.
pub const MIN_CHUNK_SIZE: usize = 2;

/// Vocabulary ids the splitter needs besides the sequence itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMarkers {
    /// Sentence-terminating token preferred as a cut point.
    pub separator: u32,
    /// Token used to fill chunks up to the budget.
    pub pad: u32,
}

/// Partition `tokens` into chunks of exactly `chunk_size` tokens.
///
/// Sequences that already fit are returned unchanged as a single chunk.
pub fn split_chunks(
    tokens: Vec<u32>,
    chunk_size: usize,
    markers: ChunkMarkers,
) -> Result<Vec<Vec<u32>>, ChunkingError> {
    if tokens.len() <= chunk_size {
        return Ok(vec![tokens]);
    }
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(ChunkingError::InvalidChunkSize(chunk_size));
    }

    let bos = tokens[0];
    let eos = tokens[tokens.len() - 1];
    let mut chunks = Vec::with_capacity(tokens.len() / (chunk_size - 1) + 1);
    let mut remaining = tokens;

    while remaining.len() > chunk_size {
        let cut = find_cut_point(&remaining, markers.separator, chunk_size - 1);
        let mut chunk = Vec::with_capacity(chunk_size);
        chunk.extend_from_slice(&remaining[..cut]);
        chunk.push(eos);
        chunks.push(end_pad(chunk, chunk_size, markers.pad));

        remaining.drain(..cut);
        remaining[0] = bos;
    }
    chunks.push(end_pad(remaining, chunk_size, markers.pad));

    tracing::debug!(chunks = chunks.len(), chunk_size, "Split token sequence");
    Ok(chunks)
}

/// Index of the nearest separator at or before `start`, never index 0.
///
/// Falls back to `start` when the window holds no separator.
fn find_cut_point(tokens: &[u32], separator: u32, start: usize) -> usize {
    match (1..=start).rev().find(|&index| tokens[index] == separator) {
        Some(index) => index,
        None => {
            tracing::warn!(
                cut = start,
                "No sentence separator inside chunk budget; cutting mid-sentence"
            );
            start
        }
    }
}

fn end_pad(mut chunk: Vec<u32>, chunk_size: usize, pad: u32) -> Vec<u32> {
    if chunk.len() < chunk_size {
        chunk.resize(chunk_size, pad);
    }
    assert_eq!(chunk.len(), chunk_size, "chunk must match the chunk size exactly");
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOS: u32 = 900;
    const EOS: u32 = 2;
    const SEP: u32 = 4;
    const PAD: u32 = 1;
    const MARKERS: ChunkMarkers = ChunkMarkers {
        separator: SEP,
        pad: PAD,
    };

    /// `[BOS, 100.., EOS]` with separators placed at the given indices.
    fn sequence(len: usize, separators: &[usize]) -> Vec<u32> {
        (0..len)
            .map(|index| match index {
                0 => BOS,
                _ if index == len - 1 => EOS,
                _ if separators.contains(&index) => SEP,
                _ => 100 + index as u32,
            })
            .collect()
    }

    fn strip_padding(chunk: &[u32]) -> &[u32] {
        let end = chunk
            .iter()
            .rposition(|token| *token != PAD)
            .map_or(0, |index| index + 1);
        &chunk[..end]
    }

    #[test]
    fn short_sequences_are_returned_untouched() {
        let tokens = sequence(50, &[10, 20]);
        let chunks = split_chunks(tokens.clone(), 200, MARKERS).expect("split");
        assert_eq!(chunks, vec![tokens]);
    }

    #[test]
    fn sequence_exactly_at_budget_is_not_split() {
        let tokens = sequence(200, &[]);
        let chunks = split_chunks(tokens.clone(), 200, MARKERS).expect("split");
        assert_eq!(chunks, vec![tokens]);
    }

    #[test]
    fn long_sequences_cut_before_separators() {
        let tokens = sequence(500, &[150, 345]);
        let chunks = split_chunks(tokens.clone(), 200, MARKERS).expect("split");

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.len() == 200));

        let first = strip_padding(&chunks[0]);
        assert_eq!(&first[..150], &tokens[..150]);
        assert_eq!(first.len(), 151);
        assert_eq!(first[150], EOS);

        let second = strip_padding(&chunks[1]);
        assert_eq!(second[0], BOS);
        assert_eq!(&second[1..195], &tokens[151..345]);
        assert_eq!(second[195], EOS);

        let last = strip_padding(&chunks[2]);
        assert_eq!(last[0], BOS);
        assert_eq!(&last[1..], &tokens[346..]);
        assert_eq!(*last.last().expect("non-empty"), EOS);
    }

    #[test]
    fn missing_separator_falls_back_to_hard_truncation() {
        let tokens = sequence(500, &[]);
        let chunks = split_chunks(tokens.clone(), 200, MARKERS).expect("split");

        assert_eq!(&chunks[0][..199], &tokens[..199]);
        assert_eq!(chunks[0][199], EOS);
        assert_eq!(chunks[1][0], BOS);
        assert_eq!(&chunks[1][1..199], &tokens[200..398]);
        assert!(chunks.iter().all(|chunk| chunk.len() == 200));
    }

    #[test]
    fn separator_at_index_zero_is_never_a_cut_point() {
        let mut tokens = sequence(12, &[]);
        tokens[0] = SEP;
        let chunks = split_chunks(tokens, 4, MARKERS).expect("split");
        assert!(chunks.iter().all(|chunk| chunk.len() == 4));
        assert!(chunks.iter().all(|chunk| chunk[0] == SEP));
    }

    /// Original indices overwritten by the leading token at each cut.
    fn overwritten_indices(tokens: &[u32], chunk_size: usize) -> Vec<usize> {
        let mut cuts = Vec::new();
        let mut start = 0;
        while tokens.len() - start > chunk_size {
            let window = start + 1..=start + chunk_size - 1;
            let cut = window
                .clone()
                .rev()
                .find(|&index| tokens[index] == SEP)
                .unwrap_or(*window.end());
            cuts.push(cut);
            start = cut;
        }
        cuts
    }

    #[test]
    fn every_chunk_is_well_formed_and_content_is_preserved() {
        for (len, chunk_size, separators) in [
            (37usize, 8usize, vec![3, 9, 10, 22]),
            (100, 16, vec![15, 31, 47, 63, 79, 95]),
            (64, 5, vec![]),
            (23, 2, vec![5, 6, 7]),
        ] {
            let tokens = sequence(len, &separators);
            let chunks =
                split_chunks(tokens.clone(), chunk_size, MARKERS).expect("valid budget");

            assert!(chunks.len() > 1, "len {len} must split at size {chunk_size}");
            let mut rebuilt = Vec::new();
            for (index, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.len(), chunk_size);
                assert_eq!(chunk[0], BOS);
                let content = strip_padding(chunk);
                if index + 1 < chunks.len() {
                    assert_eq!(*content.last().expect("non-empty"), EOS);
                    rebuilt.extend_from_slice(&content[usize::from(index > 0)..content.len() - 1]);
                } else {
                    rebuilt.extend_from_slice(&content[usize::from(index > 0)..]);
                }
            }

            let cuts = overwritten_indices(&tokens, chunk_size);
            assert_eq!(cuts.len(), chunks.len() - 1);
            let expected: Vec<u32> = tokens
                .iter()
                .enumerate()
                .filter(|(index, _)| !cuts.contains(index))
                .map(|(_, token)| *token)
                .collect();
            assert_eq!(rebuilt, expected, "len {len} at size {chunk_size}");
        }
    }

    #[test]
    fn budget_below_two_tokens_is_rejected() {
        let error = split_chunks(sequence(10, &[]), 1, MARKERS).expect_err("invalid budget");
        assert!(matches!(error, ChunkingError::InvalidChunkSize(1)));
        assert!(split_chunks(sequence(10, &[]), 0, MARKERS).is_err());
    }

    #[test]
    #[should_panic(expected = "chunk must match the chunk size exactly")]
    fn end_pad_refuses_oversized_chunks() {
        end_pad(vec![1, 2, 3], 2, PAD);
    }
}
