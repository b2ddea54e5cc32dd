//! Autoregressive decoding loops shared by every encoder-decoder backend.
//!
//! Both strategies decode every row of the batch together and recompute the decoder over the
//! whole prefix at each step.

use candle_core::{D, Device, Result, Tensor};
use candle_transformers::utils::apply_repeat_penalty;

use super::layers::key_padding_bias;
use super::{EncodedBatch, GenerateOptions};

/// Token ids the decoding loops need from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct SpecialTokens {
    pub(super) decoder_start: u32,
    pub(super) pad: u32,
    pub(super) eos: u32,
}

/// Encoder-decoder internals driven by [`generate`].
pub(super) trait DecodingModel {
    fn special_tokens(&self) -> SpecialTokens;

    /// Longest decoder prefix the position table supports.
    fn max_positions(&self) -> usize;

    fn device(&self) -> &Device;

    /// Run the encoder over `(batch, seq)` ids and return `(batch, seq, d_model)` states.
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Logits for the token following each row of `sequences`, shape `(rows, vocab)`.
    ///
    /// Every row must have the same length.
    fn next_token_logits(
        &self,
        sequences: &[Vec<u32>],
        encoder_hidden: &Tensor,
        encoder_bias: &Tensor,
    ) -> Result<Tensor>;
}

/// Decode `batch` with greedy search or beam search depending on `options.num_beams`.
pub(super) fn generate<M: DecodingModel>(
    model: &M,
    batch: &EncodedBatch,
    options: &GenerateOptions,
) -> Result<Tensor> {
    if options.num_beams > 1 {
        beam_search(model, batch, options)
    } else {
        greedy(model, batch, options)
    }
}

fn output_limit<M: DecodingModel>(model: &M, options: &GenerateOptions) -> usize {
    options.output_length().min(model.max_positions()).max(1)
}

fn penalize(logits: Tensor, sequences: &[Vec<u32>], penalty: Option<f32>) -> Result<Tensor> {
    let Some(penalty) = penalty.filter(|penalty| (*penalty - 1.0).abs() > f32::EPSILON) else {
        return Ok(logits);
    };
    let rows = sequences
        .iter()
        .enumerate()
        .map(|(row, context)| apply_repeat_penalty(&logits.get(row)?, penalty, context))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&rows, 0)
}

/// Tokens that would complete an n-gram of size `n` already present in `sequence`.
fn repeated_ngram_tokens(sequence: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || sequence.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &sequence[sequence.len() + 1 - n..];
    sequence
        .windows(n)
        .filter(|window| &window[..n - 1] == prefix)
        .map(|window| window[n - 1])
        .collect()
}

/// Apply repetition penalty, minimum length, n-gram blocking and the forced final
/// end-of-sequence token to next-token logits.
fn constrain(
    logits: Tensor,
    sequences: &[Vec<u32>],
    options: &GenerateOptions,
    limit: usize,
    eos: u32,
) -> Result<Tensor> {
    let logits = penalize(logits, sequences, options.repetition_penalty)?;
    let length = sequences.first().map(Vec::len).unwrap_or_default();
    let block_eos = length < options.min_length;
    let force_eos = options.forced_eos_token_id.filter(|_| length + 1 == limit);
    if !block_eos && force_eos.is_none() && options.no_repeat_ngram_size == 0 {
        return Ok(logits);
    }

    let device = logits.device().clone();
    let mut rows = logits.to_vec2::<f32>()?;
    let vocab = rows.first().map(Vec::len).unwrap_or_default();
    for (row, sequence) in rows.iter_mut().zip(sequences) {
        if let Some(forced) = force_eos {
            for (token, logit) in row.iter_mut().enumerate() {
                if token as u32 != forced {
                    *logit = f32::NEG_INFINITY;
                }
            }
            continue;
        }
        for token in repeated_ngram_tokens(sequence, options.no_repeat_ngram_size) {
            row[token as usize] = f32::NEG_INFINITY;
        }
        if block_eos && (eos as usize) < vocab {
            row[eos as usize] = f32::NEG_INFINITY;
        }
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Tensor::from_vec(flat, (sequences.len(), vocab), &device)
}

fn to_tensor(sequences: Vec<Vec<u32>>, pad: u32, device: &Device) -> Result<Tensor> {
    let rows = sequences.len();
    let width = sequences.iter().map(Vec::len).max().unwrap_or_default();
    let flat: Vec<u32> = sequences
        .into_iter()
        .flat_map(|mut sequence| {
            sequence.resize(width, pad);
            sequence
        })
        .collect();
    Tensor::from_vec(flat, (rows, width), device)
}

fn greedy<M: DecodingModel>(
    model: &M,
    batch: &EncodedBatch,
    options: &GenerateOptions,
) -> Result<Tensor> {
    let tokens = model.special_tokens();
    let rows = batch.batch_size();
    let limit = output_limit(model, options);

    let encoder_hidden = model.encode(&batch.input_ids, &batch.attention_mask)?;
    let encoder_bias = key_padding_bias(&batch.attention_mask)?;

    let mut sequences = vec![vec![tokens.decoder_start]; rows];
    let mut finished = vec![false; rows];

    while sequences[0].len() < limit {
        let step = sequences[0].len();
        let next: Vec<u32> = match options.forced_bos_token_id {
            Some(forced) if step == 1 => vec![forced; rows],
            _ => {
                let logits = model.next_token_logits(&sequences, &encoder_hidden, &encoder_bias)?;
                let logits = constrain(logits, &sequences, options, limit, tokens.eos)?;
                logits.argmax(D::Minus1)?.to_vec1::<u32>()?
            }
        };

        for ((sequence, done), token) in sequences.iter_mut().zip(finished.iter_mut()).zip(next) {
            if *done {
                sequence.push(tokens.pad);
            } else {
                sequence.push(token);
                *done = token == tokens.eos;
            }
        }
        if finished.iter().all(|done| *done) {
            break;
        }
    }

    to_tensor(sequences, tokens.pad, model.device())
}

/// Finished hypotheses for one input row, ranked by length-normalized log probability.
struct Hypotheses {
    capacity: usize,
    length_penalty: f32,
    early_stopping: bool,
    entries: Vec<(f32, Vec<u32>)>,
}

impl Hypotheses {
    fn new(capacity: usize, options: &GenerateOptions) -> Self {
        Self {
            capacity,
            length_penalty: options.length_penalty,
            early_stopping: options.early_stopping,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    fn normalize(&self, sum_log_probs: f32, length: usize) -> f32 {
        sum_log_probs / (length as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> f32 {
        self.entries
            .iter()
            .map(|(score, _)| *score)
            .fold(f32::INFINITY, f32::min)
    }

    /// `length` excludes the end-of-sequence token `sequence` may carry.
    fn add(&mut self, sequence: Vec<u32>, length: usize, sum_log_probs: f32) {
        let score = self.normalize(sum_log_probs, length);
        if self.entries.len() < self.capacity || score > self.worst() {
            self.entries.push((score, sequence));
            if self.entries.len() > self.capacity {
                self.entries.sort_by(|a, b| b.0.total_cmp(&a.0));
                self.entries.truncate(self.capacity);
            }
        }
    }

    /// Whether no running beam can still beat the worst kept hypothesis.
    fn is_done(&self, best_running: f32, length: usize) -> bool {
        if self.entries.len() < self.capacity {
            return false;
        }
        self.early_stopping || self.normalize(best_running, length) <= self.worst()
    }

    fn best(self) -> Option<Vec<u32>> {
        self.entries
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, sequence)| sequence)
    }
}

fn top_k(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .map(|(token, log_prob)| (token as u32, *log_prob))
        .collect();
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k, |a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k);
    }
    indexed
}

fn beam_search<M: DecodingModel>(
    model: &M,
    batch: &EncodedBatch,
    options: &GenerateOptions,
) -> Result<Tensor> {
    let SpecialTokens {
        decoder_start,
        pad,
        eos,
    } = model.special_tokens();
    let beams = options.num_beams;
    let rows = batch.batch_size();
    let limit = output_limit(model, options);

    let expand: Vec<u32> = (0..rows as u32)
        .flat_map(|row| std::iter::repeat_n(row, beams))
        .collect();
    let expand = Tensor::new(expand.as_slice(), model.device())?;
    let attention_mask = batch.attention_mask.index_select(&expand, 0)?;
    let encoder_hidden = model
        .encode(&batch.input_ids, &batch.attention_mask)?
        .index_select(&expand, 0)?;
    let encoder_bias = key_padding_bias(&attention_mask)?;

    let mut sequences = vec![vec![decoder_start]; rows * beams];
    // Only the first beam of each row is live until the first expansion.
    let mut scores: Vec<f32> = (0..rows * beams)
        .map(|index| if index % beams == 0 { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    let mut hypotheses: Vec<Hypotheses> = (0..rows)
        .map(|_| Hypotheses::new(beams, options))
        .collect();
    let mut done = vec![false; rows];

    while sequences[0].len() < limit {
        let step = sequences[0].len();
        let forced = options.forced_bos_token_id.filter(|_| step == 1);
        let log_probs = if forced.is_some() {
            None
        } else {
            let logits = model.next_token_logits(&sequences, &encoder_hidden, &encoder_bias)?;
            let logits = constrain(logits, &sequences, options, limit, eos)?;
            Some(candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?)
        };

        let mut next_sequences = Vec::with_capacity(rows * beams);
        let mut next_scores = Vec::with_capacity(rows * beams);
        for row in 0..rows {
            let base = row * beams;
            let mut chosen = 0;

            if !done[row] {
                let mut candidates: Vec<(f32, usize, u32)> = Vec::new();
                for beam in 0..beams {
                    let score = scores[base + beam];
                    if score == f32::NEG_INFINITY {
                        continue;
                    }
                    match (forced, &log_probs) {
                        (Some(token), _) => candidates.push((score, beam, token)),
                        (None, Some(log_probs)) => {
                            for (token, log_prob) in top_k(&log_probs[base + beam], 2 * beams) {
                                candidates.push((score + log_prob, beam, token));
                            }
                        }
                        (None, None) => {}
                    }
                }
                candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

                for (rank, (score, beam, token)) in candidates.into_iter().enumerate() {
                    let mut sequence = sequences[base + beam].clone();
                    if token == eos {
                        if rank < beams && score.is_finite() {
                            let length = sequence.len();
                            sequence.push(eos);
                            hypotheses[row].add(sequence, length, score);
                        }
                        continue;
                    }
                    sequence.push(token);
                    next_sequences.push(sequence);
                    next_scores.push(score);
                    chosen += 1;
                    if chosen == beams {
                        break;
                    }
                }
            }

            while chosen < beams {
                let mut sequence = sequences[base].clone();
                sequence.push(pad);
                next_sequences.push(sequence);
                next_scores.push(f32::NEG_INFINITY);
                chosen += 1;
            }

            if !done[row] {
                done[row] = hypotheses[row].is_done(next_scores[base], step + 1);
            }
        }

        sequences = next_sequences;
        scores = next_scores;
        if done.iter().all(|done| *done) {
            break;
        }
    }

    let mut best = Vec::with_capacity(rows);
    for (row, mut row_hypotheses) in hypotheses.into_iter().enumerate() {
        if !done[row] {
            for beam in 0..beams {
                let index = row * beams + beam;
                if scores[index].is_finite() {
                    let length = sequences[index].len();
                    row_hypotheses.add(sequences[index].clone(), length, scores[index]);
                }
            }
        }
        best.push(
            row_hypotheses
                .best()
                .unwrap_or_else(|| vec![decoder_start]),
        );
    }

    to_tensor(best, pad, model.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::M2M100Model;
    use crate::models::m2m100::tiny_config;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    fn zero_model() -> M2M100Model {
        M2M100Model::new(&tiny_config(), VarBuilder::zeros(DType::F32, &Device::Cpu))
            .expect("zero model")
    }

    fn batch() -> EncodedBatch {
        EncodedBatch::from_rows(&[vec![3, 4, 5, 2], vec![3, 6, 2, 1]], 1, &Device::Cpu)
            .expect("batch")
    }

    fn options(num_beams: usize) -> GenerateOptions {
        GenerateOptions {
            max_length: 5,
            num_beams,
            forced_bos_token_id: Some(7),
            ..GenerateOptions::default()
        }
    }

    fn logits(row: &[f32]) -> Tensor {
        Tensor::from_slice(row, (1, row.len()), &Device::Cpu).expect("logits")
    }

    fn values(tensor: Tensor) -> Vec<Vec<f32>> {
        tensor.to_vec2::<f32>().expect("values")
    }

    #[test]
    fn greedy_forces_target_tag_and_stops_at_max_length() {
        let model = zero_model();
        let output = generate(&model, &batch(), &options(1))
            .expect("greedy decoding")
            .to_vec2::<u32>()
            .expect("ids");

        // Uniform logits pick token 0, which never ends a row.
        assert_eq!(output, vec![vec![2, 7, 0, 0, 0], vec![2, 7, 0, 0, 0]]);
    }

    #[test]
    fn max_new_tokens_overrides_max_length() {
        let model = zero_model();
        let options = GenerateOptions {
            max_new_tokens: Some(2),
            ..options(1)
        };
        let output = generate(&model, &batch(), &options)
            .expect("greedy decoding")
            .to_vec2::<u32>()
            .expect("ids");
        assert_eq!(output, vec![vec![2, 7, 0], vec![2, 7, 0]]);
    }

    #[test]
    fn forced_eos_ends_every_row_at_the_limit() {
        let model = zero_model();
        let options = GenerateOptions {
            forced_eos_token_id: Some(2),
            ..options(1)
        };
        let output = generate(&model, &batch(), &options)
            .expect("greedy decoding")
            .to_vec2::<u32>()
            .expect("ids");
        assert_eq!(output, vec![vec![2, 7, 0, 0, 2], vec![2, 7, 0, 0, 2]]);
    }

    #[test]
    fn no_repeat_ngram_blocks_repeated_bigrams() {
        let model = zero_model();
        let options = GenerateOptions {
            max_length: 6,
            no_repeat_ngram_size: 2,
            ..options(1)
        };
        let output = generate(&model, &batch(), &options)
            .expect("greedy decoding")
            .to_vec2::<u32>()
            .expect("ids");

        // After `0 0`, the bigram `0 0` is taken, so the next best uniform logit is token 1.
        assert_eq!(output[0], vec![2, 7, 0, 0, 1, 0]);
    }

    #[test]
    fn beam_search_returns_one_row_per_input() {
        let model = zero_model();
        for early_stopping in [false, true] {
            let options = GenerateOptions {
                early_stopping,
                ..options(3)
            };
            let output = generate(&model, &batch(), &options)
                .expect("beam decoding")
                .to_vec2::<u32>()
                .expect("ids");

            assert_eq!(output.len(), 2);
            for row in output {
                assert!(row.len() <= 5);
                assert_eq!(&row[..2], &[2, 7]);
            }
        }
    }

    #[test]
    fn repetition_penalty_is_a_no_op_at_one() {
        let input = logits(&[1., 2., 3.]);
        let penalized = penalize(input.clone(), &[vec![2]], Some(1.0)).expect("penalize");
        assert_eq!(values(penalized), values(input));
    }

    #[test]
    fn repetition_penalty_lowers_seen_tokens() {
        let penalized = penalize(logits(&[1., 2., 3.]), &[vec![2]], Some(2.0)).expect("penalize");
        assert_eq!(values(penalized), vec![vec![1.0, 2.0, 1.5]]);
    }

    #[test]
    fn min_length_suppresses_end_of_sequence() {
        let options = GenerateOptions {
            min_length: 3,
            ..GenerateOptions::default()
        };
        let short = [vec![2, 7]];
        let constrained =
            constrain(logits(&[0., 1., 5.]), &short, &options, 10, 2).expect("constrain");
        assert_eq!(values(constrained), vec![vec![0.0, 1.0, f32::NEG_INFINITY]]);

        let long_enough = [vec![2, 7, 1]];
        let constrained =
            constrain(logits(&[0., 1., 5.]), &long_enough, &options, 10, 2).expect("constrain");
        assert_eq!(values(constrained), vec![vec![0.0, 1.0, 5.0]]);
    }

    #[test]
    fn repeated_ngrams_are_detected_from_the_row_suffix() {
        assert_eq!(repeated_ngram_tokens(&[5, 6, 7, 5], 2), vec![6]);
        assert_eq!(repeated_ngram_tokens(&[5, 6, 5, 6], 3), vec![5]);
        assert!(repeated_ngram_tokens(&[5, 6], 3).is_empty());
        assert!(repeated_ngram_tokens(&[5, 5, 5], 0).is_empty());
    }

    #[test]
    fn hypotheses_keep_only_the_best_entries() {
        let mut hypotheses = Hypotheses::new(2, &GenerateOptions::default());
        hypotheses.add(vec![2, 7, 2], 2, -4.0);
        hypotheses.add(vec![2, 7, 9, 2], 3, -3.0);
        hypotheses.add(vec![2, 7, 8, 2], 3, -0.3);

        assert_eq!(hypotheses.entries.len(), 2);
        assert!(hypotheses.is_done(-9.0, 3));
        assert!(!hypotheses.is_done(-0.01, 3));
        assert_eq!(hypotheses.best(), Some(vec![2, 7, 8, 2]));
    }

    #[test]
    fn early_stopping_finishes_once_enough_hypotheses_exist() {
        let options = GenerateOptions {
            early_stopping: true,
            ..GenerateOptions::default()
        };
        let mut hypotheses = Hypotheses::new(1, &options);
        assert!(!hypotheses.is_done(0.0, 3));
        hypotheses.add(vec![2, 7, 2], 2, -4.0);
        assert!(hypotheses.is_done(-0.01, 3));
    }

    #[test]
    fn top_k_selects_highest_log_probs() {
        let mut picked = top_k(&[-3.0, -0.5, -2.0, -0.1], 2);
        picked.sort_by_key(|(token, _)| *token);
        assert_eq!(picked, vec![(1, -0.5), (3, -0.1)]);
    }
}
