//! Token sampling over per-step logits.
//!
//! Applies, in order: frequency/presence penalties, repetition penalty,
//! temperature, top-k, then top-p, and finally draws from the surviving
//! distribution. All draws come from one RNG seeded with the step seed from
//! [`SamplingParameters`], so every tensor-parallel rank samples the same
//! token from the same logits.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::batch::input_params::{InputParameters, SamplingParameters};
use crate::error::{Error, Result};

/// Sample one token per sequence from `logits [num_seqs, vocab]`.
///
/// `input_params` supplies each sequence's token history for the
/// frequency-based penalties.
///
/// # Errors
///
/// Fails on tensor extraction errors or a shape mismatch between the logits
/// and the sampling parameter vectors.
pub fn sample(
    logits: &Tensor,
    params: &SamplingParameters,
    input_params: &InputParameters,
) -> Result<Vec<u32>> {
    let (num_seqs, _vocab) = logits.dims2()?;
    if params.temperatures.len() != num_seqs {
        return Err(Error::Worker(format!(
            "sampling params cover {} sequences, logits have {num_seqs}",
            params.temperatures.len()
        )));
    }

    let history: Vec<Vec<u32>> = if num_seqs > 0 {
        input_params.token_ids.to_vec2()?
    } else {
        Vec::new()
    };
    let seq_lens: Vec<u32> = input_params.seq_lens.to_vec1()?;
    let logits = logits.to_dtype(DType::F32)?;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut next_tokens = Vec::with_capacity(num_seqs);
    for i in 0..num_seqs {
        let mut row: Vec<f32> = logits.narrow(0, i, 1)?.flatten_all()?.to_vec1()?;
        let seen = &history[i][..seq_lens[i] as usize];
        apply_penalties(
            &mut row,
            seen,
            params.repetition_penalties[i],
            params.frequency_penalties[i],
            params.presence_penalties[i],
        );
        next_tokens.push(sample_one(
            &mut row,
            params.temperatures[i],
            params.top_ks[i],
            params.top_ps[i],
            &mut rng,
        ));
    }
    Ok(next_tokens)
}

fn apply_penalties(
    logits: &mut [f32],
    seen_tokens: &[u32],
    repetition: f32,
    frequency: f32,
    presence: f32,
) {
    if repetition == 1.0 && frequency == 0.0 && presence == 0.0 {
        return;
    }
    let mut counts = std::collections::HashMap::new();
    for &token in seen_tokens {
        *counts.entry(token as usize).or_insert(0u32) += 1;
    }
    for (&token, &count) in &counts {
        if token >= logits.len() {
            continue;
        }
        let logit = &mut logits[token];
        if repetition != 1.0 {
            *logit = if *logit > 0.0 {
                *logit / repetition
            } else {
                *logit * repetition
            };
        }
        *logit -= count as f32 * frequency + presence;
    }
}

fn sample_one(
    logits: &mut [f32],
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: &mut StdRng,
) -> u32 {
    // Zero temperature selects greedily.
    if temperature == 0.0 {
        return argmax(logits);
    }
    if temperature != 1.0 {
        for logit in logits.iter_mut() {
            *logit /= temperature;
        }
    }

    // Candidates sorted by logit, truncated to top-k.
    let mut candidates: Vec<(usize, f32)> =
        logits.iter().copied().enumerate().collect();
    candidates
        .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    if top_k > 0 && top_k < candidates.len() {
        candidates.truncate(top_k);
    }

    // Softmax over the candidates.
    let max_logit = candidates.first().map_or(0.0, |c| c.1);
    let mut probs: Vec<f32> = candidates
        .iter()
        .map(|&(_, l)| (l - max_logit).exp())
        .collect();
    let total: f32 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= total;
    }

    // Nucleus truncation, keeping at least one candidate.
    if top_p < 1.0 && top_p > 0.0 {
        let mut cumulative = 0.0;
        let mut keep = probs.len();
        for (idx, &p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= top_p {
                keep = idx + 1;
                break;
            }
        }
        candidates.truncate(keep);
        probs.truncate(keep);
        let total: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= total;
        }
    }

    // Inverse-CDF draw.
    let draw: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (&(token, _), &p) in candidates.iter().zip(probs.iter()) {
        cumulative += p;
        if draw < cumulative {
            return token as u32;
        }
    }
    candidates.last().map_or(0, |&(token, _)| token as u32)
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params_for(n: usize, temperature: f32) -> SamplingParameters {
        SamplingParameters {
            temperatures: vec![temperature; n],
            top_ks: vec![0; n],
            top_ps: vec![1.0; n],
            repetition_penalties: vec![1.0; n],
            frequency_penalties: vec![0.0; n],
            presence_penalties: vec![0.0; n],
            seed: 42,
        }
    }

    fn input_params_for(histories: &[&[u32]], device: &Device) -> InputParameters {
        let n = histories.len();
        let max_len = histories.iter().map(|h| h.len()).max().unwrap_or(0);
        let mut flat = Vec::new();
        let mut lens = Vec::new();
        for h in histories {
            lens.push(h.len() as u32);
            flat.extend_from_slice(h);
            flat.extend(std::iter::repeat(0).take(max_len - h.len()));
        }
        InputParameters {
            num_prompt_tokens: 0,
            cu_seq_lens: Tensor::from_vec(vec![0u32], 1, device).unwrap(),
            max_seq_len: 0,
            slot_ids: Tensor::from_vec(Vec::<u32>::new(), 0, device).unwrap(),
            block_tables: Tensor::from_vec(Vec::<u32>::new(), (0, 0), device).unwrap(),
            context_lens: Tensor::from_vec(Vec::<u32>::new(), 0, device).unwrap(),
            max_context_len: 0,
            last_token_indicies: Tensor::from_vec(vec![0u32; n], n, device).unwrap(),
            token_ids: Tensor::from_vec(flat, (n, max_len), device).unwrap(),
            seq_lens: Tensor::from_vec(lens, n, device).unwrap(),
        }
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9, 0.2], [0.8f32, 0.1, 0.3]], &device).unwrap();
        let params = params_for(2, 0.0);
        let input = input_params_for(&[&[0], &[0]], &device);
        assert_eq!(sample(&logits, &params, &input).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_same_seed_same_tokens() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 1.1, 0.9, 1.05]], &device).unwrap();
        let params = params_for(1, 1.0);
        let input = input_params_for(&[&[0]], &device);
        let a = sample(&logits, &params, &input).unwrap();
        let b = sample(&logits, &params, &input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_repetition_penalty_discourages_seen() {
        let device = Device::Cpu;
        // Token 1 leads but has been emitted already; a strong penalty
        // hands greedy selection to token 0.
        let logits = Tensor::new(&[[1.0f32, 1.2, 0.1]], &device).unwrap();
        let mut params = params_for(1, 0.0);
        params.repetition_penalties[0] = 2.0;
        let input = input_params_for(&[&[1, 1]], &device);
        assert_eq!(sample(&logits, &params, &input).unwrap(), vec![0]);
    }

    #[test]
    fn test_top_k_restricts_support() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[5.0f32, 4.0, -10.0, -10.0]], &device).unwrap();
        let mut params = params_for(1, 1.0);
        params.top_ks[0] = 2;
        let input = input_params_for(&[&[0]], &device);
        for seed in 0..20 {
            params.seed = seed;
            let token = sample(&logits, &params, &input).unwrap()[0];
            assert!(token < 2, "token {token} escaped the top-2 support");
        }
    }
}
