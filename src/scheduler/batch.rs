//! Continuous-batching scheduler.
//!
//! Drives the engine step loop: admits waiting sequences while blocks and
//! batch budgets allow, folds sampled tokens back into their sequences,
//! reclaims blocks of finished sequences before the next step packs, and
//! resolves decode-time block exhaustion by preemption.
//!
//! Preemption policy: when a running sequence is ejected from a step
//! because the pool ran dry, the victim is the most recently admitted
//! running sequence (the one with the most remaining work). Its blocks are
//! released and it re-enters the front of the wait queue for a fresh
//! prefill; the ejected sequence itself retries on the next step.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use crate::core::block::blocks_needed;
use crate::core::block_manager::BlockManager;
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Scheduler limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum sequences per step.
    pub max_num_seqs: usize,
    /// Maximum prefill tokens admitted per step.
    pub max_prefill_tokens: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_prefill_tokens: 4096,
        }
    }
}

/// A completed request.
#[derive(Debug, Clone)]
pub struct FinishedOutput {
    pub seq_id: SequenceId,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    pub finish_reason: FinishReason,
    /// Decoded text, when the engine has a tokenizer.
    pub text: Option<String>,
}

/// Continuous-batching scheduler over one engine.
pub struct Scheduler {
    config: SchedulerConfig,
    sequences: HashMap<SequenceId, Sequence>,
    waiting: VecDeque<SequenceId>,
    /// Running sequence ids in admission order; the tail is the youngest.
    running: Vec<SequenceId>,
}

impl Scheduler {
    /// Create a scheduler with the given limits.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            sequences: HashMap::new(),
            waiting: VecDeque::new(),
            running: Vec::new(),
        }
    }

    /// Queue a sequence for admission.
    pub fn add_sequence(&mut self, seq: Sequence) {
        let seq_id = seq.seq_id();
        self.sequences.insert(seq_id, seq);
        self.waiting.push_back(seq_id);
    }

    /// Cancel a request. Takes effect at the next step boundary, when the
    /// sequence's blocks are reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown id.
    pub fn cancel(&mut self, seq_id: SequenceId) -> Result<()> {
        let seq = self
            .sequences
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        seq.finish(FinishReason::Cancelled);
        Ok(())
    }

    /// Number of sequences waiting for admission.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Number of running sequences.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Whether any sequence is still waiting or running.
    pub fn has_unfinished(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    /// Pick the sequences for the next step: running decodes first, then
    /// admissions from the wait queue while budgets and free blocks allow.
    fn schedule(&mut self, block_manager: &BlockManager) -> Vec<SequenceId> {
        let mut batch: Vec<SequenceId> = Vec::new();
        for &seq_id in &self.running {
            if batch.len() >= self.config.max_num_seqs {
                break;
            }
            batch.push(seq_id);
        }

        let block_size = block_manager.block_size();
        let mut pending_blocks = 0usize;
        let mut prefill_tokens = 0usize;
        while batch.len() < self.config.max_num_seqs {
            let Some(&seq_id) = self.waiting.front() else {
                break;
            };
            let Some(seq) = self.sequences.get(&seq_id) else {
                self.waiting.pop_front();
                continue;
            };
            if seq.is_finished() {
                // Cancelled while waiting; drop from the queue, the step
                // cleanup returns it.
                self.waiting.pop_front();
                continue;
            }
            let prompt_len = seq.prompt_len();
            if prefill_tokens + prompt_len > self.config.max_prefill_tokens && !batch.is_empty() {
                break;
            }
            let needed = blocks_needed(prompt_len, block_size);
            if !block_manager.can_allocate(pending_blocks + needed) {
                break;
            }
            self.waiting.pop_front();
            pending_blocks += needed;
            prefill_tokens += prompt_len;
            self.running.push(seq_id);
            batch.push(seq_id);
            debug!(seq_id, prompt_len, "admitted sequence");
        }
        batch
    }

    // Collect sequences already finished (cancelled) and reclaim blocks.
    fn reap_finished(&mut self, engine: &mut Engine) -> Vec<FinishedOutput> {
        let finished_ids: Vec<SequenceId> = self
            .sequences
            .iter()
            .filter(|(_, s)| s.is_finished())
            .map(|(&id, _)| id)
            .collect();
        let mut outputs = Vec::new();
        for seq_id in finished_ids {
            if let Some(mut seq) = self.sequences.remove(&seq_id) {
                if let Some(bm) = engine.block_manager_mut() {
                    bm.release(&mut seq);
                }
                self.running.retain(|&id| id != seq_id);
                self.waiting.retain(|&id| id != seq_id);
                outputs.push(self.finished_output(&seq, engine));
            }
        }
        outputs
    }

    fn finished_output(&self, seq: &Sequence, engine: &Engine) -> FinishedOutput {
        let output_token_ids = seq.output_token_ids().to_vec();
        let text = engine
            .tokenizer()
            .and_then(|_| engine.decode(&output_token_ids).ok());
        FinishedOutput {
            seq_id: seq.seq_id(),
            prompt_token_ids: seq.prompt_token_ids().to_vec(),
            output_token_ids,
            finish_reason: seq.finish_reason().unwrap_or(FinishReason::Cancelled),
            text,
        }
    }

    /// Run one engine step: schedule, execute, apply outputs, reclaim.
    ///
    /// # Errors
    ///
    /// Worker failures are fatal and surface unchanged; block exhaustion is
    /// absorbed by deferral and preemption.
    pub fn step(&mut self, engine: &mut Engine) -> Result<Vec<FinishedOutput>> {
        let mut outputs = self.reap_finished(engine);

        let Some(block_manager) = engine.block_manager() else {
            return Err(Error::Config("scheduler step before engine init".to_string()));
        };
        let batch_ids = self.schedule(block_manager);
        if batch_ids.is_empty() {
            return Ok(outputs);
        }

        // Move the batch out of the map for the duration of the step.
        let mut batch: Vec<Sequence> = Vec::with_capacity(batch_ids.len());
        for seq_id in &batch_ids {
            let seq = self
                .sequences
                .remove(seq_id)
                .ok_or(Error::SequenceNotFound(*seq_id))?;
            batch.push(seq);
        }

        let step = engine.execute_model(&mut batch)?;
        let eos = engine.eos_token_id();

        let mut tokens = step.next_tokens.into_iter();
        for seq in &mut batch {
            if step.ejected.contains(&seq.seq_id()) {
                continue;
            }
            let token = tokens
                .next()
                .ok_or_else(|| Error::Worker("step returned too few tokens".to_string()))?;
            let reason = {
                seq.append_token(token)?;
                seq.finish_reason_for(token, eos)
            };
            if let Some(reason) = reason {
                seq.finish(reason);
            }
        }

        // Reclaim finished sequences before anything else packs.
        for mut seq in batch {
            if seq.is_finished() {
                info!(seq_id = seq.seq_id(), reason = ?seq.finish_reason(), "sequence finished");
                if let Some(bm) = engine.block_manager_mut() {
                    bm.release(&mut seq);
                }
                self.running.retain(|&id| id != seq.seq_id());
                outputs.push(self.finished_output(&seq, engine));
            } else {
                self.sequences.insert(seq.seq_id(), seq);
            }
        }

        if !step.ejected.is_empty() {
            self.preempt_youngest(engine);
        }

        Ok(outputs)
    }

    // Release the most recently admitted running sequence and send it back
    // to the front of the wait queue for a fresh prefill.
    fn preempt_youngest(&mut self, engine: &mut Engine) {
        let Some(victim_id) = self.running.pop() else {
            return;
        };
        if let Some(seq) = self.sequences.get_mut(&victim_id) {
            if let Some(bm) = engine.block_manager_mut() {
                bm.release(seq);
            }
            seq.restart();
            self.waiting.push_front(victim_id);
            info!(seq_id = victim_id, "preempted sequence for block pressure");
        }
    }

    /// Step until every queued sequence completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if a waiting sequence can never be
    /// admitted (its prompt exceeds the whole cache), or any fatal step
    /// error.
    pub fn run_to_completion(&mut self, engine: &mut Engine) -> Result<Vec<FinishedOutput>> {
        let mut all = Vec::new();
        while self.has_unfinished() {
            let outputs = self.step(engine)?;
            let stalled =
                outputs.is_empty() && self.running.is_empty() && !self.waiting.is_empty();
            all.extend(outputs);
            if stalled {
                return Err(Error::OutOfBlocks);
            }
        }
        Ok(all)
    }
}
