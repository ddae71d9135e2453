//! Integration tests for sequence state.

use pagedserve::core::sequence::{FinishReason, SamplingParams, Sequence, SequencePhase};

#[test]
fn test_admission_state() {
    let seq = Sequence::new(7, vec![5, 6, 7], SamplingParams::default());
    assert_eq!(seq.seq_id(), 7);
    assert_eq!(seq.phase(), SequencePhase::Prefill);
    assert_eq!(seq.total_tokens(), 3);
    assert!(seq.block_table().is_empty());
    assert_eq!(seq.last_token_id(), 7);
}

#[test]
fn test_first_token_enters_decode() {
    let mut seq = Sequence::new(1, vec![1, 2], SamplingParams::default());
    seq.append_token(9).unwrap();
    assert_eq!(seq.phase(), SequencePhase::Decode);
    assert_eq!(seq.output_token_ids(), &[9]);
    assert_eq!(seq.total_tokens(), 3);
    assert_eq!(seq.last_token_id(), 9);
}

#[test]
fn test_transitions_are_monotonic() {
    let mut seq = Sequence::new(1, vec![1], SamplingParams::default());
    seq.append_token(2).unwrap();
    seq.finish(FinishReason::MaxTokens);
    assert!(seq.is_finished());
    // No way back from Finished.
    assert!(seq.append_token(3).is_err());
    assert_eq!(seq.output_len(), 1);
}

#[test]
fn test_stop_token_rules() {
    let params = SamplingParams {
        stop_token_ids: vec![42],
        max_new_tokens: 3,
        ..Default::default()
    };
    let mut seq = Sequence::new(1, vec![1, 2, 3], params);
    seq.append_token(10).unwrap();

    assert_eq!(seq.finish_reason_for(42, 0), Some(FinishReason::Stop));
    assert_eq!(seq.finish_reason_for(0, 0), Some(FinishReason::Stop));
    assert_eq!(seq.finish_reason_for(10, 0), None);

    seq.append_token(11).unwrap();
    seq.append_token(12).unwrap();
    assert_eq!(seq.finish_reason_for(12, 0), Some(FinishReason::MaxTokens));
}

#[test]
fn test_all_token_ids_concatenates() {
    let mut seq = Sequence::new(1, vec![1, 2, 3], SamplingParams::default());
    seq.append_token(10).unwrap();
    seq.append_token(20).unwrap();
    assert_eq!(seq.all_token_ids(), vec![1, 2, 3, 10, 20]);
}
