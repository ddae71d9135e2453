//! Integration tests for the device worker.

mod common;

use candle_core::{DType, Device};
use pagedserve::batch::packer::prepare_inputs;
use pagedserve::core::block_manager::BlockManager;
use pagedserve::core::kv_cache::KvCacheShape;
use pagedserve::core::sequence::{SamplingParams, Sequence};
use pagedserve::model::{ModelRegistry, StateDict};
use pagedserve::parallel::ParallelArgs;
use pagedserve::worker::Worker;
use pagedserve::Error;

fn tiny_args() -> pagedserve::model::ModelArgs {
    let registry = ModelRegistry::with_builtin_models();
    let entry = registry.lookup("llama").unwrap();
    (entry.args_loader)(&common::tiny_llama_config()).unwrap()
}

fn init_worker(worker: &Worker) {
    let registry = ModelRegistry::with_builtin_models();
    let factory = registry.lookup("llama").unwrap().factory;
    worker
        .init_model(DType::F32, tiny_args(), Default::default(), factory)
        .unwrap();
}

#[test]
fn test_verify_reports_missing_weights() {
    let worker = Worker::new(ParallelArgs::single(), Device::Cpu);
    init_worker(&worker);

    // Stream only the embedding; verification must name missing params.
    let full = common::tiny_llama_state_dict(&Device::Cpu, common::HeadKind::Random);
    let partial = StateDict::from_tensors(
        [(
            "model.embed_tokens.weight".to_string(),
            full.get("model.embed_tokens.weight").unwrap().clone(),
        )]
        .into_iter()
        .collect(),
    );
    worker.load_state_dict(partial).unwrap();

    let err = worker.verify_loaded_weights().unwrap_err();
    match err {
        Error::MissingWeights(names) => {
            assert!(names.contains(&"model.layers.0.self_attn.q_proj.weight".to_string()));
            assert!(names.contains(&"model.norm.weight".to_string()));
            assert!(!names.contains(&"model.embed_tokens.weight".to_string()));
        }
        other => panic!("expected MissingWeights, got {other:?}"),
    }
}

#[test]
fn test_multi_shard_load_completes() {
    let worker = Worker::new(ParallelArgs::single(), Device::Cpu);
    init_worker(&worker);

    // Split the checkpoint into two shards along name order.
    let full = common::tiny_llama_state_dict(&Device::Cpu, common::HeadKind::Random);
    let names: Vec<String> = full.keys().cloned().collect();
    let (first, second) = names.split_at(names.len() / 2);
    for part in [first, second] {
        let shard = StateDict::from_tensors(
            part.iter()
                .map(|n| (n.clone(), full.get(n).unwrap().clone()))
                .collect(),
        );
        worker.load_state_dict(shard).unwrap();
    }
    worker.verify_loaded_weights().unwrap();
}

#[test]
fn test_sharded_key_cache_shape() {
    // 8 kv heads over 2 workers, head_dim 128, f16: x = 8, so the
    // per-worker key tensor is [N, 4, 16, B, 8].
    let shape = KvCacheShape::new(128, 16, 8 / 2, 128, DType::F16).unwrap();
    assert_eq!(shape.key_shape(), vec![128, 4, 16, 16, 8]);
    assert_eq!(shape.value_shape(), vec![128, 4, 128, 16]);
}

#[test]
fn test_execute_model_samples_per_sequence() {
    let worker = Worker::new(ParallelArgs::single(), Device::Cpu);
    init_worker(&worker);
    worker
        .load_state_dict(common::tiny_llama_state_dict(&Device::Cpu, common::HeadKind::Random))
        .unwrap();
    worker.verify_loaded_weights().unwrap();

    let shape = KvCacheShape::new(16, 8, 2, 4, DType::F32).unwrap();
    worker.init_kv_cache(shape).unwrap();

    let mut manager = BlockManager::new(16, 8);
    let mut seqs = vec![
        Sequence::new(0, vec![1, 4, 5], SamplingParams::default()),
        Sequence::new(1, vec![6, 7, 8, 9], SamplingParams::default()),
    ];
    let batch = prepare_inputs(&mut seqs, &mut manager, 7, &Device::Cpu).unwrap();
    let output = worker
        .execute_model(
            batch.token_ids,
            batch.positions,
            batch.input_params,
            batch.sampling_params,
        )
        .unwrap();

    assert_eq!(output.next_tokens.len(), 2);
    for &token in &output.next_tokens {
        assert!((token as usize) < common::VOCAB);
    }
}

#[test]
fn test_async_operations_run_in_submission_order() {
    let worker = Worker::new(ParallelArgs::single(), Device::Cpu);
    let registry = ModelRegistry::with_builtin_models();
    let factory = registry.lookup("llama").unwrap().factory;

    // Queue init, load, and verify without waiting in between.
    let f1 = worker.init_model_async(DType::F32, tiny_args(), Default::default(), factory);
    let f2 = worker.load_state_dict_async(common::tiny_llama_state_dict(&Device::Cpu, common::HeadKind::Random));
    let f3 = worker.verify_loaded_weights_async();

    f1.wait().unwrap();
    f2.wait().unwrap();
    f3.wait().unwrap();
}

#[test]
fn test_execute_before_init_fails() {
    let worker = Worker::new(ParallelArgs::single(), Device::Cpu);
    init_worker(&worker);
    worker
        .load_state_dict(common::tiny_llama_state_dict(&Device::Cpu, common::HeadKind::Random))
        .unwrap();

    // No KV cache allocated yet.
    let mut manager = BlockManager::new(4, 8);
    let mut seqs = vec![Sequence::new(0, vec![1, 2], SamplingParams::default())];
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();
    let err = worker.execute_model(
        batch.token_ids,
        batch.positions,
        batch.input_params,
        batch.sampling_params,
    );
    assert!(err.is_err());
}
