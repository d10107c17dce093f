//! Обучение на маленьких синтетических батчах.

use candle_core::{DType, Device, Var};
use lvsr_core::{
    AsrError, AsrResult, AttentionConfig, AttentionType, Batch, DataStream, FeatureExample,
    FeatureExtractorConfig, FeatureSequence, MonitoringConfig, NetConfig, PhonemeAlphabet,
    RecognizerConfig,
};
use lvsr_model::PhonemeRecognizer;
use lvsr_train::monitor::{batch_loss, TOTAL_GRADIENT_NORM};
use lvsr_train::{
    CheckpointStore, CompositeRule, FinishReason, GradientDescent, LoopState, MainLoop,
};

struct VecStream(Vec<Batch>);

impl DataStream for VecStream {
    type Item = Batch;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<Batch>> + '_> {
        Box::new(self.0.iter().cloned().map(Ok))
    }
}

fn alphabet() -> PhonemeAlphabet {
    let symbols = ["aa", "b", "k", "h#", "s"].iter().map(|s| s.to_string()).collect();
    PhonemeAlphabet::new(symbols, "h#").unwrap()
}

fn config(seed: u64) -> RecognizerConfig {
    RecognizerConfig {
        net: NetConfig {
            dim_dec: 6,
            dim_bidir: 4,
            dims_bottom: vec![5],
            ..NetConfig::default()
        },
        features: FeatureExtractorConfig {
            n_fft: 8,
            hop_length: 4,
            ..FeatureExtractorConfig::default()
        },
        monitoring: MonitoringConfig {
            average_every_n_batches: 2,
            print_every_n_batches: 1,
        },
        seed,
        ..RecognizerConfig::default()
    }
}

fn example(id: &str, frames: usize, labels: &[u32], shift: f32) -> FeatureExample {
    let data = (0..frames * 5).map(|i| (i as f32 * 0.41 + shift).cos()).collect();
    FeatureExample {
        id: id.into(),
        features: FeatureSequence::new(data, frames, 5).unwrap(),
        labels: labels.to_vec(),
    }
}

/// Записи длины {5, 3}, метки длины {4, 2}.
fn uneven_batch() -> Batch {
    Batch::from_examples(
        &[
            example("a", 5, &[0, 1, 2, 3], 0.0),
            example("b", 3, &[4, 3], 1.0),
        ],
        3,
    )
    .unwrap()
}

fn other_batch() -> Batch {
    Batch::from_examples(
        &[example("c", 4, &[2, 2, 3], 2.0), example("d", 6, &[1, 3], 3.0)],
        3,
    )
    .unwrap()
}

fn values(var: &Var) -> Vec<f32> {
    var.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn attention_config(kind: AttentionType, seed: u64) -> RecognizerConfig {
    let mut config = config(seed);
    config.net.attention = AttentionConfig {
        kind,
        shift_predictor_dims: vec![3],
        max_left: 1,
        max_right: 2,
    };
    config
}

/// Параметры, которые есть только у данного варианта внимания.
fn mechanism_params(kind: AttentionType) -> &'static [&'static str] {
    match kind {
        AttentionType::Content => &[],
        AttentionType::ContentAndCumsum => &["recognizer.generator.attention.cumsum_weights"],
        AttentionType::Hybrid | AttentionType::Hybrid2 => &[
            "recognizer.generator.attention.predictor.linear_0.weight",
            "recognizer.generator.attention.predictor.output.weight",
            "recognizer.generator.attention.predictor.output.bias",
        ],
    }
}

#[test]
fn test_gradients_reach_every_participating_parameter() {
    for (seed, kind) in [
        AttentionType::Content,
        AttentionType::ContentAndCumsum,
        AttentionType::Hybrid,
        AttentionType::Hybrid2,
    ]
    .into_iter()
    .enumerate()
    {
        let config = attention_config(kind, seed as u64 + 1);
        let recognizer = PhonemeRecognizer::new(&config, &alphabet(), &Device::Cpu).unwrap();
        let orphan = Var::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut params = recognizer.params();
        let before: Vec<(String, Vec<f32>)> =
            params.iter().map(|(n, v)| (n.clone(), values(v))).collect();
        params.push(("orphan".into(), orphan.clone()));

        let rule = CompositeRule::from_config(&config.optimizer);
        let mut algorithm = GradientDescent::new(params, rule);

        let cost = recognizer.cost(&uneven_batch()).unwrap();
        let loss = batch_loss(&cost).unwrap();
        let loss_value = loss.to_scalar::<f32>().unwrap();
        assert!(loss_value.is_finite() && loss_value > 0.0, "{kind:?}");

        let stats = algorithm.step(&loss).unwrap();
        assert!(
            stats.total_gradient_norm.is_finite() && stats.total_gradient_norm > 0.0,
            "{kind:?}"
        );
        assert_eq!(stats.grad_norms.len(), recognizer.params().len());
        for (name, norm) in &stats.grad_norms {
            assert!(*norm > 0.0, "{kind:?}: zero gradient for {name}");
        }

        assert_eq!(values(&orphan), vec![1.0; 4]);
        let after = recognizer.params();
        let changed = |name: &str| {
            let (_, old) = before.iter().find(|(n, _)| n == name).unwrap();
            let (_, var) = after.iter().find(|(n, _)| n == name).unwrap();
            values(var) != *old
        };
        for name in mechanism_params(kind) {
            assert!(
                stats.grad_norms.iter().any(|(n, norm)| n == name && *norm > 0.0),
                "{kind:?}: no gradient for {name}"
            );
            assert!(changed(name), "{kind:?}: {name} not updated");
        }
        assert!(before.iter().any(|(name, _)| changed(name)));
    }
}

#[test]
fn test_loop_finishes_after_num_batches() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("run"));
    let recognizer = PhonemeRecognizer::new(&config(2), &alphabet(), &Device::Cpu).unwrap();

    let mut main_loop = MainLoop::new(
        recognizer,
        config(2),
        VecStream(vec![uneven_batch(), other_batch()]),
    )
    .with_validation(Box::new(VecStream(vec![other_batch()])))
    .with_checkpoints(store.clone())
    .finish_after_batches(3);

    let state = main_loop.run().unwrap();
    assert_eq!(state, LoopState::Finished(FinishReason::NumBatches));
    main_loop.ensure_converged().unwrap();

    let log = main_loop.log();
    assert_eq!(log.status.iterations_done, 3);
    assert_eq!(log.status.epochs_done, 1);
    assert!(log.get(0, "valid_sequence_log_likelihood").is_some());
    assert!(log.get(2, "valid_phoneme_log_likelihood").is_some());
    for iteration in 1..=3 {
        assert!(log.get(iteration, TOTAL_GRADIENT_NORM).unwrap().is_finite());
    }
    assert!(log.get(2, "average_sequence_log_likelihood").is_some());
    assert!(log.get(2, "average_weights_entropy").is_some());
    assert!(log.get(2, "average_recognizer.encoder.fork.weight_grad_norm").is_some());
    assert!(log.get(3, "average_sequence_log_likelihood").is_none());

    assert!(store.exists());
    let saved = store.load_state().unwrap();
    assert_eq!(saved.log.status.finish_reason, Some(FinishReason::NumBatches));
    assert_eq!(saved.log.status.iterations_done, 3);
}

#[test]
fn test_nan_gradient_aborts_after_batch() {
    let mut poisoned = other_batch();
    poisoned.recordings[0] = f32::NAN;
    let recognizer = PhonemeRecognizer::new(&config(3), &alphabet(), &Device::Cpu).unwrap();

    let mut main_loop = MainLoop::new(
        recognizer,
        config(3),
        VecStream(vec![uneven_batch(), poisoned, other_batch()]),
    )
    .finish_after_batches(10);

    let state = main_loop.run().unwrap();
    assert_eq!(state, LoopState::Aborted);
    let log = main_loop.log();
    assert_eq!(log.status.iterations_done, 2);
    assert_eq!(log.status.finish_reason, Some(FinishReason::Divergence));
    assert!(log.get(2, TOTAL_GRADIENT_NORM).unwrap().is_nan());
    assert!(matches!(
        main_loop.ensure_converged(),
        Err(AsrError::Numerical(_))
    ));

    for (name, var) in main_loop.recognizer().params() {
        assert!(values(&var).iter().all(|v| v.is_finite()), "{name} is not finite");
    }
}

#[test]
fn test_resume_restores_params_and_progress() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let recognizer = PhonemeRecognizer::new(&config(4), &alphabet(), &Device::Cpu).unwrap();
    let mut first = MainLoop::new(recognizer, config(4), VecStream(vec![uneven_batch()]))
        .with_checkpoints(store.clone())
        .finish_after_batches(2);
    first.run().unwrap();
    let trained = first.into_recognizer();

    let restored = PhonemeRecognizer::new(&config(5), &alphabet(), &Device::Cpu).unwrap();
    let state = store.restore(&restored).unwrap();
    for ((_, a), (_, b)) in trained.params().iter().zip(restored.params().iter()) {
        assert_eq!(values(a), values(b));
    }
    assert_eq!(state.log.status.iterations_done, 2);
    assert_eq!(state.log.status.epochs_done, 1);

    let mut second = MainLoop::new(restored, state.config, VecStream(vec![uneven_batch()]))
        .with_checkpoints(store.clone())
        .resume_from(state.log)
        .finish_after_batches(4);
    assert_eq!(second.run().unwrap(), LoopState::Finished(FinishReason::NumBatches));
    assert_eq!(second.log().status.iterations_done, 4);
    assert_eq!(second.log().status.epochs_done, 2);
    assert_eq!(store.load_state().unwrap().log.status.iterations_done, 4);
}
