//! Сквозные проверки модели на случайных весах.

use asr_core::{collate, AsrError, Utterance, EOS_ID};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model_las::{DecodeOptions, LasConfig, LasModel, ScriptedForcing};

fn small_config() -> LasConfig {
    LasConfig {
        input_dim: 40,
        enc_hidden_dim: 8,
        enc_n_layers: 2,
        subsample: vec![1, 2],
        dropout_rate: 0.2,
        dec_hidden_dim: 12,
        att_dim: 6,
        conv_channels: 3,
        conv_kernel_size: 5,
        att_odim: 10,
        output_dim: 20,
        ..LasConfig::wsj()
    }
}

fn build(config: LasConfig) -> (VarMap, LasModel) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = LasModel::new(config, vb).expect("model");
    (varmap, model)
}

fn features(lens: &[usize], dim: usize) -> Tensor {
    Tensor::randn(0f32, 1f32, (lens.len(), lens[0], dim), &Device::Cpu).unwrap()
}

#[test]
fn test_end_to_end_with_targets() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let targets = vec![vec![3, 4, 5, 6], vec![7, 8, 9]];

    let out = model
        .forward(&x, &lens, Some(&targets), &DecodeOptions::default())
        .unwrap();

    // самая длинная цель + <EOS>
    assert_eq!(out.log_probs.dims(), &[2, 5]);
    assert_eq!(out.predictions.dims(), &[2, 5]);
    assert_eq!(out.attention.len(), 5);
    assert_eq!(out.attention[0].len(), 4);
    // 12 → 3 → 2, 8 → 2 → 1
    assert_eq!(out.encoder_lens, vec![2, 1]);
}

#[test]
fn test_free_running_produces_fixed_length() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let opts = DecodeOptions::default().with_max_dec_timesteps(10);
    let out = model.forward(&x, &lens, None, &opts).unwrap();
    assert_eq!(out.predictions.dims(), &[2, 10]);
    assert_eq!(out.log_probs.dims(), &[2, 10]);

    let hyps = model.recognize(&x, &lens, 10).unwrap();
    assert_eq!(hyps.len(), 2);
    for h in &hyps {
        assert!(h.len() <= 10);
        assert!(!h.contains(&EOS_ID));
    }
}

#[test]
fn test_teacher_forcing_extremes() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let targets = vec![vec![3, 4, 5, 6], vec![7, 8, 9, 10]];

    let forced = model
        .forward(&x, &lens, Some(&targets), &DecodeOptions::default().with_tf_rate(1.0))
        .unwrap();
    assert!(forced.teacher_forced.iter().all(|&f| f));

    let free = model
        .forward(&x, &lens, Some(&targets), &DecodeOptions::default().with_tf_rate(0.0))
        .unwrap();
    assert_eq!(free.teacher_forced, vec![true, false, false, false, false]);
}

#[test]
fn test_same_seed_is_deterministic() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let targets = vec![vec![3, 4, 5, 6], vec![7, 8, 9]];
    let opts = DecodeOptions::default().with_tf_rate(0.5).with_seed(11);

    let a = model.forward(&x, &lens, Some(&targets), &opts).unwrap();
    let b = model.forward(&x, &lens, Some(&targets), &opts).unwrap();
    assert_eq!(a.teacher_forced, b.teacher_forced);
    let pa: Vec<Vec<u32>> = a.predictions.to_vec2().unwrap();
    let pb: Vec<Vec<u32>> = b.predictions.to_vec2().unwrap();
    assert_eq!(pa, pb);
}

#[test]
fn test_injected_policy() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let targets = vec![vec![3, 4, 5], vec![6]];
    let mut policy = ScriptedForcing::new(vec![true, false, true, false], true);
    let out = model
        .forward_with_policy(&x, &lens, Some(&targets), &DecodeOptions::default(), &mut policy)
        .unwrap();
    assert_eq!(out.teacher_forced, vec![true, false, true, false]);
}

#[test]
fn test_training_mode_applies_dropout() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let targets = vec![vec![3, 4], vec![5]];
    let total = |opts: &DecodeOptions| -> f32 {
        let out = model.forward(&x, &lens, Some(&targets), opts).unwrap();
        assert_eq!(out.log_probs.dims(), &[2, 3]);
        assert!(out.teacher_forced.iter().all(|&f| f));
        out.log_probs.sum_all().unwrap().to_scalar().unwrap()
    };

    let eval = DecodeOptions::e2e();
    assert_eq!(total(&eval), total(&eval));
    assert_ne!(total(&eval.clone().training(true)), total(&eval));
}

#[test]
fn test_out_of_range_token_is_invalid_input() {
    let (_varmap, model) = build(small_config());
    let lens = [12, 8];
    let x = features(&lens, 40);
    let vocab = model.config().vocab_size() as u32;
    let targets = vec![vec![3, vocab], vec![4]];
    let res = model.forward(&x, &lens, Some(&targets), &DecodeOptions::default());
    assert!(matches!(res, Err(AsrError::InvalidInput(_))));
}

#[test]
fn test_shape_errors() {
    let (_varmap, model) = build(small_config());

    // длины не по убыванию
    let x = features(&[12, 12], 40);
    assert!(matches!(
        model.forward(&x, &[8, 12], None, &DecodeOptions::default()),
        Err(AsrError::Shape(_))
    ));

    // длина вектора длин не равна батчу
    assert!(matches!(
        model.forward(&x, &[12], None, &DecodeOptions::default()),
        Err(AsrError::Shape(_))
    ));

    // неверная размерность признаков
    let x = features(&[12], 39);
    assert!(matches!(
        model.forward(&x, &[12], None, &DecodeOptions::default()),
        Err(AsrError::Shape(_))
    ));
}

#[test]
fn test_collated_batch_feeds_model() {
    let (_varmap, model) = build(small_config());
    let utts = vec![
        Utterance::new("short", vec![0.1; 8 * 40], 40, vec![3, 4]).unwrap(),
        Utterance::new("long", vec![0.2; 12 * 40], 40, vec![5, 6, 7]).unwrap(),
    ];
    let batch = collate(utts, &Device::Cpu).unwrap();
    assert_eq!(batch.ids, vec!["long", "short"]);
    let out = model
        .forward(
            &batch.features,
            &batch.lengths,
            Some(&batch.targets),
            &DecodeOptions::default(),
        )
        .unwrap();
    assert_eq!(out.log_probs.dims(), &[2, 4]);
}
