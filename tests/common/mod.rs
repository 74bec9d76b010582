//! Shared fixtures: a tiny SMQ model file on disk and a recording
//! telemetry sink.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use quern::model::hparams::SpecialTokenIds;
use quern::model::{
    write_smq, Activation, HParams, ModelMetadata, NormKind, SmqTensor, TokenizerMetadata,
};
use quern::telemetry::{TelemetryEvent, TelemetrySink};
use quern::tensor::QuantScheme;

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub model_path: PathBuf,
}

pub fn tiny_hparams(context_length: usize) -> HParams {
    HParams {
        vocab_size: 64,
        context_length,
        hidden_size: 16,
        n_heads: 4,
        n_kv_heads: 2,
        n_layers: 2,
        intermediate_size: 32,
        norm: NormKind::RmsNorm,
        activation: Activation::Swiglu,
        rope_theta: Some(10_000.0),
        norm_eps: 1e-5,
    }
}

/// 64-entry vocabulary: four specials then printable characters.
fn tiny_vocab() -> Vec<String> {
    let mut vocab = vec![
        "<s>".to_string(),
        "</s>".to_string(),
        "<pad>".to_string(),
        "<unk>".to_string(),
    ];
    let chars = "abcdefghijklmnopqrstuvwxyz0123456789 .,!?:;'\"()-\n<|>";
    vocab.extend(chars.chars().map(|c| c.to_string()));
    let mut extra = 0;
    while vocab.len() < 64 {
        vocab.push(format!("<extra_{}>", extra));
        extra += 1;
    }
    vocab.truncate(64);
    vocab
}

fn pseudo_f32(n: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15) | 1;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (((state >> 40) as f32 / (1 << 24) as f32) * 2.0 - 1.0) * 0.15
        })
        .collect()
}

fn f32_tensor(name: &str, shape: Vec<usize>, seed: u64) -> SmqTensor {
    let n: usize = shape.iter().product();
    let values = pseudo_f32(n, seed);
    let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    SmqTensor {
        name: name.to_string(),
        scheme: QuantScheme::F32,
        shape,
        data,
    }
}

fn ones_tensor(name: &str, n: usize) -> SmqTensor {
    SmqTensor {
        name: name.to_string(),
        scheme: QuantScheme::F32,
        shape: vec![n],
        data: vec![1.0f32; n]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
    }
}

/// Write a complete tiny model to a temp dir.
///
/// `with_eos = false` leaves the EOS id out of the metadata, for tests
/// that need generation to run to its token limit.
pub fn write_tiny_model(context_length: usize, with_eos: bool) -> Fixture {
    write_custom_model(tiny_hparams(context_length), with_eos)
}

/// Same fixture with caller-chosen hyperparameters (the vocabulary is
/// still the 64-entry table, so keep `vocab_size` at 64).
pub fn write_custom_model(hp: HParams, with_eos: bool) -> Fixture {
    let specials = SpecialTokenIds {
        bos: Some(0),
        eos: if with_eos { Some(1) } else { None },
        pad: Some(2),
        unk: Some(3),
    };
    let metadata = ModelMetadata {
        name: "tiny-fixture".to_string(),
        arch: "decoder".to_string(),
        hparams: hp.clone(),
        tokenizer: TokenizerMetadata {
            mode: Some("table".to_string()),
            vocab: Some(tiny_vocab()),
            merges: None,
            specials,
            chat_template_style: Some("plain".to_string()),
        },
    };

    let h = hp.hidden_size;
    let kv = hp.kv_dim();
    let inter = hp.intermediate_size;
    let mut tensors = vec![
        f32_tensor("token_embd.weight", vec![hp.vocab_size, h], 11),
        ones_tensor("output_norm.weight", h),
        f32_tensor("output.weight", vec![hp.vocab_size, h], 13),
    ];
    for l in 0..hp.n_layers {
        let seed = 100 + l as u64 * 17;
        tensors.push(ones_tensor(&format!("blk.{}.attn_norm.weight", l), h));
        tensors.push(f32_tensor(&format!("blk.{}.attn_q.weight", l), vec![h, h], seed));
        tensors.push(f32_tensor(&format!("blk.{}.attn_k.weight", l), vec![kv, h], seed + 1));
        tensors.push(f32_tensor(&format!("blk.{}.attn_v.weight", l), vec![kv, h], seed + 2));
        tensors.push(f32_tensor(&format!("blk.{}.attn_output.weight", l), vec![h, h], seed + 3));
        tensors.push(ones_tensor(&format!("blk.{}.ffn_norm.weight", l), h));
        tensors.push(f32_tensor(&format!("blk.{}.ffn_gate.weight", l), vec![inter, h], seed + 4));
        tensors.push(f32_tensor(&format!("blk.{}.ffn_up.weight", l), vec![inter, h], seed + 5));
        tensors.push(f32_tensor(&format!("blk.{}.ffn_down.weight", l), vec![h, inter], seed + 6));
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let model_path = dir.path().join("tiny.smq");
    write_smq(&model_path, &metadata, &tensors).expect("write model");
    Fixture { dir, model_path }
}

/// Telemetry sink that stores events for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<TelemetryEvent>>,
}

impl TelemetrySink for RecordingSink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

impl RecordingSink {
    pub fn shared() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    pub fn count<F: Fn(&TelemetryEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}
