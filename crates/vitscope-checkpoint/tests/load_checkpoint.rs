//! Integration tests for loading checkpoint files from disk
//!
//! `.pth` fixtures are assembled by hand: a protocol 2 pickle shaped like the
//! output of `torch.save`, packed into a zip archive next to its storage
//! members.

use safetensors::tensor::TensorView;
use safetensors::Dtype;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};
use vitscope_checkpoint::{
    analyze_model_structure, load_model, Checkpoint, CheckpointEntry, DType, Error,
};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A value in a mock `torch.save` payload
enum MockValue {
    Tensor {
        storage: &'static str,
        elem: usize,
        shape: Vec<usize>,
    },
    /// A float tensor with an explicit shape and stride over a 4-element
    /// storage
    View {
        shape: Vec<usize>,
        stride: Vec<usize>,
    },
    Int(usize),
    Float(f64),
    EmptyList,
    Dict(Vec<(&'static str, MockValue)>),
    OrderedDict(Vec<(&'static str, MockValue)>),
}

fn tensor(shape: &[usize]) -> MockValue {
    MockValue::Tensor {
        storage: "FloatStorage",
        elem: 4,
        shape: shape.to_vec(),
    }
}

/// Builds a zip-based `.pth` file
struct MockTorchBuilder {
    pickle: Vec<u8>,
    storages: Vec<(String, Vec<u8>)>,
    truncate_storage: bool,
    drop_storage: bool,
}

impl MockTorchBuilder {
    fn new() -> Self {
        Self {
            pickle: Vec::new(),
            storages: Vec::new(),
            truncate_storage: false,
            drop_storage: false,
        }
    }

    fn truncate_storage(mut self) -> Self {
        self.truncate_storage = true;
        self
    }

    fn drop_storage(mut self) -> Self {
        self.drop_storage = true;
        self
    }

    fn build(mut self, root: &MockValue) -> Vec<u8> {
        self.pickle.extend_from_slice(&[0x80, 0x02]);
        self.value(root);
        self.pickle.push(b'.');

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        zip.start_file("archive/data.pkl", options).unwrap();
        zip.write_all(&self.pickle).unwrap();
        zip.start_file("archive/byteorder", options).unwrap();
        zip.write_all(b"little").unwrap();
        if !self.drop_storage {
            for (key, data) in &self.storages {
                zip.start_file(format!("archive/data/{key}"), options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.start_file("archive/version", options).unwrap();
        zip.write_all(b"3\n").unwrap();

        zip.finish().unwrap().into_inner()
    }

    fn value(&mut self, value: &MockValue) {
        match value {
            MockValue::Tensor {
                storage,
                elem,
                shape,
            } => self.tensor(storage, *elem, shape),
            MockValue::View { shape, stride } => {
                let key = self.storage(vec![0u8; 16]);
                self.rebuild_tensor("FloatStorage", &key, 4, shape, stride);
            }
            MockValue::Int(v) => self.int(*v),
            MockValue::Float(v) => {
                self.pickle.push(b'G');
                self.pickle.extend_from_slice(&v.to_be_bytes());
            }
            MockValue::EmptyList => self.pickle.push(b']'),
            MockValue::Dict(entries) => {
                self.pickle.push(b'}');
                self.items(entries);
            }
            MockValue::OrderedDict(entries) => {
                self.global("collections", "OrderedDict");
                self.pickle.push(b')');
                self.pickle.push(b'R');
                self.items(entries);
            }
        }
    }

    fn items(&mut self, entries: &[(&'static str, MockValue)]) {
        if entries.is_empty() {
            return;
        }
        self.pickle.push(b'(');
        for (key, value) in entries {
            self.string(key);
            self.value(value);
        }
        self.pickle.push(b'u');
    }

    fn storage(&mut self, data: Vec<u8>) -> String {
        let key = self.storages.len().to_string();
        self.storages.push((key.clone(), data));
        key
    }

    fn tensor(&mut self, storage: &str, elem: usize, shape: &[usize]) {
        let numel: usize = shape.iter().product();
        let bytes = if self.truncate_storage {
            elem
        } else {
            numel * elem
        };
        let key = self.storage(vec![0u8; bytes]);

        let mut stride = vec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * shape[i + 1];
        }
        self.rebuild_tensor(storage, &key, numel, shape, &stride);
    }

    fn rebuild_tensor(
        &mut self,
        storage: &str,
        key: &str,
        numel: usize,
        shape: &[usize],
        stride: &[usize],
    ) {
        self.global("torch._utils", "_rebuild_tensor_v2");
        self.pickle.push(b'(');

        // persistent id
        self.pickle.push(b'(');
        self.string("storage");
        self.global("torch", storage);
        self.string(key);
        self.string("cuda:0");
        self.int(numel);
        self.pickle.push(b't');
        self.pickle.push(b'Q');

        self.int(0);
        self.tuple(shape);
        self.tuple(stride);
        self.pickle.push(0x89);
        self.global("collections", "OrderedDict");
        self.pickle.push(b')');
        self.pickle.push(b'R');

        self.pickle.push(b't');
        self.pickle.push(b'R');
    }

    fn tuple(&mut self, values: &[usize]) {
        self.pickle.push(b'(');
        for &v in values {
            self.int(v);
        }
        self.pickle.push(b't');
    }

    fn int(&mut self, v: usize) {
        if v < 0x100 {
            self.pickle.push(b'K');
            self.pickle.push(v as u8);
        } else if v < 0x10000 {
            self.pickle.push(b'M');
            self.pickle.extend_from_slice(&(v as u16).to_le_bytes());
        } else if v <= i32::MAX as usize {
            self.pickle.push(b'J');
            self.pickle.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            // LONG1: shortest little-endian two's complement
            let mut bytes = (v as u64).to_le_bytes().to_vec();
            while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 && bytes[bytes.len() - 2] < 0x80 {
                bytes.pop();
            }
            self.pickle.push(0x8a);
            self.pickle.push(bytes.len() as u8);
            self.pickle.extend_from_slice(&bytes);
        }
    }

    fn string(&mut self, s: &str) {
        self.pickle.push(b'X');
        self.pickle.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.pickle.extend_from_slice(s.as_bytes());
    }

    fn global(&mut self, module: &str, name: &str) {
        self.pickle.push(b'c');
        self.pickle.extend_from_slice(module.as_bytes());
        self.pickle.push(b'\n');
        self.pickle.extend_from_slice(name.as_bytes());
        self.pickle.push(b'\n');
    }
}

fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn vits_training_checkpoint() -> MockValue {
    MockValue::Dict(vec![
        (
            "model",
            MockValue::OrderedDict(vec![
                ("enc_p.emb.weight", tensor(&[178, 192])),
                ("dec.conv_pre.weight", tensor(&[512, 192, 7])),
                ("emb_g.weight", tensor(&[1, 256])),
                ("dec.ups.0.bias", tensor(&[256])),
            ]),
        ),
        ("iteration", MockValue::Int(12000)),
        ("learning_rate", MockValue::Float(0.0002)),
        (
            "optimizer",
            MockValue::Dict(vec![
                ("state", MockValue::Dict(vec![])),
                ("param_groups", MockValue::EmptyList),
            ]),
        ),
    ])
}

fn write_safetensors(dir: &TempDir, name: &str, entries: &[(&str, Vec<usize>)]) -> PathBuf {
    let buffers: Vec<Vec<u8>> = entries
        .iter()
        .map(|(_, shape)| vec![0u8; shape.iter().product::<usize>() * 2])
        .collect();
    let views: Vec<(String, TensorView<'_>)> = entries
        .iter()
        .zip(&buffers)
        .map(|((name, shape), data)| {
            (
                name.to_string(),
                TensorView::new(Dtype::F16, shape.clone(), data).unwrap(),
            )
        })
        .collect();
    let bytes = safetensors::serialize(views, &None).unwrap();
    write_file(dir, name, &bytes)
}

#[test]
fn test_load_training_checkpoint() {
    let dir = tempdir().unwrap();
    let bytes = MockTorchBuilder::new().build(&vits_training_checkpoint());
    let path = write_file(&dir, "G_12000.pth", &bytes);

    let ckpt = load_model(&path).unwrap();
    let names: Vec<_> = ckpt.iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["model", "iteration", "learning_rate", "optimizer"]);

    assert_eq!(
        ckpt.get("iteration"),
        Some(&CheckpointEntry::Other("int 12000".to_string()))
    );
    assert_eq!(
        ckpt.get("learning_rate"),
        Some(&CheckpointEntry::Other("float 0.0002".to_string()))
    );
    match ckpt.get("optimizer") {
        Some(CheckpointEntry::Nested(opt)) => {
            assert_eq!(
                opt.get("param_groups"),
                Some(&CheckpointEntry::Other("list[0]".to_string()))
            );
        }
        other => panic!("expected nested optimizer state, got {other:?}"),
    }

    let model = ckpt.into_model_state();
    assert_eq!(model.len(), 4);
    let conv = model
        .get("dec.conv_pre.weight")
        .and_then(|e| e.as_tensor())
        .unwrap();
    assert_eq!(conv.shape, vec![512, 192, 7]);
    assert_eq!(conv.dtype, DType::F32);
    assert_eq!(conv.nbytes, 512 * 192 * 7 * 4);
}

#[test]
fn test_analyze_loaded_training_checkpoint() {
    let dir = tempdir().unwrap();
    let bytes = MockTorchBuilder::new().build(&vits_training_checkpoint());
    let path = write_file(&dir, "G_12000.pth", &bytes);

    let model = load_model(&path).unwrap().into_model_state();
    let report = analyze_model_structure(&model);

    assert_eq!(report.sizes.iter().copied().collect::<Vec<_>>(), vec![7, 192, 256]);
    let important: Vec<_> = report.important_shapes.keys().map(String::as_str).collect();
    assert_eq!(important, vec!["emb_g.weight", "dec.ups.0.bias"]);
}

#[test]
fn test_bare_state_dict() {
    let dir = tempdir().unwrap();
    let root = MockValue::OrderedDict(vec![
        ("w", tensor(&[4, 512])),
        (
            "mask",
            MockValue::Tensor {
                storage: "BoolStorage",
                elem: 1,
                shape: vec![3],
            },
        ),
        (
            "step",
            MockValue::Tensor {
                storage: "LongStorage",
                elem: 8,
                shape: vec![],
            },
        ),
    ]);
    let path = write_file(&dir, "state.pth", &MockTorchBuilder::new().build(&root));

    let ckpt = load_model(&path).unwrap();
    let mask = ckpt.get("mask").and_then(|e| e.as_tensor()).unwrap();
    assert_eq!(mask.dtype, DType::Bool);
    let step = ckpt.get("step").and_then(|e| e.as_tensor()).unwrap();
    assert_eq!(step.dtype, DType::I64);
    assert_eq!(step.rank(), 0);

    // no "model" key: unwrapping is a no-op
    assert_eq!(ckpt.clone().into_model_state(), ckpt);
}

#[test]
fn test_missing_storage_member() {
    let dir = tempdir().unwrap();
    let root = MockValue::OrderedDict(vec![("w", tensor(&[2, 2]))]);
    let path = write_file(
        &dir,
        "broken.pth",
        &MockTorchBuilder::new().drop_storage().build(&root),
    );

    match load_model(&path) {
        Err(Error::MissingStorage { tensor, key }) => {
            assert_eq!(tensor, "w");
            assert_eq!(key, "0");
        }
        other => panic!("expected MissingStorage, got {other:?}"),
    }
}

#[test]
fn test_truncated_storage() {
    let dir = tempdir().unwrap();
    let root = MockValue::OrderedDict(vec![("w", tensor(&[4, 4]))]);
    let path = write_file(
        &dir,
        "short.pth",
        &MockTorchBuilder::new().truncate_storage().build(&root),
    );

    let err = load_model(&path).unwrap_err();
    assert!(matches!(err, Error::TensorOutOfBounds { .. }), "{err}");
}

#[test]
fn test_unsupported_storage_type() {
    let dir = tempdir().unwrap();
    let root = MockValue::OrderedDict(vec![(
        "z",
        MockValue::Tensor {
            storage: "ComplexFloatStorage",
            elem: 8,
            shape: vec![2],
        },
    )]);
    let path = write_file(&dir, "complex.pth", &MockTorchBuilder::new().build(&root));

    match load_model(&path) {
        Err(Error::UnsupportedStorageType(name)) => assert_eq!(name, "torch.ComplexFloatStorage"),
        other => panic!("expected UnsupportedStorageType, got {other:?}"),
    }
}

fn load_view(dir: &TempDir, shape: &[usize], stride: &[usize]) -> Result<Checkpoint, Error> {
    let view = MockValue::OrderedDict(vec![(
        "w",
        MockValue::View {
            shape: shape.to_vec(),
            stride: stride.to_vec(),
        },
    )]);
    let bytes = MockTorchBuilder::new().build(&view);
    load_model(&write_file(dir, "view.pth", &bytes))
}

#[test]
fn test_broadcast_view_within_storage() {
    let dir = tempdir().unwrap();
    let ckpt = load_view(&dir, &[3, 4], &[0, 1]).unwrap();

    let w = ckpt.get("w").and_then(|e| e.as_tensor()).unwrap();
    assert_eq!(w.shape, vec![3, 4]);
    assert_eq!(w.nbytes, 48);
}

#[test]
fn test_huge_dimension_is_rejected() {
    let dir = tempdir().unwrap();
    let huge = i64::MAX as usize;

    // Byte span of the view overflows
    let err = load_view(&dir, &[huge], &[1]).unwrap_err();
    assert!(
        matches!(&err, Error::Pickle(msg) if msg.contains("oversized view")),
        "unexpected error: {err}"
    );

    // Broadcast view fits the storage but its element count overflows
    let err = load_view(&dir, &[huge, 4], &[0, 1]).unwrap_err();
    assert!(
        matches!(&err, Error::Pickle(msg) if msg.contains("oversized view")),
        "unexpected error: {err}"
    );
}

#[test]
fn test_large_dimension_past_storage() {
    let dir = tempdir().unwrap();
    let err = load_view(&dir, &[1 << 40], &[1]).unwrap_err();
    assert!(matches!(err, Error::TensorOutOfBounds { available: 16, .. }), "{err}");
}

#[test]
fn test_legacy_pickle_is_rejected() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "old.pth", b"\x80\x02\x8a\x0al\xfc\x9cF\xf9 j\xa8P\x19.");

    let err = load_model(&path).unwrap_err();
    assert!(matches!(err, Error::LegacyTorchFormat));
}

#[test]
fn test_not_a_zip() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "junk.pth", b"definitely not a checkpoint");

    let err = load_model(&path).unwrap_err();
    assert!(matches!(err, Error::Zip(_)), "{err}");
}

#[test]
fn test_unsupported_extension() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "pytorch_model.bin", b"");

    match load_model(&path) {
        Err(Error::UnsupportedFormat(ext)) => assert_eq!(ext, ".bin"),
        other => panic!("expected UnsupportedFormat, got {other:?}"),
    }
}

#[test]
fn test_missing_file() {
    let err = load_model(Path::new("/nonexistent/G_0.pth")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_load_safetensors_file() {
    let dir = tempdir().unwrap();
    let path = write_safetensors(
        &dir,
        "model.safetensors",
        &[
            ("flow.flows.0.enc.in_layers.0.weight", vec![384, 192, 5]),
            ("emb_g.weight", vec![4, 256]),
        ],
    );

    let ckpt = load_model(&path).unwrap();
    let names: Vec<_> = ckpt.iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["emb_g.weight", "flow.flows.0.enc.in_layers.0.weight"]);

    let emb = ckpt.get("emb_g.weight").and_then(|e| e.as_tensor()).unwrap();
    assert_eq!(emb.dtype, DType::F16);
    assert_eq!(emb.nbytes, 4 * 256 * 2);
}

#[test]
fn test_empty_safetensors_file() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "empty.safetensors", b"");

    let err = load_model(&path).unwrap_err();
    assert!(matches!(err, Error::SafeTensors(_)));
}
