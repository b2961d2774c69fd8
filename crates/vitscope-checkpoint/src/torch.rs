//! Zip-based PyTorch checkpoint reader
//!
//! `torch.save` writes a zip archive holding `<root>/data.pkl` (a pickle of
//! the saved object graph) plus one `<root>/data/<key>` member per storage.
//! The pickle is decoded by [`PickleMachine`], which understands containers,
//! scalars, `collections.OrderedDict` and the `torch._utils` tensor rebuild
//! functions. Any other callable becomes an opaque value; nothing in the file
//! is ever executed.
//!
//! Tensors carry a device tag in their storage reference. It is recorded in
//! trace output and otherwise ignored, so every tensor is read as a plain CPU
//! buffer.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, trace};
use zip::ZipArchive;

use crate::entry::{Checkpoint, CheckpointEntry, DType, Tensor};
use crate::error::{Error, Result};

/// Nesting limit when converting the decoded object graph
const MAX_DEPTH: usize = 64;

/// Load a `.pth` file
pub fn load_torch(path: &Path) -> Result<Checkpoint> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    if read == 2 && magic[0] == 0x80 {
        return Err(Error::LegacyTorchFormat);
    }
    file.seek(SeekFrom::Start(0))?;

    let archive = ZipArchive::new(file)?;
    read_torch_archive(archive)
}

/// Decode an already opened PyTorch zip archive
pub fn read_torch_archive<R: Read + Seek>(mut archive: ZipArchive<R>) -> Result<Checkpoint> {
    let pickle_name = archive
        .file_names()
        .filter(|name| name.ends_with("/data.pkl") && name.matches('/').count() == 1)
        .min()
        .map(str::to_string)
        .ok_or(Error::MissingPickle)?;
    let root = pickle_name.trim_end_matches("data.pkl").to_string();
    debug!("Reading pickle member {}", pickle_name);

    let byteorder_name = format!("{root}byteorder");
    if let Ok(mut f) = archive.by_name(&byteorder_name) {
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        let s = s.trim();
        if s != "little" {
            return Err(Error::Pickle(format!(
                "unsupported torch byteorder {s:?} (expected \"little\")"
            )));
        }
    }

    let mut pkl = Vec::new();
    archive.by_name(&pickle_name)?.read_to_end(&mut pkl)?;

    let value = PickleMachine::new(&pkl).run()?;

    let mut storages = HashMap::new();
    for name in archive.file_names() {
        if let Some(key) = name.strip_prefix(&root).and_then(|n| n.strip_prefix("data/")) {
            storages.insert(key.to_string(), name.to_string());
        }
    }
    let mut sizes = HashMap::with_capacity(storages.len());
    for (key, member) in &storages {
        let size = archive.by_name(member)?.size();
        sizes.insert(key.clone(), size as usize);
    }

    let converter = Converter {
        storage_sizes: &sizes,
    };
    let checkpoint = match &value {
        Value::Dict(items) => converter.mapping(&items.borrow(), 0)?,
        other => {
            return Err(Error::Pickle(format!(
                "top-level object is {}, expected a mapping",
                other.describe()
            )))
        }
    };
    debug!("Decoded {} top-level entries", checkpoint.len());
    Ok(checkpoint)
}

#[derive(Debug, Clone)]
struct StorageRef {
    dtype: DType,
    key: String,
    device: String,
    numel: usize,
}

#[derive(Debug, Clone)]
struct TensorSpec {
    storage: StorageRef,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

impl TensorSpec {
    /// Number of storage elements spanned by the tensor's view, `None` if
    /// it overflows `usize`
    fn extent(&self) -> Option<usize> {
        if self.shape.iter().any(|&d| d == 0) {
            return Some(0);
        }
        self.shape
            .iter()
            .zip(&self.stride)
            .try_fold(1usize, |acc, (&dim, &stride)| {
                (dim - 1).checked_mul(stride)?.checked_add(acc)
            })
    }
}

type Shared<T> = Rc<RefCell<T>>;

#[derive(Debug, Clone)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(usize),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Dict(Shared<Vec<(Value, Value)>>),
    Global { module: String, name: String },
    Storage(StorageRef),
    Tensor(TensorSpec),
    Opaque(String),
}

impl Value {
    fn describe(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(b) => format!("bool {b}"),
            Value::Int(i) => format!("int {i}"),
            Value::Float(f) => format!("float {f}"),
            Value::Str(s) => format!("str {s:?}"),
            Value::Bytes(n) => format!("bytes[{n}]"),
            Value::Tuple(items) => format!("tuple[{}]", items.len()),
            Value::List(items) => format!("list[{}]", items.borrow().len()),
            Value::Dict(items) => format!("dict[{}]", items.borrow().len()),
            Value::Global { module, name } => format!("global {module}.{name}"),
            Value::Storage(s) => format!("storage {}", s.key),
            Value::Tensor(t) => format!("tensor {:?}", t.shape),
            Value::Opaque(s) => s.clone(),
        }
    }

    fn key_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            other => other.describe(),
        }
    }
}

/// Restricted pickle interpreter
struct PickleMachine<'a> {
    cursor: Cursor<&'a [u8]>,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<usize, Value>,
}

impl<'a> PickleMachine<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let pos = self.cursor.position();
            let op = self.read_u8()?;
            match op {
                // PROTO
                0x80 => {
                    self.read_u8()?;
                }
                // FRAME
                0x95 => {
                    self.cursor.read_u64::<LittleEndian>().map_err(|_| eof())?;
                }
                b'(' => self.marks.push(self.stack.len()),
                b')' => self.stack.push(Value::Tuple(Vec::new())),
                b'}' => self.stack.push(Value::Dict(Rc::default())),
                b']' => self.stack.push(Value::List(Rc::default())),
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                // BININT1 / BININT2 / BININT
                b'K' => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                b'M' => {
                    let v = self.cursor.read_u16::<LittleEndian>().map_err(|_| eof())?;
                    self.stack.push(Value::Int(v as i64));
                }
                b'J' => {
                    let v = self.cursor.read_i32::<LittleEndian>().map_err(|_| eof())?;
                    self.stack.push(Value::Int(v as i64));
                }
                // LONG1
                0x8a => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Int(decode_long(bytes)?));
                }
                // BINFLOAT is big-endian
                b'G' => {
                    let v = self.cursor.read_f64::<BigEndian>().map_err(|_| eof())?;
                    self.stack.push(Value::Float(v));
                }
                b'X' => {
                    let len = self.read_u32()? as usize;
                    let s = self.read_utf8(len)?;
                    self.stack.push(Value::Str(s));
                }
                0x8c => {
                    let len = self.read_u8()? as usize;
                    let s = self.read_utf8(len)?;
                    self.stack.push(Value::Str(s));
                }
                // BINSTRING / SHORT_BINSTRING (protocol 0-2 byte strings)
                b'T' => {
                    let len = self.read_u32()? as usize;
                    let s = String::from_utf8_lossy(self.read_bytes(len)?).into_owned();
                    self.stack.push(Value::Str(s));
                }
                b'U' => {
                    let len = self.read_u8()? as usize;
                    let s = String::from_utf8_lossy(self.read_bytes(len)?).into_owned();
                    self.stack.push(Value::Str(s));
                }
                // BINBYTES / SHORT_BINBYTES
                b'B' => {
                    let len = self.read_u32()? as usize;
                    self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(len));
                }
                b'C' => {
                    let len = self.read_u8()? as usize;
                    self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(len));
                }
                b'c' => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                // STACK_GLOBAL
                0x93 => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.stack.push(Value::Global { module, name })
                        }
                        _ => return Err(Error::Pickle("STACK_GLOBAL expects two strings".into())),
                    }
                }
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                0x85 => {
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a]));
                }
                0x86 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                }
                0x87 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                }
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(Rc::new(RefCell::new(items))));
                }
                b'a' => {
                    let item = self.pop()?;
                    self.list_extend(vec![item])?;
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    self.list_extend(items)?;
                }
                b'd' => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items)?;
                    self.stack.push(Value::Dict(Rc::new(RefCell::new(pairs))));
                }
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.dict_extend(vec![(key, value)])?;
                }
                b'u' => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items)?;
                    self.dict_extend(pairs)?;
                }
                // BINPUT / LONG_BINPUT / MEMOIZE
                b'q' => {
                    let idx = self.read_u8()? as usize;
                    self.memo_put(idx)?;
                }
                b'r' => {
                    let idx = self.read_u32()? as usize;
                    self.memo_put(idx)?;
                }
                0x94 => {
                    let idx = self.memo.len();
                    self.memo_put(idx)?;
                }
                // BINGET / LONG_BINGET
                b'h' => {
                    let idx = self.read_u8()? as usize;
                    self.memo_get(idx)?;
                }
                b'j' => {
                    let idx = self.read_u32()? as usize;
                    self.memo_get(idx)?;
                }
                b'Q' => {
                    let pid = self.pop()?;
                    let storage = persistent_load(pid)?;
                    self.stack.push(storage);
                }
                b'R' => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let out = reduce(callable, args)?;
                    self.stack.push(out);
                }
                // NEWOBJ
                0x81 => {
                    let _args = self.pop()?;
                    let cls = self.pop()?;
                    self.stack.push(Value::Opaque(format!("object {}", cls.describe())));
                }
                // BUILD: state is dropped, the instance stays
                b'b' => {
                    self.pop()?;
                }
                b'0' => {
                    self.pop()?;
                }
                b'1' => {
                    self.pop_mark()?;
                }
                b'.' => {
                    trace!("Pickle STOP at offset {}", pos);
                    return self.pop();
                }
                other => {
                    return Err(Error::Pickle(format!(
                        "unsupported pickle opcode 0x{other:02x} at offset {pos}"
                    )));
                }
            }
        }
    }

    fn list_extend(&mut self, items: Vec<Value>) -> Result<()> {
        match self.stack.last() {
            Some(Value::List(list)) => {
                list.borrow_mut().extend(items);
                Ok(())
            }
            Some(Value::Opaque(_)) => Ok(()),
            _ => Err(Error::Pickle("APPEND target is not a list".into())),
        }
    }

    fn dict_extend(&mut self, items: Vec<(Value, Value)>) -> Result<()> {
        match self.stack.last() {
            Some(Value::Dict(dict)) => {
                dict.borrow_mut().extend(items);
                Ok(())
            }
            Some(Value::Opaque(_)) => Ok(()),
            _ => Err(Error::Pickle("SETITEM target is not a dict".into())),
        }
    }

    fn memo_put(&mut self, idx: usize) -> Result<()> {
        let top = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| Error::Pickle("memo put with empty stack".into()))?;
        self.memo.insert(idx, top);
        Ok(())
    }

    fn memo_get(&mut self, idx: usize) -> Result<()> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| Error::Pickle(format!("missing memo index {idx}")))?;
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Pickle("unexpected empty stack".into()))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| Error::Pickle("missing MARK".into()))?;
        if mark > self.stack.len() {
            return Err(Error::Pickle("MARK beyond stack top".into()));
        }
        Ok(self.stack.split_off(mark))
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| eof())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.cursor.read_u32::<LittleEndian>().map_err(|_| eof())
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        let end = start.checked_add(len).ok_or_else(eof)?;
        let slice = bytes.get(start..end).ok_or_else(eof)?;
        self.cursor.set_position(end as u64);
        Ok(slice)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let slice = self.read_bytes(len)?;
        std::str::from_utf8(slice)
            .map(str::to_string)
            .map_err(|e| Error::Pickle(format!("invalid UTF-8: {e}")))
    }

    fn read_line(&mut self) -> Result<String> {
        let bytes: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        let rest = bytes.get(start..).ok_or_else(eof)?;
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::Pickle("GLOBAL missing newline".into()))?;
        let line = self.read_utf8(len)?;
        self.read_u8()?;
        Ok(line)
    }
}

fn eof() -> Error {
    Error::Pickle("unexpected end of pickle stream".into())
}

fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(Error::Pickle("odd number of items for dict".into()));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

/// Little-endian two's complement, as written by LONG1
fn decode_long(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(Error::Pickle(format!("LONG1 of {} bytes is too wide", bytes.len())));
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn reduce(callable: Value, args: Value) -> Result<Value> {
    let (module, name) = match callable {
        Value::Global { module, name } => (module, name),
        other => return Ok(Value::Opaque(format!("call of {}", other.describe()))),
    };
    let args = match args {
        Value::Tuple(args) => args,
        other => vec![other],
    };

    match (module.as_str(), name.as_str()) {
        ("collections", "OrderedDict") => Ok(Value::Dict(Rc::default())),
        ("torch._utils", "_rebuild_tensor_v2") | ("torch._utils", "_rebuild_tensor") => {
            rebuild_tensor(&name, &args)
        }
        ("torch._utils", "_rebuild_parameter")
        | ("torch._utils", "_rebuild_parameter_with_state") => match args.into_iter().next() {
            Some(tensor @ Value::Tensor(_)) => Ok(tensor),
            _ => Err(Error::Pickle(format!("{name} expects a tensor argument"))),
        },
        _ => Ok(Value::Opaque(format!("object {module}.{name}"))),
    }
}

// Args: (storage, storage_offset, size, stride, ...)
fn rebuild_tensor(name: &str, args: &[Value]) -> Result<Value> {
    if args.len() < 4 {
        return Err(Error::Pickle(format!(
            "{name} expects at least 4 args, got {}",
            args.len()
        )));
    }
    let Value::Storage(storage) = &args[0] else {
        return Err(Error::Pickle(format!("{name} arg 0 must be a storage")));
    };
    let offset = as_usize(&args[1])?;
    let shape = tuple_usizes(&args[2])?;
    let stride = tuple_usizes(&args[3])?;
    if shape.len() != stride.len() {
        return Err(Error::Pickle(format!(
            "shape {shape:?} and stride {stride:?} differ in rank"
        )));
    }

    Ok(Value::Tensor(TensorSpec {
        storage: storage.clone(),
        offset,
        shape,
        stride,
    }))
}

// ('storage', storage_type, key, location, numel)
fn persistent_load(pid: Value) -> Result<Value> {
    let Value::Tuple(items) = pid else {
        return Err(Error::Pickle("persistent id must be a tuple".into()));
    };
    if items.len() != 5 {
        return Err(Error::Pickle(format!(
            "unsupported persistent id tuple length {}",
            items.len()
        )));
    }
    match &items[0] {
        Value::Str(kind) if kind == "storage" => {}
        other => {
            return Err(Error::Pickle(format!(
                "unsupported persistent id kind {}",
                other.describe()
            )))
        }
    }
    let Value::Global { module, name } = &items[1] else {
        return Err(Error::Pickle("storage type must be a global".into()));
    };
    let dtype = storage_dtype(module, name)
        .ok_or_else(|| Error::UnsupportedStorageType(format!("{module}.{name}")))?;
    let Value::Str(key) = &items[2] else {
        return Err(Error::Pickle("storage key must be a string".into()));
    };
    let device = match &items[3] {
        Value::Str(d) => d.clone(),
        other => other.describe(),
    };
    let numel = as_usize(&items[4])?;

    Ok(Value::Storage(StorageRef {
        dtype,
        key: key.clone(),
        device,
        numel,
    }))
}

fn storage_dtype(module: &str, name: &str) -> Option<DType> {
    if module != "torch" {
        return None;
    }
    let dtype = match name {
        "FloatStorage" => DType::F32,
        "DoubleStorage" => DType::F64,
        "HalfStorage" => DType::F16,
        "BFloat16Storage" => DType::BF16,
        "LongStorage" => DType::I64,
        "IntStorage" => DType::I32,
        "ShortStorage" => DType::I16,
        "CharStorage" => DType::I8,
        "ByteStorage" => DType::U8,
        "BoolStorage" => DType::Bool,
        _ => return None,
    };
    Some(dtype)
}

fn as_usize(v: &Value) -> Result<usize> {
    match v {
        Value::Int(i) => (*i)
            .try_into()
            .map_err(|_| Error::Pickle(format!("expected non-negative integer, got {i}"))),
        other => Err(Error::Pickle(format!(
            "expected integer, got {}",
            other.describe()
        ))),
    }
}

fn tuple_usizes(v: &Value) -> Result<Vec<usize>> {
    let Value::Tuple(items) = v else {
        return Err(Error::Pickle(format!("expected tuple, got {}", v.describe())));
    };
    items.iter().map(as_usize).collect()
}

/// Turns decoded values into checkpoint entries, checking tensor extents
struct Converter<'s> {
    storage_sizes: &'s HashMap<String, usize>,
}

impl Converter<'_> {
    fn mapping(&self, items: &[(Value, Value)], depth: usize) -> Result<Checkpoint> {
        if depth > MAX_DEPTH {
            return Err(Error::Pickle("object graph nested too deeply".into()));
        }
        let mut checkpoint = Checkpoint::new();
        for (key, value) in items {
            let name = key.key_string();
            let entry = match value {
                Value::Tensor(spec) => CheckpointEntry::Tensor(self.tensor(&name, spec)?),
                Value::Dict(inner) => {
                    CheckpointEntry::Nested(self.mapping(&inner.borrow(), depth + 1)?)
                }
                other => CheckpointEntry::Other(other.describe()),
            };
            checkpoint.insert(name, entry);
        }
        Ok(checkpoint)
    }

    fn tensor(&self, name: &str, spec: &TensorSpec) -> Result<Tensor> {
        let storage = &spec.storage;
        let available = *self
            .storage_sizes
            .get(&storage.key)
            .ok_or_else(|| Error::MissingStorage {
                tensor: name.to_string(),
                key: storage.key.clone(),
            })?;

        let overflow = || {
            Error::Pickle(format!(
                "tensor {} has an oversized view: shape {:?}, stride {:?}, offset {}",
                name, spec.shape, spec.stride, spec.offset
            ))
        };

        let tensor = Tensor::new(storage.dtype, spec.shape.clone()).ok_or_else(overflow)?;
        let elem = storage.dtype.element_size().unwrap_or(0);
        let extent = spec.extent().ok_or_else(overflow)?;
        let end = spec.offset.checked_add(extent).ok_or_else(overflow)?;
        let offset = spec.offset.checked_mul(elem).ok_or_else(overflow)?;
        let needed = extent.checked_mul(elem).ok_or_else(overflow)?;
        let byte_end = offset.checked_add(needed).ok_or_else(overflow)?;
        if end > storage.numel || byte_end > available {
            return Err(Error::TensorOutOfBounds {
                name: name.to_string(),
                offset,
                needed,
                available,
            });
        }

        trace!(
            "{}: {} {:?} (storage {} on {})",
            name,
            tensor.dtype,
            tensor.shape,
            storage.key,
            storage.device
        );
        Ok(tensor)
    }
}
