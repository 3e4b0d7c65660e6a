//! Dynamic values flowing through model graphs and pipeline stages

use std::collections::BTreeMap;
use std::fmt;

use crate::backend::{Device, Stream};
use crate::error::{type_mismatch, PipelineError, PipelineResult};
use crate::tensor::{JaggedTensor, KeyedJaggedTensor, KeyedTensor, Tensor};

pub type Kwargs = BTreeMap<String, Value>;

/// Values that can be marked as used by an execution stream.
pub trait Multistreamable {
    fn record_stream(&self, stream: &Stream);
}

/// Batches that can be moved between devices and handed across streams.
pub trait Pipelineable: Multistreamable + Sized {
    fn to_device(&self, device: Device, non_blocking: bool) -> PipelineResult<Self>;
}

/// Positional or keyed index used by item access.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Index {
    Int(i64),
    Key(String),
}

impl From<i64> for Index {
    fn from(i: i64) -> Self {
        Index::Int(i)
    }
}

impl From<&str> for Index {
    fn from(key: &str) -> Self {
        Index::Key(key.to_string())
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Int(i) => write!(f, "[{}]", i),
            Index::Key(k) => write!(f, "[{:?}]", k),
        }
    }
}

/// A named structure of fields, e.g. a training batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub name: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(name: impl Into<String>) -> Self {
        Record {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    Jagged(JaggedTensor),
    KeyedJagged(KeyedJaggedTensor),
    Keyed(KeyedTensor),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Record(Record),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::Tensor(_) => "Tensor",
            Value::Jagged(_) => "JaggedTensor",
            Value::KeyedJagged(_) => "KeyedJaggedTensor",
            Value::Keyed(_) => "KeyedTensor",
            Value::List(_) => "List",
            Value::Dict(_) => "Dict",
            Value::Record(_) => "Record",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn get_attr(&self, attr: &str) -> PipelineResult<Value> {
        let found = match self {
            Value::Record(record) => record.fields.get(attr).cloned(),
            Value::KeyedJagged(kjt) => match attr {
                "values" => Some(Value::Tensor(kjt.values().clone())),
                "weights" => Some(kjt.weights().cloned().map(Value::Tensor).unwrap_or_default()),
                "lengths" => Some(usizes(kjt.lengths())),
                "keys" => Some(strings(kjt.keys())),
                "stride" => Some(Value::Int(kjt.stride() as i64)),
                _ => None,
            },
            Value::Jagged(jt) => match attr {
                "values" => Some(Value::Tensor(jt.values().clone())),
                "weights" => Some(jt.weights().cloned().map(Value::Tensor).unwrap_or_default()),
                "lengths" => Some(usizes(jt.lengths())),
                _ => None,
            },
            Value::Keyed(kt) => match attr {
                "values" => Some(Value::Tensor(kt.values().clone())),
                "keys" => Some(strings(kt.keys())),
                _ => None,
            },
            _ => None,
        };
        found.ok_or_else(|| PipelineError::MissingAttribute {
            attr: attr.to_string(),
            on: self.type_name().to_string(),
        })
    }

    pub fn get_item(&self, index: &Index) -> PipelineResult<Value> {
        match (self, index) {
            (Value::List(items), Index::Int(i)) => {
                let len = items.len();
                let pos = if *i < 0 { *i + len as i64 } else { *i };
                if pos < 0 || pos as usize >= len {
                    return Err(PipelineError::IndexOutOfRange { index: *i, len });
                }
                Ok(items[pos as usize].clone())
            }
            (Value::Dict(map), Index::Key(k)) => map
                .get(k)
                .cloned()
                .ok_or_else(|| PipelineError::KeyNotFound(k.clone())),
            (Value::Record(record), Index::Key(k)) => record
                .fields
                .get(k)
                .cloned()
                .ok_or_else(|| PipelineError::KeyNotFound(k.clone())),
            (Value::KeyedJagged(kjt), Index::Key(k)) => Ok(Value::Jagged(kjt.get(k)?)),
            (Value::Keyed(kt), Index::Key(k)) => Ok(Value::Tensor(kt.get(k)?)),
            (other, index) => Err(type_mismatch(
                &format!("a container indexable by {}", index),
                other.type_name(),
            )),
        }
    }

    pub fn as_tensor(&self) -> PipelineResult<&Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(type_mismatch("Tensor", other.type_name())),
        }
    }

    pub fn as_kjt(&self) -> PipelineResult<&KeyedJaggedTensor> {
        match self {
            Value::KeyedJagged(kjt) => Ok(kjt),
            other => Err(type_mismatch("KeyedJaggedTensor", other.type_name())),
        }
    }

    pub fn as_keyed(&self) -> PipelineResult<&KeyedTensor> {
        match self {
            Value::Keyed(kt) => Ok(kt),
            other => Err(type_mismatch("KeyedTensor", other.type_name())),
        }
    }

    pub fn as_int(&self) -> PipelineResult<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(type_mismatch("Int", other.type_name())),
        }
    }

    pub fn as_str(&self) -> PipelineResult<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(type_mismatch("Str", other.type_name())),
        }
    }

    pub fn as_list(&self) -> PipelineResult<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(type_mismatch("List", other.type_name())),
        }
    }

    /// Whether this value owns device memory that streams can observe.
    pub fn is_stream_aware(&self) -> bool {
        match self {
            Value::Tensor(_) | Value::Jagged(_) | Value::KeyedJagged(_) | Value::Keyed(_) => true,
            Value::List(items) => items.iter().any(Value::is_stream_aware),
            Value::Dict(map) => map.values().any(Value::is_stream_aware),
            Value::Record(record) => record.fields.values().any(Value::is_stream_aware),
            _ => false,
        }
    }
}

fn usizes(values: &[usize]) -> Value {
    Value::List(values.iter().map(|&v| Value::Int(v as i64)).collect())
}

fn strings(values: &[String]) -> Value {
    Value::List(values.iter().cloned().map(Value::Str).collect())
}

impl Multistreamable for Value {
    fn record_stream(&self, stream: &Stream) {
        match self {
            Value::Tensor(t) => t.record_stream(stream),
            Value::Jagged(jt) => jt.record_stream(stream),
            Value::KeyedJagged(kjt) => kjt.record_stream(stream),
            Value::Keyed(kt) => kt.record_stream(stream),
            Value::List(items) => items.iter().for_each(|v| v.record_stream(stream)),
            Value::Dict(map) => map.values().for_each(|v| v.record_stream(stream)),
            Value::Record(record) => record.fields.values().for_each(|v| v.record_stream(stream)),
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {}
        }
    }
}

impl Pipelineable for Value {
    fn to_device(&self, device: Device, non_blocking: bool) -> PipelineResult<Self> {
        Ok(match self {
            Value::Tensor(t) => Value::Tensor(t.to_device(device)),
            Value::Jagged(jt) => Value::Jagged(jt.to_device(device)),
            Value::KeyedJagged(kjt) => Value::KeyedJagged(kjt.to_device(device)),
            Value::Keyed(kt) => Value::Keyed(kt.to_device(device)),
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| v.to_device(device, non_blocking))
                    .collect::<PipelineResult<_>>()?,
            ),
            Value::Dict(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_device(device, non_blocking)?)))
                    .collect::<PipelineResult<_>>()?,
            ),
            Value::Record(record) => Value::Record(Record {
                name: record.name.clone(),
                fields: record
                    .fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_device(device, non_blocking)?)))
                    .collect::<PipelineResult<_>>()?,
            }),
            other => other.clone(),
        })
    }
}

impl Multistreamable for Tensor {
    fn record_stream(&self, stream: &Stream) {
        Tensor::record_stream(self, stream)
    }
}

impl Pipelineable for Tensor {
    fn to_device(&self, device: Device, _non_blocking: bool) -> PipelineResult<Self> {
        Ok(Tensor::to_device(self, device))
    }
}

impl Multistreamable for KeyedJaggedTensor {
    fn record_stream(&self, stream: &Stream) {
        KeyedJaggedTensor::record_stream(self, stream)
    }
}

impl Pipelineable for KeyedJaggedTensor {
    fn to_device(&self, device: Device, _non_blocking: bool) -> PipelineResult<Self> {
        Ok(KeyedJaggedTensor::to_device(self, device))
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from_for_value!(
    bool => Bool,
    i64 => Int,
    f64 => Float,
    String => Str,
    Tensor => Tensor,
    JaggedTensor => Jagged,
    KeyedJaggedTensor => KeyedJagged,
    KeyedTensor => Keyed,
    Vec<Value> => List,
    Record => Record,
);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(map)
    }
}
