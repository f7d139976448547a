//! Transport buffers and the tensor payload layout
//!
//! ```text
//! ┌────────────┬────────────────────┬──────────────────┐
//! │  Desc len  │  TensorDesc        │  Tensor bytes    │
//! │  (4 bytes) │  (bincode)         │  (variable)      │
//! └────────────┴────────────────────┴──────────────────┘
//! ```

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};

/// Header embedded in every transport buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferHeader {
    /// Per-(device, queue) stamp assigned at enqueue time
    pub sequence: u64,
    pub end_of_sequence: bool,
}

/// A buffer owned by whoever currently holds it: the producer until the
/// queue accepts it, the consumer after a successful dequeue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBuffer {
    pub header: BufferHeader,
    pub payload: Vec<u8>,
}

impl QueueBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Int64,
    Uint8,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: DataType,
    pub dims: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn new(dtype: DataType, dims: Vec<i64>, data: Vec<u8>) -> Self {
        Self {
            desc: TensorDesc { dtype, dims },
            data,
        }
    }

    /// Append the wire layout of this tensor to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let desc = bincode::serialize(&self.desc)?;
        out.reserve(4 + desc.len() + self.data.len());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&desc);
        out.extend_from_slice(&self.data);
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(DeployError::InvalidParam(
                "tensor payload shorter than its header".into(),
            ));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&payload[..4]);
        let desc_len = u32::from_le_bytes(len_bytes) as usize;
        let desc_end = 4 + desc_len;
        if payload.len() < desc_end {
            return Err(DeployError::InvalidParam(format!(
                "tensor descriptor truncated: need {} bytes, have {}",
                desc_end,
                payload.len()
            )));
        }
        let desc: TensorDesc = bincode::deserialize(&payload[4..desc_end])?;
        Ok(Self {
            desc,
            data: payload[desc_end..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_layout() {
        let tensor = Tensor::new(DataType::Float32, vec![2, 2], vec![1u8; 16]);
        let mut payload = Vec::new();
        tensor.encode_into(&mut payload).unwrap();
        assert!(payload.len() > 16);
        assert_eq!(Tensor::decode(&payload).unwrap(), tensor);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        assert!(Tensor::decode(&[1, 0]).is_err());
        assert!(Tensor::decode(&[200, 0, 0, 0, 1]).is_err());
    }
}
