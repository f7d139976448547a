//! Control-plane protocol between the orchestrator and device daemons
//!
//! Length-prefixed binary frames:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The same framing carries executor worker requests over their socket pair.

use crate::config::MaintenanceConfig;
use crate::error::{DeployError, ErrorCode, Result};
use crate::plan::{DeviceId, ExchangePlan};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Maximum frame payload (64 MiB)
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Chunk size for model and weight transfers, well below the frame cap
pub const TRANSFER_CHUNK_SIZE: usize = 2 * 1024 * 1024;

pub type MessageId = u32;
pub type ClientId = u64;

/// Write one raw frame
pub fn write_frame<W: Write>(writer: &mut W, message_id: MessageId, payload: &[u8]) -> io::Result<()> {
    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", payload.len()),
            )
        })?;

    let mut buffer = Vec::with_capacity(8 + payload.len());
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(payload);
    writer.write_all(&buffer)?;
    writer.flush()
}

/// Read one raw frame
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(MessageId, Vec<u8>)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if frame_len - 4 > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", frame_len - 4),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let mut payload = vec![0u8; (frame_len - 4) as usize];
    reader.read_exact(&mut payload)?;
    Ok((message_id, payload))
}

pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
    message_id: MessageId,
) -> Result<()> {
    let payload = bincode::serialize(message)?;
    write_frame(writer, message_id, &payload)?;
    Ok(())
}

pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<(T, MessageId)> {
    let (message_id, payload) = read_frame(reader)?;
    Ok((bincode::deserialize(&payload)?, message_id))
}

/// Submodel announced to a device ahead of transfer and load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmodelDesc {
    pub sub_model_id: u32,
    pub name: String,
    /// Endpoint indices into the device's exchange plan
    pub input_endpoints: Vec<usize>,
    pub output_endpoints: Vec<usize>,
    pub control_input_endpoints: Vec<usize>,
    pub control_output_endpoints: Vec<usize>,
    /// Shared weight keys this submodel needs present before load
    pub file_constants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedContentOp {
    /// Ask whether the content is already complete
    Query,
    Begin { total: u64 },
    Chunk { offset: u64, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    Init {
        token: String,
    },
    Heartbeat,
    Disconnect,
    PreDeployModel {
        root_model_id: u32,
        exchange_plan: ExchangePlan,
        submodels: Vec<SubmodelDesc>,
    },
    DownloadDeviceConfig(MaintenanceConfig),
    PreDownloadModel {
        root_model_id: u32,
        sub_model_id: u32,
        total_size: u64,
    },
    DownloadModel {
        root_model_id: u32,
        sub_model_id: u32,
        offset: u64,
        data: Vec<u8>,
    },
    LoadModel {
        root_model_id: u32,
        sub_model_id: u32,
    },
    UnloadModel {
        root_model_id: u32,
    },
    DownloadVarManager {
        session_id: u64,
        data: Vec<u8>,
    },
    DownloadSharedContent {
        key: String,
        op: SharedContentOp,
    },
    DeployRankTable {
        rank_table: String,
    },
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Init { .. } => "Init",
            RequestBody::Heartbeat => "Heartbeat",
            RequestBody::Disconnect => "Disconnect",
            RequestBody::PreDeployModel { .. } => "PreDeployModel",
            RequestBody::DownloadDeviceConfig(_) => "DownloadDeviceConfig",
            RequestBody::PreDownloadModel { .. } => "PreDownloadModel",
            RequestBody::DownloadModel { .. } => "DownloadModel",
            RequestBody::LoadModel { .. } => "LoadModel",
            RequestBody::UnloadModel { .. } => "UnloadModel",
            RequestBody::DownloadVarManager { .. } => "DownloadVarManager",
            RequestBody::DownloadSharedContent { .. } => "DownloadSharedContent",
            RequestBody::DeployRankTable { .. } => "DeployRankTable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Zero until `Init` assigns one
    pub client_id: ClientId,
    pub device_id: DeviceId,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    None,
    Init { client_id: ClientId, device_count: u32 },
    WeightStatus { ready: bool },
}

/// Uniform `{code, message}` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            error_code: ErrorCode::SUCCESS,
            error_message: String::new(),
            body,
        }
    }

    pub fn error(err: &DeployError) -> Self {
        Self {
            error_code: err.code(),
            error_message: err.to_string(),
            body: ResponseBody::None,
        }
    }

    pub fn from_result(result: Result<ResponseBody>) -> Self {
        match result {
            Ok(body) => Self::ok(body),
            Err(e) => Self::error(&e),
        }
    }

    pub fn into_result(self) -> Result<ResponseBody> {
        if self.error_code.is_success() {
            Ok(self.body)
        } else {
            Err(DeployError::from_wire(self.error_code, self.error_message))
        }
    }
}
