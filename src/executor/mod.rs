//! Executor worker processes
//!
//! One worker per (context, device). The parent talks to it over two socket
//! pairs:
//! - a data channel carrying framed [`WorkerRequest`]/[`WorkerResponse`]
//!   messages
//! - an event channel carrying fixed 9-byte [`CompletionEvent`] records
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────┐
//! │   Kind   │   Sub type   │    Status    │
//! │ (1 byte) │  (4 bytes)   │  (4 bytes)   │
//! └──────────┴──────────────┴──────────────┘
//! ```
//!
//! A worker announces itself with an `Init` event. For every request the
//! parent writes the frame, raises a `Pending` event carrying the message id
//! and waits for the matching `Complete` event.

pub mod launcher;
pub mod manager;
pub mod runtime;
pub mod worker;

use crate::config::MaintenanceConfig;
use crate::error::{DeployError, ErrorCode, Result};
use crate::plan::DeviceId;
use crate::transport::QueueId;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

pub use launcher::{ForkLauncher, LaunchedWorker, ThreadLauncher, WorkerChild, WorkerLauncher};
pub use manager::{ExecutorManager, ExecutorProcess};
pub use worker::ProcessWorker;

/// Sub type carried by the handshake event
pub const INIT_SUB_TYPE: u32 = 0;

pub const EVENT_LEN: usize = 9;

/// What a worker is bound to when it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub device_id: DeviceId,
    pub queue_id: QueueId,
    pub mem_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    Init = 1,
    Pending = 2,
    Complete = 3,
}

impl EventKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EventKind::Init),
            2 => Some(EventKind::Pending),
            3 => Some(EventKind::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub kind: EventKind,
    pub sub_type: u32,
    pub status: u32,
}

impl CompletionEvent {
    pub fn new(kind: EventKind, sub_type: u32, status: u32) -> Self {
        Self {
            kind,
            sub_type,
            status,
        }
    }

    pub fn encode(&self) -> [u8; EVENT_LEN] {
        let mut bytes = [0u8; EVENT_LEN];
        bytes[0] = self.kind as u8;
        bytes[1..5].copy_from_slice(&self.sub_type.to_le_bytes());
        bytes[5..9].copy_from_slice(&self.status.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; EVENT_LEN]) -> io::Result<Self> {
        let kind = EventKind::from_u8(bytes[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown event kind {}", bytes[0]),
            )
        })?;
        let mut sub_type = [0u8; 4];
        sub_type.copy_from_slice(&bytes[1..5]);
        let mut status = [0u8; 4];
        status.copy_from_slice(&bytes[5..9]);
        Ok(Self {
            kind,
            sub_type: u32::from_le_bytes(sub_type),
            status: u32::from_le_bytes(status),
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())?;
        writer.flush()
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut bytes = [0u8; EVENT_LEN];
        reader.read_exact(&mut bytes)?;
        Self::decode(&bytes)
    }
}

/// Requests a worker understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    LoadModel {
        root_model_id: u32,
        sub_model_id: u32,
        name: String,
        model: Vec<u8>,
        input_queue_ids: Vec<QueueId>,
        output_queue_ids: Vec<QueueId>,
    },
    UnloadModel {
        root_model_id: u32,
        sub_model_id: Option<u32>,
    },
    SyncVarManager {
        session_id: u64,
        data: Vec<u8>,
    },
    UpdateConfig(MaintenanceConfig),
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    /// Submodels loaded in the worker after the request
    pub loaded_models: u32,
}

impl WorkerResponse {
    pub fn ok(loaded_models: u32) -> Self {
        Self {
            error_code: ErrorCode::SUCCESS,
            error_message: String::new(),
            loaded_models,
        }
    }

    pub fn error(err: &DeployError, loaded_models: u32) -> Self {
        Self {
            error_code: err.code(),
            error_message: err.to_string(),
            loaded_models,
        }
    }

    pub fn into_result(self) -> Result<Self> {
        if self.error_code.is_success() {
            Ok(self)
        } else {
            Err(DeployError::from_wire(self.error_code, self.error_message))
        }
    }
}

/// Byte-level worker contract: start with a handshake, exchange opaque
/// request/response payloads, stop
pub trait WorkerHandle: Send {
    fn start(&mut self) -> Result<()>;
    fn send_request(&mut self, request: &[u8]) -> Result<Vec<u8>>;
    fn stop(&mut self) -> Result<()>;
    fn is_running(&self) -> bool;
    fn pid(&self) -> Option<i32>;
}
