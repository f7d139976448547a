//! File-constant weight transfer to remote devices

use super::deployer::Deployer;
use super::planner::FileConstant;
use crate::error::{DeployError, Result};
use crate::protocol::{RequestBody, ResponseBody, SharedContentOp, TRANSFER_CHUNK_SIZE};
use memmap2::Mmap;
use std::fs::File;
use tracing::debug;

fn weight_status(body: ResponseBody) -> Result<bool> {
    match body {
        ResponseBody::WeightStatus { ready } => Ok(ready),
        other => Err(DeployError::Internal(format!(
            "expected a weight status, got {:?}",
            other
        ))),
    }
}

fn shared_content(deployer: &dyn Deployer, key: &str, op: SharedContentOp) -> Result<bool> {
    weight_status(deployer.process(RequestBody::DownloadSharedContent {
        key: key.to_string(),
        op,
    })?)
}

/// Send `constant` to the device behind `deployer` unless it already has it.
/// Returns whether any bytes were sent.
pub fn transfer_file_constant(deployer: &dyn Deployer, constant: &FileConstant) -> Result<bool> {
    let key = constant.name.as_str();
    if shared_content(deployer, key, SharedContentOp::Query)? {
        debug!(device = %deployer.device(), key, "Weight already present");
        return Ok(false);
    }

    let file = File::open(&constant.path).map_err(|e| {
        DeployError::Config(format!("weight file {}: {}", constant.path.display(), e))
    })?;
    let total = file.metadata()?.len();
    if shared_content(deployer, key, SharedContentOp::Begin { total })? {
        return Ok(false);
    }
    if total == 0 {
        return Ok(false);
    }

    // Safety: the file stays open for the lifetime of the map and is only read.
    let mmap = unsafe { Mmap::map(&file)? };
    let mut offset = 0u64;
    let mut ready = false;
    for chunk in mmap.chunks(TRANSFER_CHUNK_SIZE) {
        ready = shared_content(
            deployer,
            key,
            SharedContentOp::Chunk {
                offset,
                data: chunk.to_vec(),
            },
        )?;
        offset += chunk.len() as u64;
    }
    if !ready {
        return Err(DeployError::transport(
            "transfer weight",
            deployer.device().device_id,
            format!("{} incomplete after {} bytes", key, offset),
        ));
    }
    debug!(device = %deployer.device(), key, bytes = total, "Weight transferred");
    Ok(true)
}

/// Stream submodel bytes in bounded chunks after announcing their size
pub fn transfer_submodel(
    deployer: &dyn Deployer,
    root_model_id: u32,
    sub_model_id: u32,
    data: &[u8],
) -> Result<()> {
    deployer.process(RequestBody::PreDownloadModel {
        root_model_id,
        sub_model_id,
        total_size: data.len() as u64,
    })?;
    let mut offset = 0u64;
    for chunk in data.chunks(TRANSFER_CHUNK_SIZE) {
        deployer.process(RequestBody::DownloadModel {
            root_model_id,
            sub_model_id,
            offset,
            data: chunk.to_vec(),
        })?;
        offset += chunk.len() as u64;
    }
    Ok(())
}
