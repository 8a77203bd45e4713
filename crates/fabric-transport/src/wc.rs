//! The side-channel work-completion record.
//!
//! Initiators write one of these into the target's side-channel region (or
//! into the request queue's record array) after their data transfer has
//! completed locally. The target reads it back to learn the byte length and
//! offsets of the operation it just observed.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::nic::{InstanceId, MemoryRegion};

/// Encoded size of a [`WorkCompletion`]: six u64 fields and a u16 opcode.
pub const WC_RECORD_LEN: usize = 50;

/// Operation codes carried in [`WorkCompletion::op`] and tracked as a
/// buffer's last issued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// A request sent into a request queue.
    Send,
    /// The issuing side of a put.
    PutInitiator,
    /// The issuing side of a get.
    GetInitiator,
    /// The written side of a put.
    PutTarget,
    /// The read side of a get.
    GetTarget,
    /// An inbox arrival.
    Receive,
    /// A reply arrival.
    Result,
    /// A request delivered from the request queue.
    NewRequest,
}

impl OpCode {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            OpCode::Send => 1,
            OpCode::PutInitiator => 2,
            OpCode::GetInitiator => 3,
            OpCode::PutTarget => 4,
            OpCode::GetTarget => 5,
            OpCode::Receive => 6,
            OpCode::Result => 7,
            OpCode::NewRequest => 8,
        }
    }

    /// Inverse of [`OpCode::as_u16`]; `None` for unknown values.
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1 => OpCode::Send,
            2 => OpCode::PutInitiator,
            3 => OpCode::GetInitiator,
            4 => OpCode::PutTarget,
            5 => OpCode::GetTarget,
            6 => OpCode::Receive,
            7 => OpCode::Result,
            8 => OpCode::NewRequest,
            _ => return None,
        })
    }

    /// Whether data flowed out of the local buffer for this operation.
    pub fn local_is_source(self) -> bool {
        matches!(self, OpCode::PutInitiator | OpCode::GetTarget | OpCode::Send)
    }
}

/// Length and offsets of one operation, as told to its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Set by the request-queue server once the record's event was seen.
    pub ack_received: u64,
    /// Instance id of the initiator.
    pub inst_id: u64,
    /// Bytes moved.
    pub byte_len: u64,
    /// Offset reported to the target; the slot offset for a request.
    pub byte_offset: u64,
    /// Offset in the source buffer.
    pub src_offset: u64,
    /// Offset in the destination buffer.
    pub dest_offset: u64,
    /// [`OpCode`] wire value.
    pub op: u16,
}

impl WorkCompletion {
    /// Zeroed record for `op` sent by `inst_id`.
    pub fn new(op: OpCode, inst_id: InstanceId) -> Self {
        Self {
            inst_id: inst_id as u64,
            op: op.as_u16(),
            ..Default::default()
        }
    }

    /// Decoded operation code.
    pub fn op_code(&self) -> Option<OpCode> {
        OpCode::from_u16(self.op)
    }

    /// The initiator's instance id.
    pub fn sender(&self) -> InstanceId {
        self.inst_id as InstanceId
    }

    /// Fixed-width little-endian encoding, [`WC_RECORD_LEN`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes the first [`WC_RECORD_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WC_RECORD_LEN {
            return Err(TransportError::Serialization(format!(
                "work completion record is {} bytes, need {WC_RECORD_LEN}",
                bytes.len()
            )));
        }
        Ok(bincode::deserialize(&bytes[..WC_RECORD_LEN])?)
    }

    /// Reads the record stored at `offset` inside `region`.
    pub fn read_from(region: &MemoryRegion, offset: usize) -> Result<Self> {
        let bytes = region
            .read_at(offset, WC_RECORD_LEN)
            .ok_or_else(|| TransportError::invalid("work completion outside region"))?;
        Self::decode(&bytes)
    }

    /// Stores the record at `offset` inside `region`.
    pub fn write_into(&self, region: &MemoryRegion, offset: usize) -> Result<()> {
        if region.write_at(offset, &self.encode()?) {
            Ok(())
        } else {
            Err(TransportError::invalid("work completion outside region"))
        }
    }
}
