//! Turns the HTTP byte stream into device write blocks.
//!
//! The co-processor needs the first `header_size` bytes of the image in a
//! single write. Everything after the header is forwarded as it arrives, or
//! re-chunked to the device write alignment.

use serde::{Deserialize, Serialize};

use super::error::FotaError;
use super::ports::DeviceUpdateChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentPolicy {
    /// Body blocks are multiples of the write alignment; the remainder is
    /// flushed when the transfer completes.
    #[default]
    Rechunk,
    /// Body chunks go to the device exactly as received.
    Passthrough,
}

#[derive(Debug)]
pub struct ReassemblyBuffer {
    /// Header accumulator, `None` once released
    header: Option<Vec<u8>>,
    header_size: usize,
    header_transferred: bool,
    alignment: usize,
    policy: AlignmentPolicy,
    /// Body bytes waiting for a full alignment unit (Rechunk only)
    pending: Vec<u8>,
}

impl ReassemblyBuffer {
    pub fn new(header_size: usize, alignment: usize, policy: AlignmentPolicy) -> Self {
        let alignment = alignment.max(1);
        Self {
            header: Some(Vec::with_capacity(header_size)),
            header_size,
            header_transferred: false,
            alignment,
            policy,
            pending: match policy {
                AlignmentPolicy::Rechunk => Vec::with_capacity(alignment),
                AlignmentPolicy::Passthrough => Vec::new(),
            },
        }
    }

    /// Header bytes received but not yet sent.
    pub fn buffered_len(&self) -> usize {
        self.header.as_ref().map_or(0, Vec::len)
    }

    pub fn is_released(&self) -> bool {
        self.header.is_none()
    }

    /// Feed one received chunk, forwarding whatever blocks it completes.
    pub fn accumulate(
        &mut self,
        chunk: &[u8],
        device: &mut dyn DeviceUpdateChannel,
    ) -> Result<(), FotaError> {
        let header = self.header.as_mut().ok_or(FotaError::TransferAbandoned)?;

        let mut body = chunk;
        if !self.header_transferred {
            let take = (self.header_size - header.len()).min(chunk.len());
            header.extend_from_slice(&chunk[..take]);
            body = &chunk[take..];

            if header.len() < self.header_size {
                return Ok(());
            }

            device.send_block(&header[..]).map_err(|e| {
                log::error!("Failed to send image header to device: {:?}", e);
                FotaError::DeviceWriteFailed
            })?;
            header.clear();
            self.header_transferred = true;
            log::info!("Image header ({} bytes) transferred to device", self.header_size);
        }

        if body.is_empty() {
            return Ok(());
        }

        match self.policy {
            AlignmentPolicy::Passthrough => self.forward_as_is(body, device),
            AlignmentPolicy::Rechunk => self.forward_aligned(body, device),
        }
    }

    /// Called once every expected byte has arrived.
    pub fn finish(&mut self, device: &mut dyn DeviceUpdateChannel) -> Result<(), FotaError> {
        if self.header.is_none() {
            return Err(FotaError::TransferAbandoned);
        }
        if !self.header_transferred {
            log::error!(
                "Image ended after {} bytes, before the {} byte header was complete",
                self.buffered_len(),
                self.header_size
            );
            return Err(FotaError::IncompleteHeader);
        }
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.write_body(&tail, device)?;
        }
        Ok(())
    }

    /// Drop the buffers; later chunks are refused.
    pub fn release(&mut self) {
        self.header = None;
        self.pending = Vec::new();
    }

    fn forward_as_is(
        &mut self,
        body: &[u8],
        device: &mut dyn DeviceUpdateChannel,
    ) -> Result<(), FotaError> {
        let result = self.write_body(body, device);
        if result.is_err() && body.len() % self.alignment != 0 {
            log::warn!(
                "Block of {} bytes is not a multiple of the {} byte write alignment, \
                 which may be why the device rejected it",
                body.len(),
                self.alignment
            );
        }
        result
    }

    fn forward_aligned(
        &mut self,
        mut body: &[u8],
        device: &mut dyn DeviceUpdateChannel,
    ) -> Result<(), FotaError> {
        if !self.pending.is_empty() {
            let take = (self.alignment - self.pending.len()).min(body.len());
            self.pending.extend_from_slice(&body[..take]);
            body = &body[take..];
            if self.pending.len() < self.alignment {
                return Ok(());
            }
            let unit = std::mem::take(&mut self.pending);
            self.write_body(&unit, device)?;
            self.pending = unit;
            self.pending.clear();
        }

        let aligned = body.len() - body.len() % self.alignment;
        if aligned > 0 {
            self.write_body(&body[..aligned], device)?;
        }
        self.pending.extend_from_slice(&body[aligned..]);
        Ok(())
    }

    fn write_body(
        &mut self,
        block: &[u8],
        device: &mut dyn DeviceUpdateChannel,
    ) -> Result<(), FotaError> {
        device.send_block(block).map_err(|e| {
            log::error!("Failed to send {} bytes to device: {:?}", block.len(), e);
            FotaError::DeviceWriteFailed
        })?;
        log::debug!("Block of {} bytes transferred to device", block.len());
        Ok(())
    }
}
