use std::collections::VecDeque;

use crate::protocol::IceCandidateRecord;

/// Candidates that cannot move yet: local ones waiting for the relay link,
/// remote ones waiting for the remote description. Both sides are FIFO and
/// belong to the current call only.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    outbound: VecDeque<IceCandidateRecord>,
    inbound: VecDeque<IceCandidateRecord>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_outbound(&mut self, record: IceCandidateRecord) {
        self.outbound.push_back(record);
    }

    pub fn drain_outbound(&mut self) -> Vec<IceCandidateRecord> {
        std::mem::take(&mut self.outbound).into()
    }

    pub fn buffer_inbound(&mut self, record: IceCandidateRecord) {
        self.inbound.push_back(record);
    }

    pub fn drain_inbound(&mut self) -> Vec<IceCandidateRecord> {
        std::mem::take(&mut self.inbound).into()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}
