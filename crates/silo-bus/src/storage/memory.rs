use super::PartitionLog;
use crate::message::Message;
use crate::Result;

/// In-memory partition log.
///
/// Offsets index directly into the backing vector, so reads are O(1) lookups.
#[derive(Debug, Default)]
pub struct MemoryLog {
    messages: Vec<Message>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PartitionLog for MemoryLog {
    fn append(&mut self, message: &Message) -> Result<()> {
        debug_assert_eq!(message.offset, self.messages.len() as u64);
        self.messages.push(message.clone());
        Ok(())
    }

    fn read(&self, start_offset: u64, max_messages: usize) -> Result<Vec<Message>> {
        let start = start_offset as usize;
        if start >= self.messages.len() {
            return Ok(Vec::new());
        }
        Ok(self.messages[start..]
            .iter()
            .take(max_messages)
            .cloned()
            .collect())
    }

    fn next_offset(&self) -> u64 {
        self.messages.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
