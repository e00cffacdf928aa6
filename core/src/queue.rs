//! Tagged message queues.
//!
//! Every core has two queues. During a superstep senders append to one of
//! them while the owner drains the other; sync swaps the roles.

use crate::error::{BspError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(tag: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self { tag: tag.into(), payload: payload.into() }
    }
}

#[derive(Debug)]
pub struct MessageQueue {
    messages: Vec<Message>,
    payload_bytes: usize,
    max_messages: usize,
    max_bytes: usize,
}

impl MessageQueue {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            messages: Vec::new(),
            payload_bytes: 0,
            max_messages,
            max_bytes,
        }
    }

    pub fn push(&mut self, message: Message) -> Result<()> {
        if self.messages.len() == self.max_messages {
            return Err(BspError::CapacityExceeded {
                what: "message queue",
                capacity: self.max_messages,
            });
        }
        if self.payload_bytes + message.payload.len() > self.max_bytes {
            return Err(BspError::CapacityExceeded {
                what: "message payload",
                capacity: self.max_bytes,
            });
        }
        self.payload_bytes += message.payload.len();
        self.messages.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// (count, payload bytes) of the messages at and after `cursor`.
    pub fn remaining(&self, cursor: usize) -> (usize, usize) {
        let rest = self.messages.get(cursor..).unwrap_or(&[]);
        (rest.len(), rest.iter().map(|m| m.payload.len()).sum())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.payload_bytes = 0;
    }
}
