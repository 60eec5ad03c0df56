/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use ropwatch_decoder::InstructionRecord;

use crate::error::WindowOverflow;

/// Instructions of the window being analyzed. Reused from one window to the
/// next; the allocation grows on demand up to `capacity` records.
#[derive(Debug)]
pub struct WindowBuffer {
    records: Vec<InstructionRecord>,
    capacity: usize,
}

impl WindowBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Appends a record, failing once the buffer holds `capacity` records.
    pub fn push(&mut self, record: InstructionRecord) -> Result<(), WindowOverflow> {
        if self.records.len() >= self.capacity {
            return Err(WindowOverflow {
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn as_slice(&self) -> &[InstructionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use ropwatch_decoder::InsnClass;

    use super::*;

    #[test]
    fn overflow_at_capacity() {
        let mut buffer = WindowBuffer::new(2);
        assert_eq!(buffer.capacity(), 2);
        let record = InstructionRecord::synthetic(InsnClass::Ordinary);
        assert_eq!(buffer.push(record), Ok(()));
        assert_eq!(buffer.push(record), Ok(()));
        assert_eq!(buffer.push(record), Err(WindowOverflow { capacity: 2 }));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.push(record), Ok(()));
    }

    #[test]
    fn keeps_execution_order() {
        let mut buffer = WindowBuffer::new(16);
        for class in [InsnClass::NearCall, InsnClass::Ordinary, InsnClass::NearReturn] {
            buffer.push(InstructionRecord::synthetic(class)).unwrap();
        }
        let classes: Vec<_> = buffer.as_slice().iter().map(|record| record.class).collect();
        assert_eq!(
            classes,
            vec![InsnClass::NearCall, InsnClass::Ordinary, InsnClass::NearReturn]
        );
    }
}
