use std::collections::VecDeque;

use crate::event::{Event, Timestamped};
use crate::utils::{now_millis, Timestamp};

/// 有界 FIFO 缓冲
///
/// 超出容量时淘汰最早的元素并返回给调用方（由调用方记录告警）。
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// 追加元素；若超出容量，返回被淘汰的最早元素
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// 取出全部元素（保持到达顺序）
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 累计淘汰数
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// 非稳态期间缓冲的消息
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    pub topic: String,
    pub message: Event,
    /// 事件的有效时间戳，用于同步窗口判定和回放排序
    pub timestamp: Timestamp,
    /// 进入缓冲的时间
    pub received_at: Timestamp,
}

impl BufferedMessage {
    pub fn new(message: Event) -> Self {
        Self {
            topic: message.topic.clone(),
            timestamp: message.timestamp,
            received_at: now_millis(),
            message,
        }
    }
}

impl Timestamped for BufferedMessage {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn sequence(&self) -> u64 {
        self.message.sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let mut buffer = BoundedBuffer::new(3);
        let mut evicted = Vec::new();

        for i in 0..10 {
            if let Some(old) = buffer.push(i) {
                evicted.push(old);
            }
            assert!(buffer.len() <= 3);
        }

        // 总是淘汰最早的
        assert_eq!(evicted, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.drain(), vec![7, 8, 9]);
        assert_eq!(buffer.evicted(), 7);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = BoundedBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.push("a"), None);
        assert_eq!(buffer.push("b"), Some("a"));
    }
}
