//! 推模式字节累积器.
//!
//! 推模式下数据按任意大小的块到达, box 头部可能被切断在两个块之间.
//! `ChunkAdapter` 把到达的块拼接成连续缓冲区, 并记录缓冲区首字节在
//! 原始输入中的绝对偏移, 解析器据此与采样索引中的文件偏移对齐.

use bytes::{Bytes, BytesMut};

/// 带绝对偏移的字节累积器
#[derive(Debug, Default)]
pub struct ChunkAdapter {
    buf: BytesMut,
    /// `buf[0]` 在输入中的绝对偏移
    offset: u64,
    /// 尚未到达但需要丢弃的字节数
    pending_skip: u64,
}

impl ChunkAdapter {
    /// 创建空累积器
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个数据块
    pub fn push(&mut self, chunk: &[u8]) {
        let skip = (self.pending_skip as usize).min(chunk.len());
        self.pending_skip -= skip as u64;
        self.buf.extend_from_slice(&chunk[skip..]);
    }

    /// 缓冲区首字节的绝对偏移
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 缓冲区末尾 (下一个到达字节) 的绝对偏移
    pub fn end_offset(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    /// 已累积的字节数
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    /// 查看前 `len` 字节, 不足时返回 None
    pub fn peek(&self, len: usize) -> Option<&[u8]> {
        if self.buf.len() < len {
            return None;
        }
        Some(&self.buf[..len])
    }

    /// 查看全部已累积数据
    pub fn peek_all(&self) -> &[u8] {
        &self.buf
    }

    /// 取出前 `len` 字节, 不足时返回 None
    pub fn take(&mut self, len: usize) -> Option<Bytes> {
        if self.buf.len() < len {
            return None;
        }
        self.offset += len as u64;
        Some(self.buf.split_to(len).freeze())
    }

    /// 丢弃最多 `len` 字节, 返回实际丢弃数
    pub fn flush(&mut self, len: usize) -> usize {
        let n = len.min(self.buf.len());
        let _ = self.buf.split_to(n);
        self.offset += n as u64;
        n
    }

    /// 丢弃 `offset` 之前的所有字节, 包括尚未到达的部分
    pub fn advance_to(&mut self, offset: u64) {
        if offset <= self.offset {
            return;
        }
        let end = self.end_offset();
        if offset <= end {
            self.flush((offset - self.offset) as usize);
        } else {
            self.buf.clear();
            self.pending_skip += offset - end;
            self.offset = offset;
        }
    }

    /// 是否还有待丢弃的未到达字节
    pub fn is_skipping(&self) -> bool {
        self.pending_skip > 0
    }

    /// 清空缓冲区并把下一个到达字节的偏移设为 `offset`
    pub fn reset_to(&mut self, offset: u64) {
        self.buf.clear();
        self.offset = offset;
        self.pending_skip = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_跨块拼接() {
        let mut adapter = ChunkAdapter::new();
        adapter.push(&[0, 0, 0]);
        assert!(adapter.peek(8).is_none());
        adapter.push(&[16, b'f', b'r', b'e', b'e', 1, 2]);
        assert_eq!(adapter.peek(8).unwrap(), &[0, 0, 0, 16, b'f', b'r', b'e', b'e']);
        let head = adapter.take(8).unwrap();
        assert_eq!(head.len(), 8);
        assert_eq!(adapter.offset(), 8);
        assert_eq!(adapter.available(), 2);
        assert_eq!(adapter.end_offset(), 10);
    }

    #[test]
    fn test_丢弃与重置() {
        let mut adapter = ChunkAdapter::new();
        adapter.push(&[1, 2, 3]);
        assert_eq!(adapter.flush(10), 3);
        assert_eq!(adapter.offset(), 3);
        adapter.reset_to(1000);
        assert_eq!(adapter.offset(), 1000);
        assert_eq!(adapter.available(), 0);
    }

    #[test]
    fn test_跳过未到达字节() {
        let mut adapter = ChunkAdapter::new();
        adapter.push(&[1, 2, 3, 4]);
        adapter.advance_to(6);
        assert_eq!(adapter.offset(), 6);
        assert!(adapter.is_skipping());
        adapter.push(&[5, 6, 7, 8]);
        assert!(!adapter.is_skipping());
        assert_eq!(adapter.peek_all(), &[7, 8]);
        assert_eq!(adapter.end_offset(), 8);
    }
}
