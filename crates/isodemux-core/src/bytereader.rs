//! 大端字节读取器.
//!
//! box 内容已经完整驻留在内存中 (moov/moof 会被整体保留),
//! 因此字段解析全部走切片而不是 I/O 调用. 所有读取在越界时返回
//! `IsoError::Truncated`, 由调用方决定是致命错误还是跳过.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{IsoError, IsoResult};

/// 基于切片的大端字段读取器
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// 从切片创建读取器
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// 当前读取位置 (相对切片起点)
    pub fn position(&self) -> usize {
        self.pos
    }

    /// 剩余字节数
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// 是否已读完
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// 剩余未读数据
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// 取出接下来的 `len` 字节
    fn take(&mut self, len: usize) -> IsoResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(IsoError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// 跳过 `len` 字节
    pub fn skip(&mut self, len: usize) -> IsoResult<()> {
        self.take(len).map(|_| ())
    }

    /// 定位到绝对位置
    pub fn seek(&mut self, pos: usize) -> IsoResult<()> {
        if pos > self.data.len() {
            return Err(IsoError::Truncated {
                needed: pos,
                available: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_u8(&mut self) -> IsoResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> IsoResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> IsoResult<i16> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    /// 读取 3 字节无符号整数
    pub fn read_u24(&mut self) -> IsoResult<u32> {
        Ok(BigEndian::read_u24(self.take(3)?))
    }

    pub fn read_u32(&mut self) -> IsoResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> IsoResult<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> IsoResult<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> IsoResult<i64> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    /// 按 version 读取 32 或 64 位无符号整数
    pub fn read_u32_or_u64(&mut self, wide: bool) -> IsoResult<u64> {
        if wide {
            self.read_u64()
        } else {
            self.read_u32().map(u64::from)
        }
    }

    /// 读取 16.16 定点数, 返回整数部分
    pub fn read_fixed16_16(&mut self) -> IsoResult<u32> {
        Ok(self.read_u32()? >> 16)
    }

    /// 读取 4 字节标签 (FourCC)
    pub fn read_fourcc(&mut self) -> IsoResult<[u8; 4]> {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(self.take(4)?);
        Ok(tag)
    }

    /// 读取 16 字节 UUID
    pub fn read_uuid(&mut self) -> IsoResult<[u8; 16]> {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(self.take(16)?);
        Ok(uuid)
    }

    /// 读取指定长度的字节切片 (不拷贝)
    pub fn read_bytes(&mut self, len: usize) -> IsoResult<&'a [u8]> {
        self.take(len)
    }

    /// 读取 full box 头部: (version, flags)
    pub fn read_full_box_header(&mut self) -> IsoResult<(u8, u32)> {
        let version = self.read_u8()?;
        let flags = self.read_u24()?;
        Ok((version, flags))
    }

    /// 读取以 NUL 结尾的字符串 (不含结尾), 无结尾时读到末尾
    pub fn read_cstring(&mut self) -> IsoResult<String> {
        let rest = self.rest();
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += (len + 1).min(rest.len());
        Ok(text)
    }
}
