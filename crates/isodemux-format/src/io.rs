//! I/O 抽象层.
//!
//! 对标 FFmpeg 的 `AVIOContext`, 为解封装器提供统一的读取接口.
//! 后端分为可随机访问 (文件、内存) 与只能顺序读取 (管道、网络流) 两类,
//! 解封装器根据 `is_seekable()` 选择拉模式或推模式.

use std::io::{self, Read, Seek};

use isodemux_core::{IsoError, IsoResult};

/// I/O 上下文
///
/// 封装底层 I/O 操作, 带读缓冲区.
pub struct IoContext {
    /// 内部 I/O 实现
    inner: Box<dyn IoBackend>,
    /// 读缓冲区
    buffer: Vec<u8>,
    /// 缓冲区中的有效数据长度
    buf_len: usize,
    /// 缓冲区当前读取位置
    buf_pos: usize,
}

/// I/O 后端 trait
///
/// 实现此 trait 以支持不同的输入来源.
pub trait IoBackend: Send {
    /// 读取数据到缓冲区, 返回 0 表示结束
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// 定位 (seek)
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64>;
    /// 获取总大小 (如果可知)
    fn size(&self) -> Option<u64>;
    /// 是否支持 seek
    fn is_seekable(&self) -> bool;
}

/// 默认缓冲区大小 (32 KB)
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

impl IoContext {
    /// 从 I/O 后端创建上下文
    pub fn new(backend: Box<dyn IoBackend>) -> Self {
        Self {
            inner: backend,
            buffer: vec![0u8; DEFAULT_BUFFER_SIZE],
            buf_len: 0,
            buf_pos: 0,
        }
    }

    /// 从文件路径打开 (只读)
    pub fn open_read(path: &str) -> IsoResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self::new(Box::new(FileBackend::new(file))))
    }

    /// 从内存数据创建
    pub fn from_memory(data: Vec<u8>) -> Self {
        Self::new(Box::new(MemoryBackend::from_data(data)))
    }

    // ========================
    // 读取方法
    // ========================

    /// 读取指定字节数, 数据不足时返回 `Eof`
    pub fn read_exact(&mut self, buf: &mut [u8]) -> IsoResult<()> {
        let mut total_read = 0;
        while total_read < buf.len() {
            let buffered = self.buf_len - self.buf_pos;
            if buffered > 0 {
                let to_copy = buffered.min(buf.len() - total_read);
                buf[total_read..total_read + to_copy]
                    .copy_from_slice(&self.buffer[self.buf_pos..self.buf_pos + to_copy]);
                self.buf_pos += to_copy;
                total_read += to_copy;
            } else {
                self.fill()?;
                if self.buf_len == 0 {
                    return Err(IsoError::Eof);
                }
            }
        }
        Ok(())
    }

    /// 重新填充读缓冲区
    fn fill(&mut self) -> IsoResult<()> {
        self.buf_pos = 0;
        self.buf_len = self.inner.read(&mut self.buffer)?;
        Ok(())
    }

    /// 读取指定数量的字节
    pub fn read_bytes(&mut self, count: usize) -> IsoResult<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// 读取最多 `max` 字节, 返回空表示输入结束
    ///
    /// 推模式的块来源: 每次返回当前可得的数据, 不等待凑满.
    pub fn read_chunk(&mut self, max: usize) -> IsoResult<Vec<u8>> {
        if self.buf_pos == self.buf_len {
            self.fill()?;
        }
        let available = (self.buf_len - self.buf_pos).min(max);
        let chunk = self.buffer[self.buf_pos..self.buf_pos + available].to_vec();
        self.buf_pos += available;
        Ok(chunk)
    }

    /// 从绝对位置读取指定字节数 (仅随机访问后端)
    pub fn read_at(&mut self, offset: u64, count: usize) -> IsoResult<Vec<u8>> {
        self.seek(io::SeekFrom::Start(offset))?;
        self.read_bytes(count)
    }

    /// 从绝对位置读取最多 `count` 字节, 遇到结尾时返回较短的数据
    pub fn read_at_most(&mut self, offset: u64, count: usize) -> IsoResult<Vec<u8>> {
        self.seek(io::SeekFrom::Start(offset))?;
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let chunk = self.read_chunk(count - out.len())?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    // ========================
    // 定位方法
    // ========================

    /// 定位 (seek)
    ///
    /// 注意: seek 会清空读缓冲区.
    pub fn seek(&mut self, pos: io::SeekFrom) -> IsoResult<u64> {
        if !self.inner.is_seekable() {
            return Err(IsoError::Unsupported("输入不支持随机访问".into()));
        }
        self.buf_pos = 0;
        self.buf_len = 0;
        Ok(self.inner.seek(pos)?)
    }

    /// 是否支持随机访问
    pub fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    /// 获取总大小
    pub fn size(&self) -> Option<u64> {
        self.inner.size()
    }
}

/// 文件 I/O 后端
struct FileBackend {
    file: std::fs::File,
    size: Option<u64>,
}

impl FileBackend {
    fn new(file: std::fs::File) -> Self {
        let size = file.metadata().ok().map(|m| m.len());
        Self { file, size }
    }
}

impl IoBackend for FileBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// 内存缓冲区 I/O 后端
///
/// 用于测试和内存中处理.
pub struct MemoryBackend {
    /// 数据缓冲区
    data: Vec<u8>,
    /// 当前位置
    pos: usize,
}

impl MemoryBackend {
    /// 从已有数据创建
    pub fn from_data(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl IoBackend for MemoryBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.data.len().saturating_sub(self.pos);
        let to_read = buf.len().min(available);
        if to_read == 0 {
            return Ok(0);
        }
        buf[..to_read].copy_from_slice(&self.data[self.pos..self.pos + to_read]);
        self.pos += to_read;
        Ok(to_read)
    }

    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            io::SeekFrom::Start(offset) => offset as i64,
            io::SeekFrom::End(offset) => self.data.len() as i64 + offset,
            io::SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek 位置不能为负",
            ));
        }
        self.pos = new_pos as usize;
        Ok(self.pos as u64)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// 顺序读取后端 (管道、标准输入、网络流)
///
/// 不支持 seek, 解封装器会切换到推模式.
pub struct StreamBackend {
    reader: Box<dyn Read + Send>,
    /// 上游声明的总大小
    size: Option<u64>,
}

impl StreamBackend {
    /// 包装任意 `Read`
    pub fn new(reader: Box<dyn Read + Send>, size: Option<u64>) -> Self {
        Self { reader, size }
    }
}

impl IoBackend for StreamBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }

    fn seek(&mut self, _pos: io::SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "顺序输入不支持 seek",
        ))
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn is_seekable(&self) -> bool {
        false
    }
}
