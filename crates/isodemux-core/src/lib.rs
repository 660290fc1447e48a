//! # isodemux-core
//!
//! isodemux 核心库, 提供基础类型定义、错误处理和字节读取工具.
//!
//! 本 crate 是整个解封装框架的底层基础设施, 不依赖任何容器格式细节.

pub mod bytereader;
pub mod error;
pub mod media_type;
pub mod rational;
pub mod timestamp;

// 重导出常用类型
pub use bytereader::ByteReader;
pub use error::{IsoError, IsoResult};
pub use media_type::MediaType;
pub use rational::Rational;
pub use timestamp::NOPTS_VALUE;
