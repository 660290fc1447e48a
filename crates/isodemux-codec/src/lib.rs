//! # isodemux-codec
//!
//! 编解码器标识与数据包抽象.
//!
//! 解封装器只负责切分与定时, 不解码任何编码数据; 本 crate 提供
//! 描述"这是什么编码"与"这一段数据何时呈现"所需的最小类型集合.

pub mod codec_id;
pub mod packet;
pub mod protection;

// 重导出常用类型
pub use codec_id::CodecId;
pub use packet::Packet;
pub use protection::{SampleProtection, Subsample};
