//! 逐采样加密附加信息.
//!
//! 解封装器不解密任何数据, 只把 senc/saiz/saio 与 tenc 中描述的
//! 加密参数原样附加到数据包上, 交给下游解密模块使用.

use bytes::Bytes;

/// 子采样加密区间: 先 `clear_bytes` 明文, 再 `encrypted_bytes` 密文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsample {
    /// 明文字节数
    pub clear_bytes: u16,
    /// 密文字节数
    pub encrypted_bytes: u32,
}

/// 单个采样的加密参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleProtection {
    /// 保护方案 (cenc/cbcs/cens/cbc1)
    pub scheme_type: [u8; 4],
    /// 密钥 ID (KID)
    pub key_id: [u8; 16],
    /// 初始化向量, 为空表示使用常量 IV 或未加密
    pub iv: Bytes,
    /// 子采样区间, 为空表示整个采样加密
    pub subsamples: Vec<Subsample>,
    /// 模式加密: 加密块数
    pub crypt_byte_block: u8,
    /// 模式加密: 跳过块数
    pub skip_byte_block: u8,
}

impl SampleProtection {
    /// 方案名称字符串
    pub fn scheme_str(&self) -> String {
        String::from_utf8_lossy(&self.scheme_type).into_owned()
    }

    /// 子采样覆盖的总字节数
    pub fn covered_bytes(&self) -> u64 {
        self.subsamples
            .iter()
            .map(|s| u64::from(s.clear_bytes) + u64::from(s.encrypted_bytes))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_子采样覆盖字节数() {
        let prot = SampleProtection {
            scheme_type: *b"cenc",
            key_id: [0x11; 16],
            iv: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            subsamples: vec![
                Subsample {
                    clear_bytes: 5,
                    encrypted_bytes: 100,
                },
                Subsample {
                    clear_bytes: 3,
                    encrypted_bytes: 0,
                },
            ],
            crypt_byte_block: 0,
            skip_byte_block: 0,
        };
        assert_eq!(prot.covered_bytes(), 108);
        assert_eq!(prot.scheme_str(), "cenc");
    }
}
