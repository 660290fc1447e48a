//! 元数据 box 树.
//!
//! moov/moof 这类元数据 box 会整体读入内存, 然后展开成一棵扁平的
//! 节点数组 (arena). 节点之间用下标互相引用, 不持有任何指针.
//! 遍历使用显式栈, 只展开已知的容器类型, 未知 box 按大小跳过.
//!
//! 子 box 越过父容器边界时记为缺陷 (defect), 不中止整棵树的解析:
//! 调用方据此跳过受影响的轨道或分片, 会话本身继续.

use bytes::Bytes;
use log::{debug, warn};

use super::boxes::{BoxType, HeaderParse, parse_box_header};

/// 节点下标
pub type NodeId = usize;

/// box 树节点
#[derive(Debug, Clone)]
pub struct BoxNode {
    /// box 类型
    pub box_type: BoxType,
    /// box 在输入中的绝对偏移
    pub offset: u64,
    /// 头部大小
    pub header_size: u64,
    /// box 总大小 (已解析 size 0 的情况)
    pub size: u64,
    /// 父节点
    pub parent: Option<NodeId>,
    /// 扩展类型 (uuid box)
    pub user_type: Option<[u8; 16]>,
    /// 子节点 (按文件顺序)
    children: Vec<NodeId>,
}

/// 结构缺陷
#[derive(Debug, Clone)]
pub struct BoxDefect {
    /// 出现缺陷的容器节点 (None 表示顶层)
    pub container: Option<NodeId>,
    /// 出错位置的绝对偏移
    pub offset: u64,
    /// 描述
    pub reason: String,
}

/// 扁平化的 box 树
#[derive(Debug, Clone)]
pub struct BoxTree {
    data: Bytes,
    base_offset: u64,
    nodes: Vec<BoxNode>,
    roots: Vec<NodeId>,
    defects: Vec<BoxDefect>,
}

impl BoxTree {
    /// 解析一段完整的元数据字节
    ///
    /// # 参数
    /// - `data`: 从某个 box 起点开始的字节 (通常正好是一个 moov 或 moof)
    /// - `base_offset`: `data[0]` 在输入中的绝对偏移
    pub fn parse(data: Bytes, base_offset: u64) -> Self {
        let mut tree = Self {
            data,
            base_offset,
            nodes: Vec::new(),
            roots: Vec::new(),
            defects: Vec::new(),
        };

        // (父节点, 起点, 终点), 位置相对 data
        let mut stack: Vec<(Option<NodeId>, usize, usize)> = vec![(None, 0, tree.data.len())];
        while let Some((parent, start, end)) = stack.pop() {
            let mut pos = start;
            while pos < end {
                let remaining = end - pos;
                let abs = base_offset + pos as u64;
                let header = match parse_box_header(&tree.data[pos..end], abs, 0) {
                    Ok(HeaderParse::Complete(header)) => header,
                    Ok(HeaderParse::NeedMore(_)) => {
                        // 容器末尾不足一个头部的填充字节
                        debug!("box 树: 偏移 {} 处有 {} 字节残留, 忽略", abs, remaining);
                        break;
                    }
                    Err(e) => {
                        tree.record_defect(parent, abs, e.to_string());
                        break;
                    }
                };

                let size = header.resolved_size(remaining as u64);
                if size > remaining as u64 {
                    tree.record_defect(
                        parent,
                        abs,
                        format!(
                            "{} 声明 {} 字节, 超出容器剩余 {} 字节",
                            header.box_type, size, remaining
                        ),
                    );
                    break;
                }

                let id = tree.nodes.len();
                tree.nodes.push(BoxNode {
                    box_type: header.box_type,
                    offset: abs,
                    header_size: header.header_size,
                    size,
                    parent,
                    user_type: header.user_type,
                    children: Vec::new(),
                });
                match parent {
                    Some(p) => tree.nodes[p].children.push(id),
                    None => tree.roots.push(id),
                }

                if header.box_type.is_container() {
                    let child_start = pos + header.header_size as usize;
                    stack.push((Some(id), child_start, pos + size as usize));
                }
                pos += size as usize;
            }
        }

        tree
    }

    fn record_defect(&mut self, container: Option<NodeId>, offset: u64, reason: String) {
        warn!("box 树: 偏移 {} 处结构缺陷: {}", offset, reason);
        self.defects.push(BoxDefect {
            container,
            offset,
            reason,
        });
    }

    /// 顶层节点
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// 第一个顶层节点
    pub fn root(&self) -> Option<NodeId> {
        self.roots.first().copied()
    }

    /// 获取节点
    pub fn node(&self, id: NodeId) -> &BoxNode {
        &self.nodes[id]
    }

    /// 节点总数
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 是否为空树
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 子节点
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// 指定类型的第一个子节点
    pub fn child(&self, id: NodeId, box_type: BoxType) -> Option<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].box_type == box_type)
    }

    /// 指定类型的所有子节点
    pub fn children_of_type(
        &self,
        id: NodeId,
        box_type: BoxType,
    ) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(move |&c| self.nodes[c].box_type == box_type)
    }

    /// 沿路径查找后代节点, 每一级取第一个匹配
    pub fn find_path(&self, id: NodeId, path: &[BoxType]) -> Option<NodeId> {
        path.iter()
            .try_fold(id, |current, &box_type| self.child(current, box_type))
    }

    /// box 内容 (不含头部)
    pub fn payload(&self, id: NodeId) -> &[u8] {
        let (start, end) = self.payload_range(id);
        &self.data[start..end]
    }

    /// box 内容 (零拷贝共享)
    pub fn payload_bytes(&self, id: NodeId) -> Bytes {
        let (start, end) = self.payload_range(id);
        self.data.slice(start..end)
    }

    fn payload_range(&self, id: NodeId) -> (usize, usize) {
        let node = &self.nodes[id];
        let start = (node.offset - self.base_offset + node.header_size) as usize;
        let end = (node.offset - self.base_offset + node.size) as usize;
        (start, end)
    }

    /// 所有缺陷
    pub fn defects(&self) -> &[BoxDefect] {
        &self.defects
    }

    /// 节点的子树内是否存在缺陷
    pub fn subtree_has_defect(&self, id: NodeId) -> bool {
        self.defects.iter().any(|d| {
            let mut cursor = d.container;
            while let Some(c) = cursor {
                if c == id {
                    return true;
                }
                cursor = self.nodes[c].parent;
            }
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_解析_嵌套容器() {
        let tkhd = make_box(b"tkhd", &[0u8; 20]);
        let mdhd = make_box(b"mdhd", &[0u8; 24]);
        let mdia = make_box(b"mdia", &mdhd);
        let mut trak_payload = tkhd.clone();
        trak_payload.extend_from_slice(&mdia);
        let trak = make_box(b"trak", &trak_payload);
        let moov = make_box(b"moov", &trak);

        let tree = BoxTree::parse(Bytes::from(moov), 100);
        let root = tree.root().unwrap();
        assert_eq!(tree.node(root).box_type, BoxType::Moov);
        assert_eq!(tree.node(root).offset, 100);

        let trak_id = tree.child(root, BoxType::Trak).unwrap();
        assert_eq!(tree.children(trak_id).len(), 2);
        let mdhd_id = tree
            .find_path(root, &[BoxType::Trak, BoxType::Mdia, BoxType::Mdhd])
            .unwrap();
        assert_eq!(tree.payload(mdhd_id).len(), 24);
        assert_eq!(tree.node(mdhd_id).offset, 100 + 8 + 8 + 28 + 8);
        assert!(tree.defects().is_empty());
    }

    #[test]
    fn test_未知_box_按大小跳过() {
        let unknown = make_box(b"zzzz", &[0xAB; 13]);
        let mvhd = make_box(b"mvhd", &[0u8; 4]);
        let mut payload = unknown;
        payload.extend_from_slice(&mvhd);
        let moov = make_box(b"moov", &payload);

        let tree = BoxTree::parse(Bytes::from(moov), 0);
        let root = tree.root().unwrap();
        assert_eq!(tree.children(root).len(), 2);
        assert!(tree.child(root, BoxType::Mvhd).is_some());
    }

    #[test]
    fn test_子_box_溢出_记录缺陷() {
        // trak 内的 tkhd 声明大小超出 trak
        let mut bad_tkhd = Vec::new();
        bad_tkhd.extend_from_slice(&200u32.to_be_bytes());
        bad_tkhd.extend_from_slice(b"tkhd");
        bad_tkhd.extend_from_slice(&[0u8; 8]);
        let bad_trak = make_box(b"trak", &bad_tkhd);
        let good_trak = make_box(b"trak", &make_box(b"tkhd", &[0u8; 8]));
        let mut payload = bad_trak;
        payload.extend_from_slice(&good_trak);
        let moov = make_box(b"moov", &payload);

        let tree = BoxTree::parse(Bytes::from(moov), 0);
        let root = tree.root().unwrap();
        let traks: Vec<_> = tree.children_of_type(root, BoxType::Trak).collect();
        assert_eq!(traks.len(), 2);
        assert!(tree.subtree_has_defect(traks[0]));
        assert!(!tree.subtree_has_defect(traks[1]));
        assert!(tree.subtree_has_defect(root));
    }
}
