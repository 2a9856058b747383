//! # 数据报编解码与协议数据封装
//!
//! ## 核心意图（Why）
//! - 管理层只依赖数据报的三个字段：固定偏移处的类型字节、作为重试键的 id
//!   字节序列、以及是否要求 ACK 的标志位；本模块以纯函数形式提供
//!   `decode`/`encode` 与两个控制帧构造器，不持有任何状态；
//! - [`ProtocolData`] 是入站/出站载荷的统一信封，携带字节与通道寻址元数据，
//!   创建后不可变。
//!
//! ## 帧布局（What）
//! - 偏移 0：类型字节（[`TYPE_HEARTBEAT`] 心跳、[`TYPE_ACK`] 确认、其余为业务）；
//! - 偏移 1：标志字节，最低位表示要求 ACK；
//! - 偏移 2：id 长度（单字节，上限 255）；
//! - 偏移 3 起：id 字节序列，其后为业务负载。
//!
//! ## 注意事项（Trade-offs）
//! - id 以原始字节序列参与哈希与比较，不经过任何字符集转换，避免平台默认
//!   编码带来的键漂移；
//! - `decode` 是零拷贝切片视图，调用方持有的 [`Datagram`] 与原始 `Bytes`
//!   共享底层存储。

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ConnectorError;

/// 类型字节所在的固定偏移。
pub const TYPE_INDEX: usize = 0;
/// 心跳帧类型。
pub const TYPE_HEARTBEAT: u8 = 0;
/// 确认帧类型。
pub const TYPE_ACK: u8 = 2;

const FLAGS_INDEX: usize = 1;
const ID_LEN_INDEX: usize = 2;
const HEADER_LEN: usize = 3;
const FLAG_ACK: u8 = 0b0000_0001;

/// 解码后的数据报视图。
///
/// # 教案式说明
/// - **意图 (Why)**：把管理层关心的字段从原始字节中提炼成结构化只读视图；
/// - **契约 (What)**：`id` 与 `body` 为底层 `Bytes` 的切片，克隆代价为引用计数；
/// - **风险 (Trade-offs)**：视图按需派生、不缓存，重复解码的调用方自行权衡。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    /// 类型字节。
    pub kind: u8,
    /// 是否要求对端确认。
    pub ack: bool,
    /// 报文 id，字节序列形式，作为重试队列的键。
    pub id: Bytes,
    /// 业务负载。
    pub body: Bytes,
}

/// 解码一帧数据报。纯函数，不产生副作用。
///
/// # 契约说明
/// - **输入**：完整的一帧字节；
/// - **输出**：头部完整时返回 [`Datagram`]，否则返回
///   [`ConnectorError::DecodeFailed`] 并说明缺失的字节数；
/// - **后置条件**：返回视图与 `bytes` 共享存储，原始字节不被修改。
pub fn decode(bytes: &Bytes) -> Result<Datagram, ConnectorError> {
    if bytes.len() < HEADER_LEN {
        return Err(ConnectorError::DecodeFailed {
            detail: format!("frame too short: {} bytes, need at least {HEADER_LEN}", bytes.len()),
        });
    }
    let id_len = bytes[ID_LEN_INDEX] as usize;
    if bytes.len() < HEADER_LEN + id_len {
        return Err(ConnectorError::DecodeFailed {
            detail: format!(
                "frame truncated: id length {id_len} exceeds remaining {} bytes",
                bytes.len() - HEADER_LEN
            ),
        });
    }
    Ok(Datagram {
        kind: bytes[TYPE_INDEX],
        ack: bytes[FLAGS_INDEX] & FLAG_ACK != 0,
        id: bytes.slice(HEADER_LEN..HEADER_LEN + id_len),
        body: bytes.slice(HEADER_LEN + id_len..),
    })
}

/// 编码一帧数据报。
///
/// - **契约 (What)**：`id` 长度超过 255 字节时返回
///   [`ConnectorError::InvalidArgument`]，其余输入总能成帧。
pub fn encode(kind: u8, ack: bool, id: &[u8], body: &[u8]) -> Result<Bytes, ConnectorError> {
    if id.len() > u8::MAX as usize {
        return Err(ConnectorError::InvalidArgument {
            detail: format!("datagram id too long: {} bytes, cap is {}", id.len(), u8::MAX),
        });
    }
    Ok(frame(kind, ack, id, body))
}

/// 构造心跳应答帧。
///
/// # 教案式注释
/// - **意图 (Why)**：收到对端心跳后按相同通路回写，id 由本端端口、对端主机
///   与通道 id 拼接，便于对端按来源去重；
/// - **契约 (What)**：纯函数；相同入参产出字节完全一致，可直接用于断言；
/// - **执行 (How)**：拼接出的 id 超过单字节长度上限时按字节截断。
pub fn build_heartbeat(local_port: u16, remote_host: &str, channel_id: &str) -> Bytes {
    let id = format!("{remote_host}:{local_port}:{channel_id}");
    let id_bytes = id.as_bytes();
    let cap = id_bytes.len().min(u8::MAX as usize);
    frame(TYPE_HEARTBEAT, false, &id_bytes[..cap], &[])
}

/// 构造确认帧，`id` 需回显待确认报文的 id。
///
/// - **意图 (Why)**：上游处理器确认一条可靠入站报文时需要铸造 ACK 帧，
///   与心跳构造器一并构成管理层的全部控制帧出口。
pub fn build_ack(id: &[u8]) -> Bytes {
    let cap = id.len().min(u8::MAX as usize);
    frame(TYPE_ACK, false, &id[..cap], &[])
}

/// 内部成帧原语。调用方保证 `id` 不超过 255 字节。
fn frame(kind: u8, ack: bool, id: &[u8], body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + id.len() + body.len());
    buf.put_u8(kind);
    buf.put_u8(if ack { FLAG_ACK } else { 0 });
    buf.put_u8(id.len() as u8);
    buf.put_slice(id);
    buf.put_slice(body);
    buf.freeze()
}

/// 入站/出站载荷的统一信封。
///
/// # 教案式说明
/// - **意图 (Why)**：把一帧字节与其寻址元数据（本端端口、对端主机、通道 id）
///   绑定为不可变值对象，入站由派发工作线程构造，出站由调用方构造；
/// - **契约 (What)**：
///   - 字节非空、通道 id 非空，构造时校验，违例返回
///     [`ConnectorError::InvalidArgument`]；
///   - 创建后不可变，克隆代价为引用计数与一次主机名拷贝；
/// - **风险 (Trade-offs)**：通道 id 采用 `Arc<str>` 以便与注册表键零拷贝互通。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolData {
    bytes: Bytes,
    local_port: u16,
    remote_host: String,
    channel_id: Arc<str>,
}

impl ProtocolData {
    /// 构造信封并校验不变量。
    pub fn new(
        bytes: Bytes,
        local_port: u16,
        remote_host: impl Into<String>,
        channel_id: impl Into<Arc<str>>,
    ) -> Result<Self, ConnectorError> {
        let channel_id = channel_id.into();
        if bytes.is_empty() {
            return Err(ConnectorError::InvalidArgument {
                detail: "protocol data bytes must not be empty".into(),
            });
        }
        if channel_id.is_empty() {
            return Err(ConnectorError::InvalidArgument {
                detail: "protocol data channel id must not be empty".into(),
            });
        }
        Ok(Self {
            bytes,
            local_port,
            remote_host: remote_host.into(),
            channel_id,
        })
    }

    /// 原始帧字节。
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// 本端监听端口。
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// 对端主机。
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// 目标通道 id。
    pub fn channel_id(&self) -> &Arc<str> {
        &self.channel_id
    }

    /// 按需派生数据报视图。
    pub fn datagram(&self) -> Result<Datagram, ConnectorError> {
        decode(&self.bytes)
    }
}
