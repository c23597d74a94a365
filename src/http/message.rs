//! HTTP/1.x 报文头模型与解析
//!
//! 解析由 httparse 完成；这里只保留会话需要的结构：有序、大小写不敏感的
//! 头部列表，请求/响应起始行，以及 RFC 7230 §3.3.3 的消息体长度规则。

use crate::error::{ProxyError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// 单个报文头块允许的最大头部数量
pub const MAX_HEADERS: usize = 128;

/// 报文头块的最大字节数
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// 有序的头部列表，名称比较不区分大小写
///
/// 值按收到的原始字节保存（可能含 obs-text），转发时逐字节写回；
/// 只有需要文本语义的地方才解码。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), &v[..]))
    }

    /// 第一个同名头部的原始值
    pub fn get_raw(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| &v[..])
    }

    /// 第一个同名头部的文本值；不是合法 UTF-8 时为 `None`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_raw(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_all_raw<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| &v[..])
    }

    /// 所有同名头部中可按 UTF-8 解读的值
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all_raw(name)
            .filter_map(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_raw(name).is_some()
    }

    pub(crate) fn first_mut(&mut self, name: &str) -> Option<&mut Bytes> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub(crate) fn values_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut Bytes> + 'a {
        self.entries
            .iter_mut()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// 替换所有同名头部为一个值；保留第一个出现的位置
    pub fn insert(&mut self, name: &str, value: impl AsRef<[u8]>) {
        let value = Bytes::copy_from_slice(value.as_ref());
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// 追加一个新的同名头部
    pub fn append(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.entries
            .push((name.to_string(), Bytes::copy_from_slice(value.as_ref())));
    }

    /// 删除所有同名头部，返回是否删除了任何头部
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// 所有同名头部中的逗号分隔 token（小写、去空白）
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all_raw(name)
            .flat_map(|v| v.split(|&b| b == b','))
            .map(|t| String::from_utf8_lossy(t.trim_ascii()).to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name).iter().any(|t| t == token)
    }

    fn write_to(&self, out: &mut BytesMut) {
        for (name, value) in &self.entries {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
    }

    fn from_parsed(parsed: &[httparse::Header<'_>]) -> Self {
        Self {
            entries: parsed
                .iter()
                .map(|h| (h.name.to_string(), Bytes::copy_from_slice(h.value.trim_ascii())))
                .collect(),
        }
    }
}

/// 请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// HTTP/1.x 的次版本号
    pub version: u8,
    pub headers: Headers,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256 + self.headers.len() * 32);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        self.headers.write_to(&mut out);
        out.put_slice(b"\r\n");
        out
    }
}

/// 响应头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: 1,
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    /// 1xx 中间响应（101 除外，它结束 HTTP 语义）
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(128 + self.headers.len() * 32);
        out.put_slice(format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        self.headers.write_to(&mut out);
        out.put_slice(b"\r\n");
        out
    }
}

/// 解析请求头；数据不完整时返回 `None`，否则返回请求头及其字节数
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = RequestHead {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers: Headers::from_parsed(req.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::protocol(format!("malformed request head: {}", e))),
    }
}

/// 解析响应头
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = ResponseHead {
                version: resp.version.unwrap_or(1),
                status: resp.code.unwrap_or_default(),
                reason: resp.reason.unwrap_or_default().to_string(),
                headers: Headers::from_parsed(resp.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::protocol(format!("malformed response head: {}", e))),
    }
}

/// 消息体的长度类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// 没有消息体
    Empty,
    /// 定长
    Fixed(u64),
    /// chunked 编码
    Chunked,
    /// 读到连接关闭为止（仅响应）
    UntilClose,
}

/// 传输编码的最后一个编码是否为 chunked
fn final_coding_is_chunked(headers: &Headers) -> Option<bool> {
    let codings = headers.tokens("transfer-encoding");
    if codings.is_empty() {
        return None;
    }
    Some(codings.last().map(|c| c == "chunked").unwrap_or(false))
}

/// 解析并规范化 Content-Length；多个不同的值视为协议错误
fn content_length(headers: &mut Headers) -> Result<Option<u64>> {
    let mut length = None;
    for raw in headers
        .get_all_raw("content-length")
        .flat_map(|v| v.split(|&b| b == b','))
    {
        let value = String::from_utf8_lossy(raw.trim_ascii());
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProxyError::protocol(format!("invalid content-length '{}'", value)));
        }
        let parsed: u64 = value
            .parse()
            .map_err(|_| ProxyError::protocol(format!("content-length out of range '{}'", value)))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ProxyError::protocol("conflicting content-length values"));
            }
            _ => length = Some(parsed),
        }
    }
    if let Some(len) = length {
        headers.insert("Content-Length", len.to_string());
    }
    Ok(length)
}

/// 请求消息体长度（RFC 7230 §3.3.3）
///
/// Transfer-Encoding 优先于 Content-Length，后者随之被删除；最后一个编码
/// 不是 chunked 的请求无法确定长度，属于协议错误。两者都没有即没有消息体。
pub fn request_body_length(head: &mut RequestHead) -> Result<BodyLength> {
    match final_coding_is_chunked(&head.headers) {
        Some(true) => {
            head.headers.remove("content-length");
            Ok(BodyLength::Chunked)
        }
        Some(false) => Err(ProxyError::protocol(
            "request transfer-encoding does not end with chunked",
        )),
        None => Ok(match content_length(&mut head.headers)? {
            Some(0) | None => BodyLength::Empty,
            Some(n) => BodyLength::Fixed(n),
        }),
    }
}

/// 响应消息体长度（RFC 7230 §3.3.3）
pub fn response_body_length(method: &str, head: &mut ResponseHead) -> Result<BodyLength> {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&head.status)
        || head.status == 204
        || head.status == 304
    {
        return Ok(BodyLength::Empty);
    }
    if method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&head.status) {
        return Ok(BodyLength::Empty);
    }
    match final_coding_is_chunked(&head.headers) {
        Some(true) => {
            head.headers.remove("content-length");
            Ok(BodyLength::Chunked)
        }
        Some(false) => {
            head.headers.remove("content-length");
            Ok(BodyLength::UntilClose)
        }
        None => Ok(match content_length(&mut head.headers)? {
            Some(0) => BodyLength::Empty,
            Some(n) => BodyLength::Fixed(n),
            None => BodyLength::UntilClose,
        }),
    }
}

/// 报文发送方是否要求在本次交换后关闭连接
pub fn wants_close(version: u8, headers: &Headers) -> bool {
    let mut tokens = headers.tokens("connection");
    tokens.extend(headers.tokens("proxy-connection"));
    if tokens.iter().any(|t| t == "close") {
        return true;
    }
    version == 0 && !tokens.iter().any(|t| t == "keep-alive")
}

/// 删除逐跳头部：Connection 中列出的头部以及 Connection、Keep-Alive、Proxy-Connection
pub fn strip_hop_by_hop(headers: &mut Headers) {
    for token in headers.tokens("connection") {
        if token != "close" && token != "keep-alive" {
            headers.remove(&token);
        }
    }
    headers.remove("connection");
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}
