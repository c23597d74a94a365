//! HTTP 代理会话状态机
//!
//! 一个会话对应一个客户端 Channel，按顺序处理流水线请求：解析请求头、
//! 选择下一跳、转发请求与消息体、转发响应，然后根据 keep-alive 规则继续
//! 或结束。CONNECT 成功后会话把两个 Channel 交给隧道中继。

use super::auth::ChainAuthenticator;
use super::body::{relay_body, BodyTap};
use super::message::{
    parse_request, parse_response, request_body_length, response_body_length, strip_hop_by_hop,
    wants_close, BodyLength, RequestHead, ResponseHead, MAX_HEAD_SIZE,
};
use crate::addr::TargetAddr;
use crate::channel::{ChannelReader, SharedChannel};
use crate::config::FilterScope;
use crate::error::{ProxyError, Result};
use crate::registry::ServiceContext;
use crate::relay::Tunnel;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 代理认证重试时可重放的最大请求体
pub const RETRY_BODY_LIMIT: usize = 64 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// 会话所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestHeader,
    Connecting,
    RequestBody,
    ResponseHeader,
    ResponseBody,
    Tunnel,
    Closed,
}

enum Outcome {
    KeepAlive,
    Close,
    Tunnel,
}

struct Upstream {
    reader: ChannelReader,
    dest: TargetAddr,
}

pub struct HttpProxySession {
    ctx: Arc<ServiceContext>,
    client: ChannelReader,
    upstream: Option<Upstream>,
    state: SessionState,
    response_started: bool,
}

/// 读取一个完整报文头；在任何字节到达前对端关闭时返回 `None`
async fn read_head<T>(
    reader: &mut ChannelReader,
    idle: Duration,
    parse: fn(&[u8]) -> Result<Option<(T, usize)>>,
) -> Result<Option<T>> {
    loop {
        if reader.buffered() > 0 {
            if let Some((head, len)) = parse(reader.buffer())? {
                reader.consume(len);
                return Ok(Some(head));
            }
            if reader.buffered() > MAX_HEAD_SIZE {
                return Err(ProxyError::protocol("header block too large"));
            }
        }
        let n = tokio::time::timeout(idle, reader.fill())
            .await
            .map_err(|_| ProxyError::timeout(idle))??;
        if n == 0 {
            if reader.buffer().iter().all(|b| matches!(b, b'\r' | b'\n')) {
                return Ok(None);
            }
            return Err(ProxyError::protocol("connection closed inside header block"));
        }
    }
}

/// 解析 Host 头部，缺省端口 80
fn host_target(host: &str) -> Result<TargetAddr> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ProxyError::protocol("empty Host header"));
    }
    let has_port = match host.rfind(':') {
        Some(i) => !host[i..].contains(']'),
        None => false,
    };
    if has_port {
        host.parse()
            .map_err(|_| ProxyError::protocol(format!("invalid Host header '{}'", host)))
    } else {
        Ok(TargetAddr::from_host_port(host, 80))
    }
}

/// 绝对 URI 中 authority 之后的部分（origin-form）
fn origin_form(target: &str) -> String {
    let rest = target
        .find("://")
        .map(|i| &target[i + 3..])
        .unwrap_or(target);
    match rest.find(['/', '?']) {
        Some(i) if rest[i..].starts_with('?') => format!("/{}", &rest[i..]),
        Some(i) => rest[i..].to_string(),
        None => "/".to_string(),
    }
}

impl HttpProxySession {
    pub fn new(ctx: Arc<ServiceContext>, client: SharedChannel) -> Self {
        Self {
            ctx,
            client: ChannelReader::new(client),
            upstream: None,
            state: SessionState::Idle,
            response_started: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 运行会话直到客户端离开、出错或进入隧道结束
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.client.channel().close();
        self.drop_upstream();
        self.state = SessionState::Closed;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            self.state = SessionState::Idle;
            self.response_started = false;

            let request = match self.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("client closed the connection");
                    return Ok(());
                }
                Err(e) if e.is_timeout() => {
                    debug!("client idle timeout");
                    return Ok(());
                }
                Err(e) => return self.fail(e).await,
            };

            match self.exchange(request).await {
                Ok(Outcome::KeepAlive) => continue,
                Ok(Outcome::Close) | Ok(Outcome::Tunnel) => return Ok(()),
                Err(e) => return self.fail(e).await,
            }
        }
    }

    async fn read_request(&mut self) -> Result<Option<RequestHead>> {
        let idle = self.ctx.idle_timeout();
        if self.client.buffered() > 0 {
            self.state = SessionState::RequestHeader;
        }
        read_head(&mut self.client, idle, parse_request).await
    }

    async fn exchange(&mut self, mut request: RequestHead) -> Result<Outcome> {
        self.state = SessionState::RequestHeader;
        let body = request_body_length(&mut request)?;
        let is_connect = request.is_connect();
        if is_connect && body != BodyLength::Empty {
            return Err(ProxyError::protocol("CONNECT request must not carry a body"));
        }

        let client_close = wants_close(request.version, &request.headers);
        let legacy_keep_alive = request.version == 0 && !client_close;
        let expects_continue = request.headers.has_token("expect", "100-continue");
        strip_hop_by_hop(&mut request.headers);
        self.ctx
            .filters()
            .apply(FilterScope::Request, &mut request.headers);

        let dest = self.route(&mut request)?;
        let owns_auth = self.apply_chain_auth(&mut request);
        debug!(method = %request.method, target = %request.target, next_hop = %dest, "request");

        self.ensure_upstream(&dest).await?;

        if is_connect && self.ctx.chain().is_none() {
            self.response_started = true;
            self.client.channel().write(CONNECT_ESTABLISHED).await?;
            self.start_tunnel().await?;
            return Ok(Outcome::Tunnel);
        }

        if expects_continue && body != BodyLength::Empty && request.version == 1 {
            request.headers.remove("expect");
            self.client.channel().write(CONTINUE).await?;
        }

        let mut tap = owns_auth.then(|| BodyTap::new(RETRY_BODY_LIMIT));
        self.send_request(&request, body, tap.as_mut()).await?;

        let mut retried = false;
        loop {
            self.state = SessionState::ResponseHeader;
            let mut response = self.read_response_head().await?;
            let response_body = response_body_length(&request.method, &mut response)?;
            let upstream_close =
                wants_close(response.version, &response.headers) || response_body == BodyLength::UntilClose;

            if response.status == 407 && owns_auth && !retried {
                if let Some(replay) = self.prepare_auth_retry(&mut request, &response, tap.as_ref()) {
                    retried = true;
                    info!("chained proxy requested authentication, retrying once");
                    self.discard_response_body(response_body).await?;
                    if upstream_close {
                        self.drop_upstream();
                        self.ensure_upstream(&dest).await?;
                    }
                    self.resend(&request, &replay).await?;
                    continue;
                }
            }

            if is_connect && (200..300).contains(&response.status) {
                strip_hop_by_hop(&mut response.headers);
                self.response_started = true;
                self.client.channel().write(&response.to_bytes()).await?;
                self.start_tunnel().await?;
                return Ok(Outcome::Tunnel);
            }

            let close = client_close || upstream_close;
            strip_hop_by_hop(&mut response.headers);
            self.ctx
                .filters()
                .apply(FilterScope::Response, &mut response.headers);
            if close {
                response.headers.insert("Connection", "close");
            } else if legacy_keep_alive {
                response.headers.insert("Connection", "keep-alive");
            }

            self.state = SessionState::ResponseBody;
            self.response_started = true;
            self.client.channel().write(&response.to_bytes()).await?;
            let relayed = self.relay_response_body(response_body).await?;
            self.ctx.stats().add_bytes_downstream(relayed);
            debug!(status = response.status, bytes = relayed, close, "response relayed");

            if upstream_close {
                self.drop_upstream();
            }
            return Ok(if close { Outcome::Close } else { Outcome::KeepAlive });
        }
    }

    /// 选择下一跳并按需改写请求目标
    ///
    /// 直连时绝对 URI 改写为 origin-form；经上级代理时总是连接上级代理，
    /// 请求目标保持（或补全为）绝对 URI。
    fn route(&self, request: &mut RequestHead) -> Result<TargetAddr> {
        let chain = self
            .ctx
            .chain()
            .map(|chain| TargetAddr::from_host_port(&chain.host, chain.port));

        if request.is_connect() {
            let target: TargetAddr = request.target.parse().map_err(|_| {
                ProxyError::protocol(format!("invalid CONNECT authority '{}'", request.target))
            })?;
            return Ok(chain.unwrap_or(target));
        }

        if request.target.starts_with('/') || request.target == "*" {
            let host = request
                .headers
                .get("host")
                .ok_or_else(|| ProxyError::protocol("origin-form request without Host header"))?
                .to_string();
            let target = host_target(&host)?;
            return Ok(match chain {
                Some(chain) => {
                    request.target = format!("http://{}{}", host.trim(), request.target);
                    chain
                }
                None => target,
            });
        }

        let url = url::Url::parse(&request.target).map_err(|e| {
            ProxyError::protocol(format!("invalid request target '{}': {}", request.target, e))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::protocol("request URI without host"))?
            .to_string();
        if !request.headers.contains("host") {
            let authority = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.clone(),
            };
            request.headers.insert("Host", authority);
        }

        if let Some(chain) = chain {
            return Ok(chain);
        }
        if url.scheme() != "http" {
            return Err(ProxyError::protocol(format!(
                "unsupported scheme '{}' for a direct request",
                url.scheme()
            )));
        }
        let port = url.port_or_known_default().unwrap_or(80);
        request.target = origin_form(&request.target);
        Ok(TargetAddr::from_host_port(&host, port))
    }

    /// 经上级代理且客户端未自带凭据时注入 Proxy-Authorization
    ///
    /// 返回会话是否对该凭据负责（决定 407 时能否重试）。直连时客户端的
    /// 代理凭据属于本跳，不再向下转发。
    fn apply_chain_auth(&self, request: &mut RequestHead) -> bool {
        if self.ctx.chain().is_none() {
            request.headers.remove("proxy-authorization");
            return false;
        }
        let Some(auth) = self.ctx.chain_auth() else {
            return false;
        };
        if request.headers.contains("proxy-authorization") {
            return false;
        }
        request.headers.insert(
            "Proxy-Authorization",
            auth.authorization(&request.method, &request.target),
        );
        true
    }

    /// 根据 407 更新凭据；可以重试时返回需要重放的请求体
    fn prepare_auth_retry(
        &self,
        request: &mut RequestHead,
        response: &ResponseHead,
        tap: Option<&BodyTap>,
    ) -> Option<Bytes> {
        let auth: &Arc<ChainAuthenticator> = self.ctx.chain_auth()?;
        let replay = match tap.and_then(BodyTap::replay) {
            Some(body) => Bytes::copy_from_slice(body),
            None => {
                warn!("request body too large to replay, surfacing 407");
                return None;
            }
        };
        if !auth.update(response.headers.get_all("proxy-authenticate")) {
            warn!("no usable proxy challenge in 407 response");
            return None;
        }
        request.headers.insert(
            "Proxy-Authorization",
            auth.authorization(&request.method, &request.target),
        );
        Some(replay)
    }

    /// 复用同一 host:port 的上游连接，否则关闭旧连接并新建
    async fn ensure_upstream(&mut self, dest: &TargetAddr) -> Result<()> {
        if let Some(upstream) = &self.upstream {
            if upstream.dest.same_endpoint(dest) && !upstream.reader.channel().is_closed() {
                debug!(next_hop = %dest, "reusing upstream connection");
                return Ok(());
            }
        }
        self.drop_upstream();

        self.state = SessionState::Connecting;
        let channel = self.ctx.connector().connect(dest).await?;
        self.upstream = Some(Upstream {
            reader: ChannelReader::new(channel),
            dest: dest.clone(),
        });
        Ok(())
    }

    fn drop_upstream(&mut self) {
        if let Some(upstream) = self.upstream.take() {
            upstream.reader.channel().close();
        }
    }

    fn upstream_mut(&mut self) -> Result<&mut Upstream> {
        self.upstream
            .as_mut()
            .ok_or_else(|| ProxyError::invalid_state("no upstream connection"))
    }

    async fn send_request(
        &mut self,
        request: &RequestHead,
        body: BodyLength,
        tap: Option<&mut BodyTap>,
    ) -> Result<()> {
        let idle = self.ctx.idle_timeout();
        let upstream = self
            .upstream
            .as_ref()
            .ok_or_else(|| ProxyError::invalid_state("no upstream connection"))?;
        let channel = upstream.reader.channel().clone();

        channel.write(&request.to_bytes()).await?;
        self.state = SessionState::RequestBody;
        let sent = relay_body(&mut self.client, Some(&*channel), body, idle, tap).await?;
        self.ctx.stats().add_bytes_upstream(sent);
        Ok(())
    }

    async fn resend(&mut self, request: &RequestHead, body: &[u8]) -> Result<()> {
        let mut out = request.to_bytes();
        out.extend_from_slice(body);
        let upstream = self.upstream_mut()?;
        upstream.reader.channel().write(&out).await?;
        Ok(())
    }

    /// 读取最终响应头，中间的 1xx 响应直接转发给客户端
    async fn read_response_head(&mut self) -> Result<ResponseHead> {
        let idle = self.ctx.idle_timeout();
        loop {
            let upstream = self
                .upstream
                .as_mut()
                .ok_or_else(|| ProxyError::invalid_state("no upstream connection"))?;
            let head = read_head(&mut upstream.reader, idle, parse_response)
                .await?
                .ok_or_else(|| ProxyError::protocol("upstream closed before sending a response"))?;
            if !head.is_interim() {
                return Ok(head);
            }
            let mut interim = head;
            strip_hop_by_hop(&mut interim.headers);
            self.client.channel().write(&interim.to_bytes()).await?;
        }
    }

    async fn relay_response_body(&mut self, length: BodyLength) -> Result<u64> {
        let idle = self.ctx.idle_timeout();
        let client = self.client.channel().clone();
        let upstream = self.upstream_mut()?;
        relay_body(&mut upstream.reader, Some(&*client), length, idle, None).await
    }

    async fn discard_response_body(&mut self, length: BodyLength) -> Result<u64> {
        let idle = self.ctx.idle_timeout();
        let upstream = self.upstream_mut()?;
        relay_body(&mut upstream.reader, None, length, idle, None).await
    }

    /// 交出两个 Channel 给隧道中继；先转发双方已缓冲的数据
    async fn start_tunnel(&mut self) -> Result<()> {
        let upstream = self
            .upstream
            .take()
            .ok_or_else(|| ProxyError::invalid_state("no upstream connection"))?;
        let Upstream { reader: mut upstream_reader, dest } = upstream;
        let client = self.client.channel().clone();
        let server = upstream_reader.channel().clone();

        let early = self.client.take_buffered();
        if !early.is_empty() {
            server.write(&early).await?;
        }
        let late = upstream_reader.take_buffered();
        if !late.is_empty() {
            client.write(&late).await?;
        }

        self.state = SessionState::Tunnel;
        info!(next_hop = %dest, "tunnel established");
        let stats = Tunnel::bind_with_stats(client, server, Some(self.ctx.stats().clone()))
            .wait()
            .await;
        debug!(up = stats.a_to_b, down = stats.b_to_a, "tunnel finished");
        Ok(())
    }

    /// 会话边界的错误恢复：响应尚未开始时回送错误响应
    async fn fail(&mut self, err: ProxyError) -> Result<()> {
        if let Some((status, reason)) = self.error_status(&err) {
            warn!(status, error = %err, "request failed");
            self.ctx.stats().record_error();
            let body = format!("{} {}\r\n", status, reason);
            let mut head = ResponseHead::new(status, reason);
            head.headers.insert("Content-Type", "text/plain");
            head.headers.insert("Content-Length", body.len().to_string());
            head.headers.insert("Connection", "close");
            let mut out = head.to_bytes();
            out.extend_from_slice(body.as_bytes());
            let _ = self.client.channel().write(&out).await;
        }
        Err(err)
    }

    fn error_status(&self, err: &ProxyError) -> Option<(u16, &'static str)> {
        use SessionState::*;
        if self.response_started {
            return None;
        }
        const BAD_REQUEST: (u16, &str) = (400, "Bad Request");
        const BAD_GATEWAY: (u16, &str) = (502, "Bad Gateway");
        const GATEWAY_TIMEOUT: (u16, &str) = (504, "Gateway Timeout");

        match (self.state, err) {
            (_, ProxyError::UpstreamUnreachable { .. }) => Some(BAD_GATEWAY),
            (Idle | RequestHeader | RequestBody, ProxyError::Protocol(_)) => Some(BAD_REQUEST),
            (ResponseHeader | ResponseBody, ProxyError::Protocol(_)) => Some(BAD_GATEWAY),
            (ResponseHeader, ProxyError::Timeout { .. }) => Some(GATEWAY_TIMEOUT),
            (Connecting, ProxyError::Timeout { .. }) => Some(GATEWAY_TIMEOUT),
            (Connecting | ResponseHeader, ProxyError::Io(_) | ProxyError::Tls(_)) => {
                Some(BAD_GATEWAY)
            }
            _ => None,
        }
    }
}
