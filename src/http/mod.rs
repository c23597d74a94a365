//! HTTP/1.x 正向代理
//!
//! 支持 origin-form 与 absolute-form 请求、流水线、chunked 消息体、
//! keep-alive、CONNECT 隧道以及经上级代理转发（含 407 认证重试）。

mod auth;
mod body;
mod filter;
mod message;
mod session;

pub use auth::{parse_challenges, ChainAuthenticator, Challenge, DigestAlgorithm, DigestChallenge};
pub use body::{parse_chunk_size, relay_body, BodyTap};
pub use filter::{HeaderFilter, HeaderFilters};
pub use message::{
    parse_request, parse_response, request_body_length, response_body_length, strip_hop_by_hop,
    wants_close, BodyLength, Headers, RequestHead, ResponseHead, MAX_HEADERS, MAX_HEAD_SIZE,
};
pub use session::{HttpProxySession, SessionState, RETRY_BODY_LIMIT};
